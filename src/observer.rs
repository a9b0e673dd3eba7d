//! Counters describing pool activity, and a hook to forward them elsewhere.

use crate::node;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Something notable which happened inside a pool.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Event {
    /// A connection was handed to a caller.
    Checkout,
    /// A checkout round found nothing and slept before retrying.
    CheckoutBackoff,
    /// A checkout gave up.
    CheckoutFailed,
    ConnectionCreated,
    ConnectionCreateFailed,
    ConnectionDestroyed,
    /// A caller released a connection it marked as corrupted.
    ConnectionCorrupted,
    ReturnedToCache,
    /// An idle connection failed validation and was discarded.
    ValidationFailed,
    NodeSuspended,
    /// Idle connections to a node were purged after a corruption.
    Purge,
}

const EVENT_COUNT: usize = 11;

impl Event {
    fn index(self) -> usize {
        self as usize
    }
}

/// Receives pool events, for export to a metrics system.
///
/// Implementations must be cheap: events are recorded inline on the
/// checkout and release paths.
pub trait Observer: Send + Sync {
    fn record(&self, node: Option<&node::Address>, event: Event);
}

pub type SharedObserver = Arc<dyn Observer>;

/// Monotonic counters for every [Event].
#[derive(Debug, Default)]
pub struct Counters {
    counts: [AtomicU64; EVENT_COUNT],
}

impl Counters {
    pub fn get(&self, event: Event) -> u64 {
        self.counts[event.index()].load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> CounterSnapshot {
        CounterSnapshot {
            checkouts: self.get(Event::Checkout),
            checkout_backoffs: self.get(Event::CheckoutBackoff),
            checkout_failures: self.get(Event::CheckoutFailed),
            connections_created: self.get(Event::ConnectionCreated),
            connection_create_failures: self.get(Event::ConnectionCreateFailed),
            connections_destroyed: self.get(Event::ConnectionDestroyed),
            connections_corrupted: self.get(Event::ConnectionCorrupted),
            returned_to_cache: self.get(Event::ReturnedToCache),
            validation_failures: self.get(Event::ValidationFailed),
            node_suspensions: self.get(Event::NodeSuspended),
            purges: self.get(Event::Purge),
        }
    }
}

impl Observer for Counters {
    fn record(&self, _node: Option<&node::Address>, event: Event) {
        self.counts[event.index()].fetch_add(1, Ordering::Relaxed);
    }
}

/// A point-in-time copy of [Counters].
#[derive(Clone, Debug, Default, Eq, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct CounterSnapshot {
    pub checkouts: u64,
    pub checkout_backoffs: u64,
    pub checkout_failures: u64,
    pub connections_created: u64,
    pub connection_create_failures: u64,
    pub connections_destroyed: u64,
    pub connections_corrupted: u64,
    pub returned_to_cache: u64,
    pub validation_failures: u64,
    pub node_suspensions: u64,
    pub purges: u64,
}

/// The pool's own counters, plus an optional external observer.
#[derive(Default)]
pub(crate) struct Metrics {
    counters: Counters,
    sink: Option<SharedObserver>,
}

impl Metrics {
    pub(crate) fn new(sink: Option<SharedObserver>) -> Self {
        Self {
            counters: Counters::default(),
            sink,
        }
    }

    pub(crate) fn record(&self, node: Option<&node::Address>, event: Event) {
        self.counters.record(node, event);
        if let Some(sink) = &self.sink {
            sink.record(node, event);
        }
    }

    pub(crate) fn node(&self, node: &node::Address, event: Event) {
        self.record(Some(node), event);
    }

    pub(crate) fn counters(&self) -> &Counters {
        &self.counters
    }
}

impl std::fmt::Debug for Metrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Metrics")
            .field("counters", &self.counters)
            .field("sink", &self.sink.is_some())
            .finish()
    }
}
