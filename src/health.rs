//! Per-node health bookkeeping shared by both pool flavors.

use crate::node;
use crate::suspension::{Suspension, SuspensionStrategy};
use crate::window_counter::WindowedCounter;

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Mutex;
use tokio::time::{Duration, Instant};
use tracing::{event, Level};

/// Describes the state of connections to one node.
///
/// Sampling is racy: counts may be stale by the time they are read.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct NodeStats {
    /// Connections currently checked out by callers.
    pub in_use: usize,
    /// Connections cached and ready for checkout.
    pub idle: usize,
    /// Connections being opened or validated.
    pub pending: usize,
    /// Connections released as corrupted, ever.
    pub corrupted: usize,
    /// Checkouts served by this node, ever.
    pub borrowed: u64,
    /// Connection failures within the failure window.
    pub recent_failures: usize,
    /// The generation new connections to this node are created in.
    pub generation: u64,
    pub suspended: bool,
    /// The node has left the cluster view.
    pub retired: bool,
}

impl NodeStats {
    /// Whether selection may choose this node.
    pub fn is_eligible(&self) -> bool {
        !self.suspended && !self.retired
    }
}

#[derive(Debug)]
pub(crate) struct NodeHealth {
    failures: WindowedCounter,
    corrupted: AtomicUsize,
    borrowed: AtomicU64,
    suspension: Mutex<Option<Suspension>>,
}

impl NodeHealth {
    pub(crate) fn new(failure_window: Duration) -> Self {
        Self {
            failures: WindowedCounter::new(failure_window),
            corrupted: AtomicUsize::new(0),
            borrowed: AtomicU64::new(0),
            suspension: Mutex::new(None),
        }
    }

    pub(crate) fn record_failure(&self) {
        self.failures.add(1);
    }

    pub(crate) fn record_corrupted(&self) {
        self.corrupted.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_borrowed(&self) {
        self.borrowed.fetch_add(1, Ordering::Relaxed);
    }

    /// Returns whether the node is suspended, clearing an expired suspension.
    pub(crate) fn is_suspended(&self, node: &node::Address, now: Instant) -> bool {
        let mut suspension = self.suspension.lock().unwrap();
        match *suspension {
            Some(s) if s.is_suspended(now) => true,
            Some(_) => {
                event!(Level::INFO, node = %node, "Node suspension lifted");
                *suspension = None;
                false
            }
            None => false,
        }
    }

    /// Lifts any suspension, expired or not. Returns true if the node was
    /// suspended.
    pub(crate) fn clear_suspension(&self, node: &node::Address, now: Instant) -> bool {
        let Some(suspension) = self.suspension.lock().unwrap().take() else {
            return false;
        };
        if !suspension.is_suspended(now) {
            return false;
        }
        event!(Level::INFO, node = %node, "Node suspension cleared");
        true
    }

    /// Asks `strategy` whether to suspend the node.
    ///
    /// Returns true if the node was newly suspended.
    pub(crate) fn evaluate(
        &self,
        node: &node::Address,
        strategy: &dyn SuspensionStrategy,
        stats: &NodeStats,
        now: Instant,
    ) -> bool {
        if self.is_suspended(node, now) {
            return false;
        }
        let Some(suspension) = strategy.evaluate(node, stats, now) else {
            return false;
        };
        if !suspension.is_suspended(now) {
            return false;
        }
        event!(
            Level::INFO,
            node = %node,
            suspension = ?suspension,
            recent_failures = stats.recent_failures,
            "Node suspended"
        );
        *self.suspension.lock().unwrap() = Some(suspension);
        true
    }

    /// Fills in the health-related fields of `stats`.
    pub(crate) fn fill(&self, node: &node::Address, stats: &mut NodeStats, now: Instant) {
        stats.corrupted = self.corrupted.load(Ordering::Relaxed);
        stats.borrowed = self.borrowed.load(Ordering::Relaxed);
        stats.recent_failures = self.failures.sum();
        stats.suspended = self.is_suspended(node, now);
    }
}
