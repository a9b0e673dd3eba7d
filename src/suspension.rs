//! Strategies which temporarily remove a node from selection.
//!
//! Suspension is a circuit breaker on *selection*: a suspended node is not
//! offered to new checkouts, but connections already checked out from it
//! are unaffected.

use crate::health::NodeStats;
use crate::node;
use crate::policy::Policy;

use std::sync::Arc;
use tokio::time::{Duration, Instant};

/// A node's suspension, once imposed.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Suspension {
    /// Suspended until the given instant, then automatically cleared.
    Until(Instant),
    /// Suspended until cleared with
    /// [ConnectionPool::resume_node](crate::pool::ConnectionPool::resume_node).
    Indefinite,
}

impl Suspension {
    pub fn is_suspended(&self, now: Instant) -> bool {
        match self {
            Suspension::Until(deadline) => now < *deadline,
            Suspension::Indefinite => true,
        }
    }
}

/// Decides whether a node should be suspended.
///
/// Evaluated periodically for each node which is not currently suspended.
pub trait SuspensionStrategy: Send + Sync {
    fn evaluate(&self, node: &node::Address, stats: &NodeStats, now: Instant)
        -> Option<Suspension>;
}

pub type SharedSuspensionStrategy = Arc<dyn SuspensionStrategy>;

/// Never suspends anything.
#[derive(Clone, Copy, Debug, Default)]
pub struct NeverSuspend;

impl SuspensionStrategy for NeverSuspend {
    fn evaluate(&self, _: &node::Address, _: &NodeStats, _: Instant) -> Option<Suspension> {
        None
    }
}

/// Suspends a node for a fixed duration once it has accumulated too many
/// recent failures.
#[derive(Clone, Copy, Debug)]
pub struct TimeBoxed {
    pub duration: Duration,
    pub failure_threshold: usize,
}

impl TimeBoxed {
    pub fn from_policy(policy: &Policy) -> Self {
        Self {
            duration: policy.node_suspension_duration,
            failure_threshold: policy.suspension_failure_threshold,
        }
    }
}

impl SuspensionStrategy for TimeBoxed {
    fn evaluate(
        &self,
        _: &node::Address,
        stats: &NodeStats,
        now: Instant,
    ) -> Option<Suspension> {
        if self.failure_threshold == 0 || stats.recent_failures < self.failure_threshold {
            return None;
        }
        Some(Suspension::Until(now + self.duration))
    }
}
