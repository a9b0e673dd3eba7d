//! Strategies for choosing which node serves a checkout.

use crate::health::NodeStats;
use crate::node;
use crate::priority_list::{PriorityList, WeightedValue};

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

/// Nodes a caller would prefer not to be given, such as a node which just
/// failed them. Avoidance is a hint, not an exclusion.
pub type Avoid = BTreeSet<node::Address>;

/// Picks the best node for the next checkout.
pub trait NodeSelector: Send + Sync {
    /// Returns the best node among `nodes`, or `None` if none is eligible.
    ///
    /// A node without an entry in `stats`, or whose stats are not
    /// [NodeStats::is_eligible], must not be returned.
    fn select(
        &self,
        nodes: &[node::Address],
        stats: &BTreeMap<node::Address, NodeStats>,
        avoid: &Avoid,
    ) -> Option<node::Address>;
}

pub type SharedNodeSelector = Arc<dyn NodeSelector>;

/// Prefers the node with the fewest connections in use.
///
/// Ties are broken by fewer corrupted connections, then fewer total
/// checkouts, then by address. Nodes in the avoid set are skipped unless
/// every eligible node is avoided, in which case the best one is returned
/// anyway.
#[derive(Clone, Copy, Debug, Default)]
pub struct LeastLoaded;

impl NodeSelector for LeastLoaded {
    fn select(
        &self,
        nodes: &[node::Address],
        stats: &BTreeMap<node::Address, NodeStats>,
        avoid: &Avoid,
    ) -> Option<node::Address> {
        let mut ranked = PriorityList::new();
        for address in nodes {
            let Some(stats) = stats.get(address) else {
                continue;
            };
            if !stats.is_eligible() {
                continue;
            }
            ranked.push(WeightedValue {
                score: (stats.in_use, stats.corrupted, stats.borrowed),
                value: address,
            });
        }

        let mut best_avoided = None;
        while let Some(candidate) = ranked.pop() {
            if !avoid.contains(candidate.value) {
                return Some(candidate.value.clone());
            }
            best_avoided.get_or_insert(candidate.value);
        }
        best_avoided.cloned()
    }
}
