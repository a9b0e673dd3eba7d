//! Implementation of [ClusterView] that always returns a fixed set of nodes.

use crate::cluster::ClusterView;
use crate::node;

use async_trait::async_trait;

/// A [ClusterView] that always returns a fixed set of addresses.
#[derive(Clone, Debug)]
pub struct FixedCluster {
    nodes: Vec<node::Address>,
}

impl FixedCluster {
    pub fn new<A: Into<node::Address>>(nodes: impl IntoIterator<Item = A>) -> Self {
        let mut nodes: Vec<_> = nodes.into_iter().map(Into::into).collect();
        nodes.sort();
        nodes.dedup();
        Self { nodes }
    }
}

#[async_trait]
impl ClusterView for FixedCluster {
    fn list_nodes(&self) -> Vec<node::Address> {
        self.nodes.clone()
    }
}
