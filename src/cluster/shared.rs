//! Implementation of [ClusterView] whose membership is set at runtime.

use crate::cluster::{self, ClusterView};
use crate::node;

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

#[derive(Debug, Default)]
struct Inner {
    nodes: Mutex<Vec<node::Address>>,
    failing: AtomicBool,
}

/// A [ClusterView] fed by the application.
///
/// Clones share the same membership, so one clone may be handed to a pool
/// while another is updated from an external discovery mechanism.
#[derive(Clone, Debug, Default)]
pub struct SharedCluster {
    inner: Arc<Inner>,
}

impl SharedCluster {
    pub fn new<A: Into<node::Address>>(nodes: impl IntoIterator<Item = A>) -> Self {
        let cluster = Self::default();
        cluster.set_nodes(nodes);
        cluster
    }

    /// Replaces the membership.
    pub fn set_nodes<A: Into<node::Address>>(&self, nodes: impl IntoIterator<Item = A>) {
        let mut nodes: Vec<_> = nodes.into_iter().map(Into::into).collect();
        nodes.sort();
        nodes.dedup();
        *self.inner.nodes.lock().unwrap() = nodes;
    }

    /// Makes subsequent refreshes fail, as if the source of truth were
    /// unreachable. The membership is left as it is.
    pub fn set_failing(&self, failing: bool) {
        self.inner.failing.store(failing, Ordering::SeqCst);
    }
}

#[async_trait]
impl ClusterView for SharedCluster {
    fn list_nodes(&self) -> Vec<node::Address> {
        self.inner.nodes.lock().unwrap().clone()
    }

    async fn refresh(&self) -> Result<(), cluster::Error> {
        if self.inner.failing.load(Ordering::SeqCst) {
            return Err(anyhow::anyhow!("membership source unavailable").into());
        }
        Ok(())
    }
}
