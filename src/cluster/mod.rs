//! The interface for the cluster view, which enumerates nodes.

use crate::node;

use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;

pub mod dns;
pub mod fixed;
pub mod shared;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Failed to resolve {name}")]
    Resolve {
        name: String,
        #[source]
        source: hickory_resolver::error::ResolveError,
    },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Enumerates the members of a cluster.
///
/// The view is responsible for knowing which nodes exist, but not for
/// tracking their health.
#[async_trait]
pub trait ClusterView: Send + Sync {
    /// Returns the most recently known set of nodes.
    fn list_nodes(&self) -> Vec<node::Address>;

    /// Updates the set of nodes from its source of truth.
    ///
    /// On failure, [ClusterView::list_nodes] must keep returning the last
    /// known snapshot.
    async fn refresh(&self) -> Result<(), Error> {
        Ok(())
    }
}

/// Helper type for anything that implements the ClusterView interface.
pub type SharedClusterView = Arc<dyn ClusterView>;
