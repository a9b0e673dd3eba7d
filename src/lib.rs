//! clusterpool is a client-side connection pool for clustered data stores.
//!
//! It keeps a warm, bounded supply of connections to every node of a
//! cluster, routes each checkout to a healthy, lightly-loaded node, and
//! replaces broken connections in the background.
//!
//! It uses the following terminology:
//! * A node is one member of the cluster, addressed independently.
//! * A handle is one live connection to one node, owned by exactly one
//!   caller between checkout and release.
//! * A generation is a per-node counter, advanced when the pool purges a
//!   node's idle connections after a caller reports a corrupted one.
//! * A suspended node is temporarily skipped by selection.
//!
//! # Usage
//!
//! * The main interface for this crate is [pool::Pool].
//! * To construct a pool, you must supply a [cluster::ClusterView] and
//!   a [node::Connector]. These are interfaces which specify "how to find
//!   nodes" and "how to create connections to a node", respectively.
//! * Two flavors are available, chosen by [pool::Flavor]:
//!   - `Eager` keeps a per-node cache filled by a dedicated replenishment
//!     task for each node.
//!   - `Lazy` creates connections on demand through a generic
//!     [keyed::KeyedPool], maintained by a single periodic task.
//!
//! # DTrace probes
//!
//! With the `"probes"` feature (enabled by default) the pool fires USDT
//! probes which are zero-cost unless traced:
//!
//! - `checkout-start`: Fires when a caller asks for a connection.
//! - `checkout-done`: Fires before handing a connection to the caller.
//! - `checkout-failed`: Fires when a checkout gives up.
//! - `connect-start`: Fires before attempting a connection to a node.
//! - `connect-done`: Fires after successfully connecting to a node.
//! - `connect-failed`: Fires after failing to connect to a node.
//! - `purge`: Fires when a node's idle connections are purged after a
//!   corrupted connection was released.
//!
//! Registering the probes is fallible; as with `std::sync::PoisonError`,
//! [pool::Builder::build] returns the pool in both the `Ok` and the `Err`
//! variant.

// Public API
pub mod claim;
pub mod cluster;
pub mod connectors;
pub mod health;
pub mod keyed;
pub mod node;
pub mod observer;
pub mod policy;
pub mod pool;
pub mod selection;
pub mod signal;
pub mod suspension;
pub mod validator;

// Pool flavors
pub mod eager;
pub mod lazy;

// Necessary for implementation
pub mod backoff;
mod context;
mod join;
mod priority_list;
#[cfg(test)]
mod test_utils;
mod window_counter;

/// USDT probes for tracing how the pool opens and hands out connections.
#[cfg(feature = "probes")]
#[usdt::provider(provider = "clusterpool")]
mod probes {
    /// Fires right before a caller's checkout begins.
    fn checkout__start(pool: &str) {}

    /// Fires when a checkout succeeds, with the chosen node.
    fn checkout__done(pool: &str, node: &str) {}

    /// Fires when a checkout fails, with a string identifying the reason.
    fn checkout__failed(pool: &str, reason: &str) {}

    /// Fires right before attempting to make a connection.
    fn connect__start(pool: &str, node: &str) {}

    /// Fires just after successfully making a connection.
    fn connect__done(pool: &str, node: &str) {}

    /// Fires just after failing to make a connection, with a string
    /// identifying the reason.
    fn connect__failed(pool: &str, node: &str, reason: &str) {}

    /// Fires when idle connections of a node are purged, with the
    /// generation purged through.
    fn purge(pool: &str, node: &str, generation: u64) {}
}
