//! The interface for identifying and connecting to cluster nodes.

use async_trait::async_trait;
use std::net::SocketAddr;
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("I/O Error")]
    Io(#[from] std::io::Error),

    #[error("Operation timed out")]
    Timeout,

    #[error(transparent)]
    Other(anyhow::Error),
}

/// Identifies one member of the cluster.
///
/// Addresses are opaque to the pool; connectors decide how to interpret
/// them (for example, as `host:port`).
#[derive(Clone, PartialEq, Eq, Ord, PartialOrd, Debug, Hash)]
pub struct Address(pub Arc<str>);

impl Address {
    pub fn new(address: impl ToString) -> Self {
        Self(address.to_string().into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for Address {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

#[cfg(feature = "serde")]
impl serde::Serialize for Address {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        self.0.serialize(serializer)
    }
}

impl From<String> for Address {
    fn from(s: String) -> Self {
        Self(s.into())
    }
}

impl From<&'_ str> for Address {
    fn from(s: &'_ str) -> Self {
        Self(s.into())
    }
}

impl From<SocketAddr> for Address {
    fn from(address: SocketAddr) -> Self {
        Self::new(address)
    }
}

impl std::borrow::Borrow<str> for Address {
    fn borrow(&self) -> &str {
        &self.0
    }
}

/// Interface for raw connections.
pub trait Connection: Send + 'static {
    /// A cheap, local liveness check.
    ///
    /// This should not perform I/O; deeper checks belong in a
    /// [crate::validator::Validator].
    fn is_open(&self) -> bool;

    /// Closes the connection.
    ///
    /// The pool calls this exactly once before dropping a connection it
    /// is discarding. By default this does nothing, relying on `Drop`.
    fn close(&mut self) {}
}

/// Describes how a connection to a node should be constructed.
#[async_trait]
pub trait Connector: Send + Sync {
    type Connection: Connection;

    /// Creates a connection to a node.
    ///
    /// Failures are expected: the pool retries with backoff.
    async fn connect(&self, node: &Address) -> Result<Self::Connection, Error>;
}

pub type SharedConnector<Conn> = Arc<dyn Connector<Connection = Conn>>;

#[cfg(test)]
mod test {
    use super::*;
    use std::collections::BTreeSet;
    use std::net::{IpAddr, Ipv4Addr};

    #[test]
    fn addresses_compare_by_text() {
        let socket = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 9042);
        assert_eq!(Address::from(socket), Address::from("127.0.0.1:9042"));
        assert_eq!(Address::new("a").to_string(), "a");

        let set: BTreeSet<Address> = ["c", "a", "b", "a"].into_iter().map(Address::from).collect();
        let ordered: Vec<&str> = set.iter().map(Address::as_str).collect();
        assert_eq!(ordered, ["a", "b", "c"]);
    }
}
