//! Connections which are borrowed from the connection pool.

use crate::node::{self, Connection};

use std::sync::Arc;
use tokio::time::Instant;

/// A connection, along with the bookkeeping the pool needs to take it back.
#[derive(Debug)]
pub(crate) struct Pooled<Conn> {
    pub(crate) conn: Conn,
    /// The owning node's generation when this connection was created.
    pub(crate) generation: u64,
    pub(crate) created: Instant,
}

/// Takes connections back from [Handle]s.
pub(crate) trait Recycle<Conn: Connection>: Send + Sync {
    fn recycle(&self, node: &node::Address, conn: Pooled<Conn>, corrupted: bool);
}

/// A [Connection] which is returned to the pool when dropped.
///
/// Note that this method implements [std::ops::Deref] for the
/// generic `Conn` type, and generally, clients should transparently
/// use a handle as a connection.
///
/// If the caller observes a transport error while using the connection, it
/// should call [Handle::mark_corrupted] before dropping the handle: the
/// connection is then closed instead of being reused.
pub struct Handle<Conn: Connection> {
    inner: Option<Pooled<Conn>>,
    node: node::Address,
    corrupted: bool,
    owner: Arc<dyn Recycle<Conn>>,
}

impl<Conn: Connection> Handle<Conn> {
    pub(crate) fn new(
        conn: Pooled<Conn>,
        node: node::Address,
        owner: Arc<dyn Recycle<Conn>>,
    ) -> Self {
        Self {
            inner: Some(conn),
            node,
            corrupted: false,
            owner,
        }
    }

    /// The node this connection is connected to.
    pub fn node(&self) -> &node::Address {
        &self.node
    }

    /// The generation of the owning node when this connection was created.
    pub fn generation(&self) -> u64 {
        self.inner.as_ref().map(|inner| inner.generation).unwrap()
    }

    /// Marks the connection as unsafe for reuse.
    ///
    /// Once marked, the connection is closed when the handle is released.
    pub fn mark_corrupted(&mut self) {
        self.corrupted = true;
    }

    pub fn is_corrupted(&self) -> bool {
        self.corrupted
    }

    /// Returns the connection to the pool.
    ///
    /// Equivalent to dropping the handle.
    pub fn release(self) {
        drop(self)
    }
}

impl<Conn: Connection> std::fmt::Debug for Handle<Conn> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Handle")
            .field("node", &self.node)
            .field("corrupted", &self.corrupted)
            .finish_non_exhaustive()
    }
}

impl<Conn: Connection> std::ops::Deref for Handle<Conn> {
    type Target = Conn;
    fn deref(&self) -> &Self::Target {
        self.inner.as_ref().map(|inner| &inner.conn).unwrap()
    }
}

impl<Conn: Connection> std::ops::DerefMut for Handle<Conn> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.inner.as_mut().map(|inner| &mut inner.conn).unwrap()
    }
}

impl<Conn: Connection> Drop for Handle<Conn> {
    fn drop(&mut self) {
        let conn = self.inner.take().unwrap();
        self.owner.recycle(&self.node, conn, self.corrupted);
    }
}
