//! Utilities to help with testing the pools

use crate::cluster::{self, shared::SharedCluster, ClusterView};
use crate::node::{self, Address, Connection, Connector};
use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::time::Duration;

/// An in-memory connection, which can be severed from the outside.
#[derive(Debug)]
pub struct TestConnection {
    pub id: usize,
    pub node: Address,
    open: Arc<AtomicBool>,
    closed: Arc<AtomicUsize>,
}

impl TestConnection {
    /// A connection which isn't tracked by any connector.
    pub fn standalone(id: usize, node: Address) -> Self {
        Self {
            id,
            node,
            open: Arc::new(AtomicBool::new(true)),
            closed: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Simulates the peer going away.
    pub fn sever(&self) {
        self.open.store(false, Ordering::SeqCst);
    }
}

impl Connection for TestConnection {
    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    fn close(&mut self) {
        if self.open.swap(false, Ordering::SeqCst) {
            self.closed.fetch_add(1, Ordering::SeqCst);
        }
    }
}

/// A test-only connector which can be told to fail, stall, or sever
/// connections it has made.
pub struct TestConnector {
    next_id: AtomicUsize,
    failing: AtomicBool,
    failing_nodes: Mutex<HashSet<Address>>,
    delay_ms: AtomicU64,
    attempts: AtomicUsize,
    opened: AtomicUsize,
    closed: Arc<AtomicUsize>,
    live: Mutex<Vec<(Address, Arc<AtomicBool>)>>,
}

impl Default for TestConnector {
    fn default() -> Self {
        Self::new()
    }
}

impl TestConnector {
    pub fn new() -> Self {
        Self {
            next_id: AtomicUsize::new(1),
            failing: AtomicBool::new(false),
            failing_nodes: Mutex::new(HashSet::new()),
            delay_ms: AtomicU64::new(0),
            attempts: AtomicUsize::new(0),
            opened: AtomicUsize::new(0),
            closed: Arc::new(AtomicUsize::new(0)),
            live: Mutex::new(vec![]),
        }
    }

    /// All future connection attempts fail.
    pub fn start_failing(&self) {
        self.failing.store(true, Ordering::SeqCst);
    }

    pub fn stop_failing(&self) {
        self.failing.store(false, Ordering::SeqCst);
    }

    /// Future connection attempts to `node` fail.
    pub fn fail_node(&self, node: &Address) {
        self.failing_nodes.lock().unwrap().insert(node.clone());
    }

    /// Marks every connection made to `node` as closed by the peer.
    pub fn sever_node(&self, node: &Address) {
        for (_, open) in self
            .live
            .lock()
            .unwrap()
            .iter()
            .filter(|(address, _)| address == node)
        {
            open.store(false, Ordering::SeqCst);
        }
    }

    /// Makes each connection attempt take an unrealistically long time.
    pub fn stall(&self) {
        self.delay_ms.store(9999999, Ordering::SeqCst);
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    pub fn opened(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }

    pub fn closed(&self) -> usize {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Connector for TestConnector {
    type Connection = TestConnection;

    async fn connect(&self, node: &Address) -> Result<Self::Connection, node::Error> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let delay_ms = self.delay_ms.load(Ordering::SeqCst);
        if delay_ms > 0 {
            tokio::time::sleep(Duration::from_millis(delay_ms)).await;
        }

        if self.failing.load(Ordering::SeqCst) || self.failing_nodes.lock().unwrap().contains(node)
        {
            return Err(node::Error::Other(anyhow::anyhow!("Failed")));
        }

        let open = Arc::new(AtomicBool::new(true));
        self.live
            .lock()
            .unwrap()
            .push((node.clone(), open.clone()));
        self.opened.fetch_add(1, Ordering::SeqCst);
        Ok(TestConnection {
            id: self.next_id.fetch_add(1, Ordering::SeqCst),
            node: node.clone(),
            open,
            closed: self.closed.clone(),
        })
    }
}

/// A cluster view which lists nothing until refreshed, like a DNS view.
///
/// Each successful refresh copies the membership of `source`.
#[derive(Debug, Default)]
pub struct RefreshedCluster {
    pub source: SharedCluster,
    known: Mutex<Vec<Address>>,
    refreshes: AtomicUsize,
}

impl RefreshedCluster {
    pub fn new(source: SharedCluster) -> Self {
        Self {
            source,
            ..Default::default()
        }
    }

    pub fn refreshes(&self) -> usize {
        self.refreshes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ClusterView for RefreshedCluster {
    fn list_nodes(&self) -> Vec<Address> {
        self.known.lock().unwrap().clone()
    }

    async fn refresh(&self) -> Result<(), cluster::Error> {
        self.refreshes.fetch_add(1, Ordering::SeqCst);
        self.source.refresh().await?;
        *self.known.lock().unwrap() = self.source.list_nodes();
        Ok(())
    }
}

pub fn setup_tracing_subscriber() {
    use tracing_subscriber::fmt::format::FmtSpan;
    let _ = tracing_subscriber::fmt()
        .with_thread_names(true)
        .with_span_events(FmtSpan::ENTER)
        .with_max_level(tracing::Level::TRACE)
        .with_test_writer()
        .try_init();
}

/// Polls `f` until it returns true, panicking after `timeout`.
pub async fn wait_for(timeout: Duration, mut f: impl FnMut() -> bool) {
    tokio::time::timeout(timeout, async move {
        while !f() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}
