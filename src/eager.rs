//! A pool which keeps a warm cache of connections for every node.
//!
//! Each node gets a dedicated replenishment task, which keeps the node's
//! cache between its idle floor and its target. A separate watcher task
//! follows the cluster view, adding nodes as they appear and retiring them
//! as they leave.

use crate::backoff::{CheckoutRetry, Spread};
use crate::claim;
use crate::context::{NodeContext, Replenisher};
use crate::health::NodeStats;
use crate::join::{self, Worker};
use crate::node::{self, Connection};
use crate::observer::{CounterSnapshot, Event};
use crate::pool::{ConnectionPool, Error, Parts};
#[cfg(feature = "probes")]
use crate::probes;
use crate::selection::Avoid;

use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{event, instrument, Level};

type Contexts<Conn> = Arc<BTreeMap<node::Address, Arc<NodeContext<Conn>>>>;

struct Inner<Conn: Connection> {
    parts: Parts<Conn>,

    // Replaced wholesale on topology changes, so checkouts read a snapshot
    // without holding a lock.
    nodes: watch::Sender<Contexts<Conn>>,

    // Also serializes topology changes against shutdown.
    workers: Mutex<Vec<Worker>>,
    stop_tx: watch::Sender<bool>,
    terminated: AtomicBool,
}

impl<Conn: Connection> Inner<Conn> {
    fn contexts(&self) -> Contexts<Conn> {
        self.nodes.borrow().clone()
    }

    // Creates contexts for new nodes, and retires or revives existing ones
    // so that exactly the listed nodes are eligible.
    #[instrument(level = "debug", skip_all, fields(pool = %self.parts.name), name = "EagerPool::sync_nodes")]
    fn sync_nodes(&self, listed: Vec<node::Address>) {
        let listed: BTreeSet<_> = listed.into_iter().collect();

        let mut workers = self.workers.lock().unwrap();
        if self.terminated.load(Ordering::SeqCst) {
            return;
        }

        let current = self.contexts();
        let mut next = (*current).clone();
        for address in &listed {
            if let Some(ctx) = current.get(address) {
                ctx.set_retired(false);
                continue;
            }

            event!(Level::INFO, node = %address, "Adding node");
            let ctx = Arc::new(NodeContext::new(
                self.parts.name.clone(),
                address.clone(),
                self.parts.policy.clone(),
                self.parts.metrics.clone(),
            ));
            let replenisher = Replenisher {
                connector: self.parts.connector.clone(),
                validator: self.parts.validator.clone(),
                suspension: self.parts.suspension.clone(),
            };
            let handle =
                tokio::task::spawn(ctx.clone().replenish(replenisher, self.stop_tx.subscribe()));
            workers.push(Worker::new(format!("replenisher:{address}"), handle));
            next.insert(address.clone(), ctx);
        }
        for (address, ctx) in current.iter() {
            if !listed.contains(address) {
                ctx.set_retired(true);
            }
        }

        if next.len() != current.len() {
            self.nodes.send_replace(Arc::new(next));
        }
    }

    /// Follows the cluster view until the pool stops.
    ///
    /// With static membership, stops after the first successful refresh.
    async fn watch_topology(self: Arc<Self>, mut stop: watch::Receiver<bool>) {
        let dynamic = self.parts.policy.dynamic_node_discovery;
        loop {
            match self.parts.cluster.refresh().await {
                Ok(()) => {
                    self.sync_nodes(self.parts.cluster.list_nodes());
                    if !dynamic {
                        event!(Level::DEBUG, pool = %self.parts.name, "Static membership discovered");
                        break;
                    }
                }
                Err(err) => {
                    event!(
                        Level::WARN,
                        pool = %self.parts.name,
                        err = ?err,
                        "Failed to refresh cluster view; keeping last known nodes"
                    );
                }
            }

            let interval = self
                .parts
                .policy
                .topology_refresh_interval
                .add_spread(self.parts.policy.spread);
            tokio::select! {
                _ = tokio::time::sleep(interval) => {},
                _ = stop.changed() => break,
            }
        }
    }

    fn stats(&self, contexts: &Contexts<Conn>) -> BTreeMap<node::Address, NodeStats> {
        let now = Instant::now();
        contexts
            .iter()
            .map(|(address, ctx)| (address.clone(), ctx.stats(now)))
            .collect()
    }

    // One pass over the cluster, without waiting.
    //
    // Tries every eligible node at most once, preferring nodes outside of
    // `avoid`, then makes a final attempt on the least loaded node.
    fn checkout_round(&self, avoid: &Avoid) -> Option<claim::Handle<Conn>> {
        let contexts = self.contexts();
        let addresses: Vec<_> = contexts.keys().cloned().collect();
        let selector = &self.parts.selector;

        let stats = self.stats(&contexts);
        let mut remaining = addresses.clone();
        while let Some(address) = selector.select(&remaining, &stats, avoid) {
            let before = remaining.len();
            remaining.retain(|candidate| candidate != &address);
            if remaining.len() == before {
                break;
            }
            let Some(ctx) = contexts.get(&address) else {
                continue;
            };
            if let Some(handle) = ctx.try_checkout() {
                return Some(handle);
            }
            event!(Level::TRACE, node = %address, "No idle connection");
        }

        let stats = self.stats(&contexts);
        let address = selector.select(&addresses, &stats, &Avoid::new())?;
        contexts.get(&address)?.try_checkout()
    }

    async fn do_checkout(&self, avoid: &Avoid) -> Result<claim::Handle<Conn>, Error> {
        let mut retry = CheckoutRetry::new(&self.parts.policy);
        loop {
            if self.terminated.load(Ordering::SeqCst) {
                return Err(Error::Terminated);
            }
            if let Some(handle) = self.checkout_round(avoid) {
                return Ok(handle);
            }
            self.parts.metrics.record(None, Event::CheckoutBackoff);
            if let Err(waited) = retry.backoff().await {
                return Err(Error::NoConnectionsAvailable { waited });
            }
        }
    }

    fn close_all(&self) {
        for ctx in self.contexts().values() {
            ctx.close();
        }
    }
}

/// A pool with a per-node cache and a replenishment task for every node.
pub struct EagerPool<Conn: Connection> {
    inner: Arc<Inner<Conn>>,
}

impl<Conn: Connection> EagerPool<Conn> {
    pub(crate) fn start(parts: Parts<Conn>) -> Self {
        let (nodes, _) = watch::channel(Arc::new(BTreeMap::new()));
        let (stop_tx, _) = watch::channel(false);
        let initial = parts.cluster.list_nodes();

        let inner = Arc::new(Inner {
            parts,
            nodes,
            workers: Mutex::new(vec![]),
            stop_tx,
            terminated: AtomicBool::new(false),
        });
        inner.sync_nodes(initial);

        let handle = tokio::task::spawn(inner.clone().watch_topology(inner.stop_tx.subscribe()));
        inner
            .workers
            .lock()
            .unwrap()
            .push(Worker::new("topology-watcher", handle));
        Self { inner }
    }
}

#[async_trait]
impl<Conn: Connection> ConnectionPool<Conn> for EagerPool<Conn> {
    #[instrument(level = "debug", skip_all, err, name = "EagerPool::checkout")]
    async fn checkout_avoiding(&self, avoid: &Avoid) -> Result<claim::Handle<Conn>, Error> {
        let inner = &self.inner;
        #[cfg(feature = "probes")]
        probes::checkout__start!(|| inner.parts.name.as_str());

        let result = inner.do_checkout(avoid).await;
        match &result {
            Ok(handle) => {
                #[cfg(feature = "probes")]
                probes::checkout__done!(|| (inner.parts.name.as_str(), handle.node().as_str()));
                inner.parts.metrics.node(handle.node(), Event::Checkout);
            }
            Err(_err) => {
                #[cfg(feature = "probes")]
                probes::checkout__failed!(|| (inner.parts.name.as_str(), _err.as_str()));
                inner.parts.metrics.record(None, Event::CheckoutFailed);
            }
        }
        result
    }

    fn node_stats(&self) -> BTreeMap<node::Address, NodeStats> {
        self.inner.stats(&self.inner.contexts())
    }

    fn counters(&self) -> CounterSnapshot {
        self.inner.parts.metrics.counters().snapshot()
    }

    fn resume_node(&self, node: &node::Address) -> bool {
        self.inner
            .contexts()
            .get(node)
            .is_some_and(|ctx| ctx.resume())
    }

    async fn shutdown(&self) {
        let inner = &self.inner;
        let workers = {
            let mut workers = inner.workers.lock().unwrap();
            if inner.terminated.swap(true, Ordering::SeqCst) {
                return;
            }
            std::mem::take(&mut *workers)
        };
        event!(Level::INFO, pool = %inner.parts.name, "Shutting down pool");

        inner.stop_tx.send_replace(true);
        join::join_all(workers, inner.parts.policy.shutdown_timeout).await;
        inner.close_all();
    }

    fn is_terminated(&self) -> bool {
        self.inner.terminated.load(Ordering::SeqCst)
    }
}

impl<Conn: Connection> Drop for EagerPool<Conn> {
    fn drop(&mut self) {
        let inner = &self.inner;
        inner.terminated.store(true, Ordering::SeqCst);
        inner.stop_tx.send_replace(true);
        join::abort_all(&inner.workers.lock().unwrap());
        inner.close_all();
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::cluster::shared::SharedCluster;
    use crate::observer::Metrics;
    use crate::policy::Policy;
    use crate::pool::Name;
    use crate::selection::LeastLoaded;
    use crate::suspension::NeverSuspend;
    use crate::test_utils::{setup_tracing_subscriber, wait_for, TestConnection, TestConnector};
    use crate::validator::LivenessValidator;
    use tokio::time::Duration;

    fn start(
        cluster: &SharedCluster,
        connector: &Arc<TestConnector>,
        policy: Policy,
    ) -> EagerPool<TestConnection> {
        EagerPool::start(Parts {
            name: Name::new("eager"),
            policy: Arc::new(policy),
            cluster: Arc::new(cluster.clone()),
            connector: connector.clone(),
            validator: Arc::new(LivenessValidator),
            selector: Arc::new(LeastLoaded),
            suspension: Arc::new(NeverSuspend),
            metrics: Arc::new(Metrics::default()),
        })
    }

    fn test_policy() -> Policy {
        Policy {
            min_idle_per_node: 2,
            target_per_node: 2,
            max_per_node: 4,
            refill_check_interval: Duration::from_millis(10),
            topology_refresh_interval: Duration::from_millis(10),
            min_checkout_retry_delay: Duration::from_millis(5),
            max_checkout_retry_delay: Duration::from_millis(20),
            spread: Duration::ZERO,
            ..Default::default()
        }
    }

    fn address(s: &str) -> node::Address {
        node::Address::from(s)
    }

    #[tokio::test]
    async fn caches_warm_up_without_checkouts() {
        setup_tracing_subscriber();
        let cluster = SharedCluster::new(["a", "b", "c"]);
        let connector = Arc::new(TestConnector::new());
        let pool = start(&cluster, &connector, test_policy());

        wait_for(Duration::from_secs(5), || {
            pool.node_stats().values().all(|stats| stats.idle == 2)
        })
        .await;
        assert_eq!(connector.opened(), 6);
        assert_eq!(pool.counters().connections_created, 6);
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn checkouts_spread_across_nodes() {
        let cluster = SharedCluster::new(["a", "b"]);
        let connector = Arc::new(TestConnector::new());
        let pool = start(&cluster, &connector, test_policy());
        wait_for(Duration::from_secs(5), || {
            pool.node_stats().values().all(|stats| stats.idle == 2)
        })
        .await;

        let first = pool.checkout().await.unwrap();
        let second = pool.checkout().await.unwrap();
        assert_ne!(first.node(), second.node());
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn departed_nodes_are_retired_then_revived() {
        let cluster = SharedCluster::new(["a", "b"]);
        let connector = Arc::new(TestConnector::new());
        let pool = start(&cluster, &connector, test_policy());
        wait_for(Duration::from_secs(5), || {
            pool.node_stats().values().all(|stats| stats.idle == 2)
        })
        .await;

        let held = pool
            .checkout_avoiding(&Avoid::from([address("b")]))
            .await
            .unwrap();
        assert_eq!(held.node(), &address("a"));

        cluster.set_nodes(["b"]);
        wait_for(Duration::from_secs(5), || pool.node_stats()[&address("a")].retired).await;
        let stats = &pool.node_stats()[&address("a")];
        assert_eq!(stats.idle, 0);
        assert_eq!(stats.in_use, 1);

        // A connection to a retired node is closed on release.
        let closed = connector.closed();
        drop(held);
        assert_eq!(connector.closed(), closed + 1);

        cluster.set_nodes(["a", "b"]);
        wait_for(Duration::from_secs(5), || {
            let stats = &pool.node_stats()[&address("a")];
            !stats.retired && stats.idle == 2
        })
        .await;
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn static_membership_ignores_view_changes() {
        let cluster = SharedCluster::new(["a"]);
        let connector = Arc::new(TestConnector::new());
        let pool = start(
            &cluster,
            &connector,
            Policy {
                dynamic_node_discovery: false,
                ..test_policy()
            },
        );

        // Membership is read from one refresh at startup.
        tokio::time::sleep(Duration::from_millis(20)).await;
        cluster.set_nodes(["a", "b"]);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(pool.node_stats().len(), 1);
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn waiting_checkout_is_served_after_release() {
        let cluster = SharedCluster::new(["a"]);
        let connector = Arc::new(TestConnector::new());
        let pool = Arc::new(start(
            &cluster,
            &connector,
            Policy {
                min_idle_per_node: 0,
                target_per_node: 1,
                max_per_node: 1,
                ..test_policy()
            },
        ));

        let held = pool.checkout().await.unwrap();
        let waiter = {
            let pool = pool.clone();
            tokio::task::spawn(async move { pool.checkout().await.map(|handle| handle.id) })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!waiter.is_finished());

        let id = held.id;
        drop(held);
        assert_eq!(waiter.await.unwrap().unwrap(), id);
        assert!(pool.counters().checkout_backoffs >= 1);
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn stalled_connects_do_not_block_shutdown() {
        let cluster = SharedCluster::new(["a", "b"]);
        let connector = Arc::new(TestConnector::new());
        connector.stall();
        let pool = start(&cluster, &connector, test_policy());
        wait_for(Duration::from_secs(5), || connector.attempts() >= 2).await;

        tokio::time::timeout(Duration::from_secs(5), pool.shutdown())
            .await
            .unwrap();
        assert!(pool.is_terminated());
        assert_eq!(connector.opened(), 0);
    }

    #[tokio::test]
    async fn purge_spares_newer_connections() {
        let cluster = SharedCluster::new(["a"]);
        let connector = Arc::new(TestConnector::new());
        let pool = start(
            &cluster,
            &connector,
            Policy {
                min_idle_per_node: 0,
                target_per_node: 3,
                max_per_node: 3,
                kill_node_connections_on_transport_error: true,
                ..test_policy()
            },
        );
        wait_for(Duration::from_secs(5), || pool.node_stats()[&address("a")].idle == 3).await;

        let mut bad = pool.checkout().await.unwrap();
        let old = pool.checkout().await.unwrap();
        let generation = bad.generation();
        bad.mark_corrupted();
        drop(bad);
        assert_eq!(pool.counters().purges, 1);

        // The replenisher refills the node in the next generation.
        wait_for(Duration::from_secs(5), || pool.node_stats()[&address("a")].idle == 2).await;
        let fresh = pool.checkout().await.unwrap();
        assert!(fresh.generation() > generation);

        // The old connection, checked out during the purge, is not cached.
        let closed = connector.closed();
        drop(old);
        assert_eq!(connector.closed(), closed + 1);
        drop(fresh);
        assert_eq!(pool.node_stats()[&address("a")].in_use, 0);
        pool.shutdown().await;
    }
}
