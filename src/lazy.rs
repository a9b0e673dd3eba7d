//! A pool which creates connections on demand.
//!
//! Connections live in a [KeyedPool] keyed by node address. Checkouts
//! borrow from the chosen node, waiting briefly for a connection before
//! moving on to the next candidate. A single maintenance task periodically
//! follows the cluster view, re-evaluates suspensions, evicts stale idle
//! connections and tops up every node's idle floor.

use crate::backoff::{CheckoutRetry, Spread};
use crate::claim;
use crate::health::{NodeHealth, NodeStats};
use crate::join::{self, Worker};
use crate::keyed::{self, KeyedPool};
use crate::node::{self, Connection, SharedConnector};
use crate::observer::{CounterSnapshot, Event, Metrics};
use crate::policy::Policy;
use crate::pool::{ConnectionPool, Error, Name, Parts};
#[cfg(feature = "probes")]
use crate::probes;
use crate::selection::Avoid;
use crate::validator::SharedValidator;

use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{event, instrument, Level};

/// Opens, validates and closes connections on behalf of the [KeyedPool].
struct ConnectionManager<Conn: Connection> {
    name: Name,
    policy: Arc<Policy>,
    connector: SharedConnector<Conn>,
    validator: SharedValidator<Conn>,
    metrics: Arc<Metrics>,
}

#[async_trait]
impl<Conn: Connection> keyed::Manager for ConnectionManager<Conn> {
    type Key = node::Address;
    type Object = Conn;

    async fn create(&self, node: &node::Address) -> Result<Conn, node::Error> {
        #[cfg(feature = "probes")]
        probes::connect__start!(|| (self.name.as_str(), node.as_str()));

        let result =
            match tokio::time::timeout(self.policy.connect_timeout, self.connector.connect(node))
                .await
            {
                Ok(result) => result,
                Err(_) => Err(node::Error::Timeout),
            };
        match &result {
            Ok(_) => {
                #[cfg(feature = "probes")]
                probes::connect__done!(|| (self.name.as_str(), node.as_str()));
                self.metrics.node(node, Event::ConnectionCreated);
            }
            Err(_err) => {
                #[cfg(feature = "probes")]
                probes::connect__failed!(|| (
                    self.name.as_str(),
                    node.as_str(),
                    match _err {
                        node::Error::Timeout => "timeout",
                        _ => "error",
                    }
                ));
                self.metrics.node(node, Event::ConnectionCreateFailed);
            }
        }
        result
    }

    async fn validate(&self, node: &node::Address, conn: &mut Conn) -> bool {
        let result =
            tokio::time::timeout(self.policy.validation_timeout, self.validator.validate(conn))
                .await;
        if matches!(result, Ok(Ok(()))) {
            return true;
        }
        event!(Level::DEBUG, node = %node, "Idle connection failed validation");
        self.metrics.node(node, Event::ValidationFailed);
        false
    }

    fn destroy(&self, node: &node::Address, mut conn: Conn) {
        conn.close();
        self.metrics.node(node, Event::ConnectionDestroyed);
    }
}

type Connections<Conn> = KeyedPool<ConnectionManager<Conn>>;

/// One node of the lazy pool. Takes back the node's handles.
struct LazyNode<Conn: Connection> {
    address: node::Address,
    entry: Arc<keyed::Entry<Conn>>,
    connections: Arc<Connections<Conn>>,
    health: NodeHealth,
}

impl<Conn: Connection> LazyNode<Conn> {
    fn stats(&self, now: Instant) -> NodeStats {
        let key = self
            .connections
            .stats(&self.address)
            .unwrap_or_default();
        let mut stats = NodeStats {
            in_use: key.borrowed,
            idle: key.idle,
            pending: key.pending,
            generation: key.generation,
            ..Default::default()
        };
        self.health.fill(&self.address, &mut stats, now);
        stats
    }
}

impl<Conn: Connection> claim::Recycle<Conn> for LazyNode<Conn> {
    fn recycle(&self, _node: &node::Address, conn: claim::Pooled<Conn>, corrupted: bool) {
        let claim::Pooled {
            conn,
            generation,
            created,
        } = conn;
        let pooled = keyed::Pooled {
            key: self.address.clone(),
            object: conn,
            generation,
            created,
            entry: self.entry.clone(),
        };
        let manager = self.connections.manager();

        if corrupted {
            event!(
                Level::DEBUG,
                node = %self.address,
                generation,
                "Connection released as corrupted"
            );
            manager.metrics.node(&self.address, Event::ConnectionCorrupted);
            self.health.record_corrupted();
            self.connections.invalidate(pooled);

            if manager.policy.kill_node_connections_on_transport_error {
                if let Some(evicted) = self
                    .connections
                    .purge_entry(&self.address, &self.entry, generation)
                {
                    event!(
                        Level::INFO,
                        node = %self.address,
                        generation,
                        evicted,
                        "Purged idle connections after corruption"
                    );
                    #[cfg(feature = "probes")]
                    probes::purge!(|| (manager.name.as_str(), self.address.as_str(), generation));
                    manager.metrics.node(&self.address, Event::Purge);
                }
            }
            return;
        }

        if !pooled.object.is_open() {
            event!(Level::DEBUG, node = %self.address, "Released connection is closed");
            self.connections.invalidate(pooled);
            return;
        }

        if self.connections.give_back(pooled) {
            manager.metrics.node(&self.address, Event::ReturnedToCache);
        }
    }
}

type Nodes<Conn> = Arc<BTreeMap<node::Address, Arc<LazyNode<Conn>>>>;

struct Inner<Conn: Connection> {
    parts: Parts<Conn>,
    connections: Arc<Connections<Conn>>,
    nodes: watch::Sender<Nodes<Conn>>,

    // Also serializes membership changes against shutdown.
    workers: Mutex<Vec<Worker>>,
    stop_tx: watch::Sender<bool>,
    terminated: AtomicBool,
}

impl<Conn: Connection> Inner<Conn> {
    fn nodes(&self) -> Nodes<Conn> {
        self.nodes.borrow().clone()
    }

    fn stats(&self, nodes: &Nodes<Conn>) -> BTreeMap<node::Address, NodeStats> {
        let now = Instant::now();
        nodes
            .iter()
            .map(|(address, node)| (address.clone(), node.stats(now)))
            .collect()
    }

    // Adds keys for new nodes and removes keys for departed ones.
    #[instrument(level = "debug", skip_all, fields(pool = %self.parts.name), name = "LazyPool::reconcile")]
    fn reconcile(&self, listed: Vec<node::Address>) {
        let listed: BTreeSet<_> = listed.into_iter().collect();

        let _workers = self.workers.lock().unwrap();
        if self.terminated.load(Ordering::SeqCst) {
            return;
        }

        let current = self.nodes();
        let mut next = BTreeMap::new();
        for address in &listed {
            if let Some(node) = current.get(address) {
                next.insert(address.clone(), node.clone());
                continue;
            }

            event!(Level::INFO, node = %address, "Adding node");
            self.connections.add_key(address.clone());
            let Some(entry) = self.connections.entry(address) else {
                continue;
            };
            let node = LazyNode {
                address: address.clone(),
                entry,
                connections: self.connections.clone(),
                health: NodeHealth::new(self.parts.policy.failure_window),
            };
            next.insert(address.clone(), Arc::new(node));
        }
        for address in current.keys() {
            if !listed.contains(address) {
                event!(Level::INFO, node = %address, "Removing node");
                self.connections.remove_key(address);
            }
        }

        if next.keys().ne(current.keys()) {
            self.nodes.send_replace(Arc::new(next));
        }
    }

    // One round of upkeep.
    //
    // Returns true once the cluster view has been refreshed successfully.
    async fn maintain(&self, refresh: bool) -> bool {
        let mut refreshed = false;
        if refresh {
            match self.parts.cluster.refresh().await {
                Ok(()) => {
                    self.reconcile(self.parts.cluster.list_nodes());
                    refreshed = true;
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
        }

        let nodes = self.nodes();
        let now = Instant::now();
        for (address, node) in nodes.iter() {
            let stats = node.stats(now);
            if node
                .health
                .evaluate(address, self.parts.suspension.as_ref(), &stats, now)
            {
                self.parts.metrics.node(address, Event::NodeSuspended);
            }
        }

        let evicted = self.connections.evict().await;
        if !evicted.is_empty() {
            event!(Level::DEBUG, ?evicted, "Evicted idle connections");
        }

        for (address, err) in self.connections.ensure_min_idle().await {
            event!(Level::WARN, node = %address, err = ?err, "Failed to connect");
            if let Some(node) = nodes.get(&address) {
                node.health.record_failure();
            }
        }
        refreshed
    }

    /// Runs upkeep every [Policy::maintenance_interval] until the pool stops.
    async fn run_maintenance(self: Arc<Self>, mut stop: watch::Receiver<bool>) {
        // Static membership is still discovered once.
        let mut discovered = false;
        loop {
            let refresh = self.parts.policy.dynamic_node_discovery || !discovered;
            discovered |= self.maintain(refresh).await;

            let interval = self
                .parts
                .policy
                .maintenance_interval
                .add_spread(self.parts.policy.spread);
            tokio::select! {
                _ = tokio::time::sleep(interval) => {},
                _ = stop.changed() => break,
            }
        }
    }

    // Borrows from a single node, waiting briefly if it has no capacity.
    async fn try_node(&self, node: &Arc<LazyNode<Conn>>) -> Option<claim::Handle<Conn>> {
        let wait = Some(self.parts.policy.max_wait_for_checkout);
        match self.connections.borrow(&node.address, wait).await {
            Ok(pooled) => {
                if !pooled.object.is_open() {
                    self.parts
                        .metrics
                        .node(&node.address, Event::ValidationFailed);
                    self.connections.invalidate(pooled);
                    return None;
                }
                node.health.record_borrowed();
                let keyed::Pooled {
                    object,
                    generation,
                    created,
                    ..
                } = pooled;
                let conn = claim::Pooled {
                    conn: object,
                    generation,
                    created,
                };
                let owner: Arc<dyn claim::Recycle<Conn>> = node.clone();
                Some(claim::Handle::new(conn, node.address.clone(), owner))
            }
            Err(keyed::Error::Create(err)) => {
                event!(Level::WARN, node = %node.address, err = ?err, "Failed to connect");
                node.health.record_failure();
                None
            }
            Err(err) => {
                event!(Level::TRACE, node = %node.address, err = ?err, "No connection");
                None
            }
        }
    }

    // One pass over the cluster, mirroring the eager pool: every eligible
    // node at most once, then the least loaded node regardless of `avoid`.
    async fn checkout_round(&self, avoid: &Avoid) -> Option<claim::Handle<Conn>> {
        let nodes = self.nodes();
        let addresses: Vec<_> = nodes.keys().cloned().collect();
        let selector = &self.parts.selector;

        let stats = self.stats(&nodes);
        let mut remaining = addresses.clone();
        while let Some(address) = selector.select(&remaining, &stats, avoid) {
            let before = remaining.len();
            remaining.retain(|candidate| candidate != &address);
            if remaining.len() == before {
                break;
            }
            let Some(node) = nodes.get(&address) else {
                continue;
            };
            if let Some(handle) = self.try_node(node).await {
                return Some(handle);
            }
        }

        let stats = self.stats(&nodes);
        let address = selector.select(&addresses, &stats, &Avoid::new())?;
        self.try_node(nodes.get(&address)?).await
    }

    async fn do_checkout(&self, avoid: &Avoid) -> Result<claim::Handle<Conn>, Error> {
        let mut retry = CheckoutRetry::new(&self.parts.policy);
        loop {
            if self.terminated.load(Ordering::SeqCst) {
                return Err(Error::Terminated);
            }
            if let Some(handle) = self.checkout_round(avoid).await {
                return Ok(handle);
            }
            self.parts.metrics.record(None, Event::CheckoutBackoff);
            if let Err(waited) = retry.backoff().await {
                return Err(Error::NoConnectionsAvailable { waited });
            }
        }
    }
}

/// A pool which borrows connections from a [KeyedPool], with one shared
/// maintenance task.
pub struct LazyPool<Conn: Connection> {
    inner: Arc<Inner<Conn>>,
}

impl<Conn: Connection> LazyPool<Conn> {
    pub(crate) fn start(parts: Parts<Conn>) -> Self {
        let policy = &parts.policy;
        let config = keyed::Config {
            max_per_key: policy.max_per_node_limit(),
            max_idle_per_key: policy.target_limit(),
            min_idle_per_key: policy.min_idle_limit(),
            min_evictable_idle: policy.min_evictable_idle,
            test_on_borrow: false,
            ..Default::default()
        };
        let manager = ConnectionManager {
            name: parts.name.clone(),
            policy: parts.policy.clone(),
            connector: parts.connector.clone(),
            validator: parts.validator.clone(),
            metrics: parts.metrics.clone(),
        };
        let connections = Arc::new(KeyedPool::new(manager, config));
        let (nodes, _) = watch::channel(Arc::new(BTreeMap::new()));
        let (stop_tx, _) = watch::channel(false);
        let initial = parts.cluster.list_nodes();

        let inner = Arc::new(Inner {
            parts,
            connections,
            nodes,
            workers: Mutex::new(vec![]),
            stop_tx,
            terminated: AtomicBool::new(false),
        });
        inner.reconcile(initial);

        let handle = tokio::task::spawn(inner.clone().run_maintenance(inner.stop_tx.subscribe()));
        inner
            .workers
            .lock()
            .unwrap()
            .push(Worker::new("maintenance", handle));
        Self { inner }
    }
}

#[async_trait]
impl<Conn: Connection> ConnectionPool<Conn> for LazyPool<Conn> {
    #[instrument(level = "debug", skip_all, err, name = "LazyPool::checkout")]
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
        self.inner.stats(&self.inner.nodes())
    }

    fn counters(&self) -> CounterSnapshot {
        self.inner.parts.metrics.counters().snapshot()
    }

    fn resume_node(&self, node: &node::Address) -> bool {
        self.inner
            .nodes()
            .get(node)
            .is_some_and(|lazy| lazy.health.clear_suspension(node, Instant::now()))
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
        inner.connections.close();
    }

    fn is_terminated(&self) -> bool {
        self.inner.terminated.load(Ordering::SeqCst)
    }
}

impl<Conn: Connection> Drop for LazyPool<Conn> {
    fn drop(&mut self) {
        let inner = &self.inner;
        inner.terminated.store(true, Ordering::SeqCst);
        inner.stop_tx.send_replace(true);
        join::abort_all(&inner.workers.lock().unwrap());
        inner.connections.close();
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::cluster::shared::SharedCluster;
    use crate::selection::LeastLoaded;
    use crate::suspension::NeverSuspend;
    use crate::test_utils::{wait_for, TestConnection, TestConnector};
    use crate::validator::LivenessValidator;
    use tokio::time::Duration;

    fn start(
        cluster: &SharedCluster,
        connector: &Arc<TestConnector>,
        policy: Policy,
    ) -> LazyPool<TestConnection> {
        LazyPool::start(Parts {
            name: Name::new("lazy"),
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
            min_idle_per_node: 0,
            target_per_node: 2,
            max_per_node: 3,
            max_wait_for_checkout: Duration::from_millis(10),
            maintenance_interval: Duration::from_millis(10),
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
    async fn connections_are_created_on_demand() {
        let cluster = SharedCluster::new(["a", "b"]);
        let connector = Arc::new(TestConnector::new());
        let pool = start(&cluster, &connector, test_policy());

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(connector.opened(), 0);

        let handle = pool.checkout().await.unwrap();
        assert_eq!(connector.opened(), 1);
        assert_eq!(pool.node_stats()[handle.node()].in_use, 1);
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn maintenance_keeps_idle_floor() {
        let cluster = SharedCluster::new(["a", "b"]);
        let connector = Arc::new(TestConnector::new());
        let pool = start(
            &cluster,
            &connector,
            Policy {
                min_idle_per_node: 2,
                ..test_policy()
            },
        );

        wait_for(Duration::from_secs(5), || {
            pool.node_stats().values().all(|stats| stats.idle == 2)
        })
        .await;

        // Dead idle connections are found and replaced.
        connector.sever_node(&address("a"));
        wait_for(Duration::from_secs(5), || pool.counters().validation_failures >= 2).await;
        wait_for(Duration::from_secs(5), || pool.node_stats()[&address("a")].idle == 2).await;
        assert_eq!(connector.opened(), 6);
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn waits_for_capacity_on_a_full_node() {
        let cluster = SharedCluster::new(["a"]);
        let connector = Arc::new(TestConnector::new());
        let pool = Arc::new(start(
            &cluster,
            &connector,
            Policy {
                max_per_node: 1,
                ..test_policy()
            },
        ));

        let held = pool.checkout().await.unwrap();
        let waiter = {
            let pool = pool.clone();
            tokio::task::spawn(async move { pool.checkout().await.map(|handle| handle.id) })
        };
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(!waiter.is_finished());

        let id = held.id;
        drop(held);
        assert_eq!(waiter.await.unwrap().unwrap(), id);
        assert_eq!(connector.opened(), 1);
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn purge_spares_newer_connections() {
        let cluster = SharedCluster::new(["a"]);
        let connector = Arc::new(TestConnector::new());
        let pool = start(
            &cluster,
            &connector,
            Policy {
                target_per_node: 4,
                max_per_node: 4,
                kill_node_connections_on_transport_error: true,
                ..test_policy()
            },
        );

        let handles: Vec<_> = futures::future::join_all((0..4).map(|_| pool.checkout()))
            .await
            .into_iter()
            .collect::<Result<_, _>>()
            .unwrap();
        let mut handles = handles.into_iter();
        let mut bad = handles.next().unwrap();
        let old = handles.next().unwrap();
        // Two idle connections of the same generation.
        drop(handles);
        assert_eq!(pool.node_stats()[&address("a")].idle, 2);

        let generation = bad.generation();
        bad.mark_corrupted();
        drop(bad);
        assert_eq!(pool.counters().purges, 1);
        assert_eq!(pool.node_stats()[&address("a")].idle, 0);

        let fresh = pool.checkout().await.unwrap();
        assert!(fresh.generation() > generation);

        let closed = connector.closed();
        drop(old);
        assert_eq!(connector.closed(), closed + 1);
        drop(fresh);
        assert_eq!(pool.node_stats()[&address("a")].idle, 1);
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn departed_node_connections_close_on_release() {
        let cluster = SharedCluster::new(["a", "b"]);
        let connector = Arc::new(TestConnector::new());
        let pool = start(&cluster, &connector, test_policy());

        let held = pool
            .checkout_avoiding(&Avoid::from([address("b")]))
            .await
            .unwrap();
        assert_eq!(held.node(), &address("a"));

        cluster.set_nodes(["b"]);
        wait_for(Duration::from_secs(5), || {
            !pool.node_stats().contains_key(&address("a"))
        })
        .await;

        let closed = connector.closed();
        drop(held);
        assert_eq!(connector.closed(), closed + 1);

        // Rejoining starts afresh.
        cluster.set_nodes(["a", "b"]);
        wait_for(Duration::from_secs(5), || pool.node_stats().len() == 2).await;
        let stats = &pool.node_stats()[&address("a")];
        assert_eq!((stats.in_use, stats.idle), (0, 0));
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn corruption_from_a_departed_incarnation_spares_the_rejoined_node() {
        let cluster = SharedCluster::new(["a"]);
        let connector = Arc::new(TestConnector::new());
        let pool = start(
            &cluster,
            &connector,
            Policy {
                kill_node_connections_on_transport_error: true,
                ..test_policy()
            },
        );

        let mut stale = pool.checkout().await.unwrap();
        cluster.set_nodes(Vec::<&str>::new());
        wait_for(Duration::from_secs(5), || pool.node_stats().is_empty()).await;
        cluster.set_nodes(["a"]);
        wait_for(Duration::from_secs(5), || pool.node_stats().len() == 1).await;

        let first = pool.checkout().await.unwrap();
        let second = pool.checkout().await.unwrap();
        drop((first, second));
        assert_eq!(pool.node_stats()[&address("a")].idle, 2);

        stale.mark_corrupted();
        drop(stale);
        assert_eq!(pool.counters().connections_corrupted, 1);
        assert_eq!(pool.counters().purges, 0);
        let stats = &pool.node_stats()[&address("a")];
        assert_eq!((stats.idle, stats.generation), (2, 1));
        pool.shutdown().await;
    }
}
