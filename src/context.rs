//! Per-node connection caches for the eager pool.

use crate::backoff::{self, Spread};
use crate::claim::{self, Pooled};
use crate::health::{NodeHealth, NodeStats};
use crate::node::{self, Connection, SharedConnector};
use crate::observer::{Event, Metrics};
use crate::policy::Policy;
use crate::pool::Name;
#[cfg(feature = "probes")]
use crate::probes;
use crate::signal::Signal;
use crate::suspension::SharedSuspensionStrategy;
use crate::validator::SharedValidator;

use debug_ignore::DebugIgnore;
use derive_where::derive_where;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::watch;
use tokio::time::{Duration, Instant};
use tracing::{event, instrument, Level};

// Generations start here; "purged through zero" means nothing was purged.
const FIRST_GENERATION: u64 = 1;

/// Everything a node's replenisher needs besides the node itself.
#[derive_where(Clone)]
pub(crate) struct Replenisher<Conn: Connection> {
    pub(crate) connector: SharedConnector<Conn>,
    pub(crate) validator: SharedValidator<Conn>,
    pub(crate) suspension: SharedSuspensionStrategy,
}

/// The cache of idle connections to a single node.
///
/// Connections move between three places:
/// - "idle": cached in `idle`, ready for checkout.
/// - "in use": checked out by a caller.
/// - "pending": held by the replenisher while being opened or validated.
///
/// The sum of all three never exceeds the node's cap.
#[derive_where(Debug)]
pub(crate) struct NodeContext<Conn: Connection> {
    pool: Name,
    address: node::Address,
    policy: Arc<Policy>,

    idle: Mutex<VecDeque<DebugIgnore<Pooled<Conn>>>>,
    in_use: AtomicUsize,
    pending: AtomicUsize,

    // Stamped onto connections as they enter the cache.
    generation: AtomicU64,
    // Cached connections from this generation or earlier must not be used.
    purged_through: AtomicU64,

    retired: AtomicBool,
    closed: AtomicBool,

    health: NodeHealth,
    refill: Signal,
    metrics: Arc<Metrics>,
}

impl<Conn: Connection> NodeContext<Conn> {
    pub(crate) fn new(
        pool: Name,
        address: node::Address,
        policy: Arc<Policy>,
        metrics: Arc<Metrics>,
    ) -> Self {
        let health = NodeHealth::new(policy.failure_window);
        Self {
            pool,
            address,
            policy,
            idle: Mutex::new(VecDeque::new()),
            in_use: AtomicUsize::new(0),
            pending: AtomicUsize::new(0),
            generation: AtomicU64::new(FIRST_GENERATION),
            purged_through: AtomicU64::new(FIRST_GENERATION - 1),
            retired: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            health,
            refill: Signal::new(),
            metrics,
        }
    }

    pub(crate) fn address(&self) -> &node::Address {
        &self.address
    }

    /// Samples the node's counts.
    ///
    /// Connections only move between counts with the idle queue locked, so
    /// the sample never counts one connection twice.
    pub(crate) fn stats(&self, now: Instant) -> NodeStats {
        let mut stats = {
            let idle = self.idle.lock().unwrap();
            NodeStats {
                in_use: self.in_use.load(Ordering::SeqCst),
                idle: idle.len(),
                pending: self.pending.load(Ordering::SeqCst),
                generation: self.generation.load(Ordering::SeqCst),
                retired: self.retired.load(Ordering::SeqCst),
                ..Default::default()
            }
        };
        self.health.fill(&self.address, &mut stats, now);
        stats
    }

    /// Takes an idle connection out of the cache, if one is available.
    ///
    /// Closed connections found along the way are discarded.
    #[instrument(level = "trace", skip(self), fields(node = %self.address))]
    pub(crate) fn try_checkout(self: &Arc<Self>) -> Option<claim::Handle<Conn>> {
        if self.closed.load(Ordering::SeqCst) {
            return None;
        }
        loop {
            let pooled = {
                let mut idle = self.idle.lock().unwrap();
                let DebugIgnore(pooled) = idle.pop_front()?;
                self.in_use.fetch_add(1, Ordering::SeqCst);
                pooled
            };
            // Our idle count just dropped: let the replenisher know.
            self.refill.signal();

            if !pooled.conn.is_open() {
                event!(Level::DEBUG, "Discarding closed connection found in cache");
                self.in_use.fetch_sub(1, Ordering::SeqCst);
                self.metrics.node(&self.address, Event::ValidationFailed);
                self.destroy(pooled);
                continue;
            }

            self.health.record_borrowed();
            let owner: Arc<dyn claim::Recycle<Conn>> = self.clone();
            return Some(claim::Handle::new(pooled, self.address.clone(), owner));
        }
    }

    /// Takes back a connection which was checked out.
    #[instrument(level = "trace", skip(self, pooled), fields(node = %self.address))]
    pub(crate) fn release(&self, pooled: Pooled<Conn>, corrupted: bool) {
        if corrupted {
            self.in_use.fetch_sub(1, Ordering::SeqCst);
            event!(
                Level::DEBUG,
                generation = pooled.generation,
                "Connection released as corrupted"
            );
            self.metrics.node(&self.address, Event::ConnectionCorrupted);
            self.health.record_corrupted();
            let generation = pooled.generation;
            self.destroy(pooled);
            if self.policy.kill_node_connections_on_transport_error {
                self.purge(generation);
            }
            self.refill.signal();
            return;
        }

        if !pooled.conn.is_open() {
            self.in_use.fetch_sub(1, Ordering::SeqCst);
            event!(Level::DEBUG, "Released connection is closed");
            self.destroy(pooled);
            self.refill.signal();
            return;
        }

        let target = self.policy.target_limit();
        let rejected = {
            let mut idle = self.idle.lock().unwrap();
            let in_use = self.in_use.fetch_sub(1, Ordering::SeqCst) - 1;
            if self.closed.load(Ordering::SeqCst)
                || self.retired.load(Ordering::SeqCst)
                || pooled.generation <= self.purged_through.load(Ordering::SeqCst)
                || in_use + idle.len() >= target
            {
                Some(pooled)
            } else {
                idle.push_back(DebugIgnore(pooled));
                None
            }
        };

        match rejected {
            Some(pooled) => self.destroy(pooled),
            None => self.metrics.node(&self.address, Event::ReturnedToCache),
        }
    }

    /// Closes every idle connection created in `generation` or earlier.
    ///
    /// Connections created afterwards, including those currently checked
    /// out, are untouched.
    #[instrument(level = "debug", skip(self), fields(node = %self.address))]
    pub(crate) fn purge(&self, generation: u64) {
        let evicted: Vec<_> = {
            let mut idle = self.idle.lock().unwrap();
            if generation <= self.purged_through.load(Ordering::SeqCst) {
                // An earlier purge already covered this generation.
                return;
            }
            self.purged_through.store(generation, Ordering::SeqCst);
            self.generation.fetch_max(generation + 1, Ordering::SeqCst);

            let (keep, evict): (VecDeque<_>, VecDeque<_>) = idle
                .drain(..)
                .partition(|DebugIgnore(pooled)| pooled.generation > generation);
            *idle = keep;
            evict.into_iter().map(|DebugIgnore(pooled)| pooled).collect()
        };

        event!(
            Level::INFO,
            node = %self.address,
            generation,
            evicted = evicted.len(),
            "Purged idle connections after corruption"
        );
        #[cfg(feature = "probes")]
        probes::purge!(|| (self.pool.as_str(), self.address.as_str(), generation));
        self.metrics.node(&self.address, Event::Purge);
        for pooled in evicted {
            self.destroy(pooled);
        }
    }

    /// Marks the node as having left (or rejoined) the cluster view.
    ///
    /// Retired nodes are not selected, not replenished, and keep no idle
    /// connections.
    pub(crate) fn set_retired(&self, retired: bool) {
        if self.retired.swap(retired, Ordering::SeqCst) == retired {
            return;
        }
        if retired {
            event!(Level::INFO, node = %self.address, "Node retired");
            self.drain_idle();
        } else {
            event!(Level::INFO, node = %self.address, "Node rejoined");
            self.refill.signal();
        }
    }

    /// Makes a suspended node selectable again.
    pub(crate) fn resume(&self) -> bool {
        let resumed = self.health.clear_suspension(&self.address, Instant::now());
        if resumed {
            self.refill.signal();
        }
        resumed
    }

    /// Closes all idle connections and refuses to cache any more.
    pub(crate) fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.drain_idle();
        self.refill.signal();
    }

    fn drain_idle(&self) {
        let drained: Vec<_> = self.idle.lock().unwrap().drain(..).collect();
        for DebugIgnore(pooled) in drained {
            self.destroy(pooled);
        }
    }

    fn destroy(&self, mut pooled: Pooled<Conn>) {
        pooled.conn.close();
        self.metrics.node(&self.address, Event::ConnectionDestroyed);
    }

    fn is_active(&self) -> bool {
        !self.closed.load(Ordering::SeqCst) && !self.retired.load(Ordering::SeqCst)
    }

    // Whether the cache is below its idle floor or its target.
    fn wants_more(&self) -> bool {
        if !self.is_active() {
            return false;
        }
        let idle = self.idle.lock().unwrap();
        let pending = self.pending.load(Ordering::SeqCst);
        let in_use = self.in_use.load(Ordering::SeqCst);
        idle.len() + pending < self.policy.min_idle_limit()
            || in_use + idle.len() + pending < self.policy.target_limit()
    }

    // Claims room for one more connection under the node's cap.
    //
    // Every increment of "in_use", "pending" or the idle queue happens with
    // the idle queue locked, so the total read here is never below the true
    // total.
    fn reserve(&self) -> bool {
        let idle = self.idle.lock().unwrap();
        if let Some(max) = self.policy.max_per_node_limit() {
            let total = self.in_use.load(Ordering::SeqCst)
                + idle.len()
                + self.pending.load(Ordering::SeqCst);
            if total >= max {
                return false;
            }
        }
        self.pending.fetch_add(1, Ordering::SeqCst);
        true
    }

    // Places a connection held by the replenisher into the cache, stamping
    // it with the current generation if it's new.
    fn admit(&self, mut pooled: Pooled<Conn>, fresh: bool) -> bool {
        let rejected = {
            let mut idle = self.idle.lock().unwrap();
            if fresh {
                pooled.generation = self.generation.load(Ordering::SeqCst);
            }
            let rejected = if !self.is_active()
                || pooled.generation <= self.purged_through.load(Ordering::SeqCst)
            {
                Some(pooled)
            } else {
                idle.push_back(DebugIgnore(pooled));
                None
            };
            self.pending.fetch_sub(1, Ordering::SeqCst);
            rejected
        };
        match rejected {
            Some(pooled) => {
                self.destroy(pooled);
                false
            }
            None => true,
        }
    }

    /// Validates every connection which was idle when the sweep started.
    async fn sweep(&self, validator: &SharedValidator<Conn>) {
        let count = self.idle.lock().unwrap().len();
        for _ in 0..count {
            let pooled = {
                let mut idle = self.idle.lock().unwrap();
                let Some(DebugIgnore(pooled)) = idle.pop_front() else {
                    break;
                };
                self.pending.fetch_add(1, Ordering::SeqCst);
                pooled
            };
            let mut pooled = pooled;

            let result =
                tokio::time::timeout(self.policy.validation_timeout, validator.validate(&mut pooled.conn))
                    .await;
            match result {
                Ok(Ok(())) => {
                    self.admit(pooled, false);
                }
                Ok(Err(err)) => {
                    event!(Level::DEBUG, node = %self.address, err = ?err, "Idle connection failed validation");
                    self.pending.fetch_sub(1, Ordering::SeqCst);
                    self.metrics.node(&self.address, Event::ValidationFailed);
                    self.destroy(pooled);
                }
                Err(_) => {
                    event!(Level::DEBUG, node = %self.address, "Idle connection validation timed out");
                    self.pending.fetch_sub(1, Ordering::SeqCst);
                    self.metrics.node(&self.address, Event::ValidationFailed);
                    self.destroy(pooled);
                }
            }
        }
    }

    /// Opens connections until the cache is full.
    ///
    /// Stops at the first failure, returning it.
    async fn fill(
        &self,
        connector: &SharedConnector<Conn>,
        stop: &mut watch::Receiver<bool>,
    ) -> Result<(), node::Error> {
        while self.wants_more() {
            if !self.reserve() {
                event!(Level::TRACE, node = %self.address, "Node at connection cap");
                break;
            }

            #[cfg(feature = "probes")]
            probes::connect__start!(|| (self.pool.as_str(), self.address.as_str()));

            let result = tokio::select! {
                result = tokio::time::timeout(
                    self.policy.connect_timeout,
                    connector.connect(&self.address),
                ) => result,
                _ = stop.changed() => {
                    self.pending.fetch_sub(1, Ordering::SeqCst);
                    return Ok(());
                }
            };

            match result {
                Ok(Ok(conn)) => {
                    #[cfg(feature = "probes")]
                    probes::connect__done!(|| (self.pool.as_str(), self.address.as_str()));
                    self.metrics.node(&self.address, Event::ConnectionCreated);
                    let pooled = Pooled {
                        conn,
                        generation: FIRST_GENERATION,
                        created: Instant::now(),
                    };
                    if self.admit(pooled, true) {
                        event!(Level::TRACE, node = %self.address, "Cached new connection");
                    }
                }
                Ok(Err(err)) => {
                    #[cfg(feature = "probes")]
                    probes::connect__failed!(|| (
                        self.pool.as_str(),
                        self.address.as_str(),
                        "error"
                    ));
                    self.pending.fetch_sub(1, Ordering::SeqCst);
                    return Err(err);
                }
                Err(_) => {
                    #[cfg(feature = "probes")]
                    probes::connect__failed!(|| (
                        self.pool.as_str(),
                        self.address.as_str(),
                        "timeout"
                    ));
                    self.pending.fetch_sub(1, Ordering::SeqCst);
                    return Err(node::Error::Timeout);
                }
            }
        }
        Ok(())
    }

    /// Runs until `stop` flips, keeping the cache healthy and full.
    ///
    /// Wakes every [Policy::refill_check_interval], or sooner when a
    /// checkout drains the cache. After a failed connection attempt, it
    /// instead sleeps with exponential backoff.
    #[instrument(level = "debug", skip_all, fields(node = %self.address), name = "NodeContext::replenish")]
    pub(crate) async fn replenish(
        self: Arc<Self>,
        replenisher: Replenisher<Conn>,
        mut stop: watch::Receiver<bool>,
    ) {
        let mut failures: u32 = 0;
        loop {
            if *stop.borrow() || self.closed.load(Ordering::SeqCst) {
                break;
            }

            let now = Instant::now();
            if self.health.evaluate(
                &self.address,
                replenisher.suspension.as_ref(),
                &self.stats(now),
                now,
            ) {
                self.metrics.node(&self.address, Event::NodeSuspended);
            }

            self.sweep(&replenisher.validator).await;

            match self.fill(&replenisher.connector, &mut stop).await {
                Ok(()) => failures = 0,
                Err(err) => {
                    failures = failures.saturating_add(1);
                    event!(
                        Level::WARN,
                        node = %self.address,
                        err = ?err,
                        failures,
                        "Failed to connect"
                    );
                    self.health.record_failure();
                    self.metrics.node(&self.address, Event::ConnectionCreateFailed);
                }
            }

            let wait = async {
                if failures > 0 {
                    let delay = backoff::delay(
                        failures,
                        self.policy.min_connect_backoff,
                        self.policy.max_connect_backoff,
                    );
                    tokio::time::sleep(delay).await;
                } else {
                    let interval: Duration =
                        self.policy.refill_check_interval.add_spread(self.policy.spread);
                    self.refill.wait_until(interval).await;
                }
            };
            tokio::select! {
                _ = wait => {},
                changed = stop.changed() => {
                    // The pool went away without asking us to stop.
                    if changed.is_err() {
                        break;
                    }
                },
            }
        }
        event!(Level::DEBUG, pool = %self.pool, node = %self.address, "Replenisher stopped");
    }
}

impl<Conn: Connection> claim::Recycle<Conn> for NodeContext<Conn> {
    fn recycle(&self, _node: &node::Address, conn: Pooled<Conn>, corrupted: bool) {
        self.release(conn, corrupted);
    }
}
