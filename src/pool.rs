//! A pool which uses a [cluster view](crate::cluster) to find nodes, and
//! vends out [claim] handles to connections.

use crate::claim;
use crate::cluster::SharedClusterView;
use crate::eager::EagerPool;
use crate::health::NodeStats;
use crate::lazy::LazyPool;
use crate::node::{self, Connection, SharedConnector};
use crate::observer::{CounterSnapshot, Metrics, SharedObserver};
use crate::policy::Policy;
use crate::selection::{Avoid, LeastLoaded, SharedNodeSelector};
use crate::suspension::{SharedSuspensionStrategy, TimeBoxed};
use crate::validator::{LivenessValidator, SharedValidator};

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::time::Duration;
use tracing::{event, instrument, Level};

#[derive(Error, Debug)]
pub enum Error {
    #[error("No connections available after waiting {waited:?}")]
    NoConnectionsAvailable { waited: Duration },

    #[error("Pool terminated")]
    Terminated,
}

impl Error {
    #[cfg(feature = "probes")]
    // Convert to a static string for USDT probes.
    pub(crate) const fn as_str(&self) -> &'static str {
        match self {
            Error::NoConnectionsAvailable { .. } => "NoConnectionsAvailable",
            Error::Terminated => "Terminated",
        }
    }
}

/// The name of the pool
#[derive(Clone, Debug)]
pub(crate) struct Name(Arc<str>);

impl Name {
    pub(crate) fn new<S: Into<Arc<str>>>(name: S) -> Self {
        Self(name.into())
    }

    #[cfg_attr(not(feature = "probes"), allow(dead_code))]
    pub(crate) fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for Name {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// Chooses how a pool keeps connections ready.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum Flavor {
    /// Each node has a cache of idle connections, kept full by a dedicated
    /// replenishment task.
    #[default]
    Eager,

    /// Connections are created on demand through a [crate::keyed::KeyedPool],
    /// and a single maintenance task trims and tops up every node.
    Lazy,
}

/// The interface shared by every pool flavor.
#[async_trait]
pub trait ConnectionPool<Conn: Connection>: Send + Sync {
    /// Acquires a connection, preferring nodes outside of `avoid`.
    ///
    /// Waits with backoff while no connection is available, for up to
    /// [Policy::max_checkout_wait].
    async fn checkout_avoiding(&self, avoid: &Avoid) -> Result<claim::Handle<Conn>, Error>;

    /// Acquires a connection from any node.
    async fn checkout(&self) -> Result<claim::Handle<Conn>, Error> {
        self.checkout_avoiding(&Avoid::new()).await
    }

    /// Samples the state of every known node.
    fn node_stats(&self) -> BTreeMap<node::Address, NodeStats>;

    /// Samples the pool's event counters.
    fn counters(&self) -> CounterSnapshot;

    /// Lifts the suspension of `node`, making it selectable again.
    ///
    /// Returns false if the node is unknown or was not suspended. The
    /// node's suspension strategy may suspend it again later.
    fn resume_node(&self, node: &node::Address) -> bool;

    /// Stops all background work and closes idle connections.
    ///
    /// Idempotent. Connections still checked out remain usable, and are
    /// closed when released.
    async fn shutdown(&self);

    fn is_terminated(&self) -> bool;
}

/// Everything a pool flavor needs, assembled by the [Builder].
pub(crate) struct Parts<Conn: Connection> {
    pub(crate) name: Name,
    pub(crate) policy: Arc<Policy>,
    pub(crate) cluster: SharedClusterView,
    pub(crate) connector: SharedConnector<Conn>,
    pub(crate) validator: SharedValidator<Conn>,
    pub(crate) selector: SharedNodeSelector,
    pub(crate) suspension: SharedSuspensionStrategy,
    pub(crate) metrics: Arc<Metrics>,
}

/// A connection pool over every node of a cluster.
pub enum Pool<Conn: Connection> {
    Eager(EagerPool<Conn>),
    Lazy(LazyPool<Conn>),
}

/// A wrapper type indicating that the USDT probes could not be registered.
///
/// In this case, no probes will be available in the process. However, similar
/// to `std::sync::PoisonError`, this contains the pool itself. Applications
/// which don't care about a probe registration failure may still get access to
/// the pool
pub struct RegistrationError<Conn: Connection>(Pool<Conn>);

impl<Conn: Connection> std::fmt::Debug for RegistrationError<Conn> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegistrationError").finish_non_exhaustive()
    }
}

impl<Conn: Connection> std::fmt::Display for RegistrationError<Conn> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        "USDT probe registration failed".fmt(f)
    }
}

impl<Conn: Connection> RegistrationError<Conn> {
    /// Consume the error and get access to the contained pool.
    pub fn into_inner(self) -> Pool<Conn> {
        self.0
    }
}

/// Configures and starts a [Pool].
pub struct Builder<Conn: Connection> {
    name: String,
    cluster: SharedClusterView,
    connector: SharedConnector<Conn>,
    policy: Policy,
    flavor: Flavor,
    selector: SharedNodeSelector,
    suspension: Option<SharedSuspensionStrategy>,
    validator: SharedValidator<Conn>,
    observer: Option<SharedObserver>,
}

impl<Conn: Connection> Builder<Conn> {
    /// - name: The name of this pool, for instrumentation.
    /// - cluster: Describes how nodes should be found.
    /// - connector: Describes how connections to a node should be made.
    pub fn new(
        name: impl Into<String>,
        cluster: SharedClusterView,
        connector: SharedConnector<Conn>,
    ) -> Self {
        Self {
            name: name.into(),
            cluster,
            connector,
            policy: Policy::default(),
            flavor: Flavor::default(),
            selector: Arc::new(LeastLoaded),
            suspension: None,
            validator: Arc::new(LivenessValidator),
            observer: None,
        }
    }

    pub fn policy(mut self, policy: Policy) -> Self {
        self.policy = policy;
        self
    }

    pub fn flavor(mut self, flavor: Flavor) -> Self {
        self.flavor = flavor;
        self
    }

    /// Replaces the default [LeastLoaded] selection.
    pub fn selector(mut self, selector: SharedNodeSelector) -> Self {
        self.selector = selector;
        self
    }

    /// Replaces the default suspension strategy, a [TimeBoxed] strategy
    /// configured from the policy.
    pub fn suspension(mut self, suspension: SharedSuspensionStrategy) -> Self {
        self.suspension = Some(suspension);
        self
    }

    /// Replaces the default [LivenessValidator].
    pub fn validator(mut self, validator: SharedValidator<Conn>) -> Self {
        self.validator = validator;
        self
    }

    /// Forwards every pool event to `observer`, in addition to the pool's
    /// own counters.
    pub fn observer(mut self, observer: SharedObserver) -> Self {
        self.observer = Some(observer);
        self
    }

    /// Starts the pool's background tasks. Must be called within a tokio
    /// runtime.
    ///
    /// # DTrace probe registration
    ///
    /// This returns a `Result`, because it attempts to register the USDT
    /// probes it exposes, a fallible process. However, that failure is
    /// extremely unlikely to happen in practice, and so the `Err` variant of
    /// the returned result allows callers to access the constructed `Pool`
    /// anyway.
    ///
    /// Note that if the `"probes"` feature is not enabled, this method is
    /// infallible.
    #[instrument(skip_all, fields(name = %self.name, flavor = ?self.flavor), name = "Builder::build")]
    pub fn build(self) -> Result<Pool<Conn>, RegistrationError<Conn>> {
        let suspension = self
            .suspension
            .unwrap_or_else(|| Arc::new(TimeBoxed::from_policy(&self.policy)));
        let parts = Parts {
            name: Name::new(self.name),
            policy: Arc::new(self.policy),
            cluster: self.cluster,
            connector: self.connector,
            validator: self.validator,
            selector: self.selector,
            suspension,
            metrics: Arc::new(Metrics::new(self.observer)),
        };
        event!(Level::DEBUG, policy = ?parts.policy, "Starting pool");

        let pool = match self.flavor {
            Flavor::Eager => Pool::Eager(EagerPool::start(parts)),
            Flavor::Lazy => Pool::Lazy(LazyPool::start(parts)),
        };
        #[cfg(feature = "probes")]
        match usdt::register_probes() {
            Ok(_) => Ok(pool),
            Err(_) => Err(RegistrationError(pool)),
        }
        #[cfg(not(feature = "probes"))]
        Ok(pool)
    }
}

impl<Conn: Connection> Pool<Conn> {
    /// Creates a new connection pool of the default flavor.
    ///
    /// ```no_run
    /// use clusterpool::cluster::dns::{DnsCluster, DnsClusterConfig};
    /// use clusterpool::connectors::tcp::TcpConnector;
    /// use clusterpool::pool::Pool;
    /// use clusterpool::policy::Policy;
    /// use std::sync::Arc;
    ///
    /// # async {
    /// // Find nodes through DNS.
    /// let cluster = Arc::new(DnsCluster::new(
    ///     "nodes.cluster.example.com",
    ///     9160,
    ///     DnsClusterConfig::default(),
    /// ));
    ///
    /// // Create the connector -- we're using a simple TCP connection.
    /// let connector = Arc::new(TcpConnector {});
    ///
    /// let pool = Pool::new("my-pool", cluster, connector, Policy::default()).unwrap();
    ///
    /// // Note that it may take a moment for the pool to discover nodes and
    /// // connect to them.
    /// let connection = pool.checkout().await.unwrap();
    /// # };
    /// ```
    pub fn new(
        name: impl Into<String>,
        cluster: SharedClusterView,
        connector: SharedConnector<Conn>,
        policy: Policy,
    ) -> Result<Self, RegistrationError<Conn>> {
        Builder::new(name, cluster, connector).policy(policy).build()
    }

    pub fn flavor(&self) -> Flavor {
        match self {
            Pool::Eager(_) => Flavor::Eager,
            Pool::Lazy(_) => Flavor::Lazy,
        }
    }

    fn inner(&self) -> &dyn ConnectionPool<Conn> {
        match self {
            Pool::Eager(pool) => pool,
            Pool::Lazy(pool) => pool,
        }
    }

    /// Acquires a connection from any node.
    pub async fn checkout(&self) -> Result<claim::Handle<Conn>, Error> {
        self.inner().checkout().await
    }

    /// Acquires a connection, preferring nodes outside of `avoid`.
    pub async fn checkout_avoiding(&self, avoid: &Avoid) -> Result<claim::Handle<Conn>, Error> {
        self.inner().checkout_avoiding(avoid).await
    }

    pub fn node_stats(&self) -> BTreeMap<node::Address, NodeStats> {
        self.inner().node_stats()
    }

    pub fn counters(&self) -> CounterSnapshot {
        self.inner().counters()
    }

    /// See [ConnectionPool::resume_node].
    pub fn resume_node(&self, node: &node::Address) -> bool {
        self.inner().resume_node(node)
    }

    /// Stops the pool. See [ConnectionPool::shutdown].
    pub async fn shutdown(&self) {
        self.inner().shutdown().await
    }

    pub fn is_terminated(&self) -> bool {
        self.inner().is_terminated()
    }
}

#[async_trait]
impl<Conn: Connection> ConnectionPool<Conn> for Pool<Conn> {
    async fn checkout_avoiding(&self, avoid: &Avoid) -> Result<claim::Handle<Conn>, Error> {
        self.inner().checkout_avoiding(avoid).await
    }

    fn node_stats(&self) -> BTreeMap<node::Address, NodeStats> {
        self.inner().node_stats()
    }

    fn counters(&self) -> CounterSnapshot {
        self.inner().counters()
    }

    fn resume_node(&self, node: &node::Address) -> bool {
        self.inner().resume_node(node)
    }

    async fn shutdown(&self) {
        self.inner().shutdown().await
    }

    fn is_terminated(&self) -> bool {
        self.inner().is_terminated()
    }
}
