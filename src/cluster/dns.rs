//! Implementation of [ClusterView] for DNS

use crate::cluster::{self, ClusterView};
use crate::node;

use async_trait::async_trait;
use hickory_resolver::config::{NameServerConfig, Protocol, ResolverConfig, ResolverOpts};
use hickory_resolver::TokioAsyncResolver;
use std::net::SocketAddr;
use std::sync::Mutex;
use std::time::Duration;
use tracing::{event, instrument, Level};

/// Configuration options to tweak resolution behavior.
#[derive(Clone, Debug)]
pub struct DnsClusterConfig {
    /// Name servers to query. If empty, the system configuration is used.
    pub name_servers: Vec<SocketAddr>,

    /// The timeout for a single DNS query.
    pub query_timeout: Duration,

    /// Whether to consult the local hosts file before querying.
    pub use_hosts_file: bool,
}

impl Default for DnsClusterConfig {
    fn default() -> Self {
        Self {
            name_servers: vec![],
            query_timeout: Duration::from_secs(5),
            use_hosts_file: true,
        }
    }
}

/// A [ClusterView] which resolves a host name to the addresses of every
/// node, each reached on the same port.
pub struct DnsCluster {
    resolver: TokioAsyncResolver,
    host: String,
    port: u16,
    nodes: Mutex<Vec<node::Address>>,
}

impl DnsCluster {
    /// Creates a view for `host`. No lookup happens until the first
    /// [ClusterView::refresh].
    pub fn new(host: impl Into<String>, port: u16, config: DnsClusterConfig) -> Self {
        let rc = if config.name_servers.is_empty() {
            ResolverConfig::default()
        } else {
            let mut rc = ResolverConfig::new();
            for address in config.name_servers {
                rc.add_name_server(NameServerConfig {
                    socket_addr: address,
                    protocol: Protocol::Udp,
                    tls_dns_name: None,
                    trust_negative_responses: false,
                    bind_addr: None,
                });
            }
            rc
        };
        let mut opts = ResolverOpts::default();
        opts.use_hosts_file = config.use_hosts_file;
        opts.timeout = config.query_timeout;
        opts.attempts = 1;
        Self {
            resolver: TokioAsyncResolver::tokio(rc, opts),
            host: host.into(),
            port,
            nodes: Mutex::new(vec![]),
        }
    }
}

#[async_trait]
impl ClusterView for DnsCluster {
    fn list_nodes(&self) -> Vec<node::Address> {
        self.nodes.lock().unwrap().clone()
    }

    #[instrument(skip(self), fields(host = %self.host), name = "DnsCluster::refresh")]
    async fn refresh(&self) -> Result<(), cluster::Error> {
        let lookup = self
            .resolver
            .lookup_ip(self.host.as_str())
            .await
            .map_err(|source| cluster::Error::Resolve {
                name: self.host.clone(),
                source,
            })?;

        let mut nodes: Vec<node::Address> = lookup
            .iter()
            .map(|ip| node::Address::from(SocketAddr::new(ip, self.port)))
            .collect();
        nodes.sort();
        nodes.dedup();
        event!(Level::DEBUG, count = nodes.len(), "Resolved cluster nodes");

        *self.nodes.lock().unwrap() = nodes;
        Ok(())
    }
}
