//! Configuration options which can alter the behavior of the pool.

use tokio::time::Duration;

/// Policy which is applicable to a connection pool.
///
/// A policy is fixed for the lifetime of a pool.
///
/// With the `serde` feature, a policy can be deserialized. Durations are
/// written in milliseconds, under the field name with an `_ms` suffix, and
/// missing fields take their default values:
///
/// ```
/// # #[cfg(feature = "serde")]
/// # fn main() {
/// let policy: clusterpool::policy::Policy = serde_json::from_str(r#"{
///     "target_per_node": 6,
///     "max_checkout_wait_ms": 250
/// }"#).unwrap();
/// assert_eq!(policy.target_per_node, 6);
/// # }
/// # #[cfg(not(feature = "serde"))]
/// # fn main() {}
/// ```
#[derive(Clone, Debug)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct Policy {
    /// Replenishment keeps at least this many idle connections per node.
    pub min_idle_per_node: usize,

    /// The desired number of connections (in use and idle) per node.
    pub target_per_node: usize,

    /// The most connections (in use, idle, or being opened) a node may have.
    ///
    /// Zero means unlimited.
    pub max_per_node: usize,

    /// Base delay between checkout rounds which found no connection.
    #[cfg_attr(feature = "serde", serde(rename = "min_checkout_retry_delay_ms", with = "millis"))]
    pub min_checkout_retry_delay: Duration,

    /// Cap on the delay between checkout rounds.
    #[cfg_attr(feature = "serde", serde(rename = "max_checkout_retry_delay_ms", with = "millis"))]
    pub max_checkout_retry_delay: Duration,

    /// Total time a checkout may spend retrying before failing.
    ///
    /// `None` waits forever.
    #[cfg_attr(feature = "serde", serde(rename = "max_checkout_wait_ms", with = "opt_millis"))]
    pub max_checkout_wait: Option<Duration>,

    /// How long the lazy pool waits on a single node during checkout,
    /// before moving on to the next candidate.
    #[cfg_attr(feature = "serde", serde(rename = "max_wait_for_checkout_ms", with = "millis"))]
    pub max_wait_for_checkout: Duration,

    /// How often each node's replenisher wakes up without being asked.
    #[cfg_attr(feature = "serde", serde(rename = "refill_check_interval_ms", with = "millis"))]
    pub refill_check_interval: Duration,

    /// If set, a connection released as corrupted closes every idle
    /// connection to the same node created in the same generation or
    /// earlier.
    pub kill_node_connections_on_transport_error: bool,

    /// If set, the pool periodically refreshes its cluster view and
    /// tracks nodes joining and leaving.
    pub dynamic_node_discovery: bool,

    /// How long a node stays unselectable once suspended.
    #[cfg_attr(feature = "serde", serde(rename = "node_suspension_duration_ms", with = "millis"))]
    pub node_suspension_duration: Duration,

    /// Failures within [Self::failure_window] which suspend a node.
    pub suspension_failure_threshold: usize,

    /// The window over which failures are counted.
    #[cfg_attr(feature = "serde", serde(rename = "failure_window_ms", with = "millis"))]
    pub failure_window: Duration,

    /// Minimum delay between failed connection attempts to one node.
    #[cfg_attr(feature = "serde", serde(rename = "min_connect_backoff_ms", with = "millis"))]
    pub min_connect_backoff: Duration,

    /// Maximum delay between failed connection attempts to one node.
    #[cfg_attr(feature = "serde", serde(rename = "max_connect_backoff_ms", with = "millis"))]
    pub max_connect_backoff: Duration,

    /// Bound on a single connection attempt.
    #[cfg_attr(feature = "serde", serde(rename = "connect_timeout_ms", with = "millis"))]
    pub connect_timeout: Duration,

    /// Bound on a single connection validation.
    #[cfg_attr(feature = "serde", serde(rename = "validation_timeout_ms", with = "millis"))]
    pub validation_timeout: Duration,

    /// How often the eager pool refreshes its cluster view.
    #[cfg_attr(feature = "serde", serde(rename = "topology_refresh_interval_ms", with = "millis"))]
    pub topology_refresh_interval: Duration,

    /// How often the lazy pool runs maintenance.
    #[cfg_attr(feature = "serde", serde(rename = "maintenance_interval_ms", with = "millis"))]
    pub maintenance_interval: Duration,

    /// Idle time after which the lazy pool may evict a connection.
    #[cfg_attr(feature = "serde", serde(rename = "min_evictable_idle_ms", with = "millis"))]
    pub min_evictable_idle: Duration,

    /// How long shutdown waits for background workers.
    #[cfg_attr(feature = "serde", serde(rename = "shutdown_timeout_ms", with = "millis"))]
    pub shutdown_timeout: Duration,

    /// Random jitter added to periodic waits.
    #[cfg_attr(feature = "serde", serde(rename = "spread_ms", with = "millis"))]
    pub spread: Duration,
}

impl Default for Policy {
    fn default() -> Self {
        Self {
            min_idle_per_node: 1,
            target_per_node: 4,
            max_per_node: 8,
            min_checkout_retry_delay: Duration::from_millis(20),
            max_checkout_retry_delay: Duration::from_secs(1),
            max_checkout_wait: Some(Duration::from_secs(5)),
            max_wait_for_checkout: Duration::from_millis(100),
            refill_check_interval: Duration::from_secs(1),
            kill_node_connections_on_transport_error: false,
            dynamic_node_discovery: true,
            node_suspension_duration: Duration::from_secs(10),
            suspension_failure_threshold: 3,
            failure_window: Duration::from_secs(30),
            min_connect_backoff: Duration::from_millis(20),
            max_connect_backoff: Duration::from_secs(5),
            connect_timeout: Duration::from_secs(5),
            validation_timeout: Duration::from_secs(1),
            topology_refresh_interval: Duration::from_secs(30),
            maintenance_interval: Duration::from_secs(1),
            min_evictable_idle: Duration::from_secs(60),
            shutdown_timeout: Duration::from_secs(5),
            spread: Duration::from_millis(10),
        }
    }
}

impl Policy {
    /// The per-node connection cap, or `None` if unlimited.
    pub fn max_per_node_limit(&self) -> Option<usize> {
        match self.max_per_node {
            0 => None,
            max => Some(max),
        }
    }

    /// The per-node target, never above the cap.
    pub fn target_limit(&self) -> usize {
        match self.max_per_node_limit() {
            Some(max) => self.target_per_node.min(max),
            None => self.target_per_node,
        }
    }

    /// The per-node idle floor, never above the cap.
    pub fn min_idle_limit(&self) -> usize {
        match self.max_per_node_limit() {
            Some(max) => self.min_idle_per_node.min(max),
            None => self.min_idle_per_node,
        }
    }
}

#[cfg(feature = "serde")]
mod millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use tokio::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}

#[cfg(feature = "serde")]
mod opt_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use tokio::time::Duration;

    pub fn serialize<S: Serializer>(d: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
        match d {
            Some(d) => s.serialize_some(&u64::try_from(d.as_millis()).unwrap_or(u64::MAX)),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
        Option::<u64>::deserialize(d).map(|ms| ms.map(Duration::from_millis))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn zero_max_is_unlimited() {
        let policy = Policy {
            max_per_node: 0,
            target_per_node: 100,
            ..Default::default()
        };
        assert_eq!(policy.max_per_node_limit(), None);
        assert_eq!(policy.target_limit(), 100);
    }

    #[test]
    fn target_and_idle_clamped_to_max() {
        let policy = Policy {
            max_per_node: 3,
            target_per_node: 10,
            min_idle_per_node: 5,
            ..Default::default()
        };
        assert_eq!(policy.target_limit(), 3);
        assert_eq!(policy.min_idle_limit(), 3);
    }

    #[cfg(feature = "serde")]
    #[test]
    fn deserialize_with_defaults() {
        let policy: Policy = serde_json::from_str(
            r#"{
                "min_idle_per_node": 2,
                "max_per_node": 0,
                "kill_node_connections_on_transport_error": true,
                "node_suspension_duration_ms": 1500,
                "max_checkout_wait_ms": null
            }"#,
        )
        .unwrap();

        assert_eq!(policy.min_idle_per_node, 2);
        assert_eq!(policy.max_per_node_limit(), None);
        assert!(policy.kill_node_connections_on_transport_error);
        assert_eq!(policy.node_suspension_duration, Duration::from_millis(1500));
        assert_eq!(policy.max_checkout_wait, None);
        assert_eq!(policy.target_per_node, Policy::default().target_per_node);
        assert_eq!(
            policy.refill_check_interval,
            Policy::default().refill_check_interval
        );
    }
}
