use std::{path::PathBuf, time::Duration};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// default key prefix for session lease records
pub const DEFAULT_LEASE_PREFIX: &str = "poll.lease.";
/// default key prefix for node liveness records
pub const DEFAULT_NODE_PREFIX: &str = "poll.node.";
/// default JetStream KV bucket holding lease records
pub const DEFAULT_LEASES_BUCKET: &str = "poll_leases";
/// default JetStream KV bucket holding liveness records
pub const DEFAULT_NODES_BUCKET: &str = "poll_nodes";

/// top-level config type
#[derive(Debug, Clone, PartialEq, Eq, Default, Deserialize, Serialize)]
pub struct Config {
    /// fixed instance id, generated when absent
    pub node_name: Option<String>,
    #[serde(default)]
    pub lease: LeaseTiming,
    #[serde(default)]
    pub keys: Keys,
    #[serde(default)]
    pub store: Store,
    pub poll_interval: Option<WireDuration>,
    /// sessions this fleet keeps polled
    #[serde(default)]
    pub sessions: Vec<String>,
}

/// lease & liveness timings, all optional on the wire
#[derive(Debug, Clone, PartialEq, Eq, Default, Deserialize, Serialize)]
pub struct LeaseTiming {
    pub lease_ttl: Option<WireDuration>,
    pub renewal_interval: Option<WireDuration>,
    pub liveness_ttl: Option<WireDuration>,
    pub heartbeat_interval: Option<WireDuration>,
    pub node_discovery_interval: Option<WireDuration>,
    pub uncertain_grace_period: Option<WireDuration>,
    pub store_timeout: Option<WireDuration>,
    pub acquire_backoff: Option<WireDuration>,
    pub startup_grace: Option<WireDuration>,
    pub session_sync_interval: Option<WireDuration>,
    pub max_clock_skew: Option<WireDuration>,
    #[serde(default)]
    pub rebalance: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct Keys {
    #[serde(default = "default_lease_prefix")]
    pub lease_prefix: String,
    #[serde(default = "default_node_prefix")]
    pub node_prefix: String,
}

impl Default for Keys {
    fn default() -> Self {
        Self {
            lease_prefix: default_lease_prefix(),
            node_prefix: default_node_prefix(),
        }
    }
}

/// which shared store backs the lease records
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendMode {
    /// in-process store, only coordinates managers sharing one process
    #[default]
    Memory,
    /// JetStream KV
    Nats,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Deserialize, Serialize)]
pub struct Store {
    #[serde(default)]
    pub backend: BackendMode,
    pub nats: Option<Nats>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NatsSecurityMode {
    #[default]
    None,
    UserPassword,
    Token,
    Nkey,
    Tls,
    CredsFile,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct Nats {
    pub servers: Vec<String>,
    #[serde(default = "default_leases_bucket")]
    pub leases_bucket: String,
    #[serde(default = "default_nodes_bucket")]
    pub nodes_bucket: String,
    #[serde(default)]
    pub security_mode: NatsSecurityMode,
    pub username: Option<String>,
    pub password: Option<String>,
    pub token: Option<String>,
    pub nkey_seed_path: Option<PathBuf>,
    pub tls_cert_path: Option<PathBuf>,
    pub tls_key_path: Option<PathBuf>,
    pub tls_ca_path: Option<PathBuf>,
    pub creds_file_path: Option<PathBuf>,
    pub connect_timeout: Option<WireDuration>,
    #[serde(default = "default_connect_retry_max")]
    pub connect_retry_max: u32,
}

pub fn default_lease_prefix() -> String {
    DEFAULT_LEASE_PREFIX.to_owned()
}

pub fn default_node_prefix() -> String {
    DEFAULT_NODE_PREFIX.to_owned()
}

pub fn default_leases_bucket() -> String {
    DEFAULT_LEASES_BUCKET.to_owned()
}

pub fn default_nodes_bucket() -> String {
    DEFAULT_NODES_BUCKET.to_owned()
}

pub const fn default_connect_retry_max() -> u32 {
    5
}

/// A duration on the wire, either bare seconds or a string with a unit
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(untagged)]
pub enum WireDuration {
    Seconds(u64),
    String(String),
}

impl WireDuration {
    pub fn to_duration(&self) -> Result<Duration> {
        match self {
            WireDuration::Seconds(secs) => Ok(Duration::from_secs(*secs)),
            WireDuration::String(s) => parse_duration(s),
        }
    }
}

impl From<Duration> for WireDuration {
    fn from(d: Duration) -> Self {
        if d.subsec_millis() == 0 {
            WireDuration::Seconds(d.as_secs())
        } else {
            WireDuration::String(format!("{}ms", d.as_millis()))
        }
    }
}

/// resolve an optional wire duration, falling back to `default`
pub(crate) fn or_default(
    field: &str,
    value: Option<&WireDuration>,
    default: Duration,
) -> Result<Duration> {
    match value {
        Some(d) => d
            .to_duration()
            .with_context(|| format!("invalid duration for '{field}'")),
        None => Ok(default),
    }
}

/// Parse a duration string with optional time units
/// Accepts: "250ms", "3600", "3600s", "60m", "24h"
/// If no unit is specified, assumes seconds
pub fn parse_duration(s: &str) -> Result<Duration> {
    let s = s.trim();
    if s.is_empty() {
        anyhow::bail!("empty duration string");
    }

    let end = s.find(|c: char| !c.is_ascii_digit()).unwrap_or(s.len());
    // split units
    let (num, unit) = s.split_at(end);
    let num = num.parse::<u64>().context("invalid number")?;

    let millis_per_unit: u64 = match unit.trim() {
        "ms" => 1,
        "" | "s" => 1_000,
        "m" => 60_000,
        "h" => 3_600_000,
        other => anyhow::bail!(
            "unknown time unit '{}', only 'h', 'm', 's' or 'ms' are supported",
            other
        ),
    };

    num.checked_mul(millis_per_unit)
        .map(Duration::from_millis)
        .context("duration value overflow")
}

#[cfg(test)]
mod tests {
    use super::*;

    pub static EXAMPLE: &str = include_str!("../../../../node.example.yaml");

    // test we can encode/decode example file
    #[test]
    fn test_example() {
        let cfg: crate::wire::Config = serde_yaml::from_str(EXAMPLE).unwrap();
        assert_eq!(cfg.store.backend, BackendMode::Nats);
        assert!(!cfg.sessions.is_empty());
        // back to the yaml
        let s = serde_yaml::to_string(&cfg).unwrap();
        let again: crate::wire::Config = serde_yaml::from_str(&s).unwrap();
        assert_eq!(cfg, again);
    }

    #[test]
    fn test_parse_duration() {
        assert_eq!(parse_duration("3600s").unwrap(), Duration::from_secs(3600));
        assert_eq!(parse_duration("60").unwrap(), Duration::from_secs(60));
        assert_eq!(parse_duration("250ms").unwrap(), Duration::from_millis(250));

        assert_eq!(parse_duration("60m").unwrap(), Duration::from_secs(3600));
        assert_eq!(parse_duration("90m").unwrap(), Duration::from_secs(5400));

        assert_eq!(parse_duration("24h").unwrap(), Duration::from_secs(86400));
        assert_eq!(parse_duration(" 1h ").unwrap(), Duration::from_secs(3600));
    }

    #[test]
    fn test_parse_duration_invalid() {
        assert!(parse_duration("").is_err());
        assert!(parse_duration("60d").is_err());
        assert!(parse_duration("60mins").is_err());
        assert!(parse_duration("s").is_err());
    }

    #[test]
    fn test_wire_duration_forms() {
        let json = r#"{"lease_ttl": 30, "renewal_interval": "10s", "store_timeout": "500ms"}"#;
        let timing: LeaseTiming = serde_json::from_str(json).unwrap();
        assert_eq!(
            timing.lease_ttl.unwrap().to_duration().unwrap(),
            Duration::from_secs(30)
        );
        assert_eq!(
            timing.renewal_interval.unwrap().to_duration().unwrap(),
            Duration::from_secs(10)
        );
        assert_eq!(
            timing.store_timeout.unwrap().to_duration().unwrap(),
            Duration::from_millis(500)
        );
        assert!(!timing.rebalance);
    }

    #[test]
    fn test_nats_defaults() {
        let yaml = "servers: [\"nats://127.0.0.1:4222\"]";
        let nats: Nats = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(nats.leases_bucket, DEFAULT_LEASES_BUCKET);
        assert_eq!(nats.nodes_bucket, DEFAULT_NODES_BUCKET);
        assert_eq!(nats.security_mode, NatsSecurityMode::None);
        assert_eq!(nats.connect_retry_max, 5);
    }
}
