use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::{Context, Result, bail, ensure};
use tracing::debug;

pub mod wire;

use wire::{BackendMode, NatsSecurityMode, or_default};

/// default lease record ttl
pub const DEFAULT_LEASE_TTL: Duration = Duration::from_secs(30);
/// default renewal cadence for owned leases (ttl / 3)
pub const DEFAULT_RENEWAL_INTERVAL: Duration = Duration::from_secs(10);
/// default liveness record ttl
pub const DEFAULT_LIVENESS_TTL: Duration = Duration::from_secs(30);
/// default liveness refresh cadence (ttl / 3)
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(10);
/// default refresh cadence of the cached live-node view
pub const DEFAULT_NODE_DISCOVERY_INTERVAL: Duration = Duration::from_secs(10);
/// default time a lease may stay uncertain before it is given up
pub const DEFAULT_UNCERTAIN_GRACE_PERIOD: Duration = Duration::from_secs(20);
/// default bound on a single store call
pub const DEFAULT_STORE_TIMEOUT: Duration = Duration::from_secs(2);
/// default wait after a lost acquisition race
pub const DEFAULT_ACQUIRE_BACKOFF: Duration = Duration::from_secs(5);
/// default time spent `Initializing` before going `Online`
pub const DEFAULT_STARTUP_GRACE: Duration = Duration::from_secs(10);
/// default cadence for reconciling tracked sessions with the registry
pub const DEFAULT_SESSION_SYNC_INTERVAL: Duration = Duration::from_secs(15);
/// default allowance for wall clocks disagreeing between nodes
pub const DEFAULT_MAX_CLOCK_SKEW: Duration = Duration::from_secs(1);
/// default poll cadence handed to session pollers
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5);
/// default connect timeout for NATS
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// node config
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeConfig {
    node_name: Option<String>,
    lease: LeaseConfig,
    keys: KeyConfig,
    store: StoreConfig,
    poll_interval: Duration,
    sessions: Vec<String>,
    path: Option<PathBuf>,
}

impl NodeConfig {
    /// attempts to decode the config first as JSON, then YAML, finally erroring if neither work
    pub fn parse<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let mut config = Self::new(
            std::fs::read_to_string(path)
                .with_context(|| format!("failed to find config at {}", &path.display()))?,
        )?;
        config.path = Some(path.to_path_buf());
        debug!(?config);
        Ok(config)
    }

    /// decode a config from a YAML string
    pub fn yaml<S: AsRef<str>>(input: S) -> Result<Self> {
        Self::try_from(serde_yaml::from_str::<wire::Config>(input.as_ref())?)
    }

    /// decode a config from a JSON string
    pub fn json<S: AsRef<str>>(input: S) -> Result<Self> {
        Self::try_from(serde_json::from_str::<wire::Config>(input.as_ref())?)
    }

    /// attempts to decode the input as json, then yaml, and if both fail will return Err
    pub fn new<S: AsRef<str>>(input: S) -> Result<Self> {
        match Self::json(input.as_ref()) {
            Ok(r) => Ok(r),
            Err(_err) => Self::yaml(input.as_ref()),
        }
    }

    pub fn node_name(&self) -> Option<&str> {
        self.node_name.as_deref()
    }
    pub fn lease(&self) -> &LeaseConfig {
        &self.lease
    }
    pub fn keys(&self) -> &KeyConfig {
        &self.keys
    }
    pub fn store(&self) -> &StoreConfig {
        &self.store
    }
    pub fn poll_interval(&self) -> Duration {
        self.poll_interval
    }
    pub fn sessions(&self) -> &[String] {
        &self.sessions
    }
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            node_name: None,
            lease: LeaseConfig::default(),
            keys: KeyConfig::default(),
            store: StoreConfig::Memory,
            poll_interval: DEFAULT_POLL_INTERVAL,
            sessions: Vec::new(),
            path: None,
        }
    }
}

impl TryFrom<wire::Config> for NodeConfig {
    type Error = anyhow::Error;

    fn try_from(cfg: wire::Config) -> Result<Self> {
        let node_name = cfg
            .node_name
            .map(|name| name.trim().to_owned())
            .filter(|name| !name.is_empty());
        let lease = LeaseConfig::try_from(cfg.lease)?;
        let keys = KeyConfig::new(cfg.keys.lease_prefix, cfg.keys.node_prefix)?;
        let store = StoreConfig::try_from(cfg.store)?;
        let poll_interval = or_default(
            "poll_interval",
            cfg.poll_interval.as_ref(),
            DEFAULT_POLL_INTERVAL,
        )?;
        ensure!(!poll_interval.is_zero(), "poll_interval must be non-zero");

        let mut sessions = Vec::with_capacity(cfg.sessions.len());
        for id in cfg.sessions {
            let id = id.trim().to_owned();
            ensure!(!id.is_empty(), "session ids must be non-empty");
            if !sessions.contains(&id) {
                sessions.push(id);
            }
        }

        Ok(Self {
            node_name,
            lease,
            keys,
            store,
            poll_interval,
            sessions,
            path: None,
        })
    }
}

/// Validated lease timings.
///
/// Construction guarantees the ordering the coordination layer relies on:
/// refreshes happen well inside their TTLs, a store call never outlives a
/// heartbeat, and an uncertain lease is given up before the node's own
/// liveness record could lapse.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct LeaseConfig {
    pub lease_ttl: Duration,
    pub renewal_interval: Duration,
    pub liveness_ttl: Duration,
    pub heartbeat_interval: Duration,
    pub node_discovery_interval: Duration,
    pub uncertain_grace_period: Duration,
    pub store_timeout: Duration,
    pub acquire_backoff: Duration,
    pub startup_grace: Duration,
    pub session_sync_interval: Duration,
    /// How far node wall clocks may disagree. Record expiry in a shared
    /// store is a wall-clock stamp of the writer, so readers only count a
    /// record as expired this much after its stamp.
    pub max_clock_skew: Duration,
    /// voluntarily hand healthy leases to an online preferred owner
    pub rebalance: bool,
}

impl Default for LeaseConfig {
    fn default() -> Self {
        Self {
            lease_ttl: DEFAULT_LEASE_TTL,
            renewal_interval: DEFAULT_RENEWAL_INTERVAL,
            liveness_ttl: DEFAULT_LIVENESS_TTL,
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            node_discovery_interval: DEFAULT_NODE_DISCOVERY_INTERVAL,
            uncertain_grace_period: DEFAULT_UNCERTAIN_GRACE_PERIOD,
            store_timeout: DEFAULT_STORE_TIMEOUT,
            acquire_backoff: DEFAULT_ACQUIRE_BACKOFF,
            startup_grace: DEFAULT_STARTUP_GRACE,
            session_sync_interval: DEFAULT_SESSION_SYNC_INTERVAL,
            max_clock_skew: DEFAULT_MAX_CLOCK_SKEW,
            rebalance: false,
        }
    }
}

impl LeaseConfig {
    /// check the relationships between timings
    pub fn validate(&self) -> Result<()> {
        let named = [
            ("lease_ttl", self.lease_ttl),
            ("renewal_interval", self.renewal_interval),
            ("liveness_ttl", self.liveness_ttl),
            ("heartbeat_interval", self.heartbeat_interval),
            ("node_discovery_interval", self.node_discovery_interval),
            ("uncertain_grace_period", self.uncertain_grace_period),
            ("store_timeout", self.store_timeout),
            ("session_sync_interval", self.session_sync_interval),
        ];
        for (name, value) in named {
            ensure!(!value.is_zero(), "{name} must be non-zero");
        }
        ensure!(
            self.renewal_interval < self.lease_ttl,
            "renewal_interval ({:?}) must be shorter than lease_ttl ({:?})",
            self.renewal_interval,
            self.lease_ttl
        );
        ensure!(
            self.heartbeat_interval < self.liveness_ttl,
            "heartbeat_interval ({:?}) must be shorter than liveness_ttl ({:?})",
            self.heartbeat_interval,
            self.liveness_ttl
        );
        ensure!(
            self.uncertain_grace_period < self.liveness_ttl,
            "uncertain_grace_period ({:?}) must be shorter than liveness_ttl ({:?})",
            self.uncertain_grace_period,
            self.liveness_ttl
        );
        ensure!(
            self.store_timeout < self.renewal_interval,
            "store_timeout ({:?}) must be shorter than renewal_interval ({:?})",
            self.store_timeout,
            self.renewal_interval
        );
        ensure!(
            self.max_clock_skew < self.lease_ttl - self.renewal_interval,
            "max_clock_skew ({:?}) must be shorter than lease_ttl - renewal_interval ({:?})",
            self.max_clock_skew,
            self.lease_ttl - self.renewal_interval
        );
        // a claim issued at the last re-check must still land inside failover_bound
        ensure!(
            self.acquire_interval() + self.store_timeout + self.max_clock_skew
                <= self.heartbeat_interval,
            "store_timeout ({:?}) plus max_clock_skew ({:?}) must fit in half of heartbeat_interval ({:?})",
            self.store_timeout,
            self.max_clock_skew,
            self.heartbeat_interval
        );
        Ok(())
    }

    /// worst-case time between an owner dying and another node owning its
    /// sessions
    pub fn failover_bound(&self) -> Duration {
        self.liveness_ttl + self.heartbeat_interval
    }

    /// How often a tracked session nobody here holds is re-checked. Capped
    /// at half a heartbeat whatever `renewal_interval` is, so a lease freed
    /// by an expired owner is claimed within `failover_bound`.
    pub fn acquire_interval(&self) -> Duration {
        self.renewal_interval.min(self.heartbeat_interval / 2)
    }
}

impl TryFrom<wire::LeaseTiming> for LeaseConfig {
    type Error = anyhow::Error;

    fn try_from(t: wire::LeaseTiming) -> Result<Self> {
        let cfg = Self {
            lease_ttl: or_default("lease_ttl", t.lease_ttl.as_ref(), DEFAULT_LEASE_TTL)?,
            renewal_interval: or_default(
                "renewal_interval",
                t.renewal_interval.as_ref(),
                DEFAULT_RENEWAL_INTERVAL,
            )?,
            liveness_ttl: or_default(
                "liveness_ttl",
                t.liveness_ttl.as_ref(),
                DEFAULT_LIVENESS_TTL,
            )?,
            heartbeat_interval: or_default(
                "heartbeat_interval",
                t.heartbeat_interval.as_ref(),
                DEFAULT_HEARTBEAT_INTERVAL,
            )?,
            node_discovery_interval: or_default(
                "node_discovery_interval",
                t.node_discovery_interval.as_ref(),
                DEFAULT_NODE_DISCOVERY_INTERVAL,
            )?,
            uncertain_grace_period: or_default(
                "uncertain_grace_period",
                t.uncertain_grace_period.as_ref(),
                DEFAULT_UNCERTAIN_GRACE_PERIOD,
            )?,
            store_timeout: or_default(
                "store_timeout",
                t.store_timeout.as_ref(),
                DEFAULT_STORE_TIMEOUT,
            )?,
            acquire_backoff: or_default(
                "acquire_backoff",
                t.acquire_backoff.as_ref(),
                DEFAULT_ACQUIRE_BACKOFF,
            )?,
            startup_grace: or_default(
                "startup_grace",
                t.startup_grace.as_ref(),
                DEFAULT_STARTUP_GRACE,
            )?,
            session_sync_interval: or_default(
                "session_sync_interval",
                t.session_sync_interval.as_ref(),
                DEFAULT_SESSION_SYNC_INTERVAL,
            )?,
            max_clock_skew: or_default(
                "max_clock_skew",
                t.max_clock_skew.as_ref(),
                DEFAULT_MAX_CLOCK_SKEW,
            )?,
            rebalance: t.rebalance,
        };
        cfg.validate()?;
        Ok(cfg)
    }
}

/// Key namespace for lease and liveness records
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyConfig {
    lease_prefix: String,
    node_prefix: String,
}

impl KeyConfig {
    /// Returns an error if either prefix is empty, contains whitespace or a
    /// KV wildcard, or if one prefix would shadow the other.
    pub fn new(lease_prefix: String, node_prefix: String) -> Result<Self> {
        for (name, prefix) in [("lease_prefix", &lease_prefix), ("node_prefix", &node_prefix)] {
            if prefix.trim().is_empty() {
                bail!("{name} is empty");
            }
            if prefix
                .chars()
                .any(|c| c.is_whitespace() || matches!(c, '*' | '>'))
            {
                bail!("{name} '{prefix}' contains whitespace or a wildcard");
            }
        }
        if lease_prefix.starts_with(&node_prefix) || node_prefix.starts_with(&lease_prefix) {
            bail!("lease_prefix '{lease_prefix}' and node_prefix '{node_prefix}' overlap");
        }
        Ok(Self {
            lease_prefix,
            node_prefix,
        })
    }
    pub fn lease_prefix(&self) -> &str {
        &self.lease_prefix
    }
    pub fn node_prefix(&self) -> &str {
        &self.node_prefix
    }
}

impl Default for KeyConfig {
    fn default() -> Self {
        Self {
            lease_prefix: wire::DEFAULT_LEASE_PREFIX.to_owned(),
            node_prefix: wire::DEFAULT_NODE_PREFIX.to_owned(),
        }
    }
}

/// Which shared store the node coordinates through
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreConfig {
    Memory,
    Nats(NatsConfig),
}

impl TryFrom<wire::Store> for StoreConfig {
    type Error = anyhow::Error;

    fn try_from(store: wire::Store) -> Result<Self> {
        match store.backend {
            BackendMode::Memory => Ok(StoreConfig::Memory),
            BackendMode::Nats => {
                let nats = store
                    .nats
                    .context("nats backend requires a 'nats' section")?;
                Ok(StoreConfig::Nats(NatsConfig::try_from(nats)?))
            }
        }
    }
}

/// Validated NATS connection settings
#[derive(Clone, PartialEq, Eq)]
pub struct NatsConfig {
    pub servers: Vec<String>,
    pub leases_bucket: String,
    pub nodes_bucket: String,
    pub security_mode: NatsSecurityMode,
    pub username: Option<String>,
    pub password: Option<String>,
    pub token: Option<String>,
    pub nkey_seed_path: Option<PathBuf>,
    pub tls_cert_path: Option<PathBuf>,
    pub tls_key_path: Option<PathBuf>,
    pub tls_ca_path: Option<PathBuf>,
    pub creds_file_path: Option<PathBuf>,
    pub connect_timeout: Duration,
    pub connect_retry_max: u32,
}

impl std::fmt::Debug for NatsConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let redact = |secret: &Option<String>| secret.as_ref().map(|_| "<redacted>");
        f.debug_struct("NatsConfig")
            .field("servers", &self.servers)
            .field("leases_bucket", &self.leases_bucket)
            .field("nodes_bucket", &self.nodes_bucket)
            .field("security_mode", &self.security_mode)
            .field("username", &self.username)
            .field("password", &redact(&self.password))
            .field("token", &redact(&self.token))
            .field("nkey_seed_path", &self.nkey_seed_path)
            .field("tls_cert_path", &self.tls_cert_path)
            .field("tls_key_path", &self.tls_key_path)
            .field("tls_ca_path", &self.tls_ca_path)
            .field("creds_file_path", &self.creds_file_path)
            .field("connect_timeout", &self.connect_timeout)
            .field("connect_retry_max", &self.connect_retry_max)
            .finish()
    }
}

impl TryFrom<wire::Nats> for NatsConfig {
    type Error = anyhow::Error;

    fn try_from(nats: wire::Nats) -> Result<Self> {
        ensure!(!nats.servers.is_empty(), "nats.servers must not be empty");
        ensure!(
            !nats.leases_bucket.trim().is_empty() && !nats.nodes_bucket.trim().is_empty(),
            "nats bucket names must not be empty"
        );
        ensure!(
            nats.leases_bucket != nats.nodes_bucket,
            "leases_bucket and nodes_bucket must differ, they carry different TTLs"
        );
        let connect_timeout = or_default(
            "nats.connect_timeout",
            nats.connect_timeout.as_ref(),
            DEFAULT_CONNECT_TIMEOUT,
        )?;
        Ok(Self {
            servers: nats.servers,
            leases_bucket: nats.leases_bucket,
            nodes_bucket: nats.nodes_bucket,
            security_mode: nats.security_mode,
            username: nats.username,
            password: nats.password,
            token: nats.token,
            nkey_seed_path: nats.nkey_seed_path,
            tls_cert_path: nats.tls_cert_path,
            tls_key_path: nats.tls_key_path,
            tls_ca_path: nats.tls_ca_path,
            creds_file_path: nats.creds_file_path,
            connect_timeout,
            connect_retry_max: nats.connect_retry_max,
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        LeaseConfig::default().validate().unwrap();
        let cfg = NodeConfig::yaml("sessions: [a, b, a]").unwrap();
        assert_eq!(cfg.sessions(), ["a", "b"]);
        assert_eq!(*cfg.lease(), LeaseConfig::default());
        assert_eq!(*cfg.store(), StoreConfig::Memory);
        assert_eq!(cfg.keys().lease_prefix(), wire::DEFAULT_LEASE_PREFIX);
    }

    #[test]
    fn test_json_then_yaml() {
        let json = r#"{"node_name": "node-a", "lease": {"lease_ttl": "15s", "renewal_interval": "5s"}}"#;
        let cfg = NodeConfig::new(json).unwrap();
        assert_eq!(cfg.node_name(), Some("node-a"));
        assert_eq!(cfg.lease().lease_ttl, Duration::from_secs(15));
        assert_eq!(cfg.lease().renewal_interval, Duration::from_secs(5));

        let yaml = "node_name: \"  \"\npoll_interval: 250ms";
        let cfg = NodeConfig::new(yaml).unwrap();
        assert_eq!(cfg.node_name(), None);
        assert_eq!(cfg.poll_interval(), Duration::from_millis(250));
    }

    #[test]
    fn test_grace_must_be_shorter_than_liveness_ttl() {
        let yaml = "lease:\n  liveness_ttl: 30s\n  uncertain_grace_period: 30s";
        let err = NodeConfig::yaml(yaml).unwrap_err();
        assert!(format!("{err:#}").contains("uncertain_grace_period"));
    }

    #[test]
    fn test_renewal_must_be_shorter_than_ttl() {
        let yaml = "lease:\n  lease_ttl: 10s\n  renewal_interval: 10s";
        assert!(NodeConfig::yaml(yaml).is_err());
    }

    #[test]
    fn test_store_timeout_bounded_by_heartbeat() {
        let yaml = "lease:\n  heartbeat_interval: 1s\n  store_timeout: 2s";
        assert!(NodeConfig::yaml(yaml).is_err());
    }

    #[test]
    fn test_store_timeout_fits_in_half_a_heartbeat() {
        let yaml = "lease:\n  heartbeat_interval: 4s\n  store_timeout: 3s";
        let err = NodeConfig::yaml(yaml).unwrap_err();
        assert!(format!("{err:#}").contains("half of heartbeat_interval"));

        let yaml = "lease:\n  heartbeat_interval: 6s\n  store_timeout: 1s\n  max_clock_skew: 2500ms";
        assert!(NodeConfig::yaml(yaml).is_err());
        let yaml = "lease:\n  heartbeat_interval: 6s\n  store_timeout: 1s\n  max_clock_skew: 2s";
        let cfg = NodeConfig::yaml(yaml).unwrap();
        assert_eq!(cfg.lease().max_clock_skew, Duration::from_secs(2));
    }

    #[test]
    fn test_clock_skew_bounded_by_renewal_slack() {
        let lease = LeaseConfig {
            lease_ttl: Duration::from_secs(12),
            renewal_interval: Duration::from_secs(10),
            heartbeat_interval: Duration::from_secs(30),
            liveness_ttl: Duration::from_secs(60),
            max_clock_skew: Duration::from_secs(2),
            ..LeaseConfig::default()
        };
        let err = lease.validate().unwrap_err();
        assert!(format!("{err:#}").contains("max_clock_skew"));
    }

    #[test]
    fn test_slow_renewal_keeps_acquire_interval_under_heartbeat() {
        let yaml = "lease:\n  lease_ttl: 30s\n  renewal_interval: 14s\n  heartbeat_interval: 10s";
        let cfg = NodeConfig::yaml(yaml).unwrap();
        let lease = cfg.lease();
        assert_eq!(lease.acquire_interval(), Duration::from_secs(5));
        assert!(lease.acquire_interval() + lease.store_timeout <= lease.heartbeat_interval);
        assert_eq!(
            LeaseConfig::default().acquire_interval(),
            Duration::from_secs(5)
        );
    }

    #[test]
    fn test_zero_duration_rejected() {
        let yaml = "lease:\n  store_timeout: 0ms";
        assert!(NodeConfig::yaml(yaml).is_err());
    }

    #[test]
    fn test_key_prefixes() {
        assert!(KeyConfig::new("poll.lease.".into(), "poll.node.".into()).is_ok());
        assert!(KeyConfig::new("".into(), "poll.node.".into()).is_err());
        assert!(KeyConfig::new("poll.*".into(), "poll.node.".into()).is_err());
        assert!(KeyConfig::new("poll.".into(), "poll.node.".into()).is_err());
    }

    #[test]
    fn test_nats_store_requires_section() {
        let yaml = "store:\n  backend: nats";
        assert!(NodeConfig::yaml(yaml).is_err());

        let yaml = "store:\n  backend: nats\n  nats:\n    servers: [\"nats://127.0.0.1:4222\"]\n    leases_bucket: same\n    nodes_bucket: same";
        assert!(NodeConfig::yaml(yaml).is_err());

        let yaml = "store:\n  backend: nats\n  nats:\n    servers: [\"nats://127.0.0.1:4222\"]\n    security_mode: token\n    token: abc";
        let cfg = NodeConfig::yaml(yaml).unwrap();
        match cfg.store() {
            StoreConfig::Nats(nats) => {
                assert_eq!(nats.security_mode, NatsSecurityMode::Token);
                assert_eq!(nats.connect_timeout, DEFAULT_CONNECT_TIMEOUT);
                let printed = format!("{nats:?}");
                assert!(printed.contains("<redacted>"));
                assert!(!printed.contains("abc"));
            }
            other => panic!("unexpected store {other:?}"),
        }
    }
}
