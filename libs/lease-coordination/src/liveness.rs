//! Fleet membership through TTL'd liveness records.
//!
//! Each node refreshes its own record every `heartbeat_interval`; the live set
//! is re-derived from whichever records have not expired. Nobody keeps a
//! persistent membership list.
//!
//! The registrar also tracks when this node's own record is known to be
//! present. If a refresh lands after the previous one could have expired,
//! other nodes may have treated this node as dead and reclaimed its leases,
//! so the liveness epoch is bumped and every lease held under the old epoch
//! stops counting as owned.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use config::LeaseConfig;
use parking_lot::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{CoordinationError, CoordinationResult};
use crate::keys::KeyResolver;
use crate::metrics;
use crate::models::{self, LivenessRecord, NodeId, NodeStatus};
use crate::store::{LeaseStore, with_timeout};

/// Snapshot of this node's own liveness.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LivenessView {
    /// Earliest instant this node's record may expire in the store.
    pub deadline: Instant,
    /// Bumped every time the record may have lapsed.
    pub epoch: u64,
}

/// How long a node that just recovered from a lapse stays out of the claim
/// path, in store timeouts. A peer that saw the lapse may still be finishing
/// a takeover: one liveness read, one listing and one compare-and-set.
const QUARANTINE_STORE_CALLS: u32 = 4;

#[derive(Debug)]
struct Clock {
    deadline: Instant,
    epoch: u64,
    quarantine_until: Instant,
}

#[derive(Debug)]
pub struct LivenessRegistrar {
    node_id: NodeId,
    store: Arc<dyn LeaseStore>,
    keys: KeyResolver,
    timing: LeaseConfig,
    started: Instant,
    startup_time: DateTime<Utc>,
    clock: Mutex<Clock>,
    cache: RwLock<Vec<NodeId>>,
    loop_token: Mutex<Option<CancellationToken>>,
}

impl LivenessRegistrar {
    pub fn new(
        node_id: NodeId,
        store: Arc<dyn LeaseStore>,
        keys: KeyResolver,
        timing: LeaseConfig,
    ) -> Self {
        let now = Instant::now();
        Self {
            node_id,
            store,
            keys,
            timing,
            started: now,
            startup_time: Utc::now(),
            clock: Mutex::new(Clock {
                deadline: now,
                epoch: 0,
                quarantine_until: now,
            }),
            cache: RwLock::new(Vec::new()),
            loop_token: Mutex::new(None),
        }
    }

    pub fn node_id(&self) -> &NodeId {
        &self.node_id
    }

    /// Initializing until `startup_grace` has passed since construction.
    pub fn status(&self) -> NodeStatus {
        if Instant::now() >= self.started + self.timing.startup_grace {
            NodeStatus::Online
        } else {
            NodeStatus::Initializing
        }
    }

    pub fn record(&self) -> LivenessRecord {
        LivenessRecord {
            node_id: self.node_id.clone(),
            status: self.status(),
            startup_time: self.startup_time,
        }
    }

    pub fn liveness(&self) -> LivenessView {
        let clock = self.clock.lock();
        LivenessView {
            deadline: clock.deadline,
            epoch: clock.epoch,
        }
    }

    /// Whether this node may take new leases at `now`: its own record is
    /// known present and any post-lapse quarantine is over.
    pub fn may_acquire(&self, now: Instant) -> bool {
        let clock = self.clock.lock();
        clock.epoch > 0 && now < clock.deadline && now >= clock.quarantine_until
    }

    /// First registration. Failure here must abort startup.
    pub async fn register(&self) -> CoordinationResult<()> {
        self.refresh().await?;
        info!(
            instance_id = %self.node_id,
            status = %self.status(),
            "registered node liveness"
        );
        Ok(())
    }

    async fn refresh(&self) -> CoordinationResult<()> {
        let issued = Instant::now();
        let payload = models::encode(&self.record())?;
        let key = self.keys.node_key(&self.node_id);
        with_timeout(
            self.timing.store_timeout,
            "liveness refresh",
            self.store
                .put(&key, &self.node_id, payload, self.timing.liveness_ttl),
        )
        .await?;
        let landed = Instant::now();

        let mut clock = self.clock.lock();
        if clock.epoch == 0 {
            clock.epoch = 1;
        } else if landed >= clock.deadline {
            clock.epoch += 1;
            clock.quarantine_until = landed + self.timing.store_timeout * QUARANTINE_STORE_CALLS;
            warn!(
                instance_id = %self.node_id,
                epoch = clock.epoch,
                "liveness record may have lapsed, leases held before are void"
            );
        }
        clock.deadline = issued + self.timing.liveness_ttl;
        Ok(())
    }

    /// Refresh this node's record, absorbing failures.
    pub async fn heartbeat(&self) {
        match self.refresh().await {
            Ok(()) => debug!(instance_id = %self.node_id, "liveness refreshed"),
            Err(err) => {
                metrics::HEARTBEAT_FAILURES.inc();
                warn!(instance_id = %self.node_id, error = %err, "liveness refresh failed");
            }
        }
    }

    /// Unexpired liveness records, sorted by node id.
    pub async fn live_records(&self) -> CoordinationResult<Vec<LivenessRecord>> {
        let entries = with_timeout(
            self.timing.store_timeout,
            "liveness list",
            self.store.list(self.keys.node_prefix()),
        )
        .await?;
        let mut records: Vec<LivenessRecord> = entries
            .into_iter()
            .filter_map(|(key, entry)| match models::decode(&entry.value) {
                Ok(record) => Some(record),
                Err(err) => {
                    warn!(key = %key, error = %err, "skipping undecodable liveness record");
                    None
                }
            })
            .collect();
        records.sort_by(|a, b| a.node_id.cmp(&b.node_id));
        records.dedup_by(|a, b| a.node_id == b.node_id);
        Ok(records)
    }

    /// Point-in-time snapshot of the live-node set.
    pub async fn get_live_nodes(&self) -> CoordinationResult<Vec<NodeId>> {
        Ok(self
            .live_records()
            .await?
            .into_iter()
            .map(|r| r.node_id)
            .collect())
    }

    /// Re-list live nodes into the cache.
    pub async fn refresh_cache(&self) -> CoordinationResult<Vec<NodeId>> {
        let nodes = self.get_live_nodes().await?;
        metrics::LIVE_NODES.set(nodes.len() as i64);
        *self.cache.write() = nodes.clone();
        Ok(nodes)
    }

    /// Cached live-node set, falling back to a direct listing while the cache
    /// is empty. May lag by up to `node_discovery_interval`.
    pub async fn cached_live_nodes(&self) -> CoordinationResult<Vec<NodeId>> {
        let cached = self.cache.read().clone();
        if cached.is_empty() {
            self.refresh_cache().await
        } else {
            Ok(cached)
        }
    }

    /// Ok(true) when Online, Ok(false) when Initializing,
    /// `NodeOffline` when the record is absent or expired.
    pub async fn check_node_ready(&self, node: &NodeId) -> CoordinationResult<bool> {
        let entry = with_timeout(
            self.timing.store_timeout,
            "liveness read",
            self.store.get(&self.keys.node_key(node)),
        )
        .await?
        .ok_or_else(|| CoordinationError::NodeOffline(node.to_string()))?;
        let record: LivenessRecord = models::decode(&entry.value)?;
        Ok(record.status == NodeStatus::Online)
    }

    /// Whether `node` has an unexpired liveness record.
    pub async fn is_node_live(&self, node: &NodeId) -> CoordinationResult<bool> {
        match self.check_node_ready(node).await {
            Ok(_) => Ok(true),
            Err(err) if err.is_offline() => Ok(false),
            Err(err) => Err(err),
        }
    }

    /// Spawn the refresh loop: heartbeat, discovery cache, and the
    /// Initializing -> Online announcement.
    pub fn start(self: &Arc<Self>, token: &CancellationToken) -> JoinHandle<()> {
        let token = token.child_token();
        *self.loop_token.lock() = Some(token.clone());
        let this = Arc::clone(self);
        tokio::spawn(async move { this.run(token).await })
    }

    async fn run(&self, token: CancellationToken) {
        let mut heartbeat = tokio::time::interval_at(
            Instant::now() + self.timing.heartbeat_interval,
            self.timing.heartbeat_interval,
        );
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut discovery = tokio::time::interval(self.timing.node_discovery_interval);
        discovery.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let online_at = tokio::time::sleep_until(self.started + self.timing.startup_grace);
        tokio::pin!(online_at);
        let mut announced = self.status() == NodeStatus::Online;

        loop {
            tokio::select! {
                biased;
                _ = token.cancelled() => {
                    debug!(instance_id = %self.node_id, "liveness loop stopping");
                    break;
                }
                _ = &mut online_at, if !announced => {
                    announced = true;
                    info!(instance_id = %self.node_id, "startup grace elapsed, node online");
                    self.heartbeat().await;
                }
                _ = heartbeat.tick() => self.heartbeat().await,
                _ = discovery.tick() => {
                    if let Err(err) = self.refresh_cache().await {
                        debug!(error = %err, "live node discovery failed");
                    }
                }
            }
        }
    }

    /// Stop the refresh loop and best-effort delete this node's record.
    pub async fn stop(&self) {
        if let Some(token) = self.loop_token.lock().take() {
            token.cancel();
        }
        let key = self.keys.node_key(&self.node_id);
        match with_timeout(
            self.timing.store_timeout,
            "liveness delete",
            self.store.compare_and_delete(&key, &self.node_id),
        )
        .await
        {
            Ok(_) => info!(instance_id = %self.node_id, "liveness record removed"),
            Err(err) => {
                warn!(instance_id = %self.node_id, error = %err, "failed to remove liveness record")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::store::MemoryStore;

    fn timing() -> LeaseConfig {
        LeaseConfig {
            liveness_ttl: Duration::from_secs(30),
            heartbeat_interval: Duration::from_secs(10),
            node_discovery_interval: Duration::from_secs(10),
            startup_grace: Duration::from_secs(10),
            store_timeout: Duration::from_secs(2),
            ..LeaseConfig::default()
        }
    }

    fn registrar(store: &MemoryStore, id: &str) -> Arc<LivenessRegistrar> {
        Arc::new(LivenessRegistrar::new(
            NodeId::from(id),
            Arc::new(store.client()),
            KeyResolver::default(),
            timing(),
        ))
    }

    #[tokio::test(start_paused = true)]
    async fn test_register_and_discover() {
        let store = MemoryStore::new();
        let a = registrar(&store, "a");
        let b = registrar(&store, "b");
        a.register().await.unwrap();
        b.register().await.unwrap();

        let nodes = a.get_live_nodes().await.unwrap();
        assert_eq!(nodes, vec![NodeId::from("a"), NodeId::from("b")]);
        assert_eq!(a.liveness().epoch, 1);
        assert!(a.may_acquire(Instant::now()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_check_node_ready_tracks_startup() {
        let store = MemoryStore::new();
        let a = registrar(&store, "a");
        a.register().await.unwrap();
        assert!(!a.check_node_ready(&NodeId::from("a")).await.unwrap());

        tokio::time::advance(Duration::from_secs(10)).await;
        a.heartbeat().await;
        assert!(a.check_node_ready(&NodeId::from("a")).await.unwrap());

        let err = a.check_node_ready(&NodeId::from("ghost")).await.unwrap_err();
        assert!(err.is_offline());
        assert!(!a.is_node_live(&NodeId::from("ghost")).await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_record_expires_without_heartbeat() {
        let store = MemoryStore::new();
        let a = registrar(&store, "a");
        let b = registrar(&store, "b");
        a.register().await.unwrap();
        tokio::time::advance(Duration::from_secs(30)).await;
        assert!(!b.is_node_live(&NodeId::from("a")).await.unwrap());
        assert!(!a.may_acquire(Instant::now()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_late_refresh_bumps_epoch() {
        let store = MemoryStore::new();
        let a = registrar(&store, "a");
        a.register().await.unwrap();

        tokio::time::advance(Duration::from_secs(31)).await;
        a.heartbeat().await;
        let view = a.liveness();
        assert_eq!(view.epoch, 2);
        // quarantined right after recovering
        assert!(!a.may_acquire(Instant::now()));
        tokio::time::advance(Duration::from_secs(7)).await;
        assert!(!a.may_acquire(Instant::now()));
        tokio::time::advance(Duration::from_secs(1)).await;
        assert!(a.may_acquire(Instant::now()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timely_refresh_keeps_epoch() {
        let store = MemoryStore::new();
        let a = registrar(&store, "a");
        a.register().await.unwrap();
        for _ in 0..5 {
            tokio::time::advance(Duration::from_secs(10)).await;
            a.heartbeat().await;
        }
        assert_eq!(a.liveness().epoch, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_loop_keeps_record_alive_and_stop_removes_it() {
        let store = MemoryStore::new();
        let a = registrar(&store, "a");
        a.register().await.unwrap();
        let token = CancellationToken::new();
        let handle = a.start(&token);

        tokio::time::sleep(Duration::from_secs(95)).await;
        assert!(a.is_node_live(&NodeId::from("a")).await.unwrap());
        assert!(a.check_node_ready(&NodeId::from("a")).await.unwrap());
        assert_eq!(a.cached_live_nodes().await.unwrap(), vec![NodeId::from("a")]);

        a.stop().await;
        handle.await.unwrap();
        assert!(!a.is_node_live(&NodeId::from("a")).await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    #[tracing_test::traced_test]
    async fn test_heartbeat_failure_is_absorbed() {
        let store = MemoryStore::new();
        let handle = store.client();
        let a = Arc::new(LivenessRegistrar::new(
            NodeId::from("a"),
            Arc::new(handle.clone()),
            KeyResolver::default(),
            timing(),
        ));
        a.register().await.unwrap();
        handle.set_unavailable(true);
        a.heartbeat().await;
        assert!(logs_contain("liveness refresh failed"));
        assert!(a.register().await.is_err());
    }
}
