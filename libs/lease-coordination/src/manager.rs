//! Lease manager: the facade the reporting API and session pollers use.
//!
//! Composes the liveness registrar, the ownership assigner and one state
//! machine per session. Every store call for a session runs under that
//! session's operation lock, so transitions for one session are strictly
//! sequential; readers only touch a short synchronous lock and never wait on
//! store I/O.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use config::LeaseConfig;
use parking_lot::{Mutex, RwLock};
use rand::Rng;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::assigner::{Decision, OwnershipAssigner};
use crate::error::{CoordinationError, CoordinationResult};
use crate::keys::KeyResolver;
use crate::liveness::LivenessRegistrar;
use crate::metrics;
use crate::models::{
    self, LeaseEvent, LeaseEventKind, LeaseRecord, LivenessRecord, NodeId, NodeStatus, SessionId,
};
use crate::registry::SessionRegistry;
use crate::state::{LeaseState, LocalLeaseInfo, RenewFailure};
use crate::store::{LeaseStore, Precondition, Stores, with_timeout};

/// Capacity of the lease event channel; slow subscribers see `Lagged`.
const EVENT_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Default)]
struct SessionSlot {
    /// serializes store operations for this session
    op: tokio::sync::Mutex<()>,
    state: Mutex<SlotState>,
}

#[derive(Debug, Default)]
struct SlotState {
    info: Option<LocalLeaseInfo>,
    /// last record written while held
    record: Option<LeaseRecord>,
    /// no acquisition attempt before this instant
    retry_after: Option<Instant>,
    /// waiting for the preferred owner to go first
    defer_until: Option<Instant>,
    /// the session was untracked; stale loops must not act on it
    retired: bool,
}

impl SlotState {
    fn is_held(&self) -> bool {
        self.info.as_ref().is_some_and(|i| i.state.is_held())
    }
}

/// Everything this node knows about one session, for reporting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaseSnapshot {
    pub session_id: SessionId,
    /// record currently in the store
    pub record: Option<LeaseRecord>,
    pub preferred_owner: Option<NodeId>,
    /// this node's local view, if it holds or is acquiring the lease
    pub local: Option<LocalLeaseInfo>,
}

#[derive(Debug)]
pub struct LeaseManager {
    node_id: NodeId,
    timing: LeaseConfig,
    keys: KeyResolver,
    store: Arc<dyn LeaseStore>,
    registrar: Arc<LivenessRegistrar>,
    assigner: OwnershipAssigner,
    slots: RwLock<HashMap<SessionId, Arc<SessionSlot>>>,
    loops: Mutex<HashMap<SessionId, CancellationToken>>,
    events: broadcast::Sender<LeaseEvent>,
    token: CancellationToken,
}

impl LeaseManager {
    /// Build a manager. `token` is observed by every loop the manager spawns;
    /// pass a child of the node-wide shutdown token.
    pub fn new(
        node_id: NodeId,
        timing: LeaseConfig,
        keys: KeyResolver,
        stores: &Stores,
        token: CancellationToken,
    ) -> Arc<Self> {
        let registrar = Arc::new(LivenessRegistrar::new(
            node_id.clone(),
            Arc::clone(&stores.nodes),
            keys.clone(),
            timing,
        ));
        let assigner = OwnershipAssigner::new(
            Arc::clone(&stores.leases),
            Arc::clone(&registrar),
            keys.clone(),
            timing,
        );
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Arc::new(Self {
            node_id,
            timing,
            keys,
            store: Arc::clone(&stores.leases),
            registrar,
            assigner,
            slots: RwLock::new(HashMap::new()),
            loops: Mutex::new(HashMap::new()),
            events,
            token,
        })
    }

    // -----------------------------------------------------------------------
    // Query surface
    // -----------------------------------------------------------------------

    pub fn instance_id(&self) -> &NodeId {
        &self.node_id
    }

    pub fn timing(&self) -> &LeaseConfig {
        &self.timing
    }

    /// This node's self-reported status.
    pub fn status(&self) -> NodeStatus {
        self.registrar.status()
    }

    pub fn is_ready(&self) -> bool {
        self.status() == NodeStatus::Online
    }

    pub async fn get_live_nodes(&self) -> CoordinationResult<Vec<NodeId>> {
        self.registrar.get_live_nodes().await
    }

    /// Live nodes with their self-reported status.
    pub async fn live_node_records(&self) -> CoordinationResult<Vec<LivenessRecord>> {
        self.registrar.live_records().await
    }

    pub async fn check_node_ready(&self, node: &NodeId) -> CoordinationResult<bool> {
        self.registrar.check_node_ready(node).await
    }

    pub async fn get_lease_owner(&self, session: &SessionId) -> CoordinationResult<Option<NodeId>> {
        self.assigner.get_lease_owner(session).await
    }

    pub async fn get_lease_value(
        &self,
        session: &SessionId,
    ) -> CoordinationResult<Option<LeaseRecord>> {
        self.assigner.get_lease_value(session).await
    }

    pub async fn preferred_owner(&self, session: &SessionId) -> CoordinationResult<Option<NodeId>> {
        self.assigner.preferred_owner(session).await
    }

    pub async fn should_acquire(&self, session: &SessionId) -> CoordinationResult<bool> {
        self.assigner.should_acquire(session).await
    }

    /// Ownership as recorded in the store right now, for callers about to do
    /// something the local view might be too stale for.
    pub async fn is_owned_strict(&self, session: &SessionId) -> CoordinationResult<bool> {
        Ok(self.get_lease_owner(session).await?.as_ref() == Some(&self.node_id))
    }

    /// Local info, `None` when this node holds no local record for the session.
    pub fn get_lease_info(&self, session: &SessionId) -> Option<LocalLeaseInfo> {
        self.existing_slot(session)?.state.lock().info.clone()
    }

    /// Polling gate: Owned, or Uncertain before the give-up deadline.
    pub fn is_owned(&self, session: &SessionId) -> bool {
        let Some(slot) = self.existing_slot(session) else {
            return false;
        };
        let liveness = self.registrar.liveness();
        let state = slot.state.lock();
        state
            .info
            .as_ref()
            .is_some_and(|info| info.is_active(Instant::now(), &self.timing, &liveness))
    }

    pub fn is_uncertain(&self, session: &SessionId) -> bool {
        self.get_lease_info(session)
            .is_some_and(|info| info.state == LeaseState::Uncertain)
    }

    /// Sessions the polling gate is currently open for.
    pub fn owned_sessions(&self) -> Vec<SessionId> {
        let sessions: Vec<SessionId> = self.slots.read().keys().cloned().collect();
        let mut owned: Vec<SessionId> = sessions
            .into_iter()
            .filter(|s| self.is_owned(s))
            .collect();
        owned.sort();
        owned
    }

    /// Local info for every Owned or Uncertain lease.
    pub fn held_leases(&self) -> Vec<LocalLeaseInfo> {
        let mut held: Vec<LocalLeaseInfo> = self
            .slots
            .read()
            .values()
            .filter_map(|slot| {
                let state = slot.state.lock();
                state.info.clone().filter(|i| i.state.is_held())
            })
            .collect();
        held.sort_by(|a, b| a.session_id.cmp(&b.session_id));
        held
    }

    pub fn uncertain_leases(&self) -> Vec<LocalLeaseInfo> {
        self.held_leases()
            .into_iter()
            .filter(|i| i.state == LeaseState::Uncertain)
            .collect()
    }

    pub async fn lease_snapshot(&self, session: &SessionId) -> CoordinationResult<LeaseSnapshot> {
        let (record, preferred_owner) = tokio::try_join!(
            self.get_lease_value(session),
            self.preferred_owner(session)
        )?;
        Ok(LeaseSnapshot {
            session_id: session.clone(),
            record,
            preferred_owner,
            local: self.get_lease_info(session),
        })
    }

    /// Snapshots of every tracked session, sorted by session id.
    pub async fn lease_snapshots(&self) -> CoordinationResult<Vec<LeaseSnapshot>> {
        let sessions = self.tracked_sessions();
        futures::future::try_join_all(sessions.iter().map(|s| self.lease_snapshot(s))).await
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LeaseEvent> {
        self.events.subscribe()
    }

    pub fn tracked_sessions(&self) -> Vec<SessionId> {
        let mut tracked: Vec<SessionId> = self.loops.lock().keys().cloned().collect();
        tracked.sort();
        tracked
    }

    // -----------------------------------------------------------------------
    // Transitions
    // -----------------------------------------------------------------------

    fn existing_slot(&self, session: &SessionId) -> Option<Arc<SessionSlot>> {
        self.slots.read().get(session).cloned()
    }

    fn slot(&self, session: &SessionId) -> Arc<SessionSlot> {
        if let Some(slot) = self.existing_slot(session) {
            return slot;
        }
        Arc::clone(self.slots.write().entry(session.clone()).or_default())
    }

    fn emit(&self, kind: LeaseEventKind, session: &SessionId, error: Option<String>) {
        let event = LeaseEvent {
            kind,
            session_id: session.clone(),
            instance_id: self.node_id.clone(),
            at: Utc::now(),
            error,
        };
        // no subscribers is fine
        let _ = self.events.send(event);
    }

    /// Acquire the session if it is free or stale, or renew it if held.
    /// Store failures are absorbed into the returned state.
    pub async fn try_acquire_or_renew(&self, session: &SessionId) -> LeaseState {
        let slot = self.slot(session);
        let _op = slot.op.lock().await;
        let held = slot.state.lock().is_held();
        if held {
            self.renew(session, &slot).await
        } else {
            self.acquire(session, &slot).await
        }
    }

    async fn acquire(&self, session: &SessionId, slot: &SessionSlot) -> LeaseState {
        let now = Instant::now();
        if self.token.is_cancelled() || !self.registrar.may_acquire(now) {
            return LeaseState::Unowned;
        }
        {
            let state = slot.state.lock();
            if state.retired || state.retry_after.is_some_and(|t| now < t) {
                return LeaseState::Unowned;
            }
        }

        let expected = match self.assigner.decide(session).await {
            Ok(Decision::Acquire(expected)) => expected,
            Ok(Decision::Skip(reason)) => {
                trace!(session_id = %session, ?reason, "not acquiring");
                slot.state.lock().defer_until = None;
                return LeaseState::Unowned;
            }
            Err(err) => {
                debug!(session_id = %session, error = %err, "acquisition check failed");
                return LeaseState::Unowned;
            }
        };
        let reclaim_own = expected == Precondition::Owner(self.node_id.clone());
        if !reclaim_own && !self.clear_to_claim(session, slot, now).await {
            return LeaseState::Unowned;
        }

        let epoch = self.registrar.liveness().epoch;
        slot.state.lock().info = Some(LocalLeaseInfo::acquiring(session.clone(), epoch));

        let record = LeaseRecord::acquired(self.node_id.clone(), Utc::now());
        let key = self.keys.lease_key(session);
        let issued = Instant::now();
        let result = match models::encode(&record) {
            Ok(payload) => {
                with_timeout(
                    self.timing.store_timeout,
                    "lease acquire",
                    self.store.compare_and_set(
                        &key,
                        &expected,
                        &self.node_id,
                        payload,
                        self.timing.lease_ttl,
                    ),
                )
                .await
            }
            Err(err) => Err(err),
        };

        match result {
            Ok(true) => {
                {
                    let mut state = slot.state.lock();
                    if let Some(info) = state.info.as_mut() {
                        info.acquired(issued);
                    }
                    state.record = Some(record);
                    state.retry_after = None;
                    state.defer_until = None;
                }
                metrics::LEASES_HELD.inc();
                let kind = match &expected {
                    Precondition::Owner(previous) if !reclaim_own => {
                        metrics::LEASE_TAKEOVERS.inc();
                        info!(
                            session_id = %session,
                            instance_id = %self.node_id,
                            previous_owner = %previous,
                            "stale lease taken over"
                        );
                        LeaseEventKind::TakenOver
                    }
                    _ => {
                        metrics::LEASE_ACQUISITIONS.inc();
                        info!(session_id = %session, instance_id = %self.node_id, "lease acquired");
                        LeaseEventKind::Acquired
                    }
                };
                self.emit(kind, session, None);
                LeaseState::Owned
            }
            Ok(false) => {
                metrics::LEASE_ACQUIRE_CONFLICTS.inc();
                debug!(session_id = %session, instance_id = %self.node_id, "lost acquisition race");
                self.back_off(slot, now);
                self.emit(
                    LeaseEventKind::AcquireFailed,
                    session,
                    Some("lease held by another node".into()),
                );
                LeaseState::Unowned
            }
            Err(err) => {
                metrics::LEASE_ACQUIRE_ERRORS.inc();
                warn!(session_id = %session, instance_id = %self.node_id, error = %err, "lease acquisition failed");
                self.back_off(slot, now);
                self.emit(LeaseEventKind::AcquireFailed, session, Some(err.to_string()));
                LeaseState::Unowned
            }
        }
    }

    fn back_off(&self, slot: &SessionSlot, now: Instant) {
        let mut state = slot.state.lock();
        state.info = None;
        state.retry_after = Some(now + self.timing.acquire_backoff);
    }

    /// Let the preferred owner go first: a node that is not preferred waits
    /// one `acquire_interval` plus a jittered `acquire_backoff` before
    /// claiming, long enough for the preferred node to re-check.
    async fn clear_to_claim(&self, session: &SessionId, slot: &SessionSlot, now: Instant) -> bool {
        if self.timing.acquire_backoff.is_zero() {
            return true;
        }
        let preferred = match self.assigner.preferred_owner_now(session).await {
            Ok(preferred) => preferred,
            Err(err) => {
                debug!(session_id = %session, error = %err, "preferred owner unknown");
                None
            }
        };
        if preferred.as_ref().is_none_or(|p| *p == self.node_id) {
            return true;
        }
        let mut state = slot.state.lock();
        match state.defer_until {
            None => {
                let wait = self.timing.acquire_interval() + jitter(self.timing.acquire_backoff);
                state.defer_until = Some(now + wait);
                debug!(
                    session_id = %session,
                    preferred_owner = ?preferred,
                    wait_ms = wait.as_millis(),
                    "deferring to preferred owner"
                );
                false
            }
            Some(until) if now < until => false,
            Some(_) => {
                state.defer_until = None;
                true
            }
        }
    }

    async fn renew(&self, session: &SessionId, slot: &SessionSlot) -> LeaseState {
        let liveness = self.registrar.liveness();
        let (epoch, record) = {
            let state = slot.state.lock();
            (
                state.info.as_ref().map(|i| i.epoch),
                state.record.clone(),
            )
        };
        if epoch != Some(liveness.epoch) {
            return self.lose(session, slot, "own liveness lapsed while holding the lease");
        }
        let Some(record) = record else {
            return self.lose(session, slot, "no record to renew");
        };

        let renewed = record.renewed(Utc::now());
        let key = self.keys.lease_key(session);
        let expected = Precondition::Owner(self.node_id.clone());
        let issued = Instant::now();
        let result = match models::encode(&renewed) {
            Ok(payload) => {
                with_timeout(
                    self.timing.store_timeout,
                    "lease renew",
                    self.store.compare_and_set(
                        &key,
                        &expected,
                        &self.node_id,
                        payload,
                        self.timing.lease_ttl,
                    ),
                )
                .await
            }
            Err(err) => Err(err),
        };

        match result {
            Ok(true) => {
                let reconfirmed = {
                    let mut state = slot.state.lock();
                    state.record = Some(renewed);
                    state.info.as_mut().is_some_and(|info| info.renewed(issued))
                };
                metrics::LEASE_RENEWALS.inc();
                if reconfirmed {
                    info!(session_id = %session, instance_id = %self.node_id, "lease ownership re-confirmed");
                } else {
                    trace!(session_id = %session, "lease renewed");
                }
                self.emit(LeaseEventKind::Renewed, session, None);
                if self.timing.rebalance && self.should_hand_off(session).await {
                    self.release_locked(session, slot, "rebalance").await;
                    slot.state.lock().retry_after = Some(
                        Instant::now() + self.timing.renewal_interval + self.timing.acquire_backoff,
                    );
                    return LeaseState::Released;
                }
                LeaseState::Owned
            }
            Ok(false) => self.lose(session, slot, "lease taken over or expired"),
            Err(err) => {
                metrics::LEASE_RENEW_FAILURES.inc();
                let now = Instant::now();
                let outcome = {
                    let mut state = slot.state.lock();
                    match state.info.as_mut() {
                        Some(info) => info.renew_failed(now, &self.timing, &liveness),
                        None => RenewFailure::GaveUp,
                    }
                };
                self.emit(LeaseEventKind::RenewFailed, session, Some(err.to_string()));
                match outcome {
                    RenewFailure::Uncertain { first } => {
                        warn!(
                            session_id = %session,
                            instance_id = %self.node_id,
                            error = %err,
                            first,
                            "lease renewal failed, ownership uncertain"
                        );
                        LeaseState::Uncertain
                    }
                    RenewFailure::GaveUp => {
                        self.lose(session, slot, "uncertain for too long")
                    }
                }
            }
        }
    }

    /// Drop a lease this node no longer owns, without touching the store.
    fn lose(&self, session: &SessionId, slot: &SessionSlot, reason: &str) -> LeaseState {
        let was_held = {
            let mut state = slot.state.lock();
            let held = state.info.is_some();
            state.info = None;
            state.record = None;
            held
        };
        if was_held {
            metrics::LEASES_HELD.dec();
        }
        metrics::LEASE_EXPIRED.inc();
        warn!(session_id = %session, instance_id = %self.node_id, reason, "lease lost");
        self.emit(LeaseEventKind::Expired, session, Some(reason.to_owned()));
        LeaseState::Released
    }

    /// A healthy lease is handed to the preferred owner only once that node
    /// reports itself Online.
    async fn should_hand_off(&self, session: &SessionId) -> bool {
        let preferred = match self.assigner.preferred_owner(session).await {
            Ok(Some(preferred)) if preferred != self.node_id => preferred,
            _ => return false,
        };
        match self.registrar.check_node_ready(&preferred).await {
            Ok(true) => true,
            Ok(false) => {
                debug!(session_id = %session, preferred_owner = %preferred, "preferred owner not online, keeping lease");
                false
            }
            Err(err) => {
                debug!(session_id = %session, preferred_owner = %preferred, error = %err, "preferred owner unavailable, keeping lease");
                false
            }
        }
    }

    /// Graceful release. The local transition is immediate; deleting the
    /// store record is best effort.
    pub async fn release(&self, session: &SessionId) -> LeaseState {
        let Some(slot) = self.existing_slot(session) else {
            return LeaseState::Unowned;
        };
        let _op = slot.op.lock().await;
        self.release_locked(session, &slot, "graceful").await
    }

    async fn release_locked(&self, session: &SessionId, slot: &SessionSlot, reason: &str) -> LeaseState {
        let held = {
            let mut state = slot.state.lock();
            let held = state.is_held();
            state.info = None;
            state.record = None;
            held
        };
        if !held {
            return LeaseState::Unowned;
        }
        metrics::LEASES_HELD.dec();
        metrics::LEASE_RELEASES.inc();

        let key = self.keys.lease_key(session);
        match with_timeout(
            self.timing.store_timeout,
            "lease release",
            self.store.compare_and_delete(&key, &self.node_id),
        )
        .await
        {
            Ok(true) => debug!(session_id = %session, "lease record deleted"),
            Ok(false) => debug!(session_id = %session, "lease record already gone or reassigned"),
            Err(err) => warn!(session_id = %session, error = %err, "failed to delete lease record"),
        }
        info!(session_id = %session, instance_id = %self.node_id, reason, "lease released");
        self.emit(LeaseEventKind::Released, session, None);
        LeaseState::Released
    }

    // -----------------------------------------------------------------------
    // Tracking
    // -----------------------------------------------------------------------

    /// Start the maintenance loop for `session`. Returns false if already
    /// tracked or the manager is shutting down.
    pub fn track(self: &Arc<Self>, session: SessionId) -> bool {
        if self.token.is_cancelled() {
            return false;
        }
        let token = {
            let mut loops = self.loops.lock();
            if loops.contains_key(&session) {
                return false;
            }
            let token = self.token.child_token();
            loops.insert(session.clone(), token.clone());
            token
        };
        let this = Arc::clone(self);
        tokio::spawn(async move { this.maintain(session, token).await });
        true
    }

    /// Stop maintaining `session` and release it if held.
    pub async fn untrack(&self, session: &SessionId) -> bool {
        let Some(token) = self.loops.lock().remove(session) else {
            return false;
        };
        token.cancel();
        if let Some(slot) = self.existing_slot(session) {
            let _op = slot.op.lock().await;
            self.release_locked(session, &slot, "untracked").await;
            slot.state.lock().retired = true;
            self.slots.write().remove(session);
        }
        debug!(session_id = %session, "session untracked");
        true
    }

    async fn maintain(self: Arc<Self>, session: SessionId, token: CancellationToken) {
        debug!(session_id = %session, "lease maintenance started");
        let mut next = Instant::now();
        loop {
            // also wake for an uncertain give-up deadline or an expiring deferral
            let early = self.pending_deadline(&session);
            tokio::select! {
                biased;
                _ = token.cancelled() => break,
                _ = tokio::time::sleep_until(next) => {}
                _ = sleep_until_opt(early), if early.is_some() => {}
            }
            let state = self.try_acquire_or_renew(&session).await;
            let cadence = if state.is_held() {
                self.timing.renewal_interval
            } else {
                self.timing.acquire_interval()
            };
            next = Instant::now() + cadence;
        }
        debug!(session_id = %session, "lease maintenance stopped");
    }

    fn pending_deadline(&self, session: &SessionId) -> Option<Instant> {
        let slot = self.existing_slot(session)?;
        let liveness = self.registrar.liveness();
        let state = slot.state.lock();
        let now = Instant::now();
        match state.info.as_ref() {
            Some(info) if info.state == LeaseState::Uncertain => {
                info.active_until(&self.timing, &liveness)
            }
            Some(_) => None,
            None => state.defer_until,
        }
        .filter(|d| *d > now)
    }

    /// Reconcile tracked sessions with the registry.
    pub async fn sync_sessions(self: &Arc<Self>, registry: &dyn SessionRegistry) -> CoordinationResult<()> {
        let desired: HashSet<SessionId> = registry.list().await?.into_iter().collect();
        let tracked: HashSet<SessionId> = self.tracked_sessions().into_iter().collect();
        let mut added = 0usize;
        for session in desired.difference(&tracked) {
            if self.track(session.clone()) {
                added += 1;
            }
        }
        let mut removed = 0usize;
        for session in tracked.difference(&desired) {
            if self.untrack(session).await {
                removed += 1;
            }
        }
        if added > 0 || removed > 0 {
            info!(added, removed, tracked = desired.len(), "session set reconciled");
        }
        Ok(())
    }

    /// Spawn the periodic reconciliation against `registry`.
    pub fn spawn_session_sync(self: &Arc<Self>, registry: Arc<dyn SessionRegistry>) -> JoinHandle<()> {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(this.timing.session_sync_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    biased;
                    _ = this.token.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(err) = this.sync_sessions(registry.as_ref()).await {
                            warn!(error = %err, "session registry sync failed");
                        }
                    }
                }
            }
        })
    }

    // -----------------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------------

    /// Register this node and start the liveness loop. A failed first
    /// registration is returned to the caller and must abort startup.
    pub async fn start(self: &Arc<Self>) -> CoordinationResult<JoinHandle<()>> {
        self.registrar.register().await?;
        if let Err(err) = self.registrar.refresh_cache().await {
            debug!(error = %err, "initial node discovery failed");
        }
        info!(instance_id = %self.node_id, "lease manager started");
        Ok(self.registrar.start(&self.token))
    }

    /// Write, read back and delete a probe key. Must pass before the node
    /// reports healthy.
    pub async fn verify_store(&self) -> CoordinationResult<()> {
        let nonce = uuid::Uuid::new_v4().simple().to_string();
        let key = self.keys.probe_key(&nonce);
        let value = format!("pollkeeper-selftest-{nonce}");
        let limit = self.timing.store_timeout;

        with_timeout(
            limit,
            "selftest put",
            self.store
                .put(&key, &self.node_id, value.clone(), self.timing.lease_ttl),
        )
        .await?;
        let stored = with_timeout(limit, "selftest get", self.store.get(&key))
            .await?
            .ok_or_else(|| {
                CoordinationError::Protocol(format!("selftest get returned no value for '{key}'"))
            })?;
        if stored.value != value || stored.owner != self.node_id {
            return Err(CoordinationError::Protocol(format!(
                "selftest value mismatch for '{key}'"
            )));
        }
        let deleted = with_timeout(
            limit,
            "selftest delete",
            self.store.compare_and_delete(&key, &self.node_id),
        )
        .await?;
        if !deleted {
            return Err(CoordinationError::Protocol(format!(
                "selftest owner-conditional delete refused for '{key}'"
            )));
        }
        info!(key = %key, "lease store write selftest passed");
        Ok(())
    }

    /// Stop all loops, release every held lease, then remove this node's
    /// liveness record.
    pub async fn shutdown(&self) {
        self.token.cancel();
        let sessions: Vec<SessionId> = self.slots.read().keys().cloned().collect();
        let released = futures::future::join_all(sessions.iter().map(|s| self.release(s)))
            .await
            .into_iter()
            .filter(|s| *s == LeaseState::Released)
            .count();
        self.loops.lock().clear();
        self.registrar.stop().await;
        info!(instance_id = %self.node_id, released, "lease manager stopped");
    }
}

fn jitter(max: Duration) -> Duration {
    let max_ms = max.as_millis().max(1) as u64;
    let ms = rand::thread_rng().gen_range(max_ms / 2..=max_ms);
    Duration::from_millis(ms)
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
