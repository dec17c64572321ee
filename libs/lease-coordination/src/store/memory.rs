//! In-process [`LeaseStore`].
//!
//! Expiry is measured with `tokio::time::Instant`, so tests running on a
//! paused clock see TTLs lapse as virtual time advances. Each handle obtained
//! through [`MemoryStore::client`] shares the entries but has its own fault
//! switches, which lets a fleet simulation partition or slow down one node.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::trace;

use crate::error::{CoordinationError, CoordinationResult};
use crate::models::NodeId;
use crate::store::{LeaseStore, Precondition, StoreEntry};

#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<BTreeMap<String, MemoryEntry>>>,
    faults: Arc<Mutex<FaultPlan>>,
}

#[derive(Debug, Clone)]
struct MemoryEntry {
    owner: NodeId,
    value: String,
    expires_at: Instant,
}

impl MemoryEntry {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at > now
    }

    fn to_entry(&self) -> StoreEntry {
        StoreEntry {
            owner: self.owner.clone(),
            value: self.value.clone(),
        }
    }
}

/// Faults applied to calls made through one handle.
#[derive(Debug, Clone, Copy, Default)]
struct FaultPlan {
    /// every call fails with a transport error
    unavailable: bool,
    /// delay before the call takes effect
    latency: Duration,
    /// delay after the call took effect, before the caller sees the result
    ack_delay: Duration,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// A new handle onto the same entries with its own fault switches.
    pub fn client(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
            faults: Arc::default(),
        }
    }

    /// Make every call through this handle fail with a transport error.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.faults.lock().unavailable = unavailable;
    }

    /// Delay calls through this handle before they take effect.
    pub fn set_latency(&self, latency: Duration) {
        self.faults.lock().latency = latency;
    }

    /// Delay results through this handle after the call took effect.
    pub fn set_ack_delay(&self, delay: Duration) {
        self.faults.lock().ack_delay = delay;
    }

    /// Number of unexpired entries.
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.inner.lock().values().filter(|e| e.is_live(now)).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    async fn enter(&self, op: &str, key: &str) -> CoordinationResult<FaultPlan> {
        let plan = *self.faults.lock();
        if !plan.latency.is_zero() {
            tokio::time::sleep(plan.latency).await;
        }
        if plan.unavailable {
            return Err(CoordinationError::Transport(format!(
                "memory store unavailable for {op} on '{key}'"
            )));
        }
        Ok(plan)
    }

    async fn leave(plan: FaultPlan) {
        if !plan.ack_delay.is_zero() {
            tokio::time::sleep(plan.ack_delay).await;
        }
    }
}

#[async_trait]
impl LeaseStore for MemoryStore {
    async fn get(&self, key: &str) -> CoordinationResult<Option<StoreEntry>> {
        let plan = self.enter("get", key).await?;
        let now = Instant::now();
        let found = self
            .inner
            .lock()
            .get(key)
            .filter(|e| e.is_live(now))
            .map(MemoryEntry::to_entry);
        Self::leave(plan).await;
        Ok(found)
    }

    async fn compare_and_set(
        &self,
        key: &str,
        expected: &Precondition,
        owner: &NodeId,
        value: String,
        ttl: Duration,
    ) -> CoordinationResult<bool> {
        let plan = self.enter("compare_and_set", key).await?;
        let applied = {
            let mut guard = self.inner.lock();
            let now = Instant::now();
            let current = guard.get(key).filter(|e| e.is_live(now));
            let holds = match (expected, current) {
                (Precondition::Absent, None) => true,
                (Precondition::Owner(want), Some(entry)) => entry.owner == *want,
                _ => false,
            };
            if holds {
                guard.insert(
                    key.to_owned(),
                    MemoryEntry {
                        owner: owner.clone(),
                        value,
                        expires_at: now + ttl,
                    },
                );
            }
            holds
        };
        trace!(key, ?expected, %owner, applied, "memory compare_and_set");
        Self::leave(plan).await;
        Ok(applied)
    }

    async fn compare_and_delete(&self, key: &str, owner: &NodeId) -> CoordinationResult<bool> {
        let plan = self.enter("compare_and_delete", key).await?;
        let removed = {
            let mut guard = self.inner.lock();
            let now = Instant::now();
            let matches = guard
                .get(key)
                .is_some_and(|e| e.is_live(now) && e.owner == *owner);
            if matches {
                guard.remove(key);
            }
            matches
        };
        Self::leave(plan).await;
        Ok(removed)
    }

    async fn put(
        &self,
        key: &str,
        owner: &NodeId,
        value: String,
        ttl: Duration,
    ) -> CoordinationResult<()> {
        let plan = self.enter("put", key).await?;
        self.inner.lock().insert(
            key.to_owned(),
            MemoryEntry {
                owner: owner.clone(),
                value,
                expires_at: Instant::now() + ttl,
            },
        );
        Self::leave(plan).await;
        Ok(())
    }

    async fn delete(&self, key: &str) -> CoordinationResult<()> {
        let plan = self.enter("delete", key).await?;
        self.inner.lock().remove(key);
        Self::leave(plan).await;
        Ok(())
    }

    async fn list(&self, prefix: &str) -> CoordinationResult<Vec<(String, StoreEntry)>> {
        let plan = self.enter("list", prefix).await?;
        let entries = {
            let mut guard = self.inner.lock();
            let now = Instant::now();
            guard.retain(|_, e| e.is_live(now));
            guard
                .range(prefix.to_owned()..)
                .take_while(|(k, _)| k.starts_with(prefix))
                .map(|(k, e)| (k.clone(), e.to_entry()))
                .collect()
        };
        Self::leave(plan).await;
        Ok(entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TTL: Duration = Duration::from_secs(10);

    fn node(id: &str) -> NodeId {
        NodeId::from(id)
    }

    #[tokio::test(start_paused = true)]
    async fn test_cas_absent_then_owner() {
        let store = MemoryStore::new();
        let a = node("a");
        let b = node("b");

        assert!(
            store
                .compare_and_set("k", &Precondition::Absent, &a, "1".into(), TTL)
                .await
                .unwrap()
        );
        // second absent-create loses
        assert!(
            !store
                .compare_and_set("k", &Precondition::Absent, &b, "2".into(), TTL)
                .await
                .unwrap()
        );
        // owner-conditional by the wrong owner loses
        assert!(
            !store
                .compare_and_set("k", &Precondition::Owner(b.clone()), &b, "2".into(), TTL)
                .await
                .unwrap()
        );
        assert!(
            store
                .compare_and_set("k", &Precondition::Owner(a.clone()), &a, "3".into(), TTL)
                .await
                .unwrap()
        );
        let entry = store.get("k").await.unwrap().unwrap();
        assert_eq!(entry.owner, a);
        assert_eq!(entry.value, "3");
    }

    #[tokio::test(start_paused = true)]
    async fn test_entries_expire() {
        let store = MemoryStore::new();
        let a = node("a");
        store.put("k", &a, "v".into(), TTL).await.unwrap();
        tokio::time::advance(TTL - Duration::from_millis(1)).await;
        assert!(store.get("k").await.unwrap().is_some());
        tokio::time::advance(Duration::from_millis(1)).await;
        assert!(store.get("k").await.unwrap().is_none());

        // an expired entry no longer satisfies Owner, but satisfies Absent
        assert!(
            !store
                .compare_and_set("k", &Precondition::Owner(a.clone()), &a, "v".into(), TTL)
                .await
                .unwrap()
        );
        assert!(
            store
                .compare_and_set("k", &Precondition::Absent, &node("b"), "v".into(), TTL)
                .await
                .unwrap()
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_compare_and_delete_checks_owner() {
        let store = MemoryStore::new();
        store.put("k", &node("a"), "v".into(), TTL).await.unwrap();
        assert!(!store.compare_and_delete("k", &node("b")).await.unwrap());
        assert!(store.compare_and_delete("k", &node("a")).await.unwrap());
        assert!(store.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_list_by_prefix() {
        let store = MemoryStore::new();
        let a = node("a");
        store.put("poll.node.a", &a, "1".into(), TTL).await.unwrap();
        store
            .put("poll.node.b", &a, "2".into(), Duration::from_secs(1))
            .await
            .unwrap();
        store.put("poll.lease.s", &a, "3".into(), TTL).await.unwrap();
        tokio::time::advance(Duration::from_secs(2)).await;

        let listed = store.list("poll.node.").await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].0, "poll.node.a");
    }

    #[tokio::test(start_paused = true)]
    async fn test_client_faults_are_per_handle() {
        let store = MemoryStore::new();
        let partitioned = store.client();
        partitioned.set_unavailable(true);

        let err = partitioned.get("k").await.unwrap_err();
        assert!(err.is_retryable());

        store.put("k", &node("a"), "v".into(), TTL).await.unwrap();
        partitioned.set_unavailable(false);
        assert!(partitioned.get("k").await.unwrap().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_ack_delay_applies_before_returning() {
        let store = MemoryStore::new();
        let slow = store.client();
        slow.set_ack_delay(Duration::from_secs(5));
        let res = tokio::time::timeout(
            Duration::from_secs(1),
            slow.put("k", &node("a"), "v".into(), TTL),
        )
        .await;
        assert!(res.is_err());
        // the write landed even though the caller gave up
        assert!(store.get("k").await.unwrap().is_some());
    }
}
