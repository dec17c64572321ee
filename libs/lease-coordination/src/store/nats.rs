//! [`LeaseStore`] backed by a JetStream KV bucket.
//!
//! Compare-and-set maps onto KV revisions: an absent key is claimed with
//! `create`, a held key is replaced with `update` against the revision that
//! was read. Values are wrapped in an envelope carrying the owner tag and an
//! expiry, because KV TTLs are per bucket (`max_age`) and purge lazily.
//!
//! Expiry is stamped with the writer's wall clock and checked against the
//! reader's. Node clocks are assumed to agree within `max_clock_skew`:
//! readers keep an envelope live until `expires_at + max_clock_skew`, and
//! the bucket `max_age` carries the same margin so the server never drops an
//! entry a reader would still honor. A writer whose clock runs further ahead
//! than that can lose its lease to a peer before its own gate closes.

use std::time::Duration;

use async_nats::jetstream::kv::{self, CreateErrorKind, Operation, UpdateErrorKind};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::TryStreamExt;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{CoordinationError, CoordinationResult};
use crate::models::{self, NodeId};
use crate::store::{LeaseStore, NatsClient, Precondition, StoreEntry};

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Envelope {
    owner: NodeId,
    expires_at: DateTime<Utc>,
    value: String,
}

impl Envelope {
    fn seal(owner: &NodeId, value: String, ttl: Duration) -> CoordinationResult<Vec<u8>> {
        let ttl = chrono::Duration::from_std(ttl)
            .map_err(|e| CoordinationError::Config(format!("ttl out of range: {e}")))?;
        let envelope = Envelope {
            owner: owner.clone(),
            expires_at: Utc::now() + ttl,
            value,
        };
        Ok(models::encode(&envelope)?.into_bytes())
    }

    /// Live while `now` is before `expires_at` plus the tolerated skew.
    fn is_live(&self, now: DateTime<Utc>, skew: chrono::Duration) -> bool {
        self.expires_at + skew > now
    }

    /// Decode a stored envelope, `None` once it has expired.
    fn open(
        value: &[u8],
        key: &str,
        now: DateTime<Utc>,
        skew: chrono::Duration,
    ) -> CoordinationResult<Option<Envelope>> {
        let text = std::str::from_utf8(value)
            .map_err(|e| CoordinationError::Codec(format!("key '{key}': {e}")))?;
        let envelope: Envelope = models::decode(text)?;
        Ok(envelope.is_live(now, skew).then_some(envelope))
    }
}

/// Decode the latest revision of a key; deleted, purged and expired
/// revisions read as `None`.
fn open_entry(
    entry: &kv::Entry,
    now: DateTime<Utc>,
    skew: chrono::Duration,
) -> CoordinationResult<Option<Envelope>> {
    if !matches!(entry.operation, Operation::Put) {
        return Ok(None);
    }
    Envelope::open(&entry.value, &entry.key, now, skew)
}

#[derive(Clone)]
pub struct NatsKvStore {
    kv: kv::Store,
    bucket: String,
    clock_skew: chrono::Duration,
}

impl NatsKvStore {
    /// Open (or create) `bucket`. Entries age out of the bucket after
    /// `ttl + max_clock_skew`.
    pub async fn open(
        client: &NatsClient,
        bucket: &str,
        ttl: Duration,
        max_clock_skew: Duration,
    ) -> CoordinationResult<Self> {
        let clock_skew = chrono::Duration::from_std(max_clock_skew)
            .map_err(|e| CoordinationError::Config(format!("max_clock_skew out of range: {e}")))?;
        let max_age = ttl.saturating_add(max_clock_skew);
        let kv = client.open_bucket(bucket, max_age).await?;
        info!(
            bucket,
            ttl_ms = ttl.as_millis(),
            max_age_ms = max_age.as_millis(),
            "opened lease KV bucket"
        );
        Ok(Self {
            kv,
            bucket: bucket.to_owned(),
            clock_skew,
        })
    }

    async fn entry(&self, key: &str) -> CoordinationResult<Option<kv::Entry>> {
        self.kv.entry(key).await.map_err(|e| {
            CoordinationError::Transport(format!(
                "KV read failed for key '{key}' in '{}': {e}",
                self.bucket
            ))
        })
    }

    async fn create(&self, key: &str, payload: Vec<u8>) -> CoordinationResult<bool> {
        match self.kv.create(key, payload.into()).await {
            Ok(_) => Ok(true),
            Err(e) if e.kind() == CreateErrorKind::AlreadyExists => Ok(false),
            Err(e) => Err(CoordinationError::Transport(format!(
                "KV create failed for key '{key}': {e}"
            ))),
        }
    }

    async fn update(&self, key: &str, payload: Vec<u8>, revision: u64) -> CoordinationResult<bool> {
        match self.kv.update(key, payload.into(), revision).await {
            Ok(_) => Ok(true),
            Err(e) if e.kind() == UpdateErrorKind::WrongLastRevision => Ok(false),
            Err(e) => Err(CoordinationError::Transport(format!(
                "KV update failed for key '{key}': {e}"
            ))),
        }
    }
}

impl std::fmt::Debug for NatsKvStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NatsKvStore")
            .field("bucket", &self.bucket)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl LeaseStore for NatsKvStore {
    async fn get(&self, key: &str) -> CoordinationResult<Option<StoreEntry>> {
        let Some(entry) = self.entry(key).await? else {
            return Ok(None);
        };
        Ok(open_entry(&entry, Utc::now(), self.clock_skew)?.map(|env| StoreEntry {
            owner: env.owner,
            value: env.value,
        }))
    }

    async fn compare_and_set(
        &self,
        key: &str,
        expected: &Precondition,
        owner: &NodeId,
        value: String,
        ttl: Duration,
    ) -> CoordinationResult<bool> {
        let payload = Envelope::seal(owner, value, ttl)?;
        let current = self.entry(key).await?;
        let live = match &current {
            Some(entry) => open_entry(entry, Utc::now(), self.clock_skew)?,
            None => None,
        };
        let applied = match (expected, current, live) {
            // key never written or fully aged out of the bucket
            (Precondition::Absent, None, _) => self.create(key, payload).await?,
            // tombstone or expired envelope still occupies the key
            (Precondition::Absent, Some(entry), None) => {
                self.update(key, payload, entry.revision).await?
            }
            (Precondition::Owner(want), Some(entry), Some(env)) if env.owner == *want => {
                self.update(key, payload, entry.revision).await?
            }
            _ => false,
        };
        debug!(bucket = %self.bucket, key, ?expected, applied, "KV compare_and_set");
        Ok(applied)
    }

    async fn compare_and_delete(&self, key: &str, owner: &NodeId) -> CoordinationResult<bool> {
        let Some(entry) = self.entry(key).await? else {
            return Ok(false);
        };
        match open_entry(&entry, Utc::now(), self.clock_skew)? {
            Some(env) if env.owner == *owner => {}
            _ => return Ok(false),
        }
        self.kv
            .delete_expect_revision(key, Some(entry.revision))
            .await
            .map_err(|e| {
                CoordinationError::Transport(format!("KV delete failed for key '{key}': {e}"))
            })?;
        Ok(true)
    }

    async fn put(
        &self,
        key: &str,
        owner: &NodeId,
        value: String,
        ttl: Duration,
    ) -> CoordinationResult<()> {
        let payload = Envelope::seal(owner, value, ttl)?;
        self.kv.put(key, payload.into()).await.map_err(|e| {
            CoordinationError::Transport(format!("KV write failed for key '{key}': {e}"))
        })?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> CoordinationResult<()> {
        self.kv.delete(key).await.map_err(|e| {
            CoordinationError::Transport(format!("KV delete failed for key '{key}': {e}"))
        })
    }

    async fn list(&self, prefix: &str) -> CoordinationResult<Vec<(String, StoreEntry)>> {
        let mut keys = self.kv.keys().await.map_err(|e| {
            CoordinationError::Transport(format!("failed to list KV keys in '{}': {e}", self.bucket))
        })?;

        let mut matching = Vec::new();
        while let Some(key) = keys.try_next().await.map_err(|e| {
            CoordinationError::Transport(format!("failed reading KV keys in '{}': {e}", self.bucket))
        })? {
            if key.starts_with(prefix) {
                matching.push(key);
            }
        }

        let now = Utc::now();
        let mut out = Vec::with_capacity(matching.len());
        for key in matching {
            let Some(entry) = self.entry(&key).await? else {
                continue;
            };
            if let Some(env) = open_entry(&entry, now, self.clock_skew)? {
                out.push((
                    key,
                    StoreEntry {
                        owner: env.owner,
                        value: env.value,
                    },
                ));
            }
        }
        Ok(out)
    }
}
