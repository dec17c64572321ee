//! Shared lease store abstraction.
//!
//! Every node reaches the same store. Records carry an owner tag so that
//! writes can be made conditional on who currently holds a key; entries past
//! their TTL read as absent.

use std::{future::Future, sync::Arc, time::Duration};

use async_trait::async_trait;
use config::{LeaseConfig, StoreConfig};
use tracing::info;

use crate::error::{CoordinationError, CoordinationResult};
use crate::metrics;
use crate::models::NodeId;

pub mod client;
pub mod memory;
pub mod nats;

pub use client::NatsClient;
pub use memory::MemoryStore;
pub use nats::NatsKvStore;

/// What must be true of a key for a conditional write to apply.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Precondition {
    /// No unexpired entry exists.
    Absent,
    /// An unexpired entry exists and is tagged with this owner.
    Owner(NodeId),
}

/// An unexpired entry as read from the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreEntry {
    pub owner: NodeId,
    pub value: String,
}

#[async_trait]
pub trait LeaseStore: Send + Sync + std::fmt::Debug + 'static {
    /// Read an unexpired entry.
    async fn get(&self, key: &str) -> CoordinationResult<Option<StoreEntry>>;

    /// Atomically write `value` tagged with `owner` if `expected` holds.
    /// Returns `Ok(false)` when the precondition does not hold.
    async fn compare_and_set(
        &self,
        key: &str,
        expected: &Precondition,
        owner: &NodeId,
        value: String,
        ttl: Duration,
    ) -> CoordinationResult<bool>;

    /// Delete the entry only if it is tagged with `owner`.
    async fn compare_and_delete(&self, key: &str, owner: &NodeId) -> CoordinationResult<bool>;

    /// Unconditional write, only used for records a single node ever writes.
    async fn put(
        &self,
        key: &str,
        owner: &NodeId,
        value: String,
        ttl: Duration,
    ) -> CoordinationResult<()>;

    async fn delete(&self, key: &str) -> CoordinationResult<()>;

    /// All unexpired entries whose key starts with `prefix`.
    async fn list(&self, prefix: &str) -> CoordinationResult<Vec<(String, StoreEntry)>>;
}

/// Bound a store call by `limit`, mapping an elapsed deadline to
/// [`CoordinationError::Timeout`].
pub async fn with_timeout<T, F>(limit: Duration, op: &str, fut: F) -> CoordinationResult<T>
where
    F: Future<Output = CoordinationResult<T>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(res) => res,
        Err(_) => {
            metrics::STORE_TIMEOUTS.inc();
            Err(CoordinationError::Timeout(format!(
                "{op} did not complete within {limit:?}"
            )))
        }
    }
}

/// Store handles for the two record families.
#[derive(Debug, Clone)]
pub struct Stores {
    pub leases: Arc<dyn LeaseStore>,
    pub nodes: Arc<dyn LeaseStore>,
    /// kept so the connection can be closed on shutdown
    pub client: Option<NatsClient>,
}

impl Stores {
    /// One in-process store serving both record families.
    pub fn memory(store: MemoryStore) -> Self {
        let store: Arc<dyn LeaseStore> = Arc::new(store);
        Self {
            leases: Arc::clone(&store),
            nodes: store,
            client: None,
        }
    }

    /// Build the configured backing. For NATS this connects (with retries)
    /// and opens or creates both KV buckets; any failure is fatal to startup.
    pub async fn open(store: &StoreConfig, timing: &LeaseConfig) -> CoordinationResult<Self> {
        match store {
            StoreConfig::Memory => {
                info!("using in-process lease store");
                Ok(Self::memory(MemoryStore::new()))
            }
            StoreConfig::Nats(cfg) => {
                let client = NatsClient::new(cfg.clone());
                client.connect().await?;
                let skew = timing.max_clock_skew;
                let leases =
                    NatsKvStore::open(&client, &cfg.leases_bucket, timing.lease_ttl, skew).await?;
                let nodes =
                    NatsKvStore::open(&client, &cfg.nodes_bucket, timing.liveness_ttl, skew)
                        .await?;
                Ok(Self {
                    leases: Arc::new(leases),
                    nodes: Arc::new(nodes),
                    client: Some(client),
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_with_timeout_maps_elapsed() {
        let res: CoordinationResult<()> = with_timeout(Duration::from_secs(1), "get", async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(())
        })
        .await;
        assert!(res.unwrap_err().is_timeout());
    }

    #[tokio::test]
    async fn test_with_timeout_passes_result() {
        let res = with_timeout(Duration::from_secs(1), "get", async { Ok(7) }).await;
        assert_eq!(res.unwrap(), 7);
    }

    #[tokio::test]
    async fn test_memory_stores_share_one_backing() {
        let stores = Stores::memory(MemoryStore::new());
        let owner = NodeId::from("a");
        stores
            .nodes
            .put("k", &owner, "v".into(), Duration::from_secs(10))
            .await
            .unwrap();
        assert!(stores.leases.get("k").await.unwrap().is_some());
        assert!(stores.client.is_none());
    }
}
