//! Ownership assignment: who should try to take a session.
//!
//! The preferred owner is a rendezvous (highest random weight) hash over the
//! live-node set. It is advisory: a healthy lease is never taken from a live
//! owner, preference only decides who goes first when a lease is free or
//! stale.

use std::hash::Hasher;
use std::sync::Arc;

use config::LeaseConfig;
use siphasher::sip::SipHasher13;
use tracing::debug;

use crate::error::CoordinationResult;
use crate::keys::KeyResolver;
use crate::liveness::LivenessRegistrar;
use crate::models::{self, LeaseRecord, NodeId, NodeStatus, SessionId};
use crate::store::{LeaseStore, Precondition, with_timeout};

/// Stable rendezvous weight of `node` for `session`. SipHash-1-3 with fixed
/// keys, so every node computes the same value on every build.
pub fn rendezvous_weight(node: &NodeId, session: &SessionId) -> u64 {
    let mut hasher = SipHasher13::new_with_keys(0, 0);
    hasher.write(node.as_str().as_bytes());
    hasher.write_u8(0xff);
    hasher.write(session.as_str().as_bytes());
    hasher.finish()
}

/// Highest-weight node for `session`; ties go to the smaller node id.
pub fn rendezvous_owner<'a>(session: &SessionId, nodes: &'a [NodeId]) -> Option<&'a NodeId> {
    nodes.iter().max_by(|a, b| {
        rendezvous_weight(a, session)
            .cmp(&rendezvous_weight(b, session))
            .then_with(|| b.cmp(a))
    })
}

/// Why an acquisition is not attempted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    /// This node is still inside its startup grace.
    Initializing,
    /// The lease is held by a live node.
    HeldBy(NodeId),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    /// Try to acquire with the given compare-and-set precondition.
    Acquire(Precondition),
    Skip(SkipReason),
}

impl Decision {
    pub fn is_acquire(&self) -> bool {
        matches!(self, Decision::Acquire(_))
    }
}

#[derive(Debug)]
pub struct OwnershipAssigner {
    node_id: NodeId,
    store: Arc<dyn LeaseStore>,
    registrar: Arc<LivenessRegistrar>,
    keys: KeyResolver,
    timing: LeaseConfig,
}

impl OwnershipAssigner {
    pub fn new(
        store: Arc<dyn LeaseStore>,
        registrar: Arc<LivenessRegistrar>,
        keys: KeyResolver,
        timing: LeaseConfig,
    ) -> Self {
        Self {
            node_id: registrar.node_id().clone(),
            store,
            registrar,
            keys,
            timing,
        }
    }

    /// Current lease record, `None` when absent or expired.
    pub async fn get_lease_value(&self, session: &SessionId) -> CoordinationResult<Option<LeaseRecord>> {
        let key = self.keys.lease_key(session);
        let entry = with_timeout(self.timing.store_timeout, "lease read", self.store.get(&key)).await?;
        entry.map(|e| models::decode(&e.value)).transpose()
    }

    /// Owner of the current lease record; derived from the value view.
    pub async fn get_lease_owner(&self, session: &SessionId) -> CoordinationResult<Option<NodeId>> {
        Ok(self.get_lease_value(session).await?.map(|r| r.owner_id))
    }

    /// Preferred owner over the cached live-node set.
    pub async fn preferred_owner(&self, session: &SessionId) -> CoordinationResult<Option<NodeId>> {
        let nodes = self.registrar.cached_live_nodes().await?;
        Ok(rendezvous_owner(session, &nodes).cloned())
    }

    /// Preferred owner over a fresh listing of live nodes.
    pub async fn preferred_owner_now(&self, session: &SessionId) -> CoordinationResult<Option<NodeId>> {
        let nodes = self.registrar.get_live_nodes().await?;
        Ok(rendezvous_owner(session, &nodes).cloned())
    }

    pub async fn should_acquire(&self, session: &SessionId) -> CoordinationResult<bool> {
        Ok(self.decide(session).await?.is_acquire())
    }

    /// Decide whether to attempt acquisition and under which precondition.
    ///
    /// A record tagged with this node is re-claimed even while initializing;
    /// otherwise an initializing node takes nothing new. A missing record, or
    /// one whose owner has no liveness record, may be claimed. Anything held
    /// by a live node is left alone.
    pub async fn decide(&self, session: &SessionId) -> CoordinationResult<Decision> {
        let record = self.get_lease_value(session).await?;
        let decision = match record {
            Some(record) if record.owner_id == self.node_id => {
                Decision::Acquire(Precondition::Owner(record.owner_id))
            }
            _ if self.registrar.status() == NodeStatus::Initializing => {
                Decision::Skip(SkipReason::Initializing)
            }
            None => Decision::Acquire(Precondition::Absent),
            Some(record) => {
                if self.registrar.is_node_live(&record.owner_id).await? {
                    Decision::Skip(SkipReason::HeldBy(record.owner_id))
                } else {
                    debug!(
                        session_id = %session,
                        stale_owner = %record.owner_id,
                        "lease owner is not live"
                    );
                    Decision::Acquire(Precondition::Owner(record.owner_id))
                }
            }
        };
        Ok(decision)
    }
}
