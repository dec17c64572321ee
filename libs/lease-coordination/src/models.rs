//! Typed models and codecs for records kept in the shared store.
//!
//! Records are JSON with snake_case keys. Timestamps on the wire are
//! wall-clock UTC and are only used for reporting; expiry decisions are made
//! from store TTLs and local monotonic instants.

use std::time::{SystemTime, UNIX_EPOCH};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{CoordinationError, CoordinationResult};

// ---------------------------------------------------------------------------
// Identifiers
// ---------------------------------------------------------------------------

/// Identity of one running node in the fleet.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(String);

impl NodeId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Use `name` if it is non-empty, otherwise build a unique id of the form
    /// `{hostname}-{unix_nanos}-{8 hex chars}`.
    pub fn generate(name: Option<&str>) -> Self {
        if let Some(name) = name.map(str::trim).filter(|n| !n.is_empty()) {
            return Self(name.to_owned());
        }
        let host = gethostname::gethostname().to_string_lossy().into_owned();
        let host = if host.trim().is_empty() {
            "node".to_owned()
        } else {
            host
        };
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or_default();
        let suffix = uuid::Uuid::new_v4().simple().to_string();
        Self(format!("{host}-{nanos}-{}", &suffix[..8]))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for NodeId {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

/// Identity of one polled session.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SessionId {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

impl From<String> for SessionId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

// ---------------------------------------------------------------------------
// Lease record
// ---------------------------------------------------------------------------

/// Shared lease record, one per session key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaseRecord {
    pub owner_id: NodeId,
    pub acquired_at: DateTime<Utc>,
    pub last_renewed_at: DateTime<Utc>,
}

impl LeaseRecord {
    /// A fresh record for a new acquisition.
    pub fn acquired(owner_id: NodeId, at: DateTime<Utc>) -> Self {
        Self {
            owner_id,
            acquired_at: at,
            last_renewed_at: at,
        }
    }

    /// The same record with only `last_renewed_at` moved forward.
    pub fn renewed(&self, at: DateTime<Utc>) -> Self {
        Self {
            owner_id: self.owner_id.clone(),
            acquired_at: self.acquired_at,
            last_renewed_at: at,
        }
    }
}

// ---------------------------------------------------------------------------
// Liveness record
// ---------------------------------------------------------------------------

/// Self-reported readiness of a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeStatus {
    /// Registered but still inside its startup grace; does not take new leases.
    Initializing,
    Online,
}

impl std::fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NodeStatus::Initializing => write!(f, "initializing"),
            NodeStatus::Online => write!(f, "online"),
        }
    }
}

/// Liveness record, one per node key, refreshed with a TTL.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LivenessRecord {
    pub node_id: NodeId,
    pub status: NodeStatus,
    pub startup_time: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Lease events
// ---------------------------------------------------------------------------

/// Kinds of lease transitions published to subscribers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LeaseEventKind {
    /// Acquired a session that had no live record.
    Acquired,
    /// Lost an acquisition race or the store failed during acquisition.
    AcquireFailed,
    Renewed,
    /// A renewal failed without proving loss of ownership.
    RenewFailed,
    /// Ownership was given up gracefully.
    Released,
    /// Ownership was lost: renewal was rejected or the uncertainty deadline passed.
    Expired,
    /// Reclaimed a stale lease from a node that is no longer live.
    TakenOver,
}

impl LeaseEventKind {
    /// Returns true for kinds after which this node holds the lease.
    pub fn is_gain(&self) -> bool {
        matches!(self, LeaseEventKind::Acquired | LeaseEventKind::TakenOver)
    }

    /// Returns true for kinds after which this node no longer holds the lease.
    pub fn is_loss(&self) -> bool {
        matches!(self, LeaseEventKind::Released | LeaseEventKind::Expired)
    }
}

impl std::fmt::Display for LeaseEventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LeaseEventKind::Acquired => write!(f, "acquired"),
            LeaseEventKind::AcquireFailed => write!(f, "acquire_failed"),
            LeaseEventKind::Renewed => write!(f, "renewed"),
            LeaseEventKind::RenewFailed => write!(f, "renew_failed"),
            LeaseEventKind::Released => write!(f, "released"),
            LeaseEventKind::Expired => write!(f, "expired"),
            LeaseEventKind::TakenOver => write!(f, "taken_over"),
        }
    }
}

/// Observable lease transition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaseEvent {
    pub kind: LeaseEventKind,
    pub session_id: SessionId,
    pub instance_id: NodeId,
    pub at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

// ---------------------------------------------------------------------------
// Codec helpers
// ---------------------------------------------------------------------------

/// Encode a record to its JSON store payload.
pub fn encode<T: Serialize>(value: &T) -> CoordinationResult<String> {
    serde_json::to_string(value).map_err(|e| CoordinationError::Codec(e.to_string()))
}

/// Decode a JSON store payload into a typed record.
pub fn decode<T: for<'de> Deserialize<'de>>(data: &str) -> CoordinationResult<T> {
    serde_json::from_str(data).map_err(|e| CoordinationError::Codec(e.to_string()))
}
