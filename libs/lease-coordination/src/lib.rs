//! # lease-coordination
//!
//! Keeps every configured session polled by exactly one node of a fleet,
//! coordinated only through TTL'd records in a shared key-value store.
//!
//! This library provides:
//! - **Liveness registrar** refreshing this node's record and deriving the
//!   live-node set from unexpired records.
//! - **Ownership assigner** choosing a rendezvous-hashed preferred owner and
//!   deciding when a free or stale lease may be claimed.
//! - **Lease state machine** per session (Unowned, Acquiring, Owned,
//!   Uncertain, Released) with a bounded grace on failed renewals.
//! - **Lease manager** facade with the polling gate, maintenance loops,
//!   release and shutdown.
//! - **Store backings**: NATS JetStream KV and an in-process store with fault
//!   injection for tests.
//!
//! ## Safety
//!
//! At most one node sees the polling gate open for a session at any time.
//! All claims go through the store's compare-and-set, and a node stops
//! treating a lease as owned before any other node could consider it stale.

pub mod assigner;
pub mod error;
pub mod keys;
pub mod liveness;
pub mod manager;
pub mod metrics;
pub mod models;
pub mod registry;
pub mod state;
pub mod store;
pub mod supervisor;

pub use assigner::{Decision, OwnershipAssigner, SkipReason, rendezvous_owner};
pub use error::{CoordinationError, CoordinationResult};
pub use keys::KeyResolver;
pub use liveness::{LivenessRegistrar, LivenessView};
pub use manager::{LeaseManager, LeaseSnapshot};
pub use models::{
    LeaseEvent, LeaseEventKind, LeaseRecord, LivenessRecord, NodeId, NodeStatus, SessionId,
};
pub use registry::{SessionRegistry, StaticRegistry};
pub use state::{LeaseState, LocalLeaseInfo, wall_clock};
pub use store::{LeaseStore, MemoryStore, NatsClient, Precondition, StoreEntry, Stores};
pub use supervisor::{Poller, Supervisor};
