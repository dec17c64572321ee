//! Lease coordination metrics.
//!
//! Metrics are lazily initialized on first access via `lazy_static!` and
//! registered with the default prometheus registry. Registration failures are
//! fatal (`.unwrap()`): a duplicate metric name is a programming error.

use lazy_static::lazy_static;
use prometheus::{IntCounter, IntGauge, register_int_counter, register_int_gauge};

lazy_static! {
    /// Count of sessions acquired from an absent record
    pub static ref LEASE_ACQUISITIONS: IntCounter = register_int_counter!(
        "lease_acquisitions",
        "count of session leases acquired from an absent record"
    ).unwrap();

    /// Count of stale leases reclaimed from nodes that are no longer live
    pub static ref LEASE_TAKEOVERS: IntCounter = register_int_counter!(
        "lease_takeovers",
        "count of stale session leases reclaimed"
    ).unwrap();

    /// Count of acquisition attempts that lost the compare-and-set race
    pub static ref LEASE_ACQUIRE_CONFLICTS: IntCounter = register_int_counter!(
        "lease_acquire_conflicts",
        "count of lease acquisitions rejected by compare-and-set"
    ).unwrap();

    /// Count of acquisition attempts that failed on a store error
    pub static ref LEASE_ACQUIRE_ERRORS: IntCounter = register_int_counter!(
        "lease_acquire_errors",
        "count of lease acquisitions that failed on a store error"
    ).unwrap();

    /// Count of successful renewals
    pub static ref LEASE_RENEWALS: IntCounter = register_int_counter!(
        "lease_renewals",
        "count of successful lease renewals"
    ).unwrap();

    /// Count of renewals that failed without proving loss of ownership
    pub static ref LEASE_RENEW_FAILURES: IntCounter = register_int_counter!(
        "lease_renew_failures",
        "count of lease renewals that failed transiently"
    ).unwrap();

    /// Count of leases given up gracefully
    pub static ref LEASE_RELEASES: IntCounter = register_int_counter!(
        "lease_releases",
        "count of leases released gracefully"
    ).unwrap();

    /// Count of leases lost to rejection or an elapsed uncertainty deadline
    pub static ref LEASE_EXPIRED: IntCounter = register_int_counter!(
        "lease_expired",
        "count of leases lost after rejection or uncertainty timeout"
    ).unwrap();

    /// Leases currently held (owned or uncertain) by this process
    pub static ref LEASES_HELD: IntGauge = register_int_gauge!(
        "leases_held",
        "session leases currently held by this process"
    ).unwrap();

    /// Live nodes seen by the last discovery refresh
    pub static ref LIVE_NODES: IntGauge = register_int_gauge!(
        "live_nodes",
        "live nodes seen by the last discovery refresh"
    ).unwrap();

    /// Count of liveness refresh writes that failed
    pub static ref HEARTBEAT_FAILURES: IntCounter = register_int_counter!(
        "heartbeat_failures",
        "count of failed liveness record refreshes"
    ).unwrap();

    /// Count of store calls that hit the store timeout
    pub static ref STORE_TIMEOUTS: IntCounter = register_int_counter!(
        "store_timeouts",
        "count of lease store calls that timed out"
    ).unwrap();

    /// Session pollers currently running in this process
    pub static ref ACTIVE_POLLERS: IntGauge = register_int_gauge!(
        "active_pollers",
        "session pollers currently running"
    ).unwrap();

    /// Count of session polls that returned an error
    pub static ref POLL_FAILURES: IntCounter = register_int_counter!(
        "poll_failures",
        "count of session polls that failed"
    ).unwrap();
}
