//! Per-session lease state machine.
//!
//! Transitions are pure functions of the current info and an explicit `now`;
//! the manager performs the store calls and feeds the outcome in here. All
//! instants are monotonic (`tokio::time::Instant`) and only converted to wall
//! clock for reporting.

use std::time::Duration;

use chrono::{DateTime, Utc};
use config::LeaseConfig;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::liveness::LivenessView;
use crate::models::SessionId;

/// Local lease state for one session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LeaseState {
    Unowned,
    Acquiring,
    Owned,
    /// A renewal failed without proving loss; still polling until the deadline.
    Uncertain,
    Released,
}

impl LeaseState {
    /// Owned or Uncertain.
    pub fn is_held(&self) -> bool {
        matches!(self, LeaseState::Owned | LeaseState::Uncertain)
    }
}

impl std::fmt::Display for LeaseState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LeaseState::Unowned => write!(f, "unowned"),
            LeaseState::Acquiring => write!(f, "acquiring"),
            LeaseState::Owned => write!(f, "owned"),
            LeaseState::Uncertain => write!(f, "uncertain"),
            LeaseState::Released => write!(f, "released"),
        }
    }
}

/// Outcome of a failed renewal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenewFailure {
    /// Now Uncertain; `first` is set on the Owned -> Uncertain edge.
    Uncertain { first: bool },
    /// The deadline passed; now Released.
    GaveUp,
}

/// Node-local view of one session lease. Never shared across nodes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalLeaseInfo {
    pub session_id: SessionId,
    pub state: LeaseState,
    pub acquired_at: Option<Instant>,
    pub last_renewed_at: Option<Instant>,
    pub uncertain_since: Option<Instant>,
    /// liveness epoch the lease was acquired under
    pub epoch: u64,
}

impl LocalLeaseInfo {
    /// Info for a session an acquisition attempt is starting on.
    pub fn acquiring(session_id: SessionId, epoch: u64) -> Self {
        Self {
            session_id,
            state: LeaseState::Acquiring,
            acquired_at: None,
            last_renewed_at: None,
            uncertain_since: None,
            epoch,
        }
    }

    /// Acquiring -> Owned. `at` is when the winning write was issued.
    pub fn acquired(&mut self, at: Instant) {
        debug_assert_eq!(self.state, LeaseState::Acquiring);
        self.state = LeaseState::Owned;
        self.acquired_at = Some(at);
        self.last_renewed_at = Some(at);
        self.uncertain_since = None;
        self.check();
    }

    /// Owned/Uncertain -> Owned. Returns true if this re-confirmed an
    /// uncertain lease. `acquired_at` is left alone.
    pub fn renewed(&mut self, at: Instant) -> bool {
        debug_assert!(self.state.is_held());
        let reconfirmed = self.state == LeaseState::Uncertain;
        self.state = LeaseState::Owned;
        self.last_renewed_at = Some(at);
        self.uncertain_since = None;
        self.check();
        reconfirmed
    }

    /// Feed a renewal that failed without proving loss of ownership.
    pub fn renew_failed(
        &mut self,
        now: Instant,
        timing: &LeaseConfig,
        liveness: &LivenessView,
    ) -> RenewFailure {
        debug_assert!(self.state.is_held());
        let first = self.state == LeaseState::Owned;
        if first {
            self.state = LeaseState::Uncertain;
            self.uncertain_since = Some(now);
        }
        self.check();
        match self.active_until(timing, liveness) {
            Some(deadline) if now < deadline => RenewFailure::Uncertain { first },
            _ => {
                self.release();
                RenewFailure::GaveUp
            }
        }
    }

    /// Any state -> Released.
    pub fn release(&mut self) {
        self.state = LeaseState::Released;
        self.uncertain_since = None;
        self.check();
    }

    /// The instant the polling gate closes, `None` when nothing is held.
    ///
    /// Bounded by the lease TTL since the last successful renewal, by the
    /// uncertainty grace once a renewal has failed, and by this node's own
    /// liveness deadline.
    pub fn active_until(&self, timing: &LeaseConfig, liveness: &LivenessView) -> Option<Instant> {
        if !self.state.is_held() {
            return None;
        }
        let mut deadline = self.last_renewed_at? + timing.lease_ttl;
        if let Some(since) = self.uncertain_since {
            deadline = deadline.min(since + timing.uncertain_grace_period);
        }
        Some(deadline.min(liveness.deadline))
    }

    /// Polling gate: held, under the current liveness epoch, and before the
    /// deadline.
    pub fn is_active(&self, now: Instant, timing: &LeaseConfig, liveness: &LivenessView) -> bool {
        self.epoch == liveness.epoch
            && self
                .active_until(timing, liveness)
                .is_some_and(|deadline| now < deadline)
    }

    /// Time left until the gate closes, zero once closed.
    pub fn remaining(&self, now: Instant, timing: &LeaseConfig, liveness: &LivenessView) -> Duration {
        self.active_until(timing, liveness)
            .map(|d| d.saturating_duration_since(now))
            .unwrap_or_default()
    }

    fn check(&self) {
        debug_assert_eq!(
            self.uncertain_since.is_some(),
            self.state == LeaseState::Uncertain,
            "uncertain_since must be set exactly while uncertain"
        );
    }
}

/// Render a monotonic instant as wall-clock time for reporting.
pub fn wall_clock(at: Instant) -> DateTime<Utc> {
    let ago = Instant::now().saturating_duration_since(at);
    Utc::now() - chrono::Duration::from_std(ago).unwrap_or_else(|_| chrono::Duration::zero())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn timing() -> LeaseConfig {
        LeaseConfig {
            lease_ttl: Duration::from_secs(15),
            renewal_interval: Duration::from_secs(5),
            liveness_ttl: Duration::from_secs(20),
            heartbeat_interval: Duration::from_secs(5),
            uncertain_grace_period: Duration::from_secs(12),
            store_timeout: Duration::from_secs(1),
            ..LeaseConfig::default()
        }
    }

    fn live_until(deadline: Instant) -> LivenessView {
        LivenessView { deadline, epoch: 1 }
    }

    fn owned_at(t0: Instant) -> LocalLeaseInfo {
        let mut info = LocalLeaseInfo::acquiring(SessionId::from("sess-1"), 1);
        info.acquired(t0);
        info
    }

    #[test]
    fn test_acquire_sets_both_timestamps() {
        let t0 = Instant::now();
        let info = owned_at(t0);
        assert_eq!(info.state, LeaseState::Owned);
        assert_eq!(info.acquired_at, Some(t0));
        assert_eq!(info.last_renewed_at, Some(t0));
        assert_eq!(info.uncertain_since, None);
    }

    #[test]
    fn test_renewal_keeps_acquired_at() {
        let t0 = Instant::now();
        let mut info = owned_at(t0);
        for i in 1..=5 {
            let at = t0 + Duration::from_secs(5 * i);
            assert!(!info.renewed(at));
            assert_eq!(info.acquired_at, Some(t0));
            assert_eq!(info.last_renewed_at, Some(at));
        }
    }

    #[test]
    fn test_single_failure_stays_uncertain() {
        let t0 = Instant::now();
        let liveness = live_until(t0 + Duration::from_secs(60));
        let mut info = owned_at(t0);
        let now = t0 + Duration::from_secs(5);
        assert_eq!(
            info.renew_failed(now, &timing(), &liveness),
            RenewFailure::Uncertain { first: true }
        );
        assert_eq!(info.state, LeaseState::Uncertain);
        assert_eq!(info.uncertain_since, Some(now));
        assert!(info.is_active(now, &timing(), &liveness));

        // reconfirmation clears uncertain_since
        assert!(info.renewed(t0 + Duration::from_secs(10)));
        assert_eq!(info.state, LeaseState::Owned);
        assert_eq!(info.uncertain_since, None);
    }

    #[test]
    fn test_gives_up_on_third_failure() {
        // failures 5s apart, grace 12s, ttl 15s: deadline = min(5 + 12, 0 + 15)
        let t0 = Instant::now();
        let liveness = live_until(t0 + Duration::from_secs(60));
        let mut info = owned_at(t0);
        let at = |s| t0 + Duration::from_secs(s);

        assert_eq!(
            info.renew_failed(at(5), &timing(), &liveness),
            RenewFailure::Uncertain { first: true }
        );
        assert_eq!(
            info.renew_failed(at(10), &timing(), &liveness),
            RenewFailure::Uncertain { first: false }
        );
        assert!(info.is_active(at(14), &timing(), &liveness));
        assert_eq!(
            info.active_until(&timing(), &liveness),
            Some(at(15))
        );
        assert_eq!(
            info.renew_failed(at(15), &timing(), &liveness),
            RenewFailure::GaveUp
        );
        assert_eq!(info.state, LeaseState::Released);
        assert_eq!(info.uncertain_since, None);
        assert!(!info.is_active(at(15), &timing(), &liveness));
    }

    #[test]
    fn test_grace_bounds_deadline_when_shorter_than_ttl() {
        let t0 = Instant::now();
        let liveness = live_until(t0 + Duration::from_secs(60));
        let mut info = owned_at(t0);
        let timing = LeaseConfig {
            uncertain_grace_period: Duration::from_secs(3),
            ..timing()
        };
        info.renew_failed(t0 + Duration::from_secs(5), &timing, &liveness);
        assert_eq!(
            info.active_until(&timing, &liveness),
            Some(t0 + Duration::from_secs(8))
        );
    }

    #[test]
    fn test_own_liveness_bounds_gate() {
        let t0 = Instant::now();
        let info = owned_at(t0);
        let liveness = live_until(t0 + Duration::from_secs(4));
        assert!(info.is_active(t0 + Duration::from_secs(3), &timing(), &liveness));
        assert!(!info.is_active(t0 + Duration::from_secs(4), &timing(), &liveness));
    }

    #[test]
    fn test_epoch_change_closes_gate() {
        let t0 = Instant::now();
        let info = owned_at(t0);
        let liveness = LivenessView {
            deadline: t0 + Duration::from_secs(60),
            epoch: 2,
        };
        assert!(!info.is_active(t0, &timing(), &liveness));
    }

    #[test]
    fn test_acquiring_is_not_active() {
        let t0 = Instant::now();
        let info = LocalLeaseInfo::acquiring(SessionId::from("s"), 1);
        let liveness = live_until(t0 + Duration::from_secs(60));
        assert_eq!(info.active_until(&timing(), &liveness), None);
        assert!(!info.is_active(t0, &timing(), &liveness));
        assert_eq!(info.remaining(t0, &timing(), &liveness), Duration::ZERO);
    }

    #[test]
    fn test_state_labels() {
        assert_eq!(LeaseState::Uncertain.to_string(), "uncertain");
        assert!(LeaseState::Uncertain.is_held());
        assert!(!LeaseState::Acquiring.is_held());
    }
}
