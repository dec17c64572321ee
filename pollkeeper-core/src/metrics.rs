//! # metrics
//!
//! process-level statistics; lease metrics live with the coordination crate
use std::time::Instant;

use lazy_static::lazy_static;
use prometheus::{IntGauge, register_int_gauge};

lazy_static! {
    /// When the process started
    pub static ref START_TIME: Instant = Instant::now();

    /// process uptime
    pub static ref UPTIME: IntGauge = register_int_gauge!("uptime", "process uptime (seconds)").unwrap();

    /// 1 while this node reports healthy
    pub static ref HEALTHY: IntGauge = register_int_gauge!("healthy", "1 while startup checks have passed and the node is serving").unwrap();
}

/// Refresh gauges derived from the clock before an export.
pub fn update_uptime() {
    UPTIME.set(START_TIME.elapsed().as_secs() as i64);
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use prometheus::gather;

    use super::*;

    #[test]
    fn gauges_are_registered_and_exposed() {
        update_uptime();
        HEALTHY.set(0);

        let names = gather()
            .iter()
            .map(|family| family.get_name().to_string())
            .collect::<HashSet<_>>();
        assert!(names.contains("uptime"), "registered metric families: {names:?}");
        assert!(names.contains("healthy"), "registered metric families: {names:?}");
    }
}
