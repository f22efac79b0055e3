//! Singleton lock metrics.
//!
//! | Metric | Type | Labels | Description |
//! |--------|------|--------|-------------|
//! | `vigil_lock_acquisitions_total` | Counter | `mode`, `result` | Acquisition outcomes (acquired, contended, timeout, cancelled, error) |
//! | `vigil_lock_acquire_wait_seconds` | Histogram | `mode` | Time from first attempt to a held lease |
//! | `vigil_lock_renewals_total` | Counter | `result` | Renewal outcomes (success, transient, fatal) |
//! | `vigil_lock_releases_total` | Counter | `result` | Release outcomes |
//! | `vigil_locks_held` | Gauge | - | Leases currently held by this process |
//!
//! Recording goes through the `metrics` facade; without an installed
//! recorder every call is a no-op.

use std::time::Duration;

use metrics::{counter, gauge, histogram};

use crate::declaration::SingletonMode;

/// Metric names.
pub mod names {
    /// Counter: acquisition outcomes.
    pub const ACQUISITIONS_TOTAL: &str = "vigil_lock_acquisitions_total";
    /// Histogram: wait before a lease was held, in seconds.
    pub const ACQUIRE_WAIT_SECONDS: &str = "vigil_lock_acquire_wait_seconds";
    /// Counter: renewal outcomes.
    pub const RENEWALS_TOTAL: &str = "vigil_lock_renewals_total";
    /// Counter: release outcomes.
    pub const RELEASES_TOTAL: &str = "vigil_lock_releases_total";
    /// Gauge: leases currently held.
    pub const LOCKS_HELD: &str = "vigil_locks_held";
}

/// Label keys.
pub mod labels {
    /// Lock mode (function, listener).
    pub const MODE: &str = "mode";
    /// Outcome of the operation.
    pub const RESULT: &str = "result";
}

/// Records singleton lock metrics. Cheap to clone.
#[derive(Debug, Clone, Copy, Default)]
pub struct SingletonMetrics;

impl SingletonMetrics {
    /// Creates a recorder.
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    /// Records an acquisition outcome.
    pub fn record_acquisition(&self, mode: SingletonMode, result: &'static str) {
        counter!(
            names::ACQUISITIONS_TOTAL,
            labels::MODE => mode.as_str(),
            labels::RESULT => result,
        )
        .increment(1);
    }

    /// Records how long a successful acquisition waited.
    pub fn observe_acquire_wait(&self, mode: SingletonMode, waited: Duration) {
        histogram!(names::ACQUIRE_WAIT_SECONDS, labels::MODE => mode.as_str())
            .record(waited.as_secs_f64());
    }

    /// Records a renewal outcome.
    pub fn record_renewal(&self, result: &'static str) {
        counter!(names::RENEWALS_TOTAL, labels::RESULT => result).increment(1);
    }

    /// Records a release outcome.
    pub fn record_release(&self, result: &'static str) {
        counter!(names::RELEASES_TOTAL, labels::RESULT => result).increment(1);
    }

    /// Adjusts the held-locks gauge.
    pub fn lock_held(&self) {
        gauge!(names::LOCKS_HELD).increment(1.0);
    }

    /// Adjusts the held-locks gauge.
    pub fn lock_dropped(&self) {
        gauge!(names::LOCKS_HELD).decrement(1.0);
    }
}
