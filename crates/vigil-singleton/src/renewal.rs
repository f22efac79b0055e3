//! Background lease renewal.
//!
//! A [`RenewalScheduler`] keeps one lease alive on a tokio task:
//!
//! - success: the next renewal runs after the normal interval (half the
//!   lease period)
//! - transient failure: a warning is logged, the fault is offered to
//!   [`FaultSink::on_transient`] and the next renewal runs sooner
//! - any other failure: the loop stops, diagnostics are logged, the fault is
//!   published to the [`FaultSink`] and the handle's lease-lost signal fires
//!
//! Renewals are single-flight. [`RenewalScheduler::stop`] cancels the loop and
//! waits for it, so a renewal that is already in flight finishes before stop
//! returns and can never race a release.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::manager::LockHandle;
use crate::metrics::SingletonMetrics;

/// Computes the delay before the next renewal from the last outcome.
pub trait DelayStrategy: Send + 'static {
    /// Returns the delay after a renewal that succeeded (`true`) or failed
    /// transiently (`false`).
    fn next_delay(&mut self, succeeded: bool) -> Duration;
}

/// Renews at a fixed interval and halves the delay after each transient
/// failure, down to a floor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinearSpeedupStrategy {
    normal: Duration,
    minimum: Duration,
    current: Duration,
}

impl LinearSpeedupStrategy {
    /// Creates a strategy with the given normal interval and floor.
    #[must_use]
    pub fn new(normal: Duration, minimum: Duration) -> Self {
        let minimum = minimum.min(normal);
        Self {
            normal,
            minimum,
            current: normal,
        }
    }

    /// The strategy for a lease of `lease_period`: renew at half the period.
    #[must_use]
    pub fn for_lease(lease_period: Duration, minimum: Duration) -> Self {
        Self::new(lease_period / 2, minimum)
    }

    /// The interval used while renewals succeed.
    #[must_use]
    pub fn normal_interval(&self) -> Duration {
        self.normal
    }
}

impl DelayStrategy for LinearSpeedupStrategy {
    fn next_delay(&mut self, succeeded: bool) -> Duration {
        self.current = if succeeded {
            self.normal
        } else {
            (self.current / 2).max(self.minimum)
        };
        self.current
    }
}

/// Diagnostics for a failed renewal.
#[derive(Debug, Clone)]
pub struct LeaseFault {
    /// Identity of the lost lock.
    pub lock_id: String,
    /// Wall-clock time of the last successful renewal (or acquisition).
    pub last_renewal: DateTime<Utc>,
    /// Time elapsed since the last successful renewal.
    pub since_last_renewal: Duration,
    /// Lease period the lock was held with.
    pub lease_period: Duration,
    /// The renewal failure.
    pub message: String,
}

/// Receives lease faults from renewal tasks.
pub trait FaultSink: Send + Sync + 'static {
    /// Called once per lost lease, from the renewal task.
    fn on_fatal(&self, fault: &LeaseFault);

    /// Called after each transient renewal failure. The lease is still held
    /// and renewal continues.
    fn on_transient(&self, _fault: &LeaseFault) {}
}

impl<F> FaultSink for F
where
    F: Fn(&LeaseFault) + Send + Sync + 'static,
{
    fn on_fatal(&self, fault: &LeaseFault) {
        self(fault);
    }
}

/// A sink that drops faults; the renewal task has already logged them.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopFaultSink;

impl FaultSink for NoopFaultSink {
    fn on_fatal(&self, _fault: &LeaseFault) {}
}

/// Lifecycle state of a scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenewalState {
    /// Not renewing: stopped, or ended by a fatal failure.
    Idle,
    /// The renewal loop is running.
    Running,
}

/// A running renewal loop for one lease.
#[derive(Debug)]
pub struct RenewalScheduler {
    cancel: CancellationToken,
    lease_lost: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl RenewalScheduler {
    /// Starts renewing `handle` on a new task.
    #[must_use]
    pub fn start(
        handle: LockHandle,
        strategy: Box<dyn DelayStrategy>,
        sink: Arc<dyn FaultSink>,
        metrics: SingletonMetrics,
    ) -> Self {
        let cancel = CancellationToken::new();
        let lease_lost = CancellationToken::new();
        let worker = RenewalWorker {
            handle,
            strategy,
            sink,
            metrics,
            cancel: cancel.clone(),
            lease_lost: lease_lost.clone(),
        };
        let task = tokio::spawn(worker.run());

        Self {
            cancel,
            lease_lost,
            task: Some(task),
        }
    }

    /// Returns the current state.
    #[must_use]
    pub fn state(&self) -> RenewalState {
        match &self.task {
            Some(task) if !task.is_finished() => RenewalState::Running,
            _ => RenewalState::Idle,
        }
    }

    /// A token cancelled when the lease is irrecoverably lost.
    #[must_use]
    pub fn lease_lost(&self) -> CancellationToken {
        self.lease_lost.clone()
    }

    /// Stops the loop and waits for it to exit. Idempotent.
    pub async fn stop(&mut self) {
        self.cancel.cancel();
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                tracing::warn!(error = %e, "renewal task ended abnormally");
            }
        }
    }
}

impl Drop for RenewalScheduler {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

struct RenewalWorker {
    handle: LockHandle,
    strategy: Box<dyn DelayStrategy>,
    sink: Arc<dyn FaultSink>,
    metrics: SingletonMetrics,
    cancel: CancellationToken,
    lease_lost: CancellationToken,
}

impl RenewalWorker {
    async fn run(mut self) {
        let lock_id = self.handle.lock_id().to_string();
        let lease_period = self.handle.lease_period();
        let mut last_renewal = Utc::now();
        let mut last_renewal_at = Instant::now();
        let mut delay = self.strategy.next_delay(true);

        loop {
            tokio::select! {
                biased;
                () = self.cancel.cancelled() => break,
                () = tokio::time::sleep(delay) => {}
            }

            match self.handle.renew().await {
                Ok(()) => {
                    last_renewal = Utc::now();
                    last_renewal_at = Instant::now();
                    self.metrics.record_renewal("success");
                    delay = self.strategy.next_delay(true);
                    tracing::trace!(lock_id = %lock_id, "lease renewed");
                }
                Err(e) if e.is_transient() => {
                    self.metrics.record_renewal("transient");
                    delay = self.strategy.next_delay(false);
                    tracing::warn!(
                        lock_id = %lock_id,
                        error = %e,
                        next_attempt_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                        "lease renewal failed, retrying sooner"
                    );
                    self.sink.on_transient(&LeaseFault {
                        lock_id: lock_id.clone(),
                        last_renewal,
                        since_last_renewal: last_renewal_at.elapsed(),
                        lease_period,
                        message: e.to_string(),
                    });
                }
                Err(e) => {
                    self.metrics.record_renewal("fatal");
                    let fault = LeaseFault {
                        lock_id: lock_id.clone(),
                        last_renewal,
                        since_last_renewal: last_renewal_at.elapsed(),
                        lease_period,
                        message: e.to_string(),
                    };
                    tracing::error!(
                        lock_id = %lock_id,
                        error = %e,
                        last_renewal = %fault.last_renewal.to_rfc3339(),
                        since_last_renewal_ms =
                            u64::try_from(fault.since_last_renewal.as_millis()).unwrap_or(u64::MAX),
                        lease_period_ms = u64::try_from(lease_period.as_millis()).unwrap_or(u64::MAX),
                        "singleton lease renewal failed, lease lost"
                    );
                    self.lease_lost.cancel();
                    self.sink.on_fatal(&fault);
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn speedup_halves_to_floor_and_resets() {
        let mut strategy =
            LinearSpeedupStrategy::for_lease(Duration::from_secs(16), Duration::from_secs(1));
        assert_eq!(strategy.normal_interval(), Duration::from_secs(8));

        assert_eq!(strategy.next_delay(true), Duration::from_secs(8));
        assert_eq!(strategy.next_delay(false), Duration::from_secs(4));
        assert_eq!(strategy.next_delay(false), Duration::from_secs(2));
        assert_eq!(strategy.next_delay(false), Duration::from_secs(1));
        assert_eq!(strategy.next_delay(false), Duration::from_secs(1));
        assert_eq!(strategy.next_delay(true), Duration::from_secs(8));
    }

    #[test]
    fn floor_never_exceeds_normal_interval() {
        let mut strategy =
            LinearSpeedupStrategy::new(Duration::from_millis(250), Duration::from_secs(1));
        assert_eq!(strategy.next_delay(false), Duration::from_millis(250));
    }

    #[test]
    fn closures_are_fault_sinks() {
        use std::sync::atomic::{AtomicU32, Ordering};

        let seen = Arc::new(AtomicU32::new(0));
        let counter = seen.clone();
        let sink: Arc<dyn FaultSink> = Arc::new(move |_: &LeaseFault| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        sink.on_fatal(&LeaseFault {
            lock_id: "host/job".into(),
            last_renewal: Utc::now(),
            since_last_renewal: Duration::from_secs(20),
            lease_period: Duration::from_secs(15),
            message: "gone".into(),
        });
        assert_eq!(seen.load(Ordering::SeqCst), 1);

        // Closures only observe fatal faults.
        sink.on_transient(&LeaseFault {
            lock_id: "host/job".into(),
            last_renewal: Utc::now(),
            since_last_renewal: Duration::from_secs(1),
            lease_period: Duration::from_secs(15),
            message: "503".into(),
        });
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }
}
