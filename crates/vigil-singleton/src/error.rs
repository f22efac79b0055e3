//! Error types for singleton coordination.

use std::fmt::Write as _;
use std::time::Duration;

/// The result type used throughout vigil-singleton.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while coordinating singleton locks.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The lock could not be acquired within the acquisition timeout.
    #[error(
        "unable to acquire singleton lock lease for '{lock_id}' (timeout of {} exceeded)",
        format_timespan(.timeout)
    )]
    Timeout {
        /// Identity of the contended lock.
        lock_id: String,
        /// The configured acquisition timeout.
        timeout: Duration,
    },

    /// A held lease was irrecoverably lost; protected work is no longer exclusive.
    #[error("singleton lock lease for '{lock_id}' was lost: {message}")]
    LeaseLost {
        /// Identity of the lost lock.
        lock_id: String,
        /// Diagnostic description of the loss.
        message: String,
    },

    /// A singleton declaration or scope template is invalid.
    #[error("singleton configuration error: {message}")]
    Configuration {
        /// Description of the configuration problem.
        message: String,
    },

    /// The operation was cancelled by its caller.
    #[error("{operation} was cancelled")]
    Cancelled {
        /// The operation that observed the cancellation.
        operation: String,
    },

    /// A guarded listener failed to start or stop.
    #[error("listener error: {message}")]
    Listener {
        /// Description of the listener failure.
        message: String,
        /// The underlying cause, if any.
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// An error from vigil-core.
    #[error("storage: {0}")]
    Core(#[from] vigil_core::Error),
}

impl Error {
    /// Creates a new configuration error.
    #[must_use]
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Creates a new cancellation error.
    #[must_use]
    pub fn cancelled(operation: impl Into<String>) -> Self {
        Self::Cancelled {
            operation: operation.into(),
        }
    }

    /// Creates a new listener error with a source cause.
    #[must_use]
    pub fn listener_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Listener {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Returns true if this error wraps a transient storage failure.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Core(e) if e.is_transient())
    }
}

/// Formats a duration as `[d.]h:mm:ss[.fffffff]`, trimming trailing zeros.
///
/// `200ms` renders as `0:00:00.2`, `90s` as `0:01:30`, `26h` as `1.2:00:00`.
#[must_use]
pub fn format_timespan(duration: &Duration) -> String {
    let total_secs = duration.as_secs();
    let days = total_secs / 86_400;
    let hours = (total_secs % 86_400) / 3_600;
    let minutes = (total_secs % 3_600) / 60;
    let seconds = total_secs % 60;

    let mut out = String::new();
    if days > 0 {
        let _ = write!(out, "{days}.");
    }
    let _ = write!(out, "{hours}:{minutes:02}:{seconds:02}");

    // Seven fractional digits (100ns ticks).
    let ticks = duration.subsec_nanos() / 100;
    if ticks > 0 {
        let fraction = format!("{ticks:07}");
        let _ = write!(out, ".{}", fraction.trim_end_matches('0'));
    }
    out
}
