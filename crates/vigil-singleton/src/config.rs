//! Singleton lock configuration.
//!
//! [`SingletonPolicy`] carries the timing knobs of the lease protocol;
//! [`SingletonConfig`] adds deployment settings such as the lock container.
//! Both can be loaded from the process environment with strict validation.
//!
//! | Variable | Default |
//! |----------|---------|
//! | `VIGIL_SINGLETON_LOCK_PERIOD_MS` | 15000 |
//! | `VIGIL_SINGLETON_LISTENER_LOCK_PERIOD_MS` | 60000 |
//! | `VIGIL_SINGLETON_ACQUISITION_TIMEOUT_MS` | 60000 |
//! | `VIGIL_SINGLETON_POLL_INTERVAL_MS` | 1000 |
//! | `VIGIL_SINGLETON_MIN_RENEWAL_INTERVAL_MS` | 1000 |
//! | `VIGIL_SINGLETON_LISTENER_RECOVERY_POLL_MS` | 60000 |
//! | `VIGIL_SINGLETON_CONTAINER` | `vigil-hosts` |
//! | `VIGIL_LOG_FORMAT` | `pretty` |

use std::time::Duration;

use serde::{Deserialize, Serialize};
use vigil_core::observability::{LogFormat, init_logging};

use crate::error::{Error, Result};

/// Env var: lease period for function-mode locks, in milliseconds.
pub const ENV_LOCK_PERIOD_MS: &str = "VIGIL_SINGLETON_LOCK_PERIOD_MS";
/// Env var: lease period for listener-mode locks, in milliseconds.
pub const ENV_LISTENER_LOCK_PERIOD_MS: &str = "VIGIL_SINGLETON_LISTENER_LOCK_PERIOD_MS";
/// Env var: maximum time to wait for a contended lock, in milliseconds.
pub const ENV_ACQUISITION_TIMEOUT_MS: &str = "VIGIL_SINGLETON_ACQUISITION_TIMEOUT_MS";
/// Env var: delay between acquisition attempts, in milliseconds.
pub const ENV_POLL_INTERVAL_MS: &str = "VIGIL_SINGLETON_POLL_INTERVAL_MS";
/// Env var: floor for renewal delays after transient failures, in milliseconds.
pub const ENV_MIN_RENEWAL_INTERVAL_MS: &str = "VIGIL_SINGLETON_MIN_RENEWAL_INTERVAL_MS";
/// Env var: delay between listener lock recovery attempts, in milliseconds.
pub const ENV_LISTENER_RECOVERY_POLL_MS: &str = "VIGIL_SINGLETON_LISTENER_RECOVERY_POLL_MS";
/// Env var: container holding lock records.
pub const ENV_CONTAINER: &str = "VIGIL_SINGLETON_CONTAINER";
/// Env var: log output format, `json` or `pretty`.
pub const ENV_LOG_FORMAT: &str = "VIGIL_LOG_FORMAT";

/// Default container holding lock records.
pub const DEFAULT_CONTAINER: &str = "vigil-hosts";

/// Timing policy for singleton locks. All durations must be positive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SingletonPolicy {
    /// Lease period for function-mode locks.
    #[serde(with = "duration_ms")]
    pub lock_period: Duration,
    /// Lease period for listener-mode locks.
    #[serde(with = "duration_ms")]
    pub listener_lock_period: Duration,
    /// Maximum wall-clock time to wait for a contended lock.
    #[serde(with = "duration_ms")]
    pub acquisition_timeout: Duration,
    /// Delay between acquisition attempts.
    #[serde(with = "duration_ms")]
    pub acquisition_poll_interval: Duration,
    /// Floor for renewal delays after transient failures.
    #[serde(with = "duration_ms")]
    pub minimum_renewal_interval: Duration,
    /// Delay between listener lock recovery attempts.
    #[serde(with = "duration_ms")]
    pub listener_recovery_poll_interval: Duration,
}

impl Default for SingletonPolicy {
    fn default() -> Self {
        Self {
            lock_period: Duration::from_secs(15),
            listener_lock_period: Duration::from_secs(60),
            acquisition_timeout: Duration::from_secs(60),
            acquisition_poll_interval: Duration::from_secs(1),
            minimum_renewal_interval: Duration::from_secs(1),
            listener_recovery_poll_interval: Duration::from_secs(60),
        }
    }
}

impl SingletonPolicy {
    /// Validates that every duration is positive.
    ///
    /// # Errors
    ///
    /// Returns a configuration error naming the first zero duration.
    pub fn validate(&self) -> Result<()> {
        let fields = [
            ("lock_period", self.lock_period),
            ("listener_lock_period", self.listener_lock_period),
            ("acquisition_timeout", self.acquisition_timeout),
            ("acquisition_poll_interval", self.acquisition_poll_interval),
            ("minimum_renewal_interval", self.minimum_renewal_interval),
            (
                "listener_recovery_poll_interval",
                self.listener_recovery_poll_interval,
            ),
        ];
        for (name, value) in fields {
            if value.is_zero() {
                return Err(Error::configuration(format!("{name} must be positive")));
            }
        }
        Ok(())
    }

    /// Returns the lease period for the given mode.
    #[must_use]
    pub fn lock_period_for(&self, mode: crate::declaration::SingletonMode) -> Duration {
        match mode {
            crate::declaration::SingletonMode::Function => self.lock_period,
            crate::declaration::SingletonMode::Listener => self.listener_lock_period,
        }
    }
}

/// Deployment configuration for singleton coordination.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SingletonConfig {
    /// Timing policy.
    #[serde(flatten)]
    pub policy: SingletonPolicy,
    /// Container holding lock records.
    pub container: String,
    /// Log output format.
    pub log_format: LogFormat,
}

impl Default for SingletonConfig {
    fn default() -> Self {
        Self {
            policy: SingletonPolicy::default(),
            container: DEFAULT_CONTAINER.to_string(),
            log_format: LogFormat::default(),
        }
    }
}

impl SingletonConfig {
    /// Loads config from the process environment.
    ///
    /// # Errors
    ///
    /// Returns a configuration error when a value is not a positive integer.
    pub fn from_env() -> Result<Self> {
        Self::from_env_with(|key| std::env::var(key).ok())
    }

    /// Loads config with a custom environment source.
    ///
    /// # Errors
    ///
    /// Returns a configuration error when a value is not a positive integer
    /// or the log format is unknown.
    pub fn from_env_with<F>(get_env: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = SingletonPolicy::default();
        let policy = SingletonPolicy {
            lock_period: parse_positive_ms(&get_env, ENV_LOCK_PERIOD_MS, defaults.lock_period)?,
            listener_lock_period: parse_positive_ms(
                &get_env,
                ENV_LISTENER_LOCK_PERIOD_MS,
                defaults.listener_lock_period,
            )?,
            acquisition_timeout: parse_positive_ms(
                &get_env,
                ENV_ACQUISITION_TIMEOUT_MS,
                defaults.acquisition_timeout,
            )?,
            acquisition_poll_interval: parse_positive_ms(
                &get_env,
                ENV_POLL_INTERVAL_MS,
                defaults.acquisition_poll_interval,
            )?,
            minimum_renewal_interval: parse_positive_ms(
                &get_env,
                ENV_MIN_RENEWAL_INTERVAL_MS,
                defaults.minimum_renewal_interval,
            )?,
            listener_recovery_poll_interval: parse_positive_ms(
                &get_env,
                ENV_LISTENER_RECOVERY_POLL_MS,
                defaults.listener_recovery_poll_interval,
            )?,
        };

        let container = get_env(ENV_CONTAINER)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
            .unwrap_or_else(|| DEFAULT_CONTAINER.to_string());

        let log_format = match get_env(ENV_LOG_FORMAT) {
            Some(raw) => LogFormat::parse(&raw).ok_or_else(|| {
                Error::configuration(format!(
                    "{ENV_LOG_FORMAT} must be 'json' or 'pretty', got '{raw}'"
                ))
            })?,
            None => LogFormat::default(),
        };

        let config = Self {
            policy,
            container,
            log_format,
        };
        config.validate()?;
        Ok(config)
    }

    /// Validates the policy and container name.
    ///
    /// # Errors
    ///
    /// Returns a configuration error describing the first invalid setting.
    pub fn validate(&self) -> Result<()> {
        self.policy.validate()?;
        if self.container.trim().is_empty() {
            return Err(Error::configuration("container must not be empty"));
        }
        Ok(())
    }

    /// Installs the global tracing subscriber in the configured format.
    /// Later calls are no-ops.
    pub fn init_logging(&self) {
        init_logging(self.log_format);
    }
}

fn parse_positive_ms<F>(get_env: &F, key: &str, default: Duration) -> Result<Duration>
where
    F: Fn(&str) -> Option<String>,
{
    let Some(raw) = get_env(key) else {
        return Ok(default);
    };

    let parsed = raw.trim().parse::<u64>().map_err(|_| {
        Error::configuration(format!("{key} must be a positive integer, got '{raw}'"))
    })?;
    if parsed == 0 {
        return Err(Error::configuration(format!(
            "{key} must be greater than zero"
        )));
    }
    Ok(Duration::from_millis(parsed))
}

/// Serializes durations as integer milliseconds.
mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(u64::try_from(value.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
