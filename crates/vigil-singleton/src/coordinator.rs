//! Singleton lock coordination.
//!
//! [`SingletonCoordinator`] is the top-level lock API. It derives lock
//! identities, applies the poll-with-timeout acquisition policy and attaches a
//! [`RenewalScheduler`] to every lease it takes.
//!
//! ## Acquisition
//!
//! Each call proposes a fresh random lease token. Without retry a single
//! attempt is made and contention yields `Ok(None)`. With retry the attempt
//! is repeated every poll interval until the lock is taken, the acquisition
//! timeout elapses ([`Error::Timeout`]) or the caller cancels
//! ([`Error::Cancelled`]). The timeout is measured in wall-clock time since
//! the first attempt.
//!
//! ## Release
//!
//! Renewal is always stopped, and any in-flight renewal awaited, before the
//! lease is released.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::SingletonPolicy;
use crate::declaration::{
    JobDescriptor, ResolvedSingleton, SingletonDeclaration, SingletonMode, SingletonPlan,
    validate_declarations,
};
use crate::error::{Error, Result};
use crate::host::HostIdProvider;
use crate::identity::{BindingData, EnvNameResolver, LockIdentity, NameResolver};
use crate::manager::{DEFAULT_ACCOUNT, LockHandle, LockManager};
use crate::metrics::SingletonMetrics;
use crate::renewal::{
    FaultSink, LinearSpeedupStrategy, NoopFaultSink, RenewalScheduler, RenewalState,
};

/// Per-call lock options.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LockOptions {
    /// Lock mode; selects the lease period.
    pub mode: SingletonMode,
    /// Storage account; the default account when unset.
    pub account: Option<String>,
    /// Overrides the policy's acquisition timeout.
    pub acquisition_timeout: Option<Duration>,
    /// Overrides the policy's lease period.
    pub lock_period: Option<Duration>,
}

impl LockOptions {
    /// Options for a listener-mode lock.
    #[must_use]
    pub fn listener() -> Self {
        Self {
            mode: SingletonMode::Listener,
            ..Self::default()
        }
    }

    /// Returns the account name to use.
    #[must_use]
    pub fn account_name(&self) -> &str {
        self.account.as_deref().unwrap_or(DEFAULT_ACCOUNT)
    }
}

impl From<&ResolvedSingleton> for LockOptions {
    fn from(singleton: &ResolvedSingleton) -> Self {
        Self {
            mode: singleton.mode,
            account: singleton.account.clone(),
            acquisition_timeout: singleton.acquisition_timeout,
            lock_period: singleton.lock_period,
        }
    }
}

/// A held lease together with its renewal loop.
///
/// Hand it back to [`SingletonCoordinator::release`] when the protected work
/// is done. Dropping it stops renewal and lets the lease expire.
#[derive(Debug)]
pub struct RenewableLockHandle {
    handle: LockHandle,
    renewal: RenewalScheduler,
    mode: SingletonMode,
}

impl RenewableLockHandle {
    /// Identity of the held lock.
    #[must_use]
    pub fn lock_id(&self) -> &LockIdentity {
        self.handle.lock_id()
    }

    /// Lease token.
    #[must_use]
    pub fn lease_id(&self) -> &str {
        self.handle.lease_id()
    }

    /// Account holding the lock record.
    #[must_use]
    pub fn account(&self) -> &str {
        self.handle.account()
    }

    /// Lease period.
    #[must_use]
    pub fn lease_period(&self) -> Duration {
        self.handle.lease_period()
    }

    /// Lock mode.
    #[must_use]
    pub fn mode(&self) -> SingletonMode {
        self.mode
    }

    /// State of the renewal loop.
    #[must_use]
    pub fn renewal_state(&self) -> RenewalState {
        self.renewal.state()
    }

    /// A token cancelled if the lease is irrecoverably lost.
    #[must_use]
    pub fn lease_lost(&self) -> CancellationToken {
        self.renewal.lease_lost()
    }

    /// The underlying lease.
    #[must_use]
    pub fn inner(&self) -> &LockHandle {
        &self.handle
    }
}

/// Top-level singleton lock API.
pub struct SingletonCoordinator {
    manager: Arc<LockManager>,
    policy: SingletonPolicy,
    host_ids: Arc<dyn HostIdProvider>,
    resolver: Arc<dyn NameResolver>,
    fault_sink: Arc<dyn FaultSink>,
    metrics: SingletonMetrics,
    instance_id: String,
}

impl std::fmt::Debug for SingletonCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SingletonCoordinator")
            .field("policy", &self.policy)
            .field("instance_id", &self.instance_id)
            .finish_non_exhaustive()
    }
}

impl SingletonCoordinator {
    /// Creates a coordinator.
    ///
    /// Names resolve from the environment, lease faults are only logged and
    /// the instance id is a fresh UUID; see the `with_*` methods.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if the policy is invalid.
    pub fn new(
        manager: Arc<LockManager>,
        policy: SingletonPolicy,
        host_ids: Arc<dyn HostIdProvider>,
    ) -> Result<Self> {
        policy.validate()?;
        Ok(Self {
            manager,
            policy,
            host_ids,
            resolver: Arc::new(EnvNameResolver),
            fault_sink: Arc::new(NoopFaultSink),
            metrics: SingletonMetrics::new(),
            instance_id: Uuid::new_v4().to_string(),
        })
    }

    /// Uses `resolver` for `%name%` references.
    #[must_use]
    pub fn with_name_resolver(mut self, resolver: Arc<dyn NameResolver>) -> Self {
        self.resolver = resolver;
        self
    }

    /// Publishes fatal lease faults to `sink`.
    #[must_use]
    pub fn with_fault_sink(mut self, sink: Arc<dyn FaultSink>) -> Self {
        self.fault_sink = sink;
        self
    }

    /// Sets the id recorded as owner of locks taken on this process's behalf.
    #[must_use]
    pub fn with_instance_id(mut self, instance_id: impl Into<String>) -> Self {
        self.instance_id = instance_id.into();
        self
    }

    /// The policy in effect.
    #[must_use]
    pub fn policy(&self) -> &SingletonPolicy {
        &self.policy
    }

    /// The id recorded as owner by the invoker and listener.
    #[must_use]
    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    /// Validates a job's declarations with this coordinator's resolver.
    ///
    /// # Errors
    ///
    /// Returns a configuration error for the first invalid declaration.
    pub fn validate(
        &self,
        job: &JobDescriptor,
        declarations: &[SingletonDeclaration],
    ) -> Result<SingletonPlan> {
        validate_declarations(job, declarations, self.resolver.as_ref())
    }

    /// Derives the lock identity of `job` for one invocation.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if a scope parameter is missing from
    /// `binding_data`, or the host id cannot be read.
    pub async fn lock_id_for(
        &self,
        job: &JobDescriptor,
        singleton: &ResolvedSingleton,
        binding_data: &BindingData,
    ) -> Result<LockIdentity> {
        let host_id = self.host_ids.host_id().await?;
        singleton.lock_identity(&host_id, job, binding_data)
    }

    /// Acquires the lock on `lock_id`.
    ///
    /// Returns `Ok(None)` only without retry, when the lock is held elsewhere.
    /// `owner_id`, if given, is recorded on a best-effort basis.
    ///
    /// # Errors
    ///
    /// - [`Error::Timeout`] if the lock stays contended past the acquisition
    ///   timeout
    /// - [`Error::Cancelled`] if `cancel` fires while waiting
    /// - configuration and storage errors from the manager
    #[tracing::instrument(
        skip(self, lock_id, options, cancel),
        fields(lock_id = %lock_id, account = options.account_name(), mode = options.mode.as_str())
    )]
    pub async fn lock(
        &self,
        lock_id: &LockIdentity,
        owner_id: Option<&str>,
        options: &LockOptions,
        cancel: &CancellationToken,
        retry: bool,
    ) -> Result<Option<RenewableLockHandle>> {
        let account = options.account_name();
        let lease_period = options
            .lock_period
            .unwrap_or_else(|| self.policy.lock_period_for(options.mode));
        let timeout = options
            .acquisition_timeout
            .unwrap_or(self.policy.acquisition_timeout);
        let poll_interval = self.policy.acquisition_poll_interval;
        let proposed_lease_id = Uuid::new_v4().to_string();

        let started = Instant::now();
        let mut attempts: u32 = 0;
        let handle = loop {
            if cancel.is_cancelled() {
                self.metrics.record_acquisition(options.mode, "cancelled");
                return Err(Error::cancelled("singleton lock acquisition"));
            }

            attempts += 1;
            let acquired = match self
                .manager
                .try_lock(account, lock_id, lease_period, &proposed_lease_id)
                .await
            {
                Ok(acquired) => acquired,
                Err(e) => {
                    self.metrics.record_acquisition(options.mode, "error");
                    return Err(e);
                }
            };
            if let Some(handle) = acquired {
                break handle;
            }

            if !retry {
                self.metrics.record_acquisition(options.mode, "contended");
                tracing::debug!("lock held elsewhere");
                return Ok(None);
            }

            let elapsed = started.elapsed();
            if elapsed >= timeout {
                self.metrics.record_acquisition(options.mode, "timeout");
                tracing::warn!(
                    attempts,
                    timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
                    "lock acquisition timed out"
                );
                return Err(Error::Timeout {
                    lock_id: lock_id.to_string(),
                    timeout,
                });
            }

            let pause = poll_interval.min(timeout - elapsed);
            tokio::select! {
                biased;
                () = cancel.cancelled() => {
                    self.metrics.record_acquisition(options.mode, "cancelled");
                    return Err(Error::cancelled("singleton lock acquisition"));
                }
                () = tokio::time::sleep(pause) => {}
            }
        };

        self.metrics.record_acquisition(options.mode, "acquired");
        self.metrics.observe_acquire_wait(options.mode, started.elapsed());
        self.metrics.lock_held();

        if let Some(owner_id) = owner_id {
            if let Err(e) = self.manager.write_owner(&handle, owner_id).await {
                tracing::warn!(owner_id, error = %e, "failed to record lock owner");
            }
        }

        let strategy = LinearSpeedupStrategy::for_lease(
            lease_period,
            self.policy.minimum_renewal_interval,
        );
        let renewal = RenewalScheduler::start(
            handle.clone(),
            Box::new(strategy),
            self.fault_sink.clone(),
            self.metrics,
        );

        tracing::info!(
            attempts,
            lease_period_ms = u64::try_from(lease_period.as_millis()).unwrap_or(u64::MAX),
            "lock acquired ({lock_id})"
        );

        Ok(Some(RenewableLockHandle {
            handle,
            renewal,
            mode: options.mode,
        }))
    }

    /// Stops renewal and releases the lease.
    ///
    /// The release is attempted even if `cancel` has already fired, in which
    /// case [`Error::Cancelled`] is returned afterwards.
    ///
    /// # Errors
    ///
    /// Returns server and fatal storage errors from the release, or
    /// [`Error::Cancelled`].
    #[tracing::instrument(
        skip(self, handle, cancel),
        fields(lock_id = %handle.lock_id(), account = handle.account())
    )]
    pub async fn release(
        &self,
        mut handle: RenewableLockHandle,
        cancel: &CancellationToken,
    ) -> Result<()> {
        handle.renewal.stop().await;
        self.metrics.lock_dropped();

        if let Err(e) = self.manager.release(&handle.handle).await {
            self.metrics.record_release("error");
            tracing::warn!(error = %e, "lock release failed");
            return Err(e);
        }
        self.metrics.record_release("released");
        tracing::info!("lock released ({})", handle.lock_id());

        if cancel.is_cancelled() {
            return Err(Error::cancelled("singleton lock release"));
        }
        Ok(())
    }

    /// Reads the current owner of `lock_id`. Never creates anything.
    ///
    /// # Errors
    ///
    /// Returns configuration errors for unknown accounts and storage errors.
    pub async fn get_owner(
        &self,
        lock_id: &LockIdentity,
        account: Option<&str>,
    ) -> Result<Option<String>> {
        self.manager
            .get_owner(account.unwrap_or(DEFAULT_ACCOUNT), lock_id)
            .await
    }
}
