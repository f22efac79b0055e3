//! Function-mode singleton invocation.

use std::future::Future;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::coordinator::{LockOptions, SingletonCoordinator};
use crate::declaration::{JobDescriptor, ResolvedSingleton, SingletonMode};
use crate::error::{Error, Result};
use crate::identity::BindingData;

/// Runs invocations of one job under its function-mode lock.
///
/// Each invocation waits for the lock, runs the job and releases the lock,
/// whether the job completed or not. If the lease is lost while the job runs,
/// the job future is dropped and [`Error::LeaseLost`] is returned.
#[derive(Debug, Clone)]
pub struct SingletonInvoker {
    coordinator: Arc<SingletonCoordinator>,
    job: JobDescriptor,
    singleton: ResolvedSingleton,
}

impl SingletonInvoker {
    /// Creates an invoker for `job`.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if `singleton` is not a function-mode
    /// declaration.
    pub fn new(
        coordinator: Arc<SingletonCoordinator>,
        job: JobDescriptor,
        singleton: ResolvedSingleton,
    ) -> Result<Self> {
        if singleton.mode != SingletonMode::Function {
            return Err(Error::configuration(format!(
                "invoker for '{}' requires a function mode singleton",
                job.full_name
            )));
        }
        Ok(Self {
            coordinator,
            job,
            singleton,
        })
    }

    /// Runs `work` while holding the lock for `binding_data`.
    ///
    /// `work` receives a token that fires if the lease is lost.
    ///
    /// # Errors
    ///
    /// - lock errors ([`Error::Timeout`], [`Error::Cancelled`], storage and
    ///   configuration errors)
    /// - [`Error::LeaseLost`] if the lease was lost before `work` finished
    pub async fn invoke<F, Fut, T>(
        &self,
        binding_data: &BindingData,
        cancel: &CancellationToken,
        work: F,
    ) -> Result<T>
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = T>,
    {
        let coordinator = &self.coordinator;
        let lock_id = coordinator
            .lock_id_for(&self.job, &self.singleton, binding_data)
            .await?;
        let options = LockOptions::from(&self.singleton);

        let Some(handle) = coordinator
            .lock(
                &lock_id,
                Some(coordinator.instance_id()),
                &options,
                cancel,
                true,
            )
            .await?
        else {
            return Err(Error::Timeout {
                lock_id: lock_id.to_string(),
                timeout: options
                    .acquisition_timeout
                    .unwrap_or(coordinator.policy().acquisition_timeout),
            });
        };

        let lease_lost = handle.lease_lost();
        let outcome = tokio::select! {
            biased;
            () = lease_lost.cancelled() => None,
            value = work(lease_lost.clone()) => Some(value),
        };

        if let Err(e) = coordinator.release(handle, &CancellationToken::new()).await {
            tracing::warn!(lock_id = %lock_id, error = %e, "failed to release singleton lock");
        }

        outcome.ok_or_else(|| Error::LeaseLost {
            lock_id: lock_id.to_string(),
            message: format!("lease lost while '{}' was running", self.job.full_name),
        })
    }
}
