//! Listener-mode singleton gating.
//!
//! [`SingletonListener`] wraps a trigger [`Listener`] so that only the process
//! holding the listener lock runs it. If the lock is held elsewhere at start,
//! a recovery task keeps polling for it and starts the listener once the lock
//! is taken. If a held lease is lost, the listener is stopped and recovery
//! resumes.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;
use vigil_core::observability::lock_span;

use crate::coordinator::{LockOptions, RenewableLockHandle, SingletonCoordinator};
use crate::error::Result;
use crate::identity::LockIdentity;

/// A long-running trigger listener.
#[async_trait]
pub trait Listener: Send + Sync + 'static {
    /// Starts listening.
    async fn start(&self, cancel: CancellationToken) -> Result<()>;

    /// Stops listening.
    async fn stop(&self) -> Result<()>;

    /// Abandons any in-progress start.
    fn cancel(&self);
}

#[derive(Default)]
struct GateState {
    lock: Option<RenewableLockHandle>,
    recovery: Option<Recovery>,
    started: bool,
}

struct Recovery {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

/// A listener that only runs while this process holds its listener lock.
pub struct SingletonListener<L: Listener> {
    inner: Arc<L>,
    coordinator: Arc<SingletonCoordinator>,
    lock_id: LockIdentity,
    options: LockOptions,
    state: Arc<Mutex<GateState>>,
    shutdown: CancellationToken,
}

impl<L: Listener> std::fmt::Debug for SingletonListener<L> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SingletonListener")
            .field("lock_id", &self.lock_id)
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

impl<L: Listener> SingletonListener<L> {
    /// Gates `inner` on the lock `lock_id`.
    ///
    /// `options.mode` is forced to listener mode.
    #[must_use]
    pub fn new(
        inner: Arc<L>,
        coordinator: Arc<SingletonCoordinator>,
        lock_id: LockIdentity,
        options: LockOptions,
    ) -> Self {
        Self {
            inner,
            coordinator,
            lock_id,
            options: LockOptions {
                mode: crate::declaration::SingletonMode::Listener,
                ..options
            },
            state: Arc::new(Mutex::new(GateState::default())),
            shutdown: CancellationToken::new(),
        }
    }

    /// Identity of the listener lock.
    #[must_use]
    pub fn lock_id(&self) -> &LockIdentity {
        &self.lock_id
    }

    /// Returns true if the inner listener is running.
    pub async fn is_listening(&self) -> bool {
        self.state.lock().await.started
    }

    /// Returns true if start was deferred and recovery is polling.
    pub async fn is_deferred(&self) -> bool {
        let state = self.state.lock().await;
        !state.started
            && state
                .recovery
                .as_ref()
                .is_some_and(|recovery| !recovery.task.is_finished())
    }

    /// Starts the listener if the lock is free, otherwise defers the start
    /// to a recovery task.
    ///
    /// # Errors
    ///
    /// Returns lock errors and inner listener start errors. The lock is
    /// released if the inner listener fails to start.
    pub async fn start(&self, cancel: CancellationToken) -> Result<()> {
        let mut state = self.state.lock().await;
        if state.started || state.recovery.is_some() {
            return Ok(());
        }

        let acquired = self
            .coordinator
            .lock(
                &self.lock_id,
                Some(self.coordinator.instance_id()),
                &self.options,
                &cancel,
                false,
            )
            .await?;

        match acquired {
            Some(handle) => {
                if let Err(e) = self.inner.start(cancel.clone()).await {
                    release_quietly(&self.coordinator, handle).await;
                    return Err(e);
                }
                let lost = handle.lease_lost();
                state.lock = Some(handle);
                state.started = true;
                state.recovery = Some(self.spawn_supervisor(cancel, Some(lost)));
            }
            None => {
                tracing::info!(
                    lock_id = %self.lock_id,
                    "unable to acquire singleton lock ({}), listener start deferred",
                    self.lock_id
                );
                state.recovery = Some(self.spawn_supervisor(cancel, None));
            }
        }
        Ok(())
    }

    /// Spawns the task that owns the lock for the listener's lifetime.
    ///
    /// While the lock is held the task waits for lease loss; it then stops the
    /// inner listener, drops the dead lease and polls for the lock again. While
    /// the lock is not held it polls and starts the listener once acquired.
    fn spawn_supervisor(
        &self,
        parent: CancellationToken,
        held: Option<CancellationToken>,
    ) -> Recovery {
        let cancel = self.shutdown.child_token();
        let inner = self.inner.clone();
        let coordinator = self.coordinator.clone();
        let lock_id = self.lock_id.clone();
        let options = self.options.clone();
        let state = self.state.clone();
        let token = cancel.clone();
        let span = lock_span("listener_recovery", lock_id.as_str(), options.account_name());

        let task = tokio::spawn(
            async move {
                let interval = coordinator.policy().listener_recovery_poll_interval;
                let mut held = held;
                loop {
                    let lost = match held.take() {
                        Some(lost) => lost,
                        None => loop {
                            tokio::select! {
                                biased;
                                () = token.cancelled() => return,
                                () = parent.cancelled() => return,
                                () = tokio::time::sleep(interval) => {}
                            }

                            let handle = match coordinator
                                .lock(
                                    &lock_id,
                                    Some(coordinator.instance_id()),
                                    &options,
                                    &token,
                                    false,
                                )
                                .await
                            {
                                Ok(Some(handle)) => handle,
                                Ok(None) => continue,
                                Err(e) => {
                                    if token.is_cancelled() {
                                        return;
                                    }
                                    tracing::warn!(error = %e, "listener lock recovery attempt failed");
                                    continue;
                                }
                            };

                            if let Err(e) = inner.start(token.clone()).await {
                                tracing::error!(error = %e, "listener failed to start after lock recovery");
                                release_quietly(&coordinator, handle).await;
                                continue;
                            }

                            let lost = handle.lease_lost();
                            let mut state = state.lock().await;
                            state.lock = Some(handle);
                            state.started = true;
                            tracing::info!("listener lock recovered, listener started");
                            break lost;
                        },
                    };

                    tokio::select! {
                        biased;
                        () = token.cancelled() => return,
                        () = lost.cancelled() => {}
                    }

                    let mut state = state.lock().await;
                    tracing::error!("listener lock lease lost, stopping listener");
                    if state.started {
                        state.started = false;
                        if let Err(e) = inner.stop().await {
                            tracing::warn!(error = %e, "listener failed to stop after lease loss");
                        }
                    }
                    if let Some(handle) = state.lock.take() {
                        release_quietly(&coordinator, handle).await;
                    }
                }
            }
            .instrument(span),
        );

        Recovery { cancel, task }
    }

    /// Stops recovery, stops the inner listener and releases the lock.
    ///
    /// # Errors
    ///
    /// Returns the inner listener's stop error; the lock is released
    /// regardless.
    pub async fn stop(&self) -> Result<()> {
        let recovery = self.state.lock().await.recovery.take();
        if let Some(recovery) = recovery {
            recovery.cancel.cancel();
            if let Err(e) = recovery.task.await {
                tracing::warn!(error = %e, "listener recovery task ended abnormally");
            }
        }

        let mut state = self.state.lock().await;
        let stopped = if state.started {
            state.started = false;
            self.inner.stop().await
        } else {
            Ok(())
        };

        if let Some(handle) = state.lock.take() {
            self.coordinator
                .release(handle, &CancellationToken::new())
                .await?;
        }
        stopped
    }

    /// Cancels recovery and any in-progress inner start. A cancelled
    /// listener does not defer again.
    pub fn cancel(&self) {
        self.shutdown.cancel();
        self.inner.cancel();
    }
}

async fn release_quietly(coordinator: &SingletonCoordinator, handle: RenewableLockHandle) {
    let lock_id = handle.lock_id().clone();
    if let Err(e) = coordinator.release(handle, &CancellationToken::new()).await {
        tracing::warn!(lock_id = %lock_id, error = %e, "failed to release listener lock");
    }
}
