//! Test lock store with operation recording and fault injection.
//!
//! [`RecordingLockStore`] wraps any [`LockStore`] (an in-memory
//! [`ObjectLeaseStore`] by default), records every call for assertions and
//! can fail selected operations with classified errors.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use vigil_core::error::{Error, Result};
use vigil_core::lease_store::{LeaseProperties, LockStore, ObjectLeaseStore};
use vigil_core::storage::MemoryBackend;

/// Record of a lock store operation for test assertions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreOp {
    /// Container provisioning.
    CreateContainer,
    /// Existence check.
    Exists {
        /// Path that was checked.
        path: String,
    },
    /// Object creation.
    Create {
        /// Path that was created.
        path: String,
    },
    /// Lease acquisition attempt.
    Acquire {
        /// Path of the lock record.
        path: String,
        /// Requested lease period.
        period: Duration,
        /// Proposed lease id.
        proposed_lease_id: String,
    },
    /// Lease renewal attempt.
    Renew {
        /// Path of the lock record.
        path: String,
        /// Lease id being renewed.
        lease_id: String,
    },
    /// Lease release attempt.
    Release {
        /// Path of the lock record.
        path: String,
        /// Lease id being released.
        lease_id: String,
    },
    /// Metadata read.
    ReadMetadata {
        /// Path of the lock record.
        path: String,
    },
    /// Metadata write.
    WriteMetadata {
        /// Path of the lock record.
        path: String,
        /// Lease id used for the write.
        lease_id: String,
    },
}

impl StoreOp {
    /// Returns the kind of this operation.
    pub fn kind(&self) -> OpKind {
        match self {
            Self::CreateContainer => OpKind::CreateContainer,
            Self::Exists { .. } => OpKind::Exists,
            Self::Create { .. } => OpKind::Create,
            Self::Acquire { .. } => OpKind::Acquire,
            Self::Renew { .. } => OpKind::Renew,
            Self::Release { .. } => OpKind::Release,
            Self::ReadMetadata { .. } => OpKind::ReadMetadata,
            Self::WriteMetadata { .. } => OpKind::WriteMetadata,
        }
    }
}

/// Operation kinds, used for counting and fault targeting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpKind {
    /// `create_container_if_missing`
    CreateContainer,
    /// `exists`
    Exists,
    /// `create_if_missing`
    Create,
    /// `acquire_lease`
    Acquire,
    /// `renew_lease`
    Renew,
    /// `release_lease`
    Release,
    /// `read_metadata`
    ReadMetadata,
    /// `write_metadata`
    WriteMetadata,
}

/// Classified failure returned by an injected fault.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InjectedFault {
    /// Transient server error.
    Server,
    /// Non-retryable storage error (e.g. permission denied).
    Fatal,
    /// Lease conflict.
    Conflict,
    /// Missing object.
    NotFound,
}

impl InjectedFault {
    fn to_error(self, op: OpKind) -> Error {
        match self {
            Self::Server => Error::server(format!("injected server error for {op:?}")),
            Self::Fatal => Error::storage(format!("injected permission denied for {op:?}")),
            Self::Conflict => Error::conflict(format!("injected conflict for {op:?}")),
            Self::NotFound => Error::NotFound(format!("injected not found for {op:?}")),
        }
    }
}

#[derive(Debug, Clone)]
struct FaultRule {
    kind: OpKind,
    fault: InjectedFault,
    skip: u32,
    remaining: Option<u32>,
}

/// Lock store wrapper that records operations and injects failures.
#[derive(Clone)]
pub struct RecordingLockStore {
    inner: Arc<dyn LockStore>,
    backend: Option<Arc<MemoryBackend>>,
    operations: Arc<Mutex<Vec<StoreOp>>>,
    faults: Arc<Mutex<Vec<FaultRule>>>,
    latency: Option<Duration>,
}

impl std::fmt::Debug for RecordingLockStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecordingLockStore")
            .field("container", &self.inner.container())
            .field("latency", &self.latency)
            .finish_non_exhaustive()
    }
}

impl RecordingLockStore {
    /// Creates a recording store over a fresh in-memory backend.
    pub fn new(container: impl Into<String>) -> Self {
        let backend = Arc::new(MemoryBackend::new());
        let inner = Arc::new(ObjectLeaseStore::new(backend.clone(), container));
        Self {
            inner,
            backend: Some(backend),
            operations: Arc::default(),
            faults: Arc::default(),
            latency: None,
        }
    }

    /// Wraps an existing store.
    pub fn wrapping(inner: Arc<dyn LockStore>) -> Self {
        Self {
            inner,
            backend: None,
            operations: Arc::default(),
            faults: Arc::default(),
            latency: None,
        }
    }

    /// Adds simulated latency to every operation.
    #[must_use]
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Returns the in-memory backend, if this store created one.
    pub fn backend(&self) -> Option<&Arc<MemoryBackend>> {
        self.backend.as_ref()
    }

    /// Returns all recorded operations.
    pub fn operations(&self) -> Vec<StoreOp> {
        self.operations.lock().expect("lock").clone()
    }

    /// Returns how many operations of `kind` were recorded.
    pub fn count(&self, kind: OpKind) -> usize {
        self.operations
            .lock()
            .expect("lock")
            .iter()
            .filter(|op| op.kind() == kind)
            .count()
    }

    /// Clears recorded operations.
    pub fn clear_operations(&self) {
        self.operations.lock().expect("lock").clear();
    }

    /// Fails the next `times` operations of `kind` (all of them if `None`).
    pub fn inject(&self, kind: OpKind, fault: InjectedFault, times: Option<u32>) {
        self.inject_after(kind, 0, fault, times);
    }

    /// Lets the next `skip` operations of `kind` through, then fails the
    /// following `times` of them.
    pub fn inject_after(&self, kind: OpKind, skip: u32, fault: InjectedFault, times: Option<u32>) {
        self.faults.lock().expect("lock").push(FaultRule {
            kind,
            fault,
            skip,
            remaining: times,
        });
    }

    /// Clears all injected failures.
    pub fn clear_faults(&self) {
        self.faults.lock().expect("lock").clear();
    }

    async fn enter(&self, op: StoreOp) -> Result<()> {
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }

        let kind = op.kind();
        self.operations.lock().expect("lock").push(op);

        let mut faults = self.faults.lock().expect("lock");
        let Some(index) = faults.iter().position(|rule| rule.kind == kind) else {
            return Ok(());
        };

        let rule = &mut faults[index];
        if rule.skip > 0 {
            rule.skip -= 1;
            return Ok(());
        }
        let fault = rule.fault;
        let exhausted = match rule.remaining.as_mut() {
            Some(remaining) => {
                *remaining = remaining.saturating_sub(1);
                *remaining == 0
            }
            None => false,
        };
        if exhausted {
            faults.remove(index);
        }
        Err(fault.to_error(kind))
    }
}

#[async_trait::async_trait]
impl LockStore for RecordingLockStore {
    fn container(&self) -> &str {
        self.inner.container()
    }

    async fn create_container_if_missing(&self) -> Result<()> {
        self.enter(StoreOp::CreateContainer).await?;
        self.inner.create_container_if_missing().await
    }

    async fn exists(&self, path: &str) -> Result<bool> {
        self.enter(StoreOp::Exists {
            path: path.to_string(),
        })
        .await?;
        self.inner.exists(path).await
    }

    async fn create_if_missing(&self, path: &str) -> Result<()> {
        self.enter(StoreOp::Create {
            path: path.to_string(),
        })
        .await?;
        self.inner.create_if_missing(path).await
    }

    async fn acquire_lease(
        &self,
        path: &str,
        period: Duration,
        proposed_lease_id: &str,
    ) -> Result<String> {
        self.enter(StoreOp::Acquire {
            path: path.to_string(),
            period,
            proposed_lease_id: proposed_lease_id.to_string(),
        })
        .await?;
        self.inner
            .acquire_lease(path, period, proposed_lease_id)
            .await
    }

    async fn renew_lease(&self, path: &str, lease_id: &str) -> Result<()> {
        self.enter(StoreOp::Renew {
            path: path.to_string(),
            lease_id: lease_id.to_string(),
        })
        .await?;
        self.inner.renew_lease(path, lease_id).await
    }

    async fn release_lease(&self, path: &str, lease_id: &str) -> Result<()> {
        self.enter(StoreOp::Release {
            path: path.to_string(),
            lease_id: lease_id.to_string(),
        })
        .await?;
        self.inner.release_lease(path, lease_id).await
    }

    async fn read_metadata(&self, path: &str) -> Result<LeaseProperties> {
        self.enter(StoreOp::ReadMetadata {
            path: path.to_string(),
        })
        .await?;
        self.inner.read_metadata(path).await
    }

    async fn write_metadata(
        &self,
        path: &str,
        lease_id: &str,
        metadata: &HashMap<String, String>,
    ) -> Result<()> {
        self.enter(StoreOp::WriteMetadata {
            path: path.to_string(),
            lease_id: lease_id.to_string(),
        })
        .await?;
        self.inner.write_metadata(path, lease_id, metadata).await
    }
}
