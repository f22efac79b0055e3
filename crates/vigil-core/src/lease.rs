//! Optimistic acquire-or-create lease protocol.
//!
//! [`LeaseAcquirer`] sits on top of a [`LockStore`] and turns its classified
//! errors into lock semantics:
//!
//! 1. Try to acquire the lease directly (the common path is one round trip).
//! 2. A conflict means someone else holds the lease: return `None`.
//! 3. A missing object is created empty. A missing container is created,
//!    then the object, then acquisition is retried once.
//! 4. Server and fatal errors propagate unchanged.
//!
//! Missing containers and objects heal themselves on first use, so no
//! separate provisioning step is needed.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::lease_store::{LockStore, OWNER_METADATA_KEY};

/// Lease acquisition, renewal and owner bookkeeping over a [`LockStore`].
#[derive(Clone)]
pub struct LeaseAcquirer {
    store: Arc<dyn LockStore>,
}

impl std::fmt::Debug for LeaseAcquirer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LeaseAcquirer")
            .field("container", &self.store.container())
            .finish()
    }
}

impl LeaseAcquirer {
    /// Creates an acquirer over the given store.
    #[must_use]
    pub fn new(store: Arc<dyn LockStore>) -> Self {
        Self { store }
    }

    /// Returns the underlying store.
    #[must_use]
    pub fn store(&self) -> &Arc<dyn LockStore> {
        &self.store
    }

    /// Attempts to acquire a lease on `path`.
    ///
    /// Returns `Ok(None)` if the lease is held by someone else.
    ///
    /// # Errors
    ///
    /// Returns server and fatal storage errors unchanged.
    pub async fn acquire(
        &self,
        path: &str,
        period: Duration,
        proposed_lease_id: &str,
    ) -> Result<Option<String>> {
        match self
            .store
            .acquire_lease(path, period, proposed_lease_id)
            .await
        {
            Ok(lease_id) => return Ok(Some(lease_id)),
            Err(e) if e.is_conflict() => return Ok(None),
            Err(e) if e.is_not_found() => {
                tracing::debug!(path, error = %e, "lock record missing, creating");
            }
            Err(e) => return Err(e),
        }

        if !self.create(path).await? {
            return Ok(None);
        }

        match self
            .store
            .acquire_lease(path, period, proposed_lease_id)
            .await
        {
            Ok(lease_id) => Ok(Some(lease_id)),
            Err(e) if e.is_conflict() => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Creates the lock record, provisioning the container if needed.
    ///
    /// Returns `false` if another writer created the record first.
    async fn create(&self, path: &str) -> Result<bool> {
        match self.store.create_if_missing(path).await {
            Ok(()) => return Ok(true),
            Err(e) if e.is_conflict() => return Ok(false),
            Err(Error::ContainerNotFound(container)) => {
                tracing::info!(container = %container, "lock container missing, creating");
            }
            Err(e) => return Err(e),
        }

        self.store.create_container_if_missing().await?;

        match self.store.create_if_missing(path).await {
            Ok(()) => Ok(true),
            Err(e) if e.is_conflict() => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Renews a held lease.
    ///
    /// # Errors
    ///
    /// Returns the classified store error; callers decide whether it is
    /// recoverable via [`Error::is_transient`].
    pub async fn renew(&self, path: &str, lease_id: &str) -> Result<()> {
        self.store.renew_lease(path, lease_id).await
    }

    /// Releases a held lease.
    ///
    /// A missing record or a lease that is no longer ours counts as released.
    ///
    /// # Errors
    ///
    /// Returns server and fatal storage errors.
    pub async fn release(&self, path: &str, lease_id: &str) -> Result<()> {
        match self.store.release_lease(path, lease_id).await {
            Ok(()) => Ok(()),
            Err(e) if e.is_not_found() || e.is_conflict() => {
                tracing::debug!(path, error = %e, "lease already released");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Reads the instance id of the current lease holder.
    ///
    /// Returns `None` if the record does not exist or the lease is free, even
    /// when stale owner metadata from an earlier holder remains.
    ///
    /// # Errors
    ///
    /// Returns server and fatal storage errors.
    pub async fn read_owner(&self, path: &str) -> Result<Option<String>> {
        let props = match self.store.read_metadata(path).await {
            Ok(props) => props,
            Err(e) if e.is_not_found() => return Ok(None),
            Err(e) => return Err(e),
        };

        if !props.is_leased() {
            return Ok(None);
        }
        Ok(props.metadata.get(OWNER_METADATA_KEY).cloned())
    }

    /// Records `owner_id` as the holder of the lease.
    ///
    /// # Errors
    ///
    /// Returns an error if the lease is not held or storage fails.
    pub async fn write_owner(&self, path: &str, lease_id: &str, owner_id: &str) -> Result<()> {
        let metadata = HashMap::from([(OWNER_METADATA_KEY.to_string(), owner_id.to_string())]);
        self.store.write_metadata(path, lease_id, &metadata).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lease_store::ObjectLeaseStore;
    use crate::storage::MemoryBackend;

    const PERIOD: Duration = Duration::from_secs(30);

    fn acquirer() -> (Arc<MemoryBackend>, LeaseAcquirer) {
        let backend = Arc::new(MemoryBackend::new());
        let store = ObjectLeaseStore::new(backend.clone(), "hosts");
        (backend, LeaseAcquirer::new(Arc::new(store)))
    }

    #[tokio::test]
    async fn test_acquire_creates_container_and_record() {
        let (backend, acquirer) = acquirer();
        assert!(!backend.has_container("hosts"));

        let lease = acquirer
            .acquire("locks/host/job", PERIOD, "lease-1")
            .await
            .expect("acquire");

        assert_eq!(lease.as_deref(), Some("lease-1"));
        assert!(backend.has_container("hosts"));
        assert_eq!(backend.object_count("hosts"), 1);
    }

    #[tokio::test]
    async fn test_contention_returns_none() {
        let (_, acquirer) = acquirer();
        acquirer
            .acquire("locks/job", PERIOD, "lease-1")
            .await
            .expect("acquire")
            .expect("first holder");

        let second = acquirer
            .acquire("locks/job", PERIOD, "lease-2")
            .await
            .expect("acquire");
        assert!(second.is_none());
    }

    #[tokio::test]
    async fn test_release_is_idempotent() {
        let (_, acquirer) = acquirer();
        let lease = acquirer
            .acquire("locks/job", PERIOD, "lease-1")
            .await
            .expect("acquire")
            .expect("held");

        acquirer.release("locks/job", &lease).await.expect("release");
        acquirer
            .release("locks/job", &lease)
            .await
            .expect("second release");
        acquirer
            .release("locks/never-created", "lease-9")
            .await
            .expect("missing record");

        let next = acquirer
            .acquire("locks/job", PERIOD, "lease-2")
            .await
            .expect("acquire");
        assert_eq!(next.as_deref(), Some("lease-2"));
    }

    #[tokio::test]
    async fn test_owner_cleared_when_lease_free() {
        let (_, acquirer) = acquirer();
        assert_eq!(
            acquirer.read_owner("locks/job").await.expect("owner"),
            None
        );

        let lease = acquirer
            .acquire("locks/job", PERIOD, "lease-1")
            .await
            .expect("acquire")
            .expect("held");
        acquirer
            .write_owner("locks/job", &lease, "instance-1")
            .await
            .expect("write owner");
        assert_eq!(
            acquirer.read_owner("locks/job").await.expect("owner"),
            Some("instance-1".to_string())
        );

        // Metadata survives release, but the owner is reported as absent.
        acquirer.release("locks/job", &lease).await.expect("release");
        assert_eq!(
            acquirer.read_owner("locks/job").await.expect("owner"),
            None
        );
    }

    #[tokio::test]
    async fn test_renew_after_takeover_is_conflict() {
        let (_, acquirer) = acquirer();
        let lease = acquirer
            .acquire("locks/job", Duration::from_millis(1), "lease-1")
            .await
            .expect("acquire")
            .expect("held");
        std::thread::sleep(Duration::from_millis(10));

        acquirer
            .acquire("locks/job", PERIOD, "lease-2")
            .await
            .expect("acquire")
            .expect("takeover");

        let err = acquirer
            .renew("locks/job", &lease)
            .await
            .expect_err("lost");
        assert!(err.is_conflict());
        assert!(!err.is_transient());
    }
}
