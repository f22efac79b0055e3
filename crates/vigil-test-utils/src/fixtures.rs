//! Pre-built fixtures for lease store tests.

use std::sync::Arc;

use vigil_core::lease::LeaseAcquirer;
use vigil_core::lease_store::{LockStore, ObjectLeaseStore};
use vigil_core::storage::MemoryBackend;

use crate::store::RecordingLockStore;

/// Container name used by test fixtures.
pub const TEST_CONTAINER: &str = "vigil-hosts";

/// Test context with a shared backend and recording stores over it.
///
/// Stores created from the same context observe each other's leases, which
/// lets a test play several competing processes.
pub struct TestContext {
    /// Shared storage backend.
    pub backend: Arc<MemoryBackend>,
    /// Container holding lock records.
    pub container: String,
}

impl TestContext {
    /// Creates a new context with an empty backend.
    pub fn new() -> Self {
        Self {
            backend: Arc::new(MemoryBackend::new()),
            container: TEST_CONTAINER.to_string(),
        }
    }

    /// Returns a plain lease store over the shared backend.
    pub fn lease_store(&self) -> Arc<dyn LockStore> {
        Arc::new(ObjectLeaseStore::new(
            self.backend.clone(),
            self.container.clone(),
        ))
    }

    /// Returns a recording store over the shared backend.
    pub fn recording_store(&self) -> RecordingLockStore {
        RecordingLockStore::wrapping(self.lease_store())
    }

    /// Returns an acquirer that plays a competing process.
    pub fn competitor(&self) -> LeaseAcquirer {
        LeaseAcquirer::new(self.lease_store())
    }
}

impl Default for TestContext {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn stores_from_one_context_share_leases() {
        let ctx = TestContext::new();
        let recording = ctx.recording_store();
        let competitor = ctx.competitor();

        let held = competitor
            .acquire("locks/job", Duration::from_secs(30), "lease-1")
            .await
            .expect("acquire")
            .expect("held");
        assert_eq!(held, "lease-1");

        let err = recording
            .acquire_lease("locks/job", Duration::from_secs(30), "lease-2")
            .await
            .expect_err("held by competitor");
        assert!(err.is_conflict());
        assert!(ctx.backend.has_container(TEST_CONTAINER));
    }
}
