//! Lease capability surface over backing object storage.
//!
//! [`LockStore`] is the narrow set of operations the lock layer needs:
//! container provisioning, object creation, lease acquire/renew/release and
//! metadata access. Failures are classified through [`Error::kind`]:
//!
//! | Operation | `NotFound` | `Conflict` |
//! |-----------|------------|------------|
//! | `acquire_lease` | object or container missing | live lease held under another id |
//! | `renew_lease` | object or container missing | lease id mismatch or no lease |
//! | `release_lease` | object or container missing | lease id mismatch or no lease |
//! | `create_if_missing` | container missing | object already exists |
//! | `write_metadata` | object or container missing | caller does not hold the lease |
//!
//! [`ObjectLeaseStore`] implements these semantics over any CAS-capable
//! [`StorageBackend`]. The lease lives inside the object as a small JSON
//! record, and every mutation is a version-conditioned write, so concurrent
//! acquirers serialize on the storage side.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::storage::{StorageBackend, WritePrecondition, WriteResult};

/// Metadata key recording the instance id of the current lease holder.
pub const OWNER_METADATA_KEY: &str = "FunctionInstance";

/// Observable state of a lease on a lock record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaseState {
    /// No live lease; the record can be acquired.
    Available,
    /// A live lease is held.
    Leased,
}

/// Properties of a lock record returned by [`LockStore::read_metadata`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaseProperties {
    /// Whether a live lease is held.
    pub state: LeaseState,
    /// Period of the current lease, if leased.
    pub lease_period: Option<Duration>,
    /// User metadata stored on the record.
    ///
    /// May contain stale values written by an earlier holder.
    pub metadata: HashMap<String, String>,
}

impl LeaseProperties {
    /// Returns true if a live lease is held.
    #[must_use]
    pub fn is_leased(&self) -> bool {
        self.state == LeaseState::Leased
    }
}

/// Lease operations over a single container of lock records.
#[async_trait]
pub trait LockStore: Send + Sync + 'static {
    /// Name of the container holding the lock records.
    fn container(&self) -> &str;

    /// Creates the backing container if it does not exist.
    async fn create_container_if_missing(&self) -> Result<()>;

    /// Returns true if the object exists.
    async fn exists(&self, path: &str) -> Result<bool>;

    /// Creates an empty, unleased object.
    async fn create_if_missing(&self, path: &str) -> Result<()>;

    /// Acquires a lease, returning the lease id.
    async fn acquire_lease(
        &self,
        path: &str,
        period: Duration,
        proposed_lease_id: &str,
    ) -> Result<String>;

    /// Extends a held lease by its original period.
    async fn renew_lease(&self, path: &str, lease_id: &str) -> Result<()>;

    /// Releases a held lease.
    async fn release_lease(&self, path: &str, lease_id: &str) -> Result<()>;

    /// Reads lease state and metadata without acquiring anything.
    async fn read_metadata(&self, path: &str) -> Result<LeaseProperties>;

    /// Replaces the record's metadata. Requires the live lease id.
    async fn write_metadata(
        &self,
        path: &str,
        lease_id: &str,
        metadata: &HashMap<String, String>,
    ) -> Result<()>;
}

/// Lease record persisted as the object body.
///
/// An empty body decodes to an unleased record with no metadata.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LeaseRecord {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    lease: Option<ActiveLease>,

    #[serde(default)]
    metadata: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ActiveLease {
    lease_id: String,
    expires_at: DateTime<Utc>,
    period_ms: u64,
}

impl ActiveLease {
    fn new(lease_id: &str, period: Duration, now: DateTime<Utc>) -> Self {
        Self {
            lease_id: lease_id.to_string(),
            expires_at: expiry(now, period),
            period_ms: u64::try_from(period.as_millis()).unwrap_or(u64::MAX),
        }
    }

    fn is_live(&self, now: DateTime<Utc>) -> bool {
        now < self.expires_at
    }

    fn period(&self) -> Duration {
        Duration::from_millis(self.period_ms)
    }
}

fn expiry(now: DateTime<Utc>, period: Duration) -> DateTime<Utc> {
    now + chrono::Duration::from_std(period).unwrap_or(chrono::Duration::seconds(60))
}

impl LeaseRecord {
    fn decode(data: &[u8]) -> Result<Self> {
        if data.is_empty() {
            return Ok(Self::default());
        }
        serde_json::from_slice(data).map_err(|e| Error::Serialization {
            message: format!("parse lease record: {e}"),
        })
    }

    fn encode(&self) -> Result<Bytes> {
        serde_json::to_vec(self)
            .map(Bytes::from)
            .map_err(|e| Error::Serialization {
                message: format!("serialize lease record: {e}"),
            })
    }

    fn live_lease(&self, now: DateTime<Utc>) -> Option<&ActiveLease> {
        self.lease.as_ref().filter(|lease| lease.is_live(now))
    }
}

/// [`LockStore`] implemented over a CAS-capable object store.
pub struct ObjectLeaseStore<S: StorageBackend + ?Sized> {
    storage: Arc<S>,
    container: String,
}

// Manual Clone implementation to avoid requiring S: Clone
impl<S: StorageBackend + ?Sized> Clone for ObjectLeaseStore<S> {
    fn clone(&self) -> Self {
        Self {
            storage: Arc::clone(&self.storage),
            container: self.container.clone(),
        }
    }
}

impl<S: StorageBackend + ?Sized> ObjectLeaseStore<S> {
    /// Creates a lease store for lock records in `container`.
    #[must_use]
    pub fn new(storage: Arc<S>, container: impl Into<String>) -> Self {
        Self {
            storage,
            container: container.into(),
        }
    }

    /// Returns the underlying storage backend.
    #[must_use]
    pub fn storage(&self) -> &Arc<S> {
        &self.storage
    }

    async fn load(&self, path: &str) -> Result<(LeaseRecord, String)> {
        let object = self.storage.get(&self.container, path).await?;
        let record = LeaseRecord::decode(&object.data)?;
        Ok((record, object.meta.version))
    }

    /// Writes `record` only if the object is still at `version`.
    async fn store(&self, path: &str, record: &LeaseRecord, version: String) -> Result<()> {
        match self
            .storage
            .put(
                &self.container,
                path,
                record.encode()?,
                WritePrecondition::MatchesVersion(version),
            )
            .await?
        {
            WriteResult::Success { .. } => Ok(()),
            WriteResult::PreconditionFailed { .. } => Err(Error::conflict(format!(
                "lease record {path} modified concurrently"
            ))),
        }
    }
}

#[async_trait]
impl<S: StorageBackend + ?Sized> LockStore for ObjectLeaseStore<S> {
    fn container(&self) -> &str {
        &self.container
    }

    async fn create_container_if_missing(&self) -> Result<()> {
        if self
            .storage
            .create_container_if_missing(&self.container)
            .await?
        {
            tracing::debug!(container = %self.container, "created lock container");
        }
        Ok(())
    }

    async fn exists(&self, path: &str) -> Result<bool> {
        match self.storage.head(&self.container, path).await {
            Ok(meta) => Ok(meta.is_some()),
            Err(Error::ContainerNotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn create_if_missing(&self, path: &str) -> Result<()> {
        match self
            .storage
            .put(
                &self.container,
                path,
                Bytes::new(),
                WritePrecondition::DoesNotExist,
            )
            .await?
        {
            WriteResult::Success { .. } => Ok(()),
            WriteResult::PreconditionFailed { .. } => {
                Err(Error::conflict(format!("lock record {path} already exists")))
            }
        }
    }

    async fn acquire_lease(
        &self,
        path: &str,
        period: Duration,
        proposed_lease_id: &str,
    ) -> Result<String> {
        if period.is_zero() {
            return Err(Error::InvalidInput("lease period must be positive".into()));
        }

        let (mut record, version) = self.load(path).await?;
        let now = Utc::now();

        if let Some(current) = record.live_lease(now) {
            if current.lease_id != proposed_lease_id {
                return Err(Error::conflict(format!(
                    "lease already present on {path}"
                )));
            }
        }

        record.lease = Some(ActiveLease::new(proposed_lease_id, period, now));
        self.store(path, &record, version).await?;
        Ok(proposed_lease_id.to_string())
    }

    async fn renew_lease(&self, path: &str, lease_id: &str) -> Result<()> {
        let (mut record, version) = self.load(path).await?;

        // An expired lease can still be renewed while nobody has replaced it.
        match record.lease.as_mut() {
            Some(lease) if lease.lease_id == lease_id => {
                lease.expires_at = expiry(Utc::now(), lease.period());
            }
            Some(_) => {
                return Err(Error::conflict(format!(
                    "lease id mismatch on {path}"
                )));
            }
            None => {
                return Err(Error::conflict(format!("no lease present on {path}")));
            }
        }

        self.store(path, &record, version).await
    }

    async fn release_lease(&self, path: &str, lease_id: &str) -> Result<()> {
        let (mut record, version) = self.load(path).await?;

        match record.lease.as_ref() {
            Some(lease) if lease.lease_id == lease_id => {
                record.lease = None;
                self.store(path, &record, version).await
            }
            Some(_) => Err(Error::conflict(format!("lease id mismatch on {path}"))),
            None => Err(Error::conflict(format!("no lease present on {path}"))),
        }
    }

    async fn read_metadata(&self, path: &str) -> Result<LeaseProperties> {
        let (record, _) = self.load(path).await?;
        let live = record.live_lease(Utc::now());

        Ok(LeaseProperties {
            state: if live.is_some() {
                LeaseState::Leased
            } else {
                LeaseState::Available
            },
            lease_period: live.map(ActiveLease::period),
            metadata: record.metadata.into_iter().collect(),
        })
    }

    async fn write_metadata(
        &self,
        path: &str,
        lease_id: &str,
        metadata: &HashMap<String, String>,
    ) -> Result<()> {
        let (mut record, version) = self.load(path).await?;

        match record.live_lease(Utc::now()) {
            Some(lease) if lease.lease_id == lease_id => {}
            _ => {
                return Err(Error::conflict(format!(
                    "lease {lease_id} not held on {path}"
                )));
            }
        }

        record.metadata = metadata
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        self.store(path, &record, version).await
    }
}
