//! Storage backend abstraction for object storage (GCS, S3, Azure, local).
//!
//! Lock records live in a well-known container. Backends expose:
//! - Idempotent container provisioning
//! - Conditional writes with preconditions (the only mutation primitive)
//! - Object metadata including an opaque version token
//!
//! Backends never delete objects on behalf of the lock layer, so this trait
//! does not offer a delete operation.
//!
//! ## Version Tokens
//!
//! The version token is an opaque `String`:
//! - GCS: numeric generation (stored as string)
//! - S3: `ETag` or version ID
//! - Azure: `ETag`

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use crate::error::{Error, Result};

/// Precondition for conditional writes (CAS operations).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WritePrecondition {
    /// Write only if object does not exist.
    DoesNotExist,
    /// Write only if object's version matches the given token.
    MatchesVersion(String),
    /// Write unconditionally.
    None,
}

/// Result of a conditional write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteResult {
    /// Write succeeded, returns new version token.
    Success {
        /// The new version token after the write.
        version: String,
    },
    /// Precondition failed, returns current version token.
    PreconditionFailed {
        /// The current version that caused the precondition to fail.
        current_version: String,
    },
}

/// Metadata about a stored object.
#[derive(Debug, Clone)]
pub struct ObjectMeta {
    /// Container holding the object.
    pub container: String,
    /// Object path (key) within the container.
    pub path: String,
    /// Object size in bytes.
    pub size: u64,
    /// Object version token for CAS operations.
    pub version: String,
    /// Last modification timestamp.
    pub last_modified: Option<DateTime<Utc>>,
}

/// An object body together with the metadata it was read at.
///
/// Reading both in one call binds any later CAS write to the exact version the
/// caller inspected.
#[derive(Debug, Clone)]
pub struct VersionedObject {
    /// Object contents.
    pub data: Bytes,
    /// Metadata captured with the contents.
    pub meta: ObjectMeta,
}

/// Storage backend trait for object storage.
///
/// All backends (cloud, memory) implement this trait. Object operations on a
/// missing container fail with [`Error::ContainerNotFound`]; object reads on a
/// missing object fail with [`Error::NotFound`].
#[async_trait]
pub trait StorageBackend: Send + Sync + 'static {
    /// Creates the container if it does not exist.
    ///
    /// Returns `true` if the container was created by this call.
    async fn create_container_if_missing(&self, container: &str) -> Result<bool>;

    /// Reads an entire object with its current version.
    async fn get(&self, container: &str, path: &str) -> Result<VersionedObject>;

    /// Writes with optional precondition.
    ///
    /// Returns `WriteResult::PreconditionFailed` if precondition not met.
    /// Never returns error for precondition failure - that's a normal result.
    async fn put(
        &self,
        container: &str,
        path: &str,
        data: Bytes,
        precondition: WritePrecondition,
    ) -> Result<WriteResult>;

    /// Gets object metadata without reading content.
    ///
    /// Returns `None` if the object doesn't exist.
    async fn head(&self, container: &str, path: &str) -> Result<Option<ObjectMeta>>;
}

/// In-memory storage backend for testing.
///
/// Thread-safe via `RwLock`. Not suitable for production.
/// Uses numeric versions internally (stored as strings) to simulate GCS-like behavior.
#[derive(Debug, Default, Clone)]
pub struct MemoryBackend {
    containers: Arc<RwLock<HashMap<String, HashMap<String, StoredObject>>>>,
}

#[derive(Debug, Clone)]
struct StoredObject {
    data: Bytes,
    version: i64,
    last_modified: DateTime<Utc>,
}

impl StoredObject {
    fn meta(&self, container: &str, path: &str) -> ObjectMeta {
        ObjectMeta {
            container: container.to_string(),
            path: path.to_string(),
            size: self.data.len() as u64,
            version: self.version.to_string(),
            last_modified: Some(self.last_modified),
        }
    }
}

fn poisoned() -> Error {
    Error::Internal {
        message: "lock poisoned".into(),
    }
}

impl MemoryBackend {
    /// Creates a new empty memory backend with no containers.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true if the container exists.
    #[must_use]
    pub fn has_container(&self, container: &str) -> bool {
        self.containers
            .read()
            .is_ok_and(|containers| containers.contains_key(container))
    }

    /// Returns the number of objects stored in a container.
    #[must_use]
    pub fn object_count(&self, container: &str) -> usize {
        self.containers
            .read()
            .ok()
            .and_then(|containers| containers.get(container).map(HashMap::len))
            .unwrap_or(0)
    }
}

#[async_trait]
impl StorageBackend for MemoryBackend {
    async fn create_container_if_missing(&self, container: &str) -> Result<bool> {
        let mut containers = self.containers.write().map_err(|_| poisoned())?;
        if containers.contains_key(container) {
            return Ok(false);
        }
        containers.insert(container.to_string(), HashMap::new());
        Ok(true)
    }

    async fn get(&self, container: &str, path: &str) -> Result<VersionedObject> {
        let containers = self.containers.read().map_err(|_| poisoned())?;
        let objects = containers
            .get(container)
            .ok_or_else(|| Error::ContainerNotFound(container.to_string()))?;

        objects
            .get(path)
            .map(|obj| VersionedObject {
                data: obj.data.clone(),
                meta: obj.meta(container, path),
            })
            .ok_or_else(|| Error::NotFound(format!("object not found: {container}/{path}")))
    }

    async fn put(
        &self,
        container: &str,
        path: &str,
        data: Bytes,
        precondition: WritePrecondition,
    ) -> Result<WriteResult> {
        let mut containers = self.containers.write().map_err(|_| poisoned())?;
        let objects = containers
            .get_mut(container)
            .ok_or_else(|| Error::ContainerNotFound(container.to_string()))?;

        let current = objects.get(path);

        match precondition {
            WritePrecondition::DoesNotExist => {
                if let Some(obj) = current {
                    return Ok(WriteResult::PreconditionFailed {
                        current_version: obj.version.to_string(),
                    });
                }
            }
            WritePrecondition::MatchesVersion(expected) => {
                let expected_num: i64 = expected.parse().unwrap_or(-1);
                match current {
                    Some(obj) if obj.version != expected_num => {
                        return Ok(WriteResult::PreconditionFailed {
                            current_version: obj.version.to_string(),
                        });
                    }
                    None => {
                        return Ok(WriteResult::PreconditionFailed {
                            current_version: "0".to_string(),
                        });
                    }
                    _ => {}
                }
            }
            WritePrecondition::None => {}
        }

        let new_version = current.map_or(1, |o| o.version + 1);
        objects.insert(
            path.to_string(),
            StoredObject {
                data,
                version: new_version,
                last_modified: Utc::now(),
            },
        );
        drop(containers);

        Ok(WriteResult::Success {
            version: new_version.to_string(),
        })
    }

    async fn head(&self, container: &str, path: &str) -> Result<Option<ObjectMeta>> {
        let containers = self.containers.read().map_err(|_| poisoned())?;
        let objects = containers
            .get(container)
            .ok_or_else(|| Error::ContainerNotFound(container.to_string()))?;

        Ok(objects.get(path).map(|obj| obj.meta(container, path)))
    }
}
