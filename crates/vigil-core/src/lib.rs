//! # vigil-core
//!
//! Lease primitives over cloud object storage.
//!
//! This crate provides the storage-facing half of vigil singleton locks:
//!
//! - **Storage Backend**: container-aware object storage with CAS writes
//! - **Lock Store**: lease acquire/renew/release and owner metadata over a
//!   storage backend
//! - **Lease Acquirer**: the optimistic acquire-or-create protocol
//! - **Error Types**: the storage failure taxonomy shared by all vigil crates
//!
//! ## Example
//!
//! ```rust
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! use vigil_core::prelude::*;
//!
//! # async fn example() -> vigil_core::Result<()> {
//! let backend = Arc::new(MemoryBackend::new());
//! let store = ObjectLeaseStore::new(backend, "vigil-hosts");
//! let acquirer = LeaseAcquirer::new(Arc::new(store));
//!
//! // Container and record are created on first use.
//! let lease = acquirer
//!     .acquire("locks/host-1/jobs.Nightly", Duration::from_secs(15), "lease-1")
//!     .await?;
//! assert_eq!(lease.as_deref(), Some("lease-1"));
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]

pub mod error;
pub mod lease;
pub mod lease_store;
pub mod observability;
pub mod storage;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::error::{Error, ErrorKind, Result};
    pub use crate::lease::LeaseAcquirer;
    pub use crate::lease_store::{
        LeaseProperties, LeaseState, LockStore, OWNER_METADATA_KEY, ObjectLeaseStore,
    };
    pub use crate::storage::{
        MemoryBackend, ObjectMeta, StorageBackend, VersionedObject, WritePrecondition,
        WriteResult,
    };
}

// Re-export key types at crate root for ergonomics
pub use error::{Error, ErrorKind, Result};
pub use lease::LeaseAcquirer;
pub use lease_store::{LeaseProperties, LeaseState, LockStore, OWNER_METADATA_KEY, ObjectLeaseStore};
pub use observability::{LogFormat, init_logging};
pub use storage::{
    MemoryBackend, ObjectMeta, StorageBackend, VersionedObject, WritePrecondition, WriteResult,
};
