//! # vigil-singleton
//!
//! Singleton job coordination over object-storage leases.
//!
//! A singleton lock guarantees that only one instance of a named unit of work
//! runs at a time across a fleet of processes. This crate builds that on top
//! of the lease primitives in `vigil-core`:
//!
//! - **Lock Identity**: deterministic keys from host id, job name and scope
//! - **Declarations**: registration-time validation of singleton requests
//! - **Lock Manager**: per-account lease operations
//! - **Renewal**: background lease renewal with speedup on transient failures
//! - **Coordinator**: poll-with-timeout acquisition, release and owner lookup
//! - **Listener / Invoker**: listener-mode gating and function-mode execution
//!
//! ## Example
//!
//! ```rust
//! use std::sync::Arc;
//!
//! use tokio_util::sync::CancellationToken;
//! use vigil_core::prelude::*;
//! use vigil_singleton::prelude::*;
//!
//! # async fn example() -> vigil_singleton::Result<()> {
//! let store = ObjectLeaseStore::new(Arc::new(MemoryBackend::new()), "vigil-hosts");
//! let manager = Arc::new(LockManager::with_store(Arc::new(store)));
//! let coordinator = SingletonCoordinator::new(
//!     manager,
//!     SingletonPolicy::default(),
//!     Arc::new(FixedHostIdProvider::new("host-1")?),
//! )?;
//!
//! let lock_id = LockIdentity::function("host-1", "jobs.Nightly", None);
//! let cancel = CancellationToken::new();
//! if let Some(handle) = coordinator
//!     .lock(&lock_id, Some("instance-1"), &LockOptions::default(), &cancel, false)
//!     .await?
//! {
//!     // ... exclusive work ...
//!     coordinator.release(handle, &cancel).await?;
//! }
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]

pub mod config;
pub mod coordinator;
pub mod declaration;
pub mod error;
pub mod host;
pub mod identity;
pub mod invoker;
pub mod listener;
pub mod manager;
pub mod metrics;
pub mod renewal;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::config::{SingletonConfig, SingletonPolicy};
    pub use crate::coordinator::{LockOptions, RenewableLockHandle, SingletonCoordinator};
    pub use crate::declaration::{
        JobDescriptor, SingletonDeclaration, SingletonMode, SingletonPlan, SingletonScope,
    };
    pub use crate::error::{Error, Result};
    pub use crate::host::{FixedHostIdProvider, HostIdProvider};
    pub use crate::identity::{BindingData, LockIdentity, NameResolver};
    pub use crate::invoker::SingletonInvoker;
    pub use crate::listener::{Listener, SingletonListener};
    pub use crate::manager::{LockManager, LockStoreProvider, StaticLockStoreProvider};
    pub use crate::renewal::{FaultSink, LeaseFault};
}

pub use config::{SingletonConfig, SingletonPolicy};
pub use coordinator::{LockOptions, RenewableLockHandle, SingletonCoordinator};
pub use error::{Error, Result};
pub use identity::LockIdentity;
