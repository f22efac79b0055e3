//! Shared test utilities for vigil crates.
//!
//! This crate provides:
//! - [`RecordingLockStore`]: lock store with operation recording and fault injection
//! - Fixtures for lease stores backed by in-memory storage
//!
//! # Example
//!
//! ```rust,ignore
//! use vigil_test_utils::{InjectedFault, OpKind, RecordingLockStore};
//!
//! #[tokio::test]
//! async fn test_example() {
//!     let store = RecordingLockStore::new("vigil-hosts");
//!     store.inject(OpKind::Renew, InjectedFault::Server, Some(1));
//!     // ... run test ...
//!     assert_eq!(store.count(OpKind::Renew), 3);
//! }
//! ```

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]
#![allow(clippy::must_use_candidate)]
// Test utilities use expect/unwrap for cleaner test code - panics are acceptable in tests
#![allow(clippy::expect_used)]
#![allow(clippy::unwrap_used)]
#![allow(clippy::missing_panics_doc)]

pub mod fixtures;
pub mod store;

pub use fixtures::*;
pub use store::*;

/// Initialize test logging (call once per test module).
pub fn init_test_logging() {
    use tracing_subscriber::{EnvFilter, fmt};

    let _ = fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive("vigil=debug".parse().expect("valid directive")),
        )
        .with_test_writer()
        .try_init();
}
