//! Host identity collaborators.

use async_trait::async_trait;

use crate::error::{Error, Result};

/// Supplies the stable id of the host that owns this process.
///
/// Every process of one logical host must report the same id, otherwise
/// their lock identities diverge and mutual exclusion is lost.
#[async_trait]
pub trait HostIdProvider: Send + Sync + 'static {
    /// Returns the host id.
    async fn host_id(&self) -> Result<String>;
}

/// A host id fixed at construction.
#[derive(Debug, Clone)]
pub struct FixedHostIdProvider {
    host_id: String,
}

impl FixedHostIdProvider {
    /// Creates a provider for `host_id`.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if the id is empty or contains `/`.
    pub fn new(host_id: impl Into<String>) -> Result<Self> {
        let host_id = host_id.into();
        if host_id.trim().is_empty() {
            return Err(Error::configuration("host id must not be empty"));
        }
        if host_id.contains('/') {
            return Err(Error::configuration(format!(
                "host id '{host_id}' must not contain '/'"
            )));
        }
        Ok(Self { host_id })
    }
}

#[async_trait]
impl HostIdProvider for FixedHostIdProvider {
    async fn host_id(&self) -> Result<String> {
        Ok(self.host_id.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn fixed_provider_returns_its_id() {
        let provider = FixedHostIdProvider::new("host-1").expect("valid");
        assert_eq!(provider.host_id().await.expect("id"), "host-1");
    }

    #[test]
    fn invalid_host_ids_are_rejected() {
        assert!(FixedHostIdProvider::new("  ").is_err());
        assert!(FixedHostIdProvider::new("a/b").is_err());
    }
}
