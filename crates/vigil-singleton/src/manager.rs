//! Multi-account lock manager.
//!
//! [`LockManager`] maps a logical account name to a [`LeaseAcquirer`] over the
//! account's lock store, resolving each account once through a
//! [`LockStoreProvider`] and reusing the result for the process lifetime.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::RwLock;
use vigil_core::lease::LeaseAcquirer;
use vigil_core::lease_store::LockStore;

use crate::error::{Error, Result};
use crate::identity::LockIdentity;

/// Name of the account used when a declaration does not pick one.
pub const DEFAULT_ACCOUNT: &str = "default";

/// Resolves an account name to the lock store of that account.
#[async_trait]
pub trait LockStoreProvider: Send + Sync + 'static {
    /// Returns the store for `account`.
    ///
    /// # Errors
    ///
    /// Returns a configuration error for unknown accounts.
    async fn resolve(&self, account: &str) -> Result<Arc<dyn LockStore>>;
}

/// A provider over a fixed set of preconfigured stores.
#[derive(Clone, Default)]
pub struct StaticLockStoreProvider {
    stores: HashMap<String, Arc<dyn LockStore>>,
}

impl std::fmt::Debug for StaticLockStoreProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut accounts: Vec<_> = self.stores.keys().collect();
        accounts.sort();
        f.debug_struct("StaticLockStoreProvider")
            .field("accounts", &accounts)
            .finish()
    }
}

impl StaticLockStoreProvider {
    /// Creates a provider whose default account uses `store`.
    #[must_use]
    pub fn new(store: Arc<dyn LockStore>) -> Self {
        Self::default().with_account(DEFAULT_ACCOUNT, store)
    }

    /// Registers a named account.
    #[must_use]
    pub fn with_account(mut self, account: impl Into<String>, store: Arc<dyn LockStore>) -> Self {
        self.stores.insert(account.into(), store);
        self
    }
}

#[async_trait]
impl LockStoreProvider for StaticLockStoreProvider {
    async fn resolve(&self, account: &str) -> Result<Arc<dyn LockStore>> {
        self.stores.get(account).cloned().ok_or_else(|| {
            Error::configuration(format!("no lock store configured for account '{account}'"))
        })
    }
}

/// A held lease.
#[derive(Debug, Clone)]
pub struct LockHandle {
    lock_id: LockIdentity,
    account: String,
    lease_id: String,
    lease_period: Duration,
    acquirer: LeaseAcquirer,
}

impl LockHandle {
    /// Identity of the held lock.
    #[must_use]
    pub fn lock_id(&self) -> &LockIdentity {
        &self.lock_id
    }

    /// Account holding the lock record.
    #[must_use]
    pub fn account(&self) -> &str {
        &self.account
    }

    /// Lease token.
    #[must_use]
    pub fn lease_id(&self) -> &str {
        &self.lease_id
    }

    /// Lease period the lease was taken with.
    #[must_use]
    pub fn lease_period(&self) -> Duration {
        self.lease_period
    }

    /// Renews the lease once.
    ///
    /// # Errors
    ///
    /// Returns the classified storage error.
    pub async fn renew(&self) -> Result<()> {
        self.acquirer
            .renew(&self.lock_id.path(), &self.lease_id)
            .await
            .map_err(Error::from)
    }
}

/// Lease operations keyed by `(account, identity)`.
pub struct LockManager {
    provider: Arc<dyn LockStoreProvider>,
    acquirers: RwLock<HashMap<String, LeaseAcquirer>>,
}

impl std::fmt::Debug for LockManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockManager").finish_non_exhaustive()
    }
}

impl LockManager {
    /// Creates a manager over `provider`.
    #[must_use]
    pub fn new(provider: Arc<dyn LockStoreProvider>) -> Self {
        Self {
            provider,
            acquirers: RwLock::new(HashMap::new()),
        }
    }

    /// Creates a manager whose only account is the default one.
    #[must_use]
    pub fn with_store(store: Arc<dyn LockStore>) -> Self {
        Self::new(Arc::new(StaticLockStoreProvider::new(store)))
    }

    /// Returns the acquirer for `account`, resolving it on first use.
    async fn acquirer(&self, account: &str) -> Result<LeaseAcquirer> {
        if let Some(acquirer) = self.acquirers.read().await.get(account) {
            return Ok(acquirer.clone());
        }

        let store = self.provider.resolve(account).await?;
        let mut acquirers = self.acquirers.write().await;
        // A concurrent resolver may have won; keep the first mapping.
        let acquirer = acquirers
            .entry(account.to_string())
            .or_insert_with(|| LeaseAcquirer::new(store));
        Ok(acquirer.clone())
    }

    /// Attempts to take the lease on `lock_id` once.
    ///
    /// Returns `Ok(None)` if the lock is held elsewhere.
    ///
    /// # Errors
    ///
    /// Returns configuration errors for unknown accounts and server or fatal
    /// storage errors.
    pub async fn try_lock(
        &self,
        account: &str,
        lock_id: &LockIdentity,
        lease_period: Duration,
        proposed_lease_id: &str,
    ) -> Result<Option<LockHandle>> {
        let acquirer = self.acquirer(account).await?;
        let lease_id = acquirer
            .acquire(&lock_id.path(), lease_period, proposed_lease_id)
            .await?;

        Ok(lease_id.map(|lease_id| LockHandle {
            lock_id: lock_id.clone(),
            account: account.to_string(),
            lease_id,
            lease_period,
            acquirer,
        }))
    }

    /// Renews a held lease.
    ///
    /// # Errors
    ///
    /// Returns the classified storage error.
    pub async fn renew(&self, handle: &LockHandle) -> Result<()> {
        handle.renew().await
    }

    /// Releases a held lease. Already-released leases count as released.
    ///
    /// # Errors
    ///
    /// Returns server and fatal storage errors.
    pub async fn release(&self, handle: &LockHandle) -> Result<()> {
        handle
            .acquirer
            .release(&handle.lock_id.path(), &handle.lease_id)
            .await
            .map_err(Error::from)
    }

    /// Records `owner_id` as the holder of `handle`.
    ///
    /// # Errors
    ///
    /// Returns an error if the lease is no longer held or storage fails.
    pub async fn write_owner(&self, handle: &LockHandle, owner_id: &str) -> Result<()> {
        handle
            .acquirer
            .write_owner(&handle.lock_id.path(), &handle.lease_id, owner_id)
            .await
            .map_err(Error::from)
    }

    /// Reads the owner of `lock_id` without creating anything.
    ///
    /// # Errors
    ///
    /// Returns configuration errors for unknown accounts and server or fatal
    /// storage errors.
    pub async fn get_owner(&self, account: &str, lock_id: &LockIdentity) -> Result<Option<String>> {
        let acquirer = self.acquirer(account).await?;
        Ok(acquirer.read_owner(&lock_id.path()).await?)
    }
}
