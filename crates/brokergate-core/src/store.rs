// Account Store contract and in-memory implementation
//
// Decision: The gateway never writes account fields directly; it asks the store
// Decision: Suspension on repeated errors is a store policy, not a router policy

use async_trait::async_trait;
use brokergate_protocol::{AccountHandle, AccountStatus};
use parking_lot::RwLock;
use std::collections::HashMap;
use thiserror::Error;
use tracing::warn;
use uuid::Uuid;

/// Error count at which the in-memory store suspends an account
pub const AUTO_SUSPEND_ERROR_COUNT: u32 = 10;

/// Account store errors
#[derive(Debug, Error)]
pub enum StoreError {
    /// Account not found
    #[error("account not found: {0}")]
    AccountNotFound(Uuid),

    /// A second default account of the same kind was requested
    #[error("account {existing} is already the default {kind} account")]
    DefaultConflict { kind: &'static str, existing: Uuid },

    /// Backend failure
    #[error("store backend error: {0}")]
    Backend(String),
}

/// Source of account snapshots, consumed by the router and the pool
#[async_trait]
pub trait AccountStore: Send + Sync {
    async fn get_account_by_id(&self, id: Uuid) -> Result<Option<AccountHandle>, StoreError>;

    async fn list_active_accounts(&self) -> Result<Vec<AccountHandle>, StoreError>;

    /// Every account regardless of status (used for statistics)
    async fn list_accounts(&self) -> Result<Vec<AccountHandle>, StoreError>;

    /// Record a failure; returns the new error count
    async fn increment_error_count(&self, id: Uuid, message: &str) -> Result<u32, StoreError>;

    async fn reset_error_count(&self, id: Uuid) -> Result<(), StoreError>;

    async fn get_default_trading_account(&self) -> Result<Option<AccountHandle>, StoreError>;

    async fn get_default_data_account(&self) -> Result<Option<AccountHandle>, StoreError>;
}

struct StoredAccount {
    account: AccountHandle,
    last_error: Option<String>,
}

/// In-memory implementation of [`AccountStore`]
///
/// Enforces a single default trading and data account and suspends
/// accounts whose error count reaches [`AUTO_SUSPEND_ERROR_COUNT`].
///
/// # Example
///
/// ```
/// use brokergate_core::InMemoryAccountStore;
///
/// let store = InMemoryAccountStore::new();
/// assert_eq!(store.account_count(), 0);
/// ```
#[derive(Default)]
pub struct InMemoryAccountStore {
    accounts: RwLock<HashMap<Uuid, StoredAccount>>,
}

impl InMemoryAccountStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace an account
    pub fn upsert(&self, account: AccountHandle) -> Result<(), StoreError> {
        let mut accounts = self.accounts.write();
        if account.is_default_trading {
            if let Some(existing) = accounts
                .values()
                .find(|s| s.account.is_default_trading && s.account.id != account.id)
            {
                return Err(StoreError::DefaultConflict {
                    kind: "trading",
                    existing: existing.account.id,
                });
            }
        }
        if account.is_default_data {
            if let Some(existing) = accounts
                .values()
                .find(|s| s.account.is_default_data && s.account.id != account.id)
            {
                return Err(StoreError::DefaultConflict {
                    kind: "data",
                    existing: existing.account.id,
                });
            }
        }
        let last_error = accounts.get(&account.id).and_then(|s| s.last_error.clone());
        accounts.insert(account.id, StoredAccount { account, last_error });
        Ok(())
    }

    pub fn set_status(&self, id: Uuid, status: AccountStatus) -> Result<(), StoreError> {
        let mut accounts = self.accounts.write();
        let stored = accounts.get_mut(&id).ok_or(StoreError::AccountNotFound(id))?;
        stored.account.status = status;
        Ok(())
    }

    pub fn set_token_expiry(
        &self,
        id: Uuid,
        expires_at: Option<chrono::DateTime<chrono::Utc>>,
    ) -> Result<(), StoreError> {
        let mut accounts = self.accounts.write();
        let stored = accounts.get_mut(&id).ok_or(StoreError::AccountNotFound(id))?;
        stored.account.token_expires_at = expires_at;
        Ok(())
    }

    pub fn remove(&self, id: Uuid) -> Option<AccountHandle> {
        self.accounts.write().remove(&id).map(|s| s.account)
    }

    pub fn last_error(&self, id: Uuid) -> Option<String> {
        self.accounts.read().get(&id).and_then(|s| s.last_error.clone())
    }

    pub fn account_count(&self) -> usize {
        self.accounts.read().len()
    }

    fn sorted(&self, filter: impl Fn(&AccountHandle) -> bool) -> Vec<AccountHandle> {
        let mut accounts: Vec<AccountHandle> = self
            .accounts
            .read()
            .values()
            .map(|s| &s.account)
            .filter(|a| filter(*a))
            .cloned()
            .collect();
        accounts.sort_by_key(|a| a.id);
        accounts
    }
}

#[async_trait]
impl AccountStore for InMemoryAccountStore {
    async fn get_account_by_id(&self, id: Uuid) -> Result<Option<AccountHandle>, StoreError> {
        Ok(self.accounts.read().get(&id).map(|s| s.account.clone()))
    }

    async fn list_active_accounts(&self) -> Result<Vec<AccountHandle>, StoreError> {
        Ok(self.sorted(|a| a.is_active()))
    }

    async fn list_accounts(&self) -> Result<Vec<AccountHandle>, StoreError> {
        Ok(self.sorted(|_| true))
    }

    async fn increment_error_count(&self, id: Uuid, message: &str) -> Result<u32, StoreError> {
        let mut accounts = self.accounts.write();
        let stored = accounts.get_mut(&id).ok_or(StoreError::AccountNotFound(id))?;
        stored.account.error_count = stored.account.error_count.saturating_add(1);
        stored.last_error = Some(message.to_string());
        let count = stored.account.error_count;
        if count >= AUTO_SUSPEND_ERROR_COUNT && stored.account.status == AccountStatus::Active {
            stored.account.status = AccountStatus::Suspended;
            warn!(
                account_id = %id,
                error_count = count,
                "Account suspended after repeated errors"
            );
        }
        Ok(count)
    }

    async fn reset_error_count(&self, id: Uuid) -> Result<(), StoreError> {
        let mut accounts = self.accounts.write();
        let stored = accounts.get_mut(&id).ok_or(StoreError::AccountNotFound(id))?;
        stored.account.error_count = 0;
        stored.last_error = None;
        Ok(())
    }

    async fn get_default_trading_account(&self) -> Result<Option<AccountHandle>, StoreError> {
        Ok(self
            .accounts
            .read()
            .values()
            .find(|s| s.account.is_default_trading)
            .map(|s| s.account.clone()))
    }

    async fn get_default_data_account(&self) -> Result<Option<AccountHandle>, StoreError> {
        Ok(self
            .accounts
            .read()
            .values()
            .find(|s| s.account.is_default_data)
            .map(|s| s.account.clone()))
    }
}
