//! Credential Vault contract.
//!
//! Only worker startup asks the vault for credentials; the router and the
//! pool manager never see them.

use async_trait::async_trait;
use brokergate_protocol::{AccountHandle, Credentials};
use parking_lot::RwLock;
use std::collections::HashMap;
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum VaultError {
    #[error("no credentials stored for account {0}")]
    NotFound(Uuid),

    #[error("credential decryption failed: {0}")]
    Decryption(String),
}

/// Decrypts the API credentials of an account
#[async_trait]
pub trait CredentialVault: Send + Sync {
    async fn decrypt_credentials(&self, account: &AccountHandle) -> Result<Credentials, VaultError>;
}

/// Vault holding plaintext credentials in memory
#[derive(Default)]
pub struct StaticCredentialVault {
    credentials: RwLock<HashMap<Uuid, Credentials>>,
}

impl StaticCredentialVault {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, account_id: Uuid, credentials: Credentials) {
        self.credentials.write().insert(account_id, credentials);
    }

    pub fn remove(&self, account_id: Uuid) -> Option<Credentials> {
        self.credentials.write().remove(&account_id)
    }
}

#[async_trait]
impl CredentialVault for StaticCredentialVault {
    async fn decrypt_credentials(&self, account: &AccountHandle) -> Result<Credentials, VaultError> {
        self.credentials
            .read()
            .get(&account.id)
            .cloned()
            .ok_or(VaultError::NotFound(account.id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use brokergate_protocol::Environment;

    #[tokio::test]
    async fn test_lookup_by_account() {
        let vault = StaticCredentialVault::new();
        let account = AccountHandle::new("U1", Environment::Sandbox);
        assert!(matches!(
            vault.decrypt_credentials(&account).await,
            Err(VaultError::NotFound(_))
        ));

        vault.insert(account.id, Credentials::new("id", "key"));
        let creds = vault.decrypt_credentials(&account).await.unwrap();
        assert_eq!(creds.id, "id");
    }
}
