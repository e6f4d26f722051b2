//! Token Validity Gate contract.

use async_trait::async_trait;
use brokergate_protocol::AccountHandle;
use chrono::Utc;

/// Confirms an account's API token is usable, refreshing it if needed
#[async_trait]
pub trait TokenGate: Send + Sync {
    /// True if the token is valid or was refreshed successfully
    async fn ensure_valid_token(&self, account: &AccountHandle) -> bool;
}

/// Gate that trusts the expiry recorded on the account and never refreshes
#[derive(Debug, Default, Clone, Copy)]
pub struct ExpiryTokenGate;

#[async_trait]
impl TokenGate for ExpiryTokenGate {
    async fn ensure_valid_token(&self, account: &AccountHandle) -> bool {
        account.has_valid_token(Utc::now())
    }
}

/// Gate that accepts every account
#[derive(Debug, Default, Clone, Copy)]
pub struct AllowAllTokenGate;

#[async_trait]
impl TokenGate for AllowAllTokenGate {
    async fn ensure_valid_token(&self, _account: &AccountHandle) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use brokergate_protocol::Environment;
    use chrono::Duration;

    #[tokio::test]
    async fn test_expiry_gate() {
        let gate = ExpiryTokenGate;
        let account = AccountHandle::new("U1", Environment::Production);
        assert!(!gate.ensure_valid_token(&account).await);

        let expired = account
            .clone()
            .with_token_expires_at(Utc::now() - Duration::minutes(1));
        assert!(!gate.ensure_valid_token(&expired).await);

        let valid = account.with_token_expires_at(Utc::now() + Duration::hours(2));
        assert!(gate.ensure_valid_token(&valid).await);
        assert!(AllowAllTokenGate.ensure_valid_token(&valid).await);
    }
}
