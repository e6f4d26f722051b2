// Account model shared by the host and its workers
//
// Decision: AccountHandle is a read-only snapshot; the Account Store owns mutation
// Decision: Permissions are a BTreeSet so subset checks and serialization are deterministic

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use uuid::Uuid;

/// Default refresh margin before token expiry (1 hour)
pub const TOKEN_REFRESH_MARGIN_SECS: i64 = 3600;

/// Brokerage environment an account connects to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Environment {
    Sandbox,
    Production,
}

impl Environment {
    /// Base URL of the brokerage API for this environment
    pub fn server_url(&self) -> &'static str {
        match self {
            Environment::Sandbox => "https://openapi-sandbox.tigerfintech.com",
            Environment::Production => "https://openapi.tigerfintech.com",
        }
    }
}

impl fmt::Display for Environment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Environment::Sandbox => write!(f, "sandbox"),
            Environment::Production => write!(f, "production"),
        }
    }
}

/// Lifecycle status of an account as recorded by the Account Store
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccountStatus {
    Active,
    Inactive,
    Suspended,
    PendingVerification,
}

impl fmt::Display for AccountStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AccountStatus::Active => write!(f, "active"),
            AccountStatus::Inactive => write!(f, "inactive"),
            AccountStatus::Suspended => write!(f, "suspended"),
            AccountStatus::PendingVerification => write!(f, "pending_verification"),
        }
    }
}

/// Account product type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccountType {
    #[default]
    Standard,
    Paper,
    Prime,
}

/// Markets an account is permitted to access
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MarketPermission {
    UsStock,
    HkStock,
    CnStock,
    UsOption,
    HkOption,
    Futures,
    Forex,
}

impl fmt::Display for MarketPermission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MarketPermission::UsStock => "us_stock",
            MarketPermission::HkStock => "hk_stock",
            MarketPermission::CnStock => "cn_stock",
            MarketPermission::UsOption => "us_option",
            MarketPermission::HkOption => "hk_option",
            MarketPermission::Futures => "futures",
            MarketPermission::Forex => "forex",
        };
        write!(f, "{}", name)
    }
}

/// Snapshot of a configured brokerage account
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccountHandle {
    pub id: Uuid,
    pub account_number: String,
    pub environment: Environment,
    pub status: AccountStatus,
    #[serde(default)]
    pub account_type: AccountType,
    #[serde(default)]
    pub market_permissions: BTreeSet<MarketPermission>,
    #[serde(default)]
    pub is_default_trading: bool,
    #[serde(default)]
    pub is_default_data: bool,
    #[serde(default)]
    pub error_count: u32,
    #[serde(default)]
    pub token_expires_at: Option<DateTime<Utc>>,
}

impl AccountHandle {
    /// Create an active standard account with no permissions and no token
    pub fn new(account_number: impl Into<String>, environment: Environment) -> Self {
        Self {
            id: Uuid::now_v7(),
            account_number: account_number.into(),
            environment,
            status: AccountStatus::Active,
            account_type: AccountType::Standard,
            market_permissions: BTreeSet::new(),
            is_default_trading: false,
            is_default_data: false,
            error_count: 0,
            token_expires_at: None,
        }
    }

    pub fn with_id(mut self, id: Uuid) -> Self {
        self.id = id;
        self
    }

    pub fn with_status(mut self, status: AccountStatus) -> Self {
        self.status = status;
        self
    }

    pub fn with_account_type(mut self, account_type: AccountType) -> Self {
        self.account_type = account_type;
        self
    }

    pub fn with_permissions(mut self, permissions: impl IntoIterator<Item = MarketPermission>) -> Self {
        self.market_permissions = permissions.into_iter().collect();
        self
    }

    pub fn with_default_trading(mut self, value: bool) -> Self {
        self.is_default_trading = value;
        self
    }

    pub fn with_default_data(mut self, value: bool) -> Self {
        self.is_default_data = value;
        self
    }

    pub fn with_error_count(mut self, error_count: u32) -> Self {
        self.error_count = error_count;
        self
    }

    pub fn with_token_expires_at(mut self, expires_at: DateTime<Utc>) -> Self {
        self.token_expires_at = Some(expires_at);
        self
    }

    pub fn is_active(&self) -> bool {
        self.status == AccountStatus::Active
    }

    /// Paper accounts are recognised by type or by account number prefix
    pub fn is_paper(&self) -> bool {
        self.account_type == AccountType::Paper
            || self.account_number.starts_with('P')
            || self.account_number.starts_with('9')
    }

    /// Trading requires a production account or a paper account
    pub fn is_trading_capable(&self) -> bool {
        self.environment == Environment::Production || self.is_paper()
    }

    /// True when every requested permission is held by this account
    pub fn has_permissions(&self, required: &BTreeSet<MarketPermission>) -> bool {
        required.is_subset(&self.market_permissions)
    }

    pub fn has_valid_token(&self, now: DateTime<Utc>) -> bool {
        matches!(self.token_expires_at, Some(expires_at) if expires_at > now)
    }

    /// True when the token is missing or expires within `margin`
    pub fn needs_token_refresh(&self, now: DateTime<Utc>, margin: ChronoDuration) -> bool {
        match self.token_expires_at {
            Some(expires_at) => expires_at <= now + margin,
            None => true,
        }
    }

    /// Minimal view shipped to a worker during startup
    pub fn summary(&self) -> AccountSummary {
        AccountSummary {
            account_id: self.id,
            account_number: self.account_number.clone(),
            environment: self.environment,
            market_permissions: self.market_permissions.clone(),
        }
    }
}

/// Account fields a worker needs to open its session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccountSummary {
    pub account_id: Uuid,
    pub account_number: String,
    pub environment: Environment,
    #[serde(default)]
    pub market_permissions: BTreeSet<MarketPermission>,
}

/// Decrypted API credentials for one account
#[derive(Clone, PartialEq, Serialize, Deserialize)]
pub struct Credentials {
    pub id: String,
    pub private_key: String,
    #[serde(default)]
    pub access_token: Option<String>,
}

impl Credentials {
    pub fn new(id: impl Into<String>, private_key: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            private_key: private_key.into(),
            access_token: None,
        }
    }

    pub fn with_access_token(mut self, token: impl Into<String>) -> Self {
        self.access_token = Some(token.into());
        self
    }

    /// Both the API id and the private key are required to open a session
    pub fn is_complete(&self) -> bool {
        !self.id.trim().is_empty() && !self.private_key.trim().is_empty()
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("id", &self.id)
            .field("private_key", &"<redacted>")
            .field(
                "access_token",
                &self.access_token.as_ref().map(|_| "<redacted>"),
            )
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_trading_capability() {
        let sandbox = AccountHandle::new("U100", Environment::Sandbox);
        assert!(!sandbox.is_trading_capable());

        let paper = AccountHandle::new("U100", Environment::Sandbox)
            .with_account_type(AccountType::Paper);
        assert!(paper.is_trading_capable());

        let prefixed = AccountHandle::new("P2001", Environment::Sandbox);
        assert!(prefixed.is_trading_capable());

        let production = AccountHandle::new("U100", Environment::Production);
        assert!(production.is_trading_capable());
    }

    #[test]
    fn test_permission_subset() {
        let account = AccountHandle::new("U1", Environment::Production)
            .with_permissions([MarketPermission::UsStock, MarketPermission::HkStock]);

        let mut required = BTreeSet::new();
        assert!(account.has_permissions(&required));

        required.insert(MarketPermission::UsStock);
        assert!(account.has_permissions(&required));

        required.insert(MarketPermission::Futures);
        assert!(!account.has_permissions(&required));
    }

    #[test]
    fn test_token_validity() {
        let now = Utc::now();
        let margin = ChronoDuration::seconds(TOKEN_REFRESH_MARGIN_SECS);

        let missing = AccountHandle::new("U1", Environment::Sandbox);
        assert!(!missing.has_valid_token(now));
        assert!(missing.needs_token_refresh(now, margin));

        let expiring = missing
            .clone()
            .with_token_expires_at(now + ChronoDuration::minutes(10));
        assert!(expiring.has_valid_token(now));
        assert!(expiring.needs_token_refresh(now, margin));

        let fresh = missing.with_token_expires_at(now + ChronoDuration::days(2));
        assert!(fresh.has_valid_token(now));
        assert!(!fresh.needs_token_refresh(now, margin));
    }

    #[test]
    fn test_credentials_debug_is_redacted() {
        let creds = Credentials::new("tiger-id", "super-secret").with_access_token("bearer-xyz");
        let rendered = format!("{:?}", creds);
        assert!(rendered.contains("tiger-id"));
        assert!(!rendered.contains("super-secret"));
        assert!(!rendered.contains("bearer-xyz"));
    }

    #[test]
    fn test_status_serialization() {
        let json = serde_json::to_string(&AccountStatus::PendingVerification).unwrap();
        assert_eq!(json, "\"pending_verification\"");
        let env: Environment = serde_json::from_str("\"production\"").unwrap();
        assert_eq!(env, Environment::Production);
    }
}
