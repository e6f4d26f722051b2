//! Account router: which account serves an operation
//!
//! ```text
//!  RouteRequest ──► Account Store (active accounts, sorted by id)
//!                        │
//!                        ▼
//!        filter: environment, permissions, exclusions,
//!                trading capability, error thresholds
//!                        │
//!                        ▼
//!        strategy picks one ──► Token Gate ──ok──► AccountHandle
//!              ▲                    │
//!              └──── drop, retry ◄──┘ rejected
//! ```
//!
//! The router never mutates accounts. Failures are reported to the store
//! through [`AccountRouter::report_failure`]; suspension is the store's call.

mod stats;
mod strategy;

pub use strategy::LoadBalanceStrategy;

use brokergate_protocol::{AccountHandle, AccountType, Environment, MarketPermission, OperationType};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::Arc;
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::config::RouterConfig;
use crate::error::RouterError;
use crate::store::AccountStore;
use crate::token::TokenGate;
use stats::AccountStats;
use strategy::CandidateLoad;

/// Result type for router operations
pub type RouterResult<T> = std::result::Result<T, RouterError>;

// =============================================================================
// Requests and reports
// =============================================================================

/// Filters and strategy for one routing decision
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RouteRequest {
    pub operation: OperationType,
    /// Permissions the account must hold; empty means no requirement
    #[serde(default)]
    pub market_permissions: BTreeSet<MarketPermission>,
    #[serde(default)]
    pub environment: Option<Environment>,
    #[serde(default)]
    pub account_type: Option<AccountType>,
    /// `None` uses the router's configured default for the entry point
    #[serde(default)]
    pub strategy: Option<LoadBalanceStrategy>,
    #[serde(default)]
    pub exclude_accounts: HashSet<Uuid>,
}

impl RouteRequest {
    pub fn new(operation: OperationType) -> Self {
        Self {
            operation,
            market_permissions: BTreeSet::new(),
            environment: None,
            account_type: None,
            strategy: None,
            exclude_accounts: HashSet::new(),
        }
    }

    pub fn with_permissions(mut self, permissions: impl IntoIterator<Item = MarketPermission>) -> Self {
        self.market_permissions = permissions.into_iter().collect();
        self
    }

    pub fn with_environment(mut self, environment: Environment) -> Self {
        self.environment = Some(environment);
        self
    }

    pub fn with_account_type(mut self, account_type: AccountType) -> Self {
        self.account_type = Some(account_type);
        self
    }

    pub fn with_strategy(mut self, strategy: LoadBalanceStrategy) -> Self {
        self.strategy = Some(strategy);
        self
    }

    pub fn excluding(mut self, account_id: Uuid) -> Self {
        self.exclude_accounts.insert(account_id);
        self
    }

    pub fn excluding_all(mut self, account_ids: impl IntoIterator<Item = Uuid>) -> Self {
        self.exclude_accounts.extend(account_ids);
        self
    }
}

/// What an account can currently be used for
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccountAvailability {
    pub account_id: Uuid,
    pub account_number: String,
    pub is_active: bool,
    pub can_trade: bool,
    pub can_fetch_data: bool,
    pub token_valid: bool,
    pub error_count: u32,
    /// Selections within the usage window
    pub usage_count: usize,
    pub average_response_time: Option<f64>,
}

/// Snapshot of routing state across all accounts
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoutingStatistics {
    pub total_accounts: usize,
    pub active_accounts: usize,
    pub accounts_with_errors: usize,
    /// Response-time EWMA in milliseconds, accounts with samples only
    pub average_response_times: BTreeMap<Uuid, f64>,
    /// Selections within the usage window
    pub usage_distribution: BTreeMap<Uuid, usize>,
    pub accounts: Vec<AccountAvailability>,
}

// =============================================================================
// Router
// =============================================================================

/// Picks an account for each operation and keeps usage and latency history
pub struct AccountRouter {
    store: Arc<dyn AccountStore>,
    token_gate: Arc<dyn TokenGate>,
    config: RouterConfig,
    stats: DashMap<Uuid, AccountStats>,
    cursors: DashMap<OperationType, u64>,
}

impl AccountRouter {
    pub fn new(
        store: Arc<dyn AccountStore>,
        token_gate: Arc<dyn TokenGate>,
        config: RouterConfig,
    ) -> Self {
        Self {
            store,
            token_gate,
            config,
            stats: DashMap::new(),
            cursors: DashMap::new(),
        }
    }

    pub fn config(&self) -> &RouterConfig {
        &self.config
    }

    /// Select an account for `request` using its strategy (or the default)
    #[instrument(skip(self, request), fields(operation = %request.operation))]
    pub async fn route_operation(&self, request: &RouteRequest) -> RouterResult<AccountHandle> {
        let strategy = request.strategy.unwrap_or(self.config.default_strategy);
        self.select(request, strategy, Vec::new()).await
    }

    /// Data operations: the default data account first, then `data_strategy`
    #[instrument(skip(self, request), fields(operation = %request.operation))]
    pub async fn route_data_operation(&self, request: &RouteRequest) -> RouterResult<AccountHandle> {
        if !request.operation.is_data() {
            return Err(RouterError::Validation(format!(
                "{} is not a data operation",
                request.operation
            )));
        }
        let default = self.store.get_default_data_account().await?;
        let strategy = request.strategy.unwrap_or(self.config.data_strategy);
        self.route_with_default(request, default, strategy).await
    }

    /// Trading operations: the default trading account first, then `trading_strategy`
    #[instrument(skip(self, request), fields(operation = %request.operation))]
    pub async fn route_trading_operation(&self, request: &RouteRequest) -> RouterResult<AccountHandle> {
        if !request.operation.is_trading() {
            return Err(RouterError::Validation(format!(
                "{} is not a trading operation",
                request.operation
            )));
        }
        let default = self.store.get_default_trading_account().await?;
        let strategy = request.strategy.unwrap_or(self.config.trading_strategy);
        self.route_with_default(request, default, strategy).await
    }

    /// Availability of one account, including a token check
    pub async fn check_account_availability(&self, account: &AccountHandle) -> AccountAvailability {
        let token_valid = self.token_gate.ensure_valid_token(account).await;
        let is_active = account.is_active();
        let (usage_count, average_response_time) = self.load_of(account.id, Instant::now());
        AccountAvailability {
            account_id: account.id,
            account_number: account.account_number.clone(),
            is_active,
            can_trade: is_active
                && token_valid
                && account.is_trading_capable()
                && account.error_count < self.config.trading_error_threshold,
            can_fetch_data: is_active
                && token_valid
                && account.error_count < self.config.data_error_threshold,
            token_valid,
            error_count: account.error_count,
            usage_count,
            average_response_time,
        }
    }

    /// Every account that would currently be eligible for `operation`
    pub async fn get_available_accounts_for_operation(
        &self,
        operation: OperationType,
    ) -> RouterResult<Vec<AccountHandle>> {
        let request = RouteRequest::new(operation);
        let mut available = Vec::new();
        for account in self.candidates(&request).await? {
            if self.token_gate.ensure_valid_token(&account).await {
                available.push(account);
            }
        }
        Ok(available)
    }

    /// Fold a response time (milliseconds) into the account's EWMA
    pub fn record_operation_response_time(&self, account_id: Uuid, duration_ms: f64) {
        self.stats
            .entry(account_id)
            .or_default()
            .record_response(duration_ms, self.config.ewma_alpha);
        debug!(%account_id, duration_ms, "Recorded response time");
    }

    /// Report a dispatch failure to the store; returns the new error count
    pub async fn report_failure(&self, account_id: Uuid, message: &str) -> RouterResult<u32> {
        let count = self.store.increment_error_count(account_id, message).await?;
        if count == self.config.trading_error_threshold {
            warn!(%account_id, error_count = count, "Account no longer eligible for trading");
        } else if count == self.config.data_error_threshold {
            warn!(%account_id, error_count = count, "Account no longer eligible for data operations");
        } else {
            debug!(%account_id, error_count = count, "Account failure reported");
        }
        Ok(count)
    }

    pub async fn reset_error_count(&self, account_id: Uuid) -> RouterResult<()> {
        self.store.reset_error_count(account_id).await?;
        info!(%account_id, "Account error count reset");
        Ok(())
    }

    pub async fn get_routing_statistics(&self) -> RouterResult<RoutingStatistics> {
        let accounts = self.store.list_accounts().await?;
        let now = Instant::now();

        let mut average_response_times = BTreeMap::new();
        let mut usage_distribution = BTreeMap::new();
        for entry in self.stats.iter() {
            if let Some(avg) = entry.average_response_ms() {
                average_response_times.insert(*entry.key(), avg);
            }
            usage_distribution.insert(*entry.key(), entry.usage(now, self.config.usage_window));
        }

        let mut details = Vec::with_capacity(accounts.len());
        for account in &accounts {
            details.push(self.check_account_availability(account).await);
        }

        Ok(RoutingStatistics {
            total_accounts: accounts.len(),
            active_accounts: accounts.iter().filter(|a| a.is_active()).count(),
            accounts_with_errors: accounts.iter().filter(|a| a.error_count > 0).count(),
            average_response_times,
            usage_distribution,
            accounts: details,
        })
    }

    // =========================================================================
    // Selection
    // =========================================================================

    async fn route_with_default(
        &self,
        request: &RouteRequest,
        default: Option<AccountHandle>,
        strategy: LoadBalanceStrategy,
    ) -> RouterResult<AccountHandle> {
        let Some(default) = default.filter(|a| self.is_eligible(a, request)) else {
            return self.select(request, strategy, Vec::new()).await;
        };

        if self.token_gate.ensure_valid_token(&default).await {
            self.record_use(default.id);
            debug!(account_id = %default.id, "Routed to default account");
            return Ok(default);
        }

        warn!(account_id = %default.id, "Default account token invalid, falling back");
        let fallback = request.clone().excluding(default.id);
        self.select(&fallback, strategy, vec![default.id]).await
    }

    async fn select(
        &self,
        request: &RouteRequest,
        strategy: LoadBalanceStrategy,
        mut rejected: Vec<Uuid>,
    ) -> RouterResult<AccountHandle> {
        let mut candidates = self.candidates(request).await?;
        if candidates.is_empty() {
            return Err(self.exhausted(request.operation, rejected));
        }

        while !candidates.is_empty() {
            let index = self.pick(strategy, request.operation, &candidates);
            let account = candidates.remove(index);
            if self.token_gate.ensure_valid_token(&account).await {
                self.record_use(account.id);
                debug!(
                    account_id = %account.id,
                    account_number = %account.account_number,
                    %strategy,
                    "Account selected"
                );
                return Ok(account);
            }
            warn!(account_id = %account.id, "Token invalid, excluding account");
            rejected.push(account.id);
        }

        Err(self.exhausted(request.operation, rejected))
    }

    fn exhausted(&self, operation: OperationType, rejected: Vec<Uuid>) -> RouterError {
        if rejected.is_empty() {
            RouterError::NoAccountsAvailable { operation }
        } else {
            RouterError::TokenInvalid { operation, rejected }
        }
    }

    /// Active accounts passing every filter except the token, sorted by id
    async fn candidates(&self, request: &RouteRequest) -> RouterResult<Vec<AccountHandle>> {
        let mut accounts: Vec<AccountHandle> = self
            .store
            .list_active_accounts()
            .await?
            .into_iter()
            .filter(|a| self.is_eligible(a, request))
            .collect();
        accounts.sort_by_key(|a| a.id);
        Ok(accounts)
    }

    fn is_eligible(&self, account: &AccountHandle, request: &RouteRequest) -> bool {
        if !account.is_active() || request.exclude_accounts.contains(&account.id) {
            return false;
        }
        if matches!(request.environment, Some(env) if env != account.environment) {
            return false;
        }
        if matches!(request.account_type, Some(kind) if kind != account.account_type) {
            return false;
        }
        if !account.has_permissions(&request.market_permissions) {
            return false;
        }
        if request.operation.is_trading() {
            return account.is_trading_capable()
                && account.error_count < self.config.trading_error_threshold;
        }
        // Account queries stay routable at any error count
        !request.operation.is_data() || account.error_count < self.config.data_error_threshold
    }

    fn pick(
        &self,
        strategy: LoadBalanceStrategy,
        operation: OperationType,
        candidates: &[AccountHandle],
    ) -> usize {
        let now = Instant::now();
        let loads: Vec<CandidateLoad> = candidates
            .iter()
            .map(|a| {
                let (usage, average_response_ms) = self.load_of(a.id, now);
                CandidateLoad {
                    usage,
                    average_response_ms,
                }
            })
            .collect();

        let mut cursor = self.cursors.entry(operation).or_insert(0);
        strategy::pick(strategy, &loads, &mut *cursor)
    }

    fn load_of(&self, account_id: Uuid, now: Instant) -> (usize, Option<f64>) {
        self.stats
            .get(&account_id)
            .map(|s| (s.usage(now, self.config.usage_window), s.average_response_ms()))
            .unwrap_or((0, None))
    }

    fn record_use(&self, account_id: Uuid) {
        self.stats
            .entry(account_id)
            .or_default()
            .record_use(Instant::now(), self.config.usage_window);
    }
}

impl std::fmt::Debug for AccountRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AccountRouter")
            .field("config", &self.config)
            .field("tracked_accounts", &self.stats.len())
            .finish()
    }
}
