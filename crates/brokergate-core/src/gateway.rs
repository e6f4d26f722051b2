// Failover gateway: route, execute, fail over
//
// Decision: Only pool errors marked retryable move to another account
// Decision: Trading operations fail over only when the task never reached a worker
// Decision: `trade.*` methods must be routed under an operation class that allows them
// Decision: Handler errors come back as TaskResult{success: false} and are final
// Decision: The default-account shortcut applies to the first attempt only

use brokergate_protocol::{
    AccountType, Environment, MarketPermission, MethodName, OperationClass, OperationType,
    TaskRequest, TaskResult, DEFAULT_TASK_TIMEOUT,
};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

use crate::config::FailoverConfig;
use crate::error::{GatewayError, PoolError, RouterError};
use crate::pool::ProcessPoolManager;
use crate::router::{AccountRouter, LoadBalanceStrategy, RouteRequest};

/// An operation to run on whichever account the router picks
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperationRequest {
    pub operation: OperationType,
    /// Worker method, e.g. `quote.get_market_status`
    pub method: String,
    #[serde(default)]
    pub args: Vec<Value>,
    #[serde(default)]
    pub kwargs: Map<String, Value>,
    #[serde(with = "brokergate_protocol::duration_millis")]
    pub timeout: Duration,
    #[serde(default)]
    pub market_permissions: BTreeSet<MarketPermission>,
    #[serde(default)]
    pub environment: Option<Environment>,
    #[serde(default)]
    pub account_type: Option<AccountType>,
    #[serde(default)]
    pub strategy: Option<LoadBalanceStrategy>,
    /// Try the default data/trading account first
    #[serde(default)]
    pub use_default: bool,
}

impl OperationRequest {
    pub fn new(operation: OperationType, method: impl Into<String>) -> Self {
        Self {
            operation,
            method: method.into(),
            args: Vec::new(),
            kwargs: Map::new(),
            timeout: DEFAULT_TASK_TIMEOUT,
            market_permissions: BTreeSet::new(),
            environment: None,
            account_type: None,
            strategy: None,
            use_default: false,
        }
    }

    pub fn with_arg(mut self, arg: impl Into<Value>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn with_kwarg(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.kwargs.insert(key.into(), value.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
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

    pub fn with_default_account(mut self, use_default: bool) -> Self {
        self.use_default = use_default;
        self
    }

    fn route_request(&self) -> RouteRequest {
        RouteRequest {
            operation: self.operation,
            market_permissions: self.market_permissions.clone(),
            environment: self.environment,
            account_type: self.account_type,
            strategy: self.strategy,
            exclude_accounts: Default::default(),
        }
    }

    /// Reject methods whose side effects the operation's routing does not cover
    fn validate(&self) -> Result<(), GatewayError> {
        let method = MethodName::parse(&self.method).map_err(PoolError::from)?;
        match method.required_class() {
            Some(required) if !self.operation.permits(required) => {
                Err(RouterError::Validation(format!(
                    "method {} cannot run as a {} operation",
                    method, self.operation
                ))
                .into())
            }
            _ => Ok(()),
        }
    }

    /// Whether `error` allows resending this request to another account
    fn may_fail_over(&self, error: &PoolError) -> bool {
        if self.operation.is_trading() {
            error.never_dispatched()
        } else {
            error.is_retryable()
        }
    }

    fn task_for(&self, account_id: Uuid) -> TaskRequest {
        TaskRequest::new(account_id, self.method.clone())
            .with_args(self.args.clone())
            .with_kwargs(self.kwargs.clone())
            .with_timeout(self.timeout)
    }
}

/// Result of a routed operation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoutedResult {
    pub account_id: Uuid,
    pub account_number: String,
    /// Accounts tried, including the one that answered
    pub attempts: usize,
    pub result: TaskResult,
}

/// Router plus pool, with failover across accounts
#[derive(Clone)]
pub struct Gateway {
    router: Arc<AccountRouter>,
    pool: ProcessPoolManager,
    config: FailoverConfig,
}

impl Gateway {
    pub fn new(router: Arc<AccountRouter>, pool: ProcessPoolManager, config: FailoverConfig) -> Self {
        Self {
            router,
            pool,
            config,
        }
    }

    pub fn router(&self) -> &AccountRouter {
        &self.router
    }

    pub fn pool(&self) -> &ProcessPoolManager {
        &self.pool
    }

    /// Route and execute, moving to another account on retryable failures
    #[instrument(skip(self, request), fields(operation = %request.operation, method = %request.method))]
    pub async fn execute(&self, request: OperationRequest) -> Result<RoutedResult, GatewayError> {
        request.validate()?;

        let mut route = request.route_request();
        let mut last_error: Option<PoolError> = None;

        for attempt in 1..=self.config.max_attempts {
            let account = match self.route(&route, request.use_default && attempt == 1).await {
                Ok(account) => account,
                Err(e) => {
                    return Err(match last_error {
                        Some(last) if is_exhaustion(&e) => GatewayError::FailoverExhausted {
                            attempts: attempt - 1,
                            last,
                        },
                        _ => e.into(),
                    })
                }
            };

            match self.pool.execute(request.task_for(account.id)).await {
                Ok(result) => {
                    self.router
                        .record_operation_response_time(account.id, result.duration_ms);
                    if attempt > 1 {
                        info!(account_id = %account.id, attempt, "Operation succeeded after failover");
                    }
                    return Ok(RoutedResult {
                        account_id: account.id,
                        account_number: account.account_number,
                        attempts: attempt,
                        result,
                    });
                }
                Err(e) => {
                    if e.counts_against_account() {
                        if let Err(report) = self.router.report_failure(account.id, &e.to_string()).await {
                            error!(account_id = %account.id, error = %report, "Failed to report account failure");
                        }
                    }
                    if !request.may_fail_over(&e) {
                        if e.is_retryable() {
                            warn!(
                                account_id = %account.id,
                                error = %e,
                                "Trading task may have reached the worker, not failing over"
                            );
                        }
                        return Err(e.into());
                    }
                    warn!(
                        account_id = %account.id,
                        attempt,
                        max_attempts = self.config.max_attempts,
                        error = %e,
                        "Dispatch failed, failing over"
                    );
                    route.exclude_accounts.insert(account.id);
                    last_error = Some(e);
                }
            }
        }

        match last_error {
            Some(last) => Err(GatewayError::FailoverExhausted {
                attempts: self.config.max_attempts,
                last,
            }),
            None => Err(RouterError::NoAccountsAvailable {
                operation: request.operation,
            }
            .into()),
        }
    }

    async fn route(
        &self,
        route: &RouteRequest,
        use_default: bool,
    ) -> Result<brokergate_protocol::AccountHandle, RouterError> {
        if !use_default {
            return self.router.route_operation(route).await;
        }
        match route.operation.class() {
            OperationClass::Data => self.router.route_data_operation(route).await,
            OperationClass::Trading => self.router.route_trading_operation(route).await,
            OperationClass::Account => self.router.route_operation(route).await,
        }
    }
}

fn is_exhaustion(e: &RouterError) -> bool {
    matches!(
        e,
        RouterError::NoAccountsAvailable { .. } | RouterError::TokenInvalid { .. }
    )
}
