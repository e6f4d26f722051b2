// Brokergate gateway core
//
// This crate provides the host side of a multi-tenant brokerage gateway:
// every account runs in its own isolated worker, and operations are routed
// to a healthy, permission-matching account with load balancing and failover.
//
// Key design decisions:
// - ProcessPoolManager owns the account → worker map; one live worker per account
// - Tasks for one account run FIFO through a bounded queue and a single dispatcher
// - AccountRouter only reads accounts; failures are reported back to the AccountStore
// - Gateway composes the two and fails over on retryable dispatch errors
// - Collaborators (AccountStore, CredentialVault, TokenGate) are traits with in-memory impls
// - Services are constructed explicitly and passed around; there are no globals
//
//   caller ──► Gateway ──► AccountRouter ──► TokenGate
//                 │             │
//                 │             └──► AccountStore
//                 ▼
//          ProcessPoolManager ──► WorkerHandle ──► worker process ──► brokerage

pub mod config;
pub mod error;
pub mod gateway;
pub mod pool;
pub mod router;
pub mod store;
pub mod telemetry;
pub mod token;
pub mod vault;

// Re-exports for convenience
pub use config::{CapacityPolicy, FailoverConfig, PoolConfig, RouterConfig};
pub use error::{GatewayError, PoolError, PoolResult, RouterError};
pub use gateway::{Gateway, OperationRequest, RoutedResult};
pub use pool::{
    AccountHealth, InProcessLauncher, PoolStatus, ProcessLauncher, ProcessMetrics,
    ProcessMetricsSummary, ProcessPoolManager, RestartPolicy, SystemMetrics, TaskTicket,
    UnresponsivePolicy, WorkerHandle, WorkerLauncher, WorkerProcess, WorkerStatus,
};
pub use router::{
    AccountAvailability, AccountRouter, LoadBalanceStrategy, RouteRequest, RouterResult,
    RoutingStatistics,
};
pub use store::{AccountStore, InMemoryAccountStore, StoreError};
pub use telemetry::{init_telemetry, TelemetryConfig};
pub use token::{AllowAllTokenGate, ExpiryTokenGate, TokenGate};
pub use vault::{CredentialVault, StaticCredentialVault, VaultError};

// Shared protocol types callers need alongside the core API
pub use brokergate_protocol::{
    AccountHandle, AccountStatus, AccountType, Credentials, Environment, MarketPermission,
    OperationClass, OperationType, TaskRequest, TaskResult,
};

/// Common imports for embedding the gateway
pub mod prelude {
    pub use crate::{
        AccountHandle, AccountRouter, AccountStore, CredentialVault, Environment, Gateway,
        GatewayError, InMemoryAccountStore, OperationRequest, OperationType, PoolConfig,
        PoolError, ProcessPoolManager, RouteRequest, RouterConfig, StaticCredentialVault,
        TokenGate,
    };
}
