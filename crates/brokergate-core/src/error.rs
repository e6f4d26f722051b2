// Error types for the gateway core
//
// Decision: One enum per layer; GatewayError wraps the others with #[from]
// Decision: Retryability is a property of the error, decided here once

use brokergate_protocol::{OperationType, ProtocolError};
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

use crate::store::StoreError;
use crate::vault::VaultError;

/// Result type for pool operations
pub type PoolResult<T> = std::result::Result<T, PoolError>;

/// Errors from the process pool manager
#[derive(Debug, Error)]
pub enum PoolError {
    /// Malformed task parameters
    #[error("validation error: {0}")]
    Validation(String),

    #[error("account not found: {0}")]
    AccountNotFound(Uuid),

    #[error("account {0} is not active")]
    AccountInactive(Uuid),

    /// Pool at `max_workers` and no slot could be reclaimed
    #[error("pool at capacity ({max_workers} workers)")]
    CapacityExceeded { max_workers: usize },

    #[error("task queue for account {account_id} is full ({depth} pending)")]
    QueueFull { account_id: Uuid, depth: usize },

    #[error("task {task_id} timed out after {timeout:?}")]
    TaskTimeout { task_id: Uuid, timeout: Duration },

    #[error("worker for account {account_id} crashed")]
    WorkerCrashed { account_id: Uuid },

    #[error("worker for account {account_id} is unresponsive")]
    WorkerUnresponsive { account_id: Uuid },

    /// Task dropped because its worker was restarted, evicted or stopped
    #[error("task aborted: worker for account {account_id} was {reason}")]
    Aborted {
        account_id: Uuid,
        reason: &'static str,
    },

    #[error("worker for account {0} is restarting")]
    WorkerRestarting(Uuid),

    /// Restart attempts exhausted; needs a manual restart
    #[error("worker for account {0} is unavailable after exhausting restarts")]
    WorkerUnavailable(Uuid),

    #[error("worker startup failed for account {account_id}: {reason}")]
    StartupFailed { account_id: Uuid, reason: String },

    #[error("credential error: {0}")]
    Credentials(#[from] VaultError),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("process pool is already running")]
    AlreadyRunning,

    #[error("process pool is shutting down")]
    ShuttingDown,

    #[error("invalid pool configuration: {0}")]
    InvalidConfig(String),

    #[error("shutdown timed out")]
    ShutdownTimeout,
}

impl PoolError {
    /// Failures where trying another account may succeed
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            PoolError::TaskTimeout { .. }
                | PoolError::WorkerCrashed { .. }
                | PoolError::WorkerUnresponsive { .. }
                | PoolError::Aborted { .. }
                | PoolError::WorkerRestarting(_)
                | PoolError::WorkerUnavailable(_)
                | PoolError::StartupFailed { .. }
                | PoolError::CapacityExceeded { .. }
                | PoolError::QueueFull { .. }
                | PoolError::AccountInactive(_)
                | PoolError::Credentials(_)
        )
    }

    /// Retryable failures where the task was never handed to a worker
    ///
    /// Only these are safe to resend for operations with side effects at the
    /// brokerage; after dispatch the first worker may still act on the task.
    pub fn never_dispatched(&self) -> bool {
        matches!(
            self,
            PoolError::WorkerRestarting(_)
                | PoolError::WorkerUnavailable(_)
                | PoolError::StartupFailed { .. }
                | PoolError::CapacityExceeded { .. }
                | PoolError::QueueFull { .. }
                | PoolError::AccountInactive(_)
                | PoolError::Credentials(_)
        )
    }

    /// Failures attributable to the account, reported to the account store
    pub fn counts_against_account(&self) -> bool {
        matches!(
            self,
            PoolError::TaskTimeout { .. }
                | PoolError::WorkerCrashed { .. }
                | PoolError::WorkerUnresponsive { .. }
                | PoolError::WorkerUnavailable(_)
                | PoolError::StartupFailed { .. }
                | PoolError::Credentials(_)
        )
    }
}

impl From<ProtocolError> for PoolError {
    fn from(e: ProtocolError) -> Self {
        PoolError::Validation(e.to_string())
    }
}

/// Errors from the account router
#[derive(Debug, Error)]
pub enum RouterError {
    #[error("validation error: {0}")]
    Validation(String),

    #[error("no accounts available for {operation}")]
    NoAccountsAvailable { operation: OperationType },

    /// Every remaining candidate failed token validation
    #[error("no account with a valid token for {operation} ({} rejected)", .rejected.len())]
    TokenInvalid {
        operation: OperationType,
        rejected: Vec<Uuid>,
    },

    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

/// Errors from the failover gateway
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error(transparent)]
    Router(#[from] RouterError),

    #[error(transparent)]
    Pool(#[from] PoolError),

    #[error("failover exhausted after {attempts} attempts: {last}")]
    FailoverExhausted {
        attempts: usize,
        #[source]
        last: PoolError,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validation_is_never_retryable() {
        assert!(!PoolError::Validation("bad".into()).is_retryable());
        assert!(!PoolError::AccountNotFound(Uuid::now_v7()).is_retryable());
    }

    #[test]
    fn test_worker_failures_are_retryable() {
        let account_id = Uuid::now_v7();
        assert!(PoolError::WorkerCrashed { account_id }.is_retryable());
        assert!(PoolError::TaskTimeout {
            task_id: Uuid::now_v7(),
            timeout: Duration::from_secs(1)
        }
        .is_retryable());
        assert!(PoolError::CapacityExceeded { max_workers: 1 }.is_retryable());
        assert!(!PoolError::CapacityExceeded { max_workers: 1 }.counts_against_account());
    }

    #[test]
    fn test_post_dispatch_failures_are_not_resendable() {
        let account_id = Uuid::now_v7();
        assert!(PoolError::StartupFailed {
            account_id,
            reason: "handshake".into()
        }
        .never_dispatched());
        assert!(PoolError::QueueFull {
            account_id,
            depth: 1
        }
        .never_dispatched());
        assert!(!PoolError::TaskTimeout {
            task_id: Uuid::now_v7(),
            timeout: Duration::from_secs(1)
        }
        .never_dispatched());
        assert!(!PoolError::WorkerCrashed { account_id }.never_dispatched());
        assert!(!PoolError::Aborted {
            account_id,
            reason: "restarted"
        }
        .never_dispatched());
    }

    #[test]
    fn test_protocol_errors_map_to_validation() {
        let err: PoolError = ProtocolError::InvalidMethod("x".into()).into();
        assert!(matches!(err, PoolError::Validation(_)));
    }
}
