//! Shared protocol for the brokergate host and its account workers.
//!
//! - [`account`]: account snapshots, permissions and credentials
//! - [`operation`]: operation types used for routing
//! - [`task`]: task requests and results as seen by callers
//! - [`frame`] / [`codec`]: the JSON-lines IPC between host and worker

pub mod account;
pub mod codec;
pub mod duration;
pub mod error;
pub mod frame;
pub mod operation;
pub mod task;

pub use duration as duration_millis;

pub use account::{
    AccountHandle, AccountStatus, AccountSummary, AccountType, Credentials, Environment,
    MarketPermission, TOKEN_REFRESH_MARGIN_SECS,
};
pub use codec::{FrameReader, FrameWriter, MAX_FRAME_BYTES};
pub use error::ProtocolError;
pub use frame::{
    ErrorKind, HostFrame, ResponseStatus, WorkerFrame, WorkerInit, WorkerRequest, WorkerResponse,
};
pub use operation::{OperationClass, OperationType};
pub use task::{
    MethodName, Task, TaskRequest, TaskResult, DEFAULT_TASK_TIMEOUT, SYSTEM_NAMESPACE,
    TRADE_NAMESPACE,
};
