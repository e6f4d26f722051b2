//! Account worker runtime for brokergate.
//!
//! A worker owns exactly one authenticated brokerage session. The host
//! talks to it over a byte pipe using the frames in `brokergate_protocol`:
//!
//! ```text
//!   stdin  ──► FrameReader ──► pending queue ──► MethodRegistry ──► handler
//!                                                                      │
//!   stdout ◄── FrameWriter ◄── response / heartbeat ◄──────────────────┘
//! ```
//!
//! The same [`serve`] loop runs inside a dedicated OS process (the
//! `brokergate-worker` binary) or on a tokio task when isolation is relaxed.

pub mod error;
pub mod handlers;
pub mod registry;
pub mod runtime;
pub mod session;

pub use error::{HandlerError, RegistryError, WorkerError};
pub use handlers::{PaperLedger, StandardHandlers};
pub use registry::{
    Handler, HandlerFuture, HandlerResult, Invocation, MethodRegistry, RegistryFactory,
};
pub use runtime::{serve, SessionEnd};
pub use session::SessionContext;

use std::sync::Arc;

/// Serve one session over this process's stdin/stdout
pub async fn serve_stdio(factory: Arc<dyn RegistryFactory>) -> Result<SessionEnd, WorkerError> {
    serve(tokio::io::stdin(), tokio::io::stdout(), factory).await
}
