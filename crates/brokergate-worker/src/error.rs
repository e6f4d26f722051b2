use brokergate_protocol::{ErrorKind, ProtocolError};
use std::time::Duration;
use thiserror::Error;

/// Failure returned by a method handler
#[derive(Debug, Clone, Error, PartialEq)]
pub enum HandlerError {
    #[error("invalid arguments: {0}")]
    InvalidArguments(String),

    #[error("unknown method: {0}")]
    UnknownMethod(String),

    #[error("{0}")]
    Rejected(String),

    #[error("handler timed out after {0:?}")]
    Timeout(Duration),

    #[error("{0}")]
    Internal(String),

    /// Ends the session without answering; the host sees the pipe close
    #[error("session terminated: {0}")]
    Fatal(String),
}

impl HandlerError {
    pub fn invalid(msg: impl Into<String>) -> Self {
        Self::InvalidArguments(msg.into())
    }

    pub fn rejected(msg: impl Into<String>) -> Self {
        Self::Rejected(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Wire classification; `None` for errors that never cross the pipe
    pub fn kind(&self) -> Option<ErrorKind> {
        match self {
            HandlerError::InvalidArguments(_) => Some(ErrorKind::InvalidArguments),
            HandlerError::UnknownMethod(_) => Some(ErrorKind::UnknownMethod),
            HandlerError::Rejected(_) => Some(ErrorKind::Rejected),
            HandlerError::Timeout(_) => Some(ErrorKind::Timeout),
            HandlerError::Internal(_) => Some(ErrorKind::Internal),
            HandlerError::Fatal(_) => None,
        }
    }
}

/// Registration-time failures
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("invalid method name: {0}")]
    InvalidName(#[from] ProtocolError),

    #[error("handler already registered for {0}")]
    Duplicate(String),

    #[error("registry setup failed: {0}")]
    Setup(String),
}

/// Session-level failures of the worker runtime
#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("handshake failed: {0}")]
    Handshake(String),

    #[error("startup failed: {0}")]
    Startup(String),

    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),
}
