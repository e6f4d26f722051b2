use thiserror::Error;

/// Errors raised while validating requests or decoding frames
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("invalid method: {0}")]
    InvalidMethod(String),

    #[error("invalid timeout: {0}")]
    InvalidTimeout(String),

    #[error("malformed frame: {0}")]
    MalformedFrame(#[from] serde_json::Error),

    #[error("frame exceeds {limit} bytes")]
    FrameTooLarge { limit: usize },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl ProtocolError {
    /// Errors caused by the caller's input rather than the transport
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            ProtocolError::InvalidMethod(_) | ProtocolError::InvalidTimeout(_)
        )
    }
}
