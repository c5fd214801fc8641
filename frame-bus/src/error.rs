pub type RelayResult<T> = Result<T, RelayError>;

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum RelayError {
    /// Payload length does not match the session geometry. Only the frame is dropped.
    #[error("malformed frame: expected {expected} bytes, got {actual}")]
    MalformedFrame { expected: usize, actual: usize },

    #[error("encoder unavailable: {0}")]
    SinkUnavailable(String),

    #[error("sink write failed: {0}")]
    WriteFailure(String),

    #[error("a producer session is already active")]
    ConcurrentSession,

    #[error("session cancelled")]
    Cancelled,
}

impl RelayError {
    pub fn sink_unavailable(msg: impl Into<String>) -> Self {
        Self::SinkUnavailable(msg.into())
    }

    pub fn write_failure(msg: impl Into<String>) -> Self {
        Self::WriteFailure(msg.into())
    }

    /// Errors after which a session stops accepting frames.
    pub fn is_session_fatal(&self) -> bool {
        matches!(
            self,
            Self::SinkUnavailable(_) | Self::WriteFailure(_) | Self::Cancelled
        )
    }
}
