use thiserror::Error;

/// Request-level failures. Tool failures never surface here; they are fed
/// back to the model as failure payloads instead.
#[derive(Debug, Error)]
pub enum ChatError {
    #[error("{0}")]
    InvalidRequest(String),

    #[error("{0}")]
    Upstream(String),

    #[error("request cancelled")]
    Cancelled,
}

impl ChatError {
    pub fn invalid(message: impl Into<String>) -> Self {
        Self::InvalidRequest(message.into())
    }

    pub fn upstream(err: impl std::fmt::Display) -> Self {
        Self::Upstream(err.to_string())
    }

    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidRequest(_) => "INVALID_REQUEST",
            Self::Upstream(_) => "UPSTREAM_ERROR",
            Self::Cancelled => "CANCELLED",
        }
    }
}

pub type ChatResult<T> = Result<T, ChatError>;
