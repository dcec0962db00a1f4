use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Invalid request: {}", .0.join("; "))]
    Validation(Vec<String>),

    #[error("{0}")]
    SecurityViolation(String),

    #[error("Rate limit exceeded, retry in {retry_after} seconds")]
    RateLimitExceeded {
        limit: u32,
        reset_at: u64,
        retry_after: u64,
    },

    #[error("Execution timed out after {0}ms")]
    ExecutionTimeout(u64),

    #[error("Execution backend error: {status_code} {message}")]
    BackendStatus { status_code: u16, message: String },

    #[error("Execution backend error: {0}")]
    Backend(String),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Unknown error: {0}")]
    Unknown(String),
}

/// Who is at fault for a failed request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Malformed or rejected input (HTTP 400)
    Client,
    /// Caller must wait for the window to reset (HTTP 429)
    RateLimited,
    /// Backend or server-side failure (HTTP 500)
    Internal,
}

impl Error {
    pub fn category(&self) -> ErrorCategory {
        match self {
            Error::Validation(_) | Error::SecurityViolation(_) => ErrorCategory::Client,
            Error::RateLimitExceeded { .. } => ErrorCategory::RateLimited,
            Error::ExecutionTimeout(_)
            | Error::BackendStatus { .. }
            | Error::Backend(_)
            | Error::Config(_)
            | Error::Unknown(_) => ErrorCategory::Internal,
        }
    }
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        Error::Backend(e.to_string())
    }
}
