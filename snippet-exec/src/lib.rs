//! # Snippet Execution Gateway
//!
//! Runs untrusted lesson snippets (Python and C++) on a remote sandboxed
//! execution backend. Requests are schema-checked, screened against a
//! denylist of dangerous constructs, rate limited per client and forwarded
//! to a Piston-compatible service; the backend's answer is normalized into a
//! single [`ExecutionResult`] shape.

mod backend;
mod config;
mod error;
mod executor;
mod rate_limiter;
mod security;
mod types;
mod validation;

pub use backend::{ExecutionBackend, PistonClient};
pub use config::{ExecutionConfig, RateLimitConfig, RateLimitPolicy, DEFAULT_BACKEND_URL};
pub use error::{Error, ErrorCategory};
pub use executor::{truncate_output, CodeExecutor, TRUNCATION_MARKER};
pub use rate_limiter::{
    MemoryStore, RateLimitDecision, RateLimitEntry, RateLimitStore, RateLimiter,
};
pub use security::screen_code;
pub use types::{
    Action, BackendOutcome, CompileReport, ExecutionRequest, ExecutionResult, Language,
    RunReport, StageOutput,
};
pub use validation::{parse_request, validate_request};

/// Result type for code execution operations
pub type Result<T> = std::result::Result<T, Error>;
