use std::time::Duration;

use crate::error::Error;

pub const DEFAULT_BACKEND_URL: &str = "https://emkc.org/api/v2/piston/execute";

/// Limits and endpoints for a single execution
#[derive(Debug, Clone)]
pub struct ExecutionConfig {
    /// Piston-compatible execute endpoint
    pub backend_url: String,
    /// Client-side budget for one backend round trip
    pub timeout: Duration,
    /// Characters of program output returned before truncation
    pub max_output_length: usize,
    /// Characters of source accepted per request
    pub max_code_length: usize,
    /// Compile budget sent to the backend, in milliseconds
    pub compile_timeout_ms: u64,
    /// Run budget sent to the backend, in milliseconds
    pub run_timeout_ms: u64,
    /// Run budget for compile-only checks, in milliseconds
    pub compile_check_run_timeout_ms: u64,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            backend_url: DEFAULT_BACKEND_URL.to_string(),
            timeout: Duration::from_secs(10),
            max_output_length: 10_000,
            max_code_length: 100_000,
            compile_timeout_ms: 10_000,
            run_timeout_ms: 10_000,
            compile_check_run_timeout_ms: 1_000,
        }
    }
}

impl ExecutionConfig {
    pub fn with_backend_url(mut self, backend_url: impl Into<String>) -> Self {
        self.backend_url = backend_url.into();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_max_output_length(mut self, max_output_length: usize) -> Self {
        self.max_output_length = max_output_length;
        self
    }

    pub fn with_max_code_length(mut self, max_code_length: usize) -> Self {
        self.max_code_length = max_code_length;
        self
    }

    pub fn validate(&self) -> Result<(), Error> {
        if self.backend_url.trim().is_empty() {
            return Err(Error::Config("backend URL must not be empty".into()));
        }
        if self.timeout.is_zero() {
            return Err(Error::Config("execution timeout must be positive".into()));
        }
        if self.max_code_length == 0 {
            return Err(Error::Config("max code length must be positive".into()));
        }
        Ok(())
    }
}

/// Fixed-window budget for one limiter
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitPolicy {
    pub max_requests: u32,
    pub window: Duration,
}

impl RateLimitPolicy {
    pub fn new(max_requests: u32, window: Duration) -> Self {
        Self {
            max_requests,
            window,
        }
    }

    pub fn per_minute(max_requests: u32) -> Self {
        Self::new(max_requests, Duration::from_secs(60))
    }
}

/// Budgets for the two independent limiters in front of the gateway
#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    /// Applies to the execute endpoint only
    pub execute: RateLimitPolicy,
    /// Applies to every API request
    pub api: RateLimitPolicy,
    /// How often expired windows are swept
    pub sweep_interval: Duration,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            execute: RateLimitPolicy::per_minute(10),
            api: RateLimitPolicy::per_minute(100),
            sweep_interval: Duration::from_secs(5 * 60),
        }
    }
}

impl RateLimitConfig {
    pub fn validate(&self) -> Result<(), Error> {
        for (name, policy) in [("execute", &self.execute), ("api", &self.api)] {
            if policy.max_requests == 0 {
                return Err(Error::Config(format!(
                    "{} rate limit must allow at least one request",
                    name
                )));
            }
            if policy.window.is_zero() {
                return Err(Error::Config(format!(
                    "{} rate limit window must be positive",
                    name
                )));
            }
        }
        if self.sweep_interval.is_zero() {
            return Err(Error::Config("sweep interval must be positive".into()));
        }
        Ok(())
    }
}
