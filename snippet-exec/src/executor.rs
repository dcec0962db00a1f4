use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, warn};

use crate::{
    backend::{ExecutionBackend, PistonClient},
    config::ExecutionConfig,
    error::{Error, ErrorCategory},
    security::screen_code,
    types::{Action, ExecutionRequest, ExecutionResult, Language},
    validation::validate_request,
};

/// Appended once to output that was cut at the length cap
pub const TRUNCATION_MARKER: &str = "\n... (output truncated)";

const CPP_COMPILE_ARGS: &[&str] = &["-std=c++17"];

/// Validates, screens and dispatches requests to the execution backend
pub struct CodeExecutor {
    backend: Arc<dyn ExecutionBackend>,
    config: ExecutionConfig,
}

impl CodeExecutor {
    /// Create an executor talking to the configured Piston endpoint
    pub fn new(config: ExecutionConfig) -> Result<Self, Error> {
        let backend = PistonClient::new(config.clone())?;
        Ok(Self::with_backend(Arc::new(backend), config))
    }

    pub fn with_backend(backend: Arc<dyn ExecutionBackend>, config: ExecutionConfig) -> Self {
        Self { backend, config }
    }

    pub fn config(&self) -> &ExecutionConfig {
        &self.config
    }

    pub fn backend(&self) -> &Arc<dyn ExecutionBackend> {
        &self.backend
    }

    /// Runs the whole pipeline. Failures come back as `success: false`
    /// results; `execution_time` is always set.
    pub async fn execute(&self, request: ExecutionRequest) -> ExecutionResult {
        let started = Instant::now();
        let language = request.language;
        let action = request.effective_action();

        let mut result = match self.try_execute(&request).await {
            Ok(result) => result,
            Err(e) => {
                match e.category() {
                    ErrorCategory::Client | ErrorCategory::RateLimited => {
                        warn!(%language, %action, "Execution rejected: {}", e)
                    }
                    ErrorCategory::Internal => {
                        error!(%language, %action, "Execution failed: {}", e)
                    }
                }
                ExecutionResult::failure(e.to_string())
            }
        };

        let elapsed_ms = started.elapsed().as_millis() as u64;
        result.execution_time = Some(elapsed_ms);
        info!(
            %language,
            %action,
            success = result.success,
            elapsed_ms,
            "Code execution completed"
        );
        result
    }

    async fn try_execute(&self, request: &ExecutionRequest) -> Result<ExecutionResult, Error> {
        validate_request(request, &self.config)?;
        let code = screen_code(&request.code, request.language)?;

        debug!(
            language = %request.language,
            action = %request.effective_action(),
            code_len = code.len(),
            "Dispatching to execution backend"
        );

        match (request.language, request.effective_action()) {
            (Language::Python, _) => self.run(Language::Python, code, &[]).await,
            (Language::Cpp, Action::Compile) => self.compile_cpp(code).await,
            (Language::Cpp, Action::Run | Action::CompileAndRun) => {
                self.run(Language::Cpp, code, CPP_COMPILE_ARGS).await
            }
        }
    }

    async fn run(
        &self,
        language: Language,
        code: &str,
        compile_args: &[&str],
    ) -> Result<ExecutionResult, Error> {
        let report = self
            .backend
            .run(language, code, compile_args)
            .await?
            .into_report();

        Ok(ExecutionResult {
            success: report.success,
            output: if report.success {
                truncate_output(&report.output, self.config.max_output_length)
            } else {
                String::new()
            },
            error: report.error,
            ..Default::default()
        })
    }

    async fn compile_cpp(&self, code: &str) -> Result<ExecutionResult, Error> {
        let report = self
            .backend
            .check_compile(Language::Cpp, code, CPP_COMPILE_ARGS)
            .await?;

        Ok(ExecutionResult {
            success: report.success,
            output: if report.success {
                "Compilation successful!".to_string()
            } else {
                String::new()
            },
            error: report.error,
            compiled: Some(report.success),
            ..Default::default()
        })
    }
}

/// Caps `output` at `max_len` characters, marking the cut once.
pub fn truncate_output(output: &str, max_len: usize) -> String {
    match output.char_indices().nth(max_len) {
        Some((cut, _)) => format!("{}{}", &output[..cut], TRUNCATION_MARKER),
        None => output.to_string(),
    }
}
