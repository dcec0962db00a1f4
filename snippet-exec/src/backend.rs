use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;
use std::time::{Duration, Instant};
use tracing::{debug, error};

use crate::{
    config::ExecutionConfig,
    error::Error,
    types::{BackendOutcome, CompileReport, Language, RunReport, StageOutput},
};

/// Remote service that compiles and runs code inside its own sandbox
#[async_trait]
pub trait ExecutionBackend: Send + Sync {
    /// Compile (when the language needs it) and run `code`
    async fn run(
        &self,
        language: Language,
        code: &str,
        compile_args: &[&str],
    ) -> Result<BackendOutcome, Error>;

    /// Compile `code` without giving it meaningful run time
    async fn check_compile(
        &self,
        language: Language,
        code: &str,
        compile_args: &[&str],
    ) -> Result<CompileReport, Error>;

    /// Confirm the backend answers at all
    async fn probe(&self) -> Result<(), Error> {
        self.run(Language::Python, r#"print("health check")"#, &[])
            .await
            .map(|_| ())
    }
}

#[derive(Debug, Serialize)]
struct SourceFile<'a> {
    content: &'a str,
}

#[derive(Debug, Serialize)]
struct PistonRequest<'a> {
    language: &'static str,
    version: &'static str,
    files: [SourceFile<'a>; 1],
    compile_timeout: u64,
    run_timeout: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    compile_args: Option<&'a [&'a str]>,
}

/// Client for a Piston-compatible execute endpoint
pub struct PistonClient {
    client: Client,
    config: ExecutionConfig,
}

impl PistonClient {
    pub fn new(config: ExecutionConfig) -> Result<Self, Error> {
        config.validate()?;
        reqwest::Url::parse(&config.backend_url)
            .map_err(|e| Error::Config(format!("invalid backend URL: {}", e)))?;

        let client = Client::builder()
            .build()
            .map_err(|e| Error::Config(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self { client, config })
    }

    pub fn config(&self) -> &ExecutionConfig {
        &self.config
    }

    fn build_request<'a>(
        &self,
        language: Language,
        code: &'a str,
        compile_args: &'a [&'a str],
        run_timeout: u64,
    ) -> PistonRequest<'a> {
        PistonRequest {
            language: language.backend_id(),
            version: "*",
            files: [SourceFile { content: code }],
            compile_timeout: self.config.compile_timeout_ms,
            run_timeout,
            compile_args: (!compile_args.is_empty()).then_some(compile_args),
        }
    }

    /// One round trip, aborted when the client-side budget runs out.
    async fn send(
        &self,
        request: &PistonRequest<'_>,
        timeout: Duration,
    ) -> Result<BackendOutcome, Error> {
        let started = Instant::now();

        let result = match tokio::time::timeout(timeout, self.round_trip(request)).await {
            Ok(result) => result,
            Err(_) => Err(Error::ExecutionTimeout(timeout.as_millis() as u64)),
        };

        match &result {
            Ok(_) => debug!(
                language = request.language,
                elapsed_ms = started.elapsed().as_millis() as u64,
                "Execution backend responded"
            ),
            Err(e) => error!(language = request.language, "Execution backend call failed: {}", e),
        }

        result
    }

    async fn round_trip(&self, request: &PistonRequest<'_>) -> Result<BackendOutcome, Error> {
        let response = self
            .client
            .post(&self.config.backend_url)
            .json(request)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(Error::BackendStatus {
                status_code: status.as_u16(),
                message: status
                    .canonical_reason()
                    .unwrap_or("unexpected status")
                    .to_string(),
            });
        }

        let body = response.bytes().await?;
        serde_json::from_slice(&body)
            .map_err(|e| Error::Unknown(format!("unexpected backend response: {}", e)))
    }
}

#[async_trait]
impl ExecutionBackend for PistonClient {
    async fn run(
        &self,
        language: Language,
        code: &str,
        compile_args: &[&str],
    ) -> Result<BackendOutcome, Error> {
        let request = self.build_request(language, code, compile_args, self.config.run_timeout_ms);
        self.send(&request, self.config.timeout).await
    }

    async fn check_compile(
        &self,
        language: Language,
        code: &str,
        compile_args: &[&str],
    ) -> Result<CompileReport, Error> {
        let request = self.build_request(
            language,
            code,
            compile_args,
            self.config.compile_check_run_timeout_ms,
        );
        let outcome = self.send(&request, self.config.timeout).await?;
        Ok(outcome.compile_report())
    }

    async fn probe(&self) -> Result<(), Error> {
        let request = self.build_request(
            Language::Python,
            r#"print("health check")"#,
            &[],
            self.config.compile_check_run_timeout_ms,
        );
        let budget = self.config.timeout.min(Duration::from_secs(5));
        self.send(&request, budget).await.map(|_| ())
    }
}

impl BackendOutcome {
    /// Collapses both stages into a single pass/fail report.
    pub fn into_report(self) -> RunReport {
        if let Some(compile) = self.compile.filter(|stage| stage.code != 0) {
            return RunReport {
                success: false,
                output: String::new(),
                error: Some(compile_error(compile)),
            };
        }

        let run = self.run;
        if run.code != 0 {
            let combined = join_non_empty(&[run.stderr.as_str(), run.stdout.as_str()]);
            return RunReport {
                success: false,
                output: String::new(),
                error: Some(if combined.is_empty() {
                    format!("Process exited with code {}", run.code)
                } else {
                    combined
                }),
            };
        }

        // Programs may legitimately write diagnostics to stderr
        RunReport {
            success: true,
            output: join_non_empty(&[run.stdout.as_str(), run.stderr.as_str()]),
            error: None,
        }
    }

    /// Looks only at the compile stage.
    pub fn compile_report(self) -> CompileReport {
        match self.compile {
            Some(compile) if compile.code != 0 => CompileReport {
                success: false,
                error: Some(compile_error(compile)),
            },
            _ => CompileReport {
                success: true,
                error: None,
            },
        }
    }
}

fn compile_error(stage: StageOutput) -> String {
    [stage.stderr, stage.stdout]
        .into_iter()
        .find(|text| !text.is_empty())
        .unwrap_or_else(|| "Compilation failed".to_string())
}

fn join_non_empty(parts: &[&str]) -> String {
    parts
        .iter()
        .filter(|part| !part.is_empty())
        .copied()
        .collect::<Vec<_>>()
        .join("\n")
}
