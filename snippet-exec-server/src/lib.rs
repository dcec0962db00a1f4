use axum::{
    extract::{rejection::JsonRejection, State},
    http::{header, HeaderMap, HeaderValue, StatusCode},
    middleware,
    response::{IntoResponse, Response},
    routing::{get, post},
    Extension, Json, Router,
};
use serde::Serialize;
use serde_json::{json, Value};
use snippet_exec::{
    parse_request, screen_code, CodeExecutor, Error, ExecutionBackend, ExecutionConfig,
    ExecutionResult, RateLimitConfig, RateLimiter,
};
use std::{
    any::Any,
    net::SocketAddr,
    sync::Arc,
    time::{SystemTime, UNIX_EPOCH},
};
use tokio::net::TcpListener;
use tower_http::{
    catch_panic::CatchPanicLayer, cors::CorsLayer, set_header::SetResponseHeaderLayer,
    trace::TraceLayer,
};
use tracing::{error, info, warn};

mod error;
mod rate_limit;

pub use error::ServerError;
pub use rate_limit::{client_identifier, ClientId};

use rate_limit::{api_rate_limit, insert_rate_limit_headers};

#[derive(Clone)]
pub struct AppState {
    executor: Arc<CodeExecutor>,
    execute_limiter: Arc<RateLimiter>,
    api_limiter: Arc<RateLimiter>,
    enable_hsts: bool,
}

impl AppState {
    pub fn new(executor: CodeExecutor, limits: &RateLimitConfig) -> Self {
        Self {
            executor: Arc::new(executor),
            execute_limiter: Arc::new(RateLimiter::new(limits.execute)),
            api_limiter: Arc::new(RateLimiter::new(limits.api)),
            enable_hsts: false,
        }
    }

    /// Only for deployments served over HTTPS
    pub fn with_hsts(mut self, enable_hsts: bool) -> Self {
        self.enable_hsts = enable_hsts;
        self
    }
}

const CONTENT_SECURITY_POLICY: &str = "default-src 'none'; frame-ancestors 'none'";
const STRICT_TRANSPORT_SECURITY: &str = "max-age=31536000; includeSubDomains";

#[derive(Debug, Serialize)]
struct HealthReport {
    status: &'static str,
    timestamp: u64,
    checks: HealthChecks,
}

#[derive(Debug, Serialize)]
struct HealthChecks {
    backend: ComponentHealth,
}

#[derive(Debug, Serialize)]
struct ComponentHealth {
    status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    message: Option<String>,
}

pub async fn create_app(
    config: ExecutionConfig,
    limits: RateLimitConfig,
    enable_hsts: bool,
) -> Result<Router, ServerError> {
    limits.validate()?;
    let executor = CodeExecutor::new(config)?;
    let state = AppState::new(executor, &limits).with_hsts(enable_hsts);

    // Sweepers stop on their own once the router is dropped
    state.execute_limiter.spawn_sweeper(limits.sweep_interval);
    state.api_limiter.spawn_sweeper(limits.sweep_interval);

    Ok(router(state))
}

/// Assembles routes and middleware around an existing state.
pub fn router(state: AppState) -> Router {
    let enable_hsts = state.enable_hsts;
    let api = Router::new()
        .route("/execute", post(execute))
        .route("/health", get(health_check))
        .layer(middleware::from_fn_with_state(
            state.api_limiter.clone(),
            api_rate_limit,
        ))
        .with_state(state);

    let mut app = Router::new()
        .nest("/api", api)
        .layer(SetResponseHeaderLayer::if_not_present(
            header::CONTENT_SECURITY_POLICY,
            HeaderValue::from_static(CONTENT_SECURITY_POLICY),
        ))
        .layer(SetResponseHeaderLayer::if_not_present(
            header::X_CONTENT_TYPE_OPTIONS,
            HeaderValue::from_static("nosniff"),
        ))
        .layer(SetResponseHeaderLayer::if_not_present(
            header::X_FRAME_OPTIONS,
            HeaderValue::from_static("DENY"),
        ))
        .layer(SetResponseHeaderLayer::if_not_present(
            header::REFERRER_POLICY,
            HeaderValue::from_static("strict-origin-when-cross-origin"),
        ))
        .layer(SetResponseHeaderLayer::if_not_present(
            header::X_XSS_PROTECTION,
            HeaderValue::from_static("1; mode=block"),
        ));

    if enable_hsts {
        app = app.layer(SetResponseHeaderLayer::if_not_present(
            header::STRICT_TRANSPORT_SECURITY,
            HeaderValue::from_static(STRICT_TRANSPORT_SECURITY),
        ));
    }

    app.layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .layer(CatchPanicLayer::custom(handle_panic))
}

pub async fn run_server(app: Router, addr: SocketAddr) -> Result<(), ServerError> {
    info!("Starting snippet execution gateway on {}", addr);
    let listener = TcpListener::bind(addr)
        .await
        .map_err(|e| ServerError::ServerError(e.to_string()))?;

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await
    .map_err(|e| ServerError::ServerError(e.to_string()))?;

    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for shutdown signal: {}", e);
        return;
    }
    info!("Shutdown signal received");
}

async fn health_check(State(state): State<AppState>) -> Json<HealthReport> {
    let backend = match state.executor.backend().probe().await {
        Ok(()) => ComponentHealth {
            status: "ok",
            message: None,
        },
        Err(e) => {
            warn!("Execution backend health check failed: {}", e);
            ComponentHealth {
                status: "error",
                message: Some(e.to_string()),
            }
        }
    };

    Json(HealthReport {
        status: if backend.status == "ok" {
            "healthy"
        } else {
            "degraded"
        },
        timestamp: unix_millis(),
        checks: HealthChecks { backend },
    })
}

async fn execute(
    State(state): State<AppState>,
    Extension(client): Extension<ClientId>,
    payload: Result<Json<Value>, JsonRejection>,
) -> Result<(HeaderMap, Json<ExecutionResult>), ServerError> {
    let Json(raw) =
        payload.map_err(|rejection| Error::Validation(vec![rejection.body_text()]))?;

    // Invalid requests never spend execution quota
    let request = parse_request(&raw, state.executor.config())?;
    let decision = state.execute_limiter.acquire(&client.0)?;
    screen_code(&request.code, request.language)?;

    let result = state.executor.execute(request).await;

    let mut headers = HeaderMap::new();
    insert_rate_limit_headers(&mut headers, (&decision).into());
    Ok((headers, Json(result)))
}

fn handle_panic(err: Box<dyn Any + Send + 'static>) -> Response {
    let detail = err
        .downcast_ref::<String>()
        .map(String::as_str)
        .or_else(|| err.downcast_ref::<&str>().copied())
        .unwrap_or("unknown panic");
    error!("Request handler panicked: {}", detail);

    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({ "error": "Internal server error" })),
    )
        .into_response()
}

fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{body::Body, http::Request};
    use snippet_exec::RateLimitPolicy;
    use std::time::Duration;
    use tower::ServiceExt;
    use wiremock::{
        matchers::{body_partial_json, method, path},
        Mock, MockServer, ResponseTemplate,
    };

    fn backend_config(server: &MockServer) -> ExecutionConfig {
        ExecutionConfig::default()
            .with_backend_url(format!("{}/execute", server.uri()))
            .with_timeout(Duration::from_secs(2))
    }

    async fn app_for(server: &MockServer, limits: RateLimitConfig) -> Router {
        create_app(backend_config(server), limits, false)
            .await
            .expect("Failed to create app")
    }

    fn health_request() -> Request<Body> {
        Request::builder()
            .uri("/api/health")
            .body(Body::empty())
            .unwrap()
    }

    fn run_response(code: i32, stdout: &str, stderr: &str) -> ResponseTemplate {
        ResponseTemplate::new(200).set_body_json(json!({
            "language": "python",
            "version": "3.10.0",
            "run": { "code": code, "stdout": stdout, "stderr": stderr }
        }))
    }

    fn execute_request(body: Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri("/api/execute")
            .header("content-type", "application/json")
            .header("x-forwarded-for", "203.0.113.9")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    async fn json_body(response: Response) -> Value {
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&body).unwrap()
    }

    #[tokio::test]
    async fn test_execute_python() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/execute"))
            .and(body_partial_json(json!({ "language": "python3" })))
            .respond_with(run_response(0, "hi\n", ""))
            .expect(1)
            .mount(&server)
            .await;

        let app = app_for(&server, RateLimitConfig::default()).await;
        let response = app
            .oneshot(execute_request(
                json!({ "code": "print('hi')", "language": "python" }),
            ))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()["x-ratelimit-limit"], "10");
        assert_eq!(response.headers()["x-ratelimit-remaining"], "9");
        assert!(response.headers().contains_key("x-ratelimit-reset"));
        assert_eq!(response.headers()["x-content-type-options"], "nosniff");
        assert_eq!(response.headers()["x-frame-options"], "DENY");

        let body = json_body(response).await;
        assert_eq!(body["success"], true);
        assert_eq!(body["output"], "hi\n");
        assert!(body["executionTime"].is_u64());
        assert!(body.get("error").is_none());
    }

    #[tokio::test]
    async fn test_screened_code_never_reaches_backend() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(run_response(0, "", ""))
            .expect(0)
            .mount(&server)
            .await;

        let app = app_for(&server, RateLimitConfig::default()).await;
        let response = app
            .oneshot(execute_request(json!({
                "code": "import subprocess\nsubprocess.run(['ls'])",
                "language": "python"
            })))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = json_body(response).await;
        assert!(body["error"].as_str().unwrap().contains("subprocess"));
    }

    #[tokio::test]
    async fn test_invalid_request_lists_violations() {
        let server = MockServer::start().await;
        let app = app_for(&server, RateLimitConfig::default()).await;

        let response = app
            .oneshot(execute_request(json!({ "code": "", "language": "ruby" })))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = json_body(response).await;
        let error = body["error"].as_str().unwrap();
        assert!(error.contains("code must not be empty"));
        assert!(error.contains("language must be one of: python, cpp"));
    }

    #[tokio::test]
    async fn test_malformed_json_is_bad_request() {
        let server = MockServer::start().await;
        let app = app_for(&server, RateLimitConfig::default()).await;

        let request = Request::builder()
            .method("POST")
            .uri("/api/execute")
            .header("content-type", "application/json")
            .body(Body::from("{not json"))
            .unwrap();
        let response = app.oneshot(request).await.unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = json_body(response).await;
        assert!(body["error"].as_str().unwrap().starts_with("Invalid request"));
    }

    #[tokio::test]
    async fn test_cpp_compile_failure_is_ok_response() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(body_partial_json(json!({
                "language": "cpp",
                "compile_args": ["-std=c++17"]
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "compile": { "code": 1, "stdout": "", "stderr": "error: expected ')'" },
                "run": { "code": null, "stdout": "", "stderr": "" }
            })))
            .expect(1)
            .mount(&server)
            .await;

        let app = app_for(&server, RateLimitConfig::default()).await;
        let response = app
            .oneshot(execute_request(json!({
                "code": "int main( {",
                "language": "cpp",
                "action": "compile"
            })))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = json_body(response).await;
        assert_eq!(body["success"], false);
        assert_eq!(body["compiled"], false);
        assert_eq!(body["error"], "error: expected ')'");
    }

    #[tokio::test]
    async fn test_execute_limit_exceeded() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(run_response(0, "ok\n", ""))
            .expect(10)
            .mount(&server)
            .await;

        let app = app_for(&server, RateLimitConfig::default()).await;
        let body = json!({ "code": "print('ok')", "language": "python" });

        for _ in 0..10 {
            let response = app
                .clone()
                .oneshot(execute_request(body.clone()))
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::OK);
        }

        let response = app.oneshot(execute_request(body)).await.unwrap();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(response.headers()["x-ratelimit-limit"], "10");
        assert_eq!(response.headers()["x-ratelimit-remaining"], "0");
        let retry_after: u64 = response.headers()["retry-after"]
            .to_str()
            .unwrap()
            .parse()
            .unwrap();
        assert!(retry_after >= 1);

        let body = json_body(response).await;
        assert_eq!(body["error"], "Too many requests");
        assert_eq!(body["retryAfter"], retry_after);
    }

    #[tokio::test]
    async fn test_invalid_requests_do_not_spend_execute_quota() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(run_response(0, "ok\n", ""))
            .mount(&server)
            .await;

        let limits = RateLimitConfig {
            execute: RateLimitPolicy::per_minute(1),
            ..RateLimitConfig::default()
        };
        let app = app_for(&server, limits).await;

        for _ in 0..3 {
            let response = app
                .clone()
                .oneshot(execute_request(json!({ "language": "python" })))
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        }

        let response = app
            .oneshot(execute_request(
                json!({ "code": "print('ok')", "language": "python" }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_api_limit_applies_to_health() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(run_response(0, "health check\n", ""))
            .mount(&server)
            .await;

        let limits = RateLimitConfig {
            api: RateLimitPolicy::per_minute(2),
            ..RateLimitConfig::default()
        };
        let app = app_for(&server, limits).await;
        let health = || {
            Request::builder()
                .uri("/api/health")
                .header("x-real-ip", "198.51.100.4")
                .body(Body::empty())
                .unwrap()
        };

        for _ in 0..2 {
            let response = app.clone().oneshot(health()).await.unwrap();
            assert_eq!(response.status(), StatusCode::OK);
            assert_eq!(response.headers()["x-ratelimit-limit"], "2");
        }

        let response = app.clone().oneshot(health()).await.unwrap();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);

        // Other clients keep their own window
        let other = Request::builder()
            .uri("/api/health")
            .header("x-real-ip", "198.51.100.5")
            .body(Body::empty())
            .unwrap();
        let response = app.oneshot(other).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_health_healthy() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(body_partial_json(json!({ "language": "python3" })))
            .respond_with(run_response(0, "health check\n", ""))
            .expect(1)
            .mount(&server)
            .await;

        let app = app_for(&server, RateLimitConfig::default()).await;
        let response = app
            .oneshot(
                Request::builder()
                    .uri("/api/health")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = json_body(response).await;
        assert_eq!(body["status"], "healthy");
        assert_eq!(body["checks"]["backend"]["status"], "ok");
        assert!(body["timestamp"].as_u64().unwrap() > 0);
    }

    #[tokio::test]
    async fn test_health_degraded() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let app = app_for(&server, RateLimitConfig::default()).await;
        let response = app
            .oneshot(
                Request::builder()
                    .uri("/api/health")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = json_body(response).await;
        assert_eq!(body["status"], "degraded");
        assert_eq!(body["checks"]["backend"]["status"], "error");
        assert!(body["checks"]["backend"]["message"]
            .as_str()
            .unwrap()
            .contains("503"));
    }

    #[tokio::test]
    async fn test_security_headers_on_every_response() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(run_response(0, "health check\n", ""))
            .mount(&server)
            .await;

        let app = app_for(&server, RateLimitConfig::default()).await;
        let response = app.oneshot(health_request()).await.unwrap();

        let headers = response.headers();
        assert_eq!(headers["x-content-type-options"], "nosniff");
        assert_eq!(headers["x-frame-options"], "DENY");
        assert_eq!(headers["x-xss-protection"], "1; mode=block");
        assert_eq!(
            headers["referrer-policy"],
            "strict-origin-when-cross-origin"
        );
        assert_eq!(headers["content-security-policy"], CONTENT_SECURITY_POLICY);
        assert!(!headers.contains_key("strict-transport-security"));
    }

    #[tokio::test]
    async fn test_hsts_only_when_enabled() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(run_response(0, "health check\n", ""))
            .mount(&server)
            .await;

        let app = create_app(backend_config(&server), RateLimitConfig::default(), true)
            .await
            .expect("Failed to create app");
        let response = app.oneshot(health_request()).await.unwrap();

        assert_eq!(
            response.headers()["strict-transport-security"],
            STRICT_TRANSPORT_SECURITY
        );
    }
}
