use axum::{
    http::{header::RETRY_AFTER, HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use snippet_exec::{Error, ErrorCategory};
use thiserror::Error;
use tracing::error;

use crate::rate_limit::{insert_rate_limit_headers, RateLimitHeaders};

#[derive(Debug, Error)]
pub enum ServerError {
    #[error(transparent)]
    Execution(#[from] Error),
    #[error("Server error: {0}")]
    ServerError(String),
}

impl IntoResponse for ServerError {
    fn into_response(self) -> Response {
        match self {
            ServerError::Execution(Error::RateLimitExceeded {
                limit,
                reset_at,
                retry_after,
            }) => {
                let mut headers = HeaderMap::new();
                insert_rate_limit_headers(
                    &mut headers,
                    RateLimitHeaders {
                        limit,
                        remaining: 0,
                        reset_at,
                    },
                );
                headers.insert(RETRY_AFTER, HeaderValue::from(retry_after));

                let body = json!({
                    "error": "Too many requests",
                    "message": "Rate limit exceeded. Please try again later.",
                    "retryAfter": retry_after,
                });
                (StatusCode::TOO_MANY_REQUESTS, headers, Json(body)).into_response()
            }
            ServerError::Execution(e) => {
                let status = match e.category() {
                    ErrorCategory::Client => StatusCode::BAD_REQUEST,
                    ErrorCategory::RateLimited => StatusCode::TOO_MANY_REQUESTS,
                    ErrorCategory::Internal => {
                        error!("Request failed: {}", e);
                        StatusCode::INTERNAL_SERVER_ERROR
                    }
                };
                (status, Json(json!({ "error": e.to_string() }))).into_response()
            }
            ServerError::ServerError(message) => {
                error!("Server error: {}", message);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    Json(json!({ "error": "Internal server error" })),
                )
                    .into_response()
            }
        }
    }
}
