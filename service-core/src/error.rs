use axum::{
    Json,
    http::{HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use serde::Serialize;
use thiserror::Error;

use crate::middleware::tracing::current_request_id;

/// HTTP-facing error kinds. Every variant renders the OAuth-style envelope
/// `{"error", "error_description", "request_id"}`.
#[derive(Debug, Error)]
pub enum AppError {
    #[error("Validation error: {0}")]
    ValidationError(#[from] validator::ValidationErrors),

    #[error("Bad request ({code}): {description}")]
    BadRequest {
        code: &'static str,
        description: String,
    },

    #[error("Unauthorized ({code}): {description}")]
    Unauthorized {
        code: &'static str,
        description: String,
    },

    #[error("Forbidden ({code}): {description}")]
    Forbidden {
        code: &'static str,
        description: String,
    },

    #[error("Locked ({code}): {description}")]
    Locked {
        code: &'static str,
        description: String,
    },

    #[error("Not found ({code}): {description}")]
    NotFound {
        code: &'static str,
        description: String,
    },

    #[error("Conflict ({code}): {description}")]
    Conflict {
        code: &'static str,
        description: String,
        retry_after: Option<u64>,
    },

    #[error("Too many requests: {0}")]
    TooManyRequests(String, Option<u64>),

    #[error("Bad gateway ({code}): {description}")]
    BadGateway {
        code: &'static str,
        description: String,
    },

    #[error("Service unavailable ({code}): {description}")]
    ServiceUnavailable {
        code: &'static str,
        description: String,
    },

    #[error("Internal server error ({code}): {source}")]
    InternalError {
        code: &'static str,
        #[source]
        source: anyhow::Error,
    },

    #[error("Database error: {0}")]
    DatabaseError(anyhow::Error),

    #[error("Redis error: {0}")]
    RedisError(#[from] redis::RedisError),

    #[error("Configuration error: {0}")]
    ConfigError(anyhow::Error),
}

impl AppError {
    pub fn bad_request(code: &'static str, description: impl Into<String>) -> Self {
        AppError::BadRequest {
            code,
            description: description.into(),
        }
    }

    pub fn unauthorized(code: &'static str, description: impl Into<String>) -> Self {
        AppError::Unauthorized {
            code,
            description: description.into(),
        }
    }

    pub fn forbidden(code: &'static str, description: impl Into<String>) -> Self {
        AppError::Forbidden {
            code,
            description: description.into(),
        }
    }

    pub fn locked(code: &'static str, description: impl Into<String>) -> Self {
        AppError::Locked {
            code,
            description: description.into(),
        }
    }

    pub fn not_found(code: &'static str, description: impl Into<String>) -> Self {
        AppError::NotFound {
            code,
            description: description.into(),
        }
    }

    pub fn conflict(code: &'static str, description: impl Into<String>) -> Self {
        AppError::Conflict {
            code,
            description: description.into(),
            retry_after: None,
        }
    }

    pub fn internal(code: &'static str, source: impl Into<anyhow::Error>) -> Self {
        AppError::InternalError {
            code,
            source: source.into(),
        }
    }

    /// The machine-readable `error` code this variant renders.
    pub fn code(&self) -> &'static str {
        match self {
            AppError::ValidationError(_) => "invalid_request",
            AppError::BadRequest { code, .. }
            | AppError::Unauthorized { code, .. }
            | AppError::Forbidden { code, .. }
            | AppError::Locked { code, .. }
            | AppError::NotFound { code, .. }
            | AppError::Conflict { code, .. }
            | AppError::BadGateway { code, .. }
            | AppError::ServiceUnavailable { code, .. }
            | AppError::InternalError { code, .. } => *code,
            AppError::TooManyRequests(..) => "rate_limited",
            AppError::DatabaseError(_) | AppError::RedisError(_) | AppError::ConfigError(_) => {
                "server_error"
            }
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            AppError::ValidationError(_) | AppError::BadRequest { .. } => StatusCode::BAD_REQUEST,
            AppError::Unauthorized { .. } => StatusCode::UNAUTHORIZED,
            AppError::Forbidden { .. } => StatusCode::FORBIDDEN,
            AppError::Locked { .. } => StatusCode::LOCKED,
            AppError::NotFound { .. } => StatusCode::NOT_FOUND,
            AppError::Conflict { .. } => StatusCode::CONFLICT,
            AppError::TooManyRequests(..) => StatusCode::TOO_MANY_REQUESTS,
            AppError::BadGateway { .. } => StatusCode::BAD_GATEWAY,
            AppError::ServiceUnavailable { .. } => StatusCode::SERVICE_UNAVAILABLE,
            AppError::InternalError { .. }
            | AppError::DatabaseError(_)
            | AppError::RedisError(_)
            | AppError::ConfigError(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::internal("server_error", err)
    }
}

impl From<config::ConfigError> for AppError {
    fn from(err: config::ConfigError) -> Self {
        AppError::ConfigError(anyhow::Error::new(err))
    }
}

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        AppError::internal("server_error", err)
    }
}

#[derive(Debug, Serialize)]
pub struct ErrorEnvelope {
    pub error: String,
    pub error_description: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();
        let code = self.code();

        // Server-side failures never echo the underlying message.
        let (description, retry_after) = match &self {
            AppError::ValidationError(err) => (err.to_string(), None),
            AppError::BadRequest { description, .. }
            | AppError::Unauthorized { description, .. }
            | AppError::Forbidden { description, .. }
            | AppError::Locked { description, .. }
            | AppError::NotFound { description, .. }
            | AppError::BadGateway { description, .. }
            | AppError::ServiceUnavailable { description, .. } => (description.clone(), None),
            AppError::Conflict {
                description,
                retry_after,
                ..
            } => (description.clone(), *retry_after),
            AppError::TooManyRequests(msg, retry) => (msg.clone(), *retry),
            AppError::InternalError { .. }
            | AppError::DatabaseError(_)
            | AppError::RedisError(_)
            | AppError::ConfigError(_) => {
                tracing::error!(error = ?self, code, "request failed with internal error");
                ("Internal server error".to_string(), None)
            }
        };

        let mut res = (
            status,
            Json(ErrorEnvelope {
                error: code.to_string(),
                error_description: description,
                request_id: current_request_id(),
            }),
        )
            .into_response();

        let headers = res.headers_mut();
        headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-store"));
        headers.insert(header::PRAGMA, HeaderValue::from_static("no-cache"));
        if let Some(retry) = retry_after {
            headers.insert(header::RETRY_AFTER, retry.into());
        }

        res
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::middleware::tracing::REQUEST_ID;
    use http_body_util::BodyExt;

    async fn body_json(res: Response) -> serde_json::Value {
        let bytes = res.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn envelope_carries_code_and_request_id() {
        let res = REQUEST_ID
            .scope("req-1".to_string(), async {
                AppError::bad_request("invalid_scope", "scope not allowed").into_response()
            })
            .await;

        assert_eq!(res.status(), StatusCode::BAD_REQUEST);
        assert_eq!(res.headers()[header::CACHE_CONTROL], "no-store");
        let body = body_json(res).await;
        assert_eq!(body["error"], "invalid_scope");
        assert_eq!(body["error_description"], "scope not allowed");
        assert_eq!(body["request_id"], "req-1");
    }

    #[tokio::test]
    async fn internal_errors_hide_details() {
        let res = AppError::internal("persist_failed", anyhow::anyhow!("relation users missing"))
            .into_response();
        assert_eq!(res.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let body = body_json(res).await;
        assert_eq!(body["error"], "persist_failed");
        assert_eq!(body["error_description"], "Internal server error");
    }

    #[tokio::test]
    async fn rate_limit_sets_retry_after() {
        let res = AppError::TooManyRequests("slow down".into(), Some(7)).into_response();
        assert_eq!(res.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(res.headers()[header::RETRY_AFTER], "7");
        let body = body_json(res).await;
        assert_eq!(body["error"], "rate_limited");
    }
}
