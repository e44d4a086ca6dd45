use std::any::Any;

use axum::response::{IntoResponse, Response};

use crate::error::AppError;

/// Panic handler for `tower_http::catch_panic::CatchPanicLayer::custom`.
/// Logs the payload with the current request id and renders a `server_error`
/// envelope instead of tearing down the connection.
pub fn handle_panic(err: Box<dyn Any + Send + 'static>) -> Response {
    let detail = if let Some(s) = err.downcast_ref::<String>() {
        s.clone()
    } else if let Some(s) = err.downcast_ref::<&str>() {
        s.to_string()
    } else {
        "unknown panic payload".to_string()
    };

    tracing::error!(
        request_id = super::tracing::current_request_id().unwrap_or_default(),
        panic = %detail,
        "handler panicked"
    );

    AppError::internal("server_error", anyhow::anyhow!("handler panicked")).into_response()
}
