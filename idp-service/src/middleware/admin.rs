use axum::{
    extract::{Request, State},
    http::HeaderMap,
    middleware::Next,
    response::{IntoResponse, Response},
};
use secrecy::ExposeSecret;
use service_core::error::AppError;

use crate::utils::constant_time_eq;
use crate::AppState;

pub const ADMIN_API_KEY_HEADER: &str = "x-admin-api-key";

pub async fn admin_auth_middleware(
    State(state): State<AppState>,
    headers: HeaderMap,
    request: Request,
    next: Next,
) -> Response {
    let api_key = headers
        .get(ADMIN_API_KEY_HEADER)
        .and_then(|value| value.to_str().ok());

    match api_key {
        Some(key)
            if constant_time_eq(key, state.config.security.admin_api_key.expose_secret()) =>
        {
            next.run(request).await
        }
        _ => {
            tracing::warn!(path = %request.uri().path(), "Failed admin authentication attempt");
            AppError::unauthorized("unauthorized", "Invalid or missing admin API key")
                .into_response()
        }
    }
}
