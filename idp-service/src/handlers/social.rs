use axum::{
    extract::{Path, Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use axum_extra::extract::cookie::CookieJar;
use chrono::Utc;
use service_core::error::AppError;

use super::{cookie_value, NO_STORE};
use crate::dtos::auth::{SocialCallbackQuery, SocialExchangeRequest, SocialStartQuery};
use crate::models::PROVIDER_GOOGLE;
use crate::utils::ValidatedJson;
use crate::AppState;

fn ensure_supported(provider: &str) -> Result<(), AppError> {
    if provider == PROVIDER_GOOGLE {
        Ok(())
    } else {
        Err(AppError::not_found(
            "unsupported_provider",
            format!("Unknown provider: {}", provider),
        ))
    }
}

fn redirect(location: String) -> Response {
    (
        StatusCode::FOUND,
        [
            (header::LOCATION, location),
            (header::CACHE_CONTROL, "no-store".to_string()),
        ],
    )
        .into_response()
}

/// Redirects the browser to the provider's consent screen.
pub async fn start(
    State(state): State<AppState>,
    Path(provider): Path<String>,
    Query(query): Query<SocialStartQuery>,
) -> Result<Response, AppError> {
    ensure_supported(&provider)?;
    let location = state
        .auth
        .social_start(query.tenant.as_deref(), &query.client_id, &query.redirect_uri)
        .await?;
    Ok(redirect(location))
}

/// Provider callback. Ends in a redirect to the client carrying a one-shot
/// `login_code`.
pub async fn callback(
    State(state): State<AppState>,
    Path(provider): Path<String>,
    jar: CookieJar,
    Query(query): Query<SocialCallbackQuery>,
) -> Result<Response, AppError> {
    ensure_supported(&provider)?;
    if let Some(error) = query.error.as_deref() {
        tracing::info!(%provider, error, "provider returned an error");
        return Err(AppError::bad_request(
            "access_denied",
            "The provider did not authorize the login",
        ));
    }
    let (Some(social_state), Some(code)) = (query.state.as_deref(), query.code.as_deref()) else {
        return Err(AppError::bad_request(
            "invalid_request",
            "state and code are required",
        ));
    };

    let trusted_device = cookie_value(&jar, &state.config.security.trusted_device_cookie_name);
    let location = state
        .auth
        .social_callback(social_state, code, trusted_device, Utc::now())
        .await?;
    Ok(redirect(location))
}

/// Redeems a `login_code` for the parked token response.
pub async fn exchange(
    State(state): State<AppState>,
    ValidatedJson(req): ValidatedJson<SocialExchangeRequest>,
) -> Result<impl IntoResponse, AppError> {
    let response = state
        .auth
        .social_exchange(&req.login_code, &req.client_id)
        .await?;
    Ok((NO_STORE, Json(response)))
}
