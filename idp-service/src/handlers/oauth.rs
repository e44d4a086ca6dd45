use axum::{
    extract::{rejection::FormRejection, OriginalUri, Query, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Form, Json,
};
use axum_extra::extract::cookie::CookieJar;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use chrono::Utc;
use service_core::error::AppError;

use super::{cookie_value, NO_STORE};
use crate::dtos::oauth::{
    ConsentAcceptRequest, ConsentRevokeRequest, ConsentRevokeResponse, IntrospectRequest,
};
use crate::middleware::{bearer_token, AuthUser};
use crate::services::oauth::{
    AuthorizeOutcome, AuthorizeRequest, BasicCredentials, Presented, TokenRequest,
};
use crate::utils::{JsonOrForm, ValidatedJson};
use crate::AppState;

fn found(location: &str) -> Response {
    (
        StatusCode::FOUND,
        [
            (header::LOCATION, location.to_string()),
            (header::CACHE_CONTROL, "no-store".to_string()),
        ],
    )
        .into_response()
}

/// Client credentials from `Authorization: Basic`. Both halves are
/// form-urlencoded before base64 per RFC 6749 section 2.3.1.
pub fn basic_credentials(headers: &HeaderMap) -> Result<Option<BasicCredentials>, AppError> {
    let Some(value) = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Basic "))
    else {
        return Ok(None);
    };
    let invalid = || AppError::unauthorized("invalid_client", "Malformed Basic credentials");
    let decoded = STANDARD.decode(value.trim()).map_err(|_| invalid())?;
    let decoded = String::from_utf8(decoded).map_err(|_| invalid())?;
    let (id, secret) = decoded.split_once(':').ok_or_else(invalid)?;
    let client_id = urlencoding::decode(id).map_err(|_| invalid())?.into_owned();
    let client_secret = urlencoding::decode(secret).map_err(|_| invalid())?.into_owned();
    Ok(Some(BasicCredentials {
        client_id,
        client_secret,
    }))
}

fn form_error(rejection: FormRejection) -> AppError {
    AppError::bad_request("invalid_request", rejection.body_text())
}

pub async fn authorize(
    State(state): State<AppState>,
    OriginalUri(uri): OriginalUri,
    jar: CookieJar,
    headers: HeaderMap,
    Query(req): Query<AuthorizeRequest>,
) -> Result<Response, AppError> {
    let original_url = format!("{}{}", state.config.issuer.base_url, uri);
    let presented = Presented {
        session_cookie: cookie_value(&jar, &state.config.security.session_cookie_name),
        bearer: bearer_token(&headers),
        trusted_device: cookie_value(&jar, &state.config.security.trusted_device_cookie_name),
    };

    let outcome = state
        .oauth
        .authorize(&req, presented, &original_url, Utc::now())
        .await?;

    Ok(match outcome {
        AuthorizeOutcome::Redirect(location) => found(&location),
        AuthorizeOutcome::MfaRequired { mfa_token, amr } => (
            NO_STORE,
            Json(serde_json::json!({
                "mfa_required": true,
                "mfa_token": mfa_token,
                "amr": amr,
            })),
        )
            .into_response(),
    })
}

pub async fn token(
    State(state): State<AppState>,
    headers: HeaderMap,
    form: Result<Form<TokenRequest>, FormRejection>,
) -> Result<impl IntoResponse, AppError> {
    let Form(req) = form.map_err(form_error)?;
    let basic = basic_credentials(&headers)?;

    let response = state.oauth.token(&req, basic.as_ref(), Utc::now()).await?;
    Ok((NO_STORE, Json(response)))
}

/// RFC 7662. The caller authenticates as a client of the tenant whose tokens
/// it asks about.
pub async fn introspect(
    State(state): State<AppState>,
    headers: HeaderMap,
    form: Result<Form<IntrospectRequest>, FormRejection>,
) -> Result<impl IntoResponse, AppError> {
    let Form(req) = form.map_err(form_error)?;
    let basic = basic_credentials(&headers)?;

    let (tenant, _client) = state
        .oauth
        .authenticate_client(
            req.tenant.as_deref(),
            req.client_id.as_deref(),
            req.client_secret.as_deref(),
            basic.as_ref(),
        )
        .await?;
    let response = state
        .oauth
        .introspect(&req.token, req.token_type_hint.as_deref(), &tenant, Utc::now())
        .await?;
    Ok((NO_STORE, Json(response)))
}

pub async fn userinfo(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, AppError> {
    let token = bearer_token(&headers).ok_or_else(|| {
        AppError::unauthorized("invalid_token", "Missing or invalid Authorization header")
    })?;
    let claims = state.oauth.userinfo(token, Utc::now()).await?;
    Ok((NO_STORE, Json(claims)))
}

pub async fn consent_accept(
    State(state): State<AppState>,
    JsonOrForm(req): JsonOrForm<ConsentAcceptRequest>,
) -> Result<Response, AppError> {
    let location = state
        .oauth
        .consent_accept(&req.consent_token, req.approve, Utc::now())
        .await?;
    Ok(found(&location))
}

/// Lets a signed-in user withdraw a client's consent.
pub async fn consent_revoke(
    State(state): State<AppState>,
    user: AuthUser,
    ValidatedJson(req): ValidatedJson<ConsentRevokeRequest>,
) -> Result<impl IntoResponse, AppError> {
    let revoked_refresh_tokens = state
        .oauth
        .revoke_consent(&user.tenant, user.user_id, &req.client_id, Utc::now())
        .await?;
    Ok(Json(ConsentRevokeResponse {
        revoked_refresh_tokens,
    }))
}
