use axum::{
    extract::{Query, State},
    http::{header, HeaderMap, StatusCode, Uri},
    response::{IntoResponse, Response},
    Json,
};
use axum_extra::extract::cookie::{Cookie, CookieJar};
use chrono::Utc;
use service_core::error::AppError;
use validator::Validate;

use super::{cookie_value, is_https, session_cookie, NO_STORE};
use crate::dtos::auth::{
    EmailFlowRequest, LoginRequest, ProvidersQuery, ProvidersResponse, RegisterRequest,
    ResetPasswordRequest, SessionLoginRequest, VerifyEmailQuery, VerifyEmailResponse,
};
use crate::dtos::MessageResponse;
use crate::services::auth::LoginOutcome;
use crate::utils::JsonOrForm;
use crate::AppState;

/// Password login for first-party clients. Answers with tokens, or with an
/// MFA challenge when the user has a confirmed second factor.
pub async fn login(
    State(state): State<AppState>,
    jar: CookieJar,
    JsonOrForm(req): JsonOrForm<LoginRequest>,
) -> Result<Response, AppError> {
    let trusted_device = cookie_value(&jar, &state.config.security.trusted_device_cookie_name);
    let outcome = state
        .auth
        .login(&req.into(), trusted_device, Utc::now())
        .await?;

    Ok(match outcome {
        LoginOutcome::Tokens(tokens) => (NO_STORE, Json(tokens)).into_response(),
        LoginOutcome::MfaRequired(required) => (NO_STORE, Json(required)).into_response(),
    })
}

/// Sets the browser session cookie `/authorize` relies on.
pub async fn session_login(
    State(state): State<AppState>,
    uri: Uri,
    headers: HeaderMap,
    jar: CookieJar,
    JsonOrForm(req): JsonOrForm<SessionLoginRequest>,
) -> Result<Response, AppError> {
    let (login, return_to) = req.into_parts();
    let started = state
        .auth
        .session_login(&login, return_to.as_deref(), Utc::now())
        .await?;

    let jar = jar.add(session_cookie(
        &state,
        is_https(&headers, &uri),
        started.cookie_value,
        started.max_age_secs,
    ));
    Ok(match started.return_to {
        Some(target) => (
            StatusCode::SEE_OTHER,
            jar,
            [
                (header::LOCATION, target),
                (header::CACHE_CONTROL, "no-store".to_string()),
            ],
        )
            .into_response(),
        None => (StatusCode::NO_CONTENT, jar, NO_STORE).into_response(),
    })
}

pub async fn logout(State(state): State<AppState>, jar: CookieJar) -> Result<Response, AppError> {
    let name = state.config.security.session_cookie_name.clone();
    if let Some(value) = cookie_value(&jar, &name) {
        state.auth.logout(value).await?;
    }
    let jar = jar.remove(Cookie::build(name).path("/"));
    Ok((StatusCode::NO_CONTENT, jar).into_response())
}

pub async fn register(
    State(state): State<AppState>,
    JsonOrForm(req): JsonOrForm<RegisterRequest>,
) -> Result<impl IntoResponse, AppError> {
    let outcome = state.auth.register(req.into(), Utc::now()).await?;
    Ok((StatusCode::CREATED, NO_STORE, Json(outcome)))
}

/// Answers 202 whether or not the address is known.
pub async fn verify_email_start(
    State(state): State<AppState>,
    JsonOrForm(req): JsonOrForm<EmailFlowRequest>,
) -> Result<impl IntoResponse, AppError> {
    state
        .auth
        .verify_email_start(req.tenant.as_deref(), &req.client_id, &req.email, Utc::now())
        .await?;
    Ok((
        StatusCode::ACCEPTED,
        Json(MessageResponse::new(
            "If the address is registered and unverified, a verification email is on its way",
        )),
    ))
}

pub async fn verify_email(
    State(state): State<AppState>,
    Query(query): Query<VerifyEmailQuery>,
) -> Result<impl IntoResponse, AppError> {
    query.validate()?;
    let user_id = state
        .auth
        .verify_email(&query.tenant, &query.token, Utc::now())
        .await?;
    Ok((
        NO_STORE,
        Json(VerifyEmailResponse {
            verified: true,
            user_id: user_id.to_string(),
        }),
    ))
}

/// Sends the reset email inline; a delivery failure is a 503.
pub async fn forgot(
    State(state): State<AppState>,
    JsonOrForm(req): JsonOrForm<EmailFlowRequest>,
) -> Result<impl IntoResponse, AppError> {
    state
        .auth
        .forgot(req.tenant.as_deref(), &req.client_id, &req.email, Utc::now())
        .await?;
    Ok((
        StatusCode::ACCEPTED,
        Json(MessageResponse::new(
            "If the address is registered, a reset link has been sent",
        )),
    ))
}

pub async fn reset(
    State(state): State<AppState>,
    JsonOrForm(req): JsonOrForm<ResetPasswordRequest>,
) -> Result<impl IntoResponse, AppError> {
    state
        .auth
        .reset(&req.tenant, &req.token, &req.new_password, Utc::now())
        .await?;
    Ok((
        NO_STORE,
        Json(MessageResponse::new("Password has been reset")),
    ))
}

pub async fn providers(
    State(state): State<AppState>,
    Query(query): Query<ProvidersQuery>,
) -> Result<Json<ProvidersResponse>, AppError> {
    let providers = state
        .auth
        .providers(query.tenant.as_deref(), query.client_id.as_deref())
        .await?;
    Ok(Json(ProvidersResponse { providers }))
}
