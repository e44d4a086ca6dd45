use axum::{
    extract::State,
    http::{HeaderMap, Uri},
    response::IntoResponse,
    Json,
};
use axum_extra::extract::cookie::CookieJar;
use chrono::Utc;
use service_core::error::AppError;

use super::{is_https, trusted_device_cookie, NO_STORE};
use crate::dtos::mfa::{
    ChallengeRequest, EnrollResponse, FactorInput, RecoveryCodesResponse, VerifyTotpRequest,
    VerifyTotpResponse,
};
use crate::dtos::MessageResponse;
use crate::middleware::AuthUser;
use crate::services::store::TenantStore;
use crate::services::ServiceError;
use crate::utils::ValidatedJson;
use crate::AppState;
use std::sync::Arc;

async fn store_for(state: &AppState, user: &AuthUser) -> Result<Arc<dyn TenantStore>, AppError> {
    Ok(state.stores.for_tenant(&user.tenant).await.map_err(ServiceError::from)?)
}

#[tracing::instrument(skip_all, fields(tenant = %user.tenant.slug, user_id = %user.user_id))]
pub async fn enroll(
    State(state): State<AppState>,
    user: AuthUser,
) -> Result<impl IntoResponse, AppError> {
    let store = store_for(&state, &user).await?;
    let account = store
        .get_user_by_id(user.user_id)
        .await
        .map_err(ServiceError::from)?
        .ok_or_else(|| AppError::unauthorized("invalid_token", "Invalid or expired token"))?;

    let enrollment = state
        .mfa
        .enroll(store.as_ref(), user.user_id, &account.email)
        .await?;
    Ok((
        NO_STORE,
        Json(EnrollResponse {
            secret_base32: enrollment.secret_base32,
            otpauth_url: enrollment.otpauth_url,
        }),
    ))
}

#[tracing::instrument(skip_all, fields(tenant = %user.tenant.slug, user_id = %user.user_id))]
pub async fn verify(
    State(state): State<AppState>,
    user: AuthUser,
    ValidatedJson(req): ValidatedJson<VerifyTotpRequest>,
) -> Result<impl IntoResponse, AppError> {
    let store = store_for(&state, &user).await?;
    let recovery_codes = state
        .mfa
        .confirm(store.as_ref(), user.user_id, &req.code, Utc::now())
        .await?;
    Ok((
        NO_STORE,
        Json(VerifyTotpResponse {
            enrolled: true,
            recovery_codes,
        }),
    ))
}

/// Second step of a login that answered `mfa_required`.
pub async fn challenge(
    State(state): State<AppState>,
    uri: Uri,
    headers: HeaderMap,
    jar: CookieJar,
    ValidatedJson(req): ValidatedJson<ChallengeRequest>,
) -> Result<impl IntoResponse, AppError> {
    let factor = req.factor.factor()?;
    let passed = state
        .auth
        .mfa_challenge(&req.mfa_token, &factor, req.remember_device, Utc::now())
        .await?;

    let now = Utc::now();
    let jar = match passed.trusted_device {
        Some((value, expires_at)) => jar.add(trusted_device_cookie(
            &state,
            is_https(&headers, &uri),
            value,
            (expires_at - now).num_seconds(),
        )),
        None => jar,
    };
    Ok((jar, NO_STORE, Json(passed.tokens)))
}

#[tracing::instrument(skip_all, fields(tenant = %user.tenant.slug, user_id = %user.user_id))]
pub async fn disable(
    State(state): State<AppState>,
    user: AuthUser,
    ValidatedJson(req): ValidatedJson<FactorInput>,
) -> Result<impl IntoResponse, AppError> {
    let factor = req.factor()?;
    let store = store_for(&state, &user).await?;
    state
        .mfa
        .disable(store.as_ref(), user.user_id, &factor, Utc::now())
        .await?;
    Ok(Json(MessageResponse::new("MFA disabled")))
}

#[tracing::instrument(skip_all, fields(tenant = %user.tenant.slug, user_id = %user.user_id))]
pub async fn rotate_recovery_codes(
    State(state): State<AppState>,
    user: AuthUser,
) -> Result<impl IntoResponse, AppError> {
    let store = store_for(&state, &user).await?;
    let recovery_codes = state
        .mfa
        .rotate_recovery_codes(store.as_ref(), user.user_id)
        .await?;
    Ok((NO_STORE, Json(RecoveryCodesResponse { recovery_codes })))
}
