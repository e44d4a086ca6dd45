use axum::{
    extract::{Path, State},
    Json,
};
use chrono::{Duration, Utc};
use service_core::error::AppError;

use crate::dtos::oauth::{RotateKeyRequest, RotateKeyResponse};
use crate::AppState;

/// Rotates the signing key of a tenant. The previous key keeps verifying for
/// the grace window.
#[tracing::instrument(skip(state, body))]
pub async fn rotate_tenant_key(
    State(state): State<AppState>,
    Path(tenant): Path<String>,
    body: Option<Json<RotateKeyRequest>>,
) -> Result<Json<RotateKeyResponse>, AppError> {
    let request = body.map(|Json(b)| b).unwrap_or_default();
    let grace_seconds = request
        .grace_seconds
        .unwrap_or(state.config.keys.rotation_grace_seconds);
    if grace_seconds < 0 {
        return Err(AppError::bad_request(
            "invalid_request",
            "grace_seconds must not be negative",
        ));
    }

    let tenant = state
        .tenants
        .resolve(&tenant)
        .map_err(|_| AppError::not_found("tenant_not_found", "Tenant not found"))?;
    let rotated = state
        .control
        .rotate_tenant_key(&tenant, Duration::seconds(grace_seconds), Utc::now())
        .await?;

    Ok(Json(RotateKeyResponse {
        kid: rotated.active.kid,
        retiring_kid: rotated.retiring.map(|k| k.kid),
        retire_until: rotated.retire_until,
    }))
}
