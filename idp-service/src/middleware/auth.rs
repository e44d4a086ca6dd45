use axum::{
    extract::FromRequestParts,
    http::{header, request::Parts, HeaderMap},
};
use chrono::Utc;
use service_core::error::AppError;
use uuid::Uuid;

use crate::models::TenantRef;
use crate::services::AccessClaims;
use crate::AppState;

/// Raw token of an `Authorization: Bearer` header.
pub fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| {
            value
                .strip_prefix("Bearer ")
                .or_else(|| value.strip_prefix("bearer "))
        })
        .map(str::trim)
        .filter(|token| !token.is_empty())
}

/// Caller authenticated by a valid access token, bound to the tenant that
/// issued it.
#[derive(Debug, Clone)]
pub struct AuthUser {
    pub tenant: TenantRef,
    pub user_id: Uuid,
    pub claims: AccessClaims,
}

#[axum::async_trait]
impl FromRequestParts<AppState> for AuthUser {
    type Rejection = AppError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let token = bearer_token(&parts.headers).ok_or_else(|| {
            AppError::unauthorized("invalid_token", "Missing or invalid Authorization header")
        })?;

        let (tenant, claims) = state
            .issuer
            .validate_access(token, &state.tenants, Utc::now())
            .map_err(|e| {
                tracing::debug!(error = %e, "bearer token rejected");
                AppError::unauthorized("invalid_token", "Invalid or expired token")
            })?;
        let user_id = claims
            .user_id()
            .map_err(|_| AppError::unauthorized("invalid_token", "Invalid or expired token"))?;

        Ok(AuthUser {
            tenant,
            user_id,
            claims,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn bearer_token_requires_scheme() {
        let mut headers = HeaderMap::new();
        assert!(bearer_token(&headers).is_none());

        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Basic abc"));
        assert!(bearer_token(&headers).is_none());

        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Bearer abc.def"));
        assert_eq!(bearer_token(&headers), Some("abc.def"));

        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Bearer   "));
        assert!(bearer_token(&headers).is_none());
    }
}
