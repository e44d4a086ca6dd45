use service_core::error::AppError;
use thiserror::Error;

use super::cache::CacheError;
use super::catalog::CatalogError;
use super::crypto::CryptoError;
use super::keys::KeyError;
use super::store::StoreError;

/// Seconds a client should wait after a schema-lock conflict.
const CONFLICT_RETRY_AFTER: u64 = 5;

#[derive(Error, Debug)]
pub enum ServiceError {
    #[error("Tenant not found")]
    TenantNotFound,

    #[error("Tenant identifier is ambiguous")]
    AmbiguousTenant,

    #[error("Client not found")]
    ClientNotFound,

    #[error("Invalid client credentials")]
    InvalidClientCredentials,

    #[error("Invalid redirect_uri")]
    InvalidRedirectUri,

    #[error("Invalid scope: {0}")]
    InvalidScope(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Unsupported grant type")]
    UnsupportedGrantType,

    #[error("Unsupported response type")]
    UnsupportedResponseType,

    #[error("Invalid credentials")]
    InvalidCredentials,

    #[error("User disabled")]
    UserDisabled,

    #[error("Email not verified")]
    EmailNotVerified,

    #[error("Provider not allowed for this client: {0}")]
    ProviderNotAllowed(String),

    #[error("Provider not configured: {0}")]
    ProviderNotConfigured(String),

    #[error("Invalid grant: {0}")]
    InvalidGrant(&'static str),

    #[error("Invalid token")]
    InvalidToken,

    #[error("Invalid or expired email token")]
    InvalidEmailToken,

    #[error("MFA token not found")]
    MfaTokenNotFound,

    #[error("Invalid MFA code")]
    InvalidMfaCode,

    #[error("MFA not enrolled")]
    MfaNotEnrolled,

    #[error("MFA already enrolled")]
    MfaAlreadyEnrolled,

    #[error("Email already registered")]
    EmailTaken,

    #[error("Weak password: {0}")]
    WeakPassword(String),

    #[error("Login required")]
    LoginRequired,

    #[error("Consent required")]
    ConsentRequired,

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Tenant is overloaded")]
    Overloaded,

    #[error("Email send failed: {0}")]
    EmailSendFailed(String),

    #[error("Upstream exchange failed: {0}")]
    ExchangeFailed(String),

    #[error("Token issuance failed: {0}")]
    IssueFailed(#[source] anyhow::Error),

    #[error("Persist failed: {0}")]
    PersistFailed(#[source] anyhow::Error),

    #[error("Crypto failure: {0}")]
    CryptoFailed(#[from] CryptoError),

    #[error("Key error: {0}")]
    Keys(#[from] KeyError),

    #[error("Catalog error: {0}")]
    Catalog(#[from] CatalogError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Cache error: {0}")]
    Cache(#[from] CacheError),

    #[error("Internal server error: {0}")]
    Internal(#[from] anyhow::Error),
}

pub type ServiceResult<T> = Result<T, ServiceError>;

impl From<ServiceError> for AppError {
    fn from(err: ServiceError) -> Self {
        match err {
            ServiceError::TenantNotFound
            | ServiceError::AmbiguousTenant
            | ServiceError::ClientNotFound => {
                AppError::unauthorized("invalid_client", "Unknown client")
            }
            ServiceError::InvalidClientCredentials => {
                AppError::unauthorized("invalid_client", "Client authentication failed")
            }
            ServiceError::InvalidRedirectUri => AppError::bad_request(
                "invalid_redirect_uri",
                "redirect_uri is not registered for this client",
            ),
            ServiceError::InvalidScope(s) => AppError::bad_request("invalid_scope", s),
            ServiceError::InvalidRequest(s) => AppError::bad_request("invalid_request", s),
            ServiceError::UnsupportedGrantType => {
                AppError::bad_request("unsupported_grant_type", "Unsupported grant_type")
            }
            ServiceError::UnsupportedResponseType => {
                AppError::bad_request("unsupported_response_type", "Only response_type=code")
            }
            ServiceError::InvalidCredentials => {
                AppError::unauthorized("invalid_credentials", "Invalid email or password")
            }
            ServiceError::UserDisabled => AppError::locked("user_disabled", "User is disabled"),
            ServiceError::EmailNotVerified => {
                AppError::forbidden("email_not_verified", "Email address is not verified")
            }
            ServiceError::ProviderNotAllowed(p) => AppError::forbidden(
                "provider_not_allowed",
                format!("Provider {} is not allowed for this client", p),
            ),
            ServiceError::ProviderNotConfigured(p) => AppError::bad_request(
                "provider_not_configured",
                format!("Provider {} is not configured", p),
            ),
            ServiceError::InvalidGrant(why) => AppError::bad_request("invalid_grant", why),
            ServiceError::InvalidToken => {
                AppError::unauthorized("invalid_token", "Token is invalid or expired")
            }
            ServiceError::InvalidEmailToken => {
                AppError::bad_request("invalid_token", "Token is invalid, expired or used")
            }
            ServiceError::MfaTokenNotFound => {
                AppError::not_found("mfa_token_not_found", "MFA token not found or expired")
            }
            ServiceError::InvalidMfaCode => {
                AppError::unauthorized("invalid_mfa_code", "Invalid MFA code")
            }
            ServiceError::MfaNotEnrolled => {
                AppError::bad_request("mfa_not_enrolled", "TOTP is not enrolled")
            }
            ServiceError::MfaAlreadyEnrolled => {
                AppError::conflict("mfa_already_enrolled", "TOTP is already enrolled")
            }
            ServiceError::EmailTaken => {
                AppError::conflict("email_taken", "Email is already registered")
            }
            ServiceError::WeakPassword(s) => AppError::bad_request("weak_password", s),
            ServiceError::LoginRequired => {
                AppError::unauthorized("login_required", "Authentication required")
            }
            ServiceError::ConsentRequired => {
                AppError::forbidden("consent_required", "User consent is required")
            }
            ServiceError::Conflict(s) | ServiceError::Store(StoreError::Conflict(s)) => {
                AppError::Conflict {
                    code: "conflict",
                    description: s,
                    retry_after: Some(CONFLICT_RETRY_AFTER),
                }
            }
            ServiceError::Overloaded => {
                AppError::TooManyRequests("Too many concurrent requests".to_string(), Some(1))
            }
            ServiceError::EmailSendFailed(_) => AppError::ServiceUnavailable {
                code: "email_send_failed",
                description: "Email could not be sent, try again later".to_string(),
            },
            ServiceError::ExchangeFailed(_) => AppError::BadGateway {
                code: "exchange_failed",
                description: "Identity provider exchange failed".to_string(),
            },
            ServiceError::IssueFailed(e) => AppError::internal("issue_failed", e),
            ServiceError::PersistFailed(e) => AppError::internal("persist_failed", e),
            ServiceError::CryptoFailed(e) => AppError::internal("crypto_failed", e),
            ServiceError::Keys(e) => AppError::internal("issue_failed", e),
            ServiceError::Catalog(CatalogError::UnknownTenant(_)) => {
                AppError::not_found("tenant_not_found", "Tenant not found")
            }
            ServiceError::Catalog(CatalogError::SlugTaken(slug)) => {
                AppError::conflict("slug_taken", format!("Slug {} is already in use", slug))
            }
            ServiceError::Catalog(e) => AppError::internal("persist_failed", e),
            ServiceError::Store(e) => AppError::DatabaseError(anyhow::Error::new(e)),
            ServiceError::Cache(e) => AppError::internal("server_error", e),
            ServiceError::Internal(e) => AppError::internal("server_error", e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::StatusCode;

    #[test]
    fn resolution_failures_are_invalid_client() {
        for err in [
            ServiceError::TenantNotFound,
            ServiceError::AmbiguousTenant,
            ServiceError::ClientNotFound,
        ] {
            let app: AppError = err.into();
            assert_eq!(app.code(), "invalid_client");
            assert_eq!(app.status(), StatusCode::UNAUTHORIZED);
        }
    }

    #[test]
    fn store_conflict_carries_retry_after() {
        let app: AppError = ServiceError::Store(StoreError::Conflict("busy".into())).into();
        assert_eq!(app.status(), StatusCode::CONFLICT);
        assert!(matches!(
            app,
            AppError::Conflict {
                retry_after: Some(_),
                ..
            }
        ));
    }

    #[test]
    fn store_failures_hide_details() {
        let app: AppError = ServiceError::Store(StoreError::NotFound("user")).into();
        assert_eq!(app.code(), "server_error");
        assert_eq!(app.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
