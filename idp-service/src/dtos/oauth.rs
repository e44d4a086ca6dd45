use serde::{Deserialize, Serialize};
use validator::Validate;

#[derive(Debug, Deserialize, Validate)]
pub struct ConsentAcceptRequest {
    #[validate(length(min = 1, message = "consent_token is required"))]
    pub consent_token: String,

    pub approve: bool,
}

#[derive(Debug, Deserialize, Validate)]
pub struct ConsentRevokeRequest {
    #[validate(length(min = 1, message = "client_id is required"))]
    pub client_id: String,
}

#[derive(Debug, Serialize)]
pub struct ConsentRevokeResponse {
    pub revoked_refresh_tokens: u64,
}

#[derive(Debug, Deserialize)]
pub struct IntrospectRequest {
    pub token: String,
    pub token_type_hint: Option<String>,
    pub client_id: Option<String>,
    pub client_secret: Option<String>,
    pub tenant: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
pub struct RotateKeyRequest {
    /// Overrides the configured grace window.
    pub grace_seconds: Option<i64>,
}

#[derive(Debug, Serialize)]
pub struct RotateKeyResponse {
    pub kid: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retiring_kid: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retire_until: Option<chrono::DateTime<chrono::Utc>>,
}

/// OpenID Provider metadata.
#[derive(Debug, Serialize)]
pub struct DiscoveryDocument {
    pub issuer: String,
    pub authorization_endpoint: String,
    pub token_endpoint: String,
    pub userinfo_endpoint: String,
    pub jwks_uri: String,
    pub introspection_endpoint: String,
    pub response_types_supported: Vec<&'static str>,
    pub grant_types_supported: Vec<&'static str>,
    pub subject_types_supported: Vec<&'static str>,
    pub id_token_signing_alg_values_supported: Vec<&'static str>,
    pub token_endpoint_auth_methods_supported: Vec<&'static str>,
    pub code_challenge_methods_supported: Vec<&'static str>,
    pub scopes_supported: Vec<String>,
    pub claims_supported: Vec<&'static str>,
}
