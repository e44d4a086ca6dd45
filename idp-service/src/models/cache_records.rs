//! Payloads of short-lived cache entries. Stored as JSON.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Cookie session, cached under `sid:<sha256(cookie)>`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SessionPayload {
    pub user_id: Uuid,
    pub tenant_id: Uuid,
    pub tenant_slug: String,
    pub amr: Vec<String>,
    /// Unix seconds of the primary authentication.
    pub auth_time: i64,
    /// Unix seconds.
    pub expires: i64,
}

/// Authorization code, cached under `code:<sha256(code)>`. Single use.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AuthorizationCodeRecord {
    pub user_id: Uuid,
    pub tenant_id: Uuid,
    pub client_id: String,
    pub redirect_uri: String,
    pub scope: String,
    pub nonce: Option<String>,
    pub code_challenge: String,
    /// Always `S256`.
    pub code_challenge_method: String,
    pub amr: Vec<String>,
    pub auth_time: i64,
    pub expires_at: i64,
}

/// Pending second factor, cached under `mfa:token:<sha256(token)>`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MfaChallenge {
    pub user_id: Uuid,
    pub tenant_id: Uuid,
    pub client_id: String,
    pub amr_base: Vec<String>,
    pub requested_scope: Vec<String>,
    /// Cache key of the cookie session to elevate once MFA completes.
    #[serde(default)]
    pub session_key: Option<String>,
    pub auth_time: i64,
}

/// Authorization request parked while the user decides on consent.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConsentChallenge {
    pub user_id: Uuid,
    pub tenant_id: Uuid,
    pub client_id: String,
    pub redirect_uri: String,
    pub scope: Vec<String>,
    pub state: Option<String>,
    pub nonce: Option<String>,
    pub code_challenge: String,
    pub code_challenge_method: String,
    pub amr: Vec<String>,
    pub auth_time: i64,
}

/// Round-trip state for the Google redirect, under `social:state:<sha256>`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SocialState {
    pub tenant_id: Uuid,
    pub client_id: String,
    pub redirect_uri: String,
    pub nonce: String,
    pub code_verifier: String,
}

/// Login result parked for `/auth/social/exchange`, under `social:code:<sha256>`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SocialLoginCode {
    pub tenant_id: Uuid,
    pub client_id: String,
    pub response: serde_json::Value,
}
