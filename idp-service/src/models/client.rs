//! Client model - an OAuth client registered in one tenant.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const PROVIDER_PASSWORD: &str = "password";
pub const PROVIDER_GOOGLE: &str = "google";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ClientType {
    #[default]
    Public,
    Confidential,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Client {
    pub client_id: String,
    pub tenant_id: Uuid,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub client_type: ClientType,
    /// Argon2 PHC string; only for confidential clients.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret_hash: Option<String>,
    /// Ordered; the first entry is the default for error pages.
    pub redirect_uris: Vec<String>,
    #[serde(default)]
    pub scopes: Vec<String>,
    /// Allowed authentication factors. Empty allows all.
    #[serde(default)]
    pub providers: Vec<String>,
    #[serde(default)]
    pub require_email_verification: bool,
    #[serde(default)]
    pub require_consent: bool,
    #[serde(default)]
    pub reset_password_url: Option<String>,
    #[serde(default)]
    pub verify_email_url: Option<String>,
}

impl Client {
    pub fn is_confidential(&self) -> bool {
        self.client_type == ClientType::Confidential
    }
}
