//! User and identity models - tenant-scoped accounts and their credentials.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::types::Json;
use sqlx::FromRow;
use uuid::Uuid;

/// User entity (tenant-scoped datastore).
#[derive(Debug, Clone, FromRow)]
pub struct User {
    pub id: Uuid,
    /// Trimmed and case-folded.
    pub email: String,
    pub email_verified: bool,
    pub disabled_at: Option<DateTime<Utc>>,
    pub disabled_until: Option<DateTime<Utc>>,
    pub metadata: Json<serde_json::Value>,
    pub custom_fields: Json<serde_json::Map<String, serde_json::Value>>,
    pub source_client_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl User {
    pub fn new(email: String, source_client_id: Option<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            email,
            email_verified: false,
            disabled_at: None,
            disabled_until: None,
            metadata: Json(serde_json::json!({})),
            custom_fields: Json(serde_json::Map::new()),
            source_client_id,
            created_at: Utc::now(),
        }
    }

    /// Blocked while `disabled_until` is in the future, or indefinitely when
    /// `disabled_at` is set without an end.
    pub fn is_blocked(&self, now: DateTime<Utc>) -> bool {
        match self.disabled_until {
            Some(until) => until > now,
            None => self.disabled_at.is_some(),
        }
    }

    /// Strings under `metadata.<key>` when it is an array.
    pub fn metadata_list(&self, key: &str) -> Vec<String> {
        self.metadata
            .0
            .get(key)
            .and_then(|v| v.as_array())
            .map(|items| {
                items
                    .iter()
                    .filter_map(|v| v.as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default()
    }
}

/// Input for user creation.
#[derive(Debug, Clone)]
pub struct NewUser {
    pub email: String,
    pub email_verified: bool,
    pub source_client_id: Option<String>,
    pub custom_fields: serde_json::Map<String, serde_json::Value>,
}

/// Identity provider codes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IdentProvider {
    Password,
    Google,
}

impl IdentProvider {
    pub fn as_str(&self) -> &'static str {
        match self {
            IdentProvider::Password => "password",
            IdentProvider::Google => "google",
        }
    }
}

impl std::str::FromStr for IdentProvider {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "password" => Ok(IdentProvider::Password),
            "google" => Ok(IdentProvider::Google),
            _ => Err(format!("Invalid identity provider: {}", s)),
        }
    }
}

/// Binds a user to an authentication method. Never reassigned.
#[derive(Debug, Clone, FromRow)]
pub struct Identity {
    pub id: Uuid,
    pub user_id: Uuid,
    pub provider: String,
    /// Subject at the social provider; `None` for password identities.
    pub provider_user_id: Option<String>,
    /// PHC string; only for password identities.
    pub password_hash: Option<String>,
    pub email: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// The credential an identity carries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Credential<'a> {
    Password { phc_hash: &'a str },
    Social { provider: &'a str, provider_user_id: &'a str },
}

impl Identity {
    pub fn new_password(user_id: Uuid, phc_hash: String, email: &str) -> Self {
        Self {
            id: Uuid::new_v4(),
            user_id,
            provider: IdentProvider::Password.as_str().to_string(),
            provider_user_id: None,
            password_hash: Some(phc_hash),
            email: Some(email.to_string()),
            created_at: Utc::now(),
        }
    }

    pub fn new_social(user_id: Uuid, provider: &str, provider_user_id: &str, email: &str) -> Self {
        Self {
            id: Uuid::new_v4(),
            user_id,
            provider: provider.to_string(),
            provider_user_id: Some(provider_user_id.to_string()),
            password_hash: None,
            email: Some(email.to_string()),
            created_at: Utc::now(),
        }
    }

    pub fn credential(&self) -> Option<Credential<'_>> {
        match (&self.password_hash, &self.provider_user_id) {
            (Some(phc_hash), _) if self.provider == IdentProvider::Password.as_str() => {
                Some(Credential::Password { phc_hash })
            }
            (_, Some(provider_user_id)) => Some(Credential::Social {
                provider: &self.provider,
                provider_user_id,
            }),
            _ => None,
        }
    }
}
