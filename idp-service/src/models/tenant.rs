//! Tenant model - the isolation boundary owning users, clients and keys.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

pub const MAX_SLUG_LEN: usize = 32;

/// How the `iss` claim is derived for a tenant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum IssuerMode {
    #[default]
    Global,
    Path,
    Domain,
}

impl IssuerMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            IssuerMode::Global => "global",
            IssuerMode::Path => "path",
            IssuerMode::Domain => "domain",
        }
    }
}

impl std::str::FromStr for IssuerMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "global" => Ok(IssuerMode::Global),
            "path" => Ok(IssuerMode::Path),
            "domain" => Ok(IssuerMode::Domain),
            _ => Err(format!("Invalid issuer mode: {}", s)),
        }
    }
}

/// Per-tenant Google credentials. The secret is a secret-box envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GoogleSettings {
    pub enabled: bool,
    pub client_id: String,
    pub client_secret_enc: String,
    #[serde(default)]
    pub allowed_domains: Vec<String>,
}

/// Per-tenant SMTP relay. The password is a secret-box envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SmtpSettings {
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password_enc: Option<String>,
    pub from: String,
    #[serde(default = "default_true")]
    pub starttls: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UserFieldType {
    Text,
    Int,
    Bool,
    Date,
}

/// A tenant-declared custom user attribute.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserFieldDef {
    pub name: String,
    #[serde(rename = "type")]
    pub field_type: UserFieldType,
    #[serde(default)]
    pub required: bool,
    #[serde(default)]
    pub unique: bool,
    #[serde(default)]
    pub indexed: bool,
}

impl UserFieldDef {
    /// Field names become index names, so they are kept to `[a-z0-9_]`.
    pub fn is_valid_name(&self) -> bool {
        !self.name.is_empty()
            && self.name.len() <= 48
            && self
                .name
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
    }

    pub fn accepts(&self, value: &serde_json::Value) -> bool {
        match (self.field_type, value) {
            (_, serde_json::Value::Null) => !self.required,
            (UserFieldType::Text, serde_json::Value::String(_)) => true,
            (UserFieldType::Int, serde_json::Value::Number(n)) => n.is_i64(),
            (UserFieldType::Bool, serde_json::Value::Bool(_)) => true,
            (UserFieldType::Date, serde_json::Value::String(s)) => {
                chrono::NaiveDate::parse_from_str(s, "%Y-%m-%d").is_ok()
            }
            _ => false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct TenantSettings {
    #[serde(default)]
    pub issuer_mode: IssuerMode,
    #[serde(default)]
    pub issuer_override: Option<String>,
    #[serde(default)]
    pub google: Option<GoogleSettings>,
    #[serde(default)]
    pub smtp: Option<SmtpSettings>,
    /// Hosts accepted as login `return_to` targets besides the UI base.
    #[serde(default)]
    pub allowed_return_hosts: Vec<String>,
    #[serde(default)]
    pub user_fields: Vec<UserFieldDef>,
}

impl TenantSettings {
    pub fn issuer_override(&self) -> Option<&str> {
        self.issuer_override
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
    }
}

fn default_true() -> bool {
    true
}

/// Tenant entity as held in the control-plane catalog.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tenant {
    pub id: Uuid,
    pub slug: String,
    pub display_name: String,
    #[serde(default)]
    pub settings: TenantSettings,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Tenant {
    pub fn new(slug: &str, display_name: &str, settings: TenantSettings) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            slug: normalize_slug(slug),
            display_name: display_name.to_string(),
            settings,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn to_ref(&self) -> TenantRef {
        TenantRef {
            id: self.id,
            slug: self.slug.clone(),
            settings: Arc::new(self.settings.clone()),
        }
    }
}

/// Canonical tenant handle carried through a request once resolved.
#[derive(Debug, Clone)]
pub struct TenantRef {
    pub id: Uuid,
    pub slug: String,
    pub settings: Arc<TenantSettings>,
}

pub fn normalize_slug(input: &str) -> String {
    input.trim().to_lowercase()
}

/// Lowercase `[a-z0-9-]{1,32}`.
pub fn is_valid_slug(slug: &str) -> bool {
    !slug.is_empty()
        && slug.len() <= MAX_SLUG_LEN
        && slug
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
}

/// OAuth scope registered in a tenant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Scope {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub system: bool,
}
