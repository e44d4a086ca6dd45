//! Signing key records as persisted in the catalog and carried by rotation
//! mutations.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Which key set signs for an issuer: the deployment-wide pair or a tenant's.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub enum KeyScope {
    Global,
    Tenant(Uuid),
}

impl std::fmt::Display for KeyScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            KeyScope::Global => write!(f, "global"),
            KeyScope::Tenant(id) => write!(f, "{}", id),
        }
    }
}

impl std::str::FromStr for KeyScope {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s == "global" {
            return Ok(KeyScope::Global);
        }
        Uuid::parse_str(s)
            .map(KeyScope::Tenant)
            .map_err(|_| format!("Invalid key scope: {}", s))
    }
}

impl From<KeyScope> for String {
    fn from(scope: KeyScope) -> Self {
        scope.to_string()
    }
}

impl TryFrom<String> for KeyScope {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

/// One Ed25519 keypair at rest. The private seed is a secret-box envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredKey {
    pub kid: String,
    /// base64url (no padding) of the 32-byte public key.
    pub public_key: String,
    pub private_key_enc: String,
    pub created_at: DateTime<Utc>,
}

/// The `(active, retiring)` pair for one scope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredKeySet {
    pub scope: KeyScope,
    pub active: StoredKey,
    #[serde(default)]
    pub retiring: Option<StoredKey>,
    /// End of the grace window for `retiring`.
    #[serde(default)]
    pub retire_until: Option<DateTime<Utc>>,
}
