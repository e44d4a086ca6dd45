//! MFA models - TOTP enrollment, recovery codes and trusted devices.

use chrono::{DateTime, Utc};
use sqlx::FromRow;
use uuid::Uuid;

/// At most one per user.
#[derive(Debug, Clone, FromRow)]
pub struct MfaTotp {
    pub user_id: Uuid,
    /// Secret-box envelope (`v1:` + nonce + ciphertext) of the base32 secret.
    pub secret_encrypted: String,
    pub confirmed_at: Option<DateTime<Utc>>,
    /// Start of the most recently accepted 30-second step.
    pub last_used_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl MfaTotp {
    pub fn is_confirmed(&self) -> bool {
        self.confirmed_at.is_some()
    }
}

#[derive(Debug, Clone, FromRow)]
pub struct RecoveryCode {
    pub id: Uuid,
    pub user_id: Uuid,
    /// SHA-256 hex of the lowercased code.
    pub code_hash: String,
    pub used_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, FromRow)]
pub struct TrustedDevice {
    pub user_id: Uuid,
    /// SHA-256 hex of the cookie value.
    pub device_hash: String,
    pub expires_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}
