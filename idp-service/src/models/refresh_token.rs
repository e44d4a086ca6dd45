//! Refresh token model - persistent, hashed, rotated per use.

use chrono::{DateTime, Duration, Utc};
use sqlx::FromRow;
use uuid::Uuid;

#[derive(Debug, Clone, FromRow)]
pub struct RefreshToken {
    pub id: Uuid,
    /// Shared by every token produced from one authorization by rotation.
    pub family_id: Uuid,
    pub client_id_text: String,
    pub user_id: Uuid,
    /// SHA-256 hex of the raw token.
    pub token_hash: String,
    pub scope: String,
    pub amr: Vec<String>,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub revoked_at: Option<DateTime<Utc>>,
}

impl RefreshToken {
    pub fn new(new: NewRefreshToken, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            family_id: new.family_id.unwrap_or_else(Uuid::new_v4),
            client_id_text: new.client_id,
            user_id: new.user_id,
            token_hash: new.token_hash,
            scope: new.scope,
            amr: new.amr,
            issued_at: now,
            expires_at: now + new.ttl,
            revoked_at: None,
        }
    }

    /// Active iff not revoked and not expired.
    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        self.revoked_at.is_none() && self.expires_at > now
    }
}

#[derive(Debug, Clone)]
pub struct NewRefreshToken {
    pub client_id: String,
    pub user_id: Uuid,
    pub token_hash: String,
    pub scope: String,
    pub amr: Vec<String>,
    pub ttl: Duration,
    /// `None` starts a new family.
    pub family_id: Option<Uuid>,
}

/// Result of an atomic rotate attempt.
#[derive(Debug, Clone)]
pub enum RotateOutcome {
    Rotated {
        previous: RefreshToken,
        current: RefreshToken,
    },
    /// The presented token was already revoked. Carries the family so the
    /// caller can revoke it.
    Reused { family_id: Uuid, user_id: Uuid },
    Expired,
    NotFound,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn activity_window() {
        let now = Utc::now();
        let mut token = RefreshToken::new(
            NewRefreshToken {
                client_id: "app".into(),
                user_id: Uuid::new_v4(),
                token_hash: "h".into(),
                scope: "openid".into(),
                amr: vec!["pwd".into()],
                ttl: Duration::hours(1),
                family_id: None,
            },
            now,
        );
        assert!(token.is_active(now));
        assert!(!token.is_active(now + Duration::hours(2)));
        token.revoked_at = Some(now);
        assert!(!token.is_active(now));
    }
}
