use chrono::{DateTime, Utc};
use sqlx::FromRow;
use uuid::Uuid;

/// Scopes a user granted to a client. Upserts only ever widen the set.
#[derive(Debug, Clone, FromRow)]
pub struct Consent {
    pub user_id: Uuid,
    pub client_id: String,
    pub scopes_granted: Vec<String>,
    pub granted_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub revoked_at: Option<DateTime<Utc>>,
}

impl Consent {
    pub fn covers(&self, requested: &[String]) -> bool {
        self.revoked_at.is_none() && requested.iter().all(|s| self.scopes_granted.contains(s))
    }
}

/// Order-preserving union.
pub fn union_scopes(existing: &[String], added: &[String]) -> Vec<String> {
    let mut merged = existing.to_vec();
    for scope in added {
        if !merged.contains(scope) {
            merged.push(scope.clone());
        }
    }
    merged
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn union_never_narrows() {
        let existing = vec!["openid".to_string(), "email".to_string()];
        let merged = union_scopes(&existing, &["profile".to_string(), "openid".to_string()]);
        assert_eq!(merged, vec!["openid", "email", "profile"]);
    }
}
