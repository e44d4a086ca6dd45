//! Credential store: password hashing and verification, identity linking and
//! the disabled-user gate.

use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use std::sync::Arc;

use super::error::{ServiceError, ServiceResult};
use super::policy::PasswordPolicy;
use super::store::{StoreError, TenantStore};
use crate::models::{NewUser, User, UserFieldDef};
use crate::utils::{hash_password, verify_password, Password, PasswordHashString};

/// Trim, then case-fold. Applied before every insert and lookup.
pub fn normalize_email(email: &str) -> String {
    email.trim().to_lowercase()
}

/// Checks submitted custom fields against the tenant's declared schema.
pub fn validate_custom_fields(
    defs: &[UserFieldDef],
    submitted: Map<String, Value>,
) -> ServiceResult<Map<String, Value>> {
    if let Some(unknown) = submitted.keys().find(|k| !defs.iter().any(|d| &d.name == *k)) {
        return Err(ServiceError::InvalidRequest(format!(
            "Unknown user field {}",
            unknown
        )));
    }
    for def in defs {
        let value = submitted.get(&def.name).unwrap_or(&Value::Null);
        if !def.accepts(value) {
            return Err(ServiceError::InvalidRequest(format!(
                "Invalid value for user field {}",
                def.name
            )));
        }
    }
    Ok(submitted)
}

/// Outcome of linking a social identity.
#[derive(Debug, Clone)]
pub struct SocialLink {
    pub user: User,
    pub created: bool,
}

pub struct CredentialService {
    policy: Arc<PasswordPolicy>,
    /// Verified against when the account or its password identity is missing,
    /// with the same cost parameters as real hashes.
    dummy_hash: PasswordHashString,
}

impl CredentialService {
    pub fn new(policy: Arc<PasswordPolicy>) -> ServiceResult<Self> {
        let dummy_hash = hash_password(
            &Password::new("hellojohn-timing-equalizer".to_string()),
            policy.hash_params(),
        )?;
        Ok(Self { policy, dummy_hash })
    }

    pub fn policy(&self) -> &PasswordPolicy {
        &self.policy
    }

    pub fn check_policy(&self, password: &str) -> ServiceResult<()> {
        self.policy
            .validate(password)
            .map_err(|e| ServiceError::WeakPassword(e.to_string()))
    }

    async fn hash(&self, password: &str) -> ServiceResult<String> {
        let password = Password::new(password.to_string());
        let params = *self.policy.hash_params();
        let hash = tokio::task::spawn_blocking(move || hash_password(&password, &params))
            .await
            .map_err(|e| ServiceError::Internal(anyhow::anyhow!("hash task: {}", e)))??;
        Ok(hash.into_string())
    }

    async fn verify(&self, password: &str, hash: Option<String>) -> ServiceResult<bool> {
        let password = Password::new(password.to_string());
        let (hash, real) = match hash {
            Some(h) => (PasswordHashString::new(h), true),
            None => (self.dummy_hash.clone(), false),
        };
        let matched = tokio::task::spawn_blocking(move || verify_password(&password, &hash).is_ok())
            .await
            .map_err(|e| ServiceError::Internal(anyhow::anyhow!("verify task: {}", e)))?;
        Ok(real && matched)
    }

    /// Unknown user, missing password identity and wrong password all cost one
    /// Argon2 evaluation and fail with the same error. The disabled check runs
    /// only after the password matched.
    #[tracing::instrument(skip(self, store, password))]
    pub async fn authenticate(
        &self,
        store: &dyn TenantStore,
        email: &str,
        password: &str,
        now: DateTime<Utc>,
    ) -> ServiceResult<User> {
        let email = normalize_email(email);
        let found = store.get_user_by_email(&email).await?;

        let (user, hash) = match found {
            Some((user, identity)) => {
                let hash = identity.and_then(|i| i.password_hash);
                (Some(user), hash)
            }
            None => (None, None),
        };

        let matched = self.verify(password, hash).await?;
        let user = match (matched, user) {
            (true, Some(user)) => user,
            _ => return Err(ServiceError::InvalidCredentials),
        };

        ensure_active(&user, now)?;
        Ok(user)
    }

    #[tracing::instrument(skip(self, store, password, custom_fields, field_defs))]
    pub async fn register(
        &self,
        store: &dyn TenantStore,
        email: &str,
        password: &str,
        source_client_id: Option<String>,
        custom_fields: Map<String, Value>,
        field_defs: &[UserFieldDef],
    ) -> ServiceResult<User> {
        self.check_policy(password)?;
        let custom_fields = validate_custom_fields(field_defs, custom_fields)?;
        let hash = self.hash(password).await?;

        let new_user = NewUser {
            email: normalize_email(email),
            email_verified: false,
            source_client_id,
            custom_fields,
        };
        match store.create_password_user(new_user, &hash).await {
            Ok(user) => Ok(user),
            Err(StoreError::Duplicate(_)) => Err(ServiceError::EmailTaken),
            Err(e) => Err(e.into()),
        }
    }

    /// Sets a new password and revokes every refresh token of the user.
    #[tracing::instrument(skip(self, store, new_password))]
    pub async fn reset_password(
        &self,
        store: &dyn TenantStore,
        user: &User,
        new_password: &str,
        now: DateTime<Utc>,
    ) -> ServiceResult<u64> {
        self.check_policy(new_password)?;
        let hash = self.hash(new_password).await?;
        store.update_password_hash(user.id, &hash).await?;
        let revoked = store.revoke_all_refresh_by_user(user.id, now).await?;
        tracing::info!(user_id = %user.id, revoked, "password reset, refresh tokens revoked");
        Ok(revoked)
    }

    /// Finds the user bound to a social subject, else links the subject to the
    /// account with the same email when the provider vouches for it, else
    /// creates a new account.
    #[tracing::instrument(skip(self, store, email))]
    pub async fn link_or_create_social(
        &self,
        store: &dyn TenantStore,
        provider: &str,
        provider_user_id: &str,
        email: &str,
        email_verified: bool,
        source_client_id: Option<String>,
        now: DateTime<Utc>,
    ) -> ServiceResult<SocialLink> {
        if let Some(identity) = store.find_identity(provider, provider_user_id).await? {
            let user = store
                .get_user_by_id(identity.user_id)
                .await?
                .ok_or(ServiceError::InvalidCredentials)?;
            ensure_active(&user, now)?;
            return Ok(SocialLink {
                user,
                created: false,
            });
        }

        let email = normalize_email(email);
        if let Some((user, _)) = store.get_user_by_email(&email).await? {
            // An unverified address could belong to someone else.
            if !email_verified {
                return Err(ServiceError::EmailNotVerified);
            }
            ensure_active(&user, now)?;
            store
                .link_identity(user.id, provider, provider_user_id, &email)
                .await?;
            if !user.email_verified {
                store.set_email_verified(user.id).await?;
            }
            return Ok(SocialLink {
                user,
                created: false,
            });
        }

        let new_user = NewUser {
            email,
            email_verified,
            source_client_id,
            custom_fields: Map::new(),
        };
        let user = match store
            .create_social_user(new_user, provider, provider_user_id)
            .await
        {
            Ok(user) => user,
            Err(StoreError::Duplicate(_)) => return Err(ServiceError::EmailTaken),
            Err(e) => return Err(e.into()),
        };
        Ok(SocialLink {
            user,
            created: true,
        })
    }
}

pub fn ensure_active(user: &User, now: DateTime<Utc>) -> ServiceResult<()> {
    if user.is_blocked(now) {
        return Err(ServiceError::UserDisabled);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PasswordPolicyConfig;
    use crate::models::UserFieldType;
    use crate::services::store::{MemoryTenantStore, UserRepo};
    use crate::utils::HashParams;
    use chrono::Duration;

    fn service() -> CredentialService {
        let policy = PasswordPolicy::from_config(&PasswordPolicyConfig {
            min_length: 8,
            require_upper: true,
            require_lower: true,
            require_digit: true,
            require_symbol: false,
            blacklist_path: None,
            argon2_memory_kib: 1024,
            argon2_iterations: 1,
            argon2_parallelism: 1,
        })
        .unwrap()
        .with_hash_params(HashParams {
            memory_kib: 1024,
            iterations: 1,
            parallelism: 1,
        });
        CredentialService::new(Arc::new(policy)).unwrap()
    }

    #[tokio::test]
    async fn register_then_authenticate() {
        let creds = service();
        let store = MemoryTenantStore::new();
        let user = creds
            .register(&store, " U@X ", "P@ssw0rd!", None, Map::new(), &[])
            .await
            .unwrap();
        assert_eq!(user.email, "u@x");

        let now = Utc::now();
        let found = creds.authenticate(&store, "u@x", "P@ssw0rd!", now).await.unwrap();
        assert_eq!(found.id, user.id);
    }

    #[tokio::test]
    async fn unknown_user_and_bad_password_look_the_same() {
        let creds = service();
        let store = MemoryTenantStore::new();
        creds
            .register(&store, "u@x", "P@ssw0rd!", None, Map::new(), &[])
            .await
            .unwrap();
        let now = Utc::now();

        let bad_password = creds.authenticate(&store, "u@x", "wrong", now).await;
        let no_user = creds.authenticate(&store, "ghost@x", "P@ssw0rd!", now).await;
        assert!(matches!(bad_password, Err(ServiceError::InvalidCredentials)));
        assert!(matches!(no_user, Err(ServiceError::InvalidCredentials)));
    }

    #[tokio::test]
    async fn disabled_user_is_gated_after_password() {
        let creds = service();
        let store = MemoryTenantStore::new();
        let user = creds
            .register(&store, "u@x", "P@ssw0rd!", None, Map::new(), &[])
            .await
            .unwrap();
        let now = Utc::now();
        store
            .set_disabled(user.id, Some(now), Some(now + Duration::hours(1)))
            .await
            .unwrap();

        assert!(matches!(
            creds.authenticate(&store, "u@x", "P@ssw0rd!", now).await,
            Err(ServiceError::UserDisabled)
        ));
        assert!(matches!(
            creds.authenticate(&store, "u@x", "nope", now).await,
            Err(ServiceError::InvalidCredentials)
        ));
    }

    #[tokio::test]
    async fn duplicate_and_weak_registrations() {
        let creds = service();
        let store = MemoryTenantStore::new();
        creds
            .register(&store, "u@x", "P@ssw0rd!", None, Map::new(), &[])
            .await
            .unwrap();
        assert!(matches!(
            creds.register(&store, "U@x", "P@ssw0rd!", None, Map::new(), &[]).await,
            Err(ServiceError::EmailTaken)
        ));
        assert!(matches!(
            creds.register(&store, "v@x", "short", None, Map::new(), &[]).await,
            Err(ServiceError::WeakPassword(_))
        ));
    }

    #[test]
    fn custom_fields_follow_schema() {
        let defs = vec![UserFieldDef {
            name: "age".into(),
            field_type: UserFieldType::Int,
            required: true,
            unique: false,
            indexed: false,
        }];
        let mut ok = Map::new();
        ok.insert("age".into(), serde_json::json!(41));
        assert!(validate_custom_fields(&defs, ok).is_ok());

        assert!(validate_custom_fields(&defs, Map::new()).is_err());

        let mut unknown = Map::new();
        unknown.insert("age".into(), serde_json::json!(41));
        unknown.insert("shoe".into(), serde_json::json!(44));
        assert!(validate_custom_fields(&defs, unknown).is_err());
    }

    #[tokio::test]
    async fn social_links_only_verified_emails() {
        let creds = service();
        let store = MemoryTenantStore::new();
        let existing = creds
            .register(&store, "u@x", "P@ssw0rd!", None, Map::new(), &[])
            .await
            .unwrap();
        let now = Utc::now();

        assert!(matches!(
            creds
                .link_or_create_social(&store, "google", "g-1", "u@x", false, None, now)
                .await,
            Err(ServiceError::EmailNotVerified)
        ));

        let linked = creds
            .link_or_create_social(&store, "google", "g-1", "u@x", true, None, now)
            .await
            .unwrap();
        assert_eq!(linked.user.id, existing.id);
        assert!(!linked.created);

        let again = creds
            .link_or_create_social(&store, "google", "g-1", "other@x", true, None, now)
            .await
            .unwrap();
        assert_eq!(again.user.id, existing.id);

        let fresh = creds
            .link_or_create_social(&store, "google", "g-2", "new@x", true, None, now)
            .await
            .unwrap();
        assert!(fresh.created);
        assert!(fresh.user.email_verified);
    }
}
