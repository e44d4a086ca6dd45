//! Refresh token issuance and rotation over the tenant's [`RefreshRepo`].
//!
//! [`RefreshRepo`]: super::store::RefreshRepo

use chrono::{DateTime, Duration, Utc};
use uuid::Uuid;

use super::error::{ServiceError, ServiceResult};
use super::store::{StoreError, TenantStore};
use crate::models::{NewRefreshToken, RefreshToken, RotateOutcome};
use crate::utils::{generate_opaque_token, hash_token};

/// A freshly minted token. `raw` goes to the client and nowhere else.
#[derive(Debug, Clone)]
pub struct IssuedRefresh {
    pub raw: String,
    pub record: RefreshToken,
}

pub struct RefreshService {
    ttl: Duration,
}

impl RefreshService {
    pub fn new(ttl: Duration) -> Self {
        Self { ttl }
    }

    pub async fn create(
        &self,
        store: &dyn TenantStore,
        client_id: &str,
        user_id: Uuid,
        scope: &str,
        amr: &[String],
        now: DateTime<Utc>,
    ) -> ServiceResult<IssuedRefresh> {
        let raw = generate_opaque_token();
        let new = NewRefreshToken {
            client_id: client_id.to_string(),
            user_id,
            token_hash: hash_token(&raw),
            scope: scope.to_string(),
            amr: amr.to_vec(),
            ttl: self.ttl,
            family_id: None,
        };
        let record = store
            .create_refresh(new, now)
            .await
            .map_err(persist_failed)?;
        Ok(IssuedRefresh { raw, record })
    }

    /// Exchanges `raw` for a new token in the same family. Scope and AMR carry
    /// over unchanged. Presenting a token that was already rotated revokes the
    /// whole family.
    #[tracing::instrument(skip(self, store, raw))]
    pub async fn rotate(
        &self,
        store: &dyn TenantStore,
        raw: &str,
        client_id: &str,
        now: DateTime<Utc>,
    ) -> ServiceResult<(RefreshToken, IssuedRefresh)> {
        let old_hash = hash_token(raw);
        let old = store
            .get_refresh_by_hash(&old_hash)
            .await?
            .ok_or(ServiceError::InvalidGrant("refresh token is invalid"))?;
        if old.client_id_text != client_id {
            return Err(ServiceError::InvalidGrant("refresh token was issued to another client"));
        }

        let new_raw = generate_opaque_token();
        let new = NewRefreshToken {
            client_id: old.client_id_text.clone(),
            user_id: old.user_id,
            token_hash: hash_token(&new_raw),
            scope: old.scope.clone(),
            amr: old.amr.clone(),
            ttl: self.ttl,
            family_id: Some(old.family_id),
        };

        match store.rotate_refresh(&old_hash, new, now).await? {
            RotateOutcome::Rotated { previous, current } => Ok((
                previous,
                IssuedRefresh {
                    raw: new_raw,
                    record: current,
                },
            )),
            RotateOutcome::Reused { family_id, user_id } => {
                let revoked = store.revoke_refresh_family(family_id, now).await?;
                tracing::warn!(
                    %family_id,
                    %user_id,
                    revoked,
                    "revoked refresh token presented again, family revoked"
                );
                Err(ServiceError::InvalidGrant("refresh token is invalid"))
            }
            RotateOutcome::Expired => Err(ServiceError::InvalidGrant("refresh token expired")),
            RotateOutcome::NotFound => Err(ServiceError::InvalidGrant("refresh token is invalid")),
        }
    }

    pub async fn lookup(
        &self,
        store: &dyn TenantStore,
        raw: &str,
    ) -> ServiceResult<Option<RefreshToken>> {
        Ok(store.get_refresh_by_hash(&hash_token(raw)).await?)
    }

    pub async fn revoke_by_user_client(
        &self,
        store: &dyn TenantStore,
        user_id: Uuid,
        client_id: &str,
        now: DateTime<Utc>,
    ) -> ServiceResult<u64> {
        Ok(store
            .revoke_refresh_by_user_client(user_id, client_id, now)
            .await?)
    }
}

fn persist_failed(e: StoreError) -> ServiceError {
    ServiceError::PersistFailed(e.into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::store::MemoryTenantStore;

    fn amr() -> Vec<String> {
        vec!["pwd".to_string(), "mfa".to_string()]
    }

    #[tokio::test]
    async fn rotation_keeps_scope_and_amr() {
        let svc = RefreshService::new(Duration::days(30));
        let store = MemoryTenantStore::new();
        let user = Uuid::new_v4();
        let now = Utc::now();

        let first = svc
            .create(&store, "app-web", user, "openid email", &amr(), now)
            .await
            .unwrap();
        let later = now + Duration::hours(1);
        let (previous, second) = svc.rotate(&store, &first.raw, "app-web", later).await.unwrap();

        assert!(previous.revoked_at.is_some());
        assert_eq!(second.record.family_id, first.record.family_id);
        assert_eq!(second.record.scope, "openid email");
        assert_eq!(second.record.amr, amr());
        assert_ne!(second.raw, first.raw);
    }

    #[tokio::test]
    async fn reuse_revokes_the_family() {
        let svc = RefreshService::new(Duration::days(30));
        let store = MemoryTenantStore::new();
        let user = Uuid::new_v4();
        let now = Utc::now();

        let first = svc
            .create(&store, "app-web", user, "openid", &amr(), now)
            .await
            .unwrap();
        let (_, second) = svc.rotate(&store, &first.raw, "app-web", now).await.unwrap();

        assert!(matches!(
            svc.rotate(&store, &first.raw, "app-web", now).await,
            Err(ServiceError::InvalidGrant(_))
        ));
        let second_row = svc.lookup(&store, &second.raw).await.unwrap().unwrap();
        assert!(second_row.revoked_at.is_some());
        assert!(svc.rotate(&store, &second.raw, "app-web", now).await.is_err());
    }

    #[tokio::test]
    async fn client_binding_and_expiry() {
        let svc = RefreshService::new(Duration::hours(1));
        let store = MemoryTenantStore::new();
        let user = Uuid::new_v4();
        let now = Utc::now();

        let token = svc
            .create(&store, "app-web", user, "openid", &amr(), now)
            .await
            .unwrap();
        assert!(svc.rotate(&store, &token.raw, "other-app", now).await.is_err());
        assert!(matches!(
            svc.rotate(&store, &token.raw, "app-web", now + Duration::hours(2)).await,
            Err(ServiceError::InvalidGrant("refresh token expired"))
        ));
    }

    #[tokio::test]
    async fn revoke_by_user_client_spares_other_clients() {
        let svc = RefreshService::new(Duration::days(1));
        let store = MemoryTenantStore::new();
        let user = Uuid::new_v4();
        let now = Utc::now();

        let web = svc.create(&store, "app-web", user, "openid", &amr(), now).await.unwrap();
        let cli = svc.create(&store, "app-cli", user, "openid", &amr(), now).await.unwrap();
        assert_eq!(
            svc.revoke_by_user_client(&store, user, "app-web", now).await.unwrap(),
            1
        );
        assert!(svc.lookup(&store, &web.raw).await.unwrap().unwrap().revoked_at.is_some());
        assert!(svc.lookup(&store, &cli.raw).await.unwrap().unwrap().revoked_at.is_none());
        assert!(svc.rotate(&store, &web.raw, "app-web", now).await.is_err());
    }
}
