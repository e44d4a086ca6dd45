//! Token responses: access token, refresh token and, for `openid`, an ID
//! token, for every grant that ends in issuance.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use super::error::{ServiceError, ServiceResult};
use super::issuer::{AccessGrant, Issuer};
use super::refresh::RefreshService;
use super::store::TenantStore;
use crate::models::{TenantRef, User};

pub const SCOPE_OPENID: &str = "openid";
pub const SCOPE_EMAIL: &str = "email";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenResponse {
    pub access_token: String,
    pub token_type: String,
    pub expires_in: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id_token: Option<String>,
    pub scope: String,
}

/// Everything a fresh issuance needs besides the user.
#[derive(Debug, Clone)]
pub struct Issuance<'a> {
    pub client_id: &'a str,
    pub scopes: &'a [String],
    pub amr: &'a [String],
    pub auth_time: i64,
    pub nonce: Option<&'a str>,
    /// Metric label.
    pub grant: &'static str,
}

pub struct TokenService {
    issuer: Arc<Issuer>,
    refresh: Arc<RefreshService>,
}

impl TokenService {
    pub fn new(issuer: Arc<Issuer>, refresh: Arc<RefreshService>) -> Self {
        Self { issuer, refresh }
    }

    pub fn issuer(&self) -> &Arc<Issuer> {
        &self.issuer
    }

    pub fn refresh_service(&self) -> &Arc<RefreshService> {
        &self.refresh
    }

    #[tracing::instrument(skip_all, fields(tenant = %tenant.slug, client_id = %req.client_id, grant = req.grant))]
    pub async fn issue(
        &self,
        store: &dyn TenantStore,
        tenant: &TenantRef,
        user: &User,
        req: Issuance<'_>,
        now: DateTime<Utc>,
    ) -> ServiceResult<TokenResponse> {
        let access = self
            .issuer
            .sign_access(tenant, &access_grant(user, req.client_id, req.scopes, req.amr), now)
            .await?;

        let scope = req.scopes.join(" ");
        let id_token = if req.scopes.iter().any(|s| s == SCOPE_OPENID) {
            let email = req
                .scopes
                .iter()
                .any(|s| s == SCOPE_EMAIL)
                .then(|| (user.email.as_str(), user.email_verified));
            Some(self.issuer.sign_id_token(
                tenant,
                user.id,
                req.client_id,
                req.nonce,
                req.auth_time,
                req.amr,
                email,
                now,
            )?)
        } else {
            None
        };

        let refresh = self
            .refresh
            .create(store, req.client_id, user.id, &scope, req.amr, now)
            .await?;

        metrics::counter!("hellojohn_tokens_issued_total", "grant" => req.grant).increment(1);
        tracing::info!(user_id = %user.id, kid = %access.kid, "tokens issued");

        Ok(TokenResponse {
            access_token: access.token,
            token_type: "Bearer".to_string(),
            expires_in: access.expires_in,
            refresh_token: Some(refresh.raw),
            id_token,
            scope,
        })
    }

    /// Signs a new access token with the scope and AMR the family was created
    /// with, then rotates `raw`.
    #[tracing::instrument(skip_all, fields(tenant = %tenant.slug, client_id))]
    pub async fn refresh(
        &self,
        store: &dyn TenantStore,
        tenant: &TenantRef,
        raw: &str,
        client_id: &str,
        now: DateTime<Utc>,
    ) -> ServiceResult<TokenResponse> {
        let record = self
            .refresh
            .lookup(store, raw)
            .await?
            .ok_or(ServiceError::InvalidGrant("refresh token is invalid"))?;
        let user = store
            .get_user_by_id(record.user_id)
            .await?
            .ok_or(ServiceError::InvalidGrant("refresh token is invalid"))?;
        if user.is_blocked(now) {
            return Err(ServiceError::InvalidGrant("user is disabled"));
        }

        // Sign before rotating: a signing failure must leave `raw` usable.
        let scopes: Vec<String> = record.scope.split_whitespace().map(str::to_string).collect();
        let access = self
            .issuer
            .sign_access(
                tenant,
                &access_grant(&user, client_id, &scopes, &record.amr),
                now,
            )
            .await?;
        let (_, issued) = self.refresh.rotate(store, raw, client_id, now).await?;

        metrics::counter!("hellojohn_tokens_issued_total", "grant" => "refresh_token").increment(1);

        Ok(TokenResponse {
            access_token: access.token,
            token_type: "Bearer".to_string(),
            expires_in: access.expires_in,
            refresh_token: Some(issued.raw),
            id_token: None,
            scope: issued.record.scope,
        })
    }
}

fn access_grant(user: &User, client_id: &str, scopes: &[String], amr: &[String]) -> AccessGrant {
    AccessGrant {
        user_id: user.id,
        client_id: client_id.to_string(),
        scopes: scopes.to_vec(),
        amr: amr.to_vec(),
        roles: user.metadata_list("roles"),
        perms: user.metadata_list("perms"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{IssuerMode, KeyScope, NewUser, Tenant, TenantSettings};
    use crate::services::catalog::Catalog;
    use crate::services::crypto::SecretBox;
    use crate::services::issuer::IdClaims;
    use crate::services::keys::KeyRegistry;
    use crate::services::mutation_log::{ControlPlane, DirectMutationLog, LocalApplier};
    use crate::services::store::{IdentityRepo, MemoryStores, MemoryTenantStore};
    use crate::services::tenant_resolver::TenantResolver;
    use crate::utils::HashParams;
    use jsonwebtoken::{decode, decode_header, Algorithm, Validation};

    struct Fixture {
        tokens: TokenService,
        tenants: Arc<TenantResolver>,
        keys: Arc<KeyRegistry>,
        tenant: TenantRef,
        store: MemoryTenantStore,
        user: User,
    }

    async fn fixture() -> Fixture {
        let catalog = Arc::new(Catalog::in_memory());
        let keys = Arc::new(KeyRegistry::new(Arc::new(SecretBox::new(&[9u8; 32]))));
        let tenants = Arc::new(TenantResolver::new(catalog.clone()));
        let stores = Arc::new(MemoryStores::new());
        let applier = Arc::new(LocalApplier::new(
            catalog.clone(),
            keys.clone(),
            tenants.clone(),
            stores.clone(),
        ));
        let control = ControlPlane::new(
            catalog,
            keys.clone(),
            Arc::new(DirectMutationLog::new(applier)),
            stores,
            HashParams {
                memory_kib: 1024,
                iterations: 1,
                parallelism: 1,
            },
        );
        let tenant = control
            .upsert_tenant(Tenant::new(
                "acme",
                "Acme",
                TenantSettings {
                    issuer_mode: IssuerMode::Path,
                    ..Default::default()
                },
            ))
            .await
            .unwrap();

        let issuer = Arc::new(Issuer::new("https://id.example", keys.clone(), 900, 900));
        let tokens = TokenService::new(
            issuer,
            Arc::new(RefreshService::new(chrono::Duration::days(30))),
        );

        let store = MemoryTenantStore::new();
        let user = store
            .create_password_user(
                NewUser {
                    email: "u@x".into(),
                    email_verified: true,
                    source_client_id: None,
                    custom_fields: Default::default(),
                },
                "$argon2id$stub",
            )
            .await
            .unwrap();

        Fixture {
            tokens,
            tenants,
            keys,
            tenant,
            store,
            user,
        }
    }

    fn issuance<'a>(scopes: &'a [String], amr: &'a [String]) -> Issuance<'a> {
        Issuance {
            client_id: "app-web",
            scopes,
            amr,
            auth_time: 1_700_000_000,
            nonce: Some("n-1"),
            grant: "authorization_code",
        }
    }

    #[tokio::test]
    async fn openid_scope_adds_id_token_with_email() {
        let f = fixture().await;
        let scopes = vec!["openid".to_string(), "email".to_string()];
        let amr = vec!["pwd".to_string()];
        let now = Utc::now();
        let resp = f
            .tokens
            .issue(&f.store, &f.tenant, &f.user, issuance(&scopes, &amr), now)
            .await
            .unwrap();
        assert_eq!(resp.token_type, "Bearer");
        assert_eq!(resp.scope, "openid email");
        assert!(resp.refresh_token.is_some());

        let (_, claims) = f
            .tokens
            .issuer()
            .validate_access(&resp.access_token, &f.tenants, now)
            .unwrap();
        assert_eq!(claims.iss, "https://id.example/t/acme");
        assert_eq!(claims.aud, "app-web");
        assert_eq!(claims.amr, amr);

        let id_token = resp.id_token.unwrap();
        let kid = decode_header(&id_token).unwrap().kid.unwrap();
        let (_, key) = f.keys.verification_key(&kid, now).unwrap();
        let mut validation = Validation::new(Algorithm::EdDSA);
        validation.set_audience(&["app-web"]);
        let id = decode::<IdClaims>(&id_token, key.decoding_key(), &validation)
            .unwrap()
            .claims;
        assert_eq!(id.nonce.as_deref(), Some("n-1"));
        assert_eq!(id.email.as_deref(), Some("u@x"));
        assert_eq!(id.email_verified, Some(true));
    }

    #[tokio::test]
    async fn no_id_token_without_openid() {
        let f = fixture().await;
        let scopes = vec!["email".to_string()];
        let amr = vec!["pwd".to_string()];
        let resp = f
            .tokens
            .issue(&f.store, &f.tenant, &f.user, issuance(&scopes, &amr), Utc::now())
            .await
            .unwrap();
        assert!(resp.id_token.is_none());
    }

    #[tokio::test]
    async fn refresh_keeps_scope_and_amr() {
        let f = fixture().await;
        let scopes = vec!["openid".to_string()];
        let amr = vec!["pwd".to_string(), "mfa".to_string()];
        let now = Utc::now();
        let first = f
            .tokens
            .issue(&f.store, &f.tenant, &f.user, issuance(&scopes, &amr), now)
            .await
            .unwrap();
        let r1 = first.refresh_token.unwrap();

        let later = now + chrono::Duration::hours(1);
        let second = f
            .tokens
            .refresh(&f.store, &f.tenant, &r1, "app-web", later)
            .await
            .unwrap();
        assert!(second.id_token.is_none());
        assert_eq!(second.scope, "openid");
        let (_, claims) = f
            .tokens
            .issuer()
            .validate_access(&second.access_token, &f.tenants, later)
            .unwrap();
        assert_eq!(claims.amr, amr);

        let replay = f
            .tokens
            .refresh(&f.store, &f.tenant, &r1, "app-web", later)
            .await;
        assert!(matches!(replay, Err(ServiceError::InvalidGrant(_))));
        let r2 = second.refresh_token.unwrap();
        let after_family_revoke = f
            .tokens
            .refresh(&f.store, &f.tenant, &r2, "app-web", later)
            .await;
        assert!(matches!(after_family_revoke, Err(ServiceError::InvalidGrant(_))));
    }

    #[tokio::test]
    async fn signing_failure_leaves_the_refresh_token_usable() {
        let f = fixture().await;
        let scopes = vec!["openid".to_string()];
        let amr = vec!["pwd".to_string()];
        let now = Utc::now();
        let first = f
            .tokens
            .issue(&f.store, &f.tenant, &f.user, issuance(&scopes, &amr), now)
            .await
            .unwrap();
        let r1 = first.refresh_token.unwrap();

        let scope = KeyScope::Tenant(f.tenant.id);
        f.keys.remove_scope(&scope);
        let failed = f
            .tokens
            .refresh(&f.store, &f.tenant, &r1, "app-web", now)
            .await;
        assert!(failed.is_err());
        let record = f
            .tokens
            .refresh_service()
            .lookup(&f.store, &r1)
            .await
            .unwrap()
            .unwrap();
        assert!(record.revoked_at.is_none());
    }
}
