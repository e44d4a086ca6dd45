//! Issuer: effective `iss` per tenant, access/ID token signing and access
//! token validation.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use jsonwebtoken::{decode, decode_header, encode, Algorithm, Header, Validation};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::Arc;
use uuid::Uuid;

use super::error::{ServiceError, ServiceResult};
use super::keys::KeyRegistry;
use super::tenant_resolver::TenantResolver;
use crate::models::amr::acr_for;
use crate::models::{IssuerMode, KeyScope, TenantRef};

/// Allowed clock skew when checking `exp` and `nbf`.
pub const CLOCK_SKEW_SECS: u64 = 30;

/// Claim names a hook may never set.
const RESERVED_CLAIMS: [&str; 13] = [
    "iss", "sub", "aud", "iat", "nbf", "exp", "jti", "tid", "amr", "acr", "scp", "custom",
    "auth_time",
];

/// Effective issuer URL. A non-empty override always wins.
pub fn resolve_iss(base: &str, mode: IssuerMode, slug: &str, override_url: Option<&str>) -> String {
    if let Some(url) = override_url.map(str::trim).filter(|s| !s.is_empty()) {
        return url.trim_end_matches('/').to_string();
    }
    let base = base.trim_end_matches('/');
    match mode {
        IssuerMode::Global => base.to_string(),
        IssuerMode::Path => format!("{}/t/{}", base, slug),
        // Domain mode without an override has nothing better than the path.
        IssuerMode::Domain => format!("{}/t/{}", base, slug),
    }
}

/// Which key set signs for `tenant`.
pub fn key_scope_for(tenant: &TenantRef) -> KeyScope {
    match tenant.settings.issuer_mode {
        IssuerMode::Global => KeyScope::Global,
        IssuerMode::Path | IssuerMode::Domain => KeyScope::Tenant(tenant.id),
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SystemClaims {
    #[serde(default)]
    pub roles: Vec<String>,
    #[serde(default)]
    pub perms: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccessClaims {
    pub iss: String,
    pub sub: String,
    pub aud: String,
    pub iat: i64,
    pub nbf: i64,
    pub exp: i64,
    pub tid: String,
    pub amr: Vec<String>,
    pub acr: String,
    pub scp: String,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub custom: Map<String, Value>,
}

impl AccessClaims {
    pub fn scopes(&self) -> impl Iterator<Item = &str> {
        self.scp.split_whitespace()
    }

    pub fn has_scope(&self, scope: &str) -> bool {
        self.scopes().any(|s| s == scope)
    }

    pub fn user_id(&self) -> ServiceResult<Uuid> {
        Uuid::parse_str(&self.sub).map_err(|_| ServiceError::InvalidToken)
    }

    /// The `{roles, perms}` block under the issuer's namespace.
    pub fn system(&self) -> Option<SystemClaims> {
        self.custom
            .get(&self.iss)
            .and_then(|v| serde_json::from_value(v.clone()).ok())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdClaims {
    pub iss: String,
    pub sub: String,
    pub aud: String,
    pub iat: i64,
    pub exp: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nonce: Option<String>,
    pub auth_time: i64,
    pub amr: Vec<String>,
    pub acr: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email_verified: Option<bool>,
}

/// What the hook sees about the token being minted.
#[derive(Debug, Clone)]
pub struct HookContext {
    pub tenant_id: Uuid,
    pub tenant_slug: String,
    pub client_id: String,
    pub user_id: Uuid,
    pub scopes: Vec<String>,
    pub amr: Vec<String>,
}

/// Extra claims injected into `custom`. Receives a copy of the claims built
/// so far; whatever it returns is filtered before merging.
#[async_trait]
pub trait ClaimsHook: Send + Sync {
    async fn extra_claims(&self, ctx: &HookContext, draft: Map<String, Value>)
        -> Map<String, Value>;
}

/// Drops registered claim names and the issuer's system namespace.
pub fn filter_hook_claims(issuer: &str, claims: Map<String, Value>) -> Map<String, Value> {
    claims
        .into_iter()
        .filter(|(k, _)| k != issuer && !RESERVED_CLAIMS.contains(&k.as_str()))
        .collect()
}

/// Inputs of one access token.
#[derive(Debug, Clone)]
pub struct AccessGrant {
    pub user_id: Uuid,
    pub client_id: String,
    pub scopes: Vec<String>,
    pub amr: Vec<String>,
    pub roles: Vec<String>,
    pub perms: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct SignedToken {
    pub token: String,
    pub kid: String,
    pub expires_in: i64,
}

pub struct Issuer {
    base_url: String,
    keys: Arc<KeyRegistry>,
    hook: Option<Arc<dyn ClaimsHook>>,
    access_ttl_secs: i64,
    id_ttl_secs: i64,
}

impl Issuer {
    pub fn new(
        base_url: &str,
        keys: Arc<KeyRegistry>,
        access_ttl_secs: i64,
        id_ttl_secs: i64,
    ) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            keys,
            hook: None,
            access_ttl_secs,
            id_ttl_secs,
        }
    }

    pub fn with_hook(mut self, hook: Arc<dyn ClaimsHook>) -> Self {
        self.hook = Some(hook);
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn issuer_for(&self, tenant: &TenantRef) -> String {
        resolve_iss(
            &self.base_url,
            tenant.settings.issuer_mode,
            &tenant.slug,
            tenant.settings.issuer_override(),
        )
    }

    pub fn access_ttl_secs(&self) -> i64 {
        self.access_ttl_secs
    }

    fn sign<T: Serialize>(&self, tenant: &TenantRef, claims: &T) -> ServiceResult<(String, String)> {
        let scope = key_scope_for(tenant);
        let key = self
            .keys
            .active(&scope)
            .map_err(|e| ServiceError::IssueFailed(e.into()))?;
        let mut header = Header::new(Algorithm::EdDSA);
        header.kid = Some(key.kid.clone());
        let token = encode(&header, claims, key.encoding_key())
            .map_err(|e| ServiceError::IssueFailed(e.into()))?;
        Ok((token, key.kid.clone()))
    }

    #[tracing::instrument(skip(self, tenant, grant), fields(tenant = %tenant.slug, client_id = %grant.client_id))]
    pub async fn sign_access(
        &self,
        tenant: &TenantRef,
        grant: &AccessGrant,
        now: DateTime<Utc>,
    ) -> ServiceResult<SignedToken> {
        let iss = self.issuer_for(tenant);
        let iat = now.timestamp();

        let mut custom = Map::new();
        if let Some(hook) = &self.hook {
            let ctx = HookContext {
                tenant_id: tenant.id,
                tenant_slug: tenant.slug.clone(),
                client_id: grant.client_id.clone(),
                user_id: grant.user_id,
                scopes: grant.scopes.clone(),
                amr: grant.amr.clone(),
            };
            let extra = hook.extra_claims(&ctx, custom.clone()).await;
            custom.extend(filter_hook_claims(&iss, extra));
        }
        let system = SystemClaims {
            roles: grant.roles.clone(),
            perms: grant.perms.clone(),
        };
        custom.insert(
            iss.clone(),
            serde_json::to_value(system).map_err(|e| ServiceError::IssueFailed(e.into()))?,
        );

        let claims = AccessClaims {
            iss,
            sub: grant.user_id.to_string(),
            aud: grant.client_id.clone(),
            iat,
            nbf: iat,
            exp: iat + self.access_ttl_secs,
            tid: tenant.id.to_string(),
            acr: acr_for(&grant.amr).to_string(),
            amr: grant.amr.clone(),
            scp: grant.scopes.join(" "),
            custom,
        };
        let (token, kid) = self.sign(tenant, &claims)?;
        Ok(SignedToken {
            token,
            kid,
            expires_in: self.access_ttl_secs,
        })
    }

    #[allow(clippy::too_many_arguments)]
    pub fn sign_id_token(
        &self,
        tenant: &TenantRef,
        user_id: Uuid,
        client_id: &str,
        nonce: Option<&str>,
        auth_time: i64,
        amr: &[String],
        email: Option<(&str, bool)>,
        now: DateTime<Utc>,
    ) -> ServiceResult<String> {
        let iat = now.timestamp();
        let claims = IdClaims {
            iss: self.issuer_for(tenant),
            sub: user_id.to_string(),
            aud: client_id.to_string(),
            iat,
            exp: iat + self.id_ttl_secs,
            nonce: nonce.map(str::to_string),
            auth_time,
            amr: amr.to_vec(),
            acr: acr_for(amr).to_string(),
            email: email.map(|(e, _)| e.to_string()),
            email_verified: email.map(|(_, v)| v),
        };
        self.sign(tenant, &claims).map(|(token, _)| token)
    }

    /// Verifies signature, `exp`/`nbf` with skew, that the signing key belongs
    /// to the claimed tenant, and that `iss` is that tenant's issuer.
    pub fn validate_access(
        &self,
        token: &str,
        tenants: &TenantResolver,
        now: DateTime<Utc>,
    ) -> ServiceResult<(TenantRef, AccessClaims)> {
        let header = decode_header(token).map_err(|_| ServiceError::InvalidToken)?;
        if header.alg != Algorithm::EdDSA {
            return Err(ServiceError::InvalidToken);
        }
        let kid = header.kid.ok_or(ServiceError::InvalidToken)?;
        let (scope, key) = self
            .keys
            .verification_key(&kid, now)
            .ok_or(ServiceError::InvalidToken)?;

        let mut validation = Validation::new(Algorithm::EdDSA);
        validation.leeway = CLOCK_SKEW_SECS;
        validation.validate_aud = false;
        validation.validate_nbf = true;
        validation.set_required_spec_claims(&["exp", "nbf", "iss", "sub"]);

        let data = decode::<AccessClaims>(token, key.decoding_key(), &validation).map_err(|e| {
            tracing::debug!(error = %e, "access token rejected");
            ServiceError::InvalidToken
        })?;
        let claims = data.claims;

        let tenant_id = Uuid::parse_str(&claims.tid).map_err(|_| ServiceError::InvalidToken)?;
        let tenant = tenants
            .resolve_id(tenant_id)
            .map_err(|_| ServiceError::InvalidToken)?;
        if key_scope_for(&tenant) != scope || claims.iss != self.issuer_for(&tenant) {
            tracing::warn!(tenant = %tenant.slug, "token issuer does not match its tenant");
            return Err(ServiceError::InvalidToken);
        }
        Ok((tenant, claims))
    }
}
