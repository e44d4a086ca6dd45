//! Client resolution and the per-client request predicates.

use async_trait::async_trait;
use std::sync::Arc;
use url::Url;

use super::catalog::Catalog;
use super::error::{ServiceError, ServiceResult};
use crate::models::{Client, TenantRef};
use crate::utils::{verify_password, Password, PasswordHashString};

/// Secondary copy of client records (e.g. a SQL mirror). The catalog stays
/// authoritative; the mirror only ever vetoes.
#[async_trait]
pub trait ClientMirror: Send + Sync {
    async fn get_client(&self, tenant: &TenantRef, client_id: &str)
        -> ServiceResult<Option<Client>>;
}

pub struct ClientResolver {
    catalog: Arc<Catalog>,
    mirror: Option<Arc<dyn ClientMirror>>,
}

impl ClientResolver {
    pub fn new(catalog: Arc<Catalog>) -> Self {
        Self {
            catalog,
            mirror: None,
        }
    }

    pub fn with_mirror(mut self, mirror: Arc<dyn ClientMirror>) -> Self {
        self.mirror = Some(mirror);
        self
    }

    pub async fn resolve(&self, tenant: &TenantRef, client_id: &str) -> ServiceResult<Client> {
        let from_catalog = self.catalog.client(tenant.id, client_id);

        let Some(mirror) = &self.mirror else {
            return from_catalog.ok_or(ServiceError::ClientNotFound);
        };

        let from_mirror = mirror.get_client(tenant, client_id).await?;
        match (from_catalog, from_mirror) {
            (Some(a), Some(b)) if same_policy(&a, &b) => Ok(a),
            (None, None) => Err(ServiceError::ClientNotFound),
            _ => {
                tracing::error!(
                    tenant = %tenant.slug,
                    client_id,
                    "client record differs between catalog and mirror"
                );
                Err(ServiceError::ClientNotFound)
            }
        }
    }

    /// Confidential clients must present their secret. Public clients pass
    /// without one.
    pub async fn authenticate(&self, client: &Client, secret: Option<&str>) -> ServiceResult<()> {
        if !client.is_confidential() {
            return Ok(());
        }
        let (Some(secret), Some(hash)) = (secret, client.secret_hash.clone()) else {
            return Err(ServiceError::InvalidClientCredentials);
        };
        let secret = Password::new(secret.to_string());
        tokio::task::spawn_blocking(move || {
            verify_password(&secret, &PasswordHashString::new(hash))
        })
        .await
        .map_err(|e| ServiceError::Internal(anyhow::anyhow!("client secret check: {}", e)))?
        .map_err(|_| ServiceError::InvalidClientCredentials)
    }
}

/// Fields that decide what a client may do.
fn same_policy(a: &Client, b: &Client) -> bool {
    a.client_id == b.client_id
        && a.client_type == b.client_type
        && a.redirect_uris == b.redirect_uris
        && a.scopes == b.scopes
        && a.providers == b.providers
        && a.require_email_verification == b.require_email_verification
}

/// Parses a redirect URI into its comparison form. Fragments are never
/// allowed.
fn normalize_redirect(uri: &str) -> Option<Url> {
    let url = Url::parse(uri.trim()).ok()?;
    if url.fragment().is_some() || url.cannot_be_a_base() {
        return None;
    }
    Some(url)
}

/// Exact match against a registered URI on scheme, host, port and path.
/// Scheme and host compare case-insensitively, the path case-sensitively.
/// The query is not part of the comparison base; fragments are rejected.
pub fn validate_redirect_uri(client: &Client, uri: &str) -> bool {
    let Some(candidate) = normalize_redirect(uri) else {
        return false;
    };
    client
        .redirect_uris
        .iter()
        .filter_map(|r| normalize_redirect(r))
        .any(|registered| {
            registered.scheme() == candidate.scheme()
                && registered.host_str() == candidate.host_str()
                && registered.port_or_known_default() == candidate.port_or_known_default()
                && registered.path() == candidate.path()
        })
}

pub fn is_scope_allowed(client: &Client, scope: &str) -> bool {
    client.scopes.iter().any(|s| s == scope)
}

/// Empty allowlist admits every provider.
pub fn is_provider_allowed(client: &Client, provider: &str) -> bool {
    client.providers.is_empty() || client.providers.iter().any(|p| p == provider)
}

/// Splits a space-delimited scope string, dropping duplicates. Every entry
/// must be allowed for the client.
pub fn parse_requested_scopes(client: &Client, scope: &str) -> ServiceResult<Vec<String>> {
    let mut out: Vec<String> = Vec::new();
    for s in scope.split_whitespace() {
        if !is_scope_allowed(client, s) {
            return Err(ServiceError::InvalidScope(format!("Scope {} is not allowed", s)));
        }
        if !out.iter().any(|x| x == s) {
            out.push(s.to_string());
        }
    }
    if out.is_empty() {
        return Err(ServiceError::InvalidScope("scope is required".to_string()));
    }
    Ok(out)
}
