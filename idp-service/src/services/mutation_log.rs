//! Control-plane writes.
//!
//! Every change to tenants, clients, scopes or signing keys is a [`Mutation`]
//! handed to a [`MutationLog`]. The log decides where it is applied: locally
//! only, or on a leader and then on every subscribed follower. Reads always go
//! back to the local [`Catalog`] afterwards.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;
use tokio::sync::RwLock;
use url::Url;

use super::catalog::{Catalog, CatalogError};
use super::error::{ServiceError, ServiceResult};
use super::issuer::key_scope_for;
use super::keys::KeyRegistry;
use super::store::TenantStores;
use super::tenant_resolver::TenantResolver;
use crate::models::mutation::{DeleteClientPayload, DeleteScopePayload, RotateKeyPayload};
use crate::models::tenant::is_valid_slug;
use crate::models::{
    Client, KeyScope, Mutation, MutationPayload, Scope, StoredKeySet, Tenant, TenantRef,
    TenantSettings,
};
use crate::utils::{hash_password, HashParams, Password};

/// Everything one node does to take a mutation on board.
pub struct LocalApplier {
    catalog: Arc<Catalog>,
    keys: Arc<KeyRegistry>,
    tenants: Arc<TenantResolver>,
    stores: Arc<dyn TenantStores>,
}

impl LocalApplier {
    pub fn new(
        catalog: Arc<Catalog>,
        keys: Arc<KeyRegistry>,
        tenants: Arc<TenantResolver>,
        stores: Arc<dyn TenantStores>,
    ) -> Self {
        Self {
            catalog,
            keys,
            tenants,
            stores,
        }
    }

    pub fn catalog(&self) -> &Arc<Catalog> {
        &self.catalog
    }

    pub fn keys(&self) -> &Arc<KeyRegistry> {
        &self.keys
    }

    /// Key material is installed before the catalog write and before the
    /// JWKS cache is dropped, so a reader never sees a JWKS naming a kid the
    /// registry cannot verify.
    #[tracing::instrument(skip(self, mutation), fields(kind = ?mutation.kind, tenant = %mutation.tenant_slug))]
    pub async fn apply(&self, mutation: &Mutation) -> ServiceResult<()> {
        let payload = mutation.decode().map_err(CatalogError::from)?;
        let existing = self.catalog.tenant_by_slug(&mutation.tenant_slug);

        if let MutationPayload::RotateTenantKey(p) = &payload {
            if let KeyScope::Tenant(id) = p.keys.scope {
                if self.catalog.tenant_by_id(id).is_none() {
                    return Err(CatalogError::UnknownTenant(id.to_string()).into());
                }
            }
            self.keys.install(&p.keys)?;
        }

        self.catalog.apply(mutation).await?;

        match &payload {
            MutationPayload::RotateTenantKey(p) => {
                self.keys.invalidate_jwks(&p.keys.scope);
            }
            MutationPayload::DeleteTenant => {
                if let Some(tenant) = &existing {
                    self.keys.remove_scope(&KeyScope::Tenant(tenant.id));
                    self.stores.evict(tenant.id).await;
                }
            }
            MutationPayload::UpsertTenant(tenant) => {
                self.tenants.invalidate(Some(tenant.id), Some(&tenant.slug));
            }
            _ => {}
        }

        self.tenants
            .invalidate(existing.map(|t| t.id), Some(&mutation.tenant_slug));
        Ok(())
    }
}

#[async_trait]
pub trait MutationLog: Send + Sync {
    async fn apply(&self, mutation: Mutation) -> ServiceResult<()>;
}

/// Single node: writes go straight to the local applier.
pub struct DirectMutationLog {
    local: Arc<LocalApplier>,
}

impl DirectMutationLog {
    pub fn new(local: Arc<LocalApplier>) -> Self {
        Self { local }
    }
}

#[async_trait]
impl MutationLog for DirectMutationLog {
    async fn apply(&self, mutation: Mutation) -> ServiceResult<()> {
        self.local.apply(&mutation).await
    }
}

/// In-process replication: the leader applies first and decides the outcome;
/// followers receive the identical mutation afterwards.
pub struct BroadcastMutationLog {
    leader: Arc<LocalApplier>,
    followers: RwLock<Vec<Arc<LocalApplier>>>,
}

impl BroadcastMutationLog {
    pub fn new(leader: Arc<LocalApplier>) -> Self {
        Self {
            leader,
            followers: RwLock::new(Vec::new()),
        }
    }

    pub async fn subscribe(&self, follower: Arc<LocalApplier>) {
        self.followers.write().await.push(follower);
    }
}

#[async_trait]
impl MutationLog for BroadcastMutationLog {
    async fn apply(&self, mutation: Mutation) -> ServiceResult<()> {
        self.leader.apply(&mutation).await?;

        let followers = self.followers.read().await.clone();
        let results =
            futures::future::join_all(followers.iter().map(|f| f.apply(&mutation))).await;
        for (idx, result) in results.into_iter().enumerate() {
            if let Err(e) = result {
                tracing::error!(follower = idx, kind = ?mutation.kind, error = %e, "follower failed to apply mutation");
            }
        }
        Ok(())
    }
}

/// Control-plane operations, all expressed as mutations.
pub struct ControlPlane {
    catalog: Arc<Catalog>,
    keys: Arc<KeyRegistry>,
    log: Arc<dyn MutationLog>,
    stores: Arc<dyn TenantStores>,
    hash_params: HashParams,
}

impl ControlPlane {
    pub fn new(
        catalog: Arc<Catalog>,
        keys: Arc<KeyRegistry>,
        log: Arc<dyn MutationLog>,
        stores: Arc<dyn TenantStores>,
        hash_params: HashParams,
    ) -> Self {
        Self {
            catalog,
            keys,
            log,
            stores,
            hash_params,
        }
    }

    async fn submit(&self, tenant_slug: &str, payload: MutationPayload) -> ServiceResult<()> {
        let mutation =
            Mutation::new(tenant_slug, &payload, Utc::now()).map_err(CatalogError::from)?;
        self.log.apply(mutation).await
    }

    fn require(&self, slug: &str) -> ServiceResult<Tenant> {
        self.catalog
            .tenant_by_slug(slug)
            .ok_or(ServiceError::TenantNotFound)
    }

    /// Loads persisted key sets into the registry, then makes sure every
    /// signing scope in use has keys.
    pub async fn bootstrap_keys(&self, now: DateTime<Utc>) -> ServiceResult<()> {
        for set in self.catalog.key_sets() {
            self.keys.install(&set)?;
        }
        self.ensure_global_key(now).await?;
        for tenant in self.catalog.tenants() {
            self.ensure_tenant_key(&tenant.to_ref(), now).await?;
        }
        Ok(())
    }

    pub async fn ensure_global_key(&self, now: DateTime<Utc>) -> ServiceResult<()> {
        if self.keys.has_scope(&KeyScope::Global) {
            return Ok(());
        }
        let fresh = self
            .keys
            .prepare_rotation(KeyScope::Global, None, Duration::zero(), now)?;
        self.submit("", MutationPayload::RotateTenantKey(RotateKeyPayload { keys: fresh }))
            .await
    }

    /// No-op for tenants that sign with the deployment key.
    pub async fn ensure_tenant_key(&self, tenant: &TenantRef, now: DateTime<Utc>) -> ServiceResult<()> {
        let scope = key_scope_for(tenant);
        if scope == KeyScope::Global || self.keys.has_scope(&scope) {
            return Ok(());
        }
        let fresh = self.keys.prepare_rotation(scope, None, Duration::zero(), now)?;
        self.submit(
            &tenant.slug,
            MutationPayload::RotateTenantKey(RotateKeyPayload { keys: fresh }),
        )
        .await
    }

    /// Rotates the key set that signs for `tenant`. The replicated payload
    /// carries the new material itself.
    #[tracing::instrument(skip(self, tenant), fields(tenant = %tenant.slug))]
    pub async fn rotate_tenant_key(
        &self,
        tenant: &TenantRef,
        grace: Duration,
        now: DateTime<Utc>,
    ) -> ServiceResult<StoredKeySet> {
        let scope = key_scope_for(tenant);
        let current = self.catalog.key_set(&scope);
        let next = self
            .keys
            .prepare_rotation(scope, current.as_ref(), grace, now)?;
        let slug = match scope {
            KeyScope::Global => "",
            KeyScope::Tenant(_) => tenant.slug.as_str(),
        };
        self.submit(
            slug,
            MutationPayload::RotateTenantKey(RotateKeyPayload { keys: next.clone() }),
        )
        .await?;
        tracing::info!(%scope, kid = %next.active.kid, "signing key rotated");
        Ok(next)
    }

    pub async fn upsert_tenant(&self, tenant: Tenant) -> ServiceResult<TenantRef> {
        if !is_valid_slug(&tenant.slug) {
            return Err(ServiceError::InvalidRequest(format!(
                "invalid tenant slug {}",
                tenant.slug
            )));
        }
        validate_settings(&tenant.settings)?;
        let slug = tenant.slug.clone();
        self.submit(&slug, MutationPayload::UpsertTenant(tenant)).await?;

        let stored = self.require(&slug)?.to_ref();
        self.ensure_tenant_key(&stored, Utc::now()).await?;
        self.sync_user_fields(&stored).await?;
        Ok(stored)
    }

    pub async fn delete_tenant(&self, slug: &str) -> ServiceResult<()> {
        self.require(slug)?;
        self.submit(slug, MutationPayload::DeleteTenant).await
    }

    pub async fn update_tenant_settings(
        &self,
        slug: &str,
        settings: TenantSettings,
    ) -> ServiceResult<TenantRef> {
        self.require(slug)?;
        validate_settings(&settings)?;
        self.submit(slug, MutationPayload::UpdateTenantSettings(settings))
            .await?;
        let stored = self.require(slug)?.to_ref();
        self.ensure_tenant_key(&stored, Utc::now()).await?;
        self.sync_user_fields(&stored).await?;
        Ok(stored)
    }

    pub async fn upsert_client(&self, slug: &str, client: Client) -> ServiceResult<Client> {
        let tenant = self.require(slug)?;
        validate_client(&client)?;
        let client_id = client.client_id.clone();
        self.submit(slug, MutationPayload::UpsertClient(client)).await?;
        self.catalog
            .client(tenant.id, &client_id)
            .ok_or(ServiceError::ClientNotFound)
    }

    /// Stores `client` as confidential with an Argon2 hash of `secret`.
    pub async fn upsert_confidential_client(
        &self,
        slug: &str,
        mut client: Client,
        secret: &str,
    ) -> ServiceResult<Client> {
        let password = Password::new(secret.to_string());
        let params = self.hash_params;
        let hash = tokio::task::spawn_blocking(move || hash_password(&password, &params))
            .await
            .map_err(|e| ServiceError::Internal(anyhow::anyhow!("client secret hash: {}", e)))??;
        client.client_type = crate::models::ClientType::Confidential;
        client.secret_hash = Some(hash.into_string());
        self.upsert_client(slug, client).await
    }

    pub async fn delete_client(&self, slug: &str, client_id: &str) -> ServiceResult<()> {
        self.require(slug)?;
        self.submit(
            slug,
            MutationPayload::DeleteClient(DeleteClientPayload {
                client_id: client_id.to_string(),
            }),
        )
        .await
    }

    pub async fn upsert_scope(&self, slug: &str, scope: Scope) -> ServiceResult<()> {
        self.require(slug)?;
        if scope.name.is_empty() || scope.name.contains(char::is_whitespace) {
            return Err(ServiceError::InvalidScope(format!("invalid scope name {:?}", scope.name)));
        }
        self.submit(slug, MutationPayload::UpsertScope(scope)).await
    }

    pub async fn delete_scope(&self, slug: &str, name: &str) -> ServiceResult<()> {
        let tenant = self.require(slug)?;
        if self
            .catalog
            .scopes(tenant.id)
            .iter()
            .any(|s| s.name == name && s.system)
        {
            return Err(ServiceError::InvalidScope(format!("{} is a system scope", name)));
        }
        self.submit(
            slug,
            MutationPayload::DeleteScope(DeleteScopePayload {
                name: name.to_string(),
            }),
        )
        .await
    }

    async fn sync_user_fields(&self, tenant: &TenantRef) -> ServiceResult<()> {
        let store = self.stores.for_tenant(tenant).await?;
        store.sync_user_fields(&tenant.settings.user_fields).await?;
        Ok(())
    }
}

fn validate_settings(settings: &TenantSettings) -> ServiceResult<()> {
    if let Some(url) = settings.issuer_override() {
        let parsed = Url::parse(url)
            .map_err(|_| ServiceError::InvalidRequest("issuer_override must be a URL".into()))?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(ServiceError::InvalidRequest(
                "issuer_override must be http(s)".into(),
            ));
        }
    }
    if settings.issuer_mode == crate::models::IssuerMode::Domain
        && settings.issuer_override().is_none()
    {
        return Err(ServiceError::InvalidRequest(
            "issuer_mode domain requires issuer_override".into(),
        ));
    }
    if let Some(bad) = settings.user_fields.iter().find(|f| !f.is_valid_name()) {
        return Err(ServiceError::InvalidRequest(format!(
            "invalid user field name {}",
            bad.name
        )));
    }
    Ok(())
}

fn validate_client(client: &Client) -> ServiceResult<()> {
    if client.client_id.trim().is_empty() {
        return Err(ServiceError::InvalidRequest("client_id is required".into()));
    }
    if client.redirect_uris.is_empty() {
        return Err(ServiceError::InvalidRequest(
            "at least one redirect_uri is required".into(),
        ));
    }
    for uri in &client.redirect_uris {
        let parsed = Url::parse(uri).map_err(|_| ServiceError::InvalidRedirectUri)?;
        if parsed.fragment().is_some() {
            return Err(ServiceError::InvalidRedirectUri);
        }
    }
    if client.is_confidential() && client.secret_hash.is_none() {
        return Err(ServiceError::InvalidRequest(
            "confidential clients need a secret".into(),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ClientType, IssuerMode};
    use crate::services::crypto::SecretBox;
    use crate::services::store::MemoryStores;
    use uuid::Uuid;

    struct Node {
        applier: Arc<LocalApplier>,
        tenants: Arc<TenantResolver>,
    }

    fn node(secret_box: Arc<SecretBox>) -> Node {
        let catalog = Arc::new(Catalog::in_memory());
        let keys = Arc::new(KeyRegistry::new(secret_box));
        let tenants = Arc::new(TenantResolver::new(catalog.clone()));
        let applier = Arc::new(LocalApplier::new(
            catalog,
            keys,
            tenants.clone(),
            Arc::new(MemoryStores::new()),
        ));
        Node { applier, tenants }
    }

    fn control_plane(node: &Node, log: Arc<dyn MutationLog>) -> ControlPlane {
        ControlPlane::new(
            node.applier.catalog().clone(),
            node.applier.keys().clone(),
            log,
            Arc::new(MemoryStores::new()),
            HashParams {
                memory_kib: 1024,
                iterations: 1,
                parallelism: 1,
            },
        )
    }

    fn path_tenant(slug: &str) -> Tenant {
        Tenant::new(
            slug,
            slug,
            TenantSettings {
                issuer_mode: IssuerMode::Path,
                ..Default::default()
            },
        )
    }

    fn client(id: &str) -> Client {
        Client {
            client_id: id.into(),
            tenant_id: Uuid::nil(),
            name: id.into(),
            client_type: ClientType::Public,
            secret_hash: None,
            redirect_uris: vec!["https://app.example/cb".into()],
            scopes: vec!["openid".into()],
            providers: vec![],
            require_email_verification: false,
            require_consent: false,
            reset_password_url: None,
            verify_email_url: None,
        }
    }

    #[tokio::test]
    async fn followers_receive_exact_key_material() {
        let sbox = Arc::new(SecretBox::new(&[9u8; 32]));
        let leader = node(sbox.clone());
        let follower = node(sbox);

        let log = Arc::new(BroadcastMutationLog::new(leader.applier.clone()));
        log.subscribe(follower.applier.clone()).await;
        let cp = control_plane(&leader, log);

        let tenant = cp.upsert_tenant(path_tenant("acme")).await.unwrap();
        let scope = KeyScope::Tenant(tenant.id);
        let first = leader.applier.keys().active(&scope).unwrap().kid.clone();
        assert_eq!(follower.applier.keys().active(&scope).unwrap().kid, first);

        let rotated = cp
            .rotate_tenant_key(&tenant, Duration::seconds(60), Utc::now())
            .await
            .unwrap();
        assert_eq!(rotated.retiring.as_ref().unwrap().kid, first);
        for n in [&leader, &follower] {
            let set = n.applier.keys().key_set(&scope).unwrap();
            assert_eq!(set.active.kid, rotated.active.kid);
            assert_eq!(set.active.public_key, rotated.active.public_key);
        }
        assert!(follower.tenants.resolve("acme").is_ok());
    }

    #[tokio::test]
    async fn rename_invalidates_resolver_cache() {
        let n = node(Arc::new(SecretBox::new(&[1u8; 32])));
        let cp = control_plane(&n, Arc::new(DirectMutationLog::new(n.applier.clone())));

        let mut tenant = path_tenant("old-name");
        let id = tenant.id;
        cp.upsert_tenant(tenant.clone()).await.unwrap();
        assert_eq!(n.tenants.resolve("old-name").unwrap().id, id);

        tenant.slug = "new-name".into();
        cp.upsert_tenant(tenant).await.unwrap();
        assert!(n.tenants.resolve("old-name").is_err());
        assert_eq!(n.tenants.resolve("new-name").unwrap().id, id);
    }

    #[tokio::test]
    async fn delete_tenant_drops_its_keys() {
        let n = node(Arc::new(SecretBox::new(&[2u8; 32])));
        let cp = control_plane(&n, Arc::new(DirectMutationLog::new(n.applier.clone())));
        let tenant = cp.upsert_tenant(path_tenant("gone")).await.unwrap();
        assert!(n.applier.keys().has_scope(&KeyScope::Tenant(tenant.id)));

        cp.delete_tenant("gone").await.unwrap();
        assert!(!n.applier.keys().has_scope(&KeyScope::Tenant(tenant.id)));
        assert!(matches!(n.tenants.resolve("gone"), Err(ServiceError::TenantNotFound)));
    }

    #[tokio::test]
    async fn client_validation() {
        let n = node(Arc::new(SecretBox::new(&[4u8; 32])));
        let cp = control_plane(&n, Arc::new(DirectMutationLog::new(n.applier.clone())));
        cp.upsert_tenant(path_tenant("acme")).await.unwrap();

        let mut bad = client("app");
        bad.redirect_uris = vec!["https://app.example/cb#frag".into()];
        assert!(matches!(
            cp.upsert_client("acme", bad).await,
            Err(ServiceError::InvalidRedirectUri)
        ));

        let stored = cp
            .upsert_confidential_client("acme", client("backend"), "s3cret")
            .await
            .unwrap();
        assert!(stored.is_confidential());
        assert!(stored.secret_hash.unwrap().starts_with("$argon2id$"));
    }

    #[tokio::test]
    async fn rejects_invalid_slugs_and_domain_without_override() {
        let n = node(Arc::new(SecretBox::new(&[5u8; 32])));
        let cp = control_plane(&n, Arc::new(DirectMutationLog::new(n.applier.clone())));

        let mut bad = path_tenant("ok");
        bad.slug = "Not Valid".into();
        assert!(cp.upsert_tenant(bad).await.is_err());

        let domain = Tenant::new(
            "dom",
            "Dom",
            TenantSettings {
                issuer_mode: IssuerMode::Domain,
                ..Default::default()
            },
        );
        assert!(cp.upsert_tenant(domain).await.is_err());
    }
}
