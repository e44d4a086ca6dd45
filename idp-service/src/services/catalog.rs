//! Control-plane catalog: tenants, their clients and scopes, and signing key
//! sets. Held in memory and written through to JSON documents under the
//! control-plane directory:
//!
//! ```text
//! <dir>/tenants/<slug>.json   tenant + clients + scopes
//! <dir>/keys/<scope>.json     StoredKeySet (private seeds sealed)
//! ```
//!
//! The catalog is only ever written through [`Catalog::apply`], i.e. by the
//! mutation log.

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::models::{
    Client, KeyScope, Mutation, MutationPayload, Scope, StoredKeySet, Tenant,
};

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("Unknown tenant: {0}")]
    UnknownTenant(String),

    #[error("Slug already in use: {0}")]
    SlugTaken(String),

    #[error("Invalid mutation payload: {0}")]
    InvalidPayload(#[from] serde_json::Error),

    #[error("Catalog I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// On-disk form of one tenant.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct TenantDocument {
    tenant: Tenant,
    #[serde(default)]
    clients: Vec<Client>,
    #[serde(default)]
    scopes: Vec<Scope>,
}

pub struct Catalog {
    dir: Option<PathBuf>,
    tenants: DashMap<Uuid, Tenant>,
    slugs: DashMap<String, Uuid>,
    clients: DashMap<(Uuid, String), Client>,
    /// client_id -> tenants registering it.
    client_index: DashMap<String, Vec<Uuid>>,
    scopes: DashMap<Uuid, Vec<Scope>>,
    keys: DashMap<KeyScope, StoredKeySet>,
    /// Serializes writers so the maps and files move together.
    write_lock: Mutex<()>,
}

impl Catalog {
    /// A catalog that is never persisted.
    pub fn in_memory() -> Self {
        Self {
            dir: None,
            tenants: DashMap::new(),
            slugs: DashMap::new(),
            clients: DashMap::new(),
            client_index: DashMap::new(),
            scopes: DashMap::new(),
            keys: DashMap::new(),
            write_lock: Mutex::new(()),
        }
    }

    /// Loads every document under `dir`, creating the layout if missing.
    pub async fn open(dir: impl AsRef<Path>) -> Result<Self, CatalogError> {
        let dir = dir.as_ref().to_path_buf();
        tokio::fs::create_dir_all(dir.join("tenants")).await?;
        tokio::fs::create_dir_all(dir.join("keys")).await?;

        let mut catalog = Self::in_memory();
        catalog.dir = Some(dir.clone());

        for path in json_files(&dir.join("tenants")).await? {
            let bytes = tokio::fs::read(&path).await?;
            let doc: TenantDocument = serde_json::from_slice(&bytes)?;
            if doc.tenant.slug != path_stem(&path) {
                tracing::warn!(path = %path.display(), slug = %doc.tenant.slug, "tenant document name does not match its slug");
            }
            let tenant_id = doc.tenant.id;
            catalog.index_tenant(doc.tenant);
            for mut client in doc.clients {
                client.tenant_id = tenant_id;
                catalog.index_client(client);
            }
            catalog.scopes.insert(tenant_id, doc.scopes);
        }

        for path in json_files(&dir.join("keys")).await? {
            let bytes = tokio::fs::read(&path).await?;
            let set: StoredKeySet = serde_json::from_slice(&bytes)?;
            catalog.keys.insert(set.scope, set);
        }

        tracing::info!(
            dir = %dir.display(),
            tenants = catalog.tenants.len(),
            key_sets = catalog.keys.len(),
            "control-plane catalog loaded"
        );
        Ok(catalog)
    }

    pub fn tenant_by_id(&self, id: Uuid) -> Option<Tenant> {
        self.tenants.get(&id).map(|t| t.clone())
    }

    pub fn tenant_by_slug(&self, slug: &str) -> Option<Tenant> {
        let id = *self.slugs.get(slug)?;
        self.tenant_by_id(id)
    }

    pub fn tenants(&self) -> Vec<Tenant> {
        self.tenants.iter().map(|t| t.value().clone()).collect()
    }

    /// Tenants that register `client_id`.
    pub fn tenants_for_client(&self, client_id: &str) -> Vec<Uuid> {
        self.client_index
            .get(client_id)
            .map(|ids| ids.clone())
            .unwrap_or_default()
    }

    pub fn client(&self, tenant_id: Uuid, client_id: &str) -> Option<Client> {
        self.clients
            .get(&(tenant_id, client_id.to_string()))
            .map(|c| c.clone())
    }

    pub fn clients(&self, tenant_id: Uuid) -> Vec<Client> {
        self.clients
            .iter()
            .filter(|c| c.key().0 == tenant_id)
            .map(|c| c.value().clone())
            .collect()
    }

    pub fn scopes(&self, tenant_id: Uuid) -> Vec<Scope> {
        self.scopes
            .get(&tenant_id)
            .map(|s| s.clone())
            .unwrap_or_default()
    }

    pub fn key_set(&self, scope: &KeyScope) -> Option<StoredKeySet> {
        self.keys.get(scope).map(|k| k.clone())
    }

    pub fn key_sets(&self) -> Vec<StoredKeySet> {
        self.keys.iter().map(|k| k.value().clone()).collect()
    }

    fn index_tenant(&self, tenant: Tenant) {
        if let Some(previous) = self.tenants.get(&tenant.id).map(|t| t.slug.clone()) {
            if previous != tenant.slug {
                self.slugs.remove(&previous);
            }
        }
        self.slugs.insert(tenant.slug.clone(), tenant.id);
        self.tenants.insert(tenant.id, tenant);
    }

    fn index_client(&self, client: Client) {
        let mut owners = self
            .client_index
            .entry(client.client_id.clone())
            .or_default();
        if !owners.contains(&client.tenant_id) {
            owners.push(client.tenant_id);
        }
        drop(owners);
        self.clients
            .insert((client.tenant_id, client.client_id.clone()), client);
    }

    fn unindex_client(&self, tenant_id: Uuid, client_id: &str) {
        self.clients.remove(&(tenant_id, client_id.to_string()));
        let now_empty = match self.client_index.get_mut(client_id) {
            Some(mut owners) => {
                owners.retain(|id| *id != tenant_id);
                owners.is_empty()
            }
            None => false,
        };
        if now_empty {
            self.client_index.remove(client_id);
        }
    }

    fn require_tenant(&self, slug: &str) -> Result<Tenant, CatalogError> {
        self.tenant_by_slug(slug)
            .ok_or_else(|| CatalogError::UnknownTenant(slug.to_string()))
    }

    /// Applies one mutation to memory and disk.
    pub async fn apply(&self, mutation: &Mutation) -> Result<(), CatalogError> {
        let _guard = self.write_lock.lock().await;
        let payload = mutation.decode()?;

        match payload {
            MutationPayload::UpsertTenant(tenant) => {
                if let Some(owner) = self.slugs.get(&tenant.slug).map(|id| *id) {
                    if owner != tenant.id {
                        return Err(CatalogError::SlugTaken(tenant.slug));
                    }
                }
                let renamed_from = self
                    .tenants
                    .get(&tenant.id)
                    .map(|t| t.slug.clone())
                    .filter(|old| *old != tenant.slug);
                let id = tenant.id;
                self.index_tenant(tenant);
                if let Some(old) = renamed_from {
                    self.remove_file(&format!("tenants/{}.json", old)).await?;
                }
                self.persist_tenant(id).await?;
            }
            MutationPayload::DeleteTenant => {
                let tenant = self.require_tenant(&mutation.tenant_slug)?;
                for client in self.clients(tenant.id) {
                    self.unindex_client(tenant.id, &client.client_id);
                }
                self.scopes.remove(&tenant.id);
                self.slugs.remove(&tenant.slug);
                self.tenants.remove(&tenant.id);
                let scope = KeyScope::Tenant(tenant.id);
                self.keys.remove(&scope);
                self.remove_file(&format!("tenants/{}.json", tenant.slug))
                    .await?;
                self.remove_file(&format!("keys/{}.json", scope)).await?;
            }
            MutationPayload::UpsertClient(mut client) => {
                let tenant = self.require_tenant(&mutation.tenant_slug)?;
                client.tenant_id = tenant.id;
                self.index_client(client);
                self.persist_tenant(tenant.id).await?;
            }
            MutationPayload::DeleteClient(p) => {
                let tenant = self.require_tenant(&mutation.tenant_slug)?;
                self.unindex_client(tenant.id, &p.client_id);
                self.persist_tenant(tenant.id).await?;
            }
            MutationPayload::UpsertScope(scope) => {
                let tenant = self.require_tenant(&mutation.tenant_slug)?;
                {
                    let mut scopes = self.scopes.entry(tenant.id).or_default();
                    scopes.retain(|s| s.name != scope.name);
                    scopes.push(scope);
                }
                self.persist_tenant(tenant.id).await?;
            }
            MutationPayload::DeleteScope(p) => {
                let tenant = self.require_tenant(&mutation.tenant_slug)?;
                if let Some(mut scopes) = self.scopes.get_mut(&tenant.id) {
                    scopes.retain(|s| s.name != p.name);
                }
                self.persist_tenant(tenant.id).await?;
            }
            MutationPayload::UpdateTenantSettings(settings) => {
                let mut tenant = self.require_tenant(&mutation.tenant_slug)?;
                tenant.settings = settings;
                tenant.updated_at = chrono::Utc::now();
                let id = tenant.id;
                self.index_tenant(tenant);
                self.persist_tenant(id).await?;
            }
            MutationPayload::RotateTenantKey(p) => {
                if let KeyScope::Tenant(id) = p.keys.scope {
                    if self.tenant_by_id(id).is_none() {
                        return Err(CatalogError::UnknownTenant(id.to_string()));
                    }
                }
                let scope = p.keys.scope;
                let bytes = serde_json::to_vec_pretty(&p.keys)?;
                self.keys.insert(scope, p.keys);
                self.write_file(&format!("keys/{}.json", scope), &bytes)
                    .await?;
            }
        }
        Ok(())
    }

    async fn persist_tenant(&self, tenant_id: Uuid) -> Result<(), CatalogError> {
        if self.dir.is_none() {
            return Ok(());
        }
        let Some(tenant) = self.tenant_by_id(tenant_id) else {
            return Ok(());
        };
        let mut clients = self.clients(tenant_id);
        clients.sort_by(|a, b| a.client_id.cmp(&b.client_id));
        let doc = TenantDocument {
            scopes: self.scopes(tenant_id),
            clients,
            tenant,
        };
        let bytes = serde_json::to_vec_pretty(&doc)?;
        self.write_file(&format!("tenants/{}.json", doc.tenant.slug), &bytes)
            .await
    }

    /// Write-then-rename so readers never see a torn document.
    async fn write_file(&self, relative: &str, bytes: &[u8]) -> Result<(), CatalogError> {
        let Some(dir) = &self.dir else {
            return Ok(());
        };
        let path = dir.join(relative);
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, bytes).await?;
        tokio::fs::rename(&tmp, &path).await?;
        Ok(())
    }

    async fn remove_file(&self, relative: &str) -> Result<(), CatalogError> {
        let Some(dir) = &self.dir else {
            return Ok(());
        };
        match tokio::fs::remove_file(dir.join(relative)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

async fn json_files(dir: &Path) -> Result<Vec<PathBuf>, std::io::Error> {
    let mut out = Vec::new();
    let mut entries = tokio::fs::read_dir(dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if path.extension().is_some_and(|ext| ext == "json") {
            out.push(path);
        }
    }
    out.sort();
    Ok(out)
}

fn path_stem(path: &Path) -> String {
    path.file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default()
}
