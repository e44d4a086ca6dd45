//! Tenant resolution: turns a caller-supplied UUID, slug or client id into a
//! canonical [`TenantRef`], exactly once per request.

use dashmap::DashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use uuid::Uuid;

use super::catalog::Catalog;
use super::error::{ServiceError, ServiceResult};
use crate::models::tenant::normalize_slug;
use crate::models::TenantRef;

pub const TENANT_CACHE_TTL: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum CacheKey {
    Id(Uuid),
    Slug(String),
}

pub struct TenantResolver {
    catalog: Arc<Catalog>,
    ttl: Duration,
    cache: DashMap<CacheKey, (Instant, TenantRef)>,
}

impl TenantResolver {
    pub fn new(catalog: Arc<Catalog>) -> Self {
        Self::with_ttl(catalog, TENANT_CACHE_TTL)
    }

    pub fn with_ttl(catalog: Arc<Catalog>, ttl: Duration) -> Self {
        Self {
            catalog,
            ttl,
            cache: DashMap::new(),
        }
    }

    fn cached(&self, key: &CacheKey) -> Option<TenantRef> {
        let entry = self.cache.get(key)?;
        let (at, tenant) = entry.value();
        (at.elapsed() < self.ttl).then(|| tenant.clone())
    }

    fn remember(&self, tenant: &TenantRef) {
        let now = Instant::now();
        self.cache
            .insert(CacheKey::Id(tenant.id), (now, tenant.clone()));
        self.cache
            .insert(CacheKey::Slug(tenant.slug.clone()), (now, tenant.clone()));
    }

    /// UUID first, then slug. Never echoes the input back as a slug.
    pub fn resolve(&self, id_or_slug: &str) -> ServiceResult<TenantRef> {
        let input = id_or_slug.trim();
        if input.is_empty() {
            return Err(ServiceError::TenantNotFound);
        }

        if let Ok(id) = Uuid::parse_str(input) {
            return self.resolve_id(id);
        }

        let slug = normalize_slug(input);
        let key = CacheKey::Slug(slug.clone());
        if let Some(tenant) = self.cached(&key) {
            return Ok(tenant);
        }
        let tenant = self
            .catalog
            .tenant_by_slug(&slug)
            .ok_or(ServiceError::TenantNotFound)?
            .to_ref();
        self.remember(&tenant);
        Ok(tenant)
    }

    pub fn resolve_id(&self, id: Uuid) -> ServiceResult<TenantRef> {
        let key = CacheKey::Id(id);
        if let Some(tenant) = self.cached(&key) {
            return Ok(tenant);
        }
        let tenant = self
            .catalog
            .tenant_by_id(id)
            .ok_or(ServiceError::TenantNotFound)?
            .to_ref();
        self.remember(&tenant);
        Ok(tenant)
    }

    /// Resolves through an explicit hint when given, else through the
    /// client-id index. A client id registered in several tenants without a
    /// hint is ambiguous.
    pub fn resolve_for_client(
        &self,
        hint: Option<&str>,
        client_id: &str,
    ) -> ServiceResult<TenantRef> {
        if let Some(hint) = hint.map(str::trim).filter(|h| !h.is_empty()) {
            return self.resolve(hint);
        }
        match self.catalog.tenants_for_client(client_id).as_slice() {
            [] => Err(ServiceError::ClientNotFound),
            [only] => self.resolve_id(*only),
            _ => Err(ServiceError::AmbiguousTenant),
        }
    }

    /// Drops cached entries for a tenant, under both its old and new names.
    pub fn invalidate(&self, id: Option<Uuid>, slug: Option<&str>) {
        if let Some(id) = id {
            if let Some((_, (_, tenant))) = self.cache.remove(&CacheKey::Id(id)) {
                self.cache.remove(&CacheKey::Slug(tenant.slug));
            }
        }
        if let Some(slug) = slug {
            if let Some((_, (_, tenant))) = self.cache.remove(&CacheKey::Slug(slug.to_string())) {
                self.cache.remove(&CacheKey::Id(tenant.id));
            }
        }
    }

    pub fn invalidate_all(&self) {
        self.cache.clear();
    }
}
