//! Session & challenge cache: short-TTL key/value entries with atomic
//! single-use operations.
//!
//! Keys are only ever built through [`CacheKey`] constructors. Every opaque
//! value (cookie, code, token) is SHA-256 hashed before it becomes part of a
//! key, so no namespace can be a prefix of another entry's key.

use async_trait::async_trait;
use dashmap::{mapref::entry::Entry, DashMap};
use redis::{aio::ConnectionManager, Client};
use serde::{de::DeserializeOwned, Serialize};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;

use crate::utils::hash_token;

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Cache payload error: {0}")]
    Serialization(#[from] serde_json::Error),
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey(String);

impl CacheKey {
    pub fn session(cookie_value: &str) -> Self {
        Self(format!("sid:{}", hash_token(cookie_value)))
    }

    pub fn auth_code(code: &str) -> Self {
        Self(format!("code:{}", hash_token(code)))
    }

    pub fn mfa_token(token: &str) -> Self {
        Self(format!("mfa:token:{}", hash_token(token)))
    }

    pub fn consent_token(token: &str) -> Self {
        Self(format!("consent:token:{}", hash_token(token)))
    }

    pub fn social_code(code: &str) -> Self {
        Self(format!("social:code:{}", hash_token(code)))
    }

    pub fn social_state(state: &str) -> Self {
        Self(format!("social:state:{}", hash_token(state)))
    }

    /// Marker held by the consumer currently redeeming `key`.
    pub fn claim(key: &CacheKey) -> Self {
        Self(format!("claim:{}", key.0))
    }

    /// Rebuilds a key previously obtained from [`CacheKey::as_str`].
    pub fn from_stored(raw: String) -> Option<Self> {
        const PREFIXES: [&str; 6] = [
            "sid:",
            "code:",
            "mfa:token:",
            "consent:token:",
            "social:code:",
            "social:state:",
        ];
        PREFIXES
            .iter()
            .any(|p| raw.starts_with(p))
            .then_some(Self(raw))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for CacheKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[async_trait]
pub trait Cache: Send + Sync {
    async fn set(&self, key: &CacheKey, value: &[u8], ttl: Duration) -> Result<(), CacheError>;

    async fn get(&self, key: &CacheKey) -> Result<Option<Vec<u8>>, CacheError>;

    async fn delete(&self, key: &CacheKey) -> Result<(), CacheError>;

    /// Atomic get-and-delete.
    async fn take(&self, key: &CacheKey) -> Result<Option<Vec<u8>>, CacheError>;

    /// Stores only when absent. Returns whether this call stored the value.
    async fn set_if_absent(
        &self,
        key: &CacheKey,
        value: &[u8],
        ttl: Duration,
    ) -> Result<bool, CacheError>;

    async fn health_check(&self) -> Result<(), CacheError>;
}

pub async fn put_json<T: Serialize + Sync>(
    cache: &dyn Cache,
    key: &CacheKey,
    value: &T,
    ttl: Duration,
) -> Result<(), CacheError> {
    let bytes = serde_json::to_vec(value)?;
    cache.set(key, &bytes, ttl).await
}

pub async fn get_json<T: DeserializeOwned>(
    cache: &dyn Cache,
    key: &CacheKey,
) -> Result<Option<T>, CacheError> {
    match cache.get(key).await? {
        Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
        None => Ok(None),
    }
}

/// How long a consumer may hold a claim before it lapses on its own.
pub const CLAIM_TTL: Duration = Duration::from_secs(30);

/// Exclusive right to redeem one single-use entry.
///
/// Obtained after the payload has been read and validated. The entry itself is
/// deleted only by [`SingleUseClaim::commit`], once the dependent write has
/// succeeded; [`SingleUseClaim::release`] (or drop) hands the entry back.
pub struct SingleUseClaim {
    cache: Arc<dyn Cache>,
    key: CacheKey,
    claim_key: CacheKey,
    settled: bool,
}

impl SingleUseClaim {
    /// `Ok(None)` when another consumer holds the claim or the entry is
    /// already gone.
    pub async fn acquire(
        cache: Arc<dyn Cache>,
        key: &CacheKey,
    ) -> Result<Option<Self>, CacheError> {
        let claim_key = CacheKey::claim(key);
        if !cache.set_if_absent(&claim_key, b"1", CLAIM_TTL).await? {
            return Ok(None);
        }
        // The marker outlives a commit only by CLAIM_TTL, so a caller holding
        // a stale read must not win once it lapses.
        if cache.get(key).await?.is_none() {
            cache.delete(&claim_key).await?;
            return Ok(None);
        }
        Ok(Some(Self {
            cache,
            key: key.clone(),
            claim_key,
            settled: false,
        }))
    }

    /// Consumes the entry. The claim marker is left to expire.
    pub async fn commit(mut self) -> Result<(), CacheError> {
        self.settled = true;
        if self.cache.take(&self.key).await?.is_none() {
            tracing::warn!(key = %self.key, "single-use entry expired while claimed");
        }
        Ok(())
    }

    pub async fn release(mut self) -> Result<(), CacheError> {
        self.settled = true;
        self.cache.delete(&self.claim_key).await
    }
}

impl Drop for SingleUseClaim {
    fn drop(&mut self) {
        if self.settled {
            return;
        }
        // Cancelled mid-flow: give the entry back.
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            let cache = self.cache.clone();
            let claim_key = self.claim_key.clone();
            handle.spawn(async move {
                if let Err(e) = cache.delete(&claim_key).await {
                    tracing::warn!(error = %e, "failed to release single-use claim");
                }
            });
        }
    }
}

#[derive(Clone)]
pub struct RedisCache {
    _client: Client,
    manager: ConnectionManager,
}

impl RedisCache {
    pub async fn new(url: &str) -> Result<Self, anyhow::Error> {
        tracing::info!("Connecting to Redis");
        let client = Client::open(url)?;

        let manager = client.get_connection_manager().await.map_err(|e| {
            tracing::error!("Failed to get Redis connection manager: {}", e);
            anyhow::anyhow!("Failed to connect to Redis: {}", e)
        })?;

        tracing::info!("Successfully connected to Redis");

        Ok(Self {
            _client: client,
            manager,
        })
    }
}

fn ttl_millis(ttl: Duration) -> u64 {
    (ttl.as_millis() as u64).max(1)
}

#[async_trait]
impl Cache for RedisCache {
    async fn set(&self, key: &CacheKey, value: &[u8], ttl: Duration) -> Result<(), CacheError> {
        let mut conn = self.manager.clone();
        redis::cmd("SET")
            .arg(key.as_str())
            .arg(value)
            .arg("PX")
            .arg(ttl_millis(ttl))
            .query_async::<_, ()>(&mut conn)
            .await?;
        Ok(())
    }

    async fn get(&self, key: &CacheKey) -> Result<Option<Vec<u8>>, CacheError> {
        let mut conn = self.manager.clone();
        let value: Option<Vec<u8>> = redis::cmd("GET")
            .arg(key.as_str())
            .query_async(&mut conn)
            .await?;
        Ok(value)
    }

    async fn delete(&self, key: &CacheKey) -> Result<(), CacheError> {
        let mut conn = self.manager.clone();
        redis::cmd("DEL")
            .arg(key.as_str())
            .query_async::<_, ()>(&mut conn)
            .await?;
        Ok(())
    }

    async fn take(&self, key: &CacheKey) -> Result<Option<Vec<u8>>, CacheError> {
        let mut conn = self.manager.clone();
        // GETDEL is atomic: get + delete in one operation
        let value: Option<Vec<u8>> = redis::cmd("GETDEL")
            .arg(key.as_str())
            .query_async(&mut conn)
            .await?;
        Ok(value)
    }

    async fn set_if_absent(
        &self,
        key: &CacheKey,
        value: &[u8],
        ttl: Duration,
    ) -> Result<bool, CacheError> {
        let mut conn = self.manager.clone();
        let reply: Option<String> = redis::cmd("SET")
            .arg(key.as_str())
            .arg(value)
            .arg("NX")
            .arg("PX")
            .arg(ttl_millis(ttl))
            .query_async(&mut conn)
            .await?;
        Ok(reply.is_some())
    }

    async fn health_check(&self) -> Result<(), CacheError> {
        let mut conn = self.manager.clone();
        redis::cmd("PING").query_async::<_, ()>(&mut conn).await?;
        Ok(())
    }
}

/// In-process cache with absolute expiry. Expired entries are dropped on
/// access and swept periodically on writes.
#[derive(Default)]
pub struct MemoryCache {
    entries: DashMap<String, (Vec<u8>, Instant)>,
    writes: AtomicUsize,
}

const SWEEP_EVERY: usize = 1024;

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn after_write(&self) {
        if self.writes.fetch_add(1, Ordering::Relaxed) % SWEEP_EVERY == SWEEP_EVERY - 1 {
            let now = Instant::now();
            self.entries.retain(|_, (_, expires)| *expires > now);
        }
    }

    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.entries.iter().filter(|e| e.value().1 > now).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl Cache for MemoryCache {
    async fn set(&self, key: &CacheKey, value: &[u8], ttl: Duration) -> Result<(), CacheError> {
        self.entries
            .insert(key.0.clone(), (value.to_vec(), Instant::now() + ttl));
        self.after_write();
        Ok(())
    }

    async fn get(&self, key: &CacheKey) -> Result<Option<Vec<u8>>, CacheError> {
        let now = Instant::now();
        let value = self
            .entries
            .get(&key.0)
            .filter(|e| e.value().1 > now)
            .map(|e| e.value().0.clone());
        Ok(value)
    }

    async fn delete(&self, key: &CacheKey) -> Result<(), CacheError> {
        self.entries.remove(&key.0);
        Ok(())
    }

    async fn take(&self, key: &CacheKey) -> Result<Option<Vec<u8>>, CacheError> {
        let now = Instant::now();
        Ok(self
            .entries
            .remove(&key.0)
            .filter(|(_, (_, expires))| *expires > now)
            .map(|(_, (value, _))| value))
    }

    async fn set_if_absent(
        &self,
        key: &CacheKey,
        value: &[u8],
        ttl: Duration,
    ) -> Result<bool, CacheError> {
        let now = Instant::now();
        let stored = match self.entries.entry(key.0.clone()) {
            Entry::Occupied(mut occupied) => {
                if occupied.get().1 > now {
                    false
                } else {
                    occupied.insert((value.to_vec(), now + ttl));
                    true
                }
            }
            Entry::Vacant(vacant) => {
                vacant.insert((value.to_vec(), now + ttl));
                true
            }
        };
        if stored {
            self.after_write();
        }
        Ok(stored)
    }

    async fn health_check(&self) -> Result<(), CacheError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_are_namespaced_and_hashed() {
        let key = CacheKey::auth_code("abc");
        assert!(key.as_str().starts_with("code:"));
        assert!(!key.as_str().contains("abc"));
        assert_eq!(key.as_str().len(), "code:".len() + 64);
        assert_ne!(CacheKey::mfa_token("x"), CacheKey::consent_token("x"));
        assert!(CacheKey::claim(&key).as_str().starts_with("claim:code:"));
    }

    #[test]
    fn from_stored_rejects_unknown_prefix() {
        let key = CacheKey::session("cookie");
        assert_eq!(
            CacheKey::from_stored(key.as_str().to_string()),
            Some(key.clone())
        );
        assert_eq!(CacheKey::from_stored("other:1".into()), None);
    }

    #[tokio::test]
    async fn take_is_single_use() {
        let cache = MemoryCache::new();
        let key = CacheKey::auth_code("c1");
        cache.set(&key, b"v", Duration::from_secs(60)).await.unwrap();
        assert_eq!(cache.take(&key).await.unwrap(), Some(b"v".to_vec()));
        assert_eq!(cache.take(&key).await.unwrap(), None);
    }

    #[tokio::test]
    async fn expired_entries_are_invisible() {
        let cache = MemoryCache::new();
        let key = CacheKey::mfa_token("t");
        cache.set(&key, b"v", Duration::from_millis(5)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(cache.get(&key).await.unwrap(), None);
        assert!(cache
            .set_if_absent(&key, b"w", Duration::from_secs(1))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn claim_excludes_concurrent_consumers() {
        let cache: Arc<dyn Cache> = Arc::new(MemoryCache::new());
        let key = CacheKey::mfa_token("m");
        cache.set(&key, b"payload", Duration::from_secs(60)).await.unwrap();

        let first = SingleUseClaim::acquire(cache.clone(), &key).await.unwrap();
        assert!(first.is_some());
        assert!(SingleUseClaim::acquire(cache.clone(), &key)
            .await
            .unwrap()
            .is_none());

        // Releasing leaves the entry redeemable.
        first.unwrap().release().await.unwrap();
        assert!(cache.get(&key).await.unwrap().is_some());

        let second = SingleUseClaim::acquire(cache.clone(), &key)
            .await
            .unwrap()
            .unwrap();
        second.commit().await.unwrap();
        assert!(cache.get(&key).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn lapsed_marker_does_not_reopen_a_committed_entry() {
        let cache: Arc<dyn Cache> = Arc::new(MemoryCache::new());
        let key = CacheKey::consent_token("c");
        cache.set(&key, b"payload", Duration::from_secs(60)).await.unwrap();

        let stale_read = cache.get(&key).await.unwrap();
        assert!(stale_read.is_some());
        SingleUseClaim::acquire(cache.clone(), &key)
            .await
            .unwrap()
            .unwrap()
            .commit()
            .await
            .unwrap();

        // Stands in for CLAIM_TTL running out.
        cache.delete(&CacheKey::claim(&key)).await.unwrap();
        assert!(SingleUseClaim::acquire(cache.clone(), &key)
            .await
            .unwrap()
            .is_none());
        assert!(cache.get(&CacheKey::claim(&key)).await.unwrap().is_none());
    }
}
