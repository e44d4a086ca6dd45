//! Typed access to the short-lived entries of the auth flows: cookie
//! sessions, authorization codes, MFA challenges and consent challenges.

use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Serialize};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use super::cache::{get_json, put_json, Cache, CacheKey, SingleUseClaim};
use super::error::ServiceResult;
use crate::models::amr::with_mfa;
use crate::models::{
    AuthorizationCodeRecord, ConsentChallenge, MfaChallenge, SessionPayload, TenantRef,
};
use crate::utils::generate_opaque_token;

#[derive(Debug, Clone, Copy)]
pub struct ChallengeTtls {
    pub session: Duration,
    pub code: Duration,
    pub mfa: Duration,
    pub consent: Duration,
}

/// A single-use entry that was read but not yet claimed.
#[derive(Debug, Clone)]
pub struct Pending<T> {
    pub key: CacheKey,
    pub value: T,
}

pub struct ChallengeCache {
    cache: Arc<dyn Cache>,
    ttls: ChallengeTtls,
}

impl ChallengeCache {
    pub fn new(cache: Arc<dyn Cache>, ttls: ChallengeTtls) -> Self {
        Self { cache, ttls }
    }

    pub fn ttls(&self) -> ChallengeTtls {
        self.ttls
    }

    async fn put<T: Serialize + Sync>(&self, key: &CacheKey, value: &T, ttl: Duration) -> ServiceResult<()> {
        put_json(self.cache.as_ref(), key, value, ttl).await?;
        Ok(())
    }

    async fn pending<T: DeserializeOwned>(&self, key: CacheKey) -> ServiceResult<Option<Pending<T>>> {
        Ok(get_json(self.cache.as_ref(), &key)
            .await?
            .map(|value| Pending { key, value }))
    }

    /// `None` when another consumer is already redeeming the entry.
    pub async fn claim<T>(&self, pending: &Pending<T>) -> ServiceResult<Option<SingleUseClaim>> {
        Ok(SingleUseClaim::acquire(self.cache.clone(), &pending.key).await?)
    }

    pub async fn start_session(
        &self,
        tenant: &TenantRef,
        user_id: Uuid,
        amr: Vec<String>,
        auth_time: i64,
        now: DateTime<Utc>,
    ) -> ServiceResult<(String, SessionPayload)> {
        let raw = generate_opaque_token();
        let payload = SessionPayload {
            user_id,
            tenant_id: tenant.id,
            tenant_slug: tenant.slug.clone(),
            amr,
            auth_time,
            expires: now.timestamp() + self.ttls.session.as_secs() as i64,
        };
        self.put(&CacheKey::session(&raw), &payload, self.ttls.session)
            .await?;
        Ok((raw, payload))
    }

    /// Live session behind a cookie value, with its cache key.
    pub async fn session(
        &self,
        cookie_value: &str,
        now: DateTime<Utc>,
    ) -> ServiceResult<Option<(CacheKey, SessionPayload)>> {
        let key = CacheKey::session(cookie_value);
        let payload: Option<SessionPayload> = get_json(self.cache.as_ref(), &key).await?;
        Ok(payload
            .filter(|p| p.expires > now.timestamp())
            .map(|p| (key, p)))
    }

    /// Adds `mfa` to a session's AMR without extending its lifetime.
    pub async fn elevate_session(&self, key: &CacheKey, now: DateTime<Utc>) -> ServiceResult<()> {
        let Some(mut payload) = get_json::<SessionPayload>(self.cache.as_ref(), key).await? else {
            return Ok(());
        };
        let remaining = payload.expires - now.timestamp();
        if remaining <= 0 {
            return Ok(());
        }
        payload.amr = with_mfa(&payload.amr);
        self.put(key, &payload, Duration::from_secs(remaining as u64))
            .await
    }

    pub async fn end_session(&self, cookie_value: &str) -> ServiceResult<()> {
        self.cache.delete(&CacheKey::session(cookie_value)).await?;
        Ok(())
    }

    pub async fn issue_code(&self, record: &AuthorizationCodeRecord) -> ServiceResult<String> {
        let raw = generate_opaque_token();
        self.put(&CacheKey::auth_code(&raw), record, self.ttls.code)
            .await?;
        Ok(raw)
    }

    pub async fn code(&self, raw: &str) -> ServiceResult<Option<Pending<AuthorizationCodeRecord>>> {
        self.pending(CacheKey::auth_code(raw)).await
    }

    pub async fn issue_mfa_challenge(&self, challenge: &MfaChallenge) -> ServiceResult<String> {
        let raw = generate_opaque_token();
        self.put(&CacheKey::mfa_token(&raw), challenge, self.ttls.mfa)
            .await?;
        Ok(raw)
    }

    pub async fn mfa_challenge(&self, raw: &str) -> ServiceResult<Option<Pending<MfaChallenge>>> {
        self.pending(CacheKey::mfa_token(raw)).await
    }

    pub async fn issue_consent_challenge(&self, challenge: &ConsentChallenge) -> ServiceResult<String> {
        let raw = generate_opaque_token();
        self.put(&CacheKey::consent_token(&raw), challenge, self.ttls.consent)
            .await?;
        Ok(raw)
    }

    pub async fn consent_challenge(
        &self,
        raw: &str,
    ) -> ServiceResult<Option<Pending<ConsentChallenge>>> {
        self.pending(CacheKey::consent_token(raw)).await
    }
}
