//! In-memory tenant datastore for development and tests. One mutex guards the
//! whole tenant, which makes every multi-row operation transactional.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use uuid::Uuid;

use super::{
    ConsentRepo, EmailTokenRepo, IdentityRepo, MfaRepo, RefreshRepo, SchemaRepo, StoreError,
    StoreResult, TenantStore, TenantStores, TrustedDeviceRepo, UserRepo,
};
use crate::models::consent::union_scopes;
use crate::models::{
    Consent, EmailToken, EmailTokenPurpose, IdentProvider, Identity, MfaTotp, NewRefreshToken,
    NewUser, RecoveryCode, RefreshToken, RotateOutcome, TenantRef, TrustedDevice, User,
    UserFieldDef,
};

#[derive(Default)]
struct TenantData {
    users: HashMap<Uuid, User>,
    identities: Vec<Identity>,
    refresh: HashMap<String, RefreshToken>,
    totp: HashMap<Uuid, MfaTotp>,
    recovery: Vec<RecoveryCode>,
    devices: Vec<TrustedDevice>,
    consents: HashMap<(Uuid, String), Consent>,
    email_tokens: HashMap<String, EmailToken>,
    user_fields: Vec<UserFieldDef>,
}

#[derive(Default)]
pub struct MemoryTenantStore {
    data: Mutex<TenantData>,
}

impl MemoryTenantStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> StoreResult<MutexGuard<'_, TenantData>> {
        self.data
            .lock()
            .map_err(|e| StoreError::Internal(anyhow::anyhow!("Memory store mutex poisoned: {}", e)))
    }

    fn insert_user(data: &mut TenantData, new_user: NewUser) -> StoreResult<User> {
        if data.users.values().any(|u| u.email == new_user.email) {
            return Err(StoreError::Duplicate("email"));
        }
        let mut user = User::new(new_user.email, new_user.source_client_id);
        user.email_verified = new_user.email_verified;
        user.custom_fields = sqlx::types::Json(new_user.custom_fields);
        data.users.insert(user.id, user.clone());
        Ok(user)
    }

    fn revoke_where<F>(data: &mut TenantData, now: DateTime<Utc>, pred: F) -> u64
    where
        F: Fn(&RefreshToken) -> bool,
    {
        let mut count = 0;
        for token in data.refresh.values_mut() {
            if token.revoked_at.is_none() && pred(token) {
                token.revoked_at = Some(now);
                count += 1;
            }
        }
        count
    }
}

#[async_trait]
impl UserRepo for MemoryTenantStore {
    async fn get_user_by_id(&self, user_id: Uuid) -> StoreResult<Option<User>> {
        Ok(self.lock()?.users.get(&user_id).cloned())
    }

    async fn get_user_by_email(
        &self,
        email: &str,
    ) -> StoreResult<Option<(User, Option<Identity>)>> {
        let data = self.lock()?;
        let Some(user) = data.users.values().find(|u| u.email == email).cloned() else {
            return Ok(None);
        };
        let identity = data
            .identities
            .iter()
            .find(|i| i.user_id == user.id && i.provider == IdentProvider::Password.as_str())
            .cloned();
        Ok(Some((user, identity)))
    }

    async fn set_email_verified(&self, user_id: Uuid) -> StoreResult<()> {
        let mut data = self.lock()?;
        let user = data
            .users
            .get_mut(&user_id)
            .ok_or(StoreError::NotFound("user"))?;
        user.email_verified = true;
        Ok(())
    }

    async fn update_password_hash(&self, user_id: Uuid, phc_hash: &str) -> StoreResult<()> {
        let mut data = self.lock()?;
        let email = data
            .users
            .get(&user_id)
            .map(|u| u.email.clone())
            .ok_or(StoreError::NotFound("user"))?;
        match data
            .identities
            .iter_mut()
            .find(|i| i.user_id == user_id && i.provider == IdentProvider::Password.as_str())
        {
            Some(identity) => identity.password_hash = Some(phc_hash.to_string()),
            None => data
                .identities
                .push(Identity::new_password(user_id, phc_hash.to_string(), &email)),
        }
        Ok(())
    }

    async fn set_disabled(
        &self,
        user_id: Uuid,
        disabled_at: Option<DateTime<Utc>>,
        disabled_until: Option<DateTime<Utc>>,
    ) -> StoreResult<()> {
        let mut data = self.lock()?;
        let user = data
            .users
            .get_mut(&user_id)
            .ok_or(StoreError::NotFound("user"))?;
        user.disabled_at = disabled_at;
        user.disabled_until = disabled_until;
        Ok(())
    }
}

#[async_trait]
impl IdentityRepo for MemoryTenantStore {
    async fn create_password_user(&self, new_user: NewUser, phc_hash: &str) -> StoreResult<User> {
        let mut data = self.lock()?;
        let user = Self::insert_user(&mut data, new_user)?;
        data.identities
            .push(Identity::new_password(user.id, phc_hash.to_string(), &user.email));
        Ok(user)
    }

    async fn create_social_user(
        &self,
        new_user: NewUser,
        provider: &str,
        provider_user_id: &str,
    ) -> StoreResult<User> {
        let mut data = self.lock()?;
        if data.identities.iter().any(|i| {
            i.provider == provider && i.provider_user_id.as_deref() == Some(provider_user_id)
        }) {
            return Err(StoreError::Duplicate("identity"));
        }
        let user = Self::insert_user(&mut data, new_user)?;
        data.identities.push(Identity::new_social(
            user.id,
            provider,
            provider_user_id,
            &user.email,
        ));
        Ok(user)
    }

    async fn find_identity(
        &self,
        provider: &str,
        provider_user_id: &str,
    ) -> StoreResult<Option<Identity>> {
        Ok(self
            .lock()?
            .identities
            .iter()
            .find(|i| {
                i.provider == provider && i.provider_user_id.as_deref() == Some(provider_user_id)
            })
            .cloned())
    }

    async fn link_identity(
        &self,
        user_id: Uuid,
        provider: &str,
        provider_user_id: &str,
        email: &str,
    ) -> StoreResult<Identity> {
        let mut data = self.lock()?;
        if data.identities.iter().any(|i| {
            i.provider == provider && i.provider_user_id.as_deref() == Some(provider_user_id)
        }) {
            return Err(StoreError::Duplicate("identity"));
        }
        let identity = Identity::new_social(user_id, provider, provider_user_id, email);
        data.identities.push(identity.clone());
        Ok(identity)
    }

    async fn list_identities(&self, user_id: Uuid) -> StoreResult<Vec<Identity>> {
        Ok(self
            .lock()?
            .identities
            .iter()
            .filter(|i| i.user_id == user_id)
            .cloned()
            .collect())
    }
}

#[async_trait]
impl RefreshRepo for MemoryTenantStore {
    async fn create_refresh(
        &self,
        new: NewRefreshToken,
        now: DateTime<Utc>,
    ) -> StoreResult<RefreshToken> {
        let mut data = self.lock()?;
        if data.refresh.contains_key(&new.token_hash) {
            return Err(StoreError::Duplicate("refresh token"));
        }
        let token = RefreshToken::new(new, now);
        data.refresh.insert(token.token_hash.clone(), token.clone());
        Ok(token)
    }

    async fn get_refresh_by_hash(&self, token_hash: &str) -> StoreResult<Option<RefreshToken>> {
        Ok(self.lock()?.refresh.get(token_hash).cloned())
    }

    async fn consume_refresh(
        &self,
        token_hash: &str,
        now: DateTime<Utc>,
    ) -> StoreResult<Option<RefreshToken>> {
        let mut data = self.lock()?;
        match data.refresh.get_mut(token_hash) {
            Some(token) if token.is_active(now) => {
                token.revoked_at = Some(now);
                Ok(Some(token.clone()))
            }
            _ => Ok(None),
        }
    }

    async fn rotate_refresh(
        &self,
        old_hash: &str,
        mut new: NewRefreshToken,
        now: DateTime<Utc>,
    ) -> StoreResult<RotateOutcome> {
        let mut data = self.lock()?;
        let Some(old) = data.refresh.get_mut(old_hash) else {
            return Ok(RotateOutcome::NotFound);
        };
        if old.revoked_at.is_some() {
            return Ok(RotateOutcome::Reused {
                family_id: old.family_id,
                user_id: old.user_id,
            });
        }
        if old.expires_at <= now {
            return Ok(RotateOutcome::Expired);
        }
        old.revoked_at = Some(now);
        let previous = old.clone();

        new.family_id = Some(previous.family_id);
        let current = RefreshToken::new(new, now);
        data.refresh
            .insert(current.token_hash.clone(), current.clone());
        Ok(RotateOutcome::Rotated { previous, current })
    }

    async fn revoke_refresh_family(
        &self,
        family_id: Uuid,
        now: DateTime<Utc>,
    ) -> StoreResult<u64> {
        let mut data = self.lock()?;
        Ok(Self::revoke_where(&mut data, now, |t| t.family_id == family_id))
    }

    async fn revoke_all_refresh_by_user(
        &self,
        user_id: Uuid,
        now: DateTime<Utc>,
    ) -> StoreResult<u64> {
        let mut data = self.lock()?;
        Ok(Self::revoke_where(&mut data, now, |t| t.user_id == user_id))
    }

    async fn revoke_refresh_by_user_client(
        &self,
        user_id: Uuid,
        client_id: &str,
        now: DateTime<Utc>,
    ) -> StoreResult<u64> {
        let mut data = self.lock()?;
        Ok(Self::revoke_where(&mut data, now, |t| {
            t.user_id == user_id && t.client_id_text == client_id
        }))
    }
}

#[async_trait]
impl MfaRepo for MemoryTenantStore {
    async fn get_totp(&self, user_id: Uuid) -> StoreResult<Option<MfaTotp>> {
        Ok(self.lock()?.totp.get(&user_id).cloned())
    }

    async fn upsert_unconfirmed_totp(
        &self,
        user_id: Uuid,
        secret_encrypted: &str,
    ) -> StoreResult<()> {
        let mut data = self.lock()?;
        if data.totp.get(&user_id).is_some_and(|t| t.is_confirmed()) {
            return Err(StoreError::Duplicate("confirmed totp"));
        }
        data.totp.insert(
            user_id,
            MfaTotp {
                user_id,
                secret_encrypted: secret_encrypted.to_string(),
                confirmed_at: None,
                last_used_at: None,
                created_at: Utc::now(),
            },
        );
        Ok(())
    }

    async fn confirm_totp(&self, user_id: Uuid, at: DateTime<Utc>) -> StoreResult<bool> {
        let mut data = self.lock()?;
        match data.totp.get_mut(&user_id) {
            Some(totp) if totp.confirmed_at.is_none() => {
                totp.confirmed_at = Some(at);
                Ok(true)
            }
            Some(_) => Ok(false),
            None => Err(StoreError::NotFound("totp")),
        }
    }

    async fn advance_totp_last_used(
        &self,
        user_id: Uuid,
        step_start: DateTime<Utc>,
    ) -> StoreResult<bool> {
        let mut data = self.lock()?;
        let totp = data
            .totp
            .get_mut(&user_id)
            .ok_or(StoreError::NotFound("totp"))?;
        if totp.last_used_at.is_some_and(|last| last >= step_start) {
            return Ok(false);
        }
        totp.last_used_at = Some(step_start);
        Ok(true)
    }

    async fn delete_totp(&self, user_id: Uuid) -> StoreResult<()> {
        let mut data = self.lock()?;
        data.totp.remove(&user_id);
        data.recovery.retain(|c| c.user_id != user_id);
        Ok(())
    }

    async fn replace_recovery_codes(
        &self,
        user_id: Uuid,
        code_hashes: &[String],
    ) -> StoreResult<()> {
        let mut data = self.lock()?;
        data.recovery.retain(|c| c.user_id != user_id);
        let now = Utc::now();
        data.recovery
            .extend(code_hashes.iter().map(|hash| RecoveryCode {
                id: Uuid::new_v4(),
                user_id,
                code_hash: hash.clone(),
                used_at: None,
                created_at: now,
            }));
        Ok(())
    }

    async fn has_unused_recovery_code(
        &self,
        user_id: Uuid,
        code_hash: &str,
    ) -> StoreResult<bool> {
        Ok(self.lock()?.recovery.iter().any(|c| {
            c.user_id == user_id && c.used_at.is_none() && c.code_hash == code_hash
        }))
    }

    async fn consume_recovery_code(
        &self,
        user_id: Uuid,
        code_hash: &str,
        now: DateTime<Utc>,
    ) -> StoreResult<bool> {
        let mut data = self.lock()?;
        match data.recovery.iter_mut().find(|c| {
            c.user_id == user_id && c.used_at.is_none() && c.code_hash == code_hash
        }) {
            Some(code) => {
                code.used_at = Some(now);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn count_unused_recovery_codes(&self, user_id: Uuid) -> StoreResult<u64> {
        Ok(self
            .lock()?
            .recovery
            .iter()
            .filter(|c| c.user_id == user_id && c.used_at.is_none())
            .count() as u64)
    }
}

#[async_trait]
impl TrustedDeviceRepo for MemoryTenantStore {
    async fn add_trusted_device(
        &self,
        user_id: Uuid,
        device_hash: &str,
        expires_at: DateTime<Utc>,
    ) -> StoreResult<()> {
        let mut data = self.lock()?;
        data.devices
            .retain(|d| !(d.user_id == user_id && d.device_hash == device_hash));
        data.devices.push(TrustedDevice {
            user_id,
            device_hash: device_hash.to_string(),
            expires_at,
            created_at: Utc::now(),
        });
        Ok(())
    }

    async fn is_trusted_device(
        &self,
        user_id: Uuid,
        device_hash: &str,
        now: DateTime<Utc>,
    ) -> StoreResult<bool> {
        Ok(self.lock()?.devices.iter().any(|d| {
            d.user_id == user_id && d.device_hash == device_hash && d.expires_at > now
        }))
    }

    async fn delete_trusted_devices(&self, user_id: Uuid) -> StoreResult<()> {
        self.lock()?.devices.retain(|d| d.user_id != user_id);
        Ok(())
    }
}

#[async_trait]
impl ConsentRepo for MemoryTenantStore {
    async fn get_consent(&self, user_id: Uuid, client_id: &str) -> StoreResult<Option<Consent>> {
        Ok(self
            .lock()?
            .consents
            .get(&(user_id, client_id.to_string()))
            .cloned())
    }

    async fn upsert_consent(
        &self,
        user_id: Uuid,
        client_id: &str,
        scopes: &[String],
        now: DateTime<Utc>,
    ) -> StoreResult<Consent> {
        let mut data = self.lock()?;
        let consent = data
            .consents
            .entry((user_id, client_id.to_string()))
            .and_modify(|c| {
                // A revoked grant starts over from the newly approved set.
                let base = if c.revoked_at.is_some() {
                    Vec::new()
                } else {
                    c.scopes_granted.clone()
                };
                c.scopes_granted = union_scopes(&base, scopes);
                c.updated_at = now;
                c.revoked_at = None;
            })
            .or_insert_with(|| Consent {
                user_id,
                client_id: client_id.to_string(),
                scopes_granted: union_scopes(&[], scopes),
                granted_at: now,
                updated_at: now,
                revoked_at: None,
            });
        Ok(consent.clone())
    }

    async fn revoke_consent(
        &self,
        user_id: Uuid,
        client_id: &str,
        now: DateTime<Utc>,
    ) -> StoreResult<()> {
        if let Some(c) = self
            .lock()?
            .consents
            .get_mut(&(user_id, client_id.to_string()))
        {
            c.revoked_at = Some(now);
        }
        Ok(())
    }
}

#[async_trait]
impl EmailTokenRepo for MemoryTenantStore {
    async fn create_email_token(
        &self,
        user_id: Uuid,
        purpose: EmailTokenPurpose,
        token_hash: &str,
        expires_at: DateTime<Utc>,
    ) -> StoreResult<EmailToken> {
        let token = EmailToken {
            id: Uuid::new_v4(),
            user_id,
            purpose: purpose.as_str().to_string(),
            token_hash: token_hash.to_string(),
            expires_at,
            used_at: None,
            created_at: Utc::now(),
        };
        self.lock()?
            .email_tokens
            .insert(token_hash.to_string(), token.clone());
        Ok(token)
    }

    async fn get_email_token(
        &self,
        token_hash: &str,
        purpose: EmailTokenPurpose,
    ) -> StoreResult<Option<EmailToken>> {
        Ok(self
            .lock()?
            .email_tokens
            .get(token_hash)
            .filter(|t| t.purpose == purpose.as_str())
            .cloned())
    }

    async fn mark_email_token_used(&self, token_id: Uuid, now: DateTime<Utc>) -> StoreResult<bool> {
        let mut data = self.lock()?;
        match data
            .email_tokens
            .values_mut()
            .find(|t| t.id == token_id && t.used_at.is_none())
        {
            Some(token) => {
                token.used_at = Some(now);
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

#[async_trait]
impl SchemaRepo for MemoryTenantStore {
    async fn sync_user_fields(&self, fields: &[UserFieldDef]) -> StoreResult<()> {
        self.lock()?.user_fields = fields.to_vec();
        Ok(())
    }

    async fn health_check(&self) -> StoreResult<()> {
        self.lock().map(|_| ())
    }
}

/// One [`MemoryTenantStore`] per tenant.
#[derive(Default)]
pub struct MemoryStores {
    stores: DashMap<Uuid, Arc<MemoryTenantStore>>,
}

impl MemoryStores {
    pub fn new() -> Self {
        Self::default()
    }

    /// Concrete handle, for tests that need to poke at rows directly.
    pub fn tenant(&self, tenant_id: Uuid) -> Arc<MemoryTenantStore> {
        self.stores
            .entry(tenant_id)
            .or_insert_with(|| Arc::new(MemoryTenantStore::new()))
            .clone()
    }
}

#[async_trait]
impl TenantStores for MemoryStores {
    async fn for_tenant(&self, tenant: &TenantRef) -> StoreResult<Arc<dyn TenantStore>> {
        let store: Arc<dyn TenantStore> = self.tenant(tenant.id);
        Ok(store)
    }

    async fn evict(&self, tenant_id: Uuid) {
        self.stores.remove(&tenant_id);
    }

    async fn health_check(&self) -> StoreResult<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn new_user(email: &str) -> NewUser {
        NewUser {
            email: email.to_string(),
            email_verified: false,
            source_client_id: None,
            custom_fields: serde_json::Map::new(),
        }
    }

    fn new_refresh(user_id: Uuid, hash: &str) -> NewRefreshToken {
        NewRefreshToken {
            client_id: "app".into(),
            user_id,
            token_hash: hash.into(),
            scope: "openid".into(),
            amr: vec!["pwd".into()],
            ttl: Duration::days(1),
            family_id: None,
        }
    }

    #[tokio::test]
    async fn duplicate_email_is_rejected() {
        let store = MemoryTenantStore::new();
        store
            .create_password_user(new_user("u@x"), "$argon2id$h")
            .await
            .unwrap();
        let err = store
            .create_password_user(new_user("u@x"), "$argon2id$h")
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Duplicate("email")));
    }

    #[tokio::test]
    async fn consume_succeeds_exactly_once() {
        let store = MemoryTenantStore::new();
        let now = Utc::now();
        let uid = Uuid::new_v4();
        store.create_refresh(new_refresh(uid, "h1"), now).await.unwrap();

        assert!(store.consume_refresh("h1", now).await.unwrap().is_some());
        assert!(store.consume_refresh("h1", now).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn rotation_keeps_family_and_detects_reuse() {
        let store = MemoryTenantStore::new();
        let now = Utc::now();
        let uid = Uuid::new_v4();
        let first = store.create_refresh(new_refresh(uid, "h1"), now).await.unwrap();

        let outcome = store
            .rotate_refresh("h1", new_refresh(uid, "h2"), now)
            .await
            .unwrap();
        let current = match outcome {
            RotateOutcome::Rotated { current, previous } => {
                assert!(previous.revoked_at.is_some());
                current
            }
            other => panic!("unexpected outcome {:?}", other),
        };
        assert_eq!(current.family_id, first.family_id);

        match store
            .rotate_refresh("h1", new_refresh(uid, "h3"), now)
            .await
            .unwrap()
        {
            RotateOutcome::Reused { family_id, .. } => assert_eq!(family_id, first.family_id),
            other => panic!("unexpected outcome {:?}", other),
        }
    }

    #[tokio::test]
    async fn totp_replay_guard_is_monotonic() {
        let store = MemoryTenantStore::new();
        let uid = Uuid::new_v4();
        store.upsert_unconfirmed_totp(uid, "v1:x").await.unwrap();
        let t = Utc::now();
        assert!(store.advance_totp_last_used(uid, t).await.unwrap());
        assert!(!store.advance_totp_last_used(uid, t).await.unwrap());
        assert!(!store
            .advance_totp_last_used(uid, t - Duration::seconds(30))
            .await
            .unwrap());
        assert!(store
            .advance_totp_last_used(uid, t + Duration::seconds(30))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn consent_upsert_is_a_union() {
        let store = MemoryTenantStore::new();
        let uid = Uuid::new_v4();
        let now = Utc::now();
        store
            .upsert_consent(uid, "app", &["openid".into(), "email".into()], now)
            .await
            .unwrap();
        let consent = store
            .upsert_consent(uid, "app", &["profile".into()], now)
            .await
            .unwrap();
        assert_eq!(consent.scopes_granted, vec!["openid", "email", "profile"]);
    }
}
