//! Per-tenant datastore.
//!
//! Every backend implements the full set of repository traits, so a missing
//! capability is a compile error rather than a runtime surprise.

mod memory;
mod postgres;

pub use memory::{MemoryStores, MemoryTenantStore};
pub use postgres::{PgStores, PgTenantStore};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use thiserror::Error;
use uuid::Uuid;

use crate::models::{
    Consent, EmailToken, EmailTokenPurpose, Identity, MfaTotp, NewRefreshToken, NewUser,
    RefreshToken, RotateOutcome, TenantRef, User, UserFieldDef,
};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Duplicate {0}")]
    Duplicate(&'static str),

    #[error("Not found: {0}")]
    NotFound(&'static str),

    /// A schema lock could not be taken in time.
    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Internal store error: {0}")]
    Internal(#[from] anyhow::Error),
}

pub type StoreResult<T> = Result<T, StoreError>;

#[async_trait]
pub trait UserRepo: Send + Sync {
    async fn get_user_by_id(&self, user_id: Uuid) -> StoreResult<Option<User>>;

    /// `email` must already be normalized. Returns the password identity when
    /// the user has one.
    async fn get_user_by_email(&self, email: &str)
        -> StoreResult<Option<(User, Option<Identity>)>>;

    async fn set_email_verified(&self, user_id: Uuid) -> StoreResult<()>;

    async fn update_password_hash(&self, user_id: Uuid, phc_hash: &str) -> StoreResult<()>;

    async fn set_disabled(
        &self,
        user_id: Uuid,
        disabled_at: Option<DateTime<Utc>>,
        disabled_until: Option<DateTime<Utc>>,
    ) -> StoreResult<()>;
}

#[async_trait]
pub trait IdentityRepo: Send + Sync {
    /// Creates the user and its password identity atomically.
    async fn create_password_user(&self, new_user: NewUser, phc_hash: &str) -> StoreResult<User>;

    /// Creates the user and its social identity atomically.
    async fn create_social_user(
        &self,
        new_user: NewUser,
        provider: &str,
        provider_user_id: &str,
    ) -> StoreResult<User>;

    async fn find_identity(
        &self,
        provider: &str,
        provider_user_id: &str,
    ) -> StoreResult<Option<Identity>>;

    async fn link_identity(
        &self,
        user_id: Uuid,
        provider: &str,
        provider_user_id: &str,
        email: &str,
    ) -> StoreResult<Identity>;

    async fn list_identities(&self, user_id: Uuid) -> StoreResult<Vec<Identity>>;
}

#[async_trait]
pub trait RefreshRepo: Send + Sync {
    async fn create_refresh(&self, new: NewRefreshToken, now: DateTime<Utc>)
        -> StoreResult<RefreshToken>;

    async fn get_refresh_by_hash(&self, token_hash: &str) -> StoreResult<Option<RefreshToken>>;

    /// Atomically marks an active token revoked. `None` when it was not active.
    async fn consume_refresh(
        &self,
        token_hash: &str,
        now: DateTime<Utc>,
    ) -> StoreResult<Option<RefreshToken>>;

    /// Revokes `old_hash` and inserts `new` in the same transaction. `new`
    /// inherits the old token's family.
    async fn rotate_refresh(
        &self,
        old_hash: &str,
        new: NewRefreshToken,
        now: DateTime<Utc>,
    ) -> StoreResult<RotateOutcome>;

    async fn revoke_refresh_family(&self, family_id: Uuid, now: DateTime<Utc>)
        -> StoreResult<u64>;

    async fn revoke_all_refresh_by_user(&self, user_id: Uuid, now: DateTime<Utc>)
        -> StoreResult<u64>;

    async fn revoke_refresh_by_user_client(
        &self,
        user_id: Uuid,
        client_id: &str,
        now: DateTime<Utc>,
    ) -> StoreResult<u64>;
}

#[async_trait]
pub trait MfaRepo: Send + Sync {
    async fn get_totp(&self, user_id: Uuid) -> StoreResult<Option<MfaTotp>>;

    /// Replaces an unconfirmed enrollment. Never touches a confirmed one.
    async fn upsert_unconfirmed_totp(&self, user_id: Uuid, secret_encrypted: &str)
        -> StoreResult<()>;

    /// Returns true only for the call that flips `confirmed_at`.
    async fn confirm_totp(&self, user_id: Uuid, at: DateTime<Utc>) -> StoreResult<bool>;

    /// Compare-and-set of the replay guard: succeeds only when `step_start` is
    /// strictly later than the stored value.
    async fn advance_totp_last_used(
        &self,
        user_id: Uuid,
        step_start: DateTime<Utc>,
    ) -> StoreResult<bool>;

    async fn delete_totp(&self, user_id: Uuid) -> StoreResult<()>;

    async fn replace_recovery_codes(&self, user_id: Uuid, code_hashes: &[String])
        -> StoreResult<()>;

    async fn has_unused_recovery_code(&self, user_id: Uuid, code_hash: &str)
        -> StoreResult<bool>;

    /// Atomically marks one unused code consumed.
    async fn consume_recovery_code(
        &self,
        user_id: Uuid,
        code_hash: &str,
        now: DateTime<Utc>,
    ) -> StoreResult<bool>;

    async fn count_unused_recovery_codes(&self, user_id: Uuid) -> StoreResult<u64>;
}

#[async_trait]
pub trait TrustedDeviceRepo: Send + Sync {
    async fn add_trusted_device(
        &self,
        user_id: Uuid,
        device_hash: &str,
        expires_at: DateTime<Utc>,
    ) -> StoreResult<()>;

    async fn is_trusted_device(
        &self,
        user_id: Uuid,
        device_hash: &str,
        now: DateTime<Utc>,
    ) -> StoreResult<bool>;

    async fn delete_trusted_devices(&self, user_id: Uuid) -> StoreResult<()>;
}

#[async_trait]
pub trait ConsentRepo: Send + Sync {
    async fn get_consent(&self, user_id: Uuid, client_id: &str) -> StoreResult<Option<Consent>>;

    /// Union with what was granted before; clears a previous revoke.
    async fn upsert_consent(
        &self,
        user_id: Uuid,
        client_id: &str,
        scopes: &[String],
        now: DateTime<Utc>,
    ) -> StoreResult<Consent>;

    async fn revoke_consent(
        &self,
        user_id: Uuid,
        client_id: &str,
        now: DateTime<Utc>,
    ) -> StoreResult<()>;
}

#[async_trait]
pub trait EmailTokenRepo: Send + Sync {
    async fn create_email_token(
        &self,
        user_id: Uuid,
        purpose: EmailTokenPurpose,
        token_hash: &str,
        expires_at: DateTime<Utc>,
    ) -> StoreResult<EmailToken>;

    async fn get_email_token(
        &self,
        token_hash: &str,
        purpose: EmailTokenPurpose,
    ) -> StoreResult<Option<EmailToken>>;

    /// Conditional on `used_at IS NULL`. Returns whether this call marked it.
    async fn mark_email_token_used(&self, token_id: Uuid, now: DateTime<Utc>)
        -> StoreResult<bool>;
}

#[async_trait]
pub trait SchemaRepo: Send + Sync {
    /// Brings custom-field indexes in line with the tenant's declared fields.
    /// Holds the tenant's schema lock for the duration.
    async fn sync_user_fields(&self, fields: &[UserFieldDef]) -> StoreResult<()>;

    async fn health_check(&self) -> StoreResult<()>;
}

pub trait TenantStore:
    UserRepo
    + IdentityRepo
    + RefreshRepo
    + MfaRepo
    + TrustedDeviceRepo
    + ConsentRepo
    + EmailTokenRepo
    + SchemaRepo
{
}

impl<T> TenantStore for T where
    T: UserRepo
        + IdentityRepo
        + RefreshRepo
        + MfaRepo
        + TrustedDeviceRepo
        + ConsentRepo
        + EmailTokenRepo
        + SchemaRepo
{
}

/// Hands out the datastore of a resolved tenant, opening it on first use.
#[async_trait]
pub trait TenantStores: Send + Sync {
    async fn for_tenant(&self, tenant: &TenantRef) -> StoreResult<Arc<dyn TenantStore>>;

    /// Drops a tenant's pool, e.g. after the tenant was deleted.
    async fn evict(&self, tenant_id: Uuid);

    /// Probes every datastore opened so far.
    async fn health_check(&self) -> StoreResult<()>;
}
