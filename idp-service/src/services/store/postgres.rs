//! PostgreSQL tenant datastore.
//!
//! Each tenant gets its own bounded pool, opened on first use. The DSN
//! template either names a per-tenant database through a `{tenant}`
//! placeholder, or points at a shared database in which case the tenant lives
//! in schema `t_<slug>`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use secrecy::{ExposeSecret, SecretString};
use sqlx::pool::PoolConnection;
use sqlx::postgres::{PgConnectOptions, PgConnection, PgPool, PgPoolOptions, Postgres};
use sqlx::types::Json;
use sqlx::Executor;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::OnceCell;
use uuid::Uuid;

use super::{
    ConsentRepo, EmailTokenRepo, IdentityRepo, MfaRepo, RefreshRepo, SchemaRepo, StoreError,
    StoreResult, TenantStore, TenantStores, TrustedDeviceRepo, UserRepo,
};
use crate::models::{
    Consent, EmailToken, EmailTokenPurpose, IdentProvider, Identity, MfaTotp, NewRefreshToken,
    NewUser, RefreshToken, RotateOutcome, TenantRef, User, UserFieldDef,
};

/// Upper bound on waiting for the tenant's schema lock.
pub const SCHEMA_LOCK_TIMEOUT: Duration = Duration::from_secs(10);
const SCHEMA_LOCK_POLL: Duration = Duration::from_millis(200);
const CUSTOM_FIELD_INDEX_PREFIX: &str = "users_cf_";

const BOOTSTRAP_DDL: &str = r#"
CREATE TABLE IF NOT EXISTS users (
    id UUID PRIMARY KEY,
    email TEXT NOT NULL UNIQUE,
    email_verified BOOLEAN NOT NULL DEFAULT FALSE,
    disabled_at TIMESTAMPTZ,
    disabled_until TIMESTAMPTZ,
    metadata JSONB NOT NULL DEFAULT '{}'::jsonb,
    custom_fields JSONB NOT NULL DEFAULT '{}'::jsonb,
    source_client_id TEXT,
    created_at TIMESTAMPTZ NOT NULL DEFAULT now()
);

CREATE TABLE IF NOT EXISTS identities (
    id UUID PRIMARY KEY,
    user_id UUID NOT NULL REFERENCES users(id) ON DELETE CASCADE,
    provider TEXT NOT NULL,
    provider_user_id TEXT,
    password_hash TEXT,
    email TEXT,
    created_at TIMESTAMPTZ NOT NULL DEFAULT now()
);
CREATE UNIQUE INDEX IF NOT EXISTS identities_provider_subject
    ON identities (provider, provider_user_id) WHERE provider_user_id IS NOT NULL;
CREATE UNIQUE INDEX IF NOT EXISTS identities_one_password
    ON identities (user_id) WHERE provider = 'password';

CREATE TABLE IF NOT EXISTS refresh_tokens (
    id UUID PRIMARY KEY,
    family_id UUID NOT NULL,
    client_id_text TEXT NOT NULL,
    user_id UUID NOT NULL REFERENCES users(id) ON DELETE CASCADE,
    token_hash TEXT NOT NULL UNIQUE,
    scope TEXT NOT NULL DEFAULT '',
    amr TEXT[] NOT NULL DEFAULT '{}',
    issued_at TIMESTAMPTZ NOT NULL,
    expires_at TIMESTAMPTZ NOT NULL,
    revoked_at TIMESTAMPTZ
);
CREATE INDEX IF NOT EXISTS refresh_tokens_user ON refresh_tokens (user_id);
CREATE INDEX IF NOT EXISTS refresh_tokens_family ON refresh_tokens (family_id);

CREATE TABLE IF NOT EXISTS mfa_totp (
    user_id UUID PRIMARY KEY REFERENCES users(id) ON DELETE CASCADE,
    secret_encrypted TEXT NOT NULL,
    confirmed_at TIMESTAMPTZ,
    last_used_at TIMESTAMPTZ,
    created_at TIMESTAMPTZ NOT NULL DEFAULT now()
);

CREATE TABLE IF NOT EXISTS mfa_recovery_codes (
    id UUID PRIMARY KEY,
    user_id UUID NOT NULL REFERENCES users(id) ON DELETE CASCADE,
    code_hash TEXT NOT NULL,
    used_at TIMESTAMPTZ,
    created_at TIMESTAMPTZ NOT NULL DEFAULT now()
);
CREATE INDEX IF NOT EXISTS mfa_recovery_codes_user ON mfa_recovery_codes (user_id);

CREATE TABLE IF NOT EXISTS trusted_devices (
    user_id UUID NOT NULL REFERENCES users(id) ON DELETE CASCADE,
    device_hash TEXT NOT NULL,
    expires_at TIMESTAMPTZ NOT NULL,
    created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
    PRIMARY KEY (user_id, device_hash)
);

CREATE TABLE IF NOT EXISTS consents (
    user_id UUID NOT NULL REFERENCES users(id) ON DELETE CASCADE,
    client_id TEXT NOT NULL,
    scopes_granted TEXT[] NOT NULL DEFAULT '{}',
    granted_at TIMESTAMPTZ NOT NULL,
    updated_at TIMESTAMPTZ NOT NULL,
    revoked_at TIMESTAMPTZ,
    PRIMARY KEY (user_id, client_id)
);

CREATE TABLE IF NOT EXISTS email_tokens (
    id UUID PRIMARY KEY,
    user_id UUID NOT NULL REFERENCES users(id) ON DELETE CASCADE,
    purpose TEXT NOT NULL,
    token_hash TEXT NOT NULL UNIQUE,
    expires_at TIMESTAMPTZ NOT NULL,
    used_at TIMESTAMPTZ,
    created_at TIMESTAMPTZ NOT NULL DEFAULT now()
);
"#;

const USER_COLUMNS: &str = "id, email, email_verified, disabled_at, disabled_until, metadata, \
                            custom_fields, source_client_id, created_at";
const REFRESH_COLUMNS: &str = "id, family_id, client_id_text, user_id, token_hash, scope, amr, \
                               issued_at, expires_at, revoked_at";

/// Maps a unique violation to [`StoreError::Duplicate`].
fn unique_as(what: &'static str) -> impl FnOnce(sqlx::Error) -> StoreError {
    move |e| match &e {
        sqlx::Error::Database(db) if db.is_unique_violation() => StoreError::Duplicate(what),
        _ => StoreError::Database(e),
    }
}

/// Advisory lock key derived from the tenant id.
fn schema_lock_key(tenant_id: Uuid) -> i64 {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&tenant_id.as_bytes()[..8]);
    i64::from_be_bytes(bytes)
}

/// `t_<slug>` with dashes folded to underscores.
pub fn schema_name(slug: &str) -> String {
    format!("t_{}", slug.replace('-', "_"))
}

#[derive(Clone)]
pub struct PgTenantStore {
    pool: PgPool,
    tenant_id: Uuid,
    /// Set when the tenant shares a database with others.
    schema: Option<String>,
}

impl PgTenantStore {
    pub fn new(pool: PgPool, tenant_id: Uuid, schema: Option<String>) -> Self {
        Self {
            pool,
            tenant_id,
            schema,
        }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Takes the tenant's advisory lock on a dedicated connection. Gives up
    /// with [`StoreError::Conflict`] after [`SCHEMA_LOCK_TIMEOUT`].
    async fn lock_schema(&self) -> StoreResult<PoolConnection<Postgres>> {
        let key = schema_lock_key(self.tenant_id);
        let mut conn = self.pool.acquire().await?;
        let deadline = tokio::time::Instant::now() + SCHEMA_LOCK_TIMEOUT;

        loop {
            let locked: bool = sqlx::query_scalar("SELECT pg_try_advisory_lock($1)")
                .bind(key)
                .fetch_one(&mut *conn)
                .await?;
            if locked {
                return Ok(conn);
            }
            if tokio::time::Instant::now() >= deadline {
                tracing::warn!(tenant_id = %self.tenant_id, "schema lock timed out");
                return Err(StoreError::Conflict(
                    "tenant schema is being modified".to_string(),
                ));
            }
            tokio::time::sleep(SCHEMA_LOCK_POLL).await;
        }
    }

    async fn unlock_schema(&self, mut conn: PoolConnection<Postgres>) {
        if let Err(e) = sqlx::query("SELECT pg_advisory_unlock($1)")
            .bind(schema_lock_key(self.tenant_id))
            .execute(&mut *conn)
            .await
        {
            tracing::error!(tenant_id = %self.tenant_id, error = %e, "failed to release schema lock");
            // The lock is session-scoped; dropping the connection frees it.
            conn.detach();
        }
    }

    /// Creates the tenant's tables if missing and brings custom-field indexes
    /// up to date.
    pub async fn bootstrap(&self, fields: &[UserFieldDef]) -> StoreResult<()> {
        let mut conn = self.lock_schema().await?;
        let result = create_schema(&mut conn, self.schema.as_deref(), fields).await;
        self.unlock_schema(conn).await;
        result?;
        tracing::info!(tenant_id = %self.tenant_id, "tenant schema ready");
        Ok(())
    }
}

async fn create_schema(
    conn: &mut PgConnection,
    schema: Option<&str>,
    fields: &[UserFieldDef],
) -> StoreResult<()> {
    if let Some(schema) = schema {
        let sql = format!("CREATE SCHEMA IF NOT EXISTS \"{}\"", schema);
        (&mut *conn).execute(sqlx::raw_sql(&sql))
            .await?;
    }
    (&mut *conn).execute(sqlx::raw_sql(BOOTSTRAP_DDL)).await?;
    apply_field_indexes(conn, fields).await
}

async fn apply_field_indexes(
    conn: &mut PgConnection,
    fields: &[UserFieldDef],
) -> StoreResult<()> {
    let existing: Vec<String> = sqlx::query_scalar(
        "SELECT indexname::text FROM pg_indexes \
         WHERE schemaname = current_schema() AND tablename = 'users' AND indexname LIKE $1",
    )
    .bind(format!("{}%", CUSTOM_FIELD_INDEX_PREFIX))
    .fetch_all(&mut *conn)
    .await?;

    let mut wanted = Vec::new();
    for field in fields.iter().filter(|f| f.indexed || f.unique) {
        if !field.is_valid_name() {
            tracing::warn!(field = %field.name, "skipping index for invalid field name");
            continue;
        }
        let name = format!("{}{}", CUSTOM_FIELD_INDEX_PREFIX, field.name);
        let unique = if field.unique { "UNIQUE " } else { "" };
        let sql = format!(
            "CREATE {unique}INDEX IF NOT EXISTS \"{name}\" ON users ((custom_fields->>'{field}'))",
            field = field.name
        );
        (&mut *conn).execute(sqlx::raw_sql(&sql))
        .await?;
        wanted.push(name);
    }

    for stale in existing.iter().filter(|n| !wanted.contains(n)) {
        let sql = format!("DROP INDEX IF EXISTS \"{}\"", stale);
        (&mut *conn).execute(sqlx::raw_sql(&sql))
            .await?;
    }
    Ok(())
}

#[async_trait]
impl UserRepo for PgTenantStore {
    async fn get_user_by_id(&self, user_id: Uuid) -> StoreResult<Option<User>> {
        let user = sqlx::query_as::<_, User>(&format!(
            "SELECT {} FROM users WHERE id = $1",
            USER_COLUMNS
        ))
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(user)
    }

    async fn get_user_by_email(
        &self,
        email: &str,
    ) -> StoreResult<Option<(User, Option<Identity>)>> {
        let Some(user) = sqlx::query_as::<_, User>(&format!(
            "SELECT {} FROM users WHERE email = $1",
            USER_COLUMNS
        ))
        .bind(email)
        .fetch_optional(&self.pool)
        .await?
        else {
            return Ok(None);
        };

        let identity = sqlx::query_as::<_, Identity>(
            "SELECT * FROM identities WHERE user_id = $1 AND provider = $2",
        )
        .bind(user.id)
        .bind(IdentProvider::Password.as_str())
        .fetch_optional(&self.pool)
        .await?;
        Ok(Some((user, identity)))
    }

    async fn set_email_verified(&self, user_id: Uuid) -> StoreResult<()> {
        let result = sqlx::query("UPDATE users SET email_verified = TRUE WHERE id = $1")
            .bind(user_id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound("user"));
        }
        Ok(())
    }

    async fn update_password_hash(&self, user_id: Uuid, phc_hash: &str) -> StoreResult<()> {
        let mut tx = self.pool.begin().await?;
        let updated = sqlx::query(
            "UPDATE identities SET password_hash = $2 WHERE user_id = $1 AND provider = $3",
        )
        .bind(user_id)
        .bind(phc_hash)
        .bind(IdentProvider::Password.as_str())
        .execute(&mut *tx)
        .await?;

        if updated.rows_affected() == 0 {
            // Social-only account setting its first password.
            let inserted = sqlx::query(
                "INSERT INTO identities (id, user_id, provider, password_hash, email, created_at) \
                 SELECT $1, id, $3, $4, email, now() FROM users WHERE id = $2",
            )
            .bind(Uuid::new_v4())
            .bind(user_id)
            .bind(IdentProvider::Password.as_str())
            .bind(phc_hash)
            .execute(&mut *tx)
            .await?;
            if inserted.rows_affected() == 0 {
                return Err(StoreError::NotFound("user"));
            }
        }
        tx.commit().await?;
        Ok(())
    }

    async fn set_disabled(
        &self,
        user_id: Uuid,
        disabled_at: Option<DateTime<Utc>>,
        disabled_until: Option<DateTime<Utc>>,
    ) -> StoreResult<()> {
        sqlx::query("UPDATE users SET disabled_at = $2, disabled_until = $3 WHERE id = $1")
            .bind(user_id)
            .bind(disabled_at)
            .bind(disabled_until)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

impl PgTenantStore {
    async fn insert_user(
        tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
        new_user: NewUser,
    ) -> StoreResult<User> {
        let user = sqlx::query_as::<_, User>(&format!(
            "INSERT INTO users (id, email, email_verified, custom_fields, source_client_id, created_at) \
             VALUES ($1, $2, $3, $4, $5, now()) RETURNING {}",
            USER_COLUMNS
        ))
        .bind(Uuid::new_v4())
        .bind(&new_user.email)
        .bind(new_user.email_verified)
        .bind(Json(&new_user.custom_fields))
        .bind(&new_user.source_client_id)
        .fetch_one(&mut **tx)
        .await
        .map_err(unique_as("email"))?;
        Ok(user)
    }
}

#[async_trait]
impl IdentityRepo for PgTenantStore {
    async fn create_password_user(&self, new_user: NewUser, phc_hash: &str) -> StoreResult<User> {
        let mut tx = self.pool.begin().await?;
        let user = Self::insert_user(&mut tx, new_user).await?;
        let identity = Identity::new_password(user.id, phc_hash.to_string(), &user.email);
        sqlx::query(
            "INSERT INTO identities (id, user_id, provider, password_hash, email, created_at) \
             VALUES ($1, $2, $3, $4, $5, $6)",
        )
        .bind(identity.id)
        .bind(identity.user_id)
        .bind(&identity.provider)
        .bind(&identity.password_hash)
        .bind(&identity.email)
        .bind(identity.created_at)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(user)
    }

    async fn create_social_user(
        &self,
        new_user: NewUser,
        provider: &str,
        provider_user_id: &str,
    ) -> StoreResult<User> {
        let mut tx = self.pool.begin().await?;
        let user = Self::insert_user(&mut tx, new_user).await?;
        sqlx::query(
            "INSERT INTO identities (id, user_id, provider, provider_user_id, email, created_at) \
             VALUES ($1, $2, $3, $4, $5, now())",
        )
        .bind(Uuid::new_v4())
        .bind(user.id)
        .bind(provider)
        .bind(provider_user_id)
        .bind(&user.email)
        .execute(&mut *tx)
        .await
        .map_err(unique_as("identity"))?;
        tx.commit().await?;
        Ok(user)
    }

    async fn find_identity(
        &self,
        provider: &str,
        provider_user_id: &str,
    ) -> StoreResult<Option<Identity>> {
        let identity = sqlx::query_as::<_, Identity>(
            "SELECT * FROM identities WHERE provider = $1 AND provider_user_id = $2",
        )
        .bind(provider)
        .bind(provider_user_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(identity)
    }

    async fn link_identity(
        &self,
        user_id: Uuid,
        provider: &str,
        provider_user_id: &str,
        email: &str,
    ) -> StoreResult<Identity> {
        let identity = Identity::new_social(user_id, provider, provider_user_id, email);
        sqlx::query(
            "INSERT INTO identities (id, user_id, provider, provider_user_id, email, created_at) \
             VALUES ($1, $2, $3, $4, $5, $6)",
        )
        .bind(identity.id)
        .bind(identity.user_id)
        .bind(&identity.provider)
        .bind(&identity.provider_user_id)
        .bind(&identity.email)
        .bind(identity.created_at)
        .execute(&self.pool)
        .await
        .map_err(unique_as("identity"))?;
        Ok(identity)
    }

    async fn list_identities(&self, user_id: Uuid) -> StoreResult<Vec<Identity>> {
        let identities = sqlx::query_as::<_, Identity>(
            "SELECT * FROM identities WHERE user_id = $1 ORDER BY created_at",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(identities)
    }
}

async fn insert_refresh<'e, E>(executor: E, token: &RefreshToken) -> StoreResult<()>
where
    E: sqlx::PgExecutor<'e>,
{
    sqlx::query(
        "INSERT INTO refresh_tokens \
         (id, family_id, client_id_text, user_id, token_hash, scope, amr, issued_at, expires_at) \
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)",
    )
    .bind(token.id)
    .bind(token.family_id)
    .bind(&token.client_id_text)
    .bind(token.user_id)
    .bind(&token.token_hash)
    .bind(&token.scope)
    .bind(&token.amr)
    .bind(token.issued_at)
    .bind(token.expires_at)
    .execute(executor)
    .await
    .map_err(unique_as("refresh token"))?;
    Ok(())
}

#[async_trait]
impl RefreshRepo for PgTenantStore {
    async fn create_refresh(
        &self,
        new: NewRefreshToken,
        now: DateTime<Utc>,
    ) -> StoreResult<RefreshToken> {
        let token = RefreshToken::new(new, now);
        insert_refresh(&self.pool, &token).await?;
        Ok(token)
    }

    async fn get_refresh_by_hash(&self, token_hash: &str) -> StoreResult<Option<RefreshToken>> {
        let token = sqlx::query_as::<_, RefreshToken>(&format!(
            "SELECT {} FROM refresh_tokens WHERE token_hash = $1",
            REFRESH_COLUMNS
        ))
        .bind(token_hash)
        .fetch_optional(&self.pool)
        .await?;
        Ok(token)
    }

    async fn consume_refresh(
        &self,
        token_hash: &str,
        now: DateTime<Utc>,
    ) -> StoreResult<Option<RefreshToken>> {
        let token = sqlx::query_as::<_, RefreshToken>(&format!(
            "UPDATE refresh_tokens SET revoked_at = $2 \
             WHERE token_hash = $1 AND revoked_at IS NULL AND expires_at > $2 \
             RETURNING {}",
            REFRESH_COLUMNS
        ))
        .bind(token_hash)
        .bind(now)
        .fetch_optional(&self.pool)
        .await?;
        Ok(token)
    }

    async fn rotate_refresh(
        &self,
        old_hash: &str,
        mut new: NewRefreshToken,
        now: DateTime<Utc>,
    ) -> StoreResult<RotateOutcome> {
        let mut tx = self.pool.begin().await?;

        let Some(mut old) = sqlx::query_as::<_, RefreshToken>(&format!(
            "SELECT {} FROM refresh_tokens WHERE token_hash = $1 FOR UPDATE",
            REFRESH_COLUMNS
        ))
        .bind(old_hash)
        .fetch_optional(&mut *tx)
        .await?
        else {
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

        sqlx::query("UPDATE refresh_tokens SET revoked_at = $2 WHERE id = $1")
            .bind(old.id)
            .bind(now)
            .execute(&mut *tx)
            .await?;
        old.revoked_at = Some(now);

        new.family_id = Some(old.family_id);
        let current = RefreshToken::new(new, now);
        insert_refresh(&mut *tx, &current).await?;

        tx.commit().await?;
        Ok(RotateOutcome::Rotated {
            previous: old,
            current,
        })
    }

    async fn revoke_refresh_family(
        &self,
        family_id: Uuid,
        now: DateTime<Utc>,
    ) -> StoreResult<u64> {
        let result = sqlx::query(
            "UPDATE refresh_tokens SET revoked_at = $2 WHERE family_id = $1 AND revoked_at IS NULL",
        )
        .bind(family_id)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn revoke_all_refresh_by_user(
        &self,
        user_id: Uuid,
        now: DateTime<Utc>,
    ) -> StoreResult<u64> {
        let result = sqlx::query(
            "UPDATE refresh_tokens SET revoked_at = $2 WHERE user_id = $1 AND revoked_at IS NULL",
        )
        .bind(user_id)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn revoke_refresh_by_user_client(
        &self,
        user_id: Uuid,
        client_id: &str,
        now: DateTime<Utc>,
    ) -> StoreResult<u64> {
        let result = sqlx::query(
            "UPDATE refresh_tokens SET revoked_at = $3 \
             WHERE user_id = $1 AND client_id_text = $2 AND revoked_at IS NULL",
        )
        .bind(user_id)
        .bind(client_id)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }
}

#[async_trait]
impl MfaRepo for PgTenantStore {
    async fn get_totp(&self, user_id: Uuid) -> StoreResult<Option<MfaTotp>> {
        let totp = sqlx::query_as::<_, MfaTotp>("SELECT * FROM mfa_totp WHERE user_id = $1")
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(totp)
    }

    async fn upsert_unconfirmed_totp(
        &self,
        user_id: Uuid,
        secret_encrypted: &str,
    ) -> StoreResult<()> {
        let result = sqlx::query(
            "INSERT INTO mfa_totp (user_id, secret_encrypted, created_at) VALUES ($1, $2, now()) \
             ON CONFLICT (user_id) DO UPDATE \
               SET secret_encrypted = EXCLUDED.secret_encrypted, last_used_at = NULL, created_at = now() \
               WHERE mfa_totp.confirmed_at IS NULL",
        )
        .bind(user_id)
        .bind(secret_encrypted)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::Duplicate("confirmed totp"));
        }
        Ok(())
    }

    async fn confirm_totp(&self, user_id: Uuid, at: DateTime<Utc>) -> StoreResult<bool> {
        let result = sqlx::query(
            "UPDATE mfa_totp SET confirmed_at = $2 WHERE user_id = $1 AND confirmed_at IS NULL",
        )
        .bind(user_id)
        .bind(at)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn advance_totp_last_used(
        &self,
        user_id: Uuid,
        step_start: DateTime<Utc>,
    ) -> StoreResult<bool> {
        let result = sqlx::query(
            "UPDATE mfa_totp SET last_used_at = $2 \
             WHERE user_id = $1 AND (last_used_at IS NULL OR last_used_at < $2)",
        )
        .bind(user_id)
        .bind(step_start)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn delete_totp(&self, user_id: Uuid) -> StoreResult<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM mfa_recovery_codes WHERE user_id = $1")
            .bind(user_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM mfa_totp WHERE user_id = $1")
            .bind(user_id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn replace_recovery_codes(
        &self,
        user_id: Uuid,
        code_hashes: &[String],
    ) -> StoreResult<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM mfa_recovery_codes WHERE user_id = $1")
            .bind(user_id)
            .execute(&mut *tx)
            .await?;
        for hash in code_hashes {
            sqlx::query(
                "INSERT INTO mfa_recovery_codes (id, user_id, code_hash, created_at) \
                 VALUES ($1, $2, $3, now())",
            )
            .bind(Uuid::new_v4())
            .bind(user_id)
            .bind(hash)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn has_unused_recovery_code(
        &self,
        user_id: Uuid,
        code_hash: &str,
    ) -> StoreResult<bool> {
        let found: bool = sqlx::query_scalar(
            "SELECT EXISTS (SELECT 1 FROM mfa_recovery_codes \
             WHERE user_id = $1 AND code_hash = $2 AND used_at IS NULL)",
        )
        .bind(user_id)
        .bind(code_hash)
        .fetch_one(&self.pool)
        .await?;
        Ok(found)
    }

    async fn consume_recovery_code(
        &self,
        user_id: Uuid,
        code_hash: &str,
        now: DateTime<Utc>,
    ) -> StoreResult<bool> {
        let result = sqlx::query(
            "UPDATE mfa_recovery_codes SET used_at = $3 \
             WHERE id = (SELECT id FROM mfa_recovery_codes \
                         WHERE user_id = $1 AND code_hash = $2 AND used_at IS NULL \
                         LIMIT 1 FOR UPDATE SKIP LOCKED)",
        )
        .bind(user_id)
        .bind(code_hash)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn count_unused_recovery_codes(&self, user_id: Uuid) -> StoreResult<u64> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM mfa_recovery_codes WHERE user_id = $1 AND used_at IS NULL",
        )
        .bind(user_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(count.max(0) as u64)
    }
}

#[async_trait]
impl TrustedDeviceRepo for PgTenantStore {
    async fn add_trusted_device(
        &self,
        user_id: Uuid,
        device_hash: &str,
        expires_at: DateTime<Utc>,
    ) -> StoreResult<()> {
        sqlx::query(
            "INSERT INTO trusted_devices (user_id, device_hash, expires_at, created_at) \
             VALUES ($1, $2, $3, now()) \
             ON CONFLICT (user_id, device_hash) DO UPDATE SET expires_at = EXCLUDED.expires_at",
        )
        .bind(user_id)
        .bind(device_hash)
        .bind(expires_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn is_trusted_device(
        &self,
        user_id: Uuid,
        device_hash: &str,
        now: DateTime<Utc>,
    ) -> StoreResult<bool> {
        let found: Option<i32> = sqlx::query_scalar(
            "SELECT 1 FROM trusted_devices WHERE user_id = $1 AND device_hash = $2 AND expires_at > $3",
        )
        .bind(user_id)
        .bind(device_hash)
        .bind(now)
        .fetch_optional(&self.pool)
        .await?;
        Ok(found.is_some())
    }

    async fn delete_trusted_devices(&self, user_id: Uuid) -> StoreResult<()> {
        sqlx::query("DELETE FROM trusted_devices WHERE user_id = $1")
            .bind(user_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl ConsentRepo for PgTenantStore {
    async fn get_consent(&self, user_id: Uuid, client_id: &str) -> StoreResult<Option<Consent>> {
        let consent = sqlx::query_as::<_, Consent>(
            "SELECT * FROM consents WHERE user_id = $1 AND client_id = $2",
        )
        .bind(user_id)
        .bind(client_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(consent)
    }

    async fn upsert_consent(
        &self,
        user_id: Uuid,
        client_id: &str,
        scopes: &[String],
        now: DateTime<Utc>,
    ) -> StoreResult<Consent> {
        // A revoked grant starts over from the newly approved set.
        let consent = sqlx::query_as::<_, Consent>(
            "INSERT INTO consents (user_id, client_id, scopes_granted, granted_at, updated_at) \
             VALUES ($1, $2, $3, $4, $4) \
             ON CONFLICT (user_id, client_id) DO UPDATE SET \
               scopes_granted = ARRAY( \
                 SELECT s FROM unnest( \
                   CASE WHEN consents.revoked_at IS NULL THEN consents.scopes_granted \
                        ELSE '{}'::text[] END || EXCLUDED.scopes_granted \
                 ) WITH ORDINALITY AS u(s, n) \
                 GROUP BY s ORDER BY MIN(n)), \
               updated_at = EXCLUDED.updated_at, \
               revoked_at = NULL \
             RETURNING *",
        )
        .bind(user_id)
        .bind(client_id)
        .bind(scopes)
        .bind(now)
        .fetch_one(&self.pool)
        .await?;
        Ok(consent)
    }

    async fn revoke_consent(
        &self,
        user_id: Uuid,
        client_id: &str,
        now: DateTime<Utc>,
    ) -> StoreResult<()> {
        sqlx::query("UPDATE consents SET revoked_at = $3 WHERE user_id = $1 AND client_id = $2")
            .bind(user_id)
            .bind(client_id)
            .bind(now)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl EmailTokenRepo for PgTenantStore {
    async fn create_email_token(
        &self,
        user_id: Uuid,
        purpose: EmailTokenPurpose,
        token_hash: &str,
        expires_at: DateTime<Utc>,
    ) -> StoreResult<EmailToken> {
        let token = sqlx::query_as::<_, EmailToken>(
            "INSERT INTO email_tokens (id, user_id, purpose, token_hash, expires_at, created_at) \
             VALUES ($1, $2, $3, $4, $5, now()) RETURNING *",
        )
        .bind(Uuid::new_v4())
        .bind(user_id)
        .bind(purpose.as_str())
        .bind(token_hash)
        .bind(expires_at)
        .fetch_one(&self.pool)
        .await
        .map_err(unique_as("email token"))?;
        Ok(token)
    }

    async fn get_email_token(
        &self,
        token_hash: &str,
        purpose: EmailTokenPurpose,
    ) -> StoreResult<Option<EmailToken>> {
        let token = sqlx::query_as::<_, EmailToken>(
            "SELECT * FROM email_tokens WHERE token_hash = $1 AND purpose = $2",
        )
        .bind(token_hash)
        .bind(purpose.as_str())
        .fetch_optional(&self.pool)
        .await?;
        Ok(token)
    }

    async fn mark_email_token_used(&self, token_id: Uuid, now: DateTime<Utc>) -> StoreResult<bool> {
        let result =
            sqlx::query("UPDATE email_tokens SET used_at = $2 WHERE id = $1 AND used_at IS NULL")
                .bind(token_id)
                .bind(now)
                .execute(&self.pool)
                .await?;
        Ok(result.rows_affected() == 1)
    }
}

#[async_trait]
impl SchemaRepo for PgTenantStore {
    async fn sync_user_fields(&self, fields: &[UserFieldDef]) -> StoreResult<()> {
        let mut conn = self.lock_schema().await?;
        let result = apply_field_indexes(&mut conn, fields).await;
        self.unlock_schema(conn).await;
        result
    }

    async fn health_check(&self) -> StoreResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

type StoreCell = Arc<OnceCell<Arc<PgTenantStore>>>;

/// Lazily opened per-tenant pools.
pub struct PgStores {
    dsn_template: SecretString,
    max_connections: u32,
    stores: DashMap<Uuid, StoreCell>,
}

impl PgStores {
    pub fn new(dsn_template: SecretString, max_connections: u32) -> Self {
        Self {
            dsn_template,
            max_connections,
            stores: DashMap::new(),
        }
    }

    /// Connection options for `slug`, plus the schema when tenants share a
    /// database.
    fn connect_options(&self, slug: &str) -> StoreResult<(PgConnectOptions, Option<String>)> {
        let template = self.dsn_template.expose_secret();
        if template.contains("{tenant}") {
            let dsn = template.replace("{tenant}", slug);
            let options = PgConnectOptions::from_str(&dsn)?;
            return Ok((options, None));
        }
        let schema = schema_name(slug);
        let options = PgConnectOptions::from_str(template)?
            .options([("search_path", schema.as_str())]);
        Ok((options, Some(schema)))
    }

    async fn open(&self, tenant: &TenantRef) -> StoreResult<Arc<PgTenantStore>> {
        let (options, schema) = self.connect_options(&tenant.slug)?;
        let pool = PgPoolOptions::new()
            .max_connections(self.max_connections)
            .min_connections(0)
            .acquire_timeout(Duration::from_secs(5))
            .idle_timeout(Duration::from_secs(600))
            .max_lifetime(Duration::from_secs(1800))
            .connect_with(options)
            .await?;

        let store = PgTenantStore::new(pool, tenant.id, schema);
        store.bootstrap(&tenant.settings.user_fields).await?;
        tracing::info!(tenant = %tenant.slug, "opened tenant datastore");
        Ok(Arc::new(store))
    }
}

#[async_trait]
impl TenantStores for PgStores {
    async fn for_tenant(&self, tenant: &TenantRef) -> StoreResult<Arc<dyn TenantStore>> {
        let cell = self
            .stores
            .entry(tenant.id)
            .or_insert_with(|| Arc::new(OnceCell::new()))
            .clone();
        let store = cell.get_or_try_init(|| self.open(tenant)).await?;
        let store: Arc<dyn TenantStore> = store.clone();
        Ok(store)
    }

    async fn evict(&self, tenant_id: Uuid) {
        if let Some((_, cell)) = self.stores.remove(&tenant_id) {
            if let Some(store) = cell.get() {
                store.pool().close().await;
            }
        }
    }

    async fn health_check(&self) -> StoreResult<()> {
        let stores: Vec<Arc<PgTenantStore>> = self
            .stores
            .iter()
            .filter_map(|entry| entry.value().get().cloned())
            .collect();
        for store in stores {
            SchemaRepo::health_check(store.as_ref()).await?;
        }
        Ok(())
    }
}
