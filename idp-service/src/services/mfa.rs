//! MFA engine: TOTP enrollment and verification with a monotonic replay guard,
//! recovery codes and trusted devices.

use chrono::{DateTime, Duration, TimeZone, Utc};
use rand::Rng;
use std::sync::Arc;
use totp_rs::{Algorithm, Secret, TOTP};
use uuid::Uuid;

use super::crypto::SecretBox;
use super::error::{ServiceError, ServiceResult};
use super::store::{StoreError, TenantStore};
use crate::models::MfaTotp;
use crate::utils::{constant_time_eq, generate_opaque_token, hash_token};

pub const TOTP_DIGITS: usize = 6;
pub const TOTP_STEP_SECS: u64 = 30;
pub const DEFAULT_TOTP_WINDOW: u8 = 1;

pub const RECOVERY_CODE_COUNT: usize = 10;
pub const RECOVERY_CODE_LEN: usize = 10;
/// A-Z without I, L, O, U, then 2-9.
const RECOVERY_ALPHABET: &[u8] = b"ABCDEFGHJKMNPQRSTVWXYZ23456789";

/// Returned once on enrollment. The secret is never shown again.
#[derive(Debug, Clone)]
pub struct TotpEnrollment {
    pub secret_base32: String,
    pub otpauth_url: String,
}

/// Second factor presented by the user.
#[derive(Debug, Clone)]
pub enum MfaFactor {
    Totp(String),
    Recovery(String),
}

pub fn generate_recovery_codes() -> Vec<String> {
    let mut rng = rand::thread_rng();
    (0..RECOVERY_CODE_COUNT)
        .map(|_| {
            (0..RECOVERY_CODE_LEN)
                .map(|_| RECOVERY_ALPHABET[rng.gen_range(0..RECOVERY_ALPHABET.len())] as char)
                .collect()
        })
        .collect()
}

/// Hash of the code as typed, ignoring case, separators and whitespace.
pub fn hash_recovery_code(code: &str) -> String {
    let normalized: String = code
        .chars()
        .filter(|c| !c.is_whitespace() && *c != '-')
        .collect::<String>()
        .to_lowercase();
    hash_token(&normalized)
}

/// Labels end up in an otpauth URL, where `:` separates issuer and account.
fn label(s: &str) -> String {
    s.replace(':', "")
}

fn build_totp(secret: Vec<u8>, issuer: &str, account: &str) -> ServiceResult<TOTP> {
    TOTP::new(
        Algorithm::SHA1,
        TOTP_DIGITS,
        DEFAULT_TOTP_WINDOW,
        TOTP_STEP_SECS,
        secret,
        Some(label(issuer)),
        label(account),
    )
    .map_err(|e| ServiceError::Internal(anyhow::anyhow!("TOTP init error: {}", e)))
}

/// A factor that passed verification. A recovery code is only spent by
/// [`MfaService::spend_factor`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CheckedFactor {
    Totp,
    Recovery(String),
}

pub struct MfaService {
    /// Keyed with the MFA master key only.
    secret_box: Arc<SecretBox>,
    issuer_name: String,
    window: u8,
    trusted_device_ttl: Duration,
}

impl MfaService {
    pub fn new(secret_box: Arc<SecretBox>, issuer_name: &str, trusted_device_ttl: Duration) -> Self {
        Self {
            secret_box,
            issuer_name: issuer_name.to_string(),
            window: DEFAULT_TOTP_WINDOW,
            trusted_device_ttl,
        }
    }

    pub fn with_window(mut self, window: u8) -> Self {
        self.window = window;
        self
    }

    pub fn trusted_device_ttl(&self) -> Duration {
        self.trusted_device_ttl
    }

    /// MFA is required once a TOTP enrollment is confirmed.
    pub async fn is_enrolled(&self, store: &dyn TenantStore, user_id: Uuid) -> ServiceResult<bool> {
        Ok(store
            .get_totp(user_id)
            .await?
            .is_some_and(|t| t.is_confirmed()))
    }

    /// Starts (or restarts) an unconfirmed enrollment.
    #[tracing::instrument(skip(self, store, account))]
    pub async fn enroll(
        &self,
        store: &dyn TenantStore,
        user_id: Uuid,
        account: &str,
    ) -> ServiceResult<TotpEnrollment> {
        if self.is_enrolled(store, user_id).await? {
            return Err(ServiceError::MfaAlreadyEnrolled);
        }

        let secret = Secret::generate_secret()
            .to_bytes()
            .map_err(|e| ServiceError::Internal(anyhow::anyhow!("Secret gen error: {}", e)))?;
        let totp = build_totp(secret, &self.issuer_name, account)?;
        let secret_base32 = totp.get_secret_base32();
        let sealed = self.secret_box.seal_str(&secret_base32)?;

        match store.upsert_unconfirmed_totp(user_id, &sealed).await {
            Ok(()) => {}
            Err(StoreError::Duplicate(_)) => return Err(ServiceError::MfaAlreadyEnrolled),
            Err(e) => return Err(e.into()),
        }

        Ok(TotpEnrollment {
            otpauth_url: totp.get_url(),
            secret_base32,
        })
    }

    /// Confirms an enrollment with a first valid code. The first confirmation
    /// returns fresh recovery codes; confirming again returns `None` and leaves
    /// the existing codes alone.
    #[tracing::instrument(skip(self, store, code))]
    pub async fn confirm(
        &self,
        store: &dyn TenantStore,
        user_id: Uuid,
        code: &str,
        now: DateTime<Utc>,
    ) -> ServiceResult<Option<Vec<String>>> {
        let record = store
            .get_totp(user_id)
            .await?
            .ok_or(ServiceError::MfaNotEnrolled)?;
        self.check_code(store, &record, code, now).await?;

        if !store.confirm_totp(user_id, now).await? {
            return Ok(None);
        }
        let codes = self.issue_recovery_codes(store, user_id).await?;
        tracing::info!(%user_id, "TOTP enrollment confirmed");
        Ok(Some(codes))
    }

    /// Verifies a second factor against a confirmed enrollment.
    pub async fn verify_factor(
        &self,
        store: &dyn TenantStore,
        user_id: Uuid,
        factor: &MfaFactor,
        now: DateTime<Utc>,
    ) -> ServiceResult<()> {
        let checked = self.check_factor(store, user_id, factor, now).await?;
        self.spend_factor(store, user_id, checked, now).await
    }

    /// Verifies a factor but leaves a recovery code unspent until
    /// [`MfaService::spend_factor`]. TOTP codes are spent here.
    pub async fn check_factor(
        &self,
        store: &dyn TenantStore,
        user_id: Uuid,
        factor: &MfaFactor,
        now: DateTime<Utc>,
    ) -> ServiceResult<CheckedFactor> {
        match factor {
            MfaFactor::Totp(code) => {
                let record = store
                    .get_totp(user_id)
                    .await?
                    .filter(MfaTotp::is_confirmed)
                    .ok_or(ServiceError::MfaNotEnrolled)?;
                self.check_code(store, &record, code, now).await?;
                Ok(CheckedFactor::Totp)
            }
            MfaFactor::Recovery(code) => {
                let hash = hash_recovery_code(code);
                if store.has_unused_recovery_code(user_id, &hash).await? {
                    Ok(CheckedFactor::Recovery(hash))
                } else {
                    Err(ServiceError::InvalidMfaCode)
                }
            }
        }
    }

    /// Fails with `InvalidMfaCode` when a concurrent request spent the same
    /// recovery code first.
    pub async fn spend_factor(
        &self,
        store: &dyn TenantStore,
        user_id: Uuid,
        checked: CheckedFactor,
        now: DateTime<Utc>,
    ) -> ServiceResult<()> {
        match checked {
            CheckedFactor::Totp => Ok(()),
            CheckedFactor::Recovery(hash) => {
                if store.consume_recovery_code(user_id, &hash, now).await? {
                    tracing::info!(%user_id, "recovery code consumed");
                    Ok(())
                } else {
                    Err(ServiceError::InvalidMfaCode)
                }
            }
        }
    }

    /// Replaces every recovery code. Only for confirmed enrollments.
    pub async fn rotate_recovery_codes(
        &self,
        store: &dyn TenantStore,
        user_id: Uuid,
    ) -> ServiceResult<Vec<String>> {
        if !self.is_enrolled(store, user_id).await? {
            return Err(ServiceError::MfaNotEnrolled);
        }
        self.issue_recovery_codes(store, user_id).await
    }

    /// Removes TOTP, recovery codes and trusted devices after one last valid
    /// factor.
    #[tracing::instrument(skip(self, store, factor))]
    pub async fn disable(
        &self,
        store: &dyn TenantStore,
        user_id: Uuid,
        factor: &MfaFactor,
        now: DateTime<Utc>,
    ) -> ServiceResult<()> {
        self.verify_factor(store, user_id, factor, now).await?;
        store.delete_totp(user_id).await?;
        store.delete_trusted_devices(user_id).await?;
        tracing::info!(%user_id, "MFA disabled");
        Ok(())
    }

    /// Registers a new trusted device. Returns the raw cookie value and its
    /// expiry.
    pub async fn remember_device(
        &self,
        store: &dyn TenantStore,
        user_id: Uuid,
        now: DateTime<Utc>,
    ) -> ServiceResult<(String, DateTime<Utc>)> {
        let raw = generate_opaque_token();
        let expires_at = now + self.trusted_device_ttl;
        store
            .add_trusted_device(user_id, &hash_token(&raw), expires_at)
            .await?;
        Ok((raw, expires_at))
    }

    pub async fn is_trusted_device(
        &self,
        store: &dyn TenantStore,
        user_id: Uuid,
        cookie_value: Option<&str>,
        now: DateTime<Utc>,
    ) -> ServiceResult<bool> {
        match cookie_value.filter(|v| !v.is_empty()) {
            Some(raw) => Ok(store
                .is_trusted_device(user_id, &hash_token(raw), now)
                .await?),
            None => Ok(false),
        }
    }

    async fn issue_recovery_codes(
        &self,
        store: &dyn TenantStore,
        user_id: Uuid,
    ) -> ServiceResult<Vec<String>> {
        let codes = generate_recovery_codes();
        let hashes: Vec<String> = codes.iter().map(|c| hash_recovery_code(c)).collect();
        store.replace_recovery_codes(user_id, &hashes).await?;
        Ok(codes)
    }

    /// Accepts a code within `±window` steps whose step is strictly later than
    /// the last accepted one.
    async fn check_code(
        &self,
        store: &dyn TenantStore,
        record: &MfaTotp,
        code: &str,
        now: DateTime<Utc>,
    ) -> ServiceResult<()> {
        let code = code.trim();
        if code.len() != TOTP_DIGITS || !code.bytes().all(|b| b.is_ascii_digit()) {
            return Err(ServiceError::InvalidMfaCode);
        }

        let secret_base32 = self.secret_box.open_string(&record.secret_encrypted)?;
        let secret = Secret::Encoded(secret_base32)
            .to_bytes()
            .map_err(|e| ServiceError::Internal(anyhow::anyhow!("Stored TOTP secret: {}", e)))?;
        let totp = build_totp(secret, &self.issuer_name, "user")?;

        let step_start = matching_step(&totp, code, now.timestamp(), self.window)
            .ok_or(ServiceError::InvalidMfaCode)?;
        let step_start = Utc
            .timestamp_opt(step_start, 0)
            .single()
            .ok_or(ServiceError::InvalidMfaCode)?;

        if !store
            .advance_totp_last_used(record.user_id, step_start)
            .await?
        {
            tracing::warn!(user_id = %record.user_id, "TOTP code replayed");
            return Err(ServiceError::InvalidMfaCode);
        }
        Ok(())
    }
}

/// Start (unix seconds) of the latest step within the window whose code
/// matches.
fn matching_step(totp: &TOTP, code: &str, now: i64, window: u8) -> Option<i64> {
    let step = TOTP_STEP_SECS as i64;
    let current = now - now.rem_euclid(step);
    let window = i64::from(window);
    (-window..=window)
        .rev()
        .map(|offset| current + offset * step)
        .filter(|t| *t >= 0)
        .find(|t| constant_time_eq(&totp.generate(*t as u64), code))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::store::{MemoryTenantStore, MfaRepo};
    use proptest::prelude::*;

    fn service() -> MfaService {
        MfaService::new(Arc::new(SecretBox::new(&[9u8; 32])), "HelloJohn", Duration::days(30))
    }

    fn code_at(secret_base32: &str, at: DateTime<Utc>) -> String {
        let secret = Secret::Encoded(secret_base32.to_string()).to_bytes().unwrap();
        build_totp(secret, "x", "y")
            .unwrap()
            .generate(at.timestamp() as u64)
    }

    #[tokio::test]
    async fn confirm_returns_recovery_codes_once() {
        let mfa = service();
        let store = MemoryTenantStore::new();
        let user = Uuid::new_v4();
        let now = Utc::now();

        let enrollment = mfa.enroll(&store, user, "u@x").await.unwrap();
        assert!(enrollment.otpauth_url.starts_with("otpauth://totp/"));

        let codes = mfa
            .confirm(&store, user, &code_at(&enrollment.secret_base32, now), now)
            .await
            .unwrap()
            .expect("first confirmation returns codes");
        assert_eq!(codes.len(), RECOVERY_CODE_COUNT);
        assert!(mfa.is_enrolled(&store, user).await.unwrap());

        // A second enrollment leaves the recovery codes untouched.
        assert!(matches!(
            mfa.enroll(&store, user, "u@x").await,
            Err(ServiceError::MfaAlreadyEnrolled)
        ));
        assert_eq!(
            store.count_unused_recovery_codes(user).await.unwrap(),
            RECOVERY_CODE_COUNT as u64
        );
    }

    #[tokio::test]
    async fn totp_step_is_not_accepted_twice() {
        let mfa = service();
        let store = MemoryTenantStore::new();
        let user = Uuid::new_v4();
        let now = Utc::now();

        let enrollment = mfa.enroll(&store, user, "u@x").await.unwrap();
        store.confirm_totp(user, now).await.unwrap();

        let code = code_at(&enrollment.secret_base32, now);
        let factor = MfaFactor::Totp(code);
        mfa.verify_factor(&store, user, &factor, now).await.unwrap();
        assert!(matches!(
            mfa.verify_factor(&store, user, &factor, now).await,
            Err(ServiceError::InvalidMfaCode)
        ));

        // The previous step is now behind the guard as well.
        let earlier = MfaFactor::Totp(code_at(&enrollment.secret_base32, now - Duration::seconds(30)));
        assert!(mfa.verify_factor(&store, user, &earlier, now).await.is_err());

        let later = now + Duration::seconds(30);
        let next = MfaFactor::Totp(code_at(&enrollment.secret_base32, later));
        mfa.verify_factor(&store, user, &next, later).await.unwrap();
    }

    #[tokio::test]
    async fn codes_outside_the_window_fail() {
        let mfa = service();
        let store = MemoryTenantStore::new();
        let user = Uuid::new_v4();
        let now = Utc::now();

        let enrollment = mfa.enroll(&store, user, "u@x").await.unwrap();
        store.confirm_totp(user, now).await.unwrap();

        let stale = MfaFactor::Totp(code_at(&enrollment.secret_base32, now - Duration::minutes(5)));
        assert!(matches!(
            mfa.verify_factor(&store, user, &stale, now).await,
            Err(ServiceError::InvalidMfaCode)
        ));
        assert!(mfa
            .verify_factor(&store, user, &MfaFactor::Totp("12ab56".into()), now)
            .await
            .is_err());
    }

    #[tokio::test]
    async fn recovery_codes_are_single_use() {
        let mfa = service();
        let store = MemoryTenantStore::new();
        let user = Uuid::new_v4();
        let now = Utc::now();

        mfa.enroll(&store, user, "u@x").await.unwrap();
        store.confirm_totp(user, now).await.unwrap();
        let codes = mfa.rotate_recovery_codes(&store, user).await.unwrap();

        let typed = MfaFactor::Recovery(format!(" {}-{} ", &codes[0][..5], &codes[0][5..]).to_lowercase());
        mfa.verify_factor(&store, user, &typed, now).await.unwrap();
        assert!(matches!(
            mfa.verify_factor(&store, user, &typed, now).await,
            Err(ServiceError::InvalidMfaCode)
        ));
        assert_eq!(store.count_unused_recovery_codes(user).await.unwrap(), 9);
    }

    #[tokio::test]
    async fn checked_recovery_code_stays_unspent_until_spent() {
        let mfa = service();
        let store = MemoryTenantStore::new();
        let user = Uuid::new_v4();
        let now = Utc::now();

        mfa.enroll(&store, user, "u@x").await.unwrap();
        store.confirm_totp(user, now).await.unwrap();
        let codes = mfa.rotate_recovery_codes(&store, user).await.unwrap();
        let factor = MfaFactor::Recovery(codes[0].clone());

        let first = mfa.check_factor(&store, user, &factor, now).await.unwrap();
        let second = mfa.check_factor(&store, user, &factor, now).await.unwrap();
        assert_eq!(store.count_unused_recovery_codes(user).await.unwrap(), 10);

        mfa.spend_factor(&store, user, first, now).await.unwrap();
        assert!(matches!(
            mfa.spend_factor(&store, user, second, now).await,
            Err(ServiceError::InvalidMfaCode)
        ));
        assert_eq!(store.count_unused_recovery_codes(user).await.unwrap(), 9);
    }

    #[tokio::test]
    async fn trusted_device_round_trip() {
        let mfa = service();
        let store = MemoryTenantStore::new();
        let user = Uuid::new_v4();
        let now = Utc::now();

        let (cookie, expires) = mfa.remember_device(&store, user, now).await.unwrap();
        assert_eq!(expires, now + Duration::days(30));
        assert!(mfa.is_trusted_device(&store, user, Some(&cookie), now).await.unwrap());
        assert!(!mfa.is_trusted_device(&store, user, Some("other"), now).await.unwrap());
        assert!(!mfa.is_trusted_device(&store, user, None, now).await.unwrap());
        assert!(!mfa
            .is_trusted_device(&store, user, Some(&cookie), expires + Duration::seconds(1))
            .await
            .unwrap());
    }

    proptest! {
        #[test]
        fn recovery_codes_use_the_unambiguous_alphabet(_seed in 0u8..16) {
            for code in generate_recovery_codes() {
                prop_assert_eq!(code.len(), RECOVERY_CODE_LEN);
                prop_assert!(code.bytes().all(|b| RECOVERY_ALPHABET.contains(&b)));
                prop_assert_eq!(hash_recovery_code(&code), hash_token(&code.to_lowercase()));
            }
        }
    }
}
