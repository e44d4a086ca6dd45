//! Direct authentication flows: password login, cookie sessions,
//! registration, email verification, password reset, the MFA challenge and
//! Google sign-in.

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use serde_json::{Map, Value};
use std::sync::Arc;
use url::Url;
use uuid::Uuid;

use super::cache::CacheKey;
use super::challenges::ChallengeCache;
use super::client_resolver::{is_provider_allowed, parse_requested_scopes, ClientResolver};
use super::credentials::{normalize_email, CredentialService};
use super::email::{
    email_link, password_reset_email, send_now, verification_email, EmailProvider, EmailQueue,
};
use super::error::{ServiceError, ServiceResult};
use super::mfa::{MfaFactor, MfaService};
use super::social::SocialService;
use super::store::{TenantStore, TenantStores};
use super::tenant_resolver::TenantResolver;
use super::token::{Issuance, TokenResponse, TokenService};
use crate::models::amr::{with_mfa, AMR_GOOGLE, AMR_PWD};
use crate::models::{
    Client, EmailTokenPurpose, MfaChallenge, TenantRef, User, PROVIDER_GOOGLE, PROVIDER_PASSWORD,
};
use crate::utils::{generate_opaque_token, hash_token};

pub const GRANT_PASSWORD: &str = "password";
pub const GRANT_MFA: &str = "mfa";
pub const GRANT_SOCIAL: &str = "social";

/// Lifetimes and link targets of the email flows.
#[derive(Debug, Clone)]
pub struct EmailFlowSettings {
    pub verify_ttl: Duration,
    pub reset_ttl: Duration,
    pub smtp_deadline: std::time::Duration,
    /// Where verification links land when the client sets none.
    pub verify_base: String,
    /// Where reset links land when the client sets none.
    pub reset_base: String,
}

#[derive(Debug, Clone, Default)]
pub struct PasswordLogin {
    pub tenant: Option<String>,
    pub client_id: String,
    pub email: String,
    pub password: String,
    pub scope: Option<String>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct MfaRequired {
    pub mfa_required: bool,
    pub mfa_token: String,
    pub amr: Vec<String>,
}

/// Outcome of the second-factor check for a freshly authenticated user.
enum MfaGate {
    /// No challenge needed. Carries the AMR to issue with.
    Pass(Vec<String>),
    Challenge(MfaRequired),
}

#[derive(Debug, Clone)]
pub enum LoginOutcome {
    Tokens(TokenResponse),
    MfaRequired(MfaRequired),
}

/// A started cookie session.
#[derive(Debug, Clone)]
pub struct SessionStarted {
    pub cookie_value: String,
    pub max_age_secs: i64,
    pub return_to: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct Registration {
    pub tenant: Option<String>,
    pub client_id: String,
    pub email: String,
    pub password: String,
    pub custom_fields: Map<String, Value>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RegisterOutcome {
    pub user_id: Uuid,
    pub email_verification_required: bool,
    #[serde(flatten)]
    pub tokens: Option<TokenResponse>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ProviderInfo {
    pub name: &'static str,
    pub enabled: bool,
    pub ready: bool,
}

#[derive(Debug, Clone)]
pub struct MfaPassed {
    pub tokens: TokenResponse,
    /// Raw trusted-device cookie and its expiry, when one was requested.
    pub trusted_device: Option<(String, DateTime<Utc>)>,
}

pub struct AuthService {
    tenants: Arc<TenantResolver>,
    clients: Arc<ClientResolver>,
    stores: Arc<dyn TenantStores>,
    credentials: Arc<CredentialService>,
    mfa: Arc<MfaService>,
    challenges: Arc<ChallengeCache>,
    tokens: Arc<TokenService>,
    social: Arc<SocialService>,
    email: Arc<dyn EmailProvider>,
    email_queue: EmailQueue,
    email_flows: EmailFlowSettings,
    ui_base_url: String,
}

impl AuthService {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        tenants: Arc<TenantResolver>,
        clients: Arc<ClientResolver>,
        stores: Arc<dyn TenantStores>,
        credentials: Arc<CredentialService>,
        mfa: Arc<MfaService>,
        challenges: Arc<ChallengeCache>,
        tokens: Arc<TokenService>,
        social: Arc<SocialService>,
        email: Arc<dyn EmailProvider>,
        email_queue: EmailQueue,
        email_flows: EmailFlowSettings,
        ui_base_url: &str,
    ) -> Self {
        Self {
            tenants,
            clients,
            stores,
            credentials,
            mfa,
            challenges,
            tokens,
            social,
            email,
            email_queue,
            email_flows,
            ui_base_url: ui_base_url.trim_end_matches('/').to_string(),
        }
    }

    pub fn mfa(&self) -> &Arc<MfaService> {
        &self.mfa
    }

    pub fn stores(&self) -> &Arc<dyn TenantStores> {
        &self.stores
    }

    async fn resolve_client(
        &self,
        tenant_hint: Option<&str>,
        client_id: &str,
    ) -> ServiceResult<(TenantRef, Client)> {
        if client_id.is_empty() {
            return Err(ServiceError::InvalidRequest("client_id is required".to_string()));
        }
        let tenant = self.tenants.resolve_for_client(tenant_hint, client_id)?;
        let client = self.clients.resolve(&tenant, client_id).await?;
        Ok((tenant, client))
    }

    /// Password check with the email-verification rule of the client.
    async fn password_user(
        &self,
        store: &dyn TenantStore,
        client: &Client,
        email: &str,
        password: &str,
        now: DateTime<Utc>,
    ) -> ServiceResult<User> {
        if !is_provider_allowed(client, PROVIDER_PASSWORD) {
            return Err(ServiceError::ProviderNotAllowed(PROVIDER_PASSWORD.to_string()));
        }
        let user = match self.credentials.authenticate(store, email, password, now).await {
            Ok(user) => user,
            Err(e) => {
                metrics::counter!("hellojohn_login_attempts_total", "result" => "failure")
                    .increment(1);
                return Err(e);
            }
        };
        if client.require_email_verification && !user.email_verified {
            metrics::counter!("hellojohn_login_attempts_total", "result" => "unverified")
                .increment(1);
            return Err(ServiceError::EmailNotVerified);
        }
        Ok(user)
    }

    /// Parks an MFA challenge when the user has a confirmed enrollment and the
    /// device is not trusted. A trusted device passes with `mfa` added.
    #[allow(clippy::too_many_arguments)]
    async fn mfa_gate(
        &self,
        store: &dyn TenantStore,
        tenant: &TenantRef,
        client: &Client,
        user: &User,
        amr: &[String],
        scopes: &[String],
        trusted_device: Option<&str>,
        now: DateTime<Utc>,
    ) -> ServiceResult<MfaGate> {
        if !self.mfa.is_enrolled(store, user.id).await? {
            return Ok(MfaGate::Pass(amr.to_vec()));
        }
        if self
            .mfa
            .is_trusted_device(store, user.id, trusted_device, now)
            .await?
        {
            return Ok(MfaGate::Pass(with_mfa(amr)));
        }
        let challenge = MfaChallenge {
            user_id: user.id,
            tenant_id: tenant.id,
            client_id: client.client_id.clone(),
            amr_base: amr.to_vec(),
            requested_scope: scopes.to_vec(),
            session_key: None,
            auth_time: now.timestamp(),
        };
        let mfa_token = self.challenges.issue_mfa_challenge(&challenge).await?;
        Ok(MfaGate::Challenge(MfaRequired {
            mfa_required: true,
            mfa_token,
            amr: amr.to_vec(),
        }))
    }

    fn login_scopes(client: &Client, requested: Option<&str>) -> ServiceResult<Vec<String>> {
        match requested.map(str::trim).filter(|s| !s.is_empty()) {
            Some(scope) => parse_requested_scopes(client, scope),
            None => Ok(client.scopes.clone()),
        }
    }

    #[tracing::instrument(skip_all, fields(client_id = %input.client_id))]
    pub async fn login(
        &self,
        input: &PasswordLogin,
        trusted_device: Option<&str>,
        now: DateTime<Utc>,
    ) -> ServiceResult<LoginOutcome> {
        let (tenant, client) = self
            .resolve_client(input.tenant.as_deref(), &input.client_id)
            .await?;
        let scopes = Self::login_scopes(&client, input.scope.as_deref())?;
        let store = self.stores.for_tenant(&tenant).await?;
        let user = self
            .password_user(store.as_ref(), &client, &input.email, &input.password, now)
            .await?;

        let primary = vec![AMR_PWD.to_string()];
        let amr = match self
            .mfa_gate(store.as_ref(), &tenant, &client, &user, &primary, &scopes, trusted_device, now)
            .await?
        {
            MfaGate::Pass(amr) => amr,
            MfaGate::Challenge(required) => {
                metrics::counter!("hellojohn_login_attempts_total", "result" => "mfa_required")
                    .increment(1);
                return Ok(LoginOutcome::MfaRequired(required));
            }
        };

        let tokens = self
            .tokens
            .issue(
                store.as_ref(),
                &tenant,
                &user,
                Issuance {
                    client_id: &client.client_id,
                    scopes: &scopes,
                    amr: &amr,
                    auth_time: now.timestamp(),
                    nonce: None,
                    grant: GRANT_PASSWORD,
                },
                now,
            )
            .await?;
        metrics::counter!("hellojohn_login_attempts_total", "result" => "success").increment(1);
        Ok(LoginOutcome::Tokens(tokens))
    }

    /// Password login that ends in a browser session instead of tokens. The
    /// second factor, if any, is demanded later by `/authorize`.
    #[tracing::instrument(skip_all, fields(client_id = %input.client_id))]
    pub async fn session_login(
        &self,
        input: &PasswordLogin,
        return_to: Option<&str>,
        now: DateTime<Utc>,
    ) -> ServiceResult<SessionStarted> {
        let (tenant, client) = self
            .resolve_client(input.tenant.as_deref(), &input.client_id)
            .await?;
        let return_to = match return_to.filter(|r| !r.is_empty()) {
            Some(r) if self.is_allowed_return(&tenant, r) => Some(r.to_string()),
            Some(_) => {
                return Err(ServiceError::InvalidRequest(
                    "return_to is not an allowed destination".to_string(),
                ))
            }
            None => None,
        };
        let store = self.stores.for_tenant(&tenant).await?;
        let user = self
            .password_user(store.as_ref(), &client, &input.email, &input.password, now)
            .await?;

        let (cookie_value, _) = self
            .challenges
            .start_session(&tenant, user.id, vec![AMR_PWD.to_string()], now.timestamp(), now)
            .await?;
        metrics::counter!("hellojohn_login_attempts_total", "result" => "session").increment(1);
        tracing::info!(tenant = %tenant.slug, user_id = %user.id, "session started");
        Ok(SessionStarted {
            cookie_value,
            max_age_secs: self.challenges.ttls().session.as_secs() as i64,
            return_to,
        })
    }

    /// Same-origin paths, the UI, and the tenant's allowed hosts.
    fn is_allowed_return(&self, tenant: &TenantRef, target: &str) -> bool {
        if target.starts_with('/') && !target.starts_with("//") {
            return true;
        }
        let Ok(url) = Url::parse(target) else {
            return false;
        };
        if !matches!(url.scheme(), "https" | "http") {
            return false;
        }
        let Some(host) = url.host_str() else {
            return false;
        };
        let ui_host = Url::parse(&self.ui_base_url)
            .ok()
            .and_then(|u| u.host_str().map(str::to_string));
        ui_host.as_deref() == Some(host)
            || tenant
                .settings
                .allowed_return_hosts
                .iter()
                .any(|h| h.eq_ignore_ascii_case(host))
    }

    pub async fn logout(&self, cookie_value: &str) -> ServiceResult<()> {
        self.challenges.end_session(cookie_value).await
    }

    #[tracing::instrument(skip_all, fields(client_id = %input.client_id))]
    pub async fn register(
        &self,
        input: Registration,
        now: DateTime<Utc>,
    ) -> ServiceResult<RegisterOutcome> {
        let (tenant, client) = self
            .resolve_client(input.tenant.as_deref(), &input.client_id)
            .await?;
        if !is_provider_allowed(&client, PROVIDER_PASSWORD) {
            return Err(ServiceError::ProviderNotAllowed(PROVIDER_PASSWORD.to_string()));
        }
        let store = self.stores.for_tenant(&tenant).await?;
        let user = self
            .credentials
            .register(
                store.as_ref(),
                &input.email,
                &input.password,
                Some(client.client_id.clone()),
                input.custom_fields,
                &tenant.settings.user_fields,
            )
            .await?;
        tracing::info!(tenant = %tenant.slug, user_id = %user.id, "user registered");

        // The account exists either way; a lost email can be requested again.
        if let Err(e) = self
            .queue_verification(store.as_ref(), &tenant, &client, &user, now)
            .await
        {
            tracing::warn!(user_id = %user.id, error = %e, "verification email not queued");
        }

        if client.require_email_verification {
            return Ok(RegisterOutcome {
                user_id: user.id,
                email_verification_required: true,
                tokens: None,
            });
        }
        let scopes = client.scopes.clone();
        let amr = vec![AMR_PWD.to_string()];
        let tokens = self
            .tokens
            .issue(
                store.as_ref(),
                &tenant,
                &user,
                Issuance {
                    client_id: &client.client_id,
                    scopes: &scopes,
                    amr: &amr,
                    auth_time: now.timestamp(),
                    nonce: None,
                    grant: GRANT_PASSWORD,
                },
                now,
            )
            .await?;
        Ok(RegisterOutcome {
            user_id: user.id,
            email_verification_required: false,
            tokens: Some(tokens),
        })
    }

    async fn create_email_token(
        &self,
        store: &dyn TenantStore,
        user_id: Uuid,
        purpose: EmailTokenPurpose,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> ServiceResult<String> {
        let raw = generate_opaque_token();
        store
            .create_email_token(user_id, purpose, &hash_token(&raw), now + ttl)
            .await?;
        Ok(raw)
    }

    async fn queue_verification(
        &self,
        store: &dyn TenantStore,
        tenant: &TenantRef,
        client: &Client,
        user: &User,
        now: DateTime<Utc>,
    ) -> ServiceResult<()> {
        let raw = self
            .create_email_token(
                store,
                user.id,
                EmailTokenPurpose::VerifyEmail,
                self.email_flows.verify_ttl,
                now,
            )
            .await?;
        let base = client
            .verify_email_url
            .as_deref()
            .unwrap_or(&self.email_flows.verify_base);
        let link = email_link(base, &raw, &tenant.slug);
        self.email_queue
            .enqueue(tenant, verification_email(&user.email, &link));
        Ok(())
    }

    /// Always succeeds from the caller's point of view, whether or not the
    /// address exists.
    #[tracing::instrument(skip_all, fields(client_id))]
    pub async fn verify_email_start(
        &self,
        tenant_hint: Option<&str>,
        client_id: &str,
        email: &str,
        now: DateTime<Utc>,
    ) -> ServiceResult<()> {
        let (tenant, client) = self.resolve_client(tenant_hint, client_id).await?;
        let store = self.stores.for_tenant(&tenant).await?;
        let Some((user, _)) = store.get_user_by_email(&normalize_email(email)).await? else {
            return Ok(());
        };
        if user.email_verified {
            return Ok(());
        }
        if let Err(e) = self
            .queue_verification(store.as_ref(), &tenant, &client, &user, now)
            .await
        {
            tracing::warn!(user_id = %user.id, error = %e, "verification email not queued");
        }
        Ok(())
    }

    /// Consumes a verification token. A replay is `invalid_token`.
    #[tracing::instrument(skip_all)]
    pub async fn verify_email(
        &self,
        tenant_hint: &str,
        token: &str,
        now: DateTime<Utc>,
    ) -> ServiceResult<Uuid> {
        let tenant = self.tenants.resolve(tenant_hint)?;
        let store = self.stores.for_tenant(&tenant).await?;
        let record = store
            .get_email_token(&hash_token(token), EmailTokenPurpose::VerifyEmail)
            .await?
            .filter(|t| t.is_usable(now))
            .ok_or(ServiceError::InvalidEmailToken)?;
        if !store.mark_email_token_used(record.id, now).await? {
            return Err(ServiceError::InvalidEmailToken);
        }
        store.set_email_verified(record.user_id).await?;
        tracing::info!(tenant = %tenant.slug, user_id = %record.user_id, "email verified");
        Ok(record.user_id)
    }

    /// Sends the reset email inline so delivery failures reach the caller.
    /// Unknown addresses succeed silently.
    #[tracing::instrument(skip_all, fields(client_id))]
    pub async fn forgot(
        &self,
        tenant_hint: Option<&str>,
        client_id: &str,
        email: &str,
        now: DateTime<Utc>,
    ) -> ServiceResult<()> {
        let (tenant, client) = self.resolve_client(tenant_hint, client_id).await?;
        let store = self.stores.for_tenant(&tenant).await?;
        let Some((user, _)) = store.get_user_by_email(&normalize_email(email)).await? else {
            return Ok(());
        };
        let raw = self
            .create_email_token(
                store.as_ref(),
                user.id,
                EmailTokenPurpose::PasswordReset,
                self.email_flows.reset_ttl,
                now,
            )
            .await?;
        let base = client
            .reset_password_url
            .as_deref()
            .unwrap_or(&self.email_flows.reset_base);
        let link = email_link(base, &raw, &tenant.slug);
        send_now(
            self.email.as_ref(),
            &tenant,
            &password_reset_email(&user.email, &link),
            self.email_flows.smtp_deadline,
        )
        .await
    }

    /// Sets a new password from a reset token and revokes every refresh token
    /// of the user.
    #[tracing::instrument(skip_all)]
    pub async fn reset(
        &self,
        tenant_hint: &str,
        token: &str,
        new_password: &str,
        now: DateTime<Utc>,
    ) -> ServiceResult<()> {
        let tenant = self.tenants.resolve(tenant_hint)?;
        self.credentials.check_policy(new_password)?;
        let store = self.stores.for_tenant(&tenant).await?;
        let record = store
            .get_email_token(&hash_token(token), EmailTokenPurpose::PasswordReset)
            .await?
            .filter(|t| t.is_usable(now))
            .ok_or(ServiceError::InvalidEmailToken)?;
        let user = store
            .get_user_by_id(record.user_id)
            .await?
            .ok_or(ServiceError::InvalidEmailToken)?;
        if !store.mark_email_token_used(record.id, now).await? {
            return Err(ServiceError::InvalidEmailToken);
        }
        self.credentials
            .reset_password(store.as_ref(), &user, new_password, now)
            .await?;
        Ok(())
    }

    /// Login factors available to a tenant, optionally narrowed to a client.
    pub async fn providers(
        &self,
        tenant_hint: Option<&str>,
        client_id: Option<&str>,
    ) -> ServiceResult<Vec<ProviderInfo>> {
        let (tenant, client) = match client_id.filter(|c| !c.is_empty()) {
            Some(client_id) => {
                let (tenant, client) = self.resolve_client(tenant_hint, client_id).await?;
                (tenant, Some(client))
            }
            None => {
                let hint = tenant_hint
                    .ok_or_else(|| ServiceError::InvalidRequest("tenant is required".to_string()))?;
                (self.tenants.resolve(hint)?, None)
            }
        };
        let allowed = |p: &str| client.as_ref().map_or(true, |c| is_provider_allowed(c, p));
        Ok(vec![
            ProviderInfo {
                name: PROVIDER_PASSWORD,
                enabled: allowed(PROVIDER_PASSWORD),
                ready: true,
            },
            ProviderInfo {
                name: PROVIDER_GOOGLE,
                enabled: allowed(PROVIDER_GOOGLE),
                ready: self.social.is_ready(&tenant),
            },
        ])
    }

    /// Redeems an MFA challenge with a second factor. The challenge and a
    /// recovery code are consumed only once tokens exist.
    #[tracing::instrument(skip_all, fields(remember_device))]
    pub async fn mfa_challenge(
        &self,
        mfa_token: &str,
        factor: &MfaFactor,
        remember_device: bool,
        now: DateTime<Utc>,
    ) -> ServiceResult<MfaPassed> {
        let pending = self
            .challenges
            .mfa_challenge(mfa_token)
            .await?
            .ok_or(ServiceError::MfaTokenNotFound)?;
        let claim = self
            .challenges
            .claim(&pending)
            .await?
            .ok_or(ServiceError::MfaTokenNotFound)?;
        let challenge = pending.value;

        let result = async {
            let tenant = self.tenants.resolve_id(challenge.tenant_id)?;
            let store = self.stores.for_tenant(&tenant).await?;
            let checked = self
                .mfa
                .check_factor(store.as_ref(), challenge.user_id, factor, now)
                .await?;
            let user = store
                .get_user_by_id(challenge.user_id)
                .await?
                .ok_or(ServiceError::MfaTokenNotFound)?;
            if user.is_blocked(now) {
                return Err(ServiceError::UserDisabled);
            }

            let amr = with_mfa(&challenge.amr_base);
            let tokens = self
                .tokens
                .issue(
                    store.as_ref(),
                    &tenant,
                    &user,
                    Issuance {
                        client_id: &challenge.client_id,
                        scopes: &challenge.requested_scope,
                        amr: &amr,
                        auth_time: challenge.auth_time,
                        nonce: None,
                        grant: GRANT_MFA,
                    },
                    now,
                )
                .await?;
            if let Err(e) = self.mfa.spend_factor(store.as_ref(), user.id, checked, now).await {
                if let Some(raw) = tokens.refresh_token.as_deref() {
                    store.consume_refresh(&hash_token(raw), now).await?;
                }
                return Err(e);
            }

            if let Some(key) = challenge.session_key.clone().and_then(CacheKey::from_stored) {
                self.challenges.elevate_session(&key, now).await?;
            }
            let trusted_device = if remember_device {
                Some(self.mfa.remember_device(store.as_ref(), user.id, now).await?)
            } else {
                None
            };
            Ok(MfaPassed {
                tokens,
                trusted_device,
            })
        }
        .await;

        match result {
            Ok(passed) => {
                claim.commit().await?;
                metrics::counter!("hellojohn_mfa_challenges_total", "result" => "success")
                    .increment(1);
                Ok(passed)
            }
            Err(e) => {
                claim.release().await?;
                metrics::counter!("hellojohn_mfa_challenges_total", "result" => "failure")
                    .increment(1);
                Err(e)
            }
        }
    }

    pub async fn social_start(
        &self,
        tenant_hint: Option<&str>,
        client_id: &str,
        redirect_uri: &str,
    ) -> ServiceResult<String> {
        let (tenant, client) = self.resolve_client(tenant_hint, client_id).await?;
        self.social.start(&tenant, &client, redirect_uri).await
    }

    /// Finishes a Google round trip and returns the client redirect carrying
    /// a one-shot `login_code`.
    #[tracing::instrument(skip_all)]
    pub async fn social_callback(
        &self,
        state: &str,
        code: &str,
        trusted_device: Option<&str>,
        now: DateTime<Utc>,
    ) -> ServiceResult<String> {
        let (tenant, pending) = self
            .social
            .callback(|id| self.tenants.resolve_id(id), state, code)
            .await?;
        let social_state = pending.state.clone();
        let identity = pending.identity.clone();

        let result = async {
            let client = self.clients.resolve(&tenant, &social_state.client_id).await?;
            let store = self.stores.for_tenant(&tenant).await?;
            let link = self
                .credentials
                .link_or_create_social(
                    store.as_ref(),
                    PROVIDER_GOOGLE,
                    &identity.subject,
                    &identity.email,
                    identity.email_verified,
                    Some(client.client_id.clone()),
                    now,
                )
                .await?;
            let user = link.user;
            if client.require_email_verification && !(user.email_verified || identity.email_verified) {
                return Err(ServiceError::EmailNotVerified);
            }

            let scopes = client.scopes.clone();
            let primary = vec![AMR_GOOGLE.to_string()];
            let response = match self
                .mfa_gate(store.as_ref(), &tenant, &client, &user, &primary, &scopes, trusted_device, now)
                .await?
            {
                MfaGate::Challenge(required) => serde_json::to_value(required)
                    .map_err(|e| ServiceError::Internal(e.into()))?,
                MfaGate::Pass(amr) => {
                    let tokens = self
                        .tokens
                        .issue(
                            store.as_ref(),
                            &tenant,
                            &user,
                            Issuance {
                                client_id: &client.client_id,
                                scopes: &scopes,
                                amr: &amr,
                                auth_time: now.timestamp(),
                                nonce: None,
                                grant: GRANT_SOCIAL,
                            },
                            now,
                        )
                        .await?;
                    serde_json::to_value(tokens).map_err(|e| ServiceError::Internal(e.into()))?
                }
            };
            self.social
                .park_login(tenant.id, &client.client_id, response)
                .await
        }
        .await;

        match result {
            Ok(login_code) => {
                pending.claim.commit().await?;
                let mut url = Url::parse(&social_state.redirect_uri)
                    .map_err(|e| ServiceError::Internal(e.into()))?;
                url.query_pairs_mut().append_pair("login_code", &login_code);
                Ok(url.into())
            }
            Err(e) => {
                pending.claim.release().await?;
                Err(e)
            }
        }
    }

    pub async fn social_exchange(&self, login_code: &str, client_id: &str) -> ServiceResult<Value> {
        self.social.redeem(login_code, client_id).await
    }
}

