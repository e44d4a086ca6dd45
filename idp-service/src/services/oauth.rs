//! Authorization-code flow with mandatory PKCE, the token endpoint,
//! introspection and userinfo.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use service_core::error::AppError;
use std::sync::Arc;
use url::Url;
use uuid::Uuid;

use super::cache::CacheKey;
use super::challenges::ChallengeCache;
use super::client_resolver::{
    is_provider_allowed, parse_requested_scopes, validate_redirect_uri, ClientResolver,
};
use super::error::{ServiceError, ServiceResult};
use super::issuer::AccessClaims;
use super::mfa::MfaService;
use super::store::{TenantStore, TenantStores};
use super::tenant_resolver::TenantResolver;
use super::token::{Issuance, TokenResponse, TokenService, SCOPE_EMAIL};
use crate::models::amr::{acr_for, with_mfa, AMR_GOOGLE, AMR_MFA};
use crate::models::{
    AuthorizationCodeRecord, Client, ConsentChallenge, MfaChallenge, TenantRef, User,
    PROVIDER_GOOGLE, PROVIDER_PASSWORD,
};
use crate::utils::{constant_time_eq, verify_pkce};

pub const PKCE_METHOD_S256: &str = "S256";
pub const GRANT_AUTHORIZATION_CODE: &str = "authorization_code";
pub const GRANT_REFRESH_TOKEN: &str = "refresh_token";

#[derive(Debug, Clone, Default, Deserialize)]
pub struct AuthorizeRequest {
    #[serde(default)]
    pub response_type: String,
    #[serde(default)]
    pub client_id: String,
    #[serde(default)]
    pub redirect_uri: String,
    #[serde(default)]
    pub scope: String,
    pub state: Option<String>,
    pub nonce: Option<String>,
    pub code_challenge: Option<String>,
    pub code_challenge_method: Option<String>,
    pub prompt: Option<String>,
    /// Tenant id or slug, needed when the client id is not unique.
    pub tenant: Option<String>,
}

/// Credentials the browser or caller brought along.
#[derive(Debug, Clone, Copy, Default)]
pub struct Presented<'a> {
    pub session_cookie: Option<&'a str>,
    pub bearer: Option<&'a str>,
    pub trusted_device: Option<&'a str>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum AuthorizeOutcome {
    /// 302 to the client, the login UI or the consent UI.
    Redirect(String),
    MfaRequired { mfa_token: String, amr: Vec<String> },
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct TokenRequest {
    #[serde(default)]
    pub grant_type: String,
    pub code: Option<String>,
    pub code_verifier: Option<String>,
    pub redirect_uri: Option<String>,
    pub client_id: Option<String>,
    pub client_secret: Option<String>,
    pub refresh_token: Option<String>,
    pub tenant: Option<String>,
}

/// Client credentials from `Authorization: Basic`.
#[derive(Debug, Clone)]
pub struct BasicCredentials {
    pub client_id: String,
    pub client_secret: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct IntrospectionResponse {
    pub active: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sub: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exp: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub iat: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub iss: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tid: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub amr: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub acr: Option<String>,
}

impl IntrospectionResponse {
    pub fn inactive() -> Self {
        Self::default()
    }
}

/// Who is behind the request, once bound to the client's tenant.
struct Principal {
    user: User,
    amr: Vec<String>,
    auth_time: i64,
    session_key: Option<CacheKey>,
}

pub struct OAuthService {
    tenants: Arc<TenantResolver>,
    clients: Arc<ClientResolver>,
    stores: Arc<dyn TenantStores>,
    challenges: Arc<ChallengeCache>,
    tokens: Arc<TokenService>,
    mfa: Arc<MfaService>,
    ui_base_url: String,
}

impl OAuthService {
    pub fn new(
        tenants: Arc<TenantResolver>,
        clients: Arc<ClientResolver>,
        stores: Arc<dyn TenantStores>,
        challenges: Arc<ChallengeCache>,
        tokens: Arc<TokenService>,
        mfa: Arc<MfaService>,
        ui_base_url: &str,
    ) -> Self {
        Self {
            tenants,
            clients,
            stores,
            challenges,
            tokens,
            mfa,
            ui_base_url: ui_base_url.trim_end_matches('/').to_string(),
        }
    }

    /// Runs `/authorize`. Errors returned as `Err` happened before the
    /// redirect URI was trusted; everything later is a redirect carrying the
    /// error.
    #[tracing::instrument(skip_all, fields(client_id = %req.client_id))]
    pub async fn authorize(
        &self,
        req: &AuthorizeRequest,
        presented: Presented<'_>,
        original_url: &str,
        now: DateTime<Utc>,
    ) -> ServiceResult<AuthorizeOutcome> {
        if req.client_id.is_empty() {
            return Err(ServiceError::InvalidRequest("client_id is required".to_string()));
        }
        let tenant = self
            .tenants
            .resolve_for_client(req.tenant.as_deref(), &req.client_id)?;
        let client = self.clients.resolve(&tenant, &req.client_id).await?;
        if req.redirect_uri.is_empty() || !validate_redirect_uri(&client, &req.redirect_uri) {
            return Err(ServiceError::InvalidRedirectUri);
        }

        let state = req.state.as_deref();
        match self
            .authorize_validated(&tenant, &client, req, presented, original_url, now)
            .await
        {
            Ok(outcome) => Ok(outcome),
            Err(err) => {
                tracing::info!(tenant = %tenant.slug, error = %err, "authorize failed after redirect check");
                let (code, description) = redirect_error_of(err);
                Ok(AuthorizeOutcome::Redirect(error_redirect(
                    &req.redirect_uri,
                    code,
                    &description,
                    state,
                )))
            }
        }
    }

    async fn authorize_validated(
        &self,
        tenant: &TenantRef,
        client: &Client,
        req: &AuthorizeRequest,
        presented: Presented<'_>,
        original_url: &str,
        now: DateTime<Utc>,
    ) -> ServiceResult<AuthorizeOutcome> {
        if req.response_type != "code" {
            return Err(ServiceError::UnsupportedResponseType);
        }
        let code_challenge = req
            .code_challenge
            .as_deref()
            .filter(|c| !c.is_empty())
            .ok_or_else(|| ServiceError::InvalidRequest("code_challenge is required".to_string()))?;
        if req.code_challenge_method.as_deref() != Some(PKCE_METHOD_S256) {
            return Err(ServiceError::InvalidRequest(
                "code_challenge_method must be S256".to_string(),
            ));
        }
        let scopes = parse_requested_scopes(client, &req.scope)?;
        let prompt_none = req.prompt.as_deref() == Some("none");

        let store = self.stores.for_tenant(tenant).await?;
        let Some(principal) = self.principal(tenant, store.as_ref(), presented, now).await? else {
            if prompt_none {
                return Err(ServiceError::LoginRequired);
            }
            return Ok(AuthorizeOutcome::Redirect(self.login_redirect(original_url)));
        };
        let user = &principal.user;

        if user.is_blocked(now) {
            return Err(ServiceError::UserDisabled);
        }
        if client.require_email_verification && !user.email_verified {
            return Err(ServiceError::EmailNotVerified);
        }
        let provider = if principal.amr.iter().any(|m| m == AMR_GOOGLE) {
            PROVIDER_GOOGLE
        } else {
            PROVIDER_PASSWORD
        };
        if !is_provider_allowed(client, provider) {
            return Err(ServiceError::ProviderNotAllowed(provider.to_string()));
        }

        let mut amr = principal.amr;
        let has_mfa = amr.iter().any(|m| m == AMR_MFA);
        if !has_mfa && self.mfa.is_enrolled(store.as_ref(), user.id).await? {
            if self
                .mfa
                .is_trusted_device(store.as_ref(), user.id, presented.trusted_device, now)
                .await?
            {
                amr = with_mfa(&amr);
            } else {
                let challenge = MfaChallenge {
                    user_id: user.id,
                    tenant_id: tenant.id,
                    client_id: client.client_id.clone(),
                    amr_base: amr.clone(),
                    requested_scope: scopes,
                    session_key: principal.session_key.map(|k| k.as_str().to_string()),
                    auth_time: principal.auth_time,
                };
                let mfa_token = self.challenges.issue_mfa_challenge(&challenge).await?;
                return Ok(AuthorizeOutcome::MfaRequired { mfa_token, amr });
            }
        }

        if client.require_consent {
            let granted = store.get_consent(user.id, &client.client_id).await?;
            if !granted.is_some_and(|c| c.covers(&scopes)) {
                if prompt_none {
                    return Err(ServiceError::ConsentRequired);
                }
                let challenge = ConsentChallenge {
                    user_id: user.id,
                    tenant_id: tenant.id,
                    client_id: client.client_id.clone(),
                    redirect_uri: req.redirect_uri.clone(),
                    scope: scopes,
                    state: req.state.clone(),
                    nonce: req.nonce.clone(),
                    code_challenge: code_challenge.to_string(),
                    code_challenge_method: PKCE_METHOD_S256.to_string(),
                    amr,
                    auth_time: principal.auth_time,
                };
                let token = self.challenges.issue_consent_challenge(&challenge).await?;
                return Ok(AuthorizeOutcome::Redirect(format!(
                    "{}/consent?consent_token={}",
                    self.ui_base_url,
                    urlencoding::encode(&token)
                )));
            }
        }

        let record = AuthorizationCodeRecord {
            user_id: user.id,
            tenant_id: tenant.id,
            client_id: client.client_id.clone(),
            redirect_uri: req.redirect_uri.clone(),
            scope: scopes.join(" "),
            nonce: req.nonce.clone(),
            code_challenge: code_challenge.to_string(),
            code_challenge_method: PKCE_METHOD_S256.to_string(),
            amr,
            auth_time: principal.auth_time,
            expires_at: now.timestamp() + self.challenges.ttls().code.as_secs() as i64,
        };
        let code = self.challenges.issue_code(&record).await?;
        tracing::info!(tenant = %tenant.slug, user_id = %user.id, "authorization code issued");
        Ok(AuthorizeOutcome::Redirect(code_redirect(
            &req.redirect_uri,
            &code,
            req.state.as_deref(),
        )))
    }

    /// Session cookie first, then bearer. Either must belong to `tenant`.
    async fn principal(
        &self,
        tenant: &TenantRef,
        store: &dyn TenantStore,
        presented: Presented<'_>,
        now: DateTime<Utc>,
    ) -> ServiceResult<Option<Principal>> {
        if let Some(cookie) = presented.session_cookie.filter(|c| !c.is_empty()) {
            if let Some((key, session)) = self.challenges.session(cookie, now).await? {
                if session.tenant_id == tenant.id && session.tenant_slug == tenant.slug {
                    if let Some(user) = store.get_user_by_id(session.user_id).await? {
                        return Ok(Some(Principal {
                            user,
                            amr: session.amr,
                            auth_time: session.auth_time,
                            session_key: Some(key),
                        }));
                    }
                } else {
                    tracing::warn!(
                        session_tenant = %session.tenant_slug,
                        client_tenant = %tenant.slug,
                        "session belongs to another tenant"
                    );
                }
            }
        }

        if let Some(bearer) = presented.bearer.filter(|b| !b.is_empty()) {
            if let Ok((token_tenant, claims)) =
                self.tokens.issuer().validate_access(bearer, &self.tenants, now)
            {
                if token_tenant.id == tenant.id {
                    let user_id = claims.user_id()?;
                    if let Some(user) = store.get_user_by_id(user_id).await? {
                        return Ok(Some(Principal {
                            user,
                            amr: claims.amr,
                            auth_time: claims.iat,
                            session_key: None,
                        }));
                    }
                }
            }
        }
        Ok(None)
    }

    fn login_redirect(&self, original_url: &str) -> String {
        format!(
            "{}/login?return_to={}",
            self.ui_base_url,
            urlencoding::encode(original_url)
        )
    }

    /// Approves or denies a parked consent challenge. Returns the redirect
    /// back to the client.
    #[tracing::instrument(skip_all, fields(approve))]
    pub async fn consent_accept(
        &self,
        consent_token: &str,
        approve: bool,
        now: DateTime<Utc>,
    ) -> ServiceResult<String> {
        let pending = self
            .challenges
            .consent_challenge(consent_token)
            .await?
            .ok_or(ServiceError::InvalidToken)?;
        let claim = self
            .challenges
            .claim(&pending)
            .await?
            .ok_or(ServiceError::InvalidToken)?;
        let challenge = pending.value;

        if !approve {
            claim.commit().await?;
            return Ok(error_redirect(
                &challenge.redirect_uri,
                "access_denied",
                "The user denied the request",
                challenge.state.as_deref(),
            ));
        }

        let result = async {
            let tenant = self.tenants.resolve_id(challenge.tenant_id)?;
            let store = self.stores.for_tenant(&tenant).await?;
            store
                .upsert_consent(challenge.user_id, &challenge.client_id, &challenge.scope, now)
                .await?;
            let record = AuthorizationCodeRecord {
                user_id: challenge.user_id,
                tenant_id: challenge.tenant_id,
                client_id: challenge.client_id.clone(),
                redirect_uri: challenge.redirect_uri.clone(),
                scope: challenge.scope.join(" "),
                nonce: challenge.nonce.clone(),
                code_challenge: challenge.code_challenge.clone(),
                code_challenge_method: challenge.code_challenge_method.clone(),
                amr: challenge.amr.clone(),
                auth_time: challenge.auth_time,
                expires_at: now.timestamp() + self.challenges.ttls().code.as_secs() as i64,
            };
            self.challenges.issue_code(&record).await
        }
        .await;

        match result {
            Ok(code) => {
                claim.commit().await?;
                Ok(code_redirect(
                    &challenge.redirect_uri,
                    &code,
                    challenge.state.as_deref(),
                ))
            }
            Err(e) => {
                claim.release().await?;
                Err(e)
            }
        }
    }

    /// Withdraws the user's consent for `client_id` and revokes the refresh
    /// tokens that client holds for them. Returns how many were revoked.
    #[tracing::instrument(skip_all, fields(tenant = %tenant.slug, %user_id, %client_id))]
    pub async fn revoke_consent(
        &self,
        tenant: &TenantRef,
        user_id: Uuid,
        client_id: &str,
        now: DateTime<Utc>,
    ) -> ServiceResult<u64> {
        let client = self.clients.resolve(tenant, client_id).await?;
        let store = self.stores.for_tenant(tenant).await?;
        store.revoke_consent(user_id, &client.client_id, now).await?;
        let revoked = self
            .tokens
            .refresh_service()
            .revoke_by_user_client(store.as_ref(), user_id, &client.client_id, now)
            .await?;
        tracing::info!(revoked, "consent revoked");
        Ok(revoked)
    }

    /// `/token`. Authenticates the client, then dispatches on `grant_type`.
    #[tracing::instrument(skip_all, fields(grant_type = %req.grant_type))]
    pub async fn token(
        &self,
        req: &TokenRequest,
        basic: Option<&BasicCredentials>,
        now: DateTime<Utc>,
    ) -> ServiceResult<TokenResponse> {
        let (tenant, client) = self
            .authenticate_client(req.tenant.as_deref(), req.client_id.as_deref(), req.client_secret.as_deref(), basic)
            .await?;

        match req.grant_type.as_str() {
            GRANT_AUTHORIZATION_CODE => self.exchange_code(&tenant, &client, req, now).await,
            GRANT_REFRESH_TOKEN => {
                let raw = required(req.refresh_token.as_deref(), "refresh_token")?;
                let store = self.stores.for_tenant(&tenant).await?;
                self.tokens
                    .refresh(store.as_ref(), &tenant, raw, &client.client_id, now)
                    .await
            }
            _ => Err(ServiceError::UnsupportedGrantType),
        }
    }

    /// Resolves the client named by Basic auth or the form and checks its
    /// secret.
    pub async fn authenticate_client(
        &self,
        tenant_hint: Option<&str>,
        form_client_id: Option<&str>,
        form_secret: Option<&str>,
        basic: Option<&BasicCredentials>,
    ) -> ServiceResult<(TenantRef, Client)> {
        let (client_id, secret) = match basic {
            Some(b) => {
                if form_client_id.is_some_and(|id| id != b.client_id) {
                    return Err(ServiceError::InvalidRequest(
                        "client_id does not match the Authorization header".to_string(),
                    ));
                }
                (b.client_id.as_str(), Some(b.client_secret.as_str()))
            }
            None => (required(form_client_id, "client_id")?, form_secret),
        };
        let tenant = self.tenants.resolve_for_client(tenant_hint, client_id)?;
        let client = self.clients.resolve(&tenant, client_id).await?;
        self.clients.authenticate(&client, secret).await?;
        Ok((tenant, client))
    }

    async fn exchange_code(
        &self,
        tenant: &TenantRef,
        client: &Client,
        req: &TokenRequest,
        now: DateTime<Utc>,
    ) -> ServiceResult<TokenResponse> {
        let code = required(req.code.as_deref(), "code")?;
        let verifier = required(req.code_verifier.as_deref(), "code_verifier")?;
        let redirect_uri = required(req.redirect_uri.as_deref(), "redirect_uri")?;

        let pending = self
            .challenges
            .code(code)
            .await?
            .ok_or(ServiceError::InvalidGrant("code is invalid or expired"))?;
        let record = &pending.value;
        if record.tenant_id != tenant.id || !constant_time_eq(&record.client_id, &client.client_id) {
            return Err(ServiceError::InvalidGrant("code was issued to another client"));
        }
        if record.redirect_uri != redirect_uri {
            return Err(ServiceError::InvalidGrant("redirect_uri does not match"));
        }
        if record.expires_at <= now.timestamp() {
            return Err(ServiceError::InvalidGrant("code is invalid or expired"));
        }
        if record.code_challenge_method != PKCE_METHOD_S256
            || !verify_pkce(verifier, &record.code_challenge)
        {
            return Err(ServiceError::InvalidGrant("PKCE verification failed"));
        }

        let claim = self
            .challenges
            .claim(&pending)
            .await?
            .ok_or(ServiceError::InvalidGrant("code is invalid or expired"))?;

        let issued = async {
            let store = self.stores.for_tenant(tenant).await?;
            let user = store
                .get_user_by_id(record.user_id)
                .await?
                .ok_or(ServiceError::InvalidGrant("code is invalid or expired"))?;
            if user.is_blocked(now) {
                return Err(ServiceError::InvalidGrant("user is disabled"));
            }
            let scopes: Vec<String> = record.scope.split_whitespace().map(str::to_string).collect();
            self.tokens
                .issue(
                    store.as_ref(),
                    tenant,
                    &user,
                    Issuance {
                        client_id: &client.client_id,
                        scopes: &scopes,
                        amr: &record.amr,
                        auth_time: record.auth_time,
                        nonce: record.nonce.as_deref(),
                        grant: GRANT_AUTHORIZATION_CODE,
                    },
                    now,
                )
                .await
        }
        .await;

        match issued {
            Ok(response) => {
                claim.commit().await?;
                Ok(response)
            }
            Err(e) => {
                claim.release().await?;
                Err(e)
            }
        }
    }

    /// RFC 7662. Tokens of any tenant other than the caller's report
    /// inactive.
    #[tracing::instrument(skip_all, fields(hint = ?token_type_hint))]
    pub async fn introspect(
        &self,
        token: &str,
        token_type_hint: Option<&str>,
        caller: &TenantRef,
        now: DateTime<Utc>,
    ) -> ServiceResult<IntrospectionResponse> {
        let looks_like_jwt = token.split('.').count() == 3;
        let try_refresh_first = token_type_hint == Some(GRANT_REFRESH_TOKEN) || !looks_like_jwt;

        if try_refresh_first {
            return self.introspect_refresh(token, caller, now).await;
        }
        match self.tokens.issuer().validate_access(token, &self.tenants, now) {
            Ok((tenant, claims)) if tenant.id == caller.id => Ok(active_access(claims)),
            Ok(_) => Ok(IntrospectionResponse::inactive()),
            Err(_) => Ok(IntrospectionResponse::inactive()),
        }
    }

    async fn introspect_refresh(
        &self,
        token: &str,
        caller: &TenantRef,
        now: DateTime<Utc>,
    ) -> ServiceResult<IntrospectionResponse> {
        let store = self.stores.for_tenant(caller).await?;
        let record = self
            .tokens
            .refresh_service()
            .lookup(store.as_ref(), token)
            .await?;
        Ok(match record {
            Some(r) if r.is_active(now) => IntrospectionResponse {
                active: true,
                scope: Some(r.scope.clone()),
                client_id: Some(r.client_id_text.clone()),
                sub: Some(r.user_id.to_string()),
                exp: Some(r.expires_at.timestamp()),
                iat: Some(r.issued_at.timestamp()),
                iss: None,
                token_type: Some(GRANT_REFRESH_TOKEN.to_string()),
                tid: Some(caller.id.to_string()),
                acr: Some(acr_for(&r.amr).to_string()),
                amr: Some(r.amr),
            },
            _ => IntrospectionResponse::inactive(),
        })
    }

    /// OIDC userinfo for a bearer access token.
    pub async fn userinfo(&self, bearer: &str, now: DateTime<Utc>) -> ServiceResult<Value> {
        let (tenant, claims) = self
            .tokens
            .issuer()
            .validate_access(bearer, &self.tenants, now)?;
        let store = self.stores.for_tenant(&tenant).await?;
        let user_id: Uuid = claims.user_id()?;
        let user = store
            .get_user_by_id(user_id)
            .await?
            .ok_or(ServiceError::InvalidToken)?;
        if user.is_blocked(now) {
            return Err(ServiceError::InvalidToken);
        }

        let mut body = json!({ "sub": user.id.to_string() });
        if claims.has_scope(SCOPE_EMAIL) {
            body["email"] = json!(user.email);
            body["email_verified"] = json!(user.email_verified);
        }
        if !user.custom_fields.0.is_empty() {
            body["custom_fields"] = Value::Object(user.custom_fields.0.clone());
        }
        Ok(body)
    }
}

fn active_access(claims: AccessClaims) -> IntrospectionResponse {
    IntrospectionResponse {
        active: true,
        scope: Some(claims.scp),
        client_id: Some(claims.aud),
        sub: Some(claims.sub),
        exp: Some(claims.exp),
        iat: Some(claims.iat),
        iss: Some(claims.iss),
        token_type: Some("access_token".to_string()),
        tid: Some(claims.tid),
        amr: Some(claims.amr),
        acr: Some(claims.acr),
    }
}

fn required<'a>(value: Option<&'a str>, name: &str) -> ServiceResult<&'a str> {
    value
        .filter(|v| !v.is_empty())
        .ok_or_else(|| ServiceError::InvalidRequest(format!("{} is required", name)))
}

/// OAuth error code and a description that is safe to put in a URL.
fn redirect_error_of(err: ServiceError) -> (&'static str, String) {
    let description = err.to_string();
    let app = AppError::from(err);
    if app.status().is_server_error() {
        return ("server_error", "Internal server error".to_string());
    }
    (app.code(), description)
}

fn with_query(base: &str, pairs: &[(&str, &str)]) -> String {
    match Url::parse(base) {
        Ok(mut url) => {
            {
                let mut q = url.query_pairs_mut();
                for (k, v) in pairs {
                    q.append_pair(k, v);
                }
            }
            url.into()
        }
        Err(_) => base.to_string(),
    }
}

fn code_redirect(redirect_uri: &str, code: &str, state: Option<&str>) -> String {
    let mut pairs = vec![("code", code)];
    if let Some(state) = state {
        pairs.push(("state", state));
    }
    with_query(redirect_uri, &pairs)
}

pub fn error_redirect(
    redirect_uri: &str,
    code: &str,
    description: &str,
    state: Option<&str>,
) -> String {
    let mut pairs = vec![("error", code), ("error_description", description)];
    if let Some(state) = state {
        pairs.push(("state", state));
    }
    with_query(redirect_uri, &pairs)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn code_redirect_keeps_registered_query() {
        let url = code_redirect("https://app.example/cb?x=1", "abc", Some("xyz"));
        assert_eq!(url, "https://app.example/cb?x=1&code=abc&state=xyz");
    }

    #[test]
    fn redirect_errors_hide_internal_details() {
        let (code, desc) =
            redirect_error_of(ServiceError::Internal(anyhow::anyhow!("pool exhausted on db-7")));
        assert_eq!(code, "server_error");
        assert!(!desc.contains("db-7"));

        let (code, _) = redirect_error_of(ServiceError::InvalidScope("nope".into()));
        assert_eq!(code, "invalid_scope");
        let (code, _) = redirect_error_of(ServiceError::LoginRequired);
        assert_eq!(code, "login_required");
        let (code, _) = redirect_error_of(ServiceError::ConsentRequired);
        assert_eq!(code, "consent_required");
    }

    #[test]
    fn error_redirect_encodes_description() {
        let url = error_redirect("https://app.example/cb", "access_denied", "a b&c", None);
        assert_eq!(
            url,
            "https://app.example/cb?error=access_denied&error_description=a+b%26c"
        );
    }
}
