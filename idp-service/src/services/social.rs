//! Google sign-in: authorization redirect, code exchange, ID token
//! verification against Google's JWKS, and the one-shot login code handed back
//! to the client.

use async_trait::async_trait;
use chrono::Utc;
use jsonwebtoken::{decode, decode_header, jwk::JwkSet, Algorithm, DecodingKey, Validation};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use url::Url;
use uuid::Uuid;

use super::cache::{get_json, put_json, Cache, CacheKey, SingleUseClaim};
use super::client_resolver::{is_provider_allowed, validate_redirect_uri};
use super::crypto::SecretBox;
use super::error::{ServiceError, ServiceResult};
use crate::config::GoogleConfig;
use crate::models::{Client, SocialLoginCode, SocialState, TenantRef, PROVIDER_GOOGLE};
use crate::utils::{constant_time_eq, generate_opaque_token, pkce_s256};

pub const GOOGLE_AUTH_URL: &str = "https://accounts.google.com/o/oauth2/v2/auth";
pub const GOOGLE_TOKEN_URL: &str = "https://oauth2.googleapis.com/token";
pub const GOOGLE_JWKS_URL: &str = "https://www.googleapis.com/oauth2/v3/certs";
const GOOGLE_ISSUERS: [&str; 2] = ["https://accounts.google.com", "accounts.google.com"];
const JWKS_CACHE_TTL: Duration = Duration::from_secs(3600);

/// Effective Google credentials for one tenant.
#[derive(Clone)]
pub struct GoogleCredentials {
    pub client_id: String,
    pub client_secret: SecretString,
    pub redirect_uri: String,
    pub allowed_domains: Vec<String>,
}

/// Tenant settings win over deployment defaults. A tenant that configured
/// Google but switched it off gets nothing.
pub fn google_credentials(
    tenant: &TenantRef,
    defaults: &GoogleConfig,
    secret_box: &SecretBox,
    base_url: &str,
) -> ServiceResult<Option<GoogleCredentials>> {
    let redirect_uri = defaults
        .redirect_uri
        .clone()
        .unwrap_or_else(|| format!("{}/auth/social/google/callback", base_url));

    if let Some(google) = &tenant.settings.google {
        if !google.enabled || google.client_id.is_empty() {
            return Ok(None);
        }
        return Ok(Some(GoogleCredentials {
            client_id: google.client_id.clone(),
            client_secret: SecretString::new(secret_box.open_string(&google.client_secret_enc)?),
            redirect_uri,
            allowed_domains: google.allowed_domains.clone(),
        }));
    }

    match (&defaults.client_id, &defaults.client_secret) {
        (Some(id), Some(secret)) => Ok(Some(GoogleCredentials {
            client_id: id.clone(),
            client_secret: secret.clone(),
            redirect_uri,
            allowed_domains: Vec::new(),
        })),
        _ => Ok(None),
    }
}

/// Verified facts about the Google account.
#[derive(Debug, Clone, PartialEq)]
pub struct GoogleIdentity {
    pub subject: String,
    pub email: String,
    pub email_verified: bool,
}

#[derive(Debug, Deserialize)]
struct GoogleIdClaims {
    sub: String,
    #[serde(default)]
    email: Option<String>,
    #[serde(default)]
    email_verified: Option<bool>,
    #[serde(default)]
    nonce: Option<String>,
    #[serde(default)]
    hd: Option<String>,
}

/// Checks that apply after the signature, audience, issuer and expiry.
fn check_google_claims(
    claims: GoogleIdClaims,
    expected_nonce: &str,
    allowed_domains: &[String],
) -> ServiceResult<GoogleIdentity> {
    match claims.nonce.as_deref() {
        Some(n) if constant_time_eq(n, expected_nonce) => {}
        _ => return Err(ServiceError::ExchangeFailed("nonce mismatch".to_string())),
    }
    let email = claims
        .email
        .ok_or_else(|| ServiceError::ExchangeFailed("id_token has no email".to_string()))?;

    if !allowed_domains.is_empty() {
        let domain = claims
            .hd
            .or_else(|| email.rsplit_once('@').map(|(_, d)| d.to_string()))
            .unwrap_or_default()
            .to_lowercase();
        if !allowed_domains.iter().any(|d| d.eq_ignore_ascii_case(&domain)) {
            return Err(ServiceError::ProviderNotAllowed(PROVIDER_GOOGLE.to_string()));
        }
    }

    Ok(GoogleIdentity {
        subject: claims.sub,
        email,
        email_verified: claims.email_verified.unwrap_or(false),
    })
}

/// The upstream leg of the flow. Swapped out in tests.
#[async_trait]
pub trait GoogleExchange: Send + Sync {
    async fn exchange(
        &self,
        creds: &GoogleCredentials,
        code: &str,
        code_verifier: &str,
        nonce: &str,
    ) -> ServiceResult<GoogleIdentity>;
}

#[derive(Debug, Deserialize)]
struct GoogleTokenResponse {
    id_token: String,
}

pub struct GoogleOidc {
    http: reqwest::Client,
    jwks: RwLock<Option<(Instant, Arc<JwkSet>)>>,
}

impl GoogleOidc {
    pub fn new(timeout: Duration) -> ServiceResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ServiceError::Internal(e.into()))?;
        Ok(Self {
            http,
            jwks: RwLock::new(None),
        })
    }

    async fn fetch_jwks(&self) -> ServiceResult<Arc<JwkSet>> {
        let res = self.http.get(GOOGLE_JWKS_URL).send().await.map_err(|e| {
            tracing::error!(error = %e, "Failed to fetch Google JWKS");
            ServiceError::ExchangeFailed("jwks fetch failed".to_string())
        })?;
        let set: JwkSet = res.json().await.map_err(|e| {
            tracing::error!(error = %e, "Failed to parse Google JWKS");
            ServiceError::ExchangeFailed("jwks parse failed".to_string())
        })?;
        let set = Arc::new(set);
        *self.jwks.write().await = Some((Instant::now(), set.clone()));
        Ok(set)
    }

    /// Cached set, refetched when stale or when `kid` is unknown.
    async fn decoding_key(&self, kid: &str) -> ServiceResult<DecodingKey> {
        let cached = self
            .jwks
            .read()
            .await
            .as_ref()
            .filter(|(at, _)| at.elapsed() < JWKS_CACHE_TTL)
            .map(|(_, set)| set.clone());

        let set = match cached {
            Some(set) if set.find(kid).is_some() => set,
            _ => self.fetch_jwks().await?,
        };
        let jwk = set
            .find(kid)
            .ok_or_else(|| ServiceError::ExchangeFailed("unknown signing key".to_string()))?;
        DecodingKey::from_jwk(jwk).map_err(|e| ServiceError::ExchangeFailed(e.to_string()))
    }
}

#[async_trait]
impl GoogleExchange for GoogleOidc {
    #[tracing::instrument(skip_all)]
    async fn exchange(
        &self,
        creds: &GoogleCredentials,
        code: &str,
        code_verifier: &str,
        nonce: &str,
    ) -> ServiceResult<GoogleIdentity> {
        let token_res = self
            .http
            .post(GOOGLE_TOKEN_URL)
            .form(&[
                ("client_id", creds.client_id.as_str()),
                ("client_secret", creds.client_secret.expose_secret().as_str()),
                ("code", code),
                ("code_verifier", code_verifier),
                ("grant_type", "authorization_code"),
                ("redirect_uri", creds.redirect_uri.as_str()),
            ])
            .send()
            .await
            .map_err(|e| {
                tracing::error!(error = %e, "Failed to exchange Google code");
                ServiceError::ExchangeFailed("token request failed".to_string())
            })?;

        if !token_res.status().is_success() {
            let status = token_res.status();
            let body = token_res.text().await.unwrap_or_default();
            tracing::error!(%status, body = %body, "Google token exchange error");
            return Err(ServiceError::ExchangeFailed(format!("status {}", status)));
        }

        let token: GoogleTokenResponse = token_res.json().await.map_err(|e| {
            tracing::error!(error = %e, "Failed to parse Google token response");
            ServiceError::ExchangeFailed("token response parse failed".to_string())
        })?;

        let header = decode_header(&token.id_token)
            .map_err(|e| ServiceError::ExchangeFailed(e.to_string()))?;
        let kid = header
            .kid
            .ok_or_else(|| ServiceError::ExchangeFailed("id_token has no kid".to_string()))?;
        let key = self.decoding_key(&kid).await?;

        let mut validation = Validation::new(Algorithm::RS256);
        validation.set_audience(&[creds.client_id.as_str()]);
        validation.set_issuer(&GOOGLE_ISSUERS);
        validation.leeway = 30;

        let data = decode::<GoogleIdClaims>(&token.id_token, &key, &validation).map_err(|e| {
            tracing::warn!(error = %e, "Google id_token rejected");
            ServiceError::ExchangeFailed("id_token rejected".to_string())
        })?;

        check_google_claims(data.claims, nonce, &creds.allowed_domains)
    }
}

/// A callback whose state entry is claimed but not yet consumed. Commit it
/// once the login it starts has been persisted.
pub struct PendingSocialLogin {
    pub state: SocialState,
    pub identity: GoogleIdentity,
    pub claim: SingleUseClaim,
}

pub struct SocialService {
    cache: Arc<dyn Cache>,
    exchange: Arc<dyn GoogleExchange>,
    defaults: GoogleConfig,
    secret_box: Arc<SecretBox>,
    base_url: String,
    state_ttl: Duration,
    code_ttl: Duration,
}

impl SocialService {
    pub fn new(
        cache: Arc<dyn Cache>,
        exchange: Arc<dyn GoogleExchange>,
        defaults: GoogleConfig,
        secret_box: Arc<SecretBox>,
        base_url: &str,
        state_ttl: Duration,
        code_ttl: Duration,
    ) -> Self {
        Self {
            cache,
            exchange,
            defaults,
            secret_box,
            base_url: base_url.trim_end_matches('/').to_string(),
            state_ttl,
            code_ttl,
        }
    }

    pub fn credentials(&self, tenant: &TenantRef) -> ServiceResult<Option<GoogleCredentials>> {
        google_credentials(tenant, &self.defaults, &self.secret_box, &self.base_url)
    }

    pub fn is_ready(&self, tenant: &TenantRef) -> bool {
        matches!(self.credentials(tenant), Ok(Some(_)))
    }

    /// Builds the Google authorization URL and parks the round-trip state.
    #[tracing::instrument(skip(self, tenant, client), fields(tenant = %tenant.slug, client_id = %client.client_id))]
    pub async fn start(
        &self,
        tenant: &TenantRef,
        client: &Client,
        redirect_uri: &str,
    ) -> ServiceResult<String> {
        if !is_provider_allowed(client, PROVIDER_GOOGLE) {
            return Err(ServiceError::ProviderNotAllowed(PROVIDER_GOOGLE.to_string()));
        }
        if !validate_redirect_uri(client, redirect_uri) {
            return Err(ServiceError::InvalidRedirectUri);
        }
        let creds = self
            .credentials(tenant)?
            .ok_or_else(|| ServiceError::ProviderNotConfigured(PROVIDER_GOOGLE.to_string()))?;

        let state = generate_opaque_token();
        let payload = SocialState {
            tenant_id: tenant.id,
            client_id: client.client_id.clone(),
            redirect_uri: redirect_uri.to_string(),
            nonce: generate_opaque_token(),
            code_verifier: generate_opaque_token(),
        };
        put_json(
            self.cache.as_ref(),
            &CacheKey::social_state(&state),
            &payload,
            self.state_ttl,
        )
        .await?;

        let mut url = Url::parse(GOOGLE_AUTH_URL).map_err(|e| ServiceError::Internal(e.into()))?;
        url.query_pairs_mut()
            .append_pair("client_id", &creds.client_id)
            .append_pair("redirect_uri", &creds.redirect_uri)
            .append_pair("response_type", "code")
            .append_pair("scope", "openid email profile")
            .append_pair("state", &state)
            .append_pair("nonce", &payload.nonce)
            .append_pair("code_challenge", &pkce_s256(&payload.code_verifier))
            .append_pair("code_challenge_method", "S256");
        Ok(url.into())
    }

    /// Validates the state, claims it and runs the upstream exchange. The
    /// state entry survives a failed exchange until its TTL.
    #[tracing::instrument(skip_all)]
    pub async fn callback(
        &self,
        tenant_for: impl Fn(Uuid) -> ServiceResult<TenantRef>,
        state: &str,
        code: &str,
    ) -> ServiceResult<(TenantRef, PendingSocialLogin)> {
        let key = CacheKey::social_state(state);
        let payload: SocialState = get_json(self.cache.as_ref(), &key)
            .await?
            .ok_or(ServiceError::InvalidRequest("unknown or expired state".to_string()))?;
        let tenant = tenant_for(payload.tenant_id)?;
        let creds = self
            .credentials(&tenant)?
            .ok_or_else(|| ServiceError::ProviderNotConfigured(PROVIDER_GOOGLE.to_string()))?;

        let claim = SingleUseClaim::acquire(self.cache.clone(), &key)
            .await?
            .ok_or(ServiceError::InvalidRequest("state already used".to_string()))?;

        let identity = match self
            .exchange
            .exchange(&creds, code, &payload.code_verifier, &payload.nonce)
            .await
        {
            Ok(identity) => identity,
            Err(e) => {
                claim.release().await?;
                return Err(e);
            }
        };

        Ok((
            tenant,
            PendingSocialLogin {
                state: payload,
                identity,
                claim,
            },
        ))
    }

    /// Parks the login response under a one-shot code for the client.
    pub async fn park_login(
        &self,
        tenant_id: Uuid,
        client_id: &str,
        response: serde_json::Value,
    ) -> ServiceResult<String> {
        let code = generate_opaque_token();
        let record = SocialLoginCode {
            tenant_id,
            client_id: client_id.to_string(),
            response,
        };
        put_json(
            self.cache.as_ref(),
            &CacheKey::social_code(&code),
            &record,
            self.code_ttl,
        )
        .await?;
        Ok(code)
    }

    /// Redeems a parked login once, for the client it was issued to.
    pub async fn redeem(&self, code: &str, client_id: &str) -> ServiceResult<serde_json::Value> {
        let key = CacheKey::social_code(code);
        let record: SocialLoginCode = get_json(self.cache.as_ref(), &key)
            .await?
            .ok_or(ServiceError::InvalidGrant("login code is invalid or expired"))?;
        if record.client_id != client_id {
            return Err(ServiceError::InvalidGrant("login code was issued to another client"));
        }
        let claim = SingleUseClaim::acquire(self.cache.clone(), &key)
            .await?
            .ok_or(ServiceError::InvalidGrant("login code is invalid or expired"))?;
        claim.commit().await?;
        tracing::info!(tenant_id = %record.tenant_id, client_id, at = %Utc::now(), "social login code redeemed");
        Ok(record.response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ClientType, GoogleSettings, Tenant, TenantSettings};
    use crate::services::cache::MemoryCache;

    struct StubGoogle;

    #[async_trait]
    impl GoogleExchange for StubGoogle {
        async fn exchange(
            &self,
            _creds: &GoogleCredentials,
            code: &str,
            _code_verifier: &str,
            _nonce: &str,
        ) -> ServiceResult<GoogleIdentity> {
            if code == "bad" {
                return Err(ServiceError::ExchangeFailed("status 400".into()));
            }
            Ok(GoogleIdentity {
                subject: "g-1".into(),
                email: "u@x".into(),
                email_verified: true,
            })
        }
    }

    fn secret_box() -> Arc<SecretBox> {
        Arc::new(SecretBox::new(&[3u8; 32]))
    }

    fn google_tenant(sbox: &SecretBox) -> TenantRef {
        let settings = TenantSettings {
            google: Some(GoogleSettings {
                enabled: true,
                client_id: "gid".into(),
                client_secret_enc: sbox.seal_str("gsecret").unwrap(),
                allowed_domains: vec![],
            }),
            ..Default::default()
        };
        Tenant::new("acme", "Acme", settings).to_ref()
    }

    fn client() -> Client {
        Client {
            client_id: "app-web".into(),
            tenant_id: Uuid::nil(),
            name: "App".into(),
            client_type: ClientType::Public,
            secret_hash: None,
            redirect_uris: vec!["https://app.example/cb".into()],
            scopes: vec!["openid".into()],
            providers: vec![],
            require_email_verification: false,
            require_consent: false,
            reset_password_url: None,
            verify_email_url: None,
        }
    }

    fn service(sbox: Arc<SecretBox>) -> SocialService {
        SocialService::new(
            Arc::new(MemoryCache::new()),
            Arc::new(StubGoogle),
            GoogleConfig {
                client_id: None,
                client_secret: None,
                redirect_uri: None,
            },
            sbox,
            "https://idp.example",
            Duration::from_secs(600),
            Duration::from_secs(60),
        )
    }

    fn state_param(url: &str) -> String {
        Url::parse(url)
            .unwrap()
            .query_pairs()
            .find(|(k, _)| k == "state")
            .map(|(_, v)| v.into_owned())
            .unwrap()
    }

    #[test]
    fn credentials_prefer_tenant_and_respect_disable() {
        let sbox = SecretBox::new(&[3u8; 32]);
        let defaults = GoogleConfig {
            client_id: Some("default-id".into()),
            client_secret: Some(SecretString::new("default-secret".into())),
            redirect_uri: None,
        };

        let mut tenant = google_tenant(&sbox);
        let creds = google_credentials(&tenant, &defaults, &sbox, "https://idp.example")
            .unwrap()
            .unwrap();
        assert_eq!(creds.client_id, "gid");
        assert_eq!(creds.client_secret.expose_secret(), "gsecret");
        assert_eq!(creds.redirect_uri, "https://idp.example/auth/social/google/callback");

        let mut settings = (*tenant.settings).clone();
        if let Some(g) = settings.google.as_mut() {
            g.enabled = false;
        }
        tenant.settings = Arc::new(settings);
        assert!(google_credentials(&tenant, &defaults, &sbox, "x").unwrap().is_none());

        let plain = Tenant::new("plain", "Plain", Default::default()).to_ref();
        let creds = google_credentials(&plain, &defaults, &sbox, "x").unwrap().unwrap();
        assert_eq!(creds.client_id, "default-id");
    }

    #[test]
    fn claim_checks() {
        let claims = || GoogleIdClaims {
            sub: "g-1".into(),
            email: Some("u@corp.example".into()),
            email_verified: Some(true),
            nonce: Some("n".into()),
            hd: None,
        };
        assert!(check_google_claims(claims(), "n", &[]).is_ok());
        assert!(check_google_claims(claims(), "other", &[]).is_err());
        assert!(check_google_claims(claims(), "n", &["corp.example".into()]).is_ok());
        assert!(matches!(
            check_google_claims(claims(), "n", &["else.example".into()]),
            Err(ServiceError::ProviderNotAllowed(_))
        ));
    }

    #[tokio::test]
    async fn state_survives_failed_exchange_and_is_single_use() {
        let sbox = secret_box();
        let social = service(sbox.clone());
        let tenant = google_tenant(&sbox);
        let lookup = {
            let tenant = tenant.clone();
            move |_id: Uuid| Ok(tenant.clone())
        };

        let url = social
            .start(&tenant, &client(), "https://app.example/cb")
            .await
            .unwrap();
        assert!(url.starts_with(GOOGLE_AUTH_URL));
        let state = state_param(&url);

        assert!(social.callback(&lookup, &state, "bad").await.is_err());

        let (_, pending) = social.callback(&lookup, &state, "good").await.unwrap();
        assert_eq!(pending.identity.subject, "g-1");
        assert_eq!(pending.state.client_id, "app-web");
        pending.claim.commit().await.unwrap();

        assert!(social.callback(&lookup, &state, "good").await.is_err());
    }

    #[tokio::test]
    async fn parked_login_redeems_once_for_its_client() {
        let sbox = secret_box();
        let social = service(sbox);
        let code = social
            .park_login(Uuid::new_v4(), "app-web", serde_json::json!({"access_token": "t"}))
            .await
            .unwrap();

        assert!(social.redeem(&code, "other").await.is_err());
        let body = social.redeem(&code, "app-web").await.unwrap();
        assert_eq!(body["access_token"], "t");
        assert!(social.redeem(&code, "app-web").await.is_err());
    }

    #[tokio::test]
    async fn start_rejects_unregistered_redirects() {
        let sbox = secret_box();
        let social = service(sbox.clone());
        let tenant = google_tenant(&sbox);
        assert!(matches!(
            social.start(&tenant, &client(), "https://evil.example/cb").await,
            Err(ServiceError::InvalidRedirectUri)
        ));
    }
}
