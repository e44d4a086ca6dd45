//! Shared harness for the HTTP-level tests.
//!
//! Everything runs in-process: in-memory catalog, stores and cache, a
//! recording email provider and a canned Google exchange. Requests go through
//! the full router with `oneshot`.

#![allow(dead_code)]

use async_trait::async_trait;
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use axum::{
    body::{Body, Bytes},
    http::{header, HeaderMap, Request, StatusCode},
    Router,
};
use hellojohn::{
    build_router,
    config::{
        AdmissionConfig, EmailWorkerConfig, Environment, GoogleConfig, IdpConfig, IssuerConfig,
        KeyConfig, PasswordPolicyConfig, RateLimitConfig, SecretsConfig, SecurityConfig,
        SmtpConfig, StorageConfig, TimeoutConfig, TokenConfig,
    },
    models::{Client, ClientType, IssuerMode, Tenant, TenantRef, TenantSettings},
    services::{
        social::{GoogleCredentials, GoogleIdentity},
        Catalog, GoogleExchange, MemoryCache, MemoryStores, MockEmailService, ServiceResult,
    },
    utils::pkce_s256,
    AppState, Backends,
};
use http_body_util::BodyExt;
use secrecy::SecretString;
use serde_json::Value;
use service_core::observability::metrics::init_metrics;
use std::sync::Arc;
use std::time::Duration;
use tower::util::ServiceExt;
use url::Url;

pub const TEST_ADMIN_API_KEY: &str = "test-admin-key-12345";
pub const BASE_URL: &str = "http://localhost:8080";
pub const UI_BASE_URL: &str = "http://localhost:3000";

pub const TENANT: &str = "acme";
pub const OTHER_TENANT: &str = "globex";
pub const WEB_CLIENT: &str = "app-web";
pub const CONSENT_CLIENT: &str = "app-consent";
pub const BACKEND_CLIENT: &str = "acme-backend";
pub const OTHER_BACKEND_CLIENT: &str = "globex-backend";
pub const BACKEND_SECRET: &str = "backend-secret-value";
pub const REDIRECT_URI: &str = "https://app.example/cb";

pub const PASSWORD: &str = "correct horse battery";
pub const VERIFIER: &str = "dBjftJeZ4CVP-mB92K27uhbUJU1p1r_wW1gFWFOEjXk";

pub fn test_config() -> IdpConfig {
    IdpConfig {
        common: service_core::config::Config::default(),
        environment: Environment::Dev,
        service_name: "hellojohn-test".to_string(),
        service_version: "0.0.0-test".to_string(),
        log_level: "error".to_string(),
        otlp_endpoint: None,
        issuer: IssuerConfig {
            base_url: BASE_URL.to_string(),
            ui_base_url: UI_BASE_URL.to_string(),
        },
        storage: StorageConfig {
            database_url: None,
            tenant_db_max_connections: 2,
            redis_url: None,
            control_plane_dir: None,
        },
        tokens: TokenConfig {
            access_ttl_seconds: 900,
            id_token_ttl_seconds: 900,
            refresh_ttl_seconds: 86_400,
            code_ttl_seconds: 60,
            session_ttl_seconds: 3600,
            mfa_token_ttl_seconds: 300,
            consent_token_ttl_seconds: 600,
            social_code_ttl_seconds: 60,
            social_state_ttl_seconds: 600,
            email_verify_ttl_seconds: 86_400,
            password_reset_ttl_seconds: 3600,
        },
        secrets: SecretsConfig {
            mfa_master_key: SecretString::new("11".repeat(32)),
            secretbox_master_key: SecretString::new("22".repeat(32)),
        },
        keys: KeyConfig {
            rotation_grace_seconds: 3600,
        },
        password_policy: PasswordPolicyConfig {
            min_length: 10,
            require_upper: false,
            require_lower: false,
            require_digit: false,
            require_symbol: false,
            blacklist_path: None,
            argon2_memory_kib: 1024,
            argon2_iterations: 1,
            argon2_parallelism: 1,
        },
        google: GoogleConfig {
            client_id: Some("google-client-id".to_string()),
            client_secret: Some(SecretString::new("google-client-secret".to_string())),
            redirect_uri: None,
        },
        smtp: SmtpConfig {
            host: None,
            port: 587,
            username: None,
            password: None,
            from: "HelloJohn <no-reply@localhost>".to_string(),
            starttls: true,
        },
        security: SecurityConfig {
            allowed_origins: vec![UI_BASE_URL.to_string()],
            admin_api_key: SecretString::new(TEST_ADMIN_API_KEY.to_string()),
            session_cookie_name: "sid".to_string(),
            trusted_device_cookie_name: "mfa_td".to_string(),
            trusted_device_ttl_days: 30,
        },
        rate_limit: RateLimitConfig {
            login_attempts: 1000,
            login_window_seconds: 60,
            register_attempts: 1000,
            register_window_seconds: 60,
            forgot_attempts: 1000,
            forgot_window_seconds: 60,
            mfa_attempts: 1000,
            mfa_window_seconds: 60,
            global_ip_limit: 10_000,
            global_ip_window_seconds: 60,
        },
        admission: AdmissionConfig {
            max_inflight_per_tenant: 64,
        },
        timeouts: TimeoutConfig {
            auth_seconds: 10,
            smtp_seconds: 5,
        },
        email_workers: EmailWorkerConfig {
            workers: 1,
            queue_capacity: 16,
        },
    }
}

/// Treats the authorization code as the Google account's email.
pub struct StubGoogle;

#[async_trait]
impl GoogleExchange for StubGoogle {
    async fn exchange(
        &self,
        _creds: &GoogleCredentials,
        code: &str,
        _code_verifier: &str,
        _nonce: &str,
    ) -> ServiceResult<GoogleIdentity> {
        Ok(GoogleIdentity {
            subject: format!("google-{}", code),
            email: code.to_string(),
            email_verified: true,
        })
    }
}

fn path_tenant(slug: &str) -> Tenant {
    Tenant::new(
        slug,
        slug,
        TenantSettings {
            issuer_mode: IssuerMode::Path,
            ..Default::default()
        },
    )
}

pub fn public_client(client_id: &str) -> Client {
    Client {
        client_id: client_id.to_string(),
        tenant_id: uuid::Uuid::nil(),
        name: client_id.to_string(),
        client_type: ClientType::Public,
        secret_hash: None,
        redirect_uris: vec![REDIRECT_URI.to_string()],
        scopes: vec!["openid".to_string(), "email".to_string()],
        providers: vec![],
        require_email_verification: false,
        require_consent: false,
        reset_password_url: None,
        verify_email_url: None,
    }
}

pub struct TestResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl TestResponse {
    pub fn json(&self) -> Value {
        serde_json::from_slice(&self.body).unwrap_or(Value::Null)
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    pub fn location(&self) -> Url {
        Url::parse(self.header("location").expect("no Location header")).expect("bad Location")
    }

    /// Value of a `Set-Cookie` entry by name.
    pub fn cookie(&self, name: &str) -> Option<String> {
        self.headers
            .get_all(header::SET_COOKIE)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .filter_map(|v| v.split(';').next())
            .filter_map(|pair| pair.split_once('='))
            .find(|(k, _)| k.trim() == name)
            .map(|(_, v)| v.to_string())
    }
}

pub fn query_param(url: &Url, name: &str) -> Option<String> {
    url.query_pairs()
        .find(|(k, _)| k == name)
        .map(|(_, v)| v.into_owned())
}

pub fn form_body(pairs: &[(&str, &str)]) -> String {
    serde_urlencoded::to_string(pairs).expect("form encoding")
}

pub fn json_request(method: &str, uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

pub fn form_request(uri: &str, pairs: &[(&str, &str)]) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/x-www-form-urlencoded")
        .body(Body::from(form_body(pairs)))
        .unwrap()
}

pub fn refresh_request(refresh_token: &str) -> Request<Body> {
    form_request(
        "/token",
        &[
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_token),
            ("client_id", WEB_CLIENT),
        ],
    )
}

pub fn get_request(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

pub struct TestApp {
    pub state: AppState,
    pub router: Router,
    pub email: MockEmailService,
    pub tenant: TenantRef,
    pub other_tenant: TenantRef,
}

impl TestApp {
    pub async fn spawn() -> Self {
        Self::with_config(test_config()).await
    }

    pub async fn with_config(config: IdpConfig) -> Self {
        let email = MockEmailService::new();
        let backends = Backends {
            catalog: Arc::new(Catalog::in_memory()),
            stores: Arc::new(MemoryStores::new()),
            cache: Arc::new(MemoryCache::new()),
            email: Arc::new(email.clone()),
            google: Arc::new(StubGoogle),
            mutation_log: None,
        };
        let (state, _workers) = AppState::assemble(config, backends, init_metrics())
            .await
            .expect("Failed to assemble state");

        let tenant = state
            .control
            .upsert_tenant(path_tenant(TENANT))
            .await
            .expect("tenant");
        state
            .control
            .upsert_client(TENANT, public_client(WEB_CLIENT))
            .await
            .expect("web client");
        let mut consent = public_client(CONSENT_CLIENT);
        consent.require_consent = true;
        state
            .control
            .upsert_client(TENANT, consent)
            .await
            .expect("consent client");
        state
            .control
            .upsert_confidential_client(TENANT, public_client(BACKEND_CLIENT), BACKEND_SECRET)
            .await
            .expect("backend client");

        let other_tenant = state
            .control
            .upsert_tenant(path_tenant(OTHER_TENANT))
            .await
            .expect("other tenant");
        state
            .control
            .upsert_confidential_client(
                OTHER_TENANT,
                public_client(OTHER_BACKEND_CLIENT),
                BACKEND_SECRET,
            )
            .await
            .expect("other backend client");

        let router = build_router(state.clone())
            .await
            .expect("Failed to build router");

        Self {
            state,
            router,
            email,
            tenant,
            other_tenant,
        }
    }

    pub async fn send(&self, request: Request<Body>) -> TestResponse {
        let response = self.router.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let headers = response.headers().clone();
        let body = response.into_body().collect().await.unwrap().to_bytes();
        TestResponse {
            status,
            headers,
            body,
        }
    }

    /// Registers through the public endpoint and returns the response body.
    pub async fn register(&self, email: &str) -> Value {
        let response = self
            .send(json_request(
                "POST",
                "/auth/register",
                serde_json::json!({
                    "tenant": TENANT,
                    "client_id": WEB_CLIENT,
                    "email": email,
                    "password": PASSWORD,
                }),
            ))
            .await;
        assert_eq!(response.status, StatusCode::CREATED, "{:?}", response.json());
        response.json()
    }

    pub async fn password_login(&self, email: &str, password: &str) -> TestResponse {
        self.send(json_request(
            "POST",
            "/auth/login",
            serde_json::json!({
                "tenant": TENANT,
                "client_id": WEB_CLIENT,
                "email": email,
                "password": password,
            }),
        ))
        .await
    }

    /// Starts a browser session and returns the raw cookie value.
    pub async fn session_cookie(&self, email: &str) -> String {
        let response = self
            .send(json_request(
                "POST",
                "/session/login",
                serde_json::json!({
                    "tenant": TENANT,
                    "client_id": WEB_CLIENT,
                    "email": email,
                    "password": PASSWORD,
                }),
            ))
            .await;
        assert_eq!(response.status, StatusCode::NO_CONTENT);
        response.cookie("sid").expect("session cookie")
    }

    pub fn authorize_uri(&self, client_id: &str, state: &str) -> String {
        format!(
            "/authorize?{}",
            form_body(&[
                ("response_type", "code"),
                ("client_id", client_id),
                ("redirect_uri", REDIRECT_URI),
                ("scope", "openid email"),
                ("state", state),
                ("nonce", "n-0S6_WzA2Mj"),
                ("code_challenge", &pkce_s256(VERIFIER)),
                ("code_challenge_method", "S256"),
            ])
        )
    }

    pub async fn authorize(&self, client_id: &str, cookies: &[(&str, &str)]) -> TestResponse {
        let mut builder = Request::builder().uri(self.authorize_uri(client_id, "xyz"));
        if !cookies.is_empty() {
            let cookie = cookies
                .iter()
                .map(|(k, v)| format!("{}={}", k, v))
                .collect::<Vec<_>>()
                .join("; ");
            builder = builder.header(header::COOKIE, cookie);
        }
        self.send(builder.body(Body::empty()).unwrap()).await
    }

    pub async fn exchange_code(&self, code: &str, verifier: &str) -> TestResponse {
        self.send(form_request(
            "/token",
            &[
                ("grant_type", "authorization_code"),
                ("code", code),
                ("code_verifier", verifier),
                ("redirect_uri", REDIRECT_URI),
                ("client_id", WEB_CLIENT),
            ],
        ))
        .await
    }

    /// Session login, `/authorize` and the code exchange in one go.
    pub async fn code_flow_tokens(&self, email: &str) -> Value {
        let sid = self.session_cookie(email).await;
        let authorized = self.authorize(WEB_CLIENT, &[("sid", &sid)]).await;
        assert_eq!(authorized.status, StatusCode::FOUND);
        let code = query_param(&authorized.location(), "code").expect("code in redirect");
        let tokens = self.exchange_code(&code, VERIFIER).await;
        assert_eq!(tokens.status, StatusCode::OK, "{:?}", tokens.json());
        tokens.json()
    }

    /// Waits for the background email workers to deliver to `to`.
    pub async fn wait_for_email(&self, to: &str) -> hellojohn::services::email::EmailMessage {
        for _ in 0..50 {
            if let Some(message) = self.email.last_to(to) {
                return message;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("no email delivered to {}", to);
    }
}

/// Pulls the first `token=` value out of an email body.
pub fn token_from_email(body: &str) -> String {
    let start = body.find("token=").expect("token in email") + "token=".len();
    let rest = &body[start..];
    let end = rest
        .find(|c: char| c == '&' || c == '"' || c.is_whitespace())
        .unwrap_or(rest.len());
    urlencoding::decode(&rest[..end])
        .expect("token encoding")
        .into_owned()
}

/// Decodes a JWT payload without checking the signature.
pub fn jwt_claims(token: &str) -> Value {
    let payload = token.split('.').nth(1).expect("JWT payload segment");
    let bytes = URL_SAFE_NO_PAD.decode(payload).expect("JWT payload encoding");
    serde_json::from_slice(&bytes).expect("JWT payload JSON")
}
