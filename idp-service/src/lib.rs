pub mod config;
pub mod dtos;
pub mod handlers;
pub mod middleware;
pub mod models;
pub mod services;
pub mod utils;

use axum::{
    http::{header, HeaderName, HeaderValue, Method},
    middleware::{from_fn, from_fn_with_state},
    routing::{get, post},
    Router,
};
use chrono::Utc;
use metrics_exporter_prometheus::PrometheusHandle;
use service_core::error::AppError;
use service_core::middleware::{
    metrics::metrics_middleware,
    panic::handle_panic,
    rate_limit::{create_ip_rate_limiter, ip_rate_limit_middleware, IpRateLimiter},
    security_headers::security_headers_middleware,
    tracing::request_id_middleware,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tower_http::{
    catch_panic::CatchPanicLayer, cors::CorsLayer, timeout::TimeoutLayer, trace::TraceLayer,
};

use crate::config::IdpConfig;
use crate::services::auth::EmailFlowSettings;
use crate::services::{
    AuthService, Cache, Catalog, ChallengeCache, ChallengeTtls, ClientResolver, ControlPlane,
    CredentialService, DirectMutationLog, EmailProvider, EmailQueue, GoogleExchange, Issuer,
    KeyRegistry, LocalApplier, MfaService, MutationLog, OAuthService, PasswordPolicy,
    RefreshService, SecretBox, SocialService, TenantAdmission, TenantResolver, TenantStores,
    TokenService,
};

/// Storage and outbound collaborators chosen at startup.
pub struct Backends {
    pub catalog: Arc<Catalog>,
    pub stores: Arc<dyn TenantStores>,
    pub cache: Arc<dyn Cache>,
    pub email: Arc<dyn EmailProvider>,
    pub google: Arc<dyn GoogleExchange>,
    /// `None` applies control-plane writes directly on this node.
    pub mutation_log: Option<Arc<dyn MutationLog>>,
}

#[derive(Clone)]
pub struct AppState {
    pub config: IdpConfig,
    pub catalog: Arc<Catalog>,
    pub tenants: Arc<TenantResolver>,
    pub keys: Arc<KeyRegistry>,
    pub issuer: Arc<Issuer>,
    pub stores: Arc<dyn TenantStores>,
    pub cache: Arc<dyn Cache>,
    pub control: Arc<ControlPlane>,
    pub oauth: Arc<OAuthService>,
    pub auth: Arc<AuthService>,
    pub mfa: Arc<MfaService>,
    pub admission: Arc<TenantAdmission>,
    pub metrics: PrometheusHandle,
    pub login_rate_limiter: IpRateLimiter,
    pub register_rate_limiter: IpRateLimiter,
    pub forgot_rate_limiter: IpRateLimiter,
    pub mfa_rate_limiter: IpRateLimiter,
    pub ip_rate_limiter: IpRateLimiter,
}

fn config_error(what: &str, err: impl std::fmt::Display) -> AppError {
    AppError::ConfigError(anyhow::anyhow!("{}: {}", what, err))
}

fn secs(value: i64) -> Duration {
    Duration::from_secs(value.max(0) as u64)
}

impl AppState {
    /// Wires every service on top of `backends`, loads signing keys and
    /// starts the email workers. The returned handles belong to the workers.
    pub async fn assemble(
        config: IdpConfig,
        backends: Backends,
        metrics: PrometheusHandle,
    ) -> Result<(Self, Vec<JoinHandle<()>>), AppError> {
        let Backends {
            catalog,
            stores,
            cache,
            email,
            google,
            mutation_log,
        } = backends;

        let secret_box = Arc::new(
            SecretBox::from_secret(&config.secrets.secretbox_master_key)
                .map_err(|e| config_error("SECRETBOX_MASTER_KEY", e))?,
        );
        let mfa_box = Arc::new(
            SecretBox::from_secret(&config.secrets.mfa_master_key)
                .map_err(|e| config_error("MFA_MASTER_KEY", e))?,
        );

        let keys = Arc::new(KeyRegistry::new(secret_box.clone()));
        let tenants = Arc::new(TenantResolver::new(catalog.clone()));
        let log = match mutation_log {
            Some(log) => log,
            None => Arc::new(DirectMutationLog::new(Arc::new(LocalApplier::new(
                catalog.clone(),
                keys.clone(),
                tenants.clone(),
                stores.clone(),
            )))),
        };

        let policy = Arc::new(
            PasswordPolicy::from_config(&config.password_policy)
                .map_err(|e| config_error("PASSWORD_BLACKLIST_PATH", e))?,
        );
        let control = Arc::new(ControlPlane::new(
            catalog.clone(),
            keys.clone(),
            log,
            stores.clone(),
            *policy.hash_params(),
        ));
        control.bootstrap_keys(Utc::now()).await?;

        let issuer = Arc::new(Issuer::new(
            &config.issuer.base_url,
            keys.clone(),
            config.tokens.access_ttl_seconds,
            config.tokens.id_token_ttl_seconds,
        ));
        let tokens = Arc::new(TokenService::new(
            issuer.clone(),
            Arc::new(RefreshService::new(chrono::Duration::seconds(
                config.tokens.refresh_ttl_seconds,
            ))),
        ));
        let clients = Arc::new(ClientResolver::new(catalog.clone()));
        let challenges = Arc::new(ChallengeCache::new(
            cache.clone(),
            ChallengeTtls {
                session: secs(config.tokens.session_ttl_seconds),
                code: secs(config.tokens.code_ttl_seconds),
                mfa: secs(config.tokens.mfa_token_ttl_seconds),
                consent: secs(config.tokens.consent_token_ttl_seconds),
            },
        ));
        let mfa = Arc::new(MfaService::new(
            mfa_box,
            &config.service_name,
            chrono::Duration::days(config.security.trusted_device_ttl_days),
        ));
        let credentials = Arc::new(CredentialService::new(policy)?);
        let social = Arc::new(SocialService::new(
            cache.clone(),
            google,
            config.google.clone(),
            secret_box,
            &config.issuer.base_url,
            secs(config.tokens.social_state_ttl_seconds),
            secs(config.tokens.social_code_ttl_seconds),
        ));

        let smtp_deadline = Duration::from_secs(config.timeouts.smtp_seconds);
        let (email_queue, workers) = EmailQueue::start(
            email.clone(),
            config.email_workers.workers,
            config.email_workers.queue_capacity,
            smtp_deadline,
        );

        let ui = config.issuer.ui_base_url.clone();
        let oauth = Arc::new(OAuthService::new(
            tenants.clone(),
            clients.clone(),
            stores.clone(),
            challenges.clone(),
            tokens.clone(),
            mfa.clone(),
            &ui,
        ));
        let auth = Arc::new(AuthService::new(
            tenants.clone(),
            clients,
            stores.clone(),
            credentials,
            mfa.clone(),
            challenges,
            tokens,
            social,
            email,
            email_queue,
            EmailFlowSettings {
                verify_ttl: chrono::Duration::seconds(config.tokens.email_verify_ttl_seconds),
                reset_ttl: chrono::Duration::seconds(config.tokens.password_reset_ttl_seconds),
                smtp_deadline,
                verify_base: format!("{}/verify-email", ui),
                reset_base: format!("{}/reset-password", ui),
            },
            &ui,
        ));

        let limits = &config.rate_limit;
        let state = AppState {
            login_rate_limiter: create_ip_rate_limiter(
                limits.login_attempts,
                limits.login_window_seconds,
            ),
            register_rate_limiter: create_ip_rate_limiter(
                limits.register_attempts,
                limits.register_window_seconds,
            ),
            forgot_rate_limiter: create_ip_rate_limiter(
                limits.forgot_attempts,
                limits.forgot_window_seconds,
            ),
            mfa_rate_limiter: create_ip_rate_limiter(limits.mfa_attempts, limits.mfa_window_seconds),
            ip_rate_limiter: create_ip_rate_limiter(
                limits.global_ip_limit,
                limits.global_ip_window_seconds,
            ),
            admission: Arc::new(TenantAdmission::new(config.admission.max_inflight_per_tenant)),
            config,
            catalog,
            tenants,
            keys,
            issuer,
            stores,
            cache,
            control,
            oauth,
            auth,
            mfa,
            metrics,
        };
        tracing::info!(workers = workers.len(), "application state assembled");
        Ok((state, workers))
    }
}

fn cors_layer(origins: &[String]) -> CorsLayer {
    let origins: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|o| match o.parse::<HeaderValue>() {
            Ok(v) => Some(v),
            Err(e) => {
                tracing::error!("Invalid CORS origin '{}': {}. Skipping.", o, e);
                None
            }
        })
        .collect();

    CorsLayer::new()
        .allow_origin(origins)
        .allow_credentials(true)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([
            header::AUTHORIZATION,
            header::CONTENT_TYPE,
            HeaderName::from_static("x-request-id"),
        ])
}

pub async fn build_router(state: AppState) -> Result<Router, AppError> {
    let auth_timeout = Duration::from_secs(state.config.timeouts.auth_seconds);
    // The reset email is sent inline, so this route waits on SMTP.
    let forgot_timeout =
        Duration::from_secs(state.config.timeouts.auth_seconds + state.config.timeouts.smtp_seconds);

    let admin_routes = Router::new()
        .route(
            "/admin/tenants/:tenant/keys/rotate",
            post(handlers::admin::rotate_tenant_key),
        )
        .layer(from_fn_with_state(
            state.clone(),
            middleware::admin_auth_middleware,
        ));

    let login_routes = Router::new()
        .route("/auth/login", post(handlers::auth::login))
        .route("/session/login", post(handlers::auth::session_login))
        .layer(from_fn_with_state(
            state.login_rate_limiter.clone(),
            ip_rate_limit_middleware,
        ));

    let register_route = Router::new()
        .route("/auth/register", post(handlers::auth::register))
        .layer(from_fn_with_state(
            state.register_rate_limiter.clone(),
            ip_rate_limit_middleware,
        ));

    let mfa_challenge_route = Router::new()
        .route("/mfa/totp/challenge", post(handlers::mfa::challenge))
        .layer(from_fn_with_state(
            state.mfa_rate_limiter.clone(),
            ip_rate_limit_middleware,
        ));

    let forgot_route = Router::new()
        .route("/auth/forgot", post(handlers::auth::forgot))
        .layer(from_fn_with_state(
            state.forgot_rate_limiter.clone(),
            ip_rate_limit_middleware,
        ))
        .layer(TimeoutLayer::new(forgot_timeout));

    let tenant_routes = Router::new()
        .route("/authorize", get(handlers::oauth::authorize))
        .route("/token", post(handlers::oauth::token))
        .route("/introspect", post(handlers::oauth::introspect))
        .route(
            "/userinfo",
            get(handlers::oauth::userinfo).post(handlers::oauth::userinfo),
        )
        .route("/consent/accept", post(handlers::oauth::consent_accept))
        .route("/consent/revoke", post(handlers::oauth::consent_revoke))
        .route("/session/logout", post(handlers::auth::logout))
        .route(
            "/auth/verify-email/start",
            post(handlers::auth::verify_email_start),
        )
        .route("/auth/verify-email", get(handlers::auth::verify_email))
        .route("/auth/reset", post(handlers::auth::reset))
        .route("/auth/providers", get(handlers::auth::providers))
        .route(
            "/auth/social/:provider/start",
            get(handlers::social::start),
        )
        .route(
            "/auth/social/:provider/callback",
            get(handlers::social::callback),
        )
        .route("/auth/social/exchange", post(handlers::social::exchange))
        .route("/mfa/totp/enroll", post(handlers::mfa::enroll))
        .route("/mfa/totp/verify", post(handlers::mfa::verify))
        .route("/mfa/totp/disable", post(handlers::mfa::disable))
        .route(
            "/mfa/recovery/rotate",
            post(handlers::mfa::rotate_recovery_codes),
        )
        .merge(login_routes)
        .merge(register_route)
        .merge(mfa_challenge_route)
        .layer(TimeoutLayer::new(auth_timeout))
        .merge(forgot_route)
        .layer(from_fn_with_state(
            state.clone(),
            middleware::tenant_admission_middleware,
        ));

    let ip_limiter = state.ip_rate_limiter.clone();
    let cors = cors_layer(&state.config.security.allowed_origins);

    let app = Router::new()
        .route("/health", get(handlers::health::health_check))
        .route("/metrics", get(handlers::health::metrics))
        .route(
            "/.well-known/openid-configuration",
            get(handlers::well_known::openid_configuration),
        )
        .route("/.well-known/jwks.json", get(handlers::well_known::jwks))
        .route(
            "/t/:slug/.well-known/openid-configuration",
            get(handlers::well_known::tenant_openid_configuration),
        )
        .route(
            "/t/:slug/.well-known/jwks.json",
            get(handlers::well_known::tenant_jwks),
        )
        .merge(tenant_routes)
        .merge(admin_routes)
        .with_state(state)
        // Global IP rate limiting
        .layer(from_fn_with_state(ip_limiter, ip_rate_limit_middleware))
        // Panics become a 500 envelope carrying the request id
        .layer(CatchPanicLayer::custom(handle_panic))
        .layer(from_fn(metrics_middleware))
        .layer(TraceLayer::new_for_http().make_span_with(
            |request: &axum::http::Request<_>| {
                let request_id = request
                    .headers()
                    .get("x-request-id")
                    .and_then(|value| value.to_str().ok())
                    .unwrap_or("-");

                tracing::info_span!(
                    "http_request",
                    request_id = %request_id,
                    method = %request.method(),
                    uri = %request.uri().path(),
                    version = ?request.version(),
                )
            },
        ))
        .layer(from_fn(request_id_middleware))
        .layer(from_fn(security_headers_middleware))
        .layer(cors);

    Ok(app)
}
