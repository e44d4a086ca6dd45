use hellojohn::{
    build_router,
    config::IdpConfig,
    services::{
        Cache, Catalog, EmailProvider, GoogleOidc, MemoryCache, MemoryStores, PgStores,
        RedisCache, SecretBox, SmtpEmailService, TenantStores,
    },
    AppState, Backends,
};
use secrecy::ExposeSecret;
use service_core::error::AppError;
use service_core::observability::{
    logging::{init_tracing, shutdown_tracing},
    metrics::init_metrics,
};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;

#[tokio::main]
async fn main() -> Result<(), AppError> {
    // Load configuration - fail fast if invalid
    let config = IdpConfig::from_env()?;

    init_tracing(
        &config.service_name,
        &config.log_level,
        config.otlp_endpoint.as_deref(),
    );
    let metrics = init_metrics();

    tracing::info!(
        service = %config.service_name,
        version = %config.service_version,
        environment = ?config.environment,
        issuer = %config.issuer.base_url,
        "Starting authorization server"
    );

    let catalog = match &config.storage.control_plane_dir {
        Some(dir) => {
            let catalog = Catalog::open(dir)
                .await
                .map_err(|e| AppError::ConfigError(anyhow::anyhow!("control plane: {}", e)))?;
            tracing::info!(dir = %dir.display(), "Control plane loaded");
            catalog
        }
        None => {
            tracing::warn!("CONTROL_PLANE_DIR not set, tenants live in memory only");
            Catalog::in_memory()
        }
    };

    let stores: Arc<dyn TenantStores> = match &config.storage.database_url {
        Some(dsn) => Arc::new(PgStores::new(
            dsn.clone(),
            config.storage.tenant_db_max_connections,
        )),
        None => {
            tracing::warn!("DATABASE_URL not set, using in-memory tenant stores");
            Arc::new(MemoryStores::new())
        }
    };

    let cache: Arc<dyn Cache> = match &config.storage.redis_url {
        Some(url) => {
            let cache = RedisCache::new(url.expose_secret()).await?;
            tracing::info!("Redis cache initialized");
            Arc::new(cache)
        }
        None => {
            tracing::warn!("REDIS_URL not set, using in-process cache");
            Arc::new(MemoryCache::new())
        }
    };

    // Without SMTP_HOST only tenants that carry their own relay can send.
    let secret_box = SecretBox::from_secret(&config.secrets.secretbox_master_key)
        .map_err(|e| AppError::ConfigError(anyhow::anyhow!("SECRETBOX_MASTER_KEY: {}", e)))?;
    let email: Arc<dyn EmailProvider> = Arc::new(SmtpEmailService::new(
        &config.smtp,
        Arc::new(secret_box),
        Duration::from_secs(config.timeouts.smtp_seconds),
    ));

    let google = Arc::new(GoogleOidc::new(Duration::from_secs(
        config.timeouts.auth_seconds,
    ))?);

    let backends = Backends {
        catalog: Arc::new(catalog),
        stores,
        cache,
        email,
        google,
        mutation_log: None,
    };

    let (state, workers) = AppState::assemble(config.clone(), backends, metrics).await?;
    let app = build_router(state).await?;

    let addr: SocketAddr = config
        .common
        .bind_addr()
        .parse()
        .map_err(|e| AppError::ConfigError(anyhow::anyhow!("invalid bind address: {}", e)))?;

    let service_span = tracing::info_span!(
        "service",
        service = %config.service_name,
        version = %config.service_version,
        environment = ?config.environment,
    );
    let _guard = service_span.enter();

    tracing::info!(address = %addr, "Listening");

    let listener = tokio::net::TcpListener::bind(addr).await?;

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal(config.common.shutdown_grace_seconds))
    .await?;

    // Router and state are gone, so the queue senders are dropped and the
    // workers drain what is left.
    for worker in workers {
        let _ = worker.await;
    }

    tracing::info!("Service shutdown complete");
    shutdown_tracing();
    Ok(())
}

async fn shutdown_signal(grace_seconds: u64) {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received SIGINT, starting graceful shutdown");
        },
        _ = terminate => {
            tracing::info!("Received SIGTERM, starting graceful shutdown");
        },
    }

    tokio::time::sleep(Duration::from_secs(grace_seconds)).await;
}
