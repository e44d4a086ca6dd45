use axum::{extract::State, http::header, response::IntoResponse, Json};
use serde_json::{json, Value};
use service_core::error::AppError;

use crate::AppState;

/// Probes the cache and the datastore backend.
pub async fn health_check(State(state): State<AppState>) -> Result<Json<Value>, AppError> {
    state.cache.health_check().await.map_err(|e| {
        tracing::error!(error = %e, "cache health check failed");
        AppError::ServiceUnavailable {
            code: "cache_unavailable",
            description: "Cache is unavailable".to_string(),
        }
    })?;

    state.stores.health_check().await.map_err(|e| {
        tracing::error!(error = %e, "datastore health check failed");
        AppError::ServiceUnavailable {
            code: "datastore_unavailable",
            description: "Datastore is unavailable".to_string(),
        }
    })?;

    Ok(Json(json!({
        "status": "healthy",
        "service": state.config.service_name,
        "version": state.config.service_version,
        "environment": format!("{:?}", state.config.environment),
        "checks": {
            "catalog": { "tenants": state.catalog.tenants().len() },
            "cache": "up",
            "datastore": "up"
        }
    })))
}

pub async fn metrics(State(state): State<AppState>) -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        state.metrics.render(),
    )
}
