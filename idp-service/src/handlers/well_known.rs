//! Discovery documents and JWKS, global and per tenant.

use axum::{
    extract::{Path, State},
    http::header,
    response::IntoResponse,
    Json,
};
use chrono::Utc;
use service_core::error::AppError;

use crate::dtos::oauth::DiscoveryDocument;
use crate::models::{IssuerMode, KeyScope, TenantRef};
use crate::services::issuer::key_scope_for;
use crate::services::token::{SCOPE_EMAIL, SCOPE_OPENID};
use crate::AppState;

const DISCOVERY_CACHE: &str = "public, max-age=3600";
/// Short enough that a rotated key shows up well inside the grace window.
const JWKS_CACHE: &str = "public, max-age=300";

fn tenant_by_slug(state: &AppState, slug: &str) -> Result<TenantRef, AppError> {
    state
        .tenants
        .resolve(slug)
        .map_err(|_| AppError::not_found("tenant_not_found", "Tenant not found"))
}

fn discovery(base: &str, issuer: String, jwks_uri: String, extra_scopes: Vec<String>) -> DiscoveryDocument {
    let mut scopes_supported = vec![SCOPE_OPENID.to_string(), SCOPE_EMAIL.to_string()];
    for scope in extra_scopes {
        if !scopes_supported.contains(&scope) {
            scopes_supported.push(scope);
        }
    }
    DiscoveryDocument {
        issuer,
        authorization_endpoint: format!("{}/authorize", base),
        token_endpoint: format!("{}/token", base),
        userinfo_endpoint: format!("{}/userinfo", base),
        jwks_uri,
        introspection_endpoint: format!("{}/introspect", base),
        response_types_supported: vec!["code"],
        grant_types_supported: vec!["authorization_code", "refresh_token"],
        subject_types_supported: vec!["public"],
        id_token_signing_alg_values_supported: vec!["EdDSA"],
        token_endpoint_auth_methods_supported: vec![
            "client_secret_basic",
            "client_secret_post",
            "none",
        ],
        code_challenge_methods_supported: vec!["S256"],
        scopes_supported,
        claims_supported: vec![
            "iss",
            "sub",
            "aud",
            "exp",
            "iat",
            "auth_time",
            "nonce",
            "amr",
            "acr",
            "email",
            "email_verified",
        ],
    }
}

pub async fn openid_configuration(State(state): State<AppState>) -> impl IntoResponse {
    let base = state.issuer.base_url();
    let doc = discovery(
        base,
        base.to_string(),
        format!("{}/.well-known/jwks.json", base),
        Vec::new(),
    );
    (
        [
            (header::CONTENT_TYPE, "application/json"),
            (header::CACHE_CONTROL, DISCOVERY_CACHE),
        ],
        Json(doc),
    )
}

pub async fn tenant_openid_configuration(
    State(state): State<AppState>,
    Path(slug): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    let tenant = tenant_by_slug(&state, &slug)?;
    let base = state.issuer.base_url();
    let jwks_uri = match tenant.settings.issuer_mode {
        IssuerMode::Global => format!("{}/.well-known/jwks.json", base),
        IssuerMode::Path | IssuerMode::Domain => {
            format!("{}/t/{}/.well-known/jwks.json", base, tenant.slug)
        }
    };
    let scopes = state
        .catalog
        .scopes(tenant.id)
        .into_iter()
        .map(|s| s.name)
        .collect();
    let doc = discovery(base, state.issuer.issuer_for(&tenant), jwks_uri, scopes);
    Ok((
        [
            (header::CONTENT_TYPE, "application/json"),
            (header::CACHE_CONTROL, DISCOVERY_CACHE),
        ],
        Json(doc),
    ))
}

/// Active key plus any retiring key still inside its grace window.
pub async fn jwks(State(state): State<AppState>) -> impl IntoResponse {
    let jwks = state.keys.jwks(&KeyScope::Global, Utc::now());
    (
        [
            (header::CONTENT_TYPE, "application/json"),
            (header::CACHE_CONTROL, JWKS_CACHE),
        ],
        Json(jwks.as_ref().clone()),
    )
}

pub async fn tenant_jwks(
    State(state): State<AppState>,
    Path(slug): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    let tenant = tenant_by_slug(&state, &slug)?;
    let jwks = state.keys.jwks(&key_scope_for(&tenant), Utc::now());
    Ok((
        [
            (header::CONTENT_TYPE, "application/json"),
            (header::CACHE_CONTROL, JWKS_CACHE),
        ],
        Json(jwks.as_ref().clone()),
    ))
}
