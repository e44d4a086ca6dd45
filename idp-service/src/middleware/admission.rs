//! Per-tenant admission control. The tenant is identified from the
//! `/t/{slug}` path prefix, the `tenant` parameter, or the `client_id`
//! parameter of the query or body, in that order.

use axum::{
    body::{to_bytes, Body},
    extract::{Request, State},
    http::{header, Method},
    middleware::Next,
    response::Response,
};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use service_core::error::AppError;
use std::collections::HashMap;

use crate::models::TenantRef;
use crate::AppState;

/// Bodies larger than this are rejected before they reach a handler.
const MAX_BODY_BYTES: usize = 64 * 1024;

#[derive(Debug, Default, PartialEq)]
struct TenantHint {
    tenant: Option<String>,
    client_id: Option<String>,
}

impl TenantHint {
    fn merge(&mut self, params: &HashMap<String, String>) {
        if self.tenant.is_none() {
            self.tenant = params.get("tenant").filter(|v| !v.is_empty()).cloned();
        }
        if self.client_id.is_none() {
            self.client_id = params.get("client_id").filter(|v| !v.is_empty()).cloned();
        }
    }
}

fn path_slug(path: &str) -> Option<String> {
    let rest = path.strip_prefix("/t/")?;
    rest.split('/')
        .next()
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

fn basic_client_id(request: &Request) -> Option<String> {
    let encoded = request
        .headers()
        .get(header::AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Basic ")?;
    let decoded = String::from_utf8(STANDARD.decode(encoded.trim()).ok()?).ok()?;
    let (id, _) = decoded.split_once(':')?;
    urlencoding::decode(id).ok().map(|s| s.into_owned())
}

fn body_params(content_type: Option<&str>, bytes: &[u8]) -> HashMap<String, String> {
    match content_type {
        Some(ct) if ct.starts_with("application/json") => {
            serde_json::from_slice::<serde_json::Map<String, serde_json::Value>>(bytes)
                .map(|map| {
                    map.into_iter()
                        .filter_map(|(k, v)| v.as_str().map(|s| (k, s.to_string())))
                        .collect()
                })
                .unwrap_or_default()
        }
        Some(ct) if ct.starts_with("application/x-www-form-urlencoded") => {
            serde_urlencoded::from_bytes(bytes).unwrap_or_default()
        }
        _ => HashMap::new(),
    }
}

fn resolve(state: &AppState, hint: &TenantHint) -> Option<TenantRef> {
    match (&hint.tenant, &hint.client_id) {
        (_, Some(client_id)) => state
            .tenants
            .resolve_for_client(hint.tenant.as_deref(), client_id)
            .ok(),
        (Some(tenant), None) => state.tenants.resolve(tenant).ok(),
        (None, None) => None,
    }
}

/// Holds a tenant permit for the duration of the request. Requests whose
/// tenant cannot be identified pass through; the handler reports why.
pub async fn tenant_admission_middleware(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Result<Response, AppError> {
    let mut hint = TenantHint {
        tenant: path_slug(request.uri().path()),
        client_id: None,
    };
    if let Some(query) = request.uri().query() {
        let params: HashMap<String, String> =
            serde_urlencoded::from_str(query).unwrap_or_default();
        hint.merge(&params);
    }
    if hint.client_id.is_none() {
        hint.client_id = basic_client_id(&request);
    }

    let request = if request.method() == Method::POST && hint.client_id.is_none() {
        let content_type = request
            .headers()
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let (parts, body) = request.into_parts();
        let bytes = to_bytes(body, MAX_BODY_BYTES).await.map_err(|_| {
            AppError::bad_request("invalid_request", "Request body is too large")
        })?;
        hint.merge(&body_params(content_type.as_deref(), &bytes));
        Request::from_parts(parts, Body::from(bytes))
    } else {
        request
    };

    let Some(tenant) = resolve(&state, &hint) else {
        return Ok(next.run(request).await);
    };
    let _permit = state.admission.try_acquire(tenant.id).map_err(|e| {
        tracing::warn!(tenant = %tenant.slug, "tenant admission saturated");
        AppError::from(e)
    })?;
    Ok(next.run(request).await)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slug_from_tenant_path() {
        assert_eq!(
            path_slug("/t/acme/.well-known/jwks.json").as_deref(),
            Some("acme")
        );
        assert_eq!(path_slug("/token"), None);
        assert_eq!(path_slug("/t/"), None);
    }

    #[test]
    fn body_params_read_json_and_form() {
        let json = body_params(
            Some("application/json"),
            br#"{"client_id":"app-web","remember_device":true}"#,
        );
        assert_eq!(json.get("client_id").map(String::as_str), Some("app-web"));
        assert!(!json.contains_key("remember_device"));

        let form = body_params(
            Some("application/x-www-form-urlencoded"),
            b"grant_type=refresh_token&tenant=acme",
        );
        assert_eq!(form.get("tenant").map(String::as_str), Some("acme"));

        assert!(body_params(None, b"client_id=x").is_empty());
    }

    #[test]
    fn basic_header_names_the_client() {
        let request = Request::builder()
            .header(header::AUTHORIZATION, format!("Basic {}", STANDARD.encode("svc%3A1:secret")))
            .body(Body::empty())
            .unwrap();
        assert_eq!(basic_client_id(&request).as_deref(), Some("svc:1"));
    }
}
