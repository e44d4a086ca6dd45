//! HTTP handlers of the authorization server.

pub mod admin;
pub mod auth;
pub mod health;
pub mod mfa;
pub mod oauth;
pub mod social;
pub mod well_known;

use axum::http::{header, uri::Scheme, HeaderMap, Uri};
use axum_extra::extract::cookie::{Cookie, CookieJar, SameSite};

use crate::AppState;

/// Headers for every response that carries tokens or secrets.
pub const NO_STORE: [(header::HeaderName, &str); 2] = [
    (header::CACHE_CONTROL, "no-store"),
    (header::PRAGMA, "no-cache"),
];

/// Whether the request reached us over HTTPS, directly or through a proxy
/// that sets `X-Forwarded-Proto`.
pub(crate) fn is_https(headers: &HeaderMap, uri: &Uri) -> bool {
    if uri.scheme() == Some(&Scheme::HTTPS) {
        return true;
    }
    headers
        .get("x-forwarded-proto")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .is_some_and(|proto| proto.trim().eq_ignore_ascii_case("https"))
}

pub(crate) fn session_cookie(
    state: &AppState,
    secure: bool,
    value: String,
    max_age_secs: i64,
) -> Cookie<'static> {
    Cookie::build((state.config.security.session_cookie_name.clone(), value))
        .path("/")
        .http_only(true)
        .same_site(SameSite::Lax)
        .secure(secure)
        .max_age(time_duration(max_age_secs))
        .build()
}

pub(crate) fn trusted_device_cookie(
    state: &AppState,
    secure: bool,
    value: String,
    max_age_secs: i64,
) -> Cookie<'static> {
    Cookie::build((state.config.security.trusted_device_cookie_name.clone(), value))
        .path("/")
        .http_only(true)
        .same_site(SameSite::Lax)
        .secure(secure)
        .max_age(time_duration(max_age_secs))
        .build()
}

pub(crate) fn cookie_value<'a>(jar: &'a CookieJar, name: &str) -> Option<&'a str> {
    jar.get(name).map(|c| c.value()).filter(|v| !v.is_empty())
}

fn time_duration(secs: i64) -> time::Duration {
    time::Duration::seconds(secs.max(0))
}
