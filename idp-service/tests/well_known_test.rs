mod common;

use axum::{
    body::Body,
    http::{Request, StatusCode},
};
use common::*;
use serde_json::json;

fn kids(jwks: &serde_json::Value) -> Vec<String> {
    jwks["keys"]
        .as_array()
        .unwrap()
        .iter()
        .map(|k| k["kid"].as_str().unwrap().to_string())
        .collect()
}

#[tokio::test]
async fn global_discovery_document() {
    let app = TestApp::spawn().await;

    let response = app.send(get_request("/.well-known/openid-configuration")).await;

    assert_eq!(response.status, StatusCode::OK);
    assert_eq!(response.header("cache-control"), Some("public, max-age=3600"));
    let doc = response.json();
    assert_eq!(doc["issuer"], BASE_URL);
    assert_eq!(doc["jwks_uri"], format!("{}/.well-known/jwks.json", BASE_URL));
    assert_eq!(doc["code_challenge_methods_supported"], json!(["S256"]));
    assert_eq!(doc["id_token_signing_alg_values_supported"], json!(["EdDSA"]));
}

#[tokio::test]
async fn tenant_discovery_uses_the_path_issuer() {
    let app = TestApp::spawn().await;

    let response = app
        .send(get_request("/t/acme/.well-known/openid-configuration"))
        .await;

    assert_eq!(response.status, StatusCode::OK);
    let doc = response.json();
    assert_eq!(doc["issuer"], format!("{}/t/acme", BASE_URL));
    assert_eq!(doc["jwks_uri"], format!("{}/t/acme/.well-known/jwks.json", BASE_URL));

    let missing = app
        .send(get_request("/t/nope/.well-known/openid-configuration"))
        .await;
    assert_eq!(missing.status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn jwks_answers_get_and_head() {
    let app = TestApp::spawn().await;

    let response = app.send(get_request("/t/acme/.well-known/jwks.json")).await;
    assert_eq!(response.status, StatusCode::OK);
    assert_eq!(response.header("content-type"), Some("application/json"));
    assert_eq!(response.header("cache-control"), Some("public, max-age=300"));
    let jwks = response.json();
    let key = &jwks["keys"][0];
    assert_eq!(key["kty"], "OKP");
    assert_eq!(key["crv"], "Ed25519");
    assert!(key.get("d").is_none());

    let head = app
        .send(
            Request::builder()
                .method("HEAD")
                .uri("/.well-known/jwks.json")
                .body(Body::empty())
                .unwrap(),
        )
        .await;
    assert_eq!(head.status, StatusCode::OK);
    assert!(head.body.is_empty());
}

#[tokio::test]
async fn key_rotation_requires_the_admin_key() {
    let app = TestApp::spawn().await;
    let before = kids(&app.send(get_request("/t/acme/.well-known/jwks.json")).await.json());
    assert_eq!(before.len(), 1);

    let anonymous = app
        .send(json_request("POST", "/admin/tenants/acme/keys/rotate", json!({})))
        .await;
    assert_eq!(anonymous.status, StatusCode::UNAUTHORIZED);

    let wrong = app
        .send(
            Request::builder()
                .method("POST")
                .uri("/admin/tenants/acme/keys/rotate")
                .header("x-admin-api-key", "not-the-key")
                .body(Body::empty())
                .unwrap(),
        )
        .await;
    assert_eq!(wrong.status, StatusCode::UNAUTHORIZED);

    let rotated = app
        .send(
            Request::builder()
                .method("POST")
                .uri("/admin/tenants/acme/keys/rotate")
                .header("x-admin-api-key", TEST_ADMIN_API_KEY)
                .header("content-type", "application/json")
                .body(Body::from(json!({ "grace_seconds": 600 }).to_string()))
                .unwrap(),
        )
        .await;
    assert_eq!(rotated.status, StatusCode::OK, "{:?}", rotated.json());
    let body = rotated.json();
    assert_eq!(body["retiring_kid"], before[0]);
    let new_kid = body["kid"].as_str().unwrap().to_string();
    assert_ne!(new_kid, before[0]);

    // Both keys are published during the grace period.
    let after = kids(&app.send(get_request("/t/acme/.well-known/jwks.json")).await.json());
    assert!(after.contains(&new_kid));
    assert!(after.contains(&before[0]));

    let unknown = app
        .send(
            Request::builder()
                .method("POST")
                .uri("/admin/tenants/nope/keys/rotate")
                .header("x-admin-api-key", TEST_ADMIN_API_KEY)
                .body(Body::empty())
                .unwrap(),
        )
        .await;
    assert_eq!(unknown.status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn tokens_signed_before_rotation_stay_valid() {
    let app = TestApp::spawn().await;
    let registered = app.register("rita@example.com").await;
    let access = registered["access_token"].as_str().unwrap();

    let rotated = app
        .send(
            Request::builder()
                .method("POST")
                .uri("/admin/tenants/acme/keys/rotate")
                .header("x-admin-api-key", TEST_ADMIN_API_KEY)
                .body(Body::empty())
                .unwrap(),
        )
        .await;
    assert_eq!(rotated.status, StatusCode::OK);

    let userinfo = app
        .send(
            Request::builder()
                .uri("/userinfo")
                .header("authorization", format!("Bearer {}", access))
                .body(Body::empty())
                .unwrap(),
        )
        .await;
    assert_eq!(userinfo.status, StatusCode::OK);
}

#[tokio::test]
async fn health_reports_dependencies() {
    let app = TestApp::spawn().await;
    let response = app.send(get_request("/health")).await;
    assert_eq!(response.status, StatusCode::OK);
    let body = response.json();
    assert_eq!(body["status"], "healthy");
    assert_eq!(body["service"], "hellojohn-test");
    assert_eq!(body["checks"]["catalog"]["tenants"], 2);
}

#[tokio::test]
async fn security_headers_and_request_id_are_set() {
    let app = TestApp::spawn().await;
    let response = app.send(get_request("/.well-known/openid-configuration")).await;
    assert!(response.header("x-request-id").is_some());
    assert_eq!(response.header("x-content-type-options"), Some("nosniff"));
}
