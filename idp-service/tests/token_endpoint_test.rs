mod common;

use axum::{
    body::Body,
    http::{header, Request, StatusCode},
};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use common::*;

fn basic(client_id: &str, secret: &str) -> String {
    format!("Basic {}", STANDARD.encode(format!("{}:{}", client_id, secret)))
}

fn introspect_request(client_id: &str, token: &str) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri("/introspect")
        .header(header::CONTENT_TYPE, "application/x-www-form-urlencoded")
        .header(header::AUTHORIZATION, basic(client_id, BACKEND_SECRET))
        .body(Body::from(form_body(&[("token", token)])))
        .unwrap()
}

#[tokio::test]
async fn refresh_rotates_and_reuse_revokes_the_family() {
    let app = TestApp::spawn().await;
    app.register("frank@example.com").await;
    let tokens = app.code_flow_tokens("frank@example.com").await;
    let r1 = tokens["refresh_token"].as_str().unwrap().to_string();

    let rotated = app.send(refresh_request(&r1)).await;
    assert_eq!(rotated.status, StatusCode::OK, "{:?}", rotated.json());
    let body = rotated.json();
    let r2 = body["refresh_token"].as_str().unwrap().to_string();
    assert_ne!(r1, r2);
    assert!(body.get("id_token").is_none());
    assert_eq!(body["scope"], "openid email");

    let reuse = app.send(refresh_request(&r1)).await;
    assert_eq!(reuse.status, StatusCode::BAD_REQUEST);
    assert_eq!(reuse.json()["error"], "invalid_grant");

    let after_revoke = app.send(refresh_request(&r2)).await;
    assert_eq!(after_revoke.status, StatusCode::BAD_REQUEST);
    assert_eq!(after_revoke.json()["error"], "invalid_grant");
}

#[tokio::test]
async fn unknown_grant_type_is_rejected() {
    let app = TestApp::spawn().await;
    let response = app
        .send(form_request(
            "/token",
            &[("grant_type", "password"), ("client_id", WEB_CLIENT)],
        ))
        .await;
    assert_eq!(response.status, StatusCode::BAD_REQUEST);
    assert_eq!(response.json()["error"], "unsupported_grant_type");
}

#[tokio::test]
async fn confidential_client_needs_its_secret() {
    let app = TestApp::spawn().await;
    let request = Request::builder()
        .method("POST")
        .uri("/introspect")
        .header(header::CONTENT_TYPE, "application/x-www-form-urlencoded")
        .header(header::AUTHORIZATION, basic(BACKEND_CLIENT, "not-the-secret"))
        .body(Body::from(form_body(&[("token", "whatever")])))
        .unwrap();

    let response = app.send(request).await;

    assert_eq!(response.status, StatusCode::UNAUTHORIZED);
    assert_eq!(response.json()["error"], "invalid_client");
}

#[tokio::test]
async fn introspection_is_scoped_to_the_callers_tenant() {
    let app = TestApp::spawn().await;
    app.register("grace@example.com").await;
    let tokens = app.code_flow_tokens("grace@example.com").await;
    let access = tokens["access_token"].as_str().unwrap();
    let refresh = tokens["refresh_token"].as_str().unwrap();

    let own = app.send(introspect_request(BACKEND_CLIENT, access)).await;
    assert_eq!(own.status, StatusCode::OK);
    let body = own.json();
    assert_eq!(body["active"], true);
    assert_eq!(body["client_id"], WEB_CLIENT);
    assert_eq!(body["tid"], app.tenant.id.to_string());
    assert_eq!(body["amr"], serde_json::json!(["pwd"]));

    let own_refresh = app.send(introspect_request(BACKEND_CLIENT, refresh)).await;
    assert_eq!(own_refresh.json()["active"], true);
    assert_eq!(own_refresh.json()["token_type"], "refresh_token");

    let foreign = app.send(introspect_request(OTHER_BACKEND_CLIENT, access)).await;
    assert_eq!(foreign.status, StatusCode::OK);
    assert_eq!(foreign.json(), serde_json::json!({ "active": false }));

    let foreign_refresh = app
        .send(introspect_request(OTHER_BACKEND_CLIENT, refresh))
        .await;
    assert_eq!(foreign_refresh.json(), serde_json::json!({ "active": false }));

    let garbage = app.send(introspect_request(BACKEND_CLIENT, "a.b.c")).await;
    assert_eq!(garbage.json()["active"], false);
}

#[tokio::test]
async fn userinfo_returns_claims_for_the_bearer() {
    let app = TestApp::spawn().await;
    let registered = app.register("heidi@example.com").await;
    let tokens = app.code_flow_tokens("heidi@example.com").await;
    let access = tokens["access_token"].as_str().unwrap();

    for method in ["GET", "POST"] {
        let request = Request::builder()
            .method(method)
            .uri("/userinfo")
            .header(header::AUTHORIZATION, format!("Bearer {}", access))
            .body(Body::empty())
            .unwrap();
        let response = app.send(request).await;
        assert_eq!(response.status, StatusCode::OK);
        let body = response.json();
        assert_eq!(body["sub"], registered["user_id"]);
        assert_eq!(body["email"], "heidi@example.com");
        assert_eq!(body["email_verified"], false);
    }

    let anonymous = app.send(get_request("/userinfo")).await;
    assert_eq!(anonymous.status, StatusCode::UNAUTHORIZED);
    assert_eq!(anonymous.json()["error"], "invalid_token");
}
