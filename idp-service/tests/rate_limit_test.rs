mod common;

use axum::{
    body::Body,
    http::{header, Request, StatusCode},
};
use common::*;
use serde_json::json;

fn login_from(ip: &str) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri("/auth/login")
        .header(header::CONTENT_TYPE, "application/json")
        .header("x-forwarded-for", ip)
        .body(Body::from(
            json!({
                "tenant": TENANT,
                "client_id": WEB_CLIENT,
                "email": "sybil@example.com",
                "password": "wrong password here",
            })
            .to_string(),
        ))
        .unwrap()
}

#[tokio::test]
async fn login_is_limited_per_ip() {
    let mut config = test_config();
    config.rate_limit.login_attempts = 2;
    config.rate_limit.login_window_seconds = 60;
    let app = TestApp::with_config(config).await;

    for _ in 0..2 {
        let response = app.send(login_from("203.0.113.7")).await;
        assert_eq!(response.status, StatusCode::UNAUTHORIZED);
        assert_eq!(response.json()["error"], "invalid_credentials");
    }

    let limited = app.send(login_from("203.0.113.7")).await;
    assert_eq!(limited.status, StatusCode::TOO_MANY_REQUESTS);
    assert!(limited.header("retry-after").is_some());

    let other_ip = app.send(login_from("198.51.100.1")).await;
    assert_eq!(other_ip.status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn login_limit_does_not_touch_other_routes() {
    let mut config = test_config();
    config.rate_limit.login_attempts = 1;
    let app = TestApp::with_config(config).await;

    app.send(login_from("203.0.113.8")).await;
    assert_eq!(
        app.send(login_from("203.0.113.8")).await.status,
        StatusCode::TOO_MANY_REQUESTS
    );

    let discovery = Request::builder()
        .uri("/.well-known/openid-configuration")
        .header("x-forwarded-for", "203.0.113.8")
        .body(Body::empty())
        .unwrap();
    assert_eq!(app.send(discovery).await.status, StatusCode::OK);
}

#[tokio::test]
async fn unknown_user_and_wrong_password_look_alike() {
    let app = TestApp::spawn().await;
    app.register("trent@example.com").await;

    let wrong_password = app.password_login("trent@example.com", "not the password").await;
    let unknown_user = app.password_login("nobody@example.com", "not the password").await;

    assert_eq!(wrong_password.status, StatusCode::UNAUTHORIZED);
    assert_eq!(unknown_user.status, StatusCode::UNAUTHORIZED);
    assert_eq!(wrong_password.json()["error"], unknown_user.json()["error"]);
    assert_eq!(
        wrong_password.json()["error_description"],
        unknown_user.json()["error_description"]
    );
}
