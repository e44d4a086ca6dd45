mod common;

use axum::{
    body::Body,
    http::{header, Request, StatusCode},
};
use chrono::Utc;
use common::*;
use serde_json::{json, Value};
use totp_rs::{Algorithm, Secret, TOTP};

fn code_at(secret_base32: &str, unix: i64) -> String {
    let secret = Secret::Encoded(secret_base32.to_string()).to_bytes().unwrap();
    TOTP::new(Algorithm::SHA1, 6, 1, 30, secret, None, "test".to_string())
        .unwrap()
        .generate(unix as u64)
}

fn authed(method: &str, uri: &str, access: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(uri)
        .header(header::AUTHORIZATION, format!("Bearer {}", access))
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

/// Registers, enrolls and confirms TOTP. Returns the secret and recovery codes.
async fn enrolled_user(app: &TestApp, email: &str) -> (String, Vec<String>) {
    let registered = app.register(email).await;
    let access = registered["access_token"].as_str().unwrap().to_string();

    let enroll = app
        .send(authed("POST", "/mfa/totp/enroll", &access, json!({})))
        .await;
    assert_eq!(enroll.status, StatusCode::OK, "{:?}", enroll.json());
    let secret = enroll.json()["secret_base32"].as_str().unwrap().to_string();
    assert!(enroll.json()["otpauth_url"]
        .as_str()
        .unwrap()
        .starts_with("otpauth://totp/"));

    let verify = app
        .send(authed(
            "POST",
            "/mfa/totp/verify",
            &access,
            json!({ "code": code_at(&secret, Utc::now().timestamp()) }),
        ))
        .await;
    assert_eq!(verify.status, StatusCode::OK, "{:?}", verify.json());
    assert_eq!(verify.json()["enrolled"], true);
    let codes: Vec<String> = serde_json::from_value(verify.json()["recovery_codes"].clone()).unwrap();
    assert_eq!(codes.len(), 10);

    let again = app
        .send(authed("POST", "/mfa/totp/enroll", &access, json!({})))
        .await;
    assert_eq!(again.status, StatusCode::CONFLICT);

    (secret, codes)
}

#[tokio::test]
async fn login_requires_second_factor_after_enrollment() {
    let app = TestApp::spawn().await;
    let (secret, _) = enrolled_user(&app, "ivan@example.com").await;

    let login = app.password_login("ivan@example.com", PASSWORD).await;
    assert_eq!(login.status, StatusCode::OK);
    let body = login.json();
    assert_eq!(body["mfa_required"], true);
    assert_eq!(body["amr"], json!(["pwd"]));
    assert!(body.get("access_token").is_none());
    let mfa_token = body["mfa_token"].as_str().unwrap().to_string();

    let wrong = app
        .send(json_request(
            "POST",
            "/mfa/totp/challenge",
            json!({ "mfa_token": mfa_token, "code": "12345x" }),
        ))
        .await;
    assert_eq!(wrong.status, StatusCode::UNAUTHORIZED);
    assert_eq!(wrong.json()["error"], "invalid_mfa_code");

    let next_step = Utc::now().timestamp() + 30;
    let passed = app
        .send(json_request(
            "POST",
            "/mfa/totp/challenge",
            json!({
                "mfa_token": mfa_token,
                "code": code_at(&secret, next_step),
                "remember_device": true,
            }),
        ))
        .await;
    assert_eq!(passed.status, StatusCode::OK, "{:?}", passed.json());
    let claims = jwt_claims(passed.json()["access_token"].as_str().unwrap());
    assert_eq!(claims["amr"], json!(["pwd", "mfa"]));
    assert_eq!(claims["acr"], "urn:hellojohn:loa:2");
    let device = passed.cookie("mfa_td").expect("trusted device cookie");

    // The challenge is consumed.
    let replay = app
        .send(json_request(
            "POST",
            "/mfa/totp/challenge",
            json!({ "mfa_token": mfa_token, "code": code_at(&secret, next_step) }),
        ))
        .await;
    assert_eq!(replay.status, StatusCode::NOT_FOUND);

    // A trusted device skips the challenge.
    let request = Request::builder()
        .method("POST")
        .uri("/auth/login")
        .header(header::CONTENT_TYPE, "application/json")
        .header(header::COOKIE, format!("mfa_td={}", device))
        .body(Body::from(
            json!({
                "tenant": TENANT,
                "client_id": WEB_CLIENT,
                "email": "ivan@example.com",
                "password": PASSWORD,
            })
            .to_string(),
        ))
        .unwrap();
    let trusted = app.send(request).await;
    assert_eq!(trusted.status, StatusCode::OK);
    let claims = jwt_claims(trusted.json()["access_token"].as_str().unwrap());
    assert_eq!(claims["amr"], json!(["pwd", "mfa"]));
    assert_eq!(claims["acr"], "urn:hellojohn:loa:2");
}

#[tokio::test]
async fn factor_input_needs_exactly_one_value() {
    let app = TestApp::spawn().await;
    let response = app
        .send(json_request(
            "POST",
            "/mfa/totp/challenge",
            json!({ "mfa_token": "t", "code": "123456", "recovery_code": "ABCDEFGHJK" }),
        ))
        .await;
    assert_eq!(response.status, StatusCode::BAD_REQUEST);
    assert_eq!(response.json()["error"], "invalid_request");
}

#[tokio::test]
async fn authorize_asks_for_mfa_then_issues_a_code() {
    let app = TestApp::spawn().await;
    let (_, codes) = enrolled_user(&app, "judy@example.com").await;
    let sid = app.session_cookie("judy@example.com").await;

    let pending = app.authorize(WEB_CLIENT, &[("sid", &sid)]).await;
    assert_eq!(pending.status, StatusCode::OK);
    assert_eq!(pending.header("cache-control"), Some("no-store"));
    let mfa_token = pending.json()["mfa_token"].as_str().unwrap().to_string();

    let passed = app
        .send(json_request(
            "POST",
            "/mfa/totp/challenge",
            json!({ "mfa_token": mfa_token, "recovery_code": codes[0] }),
        ))
        .await;
    assert_eq!(passed.status, StatusCode::OK, "{:?}", passed.json());

    // The session now carries mfa.
    let authorized = app.authorize(WEB_CLIENT, &[("sid", &sid)]).await;
    assert_eq!(authorized.status, StatusCode::FOUND);
    let code = query_param(&authorized.location(), "code").unwrap();
    let tokens = app.exchange_code(&code, VERIFIER).await;
    assert_eq!(tokens.status, StatusCode::OK);

    let access = tokens.json()["access_token"].as_str().unwrap().to_string();
    let introspected = app
        .send(
            Request::builder()
                .method("POST")
                .uri("/introspect")
                .header(header::CONTENT_TYPE, "application/x-www-form-urlencoded")
                .body(Body::from(form_body(&[
                    ("token", &access),
                    ("client_id", BACKEND_CLIENT),
                    ("client_secret", BACKEND_SECRET),
                ])))
                .unwrap(),
        )
        .await;
    assert_eq!(introspected.json()["amr"], json!(["pwd", "mfa"]));
}

#[tokio::test]
async fn recovery_codes_rotate_and_disable_with_a_recovery_code() {
    let app = TestApp::spawn().await;
    let (_, old_codes) = enrolled_user(&app, "mallory@example.com").await;
    let login = app.password_login("mallory@example.com", PASSWORD).await;
    let mfa_token = login.json()["mfa_token"].as_str().unwrap().to_string();
    let passed = app
        .send(json_request(
            "POST",
            "/mfa/totp/challenge",
            json!({ "mfa_token": mfa_token, "recovery_code": old_codes[0] }),
        ))
        .await;
    let access = passed.json()["access_token"].as_str().unwrap().to_string();

    let rotated = app
        .send(authed("POST", "/mfa/recovery/rotate", &access, json!({})))
        .await;
    assert_eq!(rotated.status, StatusCode::OK);
    let new_codes: Vec<String> =
        serde_json::from_value(rotated.json()["recovery_codes"].clone()).unwrap();
    assert_eq!(new_codes.len(), 10);

    let stale = app
        .send(authed(
            "POST",
            "/mfa/totp/disable",
            &access,
            json!({ "recovery_code": old_codes[1] }),
        ))
        .await;
    assert_eq!(stale.status, StatusCode::UNAUTHORIZED);

    let disabled = app
        .send(authed(
            "POST",
            "/mfa/totp/disable",
            &access,
            json!({ "recovery_code": new_codes[0] }),
        ))
        .await;
    assert_eq!(disabled.status, StatusCode::OK, "{:?}", disabled.json());

    let login = app.password_login("mallory@example.com", PASSWORD).await;
    assert!(login.json()["access_token"].as_str().is_some());
}

#[tokio::test]
async fn trusted_device_lifts_authorize_to_mfa() {
    let app = TestApp::spawn().await;
    let (secret, _) = enrolled_user(&app, "oscar@example.com").await;
    let login = app.password_login("oscar@example.com", PASSWORD).await;
    let mfa_token = login.json()["mfa_token"].as_str().unwrap().to_string();
    let passed = app
        .send(json_request(
            "POST",
            "/mfa/totp/challenge",
            json!({
                "mfa_token": mfa_token,
                "code": code_at(&secret, Utc::now().timestamp()),
                "remember_device": true,
            }),
        ))
        .await;
    assert_eq!(passed.status, StatusCode::OK, "{:?}", passed.json());
    let device = passed.cookie("mfa_td").expect("trusted device cookie");

    let sid = app.session_cookie("oscar@example.com").await;
    let authorized = app
        .authorize(WEB_CLIENT, &[("sid", &sid), ("mfa_td", &device)])
        .await;
    assert_eq!(authorized.status, StatusCode::FOUND, "{:?}", authorized.json());
    let code = query_param(&authorized.location(), "code").unwrap();
    let tokens = app.exchange_code(&code, VERIFIER).await;
    assert_eq!(tokens.status, StatusCode::OK);

    let claims = jwt_claims(tokens.json()["access_token"].as_str().unwrap());
    assert_eq!(claims["amr"], json!(["pwd", "mfa"]));
    assert_eq!(claims["acr"], "urn:hellojohn:loa:2");
}
