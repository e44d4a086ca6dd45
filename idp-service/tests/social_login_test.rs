mod common;

use axum::http::StatusCode;
use common::*;
use serde_json::json;

async fn google_state(app: &TestApp) -> String {
    let uri = format!(
        "/auth/social/google/start?{}",
        form_body(&[
            ("tenant", TENANT),
            ("client_id", WEB_CLIENT),
            ("redirect_uri", REDIRECT_URI),
        ])
    );
    let response = app.send(get_request(&uri)).await;
    assert_eq!(response.status, StatusCode::FOUND, "{:?}", response.json());
    let location = response.location();
    assert_eq!(location.host_str(), Some("accounts.google.com"));
    assert_eq!(
        query_param(&location, "code_challenge_method").as_deref(),
        Some("S256")
    );
    assert!(query_param(&location, "nonce").is_some());
    query_param(&location, "state").unwrap()
}

async fn callback(app: &TestApp, state: &str, email: &str) -> TestResponse {
    let uri = format!(
        "/auth/social/google/callback?{}",
        form_body(&[("state", state), ("code", email)])
    );
    app.send(get_request(&uri)).await
}

#[tokio::test]
async fn google_round_trip_ends_in_tokens() {
    let app = TestApp::spawn().await;
    let state = google_state(&app).await;

    let redirected = callback(&app, &state, "wendy@example.com").await;
    assert_eq!(redirected.status, StatusCode::FOUND);
    let location = redirected.location();
    assert!(location.as_str().starts_with(REDIRECT_URI));
    let login_code = query_param(&location, "login_code").unwrap();

    // The state is single use.
    let replayed = callback(&app, &state, "wendy@example.com").await;
    assert_eq!(replayed.status, StatusCode::BAD_REQUEST);

    let wrong_client = app
        .send(json_request(
            "POST",
            "/auth/social/exchange",
            json!({ "login_code": login_code, "client_id": CONSENT_CLIENT }),
        ))
        .await;
    assert_eq!(wrong_client.status, StatusCode::BAD_REQUEST);
    assert_eq!(wrong_client.json()["error"], "invalid_grant");

    let exchanged = app
        .send(json_request(
            "POST",
            "/auth/social/exchange",
            json!({ "login_code": login_code, "client_id": WEB_CLIENT }),
        ))
        .await;
    assert_eq!(exchanged.status, StatusCode::OK, "{:?}", exchanged.json());
    assert_eq!(exchanged.header("cache-control"), Some("no-store"));
    let access = exchanged.json()["access_token"].as_str().unwrap().to_string();

    let again = app
        .send(json_request(
            "POST",
            "/auth/social/exchange",
            json!({ "login_code": login_code, "client_id": WEB_CLIENT }),
        ))
        .await;
    assert_eq!(again.status, StatusCode::BAD_REQUEST);

    let introspected = app
        .send(form_request(
            "/introspect",
            &[
                ("token", &access),
                ("client_id", BACKEND_CLIENT),
                ("client_secret", BACKEND_SECRET),
            ],
        ))
        .await;
    assert_eq!(introspected.json()["amr"], json!(["google"]));
}

#[tokio::test]
async fn second_google_login_reuses_the_account() {
    let app = TestApp::spawn().await;

    let mut subjects = Vec::new();
    for _ in 0..2 {
        let state = google_state(&app).await;
        let redirected = callback(&app, &state, "xavier@example.com").await;
        let login_code = query_param(&redirected.location(), "login_code").unwrap();
        let exchanged = app
            .send(json_request(
                "POST",
                "/auth/social/exchange",
                json!({ "login_code": login_code, "client_id": WEB_CLIENT }),
            ))
            .await;
        let access = exchanged.json()["access_token"].as_str().unwrap().to_string();
        let userinfo = app
            .send(
                axum::http::Request::builder()
                    .uri("/userinfo")
                    .header("authorization", format!("Bearer {}", access))
                    .body(axum::body::Body::empty())
                    .unwrap(),
            )
            .await;
        assert_eq!(userinfo.json()["email_verified"], true);
        subjects.push(userinfo.json()["sub"].clone());
    }
    assert_eq!(subjects[0], subjects[1]);
}

#[tokio::test]
async fn provider_errors_and_unknown_providers() {
    let app = TestApp::spawn().await;

    let denied = app
        .send(get_request(
            "/auth/social/google/callback?error=access_denied&state=abc",
        ))
        .await;
    assert_eq!(denied.status, StatusCode::BAD_REQUEST);
    assert_eq!(denied.json()["error"], "access_denied");

    let incomplete = app
        .send(get_request("/auth/social/google/callback?state=abc"))
        .await;
    assert_eq!(incomplete.status, StatusCode::BAD_REQUEST);

    let unknown = app
        .send(get_request(&format!(
            "/auth/social/github/start?client_id={}&redirect_uri={}",
            WEB_CLIENT,
            urlencoding::encode(REDIRECT_URI)
        )))
        .await;
    assert_eq!(unknown.status, StatusCode::NOT_FOUND);
    assert_eq!(unknown.json()["error"], "unsupported_provider");
}
