//! Dynamic client registration and the registration access token lifecycle.

mod common;

use axum::body::Body;
use axum::http::{Method, Request, StatusCode, header};
use common::*;
use serde_json::json;
use tower::ServiceExt;

async fn self_service(
    server: &TestServer,
    method: Method,
    uri: &str,
    token: &str,
    body: Option<serde_json::Value>,
) -> axum::http::Response<Body> {
    let mut builder = Request::builder()
        .method(method)
        .uri(uri)
        .header(header::AUTHORIZATION, format!("Bearer {token}"));
    let body = match body {
        Some(value) => {
            builder = builder.header(header::CONTENT_TYPE, "application/json");
            Body::from(value.to_string())
        }
        None => Body::empty(),
    };
    server
        .public
        .clone()
        .oneshot(builder.body(body).unwrap())
        .await
        .unwrap()
}

#[tokio::test]
async fn registration_returns_credentials_exactly_once() {
    let server = test_server();

    let response = post_json(
        &server.public,
        "/oauth2/register",
        json!({ "redirect_uris": ["https://cb/"] }),
    )
    .await;
    assert_eq!(response.status(), StatusCode::CREATED);
    let body = body_json(response).await;

    let client_id = body["client_id"].as_str().unwrap().to_string();
    let secret = body["client_secret"].as_str().unwrap();
    let rat = body["registration_access_token"].as_str().unwrap().to_string();
    assert!(secret.len() >= 26);
    assert!(rat.starts_with("ory_at_"));
    assert_eq!(
        body["registration_client_uri"].as_str().unwrap(),
        format!("{ISSUER}/oauth2/register/{client_id}")
    );

    // Subsequent reads never echo the secret again.
    let read = self_service(
        &server,
        Method::GET,
        &format!("/oauth2/register/{client_id}"),
        &rat,
        None,
    )
    .await;
    assert_eq!(read.status(), StatusCode::OK);
    let read = body_json(read).await;
    assert!(read.get("client_secret").is_none());
    assert_eq!(read["client_id"], client_id.as_str());
}

#[tokio::test]
async fn altered_rat_is_rejected_without_leaking_existence() {
    let server = test_server();
    let body = body_json(
        post_json(
            &server.public,
            "/oauth2/register",
            json!({ "redirect_uris": ["https://cb/"] }),
        )
        .await,
    )
    .await;
    let client_id = body["client_id"].as_str().unwrap().to_string();
    let rat = body["registration_access_token"].as_str().unwrap();

    let mut altered = rat.to_string();
    altered.pop();
    altered.push(if rat.ends_with('x') { 'y' } else { 'x' });

    for token in [altered.as_str(), "ory_at_completely.bogus"] {
        let response = self_service(
            &server,
            Method::GET,
            &format!("/oauth2/register/{client_id}"),
            token,
            None,
        )
        .await;
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        let error = body_json(response).await;
        assert_eq!(error["error"], "invalid_client");
        assert!(
            error["error_description"]
                .as_str()
                .unwrap()
                .contains("does not exist or you provided incorrect credentials")
        );
    }

    // The same uniform answer for a client that does not exist at all.
    let response = self_service(
        &server,
        Method::GET,
        "/oauth2/register/no-such-client",
        rat,
        None,
    )
    .await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn caller_supplied_secret_is_refused() {
    let server = test_server();
    let response = post_json(
        &server.public,
        "/oauth2/register",
        json!({ "redirect_uris": ["https://cb/"], "client_secret": "mine" }),
    )
    .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(
        body_json(response).await["error"],
        "invalid_client_metadata"
    );
}

#[tokio::test]
async fn caller_supplied_metadata_is_refused() {
    let server = test_server();
    let response = post_json(
        &server.public,
        "/oauth2/register",
        json!({ "redirect_uris": ["https://cb/"], "metadata": {"tier": "gold"} }),
    )
    .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn update_rotates_the_registration_token() {
    let server = test_server();
    let body = body_json(
        post_json(
            &server.public,
            "/oauth2/register",
            json!({ "redirect_uris": ["https://cb/"] }),
        )
        .await,
    )
    .await;
    let client_id = body["client_id"].as_str().unwrap().to_string();
    let old_rat = body["registration_access_token"].as_str().unwrap().to_string();

    let updated = self_service(
        &server,
        Method::PUT,
        &format!("/oauth2/register/{client_id}"),
        &old_rat,
        Some(json!({ "redirect_uris": ["https://cb/"], "client_name": "renamed" })),
    )
    .await;
    assert_eq!(updated.status(), StatusCode::OK);
    let updated = body_json(updated).await;
    let new_rat = updated["registration_access_token"].as_str().unwrap().to_string();
    assert_ne!(new_rat, old_rat);
    assert_eq!(updated["client_name"], "renamed");

    // The old token is dead, the new one works.
    let stale = self_service(
        &server,
        Method::GET,
        &format!("/oauth2/register/{client_id}"),
        &old_rat,
        None,
    )
    .await;
    assert_eq!(stale.status(), StatusCode::UNAUTHORIZED);

    let fresh = self_service(
        &server,
        Method::GET,
        &format!("/oauth2/register/{client_id}"),
        &new_rat,
        None,
    )
    .await;
    assert_eq!(fresh.status(), StatusCode::OK);
}

#[tokio::test]
async fn delete_removes_the_registration() {
    let server = test_server();
    let body = body_json(
        post_json(
            &server.public,
            "/oauth2/register",
            json!({ "redirect_uris": ["https://cb/"] }),
        )
        .await,
    )
    .await;
    let client_id = body["client_id"].as_str().unwrap().to_string();
    let rat = body["registration_access_token"].as_str().unwrap().to_string();

    let response = self_service(
        &server,
        Method::DELETE,
        &format!("/oauth2/register/{client_id}"),
        &rat,
        None,
    )
    .await;
    assert_eq!(response.status(), StatusCode::NO_CONTENT);

    assert!(server.app.store.get_client(&client_id).await.unwrap().is_none());
}

#[tokio::test]
async fn registration_can_be_disabled() {
    let mut config = test_config();
    config.oauth2.dynamic_registration_enabled = false;
    let server = test_server_with_config(config);

    let response = post_json(
        &server.public,
        "/oauth2/register",
        json!({ "redirect_uris": ["https://cb/"] }),
    )
    .await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}
