//! Refresh token rotation, replay detection and the refresh hook.

mod common;

use common::*;
use serde_json::json;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

async fn obtain_tokens(server: &TestServer) -> serde_json::Value {
    create_default_client(server, "c1").await;
    let flow = run_code_flow(server, "c1", "openid offline", "alice", false).await;
    exchange_code(server, "c1", &flow.code).await
}

async fn refresh(server: &TestServer, refresh_token: &str) -> serde_json::Value {
    let response = post_form(
        &server.public,
        "/oauth2/token",
        &[
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_token),
        ],
        Some(("c1", "secret-one")),
    )
    .await;
    body_json(response).await
}

#[tokio::test]
async fn rotation_invalidates_the_presented_token() {
    let server = test_server();
    let tokens = obtain_tokens(&server).await;
    let old_access = tokens["access_token"].as_str().unwrap().to_string();
    let old_refresh = tokens["refresh_token"].as_str().unwrap().to_string();

    let rotated = refresh(&server, &old_refresh).await;
    let new_access = rotated["access_token"].as_str().unwrap();
    let new_refresh = rotated["refresh_token"].as_str().unwrap();
    assert_ne!(new_access, old_access);
    assert_ne!(new_refresh, old_refresh);

    // The rotated grant keeps scope and identity, and re-issues an ID token.
    assert_eq!(rotated["scope"], "openid offline");
    assert_eq!(jwt_claims(rotated["id_token"].as_str().unwrap())["sub"], "alice");

    // The old access token died with the rotation.
    assert_eq!(introspect(&server, &old_access).await["active"], false);
    assert_eq!(introspect(&server, new_access).await["active"], true);
}

#[tokio::test]
async fn replaying_a_rotated_token_revokes_the_whole_graph() {
    let server = test_server();
    let tokens = obtain_tokens(&server).await;
    let old_refresh = tokens["refresh_token"].as_str().unwrap().to_string();

    let rotated = refresh(&server, &old_refresh).await;
    let new_access = rotated["access_token"].as_str().unwrap().to_string();
    let new_refresh = rotated["refresh_token"].as_str().unwrap().to_string();

    // Presenting the consumed token again burns everything.
    let replay = refresh(&server, &old_refresh).await;
    assert_eq!(replay["error"], "invalid_grant");
    assert_eq!(introspect(&server, &new_access).await["active"], false);

    let after = refresh(&server, &new_refresh).await;
    assert_eq!(after["error"], "invalid_grant");
}

#[tokio::test]
async fn scope_can_be_narrowed_but_not_widened() {
    let server = test_server();
    let tokens = obtain_tokens(&server).await;
    let refresh_token = tokens["refresh_token"].as_str().unwrap();

    let narrowed = post_form(
        &server.public,
        "/oauth2/token",
        &[
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_token),
            ("scope", "offline"),
        ],
        Some(("c1", "secret-one")),
    )
    .await;
    let narrowed = body_json(narrowed).await;
    assert_eq!(narrowed["scope"], "offline");

    let widened = post_form(
        &server.public,
        "/oauth2/token",
        &[
            ("grant_type", "refresh_token"),
            ("refresh_token", narrowed["refresh_token"].as_str().unwrap()),
            ("scope", "offline payments"),
        ],
        Some(("c1", "secret-one")),
    )
    .await;
    assert_eq!(body_json(widened).await["error"], "invalid_scope");
}

#[tokio::test]
async fn hook_response_claims_are_merged_into_the_new_tokens() {
    let hook = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/hook"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "session": { "access_token": { "hooked": true } }
        })))
        .mount(&hook)
        .await;

    let mut config = test_config();
    config.oauth2.refresh_token_hook = Some(format!("{}/hook", hook.uri()));
    let server = test_server_with_config(config);

    let tokens = obtain_tokens(&server).await;
    let rotated = refresh(&server, tokens["refresh_token"].as_str().unwrap()).await;

    let reflected = introspect(&server, rotated["access_token"].as_str().unwrap()).await;
    assert_eq!(reflected["active"], true);
    assert_eq!(reflected["ext"]["hooked"], true);
}

#[tokio::test]
async fn hook_denial_fails_access_denied_and_keeps_the_token() {
    let hook = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/hook"))
        .respond_with(ResponseTemplate::new(403))
        .mount(&hook)
        .await;

    let mut config = test_config();
    config.oauth2.refresh_token_hook = Some(format!("{}/hook", hook.uri()));
    let server = test_server_with_config(config);

    let tokens = obtain_tokens(&server).await;
    let refresh_token = tokens["refresh_token"].as_str().unwrap().to_string();

    let denied = refresh(&server, &refresh_token).await;
    assert_eq!(denied["error"], "access_denied");

    // The presented refresh token was not consumed: with the hook gone
    // permissive, the same token still rotates.
    hook.reset().await;
    Mock::given(method("POST"))
        .and(path("/hook"))
        .respond_with(ResponseTemplate::new(204))
        .mount(&hook)
        .await;
    let rotated = refresh(&server, &refresh_token).await;
    assert!(rotated["access_token"].as_str().is_some(), "got {rotated}");
}

#[tokio::test]
async fn hook_malfunction_is_a_server_error() {
    let hook = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/hook"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&hook)
        .await;

    let mut config = test_config();
    config.oauth2.refresh_token_hook = Some(format!("{}/hook", hook.uri()));
    let server = test_server_with_config(config);

    let tokens = obtain_tokens(&server).await;
    let failed = refresh(&server, tokens["refresh_token"].as_str().unwrap()).await;
    assert_eq!(failed["error"], "server_error");
}
