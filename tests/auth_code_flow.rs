//! End-to-end authorization code flow: login and consent round trips, token
//! exchange, session skip with prompt=none, and the single-use guarantees of
//! codes and verifiers.

mod common;

use axum::http::StatusCode;
use common::*;
use serde_json::json;

#[tokio::test]
async fn full_code_flow_issues_tokens_and_reuses_session() {
    let server = test_server();
    create_default_client(&server, "c1").await;

    // User "alice" completes login and consent with remember=true.
    let flow = run_code_flow(&server, "c1", "openid offline", "alice", true).await;
    let tokens = exchange_code(&server, "c1", &flow.code).await;

    let access_token = tokens["access_token"].as_str().unwrap();
    assert!(access_token.starts_with("ory_at_"));
    assert!(tokens["refresh_token"].as_str().unwrap().starts_with("ory_rt_"));

    let id_claims = jwt_claims(tokens["id_token"].as_str().unwrap());
    assert_eq!(id_claims["sub"], "alice");
    assert_eq!(id_claims["aud"], json!(["c1"]));
    assert_eq!(id_claims["iss"], ISSUER);
    assert_eq!(id_claims["nonce"], json!(null));
    let first_sid = id_claims["sid"].as_str().unwrap().to_string();
    assert!(!first_sid.is_empty());

    let reflected = introspect(&server, access_token).await;
    assert_eq!(reflected["active"], true);
    assert_eq!(reflected["sub"], "alice");
    assert_eq!(reflected["client_id"], "c1");
    assert_eq!(reflected["token_use"], "access_token");

    // Second authorization with prompt=none completes without any UI call
    // and keeps the session id.
    let uri = "/oauth2/auth?response_type=code&client_id=c1&redirect_uri=https%3A%2F%2Fcb%2F&scope=openid%20offline&prompt=none&state=second";
    let response = get_with_cookies(&server.public, uri, &flow.jar).await;
    assert_eq!(response.status(), StatusCode::SEE_OTHER);
    let redirect = location(&response);
    assert!(redirect.starts_with("https://cb/"), "got {redirect}");
    let second_code = url_param(&redirect, "code").expect("code from prompt=none pass");
    assert_eq!(url_param(&redirect, "state").unwrap(), "second");

    let second_tokens = exchange_code(&server, "c1", &second_code).await;
    let second_claims = jwt_claims(second_tokens["id_token"].as_str().unwrap());
    assert_eq!(second_claims["sid"].as_str().unwrap(), first_sid);
    assert_eq!(second_claims["sub"], "alice");
}

#[tokio::test]
async fn code_exchange_succeeds_at_most_once_and_replay_revokes_family() {
    let server = test_server();
    create_default_client(&server, "c1").await;

    let flow = run_code_flow(&server, "c1", "openid offline", "alice", false).await;
    let tokens = exchange_code(&server, "c1", &flow.code).await;
    let access_token = tokens["access_token"].as_str().unwrap().to_string();
    assert_eq!(introspect(&server, &access_token).await["active"], true);

    // Replay: invalid_grant, and the earlier tokens die with it.
    let replay = exchange_code(&server, "c1", &flow.code).await;
    assert_eq!(replay["error"], "invalid_grant");
    assert_eq!(introspect(&server, &access_token).await["active"], false);

    let refresh_token = tokens["refresh_token"].as_str().unwrap();
    let refused = post_form(
        &server.public,
        "/oauth2/token",
        &[("grant_type", "refresh_token"), ("refresh_token", refresh_token)],
        Some(("c1", "secret-one")),
    )
    .await;
    assert_eq!(body_json(refused).await["error"], "invalid_grant");
}

#[tokio::test]
async fn login_and_consent_verifiers_are_single_use() {
    let server = test_server();
    create_default_client(&server, "c1").await;

    // Capture the consent redirect_to by re-running accept (idempotent).
    let flow = run_code_flow(&server, "c1", "openid", "alice", false).await;
    let accept_again = put_json(
        &server.admin,
        &format!(
            "/admin/oauth2/auth/requests/consent/accept?challenge={}",
            flow.consent_challenge
        ),
        json!({"grant_scope": ["openid"], "session": {}}),
    )
    .await;
    let redirect_to = body_json(accept_again).await["redirect_to"]
        .as_str()
        .unwrap()
        .to_string();

    // The verifier was redeemed during the flow; a second redemption fails.
    let response = get_with_cookies(&server.public, &path_and_query(&redirect_to), &flow.jar).await;
    assert_eq!(response.status(), StatusCode::SEE_OTHER);
    let redirect = location(&response);
    assert_eq!(url_param(&redirect, "error").unwrap(), "invalid_request");
}

#[tokio::test]
async fn accept_login_is_idempotent_and_returns_the_same_verifier() {
    let server = test_server();
    create_default_client(&server, "c1").await;

    let uri = "/oauth2/auth?response_type=code&client_id=c1&redirect_uri=https%3A%2F%2Fcb%2F&scope=openid";
    let mut jar = CookieJar::default();
    let response = get_with_cookies(&server.public, uri, &jar).await;
    jar.absorb(&response);
    let challenge = url_param(&location(&response), "login_challenge").unwrap();

    let body = json!({"subject": "alice"});
    let first = body_json(
        put_json(
            &server.admin,
            &format!("/admin/oauth2/auth/requests/login/accept?challenge={challenge}"),
            body.clone(),
        )
        .await,
    )
    .await;
    let second = body_json(
        put_json(
            &server.admin,
            &format!("/admin/oauth2/auth/requests/login/accept?challenge={challenge}"),
            body,
        )
        .await,
    )
    .await;
    assert_eq!(first["redirect_to"], second["redirect_to"]);
}

#[tokio::test]
async fn prompt_none_without_session_fails_login_required() {
    let server = test_server();
    create_default_client(&server, "c1").await;

    let uri = "/oauth2/auth?response_type=code&client_id=c1&redirect_uri=https%3A%2F%2Fcb%2F&scope=openid&prompt=none&state=xyz";
    let response = get_with_cookies(&server.public, uri, &CookieJar::default()).await;
    assert_eq!(response.status(), StatusCode::SEE_OTHER);
    let redirect = location(&response);
    assert!(redirect.starts_with("https://cb/"));
    assert_eq!(url_param(&redirect, "error").unwrap(), "login_required");
    assert_eq!(url_param(&redirect, "state").unwrap(), "xyz");
}

#[tokio::test]
async fn prompt_none_respects_max_age() {
    let server = test_server();
    create_default_client(&server, "c1").await;
    let flow = run_code_flow(&server, "c1", "openid offline", "alice", true).await;

    // Generous max_age: the session is fresh enough.
    let ok_uri = "/oauth2/auth?response_type=code&client_id=c1&redirect_uri=https%3A%2F%2Fcb%2F&scope=openid&prompt=none&max_age=3600";
    let response = get_with_cookies(&server.public, ok_uri, &flow.jar).await;
    assert!(url_param(&location(&response), "code").is_some());

    // max_age=0: any session is too old.
    let stale_uri = "/oauth2/auth?response_type=code&client_id=c1&redirect_uri=https%3A%2F%2Fcb%2F&scope=openid&prompt=none&max_age=0";
    let response = get_with_cookies(&server.public, stale_uri, &flow.jar).await;
    assert_eq!(
        url_param(&location(&response), "error").unwrap(),
        "login_required"
    );
}

#[tokio::test]
async fn prompt_login_resets_skip() {
    let server = test_server();
    create_default_client(&server, "c1").await;
    let flow = run_code_flow(&server, "c1", "openid offline", "alice", true).await;

    // With an authenticated session and prompt=login, the login request must
    // reach the UI with skip=false.
    let uri = "/oauth2/auth?response_type=code&client_id=c1&redirect_uri=https%3A%2F%2Fcb%2F&scope=openid&prompt=login";
    let response = get_with_cookies(&server.public, uri, &flow.jar).await;
    let challenge = url_param(&location(&response), "login_challenge").unwrap();

    let pending = body_json(
        get_with_cookies(
            &server.admin,
            &format!("/admin/oauth2/auth/requests/login?challenge={challenge}"),
            &CookieJar::default(),
        )
        .await,
    )
    .await;
    assert_eq!(pending["skip"], false);
}

#[tokio::test]
async fn skip_is_set_for_remembered_sessions() {
    let server = test_server();
    create_default_client(&server, "c1").await;
    let flow = run_code_flow(&server, "c1", "openid offline", "alice", true).await;

    let uri = "/oauth2/auth?response_type=code&client_id=c1&redirect_uri=https%3A%2F%2Fcb%2F&scope=openid";
    let response = get_with_cookies(&server.public, uri, &flow.jar).await;
    let challenge = url_param(&location(&response), "login_challenge").unwrap();

    let pending = body_json(
        get_with_cookies(
            &server.admin,
            &format!("/admin/oauth2/auth/requests/login?challenge={challenge}"),
            &CookieJar::default(),
        )
        .await,
    )
    .await;
    assert_eq!(pending["skip"], true);
    assert_eq!(pending["subject"], "alice");
}

#[tokio::test]
async fn rejected_login_propagates_error_to_client() {
    let server = test_server();
    create_default_client(&server, "c1").await;

    let uri = "/oauth2/auth?response_type=code&client_id=c1&redirect_uri=https%3A%2F%2Fcb%2F&scope=openid&state=abc";
    let mut jar = CookieJar::default();
    let response = get_with_cookies(&server.public, uri, &jar).await;
    jar.absorb(&response);
    let challenge = url_param(&location(&response), "login_challenge").unwrap();

    let reject = body_json(
        put_json(
            &server.admin,
            &format!("/admin/oauth2/auth/requests/login/reject?challenge={challenge}"),
            json!({"error": "access_denied", "error_description": "user says no"}),
        )
        .await,
    )
    .await;
    let redirect_to = reject["redirect_to"].as_str().unwrap();

    let response = get_with_cookies(&server.public, &path_and_query(redirect_to), &jar).await;
    let redirect = location(&response);
    assert!(redirect.starts_with("https://cb/"));
    assert_eq!(url_param(&redirect, "error").unwrap(), "access_denied");
    assert_eq!(url_param(&redirect, "state").unwrap(), "abc");
}

#[tokio::test]
async fn unknown_scope_is_rejected() {
    let server = test_server();
    create_default_client(&server, "c1").await;

    let uri = "/oauth2/auth?response_type=code&client_id=c1&redirect_uri=https%3A%2F%2Fcb%2F&scope=openid%20payments";
    let response = get_with_cookies(&server.public, uri, &CookieJar::default()).await;
    let redirect = location(&response);
    assert!(redirect.starts_with("https://cb/"));
    assert_eq!(url_param(&redirect, "error").unwrap(), "invalid_scope");
}

#[tokio::test]
async fn mismatched_redirect_uri_lands_on_error_page() {
    let server = test_server();
    create_default_client(&server, "c1").await;

    let uri = "/oauth2/auth?response_type=code&client_id=c1&redirect_uri=https%3A%2F%2Fevil%2F&scope=openid";
    let response = get_with_cookies(&server.public, uri, &CookieJar::default()).await;
    let redirect = location(&response);
    assert!(redirect.starts_with(ERROR_URL), "got {redirect}");
    assert_eq!(
        url_param(&redirect, "error").unwrap(),
        "invalid_redirect_uri"
    );
}

#[tokio::test]
async fn csrf_cookie_is_required_on_verifier_reentry() {
    let server = test_server();
    create_default_client(&server, "c1").await;

    let uri = "/oauth2/auth?response_type=code&client_id=c1&redirect_uri=https%3A%2F%2Fcb%2F&scope=openid";
    let response = get_with_cookies(&server.public, uri, &CookieJar::default()).await;
    let challenge = url_param(&location(&response), "login_challenge").unwrap();

    let accept = body_json(
        put_json(
            &server.admin,
            &format!("/admin/oauth2/auth/requests/login/accept?challenge={challenge}"),
            json!({"subject": "alice"}),
        )
        .await,
    )
    .await;
    let redirect_to = accept["redirect_to"].as_str().unwrap();

    // Re-entry without the CSRF cookie is forbidden.
    let response = get_with_cookies(
        &server.public,
        &path_and_query(redirect_to),
        &CookieJar::default(),
    )
    .await;
    let redirect = location(&response);
    assert!(redirect.starts_with(ERROR_URL));
    assert_eq!(url_param(&redirect, "error").unwrap(), "request_forbidden");
}

#[tokio::test]
async fn pkce_is_enforced_end_to_end() {
    let server = test_server();
    let mut client = create_default_client(&server, "pkce-client").await;
    client.token_endpoint_auth_method = "none".to_string();
    client.secret_signature = None;
    server.app.store.update_client(client).await.unwrap();

    let verifier = "a".repeat(50);
    let challenge = {
        use base64::Engine as _;
        use sha2::Digest;
        base64::engine::general_purpose::URL_SAFE_NO_PAD
            .encode(sha2::Sha256::digest(verifier.as_bytes()))
    };

    let uri = format!(
        "/oauth2/auth?response_type=code&client_id=pkce-client&redirect_uri=https%3A%2F%2Fcb%2F&scope=openid&code_challenge={challenge}&code_challenge_method=S256"
    );
    let flow = run_code_flow_at(&server, &uri, "alice", false, CookieJar::default()).await;

    // Wrong verifier fails.
    let bad = post_form(
        &server.public,
        "/oauth2/token",
        &[
            ("grant_type", "authorization_code"),
            ("code", &flow.code),
            ("redirect_uri", "https://cb/"),
            ("client_id", "pkce-client"),
            ("code_verifier", "wrong-verifier-wrong-verifier-wrong"),
        ],
        None,
    )
    .await;
    assert_eq!(body_json(bad).await["error"], "invalid_grant");
}
