//! RP-initiated and non-RP logout, including back-channel Logout Token
//! delivery.

mod common;

use axum::http::StatusCode;
use common::*;
use serde_json::json;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

#[tokio::test]
async fn rp_initiated_logout_revokes_and_notifies() {
    let backchannel = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/backchannel"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&backchannel)
        .await;

    let server = test_server();
    let mut client = create_default_client(&server, "c1").await;
    client.backchannel_logout_uri = Some(format!("{}/backchannel", backchannel.uri()));
    server.app.store.update_client(client).await.unwrap();

    let flow = run_code_flow(&server, "c1", "openid offline", "alice", true).await;
    let tokens = exchange_code(&server, "c1", &flow.code).await;
    let access_token = tokens["access_token"].as_str().unwrap().to_string();
    let id_token = tokens["id_token"].as_str().unwrap().to_string();
    let sid = jwt_claims(&id_token)["sid"].as_str().unwrap().to_string();

    // Start RP-initiated logout with the id_token_hint.
    let uri = format!(
        "/oauth2/sessions/logout?id_token_hint={id_token}&post_logout_redirect_uri=https%3A%2F%2Fcb%2Fout&state=xyz"
    );
    let response = get_with_cookies(&server.public, &uri, &flow.jar).await;
    assert_eq!(response.status(), StatusCode::SEE_OTHER);
    let redirect = location(&response);
    assert!(redirect.starts_with(LOGOUT_URL), "got {redirect}");
    let challenge = url_param(&redirect, "logout_challenge").unwrap();

    // The Logout UI accepts.
    let accept = body_json(
        put_json(
            &server.admin,
            &format!("/admin/oauth2/auth/requests/logout/accept?challenge={challenge}"),
            json!({}),
        )
        .await,
    )
    .await;
    let redirect_to = accept["redirect_to"].as_str().unwrap().to_string();

    // The verifier leg deletes the session, revokes tokens, fans out the
    // Logout Token and lands the browser on the registered redirect.
    let response = get_with_cookies(&server.public, &path_and_query(&redirect_to), &flow.jar).await;
    assert_eq!(response.status(), StatusCode::SEE_OTHER);
    let final_redirect = location(&response);
    assert!(final_redirect.starts_with("https://cb/out"), "got {final_redirect}");
    assert_eq!(url_param(&final_redirect, "state").unwrap(), "xyz");

    assert_eq!(introspect(&server, &access_token).await["active"], false);
    assert_eq!(
        introspect(&server, tokens["refresh_token"].as_str().unwrap()).await["active"],
        false
    );

    // Fan-out is detached; give it a moment, then inspect what arrived.
    tokio::time::sleep(std::time::Duration::from_millis(300)).await;
    let requests = backchannel.received_requests().await.unwrap();
    assert_eq!(requests.len(), 1);
    let body = String::from_utf8(requests[0].body.clone()).unwrap();
    let logout_token = body
        .strip_prefix("logout_token=")
        .map(|t| urlencoding::decode(t).unwrap().into_owned())
        .unwrap();
    let claims = jwt_claims(&logout_token);
    assert_eq!(claims["sid"].as_str().unwrap(), sid);
    assert_eq!(claims["aud"], json!(["c1"]));
    assert_eq!(claims["iss"], ISSUER);
    assert!(
        claims["events"]["http://schemas.openid.net/event/backchannel-logout"].is_object()
    );

    // The session is gone: prompt=none now requires a fresh login.
    let uri = "/oauth2/auth?response_type=code&client_id=c1&redirect_uri=https%3A%2F%2Fcb%2F&scope=openid&prompt=none";
    let response = get_with_cookies(&server.public, uri, &CookieJar::default()).await;
    assert_eq!(
        url_param(&location(&response), "error").unwrap(),
        "login_required"
    );
}

#[tokio::test]
async fn state_without_hint_is_rejected() {
    let server = test_server();
    create_default_client(&server, "c1").await;

    let response = get_with_cookies(
        &server.public,
        "/oauth2/sessions/logout?state=xyz",
        &CookieJar::default(),
    )
    .await;
    let redirect = location(&response);
    assert!(redirect.starts_with(ERROR_URL), "got {redirect}");
    assert_eq!(url_param(&redirect, "error").unwrap(), "invalid_request");
}

#[tokio::test]
async fn unregistered_post_logout_uri_is_rejected() {
    let server = test_server();
    create_default_client(&server, "c1").await;
    let flow = run_code_flow(&server, "c1", "openid", "alice", true).await;
    let tokens = exchange_code(&server, "c1", &flow.code).await;
    let id_token = tokens["id_token"].as_str().unwrap();

    let uri = format!(
        "/oauth2/sessions/logout?id_token_hint={id_token}&post_logout_redirect_uri=https%3A%2F%2Felsewhere%2F"
    );
    let response = get_with_cookies(&server.public, &uri, &flow.jar).await;
    let redirect = location(&response);
    assert!(redirect.starts_with(ERROR_URL));
    assert_eq!(url_param(&redirect, "error").unwrap(), "invalid_request");
}

#[tokio::test]
async fn cookie_without_session_falls_back_to_default_redirect() {
    let server = test_server();
    create_default_client(&server, "c1").await;
    let flow = run_code_flow(&server, "c1", "openid", "alice", true).await;

    // Remove the session row behind the cookie's back.
    server
        .app
        .store
        .delete_login_sessions_by_subject("alice")
        .await
        .unwrap();

    let response =
        get_with_cookies(&server.public, "/oauth2/sessions/logout", &flow.jar).await;
    assert_eq!(response.status(), StatusCode::SEE_OTHER);
    assert_eq!(location(&response), DEFAULT_POST_LOGOUT);
}

#[tokio::test]
async fn expired_id_token_hint_is_still_accepted() {
    let server = test_server();
    create_default_client(&server, "c1").await;
    let flow = run_code_flow(&server, "c1", "openid", "alice", true).await;
    let tokens = exchange_code(&server, "c1", &flow.code).await;
    let sid = jwt_claims(tokens["id_token"].as_str().unwrap())["sid"]
        .as_str()
        .unwrap()
        .to_string();

    // Sign a hint whose exp lies in the past; the decoder ignores expiry, so
    // it still routes to the Logout UI rather than the error page.
    let signer = server
        .app
        .keys
        .signer(gatehouse::server::keys::OPENID_KEY_SET, "RS256")
        .await
        .unwrap();
    let now = chrono::Utc::now().timestamp();
    let expired_hint = signer
        .sign(&json!({
            "iss": ISSUER,
            "sub": "alice",
            "aud": ["c1"],
            "iat": now - 7200,
            "exp": now - 3600,
            "sid": sid,
        }))
        .unwrap();

    let uri = format!("/oauth2/sessions/logout?id_token_hint={expired_hint}");
    let response = get_with_cookies(&server.public, &uri, &flow.jar).await;
    let redirect = location(&response);
    assert!(redirect.starts_with(LOGOUT_URL), "got {redirect}");

    // A hint issued in the future, by contrast, is fatal.
    let future_hint = signer
        .sign(&json!({
            "iss": ISSUER,
            "sub": "alice",
            "aud": ["c1"],
            "iat": now + 7200,
            "exp": now + 10800,
            "sid": sid,
        }))
        .unwrap();
    let uri = format!("/oauth2/sessions/logout?id_token_hint={future_hint}");
    let response = get_with_cookies(&server.public, &uri, &flow.jar).await;
    assert!(location(&response).starts_with(ERROR_URL));
}

#[tokio::test]
async fn no_session_and_no_hint_redirects_to_default() {
    let server = test_server();
    let response = get_with_cookies(
        &server.public,
        "/oauth2/sessions/logout",
        &CookieJar::default(),
    )
    .await;
    assert_eq!(location(&response), DEFAULT_POST_LOGOUT);
}
