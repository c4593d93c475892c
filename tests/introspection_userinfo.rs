//! Introspection, UserInfo (plain and signed), revocation and the JWKS
//! document.

mod common;

use axum::body::Body;
use axum::http::{Method, Request, StatusCode, header};
use common::*;
use serde_json::json;
use tower::ServiceExt;

async fn userinfo(server: &TestServer, bearer: Option<&str>) -> axum::http::Response<Body> {
    let mut builder = Request::builder().method(Method::GET).uri("/userinfo");
    if let Some(token) = bearer {
        builder = builder.header(header::AUTHORIZATION, format!("Bearer {token}"));
    }
    server
        .public
        .clone()
        .oneshot(builder.body(Body::empty()).unwrap())
        .await
        .unwrap()
}

#[tokio::test]
async fn userinfo_subject_matches_the_id_token() {
    let server = test_server();
    create_default_client(&server, "c1").await;
    let flow = run_code_flow(&server, "c1", "openid", "alice", false).await;
    let tokens = exchange_code(&server, "c1", &flow.code).await;

    let id_sub = jwt_claims(tokens["id_token"].as_str().unwrap())["sub"]
        .as_str()
        .unwrap()
        .to_string();

    let response = userinfo(&server, tokens["access_token"].as_str()).await;
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["sub"].as_str().unwrap(), id_sub);
}

#[tokio::test]
async fn userinfo_errors_use_www_authenticate() {
    let server = test_server();

    let response = userinfo(&server, None).await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(
        response
            .headers()
            .get(header::WWW_AUTHENTICATE)
            .unwrap()
            .to_str()
            .unwrap(),
        "Bearer"
    );

    let response = userinfo(&server, Some("ory_at_bogus.bogus")).await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    let challenge = response
        .headers()
        .get(header::WWW_AUTHENTICATE)
        .unwrap()
        .to_str()
        .unwrap()
        .to_string();
    assert!(challenge.contains("error=\"invalid_token\""), "got {challenge}");
}

#[tokio::test]
async fn signed_userinfo_is_a_jwt_from_the_openid_set() {
    let server = test_server();
    let mut client = create_default_client(&server, "c1").await;
    client.userinfo_signed_response_alg = "RS256".to_string();
    server.app.store.update_client(client).await.unwrap();

    let flow = run_code_flow(&server, "c1", "openid", "alice", false).await;
    let tokens = exchange_code(&server, "c1", &flow.code).await;

    let response = userinfo(&server, tokens["access_token"].as_str()).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response
            .headers()
            .get(header::CONTENT_TYPE)
            .unwrap()
            .to_str()
            .unwrap(),
        "application/jwt"
    );
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let jwt = String::from_utf8(bytes.to_vec()).unwrap();
    let claims = jwt_claims(&jwt);
    assert_eq!(claims["sub"], "alice");
    assert_eq!(claims["aud"], json!(["c1"]));
    assert_eq!(claims["iss"], ISSUER);
}

#[tokio::test]
async fn consent_session_claims_flow_into_tokens_and_userinfo() {
    let server = test_server();
    create_default_client(&server, "c1").await;

    // Drive the flow by hand so consent can attach custom claim maps.
    let uri = "/oauth2/auth?response_type=code&client_id=c1&redirect_uri=https%3A%2F%2Fcb%2F&scope=openid";
    let mut jar = CookieJar::default();
    let response = get_with_cookies(&server.public, uri, &jar).await;
    jar.absorb(&response);
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
    let response = get_with_cookies(
        &server.public,
        &path_and_query(accept["redirect_to"].as_str().unwrap()),
        &jar,
    )
    .await;
    jar.absorb(&response);
    let consent_challenge = url_param(&location(&response), "consent_challenge").unwrap();
    let accept = body_json(
        put_json(
            &server.admin,
            &format!("/admin/oauth2/auth/requests/consent/accept?challenge={consent_challenge}"),
            json!({
                "grant_scope": ["openid"],
                "session": {
                    "access_token": { "tier": "gold" },
                    "id_token": { "preferred_username": "alice@example.com" },
                },
            }),
        )
        .await,
    )
    .await;
    let response = get_with_cookies(
        &server.public,
        &path_and_query(accept["redirect_to"].as_str().unwrap()),
        &jar,
    )
    .await;
    let code = url_param(&location(&response), "code").unwrap();
    let tokens = exchange_code(&server, "c1", &code).await;

    // Access-token claims surface under ext in introspection.
    let reflected = introspect(&server, tokens["access_token"].as_str().unwrap()).await;
    assert_eq!(reflected["ext"]["tier"], "gold");

    // ID-token claims land in the ID token and UserInfo.
    let id_claims = jwt_claims(tokens["id_token"].as_str().unwrap());
    assert_eq!(id_claims["preferred_username"], "alice@example.com");

    let body = body_json(userinfo(&server, tokens["access_token"].as_str()).await).await;
    assert_eq!(body["preferred_username"], "alice@example.com");
}

#[tokio::test]
async fn revocation_kills_the_request_family() {
    let server = test_server();
    create_default_client(&server, "c1").await;
    let flow = run_code_flow(&server, "c1", "openid offline", "alice", false).await;
    let tokens = exchange_code(&server, "c1", &flow.code).await;
    let access_token = tokens["access_token"].as_str().unwrap();
    let refresh_token = tokens["refresh_token"].as_str().unwrap();

    let response = post_form(
        &server.public,
        "/oauth2/revoke",
        &[("token", refresh_token)],
        Some(("c1", "secret-one")),
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);

    assert_eq!(introspect(&server, access_token).await["active"], false);
    assert_eq!(introspect(&server, refresh_token).await["active"], false);

    // Unknown tokens still answer 200.
    let response = post_form(
        &server.public,
        "/oauth2/revoke",
        &[("token", "ory_at_unknown.unknown")],
        Some(("c1", "secret-one")),
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn expired_tokens_introspect_inactive() {
    let server = test_server();
    let mut config_client = create_default_client(&server, "c1").await;
    config_client.lifespans.authorization_code_grant_access_token_lifespan = Some(1);
    server.app.store.update_client(config_client).await.unwrap();

    let flow = run_code_flow(&server, "c1", "openid", "alice", false).await;
    let tokens = exchange_code(&server, "c1", &flow.code).await;
    let access_token = tokens["access_token"].as_str().unwrap();

    assert_eq!(introspect(&server, access_token).await["active"], true);
    tokio::time::sleep(std::time::Duration::from_millis(1500)).await;
    assert_eq!(introspect(&server, access_token).await["active"], false);
}

#[tokio::test]
async fn discovery_and_jwks_are_served() {
    let server = test_server();

    let discovery = body_json(
        get_with_cookies(
            &server.public,
            "/.well-known/openid-configuration",
            &CookieJar::default(),
        )
        .await,
    )
    .await;
    assert_eq!(discovery["issuer"], ISSUER);
    assert_eq!(
        discovery["token_endpoint"],
        format!("{ISSUER}/oauth2/token")
    );

    let jwks = body_json(
        get_with_cookies(&server.public, "/.well-known/jwks.json", &CookieJar::default()).await,
    )
    .await;
    let keys = jwks["keys"].as_array().unwrap();
    assert!(!keys.is_empty());
    for key in keys {
        assert_eq!(key["kty"], "RSA");
        assert!(key.get("d").is_none());
    }
}

#[tokio::test]
async fn jwt_access_token_strategy_issues_introspectable_jwts() {
    let mut config = test_config();
    config.oauth2.access_token_strategy = "jwt".to_string();
    let server = test_server_with_config(config);
    create_default_client(&server, "c1").await;

    let flow = run_code_flow(&server, "c1", "openid", "alice", false).await;
    let tokens = exchange_code(&server, "c1", &flow.code).await;
    let access_token = tokens["access_token"].as_str().unwrap();

    // Three-segment JWT with the documented claim set.
    assert_eq!(access_token.split('.').count(), 3);
    let claims = jwt_claims(access_token);
    assert_eq!(claims["sub"], "alice");
    assert_eq!(claims["client_id"], "c1");
    assert_eq!(claims["iss"], ISSUER);
    assert_eq!(claims["aud"], json!(["c1"]));
    assert_eq!(claims["scp"], json!(["openid"]));
    assert_eq!(claims["nbf"], claims["iat"]);
    assert!(claims["jti"].as_str().is_some());

    // Introspection resolves the jti to the stored row.
    let reflected = introspect(&server, access_token).await;
    assert_eq!(reflected["active"], true);
    assert_eq!(reflected["sub"], "alice");
}
