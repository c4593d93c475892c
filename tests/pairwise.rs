//! Pairwise subject obfuscation across the flow, introspection and UserInfo.

mod common;

use axum::body::Body;
use axum::http::{Method, Request, header};
use common::*;
use gatehouse::utility::obfuscate_subject;
use tower::ServiceExt;

async fn create_pairwise_client(server: &TestServer, client_id: &str, sector: Option<&str>) {
    let mut client = create_default_client(server, client_id).await;
    client.subject_type = "pairwise".to_string();
    client.sector_identifier_uri = sector.map(|s| s.to_string());
    server.app.store.update_client(client).await.unwrap();
}

#[tokio::test]
async fn id_token_subject_is_obfuscated_access_token_subject_is_not() {
    let server = test_server();
    create_pairwise_client(&server, "c2", Some("https://s/")).await;

    let flow = run_code_flow(&server, "c2", "openid offline", "bob", false).await;
    let tokens = exchange_code(&server, "c2", &flow.code).await;

    let expected = obfuscate_subject("https://s/", "bob", "integration-salt");
    let id_claims = jwt_claims(tokens["id_token"].as_str().unwrap());
    assert_eq!(id_claims["sub"].as_str().unwrap(), expected);

    // The access token keeps the local subject.
    let reflected = introspect(&server, tokens["access_token"].as_str().unwrap()).await;
    assert_eq!(reflected["sub"], "bob");

    // UserInfo reports the same subject as the ID token.
    let response = server
        .public
        .clone()
        .oneshot(
            Request::builder()
                .method(Method::GET)
                .uri("/userinfo")
                .header(
                    header::AUTHORIZATION,
                    format!("Bearer {}", tokens["access_token"].as_str().unwrap()),
                )
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    let userinfo = body_json(response).await;
    assert_eq!(userinfo["sub"].as_str().unwrap(), expected);
}

#[tokio::test]
async fn obfuscation_is_stable_and_sector_scoped() {
    let server = test_server();
    create_pairwise_client(&server, "c2", Some("https://s/")).await;
    create_pairwise_client(&server, "c3", Some("https://other/")).await;

    let first = run_code_flow(&server, "c2", "openid", "bob", false).await;
    let first_tokens = exchange_code(&server, "c2", &first.code).await;
    let first_sub = jwt_claims(first_tokens["id_token"].as_str().unwrap())["sub"]
        .as_str()
        .unwrap()
        .to_string();

    // Same client, second session: same pairwise subject.
    let second = run_code_flow(&server, "c2", "openid", "bob", false).await;
    let second_tokens = exchange_code(&server, "c2", &second.code).await;
    assert_eq!(
        jwt_claims(second_tokens["id_token"].as_str().unwrap())["sub"]
            .as_str()
            .unwrap(),
        first_sub
    );

    // Different sector: different pairwise subject.
    let other = run_code_flow(&server, "c3", "openid", "bob", false).await;
    let other_tokens = exchange_code(&server, "c3", &other.code).await;
    assert_ne!(
        jwt_claims(other_tokens["id_token"].as_str().unwrap())["sub"]
            .as_str()
            .unwrap(),
        first_sub
    );
}

#[tokio::test]
async fn single_redirect_uri_host_serves_as_sector_fallback() {
    let server = test_server();
    create_pairwise_client(&server, "c2", None).await;

    let flow = run_code_flow(&server, "c2", "openid", "bob", false).await;
    let tokens = exchange_code(&server, "c2", &flow.code).await;

    let expected = obfuscate_subject("cb", "bob", "integration-salt");
    assert_eq!(
        jwt_claims(tokens["id_token"].as_str().unwrap())["sub"]
            .as_str()
            .unwrap(),
        expected
    );
}

#[tokio::test]
async fn force_subject_identifier_overrides_obfuscation() {
    let server = test_server();
    create_pairwise_client(&server, "c2", Some("https://s/")).await;

    let uri = "/oauth2/auth?response_type=code&client_id=c2&redirect_uri=https%3A%2F%2Fcb%2F&scope=openid";
    let mut jar = CookieJar::default();
    let response = get_with_cookies(&server.public, uri, &jar).await;
    jar.absorb(&response);
    let challenge = url_param(&location(&response), "login_challenge").unwrap();

    let accept = body_json(
        put_json(
            &server.admin,
            &format!("/admin/oauth2/auth/requests/login/accept?challenge={challenge}"),
            serde_json::json!({
                "subject": "bob",
                "force_subject_identifier": "forced-identity",
            }),
        )
        .await,
    )
    .await;
    let redirect_to = accept["redirect_to"].as_str().unwrap().to_string();

    let response = get_with_cookies(&server.public, &path_and_query(&redirect_to), &jar).await;
    jar.absorb(&response);
    let consent_challenge = url_param(&location(&response), "consent_challenge").unwrap();
    let accept = body_json(
        put_json(
            &server.admin,
            &format!("/admin/oauth2/auth/requests/consent/accept?challenge={consent_challenge}"),
            serde_json::json!({"grant_scope": ["openid"], "session": {}}),
        )
        .await,
    )
    .await;
    let redirect_to = accept["redirect_to"].as_str().unwrap().to_string();
    let response = get_with_cookies(&server.public, &path_and_query(&redirect_to), &jar).await;
    let code = url_param(&location(&response), "code").unwrap();

    let tokens = exchange_code(&server, "c2", &code).await;
    assert_eq!(
        jwt_claims(tokens["id_token"].as_str().unwrap())["sub"],
        "forced-identity"
    );
}
