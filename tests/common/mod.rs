//! Shared helpers for the integration tests: state construction, a cookie
//! jar, and a driver for the full login/consent round trip.

#![allow(dead_code)]

use std::collections::HashMap;

use axum::Router;
use axum::body::Body;
use axum::http::{Method, Request, Response, StatusCode, header};
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use serde_json::{Value, json};
use tower::ServiceExt;

use gatehouse::config::GatehouseConfig;
use gatehouse::server::clients::Client;
use gatehouse::server::persist::Store;
use gatehouse::server::service::{admin_router, public_router};
use gatehouse::state::{AppState, SharedState};

pub const ISSUER: &str = "https://auth.example.com";
pub const LOGIN_URL: &str = "https://ui.example.com/login";
pub const CONSENT_URL: &str = "https://ui.example.com/consent";
pub const LOGOUT_URL: &str = "https://ui.example.com/logout";
pub const ERROR_URL: &str = "https://ui.example.com/error";
pub const DEFAULT_POST_LOGOUT: &str = "https://ui.example.com/logged-out";

pub struct TestServer {
    pub app: SharedState,
    pub public: Router,
    pub admin: Router,
    _temp_dir: tempfile::TempDir,
}

pub fn test_config() -> GatehouseConfig {
    let mut cfg = GatehouseConfig::default();
    cfg.urls.issuer = ISSUER.to_string();
    cfg.urls.login = LOGIN_URL.to_string();
    cfg.urls.consent = CONSENT_URL.to_string();
    cfg.urls.logout = LOGOUT_URL.to_string();
    cfg.urls.error = ERROR_URL.to_string();
    cfg.urls.post_logout_redirect = DEFAULT_POST_LOGOUT.to_string();
    cfg.secrets.system = vec!["integration-test-system-secret-0001".to_string()];
    cfg.secrets.subject_identifier_salt = "integration-salt".to_string();
    cfg
}

pub fn test_server() -> TestServer {
    test_server_with_config(test_config())
}

pub fn test_server_with_config(config: GatehouseConfig) -> TestServer {
    let temp_dir = tempfile::tempdir().unwrap();
    let store = Store::open(temp_dir.path().join("gatehouse.db")).unwrap();
    let app = AppState::with_store(config, store).unwrap();
    TestServer {
        public: public_router(app.clone()),
        admin: admin_router(app.clone()),
        app,
        _temp_dir: temp_dir,
    }
}

/// A confidential client with the code+refresh grants, secret "secret-one".
pub async fn create_default_client(server: &TestServer, client_id: &str) -> Client {
    let mut client = Client {
        id: uuid::Uuid::new_v4().to_string(),
        client_id: client_id.to_string(),
        redirect_uris: vec!["https://cb/".to_string()],
        post_logout_redirect_uris: vec!["https://cb/out".to_string()],
        grant_types: vec![
            "authorization_code".to_string(),
            "refresh_token".to_string(),
        ],
        response_types: vec!["code".to_string()],
        scope: "openid offline".to_string(),
        token_endpoint_auth_method: "client_secret_basic".to_string(),
        subject_type: "public".to_string(),
        userinfo_signed_response_alg: "none".to_string(),
        metadata: json!({}),
        ..Default::default()
    };
    client.secret_signature = Some(server.app.tokens.obfuscate_secret("secret-one"));
    server.app.store.create_client(client.clone()).await.unwrap()
}

/// Accumulates cookies across redirects the way a browser would.
#[derive(Default, Clone)]
pub struct CookieJar {
    cookies: HashMap<String, String>,
}

impl CookieJar {
    pub fn absorb(&mut self, response: &Response<Body>) {
        for value in response.headers().get_all(header::SET_COOKIE) {
            let Ok(raw) = value.to_str() else { continue };
            let Some(pair) = raw.split(';').next() else { continue };
            let Some((name, value)) = pair.split_once('=') else { continue };
            if raw.contains("Max-Age=0") {
                self.cookies.remove(name);
            } else {
                self.cookies.insert(name.to_string(), value.to_string());
            }
        }
    }

    pub fn header(&self) -> Option<String> {
        if self.cookies.is_empty() {
            return None;
        }
        Some(
            self.cookies
                .iter()
                .map(|(k, v)| format!("{k}={v}"))
                .collect::<Vec<_>>()
                .join("; "),
        )
    }
}

pub async fn get_with_cookies(router: &Router, uri: &str, jar: &CookieJar) -> Response<Body> {
    let mut builder = Request::builder().method(Method::GET).uri(uri);
    if let Some(cookie) = jar.header() {
        builder = builder.header(header::COOKIE, cookie);
    }
    router
        .clone()
        .oneshot(builder.body(Body::empty()).unwrap())
        .await
        .unwrap()
}

pub async fn put_json(router: &Router, uri: &str, body: Value) -> Response<Body> {
    router
        .clone()
        .oneshot(
            Request::builder()
                .method(Method::PUT)
                .uri(uri)
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
        )
        .await
        .unwrap()
}

pub async fn post_json(router: &Router, uri: &str, body: Value) -> Response<Body> {
    router
        .clone()
        .oneshot(
            Request::builder()
                .method(Method::POST)
                .uri(uri)
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
        )
        .await
        .unwrap()
}

pub async fn post_form(
    router: &Router,
    uri: &str,
    form: &[(&str, &str)],
    basic_auth: Option<(&str, &str)>,
) -> Response<Body> {
    let encoded: Vec<String> = form
        .iter()
        .map(|(k, v)| {
            format!(
                "{}={}",
                urlencoding::encode(k),
                urlencoding::encode(v)
            )
        })
        .collect();
    let mut builder = Request::builder()
        .method(Method::POST)
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/x-www-form-urlencoded");
    if let Some((user, pass)) = basic_auth {
        let credentials = STANDARD.encode(format!("{user}:{pass}"));
        builder = builder.header(header::AUTHORIZATION, format!("Basic {credentials}"));
    }
    router
        .clone()
        .oneshot(builder.body(Body::from(encoded.join("&"))).unwrap())
        .await
        .unwrap()
}

pub async fn body_json(response: Response<Body>) -> Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&bytes).unwrap_or(Value::Null)
}

pub fn location(response: &Response<Body>) -> String {
    response
        .headers()
        .get(header::LOCATION)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string()
}

/// Query (or fragment) parameter extraction from a redirect target.
pub fn url_param(url: &str, name: &str) -> Option<String> {
    let parsed = url::Url::parse(url).ok()?;
    if let Some(found) = parsed
        .query_pairs()
        .find(|(k, _)| k == name)
        .map(|(_, v)| v.into_owned())
    {
        return Some(found);
    }
    let fragment = parsed.fragment()?;
    fragment.split('&').find_map(|pair| {
        let (k, v) = pair.split_once('=')?;
        (k == name).then(|| urlencoding::decode(v).ok().map(|s| s.into_owned()))?
    })
}

/// Strips the issuer so a redirect target can be fed back into the router.
pub fn path_and_query(url: &str) -> String {
    url.strip_prefix(ISSUER).unwrap_or(url).to_string()
}

pub struct FlowResult {
    pub code: String,
    pub jar: CookieJar,
    pub login_challenge: String,
    pub consent_challenge: String,
}

/// Drives the complete three-legged flow for a code-flow client and returns
/// the authorization code plus the browser's cookie jar.
pub async fn run_code_flow(
    server: &TestServer,
    client_id: &str,
    scope: &str,
    subject: &str,
    remember: bool,
) -> FlowResult {
    let authorize_uri = format!(
        "/oauth2/auth?response_type=code&client_id={client_id}&redirect_uri=https%3A%2F%2Fcb%2F&scope={}&state=state-123",
        urlencoding::encode(scope)
    );
    run_code_flow_at(server, &authorize_uri, subject, remember, CookieJar::default()).await
}

/// Same as [`run_code_flow`] but over an explicit authorize URI and an
/// existing cookie jar.
pub async fn run_code_flow_at(
    server: &TestServer,
    authorize_uri: &str,
    subject: &str,
    remember: bool,
    mut jar: CookieJar,
) -> FlowResult {
    // Leg 1: fresh entry redirects to the login UI with a challenge.
    let response = get_with_cookies(&server.public, authorize_uri, &jar).await;
    assert_eq!(response.status(), StatusCode::SEE_OTHER, "expected login redirect");
    let login_redirect = location(&response);
    assert!(
        login_redirect.starts_with(LOGIN_URL),
        "expected redirect to login ui, got {login_redirect}"
    );
    jar.absorb(&response);
    let login_challenge = url_param(&login_redirect, "login_challenge").unwrap();

    // The login UI accepts.
    let accept = put_json(
        &server.admin,
        &format!("/admin/oauth2/auth/requests/login/accept?challenge={login_challenge}"),
        json!({
            "subject": subject,
            "remember": remember,
            "remember_for": 0,
            "acr": "urn:gatehouse:acr:password",
            "amr": ["pwd"],
        }),
    )
    .await;
    assert_eq!(accept.status(), StatusCode::OK);
    let redirect_to = body_json(accept).await["redirect_to"]
        .as_str()
        .unwrap()
        .to_string();

    // Leg 2: login verifier re-entry redirects to the consent UI.
    let response = get_with_cookies(&server.public, &path_and_query(&redirect_to), &jar).await;
    assert_eq!(response.status(), StatusCode::SEE_OTHER, "expected consent redirect");
    let consent_redirect = location(&response);
    assert!(
        consent_redirect.starts_with(CONSENT_URL),
        "expected redirect to consent ui, got {consent_redirect}"
    );
    jar.absorb(&response);
    let consent_challenge = url_param(&consent_redirect, "consent_challenge").unwrap();

    // The consent UI grants every requested scope.
    let pending = body_json(
        get_with_cookies(
            &server.admin,
            &format!("/admin/oauth2/auth/requests/consent?challenge={consent_challenge}"),
            &CookieJar::default(),
        )
        .await,
    )
    .await;
    let grant_scope = pending["requested_scope"].clone();

    let accept = put_json(
        &server.admin,
        &format!("/admin/oauth2/auth/requests/consent/accept?challenge={consent_challenge}"),
        json!({
            "grant_scope": grant_scope,
            "grant_access_token_audience": [],
            "remember": remember,
            "remember_for": 0,
            "session": { "access_token": {}, "id_token": {} },
        }),
    )
    .await;
    assert_eq!(accept.status(), StatusCode::OK);
    let redirect_to = body_json(accept).await["redirect_to"]
        .as_str()
        .unwrap()
        .to_string();

    // Leg 3: consent verifier re-entry mints the code.
    let response = get_with_cookies(&server.public, &path_and_query(&redirect_to), &jar).await;
    assert_eq!(response.status(), StatusCode::SEE_OTHER, "expected client redirect");
    let client_redirect = location(&response);
    assert!(
        client_redirect.starts_with("https://cb/"),
        "expected redirect to the client, got {client_redirect}"
    );
    jar.absorb(&response);
    let code = url_param(&client_redirect, "code").expect("authorization code in redirect");

    FlowResult {
        code,
        jar,
        login_challenge,
        consent_challenge,
    }
}

/// Exchanges a code at the token endpoint with client_secret_basic auth.
pub async fn exchange_code(server: &TestServer, client_id: &str, code: &str) -> Value {
    let response = post_form(
        &server.public,
        "/oauth2/token",
        &[
            ("grant_type", "authorization_code"),
            ("code", code),
            ("redirect_uri", "https://cb/"),
        ],
        Some((client_id, "secret-one")),
    )
    .await;
    body_json(response).await
}

/// Introspects a token on the admin surface.
pub async fn introspect(server: &TestServer, token: &str) -> Value {
    let response = post_form(
        &server.admin,
        "/oauth2/introspect",
        &[("token", token)],
        None,
    )
    .await;
    body_json(response).await
}

/// Decodes JWT claims without verification, for assertions on payloads.
pub fn jwt_claims(token: &str) -> Value {
    let payload = token.split('.').nth(1).expect("jwt payload segment");
    let bytes = base64::engine::general_purpose::URL_SAFE_NO_PAD
        .decode(payload)
        .expect("base64url payload");
    serde_json::from_slice(&bytes).expect("json payload")
}
