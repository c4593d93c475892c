//! The OAuth 2.0 Token Endpoint and token revocation.
//!
//! Every grant runs the same pipeline: authenticate the client according to
//! its token_endpoint_auth_method, check the grant type is allowed, run the
//! grant-specific handler, persist the minted family and answer per RFC 6749.

use axum::{
    Extension, Form, Json, Router,
    http::{HeaderMap, header},
    response::{IntoResponse, Response},
    routing::post,
};
use base64::Engine as _;
use base64::engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

use crate::errors::OAuthError;
use crate::server::clients::{
    AUTH_METHOD_BASIC, AUTH_METHOD_NONE, AUTH_METHOD_POST, AUTH_METHOD_PRIVATE_KEY_JWT, Client,
};
use crate::server::issue;
use crate::server::oidc;
use crate::server::persist::TokenRecord;
use crate::server::persist::tokens::ConsumeOutcome;
use crate::server::session::Session;
use crate::state::{GrantKind, SharedState};

pub const GRANT_TYPE_AUTHORIZATION_CODE: &str = "authorization_code";
pub const GRANT_TYPE_REFRESH_TOKEN: &str = "refresh_token";
pub const GRANT_TYPE_CLIENT_CREDENTIALS: &str = "client_credentials";
pub const GRANT_TYPE_JWT_BEARER: &str = "urn:ietf:params:oauth:grant-type:jwt-bearer";

const CLIENT_ASSERTION_TYPE_JWT_BEARER: &str =
    "urn:ietf:params:oauth:client-assertion-type:jwt-bearer";

pub fn router(app: SharedState) -> Router {
    Router::new()
        .route("/oauth2/token", post(token_handler))
        .route("/oauth2/revoke", post(revoke_handler))
        .layer(Extension(app))
}

#[derive(Debug, Deserialize)]
pub struct TokenParams {
    pub grant_type: Option<String>,
    pub code: Option<String>,
    pub redirect_uri: Option<String>,
    pub client_id: Option<String>,
    pub client_secret: Option<String>,
    pub code_verifier: Option<String>,
    pub refresh_token: Option<String>,
    pub scope: Option<String>,
    pub assertion: Option<String>,
    pub client_assertion: Option<String>,
    pub client_assertion_type: Option<String>,
}

/// RFC 6749 §5.1 token response.
#[derive(Debug, Serialize)]
pub struct TokenResponse {
    pub access_token: String,
    pub token_type: String,
    pub expires_in: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id_token: Option<String>,
}

async fn token_handler(
    Extension(app): Extension<SharedState>,
    headers: HeaderMap,
    Form(params): Form<TokenParams>,
) -> Response {
    let client = match authenticate_client(&app, &headers, &params).await {
        Ok(client) => client,
        Err(err) => return app.render_error(&err),
    };

    let grant_type = params.grant_type.as_deref().unwrap_or_default();
    if !client.has_grant_type(grant_type) {
        return app.render_error(&OAuthError::unauthorized_client(
            "The OAuth 2.0 Client is not allowed to use the requested grant type.",
        ));
    }

    let result = match grant_type {
        GRANT_TYPE_AUTHORIZATION_CODE => authorization_code_grant(&app, &client, &params).await,
        GRANT_TYPE_REFRESH_TOKEN => refresh_token_grant(&app, &client, &params).await,
        GRANT_TYPE_CLIENT_CREDENTIALS => client_credentials_grant(&app, &client, &params).await,
        GRANT_TYPE_JWT_BEARER => jwt_bearer_grant(&app, &client, &params).await,
        _ => Err(OAuthError::unsupported_grant_type(
            "The authorization grant type is not supported by the authorization server.",
        )),
    };

    match result {
        Ok(response) => Json(response).into_response(),
        Err(err) => app.render_error(&err),
    }
}

// ---------------- client authentication ----------------

/// Authenticates the caller per its registered token_endpoint_auth_method.
pub async fn authenticate_client(
    app: &SharedState,
    headers: &HeaderMap,
    params: &TokenParams,
) -> Result<Client, OAuthError> {
    let invalid = || {
        OAuthError::invalid_client(
            "Client authentication failed (e.g., unknown client, no client authentication \
             included, or unsupported authentication method).",
        )
    };

    let basic = basic_credentials(headers);
    let (client_id, presented_secret, method_used) = if let Some((id, secret)) = &basic {
        (id.clone(), Some(secret.clone()), AUTH_METHOD_BASIC)
    } else if params.client_assertion.is_some() {
        // iss of the assertion names the client; resolved below.
        (String::new(), None, AUTH_METHOD_PRIVATE_KEY_JWT)
    } else if let Some(secret) = params.client_secret.clone().filter(|s| !s.is_empty()) {
        (
            params.client_id.clone().unwrap_or_default(),
            Some(secret),
            AUTH_METHOD_POST,
        )
    } else {
        (
            params.client_id.clone().unwrap_or_default(),
            None,
            AUTH_METHOD_NONE,
        )
    };

    if method_used == AUTH_METHOD_PRIVATE_KEY_JWT {
        return authenticate_private_key_jwt(app, params).await;
    }

    if client_id.is_empty() {
        return Err(invalid());
    }
    let client = app
        .store
        .get_client(&client_id)
        .await
        .map_err(|e| OAuthError::server_error(format!("{e:#}")))?
        .ok_or_else(invalid)?;

    if client.token_endpoint_auth_method != method_used {
        return Err(invalid());
    }

    match presented_secret {
        Some(secret) => {
            let stored = client.secret_signature.as_deref().ok_or_else(invalid)?;
            if !app.tokens.check_secret(&secret, stored) {
                return Err(invalid());
            }
        }
        None => {
            if !client.is_public() {
                return Err(invalid());
            }
        }
    }

    Ok(client)
}

fn basic_credentials(headers: &HeaderMap) -> Option<(String, String)> {
    let raw = headers.get(header::AUTHORIZATION)?.to_str().ok()?;
    let encoded = raw.strip_prefix("Basic ")?;
    let decoded = STANDARD.decode(encoded).ok()?;
    let decoded = String::from_utf8(decoded).ok()?;
    let (user, pass) = decoded.split_once(':')?;
    let user = urlencoding::decode(user).ok()?.into_owned();
    let pass = urlencoding::decode(pass).ok()?.into_owned();
    Some((user, pass))
}

/// private_key_jwt: the client proves possession of a key from its JWKS by
/// signing an assertion with `iss == sub == client_id` and the token
/// endpoint as audience.
async fn authenticate_private_key_jwt(
    app: &SharedState,
    params: &TokenParams,
) -> Result<Client, OAuthError> {
    let invalid = || {
        OAuthError::invalid_client(
            "Client authentication failed (e.g., unknown client, no client authentication \
             included, or unsupported authentication method).",
        )
    };

    if params.client_assertion_type.as_deref() != Some(CLIENT_ASSERTION_TYPE_JWT_BEARER) {
        return Err(OAuthError::invalid_request(
            "Unknown client_assertion_type; expected the jwt-bearer client assertion type.",
        ));
    }
    let assertion = params.client_assertion.as_deref().ok_or_else(invalid)?;

    let unverified = insecure_claims(assertion)?;
    let client_id = unverified
        .get("iss")
        .and_then(|v| v.as_str())
        .unwrap_or_default()
        .to_string();
    if client_id.is_empty() {
        return Err(invalid());
    }

    let client = app
        .store
        .get_client(&client_id)
        .await
        .map_err(|e| OAuthError::server_error(format!("{e:#}")))?
        .ok_or_else(invalid)?;
    if client.token_endpoint_auth_method != AUTH_METHOD_PRIVATE_KEY_JWT {
        return Err(invalid());
    }

    let jwks = client_jwks(app, &client).await?;
    let header = jsonwebtoken::decode_header(assertion).map_err(|_| invalid())?;
    let kid = header.kid.ok_or_else(invalid)?;
    let jwk = jwks
        .keys
        .iter()
        .find(|k| k.common.key_id.as_deref() == Some(kid.as_str()))
        .ok_or_else(invalid)?;
    let key = jsonwebtoken::DecodingKey::from_jwk(jwk).map_err(|_| invalid())?;

    let mut validation = jsonwebtoken::Validation::new(header.alg);
    validation.set_audience(&[app.config.token_endpoint()]);
    validation.set_issuer(&[client_id.as_str()]);
    let verified = jsonwebtoken::decode::<Map<String, Value>>(assertion, &key, &validation)
        .map_err(|e| {
            OAuthError::invalid_client("The client assertion could not be verified.")
                .with_debug(e.to_string())
        })?;
    if verified.claims.get("sub").and_then(|v| v.as_str()) != Some(client_id.as_str()) {
        return Err(invalid());
    }

    Ok(client)
}

/// The client's key set, by value or fetched from its jwks_uri.
async fn client_jwks(
    app: &SharedState,
    client: &Client,
) -> Result<jsonwebtoken::jwk::JwkSet, OAuthError> {
    if let Some(jwks) = &client.jwks {
        return serde_json::from_value(jwks.clone()).map_err(|e| {
            OAuthError::server_error(format!("stored client jwks unparsable: {e}"))
        });
    }
    let uri = client.jwks_uri.as_deref().filter(|u| !u.is_empty()).ok_or_else(|| {
        OAuthError::invalid_client("The OAuth 2.0 Client has no JSON Web Key Set registered.")
    })?;
    let response = app
        .http
        .get(uri)
        .timeout(std::time::Duration::from_secs(10))
        .send()
        .await
        .map_err(|e| {
            OAuthError::server_error(format!("fetching client jwks from {uri}: {e}"))
        })?;
    response
        .json()
        .await
        .map_err(|e| OAuthError::server_error(format!("decoding client jwks from {uri}: {e}")))
}

/// Claims without signature verification, for routing decisions only.
fn insecure_claims(token: &str) -> Result<Map<String, Value>, OAuthError> {
    let mut parts = token.split('.');
    let (Some(_), Some(payload)) = (parts.next(), parts.next()) else {
        return Err(OAuthError::invalid_request("The assertion is not a JWT."));
    };
    let raw = URL_SAFE_NO_PAD
        .decode(payload)
        .map_err(|_| OAuthError::invalid_request("The assertion payload is not base64url."))?;
    serde_json::from_slice(&raw)
        .map_err(|_| OAuthError::invalid_request("The assertion payload is not JSON."))
}

// ---------------- authorization_code ----------------

async fn authorization_code_grant(
    app: &SharedState,
    client: &Client,
    params: &TokenParams,
) -> Result<TokenResponse, OAuthError> {
    let code = params.code.as_deref().filter(|c| !c.is_empty()).ok_or_else(|| {
        OAuthError::invalid_request("The request is missing the code parameter.")
    })?;
    let signature = app.tokens.authorize_code_signature(code)?;

    let redeemed = match app
        .store
        .consume_authorize_code(&signature)
        .await
        .map_err(|e| OAuthError::server_error(format!("{e:#}")))?
    {
        ConsumeOutcome::Consumed(redeemed) => redeemed,
        ConsumeOutcome::Replayed => {
            return Err(OAuthError::invalid_grant(
                "The authorization code has already been used; all tokens derived from it have \
                 been revoked.",
            ));
        }
        ConsumeOutcome::Unknown => {
            return Err(OAuthError::invalid_grant(
                "The authorization code is invalid or has expired.",
            ));
        }
    };
    let record = &redeemed.record;

    if record.client_id != client.client_id {
        return Err(OAuthError::invalid_grant(
            "The authorization code was issued to a different OAuth 2.0 Client.",
        ));
    }
    if record.expires_at < Utc::now() {
        return Err(OAuthError::invalid_grant(
            "The authorization code has expired.",
        ));
    }
    if !record.redirect_uri.is_empty()
        && params.redirect_uri.as_deref() != Some(record.redirect_uri.as_str())
    {
        return Err(OAuthError::invalid_grant(
            "The redirect_uri does not match the one used in the authorization request.",
        ));
    }

    if let Some((challenge, method)) = &redeemed.pkce {
        let verifier = params
            .code_verifier
            .as_deref()
            .filter(|v| !v.is_empty())
            .ok_or_else(|| {
                OAuthError::invalid_grant(
                    "The authorization code was bound to a PKCE challenge but no code_verifier \
                     was supplied.",
                )
            })?;
        let matches = match method.as_str() {
            "S256" => {
                let digest = Sha256::digest(verifier.as_bytes());
                URL_SAFE_NO_PAD.encode(digest) == *challenge
            }
            _ => verifier == challenge,
        };
        if !matches {
            return Err(OAuthError::invalid_grant("The PKCE code verifier is invalid."));
        }
    }

    let mut session = record.session.clone();
    if let Some(oidc_session) = &redeemed.oidc_session {
        session.id_token = oidc_session.id_token.clone();
    }

    mint_family(
        app,
        client,
        &session,
        &record.granted_scope,
        &record.granted_audience,
        &record.request_id,
        &record.session_id,
        GrantKind::AuthorizationCode,
        None,
    )
    .await
}

// ---------------- refresh_token ----------------

async fn refresh_token_grant(
    app: &SharedState,
    client: &Client,
    params: &TokenParams,
) -> Result<TokenResponse, OAuthError> {
    let token = params
        .refresh_token
        .as_deref()
        .filter(|t| !t.is_empty())
        .ok_or_else(|| {
            OAuthError::invalid_request("The request is missing the refresh_token parameter.")
        })?;
    let signature = app.tokens.refresh_token_signature(token)?;

    let record = app
        .store
        .get_refresh_token(&signature)
        .await
        .map_err(|e| OAuthError::server_error(format!("{e:#}")))?
        .ok_or_else(|| OAuthError::invalid_grant("The refresh token is invalid."))?;

    if record.client_id != client.client_id {
        return Err(OAuthError::invalid_grant(
            "The refresh token was issued to a different OAuth 2.0 Client.",
        ));
    }
    if record.expires_at < Utc::now() {
        return Err(OAuthError::invalid_grant("The refresh token has expired."));
    }

    // The request may narrow, never widen, the granted scope.
    let granted_scope: Vec<String> = match params.scope.as_deref().filter(|s| !s.is_empty()) {
        Some(requested) => {
            let requested: Vec<String> =
                requested.split_whitespace().map(|s| s.to_string()).collect();
            for scope in &requested {
                if !record.granted_scope.contains(scope) {
                    return Err(OAuthError::invalid_scope(
                        "The requested scope exceeds the scope originally granted.",
                    ));
                }
            }
            requested
        }
        None => record.granted_scope.clone(),
    };
    let granted_audience = record.granted_audience.clone();

    // Hook runs before rotation: a denial must leave the presented refresh
    // token untouched.
    let mut session = record.session.clone();
    if let Some(hook_url) = app.config.oauth2.refresh_token_hook.clone() {
        session = run_refresh_hook(
            app,
            &hook_url,
            client,
            &record,
            session,
            &granted_scope,
            &granted_audience,
        )
        .await?;
    }

    let new_access = issue::new_access_token(
        app,
        client,
        &session,
        &granted_scope,
        &granted_audience,
        &record.request_id,
        &record.session_id,
        GrantKind::RefreshToken,
    )
    .await
    .map_err(|e| OAuthError::server_error(format!("{e:#}")))?;
    let new_refresh = issue::new_refresh_token(
        app,
        client,
        &session,
        &granted_scope,
        &granted_audience,
        &record.request_id,
        &record.session_id,
        &new_access.record.signature,
        GrantKind::RefreshToken,
    )
    .await
    .map_err(|e| OAuthError::server_error(format!("{e:#}")))?;

    let expires_in = app.access_token_lifespan(client, GrantKind::RefreshToken);
    let access_token = new_access.token.clone();

    match app
        .store
        .rotate_refresh_token(&signature, new_access.record, new_refresh.record)
        .await
        .map_err(|e| OAuthError::server_error(format!("{e:#}")))?
    {
        ConsumeOutcome::Consumed(_) => {}
        ConsumeOutcome::Replayed | ConsumeOutcome::Unknown => {
            return Err(OAuthError::invalid_grant(
                "The refresh token has already been used; all tokens derived from the original \
                 grant have been revoked.",
            ));
        }
    }

    let id_token = match (&session.id_token, issue::wants_id_token(&granted_scope)) {
        (Some(id_session), true) => Some(
            oidc::mint_id_token(
                app,
                client,
                id_session,
                app.id_token_lifespan(client, GrantKind::RefreshToken),
                Some(&access_token),
                None,
            )
            .await
            .map_err(|e| OAuthError::server_error(format!("{e:#}")))?,
        ),
        _ => None,
    };

    Ok(TokenResponse {
        access_token,
        token_type: "bearer".to_string(),
        expires_in,
        refresh_token: Some(new_refresh.token),
        scope: Some(granted_scope.join(" ")),
        id_token,
    })
}

/// The refresh hook response body: optional replacement claim maps.
#[derive(Debug, Deserialize)]
struct RefreshHookResponse {
    #[serde(default)]
    session: RefreshHookSession,
}

#[derive(Debug, Default, Deserialize)]
struct RefreshHookSession {
    #[serde(default)]
    access_token: Map<String, Value>,
    #[serde(default)]
    id_token: Map<String, Value>,
}

/// Calls the configured refresh hook. 204 keeps the session, 200 merges the
/// returned claim maps, 403 denies the grant, anything else is a server
/// fault. Single attempt with an explicit timeout.
async fn run_refresh_hook(
    app: &SharedState,
    hook_url: &str,
    client: &Client,
    record: &TokenRecord,
    mut session: Session,
    granted_scope: &[String],
    granted_audience: &[String],
) -> Result<Session, OAuthError> {
    let payload = serde_json::json!({
        "subject": record.subject,
        "client_id": client.client_id,
        "granted_scopes": granted_scope,
        "granted_audience": granted_audience,
        "requester": {
            "client_id": record.client_id,
            "granted_scopes": record.granted_scope,
            "granted_audience": record.granted_audience,
        },
        "session": {
            "access_token": session.access.ext,
            "id_token": session.id_token.as_ref().map(|s| s.extra.clone()).unwrap_or_default(),
        },
    });

    let response = app
        .http
        .post(hook_url)
        .json(&payload)
        .timeout(std::time::Duration::from_secs(10))
        .send()
        .await
        .map_err(|e| OAuthError::server_error(format!("refresh hook unreachable: {e}")))?;

    match response.status().as_u16() {
        204 => Ok(session),
        200 => {
            let body: RefreshHookResponse = response.json().await.map_err(|e| {
                OAuthError::server_error(format!("refresh hook returned a malformed body: {e}"))
            })?;
            for (k, v) in body.session.access_token {
                session.access.ext.insert(k, v);
            }
            if let Some(id_session) = &mut session.id_token {
                for (k, v) in body.session.id_token {
                    id_session.extra.insert(k, v);
                }
            }
            Ok(session)
        }
        403 => Err(OAuthError::access_denied(
            "The refresh hook denied the token refresh.",
        )),
        other => Err(OAuthError::server_error(format!(
            "refresh hook returned unexpected status {other}"
        ))),
    }
}

// ---------------- client_credentials ----------------

async fn client_credentials_grant(
    app: &SharedState,
    client: &Client,
    params: &TokenParams,
) -> Result<TokenResponse, OAuthError> {
    if client.is_public() {
        return Err(OAuthError::invalid_client(
            "The OAuth 2.0 Client must authenticate to use the client_credentials grant.",
        ));
    }

    let requested: Vec<String> = params
        .scope
        .as_deref()
        .unwrap_or_default()
        .split_whitespace()
        .map(|s| s.to_string())
        .collect();
    let granted_scope: Vec<String> = if requested.is_empty() {
        if app.config.oauth2.grant_all_client_credentials_scopes_per_default {
            client.scopes().iter().map(|s| s.to_string()).collect()
        } else {
            Vec::new()
        }
    } else {
        if !client.covers_scopes(requested.iter().map(|s| s.as_str())) {
            return Err(OAuthError::invalid_scope(
                "The OAuth 2.0 Client is not allowed to request one or more of the given scopes.",
            ));
        }
        requested
    };

    let session = Session::new(client.client_id.clone(), client.client_id.clone());
    let request_id = uuid::Uuid::new_v4().to_string();

    mint_family(
        app,
        client,
        &session,
        &granted_scope,
        &client.audience.clone(),
        &request_id,
        "",
        GrantKind::ClientCredentials,
        // No refresh token for machine-to-machine grants.
        Some(false),
    )
    .await
}

// ---------------- jwt-bearer ----------------

async fn jwt_bearer_grant(
    app: &SharedState,
    client: &Client,
    params: &TokenParams,
) -> Result<TokenResponse, OAuthError> {
    let assertion = params
        .assertion
        .as_deref()
        .filter(|a| !a.is_empty())
        .ok_or_else(|| {
            OAuthError::invalid_request("The request is missing the assertion parameter.")
        })?;

    let header = jsonwebtoken::decode_header(assertion).map_err(|e| {
        OAuthError::invalid_grant("The assertion header could not be decoded.")
            .with_debug(e.to_string())
    })?;
    let kid = header.kid.ok_or_else(|| {
        OAuthError::invalid_grant("The assertion header does not carry a key id.")
    })?;

    let unverified = insecure_claims(assertion)?;
    let issuer = unverified
        .get("iss")
        .and_then(|v| v.as_str())
        .unwrap_or_default();
    let subject = unverified
        .get("sub")
        .and_then(|v| v.as_str())
        .unwrap_or_default();

    let grant = app
        .store
        .find_trust_grant(issuer, subject, &kid)
        .await
        .map_err(|e| OAuthError::server_error(format!("{e:#}")))?
        .ok_or_else(|| {
            OAuthError::invalid_grant(
                "No trust relationship covers the issuer, subject and key of the assertion.",
            )
        })?;

    let (key, _alg) = app
        .keys
        .decoding_key(&grant.key_set, &grant.key_id)
        .await
        .map_err(|e| OAuthError::server_error(format!("{e:#}")))?;

    let mut validation = jsonwebtoken::Validation::new(header.alg);
    validation.set_audience(&[app.config.token_endpoint()]);
    validation.set_issuer(&[grant.issuer.as_str()]);
    validation.required_spec_claims =
        ["exp", "aud", "iss"].iter().map(|s| s.to_string()).collect();
    let verified = jsonwebtoken::decode::<Map<String, Value>>(assertion, &key, &validation)
        .map_err(|e| {
            OAuthError::invalid_grant("The assertion could not be verified.")
                .with_debug(e.to_string())
        })?;

    if let Some(iat) = verified.claims.get("iat").and_then(|v| v.as_i64()) {
        if iat > Utc::now().timestamp() + 60 {
            return Err(OAuthError::invalid_grant(
                "The assertion was issued in the future.",
            ));
        }
    }

    // Requested scope is intersected with what the trust grant allows.
    let requested: Vec<String> = params
        .scope
        .as_deref()
        .unwrap_or_default()
        .split_whitespace()
        .map(|s| s.to_string())
        .collect();
    let granted_scope: Vec<String> = if requested.is_empty() {
        grant.scope.clone()
    } else {
        requested
            .into_iter()
            .filter(|s| grant.scope.contains(s))
            .collect()
    };

    let session = Session::new(subject.to_string(), client.client_id.clone());
    let request_id = uuid::Uuid::new_v4().to_string();

    mint_family(
        app,
        client,
        &session,
        &granted_scope,
        &[],
        &request_id,
        "",
        GrantKind::JwtBearer,
        Some(false),
    )
    .await
}

// ---------------- shared minting ----------------

/// Mints and persists the token family for a grant: access token, refresh
/// token when the granted scope asks for one, ID token when `openid` was
/// granted.
#[allow(clippy::too_many_arguments)]
async fn mint_family(
    app: &SharedState,
    client: &Client,
    session: &Session,
    granted_scope: &[String],
    granted_audience: &[String],
    request_id: &str,
    session_id: &str,
    grant: GrantKind,
    refresh_override: Option<bool>,
) -> Result<TokenResponse, OAuthError> {
    let minted_access = issue::new_access_token(
        app,
        client,
        session,
        granted_scope,
        granted_audience,
        request_id,
        session_id,
        grant,
    )
    .await
    .map_err(|e| OAuthError::server_error(format!("{e:#}")))?;

    let wants_refresh = refresh_override.unwrap_or_else(|| issue::wants_refresh_token(granted_scope));

    let refresh_token = if wants_refresh {
        let minted_refresh = issue::new_refresh_token(
            app,
            client,
            session,
            granted_scope,
            granted_audience,
            request_id,
            session_id,
            &minted_access.record.signature,
            grant,
        )
        .await
        .map_err(|e| OAuthError::server_error(format!("{e:#}")))?;
        let token = minted_refresh.token.clone();
        app.store
            .create_token_pair(minted_access.record, minted_refresh.record)
            .await
            .map_err(|e| OAuthError::server_error(format!("{e:#}")))?;
        Some(token)
    } else {
        app.store
            .create_access_token(minted_access.record)
            .await
            .map_err(|e| OAuthError::server_error(format!("{e:#}")))?;
        None
    };

    let id_token = match (&session.id_token, issue::wants_id_token(granted_scope)) {
        (Some(id_session), true) => Some(
            oidc::mint_id_token(
                app,
                client,
                id_session,
                app.id_token_lifespan(client, grant),
                Some(&minted_access.token),
                None,
            )
            .await
            .map_err(|e| OAuthError::server_error(format!("{e:#}")))?,
        ),
        _ => None,
    };

    Ok(TokenResponse {
        access_token: minted_access.token,
        token_type: "bearer".to_string(),
        expires_in: app.access_token_lifespan(client, grant),
        refresh_token,
        scope: Some(granted_scope.join(" ")),
        id_token,
    })
}

// ---------------- revocation ----------------

#[derive(Debug, Deserialize)]
pub struct RevokeParams {
    pub token: Option<String>,
    pub token_type_hint: Option<String>,
    pub client_id: Option<String>,
    pub client_secret: Option<String>,
}

/// RFC 7009 token revocation. Unknown tokens yield 200; a known token
/// revokes its whole request family.
async fn revoke_handler(
    Extension(app): Extension<SharedState>,
    headers: HeaderMap,
    Form(params): Form<RevokeParams>,
) -> Response {
    let auth_params = TokenParams {
        grant_type: None,
        code: None,
        redirect_uri: None,
        client_id: params.client_id.clone(),
        client_secret: params.client_secret.clone(),
        code_verifier: None,
        refresh_token: None,
        scope: None,
        assertion: None,
        client_assertion: None,
        client_assertion_type: None,
    };
    let client = match authenticate_client(&app, &headers, &auth_params).await {
        Ok(client) => client,
        Err(err) => return app.render_error(&err),
    };

    let Some(token) = params.token.clone().filter(|t| !t.is_empty()) else {
        return app.render_error(&OAuthError::invalid_request(
            "The request is missing the token parameter.",
        ));
    };

    let result = async {
        // Try both kinds; the hint only orders the lookups.
        let hint_refresh = params.token_type_hint.as_deref() == Some("refresh_token");
        let lookups: [&str; 2] = if hint_refresh {
            ["refresh_token", "access_token"]
        } else {
            ["access_token", "refresh_token"]
        };
        for kind in lookups {
            let found = match kind {
                "refresh_token" => match app.tokens.refresh_token_signature(&token) {
                    Ok(sig) => app.store.get_refresh_token(&sig).await?,
                    Err(_) => None,
                },
                _ => match app.tokens.access_token_signature(&token) {
                    Ok(sig) => app.store.get_access_token(&sig).await?,
                    Err(_) => None,
                },
            };
            if let Some(record) = found {
                if record.client_id == client.client_id {
                    app.store.revoke_token_graph(&record.request_id).await?;
                } else {
                    tracing::debug!(
                        client_id = %client.client_id,
                        "revocation request for a token of another client; ignoring"
                    );
                }
                break;
            }
        }
        anyhow::Ok(())
    }
    .await;

    match result {
        Ok(()) => axum::http::StatusCode::OK.into_response(),
        Err(e) => app.render_error(&OAuthError::server_error(format!("{e:#}"))),
    }
}
