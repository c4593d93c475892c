//! OpenID Connect Dynamic Client Registration (RFC 7591/7592).
//!
//! Anonymous callers may register a client; the response carries the one and
//! only copy of the generated secret and a registration access token (RAT)
//! that authorizes all later self-service operations on that client. The RAT
//! is stored as an HMAC signature and compared in constant time; every
//! failure mode answers with the same "does not exist or invalid
//! credentials" error so client ids cannot be probed.

use axum::{
    Extension, Json, Router,
    extract::Path,
    http::{HeaderMap, StatusCode, header},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde_json::json;

use crate::errors::OAuthError;
use crate::server::clients::{AUTH_METHOD_NONE, Client};
use crate::server::tokens::ACCESS_TOKEN_PREFIX;
use crate::state::SharedState;
use crate::utility::{constant_time_eq, random_client_secret};

pub fn router(app: SharedState) -> Router {
    Router::new()
        .route("/oauth2/register", post(register_client))
        .route(
            "/oauth2/register/{client_id}",
            get(get_client).put(update_client).delete(delete_client),
        )
        .layer(Extension(app))
}

fn registration_disabled(app: &SharedState) -> Option<Response> {
    if app.config.oauth2.dynamic_registration_enabled {
        None
    } else {
        Some(app.render_error(&OAuthError::not_found("Dynamic registration is not enabled.")))
    }
}

fn credentials_error(app: &SharedState) -> Response {
    app.render_error(&OAuthError::invalid_client(
        "The requested OAuth 2.0 client does not exist or you provided incorrect credentials.",
    ))
}

async fn register_client(
    Extension(app): Extension<SharedState>,
    Json(mut client): Json<Client>,
) -> Response {
    if let Some(resp) = registration_disabled(&app) {
        return resp;
    }
    if client.client_secret.is_some() {
        return app.render_error(&OAuthError::invalid_client_metadata(
            "It is not allowed to choose your own OAuth 2.0 Client secret.",
        ));
    }
    if !client.client_id.is_empty() {
        return app.render_error(&OAuthError::invalid_client_metadata(
            "It is not allowed to choose your own OAuth 2.0 Client ID.",
        ));
    }

    client.id = uuid::Uuid::new_v4().to_string();
    client.client_id = uuid::Uuid::new_v4().to_string();

    if let Err(err) = app.validator.validate_dynamic_registration(&mut client).await {
        return app.render_error(&err);
    }

    // Confidential clients get a generated secret, echoed exactly once.
    let plaintext_secret = if client.token_endpoint_auth_method != AUTH_METHOD_NONE {
        let secret = random_client_secret();
        client.secret_signature = Some(app.tokens.obfuscate_secret(&secret));
        Some(secret)
    } else {
        None
    };

    let (registration_token, registration_signature) = app.tokens.new_registration_token();
    client.registration_access_token_signature = Some(registration_signature);

    let stored = match app.store.create_client(client).await {
        Ok(stored) => stored,
        Err(e) => return app.render_error(&OAuthError::server_error(format!("{e:#}"))),
    };

    let mut body = serde_json::to_value(&stored).unwrap_or_default();
    if let Some(secret) = plaintext_secret {
        body["client_secret"] = json!(secret);
    }
    body["registration_access_token"] = json!(registration_token);
    body["registration_client_uri"] = json!(format!(
        "{}/oauth2/register/{}",
        app.issuer(),
        stored.client_id
    ));

    (StatusCode::CREATED, Json(body)).into_response()
}

/// Authenticates a self-service request by its registration access token.
/// Any failure is indistinguishable from a missing client.
async fn authenticate_registration(
    app: &SharedState,
    headers: &HeaderMap,
    client_id: &str,
) -> Result<Client, Response> {
    let token = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(|t| t.trim())
        .filter(|t| !t.is_empty())
        .ok_or_else(|| credentials_error(app))?;

    let client = app
        .store
        .get_client(client_id)
        .await
        .map_err(|e| app.render_error(&OAuthError::server_error(format!("{e:#}"))))?
        .ok_or_else(|| credentials_error(app))?;

    let stored_signature = client
        .registration_access_token_signature
        .as_deref()
        .ok_or_else(|| credentials_error(app))?;

    let presented = token.strip_prefix(ACCESS_TOKEN_PREFIX).unwrap_or(token);
    let signature = app
        .tokens
        .validate(presented)
        .map_err(|_| credentials_error(app))?;
    if !constant_time_eq(signature.as_bytes(), stored_signature.as_bytes()) {
        return Err(credentials_error(app));
    }

    Ok(client)
}

async fn get_client(
    Extension(app): Extension<SharedState>,
    Path(client_id): Path<String>,
    headers: HeaderMap,
) -> Response {
    if let Some(resp) = registration_disabled(&app) {
        return resp;
    }
    match authenticate_registration(&app, &headers, &client_id).await {
        Ok(client) => Json(client.sanitize()).into_response(),
        Err(resp) => resp,
    }
}

/// Replaces the registration. The RAT is rotated on every update and the new
/// token returned, so a leaked old token goes stale immediately.
async fn update_client(
    Extension(app): Extension<SharedState>,
    Path(client_id): Path<String>,
    headers: HeaderMap,
    Json(mut update): Json<Client>,
) -> Response {
    if let Some(resp) = registration_disabled(&app) {
        return resp;
    }
    let existing = match authenticate_registration(&app, &headers, &client_id).await {
        Ok(client) => client,
        Err(resp) => return resp,
    };

    if update.client_secret.is_some() {
        return app.render_error(&OAuthError::invalid_client_metadata(
            "It is not allowed to choose your own OAuth 2.0 Client secret.",
        ));
    }

    update.id = existing.id.clone();
    update.client_id = existing.client_id.clone();
    if let Err(err) = app.validator.validate_dynamic_registration(&mut update).await {
        return app.render_error(&err);
    }

    let (registration_token, registration_signature) = app.tokens.new_registration_token();
    update.registration_access_token_signature = Some(registration_signature);
    update.secret_signature = None; // COALESCE keeps the stored secret

    match app.store.update_client(update.clone()).await {
        Ok(true) => {}
        Ok(false) => return credentials_error(&app),
        Err(e) => return app.render_error(&OAuthError::server_error(format!("{e:#}"))),
    }

    let mut body = serde_json::to_value(update.sanitize()).unwrap_or_default();
    body["registration_access_token"] = json!(registration_token);
    body["registration_client_uri"] = json!(format!(
        "{}/oauth2/register/{}",
        app.issuer(),
        client_id
    ));
    Json(body).into_response()
}

async fn delete_client(
    Extension(app): Extension<SharedState>,
    Path(client_id): Path<String>,
    headers: HeaderMap,
) -> Response {
    if let Some(resp) = registration_disabled(&app) {
        return resp;
    }
    if let Err(resp) = authenticate_registration(&app, &headers, &client_id).await {
        return resp;
    }
    match app.store.delete_client(&client_id).await {
        Ok(_) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => app.render_error(&OAuthError::server_error(format!("{e:#}"))),
    }
}
