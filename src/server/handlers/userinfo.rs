//! The OpenID Connect UserInfo endpoint.
//!
//! Requires a Bearer access token; failures answer with the precise RFC 6750
//! error code in `WWW-Authenticate`. The response is a JSON object, or a JWT
//! signed by the OpenID set when the client registered
//! `userinfo_signed_response_alg: RS256`.

use axum::{
    Extension, Router,
    http::{HeaderMap, StatusCode, header},
    response::{IntoResponse, Response},
    routing::get,
};
use chrono::Utc;
use serde_json::{Map, Value, json};

use crate::server::handlers::introspect::lookup_access_token;
use crate::server::keys::OPENID_KEY_SET;
use crate::state::SharedState;

pub fn router(app: SharedState) -> Router {
    Router::new()
        .route("/userinfo", get(userinfo_handler).post(userinfo_handler))
        .layer(Extension(app))
}

fn bearer_error(status: StatusCode, code: Option<&str>, description: Option<&str>) -> Response {
    let mut value = String::from("Bearer");
    if let Some(code) = code {
        value.push_str(&format!(" error=\"{code}\""));
        if let Some(description) = description {
            value.push_str(&format!(", error_description=\"{description}\""));
        }
    }
    (status, [(header::WWW_AUTHENTICATE, value)]).into_response()
}

async fn userinfo_handler(
    Extension(app): Extension<SharedState>,
    headers: HeaderMap,
) -> Response {
    let Some(token) = bearer_token(&headers) else {
        return bearer_error(StatusCode::UNAUTHORIZED, None, None);
    };

    let record = match lookup_access_token(&app, &token).await {
        Ok(Some(record)) => record,
        Ok(None) => {
            return bearer_error(
                StatusCode::UNAUTHORIZED,
                Some("invalid_token"),
                Some("The access token is invalid."),
            );
        }
        Err(e) => {
            tracing::error!("userinfo token lookup failed: {e:#}");
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    };

    if !record.active || record.expires_at < Utc::now() {
        return bearer_error(
            StatusCode::UNAUTHORIZED,
            Some("invalid_token"),
            Some("The access token is inactive or has expired."),
        );
    }

    let client = match app.store.get_client(&record.client_id).await {
        Ok(Some(client)) => client,
        Ok(None) => {
            return bearer_error(
                StatusCode::UNAUTHORIZED,
                Some("invalid_token"),
                Some("The access token belongs to an unknown client."),
            );
        }
        Err(e) => {
            tracing::error!("userinfo client lookup failed: {e:#}");
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    };

    // The wire subject matches the ID token; access-token rows keep the
    // local subject while the id-token session carries the pairwise form.
    let mut claims: Map<String, Value> = record
        .session
        .id_token
        .as_ref()
        .map(|s| s.extra.clone())
        .unwrap_or_default();
    let subject = record
        .session
        .id_token
        .as_ref()
        .map(|s| s.subject.clone())
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| record.subject.clone());
    claims.insert("sub".into(), json!(subject));

    if client.userinfo_signed_response_alg == "RS256" {
        claims.insert("iss".into(), json!(app.issuer()));
        claims.insert("aud".into(), json!([client.client_id]));
        claims.insert("iat".into(), json!(Utc::now().timestamp()));
        claims.insert(
            "exp".into(),
            json!(record.expires_at.timestamp()),
        );
        let signer = match app.keys.signer(OPENID_KEY_SET, "RS256").await {
            Ok(signer) => signer,
            Err(e) => {
                tracing::error!("userinfo signer unavailable: {e:#}");
                return StatusCode::INTERNAL_SERVER_ERROR.into_response();
            }
        };
        match signer.sign(&Value::Object(claims)) {
            Ok(jwt) => {
                return ([(header::CONTENT_TYPE, "application/jwt")], jwt).into_response();
            }
            Err(e) => {
                tracing::error!("userinfo signing failed: {e:#}");
                return StatusCode::INTERNAL_SERVER_ERROR.into_response();
            }
        }
    }

    axum::Json(Value::Object(claims)).into_response()
}

fn bearer_token(headers: &HeaderMap) -> Option<String> {
    let raw = headers.get(header::AUTHORIZATION)?.to_str().ok()?;
    raw.strip_prefix("Bearer ")
        .map(|t| t.trim().to_string())
        .filter(|t| !t.is_empty())
}
