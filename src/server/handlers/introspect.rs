//! OAuth 2.0 token introspection (RFC 7662).
//!
//! Lives on the admin listener: introspection reflects token contents to
//! trusted first-party callers. Only active tokens of the matching type are
//! reflected; everything else is `{"active": false}`.

use axum::{
    Extension, Form, Json, Router,
    response::{IntoResponse, Response},
    routing::post,
};
use chrono::Utc;
use serde::Deserialize;
use serde_json::{Value, json};

use crate::server::persist::TokenRecord;
use crate::state::SharedState;

pub fn router(app: SharedState) -> Router {
    Router::new()
        .route("/oauth2/introspect", post(introspect_handler))
        .layer(Extension(app))
}

#[derive(Debug, Deserialize)]
pub struct IntrospectParams {
    pub token: Option<String>,
    pub token_type_hint: Option<String>,
    pub scope: Option<String>,
}

const INACTIVE: &str = r#"{"active":false}"#;

fn inactive() -> Response {
    (
        [(axum::http::header::CONTENT_TYPE, "application/json")],
        INACTIVE,
    )
        .into_response()
}

async fn introspect_handler(
    Extension(app): Extension<SharedState>,
    Form(params): Form<IntrospectParams>,
) -> Response {
    let Some(token) = params.token.clone().filter(|t| !t.is_empty()) else {
        return inactive();
    };

    let hint = params.token_type_hint.as_deref().unwrap_or_default();
    let lookups: [&str; 2] = if hint == "refresh_token" {
        ["refresh_token", "access_token"]
    } else {
        ["access_token", "refresh_token"]
    };

    for kind in lookups {
        let found = match kind {
            "refresh_token" => lookup_refresh_token(&app, &token).await,
            _ => lookup_access_token(&app, &token).await,
        };
        let Ok(Some(record)) = found else { continue };

        if !record.active || record.expires_at < Utc::now() {
            return inactive();
        }

        // A scope filter rejects tokens missing any named scope.
        if let Some(required) = params.scope.as_deref().filter(|s| !s.is_empty()) {
            if !required
                .split_whitespace()
                .all(|s| record.granted_scope.iter().any(|g| g == s))
            {
                return inactive();
            }
        }

        let mut body = json!({
            "active": true,
            "scope": record.granted_scope.join(" "),
            "client_id": record.client_id,
            "sub": record.subject,
            "exp": record.expires_at.timestamp(),
            "iat": record.requested_at.timestamp(),
            "nbf": record.requested_at.timestamp(),
            "aud": record.granted_audience,
            "iss": app.issuer(),
            "token_type": "Bearer",
            "token_use": kind,
        });
        if !record.session.access.ext.is_empty() {
            body["ext"] = Value::Object(record.session.access.ext.clone());
        }
        return Json(body).into_response();
    }

    inactive()
}

/// Resolves an access token row from either wire form: opaque HMAC token or
/// JWT (indexed by jti).
pub async fn lookup_access_token(
    app: &SharedState,
    token: &str,
) -> anyhow::Result<Option<TokenRecord>> {
    if let Ok(signature) = app.tokens.access_token_signature(token) {
        return app.store.get_access_token(&signature).await;
    }
    lookup_jwt_access_token(app, token).await
}

async fn lookup_jwt_access_token(
    app: &SharedState,
    token: &str,
) -> anyhow::Result<Option<TokenRecord>> {
    let Ok(header) = jsonwebtoken::decode_header(token) else {
        return Ok(None);
    };
    let Some(kid) = header.kid else {
        return Ok(None);
    };
    let Ok((key, alg)) = app
        .keys
        .decoding_key(crate::server::keys::ACCESS_TOKEN_KEY_SET, &kid)
        .await
    else {
        return Ok(None);
    };

    let mut validation = jsonwebtoken::Validation::new(alg);
    validation.set_issuer(&[app.issuer()]);
    validation.validate_aud = false;
    let Ok(data) = jsonwebtoken::decode::<serde_json::Map<String, Value>>(token, &key, &validation)
    else {
        return Ok(None);
    };
    let Some(jti) = data.claims.get("jti").and_then(|v| v.as_str()) else {
        return Ok(None);
    };
    app.store.get_access_token(jti).await
}

async fn lookup_refresh_token(
    app: &SharedState,
    token: &str,
) -> anyhow::Result<Option<TokenRecord>> {
    match app.tokens.refresh_token_signature(token) {
        Ok(signature) => app.store.get_refresh_token(&signature).await,
        Err(_) => Ok(None),
    }
}
