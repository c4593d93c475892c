//! Admin CRUD for trusted JWT-bearer issuers (RFC 7523 trust grants).
//!
//! Creating a grant binds an issuer (and optionally a fixed subject) to one
//! public key; the key is imported into a key set named after the issuer so
//! the token endpoint can resolve it by (set, kid).

use axum::{
    Extension, Json, Router,
    extract::{Path, Query},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
};
use chrono::{DateTime, Utc};
use serde::Deserialize;

use crate::errors::OAuthError;
use crate::server::persist::TrustGrantRecord;
use crate::state::SharedState;

pub fn router(app: SharedState) -> Router {
    Router::new()
        .route(
            "/admin/trust/grants/jwt-bearer/issuers",
            get(list_grants).post(create_grant),
        )
        .route(
            "/admin/trust/grants/jwt-bearer/issuers/{id}",
            get(get_grant).delete(delete_grant),
        )
        .layer(Extension(app))
}

#[derive(Debug, Deserialize)]
struct CreateGrantBody {
    issuer: String,
    #[serde(default)]
    subject: String,
    #[serde(default)]
    allow_any_subject: bool,
    #[serde(default)]
    scope: Vec<String>,
    expires_at: DateTime<Utc>,
    jwk: serde_json::Value,
}

async fn create_grant(
    Extension(app): Extension<SharedState>,
    Json(body): Json<CreateGrantBody>,
) -> Response {
    if body.issuer.is_empty() {
        return app.render_error(&OAuthError::invalid_request(
            "Field issuer must not be empty.",
        ));
    }
    if body.allow_any_subject && !body.subject.is_empty() {
        return app.render_error(&OAuthError::invalid_request(
            "Field subject must be empty when allow_any_subject is true.",
        ));
    }
    if !body.allow_any_subject && body.subject.is_empty() {
        return app.render_error(&OAuthError::invalid_request(
            "Field subject must be set unless allow_any_subject is true.",
        ));
    }
    if body.expires_at < Utc::now() {
        return app.render_error(&OAuthError::invalid_request(
            "Field expires_at must lie in the future.",
        ));
    }

    // The verification key lives in a set named after the issuer.
    let key = match app.keys.import_public_key(&body.issuer, body.jwk).await {
        Ok(key) => key,
        Err(e) => {
            return app.render_error(&OAuthError::invalid_request(format!(
                "The JSON Web Key could not be imported: {e:#}"
            )));
        }
    };

    let grant = TrustGrantRecord {
        id: uuid::Uuid::new_v4().to_string(),
        issuer: body.issuer.clone(),
        subject: body.subject,
        allow_any_subject: body.allow_any_subject,
        scope: body.scope,
        key_set: body.issuer,
        key_id: key.kid,
        created_at: Utc::now(),
        expires_at: body.expires_at,
    };

    match app.store.create_trust_grant(grant.clone()).await {
        Ok(()) => (StatusCode::CREATED, Json(grant)).into_response(),
        Err(e) => app.render_error(&OAuthError::server_error(format!("{e:#}"))),
    }
}

#[derive(Debug, Deserialize)]
struct ListQuery {
    issuer: Option<String>,
}

async fn list_grants(
    Extension(app): Extension<SharedState>,
    Query(q): Query<ListQuery>,
) -> Response {
    match app.store.list_trust_grants(q.issuer).await {
        Ok(grants) => Json(grants).into_response(),
        Err(e) => app.render_error(&OAuthError::server_error(format!("{e:#}"))),
    }
}

async fn get_grant(
    Extension(app): Extension<SharedState>,
    Path(id): Path<String>,
) -> Response {
    match app.store.get_trust_grant(&id).await {
        Ok(Some(grant)) => Json(grant).into_response(),
        Ok(None) => app.render_error(&OAuthError::not_found(
            "The requested trust grant does not exist.",
        )),
        Err(e) => app.render_error(&OAuthError::server_error(format!("{e:#}"))),
    }
}

async fn delete_grant(
    Extension(app): Extension<SharedState>,
    Path(id): Path<String>,
) -> Response {
    match app.store.delete_trust_grant(&id).await {
        Ok(true) => StatusCode::NO_CONTENT.into_response(),
        Ok(false) => app.render_error(&OAuthError::not_found(
            "The requested trust grant does not exist.",
        )),
        Err(e) => app.render_error(&OAuthError::server_error(format!("{e:#}"))),
    }
}
