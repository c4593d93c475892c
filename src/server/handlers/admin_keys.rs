//! Admin CRUD for JSON Web Key sets.
//!
//! Responses expose public key components only; private material stays in
//! the store and is exercised through the signing paths.

use axum::{
    Extension, Json, Router,
    extract::{Path, Query},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
};
use serde::Deserialize;

use crate::errors::OAuthError;
use crate::state::SharedState;

pub fn router(app: SharedState) -> Router {
    Router::new()
        .route(
            "/admin/keys/{set}",
            get(get_key_set)
                .post(generate_key)
                .put(import_key_set)
                .delete(delete_key_set),
        )
        .route(
            "/admin/keys/{set}/{kid}",
            get(get_key).put(import_key).delete(delete_key),
        )
        .layer(Extension(app))
}

#[derive(Debug, Deserialize)]
struct GenerateQuery {
    alg: Option<String>,
    kid: Option<String>,
    #[serde(rename = "use")]
    key_use: Option<String>,
}

async fn get_key_set(
    Extension(app): Extension<SharedState>,
    Path(set): Path<String>,
) -> Response {
    match app.keys.public_jwks(&set).await {
        Ok(jwks) if !jwks["keys"].as_array().map(|k| k.is_empty()).unwrap_or(true) => {
            Json(jwks).into_response()
        }
        Ok(_) => app.render_error(&OAuthError::not_found(
            "The requested JSON Web Key Set does not exist.",
        )),
        Err(e) => app.render_error(&OAuthError::server_error(format!("{e:#}"))),
    }
}

async fn generate_key(
    Extension(app): Extension<SharedState>,
    Path(set): Path<String>,
    Query(q): Query<GenerateQuery>,
) -> Response {
    let alg = q.alg.unwrap_or_else(|| "RS256".to_string());
    let kid = q.kid.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
    let key_use = q.key_use.unwrap_or_else(|| "sig".to_string());

    match app.keys.generate_and_persist(&set, &kid, &alg, &key_use).await {
        Ok(record) => (
            StatusCode::CREATED,
            Json(serde_json::json!({ "keys": [record.public_jwk] })),
        )
            .into_response(),
        Err(e) => app.render_error(
            &OAuthError::invalid_request(format!("Key generation failed: {e:#}")),
        ),
    }
}

#[derive(Debug, Deserialize)]
struct JwkSetBody {
    #[serde(default)]
    keys: Vec<serde_json::Value>,
}

async fn import_key_set(
    Extension(app): Extension<SharedState>,
    Path(set): Path<String>,
    Json(body): Json<JwkSetBody>,
) -> Response {
    let mut imported = Vec::new();
    for jwk in body.keys {
        match app.keys.import_public_key(&set, jwk).await {
            Ok(record) => imported.push(record.public_jwk),
            Err(e) => {
                return app.render_error(&OAuthError::invalid_request(format!(
                    "The JSON Web Key could not be imported: {e:#}"
                )));
            }
        }
    }
    Json(serde_json::json!({ "keys": imported })).into_response()
}

async fn delete_key_set(
    Extension(app): Extension<SharedState>,
    Path(set): Path<String>,
) -> Response {
    match app.store.delete_key_set(&set).await {
        Ok(true) => StatusCode::NO_CONTENT.into_response(),
        Ok(false) => app.render_error(&OAuthError::not_found(
            "The requested JSON Web Key Set does not exist.",
        )),
        Err(e) => app.render_error(&OAuthError::server_error(format!("{e:#}"))),
    }
}

async fn get_key(
    Extension(app): Extension<SharedState>,
    Path((set, kid)): Path<(String, String)>,
) -> Response {
    match app.store.get_key(&set, &kid).await {
        Ok(Some(record)) => {
            Json(serde_json::json!({ "keys": [record.public_jwk] })).into_response()
        }
        Ok(None) => app.render_error(&OAuthError::not_found(
            "The requested JSON Web Key does not exist.",
        )),
        Err(e) => app.render_error(&OAuthError::server_error(format!("{e:#}"))),
    }
}

async fn import_key(
    Extension(app): Extension<SharedState>,
    Path((set, kid)): Path<(String, String)>,
    Json(mut jwk): Json<serde_json::Value>,
) -> Response {
    jwk["kid"] = serde_json::json!(kid);
    match app.keys.import_public_key(&set, jwk).await {
        Ok(record) => Json(serde_json::json!({ "keys": [record.public_jwk] })).into_response(),
        Err(e) => app.render_error(&OAuthError::invalid_request(format!(
            "The JSON Web Key could not be imported: {e:#}"
        ))),
    }
}

async fn delete_key(
    Extension(app): Extension<SharedState>,
    Path((set, kid)): Path<(String, String)>,
) -> Response {
    match app.store.delete_key(&set, &kid).await {
        Ok(true) => StatusCode::NO_CONTENT.into_response(),
        Ok(false) => app.render_error(&OAuthError::not_found(
            "The requested JSON Web Key does not exist.",
        )),
        Err(e) => app.render_error(&OAuthError::server_error(format!("{e:#}"))),
    }
}
