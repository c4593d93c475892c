//! Admin CRUD for OAuth 2.0 clients.

use axum::{
    Extension, Json, Router,
    extract::{Path, Query},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, put},
};
use serde::Deserialize;
use serde_json::json;

use crate::errors::OAuthError;
use crate::server::clients::{AUTH_METHOD_NONE, Client, Lifespans};
use crate::state::SharedState;
use crate::utility::random_client_secret;

pub fn router(app: SharedState) -> Router {
    Router::new()
        .route("/admin/clients", get(list_clients).post(create_client))
        .route(
            "/admin/clients/{client_id}",
            get(get_client)
                .put(replace_client)
                .patch(patch_client)
                .delete(delete_client),
        )
        .route("/admin/clients/{client_id}/lifespans", put(set_lifespans))
        .layer(Extension(app))
}

#[derive(Debug, Deserialize)]
struct ListQuery {
    client_name: Option<String>,
    owner: Option<String>,
    #[serde(default = "default_limit")]
    limit: i64,
    #[serde(default)]
    offset: i64,
}

fn default_limit() -> i64 {
    100
}

async fn list_clients(
    Extension(app): Extension<SharedState>,
    Query(q): Query<ListQuery>,
) -> Response {
    match app
        .store
        .list_clients(q.client_name, q.owner, q.limit.clamp(1, 500), q.offset.max(0))
        .await
    {
        Ok(clients) => {
            let sanitized: Vec<Client> = clients.into_iter().map(|c| c.sanitize()).collect();
            Json(sanitized).into_response()
        }
        Err(e) => app.render_error(&OAuthError::server_error(format!("{e:#}"))),
    }
}

async fn create_client(
    Extension(app): Extension<SharedState>,
    Json(mut client): Json<Client>,
) -> Response {
    if !client.client_id.is_empty() {
        return app.render_error(&OAuthError::invalid_request(
            "It is no longer possible to set an OAuth 2.0 Client ID as a user; the system will \
             generate a unique ID for you.",
        ));
    }
    client.id = uuid::Uuid::new_v4().to_string();
    client.client_id = uuid::Uuid::new_v4().to_string();

    // A generated secret is echoed once; a supplied one is validated, hashed
    // and never returned again.
    let generated_secret = match (&client.client_secret, client.token_endpoint_auth_method.as_str())
    {
        (None, AUTH_METHOD_NONE) => None,
        (None, _) => Some(random_client_secret()),
        (Some(_), _) => None,
    };
    if let Some(secret) = &generated_secret {
        client.client_secret = Some(secret.clone());
    }

    if let Err(err) = app.validator.validate(&mut client).await {
        return app.render_error(&err);
    }

    let echo_secret = client.client_secret.take();
    if let Some(secret) = &echo_secret {
        client.secret_signature = Some(app.tokens.obfuscate_secret(secret));
    }

    let stored = match app.store.create_client(client).await {
        Ok(stored) => stored,
        Err(e) => return app.render_error(&OAuthError::server_error(format!("{e:#}"))),
    };

    let mut body = serde_json::to_value(&stored).unwrap_or_default();
    if let Some(secret) = echo_secret {
        body["client_secret"] = json!(secret);
    }
    (StatusCode::CREATED, Json(body)).into_response()
}

async fn get_client(
    Extension(app): Extension<SharedState>,
    Path(client_id): Path<String>,
) -> Response {
    match app.store.get_client(&client_id).await {
        Ok(Some(client)) => Json(client.sanitize()).into_response(),
        Ok(None) => app.render_error(&OAuthError::not_found(
            "The requested OAuth 2.0 Client does not exist.",
        )),
        Err(e) => app.render_error(&OAuthError::server_error(format!("{e:#}"))),
    }
}

async fn replace_client(
    Extension(app): Extension<SharedState>,
    Path(client_id): Path<String>,
    Json(mut update): Json<Client>,
) -> Response {
    let existing = match app.store.get_client(&client_id).await {
        Ok(Some(existing)) => existing,
        Ok(None) => {
            return app.render_error(&OAuthError::not_found(
                "The requested OAuth 2.0 Client does not exist.",
            ));
        }
        Err(e) => return app.render_error(&OAuthError::server_error(format!("{e:#}"))),
    };

    update.id = existing.id.clone();
    update.client_id = existing.client_id.clone();
    if let Err(err) = app.validator.validate(&mut update).await {
        return app.render_error(&err);
    }
    if let Some(secret) = update.client_secret.take() {
        update.secret_signature = Some(app.tokens.obfuscate_secret(&secret));
    }

    match app.store.update_client(update.clone()).await {
        Ok(true) => Json(update.sanitize()).into_response(),
        Ok(false) => app.render_error(&OAuthError::not_found(
            "The requested OAuth 2.0 Client does not exist.",
        )),
        Err(e) => app.render_error(&OAuthError::server_error(format!("{e:#}"))),
    }
}

/// RFC 6902 JSON-Patch. The surrogate id is not patchable.
async fn patch_client(
    Extension(app): Extension<SharedState>,
    Path(client_id): Path<String>,
    Json(patch): Json<json_patch::Patch>,
) -> Response {
    for op in patch.iter() {
        let path = match op {
            json_patch::PatchOperation::Add(op) => &op.path,
            json_patch::PatchOperation::Remove(op) => &op.path,
            json_patch::PatchOperation::Replace(op) => &op.path,
            json_patch::PatchOperation::Move(op) => &op.path,
            json_patch::PatchOperation::Copy(op) => &op.path,
            json_patch::PatchOperation::Test(op) => &op.path,
        };
        if path.to_string() == "/id" {
            return app.render_error(&OAuthError::invalid_request(
                "Patching the OAuth 2.0 Client id is not allowed.",
            ));
        }
    }

    let existing = match app.store.get_client(&client_id).await {
        Ok(Some(existing)) => existing,
        Ok(None) => {
            return app.render_error(&OAuthError::not_found(
                "The requested OAuth 2.0 Client does not exist.",
            ));
        }
        Err(e) => return app.render_error(&OAuthError::server_error(format!("{e:#}"))),
    };

    let mut doc = match serde_json::to_value(&existing) {
        Ok(doc) => doc,
        Err(e) => return app.render_error(&OAuthError::server_error(format!("{e:#}"))),
    };
    if let Err(e) = json_patch::patch(&mut doc, &patch) {
        return app.render_error(&OAuthError::invalid_request(format!(
            "The JSON Patch could not be applied: {e}"
        )));
    }

    let mut patched: Client = match serde_json::from_value(doc) {
        Ok(patched) => patched,
        Err(e) => {
            return app.render_error(&OAuthError::invalid_request(format!(
                "The patched document is not a valid OAuth 2.0 Client: {e}"
            )));
        }
    };
    patched.id = existing.id.clone();
    patched.client_id = existing.client_id.clone();

    if let Err(err) = app.validator.validate(&mut patched).await {
        return app.render_error(&err);
    }
    if let Some(secret) = patched.client_secret.take() {
        patched.secret_signature = Some(app.tokens.obfuscate_secret(&secret));
    }

    match app.store.update_client(patched.clone()).await {
        Ok(true) => Json(patched.sanitize()).into_response(),
        Ok(false) => app.render_error(&OAuthError::not_found(
            "The requested OAuth 2.0 Client does not exist.",
        )),
        Err(e) => app.render_error(&OAuthError::server_error(format!("{e:#}"))),
    }
}

async fn delete_client(
    Extension(app): Extension<SharedState>,
    Path(client_id): Path<String>,
) -> Response {
    match app.store.delete_client(&client_id).await {
        Ok(true) => StatusCode::NO_CONTENT.into_response(),
        Ok(false) => app.render_error(&OAuthError::not_found(
            "The requested OAuth 2.0 Client does not exist.",
        )),
        Err(e) => app.render_error(&OAuthError::server_error(format!("{e:#}"))),
    }
}

async fn set_lifespans(
    Extension(app): Extension<SharedState>,
    Path(client_id): Path<String>,
    Json(lifespans): Json<Lifespans>,
) -> Response {
    for value in [
        lifespans.authorization_code_grant_access_token_lifespan,
        lifespans.authorization_code_grant_id_token_lifespan,
        lifespans.authorization_code_grant_refresh_token_lifespan,
        lifespans.client_credentials_grant_access_token_lifespan,
        lifespans.refresh_token_grant_access_token_lifespan,
        lifespans.refresh_token_grant_id_token_lifespan,
        lifespans.refresh_token_grant_refresh_token_lifespan,
        lifespans.jwt_bearer_grant_access_token_lifespan,
    ]
    .into_iter()
    .flatten()
    {
        if value <= 0 {
            return app.render_error(&OAuthError::invalid_request(
                "Lifespans must be positive durations in seconds.",
            ));
        }
    }

    match app.store.set_client_lifespans(&client_id, lifespans).await {
        Ok(true) => StatusCode::OK.into_response(),
        Ok(false) => app.render_error(&OAuthError::not_found(
            "The requested OAuth 2.0 Client does not exist.",
        )),
        Err(e) => app.render_error(&OAuthError::server_error(format!("{e:#}"))),
    }
}
