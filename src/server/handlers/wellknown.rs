//! OpenID Connect discovery and the public JWKS document.

use axum::{
    Extension, Json, Router,
    response::{IntoResponse, Response},
    routing::get,
};
use serde_json::json;

use crate::errors::OAuthError;
use crate::server::keys::OPENID_KEY_SET;
use crate::state::SharedState;

pub fn router(app: SharedState) -> Router {
    Router::new()
        .route("/.well-known/openid-configuration", get(discovery))
        .route("/.well-known/jwks.json", get(jwks))
        .layer(Extension(app))
}

async fn discovery(Extension(app): Extension<SharedState>) -> Response {
    let issuer = app.issuer();
    Json(json!({
        "issuer": issuer,
        "authorization_endpoint": format!("{issuer}/oauth2/auth"),
        "token_endpoint": format!("{issuer}/oauth2/token"),
        "jwks_uri": format!("{issuer}/.well-known/jwks.json"),
        "userinfo_endpoint": format!("{issuer}/userinfo"),
        "registration_endpoint": format!("{issuer}/oauth2/register"),
        "revocation_endpoint": format!("{issuer}/oauth2/revoke"),
        "end_session_endpoint": format!("{issuer}/oauth2/sessions/logout"),
        "subject_types_supported": app.config.oauth2.subject_types_supported,
        "response_types_supported": [
            "code", "token", "id_token", "code id_token", "code token", "id_token token",
            "code id_token token"
        ],
        "grant_types_supported": [
            "authorization_code", "implicit", "client_credentials", "refresh_token",
            "urn:ietf:params:oauth:grant-type:jwt-bearer"
        ],
        "id_token_signing_alg_values_supported": ["RS256"],
        "userinfo_signing_alg_values_supported": ["none", "RS256"],
        "token_endpoint_auth_methods_supported": [
            "client_secret_basic", "client_secret_post", "private_key_jwt", "none"
        ],
        "scopes_supported": app.config.oauth2.default_client_scope,
        "claims_supported": ["sub", "iss", "aud", "iat", "exp", "nonce", "acr", "amr",
                             "auth_time", "sid"],
        "code_challenge_methods_supported": ["plain", "S256"],
        "backchannel_logout_supported": true,
        "backchannel_logout_session_supported": true,
        "frontchannel_logout_supported": false,
    }))
    .into_response()
}

async fn jwks(Extension(app): Extension<SharedState>) -> Response {
    // Make sure a cold instance still serves a non-empty document.
    if let Err(e) = app.keys.ensure_exists(OPENID_KEY_SET, "RS256").await {
        return app.render_error(&OAuthError::server_error(format!("{e:#}")));
    }
    match app.keys.public_jwks(OPENID_KEY_SET).await {
        Ok(jwks) => Json(jwks).into_response(),
        Err(e) => app.render_error(&OAuthError::server_error(format!("{e:#}"))),
    }
}
