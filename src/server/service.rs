//! HTTP service assembly - builds the public and admin routers and runs both
//! listeners until shutdown.

use anyhow::{Context, Result};
use axum::{Json, Router, routing::get};
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::server::handlers::{
    admin_clients, admin_flow, admin_keys, admin_trust, authorize, introspect, logout, register,
    token, userinfo, wellknown,
};
use crate::server::keys::{ACCESS_TOKEN_KEY_SET, OPENID_KEY_SET};
use crate::state::SharedState;

/// The browser- and client-facing surface.
pub fn public_router(app: SharedState) -> Router {
    Router::new()
        .merge(authorize::router(app.clone()))
        .merge(token::router(app.clone()))
        .merge(logout::router(app.clone()))
        .merge(userinfo::router(app.clone()))
        .merge(register::router(app.clone()))
        .merge(wellknown::router(app))
        .merge(health_router())
        .layer(TraceLayer::new_for_http())
}

/// The trusted first-party surface: client/key/flow/trust management and
/// token introspection.
pub fn admin_router(app: SharedState) -> Router {
    Router::new()
        .merge(admin_clients::router(app.clone()))
        .merge(admin_keys::router(app.clone()))
        .merge(admin_flow::router(app.clone()))
        .merge(admin_trust::router(app.clone()))
        .merge(introspect::router(app))
        .merge(health_router())
        .layer(TraceLayer::new_for_http())
}

fn health_router() -> Router {
    Router::new()
        .route(
            "/health/alive",
            get(|| async { Json(serde_json::json!({"status": "ok"})) }),
        )
        .route(
            "/health/ready",
            get(|| async { Json(serde_json::json!({"status": "ok"})) }),
        )
}

/// Starts both listeners and blocks until SIGINT.
pub async fn start(app: SharedState) -> Result<()> {
    // Cold starts generate the signing sets up front so the first token
    // request does not pay for RSA generation.
    app.keys
        .ensure_exists(OPENID_KEY_SET, "RS256")
        .await
        .context("ensuring openid signing keys")?;
    if app.config.oauth2.access_token_strategy == "jwt" {
        app.keys
            .ensure_exists(ACCESS_TOKEN_KEY_SET, "RS256")
            .await
            .context("ensuring access token signing keys")?;
    }

    let public_addr = app.config.serve.public_bind_address.clone();
    let admin_addr = app.config.serve.admin_bind_address.clone();

    let public_listener = tokio::net::TcpListener::bind(&public_addr)
        .await
        .with_context(|| format!("binding public listener on {public_addr}"))?;
    let admin_listener = tokio::net::TcpListener::bind(&admin_addr)
        .await
        .with_context(|| format!("binding admin listener on {admin_addr}"))?;

    info!("Public endpoints listening on {public_addr}");
    info!("Admin endpoints listening on {admin_addr}");

    let public = async {
        axum::serve(public_listener, public_router(app.clone()))
            .with_graceful_shutdown(shutdown_signal())
            .await
    };
    let admin = async {
        axum::serve(admin_listener, admin_router(app.clone()))
            .with_graceful_shutdown(shutdown_signal())
            .await
    };

    tokio::try_join!(public, admin).context("serving http")?;
    info!("Server has shut down");
    Ok(())
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
