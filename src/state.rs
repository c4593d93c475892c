//! Shared application state.
//!
//! The composition root: configuration, the store, the key manager, the
//! opaque-token strategy and the outbound HTTP client are built once at
//! startup and handed to every handler as narrow capabilities on one `Arc`.

use anyhow::{Context, Result};
use axum::response::Response;
use std::sync::Arc;
use std::time::Duration;

use crate::config::GatehouseConfig;
use crate::errors::OAuthError;
use crate::server::clients::{Client, ClientValidator};
use crate::server::keys::KeyManager;
use crate::server::persist::Store;
use crate::server::tokens::TokenStrategy;

/// Grant types used for per-client lifespan lookups.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GrantKind {
    AuthorizationCode,
    ClientCredentials,
    RefreshToken,
    JwtBearer,
}

pub struct AppState {
    pub config: GatehouseConfig,
    pub store: Store,
    pub keys: KeyManager,
    pub tokens: TokenStrategy,
    pub validator: ClientValidator,
    /// Outbound HTTP: sector identifier fetches, back-channel logout,
    /// refresh hook. Every call carries an explicit timeout.
    pub http: reqwest::Client,
}

pub type SharedState = Arc<AppState>;

impl AppState {
    pub fn new(config: GatehouseConfig) -> Result<SharedState> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .context("Failed to create HTTP client")?;

        let db_path = config
            .db
            .path
            .clone()
            .unwrap_or_else(|| std::path::PathBuf::from("/var/gatehouse/gatehouse.db"));
        let store = Store::open(db_path)?;

        let keys = KeyManager::new(store.clone());
        let tokens = TokenStrategy::new(&config.secrets.system);
        let validator = ClientValidator::new(
            http.clone(),
            config.oauth2.subject_types_supported.clone(),
            config.oauth2.default_client_scope.clone(),
            config.oauth2.client_http_no_private_ip_ranges,
        );

        Ok(Arc::new(Self {
            config,
            store,
            keys,
            tokens,
            validator,
            http,
        }))
    }

    /// Test constructor over an explicit store path.
    pub fn with_store(config: GatehouseConfig, store: Store) -> Result<SharedState> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .context("Failed to create HTTP client")?;
        let keys = KeyManager::new(store.clone());
        let tokens = TokenStrategy::new(&config.secrets.system);
        let validator = ClientValidator::new(
            http.clone(),
            config.oauth2.subject_types_supported.clone(),
            config.oauth2.default_client_scope.clone(),
            config.oauth2.client_http_no_private_ip_ranges,
        );
        Ok(Arc::new(Self {
            config,
            store,
            keys,
            tokens,
            validator,
            http,
        }))
    }

    pub fn issuer(&self) -> String {
        self.config.issuer()
    }

    /// Renders a protocol error as JSON, honoring `expose_internal_errors`.
    pub fn render_error(&self, err: &OAuthError) -> Response {
        if let Some(debug_msg) = err.debug() {
            tracing::debug!(code = err.code(), debug = debug_msg, "request failed");
        }
        err.render_json(self.config.oauth2.expose_internal_errors)
    }

    /// Access-token lifespan in seconds for a grant, honoring the client's
    /// per-grant override.
    pub fn access_token_lifespan(&self, client: &Client, grant: GrantKind) -> i64 {
        let ls = &client.lifespans;
        let per_client = match grant {
            GrantKind::AuthorizationCode => ls.authorization_code_grant_access_token_lifespan,
            GrantKind::ClientCredentials => ls.client_credentials_grant_access_token_lifespan,
            GrantKind::RefreshToken => ls.refresh_token_grant_access_token_lifespan,
            GrantKind::JwtBearer => ls.jwt_bearer_grant_access_token_lifespan,
        };
        per_client.unwrap_or(self.config.ttl.access_token)
    }

    pub fn refresh_token_lifespan(&self, client: &Client, grant: GrantKind) -> i64 {
        let ls = &client.lifespans;
        let per_client = match grant {
            GrantKind::AuthorizationCode => ls.authorization_code_grant_refresh_token_lifespan,
            GrantKind::RefreshToken => ls.refresh_token_grant_refresh_token_lifespan,
            _ => None,
        };
        per_client.unwrap_or(self.config.ttl.refresh_token)
    }

    pub fn id_token_lifespan(&self, client: &Client, grant: GrantKind) -> i64 {
        let ls = &client.lifespans;
        let per_client = match grant {
            GrantKind::AuthorizationCode => ls.authorization_code_grant_id_token_lifespan,
            GrantKind::RefreshToken => ls.refresh_token_grant_id_token_lifespan,
            _ => None,
        };
        per_client.unwrap_or(self.config.ttl.id_token)
    }
}
