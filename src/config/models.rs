//! Configuration component types.
//!
//! Everything the server reads at startup lives here: listen addresses, the
//! issuer and UI URLs, cookie behavior, secrets, token lifespans and the
//! OAuth 2.0 feature toggles. All durations are plain seconds so the YAML
//! stays obvious.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::config::defaults;

/// Listen addresses for the two HTTP surfaces.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServeConfig {
    /// Public listener (authorization, token, userinfo, registration).
    #[serde(default = "defaults::default_public_bind_address")]
    pub public_bind_address: String,
    /// Admin listener (client/key/flow/trust management, introspection).
    #[serde(default = "defaults::default_admin_bind_address")]
    pub admin_bind_address: String,
    /// Cookie behavior for the browser-facing endpoints.
    #[serde(default)]
    pub cookies: CookieConfig,
}

impl Default for ServeConfig {
    fn default() -> Self {
        Self {
            public_bind_address: defaults::default_public_bind_address(),
            admin_bind_address: defaults::default_admin_bind_address(),
            cookies: CookieConfig::default(),
        }
    }
}

/// Cookie attributes shared by the CSRF and session cookies.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CookieConfig {
    /// SameSite mode: "lax", "strict" or "none". "none" enables the legacy
    /// duplicate-cookie fallback for user agents that drop SameSite=None.
    #[serde(default = "defaults::default_same_site")]
    pub same_site: String,
    /// Optional cookie Domain attribute.
    #[serde(default)]
    pub domain: Option<String>,
}

impl Default for CookieConfig {
    fn default() -> Self {
        Self {
            same_site: defaults::default_same_site(),
            domain: None,
        }
    }
}

/// Absolute URLs the flow engine redirects the browser to.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct UrlsConfig {
    /// Issuer URL; `iss` in every token and prefix of the public endpoints.
    pub issuer: String,
    /// Login UI entry point (receives `?login_challenge=`).
    pub login: String,
    /// Consent UI entry point (receives `?consent_challenge=`).
    pub consent: String,
    /// Logout UI entry point (receives `?logout_challenge=`).
    pub logout: String,
    /// Server-side error page for protocol errors that cannot be redirected.
    pub error: String,
    /// Default post-logout landing page.
    pub post_logout_redirect: String,
}

/// HMAC / cookie key material. The first entry signs; the rest still verify,
/// which is how secret rotation works.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct SecretsConfig {
    /// System secrets for the opaque-token HMAC strategy.
    pub system: Vec<String>,
    /// Cookie-signing secrets; defaults to the system secrets when empty.
    #[serde(default)]
    pub cookie: Vec<String>,
    /// Salt for pairwise subject obfuscation.
    #[serde(default)]
    pub subject_identifier_salt: String,
}

/// Token lifespans in seconds. Per-client lifespans override these.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct TtlConfig {
    #[serde(default = "defaults::default_login_consent_ttl")]
    pub login_consent_request: i64,
    #[serde(default = "defaults::default_access_token_ttl")]
    pub access_token: i64,
    #[serde(default = "defaults::default_refresh_token_ttl")]
    pub refresh_token: i64,
    #[serde(default = "defaults::default_id_token_ttl")]
    pub id_token: i64,
    #[serde(default = "defaults::default_auth_code_ttl")]
    pub auth_code: i64,
}

impl Default for TtlConfig {
    fn default() -> Self {
        Self {
            login_consent_request: defaults::default_login_consent_ttl(),
            access_token: defaults::default_access_token_ttl(),
            refresh_token: defaults::default_refresh_token_ttl(),
            id_token: defaults::default_id_token_ttl(),
            auth_code: defaults::default_auth_code_ttl(),
        }
    }
}

/// OAuth 2.0 / OIDC behavior toggles.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Oauth2Config {
    /// Access token wire format: "opaque" or "jwt".
    #[serde(default = "defaults::default_access_token_strategy")]
    pub access_token_strategy: String,
    /// Include debug strings in error responses.
    #[serde(default = "defaults::default_false")]
    pub expose_internal_errors: bool,
    /// Require PKCE for public clients on the authorization code flow.
    #[serde(default = "defaults::default_false")]
    pub pkce_enforced_for_public_clients: bool,
    /// client_credentials grants receive the client's full scope when the
    /// request names none.
    #[serde(default = "defaults::default_true")]
    pub grant_all_client_credentials_scopes_per_default: bool,
    /// Optional refresh-token hook URL, called before rotation.
    #[serde(default)]
    pub refresh_token_hook: Option<String>,
    /// Refuse client-controlled URLs that resolve to loopback / RFC1918
    /// ranges (jwks_uri, backchannel_logout_uri, request_uris).
    #[serde(default = "defaults::default_false")]
    pub client_http_no_private_ip_ranges: bool,
    /// Enable `POST /oauth2/register` and the self-service endpoints.
    #[serde(default = "defaults::default_true")]
    pub dynamic_registration_enabled: bool,
    /// Subject types offered to clients; first entry is the default when
    /// "public" is not supported.
    #[serde(default = "defaults::default_subject_types")]
    pub subject_types_supported: Vec<String>,
    /// Scope granted to clients that register without one.
    #[serde(default = "defaults::default_client_scope")]
    pub default_client_scope: Vec<String>,
}

impl Default for Oauth2Config {
    fn default() -> Self {
        Self {
            access_token_strategy: defaults::default_access_token_strategy(),
            expose_internal_errors: false,
            pkce_enforced_for_public_clients: false,
            grant_all_client_credentials_scopes_per_default: true,
            refresh_token_hook: None,
            client_http_no_private_ip_ranges: false,
            dynamic_registration_enabled: true,
            subject_types_supported: defaults::default_subject_types(),
            default_client_scope: defaults::default_client_scope(),
        }
    }
}

/// Database location; defaults to the platform data directory.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct DbConfig {
    #[serde(default)]
    pub path: Option<PathBuf>,
}
