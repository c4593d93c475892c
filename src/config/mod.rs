use serde::{Deserialize, Serialize};
/**
 * Gatehouse configuration root module.
 *
 * - Defines the root configuration struct (`GatehouseConfig`) and its defaults.
 * - Provides config file loading, CLI/env override logic, and error reporting.
 * - Uses `models.rs` for component types and `defaults.rs` for default helpers.
 */
use std::{path::Path, path::PathBuf};
use thiserror::Error;

pub mod defaults;
pub mod models;

pub use models::{
    CookieConfig, DbConfig, Oauth2Config, SecretsConfig, ServeConfig, TtlConfig, UrlsConfig,
};

// Root configuration for the gatehouse server.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct GatehouseConfig {
    /// Listener configuration for the public and admin surfaces.
    #[serde(default)]
    pub serve: ServeConfig,

    /// Issuer, UI and fallback URLs.
    #[serde(default)]
    pub urls: UrlsConfig,

    /// HMAC / cookie secrets and the pairwise salt.
    #[serde(default)]
    pub secrets: SecretsConfig,

    /// Token lifespans.
    #[serde(default)]
    pub ttl: TtlConfig,

    /// OAuth 2.0 / OIDC feature toggles.
    #[serde(default)]
    pub oauth2: Oauth2Config,

    /// Database location.
    #[serde(default)]
    pub db: DbConfig,

    /// Development mode: relaxed cookies (`_dev` names, Secure off).
    #[serde(default = "defaults::default_false")]
    pub dev: bool,
}

impl GatehouseConfig {
    /// Compute the default configuration file path.
    pub fn default_path() -> PathBuf {
        // Allow override via environment variable
        if let Some(override_path) = std::env::var_os("GATEHOUSE_CONFIG_PATH") {
            return PathBuf::from(override_path);
        }
        if cfg!(target_os = "windows") {
            let home = std::env::var_os("HOME")
                .or_else(|| std::env::var_os("USERPROFILE"))
                .unwrap_or_default();
            let mut p = PathBuf::from(home);
            p.push("gatehouse");
            p.push("config");
            p
        } else {
            PathBuf::from("/").join("etc").join("gatehouse").join("config")
        }
    }

    /// Load config from file and apply CLI overrides.
    ///
    /// Loads configuration from a YAML file if it exists, otherwise uses
    /// defaults. Then applies command-line overrides with highest precedence.
    pub fn load_with_overrides(
        config_path: Option<PathBuf>,
        issuer: Option<String>,
        public_bind_address: Option<String>,
        admin_bind_address: Option<String>,
        dev: Option<bool>,
    ) -> Result<Self, ConfigError> {
        let path = config_path.unwrap_or_else(Self::default_path);

        let mut cfg = if path.exists() {
            tracing::debug!("Reading from configuration file {:?}", path);
            let text = std::fs::read_to_string(&path)
                .map_err(|e| ConfigError::Parse(path.clone(), format!("I/O error: {}", e)))?;
            Self::parse_yaml_with_path(&path, &text)?
        } else {
            tracing::warn!(
                "No configuration file (checked {:?}) initializing with defaults",
                path
            );
            Self::default()
        };

        // Apply CLI/env overrides (highest precedence)
        if let Some(issuer) = issuer {
            cfg.urls.issuer = issuer;
        }
        if let Some(addr) = public_bind_address {
            cfg.serve.public_bind_address = addr;
        }
        if let Some(addr) = admin_bind_address {
            cfg.serve.admin_bind_address = addr;
        }
        if let Some(dev) = dev {
            cfg.dev = dev;
        }

        cfg.validate(&path)?;
        Ok(cfg)
    }

    /// Parse YAML configuration with enhanced error reporting.
    fn parse_yaml_with_path(path: &Path, text: &str) -> Result<Self, ConfigError> {
        serde_yaml_ng::from_str::<Self>(text).map_err(|e| {
            let msg = if let Some(loc) = e.location() {
                format!(
                    "yaml error at line {}, column {}: {}",
                    loc.line(),
                    loc.column(),
                    e
                )
            } else {
                format!("yaml error: {}", e)
            };

            ConfigError::Parse(path.to_path_buf(), msg)
        })
    }

    /// Reject configurations the server cannot run with. Everything checked
    /// here would otherwise fail at an arbitrary later point in a request.
    fn validate(&self, path: &Path) -> Result<(), ConfigError> {
        if self.secrets.system.is_empty() {
            return Err(ConfigError::Invalid(
                path.to_path_buf(),
                "secrets.system must contain at least one secret".to_string(),
            ));
        }
        for s in &self.secrets.system {
            if s.len() < 16 {
                return Err(ConfigError::Invalid(
                    path.to_path_buf(),
                    "secrets.system entries must be at least 16 characters".to_string(),
                ));
            }
        }
        if self.urls.issuer.is_empty() {
            return Err(ConfigError::Invalid(
                path.to_path_buf(),
                "urls.issuer must be set".to_string(),
            ));
        }
        match self.oauth2.access_token_strategy.as_str() {
            "opaque" | "jwt" => {}
            other => {
                return Err(ConfigError::Invalid(
                    path.to_path_buf(),
                    format!("oauth2.access_token_strategy must be 'opaque' or 'jwt', got '{other}'"),
                ));
            }
        }
        match self.serve.cookies.same_site.as_str() {
            "lax" | "strict" | "none" => {}
            other => {
                return Err(ConfigError::Invalid(
                    path.to_path_buf(),
                    format!("serve.cookies.same_site must be 'lax', 'strict' or 'none', got '{other}'"),
                ));
            }
        }
        Ok(())
    }

    /// The issuer URL without a trailing slash; every public endpoint and the
    /// `iss` claim derive from this.
    pub fn issuer(&self) -> String {
        self.urls.issuer.trim_end_matches('/').to_string()
    }

    /// Token endpoint URL; also the required audience of JWT-bearer
    /// assertions.
    pub fn token_endpoint(&self) -> String {
        format!("{}/oauth2/token", self.issuer())
    }

    /// Cookie secrets, falling back to the system secrets.
    pub fn cookie_secrets(&self) -> &[String] {
        if self.secrets.cookie.is_empty() {
            &self.secrets.system
        } else {
            &self.secrets.cookie
        }
    }
}

// Errors during configuration loading/parsing.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to parse configuration content.
    #[error("Failed to parse {0}: {1}")]
    Parse(PathBuf, String),

    /// Parsed fine, but the values cannot work.
    #[error("Invalid configuration {0}: {1}")]
    Invalid(PathBuf, String),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal() -> GatehouseConfig {
        let mut cfg = GatehouseConfig::default();
        cfg.urls.issuer = "https://auth.example.com/".to_string();
        cfg.secrets.system = vec!["0123456789abcdef0123456789abcdef".to_string()];
        cfg
    }

    #[test]
    fn issuer_is_normalized() {
        let cfg = minimal();
        assert_eq!(cfg.issuer(), "https://auth.example.com");
        assert_eq!(cfg.token_endpoint(), "https://auth.example.com/oauth2/token");
    }

    #[test]
    fn short_system_secret_is_rejected() {
        let mut cfg = minimal();
        cfg.secrets.system = vec!["short".to_string()];
        assert!(cfg.validate(Path::new("test")).is_err());
    }

    #[test]
    fn cookie_secrets_fall_back_to_system() {
        let cfg = minimal();
        assert_eq!(cfg.cookie_secrets(), cfg.secrets.system.as_slice());
    }
}
