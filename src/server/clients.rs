//! OAuth 2.0 client records and metadata validation.
//!
//! The `Client` struct is both the wire representation (admin and dynamic
//! registration APIs) and the domain object the flow engine consults on every
//! hop. Secrets are only ever present in flight: storage keeps an HMAC
//! signature, and every read back to a caller erases the plaintext.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashSet;
use std::net::IpAddr;
use url::Url;

use crate::errors::OAuthError;

/// Signing algorithms accepted for client authentication assertions.
pub const SUPPORTED_AUTH_TOKEN_SIGNING_ALGS: &[&str] = &[
    "RS256", "RS384", "RS512", "PS256", "PS384", "PS512", "ES256", "ES384", "ES512",
];

pub const AUTH_METHOD_BASIC: &str = "client_secret_basic";
pub const AUTH_METHOD_POST: &str = "client_secret_post";
pub const AUTH_METHOD_PRIVATE_KEY_JWT: &str = "private_key_jwt";
pub const AUTH_METHOD_NONE: &str = "none";

pub const SUBJECT_TYPE_PUBLIC: &str = "public";
pub const SUBJECT_TYPE_PAIRWISE: &str = "pairwise";

/// Per-grant-type token lifespans in seconds. A null field falls back to the
/// globally configured default.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Lifespans {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub authorization_code_grant_access_token_lifespan: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub authorization_code_grant_id_token_lifespan: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub authorization_code_grant_refresh_token_lifespan: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_credentials_grant_access_token_lifespan: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub refresh_token_grant_access_token_lifespan: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub refresh_token_grant_id_token_lifespan: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub refresh_token_grant_refresh_token_lifespan: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub jwt_bearer_grant_access_token_lifespan: Option<i64>,
}

/// An OAuth 2.0 client registration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Client {
    /// Surrogate identifier; stable across client_id changes. Never accepted
    /// from callers.
    #[serde(skip)]
    pub id: String,

    /// Public identifier presented in protocol messages.
    #[serde(default)]
    pub client_id: String,

    #[serde(default)]
    pub client_name: String,

    /// Plaintext secret; only populated in requests and in the single
    /// response that echoes a generated secret.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_secret: Option<String>,

    #[serde(default)]
    pub redirect_uris: Vec<String>,

    #[serde(default)]
    pub grant_types: Vec<String>,

    #[serde(default)]
    pub response_types: Vec<String>,

    /// Space-separated scope string.
    #[serde(default)]
    pub scope: String,

    #[serde(default)]
    pub audience: Vec<String>,

    #[serde(default)]
    pub owner: String,

    #[serde(default)]
    pub token_endpoint_auth_method: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_endpoint_auth_signing_alg: Option<String>,

    /// JSON Web Key Set by value. Mutually exclusive with `jwks_uri`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jwks: Option<Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jwks_uri: Option<String>,

    #[serde(default)]
    pub subject_type: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sector_identifier_uri: Option<String>,

    #[serde(default)]
    pub post_logout_redirect_uris: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub frontchannel_logout_uri: Option<String>,

    #[serde(default)]
    pub frontchannel_logout_session_required: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backchannel_logout_uri: Option<String>,

    #[serde(default)]
    pub backchannel_logout_session_required: bool,

    #[serde(default)]
    pub allowed_cors_origins: Vec<String>,

    #[serde(default)]
    pub request_uris: Vec<String>,

    #[serde(default)]
    pub userinfo_signed_response_alg: String,

    /// Free-form metadata, settable through the admin API only.
    #[serde(default)]
    pub metadata: Value,

    #[serde(default)]
    pub lifespans: Lifespans,

    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,

    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,

    /// HMAC signature of the stored secret. Internal.
    #[serde(skip)]
    pub secret_signature: Option<String>,

    /// HMAC signature of the registration access token. Internal; set for
    /// dynamically registered clients only.
    #[serde(skip)]
    pub registration_access_token_signature: Option<String>,
}

impl Client {
    pub fn scopes(&self) -> HashSet<&str> {
        self.scope.split_whitespace().collect()
    }

    /// Every requested scope must be registered on the client.
    pub fn covers_scopes<'a>(&self, requested: impl IntoIterator<Item = &'a str>) -> bool {
        let own = self.scopes();
        requested.into_iter().all(|s| own.contains(s))
    }

    pub fn covers_audience<'a>(&self, requested: impl IntoIterator<Item = &'a str>) -> bool {
        requested
            .into_iter()
            .all(|a| self.audience.iter().any(|own| own == a))
    }

    pub fn has_grant_type(&self, grant_type: &str) -> bool {
        self.grant_types.iter().any(|g| g == grant_type)
    }

    /// Response types are order-insensitive sets of words ("code id_token").
    pub fn has_response_type(&self, response_type: &str) -> bool {
        let wanted: HashSet<&str> = response_type.split_whitespace().collect();
        self.response_types.iter().any(|r| {
            let own: HashSet<&str> = r.split_whitespace().collect();
            own == wanted
        })
    }

    pub fn matches_redirect_uri(&self, uri: &str) -> bool {
        self.redirect_uris.iter().any(|r| r == uri)
    }

    pub fn is_public(&self) -> bool {
        self.token_endpoint_auth_method == AUTH_METHOD_NONE
    }

    /// The sector identifier used for pairwise subject obfuscation: the
    /// sector_identifier_uri when set, else the host of the single registered
    /// redirect URI.
    pub fn sector_identifier(&self) -> Result<String, OAuthError> {
        if let Some(sector) = &self.sector_identifier_uri {
            if !sector.is_empty() {
                return Ok(sector.clone());
            }
        }
        match self.redirect_uris.len() {
            0 => Err(OAuthError::invalid_request(format!(
                "OAuth 2.0 Client {} neither specifies a sector_identifier_uri nor a redirect_uri \
                 which is not allowed when using subject type pairwise.",
                self.client_id
            ))),
            1 => {
                let url = Url::parse(&self.redirect_uris[0]).map_err(|e| {
                    OAuthError::server_error(format!("stored redirect uri unparsable: {e}"))
                })?;
                Ok(url.host_str().unwrap_or_default().to_string())
            }
            _ => Err(OAuthError::invalid_request(format!(
                "OAuth 2.0 Client {} has multiple redirect_uris but no sector_identifier_uri was \
                 set which is not allowed when using subject type pairwise.",
                self.client_id
            ))),
        }
    }

    /// Strips material that must never leave the server again.
    pub fn sanitize(mut self) -> Self {
        self.client_secret = None;
        self
    }
}

/// Validates and normalizes client metadata.
///
/// Owns the pieces of configuration the checks depend on so handlers do not
/// need to thread the whole config through.
#[derive(Clone)]
pub struct ClientValidator {
    http: reqwest::Client,
    subject_types_supported: Vec<String>,
    default_scope: Vec<String>,
    no_private_ip_ranges: bool,
}

impl ClientValidator {
    pub fn new(
        http: reqwest::Client,
        subject_types_supported: Vec<String>,
        default_scope: Vec<String>,
        no_private_ip_ranges: bool,
    ) -> Self {
        Self {
            http,
            subject_types_supported,
            default_scope,
            no_private_ip_ranges,
        }
    }

    /// Applies defaults, then rejects invalid metadata. Mutates the client in
    /// place so callers persist the normalized form.
    pub async fn validate(&self, c: &mut Client) -> Result<(), OAuthError> {
        if c.token_endpoint_auth_method.is_empty() {
            c.token_endpoint_auth_method = AUTH_METHOD_BASIC.to_string();
        } else if c.token_endpoint_auth_method == AUTH_METHOD_PRIVATE_KEY_JWT {
            if c.jwks.is_none() && c.jwks_uri.as_deref().unwrap_or_default().is_empty() {
                return Err(OAuthError::invalid_client_metadata(
                    "When token_endpoint_auth_method is 'private_key_jwt', either jwks or \
                     jwks_uri must be set.",
                ));
            }
            if let Some(alg) = &c.token_endpoint_auth_signing_alg {
                if !SUPPORTED_AUTH_TOKEN_SIGNING_ALGS.contains(&alg.as_str()) {
                    return Err(OAuthError::invalid_client_metadata(
                        "Only RS256, RS384, RS512, PS256, PS384, PS512, ES256, ES384 and ES512 \
                         are supported as algorithms for private key authentication.",
                    ));
                }
            }
        }

        if c.jwks.is_some() && !c.jwks_uri.as_deref().unwrap_or_default().is_empty() {
            return Err(OAuthError::invalid_client_metadata(
                "Fields jwks and jwks_uri can not both be set, you must choose one.",
            ));
        }

        if self.no_private_ip_ranges {
            let mut guarded: Vec<(String, String)> = Vec::new();
            if let Some(u) = &c.jwks_uri {
                guarded.push(("jwks_uri".to_string(), u.clone()));
            }
            if let Some(u) = &c.backchannel_logout_uri {
                guarded.push(("backchannel_logout_uri".to_string(), u.clone()));
            }
            for (i, u) in c.request_uris.iter().enumerate() {
                guarded.push((format!("request_uris.{i}"), u.clone()));
            }
            for (field, target) in guarded {
                self.reject_private_targets(&field, &target).await?;
            }
        }

        if let Some(secret) = &c.client_secret {
            if !secret.is_empty() && secret.len() < 6 {
                return Err(OAuthError::invalid_client_metadata(
                    "Field client_secret must contain a secret that is at least 6 characters long.",
                ));
            }
        }

        if c.scope.is_empty() {
            c.scope = self.default_scope.join(" ");
        }

        for origin in &mut c.allowed_cors_origins {
            let mut u = Url::parse(origin).map_err(|e| {
                OAuthError::invalid_client_metadata(format!(
                    "Origin URL {origin} from allowed_cors_origins could not be parsed: {e}"
                ))
            })?;
            if u.scheme() != "https" && u.scheme() != "http" {
                return Err(OAuthError::invalid_client_metadata(format!(
                    "Origin URL {origin} must use https:// or http:// as HTTP scheme."
                )));
            }
            if !u.username().is_empty() || u.password().is_some() {
                return Err(OAuthError::invalid_client_metadata(format!(
                    "Origin URL {origin} has HTTP user and/or password set which is not allowed."
                )));
            }
            // The url crate normalizes an empty path on http(s) URLs to "/".
            let path = u.path().trim_end_matches('/');
            if !path.is_empty() || u.query().is_some() || u.fragment().is_some() {
                return Err(OAuthError::invalid_client_metadata(format!(
                    "Origin URL {origin} must have an empty path, query, and fragment but one of \
                     the parts is not empty."
                )));
            }
            u.set_path("");
            *origin = u.to_string().trim_end_matches('/').to_string();
        }

        if let Some(sector) = c.sector_identifier_uri.clone().filter(|s| !s.is_empty()) {
            self.validate_sector_identifier(&sector, &c.redirect_uris)
                .await?;
        }

        if c.userinfo_signed_response_alg.is_empty() {
            c.userinfo_signed_response_alg = "none".to_string();
        }
        if c.userinfo_signed_response_alg != "none" && c.userinfo_signed_response_alg != "RS256" {
            return Err(OAuthError::invalid_client_metadata(
                "Field userinfo_signed_response_alg can either be 'none' or 'RS256'.",
            ));
        }

        let mut redirs: Vec<Url> = Vec::new();
        for r in &c.redirect_uris {
            let u = Url::parse(r).map_err(|_| {
                OAuthError::invalid_redirect_uri(format!("Unable to parse redirect URL: {r}"))
            })?;
            if r.contains('#') {
                return Err(OAuthError::invalid_redirect_uri(
                    "Redirect URIs must not contain fragments (#).",
                ));
            }
            redirs.push(u);
        }

        if c.subject_type.is_empty() {
            if self
                .subject_types_supported
                .iter()
                .any(|s| s == SUBJECT_TYPE_PUBLIC)
            {
                c.subject_type = SUBJECT_TYPE_PUBLIC.to_string();
            } else {
                c.subject_type = self
                    .subject_types_supported
                    .first()
                    .cloned()
                    .unwrap_or_else(|| SUBJECT_TYPE_PUBLIC.to_string());
            }
        } else if !self.subject_types_supported.contains(&c.subject_type) {
            return Err(OAuthError::invalid_client_metadata(format!(
                "Subject type {} is not supported by server, only {:?} are allowed.",
                c.subject_type, self.subject_types_supported
            )));
        }

        for l in &c.post_logout_redirect_uris {
            let u = Url::parse(l).map_err(|_| {
                OAuthError::invalid_client_metadata(format!(
                    "Unable to parse post_logout_redirect_uri: {l}"
                ))
            })?;
            let found = redirs.iter().any(|r| {
                r.host_str() == u.host_str()
                    && r.port_or_known_default() == u.port_or_known_default()
                    && r.scheme() == u.scheme()
            });
            if !found {
                return Err(OAuthError::invalid_client_metadata(format!(
                    "post_logout_redirect_uri \"{l}\" must match the domain, port, scheme of at \
                     least one of the registered redirect URIs but did not"
                )));
            }
        }

        Ok(())
    }

    /// Dynamic registration forbids admin-only metadata on top of the
    /// standard checks. Secrets are rejected by the handler before the
    /// validator runs.
    pub async fn validate_dynamic_registration(&self, c: &mut Client) -> Result<(), OAuthError> {
        if !c.metadata.is_null() && c.metadata != Value::Object(Default::default()) {
            return Err(OAuthError::invalid_client_metadata(
                "metadata cannot be set for dynamic client registration",
            ));
        }
        self.validate(c).await
    }

    /// The sector identifier document must be HTTPS and list every redirect
    /// URI of the client. Single attempt; failures become
    /// `invalid_client_metadata`.
    async fn validate_sector_identifier(
        &self,
        location: &str,
        redirect_uris: &[String],
    ) -> Result<(), OAuthError> {
        let l = Url::parse(location).map_err(|e| {
            OAuthError::invalid_client_metadata(format!(
                "Value of sector_identifier_uri could not be parsed because {e}."
            ))
        })?;
        if l.scheme() != "https" {
            return Err(OAuthError::invalid_client_metadata(
                "Value of sector_identifier_uri must be an HTTPS URL but it is not.",
            ));
        }

        let response = self
            .http
            .get(l)
            .timeout(std::time::Duration::from_secs(10))
            .send()
            .await
            .map_err(|e| {
                OAuthError::invalid_client_metadata("Unable to connect to the sector_identifier_uri.")
                    .with_debug(e.to_string())
            })?;
        let urls: Vec<String> = response.json().await.map_err(|e| {
            OAuthError::invalid_client_metadata(
                "Unable to decode values from the sector_identifier_uri.",
            )
            .with_debug(e.to_string())
        })?;
        if urls.is_empty() {
            return Err(OAuthError::invalid_client_metadata(
                "Array from sector_identifier_uri contains no items",
            ));
        }
        for r in redirect_uris {
            if !urls.contains(r) {
                return Err(OAuthError::invalid_client_metadata(format!(
                    "Redirect URL \"{r}\" does not match values from sector_identifier_uri."
                )));
            }
        }
        Ok(())
    }

    /// Rejects URLs whose host resolves to loopback or RFC1918 space. Applies
    /// to every URL the server would dereference on the client's behalf.
    async fn reject_private_targets(&self, field: &str, target: &str) -> Result<(), OAuthError> {
        if target.is_empty() {
            return Ok(());
        }
        let url = Url::parse(target).map_err(|e| {
            OAuthError::invalid_client_metadata(format!("Field {field} could not be parsed: {e}"))
        })?;
        let Some(host) = url.host_str() else {
            return Err(OAuthError::invalid_client_metadata(format!(
                "Field {field} has no host."
            )));
        };

        let ips: Vec<IpAddr> = if let Ok(ip) = host.parse::<IpAddr>() {
            vec![ip]
        } else {
            let port = url.port_or_known_default().unwrap_or(443);
            tokio::net::lookup_host((host, port))
                .await
                .map_err(|e| {
                    OAuthError::invalid_client_metadata(format!(
                        "Field {field} host could not be resolved: {e}"
                    ))
                })?
                .map(|a| a.ip())
                .collect()
        };

        for ip in ips {
            if is_private_ip(&ip) {
                return Err(OAuthError::invalid_client_metadata(format!(
                    "Client IP address is not allowed: {field} resolves to {ip}"
                )));
            }
        }
        Ok(())
    }
}

fn is_private_ip(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            v4.is_loopback() || v4.is_private() || v4.is_link_local() || v4.is_unspecified()
        }
        IpAddr::V6(v6) => v6.is_loopback() || v6.is_unspecified(),
    }
}
