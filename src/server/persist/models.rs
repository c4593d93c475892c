//! Typed row models for the token and key tables.
//!
//! Each model knows how to reconstruct itself from the raw column tuple the
//! queries produce (`from_db_row`), keeping SQL row handling in one place.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};

use crate::server::session::Session;

/// A stored credential: authorization code, access token or refresh token.
/// The wire secret is never stored; `signature` is the HMAC over it (or the
/// `jti` for JWT access tokens).
#[derive(Debug, Clone)]
pub struct TokenRecord {
    pub signature: String,
    /// Graph id: the id of the originating authorize request, shared by every
    /// token derived from it, including rotated descendants.
    pub request_id: String,
    pub client_id: String,
    pub subject: String,
    pub requested_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub requested_scope: Vec<String>,
    pub granted_scope: Vec<String>,
    pub requested_audience: Vec<String>,
    pub granted_audience: Vec<String>,
    pub session: Session,
    /// Authentication session id; empty for grants without a browser session.
    pub session_id: String,
    /// Authorization codes only: the redirect_uri bound at authorize time.
    pub redirect_uri: String,
    /// Refresh tokens only: signature of the sibling access token.
    pub access_token_signature: String,
    pub active: bool,
}

impl TokenRecord {
    /// A fresh record with empty optional columns; callers fill in what the
    /// token kind needs.
    pub fn new(
        signature: String,
        request_id: String,
        client_id: String,
        subject: String,
        expires_at: DateTime<Utc>,
        session: Session,
    ) -> Self {
        Self {
            signature,
            request_id,
            client_id,
            subject,
            requested_at: Utc::now(),
            expires_at,
            requested_scope: Vec::new(),
            granted_scope: Vec::new(),
            requested_audience: Vec::new(),
            granted_audience: Vec::new(),
            session,
            session_id: String::new(),
            redirect_uri: String::new(),
            access_token_signature: String::new(),
            active: true,
        }
    }

    #[allow(clippy::too_many_arguments)]
    pub fn from_db_row(
        signature: String,
        request_id: String,
        client_id: String,
        subject: String,
        requested_at: String,
        expires_at: String,
        requested_scope: String,
        granted_scope: String,
        requested_audience: String,
        granted_audience: String,
        session: String,
        session_id: String,
        redirect_uri: String,
        access_token_signature: String,
        active: i64,
    ) -> Result<Self> {
        Ok(Self {
            signature,
            request_id,
            client_id,
            subject,
            requested_at: parse_ts(&requested_at).context("parsing requested_at")?,
            expires_at: parse_ts(&expires_at).context("parsing expires_at")?,
            requested_scope: serde_json::from_str(&requested_scope)
                .context("parsing requested_scope")?,
            granted_scope: serde_json::from_str(&granted_scope).context("parsing granted_scope")?,
            requested_audience: serde_json::from_str(&requested_audience)
                .context("parsing requested_audience")?,
            granted_audience: serde_json::from_str(&granted_audience)
                .context("parsing granted_audience")?,
            session: Session::from_stored_json(&session).context("parsing session")?,
            session_id,
            redirect_uri,
            access_token_signature,
            active: active != 0,
        })
    }
}

/// A stored JSON Web Key: public component as JWK JSON, private component (if
/// any) as a PKCS#8 PEM usable for signing.
#[derive(Debug, Clone)]
pub struct KeyRecord {
    pub set_id: String,
    pub kid: String,
    pub alg: String,
    pub key_use: String,
    pub public_jwk: serde_json::Value,
    pub private_pem: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl KeyRecord {
    pub fn from_db_row(
        set_id: String,
        kid: String,
        alg: String,
        key_use: String,
        public_jwk: String,
        private_pem: Option<String>,
        created_at: String,
    ) -> Result<Self> {
        Ok(Self {
            set_id,
            kid,
            alg,
            key_use,
            public_jwk: serde_json::from_str(&public_jwk).context("parsing public_jwk")?,
            private_pem,
            created_at: parse_ts(&created_at).context("parsing created_at")?,
        })
    }

    pub fn is_private(&self) -> bool {
        self.private_pem.is_some()
    }
}

/// A trusted JWT-bearer issuer grant.
#[derive(Debug, Clone, serde::Serialize)]
pub struct TrustGrantRecord {
    pub id: String,
    pub issuer: String,
    pub subject: String,
    pub allow_any_subject: bool,
    pub scope: Vec<String>,
    pub key_set: String,
    pub key_id: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl TrustGrantRecord {
    #[allow(clippy::too_many_arguments)]
    pub fn from_db_row(
        id: String,
        issuer: String,
        subject: String,
        allow_any_subject: i64,
        scope: String,
        key_set: String,
        key_id: String,
        created_at: String,
        expires_at: String,
    ) -> Result<Self> {
        Ok(Self {
            id,
            issuer,
            subject,
            allow_any_subject: allow_any_subject != 0,
            scope: serde_json::from_str(&scope).context("parsing scope")?,
            key_set,
            key_id,
            created_at: parse_ts(&created_at).context("parsing created_at")?,
            expires_at: parse_ts(&expires_at).context("parsing expires_at")?,
        })
    }
}

pub(crate) fn parse_ts(raw: &str) -> Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(raw)
        .with_context(|| format!("invalid timestamp: {raw}"))?
        .with_timezone(&Utc))
}

pub(crate) fn fmt_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339()
}

pub(crate) fn opt_ts(raw: Option<String>) -> Result<Option<DateTime<Utc>>> {
    raw.map(|r| parse_ts(&r)).transpose()
}
