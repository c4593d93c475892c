//! Grant session state carried by every persisted token.
//!
//! A `Session` is what survives between the authorization leg and the token
//! leg, and between refreshes: the subject, the claim maps supplied by the
//! consent UI, and the OpenID Connect part when `openid` was granted. Rows in
//! the token tables store it as JSON; older rows may still use the historic
//! field names, which `migrate_legacy_fields` rewrites before deserializing.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;

/// The token kinds a session can carry expiry times for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TokenKind {
    AccessToken,
    RefreshToken,
    AuthorizationCode,
    IdToken,
}

/// Claims bound to access and refresh tokens. `ext` holds the consent-supplied
/// access-token claim map and is mirrored under `ext` in JWT access tokens.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AccessSession {
    #[serde(default)]
    pub subject: String,
    #[serde(default)]
    pub client_id: String,
    /// kid of the signing key when the JWT access-token strategy is active.
    #[serde(default)]
    pub kid: String,
    #[serde(default)]
    pub ext: Map<String, Value>,
    #[serde(default)]
    pub expires_at: HashMap<TokenKind, DateTime<Utc>>,
}

/// Claims bound to the ID token. `subject` here is the wire subject: for
/// pairwise clients it is the obfuscated form while `AccessSession.subject`
/// keeps the local one.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IdTokenSession {
    #[serde(default)]
    pub subject: String,
    /// Authentication session id (`sid` claim).
    #[serde(default)]
    pub session_id: String,
    #[serde(default)]
    pub nonce: String,
    #[serde(default)]
    pub acr: String,
    #[serde(default)]
    pub amr: Vec<String>,
    #[serde(default)]
    pub auth_time: Option<DateTime<Utc>>,
    /// Consent-supplied id_token claim map, merged into the ID token body.
    #[serde(default)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Session {
    #[serde(default)]
    pub access: AccessSession,
    #[serde(default)]
    pub id_token: Option<IdTokenSession>,
}

impl Session {
    pub fn new(subject: impl Into<String>, client_id: impl Into<String>) -> Self {
        Self {
            access: AccessSession {
                subject: subject.into(),
                client_id: client_id.into(),
                ..Default::default()
            },
            id_token: None,
        }
    }

    /// The local subject of the grant.
    pub fn subject(&self) -> &str {
        &self.access.subject
    }

    pub fn expires_at(&self, kind: TokenKind) -> Option<DateTime<Utc>> {
        self.access.expires_at.get(&kind).copied()
    }

    pub fn set_expires_at(&mut self, kind: TokenKind, at: DateTime<Utc>) {
        self.access.expires_at.insert(kind, at);
    }

    /// Deserializes a stored session, migrating legacy field names first.
    pub fn from_stored_json(raw: &str) -> serde_json::Result<Self> {
        let mut value: Value = serde_json::from_str(raw)?;
        migrate_legacy_fields(&mut value);
        serde_json::from_value(value)
    }
}

/// Field renames applied to sessions written by earlier releases. Top-level
/// keys only; the nested id-token shape never changed.
const LEGACY_RENAMES: &[(&str, &str)] = &[
    ("Extra", "ext"),
    ("ClientID", "client_id"),
    ("KID", "kid"),
    ("idToken", "id_token"),
];

fn migrate_legacy_fields(value: &mut Value) {
    let Some(obj) = value.as_object_mut() else {
        return;
    };

    // Very old rows stored the access part inline at the top level.
    if !obj.contains_key("access") {
        let mut access = Map::new();
        for key in ["subject", "client_id", "kid", "ext", "expires_at", "Extra", "ClientID", "KID"]
        {
            if let Some(v) = obj.remove(key) {
                access.insert(key.to_string(), v);
            }
        }
        if !access.is_empty() {
            obj.insert("access".to_string(), Value::Object(access));
        }
    }

    for scope in ["access"] {
        if let Some(Value::Object(inner)) = obj.get_mut(scope) {
            for (old, new) in LEGACY_RENAMES {
                if let Some(v) = inner.remove(*old) {
                    inner.entry(new.to_string()).or_insert(v);
                }
            }
        }
    }
    for (old, new) in LEGACY_RENAMES {
        if let Some(v) = obj.remove(*old) {
            obj.entry(new.to_string()).or_insert(v);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_json() {
        let mut s = Session::new("alice", "c1");
        s.set_expires_at(TokenKind::AccessToken, Utc::now());
        s.id_token = Some(IdTokenSession {
            subject: "alice".into(),
            session_id: "sid-1".into(),
            nonce: "n".into(),
            ..Default::default()
        });
        let raw = serde_json::to_string(&s).unwrap();
        let back = Session::from_stored_json(&raw).unwrap();
        assert_eq!(back.subject(), "alice");
        assert_eq!(back.id_token.unwrap().session_id, "sid-1");
    }

    #[test]
    fn migrates_legacy_field_names() {
        let raw = r#"{"subject":"alice","ClientID":"c1","Extra":{"hooked":true},"idToken":{"subject":"alice","session_id":"sid-9"}}"#;
        let s = Session::from_stored_json(raw).unwrap();
        assert_eq!(s.access.client_id, "c1");
        assert_eq!(s.access.ext.get("hooked"), Some(&Value::Bool(true)));
        assert_eq!(s.id_token.unwrap().session_id, "sid-9");
    }
}
