//! Login, consent and logout flow records.
//!
//! The authorization endpoint creates these short-lived records and redirects
//! the browser to the out-of-process UIs with a challenge; the UIs decide via
//! the admin API, and the browser returns with the verifier. Skip semantics
//! (re-using a remembered authentication or consent) are computed here.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::server::clients::{Client, SUBJECT_TYPE_PAIRWISE};
use crate::utility::obfuscate_subject;

/// OpenID Connect request context forwarded to the login and consent UIs.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OidcContext {
    #[serde(default)]
    pub acr_values: Vec<String>,
    #[serde(default)]
    pub display: String,
    #[serde(default)]
    pub ui_locales: Vec<String>,
    #[serde(default)]
    pub login_hint: String,
    /// Claims of a presented id_token_hint, decoded but with expiry ignored.
    #[serde(default)]
    pub id_token_hint_claims: Map<String, Value>,
}

/// A pending or handled login request.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LoginRequest {
    pub challenge: String,
    #[serde(skip_serializing)]
    pub verifier: String,
    #[serde(skip_serializing)]
    pub csrf: String,
    pub client_id: String,
    pub request_url: String,
    pub requested_scope: Vec<String>,
    pub requested_access_token_audience: Vec<String>,
    pub oidc_context: OidcContext,
    /// Subject hint from an existing authentication session; empty otherwise.
    pub subject: String,
    pub session_id: Option<String>,
    pub skip: bool,
    pub requested_at: DateTime<Utc>,

    // Decision state, populated once the UI has called accept or reject.
    #[serde(skip_serializing)]
    pub handled: bool,
    #[serde(skip_serializing)]
    pub verifier_used: bool,
    #[serde(skip_serializing)]
    pub accepted: bool,
    #[serde(skip_serializing)]
    pub error: Option<FlowError>,
    #[serde(skip_serializing)]
    pub acr: String,
    #[serde(skip_serializing)]
    pub amr: Vec<String>,
    #[serde(skip_serializing)]
    pub context: Value,
    #[serde(skip_serializing)]
    pub remember: bool,
    #[serde(skip_serializing)]
    pub remember_for: i64,
    #[serde(skip_serializing)]
    pub force_subject_identifier: String,
    #[serde(skip_serializing)]
    pub authenticated_at: Option<DateTime<Utc>>,
}

/// Payload of `PUT .../login/accept`.
#[derive(Debug, Clone, Deserialize)]
pub struct AcceptLoginRequest {
    pub subject: String,
    #[serde(default)]
    pub remember: bool,
    #[serde(default)]
    pub remember_for: i64,
    #[serde(default)]
    pub acr: String,
    #[serde(default)]
    pub amr: Vec<String>,
    #[serde(default)]
    pub context: Value,
    #[serde(default)]
    pub force_subject_identifier: String,
}

/// Payload of `PUT .../{login,consent,logout}/reject`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FlowError {
    #[serde(default = "default_error_code")]
    pub error: String,
    #[serde(default)]
    pub error_description: String,
    #[serde(default)]
    pub status_code: Option<u16>,
}

fn default_error_code() -> String {
    "access_denied".to_string()
}

/// A pending or handled consent request.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsentRequest {
    pub challenge: String,
    #[serde(skip_serializing)]
    pub verifier: String,
    #[serde(skip_serializing)]
    pub csrf: String,
    pub client_id: String,
    pub subject: String,
    pub request_url: String,
    pub requested_scope: Vec<String>,
    pub requested_access_token_audience: Vec<String>,
    pub oidc_context: OidcContext,
    pub login_challenge: String,
    pub login_session_id: Option<String>,
    pub acr: String,
    pub amr: Vec<String>,
    pub context: Value,
    #[serde(skip_serializing)]
    pub force_subject_identifier: String,
    pub skip: bool,
    pub requested_at: DateTime<Utc>,
    pub authenticated_at: Option<DateTime<Utc>>,

    #[serde(skip_serializing)]
    pub handled: bool,
    #[serde(skip_serializing)]
    pub verifier_used: bool,
    #[serde(skip_serializing)]
    pub accepted: bool,
    #[serde(skip_serializing)]
    pub granted_scope: Vec<String>,
    #[serde(skip_serializing)]
    pub granted_audience: Vec<String>,
    #[serde(skip_serializing)]
    pub remember: bool,
    #[serde(skip_serializing)]
    pub remember_for: i64,
    #[serde(skip_serializing)]
    pub session_access_token: Map<String, Value>,
    #[serde(skip_serializing)]
    pub session_id_token: Map<String, Value>,
    #[serde(skip_serializing)]
    pub error: Option<FlowError>,
    #[serde(skip_serializing)]
    pub handled_at: Option<DateTime<Utc>>,
}

/// Session claim maps supplied by the consent UI.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConsentSessionPayload {
    #[serde(default)]
    pub access_token: Map<String, Value>,
    #[serde(default)]
    pub id_token: Map<String, Value>,
}

/// Payload of `PUT .../consent/accept`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AcceptConsentRequest {
    #[serde(default)]
    pub grant_scope: Vec<String>,
    #[serde(default)]
    pub grant_access_token_audience: Vec<String>,
    #[serde(default)]
    pub remember: bool,
    #[serde(default)]
    pub remember_for: i64,
    #[serde(default)]
    pub session: ConsentSessionPayload,
    #[serde(default)]
    pub handled_at: Option<DateTime<Utc>>,
}

/// An authenticated browser session, keyed by the session cookie.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoginSession {
    pub id: String,
    pub subject: String,
    pub authenticated_at: DateTime<Utc>,
    pub remember: bool,
    pub acr: String,
    pub amr: Vec<String>,
}

/// A remembered consent grant, used to compute consent skip.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsentSession {
    /// Challenge of the consent request that produced this grant.
    pub challenge: String,
    pub subject: String,
    pub client_id: String,
    pub granted_scope: Vec<String>,
    pub granted_audience: Vec<String>,
    pub remember: bool,
    pub remember_for: i64,
    pub handled_at: Option<DateTime<Utc>>,
    pub session_access_token: Map<String, Value>,
    pub session_id_token: Map<String, Value>,
}

/// A pending or handled logout request.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LogoutRequest {
    pub challenge: String,
    #[serde(skip_serializing)]
    pub verifier: String,
    pub subject: String,
    pub sid: String,
    pub client_id: Option<String>,
    pub request_url: String,
    pub post_logout_redirect_uri: String,
    pub state: String,
    pub rp_initiated: bool,
    #[serde(skip_serializing)]
    pub handled: bool,
    #[serde(skip_serializing)]
    pub verifier_used: bool,
    #[serde(skip_serializing)]
    pub accepted: bool,
    #[serde(skip_serializing)]
    pub rejected: bool,
}

/// OpenID Connect `prompt` values for one authorize request.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Prompt {
    pub none: bool,
    pub login: bool,
    pub consent: bool,
    pub select_account: bool,
}

impl Prompt {
    pub fn parse(raw: Option<&str>) -> Result<Self, String> {
        let mut p = Prompt::default();
        let Some(raw) = raw else { return Ok(p) };
        for word in raw.split_whitespace() {
            match word {
                "none" => p.none = true,
                "login" => p.login = true,
                "consent" => p.consent = true,
                "select_account" => p.select_account = true,
                other => return Err(format!("Unknown prompt value: {other}")),
            }
        }
        if p.none && (p.login || p.consent || p.select_account) {
            return Err("Prompt 'none' must not be combined with other values.".to_string());
        }
        Ok(p)
    }
}

/// Whether an authentication session is fresh enough for `max_age`.
pub fn max_age_satisfied(
    authenticated_at: DateTime<Utc>,
    max_age: Option<i64>,
    now: DateTime<Utc>,
) -> bool {
    match max_age {
        None => true,
        Some(seconds) => now - authenticated_at <= Duration::seconds(seconds),
    }
}

/// Whether the subject of the current session matches an id_token_hint `sub`
/// claim. The hint may carry the pairwise-obfuscated form, so both are
/// compared.
pub fn subject_matches_hint(
    session_subject: &str,
    hint_sub: &str,
    client: &Client,
    pairwise_salt: &str,
) -> bool {
    if session_subject == hint_sub {
        return true;
    }
    if client.subject_type == SUBJECT_TYPE_PAIRWISE {
        if let Ok(sector) = client.sector_identifier() {
            return obfuscate_subject(&sector, session_subject, pairwise_salt) == hint_sub;
        }
    }
    false
}

/// Finds a remembered consent whose granted scopes cover every requested
/// scope. First match wins.
pub fn find_matching_consent<'a>(
    previous: &'a [ConsentSession],
    requested_scope: &[String],
    now: DateTime<Utc>,
) -> Option<&'a ConsentSession> {
    previous.iter().find(|cs| {
        if !cs.remember {
            return false;
        }
        if cs.remember_for > 0 {
            match cs.handled_at {
                Some(at) if now - at <= Duration::seconds(cs.remember_for) => {}
                _ => return false,
            }
        }
        requested_scope
            .iter()
            .all(|s| cs.granted_scope.iter().any(|g| g == s))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prompt_parsing_rejects_none_combinations() {
        assert!(Prompt::parse(Some("none login")).is_err());
        assert!(Prompt::parse(Some("wat")).is_err());
        let p = Prompt::parse(Some("login consent")).unwrap();
        assert!(p.login && p.consent && !p.none);
        assert_eq!(Prompt::parse(None).unwrap(), Prompt::default());
    }

    #[test]
    fn max_age_boundaries() {
        let now = Utc::now();
        let auth_at = now - Duration::seconds(100);
        assert!(max_age_satisfied(auth_at, None, now));
        assert!(max_age_satisfied(auth_at, Some(100), now));
        assert!(!max_age_satisfied(auth_at, Some(99), now));
    }

    #[test]
    fn consent_matching_requires_full_scope_cover() {
        let now = Utc::now();
        let remembered = vec![ConsentSession {
            challenge: "ch".into(),
            subject: "alice".into(),
            client_id: "c1".into(),
            granted_scope: vec!["openid".into(), "offline".into()],
            remember: true,
            remember_for: 0,
            handled_at: Some(now),
            ..Default::default()
        }];
        assert!(find_matching_consent(&remembered, &["openid".into()], now).is_some());
        assert!(
            find_matching_consent(&remembered, &["openid".into(), "email".into()], now).is_none()
        );
    }

    #[test]
    fn expired_remembered_consent_does_not_match() {
        let now = Utc::now();
        let remembered = vec![ConsentSession {
            granted_scope: vec!["openid".into()],
            remember: true,
            remember_for: 60,
            handled_at: Some(now - Duration::seconds(120)),
            ..Default::default()
        }];
        assert!(find_matching_consent(&remembered, &["openid".into()], now).is_none());
    }

    #[test]
    fn pairwise_hint_subject_matches_obfuscated_form() {
        let client = Client {
            client_id: "c2".into(),
            subject_type: SUBJECT_TYPE_PAIRWISE.into(),
            sector_identifier_uri: Some("https://s/".into()),
            redirect_uris: vec!["https://cb/".into()],
            ..Default::default()
        };
        let obfuscated = obfuscate_subject("https://s/", "bob", "salt");
        assert!(subject_matches_hint("bob", &obfuscated, &client, "salt"));
        assert!(subject_matches_hint("bob", "bob", &client, "salt"));
        assert!(!subject_matches_hint("bob", "alice", &client, "salt"));
    }
}
