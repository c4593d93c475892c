//! OpenID Connect token construction and hint verification.
//!
//! ID tokens, JWT access tokens and Logout Tokens are all signed JWTs built
//! here so the claim layout lives in one place. The id_token_hint decoder is
//! shared by the authorization and logout endpoints: it verifies issuer and
//! signature but deliberately ignores `exp`, because an expired hint is still
//! good for subject matching.

use anyhow::Result;
use chrono::Utc;
use jsonwebtoken::{DecodingKey, Validation, decode, decode_header};
use serde_json::{Map, Value, json};

use crate::errors::OAuthError;
use crate::server::clients::Client;
use crate::server::keys::OPENID_KEY_SET;
use crate::server::session::{IdTokenSession, Session};
use crate::state::SharedState;
use crate::utility::half_hash;

/// Claims of the back-channel logout event, per OIDC Back-Channel Logout §2.
const BACKCHANNEL_LOGOUT_EVENT: &str = "http://schemas.openid.net/event/backchannel-logout";

/// Builds and signs an ID token for the given session.
#[allow(clippy::too_many_arguments)]
pub async fn mint_id_token(
    app: &SharedState,
    client: &Client,
    id_session: &IdTokenSession,
    lifespan_secs: i64,
    access_token: Option<&str>,
    code: Option<&str>,
) -> Result<String> {
    let signer = app.keys.signer(OPENID_KEY_SET, "RS256").await?;
    let now = Utc::now();

    let mut claims = Map::new();
    for (k, v) in &id_session.extra {
        claims.insert(k.clone(), v.clone());
    }
    claims.insert("iss".into(), json!(app.issuer()));
    claims.insert("sub".into(), json!(id_session.subject));
    claims.insert("aud".into(), json!([client.client_id]));
    claims.insert("iat".into(), json!(now.timestamp()));
    claims.insert("exp".into(), json!(now.timestamp() + lifespan_secs));
    claims.insert("jti".into(), json!(uuid::Uuid::new_v4().to_string()));
    if !id_session.session_id.is_empty() {
        claims.insert("sid".into(), json!(id_session.session_id));
    }
    if !id_session.nonce.is_empty() {
        claims.insert("nonce".into(), json!(id_session.nonce));
    }
    if !id_session.acr.is_empty() {
        claims.insert("acr".into(), json!(id_session.acr));
    }
    if !id_session.amr.is_empty() {
        claims.insert("amr".into(), json!(id_session.amr));
    }
    if let Some(auth_time) = id_session.auth_time {
        claims.insert("auth_time".into(), json!(auth_time.timestamp()));
    }
    if let Some(at) = access_token {
        claims.insert("at_hash".into(), json!(half_hash(at)));
    }
    if let Some(code) = code {
        claims.insert("c_hash".into(), json!(half_hash(code)));
    }

    signer.sign(&Value::Object(claims))
}

/// Builds and signs a JWT access token. The returned `jti` doubles as the
/// storage signature so introspection and revocation find the row.
pub async fn mint_jwt_access_token(
    app: &SharedState,
    client: &Client,
    session: &Session,
    granted_scope: &[String],
    lifespan_secs: i64,
) -> Result<(String, String)> {
    let signer = app
        .keys
        .signer(crate::server::keys::ACCESS_TOKEN_KEY_SET, "RS256")
        .await?;
    let now = Utc::now();
    let jti = uuid::Uuid::new_v4().to_string();

    let claims = json!({
        "sub": session.access.subject,
        "iss": app.issuer(),
        "aud": [client.client_id],
        "client_id": client.client_id,
        "iat": now.timestamp(),
        "nbf": now.timestamp(),
        "exp": now.timestamp() + lifespan_secs,
        "jti": jti,
        "scp": granted_scope,
        "ext": session.access.ext,
    });

    let token = signer.sign(&claims)?;
    Ok((token, jti))
}

/// Builds and signs a back-channel Logout Token for one client.
pub async fn mint_logout_token(app: &SharedState, client_id: &str, sid: &str) -> Result<String> {
    let signer = app.keys.signer(OPENID_KEY_SET, "RS256").await?;
    let now = Utc::now();
    let claims = json!({
        "iss": app.issuer(),
        "aud": [client_id],
        "iat": now.timestamp(),
        "jti": uuid::Uuid::new_v4().to_string(),
        "events": { BACKCHANNEL_LOGOUT_EVENT: {} },
        "sid": sid,
    });
    signer.sign(&claims)
}

/// Decoded id_token_hint claims relevant to the flow engine.
#[derive(Debug, Clone)]
pub struct HintClaims {
    pub subject: String,
    pub session_id: Option<String>,
    pub all: Map<String, Value>,
}

/// Verifies an id_token_hint against the OpenID signing set.
///
/// Issuer and signature must check out and `iat` must not lie in the future;
/// an expired `exp` is accepted because the hint is only used to match the
/// subject of an existing session.
pub async fn decode_id_token_hint(
    app: &SharedState,
    hint: &str,
) -> Result<HintClaims, OAuthError> {
    let header = decode_header(hint)
        .map_err(|e| OAuthError::invalid_request("Unable to decode id_token_hint.").with_debug(e.to_string()))?;
    let kid = header.kid.ok_or_else(|| {
        OAuthError::invalid_request("The id_token_hint does not carry a key id.")
    })?;

    let (key, alg) = app
        .keys
        .decoding_key(OPENID_KEY_SET, &kid)
        .await
        .map_err(|e| {
            OAuthError::invalid_request("The id_token_hint was signed by an unknown key.")
                .with_debug(format!("{e:#}"))
        })?;

    let claims = decode_hint_claims(hint, &key, alg, &app.issuer())?;
    Ok(claims)
}

fn decode_hint_claims(
    hint: &str,
    key: &DecodingKey,
    alg: jsonwebtoken::Algorithm,
    issuer: &str,
) -> Result<HintClaims, OAuthError> {
    let mut validation = Validation::new(alg);
    validation.set_issuer(&[issuer]);
    validation.validate_exp = false;
    validation.validate_aud = false;
    validation.required_spec_claims.clear();

    let data = decode::<Map<String, Value>>(hint, key, &validation).map_err(|e| {
        OAuthError::invalid_request(
            "The id_token_hint could not be verified against the server's signing keys.",
        )
        .with_debug(e.to_string())
    })?;

    if let Some(iat) = data.claims.get("iat").and_then(|v| v.as_i64()) {
        if iat > Utc::now().timestamp() + 60 {
            return Err(OAuthError::invalid_request(
                "The id_token_hint was issued in the future.",
            ));
        }
    }

    let subject = data
        .claims
        .get("sub")
        .and_then(|v| v.as_str())
        .unwrap_or_default()
        .to_string();
    let session_id = data
        .claims
        .get("sid")
        .and_then(|v| v.as_str())
        .map(|s| s.to_string());

    Ok(HintClaims {
        subject,
        session_id,
        all: data.claims,
    })
}
