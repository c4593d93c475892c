//! Token family construction shared by the authorization endpoint
//! (implicit/hybrid minting) and the token endpoint (all grants).

use anyhow::Result;
use chrono::{Duration, Utc};

use crate::server::clients::Client;
use crate::server::oidc;
use crate::server::persist::TokenRecord;
use crate::server::session::{Session, TokenKind};
use crate::state::{GrantKind, SharedState};

/// A minted access token: the wire form and the record to persist.
pub struct MintedToken {
    pub token: String,
    pub record: TokenRecord,
}

/// Mints an access token in the configured strategy (opaque HMAC or JWT) and
/// builds its storage record. The caller persists it.
#[allow(clippy::too_many_arguments)]
pub async fn new_access_token(
    app: &SharedState,
    client: &Client,
    session: &Session,
    granted_scope: &[String],
    granted_audience: &[String],
    request_id: &str,
    session_id: &str,
    grant: GrantKind,
) -> Result<MintedToken> {
    let lifespan = app.access_token_lifespan(client, grant);
    let expires_at = Utc::now() + Duration::seconds(lifespan);

    let mut session = session.clone();
    session.set_expires_at(TokenKind::AccessToken, expires_at);

    let (token, signature) = if app.config.oauth2.access_token_strategy == "jwt" {
        oidc::mint_jwt_access_token(app, client, &session, granted_scope, lifespan).await?
    } else {
        app.tokens.new_access_token()
    };

    let mut record = TokenRecord::new(
        signature,
        request_id.to_string(),
        client.client_id.clone(),
        session.access.subject.clone(),
        expires_at,
        session,
    );
    record.granted_scope = granted_scope.to_vec();
    record.granted_audience = granted_audience.to_vec();
    record.session_id = session_id.to_string();

    Ok(MintedToken { token, record })
}

/// Mints an opaque refresh token bound to the same graph and access token.
#[allow(clippy::too_many_arguments)]
pub async fn new_refresh_token(
    app: &SharedState,
    client: &Client,
    session: &Session,
    granted_scope: &[String],
    granted_audience: &[String],
    request_id: &str,
    session_id: &str,
    access_token_signature: &str,
    grant: GrantKind,
) -> Result<MintedToken> {
    let lifespan = app.refresh_token_lifespan(client, grant);
    let expires_at = Utc::now() + Duration::seconds(lifespan);

    let mut session = session.clone();
    session.set_expires_at(TokenKind::RefreshToken, expires_at);

    let (token, signature) = app.tokens.new_refresh_token();

    let mut record = TokenRecord::new(
        signature,
        request_id.to_string(),
        client.client_id.clone(),
        session.access.subject.clone(),
        expires_at,
        session,
    );
    record.granted_scope = granted_scope.to_vec();
    record.granted_audience = granted_audience.to_vec();
    record.session_id = session_id.to_string();
    record.access_token_signature = access_token_signature.to_string();

    Ok(MintedToken { token, record })
}

/// Whether a granted scope list asks for a refresh token.
pub fn wants_refresh_token(granted_scope: &[String]) -> bool {
    granted_scope
        .iter()
        .any(|s| s == "offline" || s == "offline_access")
}

/// Whether a granted scope list asks for an ID token.
pub fn wants_id_token(granted_scope: &[String]) -> bool {
    granted_scope.iter().any(|s| s == "openid")
}
