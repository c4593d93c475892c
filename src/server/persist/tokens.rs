//! Token table persistence: authorization codes, access and refresh tokens,
//! PKCE challenges and the OIDC session rows bound to codes.
//!
//! The dangerous paths are transactional. Consuming a code re-checks the
//! `active` flag inside the transaction so a replay is detected exactly once,
//! and replays cascade: every token sharing the code's `request_id` (the
//! graph id) is deactivated, including tokens minted from rotated refresh
//! tokens, which inherit the same id.

use anyhow::{Context, Result};
use rusqlite::{Connection, Row, params};

use crate::server::persist::models::{TokenRecord, fmt_ts};
use crate::server::persist::{Store, to_json_array};
use crate::server::session::Session;

/// Outcome of consuming an authorization code or rotating a refresh token.
#[derive(Debug)]
pub enum ConsumeOutcome<T> {
    /// First presentation; the grant may proceed.
    Consumed(T),
    /// The credential was already spent; the whole token graph has been
    /// revoked as a defense against replay.
    Replayed,
    /// No such credential.
    Unknown,
}

const TOKEN_COLUMNS: &str = "signature, request_id, client_id, subject, requested_at, \
    expires_at, requested_scope, granted_scope, requested_audience, granted_audience, session, \
    session_id, active";

fn token_from_row(row: &Row<'_>, redirect_uri: String, at_sig: String) -> Result<TokenRecord> {
    TokenRecord::from_db_row(
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
        row.get(6)?,
        row.get(7)?,
        row.get(8)?,
        row.get(9)?,
        row.get(10)?,
        row.get(11)?,
        redirect_uri,
        at_sig,
        row.get(12)?,
    )
}

/// Deactivates every code, access and refresh token sharing `request_id`.
pub(crate) fn revoke_graph(conn: &Connection, nid: &str, request_id: &str) -> Result<usize> {
    let mut total = 0;
    for table in ["authorization_codes", "access_tokens", "refresh_tokens"] {
        total += conn.execute(
            &format!("UPDATE {table} SET active = 0 WHERE nid = ?1 AND request_id = ?2"),
            params![nid, request_id],
        )?;
    }
    Ok(total)
}

fn insert_token(
    conn: &Connection,
    nid: &str,
    table: &str,
    rec: &TokenRecord,
) -> Result<()> {
    match table {
        "authorization_codes" => {
            conn.execute(
                "INSERT INTO authorization_codes (signature, nid, request_id, client_id, \
                 subject, requested_at, expires_at, requested_scope, granted_scope, \
                 requested_audience, granted_audience, redirect_uri, session, session_id, \
                 active) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)",
                params![
                    rec.signature,
                    nid,
                    rec.request_id,
                    rec.client_id,
                    rec.subject,
                    fmt_ts(rec.requested_at),
                    fmt_ts(rec.expires_at),
                    to_json_array(&rec.requested_scope),
                    to_json_array(&rec.granted_scope),
                    to_json_array(&rec.requested_audience),
                    to_json_array(&rec.granted_audience),
                    rec.redirect_uri,
                    serde_json::to_string(&rec.session)?,
                    rec.session_id,
                    rec.active as i64,
                ],
            )?;
        }
        "access_tokens" => {
            conn.execute(
                "INSERT INTO access_tokens (signature, nid, request_id, client_id, subject, \
                 requested_at, expires_at, requested_scope, granted_scope, requested_audience, \
                 granted_audience, session, session_id, active) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
                params![
                    rec.signature,
                    nid,
                    rec.request_id,
                    rec.client_id,
                    rec.subject,
                    fmt_ts(rec.requested_at),
                    fmt_ts(rec.expires_at),
                    to_json_array(&rec.requested_scope),
                    to_json_array(&rec.granted_scope),
                    to_json_array(&rec.requested_audience),
                    to_json_array(&rec.granted_audience),
                    serde_json::to_string(&rec.session)?,
                    rec.session_id,
                    rec.active as i64,
                ],
            )?;
        }
        "refresh_tokens" => {
            conn.execute(
                "INSERT INTO refresh_tokens (signature, nid, request_id, client_id, subject, \
                 requested_at, expires_at, requested_scope, granted_scope, requested_audience, \
                 granted_audience, session, session_id, access_token_signature, active) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)",
                params![
                    rec.signature,
                    nid,
                    rec.request_id,
                    rec.client_id,
                    rec.subject,
                    fmt_ts(rec.requested_at),
                    fmt_ts(rec.expires_at),
                    to_json_array(&rec.requested_scope),
                    to_json_array(&rec.granted_scope),
                    to_json_array(&rec.requested_audience),
                    to_json_array(&rec.granted_audience),
                    serde_json::to_string(&rec.session)?,
                    rec.session_id,
                    rec.access_token_signature,
                    rec.active as i64,
                ],
            )?;
        }
        other => anyhow::bail!("unknown token table: {other}"),
    }
    Ok(())
}

fn get_token(
    conn: &Connection,
    nid: &str,
    table: &str,
    signature: &str,
) -> Result<Option<TokenRecord>> {
    let extra = match table {
        "authorization_codes" => ", redirect_uri, ''",
        "refresh_tokens" => ", '', access_token_signature",
        _ => ", '', ''",
    };
    let mut stmt = conn.prepare(&format!(
        "SELECT {TOKEN_COLUMNS}{extra} FROM {table} WHERE nid = ?1 AND signature = ?2"
    ))?;
    let mut rows = stmt.query(params![nid, signature])?;
    match rows.next()? {
        Some(row) => {
            let redirect_uri: String = row.get(13)?;
            let at_sig: String = row.get(14)?;
            Ok(Some(token_from_row(row, redirect_uri, at_sig)?))
        }
        None => Ok(None),
    }
}

/// What the token endpoint needs to redeem a code: the code's grant context,
/// the PKCE challenge bound to it, and the OIDC session when `openid` was
/// granted.
#[derive(Debug)]
pub struct RedeemedCode {
    pub record: TokenRecord,
    pub pkce: Option<(String, String)>,
    pub oidc_session: Option<Session>,
}

impl Store {
    /// Persists an authorization code along with its PKCE challenge and OIDC
    /// session artifacts in one transaction.
    pub async fn create_authorize_code(
        &self,
        record: TokenRecord,
        pkce: Option<(String, String)>,
        oidc_session: Option<Session>,
    ) -> Result<()> {
        self.in_tx(move |tx, nid| {
            insert_token(tx, nid, "authorization_codes", &record)?;
            if let Some((challenge, method)) = &pkce {
                tx.execute(
                    "INSERT INTO pkce (code_signature, nid, challenge, method) \
                     VALUES (?1, ?2, ?3, ?4)",
                    params![record.signature, nid, challenge, method],
                )?;
            }
            if let Some(session) = &oidc_session {
                tx.execute(
                    "INSERT INTO oidc_requests (code_signature, nid, client_id, subject, \
                     requested_at, session) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                    params![
                        record.signature,
                        nid,
                        record.client_id,
                        record.subject,
                        fmt_ts(record.requested_at),
                        serde_json::to_string(session)?,
                    ],
                )?;
            }
            Ok(())
        })
        .await
    }

    /// Atomically consumes an authorization code. A second consumption of
    /// the same code deactivates the entire token graph.
    pub async fn consume_authorize_code(
        &self,
        signature: &str,
    ) -> Result<ConsumeOutcome<RedeemedCode>> {
        let signature = signature.to_string();
        self.in_tx(move |tx, nid| {
            let Some(record) = get_token(tx, nid, "authorization_codes", &signature)? else {
                return Ok(ConsumeOutcome::Unknown);
            };
            if !record.active {
                let revoked = revoke_graph(tx, nid, &record.request_id)?;
                tracing::warn!(
                    request_id = %record.request_id,
                    revoked,
                    "authorization code replayed; revoked token graph"
                );
                return Ok(ConsumeOutcome::Replayed);
            }
            tx.execute(
                "UPDATE authorization_codes SET active = 0 WHERE nid = ?1 AND signature = ?2",
                params![nid, signature],
            )?;

            let pkce: Option<(String, String)> = match tx.query_row(
                "SELECT challenge, method FROM pkce WHERE nid = ?1 AND code_signature = ?2",
                params![nid, signature],
                |row| Ok((row.get(0)?, row.get(1)?)),
            ) {
                Ok(v) => Some(v),
                Err(rusqlite::Error::QueryReturnedNoRows) => None,
                Err(e) => return Err(e.into()),
            };

            let oidc_session: Option<Session> = match tx.query_row(
                "SELECT session FROM oidc_requests WHERE nid = ?1 AND code_signature = ?2",
                params![nid, signature],
                |row| row.get::<_, String>(0),
            ) {
                Ok(raw) => Some(Session::from_stored_json(&raw).context("parsing oidc session")?),
                Err(rusqlite::Error::QueryReturnedNoRows) => None,
                Err(e) => return Err(e.into()),
            };

            Ok(ConsumeOutcome::Consumed(RedeemedCode {
                record,
                pkce,
                oidc_session,
            }))
        })
        .await
    }

    pub async fn create_access_token(&self, record: TokenRecord) -> Result<()> {
        self.with_conn(move |conn, nid| insert_token(conn, nid, "access_tokens", &record))
            .await
    }

    pub async fn create_refresh_token(&self, record: TokenRecord) -> Result<()> {
        self.with_conn(move |conn, nid| insert_token(conn, nid, "refresh_tokens", &record))
            .await
    }

    /// Persists a fresh access + refresh pair in one transaction.
    pub async fn create_token_pair(
        &self,
        access: TokenRecord,
        refresh: TokenRecord,
    ) -> Result<()> {
        self.in_tx(move |tx, nid| {
            insert_token(tx, nid, "access_tokens", &access)?;
            insert_token(tx, nid, "refresh_tokens", &refresh)?;
            Ok(())
        })
        .await
    }

    pub async fn get_access_token(&self, signature: &str) -> Result<Option<TokenRecord>> {
        let signature = signature.to_string();
        self.with_conn(move |conn, nid| get_token(conn, nid, "access_tokens", &signature))
            .await
    }

    pub async fn get_refresh_token(&self, signature: &str) -> Result<Option<TokenRecord>> {
        let signature = signature.to_string();
        self.with_conn(move |conn, nid| get_token(conn, nid, "refresh_tokens", &signature))
            .await
    }

    /// Atomically invalidates the presented refresh token and persists the
    /// rotated pair. The new tokens keep the old `request_id` so the family
    /// stays revocable as one graph. Presenting an already-consumed token
    /// revokes the graph instead.
    pub async fn rotate_refresh_token(
        &self,
        old_signature: &str,
        new_access: TokenRecord,
        new_refresh: TokenRecord,
    ) -> Result<ConsumeOutcome<TokenRecord>> {
        let old_signature = old_signature.to_string();
        self.in_tx(move |tx, nid| {
            let Some(old) = get_token(tx, nid, "refresh_tokens", &old_signature)? else {
                return Ok(ConsumeOutcome::Unknown);
            };
            if !old.active {
                let revoked = revoke_graph(tx, nid, &old.request_id)?;
                tracing::warn!(
                    request_id = %old.request_id,
                    revoked,
                    "refresh token replayed; revoked token graph"
                );
                return Ok(ConsumeOutcome::Replayed);
            }

            tx.execute(
                "UPDATE refresh_tokens SET active = 0 WHERE nid = ?1 AND signature = ?2",
                params![nid, old_signature],
            )?;
            if !old.access_token_signature.is_empty() {
                tx.execute(
                    "UPDATE access_tokens SET active = 0 WHERE nid = ?1 AND signature = ?2",
                    params![nid, old.access_token_signature],
                )?;
            }
            insert_token(tx, nid, "access_tokens", &new_access)?;
            insert_token(tx, nid, "refresh_tokens", &new_refresh)?;
            Ok(ConsumeOutcome::Consumed(old))
        })
        .await
    }

    /// Deactivates every token sharing the graph id.
    pub async fn revoke_token_graph(&self, request_id: &str) -> Result<usize> {
        let request_id = request_id.to_string();
        self.in_tx(move |tx, nid| revoke_graph(tx, nid, &request_id))
            .await
    }

    /// Deactivates all access and refresh tokens bound to an authentication
    /// session, as part of logout.
    pub async fn revoke_tokens_by_session_id(&self, sid: &str) -> Result<usize> {
        let sid = sid.to_string();
        self.in_tx(move |tx, nid| {
            let mut total = 0;
            for table in ["access_tokens", "refresh_tokens"] {
                total += tx.execute(
                    &format!("UPDATE {table} SET active = 0 WHERE nid = ?1 AND session_id = ?2"),
                    params![nid, sid],
                )?;
            }
            Ok(total)
        })
        .await
    }

    /// Clients with a back-channel logout URI that share this sid, for the
    /// logout fan-out. Distinct per client.
    pub async fn backchannel_logout_targets(&self, sid: &str) -> Result<Vec<String>> {
        let sid = sid.to_string();
        self.with_conn(move |conn, nid| {
            let mut stmt = conn.prepare(
                "SELECT DISTINCT client_id FROM access_tokens WHERE nid = ?1 AND session_id = ?2 \
                 UNION SELECT DISTINCT client_id FROM refresh_tokens WHERE nid = ?1 AND session_id = ?2",
            )?;
            let mut rows = stmt.query(params![nid, sid])?;
            let mut out = Vec::new();
            while let Some(row) = rows.next()? {
                out.push(row.get(0)?);
            }
            Ok(out)
        })
        .await
    }
}
