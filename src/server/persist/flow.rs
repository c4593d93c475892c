//! Login/consent/logout request and session persistence.
//!
//! The verifier-consumption paths run inside transactions: a verifier is
//! accepted at most once, and the check-and-mark must be atomic under
//! concurrent re-entries of the authorization endpoint.

use anyhow::{Context, Result, bail};
use chrono::Utc;
use rusqlite::{Connection, Row, params};

use crate::server::flow::{
    AcceptConsentRequest, AcceptLoginRequest, ConsentRequest, ConsentSession, FlowError,
    LoginRequest, LoginSession, LogoutRequest, OidcContext,
};
use crate::server::persist::models::{fmt_ts, opt_ts};
use crate::server::persist::{Store, from_json_array, to_json_array};

/// Outcome of a verifier redemption attempt.
#[derive(Debug)]
pub enum VerifierOutcome<T> {
    /// First redemption; the record is returned and now marked used.
    Consumed(T),
    /// The verifier was already redeemed once.
    AlreadyUsed,
    /// No handled request carries this verifier.
    Unknown,
}

// ---------------- login requests ----------------

const LOGIN_COLUMNS: &str = "challenge, verifier, csrf, client_id, request_url, requested_scope, \
    requested_audience, oidc_context, subject, session_id, skip, requested_at, handled, \
    verifier_used, accepted, error, acr, amr, context, remember, remember_for, \
    force_subject_identifier, authenticated_at";

fn login_from_row(row: &Row<'_>) -> Result<LoginRequest> {
    let oidc_context: String = row.get(7)?;
    let error: Option<String> = row.get(15)?;
    let context: String = row.get(18)?;
    Ok(LoginRequest {
        challenge: row.get(0)?,
        verifier: row.get(1)?,
        csrf: row.get(2)?,
        client_id: row.get(3)?,
        request_url: row.get(4)?,
        requested_scope: from_json_array(&row.get::<_, String>(5)?),
        requested_access_token_audience: from_json_array(&row.get::<_, String>(6)?),
        oidc_context: serde_json::from_str::<OidcContext>(&oidc_context)
            .context("parsing oidc_context")?,
        subject: row.get(8)?,
        session_id: row.get(9)?,
        skip: row.get::<_, i64>(10)? != 0,
        requested_at: super::models::parse_ts(&row.get::<_, String>(11)?)?,
        handled: row.get::<_, i64>(12)? != 0,
        verifier_used: row.get::<_, i64>(13)? != 0,
        accepted: row.get::<_, i64>(14)? != 0,
        error: error
            .map(|raw| serde_json::from_str::<FlowError>(&raw).context("parsing error"))
            .transpose()?,
        acr: row.get(16)?,
        amr: from_json_array(&row.get::<_, String>(17)?),
        context: serde_json::from_str(&context).context("parsing context")?,
        remember: row.get::<_, i64>(19)? != 0,
        remember_for: row.get(20)?,
        force_subject_identifier: row.get(21)?,
        authenticated_at: opt_ts(row.get(22)?)?,
    })
}

pub(crate) fn get_login_request_row(
    conn: &Connection,
    nid: &str,
    challenge: &str,
) -> Result<Option<LoginRequest>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {LOGIN_COLUMNS} FROM login_requests WHERE nid = ?1 AND challenge = ?2"
    ))?;
    let mut rows = stmt.query(params![nid, challenge])?;
    match rows.next()? {
        Some(row) => Ok(Some(login_from_row(row)?)),
        None => Ok(None),
    }
}

impl Store {
    pub async fn create_login_request(&self, lr: LoginRequest) -> Result<()> {
        self.with_conn(move |conn, nid| {
            conn.execute(
                "INSERT INTO login_requests (challenge, nid, verifier, csrf, client_id, \
                 request_url, requested_scope, requested_audience, oidc_context, subject, \
                 session_id, skip, requested_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
                params![
                    lr.challenge,
                    nid,
                    lr.verifier,
                    lr.csrf,
                    lr.client_id,
                    lr.request_url,
                    to_json_array(&lr.requested_scope),
                    to_json_array(&lr.requested_access_token_audience),
                    serde_json::to_string(&lr.oidc_context)?,
                    lr.subject,
                    lr.session_id,
                    lr.skip as i64,
                    fmt_ts(lr.requested_at),
                ],
            )?;
            Ok(())
        })
        .await
    }

    pub async fn get_login_request(&self, challenge: &str) -> Result<Option<LoginRequest>> {
        let challenge = challenge.to_string();
        self.with_conn(move |conn, nid| get_login_request_row(conn, nid, &challenge))
            .await
    }

    /// Marks the login request accepted. Duplicate accepts return the stored
    /// record unchanged, which keeps the verifier identical across retries.
    pub async fn accept_login_request(
        &self,
        challenge: &str,
        accept: AcceptLoginRequest,
    ) -> Result<Option<LoginRequest>> {
        let challenge = challenge.to_string();
        self.in_tx(move |tx, nid| {
            let Some(existing) = get_login_request_row(tx, nid, &challenge)? else {
                return Ok(None);
            };
            if existing.handled {
                return Ok(Some(existing));
            }
            tx.execute(
                "UPDATE login_requests SET handled = 1, accepted = 1, subject = ?3, acr = ?4, \
                 amr = ?5, context = ?6, remember = ?7, remember_for = ?8, \
                 force_subject_identifier = ?9, authenticated_at = ?10 \
                 WHERE nid = ?1 AND challenge = ?2",
                params![
                    nid,
                    challenge,
                    accept.subject,
                    accept.acr,
                    to_json_array(&accept.amr),
                    serde_json::to_string(&accept.context)?,
                    accept.remember as i64,
                    accept.remember_for,
                    accept.force_subject_identifier,
                    fmt_ts(Utc::now()),
                ],
            )?;
            get_login_request_row(tx, nid, &challenge)
        })
        .await
    }

    pub async fn reject_login_request(
        &self,
        challenge: &str,
        error: FlowError,
    ) -> Result<Option<LoginRequest>> {
        let challenge = challenge.to_string();
        self.in_tx(move |tx, nid| {
            let Some(existing) = get_login_request_row(tx, nid, &challenge)? else {
                return Ok(None);
            };
            if existing.handled {
                return Ok(Some(existing));
            }
            tx.execute(
                "UPDATE login_requests SET handled = 1, accepted = 0, error = ?3 \
                 WHERE nid = ?1 AND challenge = ?2",
                params![nid, challenge, serde_json::to_string(&error)?],
            )?;
            get_login_request_row(tx, nid, &challenge)
        })
        .await
    }

    /// Redeems a login verifier exactly once.
    pub async fn consume_login_verifier(
        &self,
        verifier: &str,
    ) -> Result<VerifierOutcome<LoginRequest>> {
        let verifier = verifier.to_string();
        self.in_tx(move |tx, nid| {
            let mut stmt = tx.prepare(&format!(
                "SELECT {LOGIN_COLUMNS} FROM login_requests \
                 WHERE nid = ?1 AND verifier = ?2 AND handled = 1"
            ))?;
            let mut rows = stmt.query(params![nid, verifier])?;
            let Some(row) = rows.next()? else {
                return Ok(VerifierOutcome::Unknown);
            };
            let lr = login_from_row(row)?;
            drop(rows);
            drop(stmt);
            if lr.verifier_used {
                return Ok(VerifierOutcome::AlreadyUsed);
            }
            let n = tx.execute(
                "UPDATE login_requests SET verifier_used = 1 \
                 WHERE nid = ?1 AND verifier = ?2 AND verifier_used = 0",
                params![nid, verifier],
            )?;
            if n == 0 {
                bail!("login verifier consumption raced");
            }
            Ok(VerifierOutcome::Consumed(lr))
        })
        .await
    }
}

// ---------------- consent requests ----------------

const CONSENT_COLUMNS: &str = "challenge, verifier, csrf, client_id, subject, request_url, \
    requested_scope, requested_audience, oidc_context, login_challenge, login_session_id, acr, \
    amr, context, force_subject_identifier, skip, requested_at, authenticated_at, handled, \
    verifier_used, accepted, granted_scope, granted_audience, remember, remember_for, \
    session_access_token, session_id_token, error, handled_at";

fn consent_from_row(row: &Row<'_>) -> Result<ConsentRequest> {
    let error: Option<String> = row.get(27)?;
    Ok(ConsentRequest {
        challenge: row.get(0)?,
        verifier: row.get(1)?,
        csrf: row.get(2)?,
        client_id: row.get(3)?,
        subject: row.get(4)?,
        request_url: row.get(5)?,
        requested_scope: from_json_array(&row.get::<_, String>(6)?),
        requested_access_token_audience: from_json_array(&row.get::<_, String>(7)?),
        oidc_context: serde_json::from_str(&row.get::<_, String>(8)?)
            .context("parsing oidc_context")?,
        login_challenge: row.get(9)?,
        login_session_id: row.get(10)?,
        acr: row.get(11)?,
        amr: from_json_array(&row.get::<_, String>(12)?),
        context: serde_json::from_str(&row.get::<_, String>(13)?).context("parsing context")?,
        force_subject_identifier: row.get(14)?,
        skip: row.get::<_, i64>(15)? != 0,
        requested_at: super::models::parse_ts(&row.get::<_, String>(16)?)?,
        authenticated_at: opt_ts(row.get(17)?)?,
        handled: row.get::<_, i64>(18)? != 0,
        verifier_used: row.get::<_, i64>(19)? != 0,
        accepted: row.get::<_, i64>(20)? != 0,
        granted_scope: from_json_array(&row.get::<_, String>(21)?),
        granted_audience: from_json_array(&row.get::<_, String>(22)?),
        remember: row.get::<_, i64>(23)? != 0,
        remember_for: row.get(24)?,
        session_access_token: serde_json::from_str(&row.get::<_, String>(25)?)
            .context("parsing session_access_token")?,
        session_id_token: serde_json::from_str(&row.get::<_, String>(26)?)
            .context("parsing session_id_token")?,
        error: error
            .map(|raw| serde_json::from_str::<FlowError>(&raw).context("parsing error"))
            .transpose()?,
        handled_at: opt_ts(row.get(28)?)?,
    })
}

pub(crate) fn get_consent_request_row(
    conn: &Connection,
    nid: &str,
    challenge: &str,
) -> Result<Option<ConsentRequest>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {CONSENT_COLUMNS} FROM consent_requests WHERE nid = ?1 AND challenge = ?2"
    ))?;
    let mut rows = stmt.query(params![nid, challenge])?;
    match rows.next()? {
        Some(row) => Ok(Some(consent_from_row(row)?)),
        None => Ok(None),
    }
}

impl Store {
    pub async fn create_consent_request(&self, cr: ConsentRequest) -> Result<()> {
        self.with_conn(move |conn, nid| {
            conn.execute(
                "INSERT INTO consent_requests (challenge, nid, verifier, csrf, client_id, \
                 subject, request_url, requested_scope, requested_audience, oidc_context, \
                 login_challenge, login_session_id, acr, amr, context, \
                 force_subject_identifier, skip, requested_at, authenticated_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, \
                 ?16, ?17, ?18, ?19)",
                params![
                    cr.challenge,
                    nid,
                    cr.verifier,
                    cr.csrf,
                    cr.client_id,
                    cr.subject,
                    cr.request_url,
                    to_json_array(&cr.requested_scope),
                    to_json_array(&cr.requested_access_token_audience),
                    serde_json::to_string(&cr.oidc_context)?,
                    cr.login_challenge,
                    cr.login_session_id,
                    cr.acr,
                    to_json_array(&cr.amr),
                    serde_json::to_string(&cr.context)?,
                    cr.force_subject_identifier,
                    cr.skip as i64,
                    fmt_ts(cr.requested_at),
                    cr.authenticated_at.map(fmt_ts),
                ],
            )?;
            Ok(())
        })
        .await
    }

    pub async fn get_consent_request(&self, challenge: &str) -> Result<Option<ConsentRequest>> {
        let challenge = challenge.to_string();
        self.with_conn(move |conn, nid| get_consent_request_row(conn, nid, &challenge))
            .await
    }

    pub async fn accept_consent_request(
        &self,
        challenge: &str,
        accept: AcceptConsentRequest,
    ) -> Result<Option<ConsentRequest>> {
        let challenge = challenge.to_string();
        self.in_tx(move |tx, nid| {
            let Some(existing) = get_consent_request_row(tx, nid, &challenge)? else {
                return Ok(None);
            };
            if existing.handled {
                return Ok(Some(existing));
            }
            tx.execute(
                "UPDATE consent_requests SET handled = 1, accepted = 1, granted_scope = ?3, \
                 granted_audience = ?4, remember = ?5, remember_for = ?6, \
                 session_access_token = ?7, session_id_token = ?8, handled_at = ?9 \
                 WHERE nid = ?1 AND challenge = ?2",
                params![
                    nid,
                    challenge,
                    to_json_array(&accept.grant_scope),
                    to_json_array(&accept.grant_access_token_audience),
                    accept.remember as i64,
                    accept.remember_for,
                    serde_json::to_string(&accept.session.access_token)?,
                    serde_json::to_string(&accept.session.id_token)?,
                    fmt_ts(accept.handled_at.unwrap_or_else(Utc::now)),
                ],
            )?;
            get_consent_request_row(tx, nid, &challenge)
        })
        .await
    }

    pub async fn reject_consent_request(
        &self,
        challenge: &str,
        error: FlowError,
    ) -> Result<Option<ConsentRequest>> {
        let challenge = challenge.to_string();
        self.in_tx(move |tx, nid| {
            let Some(existing) = get_consent_request_row(tx, nid, &challenge)? else {
                return Ok(None);
            };
            if existing.handled {
                return Ok(Some(existing));
            }
            tx.execute(
                "UPDATE consent_requests SET handled = 1, accepted = 0, error = ?3, \
                 handled_at = ?4 WHERE nid = ?1 AND challenge = ?2",
                params![
                    nid,
                    challenge,
                    serde_json::to_string(&error)?,
                    fmt_ts(Utc::now()),
                ],
            )?;
            get_consent_request_row(tx, nid, &challenge)
        })
        .await
    }

    pub async fn consume_consent_verifier(
        &self,
        verifier: &str,
    ) -> Result<VerifierOutcome<ConsentRequest>> {
        let verifier = verifier.to_string();
        self.in_tx(move |tx, nid| {
            let mut stmt = tx.prepare(&format!(
                "SELECT {CONSENT_COLUMNS} FROM consent_requests \
                 WHERE nid = ?1 AND verifier = ?2 AND handled = 1"
            ))?;
            let mut rows = stmt.query(params![nid, verifier])?;
            let Some(row) = rows.next()? else {
                return Ok(VerifierOutcome::Unknown);
            };
            let cr = consent_from_row(row)?;
            drop(rows);
            drop(stmt);
            if cr.verifier_used {
                return Ok(VerifierOutcome::AlreadyUsed);
            }
            let n = tx.execute(
                "UPDATE consent_requests SET verifier_used = 1 \
                 WHERE nid = ?1 AND verifier = ?2 AND verifier_used = 0",
                params![nid, verifier],
            )?;
            if n == 0 {
                bail!("consent verifier consumption raced");
            }
            Ok(VerifierOutcome::Consumed(cr))
        })
        .await
    }
}

// ---------------- login sessions ----------------

fn login_session_from_row(row: &Row<'_>) -> Result<LoginSession> {
    Ok(LoginSession {
        id: row.get(0)?,
        subject: row.get(1)?,
        authenticated_at: super::models::parse_ts(&row.get::<_, String>(2)?)?,
        remember: row.get::<_, i64>(3)? != 0,
        acr: row.get(4)?,
        amr: from_json_array(&row.get::<_, String>(5)?),
    })
}

impl Store {
    /// Inserts or refreshes an authentication session. Concurrent flows for
    /// the same sid converge on the last writer.
    pub async fn upsert_login_session(&self, session: LoginSession) -> Result<()> {
        self.with_conn(move |conn, nid| {
            conn.execute(
                "INSERT INTO login_sessions (id, nid, subject, authenticated_at, remember, acr, amr) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7) \
                 ON CONFLICT (id) DO UPDATE SET \
                    subject = excluded.subject, \
                    authenticated_at = excluded.authenticated_at, \
                    remember = excluded.remember, \
                    acr = excluded.acr, \
                    amr = excluded.amr",
                params![
                    session.id,
                    nid,
                    session.subject,
                    fmt_ts(session.authenticated_at),
                    session.remember as i64,
                    session.acr,
                    to_json_array(&session.amr),
                ],
            )?;
            Ok(())
        })
        .await
    }

    pub async fn get_login_session(&self, id: &str) -> Result<Option<LoginSession>> {
        let id = id.to_string();
        self.with_conn(move |conn, nid| {
            let mut stmt = conn.prepare(
                "SELECT id, subject, authenticated_at, remember, acr, amr \
                 FROM login_sessions WHERE nid = ?1 AND id = ?2",
            )?;
            let mut rows = stmt.query(params![nid, id])?;
            match rows.next()? {
                Some(row) => Ok(Some(login_session_from_row(row)?)),
                None => Ok(None),
            }
        })
        .await
    }

    pub async fn delete_login_session(&self, id: &str) -> Result<bool> {
        let id = id.to_string();
        self.with_conn(move |conn, nid| {
            let n = conn.execute(
                "DELETE FROM login_sessions WHERE nid = ?1 AND id = ?2",
                params![nid, id],
            )?;
            Ok(n > 0)
        })
        .await
    }

    pub async fn delete_login_sessions_by_subject(&self, subject: &str) -> Result<usize> {
        let subject = subject.to_string();
        self.with_conn(move |conn, nid| {
            let n = conn.execute(
                "DELETE FROM login_sessions WHERE nid = ?1 AND subject = ?2",
                params![nid, subject],
            )?;
            Ok(n)
        })
        .await
    }
}

// ---------------- consent sessions ----------------

fn consent_session_from_row(row: &Row<'_>) -> Result<ConsentSession> {
    Ok(ConsentSession {
        challenge: row.get(0)?,
        subject: row.get(1)?,
        client_id: row.get(2)?,
        granted_scope: from_json_array(&row.get::<_, String>(3)?),
        granted_audience: from_json_array(&row.get::<_, String>(4)?),
        remember: row.get::<_, i64>(5)? != 0,
        remember_for: row.get(6)?,
        handled_at: opt_ts(row.get(7)?)?,
        session_access_token: serde_json::from_str(&row.get::<_, String>(8)?)
            .context("parsing session_access_token")?,
        session_id_token: serde_json::from_str(&row.get::<_, String>(9)?)
            .context("parsing session_id_token")?,
    })
}

const CONSENT_SESSION_COLUMNS: &str = "challenge, subject, client_id, granted_scope, \
    granted_audience, remember, remember_for, handled_at, session_access_token, session_id_token";

impl Store {
    pub async fn create_consent_session(&self, cs: ConsentSession) -> Result<()> {
        self.with_conn(move |conn, nid| {
            conn.execute(
                "INSERT OR REPLACE INTO consent_sessions (challenge, nid, subject, client_id, \
                 granted_scope, granted_audience, remember, remember_for, handled_at, \
                 session_access_token, session_id_token) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
                params![
                    cs.challenge,
                    nid,
                    cs.subject,
                    cs.client_id,
                    to_json_array(&cs.granted_scope),
                    to_json_array(&cs.granted_audience),
                    cs.remember as i64,
                    cs.remember_for,
                    cs.handled_at.map(fmt_ts),
                    serde_json::to_string(&cs.session_access_token)?,
                    serde_json::to_string(&cs.session_id_token)?,
                ],
            )?;
            Ok(())
        })
        .await
    }

    /// Remembered consents for (subject, client), newest first.
    pub async fn find_consent_sessions(
        &self,
        subject: &str,
        client_id: &str,
    ) -> Result<Vec<ConsentSession>> {
        let subject = subject.to_string();
        let client_id = client_id.to_string();
        self.with_conn(move |conn, nid| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {CONSENT_SESSION_COLUMNS} FROM consent_sessions \
                 WHERE nid = ?1 AND subject = ?2 AND client_id = ?3 AND remember = 1 \
                 ORDER BY handled_at DESC"
            ))?;
            let mut rows = stmt.query(params![nid, subject, client_id])?;
            let mut out = Vec::new();
            while let Some(row) = rows.next()? {
                out.push(consent_session_from_row(row)?);
            }
            Ok(out)
        })
        .await
    }

    pub async fn list_consent_sessions_by_subject(
        &self,
        subject: &str,
    ) -> Result<Vec<ConsentSession>> {
        let subject = subject.to_string();
        self.with_conn(move |conn, nid| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {CONSENT_SESSION_COLUMNS} FROM consent_sessions \
                 WHERE nid = ?1 AND subject = ?2 ORDER BY handled_at DESC"
            ))?;
            let mut rows = stmt.query(params![nid, subject])?;
            let mut out = Vec::new();
            while let Some(row) = rows.next()? {
                out.push(consent_session_from_row(row)?);
            }
            Ok(out)
        })
        .await
    }

    pub async fn revoke_consent_sessions(
        &self,
        subject: &str,
        client_id: Option<String>,
    ) -> Result<usize> {
        let subject = subject.to_string();
        self.with_conn(move |conn, nid| {
            let n = conn.execute(
                "DELETE FROM consent_sessions WHERE nid = ?1 AND subject = ?2 \
                 AND (?3 IS NULL OR client_id = ?3)",
                params![nid, subject, client_id],
            )?;
            Ok(n)
        })
        .await
    }
}

// ---------------- logout requests ----------------

const LOGOUT_COLUMNS: &str = "challenge, verifier, subject, session_id, client_id, request_url, \
    post_logout_redirect_uri, state, rp_initiated, handled, verifier_used, accepted, rejected";

fn logout_from_row(row: &Row<'_>) -> Result<LogoutRequest> {
    Ok(LogoutRequest {
        challenge: row.get(0)?,
        verifier: row.get(1)?,
        subject: row.get(2)?,
        sid: row.get(3)?,
        client_id: row.get(4)?,
        request_url: row.get(5)?,
        post_logout_redirect_uri: row.get(6)?,
        state: row.get(7)?,
        rp_initiated: row.get::<_, i64>(8)? != 0,
        handled: row.get::<_, i64>(9)? != 0,
        verifier_used: row.get::<_, i64>(10)? != 0,
        accepted: row.get::<_, i64>(11)? != 0,
        rejected: row.get::<_, i64>(12)? != 0,
    })
}

pub(crate) fn get_logout_request_row(
    conn: &Connection,
    nid: &str,
    challenge: &str,
) -> Result<Option<LogoutRequest>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {LOGOUT_COLUMNS} FROM logout_requests WHERE nid = ?1 AND challenge = ?2"
    ))?;
    let mut rows = stmt.query(params![nid, challenge])?;
    match rows.next()? {
        Some(row) => Ok(Some(logout_from_row(row)?)),
        None => Ok(None),
    }
}

impl Store {
    pub async fn create_logout_request(&self, lr: LogoutRequest) -> Result<()> {
        self.with_conn(move |conn, nid| {
            conn.execute(
                "INSERT INTO logout_requests (challenge, nid, verifier, subject, session_id, \
                 client_id, request_url, post_logout_redirect_uri, state, rp_initiated) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                params![
                    lr.challenge,
                    nid,
                    lr.verifier,
                    lr.subject,
                    lr.sid,
                    lr.client_id,
                    lr.request_url,
                    lr.post_logout_redirect_uri,
                    lr.state,
                    lr.rp_initiated as i64,
                ],
            )?;
            Ok(())
        })
        .await
    }

    pub async fn get_logout_request(&self, challenge: &str) -> Result<Option<LogoutRequest>> {
        let challenge = challenge.to_string();
        self.with_conn(move |conn, nid| get_logout_request_row(conn, nid, &challenge))
            .await
    }

    pub async fn accept_logout_request(&self, challenge: &str) -> Result<Option<LogoutRequest>> {
        let challenge = challenge.to_string();
        self.in_tx(move |tx, nid| {
            let Some(existing) = get_logout_request_row(tx, nid, &challenge)? else {
                return Ok(None);
            };
            if existing.handled {
                return Ok(Some(existing));
            }
            tx.execute(
                "UPDATE logout_requests SET handled = 1, accepted = 1 \
                 WHERE nid = ?1 AND challenge = ?2",
                params![nid, challenge],
            )?;
            get_logout_request_row(tx, nid, &challenge)
        })
        .await
    }

    pub async fn reject_logout_request(&self, challenge: &str) -> Result<Option<LogoutRequest>> {
        let challenge = challenge.to_string();
        self.in_tx(move |tx, nid| {
            let Some(existing) = get_logout_request_row(tx, nid, &challenge)? else {
                return Ok(None);
            };
            if existing.handled {
                return Ok(Some(existing));
            }
            tx.execute(
                "UPDATE logout_requests SET handled = 1, rejected = 1 \
                 WHERE nid = ?1 AND challenge = ?2",
                params![nid, challenge],
            )?;
            get_logout_request_row(tx, nid, &challenge)
        })
        .await
    }

    pub async fn consume_logout_verifier(
        &self,
        verifier: &str,
    ) -> Result<VerifierOutcome<LogoutRequest>> {
        let verifier = verifier.to_string();
        self.in_tx(move |tx, nid| {
            let mut stmt = tx.prepare(&format!(
                "SELECT {LOGOUT_COLUMNS} FROM logout_requests \
                 WHERE nid = ?1 AND verifier = ?2 AND handled = 1"
            ))?;
            let mut rows = stmt.query(params![nid, verifier])?;
            let Some(row) = rows.next()? else {
                return Ok(VerifierOutcome::Unknown);
            };
            let lr = logout_from_row(row)?;
            drop(rows);
            drop(stmt);
            if lr.verifier_used {
                return Ok(VerifierOutcome::AlreadyUsed);
            }
            tx.execute(
                "UPDATE logout_requests SET verifier_used = 1 \
                 WHERE nid = ?1 AND verifier = ?2 AND verifier_used = 0",
                params![nid, verifier],
            )?;
            Ok(VerifierOutcome::Consumed(lr))
        })
        .await
    }
}
