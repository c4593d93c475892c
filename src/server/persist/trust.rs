//! Trusted JWT-bearer issuer persistence.

use anyhow::Result;
use rusqlite::{Row, params};

use crate::server::persist::models::{TrustGrantRecord, fmt_ts};
use crate::server::persist::{Store, to_json_array};

const GRANT_COLUMNS: &str =
    "id, issuer, subject, allow_any_subject, scope, key_set, key_id, created_at, expires_at";

type GrantRow = (
    String,
    String,
    String,
    i64,
    String,
    String,
    String,
    String,
    String,
);

fn grant_from_row(row: &Row<'_>) -> rusqlite::Result<GrantRow> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
        row.get(6)?,
        row.get(7)?,
        row.get(8)?,
    ))
}

fn build(row: GrantRow) -> Result<TrustGrantRecord> {
    let (id, issuer, subject, allow_any_subject, scope, key_set, key_id, created_at, expires_at) =
        row;
    TrustGrantRecord::from_db_row(
        id,
        issuer,
        subject,
        allow_any_subject,
        scope,
        key_set,
        key_id,
        created_at,
        expires_at,
    )
}

impl Store {
    pub async fn create_trust_grant(&self, grant: TrustGrantRecord) -> Result<()> {
        self.with_conn(move |conn, nid| {
            conn.execute(
                "INSERT INTO trusted_jwt_bearer_issuers \
                 (id, nid, issuer, subject, allow_any_subject, scope, key_set, key_id, \
                  created_at, expires_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                params![
                    grant.id,
                    nid,
                    grant.issuer,
                    grant.subject,
                    grant.allow_any_subject as i64,
                    to_json_array(&grant.scope),
                    grant.key_set,
                    grant.key_id,
                    fmt_ts(grant.created_at),
                    fmt_ts(grant.expires_at),
                ],
            )?;
            Ok(())
        })
        .await
    }

    pub async fn get_trust_grant(&self, id: &str) -> Result<Option<TrustGrantRecord>> {
        let id = id.to_string();
        self.with_conn(move |conn, nid| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {GRANT_COLUMNS} FROM trusted_jwt_bearer_issuers WHERE nid = ?1 AND id = ?2"
            ))?;
            let row = match stmt.query_row(params![nid, id], grant_from_row) {
                Ok(r) => Some(r),
                Err(rusqlite::Error::QueryReturnedNoRows) => None,
                Err(e) => return Err(e.into()),
            };
            row.map(build).transpose()
        })
        .await
    }

    pub async fn list_trust_grants(&self, issuer: Option<String>) -> Result<Vec<TrustGrantRecord>> {
        self.with_conn(move |conn, nid| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {GRANT_COLUMNS} FROM trusted_jwt_bearer_issuers \
                 WHERE nid = ?1 AND (?2 IS NULL OR issuer = ?2) ORDER BY created_at ASC"
            ))?;
            let mut rows = stmt.query(params![nid, issuer])?;
            let mut out = Vec::new();
            while let Some(row) = rows.next()? {
                out.push(build(grant_from_row(row)?)?);
            }
            Ok(out)
        })
        .await
    }

    pub async fn delete_trust_grant(&self, id: &str) -> Result<bool> {
        let id = id.to_string();
        self.with_conn(move |conn, nid| {
            let n = conn.execute(
                "DELETE FROM trusted_jwt_bearer_issuers WHERE nid = ?1 AND id = ?2",
                params![nid, id],
            )?;
            Ok(n > 0)
        })
        .await
    }

    /// Resolves the grant a presented assertion must match: exact
    /// (issuer, subject, kid) first, then an any-subject grant for
    /// (issuer, kid). Expired grants never match.
    pub async fn find_trust_grant(
        &self,
        issuer: &str,
        subject: &str,
        kid: &str,
    ) -> Result<Option<TrustGrantRecord>> {
        let issuer = issuer.to_string();
        let subject = subject.to_string();
        let kid = kid.to_string();
        self.with_conn(move |conn, nid| {
            let now = fmt_ts(chrono::Utc::now());
            let mut stmt = conn.prepare(&format!(
                "SELECT {GRANT_COLUMNS} FROM trusted_jwt_bearer_issuers \
                 WHERE nid = ?1 AND issuer = ?2 AND key_id = ?3 AND expires_at > ?4 \
                 AND (allow_any_subject = 1 OR subject = ?5) \
                 ORDER BY allow_any_subject ASC LIMIT 1"
            ))?;
            let row = match stmt.query_row(params![nid, issuer, kid, now, subject], grant_from_row)
            {
                Ok(r) => Some(r),
                Err(rusqlite::Error::QueryReturnedNoRows) => None,
                Err(e) => return Err(e.into()),
            };
            row.map(build).transpose()
        })
        .await
    }
}
