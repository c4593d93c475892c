//! JSON Web Key persistence.

use anyhow::Result;
use rusqlite::{Connection, Row, params};

use crate::server::persist::models::{KeyRecord, fmt_ts};
use crate::server::persist::Store;

fn key_from_row(row: &Row<'_>) -> rusqlite::Result<(String, String, String, String, String, Option<String>, String)> {
    Ok((
        row.get(0)?, // set_id
        row.get(1)?, // kid
        row.get(2)?, // alg
        row.get(3)?, // key_use
        row.get(4)?, // public_jwk
        row.get(5)?, // private_pem
        row.get(6)?, // created_at
    ))
}

const KEY_COLUMNS: &str = "set_id, kid, alg, key_use, public_jwk, private_pem, created_at";

/// Fetches all keys of a set, newest first, inside an existing connection.
pub(crate) fn get_key_set_rows(conn: &Connection, nid: &str, set_id: &str) -> Result<Vec<KeyRecord>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {KEY_COLUMNS} FROM jwks WHERE nid = ?1 AND set_id = ?2 ORDER BY created_at DESC"
    ))?;
    let mut rows = stmt.query(params![nid, set_id])?;
    let mut out = Vec::new();
    while let Some(row) = rows.next()? {
        let (set_id, kid, alg, key_use, public_jwk, private_pem, created_at) = key_from_row(row)?;
        out.push(KeyRecord::from_db_row(
            set_id, kid, alg, key_use, public_jwk, private_pem, created_at,
        )?);
    }
    Ok(out)
}

pub(crate) fn upsert_key_row(conn: &Connection, nid: &str, key: &KeyRecord) -> Result<()> {
    conn.execute(
        "INSERT INTO jwks (nid, set_id, kid, alg, key_use, public_jwk, private_pem, created_at) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8) \
         ON CONFLICT (nid, set_id, kid) DO UPDATE SET \
            alg = excluded.alg, \
            key_use = excluded.key_use, \
            public_jwk = excluded.public_jwk, \
            private_pem = excluded.private_pem",
        params![
            nid,
            key.set_id,
            key.kid,
            key.alg,
            key.key_use,
            key.public_jwk.to_string(),
            key.private_pem,
            fmt_ts(key.created_at),
        ],
    )?;
    Ok(())
}

impl Store {
    pub async fn add_key(&self, key: KeyRecord) -> Result<()> {
        self.with_conn(move |conn, nid| upsert_key_row(conn, nid, &key)).await
    }

    pub async fn get_key_set(&self, set_id: &str) -> Result<Vec<KeyRecord>> {
        let set_id = set_id.to_string();
        self.with_conn(move |conn, nid| get_key_set_rows(conn, nid, &set_id))
            .await
    }

    pub async fn get_key(&self, set_id: &str, kid: &str) -> Result<Option<KeyRecord>> {
        let set_id = set_id.to_string();
        let kid = kid.to_string();
        self.with_conn(move |conn, nid| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {KEY_COLUMNS} FROM jwks WHERE nid = ?1 AND set_id = ?2 AND kid = ?3"
            ))?;
            let row = match stmt.query_row(params![nid, set_id, kid], key_from_row) {
                Ok(r) => Some(r),
                Err(rusqlite::Error::QueryReturnedNoRows) => None,
                Err(e) => return Err(e.into()),
            };
            row.map(|(set_id, kid, alg, key_use, public_jwk, private_pem, created_at)| {
                KeyRecord::from_db_row(set_id, kid, alg, key_use, public_jwk, private_pem, created_at)
            })
            .transpose()
        })
        .await
    }

    pub async fn delete_key(&self, set_id: &str, kid: &str) -> Result<bool> {
        let set_id = set_id.to_string();
        let kid = kid.to_string();
        self.with_conn(move |conn, nid| {
            let n = conn.execute(
                "DELETE FROM jwks WHERE nid = ?1 AND set_id = ?2 AND kid = ?3",
                params![nid, set_id, kid],
            )?;
            Ok(n > 0)
        })
        .await
    }

    pub async fn delete_key_set(&self, set_id: &str) -> Result<bool> {
        let set_id = set_id.to_string();
        self.with_conn(move |conn, nid| {
            let n = conn.execute(
                "DELETE FROM jwks WHERE nid = ?1 AND set_id = ?2",
                params![nid, set_id],
            )?;
            Ok(n > 0)
        })
        .await
    }
}
