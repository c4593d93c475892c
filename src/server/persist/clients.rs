//! Client table persistence.

use anyhow::{Context, Result};
use rusqlite::{Connection, Row, params};

use crate::server::clients::{Client, Lifespans};
use crate::server::persist::models::{fmt_ts, opt_ts};
use crate::server::persist::{Store, from_json_array, to_json_array};

const CLIENT_COLUMNS: &str = "id, client_id, client_name, secret_signature, redirect_uris, \
    grant_types, response_types, scope, audience, owner, token_endpoint_auth_method, \
    token_endpoint_auth_signing_alg, jwks, jwks_uri, subject_type, sector_identifier_uri, \
    post_logout_redirect_uris, frontchannel_logout_uri, frontchannel_logout_session_required, \
    backchannel_logout_uri, backchannel_logout_session_required, allowed_cors_origins, \
    request_uris, userinfo_signed_response_alg, metadata, lifespans, \
    registration_access_token_signature, created_at, updated_at";

/// Raw column values; JSON parsing happens in `into_client` so the rusqlite
/// row closure stays infallible beyond column access.
struct ClientRow {
    id: String,
    client_id: String,
    client_name: String,
    secret_signature: Option<String>,
    redirect_uris: String,
    grant_types: String,
    response_types: String,
    scope: String,
    audience: String,
    owner: String,
    token_endpoint_auth_method: String,
    token_endpoint_auth_signing_alg: Option<String>,
    jwks: Option<String>,
    jwks_uri: Option<String>,
    subject_type: String,
    sector_identifier_uri: Option<String>,
    post_logout_redirect_uris: String,
    frontchannel_logout_uri: Option<String>,
    frontchannel_logout_session_required: i64,
    backchannel_logout_uri: Option<String>,
    backchannel_logout_session_required: i64,
    allowed_cors_origins: String,
    request_uris: String,
    userinfo_signed_response_alg: String,
    metadata: String,
    lifespans: String,
    registration_access_token_signature: Option<String>,
    created_at: String,
    updated_at: String,
}

impl ClientRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            client_id: row.get(1)?,
            client_name: row.get(2)?,
            secret_signature: row.get(3)?,
            redirect_uris: row.get(4)?,
            grant_types: row.get(5)?,
            response_types: row.get(6)?,
            scope: row.get(7)?,
            audience: row.get(8)?,
            owner: row.get(9)?,
            token_endpoint_auth_method: row.get(10)?,
            token_endpoint_auth_signing_alg: row.get(11)?,
            jwks: row.get(12)?,
            jwks_uri: row.get(13)?,
            subject_type: row.get(14)?,
            sector_identifier_uri: row.get(15)?,
            post_logout_redirect_uris: row.get(16)?,
            frontchannel_logout_uri: row.get(17)?,
            frontchannel_logout_session_required: row.get(18)?,
            backchannel_logout_uri: row.get(19)?,
            backchannel_logout_session_required: row.get(20)?,
            allowed_cors_origins: row.get(21)?,
            request_uris: row.get(22)?,
            userinfo_signed_response_alg: row.get(23)?,
            metadata: row.get(24)?,
            lifespans: row.get(25)?,
            registration_access_token_signature: row.get(26)?,
            created_at: row.get(27)?,
            updated_at: row.get(28)?,
        })
    }

    fn into_client(self) -> Result<Client> {
        Ok(Client {
            id: self.id,
            client_id: self.client_id,
            client_name: self.client_name,
            client_secret: None,
            redirect_uris: from_json_array(&self.redirect_uris),
            grant_types: from_json_array(&self.grant_types),
            response_types: from_json_array(&self.response_types),
            scope: self.scope,
            audience: from_json_array(&self.audience),
            owner: self.owner,
            token_endpoint_auth_method: self.token_endpoint_auth_method,
            token_endpoint_auth_signing_alg: self.token_endpoint_auth_signing_alg,
            jwks: self
                .jwks
                .map(|raw| serde_json::from_str(&raw).context("parsing jwks"))
                .transpose()?,
            jwks_uri: self.jwks_uri,
            subject_type: self.subject_type,
            sector_identifier_uri: self.sector_identifier_uri,
            post_logout_redirect_uris: from_json_array(&self.post_logout_redirect_uris),
            frontchannel_logout_uri: self.frontchannel_logout_uri,
            frontchannel_logout_session_required: self.frontchannel_logout_session_required != 0,
            backchannel_logout_uri: self.backchannel_logout_uri,
            backchannel_logout_session_required: self.backchannel_logout_session_required != 0,
            allowed_cors_origins: from_json_array(&self.allowed_cors_origins),
            request_uris: from_json_array(&self.request_uris),
            userinfo_signed_response_alg: self.userinfo_signed_response_alg,
            metadata: serde_json::from_str(&self.metadata).context("parsing metadata")?,
            lifespans: serde_json::from_str(&self.lifespans).context("parsing lifespans")?,
            created_at: opt_ts(Some(self.created_at))?,
            updated_at: opt_ts(Some(self.updated_at))?,
            secret_signature: self.secret_signature,
            registration_access_token_signature: self.registration_access_token_signature,
        })
    }
}

/// Fetches a client by public id inside an existing connection/transaction.
pub(crate) fn get_client_row(
    conn: &Connection,
    nid: &str,
    client_id: &str,
) -> Result<Option<Client>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {CLIENT_COLUMNS} FROM clients WHERE nid = ?1 AND client_id = ?2"
    ))?;
    let row = match stmt.query_row(params![nid, client_id], ClientRow::from_row) {
        Ok(r) => Some(r),
        Err(rusqlite::Error::QueryReturnedNoRows) => None,
        Err(e) => return Err(e.into()),
    };
    row.map(|r| r.into_client()).transpose()
}

fn insert_client(conn: &Connection, nid: &str, c: &Client) -> Result<()> {
    let now = fmt_ts(chrono::Utc::now());
    conn.execute(
        "INSERT INTO clients (id, nid, client_id, client_name, secret_signature, redirect_uris, \
         grant_types, response_types, scope, audience, owner, token_endpoint_auth_method, \
         token_endpoint_auth_signing_alg, jwks, jwks_uri, subject_type, sector_identifier_uri, \
         post_logout_redirect_uris, frontchannel_logout_uri, frontchannel_logout_session_required, \
         backchannel_logout_uri, backchannel_logout_session_required, allowed_cors_origins, \
         request_uris, userinfo_signed_response_alg, metadata, lifespans, \
         registration_access_token_signature, created_at, updated_at) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, \
         ?18, ?19, ?20, ?21, ?22, ?23, ?24, ?25, ?26, ?27, ?28, ?29, ?30)",
        params![
            c.id,
            nid,
            c.client_id,
            c.client_name,
            c.secret_signature,
            to_json_array(&c.redirect_uris),
            to_json_array(&c.grant_types),
            to_json_array(&c.response_types),
            c.scope,
            to_json_array(&c.audience),
            c.owner,
            c.token_endpoint_auth_method,
            c.token_endpoint_auth_signing_alg,
            c.jwks.as_ref().map(|j| j.to_string()),
            c.jwks_uri,
            c.subject_type,
            c.sector_identifier_uri,
            to_json_array(&c.post_logout_redirect_uris),
            c.frontchannel_logout_uri,
            c.frontchannel_logout_session_required as i64,
            c.backchannel_logout_uri,
            c.backchannel_logout_session_required as i64,
            to_json_array(&c.allowed_cors_origins),
            to_json_array(&c.request_uris),
            c.userinfo_signed_response_alg,
            c.metadata.to_string(),
            serde_json::to_string(&c.lifespans)?,
            c.registration_access_token_signature,
            now,
            now,
        ],
    )?;
    Ok(())
}

impl Store {
    pub async fn create_client(&self, client: Client) -> Result<Client> {
        self.with_conn(move |conn, nid| {
            insert_client(conn, nid, &client)?;
            Ok(client)
        })
        .await
    }

    pub async fn get_client(&self, client_id: &str) -> Result<Option<Client>> {
        let client_id = client_id.to_string();
        self.with_conn(move |conn, nid| get_client_row(conn, nid, &client_id))
            .await
    }

    pub async fn list_clients(
        &self,
        name: Option<String>,
        owner: Option<String>,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<Client>> {
        self.with_conn(move |conn, nid| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {CLIENT_COLUMNS} FROM clients WHERE nid = ?1 \
                 AND (?2 IS NULL OR client_name = ?2) AND (?3 IS NULL OR owner = ?3) \
                 ORDER BY created_at ASC LIMIT ?4 OFFSET ?5"
            ))?;
            let mut rows = stmt.query(params![nid, name, owner, limit, offset])?;
            let mut out = Vec::new();
            while let Some(row) = rows.next()? {
                out.push(ClientRow::from_row(row)?.into_client()?);
            }
            Ok(out)
        })
        .await
    }

    /// Replaces every mutable column of the client identified by its
    /// surrogate id. Returns false when the client does not exist.
    pub async fn update_client(&self, c: Client) -> Result<bool> {
        self.with_conn(move |conn, nid| {
            let n = conn.execute(
                "UPDATE clients SET client_id = ?3, client_name = ?4, \
                 secret_signature = COALESCE(?5, secret_signature), redirect_uris = ?6, \
                 grant_types = ?7, response_types = ?8, scope = ?9, audience = ?10, owner = ?11, \
                 token_endpoint_auth_method = ?12, token_endpoint_auth_signing_alg = ?13, \
                 jwks = ?14, jwks_uri = ?15, subject_type = ?16, sector_identifier_uri = ?17, \
                 post_logout_redirect_uris = ?18, frontchannel_logout_uri = ?19, \
                 frontchannel_logout_session_required = ?20, backchannel_logout_uri = ?21, \
                 backchannel_logout_session_required = ?22, allowed_cors_origins = ?23, \
                 request_uris = ?24, userinfo_signed_response_alg = ?25, metadata = ?26, \
                 lifespans = ?27, \
                 registration_access_token_signature = COALESCE(?28, registration_access_token_signature), \
                 updated_at = ?29 \
                 WHERE nid = ?1 AND id = ?2",
                params![
                    nid,
                    c.id,
                    c.client_id,
                    c.client_name,
                    c.secret_signature,
                    to_json_array(&c.redirect_uris),
                    to_json_array(&c.grant_types),
                    to_json_array(&c.response_types),
                    c.scope,
                    to_json_array(&c.audience),
                    c.owner,
                    c.token_endpoint_auth_method,
                    c.token_endpoint_auth_signing_alg,
                    c.jwks.as_ref().map(|j| j.to_string()),
                    c.jwks_uri,
                    c.subject_type,
                    c.sector_identifier_uri,
                    to_json_array(&c.post_logout_redirect_uris),
                    c.frontchannel_logout_uri,
                    c.frontchannel_logout_session_required as i64,
                    c.backchannel_logout_uri,
                    c.backchannel_logout_session_required as i64,
                    to_json_array(&c.allowed_cors_origins),
                    to_json_array(&c.request_uris),
                    c.userinfo_signed_response_alg,
                    c.metadata.to_string(),
                    serde_json::to_string(&c.lifespans)?,
                    c.registration_access_token_signature,
                    fmt_ts(chrono::Utc::now()),
                ],
            )?;
            Ok(n > 0)
        })
        .await
    }

    pub async fn delete_client(&self, client_id: &str) -> Result<bool> {
        let client_id = client_id.to_string();
        self.with_conn(move |conn, nid| {
            let n = conn.execute(
                "DELETE FROM clients WHERE nid = ?1 AND client_id = ?2",
                params![nid, client_id],
            )?;
            Ok(n > 0)
        })
        .await
    }

    pub async fn set_client_lifespans(
        &self,
        client_id: &str,
        lifespans: Lifespans,
    ) -> Result<bool> {
        let client_id = client_id.to_string();
        self.with_conn(move |conn, nid| {
            let n = conn.execute(
                "UPDATE clients SET lifespans = ?3, updated_at = ?4 \
                 WHERE nid = ?1 AND client_id = ?2",
                params![
                    nid,
                    client_id,
                    serde_json::to_string(&lifespans)?,
                    fmt_ts(chrono::Utc::now()),
                ],
            )?;
            Ok(n > 0)
        })
        .await
    }
}
