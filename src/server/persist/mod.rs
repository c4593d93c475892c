//! Persistent storage for the authorization server.
//!
//! This module provides the SQLite-backed store for clients, key sets, the
//! login/consent/logout flow records and the token tables. All operations are
//! async-compatible using blocking task spawning; operations that must be
//! atomic across reads and writes (code consumption, refresh rotation,
//! cascade revocation, verifier consumption) run inside a single IMMEDIATE
//! transaction via [`Store::in_tx`].
//!
//! Every row carries a network id (`nid`) and every query is scoped by it so
//! multiple logical tenants can cohabit one schema.

use anyhow::{Context, Result, bail};
use refinery::embed_migrations;
use rusqlite::{Connection, TransactionBehavior, params};

// Embed compile-time migrations located under `migrations/sqlite/`.
embed_migrations!("migrations/sqlite");

use fs2::FileExt;
use std::fs::OpenOptions;
use std::time::{Duration, Instant};
use std::{
    fs,
    path::{Path, PathBuf},
};
use tokio::task;

use crate::utility::{set_secure_dir_permissions, set_secure_file_permissions};

pub mod clients;
pub mod flow;
pub mod keys;
pub mod models;
pub mod tokens;
pub mod trust;

pub use models::{KeyRecord, TokenRecord, TrustGrantRecord};

/// How often a transaction is retried when SQLite reports a lock conflict.
const TX_RETRY_ATTEMPTS: u32 = 3;

/// Opens a lock file with retry logic so concurrent cold starts serialize
/// their migration runs instead of tripping over each other.
fn open_lock_file_with_retry(lock_path: &Path, timeout: Duration) -> Result<std::fs::File> {
    use std::thread::sleep;

    let start = Instant::now();
    loop {
        match OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(lock_path)
        {
            Ok(f) => match f.try_lock_exclusive() {
                Ok(()) => return Ok(f),
                Err(_) => {
                    if start.elapsed() > timeout {
                        bail!(
                            "timeout acquiring migration lock {}: {}s",
                            lock_path.display(),
                            timeout.as_secs()
                        );
                    }
                    sleep(Duration::from_millis(100));
                }
            },
            Err(e) => {
                if start.elapsed() > timeout {
                    bail!(
                        "timeout opening migration lock file {}: {}",
                        lock_path.display(),
                        e
                    );
                }
                tracing::debug!(
                    "open migration lock {} failed (will retry): {}",
                    lock_path.display(),
                    e
                );
                sleep(Duration::from_millis(100));
            }
        }
    }
}

struct MigrationLockGuard(std::fs::File, PathBuf);

impl MigrationLockGuard {
    fn new(lock_path: &Path, timeout: Duration) -> Result<Self> {
        let file = open_lock_file_with_retry(lock_path, timeout)?;
        tracing::debug!("Acquired migration file lock for {}", lock_path.display());
        Ok(MigrationLockGuard(file, lock_path.to_path_buf()))
    }
}

impl Drop for MigrationLockGuard {
    fn drop(&mut self) {
        let _ = fs2::FileExt::unlock(&self.0);
        let _ = fs::remove_file(&self.1);
    }
}

/// Opens a SQLite connection with settings for a server workload: WAL for
/// concurrency, NORMAL sync, 5s busy timeout, foreign keys on.
fn open_db_connection(db_path: &Path) -> Result<Connection> {
    let conn = Connection::open(db_path)
        .with_context(|| format!("opening sqlite db at {}", db_path.display()))?;
    conn.pragma_update(None, "journal_mode", "WAL").ok();
    conn.pragma_update(None, "synchronous", "NORMAL").ok();
    conn.pragma_update(None, "busy_timeout", 5000i64).ok(); // 5s
    conn.pragma_update(None, "foreign_keys", "ON").ok();
    Ok(conn)
}

/// SQLite store handle. Cheap to clone; each operation opens its own
/// connection on a blocking thread.
#[derive(Clone, Debug)]
pub struct Store {
    db_path: PathBuf,
    nid: String,
}

impl Store {
    /// Opens (and if necessary creates) the database at `path`, applies
    /// embedded migrations under a cross-process lock, determines the network
    /// id, and hardens file permissions.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        tracing::debug!("Initializing store at path: {}", path.display());
        ensure_parent_dir(&path)?;

        {
            let _guard = MigrationLockGuard::new(
                &path.with_extension("migrate.lock"),
                Duration::from_secs(30),
            )?;
            let mut conn = open_db_connection(&path)?;
            migrations::runner()
                .run(&mut conn)
                .context("applying embedded migrations")?;
        }

        let nid = {
            let conn = open_db_connection(&path)?;
            determine_network(&conn)?
        };

        if path.exists() {
            set_secure_file_permissions(&path).with_context(|| {
                format!(
                    "setting secure permissions on database file {}",
                    path.display()
                )
            })?;
        }

        tracing::debug!(nid = %nid, "Store initialized at: {}", path.display());
        Ok(Self { db_path: path, nid })
    }

    /// The network id every row of this store is scoped to.
    pub fn nid(&self) -> &str {
        &self.nid
    }

    /// Runs `f` with a fresh connection on a blocking thread. For single
    /// statements; use [`Store::in_tx`] when reads and writes must be atomic.
    pub async fn with_conn<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection, &str) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let db_path = self.db_path.clone();
        let nid = self.nid.clone();
        task::spawn_blocking(move || {
            let conn = open_db_connection(&db_path)?;
            f(&conn, &nid)
        })
        .await?
    }

    /// Runs `f` inside one IMMEDIATE transaction. The closure sees every
    /// prior write of the transaction; returning an error rolls everything
    /// back. Lock conflicts retry the whole closure up to a small fixed
    /// bound, so `f` must be idempotent until commit.
    pub async fn in_tx<T, F>(&self, f: F) -> Result<T>
    where
        F: Fn(&rusqlite::Transaction<'_>, &str) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let db_path = self.db_path.clone();
        let nid = self.nid.clone();
        task::spawn_blocking(move || {
            let mut conn = open_db_connection(&db_path)?;
            let mut attempt = 0;
            loop {
                attempt += 1;
                // The caller controls the transaction boundary; a connection
                // that is already inside one is a programming error.
                if !conn.is_autocommit() {
                    bail!("there is already a transaction open on this connection");
                }
                let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
                match f(&tx, &nid).and_then(|out| {
                    tx.commit().context("committing transaction")?;
                    Ok(out)
                }) {
                    Ok(out) => return Ok(out),
                    Err(e) if is_busy(&e) && attempt < TX_RETRY_ATTEMPTS => {
                        tracing::debug!(attempt, "retrying transaction after lock conflict");
                        std::thread::sleep(Duration::from_millis(50 * attempt as u64));
                        continue;
                    }
                    Err(e) => return Err(e),
                }
            }
        })
        .await?
    }
}

/// True when the error chain bottoms out in a SQLite BUSY/LOCKED failure.
fn is_busy(err: &anyhow::Error) -> bool {
    err.chain().any(|cause| {
        matches!(
            cause.downcast_ref::<rusqlite::Error>(),
            Some(rusqlite::Error::SqliteFailure(e, _))
                if e.code == rusqlite::ErrorCode::DatabaseBusy
                    || e.code == rusqlite::ErrorCode::DatabaseLocked
        )
    })
}

/// Returns the installation's network id, creating the row on first start.
/// The oldest row wins so concurrent cold starts converge.
fn determine_network(conn: &Connection) -> Result<String> {
    let existing: Option<String> = match conn.query_row(
        "SELECT id FROM networks ORDER BY created_at ASC LIMIT 1",
        [],
        |row| row.get(0),
    ) {
        Ok(v) => Some(v),
        Err(rusqlite::Error::QueryReturnedNoRows) => None,
        Err(e) => return Err(e.into()),
    };
    if let Some(id) = existing {
        return Ok(id);
    }

    let id = uuid::Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO networks (id, created_at) VALUES (?1, ?2)",
        params![id, chrono::Utc::now().to_rfc3339()],
    )?;
    tracing::info!(nid = %id, "Created network");
    // Re-read in case another process raced us to the first insert.
    let winner: String = conn.query_row(
        "SELECT id FROM networks ORDER BY created_at ASC LIMIT 1",
        [],
        |row| row.get(0),
    )?;
    Ok(winner)
}

/// Ensures the parent directory of the given path exists with secure
/// permissions and is writable.
fn ensure_parent_dir(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        if parent.as_os_str().is_empty() {
            return Ok(());
        }
        fs::create_dir_all(parent)
            .with_context(|| format!("creating parent dir {}", parent.display()))?;

        if let Err(e) = set_secure_dir_permissions(parent) {
            bail!("setting secure permissions on {}: {}", parent.display(), e);
        }
    }
    Ok(())
}

// ---------------- Column helpers ----------------

pub(crate) fn to_json_array(items: &[String]) -> String {
    serde_json::to_string(items).unwrap_or_else(|_| "[]".to_string())
}

pub(crate) fn from_json_array(raw: &str) -> Vec<String> {
    serde_json::from_str(raw).unwrap_or_default()
}
