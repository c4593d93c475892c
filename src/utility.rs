//! Shared helpers: secret generation, hashing and secure file permissions.
//!
//! The random and hash helpers back every credential the server mints
//! (challenges, verifiers, client secrets, opaque tokens). The filesystem
//! helpers restrict the SQLite database to the current user; on non-Unix
//! platforms they degrade to a no-op.

use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use rand::RngCore;
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

use anyhow::{Context, Result};
use std::path::Path;

#[cfg(unix)]
use std::{fs, os::unix::fs::PermissionsExt};

/// Generates a URL-safe random string from `bytes` random bytes.
///
/// Uses cryptographically secure random bytes and base64url encoding.
pub fn random_urlsafe(bytes: usize) -> String {
    let mut buf = vec![0u8; bytes];
    rand::thread_rng().fill_bytes(&mut buf);
    URL_SAFE_NO_PAD.encode(buf)
}

/// Generates a client secret: 26 random bytes, URL-safe encoded.
pub fn random_client_secret() -> String {
    random_urlsafe(26)
}

/// Constant-time equality for credential material.
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    a.ct_eq(b).into()
}

/// OIDC `at_hash` / `c_hash`: base64url of the left-most half of the
/// SHA-256 digest of the token's ASCII form.
pub fn half_hash(token: &str) -> String {
    let digest = Sha256::digest(token.as_bytes());
    URL_SAFE_NO_PAD.encode(&digest[..digest.len() / 2])
}

/// Pairwise subject obfuscation: hex(SHA-256(sector || subject || salt)).
pub fn obfuscate_subject(sector: &str, subject: &str, salt: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(sector.as_bytes());
    hasher.update(subject.as_bytes());
    hasher.update(salt.as_bytes());
    hex::encode(hasher.finalize())
}

/// Ensure the directory at `dir_path` is accessible only by the current user.
///
/// On Unix this sets the mode to 0o700 (rwx------); elsewhere it is a no-op.
pub fn set_secure_dir_permissions(dir_path: &Path) -> Result<()> {
    if !dir_path.exists() {
        return Err(anyhow::anyhow!(
            "directory does not exist: {}",
            dir_path.display()
        ));
    }

    #[cfg(unix)]
    {
        let metadata = fs::metadata(dir_path)
            .with_context(|| format!("reading metadata for {}", dir_path.display()))?;
        let mut permissions = metadata.permissions();
        permissions.set_mode(0o700);
        fs::set_permissions(dir_path, permissions)
            .with_context(|| format!("setting unix permissions on {}", dir_path.display()))?;
    }

    #[cfg(not(unix))]
    tracing::debug!(
        "Skipping permission hardening on non-unix platform for {}",
        dir_path.display()
    );

    Ok(())
}

/// Ensure the file at `file_path` is readable and writable only by the
/// current user. On Unix this sets the mode to 0o600 (rw-------).
pub fn set_secure_file_permissions(file_path: &Path) -> Result<()> {
    if !file_path.exists() {
        return Err(anyhow::anyhow!(
            "file does not exist: {}",
            file_path.display()
        ));
    }

    #[cfg(unix)]
    {
        let metadata = fs::metadata(file_path)
            .with_context(|| format!("reading metadata for {}", file_path.display()))?;
        let mut permissions = metadata.permissions();
        permissions.set_mode(0o600);
        fs::set_permissions(file_path, permissions)
            .with_context(|| format!("setting unix permissions on {}", file_path.display()))?;
    }

    #[cfg(not(unix))]
    tracing::debug!(
        "Skipping permission hardening on non-unix platform for {}",
        file_path.display()
    );

    Ok(())
}
