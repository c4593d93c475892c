//! Signing key management.
//!
//! Key sets are named collections of JSON Web Keys. The OpenID set signs ID
//! tokens and Logout Tokens, the access-token set signs JWT access tokens
//! when that strategy is active, and per-issuer sets verify JWT-bearer
//! assertions. Generation is serialized per set by an in-memory lock table so
//! concurrent cold starts cannot generate a set twice. JWKS exports publish
//! public components only.

use anyhow::{Context, Result, bail};
use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use chrono::Utc;
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header};
use rsa::RsaPrivateKey;
use rsa::pkcs8::EncodePrivateKey;
use rsa::traits::PublicKeyParts;
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::server::persist::{KeyRecord, Store};

/// Key set signing ID tokens and back-channel Logout Tokens.
pub const OPENID_KEY_SET: &str = "gatehouse.openid.id-token";
/// Key set signing JWT access tokens.
pub const ACCESS_TOKEN_KEY_SET: &str = "gatehouse.jwt.access-token";

const RSA_KEY_BITS: usize = 2048;

/// A ready-to-use signing key: kid goes into the header, the encoding key
/// does the work.
#[derive(Clone)]
pub struct KeySigner {
    pub kid: String,
    pub alg: Algorithm,
    key: EncodingKey,
}

impl KeySigner {
    pub fn sign(&self, claims: &serde_json::Value) -> Result<String> {
        let mut header = Header::new(self.alg);
        header.kid = Some(self.kid.clone());
        jsonwebtoken::encode(&header, claims, &self.key).context("failed to encode jwt")
    }
}

/// Manages key sets in the store with per-set generation locks.
pub struct KeyManager {
    store: Store,
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl KeyManager {
    pub fn new(store: Store) -> Self {
        Self {
            store,
            locks: Mutex::new(HashMap::new()),
        }
    }

    async fn set_lock(&self, set_id: &str) -> Arc<Mutex<()>> {
        let mut table = self.locks.lock().await;
        table
            .entry(set_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Returns the newest private key of the set matching `alg`, generating
    /// the set first when it does not exist. Serialized per set.
    pub async fn ensure_exists(&self, set_id: &str, alg: &str) -> Result<KeyRecord> {
        let lock = self.set_lock(set_id).await;
        let _guard = lock.lock().await;

        let keys = self.store.get_key_set(set_id).await?;
        if let Some(key) = newest_private(&keys, alg) {
            return Ok(key.clone());
        }

        tracing::warn!(set = %set_id, "JSON Web Key Set does not exist yet, generating new key pair...");
        self.generate_and_persist(set_id, &uuid::Uuid::new_v4().to_string(), alg, "sig")
            .await
    }

    /// Generates an RSA keypair and appends it to the set. Rotation is this
    /// same call with a fresh kid: the newest private key wins, old keys stay
    /// available for verification.
    pub async fn generate_and_persist(
        &self,
        set_id: &str,
        kid: &str,
        alg: &str,
        key_use: &str,
    ) -> Result<KeyRecord> {
        match alg {
            "RS256" | "RS384" | "RS512" => {}
            other => bail!("unsupported algorithm for key generation: {other}"),
        }

        let set_id = set_id.to_string();
        let kid = kid.to_string();
        let alg = alg.to_string();
        let key_use = key_use.to_string();

        // Keypair generation is CPU-bound; keep it off the async threads.
        let record = tokio::task::spawn_blocking(move || -> Result<KeyRecord> {
            let private = RsaPrivateKey::new(&mut rand::thread_rng(), RSA_KEY_BITS)
                .context("generating rsa keypair")?;
            let pem = private
                .to_pkcs8_pem(rsa::pkcs8::LineEnding::LF)
                .context("encoding private key as pkcs8 pem")?
                .to_string();

            let n = URL_SAFE_NO_PAD.encode(private.n().to_bytes_be());
            let e = URL_SAFE_NO_PAD.encode(private.e().to_bytes_be());
            let public_jwk = serde_json::json!({
                "kty": "RSA",
                "use": key_use,
                "alg": alg,
                "kid": kid,
                "n": n,
                "e": e,
            });

            Ok(KeyRecord {
                set_id,
                kid,
                alg,
                key_use,
                public_jwk,
                private_pem: Some(pem),
                created_at: Utc::now(),
            })
        })
        .await??;

        self.store.add_key(record.clone()).await?;
        tracing::info!(set = %record.set_id, kid = %record.kid, alg = %record.alg, "Generated signing key");
        Ok(record)
    }

    /// A signer over the newest private key of the set matching `alg`.
    pub async fn signer(&self, set_id: &str, alg: &str) -> Result<KeySigner> {
        let record = self.ensure_exists(set_id, alg).await?;
        signer_from_record(&record)
    }

    /// Upserts externally supplied keys (admin API, trust grants). Keys are
    /// stored as given; private material in the JWK is rejected.
    pub async fn import_public_key(
        &self,
        set_id: &str,
        jwk: serde_json::Value,
    ) -> Result<KeyRecord> {
        let kid = jwk
            .get("kid")
            .and_then(|v| v.as_str())
            .context("jwk is missing 'kid'")?
            .to_string();
        if jwk.get("d").is_some() {
            bail!("refusing to import private key material");
        }
        let record = KeyRecord {
            set_id: set_id.to_string(),
            kid,
            alg: jwk
                .get("alg")
                .and_then(|v| v.as_str())
                .unwrap_or("RS256")
                .to_string(),
            key_use: jwk
                .get("use")
                .and_then(|v| v.as_str())
                .unwrap_or("sig")
                .to_string(),
            public_jwk: jwk,
            private_pem: None,
            created_at: Utc::now(),
        };
        self.store.add_key(record.clone()).await?;
        Ok(record)
    }

    /// A verification key for (set, kid), built from the stored public JWK.
    pub async fn decoding_key(&self, set_id: &str, kid: &str) -> Result<(DecodingKey, Algorithm)> {
        let record = self
            .store
            .get_key(set_id, kid)
            .await?
            .with_context(|| format!("key {kid} not found in set {set_id}"))?;
        decoding_key_from_record(&record)
    }

    /// The public JWKS document for a set: public components only, private
    /// and opaque material filtered out.
    pub async fn public_jwks(&self, set_id: &str) -> Result<serde_json::Value> {
        let keys = self.store.get_key_set(set_id).await?;
        Ok(export_public(&keys))
    }
}

/// Newest private key of a set whose algorithm matches.
pub fn newest_private<'a>(keys: &'a [KeyRecord], alg: &str) -> Option<&'a KeyRecord> {
    keys.iter()
        .filter(|k| k.is_private() && k.alg == alg)
        .max_by_key(|k| k.created_at)
}

pub fn signer_from_record(record: &KeyRecord) -> Result<KeySigner> {
    let pem = record
        .private_pem
        .as_deref()
        .context("key has no private component")?;
    Ok(KeySigner {
        kid: record.kid.clone(),
        alg: Algorithm::from_str(&record.alg)
            .map_err(|_| anyhow::anyhow!("unknown algorithm {}", record.alg))?,
        key: EncodingKey::from_rsa_pem(pem.as_bytes())
            .context("building encoding key from stored pem")?,
    })
}

pub fn decoding_key_from_record(record: &KeyRecord) -> Result<(DecodingKey, Algorithm)> {
    let jwk: jsonwebtoken::jwk::Jwk =
        serde_json::from_value(record.public_jwk.clone()).context("parsing stored jwk")?;
    let key = DecodingKey::from_jwk(&jwk).context("building decoding key from jwk")?;
    let alg = Algorithm::from_str(&record.alg)
        .map_err(|_| anyhow::anyhow!("unknown algorithm {}", record.alg))?;
    Ok((key, alg))
}

fn export_public(keys: &[KeyRecord]) -> serde_json::Value {
    let exported: Vec<&serde_json::Value> = keys.iter().map(|k| &k.public_jwk).collect();
    serde_json::json!({ "keys": exported })
}
