//! Opaque credential strategy.
//!
//! Authorization codes, opaque access tokens, refresh tokens and registration
//! access tokens all share one shape: `<secret>.<signature>` where the secret
//! is 32 random bytes (base64url) and the signature is the HMAC-SHA512/256
//! over the secret part. Only the signature is ever persisted; presenting the
//! credential proves knowledge of the secret. Access and refresh tokens are
//! prefixed on the wire so they can be told apart in logs and hints.

use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use hmac::{Hmac, Mac};
use sha2::Sha512_256;

use crate::errors::OAuthError;
use crate::utility::{constant_time_eq, random_urlsafe};

pub const ACCESS_TOKEN_PREFIX: &str = "ory_at_";
pub const REFRESH_TOKEN_PREFIX: &str = "ory_rt_";

type HmacSha512_256 = Hmac<Sha512_256>;

/// HMAC strategy over the configured system secrets. The first secret signs
/// new credentials; older secrets still verify, which is how rotation works.
#[derive(Clone)]
pub struct TokenStrategy {
    secrets: Vec<Vec<u8>>,
}

impl TokenStrategy {
    pub fn new(secrets: &[String]) -> Self {
        Self {
            secrets: secrets.iter().map(|s| s.as_bytes().to_vec()).collect(),
        }
    }

    fn mac(&self, key: &[u8], data: &str) -> String {
        // Key length is unrestricted for HMAC; no need to pre-hash.
        let mut mac = HmacSha512_256::new_from_slice(key).expect("hmac accepts any key length");
        mac.update(data.as_bytes());
        URL_SAFE_NO_PAD.encode(mac.finalize().into_bytes())
    }

    /// Mints a fresh credential, returning `(token, signature)` where the
    /// token is the full `<secret>.<signature>` form.
    pub fn generate(&self) -> (String, String) {
        let secret = random_urlsafe(32);
        let signature = self.mac(&self.secrets[0], &secret);
        (format!("{secret}.{signature}"), signature)
    }

    /// Validates a presented `<secret>.<signature>` credential and returns
    /// its signature for storage lookup. Every comparison is constant-time.
    pub fn validate(&self, token: &str) -> Result<String, OAuthError> {
        let (secret, signature) = token.split_once('.').ok_or_else(|| {
            OAuthError::invalid_grant("The provided token is malformed.")
        })?;
        if secret.is_empty() || signature.is_empty() {
            return Err(OAuthError::invalid_grant("The provided token is malformed."));
        }
        for key in &self.secrets {
            let expected = self.mac(key, secret);
            if constant_time_eq(expected.as_bytes(), signature.as_bytes()) {
                return Ok(signature.to_string());
            }
        }
        Err(OAuthError::invalid_grant(
            "The provided token is invalid or has been tampered with.",
        ))
    }

    /// The signature part of a token without validating it. Used where the
    /// token was minted locally a moment ago.
    pub fn signature(token: &str) -> &str {
        token.rsplit_once('.').map(|(_, s)| s).unwrap_or("")
    }

    pub fn new_access_token(&self) -> (String, String) {
        let (token, sig) = self.generate();
        (format!("{ACCESS_TOKEN_PREFIX}{token}"), sig)
    }

    pub fn new_refresh_token(&self) -> (String, String) {
        let (token, sig) = self.generate();
        (format!("{REFRESH_TOKEN_PREFIX}{token}"), sig)
    }

    pub fn new_authorize_code(&self) -> (String, String) {
        self.generate()
    }

    /// Registration access tokens share the access-token wire form.
    pub fn new_registration_token(&self) -> (String, String) {
        self.new_access_token()
    }

    /// Validates an `ory_at_` access token and returns its signature.
    pub fn access_token_signature(&self, token: &str) -> Result<String, OAuthError> {
        self.validate(token.strip_prefix(ACCESS_TOKEN_PREFIX).unwrap_or(token))
    }

    /// Validates an `ory_rt_` refresh token and returns its signature.
    pub fn refresh_token_signature(&self, token: &str) -> Result<String, OAuthError> {
        self.validate(token.strip_prefix(REFRESH_TOKEN_PREFIX).unwrap_or(token))
    }

    pub fn authorize_code_signature(&self, code: &str) -> Result<String, OAuthError> {
        self.validate(code)
    }

    /// HMAC signature of a client secret for storage. Plaintext secrets are
    /// never persisted.
    pub fn obfuscate_secret(&self, secret: &str) -> String {
        self.mac(&self.secrets[0], secret)
    }

    /// Constant-time check of a presented client secret against its stored
    /// signature, under every known system secret.
    pub fn check_secret(&self, presented: &str, stored_signature: &str) -> bool {
        self.secrets.iter().any(|key| {
            constant_time_eq(
                self.mac(key, presented).as_bytes(),
                stored_signature.as_bytes(),
            )
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strategy() -> TokenStrategy {
        TokenStrategy::new(&["this-is-the-primary-system-secret".to_string()])
    }

    #[test]
    fn minted_tokens_validate_and_round_trip_signatures() {
        let s = strategy();
        let (token, sig) = s.new_access_token();
        assert!(token.starts_with(ACCESS_TOKEN_PREFIX));
        assert_eq!(s.access_token_signature(&token).unwrap(), sig);
    }

    #[test]
    fn tampered_tokens_are_rejected() {
        let s = strategy();
        let (token, _) = s.new_refresh_token();
        let mut forged = token.clone();
        forged.pop();
        forged.push('x');
        assert!(s.refresh_token_signature(&forged).is_err());
        assert!(s.validate("no-dot-here").is_err());
    }

    #[test]
    fn rotated_secrets_still_verify_old_tokens() {
        let old = TokenStrategy::new(&["the-old-system-secret-still-works".to_string()]);
        let (token, sig) = old.new_access_token();

        let rotated = TokenStrategy::new(&[
            "the-new-system-secret-signs-now!".to_string(),
            "the-old-system-secret-still-works".to_string(),
        ]);
        assert_eq!(rotated.access_token_signature(&token).unwrap(), sig);
    }

    #[test]
    fn different_secrets_do_not_cross_validate() {
        let a = strategy();
        let b = TokenStrategy::new(&["a-completely-different-secret-set".to_string()]);
        let (token, _) = a.new_access_token();
        assert!(b.access_token_signature(&token).is_err());
    }
}
