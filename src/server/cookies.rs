//! Signed browser cookies for the authorization flow.
//!
//! Three cookies exist: the login CSRF cookie, the consent CSRF cookie and
//! the authentication session cookie. Values are HMAC-signed with the cookie
//! secrets (first signs, rest verify). In development mode every name gets a
//! `_dev` suffix and the Secure attribute is dropped. When SameSite=None is
//! configured, each cookie is duplicated under a `_legacy` name without the
//! SameSite attribute for user agents that drop SameSite=None cookies.

use axum::http::{HeaderMap, HeaderValue, header};
use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::config::GatehouseConfig;
use crate::utility::constant_time_eq;

pub const LOGIN_CSRF_COOKIE: &str = "oauth2_authentication_csrf";
pub const CONSENT_CSRF_COOKIE: &str = "oauth2_consent_csrf";
pub const SESSION_COOKIE: &str = "oauth2_authentication_session";

const LEGACY_SUFFIX: &str = "_legacy";

type HmacSha256 = Hmac<Sha256>;

#[derive(Clone)]
pub struct Cookies {
    secrets: Vec<Vec<u8>>,
    dev: bool,
    same_site: String,
    domain: Option<String>,
}

impl Cookies {
    pub fn new(config: &GatehouseConfig) -> Self {
        Self {
            secrets: config
                .cookie_secrets()
                .iter()
                .map(|s| s.as_bytes().to_vec())
                .collect(),
            dev: config.dev,
            same_site: config.serve.cookies.same_site.clone(),
            domain: config.serve.cookies.domain.clone(),
        }
    }

    /// The effective cookie name: `_dev`-suffixed in development mode.
    pub fn name(&self, base: &str) -> String {
        if self.dev {
            format!("{base}_dev")
        } else {
            base.to_string()
        }
    }

    fn sign(&self, value: &str) -> String {
        let mut mac = HmacSha256::new_from_slice(&self.secrets[0]).expect("hmac accepts any key");
        mac.update(value.as_bytes());
        let sig = URL_SAFE_NO_PAD.encode(mac.finalize().into_bytes());
        format!("{value}.{sig}")
    }

    fn verify(&self, raw: &str) -> Option<String> {
        let (value, sig) = raw.rsplit_once('.')?;
        for key in &self.secrets {
            let mut mac = HmacSha256::new_from_slice(key).expect("hmac accepts any key");
            mac.update(value.as_bytes());
            let expected = URL_SAFE_NO_PAD.encode(mac.finalize().into_bytes());
            if constant_time_eq(expected.as_bytes(), sig.as_bytes()) {
                return Some(value.to_string());
            }
        }
        None
    }

    fn attributes(&self, same_site: Option<&str>, max_age: Option<i64>) -> String {
        let mut attrs = String::from("; Path=/; HttpOnly");
        if !self.dev {
            attrs.push_str("; Secure");
        }
        if let Some(domain) = &self.domain {
            attrs.push_str(&format!("; Domain={domain}"));
        }
        if let Some(ss) = same_site {
            attrs.push_str(&format!("; SameSite={ss}"));
        }
        if let Some(max_age) = max_age {
            attrs.push_str(&format!("; Max-Age={max_age}"));
        }
        attrs
    }

    fn same_site_attr(&self) -> &'static str {
        match self.same_site.as_str() {
            "strict" => "Strict",
            "none" => "None",
            _ => "Lax",
        }
    }

    /// Appends Set-Cookie headers for the (signed) value, including the
    /// legacy duplicate when SameSite=None is in effect.
    pub fn set(&self, headers: &mut HeaderMap, base: &str, value: &str, max_age: Option<i64>) {
        let signed = self.sign(value);
        let name = self.name(base);
        let cookie = format!(
            "{name}={signed}{}",
            self.attributes(Some(self.same_site_attr()), max_age)
        );
        if let Ok(hv) = HeaderValue::from_str(&cookie) {
            headers.append(header::SET_COOKIE, hv);
        }
        if self.same_site == "none" {
            let legacy = format!(
                "{name}{LEGACY_SUFFIX}={signed}{}",
                self.attributes(None, max_age)
            );
            if let Ok(hv) = HeaderValue::from_str(&legacy) {
                headers.append(header::SET_COOKIE, hv);
            }
        }
    }

    /// Expires the cookie (and its legacy twin).
    pub fn clear(&self, headers: &mut HeaderMap, base: &str) {
        let name = self.name(base);
        for full in [name.clone(), format!("{name}{LEGACY_SUFFIX}")] {
            let cookie = format!("{full}={}", self.attributes(None, Some(0)));
            if let Ok(hv) = HeaderValue::from_str(&cookie) {
                headers.append(header::SET_COOKIE, hv);
            }
        }
    }

    /// Reads and verifies a cookie from the request headers, falling back to
    /// the legacy twin.
    pub fn get(&self, headers: &HeaderMap, base: &str) -> Option<String> {
        let cookie_header = headers.get(header::COOKIE)?.to_str().ok()?;
        let name = self.name(base);
        for candidate in [name.clone(), format!("{name}{LEGACY_SUFFIX}")] {
            let prefix = format!("{candidate}=");
            if let Some(raw) = cookie_header
                .split(';')
                .find_map(|p| p.trim().strip_prefix(prefix.as_str()))
            {
                if let Some(value) = self.verify(raw) {
                    return Some(value);
                }
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(dev: bool, same_site: &str) -> GatehouseConfig {
        let mut cfg = GatehouseConfig::default();
        cfg.urls.issuer = "https://auth.example.com".to_string();
        cfg.secrets.system = vec!["0123456789abcdef0123456789abcdef".to_string()];
        cfg.dev = dev;
        cfg.serve.cookies.same_site = same_site.to_string();
        cfg
    }

    fn request_headers_from(set_headers: &HeaderMap) -> HeaderMap {
        let mut out = HeaderMap::new();
        let pairs: Vec<String> = set_headers
            .get_all(header::SET_COOKIE)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .filter_map(|v| v.split(';').next().map(|s| s.to_string()))
            .collect();
        out.insert(
            header::COOKIE,
            HeaderValue::from_str(&pairs.join("; ")).unwrap(),
        );
        out
    }

    #[test]
    fn set_and_get_round_trips() {
        let cookies = Cookies::new(&config(false, "lax"));
        let mut headers = HeaderMap::new();
        cookies.set(&mut headers, SESSION_COOKIE, "sid-123", None);

        let raw = headers.get(header::SET_COOKIE).unwrap().to_str().unwrap();
        assert!(raw.starts_with("oauth2_authentication_session="));
        assert!(raw.contains("HttpOnly"));
        assert!(raw.contains("Secure"));
        assert!(raw.contains("SameSite=Lax"));

        let req = request_headers_from(&headers);
        assert_eq!(cookies.get(&req, SESSION_COOKIE), Some("sid-123".into()));
    }

    #[test]
    fn tampered_cookie_is_rejected() {
        let cookies = Cookies::new(&config(false, "lax"));
        let mut headers = HeaderMap::new();
        cookies.set(&mut headers, LOGIN_CSRF_COOKIE, "csrf-1", None);

        let mut req = request_headers_from(&headers);
        let raw = req.get(header::COOKIE).unwrap().to_str().unwrap().to_string();
        req.insert(
            header::COOKIE,
            HeaderValue::from_str(&raw.replace("csrf-1", "csrf-2")).unwrap(),
        );
        assert_eq!(cookies.get(&req, LOGIN_CSRF_COOKIE), None);
    }

    #[test]
    fn dev_mode_suffixes_names_and_drops_secure() {
        let cookies = Cookies::new(&config(true, "lax"));
        let mut headers = HeaderMap::new();
        cookies.set(&mut headers, SESSION_COOKIE, "sid", None);
        let raw = headers.get(header::SET_COOKIE).unwrap().to_str().unwrap();
        assert!(raw.starts_with("oauth2_authentication_session_dev="));
        assert!(!raw.contains("Secure"));
    }

    #[test]
    fn same_site_none_duplicates_legacy_cookie() {
        let cookies = Cookies::new(&config(false, "none"));
        let mut headers = HeaderMap::new();
        cookies.set(&mut headers, CONSENT_CSRF_COOKIE, "csrf", None);

        let all: Vec<&str> = headers
            .get_all(header::SET_COOKIE)
            .iter()
            .map(|v| v.to_str().unwrap())
            .collect();
        assert_eq!(all.len(), 2);
        assert!(all[0].contains("SameSite=None"));
        assert!(all[1].starts_with("oauth2_consent_csrf_legacy="));
        assert!(!all[1].contains("SameSite"));

        // The legacy twin alone still satisfies the read path.
        let mut req = HeaderMap::new();
        let legacy_pair = all[1].split(';').next().unwrap();
        req.insert(header::COOKIE, HeaderValue::from_str(legacy_pair).unwrap());
        assert_eq!(cookies.get(&req, CONSENT_CSRF_COOKIE), Some("csrf".into()));
    }
}
