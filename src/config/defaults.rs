//! Default helpers referenced from `#[serde(default = ...)]` attributes.

pub fn default_false() -> bool {
    false
}

pub fn default_true() -> bool {
    true
}

pub fn default_public_bind_address() -> String {
    "127.0.0.1:4444".to_string()
}

pub fn default_admin_bind_address() -> String {
    "127.0.0.1:4445".to_string()
}

pub fn default_same_site() -> String {
    "lax".to_string()
}

pub fn default_access_token_strategy() -> String {
    "opaque".to_string()
}

pub fn default_subject_types() -> Vec<String> {
    vec!["public".to_string(), "pairwise".to_string()]
}

pub fn default_client_scope() -> Vec<String> {
    vec!["offline_access".to_string(), "offline".to_string(), "openid".to_string()]
}

// Lifespans in seconds.

pub fn default_login_consent_ttl() -> i64 {
    1800 // 30 minutes
}

pub fn default_access_token_ttl() -> i64 {
    3600 // 1 hour
}

pub fn default_refresh_token_ttl() -> i64 {
    720 * 3600 // 30 days
}

pub fn default_id_token_ttl() -> i64 {
    3600
}

pub fn default_auth_code_ttl() -> i64 {
    600 // 10 minutes
}
