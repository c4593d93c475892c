//! Protocol error taxonomy.
//!
//! Every error surfaced to an OAuth 2.0 / OpenID Connect caller is one of the
//! variants below. Variants map 1:1 onto the RFC 6749 / OIDC error codes plus
//! the internal kinds; handlers construct them, and the HTTP layer is the only
//! place that renders them (JSON body, redirect query, or WWW-Authenticate).

use axum::http::StatusCode;
use axum::response::{IntoResponse, Redirect, Response};
use serde::Serialize;
use thiserror::Error;
use url::Url;

/// A single OAuth 2.0 protocol error with its stable description and an
/// optional debug string that is only exposed when the server is configured
/// with `expose_internal_errors`.
#[derive(Debug, Clone, Error)]
pub enum OAuthError {
    #[error("invalid_request: {description}")]
    InvalidRequest { description: String, debug: Option<String> },
    #[error("invalid_client: {description}")]
    InvalidClient { description: String, debug: Option<String> },
    #[error("invalid_grant: {description}")]
    InvalidGrant { description: String, debug: Option<String> },
    #[error("unauthorized_client: {description}")]
    UnauthorizedClient { description: String, debug: Option<String> },
    #[error("unsupported_grant_type: {description}")]
    UnsupportedGrantType { description: String, debug: Option<String> },
    #[error("unsupported_response_type: {description}")]
    UnsupportedResponseType { description: String, debug: Option<String> },
    #[error("invalid_scope: {description}")]
    InvalidScope { description: String, debug: Option<String> },
    #[error("invalid_client_metadata: {description}")]
    InvalidClientMetadata { description: String, debug: Option<String> },
    #[error("invalid_redirect_uri: {description}")]
    InvalidRedirectUri { description: String, debug: Option<String> },
    #[error("access_denied: {description}")]
    AccessDenied { description: String, debug: Option<String> },
    #[error("login_required: {description}")]
    LoginRequired { description: String, debug: Option<String> },
    #[error("consent_required: {description}")]
    ConsentRequired { description: String, debug: Option<String> },
    #[error("interaction_required: {description}")]
    InteractionRequired { description: String, debug: Option<String> },
    #[error("request_forbidden: {description}")]
    RequestForbidden { description: String, debug: Option<String> },
    #[error("not_found: {description}")]
    NotFound { description: String, debug: Option<String> },
    #[error("server_error: {description}")]
    ServerError { description: String, debug: Option<String> },
    #[error("temporarily_unavailable: {description}")]
    TemporarilyUnavailable { description: String, debug: Option<String> },
}

macro_rules! ctor {
    ($fn_name:ident, $variant:ident) => {
        pub fn $fn_name(description: impl Into<String>) -> Self {
            OAuthError::$variant {
                description: description.into(),
                debug: None,
            }
        }
    };
}

impl OAuthError {
    ctor!(invalid_request, InvalidRequest);
    ctor!(invalid_client, InvalidClient);
    ctor!(invalid_grant, InvalidGrant);
    ctor!(unauthorized_client, UnauthorizedClient);
    ctor!(unsupported_grant_type, UnsupportedGrantType);
    ctor!(unsupported_response_type, UnsupportedResponseType);
    ctor!(invalid_scope, InvalidScope);
    ctor!(invalid_client_metadata, InvalidClientMetadata);
    ctor!(invalid_redirect_uri, InvalidRedirectUri);
    ctor!(access_denied, AccessDenied);
    ctor!(login_required, LoginRequired);
    ctor!(consent_required, ConsentRequired);
    ctor!(interaction_required, InteractionRequired);
    ctor!(request_forbidden, RequestForbidden);
    ctor!(not_found, NotFound);
    ctor!(temporarily_unavailable, TemporarilyUnavailable);

    /// Internal faults surface with a generic description; the real cause
    /// goes into the debug string.
    pub fn server_error(debug: impl Into<String>) -> Self {
        OAuthError::ServerError {
            description: "The authorization server encountered an unexpected condition that \
                          prevented it from fulfilling the request."
                .to_string(),
            debug: Some(debug.into()),
        }
    }

    pub fn with_debug(mut self, dbg: impl Into<String>) -> Self {
        *self.debug_mut() = Some(dbg.into());
        self
    }

    /// The wire error code as defined by RFC 6749 / OIDC Core / DCR.
    pub fn code(&self) -> &'static str {
        match self {
            OAuthError::InvalidRequest { .. } => "invalid_request",
            OAuthError::InvalidClient { .. } => "invalid_client",
            OAuthError::InvalidGrant { .. } => "invalid_grant",
            OAuthError::UnauthorizedClient { .. } => "unauthorized_client",
            OAuthError::UnsupportedGrantType { .. } => "unsupported_grant_type",
            OAuthError::UnsupportedResponseType { .. } => "unsupported_response_type",
            OAuthError::InvalidScope { .. } => "invalid_scope",
            OAuthError::InvalidClientMetadata { .. } => "invalid_client_metadata",
            OAuthError::InvalidRedirectUri { .. } => "invalid_redirect_uri",
            OAuthError::AccessDenied { .. } => "access_denied",
            OAuthError::LoginRequired { .. } => "login_required",
            OAuthError::ConsentRequired { .. } => "consent_required",
            OAuthError::InteractionRequired { .. } => "interaction_required",
            OAuthError::RequestForbidden { .. } => "request_forbidden",
            OAuthError::NotFound { .. } => "not_found",
            OAuthError::ServerError { .. } => "server_error",
            OAuthError::TemporarilyUnavailable { .. } => "temporarily_unavailable",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            OAuthError::InvalidClient { .. } => StatusCode::UNAUTHORIZED,
            OAuthError::AccessDenied { .. } | OAuthError::RequestForbidden { .. } => {
                StatusCode::FORBIDDEN
            }
            OAuthError::NotFound { .. } => StatusCode::NOT_FOUND,
            OAuthError::ServerError { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            OAuthError::TemporarilyUnavailable { .. } => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::BAD_REQUEST,
        }
    }

    pub fn description(&self) -> &str {
        self.parts().0
    }

    pub fn debug(&self) -> Option<&str> {
        self.parts().1
    }

    fn parts(&self) -> (&str, Option<&str>) {
        match self {
            OAuthError::InvalidRequest { description, debug }
            | OAuthError::InvalidClient { description, debug }
            | OAuthError::InvalidGrant { description, debug }
            | OAuthError::UnauthorizedClient { description, debug }
            | OAuthError::UnsupportedGrantType { description, debug }
            | OAuthError::UnsupportedResponseType { description, debug }
            | OAuthError::InvalidScope { description, debug }
            | OAuthError::InvalidClientMetadata { description, debug }
            | OAuthError::InvalidRedirectUri { description, debug }
            | OAuthError::AccessDenied { description, debug }
            | OAuthError::LoginRequired { description, debug }
            | OAuthError::ConsentRequired { description, debug }
            | OAuthError::InteractionRequired { description, debug }
            | OAuthError::RequestForbidden { description, debug }
            | OAuthError::NotFound { description, debug }
            | OAuthError::ServerError { description, debug }
            | OAuthError::TemporarilyUnavailable { description, debug } => {
                (description.as_str(), debug.as_deref())
            }
        }
    }

    fn debug_mut(&mut self) -> &mut Option<String> {
        match self {
            OAuthError::InvalidRequest { debug, .. }
            | OAuthError::InvalidClient { debug, .. }
            | OAuthError::InvalidGrant { debug, .. }
            | OAuthError::UnauthorizedClient { debug, .. }
            | OAuthError::UnsupportedGrantType { debug, .. }
            | OAuthError::UnsupportedResponseType { debug, .. }
            | OAuthError::InvalidScope { debug, .. }
            | OAuthError::InvalidClientMetadata { debug, .. }
            | OAuthError::InvalidRedirectUri { debug, .. }
            | OAuthError::AccessDenied { debug, .. }
            | OAuthError::LoginRequired { debug, .. }
            | OAuthError::ConsentRequired { debug, .. }
            | OAuthError::InteractionRequired { debug, .. }
            | OAuthError::RequestForbidden { debug, .. }
            | OAuthError::NotFound { debug, .. }
            | OAuthError::ServerError { debug, .. }
            | OAuthError::TemporarilyUnavailable { debug, .. } => debug,
        }
    }

    /// Render as an RFC 6749 JSON error document (token endpoint, admin APIs,
    /// registration endpoint).
    pub fn render_json(&self, expose_internal: bool) -> Response {
        let body = ErrorResponse {
            error: self.code().to_string(),
            error_description: Some(self.description().to_string()),
            error_debug: if expose_internal {
                self.debug().map(|d| d.to_string())
            } else {
                None
            },
        };
        (self.status(), axum::Json(body)).into_response()
    }

    /// Render as a redirect back to the client's redirect URI. Only valid
    /// once the redirect URI has been validated against the client record.
    pub fn render_redirect(
        &self,
        redirect_uri: &Url,
        state: Option<&str>,
        fragment: bool,
    ) -> Response {
        let mut url = redirect_uri.clone();
        let mut pairs = vec![
            ("error", self.code().to_string()),
            ("error_description", self.description().to_string()),
        ];
        if let Some(state) = state {
            pairs.push(("state", state.to_string()));
        }
        if fragment {
            let encoded: Vec<String> = pairs
                .iter()
                .map(|(k, v)| format!("{}={}", k, urlencoding::encode(v)))
                .collect();
            url.set_fragment(Some(&encoded.join("&")));
        } else {
            let mut qp = url.query_pairs_mut();
            for (k, v) in &pairs {
                qp.append_pair(k, v);
            }
            drop(qp);
        }
        Redirect::to(url.as_str()).into_response()
    }
}

/// RFC 6749 §5.2 error document.
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_debug: Option<String>,
}

// Fallback rendering for handlers that bubble errors with `?`. Debug strings
// are never included on this path.
impl IntoResponse for OAuthError {
    fn into_response(self) -> Response {
        self.render_json(false)
    }
}

impl From<anyhow::Error> for OAuthError {
    fn from(e: anyhow::Error) -> Self {
        OAuthError::server_error(format!("{e:#}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn debug_is_suppressed_unless_exposed() {
        let err = OAuthError::invalid_grant("The provided authorization grant is invalid.")
            .with_debug("token already consumed");
        assert_eq!(err.code(), "invalid_grant");
        assert_eq!(err.debug(), Some("token already consumed"));

        let exposed = err.render_json(true);
        let hidden = err.render_json(false);
        assert_eq!(exposed.status(), StatusCode::BAD_REQUEST);
        assert_eq!(hidden.status(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn redirect_rendering_appends_state() {
        let err = OAuthError::login_required(
            "The Authorization Server requires End-User authentication.",
        );
        let uri = Url::parse("https://cb/").unwrap();
        let resp = err.render_redirect(&uri, Some("xyz"), false);
        assert_eq!(resp.status(), StatusCode::SEE_OTHER);
        let loc = resp.headers().get("location").unwrap().to_str().unwrap();
        assert!(loc.contains("error=login_required"));
        assert!(loc.contains("state=xyz"));
    }
}
