//! RP-initiated and non-RP logout.
//!
//! `/oauth2/sessions/logout` mirrors the authorization endpoint's shape: the
//! first entry creates a logout request and sends the browser to the Logout
//! UI with a challenge; the UI accepts via the admin API; the browser returns
//! with a single-use `logout_verifier`, at which point the session is
//! deleted, its tokens revoked, and signed Logout Tokens are fanned out to
//! every client with a back-channel URI sharing the session id. Fan-out is
//! best-effort and outlives the browser request.

use axum::{
    Extension, Router,
    extract::{OriginalUri, Query},
    http::HeaderMap,
    response::{IntoResponse, Redirect, Response},
    routing::get,
};
use serde::Deserialize;
use url::Url;

use crate::errors::OAuthError;
use crate::server::cookies::{Cookies, SESSION_COOKIE};
use crate::server::flow::{LoginSession, LogoutRequest, subject_matches_hint};
use crate::server::oidc;
use crate::server::persist::flow::VerifierOutcome;
use crate::state::SharedState;
use crate::utility::random_urlsafe;

pub fn router(app: SharedState) -> Router {
    Router::new()
        .route("/oauth2/sessions/logout", get(logout_handler))
        .layer(Extension(app))
}

#[derive(Debug, Deserialize)]
pub struct LogoutParams {
    pub id_token_hint: Option<String>,
    pub post_logout_redirect_uri: Option<String>,
    pub state: Option<String>,
    pub logout_verifier: Option<String>,
}

async fn logout_handler(
    Extension(app): Extension<SharedState>,
    headers: HeaderMap,
    OriginalUri(uri): OriginalUri,
    Query(params): Query<LogoutParams>,
) -> Response {
    if let Some(verifier) = params.logout_verifier.as_deref().filter(|v| !v.is_empty()) {
        return verifier_leg(&app, verifier).await;
    }

    match params.id_token_hint.as_deref().filter(|h| !h.is_empty()) {
        Some(hint) => rp_initiated(&app, &headers, &uri, &params, hint).await,
        None => non_rp_initiated(&app, &headers, &uri, &params).await,
    }
}

fn error_page(app: &SharedState, err: &OAuthError) -> Response {
    let Ok(mut url) = Url::parse(&app.config.urls.error) else {
        return err.render_json(app.config.oauth2.expose_internal_errors);
    };
    url.query_pairs_mut()
        .append_pair("error", err.code())
        .append_pair("error_description", err.description());
    Redirect::to(url.as_str()).into_response()
}

fn default_redirect(app: &SharedState) -> Response {
    Redirect::to(&app.config.urls.post_logout_redirect).into_response()
}

/// Logout without an id_token_hint: only the session cookie speaks for the
/// user, and RP parameters are not allowed.
async fn non_rp_initiated(
    app: &SharedState,
    headers: &HeaderMap,
    uri: &axum::http::Uri,
    params: &LogoutParams,
) -> Response {
    if params.state.is_some() || params.post_logout_redirect_uri.is_some() {
        return error_page(
            app,
            &OAuthError::invalid_request(
                "Logout failed because query parameters state and post_logout_redirect_uri are \
                 only allowed in combination with id_token_hint.",
            ),
        );
    }

    let cookies = Cookies::new(&app.config);
    let session = match cookies.get(headers, SESSION_COOKIE) {
        Some(sid) => match app.store.get_login_session(&sid).await {
            Ok(session) => session,
            Err(e) => return error_page(app, &OAuthError::server_error(format!("{e:#}"))),
        },
        None => None,
    };
    // A cookie pointing at a vanished session falls through to the default
    // redirect without bothering the Logout UI.
    let Some(session) = session else {
        return default_redirect(app);
    };

    to_logout_ui(app, uri, &session, None, "", "").await
}

/// RP-initiated logout: the hint is verified (expiry ignored) and must match
/// the session's subject; the post-logout redirect must be registered.
async fn rp_initiated(
    app: &SharedState,
    headers: &HeaderMap,
    uri: &axum::http::Uri,
    params: &LogoutParams,
    hint: &str,
) -> Response {
    let claims = match oidc::decode_id_token_hint(app, hint).await {
        Ok(claims) => claims,
        Err(err) => return error_page(app, &err),
    };

    let client_id = claims
        .all
        .get("aud")
        .map(|aud| match aud {
            serde_json::Value::String(s) => s.clone(),
            serde_json::Value::Array(items) => items
                .first()
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string(),
            _ => String::new(),
        })
        .unwrap_or_default();
    let client = match app.store.get_client(&client_id).await {
        Ok(Some(client)) => client,
        Ok(None) => {
            return error_page(
                app,
                &OAuthError::invalid_request(
                    "The audience of the id_token_hint names an unknown OAuth 2.0 Client.",
                ),
            );
        }
        Err(e) => return error_page(app, &OAuthError::server_error(format!("{e:#}"))),
    };

    let post_logout = params
        .post_logout_redirect_uri
        .clone()
        .unwrap_or_default();
    if !post_logout.is_empty()
        && !client
            .post_logout_redirect_uris
            .iter()
            .any(|u| u == &post_logout)
    {
        return error_page(
            app,
            &OAuthError::invalid_request(
                "Logout failed because the post_logout_redirect_uri is not registered for the \
                 OAuth 2.0 Client.",
            ),
        );
    }

    // Find the session: cookie first, the hint's sid claim second.
    let cookies = Cookies::new(&app.config);
    let mut session: Option<LoginSession> = None;
    if let Some(sid) = cookies.get(headers, SESSION_COOKIE) {
        session = match app.store.get_login_session(&sid).await {
            Ok(found) => found,
            Err(e) => return error_page(app, &OAuthError::server_error(format!("{e:#}"))),
        };
    }
    if session.is_none() {
        if let Some(sid) = &claims.session_id {
            session = match app.store.get_login_session(sid).await {
                Ok(found) => found,
                Err(e) => return error_page(app, &OAuthError::server_error(format!("{e:#}"))),
            };
        }
    }

    let Some(session) = session else {
        // Nothing to terminate; honor the redirect directly.
        return finish_redirect(app, &post_logout, params.state.as_deref());
    };

    if !claims.subject.is_empty()
        && !subject_matches_hint(
            &session.subject,
            &claims.subject,
            &client,
            &app.config.secrets.subject_identifier_salt,
        )
    {
        return error_page(
            app,
            &OAuthError::invalid_request(
                "The subject of the id_token_hint does not match the subject of the \
                 authentication session.",
            ),
        );
    }

    to_logout_ui(
        app,
        uri,
        &session,
        Some(client.client_id.clone()),
        &post_logout,
        params.state.as_deref().unwrap_or_default(),
    )
    .await
}

/// Persists the logout request and sends the browser to the Logout UI.
async fn to_logout_ui(
    app: &SharedState,
    uri: &axum::http::Uri,
    session: &LoginSession,
    client_id: Option<String>,
    post_logout: &str,
    state: &str,
) -> Response {
    let request = LogoutRequest {
        challenge: random_urlsafe(16),
        verifier: random_urlsafe(16),
        subject: session.subject.clone(),
        sid: session.id.clone(),
        client_id: client_id.clone(),
        request_url: format!("{}{}", app.issuer(), uri),
        post_logout_redirect_uri: post_logout.to_string(),
        state: state.to_string(),
        rp_initiated: client_id.is_some(),
        ..Default::default()
    };
    let challenge = request.challenge.clone();
    if let Err(e) = app.store.create_logout_request(request).await {
        return error_page(app, &OAuthError::server_error(format!("{e:#}")));
    }

    let Ok(mut logout_url) = Url::parse(&app.config.urls.logout) else {
        return error_page(
            app,
            &OAuthError::server_error("the configured logout url is invalid"),
        );
    };
    logout_url
        .query_pairs_mut()
        .append_pair("logout_challenge", &challenge);
    Redirect::to(logout_url.as_str()).into_response()
}

/// The browser returned from the Logout UI with the verifier: terminate the
/// session and leave.
async fn verifier_leg(app: &SharedState, verifier: &str) -> Response {
    let record = match app.store.consume_logout_verifier(verifier).await {
        Ok(VerifierOutcome::Consumed(record)) => record,
        Ok(VerifierOutcome::AlreadyUsed) | Ok(VerifierOutcome::Unknown) => {
            return error_page(
                app,
                &OAuthError::invalid_request(
                    "The logout verifier has already been used, has not been granted, or is \
                     invalid.",
                ),
            );
        }
        Err(e) => return error_page(app, &OAuthError::server_error(format!("{e:#}"))),
    };

    if !record.accepted {
        return default_redirect(app);
    }

    let result = async {
        app.store.delete_login_session(&record.sid).await?;
        let targets = app.store.backchannel_logout_targets(&record.sid).await?;
        app.store.revoke_tokens_by_session_id(&record.sid).await?;
        anyhow::Ok(targets)
    }
    .await;

    let targets = match result {
        Ok(targets) => targets,
        Err(e) => return error_page(app, &OAuthError::server_error(format!("{e:#}"))),
    };

    // Back-channel notifications outlive the browser request.
    fan_out_backchannel_logout(app.clone(), targets, record.sid.clone());

    let mut response = finish_redirect(
        app,
        &record.post_logout_redirect_uri,
        (!record.state.is_empty()).then_some(record.state.as_str()),
    );
    let cookies = Cookies::new(&app.config);
    cookies.clear(response.headers_mut(), SESSION_COOKIE);
    response
}

fn finish_redirect(app: &SharedState, post_logout: &str, state: Option<&str>) -> Response {
    let target = if post_logout.is_empty() {
        app.config.urls.post_logout_redirect.clone()
    } else {
        post_logout.to_string()
    };
    let Ok(mut url) = Url::parse(&target) else {
        return default_redirect(app);
    };
    if let Some(state) = state {
        url.query_pairs_mut().append_pair("state", state);
    }
    Redirect::to(url.as_str()).into_response()
}

/// Sends a signed Logout Token to every client with a back-channel logout
/// URI that shares the terminated session. Parallel, single attempt, 5s
/// deadline each; failures are logged and never block the redirect.
fn fan_out_backchannel_logout(app: SharedState, client_ids: Vec<String>, sid: String) {
    tokio::spawn(async move {
        for client_id in client_ids {
            let client = match app.store.get_client(&client_id).await {
                Ok(Some(client)) => client,
                Ok(None) => continue,
                Err(e) => {
                    tracing::warn!(client_id, "loading client for back-channel logout: {e:#}");
                    continue;
                }
            };
            let Some(logout_uri) = client
                .backchannel_logout_uri
                .clone()
                .filter(|u| !u.is_empty())
            else {
                continue;
            };

            let app = app.clone();
            let sid = sid.clone();
            tokio::spawn(async move {
                let token = match oidc::mint_logout_token(&app, &client.client_id, &sid).await {
                    Ok(token) => token,
                    Err(e) => {
                        tracing::warn!(
                            client_id = %client.client_id,
                            "minting back-channel logout token: {e:#}"
                        );
                        return;
                    }
                };
                let result = app
                    .http
                    .post(&logout_uri)
                    .form(&[("logout_token", token)])
                    .timeout(std::time::Duration::from_secs(5))
                    .send()
                    .await;
                match result {
                    Ok(response) if response.status().is_success() => {
                        tracing::debug!(client_id = %client.client_id, "back-channel logout delivered");
                    }
                    Ok(response) => {
                        tracing::warn!(
                            client_id = %client.client_id,
                            status = %response.status(),
                            "back-channel logout rejected"
                        );
                    }
                    Err(e) => {
                        tracing::warn!(
                            client_id = %client.client_id,
                            "back-channel logout failed: {e}"
                        );
                    }
                }
            });
        }
    });
}
