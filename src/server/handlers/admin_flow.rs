//! Admin endpoints driving the login, consent and logout UIs.
//!
//! Each UI reads its pending request by challenge, then accepts or rejects
//! it. Accept and reject respond with a `redirect_to` URL pointing back at
//! the authorization (or logout) endpoint with the stored verifier appended;
//! calling them twice for the same challenge returns the same verifier and
//! the same URL.

use axum::{
    Extension, Json, Router,
    extract::Query,
    response::{IntoResponse, Response},
    routing::{delete, get, put},
};
use serde::Deserialize;
use serde_json::json;
use url::Url;

use crate::errors::OAuthError;
use crate::server::flow::{AcceptConsentRequest, AcceptLoginRequest, FlowError};
use crate::state::SharedState;

pub fn router(app: SharedState) -> Router {
    Router::new()
        .route("/admin/oauth2/auth/requests/login", get(get_login_request))
        .route("/admin/oauth2/auth/requests/login/accept", put(accept_login))
        .route("/admin/oauth2/auth/requests/login/reject", put(reject_login))
        .route("/admin/oauth2/auth/requests/consent", get(get_consent_request))
        .route("/admin/oauth2/auth/requests/consent/accept", put(accept_consent))
        .route("/admin/oauth2/auth/requests/consent/reject", put(reject_consent))
        .route("/admin/oauth2/auth/requests/logout", get(get_logout_request))
        .route("/admin/oauth2/auth/requests/logout/accept", put(accept_logout))
        .route("/admin/oauth2/auth/requests/logout/reject", put(reject_logout))
        .route("/admin/oauth2/auth/sessions/consent", get(list_consent_sessions))
        .route("/admin/oauth2/auth/sessions/login", delete(revoke_login_sessions))
        .layer(Extension(app))
}

#[derive(Debug, Deserialize)]
struct ChallengeQuery {
    challenge: Option<String>,
    login_challenge: Option<String>,
    consent_challenge: Option<String>,
    logout_challenge: Option<String>,
}

impl ChallengeQuery {
    fn challenge(&self) -> Option<&str> {
        self.challenge
            .as_deref()
            .or(self.login_challenge.as_deref())
            .or(self.consent_challenge.as_deref())
            .or(self.logout_challenge.as_deref())
            .filter(|c| !c.is_empty())
    }
}

fn missing_challenge(app: &SharedState) -> Response {
    app.render_error(&OAuthError::invalid_request(
        "The request is missing the challenge parameter.",
    ))
}

fn not_found(app: &SharedState) -> Response {
    app.render_error(&OAuthError::not_found(
        "The requested resource could not be found.",
    ))
}

/// Builds the browser redirect carrying a verifier back to an endpoint.
fn redirect_to(base: &str, param: &str, verifier: &str) -> Result<String, OAuthError> {
    let mut url = Url::parse(base)
        .map_err(|e| OAuthError::server_error(format!("stored request url unparsable: {e}")))?;
    url.query_pairs_mut().append_pair(param, verifier);
    Ok(url.to_string())
}

// ---------------- login ----------------

async fn get_login_request(
    Extension(app): Extension<SharedState>,
    Query(q): Query<ChallengeQuery>,
) -> Response {
    let Some(challenge) = q.challenge() else {
        return missing_challenge(&app);
    };
    let record = match app.store.get_login_request(challenge).await {
        Ok(Some(record)) => record,
        Ok(None) => return not_found(&app),
        Err(e) => return app.render_error(&OAuthError::server_error(format!("{e:#}"))),
    };
    let client = match app.store.get_client(&record.client_id).await {
        Ok(client) => client.map(|c| c.sanitize()),
        Err(e) => return app.render_error(&OAuthError::server_error(format!("{e:#}"))),
    };

    let mut body = serde_json::to_value(&record).unwrap_or_default();
    body["challenge"] = json!(record.challenge);
    body["client"] = serde_json::to_value(&client).unwrap_or_default();
    Json(body).into_response()
}

async fn accept_login(
    Extension(app): Extension<SharedState>,
    Query(q): Query<ChallengeQuery>,
    Json(accept): Json<AcceptLoginRequest>,
) -> Response {
    let Some(challenge) = q.challenge() else {
        return missing_challenge(&app);
    };
    if accept.subject.is_empty() {
        return app.render_error(&OAuthError::invalid_request(
            "Field subject must not be empty.",
        ));
    }
    let record = match app.store.accept_login_request(challenge, accept).await {
        Ok(Some(record)) => record,
        Ok(None) => return not_found(&app),
        Err(e) => return app.render_error(&OAuthError::server_error(format!("{e:#}"))),
    };
    match redirect_to(&record.request_url, "login_verifier", &record.verifier) {
        Ok(url) => Json(json!({ "redirect_to": url })).into_response(),
        Err(err) => app.render_error(&err),
    }
}

async fn reject_login(
    Extension(app): Extension<SharedState>,
    Query(q): Query<ChallengeQuery>,
    Json(error): Json<FlowError>,
) -> Response {
    let Some(challenge) = q.challenge() else {
        return missing_challenge(&app);
    };
    let record = match app.store.reject_login_request(challenge, error).await {
        Ok(Some(record)) => record,
        Ok(None) => return not_found(&app),
        Err(e) => return app.render_error(&OAuthError::server_error(format!("{e:#}"))),
    };
    match redirect_to(&record.request_url, "login_verifier", &record.verifier) {
        Ok(url) => Json(json!({ "redirect_to": url })).into_response(),
        Err(err) => app.render_error(&err),
    }
}

// ---------------- consent ----------------

async fn get_consent_request(
    Extension(app): Extension<SharedState>,
    Query(q): Query<ChallengeQuery>,
) -> Response {
    let Some(challenge) = q.challenge() else {
        return missing_challenge(&app);
    };
    let record = match app.store.get_consent_request(challenge).await {
        Ok(Some(record)) => record,
        Ok(None) => return not_found(&app),
        Err(e) => return app.render_error(&OAuthError::server_error(format!("{e:#}"))),
    };
    let client = match app.store.get_client(&record.client_id).await {
        Ok(client) => client.map(|c| c.sanitize()),
        Err(e) => return app.render_error(&OAuthError::server_error(format!("{e:#}"))),
    };

    let mut body = serde_json::to_value(&record).unwrap_or_default();
    body["challenge"] = json!(record.challenge);
    body["client"] = serde_json::to_value(&client).unwrap_or_default();
    Json(body).into_response()
}

async fn accept_consent(
    Extension(app): Extension<SharedState>,
    Query(q): Query<ChallengeQuery>,
    Json(accept): Json<AcceptConsentRequest>,
) -> Response {
    let Some(challenge) = q.challenge() else {
        return missing_challenge(&app);
    };
    let pending = match app.store.get_consent_request(challenge).await {
        Ok(Some(pending)) => pending,
        Ok(None) => return not_found(&app),
        Err(e) => return app.render_error(&OAuthError::server_error(format!("{e:#}"))),
    };

    // The UI may only grant what was requested.
    for scope in &accept.grant_scope {
        if !pending.requested_scope.contains(scope) {
            return app.render_error(&OAuthError::invalid_request(format!(
                "The granted scope {scope} was not requested."
            )));
        }
    }
    for audience in &accept.grant_access_token_audience {
        if !pending.requested_access_token_audience.contains(audience) {
            return app.render_error(&OAuthError::invalid_request(format!(
                "The granted audience {audience} was not requested."
            )));
        }
    }

    let record = match app.store.accept_consent_request(challenge, accept).await {
        Ok(Some(record)) => record,
        Ok(None) => return not_found(&app),
        Err(e) => return app.render_error(&OAuthError::server_error(format!("{e:#}"))),
    };
    match redirect_to(&record.request_url, "consent_verifier", &record.verifier) {
        Ok(url) => Json(json!({ "redirect_to": url })).into_response(),
        Err(err) => app.render_error(&err),
    }
}

async fn reject_consent(
    Extension(app): Extension<SharedState>,
    Query(q): Query<ChallengeQuery>,
    Json(error): Json<FlowError>,
) -> Response {
    let Some(challenge) = q.challenge() else {
        return missing_challenge(&app);
    };
    let record = match app.store.reject_consent_request(challenge, error).await {
        Ok(Some(record)) => record,
        Ok(None) => return not_found(&app),
        Err(e) => return app.render_error(&OAuthError::server_error(format!("{e:#}"))),
    };
    match redirect_to(&record.request_url, "consent_verifier", &record.verifier) {
        Ok(url) => Json(json!({ "redirect_to": url })).into_response(),
        Err(err) => app.render_error(&err),
    }
}

// ---------------- logout ----------------

async fn get_logout_request(
    Extension(app): Extension<SharedState>,
    Query(q): Query<ChallengeQuery>,
) -> Response {
    let Some(challenge) = q.challenge() else {
        return missing_challenge(&app);
    };
    match app.store.get_logout_request(challenge).await {
        Ok(Some(record)) => Json(serde_json::to_value(&record).unwrap_or_default()).into_response(),
        Ok(None) => not_found(&app),
        Err(e) => app.render_error(&OAuthError::server_error(format!("{e:#}"))),
    }
}

async fn accept_logout(
    Extension(app): Extension<SharedState>,
    Query(q): Query<ChallengeQuery>,
) -> Response {
    let Some(challenge) = q.challenge() else {
        return missing_challenge(&app);
    };
    let record = match app.store.accept_logout_request(challenge).await {
        Ok(Some(record)) => record,
        Ok(None) => return not_found(&app),
        Err(e) => return app.render_error(&OAuthError::server_error(format!("{e:#}"))),
    };
    let base = format!("{}/oauth2/sessions/logout", app.issuer());
    match redirect_to(&base, "logout_verifier", &record.verifier) {
        Ok(url) => Json(json!({ "redirect_to": url })).into_response(),
        Err(err) => app.render_error(&err),
    }
}

async fn reject_logout(
    Extension(app): Extension<SharedState>,
    Query(q): Query<ChallengeQuery>,
) -> Response {
    let Some(challenge) = q.challenge() else {
        return missing_challenge(&app);
    };
    match app.store.reject_logout_request(challenge).await {
        Ok(Some(_)) => axum::http::StatusCode::NO_CONTENT.into_response(),
        Ok(None) => not_found(&app),
        Err(e) => app.render_error(&OAuthError::server_error(format!("{e:#}"))),
    }
}

// ---------------- session administration ----------------

#[derive(Debug, Deserialize)]
struct SubjectQuery {
    subject: String,
    client: Option<String>,
}

async fn list_consent_sessions(
    Extension(app): Extension<SharedState>,
    Query(q): Query<SubjectQuery>,
) -> Response {
    match app.store.list_consent_sessions_by_subject(&q.subject).await {
        Ok(sessions) => Json(sessions).into_response(),
        Err(e) => app.render_error(&OAuthError::server_error(format!("{e:#}"))),
    }
}

/// Revokes a subject's authentication sessions (and optionally one client's
/// remembered consents), forcing a fresh login on the next authorization.
async fn revoke_login_sessions(
    Extension(app): Extension<SharedState>,
    Query(q): Query<SubjectQuery>,
) -> Response {
    let result = async {
        app.store.delete_login_sessions_by_subject(&q.subject).await?;
        app.store
            .revoke_consent_sessions(&q.subject, q.client.clone())
            .await
    }
    .await;
    match result {
        Ok(_) => axum::http::StatusCode::NO_CONTENT.into_response(),
        Err(e) => app.render_error(&OAuthError::server_error(format!("{e:#}"))),
    }
}
