//! The OAuth 2.0 Authorization Endpoint.
//!
//! `/oauth2/auth` is one URL entered up to three times per authorization. The
//! query string decides which leg runs: a fresh entry validates the request
//! and sends the browser to the Login UI, a `login_verifier` re-entry redeems
//! the login decision and sends the browser to the Consent UI, and a
//! `consent_verifier` re-entry redeems the consent decision and mints the
//! authorization response. Each verifier is single-use and bound to a CSRF
//! cookie.

use axum::{
    Extension, Router,
    extract::{OriginalUri, Query},
    http::HeaderMap,
    response::{IntoResponse, Redirect, Response},
    routing::get,
};
use chrono::{Duration, Utc};
use serde::Deserialize;
use url::Url;

use crate::errors::OAuthError;
use crate::server::clients::{Client, SUBJECT_TYPE_PAIRWISE};
use crate::server::cookies::{CONSENT_CSRF_COOKIE, Cookies, LOGIN_CSRF_COOKIE, SESSION_COOKIE};
use crate::server::flow::{
    AcceptConsentRequest, AcceptLoginRequest, ConsentRequest, ConsentSession,
    ConsentSessionPayload, LoginRequest, LoginSession, Prompt, find_matching_consent,
    max_age_satisfied, subject_matches_hint,
};
use crate::server::issue;
use crate::server::oidc;
use crate::server::persist::TokenRecord;
use crate::server::persist::flow::VerifierOutcome;
use crate::server::session::{IdTokenSession, Session, TokenKind};
use crate::state::{GrantKind, SharedState};
use crate::utility::{obfuscate_subject, random_urlsafe};

pub fn router(app: SharedState) -> Router {
    Router::new()
        .route("/oauth2/auth", get(authorize_handler))
        .layer(Extension(app))
}

#[derive(Debug, Clone, Deserialize)]
pub struct AuthorizeParams {
    pub response_type: Option<String>,
    pub client_id: Option<String>,
    pub redirect_uri: Option<String>,
    pub scope: Option<String>,
    pub state: Option<String>,
    pub nonce: Option<String>,
    pub prompt: Option<String>,
    pub max_age: Option<i64>,
    pub id_token_hint: Option<String>,
    pub audience: Option<String>,
    pub code_challenge: Option<String>,
    pub code_challenge_method: Option<String>,
    pub acr_values: Option<String>,
    pub display: Option<String>,
    pub ui_locales: Option<String>,
    pub login_hint: Option<String>,
    pub login_verifier: Option<String>,
    pub consent_verifier: Option<String>,
}

/// The request after full OAuth validation. Errors beyond this point may be
/// redirected to the client.
struct ValidatedRequest {
    client: Client,
    redirect_uri: Url,
    response_type: String,
    requested_scope: Vec<String>,
    requested_audience: Vec<String>,
    state: Option<String>,
    prompt: Prompt,
    use_fragment: bool,
}

impl ValidatedRequest {
    fn redirect_error(&self, err: &OAuthError) -> Response {
        err.render_redirect(&self.redirect_uri, self.state.as_deref(), self.use_fragment)
    }
}

async fn authorize_handler(
    Extension(app): Extension<SharedState>,
    headers: HeaderMap,
    OriginalUri(uri): OriginalUri,
    Query(params): Query<AuthorizeParams>,
) -> Response {
    let v = match validate_request(&app, &params).await {
        Ok(v) => v,
        Err(resp) => return *resp,
    };

    if params.login_verifier.is_some() {
        login_leg(&app, &headers, &params, &v).await
    } else if params.consent_verifier.is_some() {
        consent_leg(&app, &headers, &params, &v).await
    } else {
        fresh_entry(&app, &headers, &uri, &params, &v).await
    }
}

/// Redirects protocol errors that have no validated redirect URI to the
/// server-side error page.
fn error_page(app: &SharedState, err: &OAuthError) -> Response {
    if let Some(debug_msg) = err.debug() {
        tracing::debug!(code = err.code(), debug = debug_msg, "authorize request failed");
    }
    let Ok(mut url) = Url::parse(&app.config.urls.error) else {
        return err.render_json(app.config.oauth2.expose_internal_errors);
    };
    url.query_pairs_mut()
        .append_pair("error", err.code())
        .append_pair("error_description", err.description());
    Redirect::to(url.as_str()).into_response()
}

/// Full validation of the OAuth 2.0 authorize request. Returns an error
/// `Response` directly so each leg can bail with the correctly rendered
/// error (error page before the redirect URI is proven, redirect after).
async fn validate_request(
    app: &SharedState,
    params: &AuthorizeParams,
) -> Result<ValidatedRequest, Box<Response>> {
    let client_id = params
        .client_id
        .clone()
        .filter(|c| !c.is_empty())
        .ok_or_else(|| {
            Box::new(error_page(
                app,
                &OAuthError::invalid_request("The request is missing the client_id parameter."),
            ))
        })?;

    let client = match app.store.get_client(&client_id).await {
        Ok(Some(client)) => client,
        Ok(None) => {
            return Err(Box::new(error_page(
                app,
                &OAuthError::invalid_client(
                    "The requested OAuth 2.0 Client does not exist.",
                ),
            )));
        }
        Err(e) => {
            return Err(Box::new(error_page(
                app,
                &OAuthError::server_error(format!("{e:#}")),
            )));
        }
    };

    // The redirect URI must match a registered one exactly. With exactly one
    // registered URI the parameter may be omitted.
    let redirect_uri = match &params.redirect_uri {
        Some(uri) if client.matches_redirect_uri(uri) => uri.clone(),
        Some(_) => {
            return Err(Box::new(error_page(
                app,
                &OAuthError::invalid_redirect_uri(
                    "The redirect_uri does not match any of the OAuth 2.0 Client's registered \
                     redirect URIs.",
                ),
            )));
        }
        None if client.redirect_uris.len() == 1 => client.redirect_uris[0].clone(),
        None => {
            return Err(Box::new(error_page(
                app,
                &OAuthError::invalid_request(
                    "The request is missing the redirect_uri parameter and the OAuth 2.0 Client \
                     has more than one redirect URI registered.",
                ),
            )));
        }
    };
    let redirect_uri = Url::parse(&redirect_uri).map_err(|e| {
        Box::new(error_page(
            app,
            &OAuthError::server_error(format!("registered redirect uri unparsable: {e}")),
        ))
    })?;

    let response_type = params
        .response_type
        .clone()
        .filter(|r| !r.is_empty())
        .unwrap_or_else(|| "code".to_string());
    let use_fragment = response_type != "code";
    let state = params.state.clone();

    // From here on errors can go back to the client.
    let v = |err: OAuthError| -> Box<Response> {
        Box::new(err.render_redirect(&redirect_uri, state.as_deref(), use_fragment))
    };

    if !client.has_response_type(&response_type) {
        return Err(v(OAuthError::unsupported_response_type(
            "The OAuth 2.0 Client is not allowed to request the given response_type.",
        )));
    }

    let requested_scope: Vec<String> = params
        .scope
        .as_deref()
        .unwrap_or_default()
        .split_whitespace()
        .map(|s| s.to_string())
        .collect();
    if !client.covers_scopes(requested_scope.iter().map(|s| s.as_str())) {
        return Err(v(OAuthError::invalid_scope(
            "The OAuth 2.0 Client is not allowed to request one or more of the given scopes.",
        )));
    }

    let requested_audience: Vec<String> = params
        .audience
        .as_deref()
        .unwrap_or_default()
        .split_whitespace()
        .map(|s| s.to_string())
        .collect();
    if !client.covers_audience(requested_audience.iter().map(|s| s.as_str())) {
        return Err(v(OAuthError::invalid_request(
            "The OAuth 2.0 Client is not allowed to request one or more of the given audiences.",
        )));
    }

    let prompt = Prompt::parse(params.prompt.as_deref())
        .map_err(|msg| v(OAuthError::invalid_request(msg)))?;

    // PKCE: public clients must send a challenge when enforcement is on; the
    // method must be known.
    let has_code = response_type.split_whitespace().any(|w| w == "code");
    if has_code {
        match params.code_challenge_method.as_deref() {
            None | Some("plain") | Some("S256") => {}
            Some(other) => {
                return Err(v(OAuthError::invalid_request(format!(
                    "The code_challenge_method {other} is not supported, use 'plain' or 'S256'."
                ))));
            }
        }
        if app.config.oauth2.pkce_enforced_for_public_clients
            && client.is_public()
            && params.code_challenge.as_deref().unwrap_or_default().is_empty()
        {
            return Err(v(OAuthError::invalid_request(
                "Public clients must include a code_challenge when performing the authorize code \
                 flow.",
            )));
        }
    }

    // Any response type containing id_token needs a nonce.
    if response_type.split_whitespace().any(|w| w == "id_token")
        && params.nonce.as_deref().unwrap_or_default().is_empty()
    {
        return Err(v(OAuthError::invalid_request(
            "Parameter nonce must be set when requesting an ID Token directly from the \
             authorization endpoint.",
        )));
    }

    Ok(ValidatedRequest {
        client,
        redirect_uri,
        response_type,
        requested_scope,
        requested_audience,
        state,
        prompt,
        use_fragment,
    })
}

// ---------------- fresh entry ----------------

async fn fresh_entry(
    app: &SharedState,
    headers: &HeaderMap,
    uri: &axum::http::Uri,
    params: &AuthorizeParams,
    v: &ValidatedRequest,
) -> Response {
    let cookies = Cookies::new(&app.config);

    // A hint that does not verify is fatal, rendered on the error page.
    let hint = match &params.id_token_hint {
        Some(raw) if !raw.is_empty() => match oidc::decode_id_token_hint(app, raw).await {
            Ok(claims) => Some(claims),
            Err(err) => return error_page(app, &err),
        },
        _ => None,
    };

    // A session cookie pointing at a missing row is the same as no session.
    let session = match cookies.get(headers, SESSION_COOKIE) {
        Some(sid) => match app.store.get_login_session(&sid).await {
            Ok(found) => found,
            Err(e) => return error_page(app, &OAuthError::server_error(format!("{e:#}"))),
        },
        None => None,
    };

    let now = Utc::now();
    let skip = match &session {
        Some(s) => {
            let hint_ok = hint
                .as_ref()
                .map(|h| {
                    subject_matches_hint(
                        &s.subject,
                        &h.subject,
                        &v.client,
                        &app.config.secrets.subject_identifier_salt,
                    )
                })
                .unwrap_or(true);
            hint_ok
                && !v.prompt.login
                && !v.prompt.select_account
                && max_age_satisfied(s.authenticated_at, params.max_age, now)
        }
        None => false,
    };

    if v.prompt.none {
        let Some(session) = session else {
            return v.redirect_error(&OAuthError::login_required(
                "Prompt 'none' was requested, but no existing login session was found.",
            ));
        };
        if !skip {
            return v.redirect_error(&OAuthError::login_required(
                "Prompt 'none' was requested, but the existing authentication session cannot be \
                 used without user interaction.",
            ));
        }
        return auto_complete(app, params, v, &session).await;
    }

    let request_url = format!("{}{}", app.issuer(), uri);
    let login_request = LoginRequest {
        challenge: random_urlsafe(16),
        verifier: random_urlsafe(16),
        csrf: random_urlsafe(16),
        client_id: v.client.client_id.clone(),
        request_url,
        requested_scope: v.requested_scope.clone(),
        requested_access_token_audience: v.requested_audience.clone(),
        oidc_context: oidc_context_from(params, hint.as_ref()),
        subject: session.as_ref().map(|s| s.subject.clone()).unwrap_or_default(),
        session_id: session.as_ref().map(|s| s.id.clone()),
        skip,
        requested_at: now,
        ..Default::default()
    };

    let challenge = login_request.challenge.clone();
    let csrf = login_request.csrf.clone();
    if let Err(e) = app.store.create_login_request(login_request).await {
        return error_page(app, &OAuthError::server_error(format!("{e:#}")));
    }

    let Ok(mut login_url) = Url::parse(&app.config.urls.login) else {
        return error_page(
            app,
            &OAuthError::server_error("the configured login url is invalid"),
        );
    };
    login_url
        .query_pairs_mut()
        .append_pair("login_challenge", &challenge);

    let mut response = Redirect::to(login_url.as_str()).into_response();
    let ttl = app.config.ttl.login_consent_request;
    cookies.set(response.headers_mut(), LOGIN_CSRF_COOKIE, &csrf, Some(ttl));
    response
}

fn oidc_context_from(
    params: &AuthorizeParams,
    hint: Option<&oidc::HintClaims>,
) -> crate::server::flow::OidcContext {
    crate::server::flow::OidcContext {
        acr_values: params
            .acr_values
            .as_deref()
            .unwrap_or_default()
            .split_whitespace()
            .map(|s| s.to_string())
            .collect(),
        display: params.display.clone().unwrap_or_default(),
        ui_locales: params
            .ui_locales
            .as_deref()
            .unwrap_or_default()
            .split_whitespace()
            .map(|s| s.to_string())
            .collect(),
        login_hint: params.login_hint.clone().unwrap_or_default(),
        id_token_hint_claims: hint.map(|h| h.all.clone()).unwrap_or_default(),
    }
}

/// `prompt=none` with a reusable session: complete both UI phases
/// server-side. Fails `consent_required` unless a remembered consent covers
/// every requested scope. The flow records are still written and redeemed so
/// the audit trail matches an interactive pass.
async fn auto_complete(
    app: &SharedState,
    params: &AuthorizeParams,
    v: &ValidatedRequest,
    session: &LoginSession,
) -> Response {
    let previous = match app
        .store
        .find_consent_sessions(&session.subject, &v.client.client_id)
        .await
    {
        Ok(p) => p,
        Err(e) => return error_page(app, &OAuthError::server_error(format!("{e:#}"))),
    };
    let now = Utc::now();
    let Some(remembered) = find_matching_consent(&previous, &v.requested_scope, now) else {
        return v.redirect_error(&OAuthError::consent_required(
            "Prompt 'none' was requested, but no previous consent covers the requested scope.",
        ));
    };

    let result: anyhow::Result<ConsentRequest> = async {
        let login_request = LoginRequest {
            challenge: random_urlsafe(16),
            verifier: random_urlsafe(16),
            csrf: random_urlsafe(16),
            client_id: v.client.client_id.clone(),
            request_url: String::new(),
            requested_scope: v.requested_scope.clone(),
            requested_access_token_audience: v.requested_audience.clone(),
            subject: session.subject.clone(),
            session_id: Some(session.id.clone()),
            skip: true,
            requested_at: now,
            ..Default::default()
        };
        let login_challenge = login_request.challenge.clone();
        let login_verifier = login_request.verifier.clone();
        app.store.create_login_request(login_request).await?;
        app.store
            .accept_login_request(
                &login_challenge,
                AcceptLoginRequest {
                    subject: session.subject.clone(),
                    remember: false,
                    remember_for: 0,
                    acr: session.acr.clone(),
                    amr: session.amr.clone(),
                    context: serde_json::Value::Null,
                    force_subject_identifier: String::new(),
                },
            )
            .await?;
        app.store.consume_login_verifier(&login_verifier).await?;

        let consent_request = ConsentRequest {
            challenge: random_urlsafe(16),
            verifier: random_urlsafe(16),
            csrf: random_urlsafe(16),
            client_id: v.client.client_id.clone(),
            subject: session.subject.clone(),
            request_url: String::new(),
            requested_scope: v.requested_scope.clone(),
            requested_access_token_audience: v.requested_audience.clone(),
            login_challenge,
            login_session_id: Some(session.id.clone()),
            acr: session.acr.clone(),
            amr: session.amr.clone(),
            skip: true,
            requested_at: now,
            authenticated_at: Some(session.authenticated_at),
            ..Default::default()
        };
        let consent_challenge = consent_request.challenge.clone();
        let consent_verifier = consent_request.verifier.clone();
        app.store.create_consent_request(consent_request).await?;
        app.store
            .accept_consent_request(
                &consent_challenge,
                AcceptConsentRequest {
                    grant_scope: v.requested_scope.clone(),
                    grant_access_token_audience: v.requested_audience.clone(),
                    remember: false,
                    remember_for: 0,
                    session: ConsentSessionPayload {
                        access_token: remembered.session_access_token.clone(),
                        id_token: remembered.session_id_token.clone(),
                    },
                    handled_at: Some(now),
                },
            )
            .await?;
        match app.store.consume_consent_verifier(&consent_verifier).await? {
            VerifierOutcome::Consumed(cr) => Ok(cr),
            _ => anyhow::bail!("freshly minted consent verifier failed to redeem"),
        }
    }
    .await;

    match result {
        Ok(cr) => match finish_authorization(app, params, v, cr).await {
            Ok(resp) => resp,
            Err(err) => v.redirect_error(&err),
        },
        Err(e) => error_page(app, &OAuthError::server_error(format!("{e:#}"))),
    }
}

// ---------------- login verifier re-entry ----------------

async fn login_leg(
    app: &SharedState,
    headers: &HeaderMap,
    params: &AuthorizeParams,
    v: &ValidatedRequest,
) -> Response {
    let cookies = Cookies::new(&app.config);
    let verifier = params.login_verifier.as_deref().unwrap_or_default();

    let record = match app.store.consume_login_verifier(verifier).await {
        Ok(VerifierOutcome::Consumed(record)) => record,
        Ok(VerifierOutcome::AlreadyUsed) | Ok(VerifierOutcome::Unknown) => {
            return v.redirect_error(&OAuthError::invalid_request(
                "The login verifier has already been used, has not been granted, or is invalid.",
            ));
        }
        Err(e) => return error_page(app, &OAuthError::server_error(format!("{e:#}"))),
    };

    match cookies.get(headers, LOGIN_CSRF_COOKIE) {
        Some(csrf) if csrf == record.csrf => {}
        Some(_) => {
            return error_page(
                app,
                &OAuthError::request_forbidden(
                    "The CSRF value from the token does not match the CSRF value from the data \
                     store.",
                ),
            );
        }
        None => {
            return error_page(
                app,
                &OAuthError::request_forbidden(
                    "No CSRF value available in the session cookie.",
                ),
            );
        }
    }

    if !record.accepted {
        let flow_error = record.error.clone().unwrap_or_default();
        let err = OAuthError::access_denied(flow_error.error_description.clone());
        let mut url = v.redirect_uri.clone();
        url.query_pairs_mut()
            .append_pair("error", &flow_error.error)
            .append_pair("error_description", &flow_error.error_description);
        if let Some(state) = &v.state {
            url.query_pairs_mut().append_pair("state", state);
        }
        tracing::debug!(code = %flow_error.error, "login request was rejected: {}", err);
        return Redirect::to(url.as_str()).into_response();
    }

    // The accepted subject must match a presented id_token_hint.
    let hint_sub = record
        .oidc_context
        .id_token_hint_claims
        .get("sub")
        .and_then(|s| s.as_str())
        .unwrap_or_default();
    if !hint_sub.is_empty()
        && !subject_matches_hint(
            &record.subject,
            hint_sub,
            &v.client,
            &app.config.secrets.subject_identifier_salt,
        )
    {
        return v.redirect_error(&OAuthError::login_required(
            "subject claim from id_token_hint does not match subject from authentication session",
        ));
    }

    let now = Utc::now();
    let authenticated_at = record.authenticated_at.unwrap_or(now);
    let sid = record
        .session_id
        .clone()
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
    let session = LoginSession {
        id: sid.clone(),
        subject: record.subject.clone(),
        authenticated_at,
        remember: record.remember,
        acr: record.acr.clone(),
        amr: record.amr.clone(),
    };
    if let Err(e) = app.store.upsert_login_session(session).await {
        return error_page(app, &OAuthError::server_error(format!("{e:#}")));
    }

    let previous = match app
        .store
        .find_consent_sessions(&record.subject, &v.client.client_id)
        .await
    {
        Ok(p) => p,
        Err(e) => return error_page(app, &OAuthError::server_error(format!("{e:#}"))),
    };
    let consent_skip =
        !v.prompt.consent && find_matching_consent(&previous, &record.requested_scope, now).is_some();

    if v.prompt.none && !consent_skip {
        return v.redirect_error(&OAuthError::consent_required(
            "Prompt 'none' was requested, but the requested scope was not previously granted.",
        ));
    }

    let consent_request = ConsentRequest {
        challenge: random_urlsafe(16),
        verifier: random_urlsafe(16),
        csrf: random_urlsafe(16),
        client_id: v.client.client_id.clone(),
        subject: record.subject.clone(),
        request_url: record.request_url.clone(),
        requested_scope: record.requested_scope.clone(),
        requested_access_token_audience: record.requested_access_token_audience.clone(),
        oidc_context: record.oidc_context.clone(),
        login_challenge: record.challenge.clone(),
        login_session_id: Some(sid.clone()),
        acr: record.acr.clone(),
        amr: record.amr.clone(),
        context: record.context.clone(),
        force_subject_identifier: record.force_subject_identifier.clone(),
        skip: consent_skip,
        requested_at: now,
        authenticated_at: Some(authenticated_at),
        ..Default::default()
    };
    let challenge = consent_request.challenge.clone();
    let csrf = consent_request.csrf.clone();
    if let Err(e) = app.store.create_consent_request(consent_request).await {
        return error_page(app, &OAuthError::server_error(format!("{e:#}")));
    }

    let Ok(mut consent_url) = Url::parse(&app.config.urls.consent) else {
        return error_page(
            app,
            &OAuthError::server_error("the configured consent url is invalid"),
        );
    };
    consent_url
        .query_pairs_mut()
        .append_pair("consent_challenge", &challenge);

    let mut response = Redirect::to(consent_url.as_str()).into_response();
    let ttl = app.config.ttl.login_consent_request;
    let headers_mut = response.headers_mut();
    cookies.set(headers_mut, CONSENT_CSRF_COOKIE, &csrf, Some(ttl));
    if record.remember {
        let max_age = (record.remember_for > 0).then_some(record.remember_for);
        cookies.set(headers_mut, SESSION_COOKIE, &sid, max_age);
    }
    response
}

// ---------------- consent verifier re-entry ----------------

async fn consent_leg(
    app: &SharedState,
    headers: &HeaderMap,
    params: &AuthorizeParams,
    v: &ValidatedRequest,
) -> Response {
    let cookies = Cookies::new(&app.config);
    let verifier = params.consent_verifier.as_deref().unwrap_or_default();

    let record = match app.store.consume_consent_verifier(verifier).await {
        Ok(VerifierOutcome::Consumed(record)) => record,
        Ok(VerifierOutcome::AlreadyUsed) | Ok(VerifierOutcome::Unknown) => {
            return v.redirect_error(&OAuthError::invalid_request(
                "The consent verifier has already been used, has not been granted, or is invalid.",
            ));
        }
        Err(e) => return error_page(app, &OAuthError::server_error(format!("{e:#}"))),
    };

    match cookies.get(headers, CONSENT_CSRF_COOKIE) {
        Some(csrf) if csrf == record.csrf => {}
        Some(_) => {
            return error_page(
                app,
                &OAuthError::request_forbidden(
                    "The CSRF value from the token does not match the CSRF value from the data \
                     store.",
                ),
            );
        }
        None => {
            return error_page(
                app,
                &OAuthError::request_forbidden("No CSRF value available in the session cookie."),
            );
        }
    }

    if !record.accepted {
        let flow_error = record.error.clone().unwrap_or_default();
        let mut url = v.redirect_uri.clone();
        url.query_pairs_mut()
            .append_pair("error", &flow_error.error)
            .append_pair("error_description", &flow_error.error_description);
        if let Some(state) = &v.state {
            url.query_pairs_mut().append_pair("state", state);
        }
        return Redirect::to(url.as_str()).into_response();
    }

    match finish_authorization(app, params, v, record).await {
        Ok(resp) => resp,
        Err(err) => v.redirect_error(&err),
    }
}

// ---------------- minting ----------------

/// Turns an accepted consent into the authorization response: a code for the
/// code flow, tokens in the fragment for implicit/hybrid.
async fn finish_authorization(
    app: &SharedState,
    params: &AuthorizeParams,
    v: &ValidatedRequest,
    record: ConsentRequest,
) -> Result<Response, OAuthError> {
    if record.remember {
        app.store
            .create_consent_session(ConsentSession {
                challenge: record.challenge.clone(),
                subject: record.subject.clone(),
                client_id: record.client_id.clone(),
                granted_scope: record.granted_scope.clone(),
                granted_audience: record.granted_audience.clone(),
                remember: true,
                remember_for: record.remember_for,
                handled_at: record.handled_at,
                session_access_token: record.session_access_token.clone(),
                session_id_token: record.session_id_token.clone(),
            })
            .await
            .map_err(|e| OAuthError::server_error(format!("{e:#}")))?;
    }

    // The wire subject: forced override first, then pairwise obfuscation.
    let wire_subject = if !record.force_subject_identifier.is_empty() {
        record.force_subject_identifier.clone()
    } else if v.client.subject_type == SUBJECT_TYPE_PAIRWISE {
        let sector = v.client.sector_identifier()?;
        obfuscate_subject(
            &sector,
            &record.subject,
            &app.config.secrets.subject_identifier_salt,
        )
    } else {
        record.subject.clone()
    };

    let sid = record.login_session_id.clone().unwrap_or_default();
    let openid = issue::wants_id_token(&record.granted_scope);

    let mut session = Session::new(record.subject.clone(), record.client_id.clone());
    session.access.ext = record.session_access_token.clone();
    if openid {
        session.id_token = Some(IdTokenSession {
            subject: wire_subject.clone(),
            session_id: sid.clone(),
            nonce: params.nonce.clone().unwrap_or_default(),
            acr: record.acr.clone(),
            amr: record.amr.clone(),
            auth_time: record.authenticated_at,
            extra: record.session_id_token.clone(),
        });
    }

    // One graph id links every token this authorization ever produces.
    let request_id = uuid::Uuid::new_v4().to_string();
    let words: Vec<&str> = v.response_type.split_whitespace().collect();
    let wants_code = words.contains(&"code");
    let wants_token = words.contains(&"token");
    let wants_id = words.contains(&"id_token");

    let mut query_params: Vec<(String, String)> = Vec::new();
    let mut code_value: Option<String> = None;
    let mut access_token_value: Option<String> = None;

    if wants_code {
        let (code, signature) = app.tokens.new_authorize_code();
        let mut code_record = TokenRecord::new(
            signature,
            request_id.clone(),
            record.client_id.clone(),
            record.subject.clone(),
            Utc::now() + Duration::seconds(app.config.ttl.auth_code),
            session.clone(),
        );
        code_record.requested_scope = record.requested_scope.clone();
        code_record.granted_scope = record.granted_scope.clone();
        code_record.requested_audience = record.requested_access_token_audience.clone();
        code_record.granted_audience = record.granted_audience.clone();
        code_record.redirect_uri = v.redirect_uri.to_string();
        code_record.session_id = sid.clone();
        code_record
            .session
            .set_expires_at(TokenKind::AuthorizationCode, code_record.expires_at);

        let pkce = params
            .code_challenge
            .clone()
            .filter(|c| !c.is_empty())
            .map(|challenge| {
                (
                    challenge,
                    params
                        .code_challenge_method
                        .clone()
                        .unwrap_or_else(|| "plain".to_string()),
                )
            });
        let oidc_session = openid.then(|| code_record.session.clone());

        app.store
            .create_authorize_code(code_record, pkce, oidc_session)
            .await
            .map_err(|e| OAuthError::server_error(format!("{e:#}")))?;

        query_params.push(("code".to_string(), code.clone()));
        code_value = Some(code);
    }

    if wants_token {
        let minted = issue::new_access_token(
            app,
            &v.client,
            &session,
            &record.granted_scope,
            &record.granted_audience,
            &request_id,
            &sid,
            GrantKind::AuthorizationCode,
        )
        .await
        .map_err(|e| OAuthError::server_error(format!("{e:#}")))?;
        app.store
            .create_access_token(minted.record)
            .await
            .map_err(|e| OAuthError::server_error(format!("{e:#}")))?;

        query_params.push(("access_token".to_string(), minted.token.clone()));
        query_params.push(("token_type".to_string(), "bearer".to_string()));
        query_params.push((
            "expires_in".to_string(),
            app.access_token_lifespan(&v.client, GrantKind::AuthorizationCode)
                .to_string(),
        ));
        query_params.push(("scope".to_string(), record.granted_scope.join(" ")));
        access_token_value = Some(minted.token);
    }

    if wants_id {
        let id_session = session
            .id_token
            .as_ref()
            .ok_or_else(|| {
                OAuthError::invalid_scope(
                    "Requesting an ID Token requires the granted scope to include 'openid'.",
                )
            })?;
        let lifespan = app.id_token_lifespan(&v.client, GrantKind::AuthorizationCode);
        let id_token = oidc::mint_id_token(
            app,
            &v.client,
            id_session,
            lifespan,
            access_token_value.as_deref(),
            code_value.as_deref(),
        )
        .await
        .map_err(|e| OAuthError::server_error(format!("{e:#}")))?;
        query_params.push(("id_token".to_string(), id_token));
    }

    if let Some(state) = &v.state {
        query_params.push(("state".to_string(), state.clone()));
    }

    let mut url = v.redirect_uri.clone();
    if v.use_fragment {
        let encoded: Vec<String> = query_params
            .iter()
            .map(|(k, val)| format!("{}={}", k, urlencoding::encode(val)))
            .collect();
        url.set_fragment(Some(&encoded.join("&")));
    } else {
        let mut qp = url.query_pairs_mut();
        for (k, val) in &query_params {
            qp.append_pair(k, val);
        }
        drop(qp);
    }

    Ok(Redirect::to(url.as_str()).into_response())
}
