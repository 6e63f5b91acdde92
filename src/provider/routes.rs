// ABOUTME: OAuth HTTP route handlers for the warp web framework
// ABOUTME: Wires transport concerns (headers, cookies, CORS, DPoP nonce) onto the provider
//
// Licensed under either of Apache License, Version 2.0 or MIT License at your option.
// Copyright ©2025 Async-IO.org

//! HTTP surface
//!
//! Thin handlers over [`Provider`]: parse the transport, call the
//! orchestrator, shape the response. Non-interactive endpoints answer JSON
//! with `Cache-Control: no-store` and permissive CORS; interactive endpoints
//! go through the CSRF / fetch-metadata gate in [`super::csrf`].

use serde::Deserialize;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use warp::http::{HeaderMap, StatusCode};
use warp::reply::Response;
use warp::{Filter, Rejection, Reply};

use crate::constants::requests::PAR_EXPIRY_SECS;
use crate::constants::sessions::{DEVICE_ID_COOKIE, DEVICE_SECRET_COOKIE};
use crate::device::DeviceCookies;
use crate::dpop::VerifiedDpop;
use crate::errors::OAuthError;
use crate::models::RequestMetadata;
use crate::provider::csrf;
use crate::provider::{AuthorizeOutcome, ConsentPage, Provider};

/// All OAuth routes, rooted at `/`
pub fn oauth_routes(
    provider: Arc<Provider>,
) -> impl Filter<Extract = impl Reply, Error = Rejection> + Clone {
    metadata_route(provider.clone())
        .or(jwks_route(provider.clone()))
        .or(par_route(provider.clone()))
        .or(token_route(provider.clone()))
        .or(revoke_route(provider.clone()))
        .or(introspect_route(provider.clone()))
        .or(authorize_route(provider.clone()))
        .or(accept_route(provider.clone()))
        .or(reject_route(provider.clone()))
        .or(sign_in_route(provider.clone()))
        .or(sign_up_route(provider.clone()))
        .or(handle_availability_route(provider.clone()))
        .or(reset_request_route(provider.clone()))
        .or(reset_confirm_route(provider))
}

fn with_provider(
    provider: Arc<Provider>,
) -> impl Filter<Extract = (Arc<Provider>,), Error = std::convert::Infallible> + Clone {
    warp::any().map(move || provider.clone())
}

/// Server metadata (RFC 8414)
fn metadata_route(
    provider: Arc<Provider>,
) -> impl Filter<Extract = impl Reply, Error = Rejection> + Clone {
    warp::path!(".well-known" / "oauth-authorization-server")
        .and(warp::get())
        .and(with_provider(provider))
        .map(|provider: Arc<Provider>| {
            with_cors(json_reply(StatusCode::OK, &provider.server_metadata()))
        })
}

/// Public JWKS
fn jwks_route(
    provider: Arc<Provider>,
) -> impl Filter<Extract = impl Reply, Error = Rejection> + Clone {
    warp::path!("oauth" / "jwks")
        .and(warp::get())
        .and(with_provider(provider))
        .map(|provider: Arc<Provider>| match provider.jwks() {
            Ok(jwks) => with_cors(json_reply(StatusCode::OK, &jwks)),
            Err(err) => with_cors(error_reply(&err, None)),
        })
}

/// Pushed authorization requests (RFC 9126)
fn par_route(
    provider: Arc<Provider>,
) -> impl Filter<Extract = impl Reply, Error = Rejection> + Clone {
    warp::path!("oauth" / "par")
        .and(warp::post())
        .and(warp::body::form::<HashMap<String, String>>())
        .and(warp::header::headers_cloned())
        .and(with_provider(provider))
        .and_then(handle_par)
}

async fn handle_par(
    form: HashMap<String, String>,
    headers: HeaderMap,
    provider: Arc<Provider>,
) -> Result<Response, Rejection> {
    let nonce = provider.dpop.next_nonce();
    let dpop = match verify_dpop(&provider, &headers, "POST", "/oauth/par", None).await {
        Ok(dpop) => dpop,
        Err(err) => {
            return Ok(with_cors(error_reply(
                &err.downgrade_for_par(),
                Some(&nonce),
            )))
        }
    };

    match provider
        .pushed_authorization_request(&form, dpop.as_ref())
        .await
    {
        Ok(response) => Ok(with_cors(with_dpop_nonce(
            json_reply(StatusCode::CREATED, &response),
            &nonce,
        ))),
        Err(err) => Ok(with_cors(error_reply(&err, Some(&nonce)))),
    }
}

/// Token endpoint
fn token_route(
    provider: Arc<Provider>,
) -> impl Filter<Extract = impl Reply, Error = Rejection> + Clone {
    warp::path!("oauth" / "token")
        .and(warp::post())
        .and(warp::body::form::<HashMap<String, String>>())
        .and(warp::header::headers_cloned())
        .and(with_provider(provider))
        .and_then(handle_token)
}

async fn handle_token(
    form: HashMap<String, String>,
    headers: HeaderMap,
    provider: Arc<Provider>,
) -> Result<Response, Rejection> {
    let nonce = provider.dpop.next_nonce();
    let dpop = match verify_dpop(&provider, &headers, "POST", "/oauth/token", None).await {
        Ok(dpop) => dpop,
        Err(err) => return Ok(with_cors(error_reply(&err, Some(&nonce)))),
    };

    match provider.token(&form, dpop.as_ref()).await {
        Ok(response) => Ok(with_cors(with_dpop_nonce(
            json_reply(StatusCode::OK, &response),
            &nonce,
        ))),
        Err(err) => Ok(with_cors(error_reply(&err, Some(&nonce)))),
    }
}

/// Token revocation (RFC 7009): 200 no matter what
fn revoke_route(
    provider: Arc<Provider>,
) -> impl Filter<Extract = impl Reply, Error = Rejection> + Clone {
    warp::path!("oauth" / "revoke")
        .and(warp::post())
        .and(warp::body::form::<HashMap<String, String>>())
        .and(with_provider(provider))
        .and_then(handle_revoke)
}

async fn handle_revoke(
    form: HashMap<String, String>,
    provider: Arc<Provider>,
) -> Result<Response, Rejection> {
    if let Some(token) = form.get("token") {
        provider.revoke(token).await;
    }
    Ok(with_cors(json_reply(StatusCode::OK, &serde_json::json!({}))))
}

/// Token introspection (RFC 7662)
fn introspect_route(
    provider: Arc<Provider>,
) -> impl Filter<Extract = impl Reply, Error = Rejection> + Clone {
    warp::path!("oauth" / "introspect")
        .and(warp::post())
        .and(warp::body::form::<HashMap<String, String>>())
        .and(with_provider(provider))
        .and_then(handle_introspect)
}

async fn handle_introspect(
    form: HashMap<String, String>,
    provider: Arc<Provider>,
) -> Result<Response, Rejection> {
    let info = provider.introspect(&form).await;
    Ok(with_cors(json_reply(StatusCode::OK, &info)))
}

/// Interactive authorization start
fn authorize_route(
    provider: Arc<Provider>,
) -> impl Filter<Extract = impl Reply, Error = Rejection> + Clone {
    warp::path!("oauth" / "authorize")
        .and(warp::get())
        .and(warp::query::<HashMap<String, String>>())
        .and(warp::header::headers_cloned())
        .and(warp::addr::remote())
        .and(with_provider(provider))
        .and_then(handle_authorize)
}

async fn handle_authorize(
    query: HashMap<String, String>,
    headers: HeaderMap,
    remote: Option<SocketAddr>,
    provider: Arc<Provider>,
) -> Result<Response, Rejection> {
    if let Err(err) = csrf::validate_navigation(header(&headers, "sec-fetch-mode")) {
        return Ok(error_reply(&err, None));
    }
    let (Some(client_id), Some(request_uri)) =
        (query.get("client_id"), query.get("request_uri"))
    else {
        return Ok(error_reply(
            &OAuthError::validation("request_uri", "query"),
            None,
        ));
    };

    let (device_id, new_cookies) = match resolve_device(&provider, &headers, remote).await {
        Ok(resolved) => resolved,
        Err(err) => return Ok(error_reply(&err, None)),
    };

    match provider.authorize(&device_id, client_id, request_uri).await {
        Ok(AuthorizeOutcome::Redirect(url)) => {
            Ok(apply_device_cookies(redirect_reply(&url), &new_cookies))
        }
        Ok(AuthorizeOutcome::Consent(page)) => {
            let cookie = format!(
                "{}={}; Path=/oauth/authorize; Max-Age={}; HttpOnly; SameSite=Lax",
                csrf::csrf_cookie_name(&page.request_uri),
                page.csrf_token,
                PAR_EXPIRY_SECS,
            );
            let mut response = html_reply(&render_consent_page(provider.issuer(), &page));
            response
                .headers_mut()
                .append("set-cookie", cookie.parse().expect("valid cookie header"));
            Ok(apply_device_cookies(response, &new_cookies))
        }
        Err(err) => Ok(error_reply(&err, None)),
    }
}

/// Consent accepted: redirect back to the client with a code
fn accept_route(
    provider: Arc<Provider>,
) -> impl Filter<Extract = impl Reply, Error = Rejection> + Clone {
    warp::path!("oauth" / "authorize" / "accept")
        .and(warp::get())
        .and(warp::query::<HashMap<String, String>>())
        .and(warp::header::headers_cloned())
        .and(warp::addr::remote())
        .and(with_provider(provider))
        .and_then(handle_accept)
}

async fn handle_accept(
    query: HashMap<String, String>,
    headers: HeaderMap,
    remote: Option<SocketAddr>,
    provider: Arc<Provider>,
) -> Result<Response, Rejection> {
    match consent_action(&provider, &query, &headers, remote, true).await {
        Ok(url) => Ok(redirect_reply(&url)),
        Err(err) => Ok(error_reply(&err, None)),
    }
}

/// Consent rejected: redirect back with `access_denied`
fn reject_route(
    provider: Arc<Provider>,
) -> impl Filter<Extract = impl Reply, Error = Rejection> + Clone {
    warp::path!("oauth" / "authorize" / "reject")
        .and(warp::get())
        .and(warp::query::<HashMap<String, String>>())
        .and(warp::header::headers_cloned())
        .and(warp::addr::remote())
        .and(with_provider(provider))
        .and_then(handle_reject)
}

async fn handle_reject(
    query: HashMap<String, String>,
    headers: HeaderMap,
    remote: Option<SocketAddr>,
    provider: Arc<Provider>,
) -> Result<Response, Rejection> {
    match consent_action(&provider, &query, &headers, remote, false).await {
        Ok(url) => Ok(redirect_reply(&url)),
        Err(err) => Ok(error_reply(&err, None)),
    }
}

/// Shared gate for accept/reject: same-origin navigation, a known device,
/// and the per-request CSRF double submit.
async fn consent_action(
    provider: &Arc<Provider>,
    query: &HashMap<String, String>,
    headers: &HeaderMap,
    remote: Option<SocketAddr>,
    accept: bool,
) -> Result<String, OAuthError> {
    csrf::validate_same_origin_navigation(
        header(headers, "sec-fetch-site"),
        header(headers, "sec-fetch-mode"),
    )?;
    let request_uri = query
        .get("request_uri")
        .ok_or_else(|| OAuthError::validation("request_uri", "query"))?;

    let cookies = parse_cookies(headers);
    let cookie_name = csrf::csrf_cookie_name(request_uri);
    csrf::validate_csrf(
        cookies.get(cookie_name.as_str()).map(String::as_str),
        query.get("csrf_token").map(String::as_str),
    )?;

    let (device_id, fresh) = resolve_device(provider, headers, remote).await?;
    if fresh.is_some() {
        // A device minted on this very request cannot have been shown the
        // consent page.
        return Err(OAuthError::AccessDenied("Unknown device".to_owned()));
    }

    if accept {
        let client_id = query
            .get("client_id")
            .ok_or_else(|| OAuthError::validation("client_id", "query"))?;
        let account_sub = query
            .get("account_sub")
            .ok_or_else(|| OAuthError::validation("account_sub", "query"))?;
        provider
            .accept(&device_id, client_id, request_uri, account_sub)
            .await
    } else {
        provider.reject(&device_id, request_uri).await
    }
}

#[derive(Debug, Deserialize)]
struct SignInBody {
    username: String,
    password: String,
    #[serde(default)]
    remember: bool,
    request_uri: Option<String>,
    csrf_token: Option<String>,
}

/// Credential check for the consent page
fn sign_in_route(
    provider: Arc<Provider>,
) -> impl Filter<Extract = impl Reply, Error = Rejection> + Clone {
    warp::path!("oauth" / "authorize" / "sign-in")
        .and(warp::post())
        .and(warp::body::json::<SignInBody>())
        .and(warp::header::headers_cloned())
        .and(warp::addr::remote())
        .and(with_provider(provider))
        .and_then(handle_sign_in)
}

async fn handle_sign_in(
    body: SignInBody,
    headers: HeaderMap,
    remote: Option<SocketAddr>,
    provider: Arc<Provider>,
) -> Result<Response, Rejection> {
    let result = async {
        interactive_post_gate(&provider, &headers, body.request_uri.as_deref(), body.csrf_token.as_deref())?;
        let (device_id, _) = resolve_device(&provider, &headers, remote).await?;
        provider
            .accounts
            .sign_in(&device_id, &body.username, &body.password, body.remember)
            .await
    }
    .await;

    Ok(match result {
        Ok(session) => json_reply(
            StatusCode::OK,
            &serde_json::json!({
                "sub": session.account.sub,
                "username": session.account.preferred_username,
            }),
        ),
        Err(err) => error_reply(&err, None),
    })
}

#[derive(Debug, Deserialize)]
struct SignUpBody {
    username: String,
    password: String,
    #[serde(default)]
    remember: bool,
    request_uri: Option<String>,
    csrf_token: Option<String>,
}

/// Account creation from the consent page
fn sign_up_route(
    provider: Arc<Provider>,
) -> impl Filter<Extract = impl Reply, Error = Rejection> + Clone {
    warp::path!("oauth" / "authorize" / "sign-up")
        .and(warp::post())
        .and(warp::body::json::<SignUpBody>())
        .and(warp::header::headers_cloned())
        .and(warp::addr::remote())
        .and(with_provider(provider))
        .and_then(handle_sign_up)
}

async fn handle_sign_up(
    body: SignUpBody,
    headers: HeaderMap,
    remote: Option<SocketAddr>,
    provider: Arc<Provider>,
) -> Result<Response, Rejection> {
    let result = async {
        interactive_post_gate(&provider, &headers, body.request_uri.as_deref(), body.csrf_token.as_deref())?;
        let (device_id, _) = resolve_device(&provider, &headers, remote).await?;
        provider
            .accounts
            .sign_up(&device_id, &body.username, &body.password, body.remember)
            .await
    }
    .await;

    Ok(match result {
        Ok(session) => json_reply(
            StatusCode::OK,
            &serde_json::json!({
                "sub": session.account.sub,
                "username": session.account.preferred_username,
            }),
        ),
        Err(err) => error_reply(&err, None),
    })
}

#[derive(Debug, Deserialize)]
struct HandleBody {
    username: String,
}

/// Handle pre-check used by the sign-up form
fn handle_availability_route(
    provider: Arc<Provider>,
) -> impl Filter<Extract = impl Reply, Error = Rejection> + Clone {
    warp::path!("oauth" / "authorize" / "verify-handle-availability")
        .and(warp::post())
        .and(warp::body::json::<HandleBody>())
        .and(warp::header::headers_cloned())
        .and(with_provider(provider))
        .and_then(handle_availability)
}

async fn handle_availability(
    body: HandleBody,
    headers: HeaderMap,
    provider: Arc<Provider>,
) -> Result<Response, Rejection> {
    let result = async {
        same_origin_gate(&provider, &headers)?;
        provider
            .accounts
            .verify_handle_availability(&body.username)
            .await
    }
    .await;

    Ok(match result {
        Ok(()) => json_reply(StatusCode::OK, &serde_json::json!({ "available": true })),
        Err(err) => error_reply(&err, None),
    })
}

#[derive(Debug, Deserialize)]
struct ResetRequestBody {
    username: String,
}

fn reset_request_route(
    provider: Arc<Provider>,
) -> impl Filter<Extract = impl Reply, Error = Rejection> + Clone {
    warp::path!("oauth" / "authorize" / "reset-password-request")
        .and(warp::post())
        .and(warp::body::json::<ResetRequestBody>())
        .and(warp::header::headers_cloned())
        .and(with_provider(provider))
        .and_then(handle_reset_request)
}

async fn handle_reset_request(
    body: ResetRequestBody,
    headers: HeaderMap,
    provider: Arc<Provider>,
) -> Result<Response, Rejection> {
    let result = async {
        same_origin_gate(&provider, &headers)?;
        provider.accounts.reset_password_request(&body.username).await
    }
    .await;

    Ok(match result {
        Ok(()) => json_reply(StatusCode::OK, &serde_json::json!({})),
        Err(err) => error_reply(&err, None),
    })
}

#[derive(Debug, Deserialize)]
struct ResetConfirmBody {
    token: String,
    password: String,
}

fn reset_confirm_route(
    provider: Arc<Provider>,
) -> impl Filter<Extract = impl Reply, Error = Rejection> + Clone {
    warp::path!("oauth" / "authorize" / "reset-password-confirm")
        .and(warp::post())
        .and(warp::body::json::<ResetConfirmBody>())
        .and(warp::header::headers_cloned())
        .and(with_provider(provider))
        .and_then(handle_reset_confirm)
}

async fn handle_reset_confirm(
    body: ResetConfirmBody,
    headers: HeaderMap,
    provider: Arc<Provider>,
) -> Result<Response, Rejection> {
    let result = async {
        same_origin_gate(&provider, &headers)?;
        provider
            .accounts
            .reset_password_confirm(&body.token, &body.password)
            .await
    }
    .await;

    Ok(match result {
        Ok(()) => json_reply(StatusCode::OK, &serde_json::json!({})),
        Err(err) => error_reply(&err, None),
    })
}

// ── Transport helpers ───────────────────────────────────────────────────

fn header<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|value| value.to_str().ok())
}

fn parse_cookies(headers: &HeaderMap) -> HashMap<String, String> {
    header(headers, "cookie")
        .map(|raw| {
            raw.split(';')
                .filter_map(|pair| {
                    let (name, value) = pair.trim().split_once('=')?;
                    Some((name.to_owned(), value.to_owned()))
                })
                .collect()
        })
        .unwrap_or_default()
}

fn same_origin_gate(provider: &Arc<Provider>, headers: &HeaderMap) -> Result<(), OAuthError> {
    csrf::validate_same_origin_post(
        provider.issuer(),
        header(headers, "origin"),
        header(headers, "sec-fetch-site"),
        header(headers, "sec-fetch-mode"),
    )
}

/// Same-origin plus, when the call is bound to an authorization flow, the
/// per-request double-submit token (body field or `X-CSRF-Token` header).
fn interactive_post_gate(
    provider: &Arc<Provider>,
    headers: &HeaderMap,
    request_uri: Option<&str>,
    csrf_token: Option<&str>,
) -> Result<(), OAuthError> {
    same_origin_gate(provider, headers)?;
    if let Some(request_uri) = request_uri {
        let cookies = parse_cookies(headers);
        let cookie_name = csrf::csrf_cookie_name(request_uri);
        let submitted = csrf_token.or_else(|| header(headers, "x-csrf-token"));
        csrf::validate_csrf(
            cookies.get(cookie_name.as_str()).map(String::as_str),
            submitted,
        )?;
    }
    Ok(())
}

async fn resolve_device(
    provider: &Arc<Provider>,
    headers: &HeaderMap,
    remote: Option<SocketAddr>,
) -> Result<(String, Option<DeviceCookies>), OAuthError> {
    let cookies = parse_cookies(headers);
    let metadata = RequestMetadata {
        ip: remote
            .map(|addr| addr.ip().to_string())
            .unwrap_or_else(|| "unknown".to_owned()),
        user_agent: header(headers, "user-agent").map(str::to_owned),
    };
    provider
        .devices
        .resolve(
            cookies.get(DEVICE_ID_COOKIE).map(String::as_str),
            cookies.get(DEVICE_SECRET_COOKIE).map(String::as_str),
            metadata,
        )
        .await
        .map_err(OAuthError::from)
}

async fn verify_dpop(
    provider: &Arc<Provider>,
    headers: &HeaderMap,
    method: &str,
    path: &str,
    access_token: Option<&str>,
) -> Result<Option<VerifiedDpop>, OAuthError> {
    let Some(proof) = header(headers, "dpop") else {
        return Ok(None);
    };
    let htu = format!("{}{}", provider.issuer(), path);
    provider
        .dpop
        .verify_proof(proof, method, &htu, access_token)
        .await
        .map(Some)
}

// ── Response helpers ────────────────────────────────────────────────────

fn base_response(status: StatusCode, content_type: &str, body: String) -> Response {
    let mut response = warp::reply::with_status(body, status).into_response();
    let headers = response.headers_mut();
    headers.insert(
        "content-type",
        content_type.parse().expect("valid content type"),
    );
    headers.insert("cache-control", "no-store".parse().expect("valid header"));
    headers.insert("pragma", "no-cache".parse().expect("valid header"));
    response
}

/// Public endpoints are CORS-open (no credentials); interactive endpoints
/// stay same-origin and never get these headers.
fn with_cors(mut response: Response) -> Response {
    let headers = response.headers_mut();
    headers.insert(
        "access-control-allow-origin",
        "*".parse().expect("valid header"),
    );
    headers.insert(
        "access-control-allow-headers",
        "authorization,dpop,content-type".parse().expect("valid header"),
    );
    response
}

fn json_reply<T: serde::Serialize>(status: StatusCode, body: &T) -> Response {
    let body = serde_json::to_string(body).unwrap_or_else(|_| "{}".to_owned());
    base_response(status, "application/json", body)
}

fn html_reply(markup: &str) -> Response {
    base_response(StatusCode::OK, "text/html; charset=utf-8", markup.to_owned())
}

fn redirect_reply(url: &str) -> Response {
    let mut response = base_response(StatusCode::FOUND, "text/plain", String::new());
    if let Ok(value) = url.parse() {
        response.headers_mut().insert("location", value);
    }
    response
}

fn error_reply(err: &OAuthError, dpop_nonce: Option<&str>) -> Response {
    let status =
        StatusCode::from_u16(err.status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let mut response = json_reply(status, &err.to_body());
    if status == StatusCode::UNAUTHORIZED {
        let challenge = format!("Bearer error=\"{}\"", err.code());
        if let Ok(value) = challenge.parse() {
            response.headers_mut().insert("www-authenticate", value);
        }
    }
    if let Some(nonce) = dpop_nonce {
        response = with_dpop_nonce(response, nonce);
    }
    response
}

fn with_dpop_nonce(mut response: Response, nonce: &str) -> Response {
    if let Ok(value) = nonce.parse() {
        response.headers_mut().insert("dpop-nonce", value);
    }
    if let Ok(value) = "DPoP-Nonce".parse() {
        response
            .headers_mut()
            .insert("access-control-expose-headers", value);
    }
    response
}

fn apply_device_cookies(mut response: Response, cookies: &Option<DeviceCookies>) -> Response {
    if let Some(cookies) = cookies {
        let id_cookie = format!(
            "{DEVICE_ID_COOKIE}={}; Path=/oauth; Max-Age=31536000; HttpOnly; SameSite=Lax",
            cookies.device_id
        );
        let secret_cookie = format!(
            "{DEVICE_SECRET_COOKIE}={}; Path=/oauth; Max-Age=31536000; HttpOnly; SameSite=Lax",
            cookies.secret
        );
        for cookie in [id_cookie, secret_cookie] {
            if let Ok(value) = cookie.parse() {
                response.headers_mut().append("set-cookie", value);
            }
        }
    }
    response
}

fn escape_html(raw: &str) -> String {
    raw.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

/// Minimal consent page; deployments replace this with their own frontend
fn render_consent_page(issuer: &str, page: &ConsentPage) -> String {
    let client_name = page
        .client
        .client_name
        .as_deref()
        .unwrap_or(&page.client.client_id);
    let scope = page.scope.as_deref().unwrap_or("(none)");

    let mut sessions_markup = String::new();
    if !page.force_login {
        for session in &page.sessions {
            let label = session.username.as_deref().unwrap_or(&session.sub);
            if session.login_required {
                sessions_markup.push_str(&format!(
                    "<li>{} (session expired; sign in again)</li>\n",
                    escape_html(label)
                ));
            } else {
                sessions_markup.push_str(&format!(
                    "<li><a href=\"{issuer}/oauth/authorize/accept?request_uri={}&client_id={}&account_sub={}&csrf_token={}\">Continue as {}</a></li>\n",
                    urlencoding::encode(&page.request_uri),
                    urlencoding::encode(&page.client.client_id),
                    urlencoding::encode(&session.sub),
                    urlencoding::encode(&page.csrf_token),
                    escape_html(label),
                ));
            }
        }
    }

    format!(
        r#"<!DOCTYPE html>
<html>
<head><meta charset="utf-8"><title>Authorize {client}</title></head>
<body>
<h1>{client}</h1>
<p>is asking for access with scope: <code>{scope}</code></p>
<ul>
{sessions}
</ul>
<form id="sign-in">
  <input name="username" placeholder="Handle" autocomplete="username">
  <input name="password" type="password" autocomplete="current-password">
  <input type="hidden" name="request_uri" value="{request_uri}">
  <input type="hidden" name="csrf_token" value="{csrf_token}">
  <button type="submit">Sign in</button>
</form>
<p><a href="{issuer}/oauth/authorize/reject?request_uri={request_uri_enc}&csrf_token={csrf_enc}">Cancel</a></p>
</body>
</html>
"#,
        client = escape_html(client_name),
        scope = escape_html(scope),
        sessions = sessions_markup,
        request_uri = escape_html(&page.request_uri),
        csrf_token = escape_html(&page.csrf_token),
        request_uri_enc = urlencoding::encode(&page.request_uri),
        csrf_enc = urlencoding::encode(&page.csrf_token),
        issuer = issuer,
    )
}
