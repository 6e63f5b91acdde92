// ABOUTME: HTTP-level tests over the warp routes: statuses, headers, CSRF gate
// ABOUTME: Uses warp's test harness; no sockets are opened
//
// Licensed under either of Apache License, Version 2.0 or MIT License at your option.
// Copyright ©2025 Async-IO.org

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
#![allow(missing_docs)]

use anyhow::Result;
use std::sync::Arc;

mod common;

use common::{build_provider, fresh_verifier, loopback_client_id, s256};
use meridian_oauth_server::provider::routes::oauth_routes;

fn form_body(pairs: &[(&str, &str)]) -> String {
    pairs
        .iter()
        .map(|(key, value)| format!("{key}={}", urlencoding::encode(value)))
        .collect::<Vec<_>>()
        .join("&")
}

#[tokio::test]
async fn server_metadata_document_is_served() -> Result<()> {
    let (provider, _store) = build_provider();
    let routes = oauth_routes(provider);

    let response = warp::test::request()
        .method("GET")
        .path("/.well-known/oauth-authorization-server")
        .reply(&routes)
        .await;
    assert_eq!(response.status(), 200);

    let body: serde_json::Value = serde_json::from_slice(response.body())?;
    assert_eq!(body["issuer"], "https://auth.example");
    assert_eq!(body["require_pushed_authorization_requests"], true);
    assert!(body["grant_types_supported"]
        .as_array()
        .unwrap()
        .contains(&serde_json::json!("refresh_token")));
    Ok(())
}

#[tokio::test]
async fn jwks_endpoint_serves_public_keys() -> Result<()> {
    let (provider, _store) = build_provider();
    let routes = oauth_routes(provider);

    let response = warp::test::request()
        .method("GET")
        .path("/oauth/jwks")
        .reply(&routes)
        .await;
    assert_eq!(response.status(), 200);
    let body: serde_json::Value = serde_json::from_slice(response.body())?;
    let keys = body["keys"].as_array().unwrap();
    assert!(!keys.is_empty());
    assert!(keys[0]["d"].is_null());
    Ok(())
}

#[tokio::test]
async fn par_returns_201_with_dpop_nonce() -> Result<()> {
    let (provider, _store) = build_provider();
    let routes = oauth_routes(provider);
    let client_id = loopback_client_id();
    let verifier = fresh_verifier("http-par");

    let body = form_body(&[
        ("client_id", client_id.as_str()),
        ("response_type", "code"),
        ("redirect_uri", common::REDIRECT_URI),
        ("scope", "atproto"),
        ("state", "s1"),
        ("code_challenge", &s256(&verifier)),
        ("code_challenge_method", "S256"),
    ]);
    let response = warp::test::request()
        .method("POST")
        .path("/oauth/par")
        .header("content-type", "application/x-www-form-urlencoded")
        .body(body)
        .reply(&routes)
        .await;

    assert_eq!(response.status(), 201);
    assert!(response.headers().contains_key("dpop-nonce"));
    assert_eq!(response.headers()["cache-control"], "no-store");
    assert_eq!(response.headers()["pragma"], "no-cache");
    assert_eq!(response.headers()["access-control-allow-origin"], "*");

    let body: serde_json::Value = serde_json::from_slice(response.body())?;
    assert!(body["request_uri"]
        .as_str()
        .unwrap()
        .starts_with("urn:ietf:params:oauth:request_uri:"));
    assert!(body["expires_in"].as_i64().unwrap() <= 300);
    Ok(())
}

#[tokio::test]
async fn par_without_pkce_is_400() -> Result<()> {
    let (provider, _store) = build_provider();
    let routes = oauth_routes(provider);
    let client_id = loopback_client_id();

    let body = form_body(&[
        ("client_id", client_id.as_str()),
        ("response_type", "code"),
        ("redirect_uri", common::REDIRECT_URI),
    ]);
    let response = warp::test::request()
        .method("POST")
        .path("/oauth/par")
        .header("content-type", "application/x-www-form-urlencoded")
        .body(body)
        .reply(&routes)
        .await;

    assert_eq!(response.status(), 400);
    let body: serde_json::Value = serde_json::from_slice(response.body())?;
    assert_eq!(body["error"], "invalid_request");
    Ok(())
}

#[tokio::test]
async fn token_rejects_unknown_grant_types() -> Result<()> {
    let (provider, _store) = build_provider();
    let routes = oauth_routes(provider);
    let client_id = loopback_client_id();

    let body = form_body(&[
        ("client_id", client_id.as_str()),
        ("grant_type", "client_credentials"),
    ]);
    let response = warp::test::request()
        .method("POST")
        .path("/oauth/token")
        .header("content-type", "application/x-www-form-urlencoded")
        .body(body)
        .reply(&routes)
        .await;

    assert_eq!(response.status(), 400);
    let body: serde_json::Value = serde_json::from_slice(response.body())?;
    assert_eq!(body["error"], "unsupported_grant_type");
    Ok(())
}

#[tokio::test]
async fn authorize_rejects_non_navigation_fetch() -> Result<()> {
    let (provider, _store) = build_provider();
    let routes = oauth_routes(provider);

    let response = warp::test::request()
        .method("GET")
        .path("/oauth/authorize?client_id=x&request_uri=y")
        .header("sec-fetch-mode", "cors")
        .reply(&routes)
        .await;
    assert_eq!(response.status(), 403);
    Ok(())
}

#[tokio::test]
async fn accept_without_csrf_is_403() -> Result<()> {
    let (provider, _store) = build_provider();
    let routes = oauth_routes(provider);

    let response = warp::test::request()
        .method("GET")
        .path("/oauth/authorize/accept?request_uri=urn:ietf:params:oauth:request_uri:req-x&client_id=c&account_sub=s&csrf_token=t")
        .header("sec-fetch-site", "same-origin")
        .header("sec-fetch-mode", "navigate")
        .reply(&routes)
        .await;
    assert_eq!(response.status(), 403);
    let body: serde_json::Value = serde_json::from_slice(response.body())?;
    assert_eq!(body["error"], "access_denied");
    Ok(())
}

#[tokio::test]
async fn accept_rejects_cross_site_navigation() -> Result<()> {
    let (provider, _store) = build_provider();
    let routes = oauth_routes(provider);

    let response = warp::test::request()
        .method("GET")
        .path("/oauth/authorize/accept?request_uri=urn:x&client_id=c&account_sub=s&csrf_token=t")
        .header("sec-fetch-site", "cross-site")
        .header("sec-fetch-mode", "navigate")
        .reply(&routes)
        .await;
    assert_eq!(response.status(), 403);
    Ok(())
}

#[tokio::test]
async fn sign_in_rejects_foreign_origin() -> Result<()> {
    let (provider, _store) = build_provider();
    let routes = oauth_routes(provider);

    let response = warp::test::request()
        .method("POST")
        .path("/oauth/authorize/sign-in")
        .header("content-type", "application/json")
        .header("origin", "https://evil.example")
        .json(&serde_json::json!({
            "username": "alice.example",
            "password": "hunter2hunter2",
        }))
        .reply(&routes)
        .await;
    assert_eq!(response.status(), 403);
    Ok(())
}

#[tokio::test]
async fn revoke_always_returns_200() -> Result<()> {
    let (provider, _store) = build_provider();
    let routes = oauth_routes(provider);

    let response = warp::test::request()
        .method("POST")
        .path("/oauth/revoke")
        .header("content-type", "application/x-www-form-urlencoded")
        .body("token=tok-unknown")
        .reply(&routes)
        .await;
    assert_eq!(response.status(), 200);
    Ok(())
}

#[tokio::test]
async fn introspect_yields_inactive_for_garbage() -> Result<()> {
    let (provider, _store) = build_provider();
    let routes = oauth_routes(provider);

    let started = std::time::Instant::now();
    let response = warp::test::request()
        .method("POST")
        .path("/oauth/introspect")
        .header("content-type", "application/x-www-form-urlencoded")
        .body(format!(
            "client_id={}&token=tok-unknown",
            urlencoding::encode(&loopback_client_id())
        ))
        .reply(&routes)
        .await;
    assert_eq!(response.status(), 200);
    let body: serde_json::Value = serde_json::from_slice(response.body())?;
    assert_eq!(body["active"], false);
    assert!(body.get("sub").is_none() || body["sub"].is_null());
    // Invalid lookups hold the timing floor
    assert!(started.elapsed().as_millis() >= 700);
    Ok(())
}

#[tokio::test]
async fn full_flow_over_http() -> Result<()> {
    let (provider, _store) = build_provider();
    let routes = oauth_routes(provider.clone());
    let client_id = loopback_client_id();
    let verifier = fresh_verifier("http-flow");

    // PAR over HTTP
    let body = form_body(&[
        ("client_id", client_id.as_str()),
        ("response_type", "code"),
        ("redirect_uri", common::REDIRECT_URI),
        ("scope", "atproto"),
        ("state", "s-http"),
        ("code_challenge", &s256(&verifier)),
        ("code_challenge_method", "S256"),
    ]);
    let response = warp::test::request()
        .method("POST")
        .path("/oauth/par")
        .header("content-type", "application/x-www-form-urlencoded")
        .body(body)
        .reply(&routes)
        .await;
    assert_eq!(response.status(), 201);
    let par: serde_json::Value = serde_json::from_slice(response.body())?;
    let request_uri = par["request_uri"].as_str().unwrap().to_owned();

    // The interactive leg runs against the provider directly; the HTTP
    // consent page is exercised in authorize_renders_consent below
    let code = common::authorize_interactively(
        &provider,
        &client_id,
        &request_uri,
        "http-flow.example",
    )
    .await?;

    // Token over HTTP
    let body = form_body(&[
        ("client_id", client_id.as_str()),
        ("grant_type", "authorization_code"),
        ("code", &code),
        ("code_verifier", &verifier),
    ]);
    let response = warp::test::request()
        .method("POST")
        .path("/oauth/token")
        .header("content-type", "application/x-www-form-urlencoded")
        .body(body)
        .reply(&routes)
        .await;
    assert_eq!(response.status(), 200);
    assert!(response.headers().contains_key("dpop-nonce"));
    let tokens: serde_json::Value = serde_json::from_slice(response.body())?;
    assert_eq!(tokens["token_type"], "Bearer");
    assert_eq!(tokens["scope"], "atproto");
    assert!(tokens["access_token"].as_str().is_some());
    Ok(())
}

#[tokio::test]
async fn authorize_renders_consent() -> Result<()> {
    let (provider, _store) = build_provider();
    let routes = oauth_routes(provider.clone());
    let client_id = loopback_client_id();
    let verifier = fresh_verifier("http-consent");

    let par = provider
        .pushed_authorization_request(
            &common::par_form(&client_id, &verifier, "s"),
            None,
        )
        .await?;

    let response = warp::test::request()
        .method("GET")
        .path(&format!(
            "/oauth/authorize?client_id={}&request_uri={}",
            urlencoding::encode(&client_id),
            urlencoding::encode(&par.request_uri)
        ))
        .header("sec-fetch-mode", "navigate")
        .reply(&routes)
        .await;

    assert_eq!(response.status(), 200);
    let set_cookies: Vec<_> = response
        .headers()
        .get_all("set-cookie")
        .iter()
        .map(|value| value.to_str().unwrap().to_owned())
        .collect();
    assert!(set_cookies.iter().any(|c| c.starts_with("csrf-req-")));
    assert!(set_cookies.iter().any(|c| c.starts_with("device-id=")));
    assert!(set_cookies.iter().any(|c| c.starts_with("device-secret=")));
    let markup = String::from_utf8_lossy(response.body());
    assert!(markup.contains("Sign in"));
    Ok(())
}
