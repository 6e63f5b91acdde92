// ABOUTME: DPoP sender-constraining tests across issuance, refresh, and resource access
// ABOUTME: A bound token is only usable under the key it was bound to
//
// Licensed under either of Apache License, Version 2.0 or MIT License at your option.
// Copyright ©2025 Async-IO.org

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
#![allow(missing_docs)]

use anyhow::Result;

mod common;

use common::{
    authorize_interactively, build_provider, code_token_form, fresh_verifier,
    loopback_client_id, par_form, refresh_token_form, ClientKey, ISSUER,
};

async fn dpop_bound_tokens(
    provider: &std::sync::Arc<meridian_oauth_server::provider::Provider>,
    client_id: &str,
    key: &ClientKey,
    tag: &str,
) -> Result<meridian_oauth_server::models::TokenResponse> {
    let verifier = fresh_verifier(tag);
    let par_htu = format!("{ISSUER}/oauth/par");
    let proof = key.dpop_proof("POST", &par_htu, None, None);
    let dpop = provider.dpop.verify_proof(&proof, "POST", &par_htu, None).await?;

    let par = provider
        .pushed_authorization_request(&par_form(client_id, &verifier, tag), Some(&dpop))
        .await?;
    let code = authorize_interactively(
        provider,
        client_id,
        &par.request_uri,
        &format!("{tag}.example"),
    )
    .await?;

    let token_htu = format!("{ISSUER}/oauth/token");
    let proof = key.dpop_proof("POST", &token_htu, None, None);
    let dpop = provider
        .dpop
        .verify_proof(&proof, "POST", &token_htu, None)
        .await?;
    Ok(provider
        .token(&code_token_form(client_id, &code, &verifier), Some(&dpop))
        .await?)
}

/// Invariant: a token bound at PAR cannot be redeemed under another key
#[tokio::test]
async fn code_redemption_requires_the_bound_key() -> Result<()> {
    let (provider, _store) = build_provider();
    let client_id = loopback_client_id();
    let bound_key = ClientKey::generate();
    let other_key = ClientKey::generate();
    let verifier = fresh_verifier("bind");

    let par_htu = format!("{ISSUER}/oauth/par");
    let proof = bound_key.dpop_proof("POST", &par_htu, None, None);
    let dpop = provider.dpop.verify_proof(&proof, "POST", &par_htu, None).await?;
    let par = provider
        .pushed_authorization_request(&par_form(&client_id, &verifier, "bind"), Some(&dpop))
        .await?;
    let code =
        authorize_interactively(&provider, &client_id, &par.request_uri, "mallory.example")
            .await?;

    let token_htu = format!("{ISSUER}/oauth/token");
    let proof = other_key.dpop_proof("POST", &token_htu, None, None);
    let dpop = provider
        .dpop
        .verify_proof(&proof, "POST", &token_htu, None)
        .await?;
    let err = provider
        .token(&code_token_form(&client_id, &code, &verifier), Some(&dpop))
        .await
        .unwrap_err();
    assert_eq!(err.code(), "invalid_grant");
    Ok(())
}

/// A bound authorization cannot fall back to a bearer exchange
#[tokio::test]
async fn bound_authorization_requires_a_proof() -> Result<()> {
    let (provider, _store) = build_provider();
    let client_id = loopback_client_id();
    let key = ClientKey::generate();
    let verifier = fresh_verifier("noproof");

    let par_htu = format!("{ISSUER}/oauth/par");
    let proof = key.dpop_proof("POST", &par_htu, None, None);
    let dpop = provider.dpop.verify_proof(&proof, "POST", &par_htu, None).await?;
    let par = provider
        .pushed_authorization_request(&par_form(&client_id, &verifier, "np"), Some(&dpop))
        .await?;
    let code =
        authorize_interactively(&provider, &client_id, &par.request_uri, "nancy.example")
            .await?;

    let err = provider
        .token(&code_token_form(&client_id, &code, &verifier), None)
        .await
        .unwrap_err();
    assert_eq!(err.code(), "invalid_grant");
    Ok(())
}

/// Invariant C: presenting a bound token with a different key's thumbprint
/// fails; the transport maps this to a 401.
#[tokio::test]
async fn resource_access_enforces_thumbprint() -> Result<()> {
    let (provider, _store) = build_provider();
    let client_id = loopback_client_id();
    let key = ClientKey::generate();
    let other = ClientKey::generate();

    let tokens = dpop_bound_tokens(&provider, &client_id, &key, "resource").await?;

    // Correct key passes
    assert!(provider
        .tokens
        .verify_access_token(&tokens.access_token, Some(&key.thumbprint()))
        .await
        .is_ok());
    // Wrong key fails
    let err = provider
        .tokens
        .verify_access_token(&tokens.access_token, Some(&other.thumbprint()))
        .await
        .unwrap_err();
    assert_eq!(err.code(), "invalid_grant");
    // Dropping the proof entirely fails too
    assert!(provider
        .tokens
        .verify_access_token(&tokens.access_token, None)
        .await
        .is_err());
    Ok(())
}

/// Refresh rotation re-validates the binding
#[tokio::test]
async fn refresh_requires_the_bound_key() -> Result<()> {
    let (provider, _store) = build_provider();
    let client_id = loopback_client_id();
    let key = ClientKey::generate();
    let other = ClientKey::generate();

    let tokens = dpop_bound_tokens(&provider, &client_id, &key, "refreshbind").await?;
    let refresh = tokens.refresh_token.unwrap();

    let htu = format!("{ISSUER}/oauth/token");
    let proof = other.dpop_proof("POST", &htu, None, None);
    let dpop = provider.dpop.verify_proof(&proof, "POST", &htu, None).await?;
    let err = provider
        .token(&refresh_token_form(&client_id, &refresh), Some(&dpop))
        .await
        .unwrap_err();
    assert_eq!(err.code(), "invalid_grant");
    Ok(())
}

/// Resource-bound proofs must carry a correct `ath`
#[tokio::test]
async fn ath_binding_is_enforced() -> Result<()> {
    let (provider, _store) = build_provider();
    let key = ClientKey::generate();
    let htu = format!("{ISSUER}/resource");

    // Proof with ath over the right token verifies
    let proof = key.dpop_proof("GET", &htu, None, Some("the-access-token"));
    assert!(provider
        .dpop
        .verify_proof(&proof, "GET", &htu, Some("the-access-token"))
        .await
        .is_ok());

    // Proof missing ath fails when an access token is in play
    let proof = key.dpop_proof("GET", &htu, None, None);
    let err = provider
        .dpop
        .verify_proof(&proof, "GET", &htu, Some("the-access-token"))
        .await
        .unwrap_err();
    assert_eq!(err.code(), "invalid_grant");

    // Proof over a different token fails
    let proof = key.dpop_proof("GET", &htu, None, Some("some-other-token"));
    let err = provider
        .dpop
        .verify_proof(&proof, "GET", &htu, Some("the-access-token"))
        .await
        .unwrap_err();
    assert_eq!(err.code(), "invalid_grant");
    Ok(())
}
