// ABOUTME: End-to-end authorization-code flow tests: PAR, consent, token, refresh
// ABOUTME: Covers the happy path with DPoP + PKCE, PKCE failure, and refresh replay
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

/// Scenario: full interactive flow with DPoP sender-constraining and PKCE.
///
/// PAR → authorize → sign-up → accept → token; the response carries DPoP
/// tokens and the granted scope, and introspection agrees with what was
/// authorized.
#[tokio::test]
async fn happy_path_with_dpop_and_pkce() -> Result<()> {
    let (provider, _store) = build_provider();
    let client_id = loopback_client_id();
    let key = ClientKey::generate();
    let verifier = fresh_verifier("happy");

    // Push the authorization request under a DPoP proof
    let proof = key.dpop_proof("POST", &format!("{ISSUER}/oauth/par"), None, None);
    let dpop = provider
        .dpop
        .verify_proof(&proof, "POST", &format!("{ISSUER}/oauth/par"), None)
        .await?;
    let par = provider
        .pushed_authorization_request(&par_form(&client_id, &verifier, "s1"), Some(&dpop))
        .await?;
    assert!(par.request_uri.starts_with("urn:ietf:params:oauth:request_uri:"));
    assert!(par.expires_in <= 300);

    // Interactive consent yields a code bound to the request
    let code = authorize_interactively(&provider, &client_id, &par.request_uri, "alice.example")
        .await?;

    // Redeem under the same DPoP key
    let proof = key.dpop_proof("POST", &format!("{ISSUER}/oauth/token"), None, None);
    let dpop = provider
        .dpop
        .verify_proof(&proof, "POST", &format!("{ISSUER}/oauth/token"), None)
        .await?;
    let tokens = provider
        .token(&code_token_form(&client_id, &code, &verifier), Some(&dpop))
        .await?;

    assert_eq!(tokens.token_type, "DPoP");
    assert_eq!(tokens.scope.as_deref(), Some("atproto"));
    assert!(tokens.refresh_token.is_some());
    assert!(tokens.expires_in > 0 && tokens.expires_in <= 3600);

    // The access token verifies end to end under the bound key
    let (claims, record) = provider
        .tokens
        .verify_access_token(&tokens.access_token, Some(&key.thumbprint()))
        .await?;
    assert_eq!(claims.iss, ISSUER);
    assert_eq!(claims.client_id, client_id);
    assert_eq!(claims.cnf.unwrap().jkt, key.thumbprint());
    assert_eq!(record.sub, claims.sub);
    Ok(())
}

/// Scenario: a mismatched `code_verifier` fails with `invalid_grant`
#[tokio::test]
async fn pkce_mismatch_is_invalid_grant() -> Result<()> {
    let (provider, _store) = build_provider();
    let client_id = loopback_client_id();
    let verifier = fresh_verifier("pkce");

    let par = provider
        .pushed_authorization_request(&par_form(&client_id, &verifier, "s2"), None)
        .await?;
    let code =
        authorize_interactively(&provider, &client_id, &par.request_uri, "bob.example").await?;

    let wrong = fresh_verifier("wrong");
    let err = provider
        .token(&code_token_form(&client_id, &code, &wrong), None)
        .await
        .unwrap_err();
    assert_eq!(err.code(), "invalid_grant");
    Ok(())
}

/// Scenario: refresh rotation, then replay of the rotated-out token revokes
/// the whole lineage including the live access token.
#[tokio::test]
async fn refresh_replay_revokes_lineage() -> Result<()> {
    let (provider, _store) = build_provider();
    let client_id = loopback_client_id();
    let verifier = fresh_verifier("refresh");

    let par = provider
        .pushed_authorization_request(&par_form(&client_id, &verifier, "s3"), None)
        .await?;
    let code =
        authorize_interactively(&provider, &client_id, &par.request_uri, "carol.example")
            .await?;
    let initial = provider
        .token(&code_token_form(&client_id, &code, &verifier), None)
        .await?;
    let r0 = initial.refresh_token.clone().unwrap();

    // First redemption rotates
    let rotated = provider
        .token(&refresh_token_form(&client_id, &r0), None)
        .await?;
    let r1 = rotated.refresh_token.clone().unwrap();
    assert_ne!(r0, r1);

    // Replaying the retired token fails and burns the lineage
    let err = provider
        .token(&refresh_token_form(&client_id, &r0), None)
        .await
        .unwrap_err();
    assert_eq!(err.code(), "invalid_grant");

    // The successor refresh token is dead too
    let err = provider
        .token(&refresh_token_form(&client_id, &r1), None)
        .await
        .unwrap_err();
    assert_eq!(err.code(), "invalid_grant");

    // And so is the rotated access token
    assert!(provider
        .tokens
        .verify_access_token(&rotated.access_token, None)
        .await
        .is_err());
    Ok(())
}

/// A consumed code cannot be redeemed again, and the second attempt revokes
/// the tokens issued by the first.
#[tokio::test]
async fn code_replay_revokes_issued_tokens() -> Result<()> {
    let (provider, _store) = build_provider();
    let client_id = loopback_client_id();
    let verifier = fresh_verifier("code-replay");

    let par = provider
        .pushed_authorization_request(&par_form(&client_id, &verifier, "s"), None)
        .await?;
    let code =
        authorize_interactively(&provider, &client_id, &par.request_uri, "dave.example").await?;
    let tokens = provider
        .token(&code_token_form(&client_id, &code, &verifier), None)
        .await?;
    assert!(provider
        .tokens
        .verify_access_token(&tokens.access_token, None)
        .await
        .is_ok());

    let err = provider
        .token(&code_token_form(&client_id, &code, &verifier), None)
        .await
        .unwrap_err();
    assert_eq!(err.code(), "invalid_grant");

    // The first exchange's tokens are revoked by the replay
    assert!(provider
        .tokens
        .verify_access_token(&tokens.access_token, None)
        .await
        .is_err());
    Ok(())
}

/// Round-trip law: what introspection reports matches what was authorized
#[tokio::test]
async fn introspection_round_trip() -> Result<()> {
    let (provider, _store) = build_provider();
    let client_id = loopback_client_id();
    let verifier = fresh_verifier("introspect");

    let par = provider
        .pushed_authorization_request(&par_form(&client_id, &verifier, "s"), None)
        .await?;
    let code =
        authorize_interactively(&provider, &client_id, &par.request_uri, "erin.example").await?;
    let tokens = provider
        .token(&code_token_form(&client_id, &code, &verifier), None)
        .await?;

    let form = std::collections::HashMap::from([
        ("client_id".to_owned(), client_id.clone()),
        ("token".to_owned(), tokens.access_token.clone()),
    ]);
    let info = provider.introspect(&form).await;
    assert!(info.active);
    assert_eq!(info.scope.as_deref(), Some("atproto"));
    assert_eq!(info.client_id.as_deref(), Some(client_id.as_str()));
    assert_eq!(info.sub, tokens.sub);
    Ok(())
}

/// Revocation is idempotent and always succeeds, and it kills the lineage
#[tokio::test]
async fn revocation_is_idempotent() -> Result<()> {
    let (provider, _store) = build_provider();
    let client_id = loopback_client_id();
    let verifier = fresh_verifier("revoke");

    let par = provider
        .pushed_authorization_request(&par_form(&client_id, &verifier, "s"), None)
        .await?;
    let code =
        authorize_interactively(&provider, &client_id, &par.request_uri, "frank.example")
            .await?;
    let tokens = provider
        .token(&code_token_form(&client_id, &code, &verifier), None)
        .await?;

    provider.revoke(&tokens.access_token).await;
    provider.revoke(&tokens.access_token).await;
    provider.revoke("tok-completely-unknown").await;

    assert!(provider
        .tokens
        .verify_access_token(&tokens.access_token, None)
        .await
        .is_err());
    let refresh = tokens.refresh_token.unwrap();
    let err = provider
        .token(&refresh_token_form(&client_id, &refresh), None)
        .await
        .unwrap_err();
    assert_eq!(err.code(), "invalid_grant");
    Ok(())
}
