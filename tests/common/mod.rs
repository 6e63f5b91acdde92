// ABOUTME: Shared test harness: in-memory provider plus JWS fixture helpers
// ABOUTME: Builds loopback clients, DPoP proofs, client assertions, and JARs
//
// Licensed under either of Apache License, Version 2.0 or MIT License at your option.
// Copyright ©2025 Async-IO.org

#![allow(dead_code)]

use anyhow::Result;
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use chrono::Utc;
use serde_json::json;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Arc;

use meridian_oauth_server::models::RequestMetadata;
use meridian_oauth_server::provider::{Provider, ProviderConfig};
use meridian_oauth_server::signer::{jwk_thumbprint, JsonWebKey, RsaSigningKey};
use meridian_oauth_server::store::memory::MemoryStore;

pub const ISSUER: &str = "https://auth.example";
pub const REDIRECT_URI: &str = "https://app.example/cb";

/// Loopback client id whose synthesized metadata registers our redirect URI
pub fn loopback_client_id() -> String {
    format!("http://localhost/?redirect_uri={REDIRECT_URI}&scope=atproto")
}

pub fn test_config() -> ProviderConfig {
    let mut config = ProviderConfig::new(ISSUER);
    config.default_audience = "https://pds.example".to_owned();
    config
}

pub fn build_provider() -> (Arc<Provider>, Arc<MemoryStore>) {
    build_provider_with(test_config())
}

pub fn build_provider_with(config: ProviderConfig) -> (Arc<Provider>, Arc<MemoryStore>) {
    let store = Arc::new(MemoryStore::new());
    let provider = Provider::builder(config)
        .with_memory_store(store.clone())
        .build()
        .expect("provider builds");
    (Arc::new(provider), store)
}

pub async fn new_device(provider: &Provider) -> String {
    let metadata = RequestMetadata {
        ip: "203.0.113.9".to_owned(),
        user_agent: Some("integration-test".to_owned()),
    };
    let (device_id, _cookies) = provider
        .devices
        .resolve(None, None, metadata)
        .await
        .expect("device resolves");
    device_id
}

/// A client-held RSA key usable for DPoP proofs, client assertions, and JARs
pub struct ClientKey {
    key: RsaSigningKey,
}

impl ClientKey {
    pub fn generate() -> Self {
        Self {
            key: RsaSigningKey::generate("client-key-1").expect("keygen"),
        }
    }

    pub fn public_jwk(&self) -> JsonWebKey {
        self.key.to_jwk().expect("jwk export")
    }

    pub fn thumbprint(&self) -> String {
        jwk_thumbprint(&self.public_jwk()).expect("thumbprint")
    }

    fn encoding_key(&self) -> jsonwebtoken::EncodingKey {
        let pem = self.key.export_private_key_pem().expect("pem export");
        jsonwebtoken::EncodingKey::from_rsa_pem(pem.as_bytes()).expect("encoding key")
    }

    /// Sign arbitrary claims under an arbitrary JOSE header
    pub fn sign(&self, header: serde_json::Value, claims: &serde_json::Value) -> String {
        let header: jsonwebtoken::Header =
            serde_json::from_value(header).expect("header shape");
        jsonwebtoken::encode(&header, claims, &self.encoding_key()).expect("signing")
    }

    /// DPoP proof for `htm htu`, optionally echoing a nonce / binding `ath`
    pub fn dpop_proof(
        &self,
        htm: &str,
        htu: &str,
        nonce: Option<&str>,
        access_token: Option<&str>,
    ) -> String {
        let jwk = serde_json::to_value(self.public_jwk()).expect("jwk json");
        let mut claims = json!({
            "jti": format!("dpop-{}", uuid_like()),
            "htm": htm,
            "htu": htu,
            "iat": Utc::now().timestamp(),
        });
        if let Some(nonce) = nonce {
            claims["nonce"] = json!(nonce);
        }
        if let Some(token) = access_token {
            claims["ath"] = json!(URL_SAFE_NO_PAD.encode(Sha256::digest(token.as_bytes())));
        }
        self.sign(
            json!({"typ": "dpop+jwt", "alg": "RS256", "jwk": jwk}),
            &claims,
        )
    }

    /// `private_key_jwt` client assertion
    pub fn client_assertion(&self, client_id: &str, audience: &str, jti: &str) -> String {
        let now = Utc::now().timestamp();
        self.sign(
            json!({"typ": "JWT", "alg": "RS256", "kid": "client-key-1"}),
            &json!({
                "iss": client_id,
                "sub": client_id,
                "aud": audience,
                "jti": jti,
                "iat": now,
                "exp": now + 120,
            }),
        )
    }

    /// JWT-secured authorization request carrying `parameters`
    pub fn request_object(
        &self,
        client_id: &str,
        audience: &str,
        jti: &str,
        parameters: &serde_json::Value,
    ) -> String {
        let now = Utc::now().timestamp();
        let mut claims = parameters.clone();
        claims["iss"] = json!(client_id);
        claims["aud"] = json!(audience);
        claims["jti"] = json!(jti);
        claims["iat"] = json!(now);
        claims["exp"] = json!(now + 300);
        self.sign(
            json!({"typ": "JWT", "alg": "RS256", "kid": "client-key-1"}),
            &claims,
        )
    }
}

fn uuid_like() -> String {
    URL_SAFE_NO_PAD.encode(rand::random::<[u8; 12]>())
}

/// `code_challenge` for a verifier under S256
pub fn s256(verifier: &str) -> String {
    URL_SAFE_NO_PAD.encode(Sha256::digest(verifier.as_bytes()))
}

/// A fresh verifier in the PKCE charset
pub fn fresh_verifier(tag: &str) -> String {
    format!("{tag}-{}", "v".repeat(48))
}

/// PAR form for the standard code + PKCE flow
pub fn par_form(client_id: &str, verifier: &str, state: &str) -> HashMap<String, String> {
    HashMap::from([
        ("client_id".to_owned(), client_id.to_owned()),
        ("response_type".to_owned(), "code".to_owned()),
        ("redirect_uri".to_owned(), REDIRECT_URI.to_owned()),
        ("scope".to_owned(), "atproto".to_owned()),
        ("state".to_owned(), state.to_owned()),
        ("code_challenge".to_owned(), s256(verifier)),
        ("code_challenge_method".to_owned(), "S256".to_owned()),
    ])
}

/// Token form for redeeming a code
pub fn code_token_form(
    client_id: &str,
    code: &str,
    verifier: &str,
) -> HashMap<String, String> {
    HashMap::from([
        ("client_id".to_owned(), client_id.to_owned()),
        ("grant_type".to_owned(), "authorization_code".to_owned()),
        ("code".to_owned(), code.to_owned()),
        ("code_verifier".to_owned(), verifier.to_owned()),
        ("redirect_uri".to_owned(), REDIRECT_URI.to_owned()),
    ])
}

/// Token form for a refresh grant
pub fn refresh_token_form(client_id: &str, refresh_token: &str) -> HashMap<String, String> {
    HashMap::from([
        ("client_id".to_owned(), client_id.to_owned()),
        ("grant_type".to_owned(), "refresh_token".to_owned()),
        ("refresh_token".to_owned(), refresh_token.to_owned()),
    ])
}

/// Pull one query/fragment parameter out of a redirect URL
pub fn redirect_param(url: &str, name: &str) -> Option<String> {
    let (_, tail) = url.split_once(['?', '#'])?;
    tail.split('&').find_map(|pair| {
        let (key, value) = pair.split_once('=')?;
        if key != name {
            return None;
        }
        urlencoding::decode(value).ok().map(|v| v.into_owned())
    })
}

/// Run the interactive part of the flow: authorize, sign up, accept.
/// Returns the authorization code.
pub async fn authorize_interactively(
    provider: &Arc<Provider>,
    client_id: &str,
    request_uri: &str,
    username: &str,
) -> Result<String> {
    use meridian_oauth_server::provider::AuthorizeOutcome;

    let device_id = new_device(provider).await;
    let outcome = provider
        .authorize(&device_id, client_id, request_uri)
        .await?;
    let AuthorizeOutcome::Consent(_page) = outcome else {
        anyhow::bail!("expected the consent page, got a redirect");
    };

    let session = provider
        .accounts
        .sign_up(&device_id, username, "correct-horse-battery", true)
        .await?;
    let redirect = provider
        .accept(&device_id, client_id, request_uri, &session.account.sub)
        .await?;
    redirect_param(&redirect, "code")
        .ok_or_else(|| anyhow::anyhow!("redirect carried no code: {redirect}"))
}
