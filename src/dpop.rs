// ABOUTME: DPoP proof verification (RFC 9449) and server nonce rotation
// ABOUTME: Validates proof JWS against the embedded JWK and tracks jti replay
//
// Licensed under either of Apache License, Version 2.0 or MIT License at your option.
// Copyright ©2025 Async-IO.org

//! DPoP proof handling
//!
//! To validate a DPoP proof, the server ensures (RFC 9449 §4.3):
//! the `typ` header is `dpop+jwt`, the algorithm is an accepted asymmetric
//! one, the embedded JWK carries no private material, the signature verifies
//! under that JWK, `htm`/`htu` match the request, `iat` is within the
//! acceptance window, the `nonce` echoes a server-minted value when present,
//! `ath` matches the presented access token where applicable, and the `jti`
//! has not been seen before.

use anyhow::{anyhow, Context, Result};
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use chrono::Utc;
use ring::hmac;
use serde::Deserialize;
use sha2::{Digest, Sha256};

use crate::constants::dpop_nonce::{RETAINED_WINDOWS, ROTATION_SECS};
use crate::constants::skew::{CLOCK_SKEW_SECS, DPOP_MAX_AGE_SECS};
use crate::errors::{OAuthError, OAuthResult};
use crate::replay::ReplayManager;
use crate::signer::{decoding_key_from_jwk, jwk_thumbprint, JsonWebKey};

/// DPoP proof JWT header
#[derive(Debug, Deserialize)]
struct ProofHeader {
    typ: Option<String>,
    alg: String,
    jwk: Option<JsonWebKey>,
}

/// DPoP proof JWT claims
#[derive(Debug, Deserialize)]
struct ProofClaims {
    jti: String,
    htm: String,
    htu: String,
    iat: i64,
    #[serde(default)]
    exp: Option<i64>,
    #[serde(default)]
    nonce: Option<String>,
    #[serde(default)]
    ath: Option<String>,
}

/// Result of successful DPoP verification
#[derive(Debug, Clone)]
pub struct VerifiedDpop {
    /// RFC 7638 thumbprint of the proof key
    pub jkt: String,
    /// Proof identifier, already recorded in the replay store
    pub jti: String,
    /// Whether the proof echoed a currently-valid server nonce
    pub nonce_echoed: bool,
}

/// Server-minted DPoP nonces (RFC 9449 §8)
///
/// Nonces are HMAC tags over a coarse time window, so any instance sharing
/// the secret accepts them without storage. The current and a bounded number
/// of previous windows validate.
pub struct DpopNonceManager {
    key: hmac::Key,
}

impl DpopNonceManager {
    #[must_use]
    pub fn new(secret: &[u8]) -> Self {
        Self {
            key: hmac::Key::new(hmac::HMAC_SHA256, secret),
        }
    }

    /// Create with a process-local random secret
    ///
    /// # Errors
    /// Returns an error if the system RNG fails
    pub fn generate() -> Result<Self> {
        use ring::rand::{SecureRandom, SystemRandom};
        let mut secret = [0u8; 32];
        SystemRandom::new()
            .fill(&mut secret)
            .map_err(|_| anyhow!("Failed to generate nonce secret"))?;
        Ok(Self::new(&secret))
    }

    fn nonce_for_window(&self, window: u64) -> String {
        let tag = hmac::sign(&self.key, &window.to_be_bytes());
        URL_SAFE_NO_PAD.encode(tag.as_ref())
    }

    fn current_window() -> u64 {
        Utc::now().timestamp().unsigned_abs() / ROTATION_SECS
    }

    /// Nonce to advertise in the `DPoP-Nonce` response header
    #[must_use]
    pub fn next_nonce(&self) -> String {
        self.nonce_for_window(Self::current_window())
    }

    /// Whether a client-echoed nonce is the current one or a recent one
    #[must_use]
    pub fn check_nonce(&self, nonce: &str) -> bool {
        let current = Self::current_window();
        (0..=RETAINED_WINDOWS)
            .filter_map(|back| current.checked_sub(back))
            .any(|window| self.nonce_for_window(window) == nonce)
    }
}

/// DPoP proof verifier shared by the token and resource paths
pub struct DpopVerifier {
    replay: ReplayManager,
    nonces: DpopNonceManager,
}

impl DpopVerifier {
    #[must_use]
    pub fn new(replay: ReplayManager, nonces: DpopNonceManager) -> Self {
        Self { replay, nonces }
    }

    /// Nonce to advertise on responses
    #[must_use]
    pub fn next_nonce(&self) -> String {
        self.nonces.next_nonce()
    }

    /// Verify a proof bound to `htm`/`htu`, and to `access_token` when the
    /// proof accompanies one. Returns the key thumbprint on success.
    ///
    /// # Errors
    /// `invalid_grant` on any verification failure; the caller decides the
    /// final status (grant path 400, resource path 401).
    pub async fn verify_proof(
        &self,
        proof: &str,
        htm: &str,
        htu: &str,
        access_token: Option<&str>,
    ) -> OAuthResult<VerifiedDpop> {
        let header = decode_proof_header(proof)
            .map_err(|e| OAuthError::InvalidGrant(format!("Invalid DPoP proof: {e}")))?;

        if header.typ.as_deref() != Some("dpop+jwt") {
            return Err(OAuthError::InvalidGrant(
                "DPoP proof typ must be dpop+jwt".to_owned(),
            ));
        }
        let jwk = header.jwk.as_ref().ok_or_else(|| {
            OAuthError::InvalidGrant("DPoP proof header is missing jwk".to_owned())
        })?;
        if jwk.has_private_material() {
            return Err(OAuthError::InvalidGrant(
                "DPoP proof JWK contains private key components".to_owned(),
            ));
        }

        let (decoding_key, algorithm) = decoding_key_from_jwk(jwk)
            .map_err(|e| OAuthError::InvalidGrant(format!("Unacceptable DPoP key: {e}")))?;
        if format!("{algorithm:?}") != header.alg {
            return Err(OAuthError::InvalidGrant(format!(
                "DPoP alg {} does not match the embedded key",
                header.alg
            )));
        }

        let mut validation = jsonwebtoken::Validation::new(algorithm);
        validation.required_spec_claims.clear();
        validation.validate_exp = false;
        validation.validate_aud = false;
        let claims = jsonwebtoken::decode::<ProofClaims>(proof, &decoding_key, &validation)
            .map_err(|e| OAuthError::InvalidGrant(format!("DPoP signature invalid: {e}")))?
            .claims;

        if claims.jti.is_empty() {
            return Err(OAuthError::InvalidGrant(
                "DPoP proof jti must be non-empty".to_owned(),
            ));
        }
        if !claims.htm.eq_ignore_ascii_case(htm) {
            return Err(OAuthError::InvalidGrant(
                "DPoP proof htm does not match the request method".to_owned(),
            ));
        }
        if !htu_matches(&claims.htu, htu) {
            return Err(OAuthError::InvalidGrant(
                "DPoP proof htu does not match the request URL".to_owned(),
            ));
        }

        let now = Utc::now().timestamp();
        if claims.iat < now - DPOP_MAX_AGE_SECS {
            return Err(OAuthError::InvalidGrant("DPoP proof is too old".to_owned()));
        }
        if claims.iat > now + CLOCK_SKEW_SECS {
            return Err(OAuthError::InvalidGrant(
                "DPoP proof iat is in the future".to_owned(),
            ));
        }
        if let Some(exp) = claims.exp {
            if now >= exp {
                return Err(OAuthError::InvalidGrant("DPoP proof has expired".to_owned()));
            }
        }

        let nonce_echoed = match claims.nonce.as_deref() {
            Some(nonce) => {
                if !self.nonces.check_nonce(nonce) {
                    return Err(OAuthError::InvalidGrant(
                        "DPoP proof nonce is not recognized".to_owned(),
                    ));
                }
                true
            }
            None => false,
        };

        if let Some(token) = access_token {
            let expected = compute_ath(token);
            match claims.ath.as_deref() {
                Some(ath) if ath == expected => {}
                Some(_) => {
                    return Err(OAuthError::InvalidGrant(
                        "DPoP proof ath does not match the access token".to_owned(),
                    ))
                }
                None => {
                    return Err(OAuthError::InvalidGrant(
                        "DPoP proof is missing ath for an access-token request".to_owned(),
                    ))
                }
            }
        }

        let jkt = jwk_thumbprint(jwk)
            .map_err(|e| OAuthError::InvalidGrant(format!("Invalid DPoP key: {e}")))?;

        let fresh = self
            .replay
            .unique_dpop(&jkt, &claims.jti)
            .await
            .map_err(OAuthError::from)?;
        if !fresh {
            return Err(OAuthError::InvalidGrant(
                "DPoP proof has been replayed".to_owned(),
            ));
        }

        Ok(VerifiedDpop {
            jkt,
            jti: claims.jti,
            nonce_echoed,
        })
    }
}

/// `ath = base64url(SHA-256(access_token))` (RFC 9449 §4.2)
#[must_use]
pub fn compute_ath(access_token: &str) -> String {
    URL_SAFE_NO_PAD.encode(Sha256::digest(access_token.as_bytes()))
}

/// Parse the JOSE header without verifying; it holds the key the signature
/// check runs under.
fn decode_proof_header(proof: &str) -> Result<ProofHeader> {
    let mut parts = proof.split('.');
    let header_b64 = parts.next().context("DPoP proof has no header")?;
    let _claims = parts.next().context("DPoP proof has no payload")?;
    let _signature = parts.next().context("DPoP proof has no signature")?;
    if parts.next().is_some() {
        return Err(anyhow!("DPoP proof is not a compact JWS"));
    }

    let header_bytes = URL_SAFE_NO_PAD
        .decode(header_b64)
        .context("Failed to decode DPoP header")?;
    serde_json::from_slice(&header_bytes).context("Failed to parse DPoP header")
}

/// `htu` comparison ignores query and fragment (RFC 9449 §4.3)
fn htu_matches(claimed: &str, expected: &str) -> bool {
    let normalize = |raw: &str| -> Option<String> {
        let mut parsed = url::Url::parse(raw).ok()?;
        parsed.set_query(None);
        parsed.set_fragment(None);
        Some(parsed.to_string())
    };
    match (normalize(claimed), normalize(expected)) {
        (Some(a), Some(b)) => a == b,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn htu_ignores_query_and_fragment() {
        assert!(htu_matches(
            "https://as.example/oauth/token?x=1#frag",
            "https://as.example/oauth/token"
        ));
        assert!(!htu_matches(
            "https://as.example/oauth/par",
            "https://as.example/oauth/token"
        ));
        assert!(!htu_matches("not a url", "https://as.example/oauth/token"));
    }

    #[test]
    fn nonce_rotation_accepts_recent_windows() {
        let nonces = DpopNonceManager::new(b"test-secret-test-secret-test-sec");
        let current = nonces.next_nonce();
        assert!(nonces.check_nonce(&current));
        assert!(!nonces.check_nonce("bogus"));
    }

    #[test]
    fn nonce_differs_across_secrets() {
        let a = DpopNonceManager::new(b"secret-a");
        let b = DpopNonceManager::new(b"secret-b");
        assert_ne!(a.next_nonce(), b.next_nonce());
        assert!(!b.check_nonce(&a.next_nonce()));
    }

    #[test]
    fn ath_is_base64url_sha256() {
        let ath = compute_ath("token-value");
        assert!(!ath.contains('='));
        assert_eq!(ath, compute_ath("token-value"));
        assert_ne!(ath, compute_ath("other-token"));
    }
}
