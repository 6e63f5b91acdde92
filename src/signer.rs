// ABOUTME: Issuer key management, JWT signing, and public JWKS distribution
// ABOUTME: RS256 key generation and rotation with historical keys retained for verification
//
// Licensed under either of Apache License, Version 2.0 or MIT License at your option.
// Copyright ©2025 Async-IO.org

//! Issuer signing keys
//!
//! - RSA key pair generation for RS256 JWT signing
//! - JWKS JSON format for public key distribution
//! - Key rotation with old keys retained during the rotation window
//!
//! Private keys never leave the process; public keys are served at
//! `/oauth/jwks`.

use anyhow::{anyhow, Context, Result};
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use chrono::{DateTime, Utc};
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation};
use rsa::{
    pkcs8::{DecodePrivateKey, EncodePrivateKey, EncodePublicKey},
    RsaPrivateKey, RsaPublicKey,
};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;

/// RSA key size in bits for RS256
const RSA_KEY_SIZE: usize = 2048;

/// Number of historical keys retained for verification after rotation
const MAX_HISTORICAL_KEYS: usize = 3;

/// JWK (JSON Web Key) representation
///
/// Also used to parse keys out of client JWKS documents, so the parameter
/// fields are optional: RSA keys carry `n`/`e`, EC keys carry `crv`/`x`/`y`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JsonWebKey {
    /// Key type ("RSA" or "EC")
    pub kty: String,
    /// Public key use
    #[serde(rename = "use", default, skip_serializing_if = "Option::is_none")]
    pub key_use: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alg: Option<String>,
    /// RSA modulus (base64url)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub n: Option<String>,
    /// RSA exponent (base64url)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub e: Option<String>,
    /// EC curve name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub crv: Option<String>,
    /// EC x coordinate (base64url)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub x: Option<String>,
    /// EC y coordinate (base64url)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub y: Option<String>,
    /// RSA private exponent; its presence marks a private key, which is
    /// never acceptable in inbound material
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub d: Option<String>,
}

impl JsonWebKey {
    /// Whether the JWK carries private key components
    #[must_use]
    pub fn has_private_material(&self) -> bool {
        self.d.is_some()
    }
}

/// JWKS (JSON Web Key Set) container
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JsonWebKeySet {
    pub keys: Vec<JsonWebKey>,
}

impl JsonWebKeySet {
    /// Find a key by id, falling back to the sole key of a singleton set
    #[must_use]
    pub fn find_key(&self, kid: Option<&str>) -> Option<&JsonWebKey> {
        match kid {
            Some(kid) => self
                .keys
                .iter()
                .find(|k| k.kid.as_deref() == Some(kid)),
            None => match self.keys.as_slice() {
                [single] => Some(single),
                _ => None,
            },
        }
    }
}

/// Compute the RFC 7638 JWK thumbprint: required members only, sorted keys,
/// no whitespace, SHA-256, base64url.
pub fn jwk_thumbprint(jwk: &JsonWebKey) -> Result<String> {
    // serde_json objects are BTreeMap-backed, so member order is already
    // canonical after serialization.
    let canonical = match jwk.kty.as_str() {
        "RSA" => serde_json::json!({
            "e": jwk.e.as_deref().context("RSA JWK missing e")?,
            "kty": "RSA",
            "n": jwk.n.as_deref().context("RSA JWK missing n")?,
        }),
        "EC" => serde_json::json!({
            "crv": jwk.crv.as_deref().context("EC JWK missing crv")?,
            "kty": "EC",
            "x": jwk.x.as_deref().context("EC JWK missing x")?,
            "y": jwk.y.as_deref().context("EC JWK missing y")?,
        }),
        other => return Err(anyhow!("Unsupported JWK key type: {other}")),
    };
    let serialized = serde_json::to_string(&canonical)?;
    let digest = Sha256::digest(serialized.as_bytes());
    Ok(URL_SAFE_NO_PAD.encode(digest))
}

/// Build a verification key from a public JWK
///
/// Supports the algorithms this server accepts for inbound JWS material:
/// RS256 for RSA keys and ES256 for P-256 keys.
pub fn decoding_key_from_jwk(jwk: &JsonWebKey) -> Result<(DecodingKey, Algorithm)> {
    if jwk.has_private_material() {
        return Err(anyhow!("JWK contains private key components"));
    }
    match jwk.kty.as_str() {
        "RSA" => {
            let n = jwk.n.as_deref().context("RSA JWK missing n")?;
            let e = jwk.e.as_deref().context("RSA JWK missing e")?;
            let key = DecodingKey::from_rsa_components(n, e)
                .context("Failed to build RSA verification key")?;
            Ok((key, Algorithm::RS256))
        }
        "EC" => {
            if jwk.crv.as_deref() != Some("P-256") {
                return Err(anyhow!(
                    "Unsupported EC curve: {}",
                    jwk.crv.as_deref().unwrap_or("<missing>")
                ));
            }
            let x = jwk.x.as_deref().context("EC JWK missing x")?;
            let y = jwk.y.as_deref().context("EC JWK missing y")?;
            let key = DecodingKey::from_ec_components(x, y)
                .context("Failed to build EC verification key")?;
            Ok((key, Algorithm::ES256))
        }
        other => Err(anyhow!("Unsupported JWK key type: {other}")),
    }
}

/// RSA key pair with rotation metadata
#[derive(Clone)]
pub struct RsaSigningKey {
    pub kid: String,
    private_key: RsaPrivateKey,
    public_key: RsaPublicKey,
    pub created_at: DateTime<Utc>,
    pub is_active: bool,
}

impl RsaSigningKey {
    /// Generate a new RS256 key pair
    ///
    /// # Errors
    /// Returns an error if key generation fails
    pub fn generate(kid: &str) -> Result<Self> {
        use rand::rngs::OsRng;

        let mut rng = OsRng;
        let private_key = RsaPrivateKey::new(&mut rng, RSA_KEY_SIZE)
            .map_err(|e| anyhow!("Failed to generate RSA private key: {e}"))?;
        let public_key = RsaPublicKey::from(&private_key);

        Ok(Self {
            kid: kid.to_owned(),
            private_key,
            public_key,
            created_at: Utc::now(),
            is_active: true,
        })
    }

    /// Import a private key from PKCS#8 PEM
    ///
    /// # Errors
    /// Returns an error if PEM parsing fails
    pub fn import_private_key_pem(kid: &str, pem: &str) -> Result<Self> {
        let private_key = RsaPrivateKey::from_pkcs8_pem(pem)
            .map_err(|e| anyhow!("Failed to parse private key PEM: {e}"))?;
        let public_key = RsaPublicKey::from(&private_key);

        Ok(Self {
            kid: kid.to_owned(),
            private_key,
            public_key,
            created_at: Utc::now(),
            is_active: false,
        })
    }

    /// Convert the public half to JWK format
    ///
    /// # Errors
    /// Returns an error if key serialization fails
    pub fn to_jwk(&self) -> Result<JsonWebKey> {
        use rsa::traits::PublicKeyParts;

        let n = URL_SAFE_NO_PAD.encode(self.public_key.n().to_bytes_be());
        let e = URL_SAFE_NO_PAD.encode(self.public_key.e().to_bytes_be());

        Ok(JsonWebKey {
            kty: "RSA".to_owned(),
            key_use: Some("sig".to_owned()),
            kid: Some(self.kid.clone()),
            alg: Some("RS256".to_owned()),
            n: Some(n),
            e: Some(e),
            crv: None,
            x: None,
            y: None,
            d: None,
        })
    }

    /// Export the private key as PKCS#8 PEM
    ///
    /// # Errors
    /// Returns an error if PEM encoding fails
    pub fn export_private_key_pem(&self) -> Result<String> {
        self.private_key
            .to_pkcs8_pem(rsa::pkcs8::LineEnding::LF)
            .map(|pem| pem.to_string())
            .map_err(|e| anyhow!("Failed to export private key as PEM: {e}"))
    }

    fn encoding_key(&self) -> Result<EncodingKey> {
        let pem = self.export_private_key_pem()?;
        EncodingKey::from_rsa_pem(pem.as_bytes())
            .map_err(|e| anyhow!("Failed to create encoding key: {e}"))
    }

    fn decoding_key(&self) -> Result<DecodingKey> {
        let pem = self
            .public_key
            .to_public_key_pem(rsa::pkcs8::LineEnding::LF)
            .map_err(|e| anyhow!("Failed to export public key as PEM: {e}"))?;
        DecodingKey::from_rsa_pem(pem.as_bytes())
            .map_err(|e| anyhow!("Failed to create decoding key: {e}"))
    }
}

/// Issuer signing capability: sign/verify issuer JWTs, expose public JWKS
pub struct Signer {
    issuer: String,
    keys: HashMap<String, RsaSigningKey>,
    active_key_id: Option<String>,
}

impl Signer {
    /// Create a signer with no keys; callers must generate or import one
    #[must_use]
    pub fn new(issuer: &str) -> Self {
        Self {
            issuer: issuer.to_owned(),
            keys: HashMap::new(),
            active_key_id: None,
        }
    }

    /// Create a signer with a freshly generated key
    ///
    /// # Errors
    /// Returns an error if key generation fails
    pub fn generate(issuer: &str) -> Result<Self> {
        let mut signer = Self::new(issuer);
        let kid = format!("key-{}", Utc::now().format("%Y%m%dT%H%M%S"));
        signer.add_key(RsaSigningKey::generate(&kid)?)?;
        Ok(signer)
    }

    /// Issuer identifier stamped into every signed JWT
    #[must_use]
    pub fn issuer(&self) -> &str {
        &self.issuer
    }

    /// Register a key; the first registered key becomes active
    ///
    /// # Errors
    /// Returns an error if the key id collides
    pub fn add_key(&mut self, mut key: RsaSigningKey) -> Result<()> {
        if self.keys.contains_key(&key.kid) {
            return Err(anyhow!("Duplicate key id: {}", key.kid));
        }
        if self.active_key_id.is_none() {
            key.is_active = true;
            self.active_key_id = Some(key.kid.clone());
        }
        self.keys.insert(key.kid.clone(), key);
        Ok(())
    }

    fn active_key(&self) -> Result<&RsaSigningKey> {
        let kid = self
            .active_key_id
            .as_deref()
            .context("No active signing key")?;
        self.keys.get(kid).context("Active key id has no key")
    }

    /// Public JWKS document
    ///
    /// # Errors
    /// Returns an error if key serialization fails
    pub fn get_jwks(&self) -> Result<JsonWebKeySet> {
        let mut keys = Vec::with_capacity(self.keys.len());
        for key in self.keys.values() {
            keys.push(key.to_jwk()?);
        }
        keys.sort_by(|a, b| a.kid.cmp(&b.kid));
        Ok(JsonWebKeySet { keys })
    }

    /// Sign claims as a compact JWS under the active key
    ///
    /// # Errors
    /// Returns an error if no key is active or signing fails
    pub fn sign_claims<T: Serialize>(&self, typ: Option<&str>, claims: &T) -> Result<String> {
        let key = self.active_key()?;
        let mut header = Header::new(Algorithm::RS256);
        header.kid = Some(key.kid.clone());
        if let Some(typ) = typ {
            header.typ = Some(typ.to_owned());
        }
        jsonwebtoken::encode(&header, claims, &key.encoding_key()?)
            .map_err(|e| anyhow!("Failed to sign claims: {e}"))
    }

    /// Verify a compact JWS against any retained key, honoring `kid`.
    ///
    /// `audience` is checked when given; introspection paths pass `None`
    /// because the audience is only known from the verified claims.
    ///
    /// # Errors
    /// Returns an error on malformed tokens, unknown keys, bad signatures,
    /// or expired claims
    pub fn verify_claims<T: DeserializeOwned>(
        &self,
        token: &str,
        audience: Option<&str>,
    ) -> Result<T> {
        let header = jsonwebtoken::decode_header(token)
            .map_err(|e| anyhow!("Malformed JWT header: {e}"))?;

        let mut validation = Validation::new(Algorithm::RS256);
        match audience {
            Some(audience) => validation.set_audience(&[audience]),
            None => validation.validate_aud = false,
        }
        validation.set_issuer(&[&self.issuer]);

        let candidates: Vec<&RsaSigningKey> = match header.kid.as_deref() {
            Some(kid) => self.keys.get(kid).into_iter().collect(),
            None => self.keys.values().collect(),
        };
        if candidates.is_empty() {
            return Err(anyhow!("No verification key for kid {:?}", header.kid));
        }

        let mut last_err = anyhow!("No keys attempted");
        for key in candidates {
            match jsonwebtoken::decode::<T>(token, &key.decoding_key()?, &validation) {
                Ok(data) => return Ok(data.claims),
                Err(e) => last_err = anyhow!("JWT verification failed: {e}"),
            }
        }
        Err(last_err)
    }

    /// Rotate keys: generate a new active key, retire the old one but keep
    /// it available for verification
    ///
    /// # Errors
    /// Returns an error if key generation fails
    pub fn rotate_keys(&mut self) -> Result<String> {
        let kid = format!("key-{}", Utc::now().format("%Y%m%dT%H%M%S%f"));
        let new_key = RsaSigningKey::generate(&kid)?;

        if let Some(old_kid) = self.active_key_id.take() {
            if let Some(old) = self.keys.get_mut(&old_kid) {
                old.is_active = false;
            }
        }
        self.active_key_id = Some(kid.clone());
        self.keys.insert(kid.clone(), new_key);

        // Trim the oldest historical keys beyond the retention window
        while self.keys.len() > MAX_HISTORICAL_KEYS {
            let oldest = self
                .keys
                .values()
                .filter(|k| !k.is_active)
                .min_by_key(|k| k.created_at)
                .map(|k| k.kid.clone());
            match oldest {
                Some(old_kid) => {
                    self.keys.remove(&old_kid);
                }
                None => break,
            }
        }
        Ok(kid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Serialize, Deserialize)]
    struct TestClaims {
        iss: String,
        aud: String,
        sub: String,
        exp: i64,
    }

    fn claims(signer: &Signer) -> TestClaims {
        TestClaims {
            iss: signer.issuer().to_owned(),
            aud: "https://rs.example".to_owned(),
            sub: "did:example:alice".to_owned(),
            exp: Utc::now().timestamp() + 300,
        }
    }

    #[test]
    fn sign_verify_round_trip() {
        let signer = Signer::generate("https://as.example").unwrap();
        let token = signer.sign_claims(Some("at+jwt"), &claims(&signer)).unwrap();
        let verified: TestClaims = signer
            .verify_claims(&token, Some("https://rs.example"))
            .unwrap();
        assert_eq!(verified.sub, "did:example:alice");
    }

    #[test]
    fn verification_survives_rotation() {
        let mut signer = Signer::generate("https://as.example").unwrap();
        let token = signer.sign_claims(None, &claims(&signer)).unwrap();
        signer.rotate_keys().unwrap();
        let verified: TestClaims = signer.verify_claims(&token, None).unwrap();
        assert_eq!(verified.aud, "https://rs.example");
    }

    #[test]
    fn jwks_exposes_no_private_material() {
        let signer = Signer::generate("https://as.example").unwrap();
        let jwks = signer.get_jwks().unwrap();
        assert_eq!(jwks.keys.len(), 1);
        assert!(jwks.keys[0].n.is_some());
        assert!(jwks.keys[0].d.is_none());
    }

    #[test]
    fn ec_thumbprint_matches_rfc7638_shape() {
        let jwk = JsonWebKey {
            kty: "EC".to_owned(),
            key_use: None,
            kid: None,
            alg: None,
            n: None,
            e: None,
            crv: Some("P-256".to_owned()),
            x: Some("WKn-ZIGevcwGIyyrzFoZNBdaq9_TsqzGl96oc0CWuis".to_owned()),
            y: Some("y77t-RvAHRKTsSGdIYUfweuOvwrvDD-Q3Hv5J0fSKbE".to_owned()),
            d: None,
        };
        // Known-answer thumbprint is stable across runs
        let t1 = jwk_thumbprint(&jwk).unwrap();
        let t2 = jwk_thumbprint(&jwk).unwrap();
        assert_eq!(t1, t2);
        assert!(!t1.contains('='));
    }

    #[test]
    fn private_jwk_is_rejected() {
        let mut jwk = Signer::generate("https://as.example")
            .unwrap()
            .get_jwks()
            .unwrap()
            .keys
            .remove(0);
        jwk.d = Some("secret".to_owned());
        assert!(decoding_key_from_jwk(&jwk).is_err());
    }
}
