// ABOUTME: Client metadata resolution, credential verification, and JAR decoding
// ABOUTME: Loopback synthesis, SSRF-safe remote fetch, private_key_jwt and request-object checks
//
// Licensed under either of Apache License, Version 2.0 or MIT License at your option.
// Copyright ©2025 Async-IO.org

//! Client management
//!
//! Clients are identified by URL. Loopback ids get synthesized metadata;
//! remote ids are fetched over an SSRF-guarded channel and cached. Client
//! credentials (`none` / `private_key_jwt`) and JWT-secured authorization
//! requests are verified here against the client's JWKS.

use anyhow::Context;
use chrono::Utc;
use serde::Deserialize;

use crate::constants::skew::{CLIENT_ASSERTION_MAX_AGE_SECS, CLOCK_SKEW_SECS};
use crate::errors::{OAuthError, OAuthResult};
use crate::models::{
    ApplicationType, AuthorizationParameters, ClientAuth, ClientMetadata,
    CLIENT_ASSERTION_TYPE_JWT_BEARER,
};
use crate::replay::ReplayManager;
use crate::signer::{decoding_key_from_jwk, jwk_thumbprint, JsonWebKeySet};

pub mod fetcher;
pub mod loopback;

use fetcher::MetadataFetcher;
use loopback::LoopbackPolicy;

/// Client credentials as presented at a token-ish endpoint
#[derive(Debug, Clone)]
pub enum ClientCredentials {
    None {
        client_id: String,
    },
    JwtBearer {
        client_id: String,
        client_assertion: String,
    },
}

impl ClientCredentials {
    /// Parse out of form fields (RFC 7523 §2.2)
    ///
    /// # Errors
    /// `invalid_request` when `client_id` is missing or the assertion type
    /// is unsupported
    pub fn from_form(
        client_id: Option<&str>,
        client_assertion_type: Option<&str>,
        client_assertion: Option<&str>,
    ) -> OAuthResult<Self> {
        let client_id = client_id
            .filter(|v| !v.is_empty())
            .ok_or_else(|| OAuthError::validation("client_id", "body"))?
            .to_owned();
        match (client_assertion_type, client_assertion) {
            (None, None) => Ok(Self::None { client_id }),
            (Some(CLIENT_ASSERTION_TYPE_JWT_BEARER), Some(assertion)) => Ok(Self::JwtBearer {
                client_id,
                client_assertion: assertion.to_owned(),
            }),
            (Some(other), _) => Err(OAuthError::InvalidRequest(format!(
                "Unsupported client_assertion_type: {other}"
            ))),
            (None, Some(_)) => Err(OAuthError::validation("client_assertion_type", "body")),
        }
    }

    #[must_use]
    pub fn client_id(&self) -> &str {
        match self {
            Self::None { client_id } | Self::JwtBearer { client_id, .. } => client_id,
        }
    }
}

/// Claims of a `private_key_jwt` client assertion
#[derive(Debug, Deserialize)]
struct AssertionClaims {
    iss: String,
    sub: String,
    #[allow(dead_code)]
    aud: serde_json::Value,
    jti: String,
    #[serde(default)]
    iat: Option<i64>,
    #[allow(dead_code)]
    exp: i64,
}

/// A JAR payload: authorization parameters plus the JWT envelope claims
#[derive(Debug, Deserialize)]
struct RequestObjectClaims {
    #[serde(flatten)]
    parameters: AuthorizationParameters,
    iss: String,
    #[allow(dead_code)]
    aud: serde_json::Value,
    jti: String,
    #[serde(default)]
    iat: Option<i64>,
    #[allow(dead_code)]
    #[serde(default)]
    exp: Option<i64>,
}

/// A decoded request object ready for PAR processing
#[derive(Debug)]
pub struct DecodedRequestObject {
    pub parameters: AuthorizationParameters,
    pub jti: String,
    /// Thumbprint of the key that signed the request object
    pub jkt: String,
}

/// Fetch, cache, and validate client metadata; verify client credentials
pub struct ClientManager {
    fetcher: MetadataFetcher,
    loopback: LoopbackPolicy,
    replay: ReplayManager,
    issuer: String,
    first_party_clients: Vec<String>,
}

impl ClientManager {
    #[must_use]
    pub fn new(
        fetcher: MetadataFetcher,
        loopback: LoopbackPolicy,
        replay: ReplayManager,
        issuer: &str,
        first_party_clients: Vec<String>,
    ) -> Self {
        Self {
            fetcher,
            loopback,
            replay,
            issuer: issuer.to_owned(),
            first_party_clients,
        }
    }

    /// Resolve client metadata by id
    ///
    /// # Errors
    /// `invalid_client` when the id is unusable or the document is invalid
    pub async fn get_client(&self, client_id: &str) -> OAuthResult<ClientMetadata> {
        let mut metadata = if self.loopback.matches(client_id) {
            self.loopback.synthesize(client_id)?
        } else {
            let fetched = self
                .fetcher
                .fetch_client_metadata(client_id)
                .await
                .map_err(|e| {
                    tracing::warn!(client_id, "client metadata fetch failed: {e:#}");
                    OAuthError::InvalidClient(format!(
                        "Unable to resolve client metadata: {e}"
                    ))
                })?;
            if fetched.client_id != client_id {
                return Err(OAuthError::InvalidClient(
                    "client_id in metadata document does not match".to_owned(),
                ));
            }
            fetched
        };
        metadata.is_first_party = self.first_party_clients.iter().any(|c| c == client_id);
        Ok(metadata)
    }

    async fn client_jwks(&self, client: &ClientMetadata) -> OAuthResult<JsonWebKeySet> {
        if let Some(jwks) = &client.jwks {
            return Ok(jwks.clone());
        }
        if let Some(uri) = &client.jwks_uri {
            return self.fetcher.fetch_jwks(uri).await.map_err(|e| {
                tracing::warn!(client_id = %client.client_id, "JWKS fetch failed: {e:#}");
                OAuthError::InvalidClient(format!("Unable to resolve client JWKS: {e}"))
            });
        }
        Err(OAuthError::InvalidClient(
            "Client has no JWKS registered".to_owned(),
        ))
    }

    /// Verify the presented credentials against the client's registration.
    ///
    /// Returns the resulting [`ClientAuth`] plus, for assertion-based
    /// methods, the single-use `jti` witness.
    ///
    /// # Errors
    /// `invalid_client` on verification failure, `invalid_grant` on the
    /// native-client method policy (RFC 8252 §8.4) and on assertion replay
    pub async fn verify_credentials(
        &self,
        client: &ClientMetadata,
        credentials: &ClientCredentials,
    ) -> OAuthResult<(ClientAuth, Option<String>)> {
        // Native clients must stay public: a distributable binary cannot
        // hold a credential (RFC 8252 §8.4).
        if client.application_type == ApplicationType::Native {
            if let ClientCredentials::JwtBearer { .. } = credentials {
                return Err(OAuthError::InvalidGrant(
                    "Native clients must authenticate with the \"none\" method".to_owned(),
                ));
            }
        }

        match credentials {
            ClientCredentials::None { .. } => {
                if client.token_endpoint_auth_method != "none" {
                    return Err(OAuthError::InvalidClient(format!(
                        "Client registered {} but presented no credentials",
                        client.token_endpoint_auth_method
                    )));
                }
                Ok((ClientAuth::None, None))
            }
            ClientCredentials::JwtBearer {
                client_id,
                client_assertion,
            } => {
                if client.token_endpoint_auth_method != "private_key_jwt" {
                    return Err(OAuthError::InvalidClient(format!(
                        "Client registered {} but presented a client assertion",
                        client.token_endpoint_auth_method
                    )));
                }
                let (auth, jti) = self
                    .verify_client_assertion(client, client_id, client_assertion)
                    .await?;
                let fresh = self
                    .replay
                    .unique_auth(&jti, client_id)
                    .await
                    .map_err(OAuthError::from)?;
                if !fresh {
                    return Err(OAuthError::InvalidGrant(
                        "Client assertion jti has been replayed".to_owned(),
                    ));
                }
                Ok((auth, Some(jti)))
            }
        }
    }

    async fn verify_client_assertion(
        &self,
        client: &ClientMetadata,
        client_id: &str,
        assertion: &str,
    ) -> OAuthResult<(ClientAuth, String)> {
        let header = jsonwebtoken::decode_header(assertion)
            .map_err(|e| OAuthError::InvalidClient(format!("Malformed client assertion: {e}")))?;

        let jwks = self.client_jwks(client).await?;
        let jwk = jwks.find_key(header.kid.as_deref()).ok_or_else(|| {
            OAuthError::InvalidClient(format!(
                "No client key matches kid {:?}",
                header.kid
            ))
        })?;
        let (decoding_key, algorithm) = decoding_key_from_jwk(jwk)
            .map_err(|e| OAuthError::InvalidClient(format!("Unusable client key: {e}")))?;

        let mut validation = jsonwebtoken::Validation::new(algorithm);
        validation.set_audience(&[&self.issuer]);
        let data =
            jsonwebtoken::decode::<AssertionClaims>(assertion, &decoding_key, &validation)
                .map_err(|e| {
                    OAuthError::InvalidClient(format!("Client assertion rejected: {e}"))
                })?;
        let claims = data.claims;

        if claims.iss != client_id || claims.sub != client_id {
            return Err(OAuthError::InvalidClient(
                "Client assertion iss and sub must equal client_id".to_owned(),
            ));
        }
        if claims.jti.is_empty() {
            return Err(OAuthError::InvalidClient(
                "Client assertion jti must be non-empty".to_owned(),
            ));
        }
        if let Some(iat) = claims.iat {
            let now = Utc::now().timestamp();
            if iat > now + CLOCK_SKEW_SECS || iat < now - CLIENT_ASSERTION_MAX_AGE_SECS {
                return Err(OAuthError::InvalidClient(
                    "Client assertion iat outside the acceptance window".to_owned(),
                ));
            }
        }

        let jkt = jwk_thumbprint(jwk)
            .map_err(|e| OAuthError::InvalidClient(format!("Unusable client key: {e}")))?;
        let auth = ClientAuth::PrivateKeyJwt {
            kid: header.kid.unwrap_or_default(),
            alg: format!("{algorithm:?}"),
            jkt,
        };
        Ok((auth, claims.jti))
    }

    /// Decode and validate a JWT-secured authorization request (RFC 9101).
    ///
    /// # Errors
    /// `invalid_request` on malformed, mis-signed, or replayed objects
    pub async fn decode_request_object(
        &self,
        client: &ClientMetadata,
        request_object: &str,
    ) -> OAuthResult<DecodedRequestObject> {
        let header = jsonwebtoken::decode_header(request_object)
            .map_err(|e| OAuthError::InvalidRequest(format!("Malformed request object: {e}")))?;

        let jwks = self.client_jwks(client).await.map_err(|_| {
            OAuthError::InvalidRequest(
                "Client has no JWKS to verify the request object against".to_owned(),
            )
        })?;
        let jwk = jwks.find_key(header.kid.as_deref()).ok_or_else(|| {
            OAuthError::InvalidRequest(format!("No client key matches kid {:?}", header.kid))
        })?;
        let (decoding_key, algorithm) = decoding_key_from_jwk(jwk)
            .map_err(|e| OAuthError::InvalidRequest(format!("Unusable client key: {e}")))?;

        let mut validation = jsonwebtoken::Validation::new(algorithm);
        validation.set_audience(&[&self.issuer]);
        // `exp` is recommended but not universal on request objects; `iat`
        // freshness below covers the lifetime bound.
        validation.required_spec_claims.clear();
        validation.validate_exp = false;
        let data = jsonwebtoken::decode::<RequestObjectClaims>(
            request_object,
            &decoding_key,
            &validation,
        )
        .map_err(|e| OAuthError::InvalidRequest(format!("Request object rejected: {e}")))?;
        let claims = data.claims;

        if claims.iss != client.client_id {
            return Err(OAuthError::InvalidRequest(
                "Request object iss must equal client_id".to_owned(),
            ));
        }
        if claims.jti.is_empty() {
            return Err(OAuthError::InvalidRequest(
                "Request object jti must be non-empty".to_owned(),
            ));
        }
        if let Some(iat) = claims.iat {
            let now = Utc::now().timestamp();
            if iat > now + CLOCK_SKEW_SECS {
                return Err(OAuthError::InvalidRequest(
                    "Request object iat is in the future".to_owned(),
                ));
            }
        }

        let fresh = self
            .replay
            .unique_jar(&claims.jti, &client.client_id)
            .await
            .map_err(OAuthError::from)?;
        if !fresh {
            return Err(OAuthError::InvalidRequest(
                "Request object has been replayed".to_owned(),
            ));
        }

        let jkt = jwk_thumbprint(jwk)
            .context("thumbprint of verified key")
            .map_err(OAuthError::from)?;
        Ok(DecodedRequestObject {
            parameters: claims.parameters,
            jti: claims.jti,
            jkt,
        })
    }
}
