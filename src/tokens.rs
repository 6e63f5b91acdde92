// ABOUTME: Token issuance, refresh rotation, revocation, and introspection
// ABOUTME: PKCE verification, DPoP binding enforcement, and lineage revocation on replay
//
// Licensed under either of Apache License, Version 2.0 or MIT License at your option.
// Copyright ©2025 Async-IO.org

//! Token management
//!
//! Access tokens are RS256 JWTs whose `jti` is the opaque token id; refresh
//! tokens are opaque and single-use. Rotation is linearized per lineage via
//! the store's compare-and-swap on the current refresh value; presenting a
//! rotated-out refresh token revokes the entire lineage.

use anyhow::anyhow;
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use chrono::{Duration, Utc};
use ring::rand::{SecureRandom, SystemRandom};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::time::{Duration as StdDuration, Instant};
use subtle::ConstantTimeEq;
use uuid::Uuid;

use crate::constants::tokens::{
    ACCESS_TOKEN_EXPIRY_FLOOR_SECS, INTROSPECTION_FLOOR_MS, REFRESH_TOKEN_EXPIRY_SECS,
    REFRESH_TOKEN_PREFIX, TOKEN_ID_PREFIX,
};
use crate::errors::{OAuthError, OAuthResult};
use crate::models::{
    AccessTokenClaims, Account, AuthorizationRequestRecord, ClientAuth, ClientMetadata,
    Confirmation, IntrospectionResponse, TokenParameters, TokenRecord, TokenResponse,
    GRANT_REFRESH_TOKEN,
};
use crate::signer::Signer;
use crate::store::{RefreshRotation, TokenStore};

/// JWT `typ` stamped on issued access tokens (RFC 9068)
const ACCESS_TOKEN_TYP: &str = "at+jwt";

/// Create, refresh, revoke, and introspect tokens with DPoP binding
pub struct TokenManager {
    store: Arc<dyn TokenStore>,
    signer: Arc<Signer>,
    access_token_expiry: Duration,
    rng: SystemRandom,
}

impl TokenManager {
    /// `access_token_expiry_secs` is clamped to the enforced floor
    #[must_use]
    pub fn new(
        store: Arc<dyn TokenStore>,
        signer: Arc<Signer>,
        access_token_expiry_secs: i64,
    ) -> Self {
        Self {
            store,
            signer,
            access_token_expiry: Duration::seconds(
                access_token_expiry_secs.max(ACCESS_TOKEN_EXPIRY_FLOOR_SECS),
            ),
            rng: SystemRandom::new(),
        }
    }

    fn random_value(&self, prefix: &str) -> OAuthResult<String> {
        let mut bytes = [0u8; 24];
        self.rng
            .fill(&mut bytes)
            .map_err(|_| anyhow!("System RNG failure"))
            .map_err(OAuthError::from)?;
        Ok(format!("{prefix}{}", URL_SAFE_NO_PAD.encode(bytes)))
    }

    /// Exchange a consumed authorization request for tokens.
    ///
    /// PKCE is verified here; DPoP binding must agree with what the
    /// authorization was created under. The caller has already consumed the
    /// code via the request manager.
    ///
    /// # Errors
    /// `invalid_grant` on PKCE or binding failures
    pub async fn create(
        &self,
        client: &ClientMetadata,
        client_auth: &ClientAuth,
        account: &Account,
        request: &AuthorizationRequestRecord,
        code_verifier: Option<&str>,
        dpop_jkt: Option<&str>,
    ) -> OAuthResult<TokenResponse> {
        verify_pkce(
            request.parameters.code_challenge.as_deref(),
            request.parameters.code_challenge_method.as_deref(),
            code_verifier,
        )?;

        // Sender-constraining must carry over exactly from the
        // authorization: a bound flow needs the same key, a bearer flow
        // must stay bearer.
        let bound_jkt = match (request.parameters.dpop_jkt.as_deref(), dpop_jkt) {
            (Some(expected), Some(presented)) if expected == presented => Some(expected),
            (Some(_), Some(_)) => {
                return Err(OAuthError::InvalidGrant(
                    "DPoP proof key does not match the authorization".to_owned(),
                ))
            }
            (Some(_), None) => {
                return Err(OAuthError::InvalidGrant(
                    "This authorization requires a DPoP proof".to_owned(),
                ))
            }
            (None, Some(_)) => {
                return Err(OAuthError::InvalidGrant(
                    "DPoP proof presented for a bearer authorization".to_owned(),
                ))
            }
            (None, None) => None,
        };

        let now = Utc::now();
        let token_id = self.random_value(TOKEN_ID_PREFIX)?;
        let lineage_id = format!("lin-{}", Uuid::new_v4().simple());
        let expires_at = now + self.access_token_expiry;

        let refresh_token = if client.allows_grant_type(GRANT_REFRESH_TOKEN) {
            Some(self.random_value(REFRESH_TOKEN_PREFIX)?)
        } else {
            None
        };

        let parameters = TokenParameters {
            scope: request.parameters.scope.clone(),
            dpop_jkt: bound_jkt.map(str::to_owned),
        };
        let record = TokenRecord {
            token_id: token_id.clone(),
            lineage_id,
            client_id: client.client_id.clone(),
            client_auth: client_auth.clone(),
            sub: account.sub.clone(),
            aud: account.aud.clone(),
            device_id: request.device_id.clone(),
            parameters: parameters.clone(),
            code: request.code.clone(),
            refresh_token: refresh_token.clone(),
            refresh_expires_at: refresh_token
                .as_ref()
                .map(|_| now + Duration::seconds(REFRESH_TOKEN_EXPIRY_SECS)),
            rotation_count: 0,
            created_at: now,
            updated_at: now,
            expires_at,
        };
        let inserted = self.store.insert(record).await.map_err(OAuthError::from)?;
        if !inserted {
            return Err(OAuthError::ServerError(
                "Token identifier collision".to_owned(),
            ));
        }

        let access_token = self.sign_access_token(client, account, &token_id, &parameters, now)?;
        tracing::info!(
            client_id = %client.client_id,
            sub = %account.sub,
            dpop = bound_jkt.is_some(),
            "access token issued"
        );
        Ok(TokenResponse {
            access_token,
            token_type: token_type(bound_jkt.is_some()),
            expires_in: self.access_token_expiry.num_seconds(),
            refresh_token,
            scope: parameters.scope,
            sub: Some(account.sub.clone()),
        })
    }

    fn sign_access_token(
        &self,
        client: &ClientMetadata,
        account: &Account,
        token_id: &str,
        parameters: &TokenParameters,
        now: chrono::DateTime<Utc>,
    ) -> OAuthResult<String> {
        let claims = AccessTokenClaims {
            iss: self.signer.issuer().to_owned(),
            aud: account.aud.clone(),
            sub: account.sub.clone(),
            client_id: client.client_id.clone(),
            scope: parameters.scope.clone(),
            jti: token_id.to_owned(),
            iat: now.timestamp(),
            exp: (now + self.access_token_expiry).timestamp(),
            cnf: parameters
                .dpop_jkt
                .clone()
                .map(|jkt| Confirmation { jkt }),
        };
        self.signer
            .sign_claims(Some(ACCESS_TOKEN_TYP), &claims)
            .map_err(OAuthError::from)
    }

    /// Rotate a refresh token, revoking the lineage on replay.
    ///
    /// # Errors
    /// `invalid_grant` on unknown, expired, replayed, or mismatched tokens
    pub async fn refresh(
        &self,
        client: &ClientMetadata,
        client_auth: &ClientAuth,
        refresh_token: &str,
        dpop_jkt: Option<&str>,
    ) -> OAuthResult<TokenResponse> {
        let now = Utc::now();
        let next_token_id = self.random_value(TOKEN_ID_PREFIX)?;
        let next_refresh = self.random_value(REFRESH_TOKEN_PREFIX)?;

        let outcome = self
            .store
            .rotate_refresh(
                refresh_token,
                &next_token_id,
                &next_refresh,
                now,
                now + self.access_token_expiry,
                now + Duration::seconds(REFRESH_TOKEN_EXPIRY_SECS),
            )
            .await
            .map_err(OAuthError::from)?;

        let record = match outcome {
            RefreshRotation::Rotated(record) => record,
            RefreshRotation::Replayed(record) => {
                tracing::warn!(
                    lineage_id = %record.lineage_id,
                    client_id = %record.client_id,
                    "refresh token replay; revoking lineage"
                );
                self.store
                    .delete_lineage(&record.lineage_id)
                    .await
                    .map_err(OAuthError::from)?;
                return Err(OAuthError::InvalidGrant(
                    "Refresh token reuse detected".to_owned(),
                ));
            }
            RefreshRotation::NotFound => {
                return Err(OAuthError::InvalidGrant(
                    "Invalid refresh token".to_owned(),
                ))
            }
        };

        // Validation happens on the post-rotation snapshot: the CAS already
        // serialized us, and a mismatch here is an attack signal that burns
        // the lineage rather than leaving it usable.
        let check = || -> OAuthResult<()> {
            if record.client_id != client.client_id {
                return Err(OAuthError::InvalidGrant(
                    "Refresh token was issued to a different client".to_owned(),
                ));
            }
            if !record.client_auth.same_method(client_auth) {
                return Err(OAuthError::InvalidGrant(
                    "Refresh token was issued under a different client authentication method"
                        .to_owned(),
                ));
            }
            match (record.parameters.dpop_jkt.as_deref(), dpop_jkt) {
                (Some(expected), Some(presented)) if expected == presented => Ok(()),
                (None, None) => Ok(()),
                _ => Err(OAuthError::InvalidGrant(
                    "DPoP binding does not match the refresh token".to_owned(),
                )),
            }
        };
        if let Err(err) = check() {
            self.store
                .delete_lineage(&record.lineage_id)
                .await
                .map_err(OAuthError::from)?;
            return Err(err);
        }

        let account = Account {
            sub: record.sub.clone(),
            aud: record.aud.clone(),
            preferred_username: None,
        };
        let access_token =
            self.sign_access_token_for_record(client, &account, &record, now)?;
        Ok(TokenResponse {
            access_token,
            token_type: token_type(record.parameters.dpop_jkt.is_some()),
            expires_in: self.access_token_expiry.num_seconds(),
            refresh_token: Some(next_refresh),
            scope: record.parameters.scope.clone(),
            sub: Some(record.sub),
        })
    }

    fn sign_access_token_for_record(
        &self,
        client: &ClientMetadata,
        account: &Account,
        record: &TokenRecord,
        now: chrono::DateTime<Utc>,
    ) -> OAuthResult<String> {
        let claims = AccessTokenClaims {
            iss: self.signer.issuer().to_owned(),
            aud: account.aud.clone(),
            sub: record.sub.clone(),
            client_id: client.client_id.clone(),
            scope: record.parameters.scope.clone(),
            jti: record.token_id.clone(),
            iat: now.timestamp(),
            exp: (now + self.access_token_expiry).timestamp(),
            cnf: record
                .parameters
                .dpop_jkt
                .clone()
                .map(|jkt| Confirmation { jkt }),
        };
        self.signer
            .sign_claims(Some(ACCESS_TOKEN_TYP), &claims)
            .map_err(OAuthError::from)
    }

    /// Best-effort, idempotent revocation accepting an access token JWT, an
    /// opaque token id, a refresh token, or an authorization code.
    ///
    /// # Errors
    /// `server_error` only on store failure; unknown tokens are a no-op
    pub async fn revoke(&self, token: &str) -> OAuthResult<()> {
        if let Some(record) = self.resolve(token).await? {
            tracing::info!(lineage_id = %record.lineage_id, "token lineage revoked");
            self.store
                .delete_lineage(&record.lineage_id)
                .await
                .map_err(OAuthError::from)?;
        }
        Ok(())
    }

    /// Revoke whatever lineage an authorization code produced. Used when a
    /// code is replayed (invariant: second redemption revokes the first's
    /// tokens).
    ///
    /// # Errors
    /// `server_error` on store failure
    pub async fn revoke_by_code(&self, code: &str) -> OAuthResult<()> {
        if let Some(record) = self
            .store
            .get_by_code(code)
            .await
            .map_err(OAuthError::from)?
        {
            tracing::warn!(
                lineage_id = %record.lineage_id,
                "authorization code replay; revoking derived tokens"
            );
            self.store
                .delete_lineage(&record.lineage_id)
                .await
                .map_err(OAuthError::from)?;
        }
        Ok(())
    }

    async fn resolve(&self, token: &str) -> OAuthResult<Option<TokenRecord>> {
        // Access token JWT: trust only the verified jti
        if token.contains('.') {
            if let Ok(claims) = self
                .signer
                .verify_claims::<AccessTokenClaims>(token, None)
            {
                return self
                    .store
                    .get_by_token_id(&claims.jti)
                    .await
                    .map_err(OAuthError::from);
            }
            return Ok(None);
        }
        if token.starts_with(REFRESH_TOKEN_PREFIX) {
            return self
                .store
                .get_by_refresh(token)
                .await
                .map_err(OAuthError::from);
        }
        if token.starts_with(TOKEN_ID_PREFIX) {
            return self
                .store
                .get_by_token_id(token)
                .await
                .map_err(OAuthError::from);
        }
        if let Some(record) = self
            .store
            .get_by_code(token)
            .await
            .map_err(OAuthError::from)?
        {
            return Ok(Some(record));
        }
        Ok(None)
    }

    /// Introspection on behalf of a client (RFC 7662). The caller must be
    /// the token's original client; any failure reads as an inactive token
    /// after a constant-time floor.
    ///
    /// # Errors
    /// Never — failures are folded into `{active: false}` by design
    pub async fn client_token_info(
        &self,
        client: &ClientMetadata,
        client_auth: &ClientAuth,
        token: &str,
    ) -> IntrospectionResponse {
        let started = Instant::now();
        let result = self.introspect_inner(client, client_auth, token).await;
        match result {
            Some(info) => info,
            None => {
                // Invalid tokens answer in near-constant time so existence
                // cannot be probed through latency.
                let floor = StdDuration::from_millis(INTROSPECTION_FLOOR_MS);
                let elapsed = started.elapsed();
                if elapsed < floor {
                    tokio::time::sleep(floor - elapsed).await;
                }
                IntrospectionResponse::inactive()
            }
        }
    }

    async fn introspect_inner(
        &self,
        client: &ClientMetadata,
        client_auth: &ClientAuth,
        token: &str,
    ) -> Option<IntrospectionResponse> {
        let record = self.resolve(token).await.ok()??;
        if record.client_id != client.client_id {
            return None;
        }
        if !record.client_auth.same_method(client_auth) {
            return None;
        }
        if record.is_expired(Utc::now()) {
            return None;
        }
        Some(IntrospectionResponse {
            active: true,
            scope: record.parameters.scope.clone(),
            client_id: Some(record.client_id.clone()),
            username: None,
            token_type: Some(token_type(record.parameters.dpop_jkt.is_some())),
            exp: Some(record.expires_at.timestamp()),
            iat: Some(record.updated_at.timestamp()),
            sub: Some(record.sub.clone()),
            aud: Some(record.aud.clone()),
            iss: Some(self.signer.issuer().to_owned()),
            jti: Some(record.token_id),
            cnf: record
                .parameters
                .dpop_jkt
                .map(|jkt| Confirmation { jkt }),
        })
    }

    /// Resource-server-side validation of an opaque token id, enforcing the
    /// DPoP binding on every presentation.
    ///
    /// # Errors
    /// `invalid_grant` on unknown/expired tokens or a thumbprint mismatch;
    /// the transport layer maps this to a 401
    pub async fn authenticate_token_id(
        &self,
        token_id: &str,
        dpop_jkt: Option<&str>,
    ) -> OAuthResult<TokenRecord> {
        let Some(record) = self
            .store
            .get_by_token_id(token_id)
            .await
            .map_err(OAuthError::from)?
        else {
            return Err(OAuthError::InvalidGrant("Unknown token".to_owned()));
        };
        if record.is_expired(Utc::now()) {
            return Err(OAuthError::InvalidGrant("Token has expired".to_owned()));
        }
        match (record.parameters.dpop_jkt.as_deref(), dpop_jkt) {
            (Some(expected), Some(presented)) if expected == presented => {}
            (None, None) => {}
            _ => {
                return Err(OAuthError::InvalidGrant(
                    "DPoP key binding mismatch".to_owned(),
                ))
            }
        }
        Ok(record)
    }

    /// Verify an access token JWT end to end (signature, expiry, record)
    ///
    /// # Errors
    /// `invalid_grant` when the token does not verify or its record is gone
    pub async fn verify_access_token(
        &self,
        access_token: &str,
        dpop_jkt: Option<&str>,
    ) -> OAuthResult<(AccessTokenClaims, TokenRecord)> {
        let claims = self
            .signer
            .verify_claims::<AccessTokenClaims>(access_token, None)
            .map_err(|e| OAuthError::InvalidGrant(format!("Invalid access token: {e}")))?;
        let record = self.authenticate_token_id(&claims.jti, dpop_jkt).await?;
        Ok((claims, record))
    }
}

fn token_type(dpop_bound: bool) -> String {
    if dpop_bound { "DPoP" } else { "Bearer" }.to_owned()
}

/// PKCE verification (RFC 7636 §4.6): `S256` mandatory where declared,
/// `plain` only when the authorization was created with it.
fn verify_pkce(
    code_challenge: Option<&str>,
    code_challenge_method: Option<&str>,
    code_verifier: Option<&str>,
) -> OAuthResult<()> {
    let Some(stored_challenge) = code_challenge else {
        if code_verifier.is_some() {
            return Err(OAuthError::InvalidGrant(
                "code_verifier provided but no code_challenge was issued".to_owned(),
            ));
        }
        return Ok(());
    };
    let verifier = code_verifier.ok_or_else(|| {
        OAuthError::InvalidGrant("code_verifier is required".to_owned())
    })?;

    if verifier.len() < 43 || verifier.len() > 128 {
        return Err(OAuthError::InvalidGrant(
            "code_verifier must be between 43 and 128 characters".to_owned(),
        ));
    }
    if !verifier
        .chars()
        .all(|c| matches!(c, 'A'..='Z' | 'a'..='z' | '0'..='9' | '-' | '.' | '_' | '~'))
    {
        return Err(OAuthError::InvalidGrant(
            "code_verifier contains invalid characters".to_owned(),
        ));
    }

    let computed = match code_challenge_method.unwrap_or("S256") {
        "S256" => URL_SAFE_NO_PAD.encode(Sha256::digest(verifier.as_bytes())),
        "plain" => verifier.to_owned(),
        other => {
            return Err(OAuthError::InvalidGrant(format!(
                "Unsupported code_challenge_method: {other}"
            )))
        }
    };

    if computed
        .as_bytes()
        .ct_eq(stored_challenge.as_bytes())
        .into()
    {
        Ok(())
    } else {
        Err(OAuthError::InvalidGrant("Invalid code_verifier".to_owned()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn s256_challenge(verifier: &str) -> String {
        URL_SAFE_NO_PAD.encode(Sha256::digest(verifier.as_bytes()))
    }

    #[test]
    fn pkce_s256_round_trip() {
        let verifier = "dBjftJeZ4CVP-mB92K27uhbUJU1p1r_wW1gFWFOEjXk";
        let challenge = s256_challenge(verifier);
        assert!(verify_pkce(Some(&challenge), Some("S256"), Some(verifier)).is_ok());
    }

    #[test]
    fn pkce_mismatch_fails() {
        let challenge = s256_challenge("dBjftJeZ4CVP-mB92K27uhbUJU1p1r_wW1gFWFOEjXk");
        let err = verify_pkce(
            Some(&challenge),
            Some("S256"),
            Some("aWrongVerifierValueAWrongVerifierValueAWrongVal"),
        )
        .unwrap_err();
        assert_eq!(err.code(), "invalid_grant");
    }

    #[test]
    fn pkce_verifier_charset_is_enforced() {
        let challenge = s256_challenge("x");
        let err = verify_pkce(
            Some(&challenge),
            Some("S256"),
            Some("contains spaces which are not allowed in a verifier"),
        )
        .unwrap_err();
        assert_eq!(err.code(), "invalid_grant");
    }

    #[test]
    fn pkce_plain_compares_directly() {
        let verifier = "plain-verifier-plain-verifier-plain-verifier-pl";
        assert!(verify_pkce(Some(verifier), Some("plain"), Some(verifier)).is_ok());
    }

    #[test]
    fn pkce_missing_verifier_fails() {
        let challenge = s256_challenge("x");
        assert!(verify_pkce(Some(&challenge), Some("S256"), None).is_err());
    }

    #[test]
    fn pkce_unexpected_verifier_fails() {
        assert!(verify_pkce(None, None, Some("whatever-verifier-whatever-verifier-whatever")).is_err());
    }
}
