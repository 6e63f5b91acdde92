// ABOUTME: Authorization-request state machine keyed by opaque request_uri
// ABOUTME: Creation, device binding, code issuance, and atomic code consumption
//
// Licensed under either of Apache License, Version 2.0 or MIT License at your option.
// Copyright ©2025 Async-IO.org

//! Request lifecycle
//!
//! `Pending → Bound(device) → Authorized(code, sub) → Consumed`, with the
//! record deleted on consumption or TTL. Every transition is a stage-guarded
//! conditional update, so `set_authorized` is serialized per `request_uri`
//! and code consumption cannot double-spend.

use anyhow::anyhow;
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use chrono::{DateTime, Duration, Utc};
use ring::rand::{SecureRandom, SystemRandom};
use std::sync::Arc;

use crate::constants::requests::{
    CODE_EXPIRY_SECS, CODE_PREFIX, PAR_EXPIRY_SECS, REQUEST_URI_PREFIX, SLIDING_TTL_SECS,
};
use crate::errors::{OAuthError, OAuthResult};
use crate::models::{
    AuthorizationParameters, AuthorizationRequestRecord, ClientAuth, ClientMetadata,
    RequestStage,
};
use crate::replay::ReplayManager;
use crate::store::RequestStore;

/// Outcome of creating an authorization request
#[derive(Debug, Clone)]
pub struct CreatedRequest {
    pub uri: String,
    pub expires_at: DateTime<Utc>,
}

/// Owns the authorization-request record through its state machine
pub struct RequestManager {
    store: Arc<dyn RequestStore>,
    replay: ReplayManager,
    rng: SystemRandom,
}

impl RequestManager {
    #[must_use]
    pub fn new(store: Arc<dyn RequestStore>, replay: ReplayManager) -> Self {
        Self {
            store,
            replay,
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

    /// Validate parameters against the client and persist a fresh request.
    ///
    /// # Errors
    /// `invalid_request` / `invalid_scope` on parameter problems,
    /// `invalid_grant` on a reused `code_challenge`
    pub async fn create_authorization_request(
        &self,
        client: &ClientMetadata,
        client_auth: ClientAuth,
        mut parameters: AuthorizationParameters,
        device_id: Option<&str>,
        dpop_jkt: Option<&str>,
    ) -> OAuthResult<CreatedRequest> {
        self.validate_parameters(client, &mut parameters, dpop_jkt)?;

        let fresh = self
            .replay
            .unique_code_challenge(
                parameters
                    .code_challenge
                    .as_deref()
                    .unwrap_or_default(),
            )
            .await
            .map_err(OAuthError::from)?;
        if !fresh {
            return Err(OAuthError::InvalidGrant(
                "code_challenge was already used".to_owned(),
            ));
        }

        let now = Utc::now();
        let expires_at = now + Duration::seconds(PAR_EXPIRY_SECS);
        // Collisions in a 192-bit space are store corruption in practice,
        // but the put-if-absent contract makes the retry loop free.
        for _ in 0..3 {
            let uri = self.random_value(REQUEST_URI_PREFIX)?;
            let record = AuthorizationRequestRecord {
                uri: uri.clone(),
                client_id: client.client_id.clone(),
                client_auth: client_auth.clone(),
                parameters: parameters.clone(),
                stage: if device_id.is_some() {
                    RequestStage::Bound
                } else {
                    RequestStage::Pending
                },
                device_id: device_id.map(str::to_owned),
                sub: None,
                code: None,
                code_expires_at: None,
                created_at: now,
                expires_at,
            };
            if self.store.create(record).await.map_err(OAuthError::from)? {
                return Ok(CreatedRequest { uri, expires_at });
            }
        }
        Err(OAuthError::ServerError(
            "Unable to allocate a request_uri".to_owned(),
        ))
    }

    fn validate_parameters(
        &self,
        client: &ClientMetadata,
        parameters: &mut AuthorizationParameters,
        dpop_jkt: Option<&str>,
    ) -> OAuthResult<()> {
        let response_type = parameters
            .response_type
            .as_deref()
            .ok_or_else(|| OAuthError::validation("response_type", "body"))?;
        if response_type != "code" || !client.response_types.iter().any(|r| r == "code") {
            return Err(OAuthError::InvalidRequest(format!(
                "Unsupported response_type: {response_type}"
            )));
        }

        match parameters.redirect_uri.as_deref() {
            Some(redirect_uri) => {
                if !client.allows_redirect_uri(redirect_uri) {
                    return Err(OAuthError::validation("redirect_uri", "body"));
                }
            }
            None => {
                let default = client.default_redirect_uri().ok_or_else(|| {
                    OAuthError::InvalidRequest(
                        "redirect_uri is required for this client".to_owned(),
                    )
                })?;
                parameters.redirect_uri = Some(default.to_owned());
            }
        }

        if let Some(scope) = parameters.scope.as_deref() {
            if !client.allows_scope(scope) {
                return Err(OAuthError::InvalidScope(
                    "Requested scope exceeds the client registration".to_owned(),
                ));
            }
        }

        let challenge = parameters
            .code_challenge
            .as_deref()
            .filter(|c| !c.is_empty())
            .ok_or_else(|| {
                OAuthError::InvalidRequest(
                    "code_challenge is required for the code flow".to_owned(),
                )
            })?;
        if challenge.len() < 43 || challenge.len() > 128 {
            return Err(OAuthError::validation("code_challenge", "body"));
        }
        let method = parameters
            .code_challenge_method
            .get_or_insert_with(|| "S256".to_owned())
            .clone();
        match method.as_str() {
            "S256" => {}
            "plain" => {
                if client.is_public() {
                    return Err(OAuthError::InvalidRequest(
                        "Public clients must use code_challenge_method S256".to_owned(),
                    ));
                }
            }
            other => {
                return Err(OAuthError::InvalidRequest(format!(
                    "Unsupported code_challenge_method: {other}"
                )))
            }
        }

        // A DPoP proof presented at PAR pre-binds the whole flow to its key
        if let Some(proof_jkt) = dpop_jkt {
            match parameters.dpop_jkt.as_deref() {
                Some(declared) if declared != proof_jkt => {
                    return Err(OAuthError::InvalidRequest(
                        "dpop_jkt does not match the DPoP proof".to_owned(),
                    ))
                }
                _ => parameters.dpop_jkt = Some(proof_jkt.to_owned()),
            }
        }
        Ok(())
    }

    /// Retrieve for the interactive `/oauth/authorize` GET, binding the
    /// request to the presenting device and extending the TTL by a bounded
    /// delta. Single-use: only a `Pending` request is retrievable, so a
    /// second GET fails even from the same device.
    ///
    /// # Errors
    /// `invalid_grant` when missing, expired, already used, or raced
    pub async fn get_for_authorize(
        &self,
        uri: &str,
        device_id: &str,
        expected_client_id: &str,
    ) -> OAuthResult<AuthorizationRequestRecord> {
        let record = self.load_live(uri).await?;
        if record.client_id != expected_client_id {
            return Err(OAuthError::InvalidGrant(
                "request_uri was issued to another client".to_owned(),
            ));
        }
        if record.stage != RequestStage::Pending {
            return Err(OAuthError::InvalidGrant(
                "request_uri has already been used".to_owned(),
            ));
        }

        let mut bound = record;
        bound.stage = RequestStage::Bound;
        bound.device_id = Some(device_id.to_owned());
        bound.expires_at = Utc::now() + Duration::seconds(SLIDING_TTL_SECS);
        let applied = self
            .store
            .update_if_stage(uri, RequestStage::Pending, bound.clone())
            .await
            .map_err(OAuthError::from)?;
        if !applied {
            return Err(OAuthError::InvalidGrant(
                "request_uri has already been used".to_owned(),
            ));
        }
        Ok(bound)
    }

    /// Retrieve a device-bound request for the accept/reject step
    ///
    /// # Errors
    /// `invalid_grant` when missing, expired, or bound elsewhere
    pub async fn get_bound(
        &self,
        uri: &str,
        device_id: &str,
    ) -> OAuthResult<AuthorizationRequestRecord> {
        let record = self.load_live(uri).await?;
        if record.stage != RequestStage::Bound
            || record.device_id.as_deref() != Some(device_id)
        {
            return Err(OAuthError::InvalidGrant(
                "request_uri is not awaiting consent on this device".to_owned(),
            ));
        }
        Ok(record)
    }

    async fn load_live(&self, uri: &str) -> OAuthResult<AuthorizationRequestRecord> {
        let Some(record) = self.store.get(uri).await.map_err(OAuthError::from)? else {
            return Err(OAuthError::InvalidGrant("Unknown request_uri".to_owned()));
        };
        if record.is_expired(Utc::now()) {
            self.store.delete(uri).await.map_err(OAuthError::from)?;
            return Err(OAuthError::InvalidGrant("request_uri has expired".to_owned()));
        }
        Ok(record)
    }

    /// Transition to `Authorized`, minting the single-use code.
    ///
    /// Serialized per `uri`: the stage guard makes a second authorization
    /// attempt fail.
    ///
    /// # Errors
    /// `invalid_grant` when the request is not in a consentable state
    pub async fn set_authorized(
        &self,
        uri: &str,
        device_id: &str,
        sub: &str,
    ) -> OAuthResult<String> {
        let record = self.get_bound(uri, device_id).await?;

        let code = self.random_value(CODE_PREFIX)?;
        let mut authorized = record;
        authorized.stage = RequestStage::Authorized;
        authorized.sub = Some(sub.to_owned());
        authorized.code = Some(code.clone());
        authorized.code_expires_at = Some(Utc::now() + Duration::seconds(CODE_EXPIRY_SECS));

        let applied = self
            .store
            .update_if_stage(uri, RequestStage::Bound, authorized)
            .await
            .map_err(OAuthError::from)?;
        if !applied {
            return Err(OAuthError::InvalidGrant(
                "Authorization request was already decided".to_owned(),
            ));
        }
        Ok(code)
    }

    /// Atomically consume an authorization code for token issuance.
    ///
    /// The original client and the exact client-auth method must match.
    /// The record is deleted on success; callers revoke any token derived
    /// from the code whenever this returns an error.
    ///
    /// # Errors
    /// `invalid_grant` on unknown, expired, mismatched, or double-spent codes
    pub async fn find_code(
        &self,
        client: &ClientMetadata,
        client_auth: &ClientAuth,
        code: &str,
    ) -> OAuthResult<AuthorizationRequestRecord> {
        let Some(record) = self
            .store
            .find_by_code(code)
            .await
            .map_err(OAuthError::from)?
        else {
            return Err(OAuthError::InvalidGrant(
                "Invalid authorization code".to_owned(),
            ));
        };

        let uri = record.uri.clone();
        let check = || -> OAuthResult<()> {
            if record.stage != RequestStage::Authorized {
                return Err(OAuthError::InvalidGrant(
                    "Authorization code already used".to_owned(),
                ));
            }
            if record.client_id != client.client_id {
                return Err(OAuthError::InvalidGrant(
                    "Code was issued to a different client".to_owned(),
                ));
            }
            if !record.client_auth.same_method(client_auth) {
                return Err(OAuthError::InvalidGrant(
                    "Code was issued under a different client authentication method".to_owned(),
                ));
            }
            let now = Utc::now();
            if record.is_expired(now)
                || record.code_expires_at.is_some_and(|at| now >= at)
            {
                return Err(OAuthError::InvalidGrant(
                    "Authorization code has expired".to_owned(),
                ));
            }
            Ok(())
        };
        if let Err(err) = check() {
            // Any failure burns the code: the record is gone and the caller
            // revokes tokens already derived from it.
            self.store.delete(&uri).await.map_err(OAuthError::from)?;
            return Err(err);
        }

        let mut consumed = record.clone();
        consumed.stage = RequestStage::Consumed;
        let applied = self
            .store
            .update_if_stage(&uri, RequestStage::Authorized, consumed)
            .await
            .map_err(OAuthError::from)?;
        if !applied {
            self.store.delete(&uri).await.map_err(OAuthError::from)?;
            return Err(OAuthError::InvalidGrant(
                "Authorization code already used".to_owned(),
            ));
        }
        self.store.delete(&uri).await.map_err(OAuthError::from)?;
        Ok(record)
    }

    /// Idempotent removal
    ///
    /// # Errors
    /// `server_error` on store failure
    pub async fn delete(&self, uri: &str) -> OAuthResult<()> {
        self.store.delete(uri).await.map_err(OAuthError::from)
    }
}
