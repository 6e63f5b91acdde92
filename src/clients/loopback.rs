// ABOUTME: Loopback client policy: synthesized metadata for development clients
// ABOUTME: http://localhost-style client ids get native, public, DPoP-bound metadata
//
// Licensed under either of Apache License, Version 2.0 or MIT License at your option.
// Copyright ©2025 Async-IO.org

//! Loopback clients
//!
//! A client id on a loopback host cannot serve a metadata document, so the
//! server synthesizes one. Redirect URIs and scope may be customized through
//! the client id's own query string; everything else is pinned to the
//! safest shape: native, public, DPoP-bound.

use crate::errors::{OAuthError, OAuthResult};
use crate::models::{
    ApplicationType, ClientMetadata, GRANT_AUTHORIZATION_CODE, GRANT_REFRESH_TOKEN,
};

/// Configurable synthesis policy for loopback client ids
pub struct LoopbackPolicy {
    /// Scope granted when the client id does not ask for one
    pub default_scope: String,
    /// Whether loopback clients are accepted at all
    pub enabled: bool,
}

impl Default for LoopbackPolicy {
    fn default() -> Self {
        Self {
            default_scope: "atproto".to_owned(),
            enabled: true,
        }
    }
}

impl LoopbackPolicy {
    /// Whether this client id is a loopback id this policy covers
    #[must_use]
    pub fn matches(&self, client_id: &str) -> bool {
        let Ok(parsed) = url::Url::parse(client_id) else {
            return false;
        };
        parsed.scheme() == "http"
            && matches!(
                parsed.host_str(),
                Some("localhost" | "127.0.0.1" | "[::1]")
            )
    }

    /// Synthesize metadata for a loopback client id
    ///
    /// # Errors
    /// `invalid_client` when loopback clients are disabled or the id's query
    /// string is unusable
    pub fn synthesize(&self, client_id: &str) -> OAuthResult<ClientMetadata> {
        if !self.enabled {
            return Err(OAuthError::InvalidClient(
                "Loopback clients are not accepted by this server".to_owned(),
            ));
        }
        let parsed = url::Url::parse(client_id)
            .map_err(|e| OAuthError::InvalidClient(format!("Invalid client_id URL: {e}")))?;
        if parsed.fragment().is_some() {
            return Err(OAuthError::InvalidClient(
                "Loopback client_id must not carry a fragment".to_owned(),
            ));
        }

        let mut redirect_uris = Vec::new();
        let mut scope = None;
        for (key, value) in parsed.query_pairs() {
            match key.as_ref() {
                "redirect_uri" => redirect_uris.push(value.into_owned()),
                "scope" => scope = Some(value.into_owned()),
                other => {
                    return Err(OAuthError::InvalidClient(format!(
                        "Unexpected loopback client_id parameter: {other}"
                    )))
                }
            }
        }
        if redirect_uris.is_empty() {
            redirect_uris = vec![
                "http://127.0.0.1/".to_owned(),
                "http://[::1]/".to_owned(),
            ];
        }

        Ok(ClientMetadata {
            client_id: client_id.to_owned(),
            redirect_uris,
            grant_types: vec![
                GRANT_AUTHORIZATION_CODE.to_owned(),
                GRANT_REFRESH_TOKEN.to_owned(),
            ],
            response_types: vec!["code".to_owned()],
            application_type: ApplicationType::Native,
            token_endpoint_auth_method: "none".to_owned(),
            jwks: None,
            jwks_uri: None,
            scope: Some(scope.unwrap_or_else(|| self.default_scope.clone())),
            dpop_bound_access_tokens: true,
            client_name: Some("Loopback client".to_owned()),
            is_first_party: false,
        })
    }
}
