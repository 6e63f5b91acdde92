// ABOUTME: Centralized error handling for the OAuth authorization server
// ABOUTME: Defines the OAuth error taxonomy and its HTTP status / wire-body mapping
//
// Licensed under either of Apache License, Version 2.0 or MIT License at your option.
// Copyright ©2025 Async-IO.org

//! # Unified Error Handling
//!
//! Every fallible path in the server funnels into [`OAuthError`]. The enum
//! mirrors the OAuth error taxonomy on the wire; each propagation hop
//! (PAR downgrade, authorize redirect-wrapping, introspection suppression)
//! is a total function over the error kind.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::constants::http_status::{
    BAD_REQUEST, FORBIDDEN, INTERNAL_SERVER_ERROR, SERVICE_UNAVAILABLE, UNAUTHORIZED,
};

/// OAuth protocol error, carried through every manager
#[non_exhaustive]
#[derive(Debug, Clone, Error)]
pub enum OAuthError {
    /// Request is malformed or missing a required parameter
    #[error("invalid_request: {0}")]
    InvalidRequest(String),

    /// Client authentication failed
    #[error("invalid_client: {0}")]
    InvalidClient(String),

    /// Grant (code, refresh token, assertion) is invalid, expired, or replayed
    #[error("invalid_grant: {0}")]
    InvalidGrant(String),

    /// Client is not allowed to use this grant type
    #[error("unauthorized_client: {0}")]
    UnauthorizedClient(String),

    /// Grant type is not supported by this server
    #[error("unsupported_grant_type: {0}")]
    UnsupportedGrantType(String),

    /// Requested scope is invalid or exceeds what the client may request
    #[error("invalid_scope: {0}")]
    InvalidScope(String),

    /// Resource owner or server denied the request
    #[error("access_denied: {0}")]
    AccessDenied(String),

    /// Interaction is required: no usable authenticated session
    #[error("login_required")]
    LoginRequired,

    /// Interaction is required: consent has not been granted
    #[error("consent_required")]
    ConsentRequired,

    /// Interaction is required: multiple sessions match
    #[error("account_selection_required")]
    AccountSelectionRequired,

    /// Unexpected server-side failure (store I/O, signer failure)
    #[error("server_error: {0}")]
    ServerError(String),

    /// Server is temporarily unable to handle the request
    #[error("temporarily_unavailable")]
    TemporarilyUnavailable,
}

impl OAuthError {
    /// Wire-level error code (RFC 6749 §5.2 and OIDC extensions)
    #[must_use]
    pub const fn code(&self) -> &'static str {
        match self {
            Self::InvalidRequest(_) => "invalid_request",
            Self::InvalidClient(_) => "invalid_client",
            Self::InvalidGrant(_) => "invalid_grant",
            Self::UnauthorizedClient(_) => "unauthorized_client",
            Self::UnsupportedGrantType(_) => "unsupported_grant_type",
            Self::InvalidScope(_) => "invalid_scope",
            Self::AccessDenied(_) => "access_denied",
            Self::LoginRequired => "login_required",
            Self::ConsentRequired => "consent_required",
            Self::AccountSelectionRequired => "account_selection_required",
            Self::ServerError(_) => "server_error",
            Self::TemporarilyUnavailable => "temporarily_unavailable",
        }
    }

    /// HTTP status for a direct (non-redirect) error response
    #[must_use]
    pub const fn status(&self) -> u16 {
        match self {
            Self::InvalidRequest(_)
            | Self::InvalidGrant(_)
            | Self::UnsupportedGrantType(_)
            | Self::InvalidScope(_)
            | Self::UnauthorizedClient(_) => BAD_REQUEST,
            Self::InvalidClient(_) => UNAUTHORIZED,
            Self::AccessDenied(_)
            | Self::LoginRequired
            | Self::ConsentRequired
            | Self::AccountSelectionRequired => FORBIDDEN,
            Self::ServerError(_) => INTERNAL_SERVER_ERROR,
            Self::TemporarilyUnavailable => SERVICE_UNAVAILABLE,
        }
    }

    /// Whether this error represents a "user interaction needed" outcome
    #[must_use]
    pub const fn is_interaction_error(&self) -> bool {
        matches!(
            self,
            Self::AccessDenied(_)
                | Self::LoginRequired
                | Self::ConsentRequired
                | Self::AccountSelectionRequired
        )
    }

    /// Downgrade applied at the PAR endpoint (RFC 9126 §2.3): user-interaction
    /// outcomes must not leak through a back-channel request.
    #[must_use]
    pub fn downgrade_for_par(self) -> Self {
        if self.is_interaction_error() {
            Self::InvalidRequest("unacceptable authorization request".to_owned())
        } else {
            self
        }
    }

    /// Wire body for a JSON error response
    #[must_use]
    pub fn to_body(&self) -> ErrorBody {
        let description = match self {
            Self::InvalidRequest(d)
            | Self::InvalidClient(d)
            | Self::InvalidGrant(d)
            | Self::UnauthorizedClient(d)
            | Self::UnsupportedGrantType(d)
            | Self::InvalidScope(d)
            | Self::AccessDenied(d)
            | Self::ServerError(d) => Some(d.clone()),
            Self::LoginRequired => Some("Login is required".to_owned()),
            Self::ConsentRequired => Some("User consent is required".to_owned()),
            Self::AccountSelectionRequired => Some("Account selection is required".to_owned()),
            Self::TemporarilyUnavailable => None,
        };
        ErrorBody {
            error: self.code().to_owned(),
            error_description: description,
            error_uri: None,
        }
    }

    /// Helper mirroring schema-validation failures: the message format is
    /// stable so clients can surface the offending parameter.
    #[must_use]
    pub fn validation(field: &str, location: &str) -> Self {
        Self::InvalidRequest(format!(
            "Validation of \"{field}\" {location} parameter failed"
        ))
    }
}

impl From<anyhow::Error> for OAuthError {
    fn from(err: anyhow::Error) -> Self {
        tracing::error!("internal error surfaced as server_error: {err:#}");
        Self::ServerError("internal server error".to_owned())
    }
}

/// Standard OAuth error body: `{ "error", "error_description", "error_uri"? }`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_uri: Option<String>,
}

/// Convenient result alias used throughout the crate
pub type OAuthResult<T> = Result<T, OAuthError>;
