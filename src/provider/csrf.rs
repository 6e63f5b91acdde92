// ABOUTME: CSRF and fetch-metadata validation for the interactive endpoints
// ABOUTME: Double-submit cookies keyed per request_uri plus same-origin checks
//
// Licensed under either of Apache License, Version 2.0 or MIT License at your option.
// Copyright ©2025 Async-IO.org

//! Interactive-endpoint protections
//!
//! The consent UI is same-origin by construction, so every state-changing
//! interactive request must prove it: a double-submit CSRF token scoped to
//! its `request_uri`, plus `Sec-Fetch-*` and `Origin` checks. Failures are
//! `access_denied`, which the transport maps to 403.

use subtle::ConstantTimeEq;

use crate::constants::sessions::CSRF_COOKIE_PREFIX;
use crate::errors::{OAuthError, OAuthResult};

/// Cookie name bound to one authorization request.
///
/// Cookie names cannot carry the URN's colons, so only the final (unguessable)
/// segment is used.
#[must_use]
pub fn csrf_cookie_name(request_uri: &str) -> String {
    let tail = request_uri.rsplit(':').next().unwrap_or(request_uri);
    format!("{CSRF_COOKIE_PREFIX}{tail}")
}

/// Double-submit check: the cookie planted with the consent page must equal
/// the token submitted with the action.
///
/// # Errors
/// `access_denied` when either half is missing or they differ
pub fn validate_csrf(cookie: Option<&str>, submitted: Option<&str>) -> OAuthResult<()> {
    let (Some(cookie), Some(submitted)) = (cookie, submitted) else {
        return Err(OAuthError::AccessDenied("Missing CSRF token".to_owned()));
    };
    if cookie.as_bytes().ct_eq(submitted.as_bytes()).into() {
        Ok(())
    } else {
        Err(OAuthError::AccessDenied("Invalid CSRF token".to_owned()))
    }
}

/// `GET /oauth/authorize` arrives as a top-level navigation (often
/// cross-site, straight from the client); anything else is suspicious.
///
/// # Errors
/// `access_denied` on a non-navigation fetch mode
pub fn validate_navigation(sec_fetch_mode: Option<&str>) -> OAuthResult<()> {
    match sec_fetch_mode {
        None | Some("navigate") => Ok(()),
        Some(other) => Err(OAuthError::AccessDenied(format!(
            "Unexpected Sec-Fetch-Mode: {other}"
        ))),
    }
}

/// Accept/reject are followed from the consent page itself: same-origin
/// navigation only.
///
/// # Errors
/// `access_denied` on cross-site metadata
pub fn validate_same_origin_navigation(
    sec_fetch_site: Option<&str>,
    sec_fetch_mode: Option<&str>,
) -> OAuthResult<()> {
    validate_navigation(sec_fetch_mode)?;
    match sec_fetch_site {
        None | Some("same-origin") => Ok(()),
        Some(other) => Err(OAuthError::AccessDenied(format!(
            "Unexpected Sec-Fetch-Site: {other}"
        ))),
    }
}

/// Interactive POSTs (sign-in, sign-up, password reset) come from our own
/// scripts: same-origin fetch metadata and a matching `Origin` header.
///
/// # Errors
/// `access_denied` on cross-site metadata or a foreign origin
pub fn validate_same_origin_post(
    issuer: &str,
    origin: Option<&str>,
    sec_fetch_site: Option<&str>,
    sec_fetch_mode: Option<&str>,
) -> OAuthResult<()> {
    if let Some(origin) = origin {
        if origin.trim_end_matches('/') != issuer.trim_end_matches('/') {
            return Err(OAuthError::AccessDenied(format!(
                "Cross-origin request from {origin}"
            )));
        }
    }
    match sec_fetch_site {
        None | Some("same-origin") => {}
        Some(other) => {
            return Err(OAuthError::AccessDenied(format!(
                "Unexpected Sec-Fetch-Site: {other}"
            )))
        }
    }
    match sec_fetch_mode {
        None | Some("same-origin" | "cors") => Ok(()),
        Some(other) => Err(OAuthError::AccessDenied(format!(
            "Unexpected Sec-Fetch-Mode: {other}"
        ))),
    }
}
