// ABOUTME: Core data model for the OAuth authorization server
// ABOUTME: Client metadata, authorization requests, devices, accounts, and token records
//
// Licensed under either of Apache License, Version 2.0 or MIT License at your option.
// Copyright ©2025 Async-IO.org

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::signer::JsonWebKeySet;

/// Client assertion type for `private_key_jwt` (RFC 7523)
pub const CLIENT_ASSERTION_TYPE_JWT_BEARER: &str =
    "urn:ietf:params:oauth:client-assertion-type:jwt-bearer";

/// Grant type identifiers supported by this server
pub const GRANT_AUTHORIZATION_CODE: &str = "authorization_code";
pub const GRANT_REFRESH_TOKEN: &str = "refresh_token";

/// Client application type (RFC 8252 distinguishes native apps)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ApplicationType {
    #[default]
    Web,
    Native,
}

/// How the client authenticated on this request
///
/// Persisted alongside authorization requests and token records; redemption
/// requires the same method as issuance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "method", rename_all = "snake_case")]
pub enum ClientAuth {
    None,
    PrivateKeyJwt { kid: String, alg: String, jkt: String },
}

impl ClientAuth {
    /// Wire name of the authentication method
    #[must_use]
    pub const fn method(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::PrivateKeyJwt { .. } => "private_key_jwt",
        }
    }

    /// Method-level equality: a grant obtained under one client-auth method
    /// cannot be redeemed under another.
    #[must_use]
    pub fn same_method(&self, other: &Self) -> bool {
        self.method() == other.method()
    }
}

/// Client metadata document (RFC 7591 vocabulary)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientMetadata {
    pub client_id: String,
    #[serde(default)]
    pub redirect_uris: Vec<String>,
    #[serde(default = "default_grant_types")]
    pub grant_types: Vec<String>,
    #[serde(default = "default_response_types")]
    pub response_types: Vec<String>,
    #[serde(default)]
    pub application_type: ApplicationType,
    #[serde(default = "default_auth_method")]
    pub token_endpoint_auth_method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jwks: Option<JsonWebKeySet>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jwks_uri: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
    #[serde(default)]
    pub dpop_bound_access_tokens: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_name: Option<String>,
    /// Trusted clients skip the consent screen. Never read from fetched
    /// documents; set only by server policy.
    #[serde(default, skip_serializing, skip_deserializing)]
    pub is_first_party: bool,
}

fn default_grant_types() -> Vec<String> {
    vec![GRANT_AUTHORIZATION_CODE.to_owned()]
}

fn default_response_types() -> Vec<String> {
    vec!["code".to_owned()]
}

fn default_auth_method() -> String {
    "none".to_owned()
}

impl ClientMetadata {
    /// Whether the client registered this grant type
    #[must_use]
    pub fn allows_grant_type(&self, grant_type: &str) -> bool {
        self.grant_types.iter().any(|g| g == grant_type)
    }

    /// Public clients authenticate with method `none`
    #[must_use]
    pub fn is_public(&self) -> bool {
        self.token_endpoint_auth_method == "none"
    }

    /// Match a presented redirect URI against the registration.
    ///
    /// Exact match, with one carve-out: native clients may register a
    /// loopback redirect and present it with an ephemeral port (RFC 8252 §7.3).
    #[must_use]
    pub fn allows_redirect_uri(&self, redirect_uri: &str) -> bool {
        if self.redirect_uris.iter().any(|r| r == redirect_uri) {
            return true;
        }
        if self.application_type == ApplicationType::Native {
            if let (Ok(presented), true) = (
                url::Url::parse(redirect_uri),
                self.redirect_uris.iter().any(|r| is_loopback_uri(r)),
            ) {
                return is_loopback_host(presented.host_str())
                    && self.redirect_uris.iter().any(|registered| {
                        url::Url::parse(registered).is_ok_and(|reg| {
                            is_loopback_host(reg.host_str())
                                && reg.scheme() == presented.scheme()
                                && reg.path() == presented.path()
                        })
                    });
            }
        }
        false
    }

    /// The sole registered redirect URI, if unambiguous
    #[must_use]
    pub fn default_redirect_uri(&self) -> Option<&str> {
        match self.redirect_uris.as_slice() {
            [single] => Some(single.as_str()),
            _ => None,
        }
    }

    /// Whether every requested scope value was registered by the client
    #[must_use]
    pub fn allows_scope(&self, requested: &str) -> bool {
        let Some(registered) = self.scope.as_deref() else {
            return false;
        };
        let registered: std::collections::HashSet<&str> =
            registered.split_ascii_whitespace().collect();
        requested
            .split_ascii_whitespace()
            .all(|s| registered.contains(s))
    }
}

fn is_loopback_uri(uri: &str) -> bool {
    url::Url::parse(uri).is_ok_and(|u| is_loopback_host(u.host_str()))
}

fn is_loopback_host(host: Option<&str>) -> bool {
    matches!(host, Some("127.0.0.1" | "[::1]" | "::1" | "localhost"))
}

/// Authorization request parameters as validated and persisted
///
/// The same shape arrives via PAR form fields or as a JAR payload.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthorizationParameters {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub redirect_uri: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code_challenge: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code_challenge_method: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub login_hint: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_mode: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dpop_jkt: Option<String>,
}

impl AuthorizationParameters {
    /// Parsed `prompt` value, if recognized
    #[must_use]
    pub fn parsed_prompt(&self) -> Option<Prompt> {
        Prompt::parse(self.prompt.as_deref()?)
    }
}

/// OIDC prompt semantics honored at `/oauth/authorize`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Prompt {
    None,
    Login,
    Consent,
    SelectAccount,
}

impl Prompt {
    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "none" => Some(Self::None),
            "login" => Some(Self::Login),
            "consent" => Some(Self::Consent),
            "select_account" => Some(Self::SelectAccount),
            _ => None,
        }
    }
}

/// Lifecycle stage of an authorization request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestStage {
    /// Pushed, not yet shown to a user agent
    Pending,
    /// Bound to the device that opened `/oauth/authorize`
    Bound,
    /// Consent granted, code issued
    Authorized,
    /// Code redeemed at the token endpoint
    Consumed,
}

/// Authorization request record, keyed by its opaque `request_uri`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthorizationRequestRecord {
    pub uri: String,
    pub client_id: String,
    pub client_auth: ClientAuth,
    pub parameters: AuthorizationParameters,
    pub stage: RequestStage,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sub: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code_expires_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl AuthorizationRequestRecord {
    #[must_use]
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

/// Observed transport metadata for a device
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestMetadata {
    pub ip: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_agent: Option<String>,
}

/// Device identity backing the signed cookie pair
///
/// The cookie carries `device_id` plus a secret; only the secret's digest is
/// stored server-side.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Device {
    pub device_id: String,
    pub secret_digest: String,
    pub metadata: RequestMetadata,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A resource-owner account
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    /// Stable subject identifier
    pub sub: String,
    /// Resource audience tokens for this account are issued to
    pub aud: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preferred_username: Option<String>,
}

/// Per-device account session state
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceAccountInfo {
    pub authenticated_at: DateTime<Utc>,
    pub remember: bool,
    /// Client ids this device-account pair has granted consent to
    #[serde(default)]
    pub authorized_clients: Vec<String>,
}

/// One authenticated session usable for SSO decisions
#[derive(Debug, Clone)]
pub struct AccountSession {
    pub account: Account,
    pub info: DeviceAccountInfo,
}

/// Parameters a token was issued under
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TokenParameters {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dpop_jkt: Option<String>,
}

/// Persisted token record
///
/// `token_id` doubles as the access token `jti` and changes on every refresh;
/// `lineage_id` is stable across rotations so a replayed refresh can revoke
/// everything derived from the original grant.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenRecord {
    pub token_id: String,
    pub lineage_id: String,
    pub client_id: String,
    pub client_auth: ClientAuth,
    pub sub: String,
    /// Resource audience the access tokens are issued to
    pub aud: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_id: Option<String>,
    pub parameters: TokenParameters,
    /// Authorization code this lineage was created from, kept for
    /// code-replay revocation
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_expires_at: Option<DateTime<Utc>>,
    pub rotation_count: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl TokenRecord {
    #[must_use]
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

/// DPoP key confirmation claim (RFC 9449 §6.1)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Confirmation {
    pub jkt: String,
}

/// Claims of an issued access token
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccessTokenClaims {
    pub iss: String,
    pub aud: String,
    pub sub: String,
    pub client_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
    pub jti: String,
    pub iat: i64,
    pub exp: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cnf: Option<Confirmation>,
}

/// Response body for `POST /oauth/par` (RFC 9126 §2.2)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParResponse {
    pub request_uri: String,
    pub expires_in: i64,
}

/// Response body for `POST /oauth/token`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenResponse {
    pub access_token: String,
    pub token_type: String,
    pub expires_in: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sub: Option<String>,
}

/// Response body for `POST /oauth/introspect` (RFC 7662)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntrospectionResponse {
    pub active: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exp: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iat: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sub: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aud: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iss: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jti: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cnf: Option<Confirmation>,
}

impl IntrospectionResponse {
    /// The only body an unverifiable token ever yields
    #[must_use]
    pub fn inactive() -> Self {
        Self {
            active: false,
            scope: None,
            client_id: None,
            username: None,
            token_type: None,
            exp: None,
            iat: None,
            sub: None,
            aud: None,
            iss: None,
            jti: None,
            cnf: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn native_client() -> ClientMetadata {
        ClientMetadata {
            client_id: "http://127.0.0.1/".to_owned(),
            redirect_uris: vec!["http://127.0.0.1/callback".to_owned()],
            grant_types: vec![GRANT_AUTHORIZATION_CODE.to_owned()],
            response_types: vec!["code".to_owned()],
            application_type: ApplicationType::Native,
            token_endpoint_auth_method: "none".to_owned(),
            jwks: None,
            jwks_uri: None,
            scope: Some("atproto".to_owned()),
            dpop_bound_access_tokens: true,
            client_name: None,
            is_first_party: false,
        }
    }

    #[test]
    fn loopback_redirect_matches_any_port() {
        let client = native_client();
        assert!(client.allows_redirect_uri("http://127.0.0.1/callback"));
        assert!(client.allows_redirect_uri("http://127.0.0.1:49152/callback"));
        assert!(!client.allows_redirect_uri("http://127.0.0.1:49152/other"));
        assert!(!client.allows_redirect_uri("https://evil.example/callback"));
    }

    #[test]
    fn web_redirect_requires_exact_match() {
        let mut client = native_client();
        client.application_type = ApplicationType::Web;
        client.redirect_uris = vec!["https://app.example/cb".to_owned()];
        assert!(client.allows_redirect_uri("https://app.example/cb"));
        assert!(!client.allows_redirect_uri("https://app.example/cb2"));
        assert!(!client.allows_redirect_uri("https://app.example:444/cb"));
    }

    #[test]
    fn scope_subset_check() {
        let client = native_client();
        assert!(client.allows_scope("atproto"));
        assert!(!client.allows_scope("atproto offline_access"));
    }

    #[test]
    fn auth_method_equality_is_method_level() {
        let a = ClientAuth::PrivateKeyJwt {
            kid: "k1".to_owned(),
            alg: "ES256".to_owned(),
            jkt: "t1".to_owned(),
        };
        let b = ClientAuth::PrivateKeyJwt {
            kid: "k2".to_owned(),
            alg: "RS256".to_owned(),
            jkt: "t2".to_owned(),
        };
        assert!(a.same_method(&b));
        assert!(!a.same_method(&ClientAuth::None));
    }
}
