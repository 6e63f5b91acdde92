// ABOUTME: Constants module with domain-separated organization
// ABOUTME: Groups protocol lifetimes, limits, and HTTP status codes by domain
//
// Licensed under either of Apache License, Version 2.0 or MIT License at your option.
// Copyright ©2025 Async-IO.org

//! Constants module
//!
//! Application constants grouped into logical domains rather than a single
//! large file. Lifetimes are expressed in seconds unless noted.

/// HTTP status codes used by response mapping
pub mod http_status {
    pub const OK: u16 = 200;
    pub const CREATED: u16 = 201;
    pub const FOUND: u16 = 302;
    pub const BAD_REQUEST: u16 = 400;
    pub const UNAUTHORIZED: u16 = 401;
    pub const FORBIDDEN: u16 = 403;
    pub const METHOD_NOT_ALLOWED: u16 = 405;
    pub const INTERNAL_SERVER_ERROR: u16 = 500;
    pub const SERVICE_UNAVAILABLE: u16 = 503;
}

/// Authorization-request lifecycle lifetimes
pub mod requests {
    /// How long a pushed authorization request stays redeemable
    pub const PAR_EXPIRY_SECS: i64 = 300;

    /// Bounded extension applied on successful retrieval during interactive steps
    pub const SLIDING_TTL_SECS: i64 = 300;

    /// Authorization codes are short-lived by design
    pub const CODE_EXPIRY_SECS: i64 = 60;

    /// Prefix for opaque request URIs (RFC 9126 §2.2)
    pub const REQUEST_URI_PREFIX: &str = "urn:ietf:params:oauth:request_uri:req-";

    /// Prefix for authorization codes
    pub const CODE_PREFIX: &str = "cod-";
}

/// Token lifetimes and formats
pub mod tokens {
    /// Default access token lifetime (one hour)
    pub const ACCESS_TOKEN_EXPIRY_SECS: i64 = 3600;

    /// Enforced minimum access token lifetime
    pub const ACCESS_TOKEN_EXPIRY_FLOOR_SECS: i64 = 60;

    /// Refresh token lifetime without use
    pub const REFRESH_TOKEN_EXPIRY_SECS: i64 = 30 * 24 * 3600;

    /// Prefix for opaque token identifiers (also used as JWT `jti`)
    pub const TOKEN_ID_PREFIX: &str = "tok-";

    /// Prefix for opaque refresh tokens
    pub const REFRESH_TOKEN_PREFIX: &str = "ref-";

    /// Minimum elapsed wall time for introspection of invalid tokens
    pub const INTROSPECTION_FLOOR_MS: u64 = 750;
}

/// Replay witness namespaces and lifetimes
pub mod replay {
    /// JAR request-object `jti`
    pub const NS_JAR: &str = "jar";

    /// Client-assertion JWT `jti`
    pub const NS_CLIENT_ASSERTION: &str = "client_assertion";

    /// PKCE `code_challenge` freshness
    pub const NS_CODE_CHALLENGE: &str = "code_challenge";

    /// DPoP proof `jti`
    pub const NS_DPOP: &str = "dpop";

    /// Slack added on top of witness lifetime to cover clock skew
    pub const TTL_SKEW_SECS: u64 = 60;
}

/// Clock-skew windows for inbound JWT validation
pub mod skew {
    /// Maximum age of a DPoP proof `iat`
    pub const DPOP_MAX_AGE_SECS: i64 = 300;

    /// Tolerated future drift for inbound `iat` claims
    pub const CLOCK_SKEW_SECS: i64 = 60;

    /// Maximum client-assertion validity window accepted
    pub const CLIENT_ASSERTION_MAX_AGE_SECS: i64 = 300;
}

/// Client metadata resolution limits
pub mod clients {
    /// Metadata and JWKS cache entry lifetime
    pub const METADATA_CACHE_TTL_SECS: u64 = 600;

    /// Upper bound on cached entries per cache
    pub const METADATA_CACHE_MAX_ENTRIES: usize = 1000;

    /// Response size cap for metadata and JWKS documents
    pub const FETCH_MAX_BYTES: usize = 64 * 1024;

    /// Outbound fetch timeout
    pub const FETCH_TIMEOUT_SECS: u64 = 10;
}

/// Interactive session policy
pub mod sessions {
    /// Default re-authentication age requirement
    pub const AUTHENTICATION_MAX_AGE_SECS: i64 = 7 * 24 * 3600;

    /// Device cookie names (identifier + secret pair)
    pub const DEVICE_ID_COOKIE: &str = "device-id";
    pub const DEVICE_SECRET_COOKIE: &str = "device-secret";

    /// Prefix for per-request CSRF cookies
    pub const CSRF_COOKIE_PREFIX: &str = "csrf-";
}

/// DPoP nonce rotation policy
pub mod dpop_nonce {
    /// Window after which a fresh nonce value is minted
    pub const ROTATION_SECS: u64 = 180;

    /// How many previous windows stay acceptable
    pub const RETAINED_WINDOWS: u64 = 2;
}
