// ABOUTME: Environment-driven server configuration
// ABOUTME: Every knob has a default so a bare `cargo run` serves a working dev instance
//
// Licensed under either of Apache License, Version 2.0 or MIT License at your option.
// Copyright ©2025 Async-IO.org

use anyhow::{Context, Result};
use std::env;

use crate::constants::sessions::AUTHENTICATION_MAX_AGE_SECS;
use crate::constants::tokens::ACCESS_TOKEN_EXPIRY_SECS;
use crate::provider::ProviderConfig;

/// Server configuration loaded from the environment
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// HTTP listen port
    pub http_port: u16,
    /// Issuer origin, e.g. `https://auth.example`
    pub issuer: String,
    /// Resource audience stamped on new accounts
    pub default_audience: String,
    /// Access token lifetime in seconds
    pub access_token_expiry_secs: i64,
    /// Re-authentication requirement in seconds
    pub authentication_max_age_secs: i64,
    /// Device cookie signing key; generated per-process when empty
    pub cookie_secret: Vec<u8>,
    /// Comma-separated client ids trusted to skip consent
    pub first_party_clients: Vec<String>,
    /// Whether development loopback client ids are accepted
    pub allow_loopback_clients: bool,
    /// Optional PKCS#8 PEM for the issuer signing key
    pub signing_key_pem: Option<String>,
    /// Log filter, e.g. `info` or `meridian_oauth_server=debug`
    pub log_level: String,
}

impl ServerConfig {
    /// Load configuration from environment variables
    ///
    /// # Errors
    /// Returns an error when a variable is present but unparseable
    pub fn from_env() -> Result<Self> {
        let http_port = env::var("HTTP_PORT")
            .unwrap_or_else(|_| "8080".to_owned())
            .parse()
            .context("HTTP_PORT must be a port number")?;
        let issuer = env::var("ISSUER")
            .unwrap_or_else(|_| format!("http://localhost:{http_port}"));

        Ok(Self {
            http_port,
            default_audience: env::var("DEFAULT_AUDIENCE").unwrap_or_else(|_| issuer.clone()),
            access_token_expiry_secs: env::var("ACCESS_TOKEN_EXPIRY_SECS")
                .ok()
                .and_then(|raw| raw.parse().ok())
                .unwrap_or(ACCESS_TOKEN_EXPIRY_SECS),
            authentication_max_age_secs: env::var("AUTHENTICATION_MAX_AGE_SECS")
                .ok()
                .and_then(|raw| raw.parse().ok())
                .unwrap_or(AUTHENTICATION_MAX_AGE_SECS),
            cookie_secret: env::var("COOKIE_SECRET")
                .map(String::into_bytes)
                .unwrap_or_default(),
            first_party_clients: env::var("FIRST_PARTY_CLIENTS")
                .map(|raw| {
                    raw.split(',')
                        .map(str::trim)
                        .filter(|entry| !entry.is_empty())
                        .map(str::to_owned)
                        .collect()
                })
                .unwrap_or_default(),
            allow_loopback_clients: env::var("ALLOW_LOOPBACK_CLIENTS")
                .map(|raw| raw != "false" && raw != "0")
                .unwrap_or(true),
            signing_key_pem: env::var("SIGNING_KEY_PEM").ok(),
            log_level: env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_owned()),
            issuer,
        })
    }

    /// Project the provider-level slice of this configuration
    ///
    /// # Errors
    /// Currently infallible; kept fallible for config validation growth
    pub fn provider_config(&self) -> Result<ProviderConfig> {
        let mut config = ProviderConfig::new(&self.issuer);
        config.default_audience = self.default_audience.clone();
        config.access_token_expiry_secs = self.access_token_expiry_secs;
        config.authentication_max_age_secs = self.authentication_max_age_secs;
        config.cookie_secret = self.cookie_secret.clone();
        config.first_party_clients = self.first_party_clients.clone();
        config.allow_loopback_clients = self.allow_loopback_clients;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_produce_a_dev_config() {
        // Only read defaults; environment mutation would race other tests
        let config = ServerConfig::from_env().unwrap();
        assert!(!config.issuer.is_empty());
        assert!(config.access_token_expiry_secs >= 60);
        let provider = config.provider_config().unwrap();
        assert_eq!(provider.issuer, config.issuer.trim_end_matches('/'));
    }
}
