// ABOUTME: SSRF-safe fetcher for client metadata and JWKS documents
// ABOUTME: Rejects private address space, caps response size, and caches with LRU + TTL
//
// Licensed under either of Apache License, Version 2.0 or MIT License at your option.
// Copyright ©2025 Async-IO.org

//! Outbound metadata resolution
//!
//! Client ids are URLs under the client's control, so every fetch is treated
//! as hostile input: https only, no redirects, DNS results must all be
//! public addresses, responses must be `application/json` and fit the size
//! cap. Metadata and JWKS are cached independently as immutable snapshots.

use anyhow::{bail, Context, Result};
use lru::LruCache;
use std::net::{IpAddr, SocketAddr};
use std::num::NonZeroUsize;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;

use crate::constants::clients::{
    FETCH_MAX_BYTES, FETCH_TIMEOUT_SECS, METADATA_CACHE_MAX_ENTRIES, METADATA_CACHE_TTL_SECS,
};
use crate::models::ClientMetadata;
use crate::signer::JsonWebKeySet;

/// Cache entry carrying its own expiry
#[derive(Clone)]
struct CacheEntry<T> {
    value: T,
    expires_at: Instant,
}

impl<T: Clone> CacheEntry<T> {
    fn new(value: T, ttl: Duration) -> Self {
        Self {
            value,
            expires_at: Instant::now() + ttl,
        }
    }

    fn live(&self) -> Option<T> {
        (Instant::now() < self.expires_at).then(|| self.value.clone())
    }
}

/// SSRF-guarded fetcher with independent metadata and JWKS caches
pub struct MetadataFetcher {
    http: reqwest::Client,
    metadata_cache: RwLock<LruCache<String, CacheEntry<ClientMetadata>>>,
    jwks_cache: RwLock<LruCache<String, CacheEntry<JsonWebKeySet>>>,
    cache_ttl: Duration,
    /// Dropped to false only in tests that target a local fixture server
    require_public_address: bool,
}

impl MetadataFetcher {
    /// Build a fetcher with the default timeout and cache policy
    ///
    /// # Errors
    /// Returns an error if the HTTP client cannot be constructed
    pub fn new() -> Result<Self> {
        Self::with_policy(true)
    }

    /// Test-only escape hatch: accept loopback fixture servers
    ///
    /// # Errors
    /// Returns an error if the HTTP client cannot be constructed
    pub fn with_policy(require_public_address: bool) -> Result<Self> {
        let http = build_http_client(None)?;
        let capacity = NonZeroUsize::new(METADATA_CACHE_MAX_ENTRIES)
            .context("cache capacity must be non-zero")?;
        Ok(Self {
            http,
            metadata_cache: RwLock::new(LruCache::new(capacity)),
            jwks_cache: RwLock::new(LruCache::new(capacity)),
            cache_ttl: Duration::from_secs(METADATA_CACHE_TTL_SECS),
            require_public_address,
        })
    }

    /// Fetch (or serve from cache) a client metadata document
    ///
    /// # Errors
    /// Returns an error on transport failure, unsafe target, oversized or
    /// non-JSON response
    pub async fn fetch_client_metadata(&self, client_id: &str) -> Result<ClientMetadata> {
        if let Some(entry) = self.metadata_cache.write().await.get(client_id) {
            if let Some(value) = entry.live() {
                return Ok(value);
            }
        }

        let bytes = self.fetch_json_bytes(client_id).await?;
        let metadata: ClientMetadata = serde_json::from_slice(&bytes)
            .context("Client metadata document is not valid JSON")?;

        self.metadata_cache.write().await.push(
            client_id.to_owned(),
            CacheEntry::new(metadata.clone(), self.cache_ttl),
        );
        Ok(metadata)
    }

    /// Fetch (or serve from cache) a JWKS document
    ///
    /// # Errors
    /// Returns an error on transport failure, unsafe target, oversized or
    /// non-JSON response
    pub async fn fetch_jwks(&self, jwks_uri: &str) -> Result<JsonWebKeySet> {
        if let Some(entry) = self.jwks_cache.write().await.get(jwks_uri) {
            if let Some(value) = entry.live() {
                return Ok(value);
            }
        }

        let bytes = self.fetch_json_bytes(jwks_uri).await?;
        let jwks: JsonWebKeySet =
            serde_json::from_slice(&bytes).context("JWKS document is not valid JSON")?;

        self.jwks_cache
            .write()
            .await
            .push(jwks_uri.to_owned(), CacheEntry::new(jwks.clone(), self.cache_ttl));
        Ok(jwks)
    }

    async fn fetch_json_bytes(&self, raw_url: &str) -> Result<Vec<u8>> {
        let parsed = url::Url::parse(raw_url).context("Target is not a valid URL")?;
        let client = self.client_for(&parsed).await?;

        let response = client
            .get(parsed)
            .header(reqwest::header::ACCEPT, "application/json")
            .send()
            .await
            .context("Metadata fetch failed")?;

        if !response.status().is_success() {
            bail!("Metadata fetch returned status {}", response.status());
        }
        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");
        if !content_type.starts_with("application/json") {
            bail!("Metadata fetch returned Content-Type {content_type:?}");
        }
        if let Some(length) = response.content_length() {
            if length > FETCH_MAX_BYTES as u64 {
                bail!("Metadata document exceeds the {FETCH_MAX_BYTES} byte cap");
            }
        }

        let bytes = response.bytes().await.context("Metadata body read failed")?;
        if bytes.len() > FETCH_MAX_BYTES {
            bail!("Metadata document exceeds the {FETCH_MAX_BYTES} byte cap");
        }
        Ok(bytes.to_vec())
    }

    /// Pick the client for this target.
    ///
    /// Literal-IP hosts validate directly and use the shared client.
    /// Hostname targets are resolved exactly once here; every returned
    /// address must be public, and the request goes through a one-off
    /// client whose resolver is pinned to a validated address. The
    /// connection must never depend on a second, independent resolution
    /// (DNS rebinding would pass validation with a public address and
    /// connect to a private one).
    async fn client_for(&self, parsed: &url::Url) -> Result<reqwest::Client> {
        if !self.require_public_address {
            return Ok(self.http.clone());
        }
        if parsed.scheme() != "https" {
            bail!("Metadata may only be fetched over https");
        }
        let host = parsed.host_str().context("Target URL has no host")?;
        let port = parsed.port_or_known_default().unwrap_or(443);

        if let Ok(addr) = host.trim_matches(['[', ']']).parse::<IpAddr>() {
            if !is_public_address(addr) {
                bail!("Metadata target resolves to non-public address {addr}");
            }
            return Ok(self.http.clone());
        }

        let resolved: Vec<SocketAddr> = tokio::net::lookup_host((host, port))
            .await
            .with_context(|| format!("DNS resolution failed for {host}"))?
            .collect();
        if resolved.is_empty() {
            bail!("DNS resolution returned no addresses for {host}");
        }
        for socket_addr in &resolved {
            if !is_public_address(socket_addr.ip()) {
                bail!(
                    "Metadata target resolves to non-public address {}",
                    socket_addr.ip()
                );
            }
        }
        build_http_client(Some((host, resolved[0])))
    }
}

fn build_http_client(pinned: Option<(&str, SocketAddr)>) -> Result<reqwest::Client> {
    let mut builder = reqwest::Client::builder()
        .timeout(Duration::from_secs(FETCH_TIMEOUT_SECS))
        .redirect(reqwest::redirect::Policy::none())
        .user_agent(concat!("meridian-oauth-server/", env!("CARGO_PKG_VERSION")));
    if let Some((host, addr)) = pinned {
        builder = builder.resolve(host, addr);
    }
    builder
        .build()
        .context("Failed to build metadata HTTP client")
}

fn is_public_address(addr: IpAddr) -> bool {
    match addr {
        IpAddr::V4(v4) => {
            !(v4.is_loopback()
                || v4.is_private()
                || v4.is_link_local()
                || v4.is_broadcast()
                || v4.is_multicast()
                || v4.is_unspecified()
                // Documentation ranges (RFC 5737)
                || matches!(v4.octets(), [192, 0, 2, _] | [198, 51, 100, _] | [203, 0, 113, _])
                // Shared address space 100.64.0.0/10 (RFC 6598)
                || (v4.octets()[0] == 100 && (v4.octets()[1] & 0xc0) == 64))
        }
        IpAddr::V6(v6) => {
            let segments = v6.segments();
            !(v6.is_loopback()
                || v6.is_unspecified()
                || v6.is_multicast()
                // Unique local fc00::/7
                || (segments[0] & 0xfe00) == 0xfc00
                // Link local fe80::/10
                || (segments[0] & 0xffc0) == 0xfe80
                // IPv4-mapped: defer to the embedded address
                || v6.to_ipv4_mapped().is_some_and(|v4| !is_public_address(IpAddr::V4(v4))))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn private_space_is_rejected() {
        for bad in [
            "127.0.0.1",
            "10.1.2.3",
            "192.168.1.10",
            "172.16.9.1",
            "169.254.0.7",
            "100.64.0.1",
            "0.0.0.0",
            "::1",
            "fc00::1",
            "fe80::1",
            "::ffff:10.0.0.1",
        ] {
            let addr: IpAddr = bad.parse().unwrap();
            assert!(!is_public_address(addr), "{bad} should be rejected");
        }
    }

    #[test]
    fn public_space_is_accepted() {
        for good in ["93.184.216.34", "2606:2800:220:1:248:1893:25c8:1946"] {
            let addr: IpAddr = good.parse().unwrap();
            assert!(is_public_address(addr), "{good} should be accepted");
        }
    }
}
