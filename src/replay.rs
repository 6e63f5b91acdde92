// ABOUTME: At-most-once acceptance of protocol nonces per semantic namespace
// ABOUTME: Namespace-salted keys over a conditional-insert replay store
//
// Licensed under either of Apache License, Version 2.0 or MIT License at your option.
// Copyright ©2025 Async-IO.org

//! Replay prevention
//!
//! Each protocol witness (JAR `jti`, client-assertion `jti`, PKCE
//! `code_challenge`, DPoP `jti`) is accepted at most once within its TTL.
//! The store's `check_and_store` is a conditional insert, so a
//! check-then-insert race is impossible; a second acceptance observes
//! `false` iff the first's insert committed.

use anyhow::Result;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::time::Duration;

use crate::constants::replay::{
    NS_CLIENT_ASSERTION, NS_CODE_CHALLENGE, NS_DPOP, NS_JAR, TTL_SKEW_SECS,
};
use crate::constants::requests::PAR_EXPIRY_SECS;
use crate::constants::skew::{CLIENT_ASSERTION_MAX_AGE_SECS, DPOP_MAX_AGE_SECS};
use crate::store::ReplayStore;

/// At-most-once acceptance over a pluggable witness store
#[derive(Clone)]
pub struct ReplayManager {
    store: Arc<dyn ReplayStore>,
}

impl ReplayManager {
    #[must_use]
    pub fn new(store: Arc<dyn ReplayStore>) -> Self {
        Self { store }
    }

    /// Salt the key with its namespace so witnesses from different
    /// categories can never collide.
    fn key(namespace: &str, parts: &[&str]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(namespace.as_bytes());
        for part in parts {
            hasher.update([0u8]);
            hasher.update(part.as_bytes());
        }
        format!("{namespace}:{:x}", hasher.finalize())
    }

    async fn unique(&self, namespace: &str, parts: &[&str], ttl: Duration) -> Result<bool> {
        let accepted = self
            .store
            .check_and_store(&Self::key(namespace, parts), ttl)
            .await?;
        if !accepted {
            tracing::warn!(namespace, "replayed witness rejected");
        }
        Ok(accepted)
    }

    /// JAR request-object `jti`, scoped per client
    pub async fn unique_jar(&self, jti: &str, client_id: &str) -> Result<bool> {
        let ttl = Duration::from_secs(PAR_EXPIRY_SECS.unsigned_abs() + TTL_SKEW_SECS);
        self.unique(NS_JAR, &[client_id, jti], ttl).await
    }

    /// Client-assertion JWT `jti`, scoped per client
    pub async fn unique_auth(&self, jti: &str, client_id: &str) -> Result<bool> {
        let ttl =
            Duration::from_secs(CLIENT_ASSERTION_MAX_AGE_SECS.unsigned_abs() + TTL_SKEW_SECS);
        self.unique(NS_CLIENT_ASSERTION, &[client_id, jti], ttl).await
    }

    /// PKCE `code_challenge` freshness across authorizations
    pub async fn unique_code_challenge(&self, code_challenge: &str) -> Result<bool> {
        let ttl = Duration::from_secs(PAR_EXPIRY_SECS.unsigned_abs() + TTL_SKEW_SECS);
        self.unique(NS_CODE_CHALLENGE, &[code_challenge], ttl).await
    }

    /// DPoP proof `jti`, scoped per presenting key
    pub async fn unique_dpop(&self, jkt: &str, jti: &str) -> Result<bool> {
        let ttl = Duration::from_secs(DPOP_MAX_AGE_SECS.unsigned_abs() + TTL_SKEW_SECS);
        self.unique(NS_DPOP, &[jkt, jti], ttl).await
    }
}
