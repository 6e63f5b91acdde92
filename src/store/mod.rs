// ABOUTME: Store traits decoupling managers from persistence back-ends
// ABOUTME: All operations are atomic at the single-key level, including conditional inserts
//
// Licensed under either of Apache License, Version 2.0 or MIT License at your option.
// Copyright ©2025 Async-IO.org

//! Persistence seam
//!
//! The core holds no locks across store calls and assumes no cross-key
//! transactions. Where compound atomicity is required (refresh rotation,
//! code consumption) the trait exposes a conditional operation the
//! implementation must linearize per key.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::time::Duration;

use crate::models::{
    Account, AuthorizationRequestRecord, Device, DeviceAccountInfo, RequestStage, TokenRecord,
};

pub mod memory;

/// At-most-once witness storage
#[async_trait]
pub trait ReplayStore: Send + Sync {
    /// Atomically check whether `key` was already seen and store it with TTL.
    ///
    /// Returns:
    /// - `Ok(true)`  => first time (stored)
    /// - `Ok(false)` => replay detected (already present)
    /// - `Err(_)`    => backend failure (callers must fail closed)
    async fn check_and_store(&self, key: &str, ttl: Duration) -> Result<bool>;
}

/// Device identities and their account sessions
#[async_trait]
pub trait DeviceStore: Send + Sync {
    async fn upsert_device(&self, device: Device) -> Result<()>;

    async fn get_device(&self, device_id: &str) -> Result<Option<Device>>;

    async fn delete_device(&self, device_id: &str) -> Result<()>;

    async fn put_device_account(
        &self,
        device_id: &str,
        sub: &str,
        info: DeviceAccountInfo,
    ) -> Result<()>;

    async fn get_device_account(
        &self,
        device_id: &str,
        sub: &str,
    ) -> Result<Option<DeviceAccountInfo>>;

    /// All `(sub, info)` sessions attached to a device
    async fn list_device_accounts(
        &self,
        device_id: &str,
    ) -> Result<Vec<(String, DeviceAccountInfo)>>;

    async fn remove_device_account(&self, device_id: &str, sub: &str) -> Result<()>;
}

/// An account row as persisted: public identity plus credential digest
#[derive(Debug, Clone)]
pub struct StoredAccount {
    pub account: Account,
    pub password_hash: String,
}

/// Resource-owner accounts and password-reset state
#[async_trait]
pub trait AccountStore: Send + Sync {
    /// Put-if-absent on both `sub` and `preferred_username`
    async fn create_account(&self, account: StoredAccount) -> Result<bool>;

    async fn get_account(&self, sub: &str) -> Result<Option<Account>>;

    async fn find_by_username(&self, username: &str) -> Result<Option<StoredAccount>>;

    async fn update_password(&self, sub: &str, password_hash: String) -> Result<()>;

    async fn put_reset_token(
        &self,
        token: &str,
        sub: &str,
        expires_at: DateTime<Utc>,
    ) -> Result<()>;

    /// Single-use: returns the bound `sub` and removes the token
    async fn take_reset_token(&self, token: &str) -> Result<Option<String>>;
}

/// Authorization-request records keyed by opaque `request_uri`
#[async_trait]
pub trait RequestStore: Send + Sync {
    /// Put-if-absent by `uri`
    async fn create(&self, record: AuthorizationRequestRecord) -> Result<bool>;

    async fn get(&self, uri: &str) -> Result<Option<AuthorizationRequestRecord>>;

    /// Conditional update: applies only while the stored stage matches
    /// `expected`. This is the serialization point for `set_authorized` and
    /// code consumption.
    async fn update_if_stage(
        &self,
        uri: &str,
        expected: RequestStage,
        record: AuthorizationRequestRecord,
    ) -> Result<bool>;

    async fn find_by_code(&self, code: &str) -> Result<Option<AuthorizationRequestRecord>>;

    /// Idempotent removal
    async fn delete(&self, uri: &str) -> Result<()>;
}

/// Outcome of a refresh-token rotation attempt
#[derive(Debug, Clone)]
pub enum RefreshRotation {
    /// Presented token was current; the record now carries the successor
    Rotated(TokenRecord),
    /// Presented token was already rotated out; the lineage is compromised
    Replayed(TokenRecord),
    /// No lineage knows this refresh token
    NotFound,
}

/// Token records with refresh lineage
#[async_trait]
pub trait TokenStore: Send + Sync {
    /// Put-if-absent by `token_id`
    async fn insert(&self, record: TokenRecord) -> Result<bool>;

    async fn get_by_token_id(&self, token_id: &str) -> Result<Option<TokenRecord>>;

    /// Look up the lineage created from an authorization code
    async fn get_by_code(&self, code: &str) -> Result<Option<TokenRecord>>;

    /// Look up a lineage by refresh token, current or retired
    async fn get_by_refresh(&self, refresh_token: &str) -> Result<Option<TokenRecord>>;

    /// Rotate the refresh token, linearized per lineage: succeeds only if
    /// `presented` is the current refresh value, retiring it in the same
    /// step so a replay is observable.
    async fn rotate_refresh(
        &self,
        presented: &str,
        next_token_id: &str,
        next_refresh: &str,
        updated_at: DateTime<Utc>,
        expires_at: DateTime<Utc>,
        refresh_expires_at: DateTime<Utc>,
    ) -> Result<RefreshRotation>;

    /// Idempotent removal of every token derived from the lineage
    async fn delete_lineage(&self, lineage_id: &str) -> Result<()>;
}
