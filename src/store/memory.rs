// ABOUTME: In-memory reference implementation of every store trait
// ABOUTME: Single RwLock'd state map; conditional operations are atomic within the lock
//
// Licensed under either of Apache License, Version 2.0 or MIT License at your option.
// Copyright ©2025 Async-IO.org

//! In-memory stores
//!
//! Backs tests and single-process deployments. Every conditional operation
//! (put-if-absent, stage-guarded update, refresh rotation) runs under one
//! write lock, which trivially satisfies the linearization contract.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;

use crate::models::{
    Account, AuthorizationRequestRecord, Device, DeviceAccountInfo, RequestStage, TokenRecord,
};
use crate::store::{
    AccountStore, DeviceStore, RefreshRotation, ReplayStore, RequestStore, StoredAccount,
    TokenStore,
};

#[derive(Default)]
struct State {
    replay: HashMap<String, Instant>,
    devices: HashMap<String, Device>,
    device_accounts: HashMap<(String, String), DeviceAccountInfo>,
    accounts: HashMap<String, StoredAccount>,
    username_index: HashMap<String, String>,
    reset_tokens: HashMap<String, (String, DateTime<Utc>)>,
    requests: HashMap<String, AuthorizationRequestRecord>,
    code_index: HashMap<String, String>,
    tokens: HashMap<String, TokenRecord>,
    token_id_index: HashMap<String, String>,
    token_code_index: HashMap<String, String>,
    refresh_index: HashMap<String, String>,
    retired_refresh_index: HashMap<String, String>,
}

/// Combined in-memory store implementing all persistence traits
#[derive(Default)]
pub struct MemoryStore {
    state: RwLock<State>,
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ReplayStore for MemoryStore {
    async fn check_and_store(&self, key: &str, ttl: Duration) -> Result<bool> {
        let mut state = self.state.write().await;
        let now = Instant::now();
        // Drop an expired witness before deciding; TTL expiry makes the key
        // acceptable again by contract.
        if let Some(expires_at) = state.replay.get(key) {
            if *expires_at > now {
                return Ok(false);
            }
            state.replay.remove(key);
        }
        state.replay.insert(key.to_owned(), now + ttl);
        Ok(true)
    }
}

#[async_trait]
impl DeviceStore for MemoryStore {
    async fn upsert_device(&self, device: Device) -> Result<()> {
        let mut state = self.state.write().await;
        state.devices.insert(device.device_id.clone(), device);
        Ok(())
    }

    async fn get_device(&self, device_id: &str) -> Result<Option<Device>> {
        Ok(self.state.read().await.devices.get(device_id).cloned())
    }

    async fn delete_device(&self, device_id: &str) -> Result<()> {
        let mut state = self.state.write().await;
        state.devices.remove(device_id);
        state
            .device_accounts
            .retain(|(did, _), _| did != device_id);
        Ok(())
    }

    async fn put_device_account(
        &self,
        device_id: &str,
        sub: &str,
        info: DeviceAccountInfo,
    ) -> Result<()> {
        let mut state = self.state.write().await;
        state
            .device_accounts
            .insert((device_id.to_owned(), sub.to_owned()), info);
        Ok(())
    }

    async fn get_device_account(
        &self,
        device_id: &str,
        sub: &str,
    ) -> Result<Option<DeviceAccountInfo>> {
        Ok(self
            .state
            .read()
            .await
            .device_accounts
            .get(&(device_id.to_owned(), sub.to_owned()))
            .cloned())
    }

    async fn list_device_accounts(
        &self,
        device_id: &str,
    ) -> Result<Vec<(String, DeviceAccountInfo)>> {
        Ok(self
            .state
            .read()
            .await
            .device_accounts
            .iter()
            .filter(|((did, _), _)| did == device_id)
            .map(|((_, sub), info)| (sub.clone(), info.clone()))
            .collect())
    }

    async fn remove_device_account(&self, device_id: &str, sub: &str) -> Result<()> {
        self.state
            .write()
            .await
            .device_accounts
            .remove(&(device_id.to_owned(), sub.to_owned()));
        Ok(())
    }
}

#[async_trait]
impl AccountStore for MemoryStore {
    async fn create_account(&self, stored: StoredAccount) -> Result<bool> {
        let mut state = self.state.write().await;
        if state.accounts.contains_key(&stored.account.sub) {
            return Ok(false);
        }
        if let Some(username) = stored.account.preferred_username.as_deref() {
            if state.username_index.contains_key(username) {
                return Ok(false);
            }
            state
                .username_index
                .insert(username.to_owned(), stored.account.sub.clone());
        }
        state.accounts.insert(stored.account.sub.clone(), stored);
        Ok(true)
    }

    async fn get_account(&self, sub: &str) -> Result<Option<Account>> {
        Ok(self
            .state
            .read()
            .await
            .accounts
            .get(sub)
            .map(|s| s.account.clone()))
    }

    async fn find_by_username(&self, username: &str) -> Result<Option<StoredAccount>> {
        let state = self.state.read().await;
        Ok(state
            .username_index
            .get(username)
            .and_then(|sub| state.accounts.get(sub))
            .cloned())
    }

    async fn update_password(&self, sub: &str, password_hash: String) -> Result<()> {
        if let Some(stored) = self.state.write().await.accounts.get_mut(sub) {
            stored.password_hash = password_hash;
        }
        Ok(())
    }

    async fn put_reset_token(
        &self,
        token: &str,
        sub: &str,
        expires_at: DateTime<Utc>,
    ) -> Result<()> {
        self.state
            .write()
            .await
            .reset_tokens
            .insert(token.to_owned(), (sub.to_owned(), expires_at));
        Ok(())
    }

    async fn take_reset_token(&self, token: &str) -> Result<Option<String>> {
        let mut state = self.state.write().await;
        match state.reset_tokens.remove(token) {
            Some((sub, expires_at)) if expires_at > Utc::now() => Ok(Some(sub)),
            _ => Ok(None),
        }
    }
}

#[async_trait]
impl RequestStore for MemoryStore {
    async fn create(&self, record: AuthorizationRequestRecord) -> Result<bool> {
        let mut state = self.state.write().await;
        if state.requests.contains_key(&record.uri) {
            return Ok(false);
        }
        state.requests.insert(record.uri.clone(), record);
        Ok(true)
    }

    async fn get(&self, uri: &str) -> Result<Option<AuthorizationRequestRecord>> {
        Ok(self.state.read().await.requests.get(uri).cloned())
    }

    async fn update_if_stage(
        &self,
        uri: &str,
        expected: RequestStage,
        record: AuthorizationRequestRecord,
    ) -> Result<bool> {
        let mut state = self.state.write().await;
        match state.requests.get(uri) {
            Some(current) if current.stage == expected => {
                if let Some(code) = record.code.as_deref() {
                    state.code_index.insert(code.to_owned(), uri.to_owned());
                }
                state.requests.insert(uri.to_owned(), record);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn find_by_code(&self, code: &str) -> Result<Option<AuthorizationRequestRecord>> {
        let state = self.state.read().await;
        Ok(state
            .code_index
            .get(code)
            .and_then(|uri| state.requests.get(uri))
            .cloned())
    }

    async fn delete(&self, uri: &str) -> Result<()> {
        let mut state = self.state.write().await;
        if let Some(record) = state.requests.remove(uri) {
            if let Some(code) = record.code.as_deref() {
                state.code_index.remove(code);
            }
        }
        Ok(())
    }
}

#[async_trait]
impl TokenStore for MemoryStore {
    async fn insert(&self, record: TokenRecord) -> Result<bool> {
        let mut state = self.state.write().await;
        if state.token_id_index.contains_key(&record.token_id)
            || state.tokens.contains_key(&record.lineage_id)
        {
            return Ok(false);
        }
        state
            .token_id_index
            .insert(record.token_id.clone(), record.lineage_id.clone());
        if let Some(code) = record.code.as_deref() {
            state
                .token_code_index
                .insert(code.to_owned(), record.lineage_id.clone());
        }
        if let Some(refresh) = record.refresh_token.as_deref() {
            state
                .refresh_index
                .insert(refresh.to_owned(), record.lineage_id.clone());
        }
        state.tokens.insert(record.lineage_id.clone(), record);
        Ok(true)
    }

    async fn get_by_token_id(&self, token_id: &str) -> Result<Option<TokenRecord>> {
        let state = self.state.read().await;
        Ok(state
            .token_id_index
            .get(token_id)
            .and_then(|lineage| state.tokens.get(lineage))
            .cloned())
    }

    async fn get_by_code(&self, code: &str) -> Result<Option<TokenRecord>> {
        let state = self.state.read().await;
        Ok(state
            .token_code_index
            .get(code)
            .and_then(|lineage| state.tokens.get(lineage))
            .cloned())
    }

    async fn get_by_refresh(&self, refresh_token: &str) -> Result<Option<TokenRecord>> {
        let state = self.state.read().await;
        Ok(state
            .refresh_index
            .get(refresh_token)
            .or_else(|| state.retired_refresh_index.get(refresh_token))
            .and_then(|lineage| state.tokens.get(lineage))
            .cloned())
    }

    async fn rotate_refresh(
        &self,
        presented: &str,
        next_token_id: &str,
        next_refresh: &str,
        updated_at: DateTime<Utc>,
        expires_at: DateTime<Utc>,
        refresh_expires_at: DateTime<Utc>,
    ) -> Result<RefreshRotation> {
        let mut state = self.state.write().await;

        if let Some(lineage) = state.retired_refresh_index.get(presented).cloned() {
            if let Some(record) = state.tokens.get(&lineage) {
                return Ok(RefreshRotation::Replayed(record.clone()));
            }
            // Lineage already revoked; still a replay from the caller's view
            return Ok(RefreshRotation::NotFound);
        }

        let Some(lineage) = state.refresh_index.get(presented).cloned() else {
            return Ok(RefreshRotation::NotFound);
        };
        let Some(record) = state.tokens.get_mut(&lineage) else {
            return Ok(RefreshRotation::NotFound);
        };
        // The index is keyed by the current value, so this is the CAS step.
        debug_assert_eq!(record.refresh_token.as_deref(), Some(presented));

        if record
            .refresh_expires_at
            .is_some_and(|at| at <= updated_at)
        {
            return Ok(RefreshRotation::NotFound);
        }

        let old_token_id = record.token_id.clone();
        record.token_id = next_token_id.to_owned();
        record.refresh_token = Some(next_refresh.to_owned());
        record.refresh_expires_at = Some(refresh_expires_at);
        record.updated_at = updated_at;
        record.expires_at = expires_at;
        record.rotation_count += 1;
        let rotated = record.clone();

        state.token_id_index.remove(&old_token_id);
        state
            .token_id_index
            .insert(next_token_id.to_owned(), lineage.clone());
        state.refresh_index.remove(presented);
        state
            .refresh_index
            .insert(next_refresh.to_owned(), lineage.clone());
        state
            .retired_refresh_index
            .insert(presented.to_owned(), lineage);

        Ok(RefreshRotation::Rotated(rotated))
    }

    async fn delete_lineage(&self, lineage_id: &str) -> Result<()> {
        let mut state = self.state.write().await;
        if let Some(record) = state.tokens.remove(lineage_id) {
            state.token_id_index.remove(&record.token_id);
            if let Some(code) = record.code.as_deref() {
                state.token_code_index.remove(code);
            }
            if let Some(refresh) = record.refresh_token.as_deref() {
                state.refresh_index.remove(refresh);
            }
        }
        // Retired refresh values stay indexed so late replays keep failing,
        // but they must not resurrect the lineage.
        state
            .retired_refresh_index
            .retain(|_, lineage| lineage != lineage_id);
        Ok(())
    }
}
