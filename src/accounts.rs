// ABOUTME: Account management: credential checks, device-session binding, consent tracking
// ABOUTME: Sign-in/up, handle availability, password reset, and per-client authorization state
//
// Licensed under either of Apache License, Version 2.0 or MIT License at your option.
// Copyright ©2025 Async-IO.org

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use chrono::{Duration, Utc};
use ring::rand::{SecureRandom, SystemRandom};
use std::sync::Arc;
use uuid::Uuid;

use crate::errors::{OAuthError, OAuthResult};
use crate::models::{Account, AccountSession, DeviceAccountInfo};
use crate::store::{AccountStore, DeviceStore, StoredAccount};

/// Password reset tokens stay redeemable this long
const RESET_TOKEN_EXPIRY_MINUTES: i64 = 15;

/// Verified against when the identifier is unknown, so the failure path does
/// the same bcrypt work as the success path.
const DUMMY_BCRYPT_HASH: &str = "$2b$12$R9h/cIPz0gi.URNNX3kh2OPST9/PgBkqquzi.Ss7KIUgO2t0jWMUW";

/// Side-effect capability invoked around account lifecycle events.
///
/// Deployments supply one implementation at construction; there is no global
/// registration.
#[async_trait]
pub trait AccountHooks: Send + Sync {
    /// Called after a new account is persisted
    async fn on_sign_up(&self, _account: &Account, _device_id: &str) -> Result<()> {
        Ok(())
    }

    /// Called after a successful credential check
    async fn on_sign_in(&self, _account: &Account, _device_id: &str) -> Result<()> {
        Ok(())
    }

    /// Deliver a password-reset token out of band
    async fn deliver_reset_token(&self, _account: &Account, _token: &str) -> Result<()> {
        Ok(())
    }
}

/// Default hooks: every event is a no-op
pub struct NoopAccountHooks;

#[async_trait]
impl AccountHooks for NoopAccountHooks {}

/// Credential checks and device-account session management
pub struct AccountManager {
    accounts: Arc<dyn AccountStore>,
    devices: Arc<dyn DeviceStore>,
    hooks: Arc<dyn AccountHooks>,
    /// Resource audience stamped on accounts created here
    default_audience: String,
    rng: SystemRandom,
}

impl AccountManager {
    #[must_use]
    pub fn new(
        accounts: Arc<dyn AccountStore>,
        devices: Arc<dyn DeviceStore>,
        hooks: Arc<dyn AccountHooks>,
        default_audience: &str,
    ) -> Self {
        Self {
            accounts,
            devices,
            hooks,
            default_audience: default_audience.to_owned(),
            rng: SystemRandom::new(),
        }
    }

    /// Check credentials and attach the account to the device.
    ///
    /// # Errors
    /// `access_denied` with a uniform message on unknown identifier or wrong
    /// password; `server_error` on store failure.
    pub async fn sign_in(
        &self,
        device_id: &str,
        username: &str,
        password: &str,
        remember: bool,
    ) -> OAuthResult<AccountSession> {
        let stored = self
            .accounts
            .find_by_username(username)
            .await
            .map_err(OAuthError::from)?;

        let verified = match &stored {
            Some(stored) => bcrypt::verify(password, &stored.password_hash).unwrap_or(false),
            None => {
                // Equalize work on the unknown-identifier path
                let _ = bcrypt::verify(password, DUMMY_BCRYPT_HASH);
                false
            }
        };
        let Some(stored) = stored.filter(|_| verified) else {
            tracing::info!(username, "sign-in rejected");
            return Err(OAuthError::AccessDenied(
                "Invalid identifier or password".to_owned(),
            ));
        };

        let session = self
            .bind_session(device_id, stored.account.clone(), remember)
            .await?;
        self.hooks
            .on_sign_in(&session.account, device_id)
            .await
            .map_err(OAuthError::from)?;
        Ok(session)
    }

    /// Create an account and attach it to the device.
    ///
    /// # Errors
    /// `invalid_request` if the handle is taken; `server_error` on store
    /// failure.
    pub async fn sign_up(
        &self,
        device_id: &str,
        username: &str,
        password: &str,
        remember: bool,
    ) -> OAuthResult<AccountSession> {
        let password_hash = bcrypt::hash(password, bcrypt::DEFAULT_COST)
            .map_err(|e| anyhow!("Password hashing failed: {e}"))
            .map_err(OAuthError::from)?;
        let account = Account {
            sub: format!("did:example:{}", Uuid::new_v4().simple()),
            aud: self.default_audience.clone(),
            preferred_username: Some(username.to_owned()),
        };
        let created = self
            .accounts
            .create_account(StoredAccount {
                account: account.clone(),
                password_hash,
            })
            .await
            .map_err(OAuthError::from)?;
        if !created {
            return Err(OAuthError::InvalidRequest(
                "Handle is already taken".to_owned(),
            ));
        }

        let session = self.bind_session(device_id, account, remember).await?;
        self.hooks
            .on_sign_up(&session.account, device_id)
            .await
            .map_err(OAuthError::from)?;
        Ok(session)
    }

    async fn bind_session(
        &self,
        device_id: &str,
        account: Account,
        remember: bool,
    ) -> OAuthResult<AccountSession> {
        // Re-authentication keeps previously granted consents
        let authorized_clients = self
            .devices
            .get_device_account(device_id, &account.sub)
            .await
            .map_err(OAuthError::from)?
            .map(|info| info.authorized_clients)
            .unwrap_or_default();

        let info = DeviceAccountInfo {
            authenticated_at: Utc::now(),
            remember,
            authorized_clients,
        };
        self.devices
            .put_device_account(device_id, &account.sub, info.clone())
            .await
            .map_err(OAuthError::from)?;
        Ok(AccountSession { account, info })
    }

    /// All sessions attached to the device
    ///
    /// # Errors
    /// `server_error` on store failure
    pub async fn list_sessions(&self, device_id: &str) -> OAuthResult<Vec<AccountSession>> {
        let mut sessions = Vec::new();
        for (sub, info) in self
            .devices
            .list_device_accounts(device_id)
            .await
            .map_err(OAuthError::from)?
        {
            if let Some(account) = self
                .accounts
                .get_account(&sub)
                .await
                .map_err(OAuthError::from)?
            {
                sessions.push(AccountSession { account, info });
            }
        }
        sessions.sort_by(|a, b| b.info.authenticated_at.cmp(&a.info.authenticated_at));
        Ok(sessions)
    }

    /// Look up an account by subject
    ///
    /// # Errors
    /// `server_error` on store failure
    pub async fn get_account(&self, sub: &str) -> OAuthResult<Option<Account>> {
        self.accounts
            .get_account(sub)
            .await
            .map_err(OAuthError::from)
    }

    /// The session for one device-account pair, if present
    ///
    /// # Errors
    /// `server_error` on store failure
    pub async fn get_session(
        &self,
        device_id: &str,
        sub: &str,
    ) -> OAuthResult<Option<AccountSession>> {
        let Some(info) = self
            .devices
            .get_device_account(device_id, sub)
            .await
            .map_err(OAuthError::from)?
        else {
            return Ok(None);
        };
        let Some(account) = self
            .accounts
            .get_account(sub)
            .await
            .map_err(OAuthError::from)?
        else {
            return Ok(None);
        };
        Ok(Some(AccountSession { account, info }))
    }

    /// Record consent: the client joins the device-account pair's
    /// authorized set.
    ///
    /// # Errors
    /// `server_error` on store failure
    pub async fn add_authorized_client(
        &self,
        device_id: &str,
        sub: &str,
        client_id: &str,
    ) -> OAuthResult<()> {
        let Some(mut info) = self
            .devices
            .get_device_account(device_id, sub)
            .await
            .map_err(OAuthError::from)?
        else {
            return Err(OAuthError::InvalidRequest(
                "No session for this account on this device".to_owned(),
            ));
        };
        if !info.authorized_clients.iter().any(|c| c == client_id) {
            info.authorized_clients.push(client_id.to_owned());
            self.devices
                .put_device_account(device_id, sub, info)
                .await
                .map_err(OAuthError::from)?;
        }
        Ok(())
    }

    /// Pre-check used by the sign-up form
    ///
    /// # Errors
    /// `invalid_request` if taken; `server_error` on store failure
    pub async fn verify_handle_availability(&self, username: &str) -> OAuthResult<()> {
        if self
            .accounts
            .find_by_username(username)
            .await
            .map_err(OAuthError::from)?
            .is_some()
        {
            return Err(OAuthError::InvalidRequest(
                "Handle is already taken".to_owned(),
            ));
        }
        Ok(())
    }

    /// Issue a reset token and hand it to the delivery hook.
    ///
    /// Succeeds silently for unknown identifiers so the endpoint cannot be
    /// used to enumerate accounts.
    ///
    /// # Errors
    /// `server_error` on store failure
    pub async fn reset_password_request(&self, username: &str) -> OAuthResult<()> {
        let Some(stored) = self
            .accounts
            .find_by_username(username)
            .await
            .map_err(OAuthError::from)?
        else {
            return Ok(());
        };

        let mut bytes = [0u8; 24];
        self.rng
            .fill(&mut bytes)
            .map_err(|_| anyhow!("System RNG failure"))
            .map_err(OAuthError::from)?;
        let token = format!("rst-{}", URL_SAFE_NO_PAD.encode(bytes));

        self.accounts
            .put_reset_token(
                &token,
                &stored.account.sub,
                Utc::now() + Duration::minutes(RESET_TOKEN_EXPIRY_MINUTES),
            )
            .await
            .map_err(OAuthError::from)?;
        self.hooks
            .deliver_reset_token(&stored.account, &token)
            .await
            .map_err(OAuthError::from)?;
        Ok(())
    }

    /// Redeem a reset token (single use) and set the new password.
    ///
    /// # Errors
    /// `invalid_request` on unknown or expired token
    pub async fn reset_password_confirm(
        &self,
        token: &str,
        new_password: &str,
    ) -> OAuthResult<()> {
        let Some(sub) = self
            .accounts
            .take_reset_token(token)
            .await
            .map_err(OAuthError::from)?
        else {
            return Err(OAuthError::InvalidRequest(
                "Unknown or expired reset token".to_owned(),
            ));
        };
        let password_hash = bcrypt::hash(new_password, bcrypt::DEFAULT_COST)
            .map_err(|e| anyhow!("Password hashing failed: {e}"))
            .map_err(OAuthError::from)?;
        self.accounts
            .update_password(&sub, password_hash)
            .await
            .map_err(OAuthError::from)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::MemoryStore;

    fn manager(store: Arc<MemoryStore>) -> AccountManager {
        AccountManager::new(
            store.clone(),
            store,
            Arc::new(NoopAccountHooks),
            "https://rs.example",
        )
    }

    #[tokio::test]
    async fn sign_up_then_sign_in() {
        let store = Arc::new(MemoryStore::new());
        let accounts = manager(store);

        let session = accounts
            .sign_up("dev-1", "alice.example", "hunter2hunter2", true)
            .await
            .unwrap();
        assert!(session.account.sub.starts_with("did:example:"));
        assert!(session.info.remember);

        let again = accounts
            .sign_in("dev-1", "alice.example", "hunter2hunter2", false)
            .await
            .unwrap();
        assert_eq!(again.account.sub, session.account.sub);
    }

    #[tokio::test]
    async fn wrong_password_is_uniform_denial() {
        let store = Arc::new(MemoryStore::new());
        let accounts = manager(store);
        accounts
            .sign_up("dev-1", "alice.example", "hunter2hunter2", false)
            .await
            .unwrap();

        let known = accounts
            .sign_in("dev-1", "alice.example", "wrong", false)
            .await
            .unwrap_err();
        let unknown = accounts
            .sign_in("dev-1", "nobody.example", "wrong", false)
            .await
            .unwrap_err();
        assert_eq!(known.to_body().error_description, unknown.to_body().error_description);
    }

    #[tokio::test]
    async fn consent_survives_reauthentication() {
        let store = Arc::new(MemoryStore::new());
        let accounts = manager(store);
        let session = accounts
            .sign_up("dev-1", "alice.example", "hunter2hunter2", true)
            .await
            .unwrap();
        accounts
            .add_authorized_client("dev-1", &session.account.sub, "https://app.example/c.json")
            .await
            .unwrap();

        let again = accounts
            .sign_in("dev-1", "alice.example", "hunter2hunter2", true)
            .await
            .unwrap();
        assert_eq!(
            again.info.authorized_clients,
            vec!["https://app.example/c.json".to_owned()]
        );
    }

    #[tokio::test]
    async fn reset_token_is_single_use() {
        struct Capture(tokio::sync::Mutex<Option<String>>);
        #[async_trait]
        impl AccountHooks for Capture {
            async fn deliver_reset_token(&self, _account: &Account, token: &str) -> Result<()> {
                *self.0.lock().await = Some(token.to_owned());
                Ok(())
            }
        }

        let store = Arc::new(MemoryStore::new());
        let hooks = Arc::new(Capture(tokio::sync::Mutex::new(None)));
        let accounts = AccountManager::new(
            store.clone(),
            store,
            hooks.clone(),
            "https://rs.example",
        );
        accounts
            .sign_up("dev-1", "alice.example", "hunter2hunter2", false)
            .await
            .unwrap();

        accounts
            .reset_password_request("alice.example")
            .await
            .unwrap();
        let token = hooks.0.lock().await.clone().unwrap();

        accounts
            .reset_password_confirm(&token, "correct-horse-battery")
            .await
            .unwrap();
        assert!(accounts
            .reset_password_confirm(&token, "again")
            .await
            .is_err());

        accounts
            .sign_in("dev-1", "alice.example", "correct-horse-battery", false)
            .await
            .unwrap();
    }
}
