// ABOUTME: Device identity bound to a user-agent session via a signed cookie pair
// ABOUTME: Issues and verifies opaque device identifiers with server-side secret digests
//
// Licensed under either of Apache License, Version 2.0 or MIT License at your option.
// Copyright ©2025 Async-IO.org

//! Device sessions
//!
//! A device is the server's notion of one user agent. It travels as a cookie
//! pair: an HMAC-signed identifier plus a bearer secret. The secret is stored
//! only as a digest; presentation is compared in constant time. Multiple
//! accounts may attach to one device.

use anyhow::{anyhow, Result};
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use chrono::Utc;
use ring::hmac;
use ring::rand::{SecureRandom, SystemRandom};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use subtle::ConstantTimeEq;

use crate::models::{Device, RequestMetadata};
use crate::store::DeviceStore;

/// Plaintext cookie values to hand to the user agent
#[derive(Debug, Clone)]
pub struct DeviceCookies {
    pub device_id: String,
    pub secret: String,
}

/// Tamper-evident cookie value codec: `value.sig` with an HMAC tag
struct CookieCodec {
    key: hmac::Key,
}

impl CookieCodec {
    fn new(secret: &[u8]) -> Self {
        Self {
            key: hmac::Key::new(hmac::HMAC_SHA256, secret),
        }
    }

    fn encode(&self, value: &str) -> String {
        let tag = hmac::sign(&self.key, value.as_bytes());
        format!("{value}.{}", URL_SAFE_NO_PAD.encode(tag.as_ref()))
    }

    fn decode(&self, signed: &str) -> Option<String> {
        let (value, tag_b64) = signed.rsplit_once('.')?;
        let tag = URL_SAFE_NO_PAD.decode(tag_b64).ok()?;
        hmac::verify(&self.key, value.as_bytes(), &tag).ok()?;
        Some(value.to_owned())
    }
}

fn random_token(prefix: &str, rng: &SystemRandom) -> Result<String> {
    let mut bytes = [0u8; 24];
    rng.fill(&mut bytes)
        .map_err(|_| anyhow!("System RNG failure"))?;
    Ok(format!("{prefix}{}", URL_SAFE_NO_PAD.encode(bytes)))
}

fn digest(secret: &str) -> String {
    format!("{:x}", Sha256::digest(secret.as_bytes()))
}

/// Issue and verify device identifiers bound to a user-agent session
pub struct DeviceManager {
    store: Arc<dyn DeviceStore>,
    codec: CookieCodec,
    rng: SystemRandom,
}

impl DeviceManager {
    #[must_use]
    pub fn new(store: Arc<dyn DeviceStore>, cookie_secret: &[u8]) -> Self {
        Self {
            store,
            codec: CookieCodec::new(cookie_secret),
            rng: SystemRandom::new(),
        }
    }

    /// Resolve the device for a request, minting a fresh one when the cookie
    /// pair is absent, tampered with, or stale.
    ///
    /// Returns the device id plus, for fresh devices, the cookie values the
    /// response must set.
    ///
    /// # Errors
    /// Returns an error on store failure or RNG failure
    pub async fn resolve(
        &self,
        id_cookie: Option<&str>,
        secret_cookie: Option<&str>,
        metadata: RequestMetadata,
    ) -> Result<(String, Option<DeviceCookies>)> {
        if let (Some(id_cookie), Some(secret)) = (id_cookie, secret_cookie) {
            if let Some(device_id) = self.codec.decode(id_cookie) {
                if let Some(mut device) = self.store.get_device(&device_id).await? {
                    let presented = digest(secret);
                    if presented
                        .as_bytes()
                        .ct_eq(device.secret_digest.as_bytes())
                        .into()
                    {
                        // Keep last-seen transport metadata current
                        if device.metadata != metadata {
                            device.metadata = metadata;
                        }
                        device.updated_at = Utc::now();
                        self.store.upsert_device(device).await?;
                        return Ok((device_id, None));
                    }
                    tracing::warn!(%device_id, "device secret mismatch; reissuing device");
                }
            }
        }
        self.create(metadata).await
    }

    async fn create(&self, metadata: RequestMetadata) -> Result<(String, Option<DeviceCookies>)> {
        let device_id = random_token("dev-", &self.rng)?;
        let secret = random_token("sec-", &self.rng)?;
        let now = Utc::now();
        let device = Device {
            device_id: device_id.clone(),
            secret_digest: digest(&secret),
            metadata,
            created_at: now,
            updated_at: now,
        };
        self.store.upsert_device(device).await?;

        let cookies = DeviceCookies {
            device_id: self.codec.encode(&device_id),
            secret,
        };
        Ok((device_id, Some(cookies)))
    }

    /// Drop a device and all its account sessions
    ///
    /// # Errors
    /// Returns an error on store failure
    pub async fn delete(&self, device_id: &str) -> Result<()> {
        self.store.delete_device(device_id).await
    }
}
