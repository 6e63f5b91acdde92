// ABOUTME: Main library entry point for the Meridian OAuth authorization server
// ABOUTME: Composes managers over pluggable stores into the OAuth 2.1 endpoint surface
//
// Licensed under either of Apache License, Version 2.0 or MIT License at your option.
// Copyright ©2025 Async-IO.org

#![deny(unsafe_code)]

//! # Meridian OAuth Server
//!
//! An OAuth 2.1 authorization server for a decentralized identity network.
//! The server mediates between end users authenticating on a device, client
//! applications requesting delegated access, and resource servers consuming
//! issued tokens.
//!
//! ## Features
//!
//! - **Pushed Authorization Requests** (RFC 9126) with single-use `request_uri`
//! - **JWT-Secured Authorization Requests** (RFC 9101) verified against client JWKS
//! - **DPoP sender-constrained tokens** (RFC 9449) with nonce rotation
//! - **PKCE** (RFC 7636) with mandatory `S256` for public clients
//! - **Refresh rotation** with lineage revocation on replay
//! - **Introspection and revocation** (RFC 7662 / RFC 7009)
//!
//! ## Architecture
//!
//! Coordinated managers over pluggable stores, leaves first: signer →
//! replay → device → account → client → request → token → provider.
//! All shared state lives behind store traits whose implementations are
//! responsible for single-key atomicity; compound operations are decomposed
//! into conditional inserts plus idempotent compensation.
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use meridian_oauth_server::config::environment::ServerConfig;
//! use meridian_oauth_server::provider::Provider;
//! use meridian_oauth_server::store::memory::MemoryStore;
//!
//! # async fn example() -> anyhow::Result<()> {
//! let config = ServerConfig::from_env()?;
//! let store = Arc::new(MemoryStore::new());
//! let provider = Provider::builder(config.provider_config()?)
//!     .with_memory_store(store)
//!     .build()?;
//! # Ok(())
//! # }
//! ```

/// Account management: credential checks, device-session binding, consent tracking
pub mod accounts;

/// Client metadata resolution, credential verification, and JAR decoding
pub mod clients;

/// Configuration management
pub mod config;

/// Application constants organized by domain
pub mod constants;

/// Device identity bound to a user-agent session via signed cookie pairs
pub mod device;

/// DPoP proof verification and server nonce rotation
pub mod dpop;

/// Centralized OAuth error taxonomy and HTTP response mapping
pub mod errors;

/// Core data model shared across managers
pub mod models;

/// Endpoint orchestration: PAR, authorize, token, revoke, introspect
pub mod provider;

/// At-most-once acceptance of nonces per semantic namespace
pub mod replay;

/// Authorization-request state machine
pub mod requests;

/// Issuer key management, JWT signing, and public JWKS
pub mod signer;

/// Store traits and the in-memory reference implementation
pub mod store;

/// Token issuance, refresh rotation, revocation, and introspection
pub mod tokens;
