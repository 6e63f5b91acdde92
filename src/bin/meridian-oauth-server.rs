// ABOUTME: Server binary: wires config, stores, and routes, then serves
// ABOUTME: A bare invocation runs a development instance with in-memory stores
//
// Licensed under either of Apache License, Version 2.0 or MIT License at your option.
// Copyright ©2025 Async-IO.org

use anyhow::{Context, Result};
use std::sync::Arc;

use meridian_oauth_server::config::environment::ServerConfig;
use meridian_oauth_server::provider::{routes::oauth_routes, Provider};
use meridian_oauth_server::signer::{RsaSigningKey, Signer};
use meridian_oauth_server::store::memory::MemoryStore;

#[tokio::main]
async fn main() -> Result<()> {
    let config = ServerConfig::from_env()?;

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(config.log_level.clone())),
        )
        .init();

    let mut builder = Provider::builder(config.provider_config()?);
    if let Some(pem_path) = &config.signing_key_pem {
        let pem = std::fs::read_to_string(pem_path)
            .with_context(|| format!("Failed to read {pem_path}"))?;
        let mut signer = Signer::new(&config.issuer);
        signer.add_key(RsaSigningKey::import_private_key_pem("key-main", &pem)?)?;
        builder = builder.with_signer(signer);
    }

    let provider = Arc::new(
        builder
            .with_memory_store(Arc::new(MemoryStore::new()))
            .build()?,
    );

    tracing::info!(
        issuer = %config.issuer,
        port = config.http_port,
        "meridian-oauth-server listening"
    );
    warp::serve(oauth_routes(provider))
        .run(([0, 0, 0, 0], config.http_port))
        .await;
    Ok(())
}
