//! Avatar service - one avatar engine per process
//!
//! Resolves avatars through a messaging-platform gateway and serves them
//! over HTTP, pushing `avatar:resolved` events to WebSocket clients.

mod error;
mod server;
mod types;

use crate::error::{Result, ServiceError};
use crate::server::{shutdown_signal, start_server, ServerState, SharedState};
use crate::types::ServiceConfig;
use avatar_engine::{AvatarEngine, EngineConfig};
use avatar_upstream::GatewayClient;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::{prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    let env_filter = EnvFilter::from_default_env()
        .add_directive("avatar_service=info".parse()?)
        .add_directive("avatar_engine=info".parse()?);

    // Use JSON format for GCP Cloud Logging when LOG_FORMAT=json
    if std::env::var("LOG_FORMAT")
        .map(|v| v == "json")
        .unwrap_or(false)
    {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_stackdriver::layer())
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(env_filter).init();
    };

    info!("Starting avatar service...");

    let config = load_config()?;
    info!("Port: {}", config.port);
    info!("Upstream: {}", config.upstream_url);
    info!(
        "Download concurrency: {}",
        config.engine.download_concurrency
    );

    let gateway = Arc::new(GatewayClient::new(&config.upstream_url)?);
    let engine = AvatarEngine::new(gateway.clone(), gateway, config.engine)?;

    let state: SharedState = Arc::new(ServerState::new(engine));

    start_server(state, config.port, shutdown_signal())
        .await
        .map_err(|e| ServiceError::Config(format!("Server error: {}", e)))?;

    info!("Avatar service stopped");
    Ok(())
}

fn env_or<T: FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

fn env_secs(name: &str, default: Duration) -> Duration {
    std::env::var(name)
        .ok()
        .and_then(|s| s.parse::<u64>().ok())
        .map(Duration::from_secs)
        .unwrap_or(default)
}

fn load_config() -> Result<ServiceConfig> {
    let defaults = ServiceConfig::default();
    let engine_defaults = EngineConfig::default();

    let port = env_or("PORT", defaults.port);
    let upstream_url = std::env::var("UPSTREAM_URL").unwrap_or(defaults.upstream_url);

    let engine = EngineConfig {
        user_cache_capacity: env_or(
            "AVATAR_USER_CACHE_CAPACITY",
            engine_defaults.user_cache_capacity,
        ),
        chat_cache_capacity: env_or(
            "AVATAR_CHAT_CACHE_CAPACITY",
            engine_defaults.chat_cache_capacity,
        ),
        identity_soft_ttl: env_secs(
            "AVATAR_CACHE_SOFT_TTL_SECS",
            engine_defaults.identity_soft_ttl,
        ),
        identity_ttl: env_secs("AVATAR_CACHE_TTL_SECS", engine_defaults.identity_ttl),
        byte_store_capacity: env_or(
            "AVATAR_BYTE_STORE_CAPACITY",
            engine_defaults.byte_store_capacity,
        ),
        byte_store_soft_ttl: env_secs(
            "AVATAR_BYTE_STORE_SOFT_TTL_SECS",
            engine_defaults.byte_store_soft_ttl,
        ),
        byte_store_ttl: env_secs("AVATAR_BYTE_STORE_TTL_SECS", engine_defaults.byte_store_ttl),
        download_concurrency: env_or(
            "AVATAR_DOWNLOAD_CONCURRENCY",
            engine_defaults.download_concurrency,
        ),
        refresh_jitter: Duration::from_millis(env_or(
            "AVATAR_REFRESH_JITTER_MS",
            engine_defaults.refresh_jitter.as_millis() as u64,
        )),
        no_avatar_ttl: env_secs("AVATAR_NO_AVATAR_TTL_SECS", engine_defaults.no_avatar_ttl),
        no_avatar_capacity: env_or(
            "AVATAR_NO_AVATAR_CAPACITY",
            engine_defaults.no_avatar_capacity,
        ),
        ..engine_defaults
    };
    engine.validate()?;

    Ok(ServiceConfig {
        port,
        upstream_url,
        engine,
    })
}
