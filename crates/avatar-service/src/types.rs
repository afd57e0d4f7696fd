//! Service configuration and HTTP payloads

use avatar_engine::{EngineConfig, EngineStats, ResolutionSource};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub port: u16,
    /// Base URL of the messaging-platform gateway
    pub upstream_url: String,
    pub engine: EngineConfig,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            port: 3002,
            upstream_url: "http://localhost:8081".to_string(),
            engine: EngineConfig::default(),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub uptime_secs: u64,
    pub engine: EngineStats,
}

/// Outcome of `POST /avatar/fetch`. The bytes themselves go out over `/ws`.
#[derive(Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FetchResponse {
    pub emitted: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<ResolutionSource>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content_version: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, PartialEq)]
pub struct PrimeResponse {
    pub primed: bool,
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}
