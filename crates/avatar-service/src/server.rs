//! HTTP and WebSocket endpoints
//!
//! Provides /health, /avatar/{space}/{id}, /avatar/fetch,
//! /avatar/prime-cache and the /ws event bridge.

use crate::types::{ErrorResponse, FetchResponse, HealthResponse, PrimeResponse};
use avatar_engine::AvatarEngine;
use avatar_protocol::{AvatarFetch, AvatarPrimeCache, ClientEvent, EntityKey, ServerEvent, Space};
use axum::{
    body::Body,
    extract::ws::{Message, WebSocket, WebSocketUpgrade},
    extract::{Path, State},
    http::{header, HeaderName, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use chrono::{DateTime, Utc};
use futures_util::{SinkExt, StreamExt};
use std::future::Future;
use std::sync::Arc;
use tokio::sync::broadcast;
use tower_http::cors::CorsLayer;
use tracing::{debug, info, warn};

const X_CACHE: HeaderName = HeaderName::from_static("x-cache");

pub struct ServerState {
    pub engine: AvatarEngine,
    pub started_at: DateTime<Utc>,
}

impl ServerState {
    pub fn new(engine: AvatarEngine) -> Self {
        Self {
            engine,
            started_at: Utc::now(),
        }
    }
}

pub type SharedState = Arc<ServerState>;

fn error_response(status: StatusCode, message: impl Into<String>) -> Response {
    (
        status,
        Json(ErrorResponse {
            error: message.into(),
        }),
    )
        .into_response()
}

fn parse_key(space: &str, id: &str) -> Result<EntityKey, Response> {
    let space: Space = space
        .parse()
        .map_err(|e: avatar_protocol::ParseSpaceError| {
            error_response(StatusCode::BAD_REQUEST, e.to_string())
        })?;
    EntityKey::parse(space, id)
        .ok_or_else(|| error_response(StatusCode::BAD_REQUEST, "Invalid entity id"))
}

pub fn create_router(state: SharedState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/avatar/fetch", post(fetch_avatar))
        .route("/avatar/prime-cache", post(prime_cache))
        .route("/avatar/{space}/{id}", get(get_avatar))
        .route("/ws", get(ws_handler))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Serve until `shutdown` resolves, then tear the engine down
pub async fn start_server(
    state: SharedState,
    port: u16,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> std::io::Result<()> {
    let engine = state.engine.clone();
    let router = create_router(state);
    let addr = std::net::SocketAddr::from(([0, 0, 0, 0], port));
    info!("Starting HTTP server on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    let served = axum::serve(listener, router)
        .with_graceful_shutdown(shutdown)
        .await;
    engine.shutdown();
    served
}

/// Resolves on SIGINT or SIGTERM
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for SIGINT");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => warn!(error = %e, "Failed to listen for SIGTERM"),
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => info!("Received SIGINT, shutting down"),
        () = terminate => info!("Received SIGTERM, shutting down"),
    }
}

async fn health(State(state): State<SharedState>) -> Json<HealthResponse> {
    let uptime_secs = (Utc::now() - state.started_at).num_seconds().max(0) as u64;

    Json(HealthResponse {
        status: "ok".to_string(),
        uptime_secs,
        engine: state.engine.stats(),
    })
}

/// Resolve synchronously and return the bytes
async fn get_avatar(
    State(state): State<SharedState>,
    Path((space, id)): Path<(String, String)>,
) -> Response {
    let key = match parse_key(&space, &id) {
        Ok(key) => key,
        Err(response) => return response,
    };

    let (payload, hit) = match state.engine.resolve_one(&key, None).await {
        Some(resolution) => (
            Some((resolution.event.bytes, resolution.event.mime_type)),
            resolution.source.is_cache_hit(),
        ),
        // another resolution for this key is running or the version was
        // unchanged; serve whatever the identity cache holds
        None => (
            state
                .engine
                .cache(key.space)
                .get(&key.id)
                .await
                .and_then(|entry| entry.payload)
                .map(|payload| (payload.bytes, payload.mime_type)),
            true,
        ),
    };

    match payload {
        Some((bytes, mime_type)) => {
            let cache_header = if hit { "HIT" } else { "MISS" };
            (
                [
                    (header::CONTENT_TYPE, mime_type),
                    (header::CACHE_CONTROL, "public, max-age=300".to_string()),
                    (X_CACHE, cache_header.to_string()),
                ],
                Body::from(bytes),
            )
                .into_response()
        }
        None => {
            debug!(key = %key, "No avatar to serve");
            error_response(StatusCode::NOT_FOUND, "Avatar not found")
        }
    }
}

async fn fetch_avatar(
    State(state): State<SharedState>,
    Json(request): Json<AvatarFetch>,
) -> Response {
    let Some(key) = EntityKey::parse(request.space, &request.entity_id) else {
        return error_response(StatusCode::BAD_REQUEST, "Invalid entity id");
    };

    let resolution = state
        .engine
        .resolve_one(&key, request.expected_version.as_deref())
        .await;
    Json(FetchResponse {
        emitted: resolution.is_some(),
        source: resolution.as_ref().map(|r| r.source),
        content_version: resolution.and_then(|r| r.event.content_version),
    })
    .into_response()
}

async fn prime_cache(
    State(state): State<SharedState>,
    Json(request): Json<AvatarPrimeCache>,
) -> Response {
    let Some(key) = EntityKey::parse(request.space, &request.entity_id) else {
        return error_response(StatusCode::BAD_REQUEST, "Invalid entity id");
    };

    let primed = state.engine.prime(&key, &request.content_version).await;
    Json(PrimeResponse { primed }).into_response()
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<SharedState>) -> Response {
    ws.on_upgrade(|socket| ws_connection(socket, state))
}

/// Push every resolved avatar to the client; run client frames on the engine
async fn ws_connection(socket: WebSocket, state: SharedState) {
    let mut events = state.engine.subscribe();
    let (mut write, mut read) = socket.split();
    info!("Avatar client connected");

    loop {
        tokio::select! {
            result = events.recv() => match result {
                Ok(event) => {
                    let frame = match serde_json::to_string(&ServerEvent::Resolved(event)) {
                        Ok(frame) => frame,
                        Err(e) => {
                            warn!(error = %e, "Failed to encode resolved event");
                            continue;
                        }
                    };
                    if write.send(Message::Text(frame.into())).await.is_err() {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Avatar client lagged behind");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
            frame = read.next() => match frame {
                Some(Ok(Message::Text(text))) => {
                    match serde_json::from_str::<ClientEvent>(text.as_str()) {
                        Ok(event) => {
                            debug!(event = event.name(), "Client event");
                            let engine = state.engine.clone();
                            tokio::spawn(async move { engine.handle(event).await });
                        }
                        Err(e) => debug!(error = %e, "Ignoring unparseable client frame"),
                    }
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    debug!(error = %e, "Avatar client socket error");
                    break;
                }
            },
        }
    }

    info!("Avatar client disconnected");
}
