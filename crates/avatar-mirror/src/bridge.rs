//! WebSocket link between a mirror and the avatar service
//!
//! Outgoing `ClientEvent`s are taken from the [`ChannelBackend`] queue and
//! written as JSON text frames; incoming `ServerEvent` frames are applied to
//! the mirror.
//!
//! [`ChannelBackend`]: crate::ChannelBackend

use std::time::Duration;

use avatar_protocol::{ClientEvent, ServerEvent};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, error, info, warn};

use crate::error::{MirrorError, Result};
use crate::mirror::AvatarMirror;

const MAX_RECONNECT_ATTEMPTS: u32 = 10;
const INITIAL_RECONNECT_DELAY: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
pub struct BridgeConfig {
    /// Service WebSocket endpoint, e.g. `ws://localhost:3000/ws`
    pub url: String,
    pub max_reconnect_attempts: u32,
    pub initial_reconnect_delay: Duration,
}

impl BridgeConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            max_reconnect_attempts: MAX_RECONNECT_ATTEMPTS,
            initial_reconnect_delay: INITIAL_RECONNECT_DELAY,
        }
    }
}

/// Why a single connection ended
enum Disconnect {
    /// Server closed the socket
    Closed,
    /// The outgoing queue was dropped; nothing left to send
    Shutdown,
}

pub struct WsBridge {
    config: BridgeConfig,
    mirror: AvatarMirror,
    outgoing: mpsc::UnboundedReceiver<ClientEvent>,
}

impl WsBridge {
    pub fn new(
        config: BridgeConfig,
        mirror: AvatarMirror,
        outgoing: mpsc::UnboundedReceiver<ClientEvent>,
    ) -> Self {
        Self {
            config,
            mirror,
            outgoing,
        }
    }

    /// Keep the link up until the outgoing queue closes or reconnects run out
    pub async fn run(&mut self) -> Result<()> {
        let mut reconnect_attempts = 0;

        loop {
            match self.connect_and_stream(&mut reconnect_attempts).await {
                Ok(Disconnect::Shutdown) => {
                    info!("Avatar bridge shut down");
                    return Ok(());
                }
                Ok(Disconnect::Closed) => {
                    info!("Avatar service closed the connection");
                }
                Err(e) => {
                    error!(error = %e, "Avatar bridge error");
                }
            }

            reconnect_attempts += 1;
            if reconnect_attempts >= self.config.max_reconnect_attempts {
                return Err(MirrorError::MaxReconnectAttempts);
            }

            let delay = self.config.initial_reconnect_delay * 2u32.pow(reconnect_attempts - 1);
            warn!(
                delay = ?delay,
                attempt = reconnect_attempts,
                max = self.config.max_reconnect_attempts,
                "Reconnecting avatar bridge"
            );
            tokio::time::sleep(delay).await;
        }
    }

    async fn connect_and_stream(&mut self, reconnect_attempts: &mut u32) -> Result<Disconnect> {
        info!(url = %self.config.url, "Connecting avatar bridge");
        let (ws_stream, _) = connect_async(self.config.url.as_str()).await?;
        let (mut write, mut read) = ws_stream.split();
        *reconnect_attempts = 0;
        info!("Avatar bridge connected");

        loop {
            tokio::select! {
                frame = read.next() => match frame {
                    Some(Ok(Message::Text(text))) => self.handle_frame(text.as_str()).await,
                    Some(Ok(Message::Close(_))) | None => return Ok(Disconnect::Closed),
                    Some(Ok(_)) => {}
                    Some(Err(e)) => return Err(e.into()),
                },
                event = self.outgoing.recv() => {
                    let Some(event) = event else {
                        let _ = write.send(Message::Close(None)).await;
                        return Ok(Disconnect::Shutdown);
                    };
                    let json = serde_json::to_string(&event)?;
                    debug!(event = event.name(), "Sending avatar event");
                    write.send(Message::Text(json.into())).await?;
                }
            }
        }
    }

    async fn handle_frame(&self, text: &str) {
        match serde_json::from_str::<ServerEvent>(text) {
            Ok(ServerEvent::Resolved(event)) => self.mirror.handle_resolved(event).await,
            Err(e) => debug!(error = %e, "Ignoring unparseable frame"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{AvatarBackend, ChannelBackend};
    use crate::config::MirrorConfig;
    use crate::store::FileAvatarStore;
    use crate::surface::fixtures::PNG;
    use crate::surface::MemorySurface;
    use avatar_protocol::{AvatarFetch, AvatarResolved, EntityKey, Space};
    use axum::extract::ws::{Message as AxumMessage, WebSocket, WebSocketUpgrade};
    use axum::response::Response;
    use axum::routing::get;
    use axum::Router;
    use bytes::Bytes;
    use std::sync::Arc;

    /// Answers every fetch with a PNG for the requested entity
    async fn echo_gateway(mut socket: WebSocket) {
        while let Some(Ok(AxumMessage::Text(text))) = socket.recv().await {
            let Ok(ClientEvent::Fetch(fetch)) = serde_json::from_str::<ClientEvent>(text.as_str())
            else {
                continue;
            };
            let reply = ServerEvent::Resolved(AvatarResolved {
                entity_id: fetch.entity_id,
                space: fetch.space,
                bytes: Bytes::from_static(PNG),
                mime_type: "image/png".to_string(),
                content_version: Some("v1".to_string()),
            });
            let json = serde_json::to_string(&reply).unwrap();
            if socket.send(AxumMessage::Text(json.into())).await.is_err() {
                break;
            }
        }
    }

    async fn ws_handler(ws: WebSocketUpgrade) -> Response {
        ws.on_upgrade(echo_gateway)
    }

    async fn spawn_server() -> String {
        let app = Router::new().route("/ws", get(ws_handler));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("ws://{}/ws", addr)
    }

    fn mirror(dir: &std::path::Path, backend: ChannelBackend) -> AvatarMirror {
        AvatarMirror::new(
            MirrorConfig::default(),
            Arc::new(FileAvatarStore::new(dir)),
            Arc::new(backend),
            Arc::new(MemorySurface::new()),
        )
    }

    #[tokio::test]
    async fn test_fetch_round_trip_updates_mirror() {
        let url = spawn_server().await;
        let dir = tempfile::tempdir().unwrap();
        let (backend, outgoing) = ChannelBackend::new();
        let mirror = mirror(dir.path(), backend.clone());
        let mut changes = mirror.subscribe();

        let mut bridge = WsBridge::new(BridgeConfig::new(url), mirror.clone(), outgoing);
        let handle = tokio::spawn(async move { bridge.run().await });

        let key = EntityKey::chat("-42");
        mirror.ensure(&key, None).await;

        let changed = tokio::time::timeout(Duration::from_secs(5), changes.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(changed, key);
        assert!(mirror.has_valid(&key, Some("v1")).await);

        drop(mirror);
        drop(backend);
        handle.abort();
    }

    #[tokio::test]
    async fn test_bridge_stops_when_queue_closes() {
        let url = spawn_server().await;
        let dir = tempfile::tempdir().unwrap();
        let (backend, outgoing) = ChannelBackend::new();
        let mirror = mirror(dir.path(), ChannelBackend::new().0);

        backend
            .send(ClientEvent::Fetch(AvatarFetch {
                entity_id: "1".to_string(),
                space: Space::User,
                expected_version: None,
            }))
            .await
            .unwrap();
        drop(backend);

        let mut bridge = WsBridge::new(BridgeConfig::new(url), mirror, outgoing);
        let result = tokio::time::timeout(Duration::from_secs(5), bridge.run())
            .await
            .unwrap();
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_gives_up_after_max_attempts() {
        let dir = tempfile::tempdir().unwrap();
        let (_backend, outgoing) = ChannelBackend::new();
        let config = BridgeConfig {
            url: "ws://127.0.0.1:1/ws".to_string(),
            max_reconnect_attempts: 3,
            initial_reconnect_delay: Duration::from_millis(1),
        };

        let mirror = mirror(dir.path(), ChannelBackend::new().0);
        let mut bridge = WsBridge::new(config, mirror, outgoing);
        let err = bridge.run().await.unwrap_err();
        assert!(matches!(err, MirrorError::MaxReconnectAttempts));
    }
}
