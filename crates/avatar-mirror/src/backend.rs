use async_trait::async_trait;
use avatar_protocol::ClientEvent;
use tokio::sync::mpsc;

use crate::error::{MirrorError, Result};

/// Outgoing half of the client/backend link
#[async_trait]
pub trait AvatarBackend: Send + Sync {
    async fn send(&self, event: ClientEvent) -> Result<()>;
}

/// Queues events for a transport task such as [`WsBridge`](crate::WsBridge)
#[derive(Debug, Clone)]
pub struct ChannelBackend {
    tx: mpsc::UnboundedSender<ClientEvent>,
}

impl ChannelBackend {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<ClientEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

#[async_trait]
impl AvatarBackend for ChannelBackend {
    async fn send(&self, event: ClientEvent) -> Result<()> {
        self.tx
            .send(event)
            .map_err(|e| MirrorError::Backend(format!("transport closed, dropped {}", e.0.name())))
    }
}
