//! Collaborator contracts: the messaging platform as the engine sees it

use async_trait::async_trait;
use avatar_protocol::Space;
use bytes::Bytes;

use crate::entity::Entity;
use crate::error::Result;

pub const DEFAULT_MIME_TYPE: &str = "image/jpeg";

/// Raw image bytes as returned by a download path
#[derive(Debug, Clone, PartialEq)]
pub struct Downloaded {
    pub bytes: Bytes,
    pub mime_type: String,
}

impl Downloaded {
    /// Missing or blank mime types fall back to JPEG, the platform's photo format
    pub fn new(bytes: impl Into<Bytes>, mime_type: Option<&str>) -> Self {
        let mime_type = mime_type
            .map(str::trim)
            .filter(|m| !m.is_empty())
            .unwrap_or(DEFAULT_MIME_TYPE)
            .to_string();
        Self {
            bytes: bytes.into(),
            mime_type,
        }
    }
}

/// Resolves entity metadata. Failures surface as `EntityLookupFailed`.
#[async_trait]
pub trait EntityResolver: Send + Sync {
    async fn resolve_entity(&self, space: Space, id: &str) -> Result<Entity>;
}

/// Downloads profile photo bytes for an entity
#[async_trait]
pub trait PhotoDownloader: Send + Sync {
    /// Small profile photo download
    async fn download_profile_photo(&self, entity: &Entity) -> Result<Downloaded>;

    /// Generic media download, tried once when the profile photo path fails
    async fn download_media(&self, entity: &Entity) -> Result<Downloaded>;
}
