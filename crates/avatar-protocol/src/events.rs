//! Cross-boundary avatar events

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use ts_rs::TS;

use crate::key::{EntityKey, Space};

pub const AVATAR_RESOLVED: &str = "avatar:resolved";
pub const AVATAR_FETCH: &str = "avatar:fetch";
pub const AVATAR_PRIME_CACHE: &str = "avatar:prime-cache";

/// Backend -> client: avatar bytes for one entity
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[serde(rename_all = "camelCase")]
#[ts(export)]
pub struct AvatarResolved {
    pub entity_id: String,
    pub space: Space,
    #[ts(type = "Array<number>")]
    pub bytes: Bytes,
    pub mime_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[ts(optional)]
    pub content_version: Option<String>,
}

impl AvatarResolved {
    pub fn key(&self) -> EntityKey {
        EntityKey::new(self.space, self.entity_id.clone())
    }
}

/// Client -> backend: please resolve this avatar
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[serde(rename_all = "camelCase")]
#[ts(export)]
pub struct AvatarFetch {
    pub entity_id: String,
    pub space: Space,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[ts(optional)]
    pub expected_version: Option<String>,
}

/// Client -> backend: the client already holds this content version
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[serde(rename_all = "camelCase")]
#[ts(export)]
pub struct AvatarPrimeCache {
    pub entity_id: String,
    pub space: Space,
    pub content_version: String,
}

/// Frames sent from a client to the backend
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[serde(tag = "type", content = "data")]
#[ts(export)]
pub enum ClientEvent {
    #[serde(rename = "avatar:fetch")]
    Fetch(AvatarFetch),
    #[serde(rename = "avatar:prime-cache")]
    PrimeCache(AvatarPrimeCache),
}

impl ClientEvent {
    pub fn name(&self) -> &'static str {
        match self {
            ClientEvent::Fetch(_) => AVATAR_FETCH,
            ClientEvent::PrimeCache(_) => AVATAR_PRIME_CACHE,
        }
    }
}

/// Frames pushed from the backend to clients
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[serde(tag = "type", content = "data")]
#[ts(export)]
pub enum ServerEvent {
    #[serde(rename = "avatar:resolved")]
    Resolved(AvatarResolved),
}

impl ServerEvent {
    pub fn name(&self) -> &'static str {
        match self {
            ServerEvent::Resolved(_) => AVATAR_RESOLVED,
        }
    }
}
