//! Messaging-platform gateway client

use std::time::Duration;

use async_trait::async_trait;
use avatar_engine::{Downloaded, Entity, EntityResolver, PhotoDownloader, ProfilePhotoSource};
use avatar_protocol::Space;
use reqwest::Client;
use tracing::{debug, warn};
use url::Url;

use crate::error::{Result, UpstreamError};
use crate::types::{GatewayErrorBody, PhotoSize};

const REQUEST_TIMEOUT_SECS: u64 = 30;
const USER_AGENT: &str = concat!("avatar-upstream/", env!("CARGO_PKG_VERSION"));

/// HTTP client for the gateway that fronts the messaging platform.
///
/// Entities are served at `GET /entities/{space}/{id}`, photo bytes at
/// `GET /photos/{space}/{id}/{size}?photoId=...`.
#[derive(Debug, Clone)]
pub struct GatewayClient {
    client: Client,
    base_url: String,
}

impl GatewayClient {
    pub fn new(base_url: &str) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .user_agent(USER_AGENT)
            .build()?;
        Self::with_client(client, base_url)
    }

    pub fn with_client(client: Client, base_url: &str) -> Result<Self> {
        let parsed = Url::parse(base_url)?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(UpstreamError::InvalidUrl(format!(
                "unsupported scheme: {}",
                parsed.scheme()
            )));
        }

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn entity_url(&self, space: Space, id: &str) -> String {
        format!(
            "{}/entities/{}/{}",
            self.base_url,
            space,
            urlencoding::encode(id)
        )
    }

    fn photo_url(&self, entity: &Entity, size: PhotoSize) -> String {
        let mut url = format!(
            "{}/photos/{}/{}/{}",
            self.base_url,
            entity.space(),
            urlencoding::encode(entity.id()),
            size.as_str()
        );
        if let Some(version) = entity.profile_photo_version() {
            url.push_str("?photoId=");
            url.push_str(&urlencoding::encode(version));
        }
        url
    }

    /// Fetch entity metadata
    pub async fn fetch_entity(&self, space: Space, id: &str) -> Result<Entity> {
        let url = self.entity_url(space, id);
        debug!(url = %url, "Fetching entity");

        let response = self.client.get(&url).send().await?;
        if !response.status().is_success() {
            return Err(status_error(response).await);
        }

        Ok(response.json::<Entity>().await?)
    }

    /// Fetch photo bytes at the given size
    pub async fn fetch_photo(&self, entity: &Entity, size: PhotoSize) -> Result<Downloaded> {
        let url = self.photo_url(entity, size);
        debug!(url = %url, "Fetching photo");

        let response = self.client.get(&url).send().await?;
        if !response.status().is_success() {
            let err = status_error(response).await;
            warn!(url = %url, error = %err, "Photo fetch failed");
            return Err(err);
        }

        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .and_then(image_mime_type);

        let bytes = response.bytes().await?;
        if bytes.is_empty() {
            return Err(UpstreamError::Status(204, "empty photo body".to_string()));
        }

        debug!(
            size = bytes.len(),
            content_type = ?content_type,
            "Fetched photo"
        );
        Ok(Downloaded::new(bytes, content_type.as_deref()))
    }
}

#[async_trait]
impl EntityResolver for GatewayClient {
    async fn resolve_entity(&self, space: Space, id: &str) -> avatar_engine::Result<Entity> {
        self.fetch_entity(space, id)
            .await
            .map_err(UpstreamError::into_lookup_error)
    }
}

#[async_trait]
impl PhotoDownloader for GatewayClient {
    async fn download_profile_photo(&self, entity: &Entity) -> avatar_engine::Result<Downloaded> {
        self.fetch_photo(entity, PhotoSize::Small)
            .await
            .map_err(UpstreamError::into_download_error)
    }

    async fn download_media(&self, entity: &Entity) -> avatar_engine::Result<Downloaded> {
        self.fetch_photo(entity, PhotoSize::Full)
            .await
            .map_err(UpstreamError::into_download_error)
    }
}

async fn status_error(response: reqwest::Response) -> UpstreamError {
    let status = response.status();
    let message = match response.json::<GatewayErrorBody>().await {
        Ok(body) => body.error,
        Err(_) => status.canonical_reason().unwrap_or("unknown").to_string(),
    };
    UpstreamError::Status(status.as_u16(), message)
}

/// Keep only `image/*` content types, without parameters
fn image_mime_type(header: &str) -> Option<String> {
    let mime = header.split(';').next()?.trim().to_ascii_lowercase();
    mime.starts_with("image/").then_some(mime)
}
