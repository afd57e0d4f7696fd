//! Local avatar persistence

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use avatar_protocol::EntityKey;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::fs;
use tracing::{debug, info, warn};

use crate::error::{MirrorError, Result};

/// One avatar as kept in local persistence
#[derive(Debug, Clone, PartialEq)]
pub struct PersistedAvatar {
    pub bytes: Bytes,
    pub mime_type: String,
    pub content_version: Option<String>,
    pub stored_at: DateTime<Utc>,
}

/// Per-entity blob store. Implementations report failures as
/// `PersistenceFailed`; callers treat every failure as a miss.
#[async_trait]
pub trait LocalAvatarStore: Send + Sync {
    async fn get(&self, key: &EntityKey) -> Result<Option<PersistedAvatar>>;
    async fn put(&self, key: &EntityKey, avatar: &PersistedAvatar) -> Result<()>;
}

/// Sidecar metadata written next to each blob
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StoredMeta {
    mime_type: String,
    #[serde(default)]
    content_version: Option<String>,
    stored_at: DateTime<Utc>,
    size: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct StoreStats {
    pub hits: u64,
    pub misses: u64,
    pub writes: u64,
}

/// Avatars stored as `<sha256>.bin` plus `<sha256>.json` under one directory
pub struct FileAvatarStore {
    dir: PathBuf,
    hits: Arc<AtomicU64>,
    misses: Arc<AtomicU64>,
    writes: Arc<AtomicU64>,
}

impl FileAvatarStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            hits: Arc::new(AtomicU64::new(0)),
            misses: Arc::new(AtomicU64::new(0)),
            writes: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Create the store directory
    pub async fn init(&self) -> Result<()> {
        fs::create_dir_all(&self.dir).await?;
        info!(dir = ?self.dir, "Avatar store initialized");
        Ok(())
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn file_key(key: &EntityKey) -> String {
        let mut hasher = Sha256::new();
        hasher.update(key.to_string().as_bytes());
        hex::encode(hasher.finalize())
    }

    fn paths(&self, key: &EntityKey) -> (PathBuf, PathBuf) {
        let name = Self::file_key(key);
        (
            self.dir.join(format!("{}.bin", name)),
            self.dir.join(format!("{}.json", name)),
        )
    }

    pub async fn remove(&self, key: &EntityKey) {
        let (data_path, meta_path) = self.paths(key);
        let _ = fs::remove_file(&meta_path).await;
        let _ = fs::remove_file(&data_path).await;
    }

    pub fn stats(&self) -> StoreStats {
        StoreStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            writes: self.writes.load(Ordering::Relaxed),
        }
    }

    fn miss(&self) -> Result<Option<PersistedAvatar>> {
        self.misses.fetch_add(1, Ordering::Relaxed);
        Ok(None)
    }
}

fn persistence_error(action: &str, err: impl std::fmt::Display) -> MirrorError {
    MirrorError::PersistenceFailed(format!("{}: {}", action, err))
}

#[async_trait]
impl LocalAvatarStore for FileAvatarStore {
    async fn get(&self, key: &EntityKey) -> Result<Option<PersistedAvatar>> {
        let (data_path, meta_path) = self.paths(key);

        let raw_meta = match fs::read(&meta_path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return self.miss(),
            Err(e) => return Err(persistence_error("read metadata", e)),
        };
        let meta: StoredMeta = match serde_json::from_slice(&raw_meta) {
            Ok(meta) => meta,
            Err(e) => {
                warn!(key = %key, error = %e, "Corrupt avatar metadata, removing entry");
                self.remove(key).await;
                return self.miss();
            }
        };

        let data = match fs::read(&data_path).await {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!(key = %key, "Avatar blob missing, removing metadata");
                self.remove(key).await;
                return self.miss();
            }
            Err(e) => return Err(persistence_error("read blob", e)),
        };

        if data.len() as u64 != meta.size {
            warn!(
                key = %key,
                expected = meta.size,
                actual = data.len(),
                "Truncated avatar blob, removing entry"
            );
            self.remove(key).await;
            return self.miss();
        }

        self.hits.fetch_add(1, Ordering::Relaxed);
        debug!(key = %key, size = data.len(), "Avatar store hit");
        Ok(Some(PersistedAvatar {
            bytes: Bytes::from(data),
            mime_type: meta.mime_type,
            content_version: meta.content_version,
            stored_at: meta.stored_at,
        }))
    }

    async fn put(&self, key: &EntityKey, avatar: &PersistedAvatar) -> Result<()> {
        let (data_path, meta_path) = self.paths(key);
        let meta = StoredMeta {
            mime_type: avatar.mime_type.clone(),
            content_version: avatar.content_version.clone(),
            stored_at: avatar.stored_at,
            size: avatar.bytes.len() as u64,
        };
        let raw_meta = serde_json::to_vec(&meta)?;

        // blob first: metadata is the commit marker
        fs::write(&data_path, &avatar.bytes)
            .await
            .map_err(|e| persistence_error("write blob", e))?;
        fs::write(&meta_path, raw_meta)
            .await
            .map_err(|e| persistence_error("write metadata", e))?;

        self.writes.fetch_add(1, Ordering::Relaxed);
        debug!(key = %key, size = avatar.bytes.len(), "Persisted avatar");
        Ok(())
    }
}
