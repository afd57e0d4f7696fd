//! Content-addressed avatar bytes shared by both identity spaces

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use moka::future::Cache;
use moka::notification::RemovalCause;
use tracing::{debug, warn};

use crate::config::{EngineConfig, MAX_TTL};
use crate::error::{AvatarError, Result};
use crate::gate::DownloadGate;
use crate::refresh::RefreshScheduler;
use crate::resolver::Downloaded;

/// Bytes for one content version. Replaced wholesale, never edited.
#[derive(Debug, Clone, PartialEq)]
pub struct ByteStoreEntry {
    pub bytes: Bytes,
    pub mime_type: String,
    pub updated_at: DateTime<Utc>,
    pub soft_expires_at: DateTime<Utc>,
}

impl ByteStoreEntry {
    pub fn new(bytes: Bytes, mime_type: impl Into<String>, soft_ttl: Duration) -> Self {
        let now = Utc::now();
        Self {
            bytes,
            mime_type: mime_type.into(),
            updated_at: now,
            soft_expires_at: now + to_chrono(soft_ttl),
        }
    }

    pub fn is_stale(&self) -> bool {
        Utc::now() >= self.soft_expires_at
    }
}

/// Result of [`ByteStore::ensure`]
#[derive(Debug, Clone, PartialEq)]
pub struct Ensured {
    pub bytes: Bytes,
    pub mime_type: String,
    /// True when this call ran the download itself
    pub downloaded: bool,
}

#[derive(Clone)]
pub struct ByteStore {
    cache: Cache<String, ByteStoreEntry>,
    gate: DownloadGate,
    scheduler: RefreshScheduler,
    soft_ttl: Duration,
    refresh_jitter: Duration,
    downloads: Arc<AtomicU64>,
    refreshes: Arc<AtomicU64>,
}

impl ByteStore {
    pub fn new(config: &EngineConfig, gate: DownloadGate) -> Self {
        let scheduler = RefreshScheduler::new();
        let listener_scheduler = scheduler.clone();

        // hard TTL and capacity evictions take their pending refresh with them
        let cache = Cache::builder()
            .max_capacity(config.byte_store_capacity)
            .time_to_live(config.byte_store_ttl)
            .eviction_listener(move |version: Arc<String>, _entry, cause: RemovalCause| {
                if cause.was_evicted() {
                    listener_scheduler.cancel(&version);
                }
            })
            .build();

        Self {
            cache,
            gate,
            scheduler,
            soft_ttl: config.byte_store_soft_ttl,
            refresh_jitter: config.refresh_jitter,
            downloads: Arc::new(AtomicU64::new(0)),
            refreshes: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Cached entry for `version`, stale or not
    pub async fn get(&self, version: &str) -> Option<ByteStoreEntry> {
        self.cache.get(version).await
    }

    /// Store bytes under `version` unless something is already there.
    ///
    /// `updated_at` is when the bytes were obtained, so copies taken from an
    /// older identity entry keep their age.
    pub async fn put_if_absent(
        &self,
        version: &str,
        bytes: Bytes,
        mime_type: &str,
        updated_at: DateTime<Utc>,
    ) {
        let entry = ByteStoreEntry {
            bytes,
            mime_type: mime_type.to_string(),
            updated_at,
            soft_expires_at: updated_at + to_chrono(self.soft_ttl),
        };
        self.cache
            .entry_by_ref(version)
            .or_insert_with(async move { entry })
            .await;
    }

    /// Return bytes for `version`, downloading at most once per version.
    ///
    /// Fresh hits do no I/O. Stale hits return immediately and schedule one
    /// background refresh. Misses share a single gated download between all
    /// concurrent callers; a failed download reaches every waiter and leaves
    /// nothing cached. Without a version the download always runs and the
    /// result is not stored.
    pub async fn ensure<F, Fut>(&self, version: Option<&str>, download: F) -> Result<Ensured>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<Downloaded>> + Send + 'static,
    {
        let Some(version) = version else {
            let downloaded = self.download(download).await?;
            return Ok(Ensured {
                bytes: downloaded.bytes,
                mime_type: downloaded.mime_type,
                downloaded: true,
            });
        };

        if let Some(entry) = self.cache.get(version).await {
            if entry.is_stale() {
                debug!(version, "Serving stale bytes");
                self.schedule_refresh(version, download);
            } else {
                debug!(version, "Byte store hit");
            }
            return Ok(Ensured {
                bytes: entry.bytes,
                mime_type: entry.mime_type,
                downloaded: false,
            });
        }

        let soft_ttl = self.soft_ttl;
        let fetch = self.download(download);
        let entry = self
            .cache
            .entry_by_ref(version)
            .or_try_insert_with(async move {
                let downloaded = fetch.await?;
                Ok::<_, AvatarError>(ByteStoreEntry::new(
                    downloaded.bytes,
                    downloaded.mime_type,
                    soft_ttl,
                ))
            })
            .await
            .map_err(|e| (*e).clone())?;

        let downloaded = entry.is_fresh();
        let value = entry.into_value();
        Ok(Ensured {
            bytes: value.bytes,
            mime_type: value.mime_type,
            downloaded,
        })
    }

    /// Spawn a jittered re-download of `version`, deduplicated per version
    pub fn schedule_refresh<F, Fut>(&self, version: &str, download: F) -> bool
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<Downloaded>> + Send + 'static,
    {
        let store = self.clone();
        let key = version.to_string();
        let scheduled = self.scheduler.schedule(version, self.refresh_jitter, async move {
            match store.replace(&key, download).await {
                Ok(_) => debug!(version = %key, "Background refresh stored"),
                Err(e) => warn!(version = %key, error = %e, "Background refresh failed"),
            }
        });
        if scheduled {
            self.refreshes.fetch_add(1, Ordering::Relaxed);
        }
        scheduled
    }

    /// Download `version` now and overwrite whatever is stored for it.
    /// On failure the existing entry stays.
    pub async fn replace<F, Fut>(&self, version: &str, download: F) -> Result<Ensured>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<Downloaded>> + Send + 'static,
    {
        let downloaded = self.download(download).await?;
        let entry = ByteStoreEntry::new(downloaded.bytes, downloaded.mime_type, self.soft_ttl);
        self.cache.insert(version.to_string(), entry.clone()).await;
        Ok(Ensured {
            bytes: entry.bytes,
            mime_type: entry.mime_type,
            downloaded: true,
        })
    }

    fn download<F, Fut>(&self, download: F) -> impl Future<Output = Result<Downloaded>> + Send
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<Downloaded>> + Send + 'static,
    {
        let gate = self.gate.clone();
        let downloads = self.downloads.clone();
        async move {
            gate.with_slot(async move {
                downloads.fetch_add(1, Ordering::Relaxed);
                download().await
            })
            .await
        }
    }

    pub fn cancel_refreshes(&self) -> usize {
        self.scheduler.cancel_all()
    }

    pub fn pending_refreshes(&self) -> usize {
        self.scheduler.pending()
    }

    pub fn downloads(&self) -> u64 {
        self.downloads.load(Ordering::Relaxed)
    }

    pub fn refreshes_scheduled(&self) -> u64 {
        self.refreshes.load(Ordering::Relaxed)
    }

    pub fn entry_count(&self) -> u64 {
        self.cache.entry_count()
    }

    pub async fn run_pending_tasks(&self) {
        self.cache.run_pending_tasks().await;
    }

    #[cfg(test)]
    pub(crate) async fn insert_entry(&self, version: &str, entry: ByteStoreEntry) {
        self.cache.insert(version.to_string(), entry).await;
    }
}

/// Saturates at [`MAX_TTL`] so timestamp arithmetic cannot overflow
pub(crate) fn to_chrono(d: Duration) -> chrono::Duration {
    chrono::Duration::from_std(d.min(MAX_TTL)).unwrap_or_else(|_| chrono::Duration::days(365))
}
