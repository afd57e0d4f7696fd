//! Presentation-tier avatar cache and the ensure protocol

use std::collections::HashMap;
use std::sync::Arc;

use avatar_protocol::{AvatarFetch, AvatarPrimeCache, AvatarResolved, ClientEvent, EntityKey};
use chrono::{DateTime, Utc};
use futures_util::future::join_all;
use inflight_set::InFlightSet;
use moka::future::Cache;
use serde::Serialize;
use tokio::sync::{broadcast, RwLock};
use tracing::{debug, warn};

use crate::backend::AvatarBackend;
use crate::config::{MirrorConfig, MAX_MIRROR_TTL};
use crate::store::{LocalAvatarStore, PersistedAvatar};
use crate::surface::{sniff_mime, DisplayRef, DisplaySurface};

const CHANGE_BUFFER: usize = 256;

#[derive(Debug, Clone, PartialEq)]
pub struct MirrorEntry {
    pub display_ref: DisplayRef,
    pub content_version: Option<String>,
    pub mime_type: String,
    pub updated_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl MirrorEntry {
    fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    /// No expectation, or the exact version expected
    fn satisfies(&self, expected_version: Option<&str>) -> bool {
        match expected_version {
            None => true,
            Some(expected) => self.content_version.as_deref() == Some(expected),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct MirrorStats {
    pub entries: usize,
    pub ensuring: usize,
    pub pending_fetches: u64,
}

struct MirrorInner {
    config: MirrorConfig,
    store: Arc<dyn LocalAvatarStore>,
    backend: Arc<dyn AvatarBackend>,
    surface: Arc<dyn DisplaySurface>,
    entries: RwLock<HashMap<EntityKey, MirrorEntry>>,
    ensuring: InFlightSet<EntityKey>,
    pending_fetches: Cache<EntityKey, ()>,
    changes: broadcast::Sender<EntityKey>,
}

/// Client mirror of resolved avatars, owned by one presentation-tier instance
#[derive(Clone)]
pub struct AvatarMirror {
    inner: Arc<MirrorInner>,
}

impl AvatarMirror {
    pub fn new(
        config: MirrorConfig,
        store: Arc<dyn LocalAvatarStore>,
        backend: Arc<dyn AvatarBackend>,
        surface: Arc<dyn DisplaySurface>,
    ) -> Self {
        let config = config.bounded();
        let pending_fetches = Cache::builder()
            .max_capacity(config.capacity as u64)
            .time_to_live(config.pending_fetch_timeout)
            .build();
        let (changes, _) = broadcast::channel(CHANGE_BUFFER);

        Self {
            inner: Arc::new(MirrorInner {
                config,
                store,
                backend,
                surface,
                entries: RwLock::new(HashMap::new()),
                ensuring: InFlightSet::new(),
                pending_fetches,
                changes,
            }),
        }
    }

    pub fn config(&self) -> &MirrorConfig {
        &self.inner.config
    }

    /// Keys whose mirror entry changed, for reactive re-rendering
    pub fn subscribe(&self) -> broadcast::Receiver<EntityKey> {
        self.inner.changes.subscribe()
    }

    /// Make sure an avatar for `key` becomes available. Never fails; the
    /// result shows up later through [`subscribe`](Self::subscribe).
    pub async fn ensure(&self, key: &EntityKey, expected_version: Option<&str>) {
        if self.has_valid(key, expected_version).await {
            return;
        }

        let Some(_guard) = self.inner.ensuring.try_acquire(key.clone()) else {
            debug!(key = %key, "Ensure already running");
            return;
        };

        self.prefill(key).await;

        if self.has_valid(key, expected_version).await {
            if let Some(version) = self.version_of(key).await {
                self.prime_backend(key, version);
            }
            return;
        }

        if self.inner.pending_fetches.contains_key(key) {
            debug!(key = %key, "Fetch already pending");
            return;
        }
        self.inner.pending_fetches.insert(key.clone(), ()).await;

        let event = ClientEvent::Fetch(AvatarFetch {
            entity_id: key.id.clone(),
            space: key.space,
            expected_version: expected_version.map(str::to_string),
        });
        if let Err(e) = self.inner.backend.send(event).await {
            warn!(key = %key, error = %e, "Failed to request avatar");
            self.inner.pending_fetches.invalidate(key).await;
        }
    }

    /// Warm the mirror from local persistence. Returns how many entries loaded.
    pub async fn prefill_many(&self, keys: &[EntityKey]) -> usize {
        let loads = keys.iter().map(|key| async move {
            if self.has_valid(key, None).await {
                return false;
            }
            match self.inner.ensuring.try_acquire(key.clone()) {
                Some(_guard) => self.prefill(key).await,
                None => false,
            }
        });
        let loaded = join_all(loads).await.into_iter().filter(|ok| *ok).count();
        debug!(requested = keys.len(), loaded, "Bulk prefill finished");
        loaded
    }

    /// Apply an `avatar:resolved` event from the backend
    pub async fn handle_resolved(&self, event: AvatarResolved) {
        let key = event.key();
        self.inner.pending_fetches.invalidate(&key).await;

        if let Some(version) = event.content_version.as_deref() {
            if self.has_valid(&key, Some(version)).await {
                debug!(key = %key, version, "Resolved event matches mirror, ignoring");
                return;
            }
        }

        let display_ref = match self.inner.surface.create(&event.bytes, &event.mime_type) {
            Ok(display_ref) => display_ref,
            Err(e) => {
                warn!(key = %key, error = %e, "Resolved avatar is not a displayable image");
                return;
            }
        };

        let now = Utc::now();
        let persisted = PersistedAvatar {
            bytes: event.bytes,
            mime_type: event.mime_type,
            content_version: event.content_version,
            stored_at: now,
        };
        if let Err(e) = self.inner.store.put(&key, &persisted).await {
            warn!(key = %key, error = %e, "Failed to persist avatar");
        }

        self.insert(key, display_ref, persisted.content_version, persisted.mime_type, now)
            .await;
    }

    /// Display reference for a valid entry
    pub async fn display_ref(&self, key: &EntityKey) -> Option<DisplayRef> {
        if !self.has_valid(key, None).await {
            return None;
        }
        let entries = self.inner.entries.read().await;
        entries.get(key).map(|entry| entry.display_ref.clone())
    }

    pub async fn entry(&self, key: &EntityKey) -> Option<MirrorEntry> {
        if !self.has_valid(key, None).await {
            return None;
        }
        self.inner.entries.read().await.get(key).cloned()
    }

    /// Whether a non-expired entry satisfying `expected_version` exists.
    /// Expired entries are dropped on the way.
    pub async fn has_valid(&self, key: &EntityKey, expected_version: Option<&str>) -> bool {
        let now = Utc::now();
        {
            let entries = self.inner.entries.read().await;
            match entries.get(key) {
                None => return false,
                Some(entry) if !entry.is_expired(now) => return entry.satisfies(expected_version),
                Some(_) => {}
            }
        }

        self.remove_expired(key, now).await;
        false
    }

    /// Drop every expired entry. Returns how many were removed.
    pub async fn cleanup_expired(&self) -> usize {
        let now = Utc::now();
        let removed: Vec<MirrorEntry> = {
            let mut entries = self.inner.entries.write().await;
            let expired: Vec<EntityKey> = entries
                .iter()
                .filter(|(_, entry)| entry.is_expired(now))
                .map(|(key, _)| key.clone())
                .collect();
            expired
                .iter()
                .filter_map(|key| entries.remove(key))
                .collect()
        };

        for entry in &removed {
            self.inner.surface.release(&entry.display_ref);
        }
        if !removed.is_empty() {
            debug!(removed = removed.len(), "Swept expired mirror entries");
        }
        removed.len()
    }

    pub async fn len(&self) -> usize {
        self.inner.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.entries.read().await.is_empty()
    }

    pub async fn stats(&self) -> MirrorStats {
        MirrorStats {
            entries: self.len().await,
            ensuring: self.inner.ensuring.len(),
            pending_fetches: self.inner.pending_fetches.entry_count(),
        }
    }

    async fn version_of(&self, key: &EntityKey) -> Option<String> {
        self.inner
            .entries
            .read()
            .await
            .get(key)
            .and_then(|entry| entry.content_version.clone())
    }

    /// Best effort: every failure is logged and reported as `false`
    async fn prefill(&self, key: &EntityKey) -> bool {
        let persisted = match self.inner.store.get(key).await {
            Ok(Some(persisted)) => persisted,
            Ok(None) => return false,
            Err(e) => {
                warn!(key = %key, error = %e, "Local avatar read failed");
                return false;
            }
        };

        let now = Utc::now();
        let expires_at = persisted.stored_at + entry_ttl(&self.inner.config);
        if now >= expires_at {
            debug!(key = %key, "Persisted avatar too old for prefill");
            return false;
        }

        if let Err(e) = sniff_mime(&persisted.bytes) {
            warn!(key = %key, error = %e, "Persisted avatar is not an image");
            return false;
        }

        let display_ref = match self.inner.surface.create(&persisted.bytes, &persisted.mime_type) {
            Ok(display_ref) => display_ref,
            Err(e) => {
                warn!(key = %key, error = %e, "Could not display persisted avatar");
                return false;
            }
        };

        self.insert(
            key.clone(),
            display_ref,
            persisted.content_version,
            persisted.mime_type,
            persisted.stored_at,
        )
        .await;
        debug!(key = %key, "Prefilled from local store");
        true
    }

    fn prime_backend(&self, key: &EntityKey, content_version: String) {
        let backend = self.inner.backend.clone();
        let event = ClientEvent::PrimeCache(AvatarPrimeCache {
            entity_id: key.id.clone(),
            space: key.space,
            content_version,
        });
        let key = key.clone();
        tokio::spawn(async move {
            if let Err(e) = backend.send(event).await {
                debug!(key = %key, error = %e, "Prime hint not delivered");
            }
        });
    }

    async fn insert(
        &self,
        key: EntityKey,
        display_ref: DisplayRef,
        content_version: Option<String>,
        mime_type: String,
        updated_at: DateTime<Utc>,
    ) {
        let entry = MirrorEntry {
            display_ref,
            content_version,
            mime_type,
            updated_at,
            expires_at: updated_at + entry_ttl(&self.inner.config),
        };

        let mut released = Vec::new();
        {
            let mut entries = self.inner.entries.write().await;
            if !entries.contains_key(&key) && entries.len() >= self.inner.config.capacity {
                let oldest = entries
                    .iter()
                    .min_by_key(|(_, e)| e.updated_at)
                    .map(|(k, _)| k.clone());
                if let Some(oldest) = oldest {
                    if let Some(evicted) = entries.remove(&oldest) {
                        debug!(key = %oldest, "Evicted oldest mirror entry");
                        released.push(evicted.display_ref);
                    }
                }
            }
            if let Some(previous) = entries.insert(key.clone(), entry) {
                released.push(previous.display_ref);
            }
        }

        for display_ref in &released {
            self.inner.surface.release(display_ref);
        }
        let _ = self.inner.changes.send(key);
    }

    async fn remove_expired(&self, key: &EntityKey, now: DateTime<Utc>) {
        let removed = {
            let mut entries = self.inner.entries.write().await;
            match entries.get(key) {
                Some(entry) if entry.is_expired(now) => entries.remove(key),
                _ => None,
            }
        };
        if let Some(entry) = removed {
            debug!(key = %key, "Dropped expired mirror entry");
            self.inner.surface.release(&entry.display_ref);
        }
    }
}

fn entry_ttl(config: &MirrorConfig) -> chrono::Duration {
    chrono::Duration::from_std(config.entry_ttl.min(MAX_MIRROR_TTL))
        .unwrap_or_else(|_| chrono::Duration::days(365))
}
