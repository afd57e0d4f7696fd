//! Avatar resolution engine
//!
//! One engine per session context. Every resolution path (single fetch,
//! dialog list scan, message pipeline) goes through the same download gate,
//! byte store, identity caches and in-flight set.

use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use avatar_protocol::{AvatarResolved, ClientEvent, EntityKey, Space};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::future::{join_all, BoxFuture};
use inflight_set::InFlightSet;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::byte_store::ByteStore;
use crate::config::EngineConfig;
use crate::entity::{Entity, ProfilePhotoSource};
use crate::error::{AvatarError, Result};
use crate::gate::DownloadGate;
use crate::identity::{AvatarCacheEntry, AvatarPayload, IdentityCache};
use crate::refresh::RefreshScheduler;
use crate::resolver::{Downloaded, EntityResolver, PhotoDownloader};
use crate::sentinel::NoAvatarCache;
use crate::types::{EngineStats, Resolution, ResolutionSource};

/// Single lookups always emit. Batch scans stay silent when the cached
/// version is unchanged.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Single,
    Batch,
}

struct Job {
    key: EntityKey,
    entity: Option<Entity>,
}

#[derive(Default)]
struct Counters {
    lookups: AtomicU64,
    cache_hits: AtomicU64,
    cross_space_hits: AtomicU64,
    emitted: AtomicU64,
    failures: AtomicU64,
}

struct EngineInner {
    resolver: Arc<dyn EntityResolver>,
    downloader: Arc<dyn PhotoDownloader>,
    config: EngineConfig,
    gate: DownloadGate,
    bytes: ByteStore,
    users: IdentityCache,
    chats: IdentityCache,
    no_avatar: NoAvatarCache,
    inflight: InFlightSet<EntityKey>,
    identity_refresh: RefreshScheduler,
    events: broadcast::Sender<AvatarResolved>,
    counters: Counters,
}

#[derive(Clone)]
pub struct AvatarEngine {
    inner: Arc<EngineInner>,
}

impl AvatarEngine {
    pub fn new(
        resolver: Arc<dyn EntityResolver>,
        downloader: Arc<dyn PhotoDownloader>,
        config: EngineConfig,
    ) -> Result<Self> {
        config.validate()?;

        let gate = DownloadGate::new(config.download_concurrency);
        let bytes = ByteStore::new(&config, gate.clone());
        let identity_refresh = RefreshScheduler::new();
        let users = IdentityCache::new(
            Space::User,
            config.user_cache_capacity,
            config.identity_soft_ttl,
            config.identity_ttl,
            identity_refresh.clone(),
        );
        let chats = IdentityCache::new(
            Space::Chat,
            config.chat_cache_capacity,
            config.identity_soft_ttl,
            config.identity_ttl,
            identity_refresh.clone(),
        );
        let no_avatar = NoAvatarCache::new(config.no_avatar_capacity, config.no_avatar_ttl);
        let (events, _) = broadcast::channel(config.event_buffer);

        info!(
            download_concurrency = config.download_concurrency,
            user_capacity = config.user_cache_capacity,
            chat_capacity = config.chat_cache_capacity,
            byte_store_capacity = config.byte_store_capacity,
            "Avatar engine created"
        );

        Ok(Self {
            inner: Arc::new(EngineInner {
                resolver,
                downloader,
                config,
                gate,
                bytes,
                users,
                chats,
                no_avatar,
                inflight: InFlightSet::new(),
                identity_refresh,
                events,
                counters: Counters::default(),
            }),
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    /// Receive every `avatar:resolved` event this engine emits
    pub fn subscribe(&self) -> broadcast::Receiver<AvatarResolved> {
        self.inner.events.subscribe()
    }

    pub fn cache(&self, space: Space) -> &IdentityCache {
        match space {
            Space::User => &self.inner.users,
            Space::Chat => &self.inner.chats,
        }
    }

    pub fn byte_store(&self) -> &ByteStore {
        &self.inner.bytes
    }

    /// Resolve one entity and emit its avatar.
    ///
    /// Returns `None` when nothing was emitted: no avatar, another resolution
    /// for the same key already running, or a failure (logged).
    pub async fn resolve_one(
        &self,
        key: &EntityKey,
        expected_version: Option<&str>,
    ) -> Option<Resolution> {
        self.run(key, expected_version, None, Mode::Single).await
    }

    /// Dialog list scan by id. Emits only avatars that are new or changed.
    pub async fn resolve_many<I, S>(&self, space: Space, ids: I) -> Vec<AvatarResolved>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let jobs = ids
            .into_iter()
            .filter_map(|id| EntityKey::parse(space, id.as_ref()))
            .map(|key| Job { key, entity: None })
            .collect();
        self.run_batch(jobs).await
    }

    /// Dialog list scan over entities the caller already fetched; no lookups.
    /// Entities whose id does not canonicalise are skipped.
    pub async fn resolve_entities(&self, entities: Vec<Entity>) -> Vec<AvatarResolved> {
        let jobs = entities
            .into_iter()
            .filter_map(|entity| {
                let key = entity.key()?;
                Some(Job {
                    key,
                    entity: Some(entity),
                })
            })
            .collect();
        self.run_batch(jobs).await
    }

    /// Resolve the distinct senders of a message batch, concurrently
    pub async fn resolve_senders<I, S>(&self, ids: I) -> Vec<AvatarResolved>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut seen = HashSet::new();
        let keys: Vec<EntityKey> = ids
            .into_iter()
            .filter_map(|id| EntityKey::parse(Space::User, id.as_ref()))
            .filter(|key| seen.insert(key.clone()))
            .collect();

        debug!(senders = keys.len(), "Resolving message senders");
        join_all(keys.iter().map(|key| self.resolve_one(key, None)))
            .await
            .into_iter()
            .flatten()
            .map(|resolution| resolution.event)
            .collect()
    }

    /// Record a content version reported by a client. Never downgrades an
    /// entry that already holds bytes.
    pub async fn prime(&self, key: &EntityKey, content_version: &str) -> bool {
        let version = content_version.trim();
        if version.is_empty() {
            return false;
        }
        self.inner.no_avatar.clear(key).await;
        let primed = self.cache(key.space).prime(&key.id, version).await;
        debug!(space = %key.space, id = %key.id, version, primed, "Prime cache");
        primed
    }

    /// Dispatch a frame received from a client
    pub async fn handle(&self, event: ClientEvent) {
        match event {
            ClientEvent::Fetch(fetch) => {
                let Some(key) = EntityKey::parse(fetch.space, &fetch.entity_id) else {
                    debug!(id = %fetch.entity_id, "Ignoring fetch with invalid id");
                    return;
                };
                self.resolve_one(&key, fetch.expected_version.as_deref()).await;
            }
            ClientEvent::PrimeCache(prime) => {
                if let Some(key) = EntityKey::parse(prime.space, &prime.entity_id) {
                    self.prime(&key, &prime.content_version).await;
                }
            }
        }
    }

    /// Tear down: queued and future downloads fail, scheduled refreshes stop
    pub fn shutdown(&self) {
        self.inner.gate.close();
        let bytes = self.inner.bytes.cancel_refreshes();
        let identities = self.inner.identity_refresh.cancel_all();
        info!(
            cancelled_refreshes = bytes + identities,
            "Avatar engine shut down"
        );
    }

    pub fn stats(&self) -> EngineStats {
        let counters = &self.inner.counters;
        EngineStats {
            user_entries: self.inner.users.entry_count(),
            chat_entries: self.inner.chats.entry_count(),
            byte_store_entries: self.inner.bytes.entry_count(),
            no_avatar_entries: self.inner.no_avatar.entry_count(),
            in_flight: self.inner.inflight.len(),
            pending_refreshes: self.inner.bytes.pending_refreshes()
                + self.inner.identity_refresh.pending(),
            gate: self.inner.gate.stats(),
            lookups: counters.lookups.load(Ordering::Relaxed),
            downloads: self.inner.bytes.downloads(),
            cache_hits: counters.cache_hits.load(Ordering::Relaxed),
            cross_space_hits: counters.cross_space_hits.load(Ordering::Relaxed),
            emitted: counters.emitted.load(Ordering::Relaxed),
            failures: counters.failures.load(Ordering::Relaxed),
        }
    }

    async fn run(
        &self,
        key: &EntityKey,
        expected_version: Option<&str>,
        entity: Option<Entity>,
        mode: Mode,
    ) -> Option<Resolution> {
        match self.resolve(key, expected_version, entity, mode).await {
            Ok(resolution) => resolution,
            Err(e) => {
                self.inner.counters.failures.fetch_add(1, Ordering::Relaxed);
                warn!(
                    space = %key.space,
                    id = %key.id,
                    error = %e,
                    "Avatar resolution failed"
                );
                None
            }
        }
    }

    async fn run_batch(&self, jobs: VecDeque<Job>) -> Vec<AvatarResolved> {
        if jobs.is_empty() {
            return Vec::new();
        }

        let total = jobs.len();
        let workers = self.inner.gate.ceiling().min(total);
        let queue = Mutex::new(jobs);
        let emitted = Mutex::new(Vec::new());

        debug!(total, workers, "Starting batch resolution");
        join_all((0..workers).map(|_| self.batch_worker(&queue, &emitted))).await;

        let emitted = emitted.into_inner().unwrap_or_else(|p| p.into_inner());
        debug!(total, emitted = emitted.len(), "Batch resolution finished");
        emitted
    }

    async fn batch_worker(
        &self,
        queue: &Mutex<VecDeque<Job>>,
        emitted: &Mutex<Vec<AvatarResolved>>,
    ) {
        loop {
            let next = queue.lock().unwrap_or_else(|p| p.into_inner()).pop_front();
            let Some(job) = next else {
                break;
            };
            if let Some(resolution) = self.run(&job.key, None, job.entity, Mode::Batch).await {
                emitted
                    .lock()
                    .unwrap_or_else(|p| p.into_inner())
                    .push(resolution.event);
            }
        }
    }

    async fn resolve(
        &self,
        key: &EntityKey,
        expected_version: Option<&str>,
        entity: Option<Entity>,
        mode: Mode,
    ) -> Result<Option<Resolution>> {
        if self.inner.no_avatar.contains(key).await {
            debug!(space = %key.space, id = %key.id, "Known to have no avatar");
            return Ok(None);
        }

        let Some(_guard) = self.inner.inflight.try_acquire(key.clone()) else {
            debug!(space = %key.space, id = %key.id, "Resolution already in flight");
            return Ok(None);
        };

        let cache = self.cache(key.space);
        let cached = cache.get(&key.id).await;

        // expected version matches: no lookup, no network
        if let (Some(expected), Some(entry)) = (expected_version, cached.as_ref()) {
            if entry.version() == Some(expected) {
                if let Some(payload) = &entry.payload {
                    debug!(space = %key.space, id = %key.id, "Expected version cached");
                    return Ok(Some(self.emit_hit(
                        key,
                        entry.content_version.clone(),
                        payload.clone(),
                        ResolutionSource::IdentityCache,
                    )));
                }
                if let Some(stored) = self.inner.bytes.get(expected).await {
                    debug!(
                        space = %key.space,
                        id = %key.id,
                        "Primed entry served from byte store"
                    );
                    cache
                        .set_resolved(
                            &key.id,
                            Some(expected.to_string()),
                            stored.bytes.clone(),
                            &stored.mime_type,
                        )
                        .await;
                    let payload = AvatarPayload {
                        bytes: stored.bytes,
                        mime_type: stored.mime_type,
                    };
                    return Ok(Some(self.emit_hit(
                        key,
                        Some(expected.to_string()),
                        payload,
                        ResolutionSource::ByteStore,
                    )));
                }
            }
        }

        let entity = match entity {
            Some(entity) => entity,
            None => self.lookup(key).await?,
        };
        let version = entity.profile_photo_version().map(str::to_string);

        // unchanged version with bytes in hand
        if let (Some(version), Some(entry)) = (version.as_deref(), cached.as_ref()) {
            if let (Some(payload), true) = (&entry.payload, entry.version() == Some(version)) {
                self.inner
                    .bytes
                    .put_if_absent(
                        version,
                        payload.bytes.clone(),
                        &payload.mime_type,
                        entry.created_at,
                    )
                    .await;
                if entry.is_stale() {
                    self.schedule_identity_refresh(key, version, entity.clone(), entry);
                }
                if mode == Mode::Batch {
                    self.inner.counters.cache_hits.fetch_add(1, Ordering::Relaxed);
                    debug!(
                        space = %key.space,
                        id = %key.id,
                        "Unchanged avatar, batch skips emission"
                    );
                    return Ok(None);
                }
                return Ok(Some(self.emit_hit(
                    key,
                    Some(version.to_string()),
                    payload.clone(),
                    ResolutionSource::IdentityCache,
                )));
            }
        }

        let Some(version) = version else {
            debug!(space = %key.space, id = %key.id, "Entity has no avatar");
            cache.invalidate(&key.id).await;
            self.inner.no_avatar.mark(key.clone()).await;
            return Ok(None);
        };

        // same photo already held under the other space
        if let Some(found) = self.cache(key.space.other()).find_by_version(&version) {
            if let Some(payload) = found.payload {
                debug!(
                    space = %key.space,
                    id = %key.id,
                    version = %version,
                    "Cross-space reuse"
                );
                self.inner
                    .bytes
                    .put_if_absent(
                        &version,
                        payload.bytes.clone(),
                        &payload.mime_type,
                        found.created_at,
                    )
                    .await;
                cache
                    .set_resolved(
                        &key.id,
                        Some(version.clone()),
                        payload.bytes.clone(),
                        &payload.mime_type,
                    )
                    .await;
                self.inner.counters.cross_space_hits.fetch_add(1, Ordering::Relaxed);
                return Ok(Some(self.emit_hit(
                    key,
                    Some(version),
                    payload,
                    ResolutionSource::CrossSpace,
                )));
            }
        }

        let ensured = self
            .inner
            .bytes
            .ensure(Some(&version), self.download_fn(entity))
            .await?;
        cache
            .set_resolved(
                &key.id,
                Some(version.clone()),
                ensured.bytes.clone(),
                &ensured.mime_type,
            )
            .await;

        let source = if ensured.downloaded {
            ResolutionSource::Download
        } else {
            ResolutionSource::ByteStore
        };
        debug!(
            space = %key.space,
            id = %key.id,
            version = %version,
            ?source,
            "Avatar resolved"
        );
        let payload = AvatarPayload {
            bytes: ensured.bytes,
            mime_type: ensured.mime_type,
        };
        Ok(Some(self.emit(key, Some(version), payload, source)))
    }

    async fn lookup(&self, key: &EntityKey) -> Result<Entity> {
        self.inner.counters.lookups.fetch_add(1, Ordering::Relaxed);
        self.inner.resolver.resolve_entity(key.space, &key.id).await
    }

    /// Primary small profile photo, then the generic media path once
    fn download_fn(
        &self,
        entity: Entity,
    ) -> impl FnOnce() -> BoxFuture<'static, Result<Downloaded>> + Send + 'static {
        let downloader = self.inner.downloader.clone();
        move || {
            Box::pin(async move {
                match downloader.download_profile_photo(&entity).await {
                    Ok(downloaded) => Ok(downloaded),
                    Err(primary) => {
                        debug!(
                            id = %entity.id(),
                            error = %primary,
                            "Profile photo download failed, trying media download"
                        );
                        downloader.download_media(&entity).await.map_err(|fallback| {
                            AvatarError::DownloadFailed(format!(
                                "{}; fallback: {}",
                                primary, fallback
                            ))
                        })
                    }
                }
            })
        }
    }

    /// Re-validate a stale identity entry whose version was just confirmed.
    /// Emits only when the refreshed bytes differ.
    fn schedule_identity_refresh(
        &self,
        key: &EntityKey,
        version: &str,
        entity: Entity,
        entry: &AvatarCacheEntry,
    ) {
        let engine = self.clone();
        let task_key = key.clone();
        let version = version.to_string();
        let previous = entry.payload.as_ref().map(|p| p.bytes.clone());
        let stamped_at = entry.created_at;
        self.inner.identity_refresh.schedule(
            &key.to_string(),
            self.inner.config.refresh_jitter,
            async move {
                engine
                    .refresh_identity(task_key, version, entity, previous, stamped_at)
                    .await;
            },
        );
    }

    async fn refresh_identity(
        &self,
        key: EntityKey,
        version: String,
        entity: Entity,
        previous: Option<Bytes>,
        stamped_at: DateTime<Utc>,
    ) -> Option<Resolution> {
        let Some(_guard) = self.inner.inflight.try_acquire(key.clone()) else {
            return None;
        };

        // evicted, invalidated or already replaced since scheduling
        let cache = self.cache(key.space);
        let current = cache.get(&key.id).await;
        let still_scheduled = current.as_ref().is_some_and(|entry| {
            entry.created_at == stamped_at && entry.version() == Some(version.as_str())
        });
        if !still_scheduled {
            debug!(space = %key.space, id = %key.id, "Identity entry gone, refresh dropped");
            return None;
        }

        // bytes fetched after this entry was stamped are as good as a download
        let fresh = match self.inner.bytes.get(&version).await {
            Some(stored) if stored.updated_at > stamped_at && !stored.is_stale() => {
                Ok((stored.bytes, stored.mime_type, ResolutionSource::ByteStore))
            }
            _ => self
                .inner
                .bytes
                .replace(&version, self.download_fn(entity))
                .await
                .map(|ensured| (ensured.bytes, ensured.mime_type, ResolutionSource::Download)),
        };

        match fresh {
            Ok((bytes, mime_type, source)) => {
                let changed = previous.as_ref() != Some(&bytes);
                cache
                    .set_resolved(&key.id, Some(version.clone()), bytes.clone(), &mime_type)
                    .await;
                debug!(
                    space = %key.space,
                    id = %key.id,
                    version = %version,
                    changed,
                    ?source,
                    "Identity entry refreshed"
                );
                if !changed {
                    return None;
                }
                let payload = AvatarPayload { bytes, mime_type };
                Some(self.emit(&key, Some(version), payload, source))
            }
            Err(e) => {
                warn!(space = %key.space, id = %key.id, error = %e, "Identity refresh failed");
                None
            }
        }
    }

    fn emit_hit(
        &self,
        key: &EntityKey,
        content_version: Option<String>,
        payload: AvatarPayload,
        source: ResolutionSource,
    ) -> Resolution {
        self.inner.counters.cache_hits.fetch_add(1, Ordering::Relaxed);
        self.emit(key, content_version, payload, source)
    }

    fn emit(
        &self,
        key: &EntityKey,
        content_version: Option<String>,
        payload: AvatarPayload,
        source: ResolutionSource,
    ) -> Resolution {
        let event = AvatarResolved {
            entity_id: key.id.clone(),
            space: key.space,
            bytes: payload.bytes,
            mime_type: payload.mime_type,
            content_version,
        };
        self.inner.counters.emitted.fetch_add(1, Ordering::Relaxed);
        // no subscribers is fine
        let _ = self.inner.events.send(event.clone());
        Resolution { event, source }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::{ChatEntity, UserEntity};
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    /// In-memory platform: entities by key, photo bytes by version
    #[derive(Default)]
    struct FakePlatform {
        entities: Mutex<HashMap<EntityKey, Entity>>,
        photos: Mutex<HashMap<String, Vec<u8>>>,
        failing_primary: Mutex<HashSet<String>>,
        failing_all: Mutex<HashSet<String>>,
        delay: Duration,
        lookups: AtomicUsize,
        primary_downloads: AtomicUsize,
        fallback_downloads: AtomicUsize,
    }

    impl FakePlatform {
        fn with_delay(delay: Duration) -> Self {
            Self {
                delay,
                ..Self::default()
            }
        }

        fn add(&self, entity: Entity, photo: Option<&[u8]>) {
            if let (Some(version), Some(bytes)) = (entity.profile_photo_version(), photo) {
                self.photos
                    .lock()
                    .unwrap()
                    .insert(version.to_string(), bytes.to_vec());
            }
            self.entities
                .lock()
                .unwrap()
                .insert(entity.key().unwrap(), entity);
        }

        fn fail_primary(&self, version: &str) {
            self.failing_primary.lock().unwrap().insert(version.to_string());
        }

        fn fail_all(&self, version: &str) {
            self.failing_all.lock().unwrap().insert(version.to_string());
        }

        fn lookups(&self) -> usize {
            self.lookups.load(Ordering::SeqCst)
        }

        fn downloads(&self) -> usize {
            self.primary_downloads.load(Ordering::SeqCst)
                + self.fallback_downloads.load(Ordering::SeqCst)
        }

        fn fetch(&self, entity: &Entity) -> Result<Downloaded> {
            let version = entity
                .profile_photo_version()
                .ok_or_else(|| AvatarError::DownloadFailed("no photo".to_string()))?;
            if self.failing_all.lock().unwrap().contains(version) {
                return Err(AvatarError::DownloadFailed("unavailable".to_string()));
            }
            let bytes = self
                .photos
                .lock()
                .unwrap()
                .get(version)
                .cloned()
                .ok_or_else(|| AvatarError::DownloadFailed("missing".to_string()))?;
            Ok(Downloaded::new(bytes, Some("image/jpeg")))
        }
    }

    #[async_trait]
    impl EntityResolver for FakePlatform {
        async fn resolve_entity(&self, space: Space, id: &str) -> Result<Entity> {
            self.lookups.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            self.entities
                .lock()
                .unwrap()
                .get(&EntityKey::new(space, id))
                .cloned()
                .ok_or_else(|| AvatarError::EntityLookupFailed(format!("unknown {}:{}", space, id)))
        }
    }

    #[async_trait]
    impl PhotoDownloader for FakePlatform {
        async fn download_profile_photo(&self, entity: &Entity) -> Result<Downloaded> {
            self.primary_downloads.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            if let Some(version) = entity.profile_photo_version() {
                if self.failing_primary.lock().unwrap().contains(version) {
                    return Err(AvatarError::DownloadFailed("FILE_REFERENCE_EXPIRED".to_string()));
                }
            }
            self.fetch(entity)
        }

        async fn download_media(&self, entity: &Entity) -> Result<Downloaded> {
            self.fallback_downloads.fetch_add(1, Ordering::SeqCst);
            self.fetch(entity)
        }
    }

    fn engine_with(platform: Arc<FakePlatform>, config: EngineConfig) -> AvatarEngine {
        AvatarEngine::new(platform.clone(), platform, config).unwrap()
    }

    fn engine(platform: Arc<FakePlatform>) -> AvatarEngine {
        engine_with(platform, EngineConfig::default())
    }

    fn user(id: &str, version: &str) -> Entity {
        Entity::User(UserEntity::new(id).with_photo(version))
    }

    fn chat(id: &str, version: &str) -> Entity {
        Entity::Chat(ChatEntity::new(id).with_photo(version))
    }

    #[tokio::test]
    async fn test_resolve_downloads_and_emits() {
        let platform = Arc::new(FakePlatform::default());
        platform.add(user("42", "v1"), Some(b"B"));
        let engine = engine(platform.clone());
        let mut events = engine.subscribe();

        let resolution = engine.resolve_one(&EntityKey::user("42"), None).await.unwrap();
        assert_eq!(resolution.source, ResolutionSource::Download);
        assert_eq!(resolution.event.bytes.as_ref(), b"B");
        assert_eq!(resolution.event.content_version.as_deref(), Some("v1"));

        let event = events.recv().await.unwrap();
        assert_eq!(event, resolution.event);

        let entry = engine.cache(Space::User).get("42").await.unwrap();
        assert_eq!(entry.version(), Some("v1"));
        assert!(entry.has_bytes());
        assert!(engine.byte_store().get("v1").await.is_some());
    }

    #[tokio::test]
    async fn test_concurrent_resolutions_download_once() {
        let platform = Arc::new(FakePlatform::with_delay(Duration::from_millis(30)));
        platform.add(user("7", "v7"), Some(b"photo"));
        let engine = engine(platform.clone());
        let key = EntityKey::user("7");

        let results = join_all((0..5).map(|_| engine.resolve_one(&key, None))).await;

        assert_eq!(results.iter().filter(|r| r.is_some()).count(), 1);
        assert_eq!(platform.lookups(), 1);
        assert_eq!(platform.downloads(), 1);
        assert_eq!(engine.stats().in_flight, 0);
    }

    #[tokio::test]
    async fn test_shared_version_downloads_once_across_spaces() {
        let platform = Arc::new(FakePlatform::default());
        platform.add(user("a", "shared"), Some(b"img"));
        platform.add(chat("b", "shared"), Some(b"img"));
        let engine = engine(platform.clone());

        let first = engine.resolve_one(&EntityKey::user("a"), None).await.unwrap();
        let second = engine.resolve_one(&EntityKey::chat("b"), None).await.unwrap();

        assert_eq!(first.source, ResolutionSource::Download);
        assert_eq!(second.source, ResolutionSource::CrossSpace);
        assert_eq!(second.event.bytes.as_ref(), b"img");
        assert_eq!(platform.downloads(), 1);
    }

    #[tokio::test]
    async fn test_shared_version_same_space_uses_byte_store() {
        let platform = Arc::new(FakePlatform::default());
        platform.add(chat("-1", "group-photo"), Some(b"g"));
        platform.add(chat("-2", "group-photo"), Some(b"g"));
        let engine = engine(platform.clone());

        engine.resolve_one(&EntityKey::chat("-1"), None).await.unwrap();
        let second = engine.resolve_one(&EntityKey::chat("-2"), None).await.unwrap();

        assert_eq!(second.source, ResolutionSource::ByteStore);
        assert_eq!(platform.downloads(), 1);
    }

    #[tokio::test]
    async fn test_cache_hit_with_expected_version_skips_network() {
        let platform = Arc::new(FakePlatform::default());
        let engine = engine(platform.clone());
        engine
            .cache(Space::User)
            .set_resolved("42", Some("v1".to_string()), Bytes::from_static(b"B"), "image/jpeg")
            .await;

        let resolution = engine
            .resolve_one(&EntityKey::user("42"), Some("v1"))
            .await
            .unwrap();

        assert_eq!(
            resolution.event,
            AvatarResolved {
                entity_id: "42".to_string(),
                space: Space::User,
                bytes: Bytes::from_static(b"B"),
                mime_type: "image/jpeg".to_string(),
                content_version: Some("v1".to_string()),
            }
        );
        assert_eq!(platform.lookups(), 0);
        assert_eq!(platform.downloads(), 0);
    }

    #[tokio::test]
    async fn test_cross_space_reuse_without_download() {
        let platform = Arc::new(FakePlatform::default());
        platform.add(chat("c1", "v7"), None);
        let engine = engine(platform.clone());
        engine
            .cache(Space::User)
            .set_resolved("u1", Some("v7".to_string()), Bytes::from_static(b"B"), "image/jpeg")
            .await;

        let resolution = engine.resolve_one(&EntityKey::chat("c1"), None).await.unwrap();

        assert_eq!(resolution.source, ResolutionSource::CrossSpace);
        assert_eq!(resolution.event.bytes.as_ref(), b"B");
        assert_eq!(platform.downloads(), 0);
        assert!(engine.cache(Space::Chat).get("c1").await.unwrap().has_bytes());
    }

    #[tokio::test]
    async fn test_no_avatar_sentinel_skips_lookups_until_expiry() {
        let platform = Arc::new(FakePlatform::default());
        platform.add(Entity::User(UserEntity::new("9")), None);
        let engine = engine_with(
            platform.clone(),
            EngineConfig {
                no_avatar_ttl: Duration::from_millis(60),
                ..EngineConfig::default()
            },
        );
        let key = EntityKey::user("9");

        assert!(engine.resolve_one(&key, None).await.is_none());
        assert_eq!(platform.lookups(), 1);

        for _ in 0..3 {
            assert!(engine.resolve_one(&key, None).await.is_none());
        }
        assert_eq!(platform.lookups(), 1);

        tokio::time::sleep(Duration::from_millis(120)).await;
        assert!(engine.resolve_one(&key, None).await.is_none());
        assert_eq!(platform.lookups(), 2);
        assert!(engine.resolve_one(&key, None).await.is_none());
        assert_eq!(platform.lookups(), 2);
    }

    #[tokio::test]
    async fn test_failed_download_with_version_is_retryable() {
        let platform = Arc::new(FakePlatform::default());
        platform.add(user("5", "v5"), Some(b"x"));
        platform.fail_all("v5");
        let engine = engine(platform.clone());
        let key = EntityKey::user("5");

        assert!(engine.resolve_one(&key, None).await.is_none());
        assert_eq!(engine.stats().failures, 1);

        platform.failing_all.lock().unwrap().clear();
        assert!(engine.resolve_one(&key, None).await.is_some());
        assert_eq!(platform.lookups(), 2);
    }

    #[tokio::test]
    async fn test_fallback_download_used_once() {
        let platform = Arc::new(FakePlatform::default());
        platform.add(user("3", "v3"), Some(b"fallback"));
        platform.fail_primary("v3");
        let engine = engine(platform.clone());

        let resolution = engine.resolve_one(&EntityKey::user("3"), None).await.unwrap();
        assert_eq!(resolution.event.bytes.as_ref(), b"fallback");
        assert_eq!(platform.primary_downloads.load(Ordering::SeqCst), 1);
        assert_eq!(platform.fallback_downloads.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_lookup_failure_is_not_fatal() {
        let platform = Arc::new(FakePlatform::default());
        let engine = engine(platform.clone());

        assert!(engine.resolve_one(&EntityKey::user("404"), None).await.is_none());
        assert_eq!(engine.stats().failures, 1);
        assert!(!engine.inner.no_avatar.contains(&EntityKey::user("404")).await);
    }

    #[tokio::test]
    async fn test_batch_failure_isolation() {
        let platform = Arc::new(FakePlatform::default());
        for i in 1..=5 {
            platform.add(chat(&i.to_string(), &format!("v{i}")), Some(b"ok"));
        }
        platform.fail_all("v3");
        let engine = engine_with(
            platform.clone(),
            EngineConfig {
                download_concurrency: 2,
                ..EngineConfig::default()
            },
        );

        let emitted = engine.resolve_many(Space::Chat, ["1", "2", "3", "4", "5"]).await;

        let mut ids: Vec<_> = emitted.iter().map(|e| e.entity_id.as_str()).collect();
        ids.sort();
        assert_eq!(ids, vec!["1", "2", "4", "5"]);
        assert_eq!(engine.stats().failures, 1);
    }

    #[tokio::test]
    async fn test_batch_skips_unchanged_versions() {
        let platform = Arc::new(FakePlatform::default());
        platform.add(chat("1", "v1"), Some(b"a"));
        platform.add(chat("2", "v2-new"), Some(b"b"));
        let engine = engine(platform.clone());
        engine
            .cache(Space::Chat)
            .set_resolved("1", Some("v1".to_string()), Bytes::from_static(b"a"), "image/jpeg")
            .await;
        engine
            .cache(Space::Chat)
            .set_resolved("2", Some("v2-old".to_string()), Bytes::from_static(b"old"), "image/jpeg")
            .await;

        let emitted = engine
            .resolve_many(Space::Chat, vec!["1".to_string(), "2".to_string()])
            .await;

        assert_eq!(emitted.len(), 1);
        assert_eq!(emitted[0].entity_id, "2");
        assert_eq!(emitted[0].bytes.as_ref(), b"b");
        assert_eq!(platform.downloads(), 1);
    }

    #[tokio::test]
    async fn test_resolve_entities_performs_no_lookups() {
        let platform = Arc::new(FakePlatform::default());
        let entities = vec![user("1", "p1"), chat("-5", "p2"), Entity::User(UserEntity::new("2"))];
        for entity in &entities {
            platform.add(entity.clone(), Some(b"img"));
        }
        let engine = engine(platform.clone());

        let emitted = engine.resolve_entities(entities).await;

        assert_eq!(emitted.len(), 2);
        assert_eq!(platform.lookups(), 0);
        assert!(engine.inner.no_avatar.contains(&EntityKey::user("2")).await);
    }

    #[tokio::test]
    async fn test_resolve_senders_dedupes_ids() {
        let platform = Arc::new(FakePlatform::with_delay(Duration::from_millis(5)));
        platform.add(user("10", "s10"), Some(b"a"));
        platform.add(user("11", "s11"), Some(b"b"));
        let engine = engine(platform.clone());

        let emitted = engine.resolve_senders(["10", "11", "010", "10", ""]).await;

        assert_eq!(emitted.len(), 2);
        assert_eq!(platform.lookups(), 2);
    }

    #[tokio::test]
    async fn test_prime_never_downgrades_resolved_entry() {
        let platform = Arc::new(FakePlatform::default());
        platform.add(user("1", "v1"), Some(b"B"));
        let engine = engine(platform.clone());
        let key = EntityKey::user("1");
        engine.resolve_one(&key, None).await.unwrap();
        let before = engine.cache(Space::User).get("1").await.unwrap();

        assert!(!engine.prime(&key, "v2").await);
        assert_eq!(engine.cache(Space::User).get("1").await.unwrap(), before);
    }

    #[tokio::test]
    async fn test_primed_entry_served_from_byte_store() {
        let platform = Arc::new(FakePlatform::default());
        platform.add(user("1", "v1"), Some(b"B"));
        platform.add(user("2", "v1"), Some(b"B"));
        let engine = engine(platform.clone());
        engine.resolve_one(&EntityKey::user("1"), None).await.unwrap();

        let key = EntityKey::user("2");
        assert!(engine.prime(&key, "v1").await);
        let resolution = engine.resolve_one(&key, Some("v1")).await.unwrap();

        assert_eq!(resolution.source, ResolutionSource::ByteStore);
        assert_eq!(platform.lookups(), 1);
        assert_eq!(platform.downloads(), 1);
    }

    #[tokio::test]
    async fn test_primed_entry_without_bytes_falls_through_to_lookup() {
        let platform = Arc::new(FakePlatform::default());
        platform.add(user("4", "v4"), Some(b"D"));
        let engine = engine(platform.clone());
        let key = EntityKey::user("4");

        engine.prime(&key, "v4").await;
        let resolution = engine.resolve_one(&key, Some("v4")).await.unwrap();

        assert_eq!(resolution.source, ResolutionSource::Download);
        assert_eq!(platform.lookups(), 1);
    }

    #[tokio::test]
    async fn test_handle_client_events() {
        let platform = Arc::new(FakePlatform::default());
        platform.add(user("8", "v8"), Some(b"E"));
        let engine = engine(platform.clone());
        let mut events = engine.subscribe();

        engine
            .handle(ClientEvent::Fetch(avatar_protocol::AvatarFetch {
                entity_id: " 008 ".to_string(),
                space: Space::User,
                expected_version: None,
            }))
            .await;
        let event = events.recv().await.unwrap();
        assert_eq!(event.entity_id, "8");

        engine
            .handle(ClientEvent::PrimeCache(avatar_protocol::AvatarPrimeCache {
                entity_id: "99".to_string(),
                space: Space::Chat,
                content_version: "pv".to_string(),
            }))
            .await;
        let primed = engine.cache(Space::Chat).get("99").await.unwrap();
        assert_eq!(primed.version(), Some("pv"));
        assert!(!primed.has_bytes());
    }

    #[tokio::test]
    async fn test_stale_identity_entry_refreshes_in_background() {
        let platform = Arc::new(FakePlatform::default());
        platform.add(user("6", "v6"), Some(b"new"));
        let engine = engine_with(
            platform.clone(),
            EngineConfig {
                identity_soft_ttl: Duration::from_millis(10),
                refresh_jitter: Duration::ZERO,
                ..EngineConfig::default()
            },
        );
        engine
            .cache(Space::User)
            .set_resolved("6", Some("v6".to_string()), Bytes::from_static(b"old"), "image/jpeg")
            .await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        let mut events = engine.subscribe();

        let served = engine.resolve_one(&EntityKey::user("6"), None).await.unwrap();
        assert_eq!(served.event.bytes.as_ref(), b"old");

        let refreshed = tokio::time::timeout(Duration::from_secs(1), async {
            loop {
                let event = events.recv().await.unwrap();
                if event.bytes.as_ref() == b"new" {
                    break event;
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(refreshed.content_version.as_deref(), Some("v6"));
        assert_eq!(platform.downloads(), 1);
    }

    fn stale_config() -> EngineConfig {
        EngineConfig {
            user_cache_capacity: 1,
            identity_soft_ttl: Duration::from_millis(10),
            refresh_jitter: Duration::from_secs(60),
            ..EngineConfig::default()
        }
    }

    #[tokio::test]
    async fn test_evicted_identity_entry_is_not_refreshed() {
        let platform = Arc::new(FakePlatform::default());
        platform.add(user("6", "v6"), Some(b"new"));
        let engine = engine_with(platform.clone(), stale_config());
        let users = engine.cache(Space::User);
        users
            .set_resolved("6", Some("v6".to_string()), Bytes::from_static(b"old"), "image/jpeg")
            .await;
        tokio::time::sleep(Duration::from_millis(20)).await;

        engine.resolve_one(&EntityKey::user("6"), None).await.unwrap();
        assert_eq!(engine.stats().pending_refreshes, 1);

        users
            .set_resolved("99", Some("v99".to_string()), Bytes::from_static(b"x"), "image/jpeg")
            .await;
        users.run_pending_tasks().await;
        assert_eq!(engine.stats().pending_refreshes, 0);

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(platform.downloads(), 0);
        assert!(users.get("6").await.is_none());
    }

    #[tokio::test]
    async fn test_refresh_dropped_after_invalidate_or_replace() {
        let platform = Arc::new(FakePlatform::default());
        platform.add(user("6", "v6"), Some(b"new"));
        let engine = engine(platform.clone());
        let users = engine.cache(Space::User);
        let stale = users
            .set_resolved("6", Some("v6".to_string()), Bytes::from_static(b"old"), "image/jpeg")
            .await;
        let previous = Some(Bytes::from_static(b"old"));
        tokio::time::sleep(Duration::from_millis(2)).await;

        users
            .set_resolved("6", Some("v6".to_string()), Bytes::from_static(b"mid"), "image/jpeg")
            .await;
        let replaced = engine
            .refresh_identity(
                EntityKey::user("6"),
                "v6".to_string(),
                user("6", "v6"),
                previous.clone(),
                stale.created_at,
            )
            .await;
        assert!(replaced.is_none());

        users.invalidate("6").await;
        let invalidated = engine
            .refresh_identity(
                EntityKey::user("6"),
                "v6".to_string(),
                user("6", "v6"),
                previous,
                stale.created_at,
            )
            .await;
        assert!(invalidated.is_none());
        assert!(users.get("6").await.is_none());
        assert_eq!(platform.downloads(), 0);
    }

    #[tokio::test]
    async fn test_refresh_from_newer_byte_store_bytes_reports_byte_store() {
        let platform = Arc::new(FakePlatform::default());
        platform.add(user("6", "v6"), Some(b"new"));
        let engine = engine(platform.clone());
        let stale = engine
            .cache(Space::User)
            .set_resolved("6", Some("v6".to_string()), Bytes::from_static(b"old"), "image/jpeg")
            .await;
        tokio::time::sleep(Duration::from_millis(5)).await;
        engine
            .byte_store()
            .put_if_absent("v6", Bytes::from_static(b"new"), "image/jpeg", Utc::now())
            .await;

        let refreshed = engine
            .refresh_identity(
                EntityKey::user("6"),
                "v6".to_string(),
                user("6", "v6"),
                Some(Bytes::from_static(b"old")),
                stale.created_at,
            )
            .await
            .unwrap();
        assert_eq!(refreshed.source, ResolutionSource::ByteStore);
        assert_eq!(refreshed.event.bytes.as_ref(), b"new");
        assert_eq!(platform.downloads(), 0);
    }

    #[tokio::test]
    async fn test_resolve_entities_canonicalises_ids() {
        let platform = Arc::new(FakePlatform::default());
        platform.add(user("42", "v42"), Some(b"img"));
        let engine = engine(platform.clone());

        let emitted = engine
            .resolve_entities(vec![user("0042", "v42"), user("0", "v0")])
            .await;
        assert_eq!(emitted.len(), 1);
        assert_eq!(emitted[0].entity_id, "42");
        assert!(engine.cache(Space::User).get("42").await.is_some());
        assert!(engine.cache(Space::User).get("0042").await.is_none());
        assert_eq!(platform.lookups(), 0);
    }

    #[tokio::test]
    async fn test_shutdown_closes_gate() {
        let platform = Arc::new(FakePlatform::default());
        platform.add(user("1", "v1"), Some(b"B"));
        let engine = engine(platform.clone());

        engine.shutdown();
        assert!(engine.resolve_one(&EntityKey::user("1"), None).await.is_none());
        assert_eq!(platform.downloads(), 0);
        assert!(engine.stats().gate.closed);
    }

    #[test]
    fn test_invalid_config_rejected() {
        let platform = Arc::new(FakePlatform::default());
        let result = AvatarEngine::new(
            platform.clone(),
            platform,
            EngineConfig {
                byte_store_capacity: 0,
                ..EngineConfig::default()
            },
        );
        assert!(matches!(result, Err(AvatarError::Config(_))));
    }

    #[test]
    fn test_oversized_ttl_rejected_before_caches_are_built() {
        let platform = Arc::new(FakePlatform::default());
        let huge = Duration::from_secs(40_000_000_000);
        let result = AvatarEngine::new(
            platform.clone(),
            platform,
            EngineConfig {
                identity_soft_ttl: huge,
                identity_ttl: huge,
                ..EngineConfig::default()
            },
        );
        assert!(matches!(result, Err(AvatarError::Config(_))));
    }
}
