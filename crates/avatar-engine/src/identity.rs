//! Per-space identity caches

use std::sync::Arc;
use std::time::Duration;

use avatar_protocol::{EntityKey, Space};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use moka::future::Cache;
use moka::notification::RemovalCause;
use moka::ops::compute::{CompResult, Op};
use moka::policy::EvictionPolicy;

use crate::byte_store::to_chrono;
use crate::refresh::RefreshScheduler;

/// Bytes plus the mime type that describes them
#[derive(Debug, Clone, PartialEq)]
pub struct AvatarPayload {
    pub bytes: Bytes,
    pub mime_type: String,
}

/// What the engine knows about one entity's avatar.
///
/// `payload` absent with `content_version` present is a primed entry.
#[derive(Debug, Clone, PartialEq)]
pub struct AvatarCacheEntry {
    pub content_version: Option<String>,
    pub payload: Option<AvatarPayload>,
    pub created_at: DateTime<Utc>,
    pub soft_expires_at: DateTime<Utc>,
    pub hard_expires_at: DateTime<Utc>,
}

impl AvatarCacheEntry {
    pub fn resolved(
        content_version: Option<String>,
        bytes: Bytes,
        mime_type: impl Into<String>,
        soft_ttl: Duration,
        hard_ttl: Duration,
    ) -> Self {
        Self::stamped(
            content_version,
            Some(AvatarPayload {
                bytes,
                mime_type: mime_type.into(),
            }),
            soft_ttl,
            hard_ttl,
        )
    }

    pub fn primed(
        content_version: impl Into<String>,
        soft_ttl: Duration,
        hard_ttl: Duration,
    ) -> Self {
        Self::stamped(Some(content_version.into()), None, soft_ttl, hard_ttl)
    }

    fn stamped(
        content_version: Option<String>,
        payload: Option<AvatarPayload>,
        soft_ttl: Duration,
        hard_ttl: Duration,
    ) -> Self {
        let now = Utc::now();
        let soft_expires_at = now + to_chrono(soft_ttl);
        Self {
            content_version,
            payload,
            created_at: now,
            soft_expires_at,
            hard_expires_at: (now + to_chrono(hard_ttl)).max(soft_expires_at),
        }
    }

    pub fn has_bytes(&self) -> bool {
        self.payload.is_some()
    }

    pub fn version(&self) -> Option<&str> {
        self.content_version.as_deref()
    }

    pub fn is_stale(&self) -> bool {
        Utc::now() >= self.soft_expires_at
    }
}

/// Bounded LRU map from entity id to [`AvatarCacheEntry`] for one space.
///
/// Entries drop out at the hard TTL; staleness past the soft TTL is left to
/// the caller.
#[derive(Clone)]
pub struct IdentityCache {
    space: Space,
    cache: Cache<String, AvatarCacheEntry>,
    soft_ttl: Duration,
    ttl: Duration,
}

impl IdentityCache {
    /// Entries leaving the cache for any reason other than replacement
    /// cancel their pending refresh in `refresh`, keyed `space:id`.
    pub fn new(
        space: Space,
        capacity: u64,
        soft_ttl: Duration,
        ttl: Duration,
        refresh: RefreshScheduler,
    ) -> Self {
        let cache = Cache::builder()
            .name(space.as_str())
            .eviction_policy(EvictionPolicy::lru())
            .max_capacity(capacity)
            .time_to_live(ttl)
            .eviction_listener(move |id: Arc<String>, _entry, cause: RemovalCause| {
                if cause != RemovalCause::Replaced {
                    refresh.cancel(&EntityKey::new(space, id.as_str()).to_string());
                }
            })
            .build();

        Self {
            space,
            cache,
            soft_ttl,
            ttl,
        }
    }

    pub fn space(&self) -> Space {
        self.space
    }

    pub fn soft_ttl(&self) -> Duration {
        self.soft_ttl
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Lookup; counts as an access for LRU ordering
    pub async fn get(&self, id: &str) -> Option<AvatarCacheEntry> {
        self.cache.get(id).await
    }

    pub async fn set(&self, id: &str, entry: AvatarCacheEntry) {
        self.cache.insert(id.to_string(), entry).await;
    }

    /// Store a fully resolved entry stamped with this cache's TTLs
    pub async fn set_resolved(
        &self,
        id: &str,
        content_version: Option<String>,
        bytes: Bytes,
        mime_type: &str,
    ) -> AvatarCacheEntry {
        let entry =
            AvatarCacheEntry::resolved(content_version, bytes, mime_type, self.soft_ttl, self.ttl);
        self.set(id, entry.clone()).await;
        entry
    }

    /// Record a known content version without bytes.
    ///
    /// An entry that already holds bytes is left untouched. Returns whether
    /// the primed entry was written.
    pub async fn prime(&self, id: &str, content_version: &str) -> bool {
        let primed = AvatarCacheEntry::primed(content_version, self.soft_ttl, self.ttl);
        let result = self
            .cache
            .entry_by_ref(id)
            .and_compute_with(|existing| {
                let op = match existing {
                    Some(entry) if entry.value().has_bytes() => Op::Nop,
                    _ => Op::Put(primed),
                };
                std::future::ready(op)
            })
            .await;

        matches!(result, CompResult::Inserted(_) | CompResult::ReplacedWith(_))
    }

    /// Any entry in this space holding bytes for `version`
    pub fn find_by_version(&self, version: &str) -> Option<AvatarCacheEntry> {
        self.cache
            .iter()
            .map(|(_, entry)| entry)
            .find(|entry| entry.version() == Some(version) && entry.has_bytes())
    }

    pub async fn invalidate(&self, id: &str) {
        self.cache.invalidate(id).await;
    }

    pub fn entry_count(&self) -> u64 {
        self.cache.entry_count()
    }

    pub async fn run_pending_tasks(&self) {
        self.cache.run_pending_tasks().await;
    }
}
