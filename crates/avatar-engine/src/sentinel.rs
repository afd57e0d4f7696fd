use std::time::Duration;

use avatar_protocol::EntityKey;
use moka::future::Cache;

/// Entities confirmed to have no avatar, consulted before any lookup
#[derive(Clone)]
pub struct NoAvatarCache {
    cache: Cache<EntityKey, ()>,
}

impl NoAvatarCache {
    pub fn new(capacity: u64, ttl: Duration) -> Self {
        Self {
            cache: Cache::builder()
                .max_capacity(capacity)
                .time_to_live(ttl)
                .build(),
        }
    }

    pub async fn contains(&self, key: &EntityKey) -> bool {
        self.cache.get(key).await.is_some()
    }

    pub async fn mark(&self, key: EntityKey) {
        self.cache.insert(key, ()).await;
    }

    /// Forget the marker, e.g. when a client reports a content version for it
    pub async fn clear(&self, key: &EntityKey) {
        self.cache.invalidate(key).await;
    }

    pub fn entry_count(&self) -> u64 {
        self.cache.entry_count()
    }
}
