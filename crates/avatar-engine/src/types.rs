use avatar_protocol::AvatarResolved;
use serde::{Deserialize, Serialize};

use crate::gate::GateStats;

/// Where the bytes of a resolution came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionSource {
    /// This space's identity cache already held the bytes
    IdentityCache,
    /// Copied from the other space's identity cache
    CrossSpace,
    /// Content-addressed store hit, no download
    ByteStore,
    /// Downloaded during this resolution
    Download,
}

impl ResolutionSource {
    pub fn is_cache_hit(self) -> bool {
        !matches!(self, ResolutionSource::Download)
    }
}

/// One emitted avatar plus how it was obtained
#[derive(Debug, Clone, PartialEq)]
pub struct Resolution {
    pub event: AvatarResolved,
    pub source: ResolutionSource,
}

/// Snapshot of engine state for health reporting
#[derive(Debug, Clone, Serialize)]
pub struct EngineStats {
    pub user_entries: u64,
    pub chat_entries: u64,
    pub byte_store_entries: u64,
    pub no_avatar_entries: u64,
    pub in_flight: usize,
    pub pending_refreshes: usize,
    pub gate: GateStats,
    pub lookups: u64,
    pub downloads: u64,
    pub cache_hits: u64,
    pub cross_space_hits: u64,
    pub emitted: u64,
    pub failures: u64,
}
