use std::time::Duration;

const DEFAULT_ENTRY_TTL_SECS: u64 = 7 * 24 * 60 * 60;
const DEFAULT_CAPACITY: usize = 2_000;
const DEFAULT_PENDING_FETCH_TIMEOUT_SECS: u64 = 30;
const DEFAULT_ROOT_MARGIN: f64 = 200.0;

/// Longer entry TTLs and pending-fetch timeouts are clamped to this
pub const MAX_MIRROR_TTL: Duration = Duration::from_secs(365 * 24 * 60 * 60);

/// Presentation-tier cache settings
#[derive(Debug, Clone)]
pub struct MirrorConfig {
    /// How long a mirror entry counts as valid after it was stored
    pub entry_ttl: Duration,
    pub capacity: usize,
    /// A sent fetch suppresses repeats for this long unless a result arrives
    pub pending_fetch_timeout: Duration,
    /// Pixels the scroll root is grown by before intersection testing
    pub root_margin: f64,
}

impl Default for MirrorConfig {
    fn default() -> Self {
        Self {
            entry_ttl: Duration::from_secs(DEFAULT_ENTRY_TTL_SECS),
            capacity: DEFAULT_CAPACITY,
            pending_fetch_timeout: Duration::from_secs(DEFAULT_PENDING_FETCH_TIMEOUT_SECS),
            root_margin: DEFAULT_ROOT_MARGIN,
        }
    }
}

impl MirrorConfig {
    /// Same settings with every duration clamped to [`MAX_MIRROR_TTL`]
    pub fn bounded(self) -> Self {
        Self {
            entry_ttl: self.entry_ttl.min(MAX_MIRROR_TTL),
            pending_fetch_timeout: self.pending_fetch_timeout.min(MAX_MIRROR_TTL),
            ..self
        }
    }
}
