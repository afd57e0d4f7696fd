//! Engine tuning knobs

use std::time::Duration;

use avatar_protocol::Space;

use crate::error::{AvatarError, Result};

const DEFAULT_IDENTITY_CAPACITY: u64 = 120;
const DEFAULT_IDENTITY_SOFT_TTL_SECS: u64 = 10 * 60;
const DEFAULT_IDENTITY_TTL_SECS: u64 = 30 * 60;
const DEFAULT_BYTE_STORE_CAPACITY: u64 = 500;
const DEFAULT_BYTE_STORE_SOFT_TTL_SECS: u64 = 30 * 60;
const DEFAULT_BYTE_STORE_TTL_SECS: u64 = 2 * 60 * 60;
const DEFAULT_DOWNLOAD_CONCURRENCY: usize = 6;
const DEFAULT_REFRESH_JITTER_MS: u64 = 5_000;
const DEFAULT_NO_AVATAR_TTL_SECS: u64 = 10 * 60;
const DEFAULT_NO_AVATAR_CAPACITY: u64 = 2_000;
const DEFAULT_EVENT_BUFFER: usize = 256;

/// Longest TTL or jitter accepted by [`EngineConfig::validate`]
pub const MAX_TTL: Duration = Duration::from_secs(365 * 24 * 60 * 60);

/// Configuration for one [`AvatarEngine`](crate::AvatarEngine) instance
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub user_cache_capacity: u64,
    pub chat_cache_capacity: u64,
    /// Identity entries older than this are served but refreshed in the background
    pub identity_soft_ttl: Duration,
    /// Identity entries older than this are dropped
    pub identity_ttl: Duration,
    pub byte_store_capacity: u64,
    pub byte_store_soft_ttl: Duration,
    pub byte_store_ttl: Duration,
    /// Ceiling on concurrent downloads across every resolution path
    pub download_concurrency: usize,
    /// Background refreshes start after a random delay in `[0, refresh_jitter]`
    pub refresh_jitter: Duration,
    pub no_avatar_ttl: Duration,
    pub no_avatar_capacity: u64,
    /// Capacity of the resolved-event broadcast channel
    pub event_buffer: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            user_cache_capacity: DEFAULT_IDENTITY_CAPACITY,
            chat_cache_capacity: DEFAULT_IDENTITY_CAPACITY,
            identity_soft_ttl: Duration::from_secs(DEFAULT_IDENTITY_SOFT_TTL_SECS),
            identity_ttl: Duration::from_secs(DEFAULT_IDENTITY_TTL_SECS),
            byte_store_capacity: DEFAULT_BYTE_STORE_CAPACITY,
            byte_store_soft_ttl: Duration::from_secs(DEFAULT_BYTE_STORE_SOFT_TTL_SECS),
            byte_store_ttl: Duration::from_secs(DEFAULT_BYTE_STORE_TTL_SECS),
            download_concurrency: DEFAULT_DOWNLOAD_CONCURRENCY,
            refresh_jitter: Duration::from_millis(DEFAULT_REFRESH_JITTER_MS),
            no_avatar_ttl: Duration::from_secs(DEFAULT_NO_AVATAR_TTL_SECS),
            no_avatar_capacity: DEFAULT_NO_AVATAR_CAPACITY,
            event_buffer: DEFAULT_EVENT_BUFFER,
        }
    }
}

impl EngineConfig {
    pub fn cache_capacity(&self, space: Space) -> u64 {
        match space {
            Space::User => self.user_cache_capacity,
            Space::Chat => self.chat_cache_capacity,
        }
    }

    /// Reject settings that would make a cache useless, a TTL pair inverted
    /// or a duration longer than [`MAX_TTL`]
    pub fn validate(&self) -> Result<()> {
        if self.user_cache_capacity == 0 || self.chat_cache_capacity == 0 {
            return Err(AvatarError::Config(
                "identity cache capacity must be positive".to_string(),
            ));
        }
        if self.byte_store_capacity == 0 {
            return Err(AvatarError::Config(
                "byte store capacity must be positive".to_string(),
            ));
        }
        if self.no_avatar_capacity == 0 {
            return Err(AvatarError::Config(
                "no-avatar capacity must be positive".to_string(),
            ));
        }
        if self.download_concurrency == 0 {
            return Err(AvatarError::Config(
                "download concurrency must be at least 1".to_string(),
            ));
        }
        if self.event_buffer == 0 {
            return Err(AvatarError::Config(
                "event buffer must be positive".to_string(),
            ));
        }
        let durations = [
            ("identity soft TTL", self.identity_soft_ttl),
            ("identity TTL", self.identity_ttl),
            ("byte store soft TTL", self.byte_store_soft_ttl),
            ("byte store TTL", self.byte_store_ttl),
            ("no-avatar TTL", self.no_avatar_ttl),
            ("refresh jitter", self.refresh_jitter),
        ];
        for (name, value) in durations {
            if value > MAX_TTL {
                return Err(AvatarError::Config(format!(
                    "{} {:?} exceeds the maximum of {:?}",
                    name, value, MAX_TTL
                )));
            }
        }
        if self.identity_ttl < self.identity_soft_ttl {
            return Err(AvatarError::Config(format!(
                "identity TTL {:?} is shorter than its soft TTL {:?}",
                self.identity_ttl, self.identity_soft_ttl
            )));
        }
        if self.byte_store_ttl < self.byte_store_soft_ttl {
            return Err(AvatarError::Config(format!(
                "byte store TTL {:?} is shorter than its soft TTL {:?}",
                self.byte_store_ttl, self.byte_store_soft_ttl
            )));
        }
        Ok(())
    }
}
