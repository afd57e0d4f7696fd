//! Error types for the avatar engine

use std::fmt;

/// Failures inside one resolution round.
///
/// `Clone` so a single failed coalesced download can be handed to every
/// caller that was waiting on it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AvatarError {
    /// Resolving entity metadata failed (network, auth). Retryable on the
    /// next fetch.
    EntityLookupFailed(String),
    /// Both the primary and the fallback download paths failed.
    DownloadFailed(String),
    /// The download gate was closed by session teardown.
    GateClosed,
    Config(String),
}

impl fmt::Display for AvatarError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AvatarError::EntityLookupFailed(msg) => write!(f, "Entity lookup failed: {}", msg),
            AvatarError::DownloadFailed(msg) => write!(f, "Download failed: {}", msg),
            AvatarError::GateClosed => write!(f, "Download gate closed"),
            AvatarError::Config(msg) => write!(f, "Configuration error: {}", msg),
        }
    }
}

impl std::error::Error for AvatarError {}

pub type Result<T> = std::result::Result<T, AvatarError>;
