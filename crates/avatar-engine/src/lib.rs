//! Avatar resolution and caching engine
//!
//! Given an entity id, produces avatar bytes while deduplicating concurrent
//! requests, reusing bytes by content version across the user and chat
//! spaces, serving stale entries while refreshing them in the background,
//! and bounding both memory and download concurrency.
//!
//! # Example
//!
//! ```ignore
//! use avatar_engine::{AvatarEngine, EngineConfig};
//! use avatar_protocol::EntityKey;
//!
//! let engine = AvatarEngine::new(resolver, downloader, EngineConfig::default())?;
//! let mut events = engine.subscribe();
//! engine.resolve_one(&EntityKey::user("42"), None).await;
//! let resolved = events.recv().await?;
//! ```

mod byte_store;
mod config;
mod engine;
mod entity;
mod error;
mod gate;
mod identity;
mod refresh;
mod resolver;
mod sentinel;
mod types;

pub use byte_store::{ByteStore, ByteStoreEntry, Ensured};
pub use config::{EngineConfig, MAX_TTL};
pub use engine::AvatarEngine;
pub use entity::{
    ChannelEntity, ChatEntity, ChatPhoto, Entity, ProfilePhotoSource, UserEntity, UserProfilePhoto,
};
pub use error::{AvatarError, Result};
pub use gate::{DownloadGate, GateStats};
pub use identity::{AvatarCacheEntry, AvatarPayload, IdentityCache};
pub use refresh::RefreshScheduler;
pub use resolver::{Downloaded, EntityResolver, PhotoDownloader, DEFAULT_MIME_TYPE};
pub use sentinel::NoAvatarCache;
pub use types::{EngineStats, Resolution, ResolutionSource};
