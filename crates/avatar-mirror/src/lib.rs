//! Presentation-tier avatar mirror
//!
//! Holds display-ready avatars per entity so the UI asks the backend only
//! when nothing valid is available locally. [`AvatarMirror::ensure`] is the
//! one entry point UI code calls; results arrive through
//! [`AvatarMirror::subscribe`].

mod backend;
mod bridge;
mod config;
mod error;
mod mirror;
mod store;
mod surface;
mod visibility;

pub use backend::{AvatarBackend, ChannelBackend};
pub use bridge::{BridgeConfig, WsBridge};
pub use config::{MirrorConfig, MAX_MIRROR_TTL};
pub use error::{MirrorError, Result};
pub use mirror::{AvatarMirror, MirrorEntry, MirrorStats};
pub use store::{FileAvatarStore, LocalAvatarStore, PersistedAvatar, StoreStats};
pub use surface::{sniff_mime, DisplayRef, DisplaySurface, MemorySurface};
pub use visibility::{find_scroll_root, is_visible, NodeLayout, Rect};
