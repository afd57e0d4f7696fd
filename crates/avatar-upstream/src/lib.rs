//! Gateway-backed entity resolver and photo downloader
//!
//! Implements the avatar engine's collaborator contracts over HTTP.
//! Lookup failures surface as `EntityLookupFailed`, download failures as
//! `DownloadFailed`.

pub mod client;
pub mod error;
pub mod types;

pub use client::GatewayClient;
pub use error::{Result, UpstreamError};
pub use types::PhotoSize;
