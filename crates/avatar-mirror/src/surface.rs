//! Display references handed to the UI

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use bytes::Bytes;
use image::ImageFormat;

use crate::error::{MirrorError, Result};

/// Locally resolvable handle to avatar bytes, e.g. an object URL
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DisplayRef(String);

impl DisplayRef {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DisplayRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Turns bytes into display references and releases them again.
///
/// Every reference returned by `create` is passed to `release` exactly once
/// by the mirror.
pub trait DisplaySurface: Send + Sync {
    fn create(&self, bytes: &Bytes, mime_type: &str) -> Result<DisplayRef>;
    fn release(&self, display_ref: &DisplayRef);
}

/// Detect the image format from the header bytes
pub fn sniff_mime(bytes: &[u8]) -> Result<&'static str> {
    image::guess_format(bytes)
        .map(|format: ImageFormat| format.to_mime_type())
        .map_err(|e| MirrorError::DecodeFailed(e.to_string()))
}

/// In-process surface holding bytes behind `avatar://N` references
#[derive(Debug, Default)]
pub struct MemorySurface {
    next_id: AtomicU64,
    live: Mutex<HashMap<DisplayRef, (Bytes, String)>>,
}

impl MemorySurface {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bytes and mime type behind a live reference
    pub fn resolve(&self, display_ref: &DisplayRef) -> Option<(Bytes, String)> {
        self.live
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .get(display_ref)
            .cloned()
    }

    pub fn live_count(&self) -> usize {
        self.live.lock().unwrap_or_else(|p| p.into_inner()).len()
    }
}

impl DisplaySurface for MemorySurface {
    fn create(&self, bytes: &Bytes, mime_type: &str) -> Result<DisplayRef> {
        let sniffed = sniff_mime(bytes)?;
        let mime_type = if mime_type.starts_with("image/") {
            mime_type
        } else {
            sniffed
        };

        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let display_ref = DisplayRef::new(format!("avatar://{}", id));
        self.live
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .insert(display_ref.clone(), (bytes.clone(), mime_type.to_string()));
        Ok(display_ref)
    }

    fn release(&self, display_ref: &DisplayRef) {
        self.live
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .remove(display_ref);
    }
}
