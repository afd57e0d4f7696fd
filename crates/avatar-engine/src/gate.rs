//! Global download throttle

use std::future::Future;
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::Semaphore;

use crate::error::{AvatarError, Result};

/// Counting semaphore shared by every download path of one engine.
///
/// Cloning yields another handle to the same permits.
#[derive(Debug, Clone)]
pub struct DownloadGate {
    semaphore: Arc<Semaphore>,
    ceiling: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct GateStats {
    pub ceiling: usize,
    pub available: usize,
    pub in_use: usize,
    pub closed: bool,
}

impl DownloadGate {
    pub fn new(ceiling: usize) -> Self {
        let ceiling = ceiling.max(1);
        Self {
            semaphore: Arc::new(Semaphore::new(ceiling)),
            ceiling,
        }
    }

    pub fn ceiling(&self) -> usize {
        self.ceiling
    }

    /// Wait for a free slot, run `fut`, release the slot when it settles.
    ///
    /// The permit is dropped on every exit path, including panics and the
    /// caller dropping the returned future.
    pub async fn with_slot<F, T>(&self, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        let _permit = self
            .semaphore
            .acquire()
            .await
            .map_err(|_| AvatarError::GateClosed)?;
        fut.await
    }

    /// Fail queued and future acquisitions with `GateClosed`
    pub fn close(&self) {
        self.semaphore.close();
    }

    pub fn is_closed(&self) -> bool {
        self.semaphore.is_closed()
    }

    pub fn stats(&self) -> GateStats {
        let available = self.semaphore.available_permits();
        GateStats {
            ceiling: self.ceiling,
            available,
            in_use: self.ceiling.saturating_sub(available),
            closed: self.semaphore.is_closed(),
        }
    }
}
