//! Jittered background refreshes, at most one per key

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::task::AbortHandle;
use tracing::debug;

#[derive(Debug, Default)]
struct SchedulerState {
    next_generation: u64,
    tasks: HashMap<String, (u64, AbortHandle)>,
}

/// Tracks scheduled refresh tasks by key so they can be deduplicated and
/// cancelled when the entry they refresh goes away.
#[derive(Debug, Clone, Default)]
pub struct RefreshScheduler {
    state: Arc<Mutex<SchedulerState>>,
}

/// Removes the task's entry when the task finishes or is aborted.
///
/// The generation check keeps a finished task from removing a newer task
/// scheduled under the same key after a cancel.
struct RefreshGuard {
    state: Arc<Mutex<SchedulerState>>,
    key: String,
    generation: u64,
}

impl Drop for RefreshGuard {
    fn drop(&mut self) {
        let mut state = lock(&self.state);
        if matches!(state.tasks.get(&self.key), Some((g, _)) if *g == self.generation) {
            state.tasks.remove(&self.key);
        }
    }
}

fn lock(state: &Mutex<SchedulerState>) -> MutexGuard<'_, SchedulerState> {
    state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl RefreshScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Spawn `fut` after a random delay in `[0, jitter]` unless a refresh for
    /// `key` is already pending. Returns whether a task was scheduled.
    ///
    /// Must be called from within a tokio runtime.
    pub fn schedule<F>(&self, key: &str, jitter: Duration, fut: F) -> bool
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let mut state = lock(&self.state);
        if state.tasks.contains_key(key) {
            return false;
        }

        state.next_generation += 1;
        let generation = state.next_generation;
        let delay = jitter_delay(jitter);

        let guard = RefreshGuard {
            state: self.state.clone(),
            key: key.to_string(),
            generation,
        };
        let handle = tokio::spawn(async move {
            let _guard = guard;
            tokio::time::sleep(delay).await;
            fut.await;
        });

        debug!(key, delay_ms = delay.as_millis() as u64, "Scheduled background refresh");
        state
            .tasks
            .insert(key.to_string(), (generation, handle.abort_handle()));
        true
    }

    /// Abort the pending refresh for `key`, if any
    pub fn cancel(&self, key: &str) -> bool {
        let removed = lock(&self.state).tasks.remove(key);
        match removed {
            Some((_, handle)) => {
                handle.abort();
                debug!(key, "Cancelled background refresh");
                true
            }
            None => false,
        }
    }

    pub fn cancel_all(&self) -> usize {
        let drained: Vec<_> = lock(&self.state).tasks.drain().collect();
        let count = drained.len();
        for (_, (_, handle)) in drained {
            handle.abort();
        }
        count
    }

    pub fn is_pending(&self, key: &str) -> bool {
        lock(&self.state).tasks.contains_key(key)
    }

    pub fn pending(&self) -> usize {
        lock(&self.state).tasks.len()
    }
}

fn jitter_delay(jitter: Duration) -> Duration {
    let max_ms = jitter.as_millis().min(u64::MAX as u128) as u64;
    if max_ms == 0 {
        Duration::ZERO
    } else {
        Duration::from_millis(fastrand::u64(0..=max_ms))
    }
}
