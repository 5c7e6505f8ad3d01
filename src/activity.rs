use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

/// Tracks the last inbound client message on a session.
///
/// The reclamation sweep compares [`idle_for`](Self::idle_for) against the
/// idle threshold. Uses the monotonic clock, so wall-clock changes never
/// make a session look idle.
#[derive(Clone, Debug)]
pub struct ActivityTracker {
    last: Arc<Mutex<Instant>>,
}

impl Default for ActivityTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl ActivityTracker {
    /// Create a new tracker seeded with the current instant.
    pub fn new() -> Self {
        Self {
            last: Arc::new(Mutex::new(Instant::now())),
        }
    }

    /// Record activity.
    pub fn touch(&self) {
        *self.last.lock() = Instant::now();
    }

    /// Time elapsed since the last activity.
    pub fn idle_for(&self) -> Duration {
        self.last.lock().elapsed()
    }

    /// Milliseconds since the last activity.
    pub fn idle_ms(&self) -> u64 {
        self.idle_for().as_millis() as u64
    }

    #[cfg(test)]
    pub(crate) fn backdate(&self, by: Duration) {
        let mut last = self.last.lock();
        if let Some(earlier) = last.checked_sub(by) {
            *last = earlier;
        }
    }
}
