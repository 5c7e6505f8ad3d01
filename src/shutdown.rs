use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{watch, Notify};

/// Tracks live relay connections and broadcasts the shutdown signal.
#[derive(Clone)]
pub struct ShutdownCoordinator {
    active: Arc<AtomicUsize>,
    closed: Arc<Notify>,
    signal: Arc<watch::Sender<bool>>,
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

impl ShutdownCoordinator {
    pub fn new() -> Self {
        let (signal, _) = watch::channel(false);
        Self {
            active: Arc::new(AtomicUsize::new(0)),
            closed: Arc::new(Notify::new()),
            signal: Arc::new(signal),
        }
    }

    /// Register a connection. The count drops when the guard does.
    ///
    /// The receiver flips to `true` once [`shutdown`](Self::shutdown) runs;
    /// connections registered afterwards see `true` immediately.
    pub fn register(&self) -> (ConnectionGuard, watch::Receiver<bool>) {
        self.active.fetch_add(1, Ordering::AcqRel);
        let guard = ConnectionGuard {
            active: self.active.clone(),
            closed: self.closed.clone(),
        };
        (guard, self.signal.subscribe())
    }

    pub fn active_count(&self) -> usize {
        self.active.load(Ordering::Acquire)
    }

    pub fn is_shutting_down(&self) -> bool {
        *self.signal.borrow()
    }

    /// Signal every registered connection to close.
    pub fn shutdown(&self) {
        self.signal.send_replace(true);
    }

    /// Wait until every connection has dropped its guard, up to `timeout`.
    /// Returns `false` if connections were still open when time ran out.
    pub async fn wait_for_all_closed(&self, timeout: Duration) -> bool {
        let wait = async {
            loop {
                let notified = self.closed.notified();
                if self.active_count() == 0 {
                    return;
                }
                notified.await;
            }
        };
        tokio::time::timeout(timeout, wait).await.is_ok()
    }
}

/// Held by a relay connection for its whole lifetime.
pub struct ConnectionGuard {
    active: Arc<AtomicUsize>,
    closed: Arc<Notify>,
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        if self.active.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.closed.notify_waiters();
        }
    }
}
