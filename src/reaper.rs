use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::session::SessionRegistry;

/// Periodically reclaims sessions with no inbound traffic.
#[derive(Clone)]
pub struct Reaper {
    registry: SessionRegistry,
    idle_timeout: Duration,
    interval: Duration,
}

impl Reaper {
    pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(30 * 60);
    pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(60);

    pub fn new(registry: SessionRegistry, idle_timeout: Duration, interval: Duration) -> Self {
        Self {
            registry,
            idle_timeout,
            interval,
        }
    }

    /// Run one pass. Returns the number of sessions reclaimed.
    ///
    /// Candidates come from a snapshot; each is re-checked under the write
    /// lock, so a session that saw traffic since the snapshot survives.
    pub fn sweep_once(&self) -> usize {
        let candidates: Vec<String> = self
            .registry
            .snapshot()
            .into_iter()
            .filter(|s| s.activity.idle_for() > self.idle_timeout)
            .map(|s| s.id)
            .collect();

        let mut reclaimed = 0;
        for id in candidates {
            if self.registry.teardown_if_idle(&id, self.idle_timeout).is_some() {
                reclaimed += 1;
            }
        }
        if reclaimed > 0 {
            tracing::info!(reclaimed, remaining = self.registry.len(), "idle sweep finished");
        }
        reclaimed
    }

    /// Sweep every `interval` until `cancel` fires.
    pub fn spawn(self, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick completes immediately; nothing can be idle yet.
            ticker.tick().await;
            tracing::debug!(
                idle_timeout_secs = self.idle_timeout.as_secs(),
                interval_secs = self.interval.as_secs(),
                "idle sweep started"
            );
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        self.sweep_once();
                    }
                }
            }
            tracing::debug!("idle sweep stopped");
        })
    }
}
