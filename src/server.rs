//! Relay server lifecycle: sweep, HTTP/WS listener, and graceful shutdown.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::api::{self, AppState, RouterConfig};
use crate::authz::{AllowAll, Authorizer};
use crate::config::RelayConfig;
use crate::reaper::Reaper;
use crate::session::{SessionRegistry, TeardownReason};
use crate::shutdown::ShutdownCoordinator;

/// How long connections get to deliver their close frames on shutdown.
const CLOSE_GRACE: Duration = Duration::from_secs(2);

pub struct RelayServer {
    state: AppState,
    router_config: RouterConfig,
    reaper: Reaper,
}

impl RelayServer {
    pub fn new(state: AppState, router_config: RouterConfig, idle_timeout: Duration, sweep_interval: Duration) -> Self {
        let reaper = Reaper::new(state.sessions.clone(), idle_timeout, sweep_interval);
        Self {
            state,
            router_config,
            reaper,
        }
    }

    pub fn from_config(config: &RelayConfig) -> Self {
        let authorizer: Arc<dyn Authorizer> = match config.permissions {
            Some(ref policy) => Arc::new(policy.clone()),
            None => Arc::new(AllowAll),
        };
        let state = AppState {
            sessions: SessionRegistry::with_max_sessions(config.max_sessions()),
            shutdown: ShutdownCoordinator::new(),
            verifier: Arc::new(config.verifier()),
            authorizer,
            spawn: Arc::new(config.spawn_options()),
        };
        let router_config = RouterConfig {
            cors_origins: config.cors_origins.clone(),
        };
        Self::new(state, router_config, config.idle_timeout(), config.sweep_interval())
    }

    pub fn state(&self) -> &AppState {
        &self.state
    }

    /// Serve until `signal` resolves, then close every session with
    /// `ServerShutdown` and stop accepting connections.
    pub async fn serve<F>(self, listener: TcpListener, signal: F) -> std::io::Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let cancel = CancellationToken::new();
        let sweep = self.reaper.clone().spawn(cancel.clone());

        let app = api::router(self.state.clone(), self.router_config);
        if let Ok(addr) = listener.local_addr() {
            tracing::info!(%addr, "relay listening");
        }

        let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();
        let http = tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async {
                    stop_rx.await.ok();
                })
                .await
        });

        signal.await;
        tracing::info!("relay shutting down");

        // Signal WebSocket handlers, then tear down whatever is registered.
        self.state.shutdown.shutdown();
        let drained = self.state.sessions.drain(TeardownReason::ServerShutdown);
        if !self.state.shutdown.wait_for_all_closed(CLOSE_GRACE).await {
            tracing::warn!(
                open = self.state.shutdown.active_count(),
                "connections still open after shutdown grace"
            );
        }
        tracing::info!(drained, "sessions closed");

        cancel.cancel();
        let _ = stop_tx.send(());

        let served = match http.await {
            Ok(result) => result,
            Err(e) => Err(std::io::Error::other(e)),
        };
        if let Err(e) = sweep.await {
            tracing::warn!(?e, "idle sweep task panicked");
        }
        served
    }
}
