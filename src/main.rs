//! ptyrelay - interactive shells over WebSocket
//!
//! **Server mode** (`ptyrelay serve`): accepts authenticated WebSocket
//! connections on `/ws/terminal` and pairs each one with a fresh shell
//! running behind a pseudo-terminal.
//!
//! **Client mode** (`ptyrelay connect`): attaches the local terminal to a
//! relay, reconnecting with backoff when the connection drops.

use std::io::Write;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use clap::{Parser as ClapParser, Subcommand};
use thiserror::Error;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use ptyrelay::{
    client::{self, BackoffPolicy, ClientConfig, ClientEvent, SessionController, StaticToken},
    config::{self, RelayConfig},
    protocol::{self, OutputDecoder},
    server::RelayServer,
    terminal,
};

/// ptyrelay - interactive shells over WebSocket
#[derive(ClapParser, Debug)]
#[command(name = "ptyrelay", version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Path to the TOML config file
    #[arg(long, global = true, env = "PTYRELAY_CONFIG")]
    config: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the relay server
    Serve {
        /// Address to bind the HTTP/WebSocket server
        #[arg(long, env = "PTYRELAY_BIND")]
        bind: Option<SocketAddr>,

        /// Shell to spawn for each session (overrides $SHELL)
        #[arg(long)]
        shell: Option<String>,

        /// Seconds without client traffic before a session is reclaimed
        #[arg(long, value_name = "SECS")]
        idle_timeout: Option<u64>,

        /// Seconds between idle sweeps
        #[arg(long, value_name = "SECS")]
        sweep_interval: Option<u64>,

        /// Maximum concurrent sessions (0 for unlimited)
        #[arg(long)]
        max_sessions: Option<usize>,
    },

    /// Attach the local terminal to a relay
    Connect {
        /// Relay endpoint, e.g. ws://127.0.0.1:3000/ws/terminal
        url: Option<String>,

        /// Identity token presented on every connect
        #[arg(long, env = "PTYRELAY_TOKEN", hide_env_values = true)]
        token: Option<String>,
    },
}

#[derive(Error, Debug)]
pub enum RelayError {
    #[error("config error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("terminal error: {0}")]
    Terminal(#[from] terminal::TerminalError),

    #[error("client error: {0}")]
    Client(#[from] client::ClientError),

    #[error("no relay URL given and none configured")]
    MissingUrl,

    #[error("gave up reconnecting")]
    ReconnectExhausted,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

#[tokio::main]
async fn main() -> Result<(), RelayError> {
    let cli = Cli::parse();
    init_tracing();

    let config_path = cli.config.or_else(config::default_path);
    let config = match config_path {
        Some(ref path) => RelayConfig::load(path)?.unwrap_or_default(),
        None => RelayConfig::default(),
    };

    match cli.command {
        Commands::Serve {
            bind,
            shell,
            idle_timeout,
            sweep_interval,
            max_sessions,
        } => {
            let mut config = config;
            if bind.is_some() {
                config.bind = bind;
            }
            if shell.is_some() {
                config.session.shell = shell;
            }
            if let Some(secs) = idle_timeout {
                config.session.idle_timeout_secs = secs;
            }
            if let Some(secs) = sweep_interval {
                config.session.sweep_interval_secs = secs.max(1);
            }
            if let Some(max) = max_sessions {
                config.session.max_sessions = max;
            }
            run_server(config).await
        }
        Commands::Connect { url, token } => {
            let url = url
                .or_else(|| config.client.url.clone())
                .ok_or(RelayError::MissingUrl)?;
            run_connect(url, token, &config).await
        }
    }
}

/// Logs go to stderr in both modes; in client mode stdout is the remote
/// terminal.
fn init_tracing() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "ptyrelay=info,tower_http=info".into()),
        ))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

// ── Server mode ────────────────────────────────────────────────────

async fn run_server(config: RelayConfig) -> Result<(), RelayError> {
    let bind = config.bind();
    tracing::info!(
        %bind,
        idle_timeout_secs = config.session.idle_timeout_secs,
        permissions = config.permissions.is_some(),
        "ptyrelay server starting"
    );

    let listener = tokio::net::TcpListener::bind(bind).await?;
    let server = RelayServer::from_config(&config);
    server
        .serve(listener, async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!(?e, "failed to listen for Ctrl+C");
                std::future::pending::<()>().await;
            }
            tracing::info!("received Ctrl+C");
        })
        .await?;

    tracing::info!("ptyrelay server exiting");
    Ok(())
}

// ── Client mode ────────────────────────────────────────────────────

async fn run_connect(url: String, token: Option<String>, config: &RelayConfig) -> Result<(), RelayError> {
    let client_config = ClientConfig {
        url,
        backoff: BackoffPolicy {
            base: Duration::from_millis(config.client.base_delay_ms),
            max_attempts: config.client.max_attempts,
        },
        heartbeat: Duration::from_secs(config.client.heartbeat_secs.max(1)),
    };
    let (controller, mut events) = SessionController::spawn(client_config, Arc::new(StaticToken(token)));
    controller.connect().await?;
    if let Ok((cols, rows)) = terminal::window_size() {
        controller.send_resize(cols, rows);
    }

    let raw_guard = terminal::RawModeGuard::new()?;

    // Channel for stdin data from the blocking reader
    let (stdin_tx, mut stdin_rx) = tokio::sync::mpsc::channel::<Bytes>(64);
    tokio::task::spawn_blocking(move || {
        use std::io::Read;
        let mut stdin = std::io::stdin();
        let mut buf = [0u8; 4096];
        loop {
            match stdin.read(&mut buf) {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    if stdin_tx.blocking_send(Bytes::copy_from_slice(&buf[..n])).is_err() {
                        break;
                    }
                }
            }
        }
    });

    let (winch_tx, mut winch_rx) = tokio::sync::mpsc::channel::<(u16, u16)>(4);
    tokio::spawn(async move {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigwinch = match signal(SignalKind::window_change()) {
            Ok(s) => s,
            Err(_) => return,
        };
        while sigwinch.recv().await.is_some() {
            if let Ok(size) = terminal::window_size() {
                if winch_tx.send(size).await.is_err() {
                    break;
                }
            }
        }
    });

    // Keystrokes may split a multi-byte character across reads.
    let mut keys = OutputDecoder::new();
    let mut exit_code = None;
    let mut result = Ok(());

    loop {
        tokio::select! {
            data = stdin_rx.recv() => match data {
                Some(data) => {
                    let text = keys.push(&data);
                    if !text.is_empty() {
                        controller.send_input(text);
                    }
                }
                None => break,
            },

            Some((cols, rows)) = winch_rx.recv() => controller.send_resize(cols, rows),

            event = events.recv() => match event {
                Some(ClientEvent::Output(data)) => {
                    let mut stdout = std::io::stdout().lock();
                    if stdout.write_all(data.as_bytes()).is_err() {
                        break;
                    }
                    let _ = stdout.flush();
                }
                Some(ClientEvent::Status(status)) => tracing::debug!(?status, "connection status"),
                Some(ClientEvent::Established { session_id, .. }) => {
                    notice(&format!("connected (session {session_id})"));
                }
                Some(ClientEvent::Exited { exit_code: code, signal }) => {
                    match signal {
                        Some(signal) => notice(&format!("shell exited with {code} ({signal})")),
                        None => notice(&format!("shell exited with {code}")),
                    }
                    exit_code = Some(code);
                    break;
                }
                Some(ClientEvent::ServerError(message)) => notice(&format!("relay error: {message}")),
                Some(ClientEvent::Disconnected { code, reason }) => {
                    notice(&format!("disconnected ({code} {reason})"));
                    if !protocol::is_reconnectable(code) {
                        break;
                    }
                }
                Some(ClientEvent::ReconnectScheduled { attempt, delay }) => {
                    notice(&format!("reconnecting in {:.1}s (attempt {attempt})", delay.as_secs_f64()));
                }
                Some(ClientEvent::ReconnectExhausted) => {
                    result = Err(RelayError::ReconnectExhausted);
                    break;
                }
                None => break,
            },
        }
    }

    controller.disconnect();
    controller.shutdown().await;
    drop(raw_guard);

    result?;
    if let Some(code) = exit_code.filter(|c| *c != 0) {
        std::process::exit(i32::try_from(code).unwrap_or(1));
    }
    Ok(())
}

/// Status line on stderr. Raw mode needs explicit carriage returns.
fn notice(message: &str) {
    let mut stderr = std::io::stderr().lock();
    let _ = write!(stderr, "\r\n[ptyrelay] {message}\r\n");
    let _ = stderr.flush();
}
