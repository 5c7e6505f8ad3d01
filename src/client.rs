//! Client side of the terminal relay.
//!
//! [`SessionController`] owns one logical terminal connection: it dials the
//! relay, queues input typed while offline, sends heartbeats, and
//! reconnects with exponential backoff after unexpected closes. All state
//! lives in a single actor task; the handle only sends it commands.

use std::collections::VecDeque;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use futures::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{Interval, Sleep};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::MaybeTlsStream;
use url::Url;

use crate::protocol::{is_reconnectable, ClientMessage, ServerMessage, CLOSE_ABNORMAL};

type WsStream = tokio_tungstenite::WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Disconnected,
    Connecting,
    Connected,
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ClientError {
    #[error("no identity token available")]
    NotAuthenticated,

    #[error("invalid relay URL: {0}")]
    InvalidUrl(String),

    #[error("session controller has stopped")]
    Stopped,
}

/// Supplies the identity token presented on every (re)connect.
pub trait TokenSource: Send + Sync {
    fn token(&self) -> Option<String>;
}

/// A fixed token, e.g. from the command line.
#[derive(Debug, Clone)]
pub struct StaticToken(pub Option<String>);

impl TokenSource for StaticToken {
    fn token(&self) -> Option<String> {
        self.0.clone()
    }
}

/// Delay before reconnect attempt `k` (zero-based) is `base * 2^k`; after
/// `max_attempts` consecutive failures the controller gives up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub max_attempts: u32,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(1),
            max_attempts: 5,
        }
    }
}

impl BackoffPolicy {
    pub fn delay(&self, attempt: u32) -> Duration {
        2u32.checked_pow(attempt)
            .and_then(|factor| self.base.checked_mul(factor))
            .unwrap_or(Duration::MAX)
    }
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Relay endpoint, e.g. `ws://127.0.0.1:3000/ws/terminal`.
    pub url: String,
    pub backoff: BackoffPolicy,
    /// Interval between application-level `ping` messages.
    pub heartbeat: Duration,
}

impl ClientConfig {
    pub const DEFAULT_HEARTBEAT: Duration = Duration::from_secs(30);

    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            backoff: BackoffPolicy::default(),
            heartbeat: Self::DEFAULT_HEARTBEAT,
        }
    }
}

/// What the controller reports to its consumer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientEvent {
    Status(ConnectionStatus),
    Established { session_id: String, pid: Option<u32> },
    Output(String),
    Exited { exit_code: u32, signal: Option<String> },
    ServerError(String),
    Disconnected { code: u16, reason: String },
    ReconnectScheduled { attempt: u32, delay: Duration },
    /// Every reconnect attempt failed; the controller stays disconnected.
    ReconnectExhausted,
}

enum Command {
    Connect(oneshot::Sender<Result<(), ClientError>>),
    Disconnect,
    Reconnect(oneshot::Sender<Result<(), ClientError>>),
    Input(String),
    Resize { cols: u16, rows: u16 },
    Shutdown,
}

/// Handle to the controller actor.
pub struct SessionController {
    commands: mpsc::UnboundedSender<Command>,
    status: watch::Receiver<ConnectionStatus>,
    task: JoinHandle<()>,
}

impl SessionController {
    /// Start the actor. It stays `disconnected` until [`connect`](Self::connect).
    pub fn spawn(
        config: ClientConfig,
        tokens: Arc<dyn TokenSource>,
    ) -> (Self, mpsc::UnboundedReceiver<ClientEvent>) {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (status_tx, status_rx) = watch::channel(ConnectionStatus::Disconnected);
        let actor = Actor {
            config,
            tokens,
            events: event_tx,
            status: status_tx,
            retries: 0,
            pending: VecDeque::new(),
            geometry: None,
            heartbeat: None,
            link: Link::Idle,
        };
        let task = tokio::spawn(actor.run(command_rx));
        let controller = Self {
            commands: command_tx,
            status: status_rx,
            task,
        };
        (controller, event_rx)
    }

    /// Start connecting. Fails without a state change if no token is
    /// available. A no-op while already connecting or connected.
    pub async fn connect(&self) -> Result<(), ClientError> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(Command::Connect(tx))
            .map_err(|_| ClientError::Stopped)?;
        rx.await.map_err(|_| ClientError::Stopped)?
    }

    /// Close the connection and suppress automatic reconnects.
    pub fn disconnect(&self) {
        let _ = self.commands.send(Command::Disconnect);
    }

    /// Disconnect, then connect afresh with the retry counter reset.
    pub async fn reconnect(&self) -> Result<(), ClientError> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(Command::Reconnect(tx))
            .map_err(|_| ClientError::Stopped)?;
        rx.await.map_err(|_| ClientError::Stopped)?
    }

    /// Send keystrokes. Queued while not connected and delivered in order
    /// once the session is established.
    pub fn send_input(&self, data: impl Into<String>) {
        let _ = self.commands.send(Command::Input(data.into()));
    }

    /// Report the terminal geometry. Only the latest value is kept while
    /// disconnected; it is re-sent on every new session.
    pub fn send_resize(&self, cols: u16, rows: u16) {
        let _ = self.commands.send(Command::Resize { cols, rows });
    }

    pub fn status(&self) -> ConnectionStatus {
        *self.status.borrow()
    }

    pub fn watch_status(&self) -> watch::Receiver<ConnectionStatus> {
        self.status.clone()
    }

    /// Close any connection and stop the actor.
    pub async fn shutdown(self) {
        let _ = self.commands.send(Command::Shutdown);
        if let Err(e) = self.task.await {
            tracing::error!(?e, "session controller task failed");
        }
    }
}

enum Link {
    Idle,
    Dialing(BoxFuture<'static, Result<WsStream, tokio_tungstenite::tungstenite::Error>>),
    Open(Box<WsStream>),
    /// Waiting out a backoff delay before the next attempt.
    Waiting(Pin<Box<Sleep>>),
}

enum LinkEvent {
    Dialed(Result<WsStream, tokio_tungstenite::tungstenite::Error>),
    Frame(Option<Result<Message, tokio_tungstenite::tungstenite::Error>>),
    TimerFired,
}

impl Link {
    /// Cancel-safe: every pending operation lives in `self`.
    async fn next_event(&mut self) -> LinkEvent {
        match self {
            Link::Idle => std::future::pending().await,
            Link::Dialing(dial) => LinkEvent::Dialed(dial.await),
            Link::Open(ws) => LinkEvent::Frame(ws.next().await),
            Link::Waiting(sleep) => {
                sleep.as_mut().await;
                LinkEvent::TimerFired
            }
        }
    }
}

struct Actor {
    config: ClientConfig,
    tokens: Arc<dyn TokenSource>,
    events: mpsc::UnboundedSender<ClientEvent>,
    status: watch::Sender<ConnectionStatus>,
    retries: u32,
    pending: VecDeque<String>,
    geometry: Option<(u16, u16)>,
    heartbeat: Option<Interval>,
    link: Link,
}

impl Actor {
    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<Command>) {
        loop {
            tokio::select! {
                cmd = commands.recv() => match cmd {
                    Some(Command::Shutdown) | None => {
                        self.drop_link("Client shutting down").await;
                        self.set_status(ConnectionStatus::Disconnected);
                        break;
                    }
                    Some(cmd) => self.on_command(cmd).await,
                },

                event = self.link.next_event() => self.on_link_event(event).await,

                _ = next_heartbeat(&mut self.heartbeat) => {
                    if !self.send(&ClientMessage::Ping).await {
                        tracing::debug!("heartbeat send failed");
                    }
                }
            }
        }
    }

    async fn on_command(&mut self, cmd: Command) {
        match cmd {
            Command::Connect(reply) => {
                let result = if self.status() == ConnectionStatus::Disconnected {
                    self.retries = 0;
                    self.dial()
                } else {
                    Ok(())
                };
                let _ = reply.send(result);
            }
            Command::Disconnect => self.disconnect().await,
            Command::Reconnect(reply) => {
                self.disconnect().await;
                self.retries = 0;
                let _ = reply.send(self.dial());
            }
            Command::Input(data) => {
                self.pending.push_back(data);
                if self.status() == ConnectionStatus::Connected {
                    self.flush_pending().await;
                }
            }
            Command::Resize { cols, rows } => {
                self.geometry = Some((cols, rows));
                if self.status() == ConnectionStatus::Connected {
                    self.send(&ClientMessage::Resize { cols, rows }).await;
                }
            }
            Command::Shutdown => {}
        }
    }

    async fn on_link_event(&mut self, event: LinkEvent) {
        match event {
            LinkEvent::Dialed(Ok(ws)) => {
                tracing::debug!(url = %self.config.url, "websocket open, awaiting session");
                self.link = Link::Open(Box::new(ws));
            }
            LinkEvent::Dialed(Err(e)) => {
                tracing::debug!(url = %self.config.url, error = %e, "connection failed");
                self.on_closed(CLOSE_ABNORMAL, e.to_string());
            }
            LinkEvent::Frame(Some(Ok(Message::Text(text)))) => {
                match serde_json::from_str::<ServerMessage>(text.as_str()) {
                    Ok(msg) => self.on_server_message(msg).await,
                    Err(e) => tracing::debug!(error = %e, "ignoring malformed server message"),
                }
            }
            LinkEvent::Frame(Some(Ok(Message::Close(frame)))) => {
                let (code, reason) = match frame {
                    Some(frame) => (u16::from(frame.code), frame.reason.as_str().to_string()),
                    None => (CLOSE_ABNORMAL, String::new()),
                };
                self.on_closed(code, reason);
            }
            LinkEvent::Frame(Some(Ok(_))) => {}
            LinkEvent::Frame(Some(Err(e))) => {
                self.on_closed(CLOSE_ABNORMAL, e.to_string());
            }
            LinkEvent::Frame(None) => {
                self.on_closed(CLOSE_ABNORMAL, "connection lost".to_string());
            }
            LinkEvent::TimerFired => {
                self.link = Link::Idle;
                if let Err(e) = self.dial() {
                    tracing::warn!(error = %e, "cannot reconnect");
                }
            }
        }
    }

    async fn on_server_message(&mut self, msg: ServerMessage) {
        match msg {
            ServerMessage::Session { session_id, pid } => {
                tracing::info!(session = %session_id, pid, "terminal session established");
                self.retries = 0;
                self.set_status(ConnectionStatus::Connected);
                self.emit(ClientEvent::Established { session_id, pid });
                let mut heartbeat = tokio::time::interval_at(
                    tokio::time::Instant::now() + self.config.heartbeat,
                    self.config.heartbeat,
                );
                heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                self.heartbeat = Some(heartbeat);
                self.flush_pending().await;
                if let Some((cols, rows)) = self.geometry {
                    self.send(&ClientMessage::Resize { cols, rows }).await;
                }
            }
            ServerMessage::Output { data } => self.emit(ClientEvent::Output(data)),
            ServerMessage::Exit { exit_code, signal } => {
                self.emit(ClientEvent::Exited { exit_code, signal })
            }
            ServerMessage::Error { message } => {
                tracing::warn!(%message, "relay reported an error");
                self.emit(ClientEvent::ServerError(message));
            }
            ServerMessage::Pong => tracing::trace!("pong"),
        }
    }

    /// The connection ended without us asking for it.
    fn on_closed(&mut self, code: u16, reason: String) {
        self.link = Link::Idle;
        self.heartbeat = None;
        self.set_status(ConnectionStatus::Disconnected);
        tracing::info!(code, %reason, "terminal connection closed");
        self.emit(ClientEvent::Disconnected { code, reason });

        if !is_reconnectable(code) {
            return;
        }
        let max = self.config.backoff.max_attempts;
        if self.retries >= max {
            tracing::warn!(attempts = max, "giving up on reconnecting");
            self.emit(ClientEvent::ReconnectExhausted);
            return;
        }
        let delay = self.config.backoff.delay(self.retries);
        self.retries += 1;
        tracing::debug!(attempt = self.retries, ?delay, "reconnect scheduled");
        self.emit(ClientEvent::ReconnectScheduled {
            attempt: self.retries,
            delay,
        });
        self.link = Link::Waiting(Box::pin(tokio::time::sleep(delay)));
    }

    fn dial(&mut self) -> Result<(), ClientError> {
        let token = self
            .tokens
            .token()
            .filter(|t| !t.is_empty())
            .ok_or(ClientError::NotAuthenticated)?;
        let url = connect_url(&self.config.url, &token)
            .map_err(|e| ClientError::InvalidUrl(e.to_string()))?;
        self.link = Link::Dialing(Box::pin(async move {
            tokio_tungstenite::connect_async(url).await.map(|(ws, _)| ws)
        }));
        self.set_status(ConnectionStatus::Connecting);
        Ok(())
    }

    async fn disconnect(&mut self) {
        self.retries = self.config.backoff.max_attempts;
        self.drop_link("User disconnected").await;
        self.set_status(ConnectionStatus::Disconnected);
    }

    async fn drop_link(&mut self, reason: &'static str) {
        self.heartbeat = None;
        if let Link::Open(mut ws) = std::mem::replace(&mut self.link, Link::Idle) {
            let frame = CloseFrame {
                code: CloseCode::Normal,
                reason: reason.into(),
            };
            if let Err(e) = (*ws).close(Some(frame)).await {
                tracing::debug!(error = %e, "error closing websocket");
            }
        }
    }

    /// Send queued input in order, stopping at the first failure. Whatever
    /// is left stays queued for the next session.
    async fn flush_pending(&mut self) {
        while let Some(data) = self.pending.front() {
            let msg = ClientMessage::Input { data: data.clone() };
            if !self.send(&msg).await {
                tracing::debug!(queued = self.pending.len(), "flush interrupted, keeping queue");
                break;
            }
            self.pending.pop_front();
        }
    }

    async fn send(&mut self, msg: &ClientMessage) -> bool {
        let Link::Open(ws) = &mut self.link else {
            return false;
        };
        ws.send(Message::Text(msg.to_json().into())).await.is_ok()
    }

    fn status(&self) -> ConnectionStatus {
        *self.status.borrow()
    }

    fn set_status(&mut self, status: ConnectionStatus) {
        if self.status() != status {
            self.status.send_replace(status);
            self.emit(ClientEvent::Status(status));
        }
    }

    fn emit(&self, event: ClientEvent) {
        let _ = self.events.send(event);
    }
}

async fn next_heartbeat(heartbeat: &mut Option<Interval>) {
    match heartbeat {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

/// Append the token as a `token` query parameter.
fn connect_url(base: &str, token: &str) -> Result<String, url::ParseError> {
    let mut url = Url::parse(base)?;
    url.query_pairs_mut().append_pair("token", token);
    Ok(url.into())
}
