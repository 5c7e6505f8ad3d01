#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use futures::{SinkExt, StreamExt};
use ptyrelay::api::{token::ClaimsVerifier, AppState, RouterConfig};
use ptyrelay::authz::{AllowAll, Authorizer};
use ptyrelay::pty::SpawnOptions;
use ptyrelay::server::RelayServer;
use ptyrelay::session::SessionRegistry;
use ptyrelay::shutdown::ShutdownCoordinator;
use tokio::net::TcpListener;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

pub type WsStream = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

pub const RECV_TIMEOUT: Duration = Duration::from_secs(5);

/// A relay running on an ephemeral port.
pub struct TestRelay {
    pub addr: SocketAddr,
    pub state: AppState,
    stop: Option<tokio::sync::oneshot::Sender<()>>,
    task: Option<tokio::task::JoinHandle<std::io::Result<()>>>,
}

impl TestRelay {
    pub fn ws_url(&self) -> String {
        format!("ws://{}/ws/terminal", self.addr)
    }

    pub fn ws_url_with_token(&self, token: &str) -> String {
        format!("{}?token={}", self.ws_url(), token)
    }

    /// Trigger graceful shutdown and wait for the server to stop.
    pub async fn stop(mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        if let Some(task) = self.task.take() {
            tokio::time::timeout(Duration::from_secs(10), task)
                .await
                .expect("server did not stop")
                .expect("server task panicked")
                .expect("server returned an error");
        }
    }
}

pub struct RelayOptions {
    pub authorizer: Arc<dyn Authorizer>,
    pub idle_timeout: Duration,
    pub sweep_interval: Duration,
    pub max_sessions: Option<usize>,
    pub spawn: SpawnOptions,
}

impl Default for RelayOptions {
    fn default() -> Self {
        Self {
            authorizer: Arc::new(AllowAll),
            idle_timeout: Duration::from_secs(30 * 60),
            sweep_interval: Duration::from_secs(60),
            max_sessions: None,
            spawn: sh(),
        }
    }
}

/// `/bin/sh` at 80x24 with no working-directory change.
pub fn sh() -> SpawnOptions {
    SpawnOptions {
        program: "/bin/sh".to_string(),
        cwd: None,
        ..SpawnOptions::shell(None)
    }
}

pub async fn start_relay(options: RelayOptions) -> TestRelay {
    start_relay_at(SocketAddr::from(([127, 0, 0, 1], 0)), options).await
}

/// Start a relay on a fixed address, e.g. to bring one back where a
/// stopped relay was listening.
pub async fn start_relay_at(addr: SocketAddr, options: RelayOptions) -> TestRelay {
    let state = AppState {
        sessions: SessionRegistry::with_max_sessions(options.max_sessions),
        shutdown: ShutdownCoordinator::new(),
        verifier: Arc::new(ClaimsVerifier::new()),
        authorizer: options.authorizer,
        spawn: Arc::new(options.spawn),
    };
    let server = RelayServer::new(
        state.clone(),
        RouterConfig::default(),
        options.idle_timeout,
        options.sweep_interval,
    );
    let listener = TcpListener::bind(addr).await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();
    let task = tokio::spawn(server.serve(listener, async {
        stop_rx.await.ok();
    }));
    tokio::time::sleep(Duration::from_millis(50)).await;
    TestRelay {
        addr,
        state,
        stop: Some(stop_tx),
        task: Some(task),
    }
}

/// Unsigned JWT-shaped token for `email`, valid for an hour.
pub fn token_for(email: &str) -> String {
    let exp = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap()
        .as_secs()
        + 3600;
    let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"RS256","typ":"JWT"}"#);
    let payload = URL_SAFE_NO_PAD.encode(serde_json::json!({"email": email, "exp": exp}).to_string());
    format!("{header}.{payload}.c2lnbmF0dXJl")
}

pub async fn connect(url: &str) -> WsStream {
    let (ws, _) = connect_async(url).await.expect("failed to connect");
    ws
}

/// Connect with a valid token and consume the `session` message.
pub async fn connect_session(relay: &TestRelay, email: &str) -> (WsStream, serde_json::Value) {
    let mut ws = connect(&relay.ws_url_with_token(&token_for(email))).await;
    let hello = recv_json(&mut ws).await;
    assert_eq!(hello["type"], "session", "expected session message, got {hello}");
    (ws, hello)
}

pub async fn send_json(ws: &mut WsStream, value: serde_json::Value) {
    ws.send(Message::Text(value.to_string().into()))
        .await
        .expect("send failed");
}

/// Receive the next text message, parsed as JSON.
pub async fn recv_json(ws: &mut WsStream) -> serde_json::Value {
    loop {
        let msg = tokio::time::timeout(RECV_TIMEOUT, ws.next())
            .await
            .expect("timeout waiting for message")
            .expect("stream ended")
            .expect("ws error");
        match msg {
            Message::Text(text) => return serde_json::from_str(text.as_str()).expect("invalid JSON"),
            Message::Ping(_) | Message::Pong(_) => continue,
            other => panic!("expected text message, got {:?}", other),
        }
    }
}

/// Everything the server sends until it closes the connection.
pub struct Transcript {
    pub messages: Vec<serde_json::Value>,
    pub close: Option<(u16, String)>,
}

impl Transcript {
    pub fn output(&self) -> String {
        self.messages
            .iter()
            .filter(|m| m["type"] == "output")
            .filter_map(|m| m["data"].as_str())
            .collect()
    }
}

pub async fn read_until_close(ws: &mut WsStream) -> Transcript {
    let mut messages = Vec::new();
    let close = loop {
        let next = tokio::time::timeout(RECV_TIMEOUT, ws.next())
            .await
            .expect("timeout waiting for close");
        match next {
            Some(Ok(Message::Text(text))) => {
                messages.push(serde_json::from_str(text.as_str()).expect("invalid JSON"))
            }
            Some(Ok(Message::Close(frame))) => {
                break frame.map(|f| (u16::from(f.code), f.reason.as_str().to_string()));
            }
            Some(Ok(_)) => continue,
            Some(Err(_)) | None => break None,
        }
    };
    Transcript { messages, close }
}

/// Collect output until `needle` shows up.
pub async fn read_output_until(ws: &mut WsStream, needle: &str) -> String {
    let mut seen = String::new();
    while !seen.contains(needle) {
        let msg = recv_json(ws).await;
        if msg["type"] == "output" {
            seen.push_str(msg["data"].as_str().unwrap_or_default());
        }
    }
    seen
}

/// Poll `cond` until it holds or five seconds pass.
pub async fn eventually(cond: impl FnMut() -> bool) -> bool {
    eventually_within(RECV_TIMEOUT, cond).await
}

pub async fn eventually_within(limit: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + limit;
    while tokio::time::Instant::now() < deadline {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    cond()
}

/// Whether a process with this pid still exists.
pub fn process_alive(pid: u32) -> bool {
    let rc = unsafe { libc::kill(pid as i32, 0) };
    rc == 0
}
