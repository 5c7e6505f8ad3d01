use std::ops::ControlFlow;
use std::time::Duration;

use axum::{
    extract::{
        ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    response::IntoResponse,
    Extension, Json,
};
use bytes::Bytes;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::json;
use tokio::sync::{mpsc, watch};

use super::auth::{self, AuthFailure};
use super::error::ApiError;
use super::token::Identity;
use super::AppState;
use crate::authz::TERMINAL_FEATURE;
use crate::protocol::{
    ClientMessage, OutputDecoder, ServerMessage, CLOSE_AUTH, CLOSE_GOING_AWAY,
    CLOSE_INTERNAL_ERROR, CLOSE_NORMAL, CLOSE_TRY_AGAIN_LATER,
};
use crate::pty::{ProcessHandle, ProcessIo};
use crate::session::{Session, SessionRegistry, TeardownReason};

/// After the process exits, how long to keep forwarding output that was
/// already produced before announcing the exit.
const EXIT_DRAIN_GRACE: Duration = Duration::from_millis(250);

/// Bound on sends made once the session is already torn down (exit
/// notice, close frames). A client that stopped reading gets dropped.
const FINAL_SEND_TIMEOUT: Duration = Duration::from_secs(1);

type WsSink = SplitSink<WebSocket, Message>;

pub(super) async fn health() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}

pub(super) async fn terminal_health(
    State(state): State<AppState>,
    Extension(identity): Extension<Identity>,
) -> Result<Json<serde_json::Value>, ApiError> {
    if !state.authorizer.authorize(&identity.user_id, TERMINAL_FEATURE) {
        return Err(ApiError::FeatureDenied(TERMINAL_FEATURE));
    }
    Ok(Json(json!({
        "status": "ok",
        "activeSessions": state.sessions.len(),
    })))
}

#[derive(Debug, Deserialize)]
pub(super) struct ConnectParams {
    token: Option<String>,
}

pub(super) async fn ws_terminal(
    ws: WebSocketUpgrade,
    Query(params): Query<ConnectParams>,
    State(state): State<AppState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_ws_terminal(socket, state, params.token))
}

async fn handle_ws_terminal(socket: WebSocket, state: AppState, token: Option<String>) {
    // Register this connection for graceful shutdown tracking
    let (_guard, mut shutdown_rx) = state.shutdown.register();
    let (mut ws_tx, ws_rx) = socket.split();

    if *shutdown_rx.borrow() {
        close(&mut ws_tx, CLOSE_GOING_AWAY, "Server shutting down").await;
        return;
    }

    let identity = match auth::authenticate(state.verifier.as_ref(), token.as_deref()) {
        Ok(identity) => identity,
        Err(failure) => {
            match &failure {
                AuthFailure::Missing => tracing::info!("terminal connection without token"),
                AuthFailure::Rejected(e) => tracing::info!(error = %e, "terminal token rejected"),
            }
            close(&mut ws_tx, CLOSE_AUTH, failure.close_reason()).await;
            return;
        }
    };

    if !state.authorizer.authorize(&identity.user_id, TERMINAL_FEATURE) {
        tracing::info!(user = %identity.user_id, "terminal access denied");
        close(&mut ws_tx, CLOSE_AUTH, "Terminal access denied").await;
        return;
    }

    let (process, io) = match ProcessHandle::spawn(&state.spawn) {
        Ok(spawned) => spawned,
        Err(e) => {
            tracing::error!(user = %identity.user_id, ?e, "failed to spawn terminal process");
            send(&mut ws_tx, &ServerMessage::Error {
                message: "Failed to start terminal".to_string(),
            })
            .await
            .ok();
            close(&mut ws_tx, CLOSE_INTERNAL_ERROR, "Terminal spawn failed").await;
            return;
        }
    };

    let candidate = Session::new(identity.user_id, process);
    let session = match state.sessions.insert(candidate.clone()) {
        Ok(session) => session,
        Err(e) => {
            tracing::warn!(user = %candidate.user, ?e, "rejecting terminal connection");
            if let Err(e) = candidate.process.kill() {
                tracing::warn!(pid = candidate.pid, ?e, "failed to kill rejected process");
            }
            send(&mut ws_tx, &ServerMessage::Error {
                message: e.to_string(),
            })
            .await
            .ok();
            close(&mut ws_tx, CLOSE_TRY_AGAIN_LATER, "Too many sessions").await;
            return;
        }
    };

    tracing::info!(session = %session.id, user = %session.user, pid = session.pid, "terminal session started");

    let hello = ServerMessage::Session {
        session_id: session.id.clone(),
        pid: session.pid,
    };
    if send(&mut ws_tx, &hello).await.is_err() {
        state.sessions.teardown(&session.id, TeardownReason::ConnectionClosed);
        return;
    }

    // Replies generated by inbound handling. Unbounded so a client that is
    // slow to read output never stalls its own input.
    let (control_tx, control_rx) = mpsc::unbounded_channel();
    let writer = tokio::spawn(relay_output(
        ws_tx,
        io,
        control_rx,
        session.clone(),
        state.sessions.clone(),
    ));

    relay_input(ws_rx, &session, &control_tx, &mut shutdown_rx, &state.sessions).await;

    // No-op if the process exit, the sweep or shutdown got there first.
    state.sessions.teardown(&session.id, TeardownReason::ConnectionClosed);
    drop(control_tx);
    if let Err(e) = writer.await {
        tracing::error!(session = %session.id, ?e, "output relay task failed");
    }
    tracing::debug!(session = %session.id, reason = ?session.teardown_reason(), "terminal connection finished");
}

/// Client → process. Returns when the client goes away, the session is
/// torn down elsewhere, or the server begins shutting down.
async fn relay_input(
    mut ws_rx: SplitStream<WebSocket>,
    session: &Session,
    control_tx: &mpsc::UnboundedSender<ServerMessage>,
    shutdown_rx: &mut watch::Receiver<bool>,
    registry: &SessionRegistry,
) {
    loop {
        tokio::select! {
            _ = session.cancelled.cancelled() => break,

            _ = shutdown_signalled(shutdown_rx) => {
                registry.teardown(&session.id, TeardownReason::ServerShutdown);
                break;
            }

            msg = ws_rx.next() => {
                let text = match msg {
                    Some(Ok(Message::Text(text))) => text.as_str().to_owned(),
                    Some(Ok(Message::Binary(data))) => match String::from_utf8(data.to_vec()) {
                        Ok(text) => text,
                        Err(_) => {
                            session.activity.touch();
                            tracing::debug!(session = %session.id, "ignoring non-UTF-8 binary frame");
                            continue;
                        }
                    },
                    Some(Ok(Message::Close(frame))) => {
                        tracing::debug!(session = %session.id, ?frame, "client closed connection");
                        break;
                    }
                    Some(Ok(_)) => {
                        // Ping/Pong handled automatically
                        session.activity.touch();
                        continue;
                    }
                    Some(Err(e)) => {
                        tracing::debug!(session = %session.id, ?e, "websocket receive error");
                        break;
                    }
                    None => break,
                };

                session.activity.touch();
                handle_client_message(&text, session, control_tx).await;
            }
        }
    }
}

async fn handle_client_message(
    text: &str,
    session: &Session,
    control_tx: &mpsc::UnboundedSender<ServerMessage>,
) {
    let msg = match serde_json::from_str::<ClientMessage>(text) {
        Ok(msg) => msg,
        Err(e) => {
            tracing::debug!(session = %session.id, error = %e, "ignoring malformed client message");
            return;
        }
    };

    match msg {
        ClientMessage::Input { data } => {
            if let Err(e) = session.process.write(Bytes::from(data)).await {
                tracing::debug!(session = %session.id, ?e, "dropping input for finished process");
            }
        }
        ClientMessage::Resize { cols, rows } => {
            if cols == 0 || rows == 0 {
                tracing::debug!(session = %session.id, cols, rows, "ignoring resize with zero dimension");
                return;
            }
            if let Err(e) = session.process.resize(cols, rows) {
                tracing::warn!(session = %session.id, ?e, "failed to resize terminal");
            }
        }
        ClientMessage::Ping => {
            let _ = control_tx.send(ServerMessage::Pong);
        }
    }
}

/// Process → client. Owns the socket sink for the whole session.
async fn relay_output(
    mut ws_tx: WsSink,
    io: ProcessIo,
    mut control_rx: mpsc::UnboundedReceiver<ServerMessage>,
    session: Session,
    registry: SessionRegistry,
) {
    let ProcessIo {
        mut output,
        mut exit,
    } = io;
    let mut decoder = OutputDecoder::new();
    let mut output_done = false;

    let exit_info = loop {
        tokio::select! {
            biased;

            _ = session.cancelled.cancelled() => {
                send_teardown_close(&mut ws_tx, &session).await;
                return;
            }

            Some(msg) = control_rx.recv() => {
                if forward(&mut ws_tx, &session, &msg).await.is_break() {
                    return;
                }
            }

            chunk = output.recv(), if !output_done => match chunk {
                Some(bytes) => {
                    if forward_output(&mut ws_tx, &session, &mut decoder, &bytes).await.is_break() {
                        return;
                    }
                }
                None => output_done = true,
            },

            result = &mut exit => match result {
                Ok(info) => break info,
                Err(_) => {
                    tracing::error!(session = %session.id, "exit monitor dropped without reporting");
                    return;
                }
            },
        }
    };

    // Forward whatever the process wrote before it exited.
    if !output_done {
        let deadline = tokio::time::Instant::now() + EXIT_DRAIN_GRACE;
        while let Ok(Some(bytes)) = tokio::time::timeout_at(deadline, output.recv()).await {
            if forward_output(&mut ws_tx, &session, &mut decoder, &bytes).await.is_break() {
                return;
            }
        }
    }
    let tail = decoder.finish();
    if !tail.is_empty()
        && forward(&mut ws_tx, &session, &ServerMessage::Output { data: tail })
            .await
            .is_break()
    {
        return;
    }

    if registry.teardown(&session.id, TeardownReason::ProcessExited).is_none() {
        // Someone else tore the session down while we drained.
        send_teardown_close(&mut ws_tx, &session).await;
        return;
    }

    tracing::info!(
        session = %session.id,
        exit_code = exit_info.exit_code,
        signal = ?exit_info.signal,
        "terminal exited"
    );
    let exit = ServerMessage::Exit {
        exit_code: exit_info.exit_code,
        signal: exit_info.signal,
    };
    match tokio::time::timeout(FINAL_SEND_TIMEOUT, send(&mut ws_tx, &exit)).await {
        Ok(Ok(())) => close(&mut ws_tx, CLOSE_NORMAL, "Terminal exited").await,
        Ok(Err(e)) => tracing::debug!(session = %session.id, ?e, "failed to send exit notice"),
        Err(_) => tracing::debug!(session = %session.id, "client not reading, dropping exit notice"),
    }
}

/// Send one message unless the session is torn down first. A send can
/// block indefinitely on a client that stopped reading, so it must not
/// outlive the session.
async fn forward(ws_tx: &mut WsSink, session: &Session, msg: &ServerMessage) -> ControlFlow<()> {
    tokio::select! {
        biased;

        _ = session.cancelled.cancelled() => {
            send_teardown_close(ws_tx, session).await;
            ControlFlow::Break(())
        }

        result = send(ws_tx, msg) => match result {
            Ok(()) => ControlFlow::Continue(()),
            Err(e) => {
                tracing::debug!(session = %session.id, ?e, "websocket send failed");
                ControlFlow::Break(())
            }
        },
    }
}

async fn forward_output(
    ws_tx: &mut WsSink,
    session: &Session,
    decoder: &mut OutputDecoder,
    bytes: &[u8],
) -> ControlFlow<()> {
    let data = decoder.push(bytes);
    if data.is_empty() {
        return ControlFlow::Continue(());
    }
    forward(ws_tx, session, &ServerMessage::Output { data }).await
}

async fn send_teardown_close(ws_tx: &mut WsSink, session: &Session) {
    if let Some((code, reason)) = session.teardown_reason().and_then(TeardownReason::close_frame) {
        close(ws_tx, code, reason).await;
    }
}

async fn send(ws_tx: &mut WsSink, msg: &ServerMessage) -> Result<(), axum::Error> {
    ws_tx.send(Message::Text(msg.to_json().into())).await
}

async fn close(ws_tx: &mut WsSink, code: u16, reason: &'static str) {
    let close_frame = CloseFrame {
        code,
        reason: reason.into(),
    };
    let closing = async {
        let _ = ws_tx.send(Message::Close(Some(close_frame))).await;
        let _ = ws_tx.flush().await;
    };
    if tokio::time::timeout(FINAL_SEND_TIMEOUT, closing).await.is_err() {
        tracing::debug!(code, "client not reading, dropping connection without close frame");
    }
}

/// Resolves once the shutdown flag is set. Never resolves if the
/// coordinator is gone.
async fn shutdown_signalled(rx: &mut watch::Receiver<bool>) {
    if rx.wait_for(|shutting_down| *shutting_down).await.is_err() {
        std::future::pending::<()>().await;
    }
}
