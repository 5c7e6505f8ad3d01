//! JSON wire protocol spoken over the terminal WebSocket.
//!
//! One message per text frame, discriminated by a `type` field.

use serde::{Deserialize, Serialize};

/// Normal closure: explicit disconnect, or process exit already announced.
pub const CLOSE_NORMAL: u16 = 1000;
/// The server is shutting down.
pub const CLOSE_GOING_AWAY: u16 = 1001;
/// No close frame was received (transport failure).
pub const CLOSE_ABNORMAL: u16 = 1006;
/// The process could not be spawned.
pub const CLOSE_INTERNAL_ERROR: u16 = 1011;
/// The session registry is full.
pub const CLOSE_TRY_AGAIN_LATER: u16 = 1013;
/// Authentication required, failed, or terminal access denied.
pub const CLOSE_AUTH: u16 = 4001;
/// The session was reclaimed after sitting idle.
pub const CLOSE_IDLE_TIMEOUT: u16 = 4002;

/// Whether a client should automatically reconnect after a close with
/// this code. Deliberate closes (normal, credential rejection, idle
/// reclamation) are final.
pub fn is_reconnectable(code: u16) -> bool {
    !matches!(code, CLOSE_NORMAL | CLOSE_AUTH | CLOSE_IDLE_TIMEOUT)
}

/// Server → client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ServerMessage {
    Session {
        #[serde(rename = "sessionId")]
        session_id: String,
        pid: Option<u32>,
    },
    Output {
        data: String,
    },
    Exit {
        #[serde(rename = "exitCode")]
        exit_code: u32,
        signal: Option<String>,
    },
    Pong,
    Error {
        message: String,
    },
}

impl ServerMessage {
    pub fn to_json(&self) -> String {
        // Every variant serializes to a JSON object; failure is impossible.
        serde_json::to_string(self).unwrap_or_default()
    }
}

/// Client → server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ClientMessage {
    Input { data: String },
    Resize { cols: u16, rows: u16 },
    Ping,
}

impl ClientMessage {
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }
}

/// Incremental UTF-8 decoder for process output.
///
/// PTY reads land on arbitrary byte boundaries. A multi-byte character
/// split across two reads is held back until the rest arrives; bytes that
/// can never be valid become U+FFFD.
#[derive(Debug, Default)]
pub struct OutputDecoder {
    pending: Vec<u8>,
}

impl OutputDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decode the next chunk. May return an empty string when the whole
    /// chunk is an incomplete sequence.
    pub fn push(&mut self, chunk: &[u8]) -> String {
        self.pending.extend_from_slice(chunk);
        let mut out = String::with_capacity(self.pending.len());
        let mut rest: &[u8] = &self.pending;
        loop {
            match std::str::from_utf8(rest) {
                Ok(valid) => {
                    out.push_str(valid);
                    rest = &[];
                    break;
                }
                Err(e) => {
                    let (valid, after) = rest.split_at(e.valid_up_to());
                    // valid_up_to() guarantees this prefix is UTF-8.
                    out.push_str(std::str::from_utf8(valid).unwrap_or_default());
                    match e.error_len() {
                        Some(len) => {
                            out.push(char::REPLACEMENT_CHARACTER);
                            rest = &after[len..];
                        }
                        None => {
                            rest = after;
                            break;
                        }
                    }
                }
            }
        }
        let leftover = rest.to_vec();
        self.pending = leftover;
        out
    }

    /// Flush whatever is left at end of stream.
    pub fn finish(&mut self) -> String {
        let tail = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending.clear();
        tail
    }
}
