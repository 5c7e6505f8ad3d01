//! Local terminal handling for `ptyrelay connect`.

use crossterm::terminal::{disable_raw_mode, enable_raw_mode, size};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum TerminalError {
    #[error("failed to enable raw mode: {0}")]
    EnableRawMode(#[source] std::io::Error),

    #[error("failed to query terminal size: {0}")]
    Size(#[source] std::io::Error),
}

/// RAII guard for terminal raw mode.
///
/// Keystrokes, Ctrl+C included, go to the remote shell instead of the local
/// line discipline. The previous mode is restored on drop, even on panic.
pub struct RawModeGuard {
    _private: (),
}

impl RawModeGuard {
    pub fn new() -> Result<Self, TerminalError> {
        enable_raw_mode().map_err(TerminalError::EnableRawMode)?;
        Ok(Self { _private: () })
    }
}

impl Drop for RawModeGuard {
    fn drop(&mut self) {
        let _ = disable_raw_mode();
    }
}

/// Current local geometry as `(cols, rows)`, the order `resize` messages use.
pub fn window_size() -> Result<(u16, u16), TerminalError> {
    size().map_err(TerminalError::Size)
}
