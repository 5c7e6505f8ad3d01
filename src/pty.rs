use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use portable_pty::{native_pty_system, ChildKiller, CommandBuilder, MasterPty, PtySize};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

/// Output chunks buffered between the PTY reader thread and the relay.
///
/// The reader uses `blocking_send`, so a slow client stalls the child
/// through the kernel PTY buffer instead of dropping output.
const OUTPUT_CHANNEL_CAPACITY: usize = 256;

const INPUT_CHANNEL_CAPACITY: usize = 64;

/// How long a killed child gets to exit on SIGHUP before SIGKILL.
pub const KILL_GRACE: Duration = Duration::from_secs(3);

#[derive(Error, Debug)]
pub enum PtyError {
    #[error("failed to open pty: {0}")]
    OpenPty(#[source] anyhow::Error),

    #[error("failed to spawn command: {0}")]
    SpawnCommand(#[source] anyhow::Error),

    #[error("failed to clone reader: {0}")]
    CloneReader(#[source] anyhow::Error),

    #[error("failed to take writer: {0}")]
    TakeWriter(#[source] anyhow::Error),

    #[error("failed to resize pty: {0}")]
    Resize(#[source] anyhow::Error),

    #[error("invalid terminal geometry {cols}x{rows}")]
    InvalidGeometry { cols: u16, rows: u16 },

    #[error("process input is closed")]
    InputClosed,

    #[error("failed to kill process: {0}")]
    Kill(#[from] std::io::Error),
}

/// How to launch the interactive process.
#[derive(Debug, Clone)]
pub struct SpawnOptions {
    pub program: String,
    pub args: Vec<String>,
    pub cols: u16,
    pub rows: u16,
    pub cwd: Option<PathBuf>,
    /// Added on top of the inherited environment.
    pub env: Vec<(String, String)>,
}

impl SpawnOptions {
    pub const DEFAULT_COLS: u16 = 80;
    pub const DEFAULT_ROWS: u16 = 24;

    /// Login-shell defaults: `$SHELL` (or `/bin/sh`), 80x24, the user's home
    /// directory, and terminal-capability variables.
    pub fn shell(program: Option<String>) -> Self {
        let program = program
            .unwrap_or_else(|| std::env::var("SHELL").unwrap_or_else(|_| "/bin/sh".to_string()));
        Self {
            program,
            args: Vec::new(),
            cols: Self::DEFAULT_COLS,
            rows: Self::DEFAULT_ROWS,
            cwd: dirs::home_dir(),
            env: vec![
                ("TERM".to_string(), "xterm-256color".to_string()),
                ("COLORTERM".to_string(), "truecolor".to_string()),
            ],
        }
    }

    fn command(&self) -> CommandBuilder {
        let mut cmd = CommandBuilder::new(&self.program);
        cmd.args(&self.args);
        if let Some(ref dir) = self.cwd {
            cmd.cwd(dir);
        }
        for (key, value) in &self.env {
            cmd.env(key, value);
        }
        cmd
    }
}

/// How the process ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExitInfo {
    pub exit_code: u32,
    pub signal: Option<String>,
}

/// Streams produced by a spawned process. Owned by whoever relays output.
pub struct ProcessIo {
    pub output: mpsc::Receiver<Bytes>,
    /// Resolves exactly once, when the child exits.
    pub exit: oneshot::Receiver<ExitInfo>,
}

/// One interactive process running behind a pseudo-terminal.
///
/// The handle is terminal once the child exits; it is never respawned.
pub struct ProcessHandle {
    pid: Option<u32>,
    master: Mutex<Box<dyn MasterPty + Send>>,
    input_tx: mpsc::Sender<Bytes>,
    killer: Mutex<Box<dyn ChildKiller + Send + Sync>>,
    size: Mutex<(u16, u16)>,
    /// Set once the child is reaped. Signals are only sent while holding
    /// this lock with the flag unset, so the pid cannot have been recycled.
    exited: Arc<Mutex<bool>>,
    killed: AtomicBool,
}

impl std::fmt::Debug for ProcessHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessHandle")
            .field("pid", &self.pid)
            .field("size", &*self.size.lock())
            .field("exited", &self.has_exited())
            .finish_non_exhaustive()
    }
}

impl ProcessHandle {
    /// Spawn the process and its I/O pumps.
    ///
    /// Must be called from within a tokio runtime: the reader, writer and
    /// exit monitor run on the blocking thread pool.
    pub fn spawn(options: &SpawnOptions) -> Result<(Self, ProcessIo), PtyError> {
        if options.cols == 0 || options.rows == 0 {
            return Err(PtyError::InvalidGeometry {
                cols: options.cols,
                rows: options.rows,
            });
        }

        let pair = native_pty_system()
            .openpty(pty_size(options.cols, options.rows))
            .map_err(PtyError::OpenPty)?;

        let mut child = pair
            .slave
            .spawn_command(options.command())
            .map_err(PtyError::SpawnCommand)?;
        // The master must be the only end we hold, otherwise the reader
        // never sees EOF after the child exits.
        drop(pair.slave);

        let pid = child.process_id();
        let killer = child.clone_killer();
        let reader = pair.master.try_clone_reader().map_err(PtyError::CloneReader)?;
        let writer = pair.master.take_writer().map_err(PtyError::TakeWriter)?;

        let exited = Arc::new(Mutex::new(false));
        let (exit_tx, exit_rx) = oneshot::channel();
        {
            let exited = exited.clone();
            tokio::task::spawn_blocking(move || {
                // Leave the child a zombie until the flag is set under the
                // lock, so kill() never races the reap.
                let status = match pid {
                    Some(pid) if wait_without_reaping(pid) => {
                        let mut exited = exited.lock();
                        let status = child.wait();
                        *exited = true;
                        status
                    }
                    _ => {
                        let status = child.wait();
                        *exited.lock() = true;
                        status
                    }
                };
                let info = match status {
                    Ok(status) => ExitInfo {
                        exit_code: status.exit_code(),
                        signal: status.signal().map(str::to_string),
                    },
                    Err(e) => {
                        tracing::error!(?e, pid, "error waiting for child");
                        ExitInfo {
                            exit_code: 1,
                            signal: None,
                        }
                    }
                };
                tracing::debug!(pid, ?info, "child exited");
                let _ = exit_tx.send(info);
            });
        }

        let (output_tx, output_rx) = mpsc::channel::<Bytes>(OUTPUT_CHANNEL_CAPACITY);
        tokio::task::spawn_blocking(move || {
            let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                use std::io::Read;
                let mut reader = reader;
                let mut buf = [0u8; 4096];
                loop {
                    match reader.read(&mut buf) {
                        Ok(0) => break,
                        Ok(n) => {
                            let data = Bytes::copy_from_slice(&buf[..n]);
                            if output_tx.blocking_send(data).is_err() {
                                break;
                            }
                        }
                        Err(_) => break,
                    }
                }
            }));
            if let Err(e) = result {
                tracing::error!("PTY reader task panicked: {:?}", e);
            }
        });

        let (input_tx, input_rx) = mpsc::channel::<Bytes>(INPUT_CHANNEL_CAPACITY);
        tokio::task::spawn_blocking(move || {
            let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                use std::io::Write;
                let mut writer = writer;
                let mut rx = input_rx;
                while let Some(data) = rx.blocking_recv() {
                    if writer.write_all(&data).is_err() {
                        break;
                    }
                    let _ = writer.flush();
                }
            }));
            if let Err(e) = result {
                tracing::error!("PTY writer task panicked: {:?}", e);
            }
        });

        let handle = Self {
            pid,
            master: Mutex::new(pair.master),
            input_tx,
            killer: Mutex::new(killer),
            size: Mutex::new((options.cols, options.rows)),
            exited,
            killed: AtomicBool::new(false),
        };
        let io = ProcessIo {
            output: output_rx,
            exit: exit_rx,
        };
        Ok((handle, io))
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn has_exited(&self) -> bool {
        *self.exited.lock()
    }

    /// Current geometry as `(cols, rows)`.
    pub fn size(&self) -> (u16, u16) {
        *self.size.lock()
    }

    /// Queue bytes for the process. Writes reach the PTY in call order.
    pub async fn write(&self, data: Bytes) -> Result<(), PtyError> {
        self.input_tx
            .send(data)
            .await
            .map_err(|_| PtyError::InputClosed)
    }

    pub fn resize(&self, cols: u16, rows: u16) -> Result<(), PtyError> {
        if cols == 0 || rows == 0 {
            return Err(PtyError::InvalidGeometry { cols, rows });
        }
        self.master
            .lock()
            .resize(pty_size(cols, rows))
            .map_err(PtyError::Resize)?;
        *self.size.lock() = (cols, rows);
        Ok(())
    }

    /// Terminate the process. Safe to call any number of times, and a no-op
    /// once the child has exited.
    ///
    /// Sends SIGHUP, then SIGKILL to the process group if the child is still
    /// around after [`KILL_GRACE`].
    pub fn kill(&self) -> Result<(), PtyError> {
        let exited = self.exited.lock();
        if *exited {
            tracing::debug!(pid = self.pid, "child already exited, skipping kill");
            return Ok(());
        }
        if self.killed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        match self.killer.lock().kill() {
            Ok(()) => {}
            Err(e) if already_gone(&e) => {}
            Err(e) => return Err(e.into()),
        }
        self.escalate();
        drop(exited);
        Ok(())
    }

    /// Signal the child's whole process group so jobs started by the shell
    /// go down with it. portable_pty calls setsid(), so the child leads its
    /// own group.
    #[cfg(unix)]
    fn escalate(&self) {
        let Some(pid) = self.pid else { return };
        if pid == 0 || pid > i32::MAX as u32 {
            tracing::warn!(pid, "PID is 0 or exceeds i32::MAX, cannot send signal");
            return;
        }
        unsafe {
            libc::kill(-(pid as i32), libc::SIGHUP);
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else { return };
        let exited = self.exited.clone();
        runtime.spawn(async move {
            tokio::time::sleep(KILL_GRACE).await;
            let exited = exited.lock();
            if !*exited {
                tracing::warn!(pid, "child ignored SIGHUP, sending SIGKILL");
                unsafe {
                    libc::kill(-(pid as i32), libc::SIGKILL);
                }
            }
        });
    }

    #[cfg(not(unix))]
    fn escalate(&self) {}
}

/// Block until the child has exited, leaving it unreaped. Returns false if
/// the wait could not be performed.
#[cfg(unix)]
fn wait_without_reaping(pid: u32) -> bool {
    let Ok(id) = libc::id_t::try_from(pid) else { return false };
    loop {
        let mut info: libc::siginfo_t = unsafe { std::mem::zeroed() };
        let rc = unsafe { libc::waitid(libc::P_PID, id, &mut info, libc::WEXITED | libc::WNOWAIT) };
        if rc == 0 {
            return true;
        }
        if std::io::Error::last_os_error().kind() != std::io::ErrorKind::Interrupted {
            return false;
        }
    }
}

#[cfg(not(unix))]
fn wait_without_reaping(_pid: u32) -> bool {
    false
}

#[cfg(unix)]
fn already_gone(e: &std::io::Error) -> bool {
    e.raw_os_error() == Some(libc::ESRCH)
}

#[cfg(not(unix))]
fn already_gone(_e: &std::io::Error) -> bool {
    false
}

fn pty_size(cols: u16, rows: u16) -> PtySize {
    PtySize {
        rows,
        cols,
        pixel_width: 0,
        pixel_height: 0,
    }
}
