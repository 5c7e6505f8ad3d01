use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use parking_lot::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;

use crate::activity::ActivityTracker;
use crate::protocol::{CLOSE_GOING_AWAY, CLOSE_IDLE_TIMEOUT};
use crate::pty::ProcessHandle;

/// Why a session ended. Recorded by whoever tears the session down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TeardownReason {
    ProcessExited,
    ConnectionClosed,
    IdleTimeout,
    ServerShutdown,
}

impl TeardownReason {
    /// Close frame the relay owes the client, if the connection is still up.
    ///
    /// `ProcessExited` announces itself with an `exit` message and a normal
    /// close; `ConnectionClosed` means there is nobody left to tell.
    pub fn close_frame(self) -> Option<(u16, &'static str)> {
        match self {
            TeardownReason::IdleTimeout => Some((CLOSE_IDLE_TIMEOUT, "Session idle timeout")),
            TeardownReason::ServerShutdown => Some((CLOSE_GOING_AWAY, "Server shutting down")),
            TeardownReason::ProcessExited | TeardownReason::ConnectionClosed => None,
        }
    }
}

/// One authenticated connection paired with one spawned process.
///
/// Cheap to clone; all clones share the process, activity clock and
/// cancellation token.
#[derive(Clone)]
pub struct Session {
    pub id: String,
    /// Owning user identifier.
    pub user: String,
    pub pid: Option<u32>,
    pub process: Arc<ProcessHandle>,
    pub activity: ActivityTracker,
    /// Fires when the session is torn down. Both relay loops select on it.
    pub cancelled: CancellationToken,
    reason: Arc<Mutex<Option<TeardownReason>>>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("user", &self.user)
            .field("pid", &self.pid)
            .finish_non_exhaustive()
    }
}

impl Session {
    pub fn new(user: impl Into<String>, process: ProcessHandle) -> Self {
        let user = user.into();
        Self {
            id: session_id(&user, SystemTime::now()),
            pid: process.pid(),
            user,
            process: Arc::new(process),
            activity: ActivityTracker::new(),
            cancelled: CancellationToken::new(),
            reason: Arc::new(Mutex::new(None)),
        }
    }

    /// The reason recorded at teardown, or `None` while the session is live.
    pub fn teardown_reason(&self) -> Option<TeardownReason> {
        *self.reason.lock()
    }

    /// Record the reason, wake both relay loops, and kill the process.
    ///
    /// Only called by the registry on the caller that removed the entry, so
    /// it runs once per session.
    fn finish(&self, reason: TeardownReason) {
        *self.reason.lock() = Some(reason);
        self.cancelled.cancel();
        if let Err(e) = self.process.kill() {
            tracing::warn!(session = %self.id, pid = self.pid, ?e, "failed to kill session process");
        }
    }
}

/// `"{user}-{unix millis}"`. Unique in practice; the registry resolves the
/// rare same-millisecond collision.
pub fn session_id(user: &str, at: SystemTime) -> String {
    let millis = at
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or_default();
    format!("{user}-{millis}")
}

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("maximum number of sessions reached")]
    MaxSessionsReached,
}

struct RegistryInner {
    sessions: HashMap<String, Session>,
    max_sessions: Option<usize>,
}

/// Every live session on this server, by id.
///
/// The lock is held only for map mutation; process kills and socket I/O
/// always happen after it is released.
#[derive(Clone)]
pub struct SessionRegistry {
    inner: Arc<RwLock<RegistryInner>>,
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionRegistry {
    /// Each session costs a PTY pair and three blocking threads.
    pub const DEFAULT_MAX_SESSIONS: usize = 256;

    pub fn new() -> Self {
        Self::with_max_sessions(Some(Self::DEFAULT_MAX_SESSIONS))
    }

    pub fn with_max_sessions(max_sessions: Option<usize>) -> Self {
        Self {
            inner: Arc::new(RwLock::new(RegistryInner {
                sessions: HashMap::new(),
                max_sessions,
            })),
        }
    }

    /// Insert a session, returning it with its final id.
    ///
    /// If the id is taken, `-1`, `-2`, ... is appended until it is unique.
    pub fn insert(&self, mut session: Session) -> Result<Session, RegistryError> {
        let mut inner = self.inner.write();

        if let Some(max) = inner.max_sessions {
            if inner.sessions.len() >= max {
                return Err(RegistryError::MaxSessionsReached);
            }
        }

        if inner.sessions.contains_key(&session.id) {
            let base = session.id.clone();
            let mut n = 1u32;
            loop {
                let candidate = format!("{base}-{n}");
                if !inner.sessions.contains_key(&candidate) {
                    session.id = candidate;
                    break;
                }
                n += 1;
            }
        }

        inner.sessions.insert(session.id.clone(), session.clone());
        Ok(session)
    }

    /// Look up a session by id, returning a clone if found.
    pub fn get(&self, id: &str) -> Option<Session> {
        self.inner.read().sessions.get(id).cloned()
    }

    /// Return all session ids.
    pub fn list(&self) -> Vec<String> {
        self.inner.read().sessions.keys().cloned().collect()
    }

    /// Clone every live session. Callers iterate without holding the lock.
    pub fn snapshot(&self) -> Vec<Session> {
        self.inner.read().sessions.values().cloned().collect()
    }

    /// Return the number of sessions.
    pub fn len(&self) -> usize {
        self.inner.read().sessions.len()
    }

    /// Return true if the registry contains no sessions.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Tear a session down: remove it, then kill its process and cancel its
    /// relay loops.
    ///
    /// Returns the session only to the caller that actually removed it.
    /// Process exit, connection close, the idle sweep and shutdown all race
    /// through here; exactly one of them wins and the rest get `None`.
    pub fn teardown(&self, id: &str, reason: TeardownReason) -> Option<Session> {
        let removed = self.inner.write().sessions.remove(id);
        let session = removed?;
        tracing::info!(session = %id, user = %session.user, ?reason, "session torn down");
        session.finish(reason);
        Some(session)
    }

    /// Like [`teardown`](Self::teardown) with `IdleTimeout`, but only if the
    /// session is still idle for longer than `threshold` once the write lock
    /// is held. A message that lands between the sweep's snapshot and this
    /// call spares the session.
    pub fn teardown_if_idle(&self, id: &str, threshold: Duration) -> Option<Session> {
        let removed = {
            let mut inner = self.inner.write();
            let idle = inner
                .sessions
                .get(id)
                .is_some_and(|s| s.activity.idle_for() > threshold);
            if idle {
                inner.sessions.remove(id)
            } else {
                None
            }
        };
        let session = removed?;
        tracing::info!(
            session = %id,
            user = %session.user,
            idle_ms = session.activity.idle_ms(),
            "reclaiming idle session"
        );
        session.finish(TeardownReason::IdleTimeout);
        Some(session)
    }

    /// Tear down every session. Returns how many were live.
    pub fn drain(&self, reason: TeardownReason) -> usize {
        let drained: Vec<Session> = {
            let mut inner = self.inner.write();
            inner.sessions.drain().map(|(_, s)| s).collect()
        };
        for session in &drained {
            session.finish(reason);
        }
        drained.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pty::SpawnOptions;

    fn spawn_session(user: &str) -> (Session, crate::pty::ProcessIo) {
        let opts = SpawnOptions {
            program: "/bin/sh".into(),
            cwd: None,
            ..SpawnOptions::shell(None)
        };
        let (process, io) = ProcessHandle::spawn(&opts).expect("failed to spawn PTY for test");
        (Session::new(user, process), io)
    }

    #[test]
    fn session_id_joins_user_and_millis() {
        let at = UNIX_EPOCH + Duration::from_millis(1_718_000_000_123);
        assert_eq!(session_id("u1", at), "u1-1718000000123");
    }

    #[test]
    fn close_frames_per_reason() {
        assert_eq!(
            TeardownReason::IdleTimeout.close_frame(),
            Some((CLOSE_IDLE_TIMEOUT, "Session idle timeout"))
        );
        assert_eq!(
            TeardownReason::ServerShutdown.close_frame().map(|(c, _)| c),
            Some(CLOSE_GOING_AWAY)
        );
        assert_eq!(TeardownReason::ConnectionClosed.close_frame(), None);
        assert_eq!(TeardownReason::ProcessExited.close_frame(), None);
    }

    #[tokio::test]
    async fn insert_and_get() {
        let registry = SessionRegistry::new();
        let (session, _io) = spawn_session("alice");
        let inserted = registry.insert(session).unwrap();
        assert!(inserted.id.starts_with("alice-"));
        assert_eq!(registry.len(), 1);
        let found = registry.get(&inserted.id).expect("session should exist");
        assert_eq!(found.user, "alice");
        assert_eq!(registry.list(), vec![inserted.id.clone()]);
        registry.drain(TeardownReason::ServerShutdown);
    }

    #[tokio::test]
    async fn colliding_ids_get_a_suffix() {
        let registry = SessionRegistry::new();
        let (mut a, _io_a) = spawn_session("bob");
        let (mut b, _io_b) = spawn_session("bob");
        a.id = "bob-1".into();
        b.id = "bob-1".into();
        let a = registry.insert(a).unwrap();
        let b = registry.insert(b).unwrap();
        assert_eq!(a.id, "bob-1");
        assert_eq!(b.id, "bob-1-1");
        assert_eq!(registry.len(), 2);
        registry.drain(TeardownReason::ServerShutdown);
    }

    #[tokio::test]
    async fn max_sessions_enforced() {
        let registry = SessionRegistry::with_max_sessions(Some(1));
        let (a, _io_a) = spawn_session("carol");
        let (b, _io_b) = spawn_session("dave");
        registry.insert(a).unwrap();
        let err = registry.insert(b.clone()).unwrap_err();
        assert!(matches!(err, RegistryError::MaxSessionsReached));
        b.process.kill().unwrap();
        registry.drain(TeardownReason::ServerShutdown);
    }

    #[tokio::test]
    async fn teardown_is_idempotent() {
        let registry = SessionRegistry::new();
        let (session, io) = spawn_session("erin");
        let session = registry.insert(session).unwrap();

        let first = registry.teardown(&session.id, TeardownReason::ConnectionClosed);
        let second = registry.teardown(&session.id, TeardownReason::ProcessExited);
        assert!(first.is_some());
        assert!(second.is_none());
        assert!(registry.is_empty());
        assert!(session.cancelled.is_cancelled());
        // The first caller's reason sticks.
        assert_eq!(session.teardown_reason(), Some(TeardownReason::ConnectionClosed));

        let exit = tokio::time::timeout(Duration::from_secs(5), io.exit)
            .await
            .expect("process should die after teardown");
        assert!(exit.is_ok());
    }

    #[tokio::test]
    async fn teardown_if_idle_spares_active_sessions() {
        let registry = SessionRegistry::new();
        let (session, _io) = spawn_session("frank");
        let session = registry.insert(session).unwrap();

        assert!(registry
            .teardown_if_idle(&session.id, Duration::from_secs(60))
            .is_none());
        assert_eq!(registry.len(), 1);

        session.activity.backdate(Duration::from_secs(120));
        let reclaimed = registry.teardown_if_idle(&session.id, Duration::from_secs(60));
        assert!(reclaimed.is_some());
        assert!(registry.is_empty());
        assert_eq!(session.teardown_reason(), Some(TeardownReason::IdleTimeout));
    }

    #[tokio::test]
    async fn drain_tears_down_everything() {
        let registry = SessionRegistry::new();
        let (a, _io_a) = spawn_session("gina");
        let (b, _io_b) = spawn_session("hank");
        let a = registry.insert(a).unwrap();
        let b = registry.insert(b).unwrap();
        assert_eq!(registry.drain(TeardownReason::ServerShutdown), 2);
        assert!(registry.is_empty());
        assert!(a.cancelled.is_cancelled());
        assert_eq!(b.teardown_reason(), Some(TeardownReason::ServerShutdown));
    }
}
