use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::api::token::{ClaimsVerifier, IdentityClaim};
use crate::authz::PermissionPolicy;
use crate::pty::SpawnOptions;
use crate::reaper::Reaper;
use crate::session::SessionRegistry;

pub const DEFAULT_BIND: SocketAddr =
    SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::new(127, 0, 0, 1), 3000));

/// Relay configuration, loaded from TOML. Every field has a default, so an
/// empty file is valid.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// Listen address (host:port).
    pub bind: Option<SocketAddr>,
    /// Browser origins allowed to call the HTTP endpoints.
    pub cors_origins: Vec<String>,
    pub session: SessionConfig,
    pub auth: AuthConfig,
    /// Feature permissions. Without this section every authenticated user
    /// may open a terminal.
    pub permissions: Option<PermissionPolicy>,
    pub client: ClientSection,
}

/// `[session]`: process launch and reclamation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Program to run; `$SHELL` or `/bin/sh` when unset.
    pub shell: Option<String>,
    pub args: Vec<String>,
    /// Working directory; the user's home directory when unset.
    pub cwd: Option<PathBuf>,
    pub cols: u16,
    pub rows: u16,
    pub idle_timeout_secs: u64,
    pub sweep_interval_secs: u64,
    /// Zero disables the limit.
    pub max_sessions: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            shell: None,
            args: Vec::new(),
            cwd: None,
            cols: SpawnOptions::DEFAULT_COLS,
            rows: SpawnOptions::DEFAULT_ROWS,
            idle_timeout_secs: Reaper::DEFAULT_IDLE_TIMEOUT.as_secs(),
            sweep_interval_secs: Reaper::DEFAULT_INTERVAL.as_secs(),
            max_sessions: SessionRegistry::DEFAULT_MAX_SESSIONS,
        }
    }
}

/// `[auth]`: how bearer tokens are checked.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    pub identity_claim: IdentityClaim,
    pub leeway_secs: u64,
    pub require_expiry: bool,
    pub issuers: Vec<String>,
    pub audiences: Vec<String>,
}

/// `[client]`: defaults for `ptyrelay connect`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientSection {
    pub url: Option<String>,
    pub base_delay_ms: u64,
    pub max_attempts: u32,
    pub heartbeat_secs: u64,
}

impl Default for ClientSection {
    fn default() -> Self {
        Self {
            url: None,
            base_delay_ms: 1000,
            max_attempts: 5,
            heartbeat_secs: 30,
        }
    }
}

impl RelayConfig {
    /// Load config from a TOML file path. Returns None if file doesn't exist.
    ///
    /// Checks file permissions and warns if world-readable.
    pub fn load(path: &Path) -> Result<Option<Self>, ConfigError> {
        if !path.exists() {
            return Ok(None);
        }

        check_config_permissions(path);

        let contents = std::fs::read_to_string(path)
            .map_err(|source| ConfigError::ReadFailed {
                path: path.to_path_buf(),
                source,
            })?;
        let config: Self = toml::from_str(&contents)
            .map_err(|source| ConfigError::ParseFailed {
                path: path.to_path_buf(),
                source,
            })?;
        config.validate()?;
        Ok(Some(config))
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.session.cols == 0 || self.session.rows == 0 {
            return Err(ConfigError::Invalid(format!(
                "terminal geometry {}x{} has a zero dimension",
                self.session.cols, self.session.rows
            )));
        }
        if self.session.sweep_interval_secs == 0 {
            return Err(ConfigError::Invalid("sweep_interval_secs must be positive".into()));
        }
        Ok(())
    }

    pub fn bind(&self) -> SocketAddr {
        self.bind.unwrap_or(DEFAULT_BIND)
    }

    pub fn spawn_options(&self) -> SpawnOptions {
        let mut options = SpawnOptions::shell(self.session.shell.clone());
        options.args = self.session.args.clone();
        options.cols = self.session.cols;
        options.rows = self.session.rows;
        if let Some(ref cwd) = self.session.cwd {
            options.cwd = Some(cwd.clone());
        }
        options
    }

    pub fn verifier(&self) -> ClaimsVerifier {
        ClaimsVerifier {
            identity_claim: self.auth.identity_claim,
            leeway: Duration::from_secs(self.auth.leeway_secs),
            require_expiry: self.auth.require_expiry,
            issuers: self.auth.issuers.clone(),
            audiences: self.auth.audiences.clone(),
        }
    }

    pub fn max_sessions(&self) -> Option<usize> {
        (self.session.max_sessions > 0).then_some(self.session.max_sessions)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.session.idle_timeout_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.session.sweep_interval_secs)
    }
}

/// `$XDG_CONFIG_HOME/ptyrelay/config.toml`, or the platform equivalent.
pub fn default_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("ptyrelay").join("config.toml"))
}

/// Errors that can occur when loading config.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config {}: {source}", .path.display())]
    ReadFailed {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse config {}: {source}", .path.display())]
    ParseFailed {
        path: PathBuf,
        source: toml::de::Error,
    },

    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Check file permissions on a config file and warn if world-readable.
///
/// The `[client]` and `[permissions]` sections name users and endpoints.
#[cfg(unix)]
pub fn check_config_permissions(path: &Path) {
    use std::os::unix::fs::PermissionsExt;

    let metadata = match std::fs::metadata(path) {
        Ok(m) => m,
        Err(_) => return,
    };

    let mode = metadata.permissions().mode();
    if is_world_readable(mode) {
        tracing::warn!(
            "config file {} is world-readable (mode {:o}); consider restricting permissions to 600",
            path.display(),
            mode & 0o7777,
        );
    }
}

#[cfg(not(unix))]
pub fn check_config_permissions(_path: &Path) {}

#[cfg(unix)]
fn is_world_readable(mode: u32) -> bool {
    mode & 0o004 != 0
}
