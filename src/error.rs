//! Error types surfaced by the session registry and configuration loader.

use thiserror::Error;

/// Failures of [`crate::sessions::SessionRegistry::create_or_get`].
///
/// Every other registry operation absorbs unknown or already-reaped sessions
/// into `bool` / `Option` results instead of erroring.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Session limit reached (max {0})")]
    LimitReached(usize),
    #[error("Failed to allocate PTY: {0}")]
    Pty(#[from] nix::Error),
    #[error("Failed to spawn shell {shell} in {cwd}: {source}")]
    Spawn {
        shell: String,
        cwd: String,
        #[source]
        source: std::io::Error,
    },
    #[error("Failed to wire session I/O: {0}")]
    Io(String),
}

impl SessionError {
    /// Short machine-readable code used in WebSocket error replies.
    pub fn code(&self) -> &'static str {
        match self {
            Self::LimitReached(_) => "SESSION_LIMIT",
            Self::Pty(_) | Self::Spawn { .. } | Self::Io(_) => "SPAWN_FAILED",
        }
    }
}

/// Failures loading the TOML configuration file.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("Failed to parse config file {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: toml::de::Error,
    },
}
