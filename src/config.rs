//! Configuration loading and defaults.
//!
//! Configuration is resolved in order of precedence (highest wins):
//!
//! 1. **Environment variables**: `PANELD_API_KEY`, `PANELD_LISTEN`,
//!    `PANELD_SHELL`
//! 2. **Config file**: path via `--config <path>`, or `paneld.toml` in CWD
//! 3. **Compiled defaults**: see each field's default value below
//!
//! The TOML file mirrors the struct hierarchy:
//!
//! ```toml
//! [server]
//! listen = "127.0.0.1:4317"
//!
//! [auth]
//! api_key = "your-secret-key"
//!
//! [sessions]
//! shell = ""               # empty = $SHELL, else the best detected shell
//! pty = true
//! buffer_size = 1000       # output chunks kept per session for replay
//! idle_timeout_secs = 3600 # 0 disables idle eviction
//! max_sessions = 64
//! default_rows = 24
//! default_cols = 80
//! default_cwd = "~"
//!
//! [logging]
//! level = "info"
//! ```

use serde::Deserialize;
use std::path::Path;

use crate::error::ConfigError;

/// File looked up in the current directory when `--config` is not given.
pub const DEFAULT_CONFIG_FILE: &str = "paneld.toml";

/// Top-level configuration, deserialized from TOML.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub sessions: SessionsConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// HTTP server settings.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Socket address to bind (default `127.0.0.1:4317`).
    #[serde(default = "default_listen")]
    pub listen: String,
}

/// Authentication settings.
#[derive(Debug, Clone, Deserialize)]
pub struct AuthConfig {
    /// Pre-shared Bearer token. Override with `PANELD_API_KEY` env var.
    /// Defaults to `"change-me"` which triggers a startup warning.
    #[serde(default = "default_api_key")]
    pub api_key: String,
}

/// Session registry settings.
#[derive(Debug, Clone, Deserialize)]
pub struct SessionsConfig {
    /// Shell binary. Empty means `$SHELL`, falling back to detection.
    #[serde(default)]
    pub shell: String,
    /// Run shells on a PTY (default true) instead of plain pipes.
    #[serde(default = "default_pty")]
    pub pty: bool,
    /// Output chunks retained per session for replay (default 1000).
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,
    /// Seconds without activity before a session is reaped (default 3600).
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,
    /// Maximum live sessions (default 64).
    #[serde(default = "default_max_sessions")]
    pub max_sessions: usize,
    #[serde(default = "default_rows")]
    pub default_rows: u16,
    #[serde(default = "default_cols")]
    pub default_cols: u16,
    /// Working directory when a create request omits `cwd` (default `~`).
    #[serde(default = "default_cwd")]
    pub default_cwd: String,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// tracing filter level (default `info`). Overridden by `RUST_LOG` env var.
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_listen() -> String {
    "127.0.0.1:4317".to_string()
}
fn default_api_key() -> String {
    "change-me".to_string()
}
fn default_pty() -> bool {
    true
}
fn default_buffer_size() -> usize {
    1000
}
fn default_idle_timeout_secs() -> u64 {
    3600
}
fn default_max_sessions() -> usize {
    64
}
fn default_rows() -> u16 {
    24
}
fn default_cols() -> u16 {
    80
}
fn default_cwd() -> String {
    "~".to_string()
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
        }
    }
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            api_key: default_api_key(),
        }
    }
}

impl Default for SessionsConfig {
    fn default() -> Self {
        Self {
            shell: String::new(),
            pty: default_pty(),
            buffer_size: default_buffer_size(),
            idle_timeout_secs: default_idle_timeout_secs(),
            max_sessions: default_max_sessions(),
            default_rows: default_rows(),
            default_cols: default_cols(),
            default_cwd: default_cwd(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Config {
    /// Load configuration with the precedence chain: env vars > file > defaults.
    ///
    /// If `path` is `Some`, that file must exist and parse. Otherwise
    /// `paneld.toml` in the current directory is used when present, falling
    /// back to compiled defaults.
    pub fn load(path: Option<&str>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(p) => Self::from_file(p)?,
            None if Path::new(DEFAULT_CONFIG_FILE).exists() => {
                Self::from_file(DEFAULT_CONFIG_FILE)?
            }
            None => Self::default(),
        };
        config.apply_env(|name| std::env::var(name).ok());
        Ok(config)
    }

    fn from_file(path: &str) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_string(),
            source,
        })?;
        toml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_string(),
            source,
        })
    }

    fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(key) = lookup("PANELD_API_KEY") {
            self.auth.api_key = key;
        }
        if let Some(listen) = lookup("PANELD_LISTEN") {
            self.server.listen = listen;
        }
        if let Some(shell) = lookup("PANELD_SHELL") {
            self.sessions.shell = shell;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.server.listen, "127.0.0.1:4317");
        assert_eq!(config.auth.api_key, "change-me");
        assert!(config.sessions.shell.is_empty());
        assert!(config.sessions.pty);
        assert_eq!(config.sessions.buffer_size, 1000);
        assert_eq!(config.sessions.idle_timeout_secs, 3600);
        assert_eq!(config.sessions.default_cwd, "~");
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "[sessions]\nbuffer_size = 50\nidle_timeout_secs = 0\n\n[auth]\napi_key = \"k\""
        )
        .unwrap();

        let config = Config::from_file(file.path().to_str().unwrap()).unwrap();
        assert_eq!(config.sessions.buffer_size, 50);
        assert_eq!(config.sessions.idle_timeout_secs, 0);
        assert_eq!(config.sessions.max_sessions, 64);
        assert_eq!(config.auth.api_key, "k");
        assert_eq!(config.server.listen, "127.0.0.1:4317");
    }

    #[test]
    fn test_missing_file_is_read_error() {
        let err = Config::load(Some("/nonexistent/paneld.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }

    #[test]
    fn test_bad_toml_is_parse_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[sessions]\nbuffer_size = \"lots\"").unwrap();
        let err = Config::from_file(file.path().to_str().unwrap()).unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
    }

    #[test]
    fn test_env_overrides_file() {
        let mut config = Config::default();
        config.apply_env(|name| match name {
            "PANELD_API_KEY" => Some("secret".into()),
            "PANELD_SHELL" => Some("/bin/zsh".into()),
            _ => None,
        });
        assert_eq!(config.auth.api_key, "secret");
        assert_eq!(config.sessions.shell, "/bin/zsh");
        assert_eq!(config.server.listen, "127.0.0.1:4317");
    }
}
