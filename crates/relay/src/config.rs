//! Relay configuration.
//!
//! Values come from three layers, later ones winning: built-in defaults, an
//! optional JSON file, then `DAYBOOK_*` environment variables.

use protocol::ClientGroupId;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Environment variable naming the config file.
pub const ENV_CONFIG: &str = "DAYBOOK_CONFIG";
/// Environment variable overriding the bind address.
pub const ENV_BIND: &str = "DAYBOOK_BIND";
/// Environment variable overriding the port.
pub const ENV_PORT: &str = "DAYBOOK_PORT";
/// Environment variable overriding the token secret.
pub const ENV_JWT_SECRET: &str = "DAYBOOK_JWT_SECRET";

/// Configuration errors.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Invalid value for {var}: {value}")]
    InvalidEnv { var: &'static str, value: String },
}

/// Relay configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// Address to bind to.
    pub bind_address: String,
    /// Port to listen on.
    pub port: u16,
    /// HS256 secret for bearer tokens. Empty disables targeted pokes.
    pub jwt_secret: String,
    /// Interval between `ping` frames on a notification stream.
    pub ping_interval_secs: u64,
    /// How long a channel may stay full before it is reaped.
    pub heartbeat_timeout_secs: u64,
    /// How often the reaper runs.
    pub reap_interval_secs: u64,
    /// Per-channel buffer of undelivered frames.
    pub channel_capacity: usize,
    /// Poke the pushing user's channels after a successful push.
    pub poke_on_push: bool,
    /// Client groups acknowledged by the push endpoint.
    pub client_groups: Vec<ClientGroupId>,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0".to_string(),
            port: 8787,
            jwt_secret: String::new(),
            ping_interval_secs: 30,
            heartbeat_timeout_secs: 90,
            reap_interval_secs: 15,
            channel_capacity: 32,
            poke_on_push: false,
            client_groups: ClientGroupId::defaults().to_vec(),
        }
    }
}

impl RelayConfig {
    /// Create a new configuration with the specified port.
    pub fn with_port(port: u16) -> Self {
        Self {
            port,
            ..Default::default()
        }
    }

    /// Replace the token secret.
    pub fn with_jwt_secret(mut self, secret: impl Into<String>) -> Self {
        self.jwt_secret = secret.into();
        self
    }

    /// Load from `path` (or `DAYBOOK_CONFIG`) and apply environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let env_path = std::env::var_os(ENV_CONFIG).map(PathBuf::from);
        let mut config = match path.map(Path::to_path_buf).or(env_path) {
            Some(path) => Self::from_file(&path)?,
            None => Self::default(),
        };
        config.apply_env(|var| std::env::var(var).ok())?;
        Ok(config)
    }

    /// Read a JSON config file. Missing keys take their defaults.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Apply overrides from an environment lookup.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(bind) = lookup(ENV_BIND) {
            self.bind_address = bind;
        }
        if let Some(port) = lookup(ENV_PORT) {
            self.port = port.trim().parse().map_err(|_| ConfigError::InvalidEnv {
                var: ENV_PORT,
                value: port,
            })?;
        }
        if let Some(secret) = lookup(ENV_JWT_SECRET) {
            self.jwt_secret = secret;
        }
        Ok(())
    }

    /// Get the full bind address.
    pub fn socket_addr(&self) -> String {
        format!("{}:{}", self.bind_address, self.port)
    }

    pub fn ping_interval(&self) -> Duration {
        Duration::from_secs(self.ping_interval_secs.max(1))
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_secs(self.heartbeat_timeout_secs)
    }

    pub fn reap_interval(&self) -> Duration {
        Duration::from_secs(self.reap_interval_secs.max(1))
    }
}
