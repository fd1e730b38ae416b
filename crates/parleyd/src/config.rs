//! Relay configuration.
//!
//! Layered, lowest priority first: built-in defaults, TOML file,
//! environment (`PARLEY_HOST`, `PARLEY_PORT`), command-line flags. The
//! first three are handled here; the binary applies its flags on top.
//!
//! ```toml
//! host = "127.0.0.1"
//! port = 8081
//!
//! [rooms]
//! evict_empty = false
//! history_limit = 0      # 0 keeps everything
//!
//! [fanout]
//! echo_to_sender = true
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use parley_protocol::MAX_LINE_SIZE;

use crate::engine::FanoutPolicy;
use crate::rooms::RetentionPolicy;
use crate::server::ConnectionLimits;

/// Default listen port.
pub const DEFAULT_PORT: u16 = 8081;

/// Environment variable naming the config file.
pub const CONFIG_ENV: &str = "PARLEY_CONFIG";

/// Errors raised while loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {error}")]
    Read { path: PathBuf, error: String },

    #[error("invalid config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid value for {var}: {value:?}")]
    Env { var: &'static str, value: String },

    #[error("{field} must be greater than zero")]
    Zero { field: &'static str },

    #[error("host must not be blank")]
    BlankHost,
}

/// Room lifecycle settings.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RoomsConfig {
    /// Drop a room and its history when its last member leaves
    pub evict_empty: bool,
    /// Messages kept per room; 0 keeps everything
    pub history_limit: usize,
}

impl Default for RoomsConfig {
    fn default() -> Self {
        Self {
            evict_empty: false,
            history_limit: 0,
        }
    }
}

/// Broadcast settings.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FanoutConfig {
    /// Send each message back to its sender too
    pub echo_to_sender: bool,
}

impl Default for FanoutConfig {
    fn default() -> Self {
        Self {
            echo_to_sender: true,
        }
    }
}

/// Full daemon configuration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Default log filter when `RUST_LOG` is unset
    pub log_level: String,
    pub max_message_size: usize,
    pub idle_timeout_secs: u64,
    pub write_timeout_secs: u64,
    /// Queued outbound lines per connection before it counts as slow
    pub outbox_capacity: usize,
    pub max_connections: usize,
    pub rooms: RoomsConfig,
    pub fanout: FanoutConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: DEFAULT_PORT,
            log_level: "info".to_string(),
            max_message_size: MAX_LINE_SIZE,
            idle_timeout_secs: 300,
            write_timeout_secs: 10,
            outbox_capacity: 256,
            max_connections: 1024,
            rooms: RoomsConfig::default(),
            fanout: FanoutConfig::default(),
        }
    }
}

impl ServerConfig {
    /// Parses a TOML document; missing keys keep their defaults.
    ///
    /// # Errors
    ///
    /// `ConfigError::Parse` for malformed TOML or unknown keys.
    pub fn from_toml_str(input: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(input)?)
    }

    /// Reads and parses a config file.
    ///
    /// # Errors
    ///
    /// `ConfigError::Read` if the file cannot be read, `ConfigError::Parse`
    /// if it is not valid.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|e| ConfigError::Read {
            path: path.to_path_buf(),
            error: e.to_string(),
        })?;
        Self::from_toml_str(&contents)
    }

    /// Loads the config file from the first place that names one:
    /// `explicit`, then `$PARLEY_CONFIG`, then the user config directory.
    /// Falls back to defaults if none exists.
    ///
    /// # Errors
    ///
    /// An explicitly named file that cannot be loaded is an error; a missing
    /// default file is not.
    pub fn discover(explicit: Option<&Path>) -> Result<Self, ConfigError> {
        if let Some(path) = explicit {
            return Self::load(path);
        }
        if let Some(path) = std::env::var_os(CONFIG_ENV) {
            return Self::load(Path::new(&path));
        }
        match default_config_path() {
            Some(path) if path.is_file() => Self::load(&path),
            _ => Ok(Self::default()),
        }
    }

    /// Applies `PARLEY_HOST` / `PARLEY_PORT` from the process environment.
    ///
    /// # Errors
    ///
    /// `ConfigError::Env` if `PARLEY_PORT` is not a port number.
    pub fn apply_env(&mut self) -> Result<(), ConfigError> {
        self.apply_env_from(|var| std::env::var(var).ok())
    }

    /// Same as [`apply_env`](Self::apply_env) with a custom lookup.
    ///
    /// # Errors
    ///
    /// `ConfigError::Env` if the port value is not a port number.
    pub fn apply_env_from<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(host) = lookup("PARLEY_HOST") {
            self.host = host;
        }
        if let Some(port) = lookup("PARLEY_PORT") {
            self.port = port.trim().parse().map_err(|_| ConfigError::Env {
                var: "PARLEY_PORT",
                value: port.clone(),
            })?;
        }
        Ok(())
    }

    /// Rejects values the server cannot run with.
    ///
    /// # Errors
    ///
    /// `ConfigError::BlankHost` or `ConfigError::Zero`.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.host.trim().is_empty() {
            return Err(ConfigError::BlankHost);
        }

        let positive = [
            ("max_message_size", self.max_message_size as u64),
            ("outbox_capacity", self.outbox_capacity as u64),
            ("max_connections", self.max_connections as u64),
            ("idle_timeout_secs", self.idle_timeout_secs),
            ("write_timeout_secs", self.write_timeout_secs),
        ];
        match positive.into_iter().find(|(_, value)| *value == 0) {
            Some((field, _)) => Err(ConfigError::Zero { field }),
            None => Ok(()),
        }
    }

    /// `host:port`, as accepted by `TcpListener::bind`.
    pub fn bind_addr(&self) -> String {
        if self.host.contains(':') && !self.host.starts_with('[') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }

    pub fn retention(&self) -> RetentionPolicy {
        RetentionPolicy {
            evict_empty: self.rooms.evict_empty,
            history_limit: (self.rooms.history_limit > 0).then_some(self.rooms.history_limit),
        }
    }

    pub fn fanout_policy(&self) -> FanoutPolicy {
        FanoutPolicy {
            echo_to_sender: self.fanout.echo_to_sender,
        }
    }

    pub fn connection_limits(&self) -> ConnectionLimits {
        ConnectionLimits {
            max_message_size: self.max_message_size,
            idle_timeout: Duration::from_secs(self.idle_timeout_secs),
            write_timeout: Duration::from_secs(self.write_timeout_secs),
        }
    }
}

/// `<config dir>/parley/parleyd.toml`, if the platform has a config dir.
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("parley").join("parleyd.toml"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = ServerConfig::default();
        assert_eq!(config.port, 8081);
        assert_eq!(config.bind_addr(), "127.0.0.1:8081");
        assert_eq!(config.retention(), RetentionPolicy::default());
        assert!(config.fanout_policy().echo_to_sender);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = ServerConfig::from_toml_str(
            r#"
            port = 9000

            [rooms]
            history_limit = 50
            "#,
        )
        .unwrap();

        assert_eq!(config.port, 9000);
        assert_eq!(config.host, "127.0.0.1");
        assert_eq!(config.retention().history_limit, Some(50));
        assert!(!config.retention().evict_empty);
    }

    #[test]
    fn test_unknown_keys_are_rejected() {
        let err = ServerConfig::from_toml_str("prot = 9000").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "host = \"0.0.0.0\"\n[fanout]\necho_to_sender = false").unwrap();

        let config = ServerConfig::load(file.path()).unwrap();
        assert_eq!(config.host, "0.0.0.0");
        assert!(!config.fanout_policy().echo_to_sender);
    }

    #[test]
    fn test_discover_explicit_missing_file_fails() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope.toml");
        let err = ServerConfig::discover(Some(&missing)).unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = [("PARLEY_HOST", "::1"), ("PARLEY_PORT", "7000")].into();
        let mut config = ServerConfig::default();
        config
            .apply_env_from(|var| env.get(var).map(|v| v.to_string()))
            .unwrap();

        assert_eq!(config.port, 7000);
        assert_eq!(config.bind_addr(), "[::1]:7000");
    }

    #[test]
    fn test_env_bad_port() {
        let mut config = ServerConfig::default();
        let err = config
            .apply_env_from(|var| (var == "PARLEY_PORT").then(|| "eighty".to_string()))
            .unwrap_err();
        assert!(matches!(err, ConfigError::Env { var: "PARLEY_PORT", .. }));
    }

    #[test]
    fn test_validate_rejects_zero_limits() {
        let config = ServerConfig {
            outbox_capacity: 0,
            ..ServerConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Zero { field: "outbox_capacity" })
        ));

        let config = ServerConfig {
            host: " ".to_string(),
            ..ServerConfig::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::BlankHost)));
    }

    #[test]
    fn test_port_zero_is_allowed() {
        let config = ServerConfig {
            port: 0,
            ..ServerConfig::default()
        };
        assert!(config.validate().is_ok());
    }
}
