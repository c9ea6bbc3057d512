use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Log verbosity level.
#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    /// Most verbose.
    Trace,
    /// Debug messages, including the protocol exchange.
    Debug,
    /// Informational messages (default).
    #[default]
    Info,
    /// Warnings only.
    Warn,
    /// Errors only.
    Error,
}

/// Listener and connection settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Interface to listen on; empty means all interfaces.
    #[serde(default)]
    pub host: String,
    /// Port the engine dials (the DBGP default is 9000).
    #[serde(default = "default_port")]
    pub port: u16,
    /// How long to wait for an engine connection, in seconds.
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
    /// Bound on each response wait, in seconds. Absent means block
    /// indefinitely.
    pub response_timeout_secs: Option<u64>,
}

fn default_port() -> u16 {
    9000
}
fn default_timeout() -> u64 {
    30
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: String::new(),
            port: 9000,
            timeout_secs: 30,
            response_timeout_secs: None,
        }
    }
}

/// Per-session debugger settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Expected IDE key; engines announcing another key are refused.
    pub ide_key: Option<String>,
    /// Features negotiated after each handshake, name to value.
    #[serde(default = "default_features")]
    pub features: BTreeMap<String, String>,
}

fn default_features() -> BTreeMap<String, String> {
    BTreeMap::from([
        ("max_depth".to_string(), "1".to_string()),
        ("max_children".to_string(), "32".to_string()),
        ("max_data".to_string(), "512".to_string()),
    ])
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            ide_key: None,
            features: default_features(),
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogConfig {
    /// Log verbosity level.
    #[serde(default)]
    pub level: LogLevel,
    /// Optional path to a log file.
    pub file: Option<PathBuf>,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: LogLevel::Info,
            file: None,
        }
    }
}

/// Top-level configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Listener and connection settings.
    #[serde(default)]
    pub server: ServerConfig,
    /// Per-session debugger settings.
    #[serde(default)]
    pub session: SessionConfig,
    /// Remote path prefix to local path prefix, for engines running on
    /// another filesystem.
    #[serde(default)]
    pub path_maps: BTreeMap<String, String>,
    /// Logging settings.
    #[serde(default)]
    pub log: LogConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            session: SessionConfig::default(),
            path_maps: BTreeMap::new(),
            log: LogConfig::default(),
        }
    }
}
