//! Configuration for the server.
//!
//! A single optional command-line argument names the TOML configuration
//! file; without it a default path is used. Section and key names follow
//! the `section.key` scheme (`application.type`, `network.io_type`, ...).

use crate::engine::MultiplexerKind;
use crate::error::{Error, Result};
use clap::Parser;
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Default config file path when none is given on the command line.
pub const DEFAULT_CONFIG_PATH: &str = "config.toml";

/// Command-line arguments.
#[derive(Parser, Debug)]
#[command(name = "polyserve")]
#[command(version = "0.1.0")]
#[command(about = "A multi-protocol TCP server framework", long_about = None)]
pub struct CliArgs {
    /// Path to the TOML configuration file
    pub config: Option<PathBuf>,
}

/// TOML configuration file structure.
#[derive(Debug, Deserialize)]
pub struct TomlConfig {
    pub application: ApplicationSection,
    #[serde(default)]
    pub network: NetworkSection,
    #[serde(default)]
    pub threading: ThreadingSection,
    #[serde(default)]
    pub websocket: WebSocketSection,
    #[serde(default)]
    pub engine: EngineSection,
    #[serde(default)]
    pub logging: LoggingSection,
}

/// `[application]` section. The type has no default: the operator must
/// pick a registered application.
#[derive(Debug, Deserialize)]
pub struct ApplicationSection {
    #[serde(rename = "type")]
    pub kind: String,
}

/// `[network]` section.
#[derive(Debug, Deserialize)]
pub struct NetworkSection {
    #[serde(default = "default_ip")]
    pub ip: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub io_type: MultiplexerKind,
}

impl Default for NetworkSection {
    fn default() -> Self {
        Self {
            ip: default_ip(),
            port: default_port(),
            io_type: MultiplexerKind::default(),
        }
    }
}

/// `[threading]` section.
#[derive(Debug, Deserialize)]
pub struct ThreadingSection {
    #[serde(default = "default_worker_threads")]
    pub worker_threads: usize,
}

impl Default for ThreadingSection {
    fn default() -> Self {
        Self {
            worker_threads: default_worker_threads(),
        }
    }
}

/// `[websocket]` section.
#[derive(Debug, Deserialize)]
pub struct WebSocketSection {
    #[serde(default = "default_true")]
    pub enable_ping: bool,
    /// PING cadence in seconds
    #[serde(default = "default_ping_interval")]
    pub ping_interval: u64,
    /// Cap on outbound application frames in bytes
    #[serde(default = "default_max_frame_size")]
    pub max_frame_size: usize,
}

impl Default for WebSocketSection {
    fn default() -> Self {
        Self {
            enable_ping: true,
            ping_interval: default_ping_interval(),
            max_frame_size: default_max_frame_size(),
        }
    }
}

/// `[engine]` section.
#[derive(Debug, Deserialize)]
pub struct EngineSection {
    /// Engine-level heartbeat magic. When absent, the application's own
    /// policy decides (framed protocols keep it off).
    pub heartbeat_enabled: Option<bool>,
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_seconds: u64,
}

impl Default for EngineSection {
    fn default() -> Self {
        Self {
            heartbeat_enabled: None,
            idle_timeout_seconds: default_idle_timeout(),
        }
    }
}

/// `[logging]` section.
#[derive(Debug, Deserialize)]
pub struct LoggingSection {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_ip() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8888
}

fn default_worker_threads() -> usize {
    10
}

fn default_true() -> bool {
    true
}

fn default_ping_interval() -> u64 {
    30
}

fn default_max_frame_size() -> usize {
    65536
}

fn default_idle_timeout() -> u64 {
    60
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Final resolved configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub application: String,
    pub ip: String,
    pub port: u16,
    pub io_type: MultiplexerKind,
    pub worker_threads: usize,
    pub websocket: WebSocketOptions,
    pub heartbeat_enabled: Option<bool>,
    pub idle_timeout_seconds: u64,
    pub log_level: String,
}

/// WebSocket application options, resolved from `[websocket]`.
#[derive(Debug, Clone)]
pub struct WebSocketOptions {
    pub enable_ping: bool,
    pub ping_interval: u64,
    pub max_frame_size: usize,
}

impl Config {
    /// Load and resolve configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| Error::ConfigRead(path.to_path_buf(), e))?;
        let toml_config: TomlConfig =
            toml::from_str(&contents).map_err(|e| Error::ConfigParse(path.to_path_buf(), e))?;
        Ok(Self::from_toml(toml_config))
    }

    fn from_toml(toml_config: TomlConfig) -> Self {
        Config {
            application: toml_config.application.kind,
            ip: toml_config.network.ip,
            port: toml_config.network.port,
            io_type: toml_config.network.io_type,
            worker_threads: toml_config.threading.worker_threads,
            websocket: WebSocketOptions {
                enable_ping: toml_config.websocket.enable_ping,
                ping_interval: toml_config.websocket.ping_interval,
                max_frame_size: toml_config.websocket.max_frame_size,
            },
            heartbeat_enabled: toml_config.engine.heartbeat_enabled,
            idle_timeout_seconds: toml_config.engine.idle_timeout_seconds,
            log_level: toml_config.logging.level,
        }
    }
}
