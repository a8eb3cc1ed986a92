//! Configuration module for the meshwire server.
//!
//! Supports both command-line arguments and TOML configuration file.
//! CLI arguments take precedence over config file values.

use crate::runtime::{DEFAULT_BUFFER_SIZE, DEFAULT_MAX_FRAME_SIZE};
use clap::{Parser, ValueEnum};
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Which demonstration service the binary runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Write every received byte back.
    #[default]
    Echo,
    /// Accept requests and never answer.
    Silent,
    /// Answer each framed request with a framed response.
    Responder,
    /// Fan each request out to the configured upstreams.
    Fanout,
}

/// Command-line arguments for the server
#[derive(Parser, Debug)]
#[command(name = "meshwire")]
#[command(author = "meshwire authors")]
#[command(version = "0.1.0")]
#[command(about = "Event-driven TCP server with sub-request fan-out", long_about = None)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Address to bind to (e.g., 127.0.0.1:10007)
    #[arg(short = 'l', long)]
    pub listen: Option<String>,

    /// Number of worker threads (0 = number of CPU cores)
    #[arg(short = 'w', long)]
    pub workers: Option<usize>,

    /// Service to run
    #[arg(short = 'r', long, value_enum)]
    pub role: Option<Role>,

    /// Upstream `ip:port` for the fanout role (repeatable)
    #[arg(short = 'u', long = "upstream")]
    pub upstreams: Vec<String>,

    /// Timeout wheel tick in milliseconds
    #[arg(long)]
    pub tick_ms: Option<u64>,

    /// Close passive connections that stay idle for a full wheel turn
    #[arg(long)]
    pub idle_timeout: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    pub log_level: String,
}

/// TOML configuration file structure
#[derive(Debug, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub runtime: RuntimeConfig,
    #[serde(default)]
    pub connector: ConnectorConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Server-related configuration
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    /// Address to bind to
    #[serde(default = "default_listen")]
    pub listen: String,
    /// Service to run
    #[serde(default)]
    pub role: Role,
    /// Evict idle passive connections
    #[serde(default)]
    pub idle_timeout: bool,
    /// Maximum number of open connections, both directions
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    /// Listen backlog
    #[serde(default = "default_backlog")]
    pub backlog: i32,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            role: Role::default(),
            idle_timeout: false,
            max_connections: default_max_connections(),
            backlog: default_backlog(),
        }
    }
}

/// Reactor, worker and buffer tuning
#[derive(Debug, Deserialize)]
pub struct RuntimeConfig {
    /// Number of worker threads (0 = number of CPU cores)
    #[serde(default = "default_workers")]
    pub workers: usize,
    /// Timeout wheel tick in milliseconds
    #[serde(default = "default_tick_ms")]
    pub tick_ms: u64,
    /// Number of timeout wheel buckets
    #[serde(default = "default_wheel_slots")]
    pub wheel_slots: usize,
    /// Longest single reactor wait in milliseconds
    #[serde(default = "default_poll_timeout_ms")]
    pub poll_timeout_ms: u64,
    /// Readiness events handled per poll
    #[serde(default = "default_max_events")]
    pub max_events: usize,
    /// Initial capacity of each connection buffer
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,
    /// Bytes read from one connection per event
    #[serde(default = "default_read_budget")]
    pub read_budget: usize,
    /// Largest accepted frame name or payload
    #[serde(default = "default_max_frame_size")]
    pub max_frame_size: usize,
    /// Input buffered while awaiting before reads pause
    #[serde(default = "default_max_suppressed_input")]
    pub max_suppressed_input: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            tick_ms: default_tick_ms(),
            wheel_slots: default_wheel_slots(),
            poll_timeout_ms: default_poll_timeout_ms(),
            max_events: default_max_events(),
            buffer_size: default_buffer_size(),
            read_budget: default_read_budget(),
            max_frame_size: default_max_frame_size(),
            max_suppressed_input: default_max_suppressed_input(),
        }
    }
}

/// Outbound sub-request configuration
#[derive(Debug, Deserialize)]
pub struct ConnectorConfig {
    /// Default sub-request timeout in seconds
    #[serde(default = "default_sub_request_timeout_secs")]
    pub sub_request_timeout_secs: u64,
    /// Upstream `ip:port` list for the fanout role
    #[serde(default)]
    pub upstreams: Vec<String>,
    /// Timeout in milliseconds for the fanout role's second upstream
    #[serde(default = "default_fanout_timeout_ms")]
    pub fanout_timeout_ms: u64,
}

impl Default for ConnectorConfig {
    fn default() -> Self {
        Self {
            sub_request_timeout_secs: default_sub_request_timeout_secs(),
            upstreams: Vec::new(),
            fanout_timeout_ms: default_fanout_timeout_ms(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_listen() -> String {
    "127.0.0.1:10007".to_string()
}

fn default_max_connections() -> usize {
    10000
}

fn default_backlog() -> i32 {
    1024
}

fn default_workers() -> usize {
    2
}

fn default_tick_ms() -> u64 {
    1000
}

fn default_wheel_slots() -> usize {
    10
}

fn default_poll_timeout_ms() -> u64 {
    500
}

fn default_max_events() -> usize {
    128
}

fn default_buffer_size() -> usize {
    DEFAULT_BUFFER_SIZE
}

fn default_read_budget() -> usize {
    64 * 1024
}

fn default_max_frame_size() -> usize {
    DEFAULT_MAX_FRAME_SIZE
}

fn default_max_suppressed_input() -> usize {
    1024 * 1024 // 1 MB
}

fn default_sub_request_timeout_secs() -> u64 {
    6
}

fn default_fanout_timeout_ms() -> u64 {
    3000
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub listen: String,
    pub role: Role,
    pub idle_timeout: bool,
    pub max_connections: usize,
    pub backlog: i32,
    pub workers: usize,
    pub tick_ms: u64,
    pub wheel_slots: usize,
    pub poll_timeout_ms: u64,
    pub max_events: usize,
    pub buffer_size: usize,
    pub read_budget: usize,
    pub max_frame_size: usize,
    pub max_suppressed_input: usize,
    pub sub_request_timeout_secs: u64,
    pub upstreams: Vec<String>,
    pub fanout_timeout_ms: u64,
    pub log_level: String,
}

impl Config {
    /// Load configuration from CLI args and optional TOML file.
    pub fn load() -> Result<Self, ConfigError> {
        Self::resolve(CliArgs::parse())
    }

    /// Merge CLI args over the TOML file they name, if any.
    /// CLI arguments take precedence over TOML file values.
    pub fn resolve(cli: CliArgs) -> Result<Self, ConfigError> {
        let toml_config = if let Some(ref config_path) = cli.config {
            let contents = std::fs::read_to_string(config_path)
                .map_err(|e| ConfigError::FileRead(config_path.clone(), e))?;
            toml::from_str(&contents)
                .map_err(|e| ConfigError::TomlParse(config_path.clone(), e))?
        } else {
            TomlConfig::default()
        };

        let mut config = Config::from(toml_config);
        if let Some(listen) = cli.listen {
            config.listen = listen;
        }
        if let Some(workers) = cli.workers {
            config.workers = workers;
        }
        if let Some(role) = cli.role {
            config.role = role;
        }
        if !cli.upstreams.is_empty() {
            config.upstreams = cli.upstreams;
        }
        if let Some(tick_ms) = cli.tick_ms {
            config.tick_ms = tick_ms;
        }
        config.idle_timeout |= cli.idle_timeout;
        if cli.log_level != "info" {
            config.log_level = cli.log_level;
        }
        Ok(config)
    }

    pub fn tick(&self) -> Duration {
        Duration::from_millis(self.tick_ms)
    }

    pub fn poll_timeout(&self) -> Duration {
        Duration::from_millis(self.poll_timeout_ms)
    }

    pub fn sub_request_timeout(&self) -> Duration {
        Duration::from_secs(self.sub_request_timeout_secs)
    }

    pub fn fanout_timeout(&self) -> Duration {
        Duration::from_millis(self.fanout_timeout_ms)
    }
}

impl From<TomlConfig> for Config {
    fn from(toml: TomlConfig) -> Self {
        Config {
            listen: toml.server.listen,
            role: toml.server.role,
            idle_timeout: toml.server.idle_timeout,
            max_connections: toml.server.max_connections,
            backlog: toml.server.backlog,
            workers: toml.runtime.workers,
            tick_ms: toml.runtime.tick_ms,
            wheel_slots: toml.runtime.wheel_slots,
            poll_timeout_ms: toml.runtime.poll_timeout_ms,
            max_events: toml.runtime.max_events,
            buffer_size: toml.runtime.buffer_size,
            read_budget: toml.runtime.read_budget,
            max_frame_size: toml.runtime.max_frame_size,
            max_suppressed_input: toml.runtime.max_suppressed_input,
            sub_request_timeout_secs: toml.connector.sub_request_timeout_secs,
            upstreams: toml.connector.upstreams,
            fanout_timeout_ms: toml.connector.fanout_timeout_ms,
            log_level: toml.logging.level,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Config::from(TomlConfig::default())
    }
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file '{}': {}", .0.display(), .1)]
    FileRead(PathBuf, #[source] std::io::Error),

    #[error("Failed to parse config file '{}': {}", .0.display(), .1)]
    TomlParse(PathBuf, #[source] toml::de::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.listen, "127.0.0.1:10007");
        assert_eq!(config.role, Role::Echo);
        assert_eq!(config.workers, 2);
        assert_eq!(config.tick(), Duration::from_secs(1));
        assert_eq!(config.wheel_slots, 10);
        assert_eq!(config.poll_timeout(), Duration::from_millis(500));
        assert_eq!(config.buffer_size, 1024);
        assert_eq!(config.sub_request_timeout(), Duration::from_secs(6));
        assert!(!config.idle_timeout);
        assert!(config.upstreams.is_empty());
    }

    #[test]
    fn test_toml_parsing() {
        let toml_str = r#"
            [server]
            listen = "0.0.0.0:9000"
            role = "fanout"
            idle_timeout = true

            [runtime]
            workers = 4
            tick_ms = 250

            [connector]
            sub_request_timeout_secs = 2
            upstreams = ["127.0.0.1:9001", "127.0.0.1:9002"]

            [logging]
            level = "debug"
        "#;

        let config: TomlConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.server.listen, "0.0.0.0:9000");
        assert_eq!(config.server.role, Role::Fanout);
        assert!(config.server.idle_timeout);
        assert_eq!(config.runtime.workers, 4);
        assert_eq!(config.runtime.tick_ms, 250);
        assert_eq!(config.runtime.wheel_slots, 10);
        assert_eq!(config.connector.sub_request_timeout_secs, 2);
        assert_eq!(config.connector.upstreams.len(), 2);
        assert_eq!(config.logging.level, "debug");
    }

    #[test]
    fn test_cli_overrides_toml() {
        let dir = std::env::temp_dir().join(format!("meshwire-config-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("server.toml");
        std::fs::write(
            &path,
            "[server]\nlisten = \"127.0.0.1:9000\"\nrole = \"silent\"\n[runtime]\nworkers = 8\n",
        )
        .unwrap();

        let cli = CliArgs::parse_from([
            "meshwire",
            "--config",
            path.to_str().unwrap(),
            "--role",
            "responder",
            "--upstream",
            "127.0.0.1:1",
            "--upstream",
            "127.0.0.1:2",
        ]);
        let config = Config::resolve(cli).unwrap();
        assert_eq!(config.listen, "127.0.0.1:9000");
        assert_eq!(config.role, Role::Responder);
        assert_eq!(config.workers, 8);
        assert_eq!(config.upstreams, vec!["127.0.0.1:1", "127.0.0.1:2"]);

        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_missing_config_file() {
        let cli = CliArgs::parse_from(["meshwire", "--config", "/nonexistent/meshwire.toml"]);
        assert!(matches!(
            Config::resolve(cli),
            Err(ConfigError::FileRead(_, _))
        ));
    }
}
