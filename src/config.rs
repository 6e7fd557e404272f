//! Configuration module for the dualkv server.
//!
//! Supports both command-line arguments and TOML configuration file.
//! CLI arguments take precedence over config file values.

use clap::{Parser, ValueEnum};
use serde::Deserialize;
use std::io;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Concurrency architecture used to serve connections.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum Architecture {
    /// Single thread multiplexing every connection with mio.
    EventLoop,
    /// One worker thread per connection sharing a locked store.
    Threaded,
}

/// Command-line arguments for the server
#[derive(Parser, Debug, Default)]
#[command(name = "dualkv")]
#[command(version)]
#[command(about = "An in-memory key-value server", long_about = None)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Host to bind to
    #[arg(long)]
    pub host: Option<String>,

    /// Port to listen on
    #[arg(short, long)]
    pub port: Option<u16>,

    /// Concurrency architecture
    #[arg(short, long, value_enum)]
    pub architecture: Option<Architecture>,

    /// Maximum number of concurrent connections
    #[arg(long)]
    pub max_connections: Option<usize>,

    /// Run the interactive client against this address instead of serving
    #[arg(long, value_name = "ADDR")]
    pub connect: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long)]
    pub log_level: Option<String>,
}

/// TOML configuration file structure
#[derive(Debug, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub runtime: RuntimeConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Server-related configuration
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_architecture")]
    pub architecture: Architecture,
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            architecture: default_architecture(),
            max_connections: default_max_connections(),
        }
    }
}

/// I/O tuning shared by both runtimes
#[derive(Debug, Deserialize)]
pub struct RuntimeConfig {
    /// Bytes read from a socket per call
    #[serde(default = "default_read_chunk_size")]
    pub read_chunk_size: usize,
    /// Initial capacity of each connection buffer
    #[serde(default = "default_initial_buffer_size")]
    pub initial_buffer_size: usize,
    /// Readiness events collected per poll (event loop)
    #[serde(default = "default_max_events")]
    pub max_events: usize,
    /// Read timeout before a worker rechecks for shutdown (threaded)
    #[serde(default = "default_idle_timeout_ms")]
    pub idle_timeout_ms: u64,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            read_chunk_size: default_read_chunk_size(),
            initial_buffer_size: default_initial_buffer_size(),
            max_events: default_max_events(),
            idle_timeout_ms: default_idle_timeout_ms(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Deserialize)]
pub struct LoggingConfig {
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

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    1234
}

fn default_architecture() -> Architecture {
    Architecture::EventLoop
}

fn default_max_connections() -> usize {
    1024
}

fn default_read_chunk_size() -> usize {
    64 * 1024
}

fn default_initial_buffer_size() -> usize {
    256
}

fn default_max_events() -> usize {
    1024
}

fn default_idle_timeout_ms() -> u64 {
    100
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub architecture: Architecture,
    pub max_connections: usize,
    pub read_chunk_size: usize,
    pub initial_buffer_size: usize,
    pub max_events: usize,
    pub idle_timeout: Duration,
    pub connect: Option<String>,
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Config::merge(CliArgs::default(), TomlConfig::default())
    }
}

impl Config {
    /// Load configuration from CLI args and optional TOML file.
    /// CLI arguments take precedence over TOML file values.
    pub fn load() -> Result<Self, ConfigError> {
        let cli = CliArgs::parse();

        let toml_config = if let Some(ref config_path) = cli.config {
            let contents = std::fs::read_to_string(config_path)
                .map_err(|e| ConfigError::FileRead(config_path.clone(), e))?;
            toml::from_str(&contents)
                .map_err(|e| ConfigError::TomlParse(config_path.clone(), e))?
        } else {
            TomlConfig::default()
        };

        Ok(Config::merge(cli, toml_config))
    }

    fn merge(cli: CliArgs, toml_config: TomlConfig) -> Self {
        Config {
            host: cli.host.unwrap_or(toml_config.server.host),
            port: cli.port.unwrap_or(toml_config.server.port),
            architecture: cli
                .architecture
                .unwrap_or(toml_config.server.architecture),
            max_connections: cli
                .max_connections
                .unwrap_or(toml_config.server.max_connections),
            read_chunk_size: toml_config.runtime.read_chunk_size.max(1),
            initial_buffer_size: toml_config.runtime.initial_buffer_size,
            max_events: toml_config.runtime.max_events.max(1),
            idle_timeout: Duration::from_millis(toml_config.runtime.idle_timeout_ms.max(1)),
            connect: cli.connect,
            log_level: cli.log_level.unwrap_or(toml_config.logging.level),
        }
    }

    /// Socket address to bind.
    pub fn listen_addr(&self) -> io::Result<SocketAddr> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))
    }
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file '{}': {}", .0.display(), .1)]
    FileRead(PathBuf, #[source] io::Error),

    #[error("Failed to parse config file '{}': {}", .0.display(), .1)]
    TomlParse(PathBuf, #[source] toml::de::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.host, "0.0.0.0");
        assert_eq!(config.port, 1234);
        assert_eq!(config.architecture, Architecture::EventLoop);
        assert_eq!(config.read_chunk_size, 64 * 1024);
        assert_eq!(config.initial_buffer_size, 256);
        assert_eq!(config.idle_timeout, Duration::from_millis(100));
        assert_eq!(config.log_level, "info");
        assert!(config.connect.is_none());
    }

    #[test]
    fn test_toml_parsing() {
        let toml_str = r#"
            [server]
            host = "127.0.0.1"
            port = 7000
            architecture = "threaded"
            max_connections = 16

            [runtime]
            read_chunk_size = 4096
            idle_timeout_ms = 5

            [logging]
            level = "debug"
        "#;

        let toml_config: TomlConfig = toml::from_str(toml_str).unwrap();
        let config = Config::merge(CliArgs::default(), toml_config);
        assert_eq!(config.host, "127.0.0.1");
        assert_eq!(config.port, 7000);
        assert_eq!(config.architecture, Architecture::Threaded);
        assert_eq!(config.max_connections, 16);
        assert_eq!(config.read_chunk_size, 4096);
        assert_eq!(config.initial_buffer_size, 256);
        assert_eq!(config.idle_timeout, Duration::from_millis(5));
        assert_eq!(config.log_level, "debug");
    }

    #[test]
    fn test_cli_overrides_toml() {
        let toml_config: TomlConfig = toml::from_str(
            r#"
            [server]
            port = 7000
            architecture = "threaded"
        "#,
        )
        .unwrap();

        let cli = CliArgs::parse_from(["dualkv", "--port", "9000", "-a", "event-loop"]);
        let config = Config::merge(cli, toml_config);
        assert_eq!(config.port, 9000);
        assert_eq!(config.architecture, Architecture::EventLoop);
    }

    #[test]
    fn test_listen_addr() {
        let config = Config {
            host: "127.0.0.1".to_string(),
            port: 4000,
            ..Config::default()
        };
        assert_eq!(config.listen_addr().unwrap(), "127.0.0.1:4000".parse::<SocketAddr>().unwrap());

        let bad = Config {
            host: "not a host".to_string(),
            ..Config::default()
        };
        assert_eq!(
            bad.listen_addr().unwrap_err().kind(),
            io::ErrorKind::InvalidInput
        );
    }
}
