//! Configuration module for the node.
//!
//! Supports both command-line arguments and TOML configuration file.
//! CLI arguments take precedence over config file values.

use clap::Parser;
use serde::Deserialize;
use std::net::{SocketAddr, ToSocketAddrs};
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Semaphore;

use crate::connection::{ConnectionOptions, DEFAULT_CLOSE_LINGER, DEFAULT_OUTBOUND_CAPACITY};

/// Command-line arguments for the node
#[derive(Parser, Debug)]
#[command(name = "evolving-node")]
#[command(author = "evolving-node authors")]
#[command(version = "0.1.0")]
#[command(about = "A TCP RPC and service-discovery node", long_about = None)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Host or IP address to bind to
    #[arg(short = 'H', long)]
    pub host: Option<String>,

    /// Port to bind to
    #[arg(short, long)]
    pub port: Option<u16>,

    /// Maximum number of concurrent connections
    #[arg(long)]
    pub max_connections: Option<usize>,

    /// Number of worker threads (defaults to number of CPU cores)
    #[arg(short = 'w', long)]
    pub workers: Option<usize>,

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
    pub logging: LoggingConfig,
}

/// Server-related configuration
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    /// Host to bind to
    #[serde(default = "default_host")]
    pub host: String,
    /// Port to bind to
    #[serde(default = "default_port")]
    pub port: u16,
    /// Maximum number of concurrent connections
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    /// Outbound queue capacity per connection
    #[serde(default = "default_outbound_capacity")]
    pub outbound_capacity: usize,
    /// Deadline for a single frame write in milliseconds (0 = none)
    #[serde(default)]
    pub write_timeout_ms: u64,
    /// Close connections idle for this many milliseconds (0 = never)
    #[serde(default)]
    pub idle_timeout_ms: u64,
    /// How long a closed connection may keep flushing queued replies
    #[serde(default = "default_close_linger_ms")]
    pub close_linger_ms: u64,
    /// Number of worker threads
    pub workers: Option<usize>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            max_connections: default_max_connections(),
            outbound_capacity: default_outbound_capacity(),
            write_timeout_ms: 0,
            idle_timeout_ms: 0,
            close_linger_ms: default_close_linger_ms(),
            workers: None,
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

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    7600
}

fn default_max_connections() -> usize {
    10000
}

fn default_outbound_capacity() -> usize {
    DEFAULT_OUTBOUND_CAPACITY
}

fn default_close_linger_ms() -> u64 {
    DEFAULT_CLOSE_LINGER.as_millis() as u64
}

fn default_log_level() -> String {
    "info".to_string()
}

fn millis(ms: u64) -> Option<Duration> {
    (ms > 0).then(|| Duration::from_millis(ms))
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub max_connections: usize,
    pub outbound_capacity: usize,
    pub write_timeout: Option<Duration>,
    pub idle_timeout: Option<Duration>,
    pub close_linger: Duration,
    pub workers: Option<usize>,
    pub log_level: String,
}

impl Config {
    /// Load configuration from CLI args and optional TOML file.
    /// CLI arguments take precedence over TOML file values.
    pub fn load() -> Result<Self, ConfigError> {
        let cli = CliArgs::parse();

        // Load TOML config if specified
        let toml_config = if let Some(ref config_path) = cli.config {
            let contents = std::fs::read_to_string(config_path)
                .map_err(|e| ConfigError::FileRead(config_path.clone(), e))?;
            toml::from_str(&contents)
                .map_err(|e| ConfigError::TomlParse(config_path.clone(), e))?
        } else {
            TomlConfig::default()
        };

        Self::merge(cli, toml_config)
    }

    /// Combine CLI args with file values (CLI takes precedence).
    fn merge(cli: CliArgs, toml_config: TomlConfig) -> Result<Self, ConfigError> {
        let server = toml_config.server;
        let config = Config {
            host: cli.host.unwrap_or(server.host),
            port: cli.port.unwrap_or(server.port),
            max_connections: cli.max_connections.unwrap_or(server.max_connections),
            outbound_capacity: server.outbound_capacity,
            write_timeout: millis(server.write_timeout_ms),
            idle_timeout: millis(server.idle_timeout_ms),
            close_linger: Duration::from_millis(server.close_linger_ms),
            workers: cli.workers.or(server.workers),
            log_level: if cli.log_level != "info" {
                cli.log_level
            } else {
                toml_config.logging.level
            },
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.max_connections == 0 {
            return Err(ConfigError::Invalid("max_connections must be at least 1"));
        }
        if self.max_connections > Semaphore::MAX_PERMITS {
            return Err(ConfigError::Invalid("max_connections is too large"));
        }
        if self.outbound_capacity == 0 {
            return Err(ConfigError::Invalid("outbound_capacity must be at least 1"));
        }
        if self.workers == Some(0) {
            return Err(ConfigError::Invalid("workers must be at least 1"));
        }
        Ok(())
    }

    /// `host:port` as configured, for logging.
    pub fn listen_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Resolve the configured host and port to a socket address.
    pub fn bind_addr(&self) -> std::io::Result<SocketAddr> {
        (self.host.as_str(), self.port)
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| {
                std::io::Error::new(
                    std::io::ErrorKind::AddrNotAvailable,
                    format!("no address found for {}", self.host),
                )
            })
    }

    /// Per-connection settings derived from this configuration.
    pub fn connection_options(&self) -> ConnectionOptions {
        ConnectionOptions {
            outbound_capacity: self.outbound_capacity,
            write_timeout: self.write_timeout,
            close_linger: self.close_linger,
        }
    }
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file '{}': {}", .0.display(), .1)]
    FileRead(PathBuf, std::io::Error),
    #[error("Failed to parse config file '{}': {}", .0.display(), .1)]
    TomlParse(PathBuf, toml::de::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(&'static str),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cli(args: &[&str]) -> CliArgs {
        let mut argv = vec!["evolving-node"];
        argv.extend_from_slice(args);
        CliArgs::parse_from(argv)
    }

    #[test]
    fn test_default_config() {
        let config = TomlConfig::default();
        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.server.port, 7600);
        assert_eq!(config.server.outbound_capacity, 1024);
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_toml_parsing() {
        let toml_str = r#"
            [server]
            host = "0.0.0.0"
            port = 9100
            workers = 4
            write_timeout_ms = 2500

            [logging]
            level = "debug"
        "#;

        let config: TomlConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.server.host, "0.0.0.0");
        assert_eq!(config.server.port, 9100);
        assert_eq!(config.server.workers, Some(4));
        assert_eq!(config.server.write_timeout_ms, 2500);
        assert_eq!(config.server.idle_timeout_ms, 0);
        assert_eq!(config.logging.level, "debug");
    }

    #[test]
    fn test_cli_overrides_file() {
        let file: TomlConfig = toml::from_str(
            r#"
            [server]
            host = "0.0.0.0"
            port = 9100

            [logging]
            level = "warn"
        "#,
        )
        .unwrap();

        let config = Config::merge(cli(&["--port", "9200", "--log-level", "trace"]), file).unwrap();
        assert_eq!(config.host, "0.0.0.0");
        assert_eq!(config.port, 9200);
        assert_eq!(config.log_level, "trace");
    }

    #[test]
    fn test_file_log_level_used_when_cli_default() {
        let file: TomlConfig = toml::from_str("[logging]\nlevel = \"debug\"").unwrap();
        let config = Config::merge(cli(&[]), file).unwrap();
        assert_eq!(config.log_level, "debug");
    }

    #[test]
    fn test_timeouts_zero_means_disabled() {
        let file: TomlConfig = toml::from_str("[server]\nidle_timeout_ms = 30000").unwrap();
        let config = Config::merge(cli(&[]), file).unwrap();
        assert_eq!(config.write_timeout, None);
        assert_eq!(config.idle_timeout, Some(Duration::from_secs(30)));
        assert_eq!(config.connection_options().write_timeout, None);
    }

    #[test]
    fn test_invalid_values_rejected() {
        let file: TomlConfig = toml::from_str("[server]\noutbound_capacity = 0").unwrap();
        assert!(matches!(
            Config::merge(cli(&[]), file),
            Err(ConfigError::Invalid(_))
        ));
        assert!(matches!(
            Config::merge(cli(&["--max-connections", "0"]), TomlConfig::default()),
            Err(ConfigError::Invalid(_))
        ));
    }

    #[test]
    fn test_max_connections_capped() {
        let too_many = (Semaphore::MAX_PERMITS + 1).to_string();
        assert!(matches!(
            Config::merge(cli(&["--max-connections", too_many.as_str()]), TomlConfig::default()),
            Err(ConfigError::Invalid(_))
        ));

        let most = Semaphore::MAX_PERMITS.to_string();
        let config = Config::merge(cli(&["--max-connections", most.as_str()]), TomlConfig::default())
            .unwrap();
        assert_eq!(config.max_connections, Semaphore::MAX_PERMITS);
    }

    #[test]
    fn test_close_linger() {
        let config = Config::merge(cli(&[]), TomlConfig::default()).unwrap();
        assert_eq!(config.close_linger, Duration::from_secs(1));

        let file: TomlConfig = toml::from_str("[server]\nclose_linger_ms = 250").unwrap();
        let config = Config::merge(cli(&[]), file).unwrap();
        assert_eq!(config.connection_options().close_linger, Duration::from_millis(250));
    }

    #[test]
    fn test_bind_addr() {
        let config = Config::merge(cli(&["-H", "127.0.0.1", "-p", "7601"]), TomlConfig::default())
            .unwrap();
        assert_eq!(
            config.bind_addr().unwrap(),
            "127.0.0.1:7601".parse::<SocketAddr>().unwrap()
        );
        assert_eq!(config.listen_address(), "127.0.0.1:7601");
    }
}
