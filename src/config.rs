//! Configuration module for the NDTP test server.
//!
//! Supports both command-line arguments and TOML configuration file.
//! CLI arguments take precedence over config file values.

use crate::session::SessionConfig;
use clap::{Parser, ValueEnum};
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

/// What the server does besides acknowledging packets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    /// Acknowledge every packet, nothing else.
    #[default]
    Echo,
    /// Also send one control packet when a session's data stream ends.
    Control,
    /// Also aggregate traffic counters and log them periodically.
    Stats,
}

/// Command-line arguments for the test server
#[derive(Parser, Debug)]
#[command(name = "ndtp-test-server")]
#[command(version)]
#[command(about = "NDTP test server for telemetry clients", long_about = None)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Address to listen on: host:port, or a bare port for 127.0.0.1
    #[arg(short = 'l', long)]
    pub listen: Option<String>,

    /// Operating mode
    #[arg(short = 'm', long, value_enum)]
    pub mode: Option<Mode>,

    /// Data packets to accept per connection before closing it
    #[arg(short = 'n', long)]
    pub quota: Option<u64>,

    /// Seconds to wait for data before dropping a connection
    #[arg(long)]
    pub read_timeout: Option<u64>,

    /// Seconds to wait for a reply to be written
    #[arg(long)]
    pub write_timeout: Option<u64>,

    /// Seconds between traffic reports (stats mode)
    #[arg(long)]
    pub report_interval: Option<u64>,

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
    pub session: SessionToml,
    #[serde(default)]
    pub stats: StatsConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Server-related configuration
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    /// Address to listen on
    #[serde(default = "default_listen")]
    pub listen: String,
    #[serde(default)]
    pub mode: Mode,
    /// Per-connection packet quota
    pub quota: Option<u64>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            mode: Mode::default(),
            quota: None,
        }
    }
}

/// Per-connection timeouts and limits
#[derive(Debug, Deserialize)]
pub struct SessionToml {
    #[serde(default = "default_read_timeout")]
    pub read_timeout: u64,
    #[serde(default = "default_write_timeout")]
    pub write_timeout: u64,
    /// Bytes buffered while waiting for a packet to complete
    #[serde(default = "default_max_buffered")]
    pub max_buffered: usize,
}

impl Default for SessionToml {
    fn default() -> Self {
        Self {
            read_timeout: default_read_timeout(),
            write_timeout: default_write_timeout(),
            max_buffered: default_max_buffered(),
        }
    }
}

/// Statistics intervals
#[derive(Debug, Deserialize)]
pub struct StatsConfig {
    /// How often each session flushes its counters
    #[serde(default = "default_collect_interval")]
    pub collect_interval: u64,
    /// How often aggregate totals are logged
    #[serde(default = "default_report_interval")]
    pub report_interval: u64,
}

impl Default for StatsConfig {
    fn default() -> Self {
        Self {
            collect_interval: default_collect_interval(),
            report_interval: default_report_interval(),
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
    "127.0.0.1:9001".to_string()
}

fn default_read_timeout() -> u64 {
    180
}

fn default_write_timeout() -> u64 {
    10
}

fn default_max_buffered() -> usize {
    crate::framer::DEFAULT_MAX_BUFFERED
}

fn default_collect_interval() -> u64 {
    30
}

fn default_report_interval() -> u64 {
    60
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Turn a bare port into a loopback address.
pub fn normalize_listen(listen: &str) -> String {
    if !listen.is_empty() && listen.bytes().all(|b| b.is_ascii_digit()) {
        format!("127.0.0.1:{listen}")
    } else {
        listen.to_string()
    }
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub listen: String,
    pub mode: Mode,
    pub quota: Option<u64>,
    pub read_timeout: Duration,
    pub write_timeout: Duration,
    pub max_buffered: usize,
    pub collect_interval: Duration,
    pub report_interval: Duration,
    pub log_level: String,
}

impl Config {
    /// Load configuration from CLI args and optional TOML file.
    pub fn load() -> Result<Self, ConfigError> {
        Self::resolve(CliArgs::parse())
    }

    /// Merge CLI args over the TOML file named by `--config`, if any.
    pub fn resolve(cli: CliArgs) -> Result<Self, ConfigError> {
        let toml_config = if let Some(ref config_path) = cli.config {
            let contents = std::fs::read_to_string(config_path)
                .map_err(|e| ConfigError::FileRead(config_path.clone(), e))?;
            toml::from_str(&contents)
                .map_err(|e| ConfigError::TomlParse(config_path.clone(), e))?
        } else {
            TomlConfig::default()
        };

        let quota = cli.quota.or(toml_config.server.quota);
        if quota == Some(0) {
            return Err(ConfigError::ZeroQuota);
        }

        let report_interval = cli
            .report_interval
            .unwrap_or(toml_config.stats.report_interval);
        let collect_interval = toml_config.stats.collect_interval;
        if report_interval == 0 || collect_interval == 0 {
            return Err(ConfigError::ZeroInterval);
        }

        Ok(Config {
            listen: normalize_listen(&cli.listen.unwrap_or(toml_config.server.listen)),
            mode: cli.mode.unwrap_or(toml_config.server.mode),
            quota,
            read_timeout: Duration::from_secs(
                cli.read_timeout.unwrap_or(toml_config.session.read_timeout),
            ),
            write_timeout: Duration::from_secs(
                cli.write_timeout
                    .unwrap_or(toml_config.session.write_timeout),
            ),
            max_buffered: toml_config.session.max_buffered,
            collect_interval: Duration::from_secs(collect_interval),
            report_interval: Duration::from_secs(report_interval),
            log_level: cli.log_level.unwrap_or(toml_config.logging.level),
        })
    }

    /// Settings every session is started with.
    pub fn session(&self) -> SessionConfig {
        SessionConfig {
            read_timeout: self.read_timeout,
            write_timeout: self.write_timeout,
            quota: self.quota,
            send_control: self.mode == Mode::Control,
            collect_interval: self.collect_interval,
            max_buffered: self.max_buffered,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        let toml = TomlConfig::default();
        Config {
            listen: toml.server.listen,
            mode: toml.server.mode,
            quota: toml.server.quota,
            read_timeout: Duration::from_secs(toml.session.read_timeout),
            write_timeout: Duration::from_secs(toml.session.write_timeout),
            max_buffered: toml.session.max_buffered,
            collect_interval: Duration::from_secs(toml.stats.collect_interval),
            report_interval: Duration::from_secs(toml.stats.report_interval),
            log_level: toml.logging.level,
        }
    }
}

/// Configuration loading errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file '{path}': {err}", path = .0.display(), err = .1)]
    FileRead(PathBuf, #[source] std::io::Error),
    #[error("Failed to parse config file '{path}': {err}", path = .0.display(), err = .1)]
    TomlParse(PathBuf, #[source] toml::de::Error),
    #[error("Packet quota must be at least 1")]
    ZeroQuota,
    #[error("Stats intervals must be at least 1 second")]
    ZeroInterval,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cli(args: &[&str]) -> CliArgs {
        let mut argv = vec!["ndtp-test-server"];
        argv.extend_from_slice(args);
        CliArgs::try_parse_from(argv).unwrap()
    }

    #[test]
    fn test_default_config() {
        let config = TomlConfig::default();
        assert_eq!(config.server.listen, "127.0.0.1:9001");
        assert_eq!(config.server.mode, Mode::Echo);
        assert_eq!(config.server.quota, None);
        assert_eq!(config.session.read_timeout, 180);
        assert_eq!(config.session.write_timeout, 10);
        assert_eq!(config.stats.collect_interval, 30);
        assert_eq!(config.stats.report_interval, 60);
    }

    #[test]
    fn test_toml_parsing() {
        let toml_str = r#"
            [server]
            listen = "0.0.0.0:9100"
            mode = "stats"
            quota = 50

            [session]
            read_timeout = 30

            [stats]
            collect_interval = 5
            report_interval = 10

            [logging]
            level = "debug"
        "#;

        let config: TomlConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.server.listen, "0.0.0.0:9100");
        assert_eq!(config.server.mode, Mode::Stats);
        assert_eq!(config.server.quota, Some(50));
        assert_eq!(config.session.read_timeout, 30);
        assert_eq!(config.session.write_timeout, 10);
        assert_eq!(config.stats.collect_interval, 5);
        assert_eq!(config.stats.report_interval, 10);
        assert_eq!(config.logging.level, "debug");
    }

    #[test]
    fn test_normalize_listen() {
        assert_eq!(normalize_listen("9001"), "127.0.0.1:9001");
        assert_eq!(normalize_listen("0.0.0.0:9001"), "0.0.0.0:9001");
        assert_eq!(normalize_listen("localhost:7000"), "localhost:7000");
    }

    #[test]
    fn test_cli_overrides() {
        let config = Config::resolve(cli(&["-l", "9002", "-m", "control", "-n", "2"])).unwrap();
        assert_eq!(config.listen, "127.0.0.1:9002");
        assert_eq!(config.mode, Mode::Control);
        assert_eq!(config.quota, Some(2));
        assert_eq!(config.read_timeout, Duration::from_secs(180));

        let session = config.session();
        assert!(session.send_control);
        assert_eq!(session.quota, Some(2));
    }

    #[test]
    fn test_zero_quota_rejected() {
        assert!(matches!(
            Config::resolve(cli(&["--quota", "0"])),
            Err(ConfigError::ZeroQuota)
        ));
    }

    #[test]
    fn test_missing_config_file() {
        let err = Config::resolve(cli(&["-c", "/nonexistent/ndtp.toml"])).unwrap_err();
        assert!(err.to_string().contains("/nonexistent/ndtp.toml"));
    }
}
