//! Configuration module for ringproxy.
//!
//! Supports both command-line arguments and TOML configuration file.
//! CLI arguments take precedence over config file values.

use clap::{Args, Parser, Subcommand};
use serde::Deserialize;
use std::net::{SocketAddr, ToSocketAddrs};
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Command-line arguments
#[derive(Parser, Debug)]
#[command(name = "ringproxy")]
#[command(author = "ringproxy authors")]
#[command(version = "0.1.0")]
#[command(about = "Ring-buffered TCP relay with traffic harnesses", long_about = None)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true)]
    pub log_level: Option<String>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Relay client connections to an upstream server
    Proxy(ProxyArgs),
    /// Accept connections, discard their bytes and report throughput
    Sink(SinkArgs),
    /// Send bytes to a target for a fixed duration and report throughput
    Load(LoadArgs),
}

#[derive(Args, Debug, Default)]
pub struct ProxyArgs {
    /// Address to accept clients on (e.g., 127.0.0.1:1234)
    #[arg(short = 'l', long)]
    pub listen: Option<String>,

    /// Upstream server address (e.g., 127.0.0.1:5678)
    #[arg(short = 'u', long)]
    pub upstream: Option<String>,

    /// Ring buffer size per direction in bytes
    #[arg(short = 'b', long)]
    pub buffer_size: Option<usize>,

    /// Close relays idle for this many seconds (0 = never)
    #[arg(long)]
    pub idle_timeout: Option<u64>,

    /// Maximum simultaneously active relays
    #[arg(long)]
    pub max_relays: Option<usize>,
}

#[derive(Args, Debug, Default)]
pub struct SinkArgs {
    /// Address to accept clients on
    #[arg(short = 'l', long)]
    pub listen: Option<String>,

    /// Read buffer size in bytes
    #[arg(short = 'b', long)]
    pub buffer_size: Option<usize>,
}

#[derive(Args, Debug, Default)]
pub struct LoadArgs {
    /// Address to send traffic to
    #[arg(short = 't', long)]
    pub target: Option<String>,

    /// Test duration in seconds
    #[arg(short = 'd', long)]
    pub duration: Option<u64>,

    /// Bytes handed to each send call
    #[arg(long)]
    pub chunk_size: Option<usize>,

    /// Seconds between TCP telemetry samples (0 = never)
    #[arg(long)]
    pub sample_interval: Option<u64>,
}

/// TOML configuration file structure
#[derive(Debug, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub proxy: ProxyFileConfig,
    #[serde(default)]
    pub sink: SinkFileConfig,
    #[serde(default)]
    pub load: LoadFileConfig,
    #[serde(default)]
    pub socket: SocketConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Relay-related configuration
#[derive(Debug, Deserialize)]
pub struct ProxyFileConfig {
    #[serde(default = "default_proxy_listen")]
    pub listen: String,
    #[serde(default = "default_upstream")]
    pub upstream: String,
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,
    /// Seconds without traffic before a relay is closed (0 = never)
    #[serde(default)]
    pub idle_timeout: u64,
    /// Upper bound on one reactor wait, in milliseconds
    #[serde(default = "default_poll_timeout_ms")]
    pub poll_timeout_ms: u64,
    #[serde(default = "default_max_relays")]
    pub max_relays: usize,
    /// Readiness events handled per wait
    #[serde(default = "default_events_capacity")]
    pub events_capacity: usize,
}

impl Default for ProxyFileConfig {
    fn default() -> Self {
        Self {
            listen: default_proxy_listen(),
            upstream: default_upstream(),
            buffer_size: default_buffer_size(),
            idle_timeout: 0,
            poll_timeout_ms: default_poll_timeout_ms(),
            max_relays: default_max_relays(),
            events_capacity: default_events_capacity(),
        }
    }
}

/// Sink-related configuration
#[derive(Debug, Deserialize)]
pub struct SinkFileConfig {
    #[serde(default = "default_sink_listen")]
    pub listen: String,
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,
    #[serde(default = "default_poll_timeout_ms")]
    pub poll_timeout_ms: u64,
    #[serde(default = "default_events_capacity")]
    pub events_capacity: usize,
}

impl Default for SinkFileConfig {
    fn default() -> Self {
        Self {
            listen: default_sink_listen(),
            buffer_size: default_buffer_size(),
            poll_timeout_ms: default_poll_timeout_ms(),
            events_capacity: default_events_capacity(),
        }
    }
}

/// Load generator configuration
#[derive(Debug, Deserialize)]
pub struct LoadFileConfig {
    #[serde(default = "default_proxy_listen")]
    pub target: String,
    #[serde(default = "default_duration")]
    pub duration: u64,
    #[serde(default = "default_buffer_size")]
    pub chunk_size: usize,
    #[serde(default = "default_sample_interval")]
    pub sample_interval: u64,
}

impl Default for LoadFileConfig {
    fn default() -> Self {
        Self {
            target: default_proxy_listen(),
            duration: default_duration(),
            chunk_size: default_buffer_size(),
            sample_interval: default_sample_interval(),
        }
    }
}

/// Socket options applied to listeners, accepted and dialed sockets
#[derive(Debug, Clone, Deserialize)]
pub struct SocketConfig {
    #[serde(default = "default_backlog")]
    pub backlog: i32,
    #[serde(default = "default_true")]
    pub reuse_address: bool,
    #[serde(default = "default_true")]
    pub reuse_port: bool,
    #[serde(default = "default_true")]
    pub nodelay: bool,
    /// SO_SNDBUF in bytes (kernel default when unset)
    pub send_buffer_size: Option<usize>,
    /// SO_RCVBUF in bytes (kernel default when unset)
    pub recv_buffer_size: Option<usize>,
}

impl Default for SocketConfig {
    fn default() -> Self {
        Self {
            backlog: default_backlog(),
            reuse_address: true,
            reuse_port: true,
            nodelay: true,
            send_buffer_size: None,
            recv_buffer_size: None,
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

fn default_proxy_listen() -> String {
    "127.0.0.1:1234".to_string()
}

fn default_upstream() -> String {
    "127.0.0.1:5678".to_string()
}

fn default_sink_listen() -> String {
    "127.0.0.1:5201".to_string()
}

fn default_buffer_size() -> usize {
    128 * 1024 // 128 KB
}

fn default_poll_timeout_ms() -> u64 {
    1000
}

fn default_max_relays() -> usize {
    1024
}

fn default_events_capacity() -> usize {
    1024
}

fn default_duration() -> u64 {
    10
}

fn default_sample_interval() -> u64 {
    1
}

fn default_backlog() -> i32 {
    1024
}

fn default_true() -> bool {
    true
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Resolved relay settings
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    pub listen: SocketAddr,
    pub upstream: SocketAddr,
    pub buffer_size: usize,
    pub idle_timeout: Option<Duration>,
    pub poll_timeout: Duration,
    pub max_relays: usize,
    pub events_capacity: usize,
    pub socket: SocketConfig,
}

/// Resolved sink settings
#[derive(Debug, Clone)]
pub struct SinkConfig {
    pub listen: SocketAddr,
    pub buffer_size: usize,
    pub poll_timeout: Duration,
    pub events_capacity: usize,
    pub socket: SocketConfig,
}

/// Resolved load generator settings
#[derive(Debug, Clone)]
pub struct LoadConfig {
    pub target: SocketAddr,
    pub duration: Duration,
    pub chunk_size: usize,
    pub sample_interval: Option<Duration>,
    pub socket: SocketConfig,
}

/// What the process runs
#[derive(Debug, Clone)]
pub enum Mode {
    Proxy(ProxyConfig),
    Sink(SinkConfig),
    Load(LoadConfig),
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub mode: Mode,
    pub log_level: String,
}

impl Config {
    /// Load configuration from CLI args and optional TOML file.
    /// CLI arguments take precedence over TOML file values.
    pub fn load() -> Result<Self, ConfigError> {
        Self::from_cli(CliArgs::parse())
    }

    fn from_cli(cli: CliArgs) -> Result<Self, ConfigError> {
        // Load TOML config if specified
        let toml_config = if let Some(ref config_path) = cli.config {
            let contents =
                std::fs::read_to_string(config_path).map_err(|source| ConfigError::FileRead {
                    path: config_path.clone(),
                    source,
                })?;
            toml::from_str(&contents).map_err(|source| ConfigError::TomlParse {
                path: config_path.clone(),
                source,
            })?
        } else {
            TomlConfig::default()
        };

        Self::merge(cli.command, cli.log_level, toml_config)
    }

    /// Merge CLI args with TOML config (CLI takes precedence)
    pub fn merge(
        command: Command,
        log_level: Option<String>,
        file: TomlConfig,
    ) -> Result<Self, ConfigError> {
        let socket = file.socket;

        let mode = match command {
            Command::Proxy(args) => {
                let proxy = file.proxy;
                let config = ProxyConfig {
                    listen: resolve("listen", &args.listen.unwrap_or(proxy.listen))?,
                    upstream: resolve("upstream", &args.upstream.unwrap_or(proxy.upstream))?,
                    buffer_size: non_zero(
                        "buffer_size",
                        args.buffer_size.unwrap_or(proxy.buffer_size),
                    )?,
                    idle_timeout: seconds(args.idle_timeout.unwrap_or(proxy.idle_timeout)),
                    poll_timeout: millis("poll_timeout_ms", proxy.poll_timeout_ms)?,
                    max_relays: non_zero("max_relays", args.max_relays.unwrap_or(proxy.max_relays))?,
                    events_capacity: non_zero("events_capacity", proxy.events_capacity)?,
                    socket,
                };
                Mode::Proxy(config)
            }
            Command::Sink(args) => {
                let sink = file.sink;
                Mode::Sink(SinkConfig {
                    listen: resolve("listen", &args.listen.unwrap_or(sink.listen))?,
                    buffer_size: non_zero(
                        "buffer_size",
                        args.buffer_size.unwrap_or(sink.buffer_size),
                    )?,
                    poll_timeout: millis("poll_timeout_ms", sink.poll_timeout_ms)?,
                    events_capacity: non_zero("events_capacity", sink.events_capacity)?,
                    socket,
                })
            }
            Command::Load(args) => {
                let load = file.load;
                let duration = args.duration.unwrap_or(load.duration);
                if duration == 0 {
                    return Err(ConfigError::InvalidValue {
                        field: "duration",
                        reason: "must be at least one second".to_string(),
                    });
                }
                Mode::Load(LoadConfig {
                    target: resolve("target", &args.target.unwrap_or(load.target))?,
                    duration: Duration::from_secs(duration),
                    chunk_size: non_zero("chunk_size", args.chunk_size.unwrap_or(load.chunk_size))?,
                    sample_interval: seconds(
                        args.sample_interval.unwrap_or(load.sample_interval),
                    ),
                    socket,
                })
            }
        };

        Ok(Config {
            mode,
            log_level: log_level.unwrap_or(file.logging.level),
        })
    }
}

/// Resolve `host:port`, accepting hostnames as well as literal addresses.
fn resolve(field: &'static str, value: &str) -> Result<SocketAddr, ConfigError> {
    value
        .to_socket_addrs()
        .map_err(|e| ConfigError::InvalidAddress(field, value.to_string(), e.to_string()))?
        .next()
        .ok_or_else(|| {
            ConfigError::InvalidAddress(field, value.to_string(), "no addresses".to_string())
        })
}

fn non_zero(field: &'static str, value: usize) -> Result<usize, ConfigError> {
    if value == 0 {
        return Err(ConfigError::InvalidValue {
            field,
            reason: "must be greater than zero".to_string(),
        });
    }
    Ok(value)
}

/// A wait timeout of zero would turn the reactor loop into a busy spin.
fn millis(field: &'static str, value: u64) -> Result<Duration, ConfigError> {
    if value == 0 {
        return Err(ConfigError::InvalidValue {
            field,
            reason: "must be greater than zero".to_string(),
        });
    }
    Ok(Duration::from_millis(value))
}

fn seconds(value: u64) -> Option<Duration> {
    (value > 0).then(|| Duration::from_secs(value))
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file '{}': {source}", .path.display())]
    FileRead {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse config file '{}': {source}", .path.display())]
    TomlParse {
        path: PathBuf,
        source: toml::de::Error,
    },

    #[error("Invalid {0} address '{1}': {2}")]
    InvalidAddress(&'static str, String, String),

    #[error("Invalid {field}: {reason}")]
    InvalidValue { field: &'static str, reason: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = TomlConfig::default();
        assert_eq!(config.proxy.listen, "127.0.0.1:1234");
        assert_eq!(config.proxy.upstream, "127.0.0.1:5678");
        assert_eq!(config.proxy.buffer_size, 128 * 1024);
        assert_eq!(config.proxy.idle_timeout, 0);
        assert_eq!(config.sink.listen, "127.0.0.1:5201");
        assert_eq!(config.load.duration, 10);
        assert!(config.socket.reuse_port);
        assert_eq!(config.socket.send_buffer_size, None);
    }

    #[test]
    fn test_toml_parsing() {
        let toml_str = r#"
            [proxy]
            listen = "0.0.0.0:9000"
            upstream = "10.0.0.2:5201"
            buffer_size = 65536
            idle_timeout = 30

            [load]
            duration = 5
            sample_interval = 0

            [socket]
            reuse_port = false
            send_buffer_size = 2097152

            [logging]
            level = "debug"
        "#;

        let config: TomlConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.proxy.listen, "0.0.0.0:9000");
        assert_eq!(config.proxy.upstream, "10.0.0.2:5201");
        assert_eq!(config.proxy.buffer_size, 65536);
        assert_eq!(config.proxy.idle_timeout, 30);
        assert_eq!(config.proxy.max_relays, 1024);
        assert_eq!(config.load.duration, 5);
        assert_eq!(config.load.sample_interval, 0);
        assert!(!config.socket.reuse_port);
        assert!(config.socket.reuse_address);
        assert_eq!(config.socket.send_buffer_size, Some(2097152));
        assert_eq!(config.logging.level, "debug");
    }

    #[test]
    fn test_cli_overrides_file() {
        let file: TomlConfig = toml::from_str(
            r#"
            [proxy]
            upstream = "127.0.0.1:7000"
            buffer_size = 4096
            "#,
        )
        .unwrap();

        let args = ProxyArgs {
            buffer_size: Some(8192),
            idle_timeout: Some(15),
            ..Default::default()
        };
        let config = Config::merge(Command::Proxy(args), None, file).unwrap();

        let Mode::Proxy(proxy) = config.mode else {
            panic!("expected proxy mode");
        };
        assert_eq!(proxy.upstream, "127.0.0.1:7000".parse().unwrap());
        assert_eq!(proxy.listen, "127.0.0.1:1234".parse().unwrap());
        assert_eq!(proxy.buffer_size, 8192);
        assert_eq!(proxy.idle_timeout, Some(Duration::from_secs(15)));
        assert_eq!(proxy.poll_timeout, Duration::from_millis(1000));
        assert_eq!(config.log_level, "info");
    }

    #[test]
    fn test_cli_parsing() {
        let cli = CliArgs::try_parse_from([
            "ringproxy",
            "--log-level",
            "debug",
            "load",
            "--target",
            "127.0.0.1:9999",
            "-d",
            "3",
        ])
        .unwrap();
        let config = Config::from_cli(cli).unwrap();

        assert_eq!(config.log_level, "debug");
        let Mode::Load(load) = config.mode else {
            panic!("expected load mode");
        };
        assert_eq!(load.target, "127.0.0.1:9999".parse().unwrap());
        assert_eq!(load.duration, Duration::from_secs(3));
        assert_eq!(load.sample_interval, Some(Duration::from_secs(1)));
    }

    #[test]
    fn test_invalid_values_rejected() {
        let args = ProxyArgs {
            buffer_size: Some(0),
            ..Default::default()
        };
        let err = Config::merge(Command::Proxy(args), None, TomlConfig::default()).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { field: "buffer_size", .. }));

        let args = SinkArgs {
            listen: Some("not an address".to_string()),
            ..Default::default()
        };
        let err = Config::merge(Command::Sink(args), None, TomlConfig::default()).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidAddress("listen", _, _)));

        let file: TomlConfig = toml::from_str("[proxy]\npoll_timeout_ms = 0").unwrap();
        let err = Config::merge(Command::Proxy(ProxyArgs::default()), None, file).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { field: "poll_timeout_ms", .. }));

        let file: TomlConfig = toml::from_str("[sink]\npoll_timeout_ms = 0").unwrap();
        let err = Config::merge(Command::Sink(SinkArgs::default()), None, file).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { field: "poll_timeout_ms", .. }));

        let args = LoadArgs {
            duration: Some(0),
            ..Default::default()
        };
        let err = Config::merge(Command::Load(args), None, TomlConfig::default()).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { field: "duration", .. }));
    }
}
