//! Configuration Module
//!
//! Provides TOML-based configuration for Matchfeed with support for:
//! - Server settings (bind address, WebSocket path)
//! - Connection and message limits
//! - Liveness probing
//! - Admission control
//! - Prometheus metrics
//! - Environment variable overrides (MATCHFEED__* prefix)

use std::net::{Ipv4Addr, SocketAddr};
use std::path::Path;
use std::sync::OnceLock;
use std::time::Duration;

use config::{Environment, File, FileFormat};
use regex::Regex;
use serde::Deserialize;

use crate::admission::AdmissionConfig;


/// Substitute environment variables in a string.
/// Supports `${VAR}` and `${VAR:-default}` syntax.
fn substitute_env_vars(content: &str) -> String {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    let Some(re) = PATTERN
        .get_or_init(|| Regex::new(r"\$\{([^}:]+)(?::-([^}]*))?\}").ok())
        .as_ref()
    else {
        return content.to_string();
    };

    re.replace_all(content, |caps: &regex::Captures| {
        let default = caps.get(2).map_or("", |m| m.as_str());
        std::env::var(&caps[1]).unwrap_or_else(|_| default.to_string())
    })
    .into_owned()
}

/// Configuration error types
#[derive(Debug)]
pub enum ConfigError {
    /// IO error reading config file
    Io(std::io::Error),
    /// TOML parsing error
    Parse(toml::de::Error),
    /// Config crate error
    Config(config::ConfigError),
    /// Validation error
    Validation(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "IO error: {}", e),
            ConfigError::Parse(e) => write!(f, "Parse error: {}", e),
            ConfigError::Config(e) => write!(f, "Config error: {}", e),
            ConfigError::Validation(msg) => write!(f, "Validation error: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<std::io::Error> for ConfigError {
    fn from(e: std::io::Error) -> Self {
        ConfigError::Io(e)
    }
}

impl From<toml::de::Error> for ConfigError {
    fn from(e: toml::de::Error) -> Self {
        ConfigError::Parse(e)
    }
}

impl From<config::ConfigError> for ConfigError {
    fn from(e: config::ConfigError) -> Self {
        ConfigError::Config(e)
    }
}

/// Root configuration structure
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub log: LogConfig,
    pub server: ServerConfig,
    pub limits: LimitsConfig,
    pub liveness: LivenessConfig,
    pub admission: AdmissionConfig,
    pub metrics: MetricsConfig,
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Log level: error, warn, info, debug, trace
    pub level: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

/// Server configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// HTTP bind address
    pub bind: SocketAddr,
    /// Path that accepts WebSocket upgrades
    pub ws_path: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from((Ipv4Addr::UNSPECIFIED, 8080)),
            ws_path: "/ws".to_string(),
        }
    }
}

/// Connection and message limits
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LimitsConfig {
    /// Maximum number of registered connections (0 = unlimited)
    pub max_connections: usize,
    /// Maximum inbound WebSocket message size in bytes
    pub max_message_size: usize,
    /// Per-connection outbound queue capacity.
    /// A connection whose queue is full when a message is delivered is
    /// considered too slow and is terminated.
    pub outbound_queue_capacity: usize,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_connections: 10_000,
            max_message_size: 1024 * 1024,
            outbound_queue_capacity: 1024,
        }
    }
}

/// Liveness probing
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LivenessConfig {
    /// Interval between probes (e.g., "30s")
    #[serde(with = "humantime_serde")]
    pub ping_interval: Duration,
}

impl Default for LivenessConfig {
    fn default() -> Self {
        Self {
            ping_interval: Duration::from_secs(30),
        }
    }
}

/// Metrics configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    /// Whether metrics are enabled
    pub enabled: bool,
    /// HTTP bind address for metrics endpoint
    pub bind: SocketAddr,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            bind: SocketAddr::from((Ipv4Addr::UNSPECIFIED, 9090)),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file with environment variable overrides.
    ///
    /// Supports two forms of environment variable usage:
    /// 1. In-file substitution: `${VAR}` or `${VAR:-default}` syntax in the TOML file
    /// 2. Override via env vars: `MATCHFEED__` prefix with double underscores for nesting:
    ///    - `MATCHFEED__SERVER__BIND=0.0.0.0:8081` overrides `server.bind`
    ///    - `MATCHFEED__LIVENESS__PING_INTERVAL=10s` overrides `liveness.ping_interval`
    ///    - `MATCHFEED__ADMISSION__MODE=dry_run` overrides `admission.mode`
    ///
    /// A missing file is not an error; defaults and env overrides apply.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let mut builder = config::Config::builder()
            .set_default("log.level", "info")?
            .set_default("server.bind", "0.0.0.0:8080")?
            .set_default("server.ws_path", "/ws")?
            .set_default("limits.max_connections", 10_000)?
            .set_default("limits.max_message_size", 1024 * 1024)?
            .set_default("limits.outbound_queue_capacity", 1024)?
            .set_default("liveness.ping_interval", "30s")?
            .set_default("admission.enabled", true)?
            .set_default("admission.mode", "live")?
            .set_default("metrics.enabled", false)?;

        let path = path.as_ref();
        match std::fs::read_to_string(path) {
            Ok(content) => {
                let substituted = substitute_env_vars(&content);
                builder = builder.add_source(File::from_str(&substituted, FileFormat::Toml));
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(ConfigError::Io(e)),
        }

        // Double underscore separates nested keys, single underscore preserved in field names
        let cfg = builder
            .add_source(
                Environment::with_prefix("MATCHFEED")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: Config = cfg.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration with environment variable overrides only (no file).
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::load(Path::new(""))
    }

    /// Parse configuration from a string (no env var support)
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.server.ws_path.starts_with('/') {
            return Err(ConfigError::Validation(format!(
                "server.ws_path must start with '/', got '{}'",
                self.server.ws_path
            )));
        }

        if self.limits.max_message_size == 0 {
            return Err(ConfigError::Validation(
                "limits.max_message_size must be greater than 0".to_string(),
            ));
        }

        if self.limits.outbound_queue_capacity == 0 {
            return Err(ConfigError::Validation(
                "limits.outbound_queue_capacity must be greater than 0".to_string(),
            ));
        }

        if self.liveness.ping_interval.is_zero() {
            return Err(ConfigError::Validation(
                "liveness.ping_interval must be greater than 0".to_string(),
            ));
        }

        if self.admission.enabled {
            if self.admission.window.max == 0 {
                return Err(ConfigError::Validation(
                    "admission.window.max must be greater than 0".to_string(),
                ));
            }
            if self.admission.window.interval.is_zero() {
                return Err(ConfigError::Validation(
                    "admission.window.interval must be greater than 0".to_string(),
                ));
            }
            if self.admission.cleanup_interval.is_zero() {
                return Err(ConfigError::Validation(
                    "admission.cleanup_interval must be greater than 0".to_string(),
                ));
            }
            self.admission
                .check()
                .map_err(|e| ConfigError::Validation(format!("admission: {}", e)))?;
        }

        Ok(())
    }
}
