//! Configuration for the collectd exporter.

use collectd_common::LoggingConfig;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::naming::is_valid_metric_name;

/// Routes served regardless of configuration.
const RESERVED_PATHS: [&str; 3] = ["/", "/health", "/ready"];

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error(transparent)]
    Load(#[from] collectd_common::Error),
    #[error("Validation error: {0}")]
    Validation(String),
}

/// Complete exporter configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExporterConfig {
    /// HTTP endpoint settings.
    #[serde(default)]
    pub web: WebConfig,

    /// collectd binary network protocol listener settings.
    #[serde(default)]
    pub collectd: CollectdConfig,

    /// Metric store settings.
    #[serde(default)]
    pub store: StoreConfig,

    /// Metric naming and labelling settings.
    #[serde(default)]
    pub exporter: NamingConfig,

    /// Logging configuration.
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// HTTP endpoint configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebConfig {
    /// Address to listen on (default: "0.0.0.0:9103").
    #[serde(default = "default_listen")]
    pub listen: String,

    /// Path for the scrape endpoint (default: "/metrics").
    #[serde(default = "default_metrics_path")]
    pub metrics_path: String,

    /// Path accepting collectd `write_http` JSON pushes (default:
    /// "/collectd-post"). An empty string disables push ingestion.
    #[serde(default = "default_push_path")]
    pub push_path: String,
}

fn default_listen() -> String {
    "0.0.0.0:9103".to_string()
}

fn default_metrics_path() -> String {
    "/metrics".to_string()
}

fn default_push_path() -> String {
    "/collectd-post".to_string()
}

impl Default for WebConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            metrics_path: default_metrics_path(),
            push_path: default_push_path(),
        }
    }
}

/// Binary protocol listener configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollectdConfig {
    /// UDP address for binary packets, e.g. "0.0.0.0:25826" or a multicast
    /// group such as "239.192.74.66:25826". Unset disables the listener.
    #[serde(default)]
    pub listen: Option<String>,

    /// Socket receive buffer size in bytes (0 keeps the OS default).
    #[serde(default)]
    pub udp_buffer: usize,

    /// Largest datagram accepted.
    #[serde(default = "default_max_packet_size")]
    pub max_packet_size: usize,

    /// Decoded packets buffered between the socket reader and the store writer.
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,

    /// Optional collectd `types.db` file supplying data-source names.
    #[serde(default)]
    pub typesdb_file: Option<PathBuf>,
}

fn default_max_packet_size() -> usize {
    1452
}

fn default_channel_capacity() -> usize {
    1024
}

impl Default for CollectdConfig {
    fn default() -> Self {
        Self {
            listen: None,
            udp_buffer: 0,
            max_packet_size: default_max_packet_size(),
            channel_capacity: default_channel_capacity(),
            typesdb_file: None,
        }
    }
}

/// Store expiry and capacity configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// How often expired entries are evicted (seconds).
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,

    /// Maximum number of identities held; new identities are rejected once
    /// reached. Unset means unbounded.
    #[serde(default)]
    pub max_entries: Option<usize>,
}

fn default_sweep_interval() -> u64 {
    60 // 1 minute
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            sweep_interval_secs: default_sweep_interval(),
            max_entries: None,
        }
    }
}

/// Metric naming configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NamingConfig {
    /// Metric name prefix (default: "collectd").
    #[serde(default = "default_prefix")]
    pub prefix: String,

    /// Labels added to every exported sample value. Derived labels win on
    /// conflict.
    #[serde(default)]
    pub default_labels: HashMap<String, String>,
}

fn default_prefix() -> String {
    "collectd".to_string()
}

impl Default for NamingConfig {
    fn default() -> Self {
        Self {
            prefix: default_prefix(),
            default_labels: HashMap::new(),
        }
    }
}

impl ExporterConfig {
    /// Load configuration from a JSON5 file.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let config: ExporterConfig = collectd_common::load_config(path)?;
        config.validate()?;
        Ok(config)
    }

    /// Parse configuration from a JSON5 string.
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let config: ExporterConfig = collectd_common::parse_config(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.web.listen.parse::<std::net::SocketAddr>().is_err() {
            return Err(ConfigError::Validation(format!(
                "Invalid listen address: {}",
                self.web.listen
            )));
        }

        if !self.web.metrics_path.starts_with('/') {
            return Err(ConfigError::Validation(
                "Metrics path must start with /".to_string(),
            ));
        }

        if !self.web.push_path.is_empty() {
            if !self.web.push_path.starts_with('/') {
                return Err(ConfigError::Validation(
                    "Push path must start with /".to_string(),
                ));
            }
            if self.web.push_path == self.web.metrics_path {
                return Err(ConfigError::Validation(
                    "Push path and metrics path must differ".to_string(),
                ));
            }
        }

        for path in [&self.web.metrics_path, &self.web.push_path] {
            if RESERVED_PATHS.contains(&path.as_str()) {
                return Err(ConfigError::Validation(format!(
                    "Path {} is reserved",
                    path
                )));
            }
        }

        if let Some(listen) = &self.collectd.listen
            && listen.parse::<std::net::SocketAddr>().is_err()
        {
            return Err(ConfigError::Validation(format!(
                "Invalid collectd listen address: {}",
                listen
            )));
        }

        if self.collectd.max_packet_size == 0 {
            return Err(ConfigError::Validation(
                "max_packet_size must be > 0".to_string(),
            ));
        }

        if self.collectd.channel_capacity == 0 {
            return Err(ConfigError::Validation(
                "channel_capacity must be > 0".to_string(),
            ));
        }

        if self.store.sweep_interval_secs == 0 {
            return Err(ConfigError::Validation(
                "sweep_interval_secs must be > 0".to_string(),
            ));
        }

        if self.store.max_entries == Some(0) {
            return Err(ConfigError::Validation(
                "max_entries must be > 0 when set".to_string(),
            ));
        }

        if !is_valid_metric_name(&self.exporter.prefix) {
            return Err(ConfigError::Validation(format!(
                "Metric prefix {:?} must match [a-zA-Z_:][a-zA-Z0-9_:]*",
                self.exporter.prefix
            )));
        }

        Ok(())
    }
}
