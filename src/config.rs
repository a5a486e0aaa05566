use std::{path::PathBuf, time::Duration};

use serde::{Deserialize, Deserializer, de::Error as _};
use tracing::trace;

use crate::{
    collector::{CollectorConfig, MetricFamily},
    error::ConfigurationError,
    history::HistoryConfig,
    monitors::{DEFAULT_RETENTION, threshold::ThresholdConfig},
    notify::ProviderConfig,
    util,
};

/// Accepts a non-negative number of seconds, fractions allowed
fn deserialize_secs<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    let secs = f64::deserialize(deserializer)?;
    Duration::try_from_secs_f64(secs)
        .map_err(|_| D::Error::custom(format!("invalid duration of {secs} seconds")))
}

fn default_sweep_interval() -> Duration {
    Duration::from_secs(5)
}

fn default_stale_threshold() -> Duration {
    Duration::from_secs(60)
}

fn default_drain_timeout() -> Duration {
    Duration::from_secs(5)
}

fn default_query_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_write_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_provider_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_max_protocol_errors() -> u32 {
    5
}

fn default_retention() -> usize {
    DEFAULT_RETENTION
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    #[serde(default = "util::get_default_host")]
    pub host: String,
    #[serde(default = "default_api_port")]
    pub port: u16,
    /// Require `Authorization: Bearer <token>` on every request
    #[serde(default)]
    pub auth_token: Option<String>,
    #[serde(default = "default_enable_cors")]
    pub enable_cors: bool,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            host: util::get_default_host(),
            port: default_api_port(),
            auth_token: None,
            enable_cors: default_enable_cors(),
        }
    }
}

impl ApiConfig {
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

fn default_enable_cors() -> bool {
    true
}

fn default_api_port() -> u16 {
    8080
}

#[derive(Debug, Clone, Deserialize)]
pub struct CoordinatorConfig {
    #[serde(default = "util::get_default_host")]
    pub host: String,
    #[serde(default = "util::get_coordinator_port")]
    pub port: u16,
    #[serde(default = "default_sweep_interval", deserialize_with = "deserialize_secs")]
    pub sweep_interval: Duration,
    /// Nodes without a heartbeat for longer than this are evicted
    #[serde(default = "default_stale_threshold", deserialize_with = "deserialize_secs")]
    pub stale_threshold: Duration,
    #[serde(default = "default_drain_timeout", deserialize_with = "deserialize_secs")]
    pub drain_timeout: Duration,
    #[serde(default = "default_query_timeout", deserialize_with = "deserialize_secs")]
    pub query_timeout: Duration,
    /// Upper bound for writing one frame to a node; a node that stops reading is dropped
    #[serde(default = "default_write_timeout", deserialize_with = "deserialize_secs")]
    pub write_timeout: Duration,
    /// Consecutive undecodable messages after which a connection is dropped
    #[serde(default = "default_max_protocol_errors")]
    pub max_protocol_errors: u32,
    #[serde(default = "default_retention")]
    pub retention: usize,
    /// Send every aggregated alert back to the nodes it concerns
    #[serde(default)]
    pub push_alerts_to_nodes: bool,
    #[serde(default)]
    pub thresholds: Vec<ThresholdConfig>,
    #[serde(default)]
    pub providers: Vec<ProviderConfig>,
    #[serde(default = "default_provider_timeout", deserialize_with = "deserialize_secs")]
    pub provider_timeout: Duration,
    pub history: Option<HistoryConfig>,
    pub api: Option<ApiConfig>,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            host: util::get_default_host(),
            port: util::get_coordinator_port(),
            sweep_interval: default_sweep_interval(),
            stale_threshold: default_stale_threshold(),
            drain_timeout: default_drain_timeout(),
            query_timeout: default_query_timeout(),
            write_timeout: default_write_timeout(),
            max_protocol_errors: default_max_protocol_errors(),
            retention: default_retention(),
            push_alerts_to_nodes: false,
            thresholds: Vec::new(),
            providers: Vec::new(),
            provider_timeout: default_provider_timeout(),
            history: None,
            api: None,
        }
    }
}

impl CoordinatorConfig {
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn validate(&self) -> Result<(), ConfigurationError> {
        if self.sweep_interval.is_zero() {
            return Err(ConfigurationError::Invalid(
                "sweep_interval must be greater than zero".to_string(),
            ));
        }
        if self.write_timeout.is_zero() {
            return Err(ConfigurationError::Invalid(
                "write_timeout must be greater than zero".to_string(),
            ));
        }
        if self.max_protocol_errors == 0 {
            return Err(ConfigurationError::Invalid(
                "max_protocol_errors must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

fn default_reporting_interval() -> Duration {
    Duration::from_secs(5)
}

fn default_retry_backoff() -> Duration {
    Duration::from_secs(5)
}

fn default_connect_backoff() -> Duration {
    Duration::from_millis(500)
}

fn default_connect_retries() -> u32 {
    5
}

fn default_disk_path() -> PathBuf {
    PathBuf::from("/")
}

fn default_families() -> Vec<MetricFamily> {
    MetricFamily::ALL.to_vec()
}

fn default_alert_buffer() -> usize {
    100
}

#[derive(Debug, Clone, Deserialize)]
pub struct NodeConfig {
    #[serde(default = "util::get_node_id")]
    pub node_id: String,
    #[serde(default = "util::get_coordinator_host")]
    pub coordinator_host: String,
    #[serde(default = "util::get_coordinator_port")]
    pub coordinator_port: u16,
    #[serde(default = "default_reporting_interval", deserialize_with = "deserialize_secs")]
    pub reporting_interval: Duration,
    /// Pause after a failed send before the next report
    #[serde(default = "default_retry_backoff", deserialize_with = "deserialize_secs")]
    pub retry_backoff: Duration,
    /// Initial delay between connection attempts, doubled after each failure
    #[serde(default = "default_connect_backoff", deserialize_with = "deserialize_secs")]
    pub connect_backoff: Duration,
    #[serde(default = "default_connect_retries")]
    pub connect_retries: u32,
    /// Upper bound for writing one frame to the coordinator
    #[serde(default = "default_write_timeout", deserialize_with = "deserialize_secs")]
    pub write_timeout: Duration,
    #[serde(default = "default_disk_path")]
    pub disk_path: PathBuf,
    #[serde(default = "default_families")]
    pub families: Vec<MetricFamily>,
    #[serde(default = "default_retention")]
    pub retention: usize,
    #[serde(default)]
    pub thresholds: Vec<ThresholdConfig>,
    /// Capacity of the buffer holding ALERTs pushed by the coordinator
    #[serde(default = "default_alert_buffer")]
    pub alert_buffer: usize,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            node_id: util::get_node_id(),
            coordinator_host: util::get_coordinator_host(),
            coordinator_port: util::get_coordinator_port(),
            reporting_interval: default_reporting_interval(),
            retry_backoff: default_retry_backoff(),
            connect_backoff: default_connect_backoff(),
            connect_retries: default_connect_retries(),
            write_timeout: default_write_timeout(),
            disk_path: default_disk_path(),
            families: default_families(),
            retention: default_retention(),
            thresholds: Vec::new(),
            alert_buffer: default_alert_buffer(),
        }
    }
}

impl NodeConfig {
    pub fn coordinator_addr(&self) -> String {
        format!("{}:{}", self.coordinator_host, self.coordinator_port)
    }

    pub fn collector_config(&self) -> CollectorConfig {
        CollectorConfig {
            interval: self.reporting_interval,
            disk_path: self.disk_path.clone(),
            families: self.families.clone(),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigurationError> {
        if self.node_id.trim().is_empty() {
            return Err(ConfigurationError::Invalid(
                "node_id must not be empty".to_string(),
            ));
        }
        if self.reporting_interval.is_zero() {
            return Err(ConfigurationError::Invalid(
                "reporting_interval must be greater than zero".to_string(),
            ));
        }
        if self.write_timeout.is_zero() {
            return Err(ConfigurationError::Invalid(
                "write_timeout must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

pub fn read_config_file<T>(path: &str) -> anyhow::Result<T>
where
    T: for<'de> Deserialize<'de> + std::fmt::Debug,
{
    let file_content = std::fs::read_to_string(path)?;
    serde_json::from_str(&file_content)
        .map_err(|e| anyhow::anyhow!("Invalid configuration file provided: {e}"))
        .inspect(|config| trace!("loaded config: {config:?}"))
}
