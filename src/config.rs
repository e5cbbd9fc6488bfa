//! Configuration management for Floodgate.

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use crate::error::{FloodgateError, Result};

/// Prefix for environment overrides, e.g. `FLOODGATE__POLICY__URL`.
const ENV_PREFIX: &str = "FLOODGATE";

/// Main configuration for the Floodgate limiter.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FloodgateConfig {
    /// Remote policy source
    #[serde(default)]
    pub policy: PolicyConfig,

    /// Sliding window shape shared by every counter
    #[serde(default)]
    pub window: WindowConfig,

    /// Status/metrics HTTP surface
    #[serde(default)]
    pub server: ServerConfig,

    /// Throttle metrics
    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// Where and how often policies are fetched.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyConfig {
    /// URL serving the policy document
    #[serde(default = "default_policy_url")]
    pub url: String,

    /// Refresh interval in seconds
    #[serde(default = "default_update_interval")]
    pub update_interval_secs: u64,

    /// Budget for the synchronous refresh made at startup
    #[serde(default = "default_initial_timeout")]
    pub initial_timeout_ms: u64,

    /// Per-request HTTP timeout
    #[serde(default = "default_request_timeout")]
    pub request_timeout_ms: u64,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            url: default_policy_url(),
            update_interval_secs: default_update_interval(),
            initial_timeout_ms: default_initial_timeout(),
            request_timeout_ms: default_request_timeout(),
        }
    }
}

impl PolicyConfig {
    pub fn update_interval(&self) -> Duration {
        Duration::from_secs(self.update_interval_secs)
    }

    pub fn initial_timeout(&self) -> Duration {
        Duration::from_millis(self.initial_timeout_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

fn default_policy_url() -> String {
    "http://127.0.0.1:8080/policy".to_string()
}

fn default_update_interval() -> u64 {
    60
}

fn default_initial_timeout() -> u64 {
    1000
}

fn default_request_timeout() -> u64 {
    5000
}

/// Bucket layout of the sliding window.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WindowConfig {
    /// Width of one bucket in seconds
    #[serde(default = "default_bucket_size")]
    pub bucket_size_secs: u64,

    /// Number of buckets tracked per counter
    #[serde(default = "default_buckets")]
    pub buckets: u64,

    /// Event field holding an RFC 3339 timestamp
    #[serde(default = "default_timestamp_field")]
    pub timestamp_field: String,
}

impl Default for WindowConfig {
    fn default() -> Self {
        Self {
            bucket_size_secs: default_bucket_size(),
            buckets: default_buckets(),
            timestamp_field: default_timestamp_field(),
        }
    }
}

impl WindowConfig {
    /// Total time covered by one counter.
    pub fn span(&self) -> Duration {
        Duration::from_secs(self.bucket_size_secs.saturating_mul(self.buckets))
    }
}

fn default_bucket_size() -> u64 {
    60
}

fn default_buckets() -> u64 {
    5
}

fn default_timestamp_field() -> String {
    "ts".to_string()
}

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Address of the status and metrics endpoint
    #[serde(default = "default_status_addr")]
    pub status_addr: SocketAddr,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            status_addr: default_status_addr(),
        }
    }
}

fn default_status_addr() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 9090))
}

/// Maps an event field onto a metric label.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LabelMapping {
    /// Event field path
    pub from: String,
    /// Metric label name
    pub to: String,
}

/// Throttle metric configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Counter name, registered under the `floodgate` namespace
    #[serde(default = "default_metric_name")]
    pub name: String,

    /// Event fields exported as labels
    #[serde(default)]
    pub labels: Vec<LabelMapping>,

    /// How often all series are dropped
    #[serde(default = "default_reset_interval")]
    pub reset_interval_secs: u64,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            name: default_metric_name(),
            labels: Vec::new(),
            reset_interval_secs: default_reset_interval(),
        }
    }
}

impl MetricsConfig {
    /// Label names in configuration order.
    pub fn label_names(&self) -> Vec<String> {
        self.labels.iter().map(|l| l.to.clone()).collect()
    }

    /// Event fields in configuration order.
    pub fn fields(&self) -> Vec<String> {
        self.labels.iter().map(|l| l.from.clone()).collect()
    }
}

fn default_metric_name() -> String {
    "throttled_events_total".to_string()
}

fn default_reset_interval() -> u64 {
    60
}

impl FloodgateConfig {
    /// Load configuration from an optional YAML file, overridden by
    /// `FLOODGATE__SECTION__KEY` environment variables.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(
                config::File::from(path)
                    .format(config::FileFormat::Yaml)
                    .required(true),
            );
        }

        let config: FloodgateConfig = builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(|e| FloodgateError::Config(e.to_string()))?;

        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: FloodgateConfig =
            serde_yaml::from_str(yaml).map_err(|e| FloodgateError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings that would make the limiter divide by zero or spin.
    pub fn validate(&self) -> Result<()> {
        if self.window.bucket_size_secs == 0 {
            return Err(FloodgateError::Config(
                "window.bucket_size_secs must be positive".to_string(),
            ));
        }
        if self.window.buckets == 0 {
            return Err(FloodgateError::Config(
                "window.buckets must be positive".to_string(),
            ));
        }
        if self.policy.update_interval_secs == 0 {
            return Err(FloodgateError::Config(
                "policy.update_interval_secs must be positive".to_string(),
            ));
        }
        if self.metrics.reset_interval_secs == 0 {
            return Err(FloodgateError::Config(
                "metrics.reset_interval_secs must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = FloodgateConfig::default();
        assert_eq!(config.window.bucket_size_secs, 60);
        assert_eq!(config.window.buckets, 5);
        assert_eq!(config.window.span(), Duration::from_secs(300));
        assert_eq!(config.window.timestamp_field, "ts");
        assert_eq!(config.policy.initial_timeout(), Duration::from_secs(1));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_yaml_keeps_defaults() {
        let yaml = r#"
policy:
  url: http://policy.internal/policy
  update_interval_secs: 10
window:
  bucket_size_secs: 1
metrics:
  name: filebeat_events
  labels:
    - from: input.type
      to: input
    - from: host.name
      to: host
"#;
        let config = FloodgateConfig::from_yaml(yaml).unwrap();
        assert_eq!(config.policy.url, "http://policy.internal/policy");
        assert_eq!(config.policy.update_interval(), Duration::from_secs(10));
        assert_eq!(config.policy.request_timeout_ms, 5000);
        assert_eq!(config.window.bucket_size_secs, 1);
        assert_eq!(config.window.buckets, 5);
        assert_eq!(config.metrics.label_names(), vec!["input", "host"]);
        assert_eq!(config.metrics.fields(), vec!["input.type", "host.name"]);
    }

    #[test]
    fn test_zero_bucket_size_rejected() {
        let yaml = "window:\n  bucket_size_secs: 0\n";
        let err = FloodgateConfig::from_yaml(yaml).unwrap_err();
        assert!(matches!(err, FloodgateError::Config(_)));
    }

    #[test]
    fn test_zero_buckets_rejected() {
        let mut config = FloodgateConfig::default();
        config.window.buckets = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_without_file_uses_defaults() {
        let config = FloodgateConfig::load(None).unwrap();
        assert_eq!(config.server.status_addr, default_status_addr());
    }
}
