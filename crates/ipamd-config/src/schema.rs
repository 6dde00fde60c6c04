//! Configuration schema types.
//!
//! This module defines the structure of all configuration sections.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Server configuration section.
///
/// # Example
///
/// ```
/// use ipamd_config::ServerConfig;
///
/// let config = ServerConfig {
///     bind_address: "0.0.0.0:9400".to_string(),
///     call_timeout_ms: 30_000,
/// };
/// assert_eq!(config.call_timeout().as_secs(), 30);
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct ServerConfig {
    /// RPC listener bind address.
    #[serde(default = "default_bind_address")]
    pub bind_address: String,

    /// Per-call deadline in milliseconds.
    #[serde(default = "default_call_timeout")]
    pub call_timeout_ms: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            call_timeout_ms: default_call_timeout(),
        }
    }
}

impl ServerConfig {
    /// Returns the call timeout as a duration.
    #[must_use]
    pub const fn call_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.call_timeout_ms)
    }
}

fn default_bind_address() -> String {
    "0.0.0.0:9400".to_string()
}

const fn default_call_timeout() -> u64 {
    30_000
}

/// TLS identity section.
///
/// With `enabled = true` all three paths must be set. Loading failures at
/// startup do not abort the server; it runs without mutual TLS.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct TlsConfig {
    /// Whether to load a TLS identity at all.
    #[serde(default)]
    pub enabled: bool,

    /// PEM server certificate chain.
    #[serde(default)]
    pub cert_path: Option<PathBuf>,

    /// PEM server private key.
    #[serde(default)]
    pub key_path: Option<PathBuf>,

    /// PEM bundle of CAs trusted to sign client certificates.
    #[serde(default)]
    pub ca_path: Option<PathBuf>,
}

/// Security section: public operations and audit exemptions.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct SecurityConfig {
    /// Operations reachable without a client certificate, added to the
    /// baseline.
    #[serde(default)]
    pub public_operations: Vec<String>,

    /// Operations that produce no audit entry, added to the baseline.
    #[serde(default)]
    pub audit_skip_operations: Vec<String>,

    /// Whether readiness fails while mutual TLS is not enforced.
    #[serde(default)]
    pub require_mutual_tls: bool,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            public_operations: Vec::new(),
            audit_skip_operations: Vec::new(),
            require_mutual_tls: false,
        }
    }
}

/// Audit section.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct AuditConfig {
    /// Service name recorded in audit metadata.
    #[serde(default = "default_service_name")]
    pub service_name: String,

    /// Time the audit sink may run past the call deadline, in milliseconds.
    #[serde(default = "default_write_grace")]
    pub write_grace_ms: u64,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            service_name: default_service_name(),
            write_grace_ms: default_write_grace(),
        }
    }
}

impl AuditConfig {
    /// Returns the write grace as a duration.
    #[must_use]
    pub const fn write_grace(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.write_grace_ms)
    }
}

fn default_service_name() -> String {
    "ipam-service".to_string()
}

const fn default_write_grace() -> u64 {
    1_000
}

/// Log output format.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// JSON lines.
    #[default]
    Json,
    /// Human-readable output.
    Pretty,
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct LoggingConfig {
    /// Enable logging.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Filter directive (e.g. `info` or `ipamd_middleware=debug,info`).
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Output format.
    #[serde(default)]
    pub format: LogFormat,

    /// Include file and line in log events.
    #[serde(default)]
    pub include_location: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            level: default_log_level(),
            format: LogFormat::Json,
            include_location: false,
        }
    }
}

impl LoggingConfig {
    /// Converts to the telemetry crate's logging settings.
    #[must_use]
    pub fn to_log_config(&self) -> ipamd_telemetry::LogConfig {
        ipamd_telemetry::LogConfig {
            enabled: self.enabled,
            level: self.level.clone(),
            json_format: self.format == LogFormat::Json,
            file_line_info: self.include_location,
            ..ipamd_telemetry::LogConfig::default()
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Metrics configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct MetricsConfig {
    /// Install the Prometheus exporter.
    #[serde(default)]
    pub enabled: bool,

    /// Prometheus exporter listen address.
    #[serde(default = "default_metrics_addr")]
    pub addr: String,

    /// Histogram bucket boundaries for call duration, in seconds.
    #[serde(default = "default_histogram_buckets")]
    pub histogram_buckets: Vec<f64>,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            addr: default_metrics_addr(),
            histogram_buckets: default_histogram_buckets(),
        }
    }
}

impl MetricsConfig {
    /// Converts to the telemetry crate's metrics settings.
    #[must_use]
    pub fn to_metrics_config(&self) -> ipamd_telemetry::MetricsConfig {
        ipamd_telemetry::MetricsConfig {
            enabled: self.enabled,
            addr: self.addr.clone(),
            duration_buckets: self.histogram_buckets.clone(),
        }
    }
}

fn default_metrics_addr() -> String {
    "0.0.0.0:9090".to_string()
}

fn default_histogram_buckets() -> Vec<f64> {
    vec![
        0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
    ]
}

/// Telemetry section.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct TelemetrySection {
    /// Logging settings.
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Metrics settings.
    #[serde(default)]
    pub metrics: MetricsConfig,
}

impl TelemetrySection {
    /// Converts to the telemetry crate's combined settings.
    #[must_use]
    pub fn to_telemetry_config(&self) -> ipamd_telemetry::TelemetryConfig {
        ipamd_telemetry::TelemetryConfig {
            logging: self.logging.to_log_config(),
            metrics: self.metrics.to_metrics_config(),
        }
    }
}

const fn default_true() -> bool {
    true
}
