//! Prometheus metrics for the RPC pipeline.
//!
//! | Metric | Type | Labels | Description |
//! |--------|------|--------|-------------|
//! | `ipamd_calls_total` | Counter | `operation`, `outcome` | Completed calls |
//! | `ipamd_call_duration_seconds` | Histogram | `operation` | Call latency |
//! | `ipamd_in_flight_calls` | Gauge | - | Calls currently in the pipeline |
//! | `ipamd_audit_entries_total` | Counter | - | Audit entries handed to the sink |
//! | `ipamd_audit_sink_failures_total` | Counter | `reason` | Audit writes that failed |
//! | `ipamd_recovered_faults_total` | Counter | `operation` | Handler panics recovered |
//! | `ipamd_mtls_enabled` | Gauge | - | 1 if mutual TLS is enforced, 0 if degraded |
//!
//! Recording without an installed recorder is a no-op.

use crate::error::TelemetryError;
use crate::TelemetryResult;
use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use serde::Deserialize;
use std::net::SocketAddr;
use std::sync::OnceLock;
use std::time::Duration;

/// Metric names.
pub mod names {
    /// Completed calls by operation and outcome.
    pub const CALLS_TOTAL: &str = "ipamd_calls_total";
    /// Call latency histogram.
    pub const CALL_DURATION_SECONDS: &str = "ipamd_call_duration_seconds";
    /// Calls currently in the pipeline.
    pub const IN_FLIGHT_CALLS: &str = "ipamd_in_flight_calls";
    /// Audit entries accepted by the sink.
    pub const AUDIT_ENTRIES_TOTAL: &str = "ipamd_audit_entries_total";
    /// Audit sink write failures by reason.
    pub const AUDIT_SINK_FAILURES_TOTAL: &str = "ipamd_audit_sink_failures_total";
    /// Recovered handler faults by operation.
    pub const RECOVERED_FAULTS_TOTAL: &str = "ipamd_recovered_faults_total";
    /// Mutual TLS enforcement flag.
    pub const MTLS_ENABLED: &str = "ipamd_mtls_enabled";
}

static METRICS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Metrics configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    /// Whether the Prometheus exporter is installed.
    pub enabled: bool,

    /// Address the exporter listens on.
    pub addr: String,

    /// Histogram buckets for call duration, in seconds.
    pub duration_buckets: Vec<f64>,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            addr: "0.0.0.0:9090".to_string(),
            duration_buckets: vec![
                0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
            ],
        }
    }
}

/// Installs the Prometheus recorder and spawns its HTTP exporter.
///
/// Must be called from within a tokio runtime.
///
/// # Errors
///
/// Returns `TelemetryError::InvalidAddress` for an unparsable listen address
/// and `TelemetryError::MetricsInit` if the exporter cannot be built or a
/// recorder is already installed.
pub fn init_metrics(config: &MetricsConfig) -> TelemetryResult<()> {
    if !config.enabled {
        return Ok(());
    }

    let addr: SocketAddr = config
        .addr
        .parse()
        .map_err(|e| TelemetryError::InvalidAddress(format!("{}: {e}", config.addr)))?;

    let (recorder, exporter) = PrometheusBuilder::new()
        .with_http_listener(addr)
        .set_buckets_for_metric(
            Matcher::Full(names::CALL_DURATION_SECONDS.to_string()),
            &config.duration_buckets,
        )
        .map_err(|e| TelemetryError::MetricsInit(e.to_string()))?
        .build()
        .map_err(|e| TelemetryError::MetricsInit(e.to_string()))?;

    let handle = recorder.handle();
    metrics::set_global_recorder(recorder)
        .map_err(|e| TelemetryError::MetricsInit(e.to_string()))?;
    let _ = METRICS_HANDLE.set(handle);

    tokio::spawn(async move {
        if let Err(e) = exporter.await {
            tracing::error!(error = ?e, "Prometheus exporter stopped");
        }
    });

    register_metric_descriptions();
    tracing::info!(%addr, "Prometheus exporter listening");

    Ok(())
}

/// Renders metrics in Prometheus text format.
///
/// Returns `None` if the exporter has not been installed.
#[must_use]
pub fn render_metrics() -> Option<String> {
    METRICS_HANDLE.get().map(PrometheusHandle::render)
}

fn register_metric_descriptions() {
    describe_counter!(names::CALLS_TOTAL, "Total number of RPC calls completed");
    describe_histogram!(names::CALL_DURATION_SECONDS, "RPC call duration in seconds");
    describe_gauge!(names::IN_FLIGHT_CALLS, "RPC calls currently being processed");
    describe_counter!(
        names::AUDIT_ENTRIES_TOTAL,
        "Audit entries successfully handed to the audit sink"
    );
    describe_counter!(
        names::AUDIT_SINK_FAILURES_TOTAL,
        "Audit entries that could not be persisted"
    );
    describe_counter!(
        names::RECOVERED_FAULTS_TOTAL,
        "Handler faults converted into internal errors"
    );
    describe_gauge!(
        names::MTLS_ENABLED,
        "1 when client certificates are enforced, 0 when running without mutual TLS"
    );
}

/// Records a completed call.
///
/// `outcome` is `ok` or the error category label.
pub fn record_call(operation: &str, outcome: &str, duration: Duration) {
    counter!(
        names::CALLS_TOTAL,
        "operation" => operation.to_string(),
        "outcome" => outcome.to_string()
    )
    .increment(1);

    histogram!(
        names::CALL_DURATION_SECONDS,
        "operation" => operation.to_string()
    )
    .record(duration.as_secs_f64());
}

/// Increments the in-flight calls gauge.
pub fn increment_in_flight() {
    gauge!(names::IN_FLIGHT_CALLS).increment(1.0);
}

/// Decrements the in-flight calls gauge.
pub fn decrement_in_flight() {
    gauge!(names::IN_FLIGHT_CALLS).decrement(1.0);
}

/// Records an audit entry accepted by the sink.
pub fn record_audit_entry() {
    counter!(names::AUDIT_ENTRIES_TOTAL).increment(1);
}

/// Records an audit write that did not reach the sink.
pub fn record_audit_sink_failure(reason: &str) {
    counter!(names::AUDIT_SINK_FAILURES_TOTAL, "reason" => reason.to_string()).increment(1);
}

/// Records a recovered handler fault.
pub fn record_recovered_fault(operation: &str) {
    counter!(names::RECOVERED_FAULTS_TOTAL, "operation" => operation.to_string()).increment(1);
}

/// Publishes whether mutual TLS is enforced.
pub fn set_mtls_enabled(enabled: bool) {
    gauge!(names::MTLS_ENABLED).set(if enabled { 1.0 } else { 0.0 });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = MetricsConfig::default();
        assert!(!config.enabled);
        assert_eq!(config.addr, "0.0.0.0:9090");
        assert_eq!(config.duration_buckets.len(), 12);
    }

    #[test]
    fn test_disabled_metrics_is_noop() {
        assert!(init_metrics(&MetricsConfig::default()).is_ok());
        assert!(render_metrics().is_none());
    }

    #[test]
    fn test_invalid_address() {
        let config = MetricsConfig {
            enabled: true,
            addr: "not-an-address".to_string(),
            ..Default::default()
        };
        assert!(matches!(
            init_metrics(&config),
            Err(TelemetryError::InvalidAddress(_))
        ));
    }

    #[test]
    fn test_recording_without_recorder_is_noop() {
        record_call("/grpc.health.v1.Health/Check", "ok", Duration::from_millis(3));
        increment_in_flight();
        decrement_in_flight();
        record_audit_entry();
        record_audit_sink_failure("unavailable");
        record_recovered_fault("/ipam.service.v1.SystemService/GetStats");
        set_mtls_enabled(false);
    }

    #[test]
    fn test_metric_names_are_prefixed() {
        for name in [
            names::CALLS_TOTAL,
            names::CALL_DURATION_SECONDS,
            names::IN_FLIGHT_CALLS,
            names::AUDIT_ENTRIES_TOTAL,
            names::AUDIT_SINK_FAILURES_TOTAL,
            names::RECOVERED_FAULTS_TOTAL,
            names::MTLS_ENABLED,
        ] {
            assert!(name.starts_with("ipamd_"), "{name}");
        }
    }
}
