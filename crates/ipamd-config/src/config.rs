//! Main configuration type.
//!
//! This module provides the top-level [`IpamdConfig`] struct and its presets.

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;

use crate::{AuditConfig, ConfigError, SecurityConfig, ServerConfig, TelemetrySection, TlsConfig};

/// Complete ipamd server configuration.
///
/// Use [`ConfigLoader`](crate::ConfigLoader) to load configuration from files
/// and environment variables.
///
/// # Example
///
/// ```
/// use ipamd_config::IpamdConfig;
///
/// let config = IpamdConfig::default();
/// assert_eq!(config.server.bind_address, "0.0.0.0:9400");
/// assert!(!config.tls.enabled);
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(deny_unknown_fields)]
pub struct IpamdConfig {
    /// Listener and call timeout.
    #[serde(default)]
    pub server: ServerConfig,

    /// TLS identity paths.
    #[serde(default)]
    pub tls: TlsConfig,

    /// Public operations and audit exemptions.
    #[serde(default)]
    pub security: SecurityConfig,

    /// Audit metadata and sink budget.
    #[serde(default)]
    pub audit: AuditConfig,

    /// Logging and metrics.
    #[serde(default)]
    pub telemetry: TelemetrySection,
}

impl IpamdConfig {
    /// Validate the configuration.
    ///
    /// TLS paths are not checked here: missing or unreadable identity
    /// material degrades the server at startup instead of failing it.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::Invalid` if:
    /// - The bind address or an enabled metrics address is not a socket address
    /// - The call timeout is zero
    /// - An operation identifier is blank
    /// - The audit service name is blank
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.server.bind_address.parse::<SocketAddr>().is_err() {
            return Err(ConfigError::invalid(
                "server.bind_address",
                format!("invalid socket address: {}", self.server.bind_address),
            ));
        }

        if self.server.call_timeout_ms == 0 {
            return Err(ConfigError::invalid(
                "server.call_timeout_ms",
                "must be greater than zero",
            ));
        }

        if self.telemetry.metrics.enabled
            && self.telemetry.metrics.addr.parse::<SocketAddr>().is_err()
        {
            return Err(ConfigError::invalid(
                "telemetry.metrics.addr",
                format!("invalid socket address: {}", self.telemetry.metrics.addr),
            ));
        }

        for (field, operations) in [
            ("security.public_operations", &self.security.public_operations),
            (
                "security.audit_skip_operations",
                &self.security.audit_skip_operations,
            ),
        ] {
            if operations.iter().any(|op| op.trim().is_empty()) {
                return Err(ConfigError::invalid(
                    field,
                    "operation identifiers must not be blank",
                ));
            }
        }

        if self.audit.service_name.trim().is_empty() {
            return Err(ConfigError::invalid(
                "audit.service_name",
                "must not be blank",
            ));
        }

        Ok(())
    }

    /// Local development preset: pretty debug logs, no TLS.
    ///
    /// # Example
    ///
    /// ```
    /// use ipamd_config::{IpamdConfig, LogFormat};
    ///
    /// let config = IpamdConfig::development();
    /// assert_eq!(config.telemetry.logging.format, LogFormat::Pretty);
    /// ```
    #[must_use]
    pub fn development() -> Self {
        let mut config = Self::default();
        config.server.bind_address = "127.0.0.1:9400".to_string();
        config.telemetry.logging.level = "debug".to_string();
        config.telemetry.logging.format = crate::LogFormat::Pretty;
        config.telemetry.logging.include_location = true;
        config
    }

    /// Production preset: JSON logs, metrics exporter, TLS enabled and
    /// readiness gated on mutual TLS.
    #[must_use]
    pub fn production() -> Self {
        let mut config = Self::default();
        config.telemetry.logging.level = "info".to_string();
        config.telemetry.logging.format = crate::LogFormat::Json;
        config.telemetry.metrics.enabled = true;
        config.tls.enabled = true;
        config.security.require_mutual_tls = true;
        config
    }

    /// Returns the public operations, baseline excluded.
    #[must_use]
    pub fn public_operations(&self) -> &[String] {
        &self.security.public_operations
    }

    /// Returns the audit skip-list, baseline excluded.
    #[must_use]
    pub fn audit_skip_operations(&self) -> &[String] {
        &self.security.audit_skip_operations
    }
}
