//! Typed configuration for the ipamd RPC server.
//!
//! - TOML and JSON configuration files
//! - Environment variable overrides (`IPAMD__SECTION__KEY`)
//! - `.env` files via `dotenvy`
//! - Strict validation (fails on unknown fields)
//!
//! # Overview
//!
//! [`IpamdConfig`] groups the sections the server reads at startup:
//!
//! - [`ServerConfig`] - listener address and per-call deadline
//! - [`TlsConfig`] - server identity and client CA bundle
//! - [`SecurityConfig`] - public operations and audit exemptions
//! - [`AuditConfig`] - audit metadata and sink write budget
//! - [`TelemetrySection`] - logging and metrics
//!
//! # Example
//!
//! ```no_run
//! use ipamd_config::ConfigLoader;
//!
//! # fn main() -> Result<(), ipamd_config::ConfigError> {
//! let config = ConfigLoader::new()
//!     .with_production()
//!     .with_optional_file("/etc/ipamd/ipamd.toml")?
//!     .with_env_prefix("IPAMD")
//!     .load()?;
//!
//! println!("listening on {}", config.server.bind_address);
//! # Ok(())
//! # }
//! ```
//!
//! # Configuration File Format
//!
//! ```toml
//! [server]
//! bind_address = "0.0.0.0:9400"
//! call_timeout_ms = 30000
//!
//! [tls]
//! enabled = true
//! cert_path = "/etc/ipamd/tls/server.pem"
//! key_path = "/etc/ipamd/tls/server.key"
//! ca_path = "/etc/ipamd/tls/clients-ca.pem"
//!
//! [security]
//! public_operations = []
//! audit_skip_operations = []
//! require_mutual_tls = true
//!
//! [audit]
//! service_name = "ipam-service"
//! write_grace_ms = 1000
//!
//! [telemetry.logging]
//! level = "info"
//! format = "json"
//!
//! [telemetry.metrics]
//! enabled = true
//! addr = "0.0.0.0:9090"
//! ```

#![warn(missing_docs)]

mod config;
mod error;
mod loader;
mod schema;

pub use config::IpamdConfig;
pub use error::ConfigError;
pub use loader::{ConfigLoader, DEFAULT_ENV_PREFIX};
pub use schema::{
    AuditConfig, LogFormat, LoggingConfig, MetricsConfig, SecurityConfig, ServerConfig,
    TelemetrySection, TlsConfig,
};
