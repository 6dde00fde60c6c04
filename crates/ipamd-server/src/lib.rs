//! # ipamd Server
//!
//! Assembles the ipamd RPC server from its configuration:
//!
//! - TLS identity loading with degraded-mode fallback ([`tls`])
//! - Handler registration for the domain services ([`registry`])
//! - Security posture and readiness ([`health`])
//! - Built-in system service ([`services::system`])
//! - Per-call execution through the middleware pipeline ([`server`])
//!
//! ## Example
//!
//! ```rust,ignore
//! use ipamd_config::ConfigLoader;
//! use ipamd_server::{init_telemetry, RpcServer};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = ConfigLoader::new()
//!         .with_production()
//!         .with_optional_file("/etc/ipamd/ipamd.toml")?
//!         .with_env_prefix("IPAMD")
//!         .load()?;
//!
//!     init_telemetry(&config)?;
//!     let server = RpcServer::builder(config).build()?;
//!     println!("ready: {}", server.readiness().is_ready());
//!     Ok(())
//! }
//! ```

#![doc(html_root_url = "https://docs.rs/ipamd-server/0.1.0")]
#![warn(missing_docs)]
#![forbid(unsafe_code)]

pub mod error;
pub mod health;
pub mod registry;
pub mod server;
pub mod services;
pub mod tls;

pub use error::{ServerError, ServerResult, TlsError};
pub use health::{ReadinessCheck, ReadinessStatus, SecurityPosture, MUTUAL_TLS_CHECK};
pub use registry::{HandlerRegistry, ServiceRegistrar};
pub use server::{pipeline_settings, RpcServer, RpcServerBuilder, GRPC_HEALTH_CHECK};
pub use services::{
    DnsConfig, DnsConfigError, DnsConfigService, DnsConfigStore, InMemoryDnsConfigStore,
    StaticStatistics, StatisticKind, StatisticsError, StatisticsSource, SystemService,
};
pub use tls::{TlsIdentity, TlsSettings, WebPkiCertificateVerifier};

/// Installs logging and metrics as configured in `[telemetry]`.
///
/// Must be called from within a tokio runtime when metrics are enabled.
///
/// # Errors
///
/// [`ServerError::Telemetry`] if a subscriber or exporter is already
/// installed or cannot bind.
pub fn init_telemetry(config: &ipamd_config::IpamdConfig) -> ServerResult<()> {
    ipamd_telemetry::init_telemetry(&config.telemetry.to_telemetry_config())?;
    Ok(())
}
