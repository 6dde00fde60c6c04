//! # ipamd
//!
//! **RPC request pipeline for the IPAM service**
//!
//! Every call passes through a fixed chain of stages before reaching its
//! handler:
//!
//! ```text
//! Request → Recovery → Viewer → AccessLog → MutualTls → Audit → Validation → Handler
//! ```
//!
//! Mutual TLS is installed only when the server's TLS identity loads. Without
//! it the server keeps serving in a degraded posture reported by the
//! `HealthCheck` operation and the readiness check.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use ipamd::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = ConfigLoader::new().with_production().with_env_prefix("IPAMD").load()?;
//!     ipamd::server::init_telemetry(&config)?;
//!
//!     let server = RpcServer::builder(config).build()?;
//!     let reply = server
//!         .call(RpcRequest::new(GET_STATS, serde_json::json!({})))
//!         .await?;
//!     println!("{reply}");
//!     Ok(())
//! }
//! ```

#![doc(html_root_url = "https://docs.rs/ipamd/0.1.0")]
#![warn(missing_docs)]
#![forbid(unsafe_code)]

// Request context, errors and handlers
pub use ipamd_core as core;

// Pipeline and stages
pub use ipamd_middleware as middleware;

// Configuration loading
pub use ipamd_config as config;

// Logging and metrics
pub use ipamd_telemetry as telemetry;

// Server assembly
pub use ipamd_server as server;

/// Prelude module for convenient imports.
///
/// # Example
///
/// ```rust
/// use ipamd::prelude::*;
///
/// let request = RpcRequest::new(HEALTH_CHECK, serde_json::Value::Null);
/// assert_eq!(request.operation().as_str(), HEALTH_CHECK);
/// ```
pub mod prelude {
    pub use ipamd_core::{
        CallerIdentity, Deadline, Empty, ErrorCategory, Handler, QueryScope, RequestContext,
        RequestId, RpcError, RpcResult, Viewer,
    };

    pub use ipamd_middleware::stages::{AuditSink, CertificateVerifier, PayloadSchema};
    pub use ipamd_middleware::{ClientAuth, PeerInfo, RpcRequest};

    pub use ipamd_config::{ConfigLoader, IpamdConfig};

    pub use ipamd_server::services::dns::{GET_DNS_CONFIG, UPDATE_DNS_CONFIG};
    pub use ipamd_server::services::system::{GET_STATS, HEALTH_CHECK};
    pub use ipamd_server::{
        DnsConfigStore, HandlerRegistry, RpcServer, SecurityPosture, ServerError,
        ServiceRegistrar, StatisticsSource,
    };
}
