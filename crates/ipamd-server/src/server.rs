//! Server assembly and per-call execution.
//!
//! [`RpcServerBuilder`] turns an [`IpamdConfig`] into a running
//! [`RpcServer`]:
//!
//! - loads the TLS identity, falling back to degraded mode on failure
//! - registers the system service, the gRPC health check and every
//!   domain service
//! - assembles the middleware pipeline in front of the registry
//!
//! The transport decodes each inbound call into an [`RpcRequest`] and hands
//! it to [`RpcServer::call`].
//!
//! # Example
//!
//! ```rust,ignore
//! use ipamd_config::ConfigLoader;
//! use ipamd_server::RpcServer;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = ConfigLoader::new().with_env_prefix("IPAMD").load()?;
//!     let server = RpcServer::builder(config).build()?;
//!
//!     if server.security_posture().is_degraded() {
//!         eprintln!("running without mutual TLS");
//!     }
//!     Ok(())
//! }
//! ```

use std::sync::Arc;
use std::time::Duration;

use ipamd_config::IpamdConfig;
use ipamd_core::{Deadline, ErasedHandler, RpcError, RpcResult};
use ipamd_middleware::stages::{AuditSink, TracingAuditSink};
use ipamd_middleware::{
    BoxFuture, ClientAuth, EndpointMatcher, MiddlewareContext, OperationLabels, Pipeline,
    PipelineSettings, Reply, RpcRequest,
};
use serde_json::json;
use tokio_util::sync::CancellationToken;

use crate::error::ServerResult;
use crate::health::{ReadinessCheck, SecurityPosture};
use crate::registry::{HandlerRegistry, ServiceRegistrar};
use crate::services::{
    DnsConfigService, DnsConfigStore, InMemoryDnsConfigStore, StaticStatistics, StatisticsSource,
    SystemService,
};
use crate::tls::TlsIdentity;

/// Operation identifier of the standard gRPC health check.
pub const GRPC_HEALTH_CHECK: &str = "/grpc.health.v1.Health/Check";

/// The assembled RPC server.
///
/// Cloning shares the pipeline and registry.
#[derive(Clone)]
pub struct RpcServer {
    inner: Arc<ServerInner>,
}

struct ServerInner {
    pipeline: Pipeline,
    registry: HandlerRegistry,
    metric_labels: OperationLabels,
    call_timeout: Duration,
    bind_address: String,
    posture: SecurityPosture,
    readiness: ReadinessCheck,
    tls: Option<TlsIdentity>,
}

impl std::fmt::Debug for RpcServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcServer")
            .field("bind_address", &self.inner.bind_address)
            .field("pipeline", &self.inner.pipeline)
            .field("operations", &self.inner.registry.len())
            .field("posture", &self.inner.posture)
            .finish()
    }
}

impl RpcServer {
    /// Creates a builder from a loaded configuration.
    #[must_use]
    pub fn builder(config: IpamdConfig) -> RpcServerBuilder {
        RpcServerBuilder::new(config)
    }

    /// Builds a server with only the built-in services.
    ///
    /// # Errors
    ///
    /// See [`RpcServerBuilder::build`].
    pub fn from_config(config: IpamdConfig) -> ServerResult<Self> {
        Self::builder(config).build()
    }

    /// Runs one call through the pipeline.
    ///
    /// The call executes on its own task. Its deadline is the configured
    /// call timeout, tightened by the caller's timeout when shorter. Dropping
    /// the returned future cancels the call: stages blocked on certificate
    /// verification or the audit sink unwind promptly.
    pub async fn call(&self, request: RpcRequest) -> RpcResult<Reply> {
        let cancellation = CancellationToken::new();
        let guard = cancellation.clone().drop_guard();

        let mut deadline =
            Deadline::after(self.inner.call_timeout).with_cancellation(cancellation);
        if let Some(timeout) = request.timeout() {
            deadline = deadline.tightened(timeout);
        }

        let operation = request.operation().clone();
        let inner = Arc::clone(&self.inner);
        let task = tokio::spawn(async move { inner.execute(request, deadline).await });

        let result = match task.await {
            Ok(result) => result,
            Err(e) if e.is_panic() => {
                tracing::error!(
                    operation = %operation,
                    "call task panicked outside the pipeline"
                );
                ipamd_telemetry::metrics::record_recovered_fault(
                    self.inner.metric_labels.label(operation.as_str()),
                );
                Err(RpcError::internal("internal server error"))
            }
            Err(_) => Err(RpcError::cancelled("call task aborted")),
        };

        drop(guard.disarm());
        result
    }

    /// Returns whether mutual TLS is enforced.
    #[must_use]
    pub fn security_posture(&self) -> &SecurityPosture {
        &self.inner.posture
    }

    /// Returns the readiness checks.
    #[must_use]
    pub fn readiness(&self) -> &ReadinessCheck {
        &self.inner.readiness
    }

    /// Returns the assembled pipeline.
    #[must_use]
    pub fn pipeline(&self) -> &Pipeline {
        &self.inner.pipeline
    }

    /// Returns the handler registry.
    #[must_use]
    pub fn registry(&self) -> &HandlerRegistry {
        &self.inner.registry
    }

    /// Returns the operations recorded verbatim as metric labels.
    #[must_use]
    pub fn metric_labels(&self) -> &OperationLabels {
        &self.inner.metric_labels
    }

    /// Returns the configured listener address.
    #[must_use]
    pub fn bind_address(&self) -> &str {
        &self.inner.bind_address
    }

    /// Returns the configured call timeout.
    #[must_use]
    pub fn call_timeout(&self) -> Duration {
        self.inner.call_timeout
    }

    /// Returns the rustls configuration for the listener, if an identity
    /// was loaded.
    #[must_use]
    pub fn tls_server_config(&self) -> Option<Arc<rustls::ServerConfig>> {
        self.inner.tls.as_ref().map(TlsIdentity::server_config)
    }
}

impl ServerInner {
    async fn execute(&self, request: RpcRequest, deadline: Deadline) -> RpcResult<Reply> {
        let mut ctx = MiddlewareContext::for_request(&request, deadline);
        let handler = self.registry.get(request.operation().as_str());

        self.pipeline
            .process(
                &mut ctx,
                request,
                move |ctx: &mut MiddlewareContext, request: RpcRequest| {
                    dispatch(handler, ctx, request)
                },
            )
            .await
    }
}

fn dispatch(
    handler: Option<Arc<dyn ErasedHandler>>,
    ctx: &mut MiddlewareContext,
    request: RpcRequest,
) -> BoxFuture<'static, RpcResult<Reply>> {
    let request_ctx = ctx.to_request_context();
    Box::pin(async move {
        let Some(handler) = handler else {
            return Err(RpcError::unimplemented(request_ctx.operation_id().as_str()));
        };
        let deadline = request_ctx.deadline().clone();
        deadline
            .run("handler", handler.call(&request_ctx, request.into_payload()))
            .await?
    })
}

/// Builder for [`RpcServer`].
pub struct RpcServerBuilder {
    config: IpamdConfig,
    registry: HandlerRegistry,
    services: Vec<Box<dyn ServiceRegistrar>>,
    audit_sink: Option<Arc<dyn AuditSink>>,
    statistics: Arc<dyn StatisticsSource>,
    dns_configs: Arc<dyn DnsConfigStore>,
    client_auth: Option<ClientAuth>,
    readiness: ReadinessCheck,
}

impl std::fmt::Debug for RpcServerBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcServerBuilder")
            .field("config", &self.config)
            .field(
                "services",
                &self.services.iter().map(|s| s.service_name()).collect::<Vec<_>>(),
            )
            .field("client_auth", &self.client_auth)
            .finish_non_exhaustive()
    }
}

impl RpcServerBuilder {
    /// Creates a builder from a loaded configuration.
    #[must_use]
    pub fn new(config: IpamdConfig) -> Self {
        Self {
            config,
            registry: HandlerRegistry::new(),
            services: Vec::new(),
            audit_sink: None,
            statistics: Arc::new(StaticStatistics::default()),
            dns_configs: Arc::new(InMemoryDnsConfigStore::new()),
            client_auth: None,
            readiness: ReadinessCheck::new(),
        }
    }

    /// Adds a domain service.
    #[must_use]
    pub fn service<S: ServiceRegistrar + 'static>(mut self, service: S) -> Self {
        self.services.push(Box::new(service));
        self
    }

    /// Starts from a pre-filled registry.
    #[must_use]
    pub fn registry(mut self, registry: HandlerRegistry) -> Self {
        self.registry = registry;
        self
    }

    /// Sets where audit entries are written. Defaults to
    /// [`TracingAuditSink`].
    #[must_use]
    pub fn audit_sink(mut self, sink: Arc<dyn AuditSink>) -> Self {
        self.audit_sink = Some(sink);
        self
    }

    /// Sets the source of `GetStats` counts.
    #[must_use]
    pub fn statistics(mut self, statistics: Arc<dyn StatisticsSource>) -> Self {
        self.statistics = statistics;
        self
    }

    /// Sets where DNS resolver settings are kept. Defaults to an
    /// [`InMemoryDnsConfigStore`].
    #[must_use]
    pub fn dns_configs(mut self, store: Arc<dyn DnsConfigStore>) -> Self {
        self.dns_configs = store;
        self
    }

    /// Overrides the client authentication mode instead of loading the
    /// `[tls]` identity.
    #[must_use]
    pub fn client_auth(mut self, client_auth: ClientAuth) -> Self {
        self.client_auth = Some(client_auth);
        self
    }

    /// Adds a readiness check.
    #[must_use]
    pub fn readiness_check<F>(mut self, name: impl Into<String>, check: F) -> Self
    where
        F: Fn() -> bool + Send + Sync + 'static,
    {
        self.readiness = self.readiness.add_check(name, check);
        self
    }

    /// Assembles the server.
    ///
    /// A TLS identity that is absent or fails to load does not fail the
    /// build; the pipeline is assembled without the mutual-TLS stage and
    /// the reason is reported through [`RpcServer::security_posture`].
    ///
    /// # Errors
    ///
    /// [`ServerError::DuplicateOperation`](crate::ServerError::DuplicateOperation)
    /// if two services register the same operation.
    pub fn build(self) -> ServerResult<RpcServer> {
        let Self {
            config,
            mut registry,
            services,
            audit_sink,
            statistics,
            dns_configs,
            client_auth,
            readiness,
        } = self;

        let (client_auth, tls) = match client_auth {
            Some(client_auth) => (client_auth, None),
            None => match TlsIdentity::from_config(&config.tls) {
                Ok(identity) => (identity.client_auth(), Some(identity)),
                Err(e) if e.is_disabled() => (ClientAuth::disabled(e.to_string()), None),
                Err(e) => (
                    ClientAuth::disabled(format!("TLS identity failed to load: {e}")),
                    None,
                ),
            },
        };

        let posture = match &client_auth {
            ClientAuth::Verify(_) => SecurityPosture::enforced(),
            ClientAuth::Disabled { reason } => SecurityPosture::degraded(reason.clone()),
        };

        registry.register_service(&SystemService::new(statistics, posture.clone()))?;
        registry.register_service(&DnsConfigService::new(dns_configs))?;
        registry.register_fn(
            GRPC_HEALTH_CHECK,
            |_ctx, _request: ipamd_core::Empty| async move {
                RpcResult::Ok(json!({ "status": "SERVING" }))
            },
        )?;
        for service in &services {
            registry.register_service(service.as_ref())?;
        }

        let mut settings = pipeline_settings(&config);
        settings.metric_labels = OperationLabels::new(registry.operations());
        let sink = audit_sink.unwrap_or_else(|| Arc::new(TracingAuditSink));
        let metric_labels = settings.metric_labels.clone();
        let pipeline = Pipeline::assemble(&settings, client_auth, sink, registry.schemas().clone());

        let readiness =
            readiness.with_mutual_tls_requirement(&posture, config.security.require_mutual_tls);

        tracing::info!(
            bind_address = %config.server.bind_address,
            stages = ?pipeline.stage_names(),
            operations = registry.len(),
            mutual_tls = posture.mutual_tls,
            "ipamd server assembled"
        );

        Ok(RpcServer {
            inner: Arc::new(ServerInner {
                pipeline,
                registry,
                metric_labels,
                call_timeout: config.server.call_timeout(),
                bind_address: config.server.bind_address,
                posture,
                readiness,
                tls,
            }),
        })
    }
}

/// Translates the configuration into the pipeline's typed inputs.
///
/// Configured operations extend the baseline health operations; they never
/// replace them.
pub fn pipeline_settings(config: &IpamdConfig) -> PipelineSettings {
    PipelineSettings {
        public_operations: EndpointMatcher::with_baseline(
            config.public_operations().iter().cloned(),
        ),
        audit_skip_operations: EndpointMatcher::with_baseline(
            config.audit_skip_operations().iter().cloned(),
        ),
        service_name: config.audit.service_name.clone(),
        audit_write_grace: config.audit.write_grace(),
        metric_labels: OperationLabels::default(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ipamd_middleware::{Stage, BASELINE_PUBLIC_OPERATIONS};

    #[test]
    fn test_pipeline_settings_with_baseline() {
        let mut config = IpamdConfig::default();
        config.security.public_operations = vec!["/ipam.service.v1.SystemService/GetStats".into()];

        let settings = pipeline_settings(&config);
        for op in BASELINE_PUBLIC_OPERATIONS {
            assert!(!settings.public_operations.is_protected(op));
            assert!(!settings.audit_skip_operations.is_protected(op));
        }
        assert!(!settings
            .public_operations
            .is_protected("/ipam.service.v1.SystemService/GetStats"));
        assert!(settings
            .audit_skip_operations
            .is_protected("/ipam.service.v1.SystemService/GetStats"));
    }

    #[test]
    fn test_pipeline_settings_keep_baseline_with_empty_lists() {
        let mut config = IpamdConfig::default();
        config.security.public_operations = Vec::new();
        config.security.audit_skip_operations = Vec::new();

        let settings = pipeline_settings(&config);
        assert_eq!(settings.public_operations.len(), BASELINE_PUBLIC_OPERATIONS.len());
        assert_eq!(
            settings.audit_skip_operations.len(),
            BASELINE_PUBLIC_OPERATIONS.len()
        );
        assert!(!settings
            .public_operations
            .is_protected("/ipam.service.v1.SystemService/HealthCheck"));
    }

    #[test]
    fn test_build_without_tls_is_degraded() {
        let server = RpcServer::from_config(IpamdConfig::default()).unwrap();

        assert!(server.security_posture().is_degraded());
        assert_eq!(
            server.security_posture().reason.as_deref(),
            Some("TLS not configured")
        );
        assert!(!server.pipeline().contains(Stage::MutualTls));
        assert!(server.tls_server_config().is_none());
        assert!(server.registry().contains(GRPC_HEALTH_CHECK));
        assert_eq!(server.bind_address(), "0.0.0.0:9400");
    }

    #[test]
    fn test_build_with_broken_tls_paths() {
        let mut config = IpamdConfig::default();
        config.tls.enabled = true;
        config.tls.cert_path = Some("/nonexistent/server.pem".into());
        config.tls.key_path = Some("/nonexistent/server.key".into());
        config.tls.ca_path = Some("/nonexistent/ca.pem".into());
        config.security.require_mutual_tls = true;

        let server = RpcServer::from_config(config).unwrap();
        let reason = server.security_posture().reason.clone().unwrap();
        assert!(reason.starts_with("TLS identity failed to load"));
        assert!(!server.readiness().is_ready());
    }

    #[tokio::test]
    async fn test_unknown_operation_unimplemented() {
        let server = RpcServer::from_config(IpamdConfig::default()).unwrap();
        let err = server
            .call(RpcRequest::new(
                "/ipam.service.v1.SubnetService/SplitSubnet",
                serde_json::Value::Null,
            ))
            .await
            .unwrap_err();
        assert_eq!(err.category(), ipamd_core::ErrorCategory::Unimplemented);
    }

    #[test]
    fn test_metric_labels_cover_registered_operations_only() {
        let server = RpcServer::from_config(IpamdConfig::default()).unwrap();
        let labels = server.metric_labels();

        assert_eq!(labels.len(), server.registry().len());
        assert_eq!(labels.label(GRPC_HEALTH_CHECK), GRPC_HEALTH_CHECK);
        assert_eq!(
            labels.label("/ipam.service.v1.SubnetService/SplitSubnet-7f3a"),
            ipamd_middleware::UNREGISTERED_OPERATION
        );
    }

    #[tokio::test]
    async fn test_grpc_health_check() {
        let server = RpcServer::from_config(IpamdConfig::default()).unwrap();
        let reply = server
            .call(RpcRequest::new(GRPC_HEALTH_CHECK, serde_json::Value::Null))
            .await
            .unwrap();
        assert_eq!(reply, json!({"status": "SERVING"}));
    }
}
