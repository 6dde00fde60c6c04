//! Fixed-order middleware pipeline.
//!
//! Every inbound call flows through the same ordered chain of stages before
//! reaching its handler:
//!
//! 1. **Recovery** - outermost, converts faults from every later stage
//! 2. **Viewer** - system privilege marker, before anything touches data
//! 3. **Access log** - one log line and metric sample per call
//! 4. **Mutual TLS** - only when a server TLS identity was loaded
//! 5. **Audit** - after authentication, so its outcome is known
//! 6. **Validation** - innermost, payload detail only reaches authenticated callers
//!
//! The order is carried by [`Stage`]; [`PipelineBuilder`] sorts stages by it
//! regardless of insertion order, so no caller can reorder the chain.
//! [`Pipeline::assemble`] builds the production chain from
//! [`PipelineSettings`].

use crate::context::MiddlewareContext;
use crate::labels::OperationLabels;
use crate::matcher::EndpointMatcher;
use crate::middleware::{BoxFuture, Middleware, Next};
use crate::stages::{
    audit, AccessLogMiddleware, AuditMiddleware, AuditSink, CertificateVerifier,
    MutualTlsMiddleware, RecoveryMiddleware, SchemaSet, ValidationMiddleware, ViewerMiddleware,
};
use crate::types::{Reply, RpcRequest};
use ipamd_core::RpcResult;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

/// A type-erased middleware that can be stored in the pipeline.
pub type BoxedMiddleware = Arc<dyn Middleware>;

/// Position of a stage in the chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum Stage {
    /// Fault recovery.
    Recovery = 1,
    /// Privilege context injection.
    Viewer = 2,
    /// Access logging.
    AccessLog = 3,
    /// Client certificate enforcement.
    MutualTls = 4,
    /// Audit recording.
    Audit = 5,
    /// Request payload validation.
    Validation = 6,
}

impl Stage {
    /// Returns the stage name.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Recovery => "recovery",
            Self::Viewer => "system_viewer",
            Self::AccessLog => "access_log",
            Self::MutualTls => "mutual_tls",
            Self::Audit => "audit",
            Self::Validation => "validation",
        }
    }

    /// Returns `true` for stages that are installed conditionally.
    #[must_use]
    pub const fn is_optional(self) -> bool {
        matches!(self, Self::MutualTls)
    }

    /// Returns all stages in order.
    #[must_use]
    pub const fn all() -> [Self; 6] {
        [
            Self::Recovery,
            Self::Viewer,
            Self::AccessLog,
            Self::MutualTls,
            Self::Audit,
            Self::Validation,
        ]
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// The ordered, immutable stage chain.
///
/// A `Pipeline` is built once at startup and shared by all concurrent
/// calls; it holds no per-call state.
///
/// # Example
///
/// ```
/// use ipamd_middleware::{Pipeline, Stage};
/// use ipamd_middleware::stages::{RecoveryMiddleware, ViewerMiddleware};
///
/// let pipeline = Pipeline::builder()
///     .stage(Stage::Viewer, ViewerMiddleware::system())
///     .stage(Stage::Recovery, RecoveryMiddleware::new())
///     .build();
///
/// assert_eq!(pipeline.stage_names(), vec!["recovery", "system_viewer"]);
/// ```
#[derive(Clone)]
pub struct Pipeline {
    stages: Vec<(Stage, BoxedMiddleware)>,
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("stages", &self.stage_names())
            .finish()
    }
}

impl Pipeline {
    /// Creates a new pipeline builder.
    #[must_use]
    pub fn builder() -> PipelineBuilder {
        PipelineBuilder::new()
    }

    /// Builds the production chain.
    ///
    /// Recovery, viewer, access log, audit and validation are always
    /// installed. The mutual-TLS stage is installed only for
    /// [`ClientAuth::Verify`]; otherwise a single warning with the reason is
    /// logged here and the `ipamd_mtls_enabled` gauge reads 0.
    #[must_use]
    pub fn assemble(
        settings: &PipelineSettings,
        client_auth: ClientAuth,
        sink: Arc<dyn AuditSink>,
        schemas: SchemaSet,
    ) -> Self {
        let divergence = settings
            .public_operations
            .divergence(&settings.audit_skip_operations);
        if !divergence.is_empty() {
            tracing::warn!(
                operations = ?divergence,
                "public allow-list and audit skip-list differ"
            );
        }

        let mut builder = Self::builder()
            .stage(
                Stage::Recovery,
                RecoveryMiddleware::new().with_labels(settings.metric_labels.clone()),
            )
            .stage(Stage::Viewer, ViewerMiddleware::system())
            .stage(
                Stage::AccessLog,
                AccessLogMiddleware::new(settings.service_name.clone())
                    .with_labels(settings.metric_labels.clone()),
            )
            .stage(
                Stage::Audit,
                AuditMiddleware::new(settings.audit_skip_operations.clone(), sink)
                    .with_service_name(settings.service_name.clone())
                    .with_write_grace(settings.audit_write_grace),
            )
            .stage(Stage::Validation, ValidationMiddleware::new(schemas));

        match client_auth {
            ClientAuth::Verify(verifier) => {
                tracing::info!(
                    public_operations = settings.public_operations.len(),
                    "mutual TLS enforced on protected operations"
                );
                ipamd_telemetry::metrics::set_mtls_enabled(true);
                builder = builder.stage(
                    Stage::MutualTls,
                    MutualTlsMiddleware::new(settings.public_operations.clone(), verifier),
                );
            }
            ClientAuth::Disabled { reason } => {
                tracing::warn!(
                    reason = %reason,
                    "mutual TLS disabled; protected operations accept callers without a client certificate"
                );
                ipamd_telemetry::metrics::set_mtls_enabled(false);
            }
        }

        builder.build()
    }

    /// Processes a call through every stage and then `handler`.
    ///
    /// The handler is skipped when an authentication rejection is still
    /// pending after the last stage; the rejection is returned instead.
    pub async fn process<H>(
        &self,
        ctx: &mut MiddlewareContext,
        request: RpcRequest,
        handler: H,
    ) -> RpcResult<Reply>
    where
        H: FnOnce(&mut MiddlewareContext, RpcRequest) -> BoxFuture<'static, RpcResult<Reply>>
            + Send
            + 'static,
    {
        let next = self.build_chain(handler);
        next.run(ctx, request).await
    }

    fn build_chain<'a, H>(&'a self, handler: H) -> Next<'a>
    where
        H: FnOnce(&mut MiddlewareContext, RpcRequest) -> BoxFuture<'static, RpcResult<Reply>>
            + Send
            + 'a,
    {
        let mut next = Next::dispatch(move |ctx, request| -> BoxFuture<'static, RpcResult<Reply>> {
            match ctx.take_rejection() {
                Some(rejection) => Box::pin(std::future::ready(Err(rejection))),
                None => handler(ctx, request),
            }
        });

        for (_, middleware) in self.stages.iter().rev() {
            next = Next::new(middleware.as_ref(), next);
        }

        next
    }

    /// Returns the installed stages in order.
    #[must_use]
    pub fn stages(&self) -> Vec<Stage> {
        self.stages.iter().map(|(stage, _)| *stage).collect()
    }

    /// Returns the names of the installed middleware in order.
    #[must_use]
    pub fn stage_names(&self) -> Vec<&'static str> {
        self.stages.iter().map(|(_, mw)| mw.name()).collect()
    }

    /// Returns the number of installed stages.
    #[must_use]
    pub fn stage_count(&self) -> usize {
        self.stages.len()
    }

    /// Returns `true` if `stage` is installed.
    #[must_use]
    pub fn contains(&self, stage: Stage) -> bool {
        self.stages.iter().any(|(s, _)| *s == stage)
    }
}

/// Builder for constructing a [`Pipeline`].
///
/// Each [`Stage`] holds at most one middleware; setting a stage twice keeps
/// the last value.
#[derive(Default)]
pub struct PipelineBuilder {
    stages: BTreeMap<Stage, BoxedMiddleware>,
}

impl PipelineBuilder {
    /// Creates an empty builder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Installs `middleware` at `stage`.
    #[must_use]
    pub fn stage<M: Middleware>(mut self, stage: Stage, middleware: M) -> Self {
        self.stages.insert(stage, Arc::new(middleware));
        self
    }

    /// Builds the pipeline.
    #[must_use]
    pub fn build(self) -> Pipeline {
        Pipeline {
            stages: self.stages.into_iter().collect(),
        }
    }
}

/// Whether the mutual-TLS stage is installed.
pub enum ClientAuth {
    /// Enforce client certificates with this verifier.
    Verify(Arc<dyn CertificateVerifier>),
    /// Run without mutual authentication.
    Disabled {
        /// Why no verifier is available, e.g. TLS not configured.
        reason: String,
    },
}

impl ClientAuth {
    /// Creates the disabled variant.
    #[must_use]
    pub fn disabled(reason: impl Into<String>) -> Self {
        Self::Disabled {
            reason: reason.into(),
        }
    }

    /// Returns `true` if a verifier is present.
    #[must_use]
    pub const fn is_enabled(&self) -> bool {
        matches!(self, Self::Verify(_))
    }
}

impl std::fmt::Debug for ClientAuth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Verify(_) => f.write_str("Verify"),
            Self::Disabled { reason } => f.debug_struct("Disabled").field("reason", reason).finish(),
        }
    }
}

/// Typed inputs of [`Pipeline::assemble`].
#[derive(Debug, Clone)]
pub struct PipelineSettings {
    /// Operations reachable without a client certificate.
    pub public_operations: EndpointMatcher,
    /// Operations that produce no audit entry.
    pub audit_skip_operations: EndpointMatcher,
    /// Service name recorded in logs and audit entries.
    pub service_name: String,
    /// Time the audit sink may run past the call deadline.
    pub audit_write_grace: Duration,
    /// Operations recorded verbatim as metric labels.
    pub metric_labels: OperationLabels,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        let baseline = EndpointMatcher::with_baseline(Vec::<String>::new());
        Self {
            public_operations: baseline.clone(),
            audit_skip_operations: baseline,
            service_name: audit::DEFAULT_SERVICE_NAME.to_string(),
            audit_write_grace: audit::DEFAULT_WRITE_GRACE,
            metric_labels: OperationLabels::default(),
        }
    }
}
