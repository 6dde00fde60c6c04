//! Audit recording middleware.
//!
//! For every operation not on the audit skip-list, exactly one
//! [`AuditEntry`] is built after the rest of the chain returns and handed to
//! an [`AuditSink`]. Sink failures are logged and counted but never change
//! the call's outcome.
//!
//! The sink write is bounded by the call deadline plus a short grace period,
//! so a call that failed with `DeadlineExceeded` is still audited. A fault
//! unwinding from below is audited as `InternalFault` and then resumed for
//! the recovery stage.
//!
//! # Pipeline Position
//!
//! ```text
//! Recovery → Viewer → AccessLog → MutualTls? → [Audit] → Validation → Handler
//! ```

use crate::{
    context::MiddlewareContext,
    matcher::EndpointMatcher,
    middleware::{BoxFuture, Middleware, Next},
    stages::mtls::PeerAuthentication,
    types::{Reply, RpcRequest},
};
use chrono::{DateTime, Utc};
use futures_util::FutureExt;
use ipamd_core::{Deadline, ErrorCategory, OperationId, RequestId, RpcError, RpcResult};
use ipamd_telemetry::metrics;
use parking_lot::Mutex;
use serde::Serialize;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;

/// Default service name recorded in audit metadata.
pub const DEFAULT_SERVICE_NAME: &str = "ipam-service";

/// Default extra time granted to the sink past the call deadline.
pub const DEFAULT_WRITE_GRACE: Duration = Duration::from_secs(1);

/// Structured record of a privileged call.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AuditEntry {
    /// Who made the call.
    pub actor: String,
    /// What was called.
    pub operation: OperationId,
    /// When the call completed.
    pub timestamp: DateTime<Utc>,
    /// How the call ended.
    pub outcome: AuditOutcome,
    /// Correlation and timing details.
    pub metadata: AuditMetadata,
}

/// Outcome classification of an audited call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum AuditOutcome {
    /// The handler returned a reply.
    Success,
    /// The call ended with an error.
    Failure {
        /// Error class.
        category: ErrorCategory,
        /// Caller-visible error message.
        message: String,
    },
}

impl AuditOutcome {
    /// Returns `true` for [`AuditOutcome::Success`].
    #[must_use]
    pub const fn is_success(&self) -> bool {
        matches!(self, Self::Success)
    }

    /// Returns the error class of a failure.
    #[must_use]
    pub const fn category(&self) -> Option<ErrorCategory> {
        match self {
            Self::Success => None,
            Self::Failure { category, .. } => Some(*category),
        }
    }
}

/// Correlation and timing details of an audit entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AuditMetadata {
    /// Name of the service that handled the call.
    pub service_name: String,
    /// Request id of the call.
    pub request_id: RequestId,
    /// Time spent below the audit stage, in milliseconds.
    pub latency_ms: u64,
    /// Remote peer address, if known.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub peer_address: Option<String>,
    /// Whether the caller presented a verified client certificate.
    pub authenticated: bool,
}

impl AuditEntry {
    /// Builds the entry for a finished call.
    #[must_use]
    pub fn record(
        ctx: &MiddlewareContext,
        result: &RpcResult<Reply>,
        latency: Duration,
        service_name: &str,
    ) -> Self {
        let outcome = match result {
            Ok(_) => AuditOutcome::Success,
            Err(e) => AuditOutcome::Failure {
                category: e.category(),
                message: e.public_message(),
            },
        };

        let authenticated = ctx.identity().is_authenticated()
            && ctx.get_extension::<PeerAuthentication>() == Some(&PeerAuthentication::Verified);

        Self {
            actor: ctx.identity().actor().to_string(),
            operation: ctx.operation_id().clone(),
            timestamp: Utc::now(),
            outcome,
            metadata: AuditMetadata {
                service_name: service_name.to_string(),
                request_id: ctx.request_id(),
                latency_ms: u64::try_from(latency.as_millis()).unwrap_or(u64::MAX),
                peer_address: ctx.peer_address().map(|a| a.to_string()),
                authenticated,
            },
        }
    }
}

/// Why an audit sink could not persist an entry.
#[derive(Debug, Error)]
pub enum AuditSinkError {
    /// The backing store is unreachable.
    #[error("audit sink unavailable: {0}")]
    Unavailable(String),

    /// The backing store refused the entry.
    #[error("audit entry rejected: {0}")]
    Rejected(String),
}

impl AuditSinkError {
    /// Returns the metric label for this failure.
    #[must_use]
    pub const fn reason(&self) -> &'static str {
        match self {
            Self::Unavailable(_) => "unavailable",
            Self::Rejected(_) => "rejected",
        }
    }
}

/// Persists audit entries.
///
/// Implementations are shared by all concurrent calls and must accept
/// concurrent writes. Each entry is written independently.
pub trait AuditSink: Send + Sync + 'static {
    /// Persists one entry.
    fn write<'a>(&'a self, entry: AuditEntry) -> BoxFuture<'a, Result<(), AuditSinkError>>;
}

/// Keeps entries in memory. Intended for tests and local development.
#[derive(Debug, Default)]
pub struct InMemoryAuditSink {
    entries: Mutex<Vec<AuditEntry>>,
}

impl InMemoryAuditSink {
    /// Creates an empty sink.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a copy of all entries in write order.
    #[must_use]
    pub fn entries(&self) -> Vec<AuditEntry> {
        self.entries.lock().clone()
    }

    /// Returns the entries recorded for `operation`.
    #[must_use]
    pub fn entries_for(&self, operation: &str) -> Vec<AuditEntry> {
        self.entries
            .lock()
            .iter()
            .filter(|e| e.operation.as_str() == operation)
            .cloned()
            .collect()
    }

    /// Returns the number of entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Returns `true` if nothing was recorded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Removes all entries.
    pub fn clear(&self) {
        self.entries.lock().clear();
    }
}

impl AuditSink for InMemoryAuditSink {
    fn write<'a>(&'a self, entry: AuditEntry) -> BoxFuture<'a, Result<(), AuditSinkError>> {
        self.entries.lock().push(entry);
        Box::pin(std::future::ready(Ok(())))
    }
}

/// Emits each entry as a structured `info!` event on the `ipamd::audit`
/// target.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingAuditSink;

impl AuditSink for TracingAuditSink {
    fn write<'a>(&'a self, entry: AuditEntry) -> BoxFuture<'a, Result<(), AuditSinkError>> {
        let category = entry.outcome.category().map(|c| c.as_str());
        tracing::info!(
            target: "ipamd::audit",
            actor = %entry.actor,
            operation = %entry.operation,
            timestamp = %entry.timestamp.to_rfc3339(),
            success = entry.outcome.is_success(),
            category,
            service = %entry.metadata.service_name,
            request_id = %entry.metadata.request_id,
            latency_ms = entry.metadata.latency_ms,
            peer = entry.metadata.peer_address.as_deref(),
            authenticated = entry.metadata.authenticated,
            "audit"
        );
        Box::pin(std::future::ready(Ok(())))
    }
}

/// Records one audit entry per non-skip-listed call.
pub struct AuditMiddleware {
    skip: EndpointMatcher,
    sink: Arc<dyn AuditSink>,
    service_name: String,
    write_grace: Duration,
}

impl AuditMiddleware {
    /// Creates the stage with the default service name and write grace.
    #[must_use]
    pub fn new(skip: EndpointMatcher, sink: Arc<dyn AuditSink>) -> Self {
        Self {
            skip,
            sink,
            service_name: DEFAULT_SERVICE_NAME.to_string(),
            write_grace: DEFAULT_WRITE_GRACE,
        }
    }

    /// Sets the service name recorded in entries.
    #[must_use]
    pub fn with_service_name(mut self, service_name: impl Into<String>) -> Self {
        self.service_name = service_name.into();
        self
    }

    /// Sets the time the sink may run past the call deadline.
    #[must_use]
    pub fn with_write_grace(mut self, write_grace: Duration) -> Self {
        self.write_grace = write_grace;
        self
    }

    async fn persist(&self, deadline: &Deadline, entry: AuditEntry) {
        let operation = entry.operation.clone();
        let request_id = entry.metadata.request_id;
        let write = self.sink.write(entry);

        match deadline
            .run_with_grace("audit sink write", self.write_grace, write)
            .await
        {
            Ok(Ok(())) => metrics::record_audit_entry(),
            Ok(Err(e)) => {
                tracing::error!(
                    operation = %operation,
                    request_id = %request_id,
                    error = %e,
                    "failed to persist audit entry"
                );
                metrics::record_audit_sink_failure(e.reason());
            }
            Err(e) => {
                tracing::error!(
                    operation = %operation,
                    request_id = %request_id,
                    error = %e,
                    "abandoned audit entry write"
                );
                metrics::record_audit_sink_failure(e.category().as_str());
            }
        }
    }
}

impl std::fmt::Debug for AuditMiddleware {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuditMiddleware")
            .field("skip", &self.skip)
            .field("service_name", &self.service_name)
            .field("write_grace", &self.write_grace)
            .finish_non_exhaustive()
    }
}

impl Middleware for AuditMiddleware {
    fn name(&self) -> &'static str {
        "audit"
    }

    fn process<'a>(
        &'a self,
        ctx: &'a mut MiddlewareContext,
        request: RpcRequest,
        next: Next<'a>,
    ) -> BoxFuture<'a, RpcResult<Reply>> {
        Box::pin(async move {
            let pending_rejection = ctx.take_rejection();

            if !self.skip.is_protected(ctx.operation_id().as_str()) {
                return match pending_rejection {
                    Some(rejection) => Err(rejection),
                    None => next.run(ctx, request).await,
                };
            }

            let start = Instant::now();
            let outcome = match pending_rejection {
                Some(rejection) => Ok(Err(rejection)),
                None => AssertUnwindSafe(next.run(ctx, request)).catch_unwind().await,
            };

            match outcome {
                Ok(result) => {
                    let entry =
                        AuditEntry::record(ctx, &result, start.elapsed(), &self.service_name);
                    self.persist(ctx.deadline(), entry).await;
                    result
                }
                Err(payload) => {
                    // Record the fault, then let the recovery stage report it.
                    let fault = Err(RpcError::internal(format!(
                        "internal fault while handling {}",
                        ctx.operation_id()
                    )));
                    let entry =
                        AuditEntry::record(ctx, &fault, start.elapsed(), &self.service_name);
                    self.persist(ctx.deadline(), entry).await;
                    std::panic::resume_unwind(payload)
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ipamd_core::CallerIdentity;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FailingSink;

    impl AuditSink for FailingSink {
        fn write<'a>(&'a self, _entry: AuditEntry) -> BoxFuture<'a, Result<(), AuditSinkError>> {
            Box::pin(async { Err(AuditSinkError::Unavailable("database is down".to_string())) })
        }
    }

    struct HangingSink;

    impl AuditSink for HangingSink {
        fn write<'a>(&'a self, _entry: AuditEntry) -> BoxFuture<'a, Result<(), AuditSinkError>> {
            Box::pin(std::future::pending::<Result<(), AuditSinkError>>())
        }
    }

    /// Yields once before storing, like a sink doing real I/O.
    struct YieldingSink {
        inner: InMemoryAuditSink,
    }

    impl AuditSink for YieldingSink {
        fn write<'a>(&'a self, entry: AuditEntry) -> BoxFuture<'a, Result<(), AuditSinkError>> {
            Box::pin(async move {
                tokio::task::yield_now().await;
                self.inner.write(entry).await
            })
        }
    }

    fn ctx(operation: &str) -> MiddlewareContext {
        MiddlewareContext::new(operation, Deadline::after(Duration::from_secs(5)))
    }

    fn counting_dispatch(
        calls: Arc<AtomicUsize>,
        result: fn() -> RpcResult<Reply>,
    ) -> Next<'static> {
        Next::dispatch(move |_ctx, _req| {
            calls.fetch_add(1, Ordering::SeqCst);
            Box::pin(async move { result() })
        })
    }

    fn ok_reply() -> RpcResult<Reply> {
        Ok(serde_json::json!({"total_subnets": 3}))
    }

    fn bad_argument() -> RpcResult<Reply> {
        Err(RpcError::invalid_argument("tenant_id must be an integer"))
    }

    #[tokio::test]
    async fn test_success_is_audited_once() {
        let sink = Arc::new(InMemoryAuditSink::new());
        let middleware = AuditMiddleware::new(EndpointMatcher::new(["HealthCheck"]), sink.clone());
        let calls = Arc::new(AtomicUsize::new(0));
        let mut ctx = ctx("GetStats");
        ctx.set_identity(CallerIdentity::certificate("admin-gateway", vec![]));
        ctx.set_extension(PeerAuthentication::Verified);

        middleware
            .process(
                &mut ctx,
                RpcRequest::new("GetStats", Reply::Null),
                counting_dispatch(calls.clone(), ok_reply),
            )
            .await
            .unwrap();

        let entries = sink.entries();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].actor, "admin-gateway");
        assert_eq!(entries[0].operation.as_str(), "GetStats");
        assert!(entries[0].outcome.is_success());
        assert!(entries[0].metadata.authenticated);
        assert_eq!(entries[0].metadata.service_name, DEFAULT_SERVICE_NAME);
        assert_eq!(entries[0].metadata.request_id, ctx.request_id());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_failure_is_classified() {
        let sink = Arc::new(InMemoryAuditSink::new());
        let middleware = AuditMiddleware::new(EndpointMatcher::default(), sink.clone())
            .with_service_name("ipam-test");
        let mut ctx = ctx("GetStats");

        let result = middleware
            .process(
                &mut ctx,
                RpcRequest::new("GetStats", Reply::Null),
                counting_dispatch(Arc::new(AtomicUsize::new(0)), bad_argument),
            )
            .await;
        assert!(result.is_err());

        let entries = sink.entries();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].actor, "anonymous");
        assert_eq!(
            entries[0].outcome.category(),
            Some(ErrorCategory::InvalidArgument)
        );
        assert!(!entries[0].metadata.authenticated);
        assert_eq!(entries[0].metadata.service_name, "ipam-test");
    }

    #[tokio::test]
    async fn test_skip_listed_operation_is_not_audited() {
        let sink = Arc::new(InMemoryAuditSink::new());
        let middleware = AuditMiddleware::new(EndpointMatcher::new(["HealthCheck"]), sink.clone());
        let calls = Arc::new(AtomicUsize::new(0));
        let mut ctx = ctx("HealthCheck");

        middleware
            .process(
                &mut ctx,
                RpcRequest::new("HealthCheck", Reply::Null),
                counting_dispatch(calls.clone(), ok_reply),
            )
            .await
            .unwrap();

        assert!(sink.is_empty());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_pending_rejection_is_audited_and_stops_chain() {
        let sink = Arc::new(InMemoryAuditSink::new());
        let middleware = AuditMiddleware::new(EndpointMatcher::default(), sink.clone());
        let calls = Arc::new(AtomicUsize::new(0));
        let mut ctx = ctx("GetStats");
        ctx.set_extension(PeerAuthentication::Rejected);
        ctx.reject(RpcError::permission_denied("client certificate required"));

        let err = middleware
            .process(
                &mut ctx,
                RpcRequest::new("GetStats", Reply::Null),
                counting_dispatch(calls.clone(), ok_reply),
            )
            .await
            .unwrap_err();

        assert!(matches!(err, RpcError::PermissionDenied { .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        let entries = sink.entries();
        assert_eq!(entries.len(), 1);
        assert_eq!(
            entries[0].outcome.category(),
            Some(ErrorCategory::PermissionDenied)
        );
    }

    #[tokio::test]
    async fn test_sink_failure_does_not_fail_call() {
        let middleware = AuditMiddleware::new(EndpointMatcher::default(), Arc::new(FailingSink));
        let mut ctx = ctx("GetStats");

        let reply = middleware
            .process(
                &mut ctx,
                RpcRequest::new("GetStats", Reply::Null),
                counting_dispatch(Arc::new(AtomicUsize::new(0)), ok_reply),
            )
            .await
            .unwrap();
        assert_eq!(reply["total_subnets"], 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_hanging_sink_is_abandoned_after_grace() {
        let middleware = AuditMiddleware::new(EndpointMatcher::default(), Arc::new(HangingSink))
            .with_write_grace(Duration::from_millis(200));
        let mut ctx = MiddlewareContext::new("GetStats", Deadline::after(Duration::from_millis(100)));
        let started = tokio::time::Instant::now();

        let reply = middleware
            .process(
                &mut ctx,
                RpcRequest::new("GetStats", Reply::Null),
                counting_dispatch(Arc::new(AtomicUsize::new(0)), ok_reply),
            )
            .await;
        assert!(reply.is_ok());
        assert!(started.elapsed() >= Duration::from_millis(300));
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_call_is_still_audited() {
        let sink = Arc::new(YieldingSink {
            inner: InMemoryAuditSink::new(),
        });
        let middleware = AuditMiddleware::new(EndpointMatcher::default(), sink.clone());
        let mut ctx = ctx("/ipam.service.v1.IpScanService/StartScan");
        let token = ctx.deadline().cancellation().clone();

        let next = Next::dispatch(move |_ctx, _req| {
            token.cancel();
            Box::pin(async { Err(RpcError::cancelled("call cancelled during handler")) })
        });
        let result = middleware
            .process(
                &mut ctx,
                RpcRequest::new("/ipam.service.v1.IpScanService/StartScan", Reply::Null),
                next,
            )
            .await;

        assert!(result.is_err());
        let entries = sink.inner.entries();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].outcome.category(), Some(ErrorCategory::Cancelled));
    }

    #[test]
    fn test_entry_serialization() {
        let mut ctx = MiddlewareContext::new("GetStats", Deadline::at(tokio::time::Instant::now()));
        ctx.set_identity(CallerIdentity::certificate("admin-gateway", vec![]));
        let entry = AuditEntry::record(
            &ctx,
            &Err(RpcError::permission_denied("client certificate required")),
            Duration::from_millis(12),
            DEFAULT_SERVICE_NAME,
        );

        let json = serde_json::to_value(&entry).unwrap();
        assert_eq!(json["operation"], "GetStats");
        assert_eq!(json["outcome"]["status"], "failure");
        assert_eq!(json["outcome"]["category"], "permission_denied");
        assert_eq!(json["metadata"]["latency_ms"], 12);
        assert!(json["metadata"].get("peer_address").is_none());
    }

    #[test]
    fn test_sink_error_reasons() {
        assert_eq!(AuditSinkError::Unavailable(String::new()).reason(), "unavailable");
        assert_eq!(AuditSinkError::Rejected(String::new()).reason(), "rejected");
    }
}
