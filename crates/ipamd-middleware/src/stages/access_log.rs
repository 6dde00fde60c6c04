//! Access log middleware.
//!
//! Logs the start and end of every call with latency and outcome, and
//! records the call counters and latency histogram. A fault unwinding from
//! below is logged as an internal fault before it continues to the recovery
//! stage.

use crate::{
    context::MiddlewareContext,
    middleware::{BoxFuture, Middleware, Next},
    types::{Reply, RpcRequest},
};
use crate::labels::OperationLabels;
use futures_util::FutureExt;
use ipamd_core::{RpcError, RpcResult};
use ipamd_telemetry::metrics;
use std::panic::AssertUnwindSafe;

/// Emits one structured log line and one set of metrics per call.
#[derive(Debug, Clone)]
pub struct AccessLogMiddleware {
    service_name: String,
    labels: OperationLabels,
}

/// Summary of a finished call, stored in the context for later inspection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallSummary {
    /// `ok` or the error category label.
    pub outcome: &'static str,
    /// Wall time spent below this stage, in milliseconds.
    pub duration_ms: u64,
}

impl AccessLogMiddleware {
    /// Creates the access log stage.
    #[must_use]
    pub fn new(service_name: impl Into<String>) -> Self {
        Self {
            service_name: service_name.into(),
            labels: OperationLabels::default(),
        }
    }

    /// Restricts metric labels to the given registered operations.
    #[must_use]
    pub fn with_labels(mut self, labels: OperationLabels) -> Self {
        self.labels = labels;
        self
    }
}

/// Keeps the in-flight gauge balanced when a fault unwinds through the stage.
struct InFlight;

impl InFlight {
    fn enter() -> Self {
        metrics::increment_in_flight();
        Self
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        metrics::decrement_in_flight();
    }
}

impl Middleware for AccessLogMiddleware {
    fn name(&self) -> &'static str {
        "access_log"
    }

    fn process<'a>(
        &'a self,
        ctx: &'a mut MiddlewareContext,
        request: RpcRequest,
        next: Next<'a>,
    ) -> BoxFuture<'a, RpcResult<Reply>> {
        Box::pin(async move {
            let start = std::time::Instant::now();
            let operation = ctx.operation_id().clone();

            tracing::debug!(
                service = %self.service_name,
                operation = %operation,
                request_id = %ctx.request_id(),
                peer = ?ctx.peer_address(),
                "call started"
            );
            let in_flight = InFlight::enter();
            let caught = AssertUnwindSafe(next.run(ctx, request)).catch_unwind().await;
            drop(in_flight);

            let (result, fault) = match caught {
                Ok(result) => (result, None),
                Err(payload) => (
                    Err(RpcError::internal(format!(
                        "internal fault while handling {operation}"
                    ))),
                    Some(payload),
                ),
            };

            let duration = start.elapsed();
            let duration_ms = u64::try_from(duration.as_millis()).unwrap_or(u64::MAX);
            let outcome = match &result {
                Ok(_) => "ok",
                Err(e) => e.category().as_str(),
            };

            match &result {
                Ok(_) => tracing::info!(
                    service = %self.service_name,
                    operation = %operation,
                    request_id = %ctx.request_id(),
                    actor = ctx.identity().actor(),
                    outcome,
                    duration_ms,
                    "call completed"
                ),
                Err(e) => tracing::warn!(
                    service = %self.service_name,
                    operation = %operation,
                    request_id = %ctx.request_id(),
                    actor = ctx.identity().actor(),
                    outcome,
                    code = e.status_name(),
                    error = %e,
                    duration_ms,
                    "call failed"
                ),
            }

            metrics::record_call(self.labels.label(operation.as_str()), outcome, duration);
            ctx.set_extension(CallSummary {
                outcome,
                duration_ms,
            });

            match fault {
                Some(payload) => std::panic::resume_unwind(payload),
                None => result,
            }
        })
    }
}
