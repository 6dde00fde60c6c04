//! Fault recovery middleware.
//!
//! Outermost stage. A panic anywhere beneath it (a later stage or the
//! handler) is caught and converted into an internal error for this call
//! only; the server keeps serving other calls.
//!
//! # Pipeline Position
//!
//! ```text
//! [Recovery] → Viewer → AccessLog → MutualTls? → Audit → Validation → Handler
//! ```

use crate::{
    context::MiddlewareContext,
    labels::OperationLabels,
    middleware::{BoxFuture, Middleware, Next},
    types::{Reply, RpcRequest},
};
use futures_util::FutureExt;
use ipamd_core::{RpcError, RpcResult};
use std::any::Any;
use std::panic::AssertUnwindSafe;

/// Converts panics below it into [`RpcError::Internal`].
#[derive(Debug, Clone, Default)]
pub struct RecoveryMiddleware {
    labels: OperationLabels,
}

impl RecoveryMiddleware {
    /// Creates the recovery stage.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Restricts metric labels to the given registered operations.
    #[must_use]
    pub fn with_labels(mut self, labels: OperationLabels) -> Self {
        self.labels = labels;
        self
    }
}

/// Extracts a printable message from a panic payload.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(message) = payload.downcast_ref::<&'static str>() {
        message
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message
    } else {
        "non-string panic payload"
    }
}

impl Middleware for RecoveryMiddleware {
    fn name(&self) -> &'static str {
        "recovery"
    }

    fn process<'a>(
        &'a self,
        ctx: &'a mut MiddlewareContext,
        request: RpcRequest,
        next: Next<'a>,
    ) -> BoxFuture<'a, RpcResult<Reply>> {
        Box::pin(async move {
            let operation = ctx.operation_id().clone();
            let request_id = ctx.request_id();

            match AssertUnwindSafe(next.run(ctx, request)).catch_unwind().await {
                Ok(result) => result,
                Err(payload) => {
                    tracing::error!(
                        operation = %operation,
                        request_id = %request_id,
                        panic = panic_message(payload.as_ref()),
                        "recovered from fault while handling call"
                    );
                    ipamd_telemetry::metrics::record_recovered_fault(
                        self.labels.label(operation.as_str()),
                    );
                    Err(RpcError::internal(format!(
                        "internal fault while handling {operation}"
                    )))
                }
            }
        })
    }
}
