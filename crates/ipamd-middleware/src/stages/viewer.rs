//! Privilege context injection.
//!
//! Marks every call as issued by the system viewer so internal aggregation
//! queries see rows of all tenants. The marker is a typed context attribute;
//! storage code reads it through
//! [`RequestContext::query_scope`](ipamd_core::RequestContext::query_scope).

use crate::{
    context::MiddlewareContext,
    middleware::{BoxFuture, Middleware, Next},
    types::{Reply, RpcRequest},
};
use ipamd_core::{RpcResult, Viewer};

/// Attaches a fixed [`Viewer`] to the context.
#[derive(Debug, Clone, Copy)]
pub struct ViewerMiddleware {
    viewer: Viewer,
}

impl ViewerMiddleware {
    /// Injects [`Viewer::System`].
    #[must_use]
    pub const fn system() -> Self {
        Self {
            viewer: Viewer::System,
        }
    }

    /// Returns the injected viewer.
    #[must_use]
    pub const fn viewer(&self) -> Viewer {
        self.viewer
    }
}

impl Default for ViewerMiddleware {
    fn default() -> Self {
        Self::system()
    }
}

impl Middleware for ViewerMiddleware {
    fn name(&self) -> &'static str {
        "system_viewer"
    }

    fn process<'a>(
        &'a self,
        ctx: &'a mut MiddlewareContext,
        request: RpcRequest,
        next: Next<'a>,
    ) -> BoxFuture<'a, RpcResult<Reply>> {
        ctx.set_viewer(self.viewer);
        Box::pin(next.run(ctx, request))
    }
}
