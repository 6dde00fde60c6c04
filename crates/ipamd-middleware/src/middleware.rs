//! Core middleware trait and types.
//!
//! Every pipeline stage implements [`Middleware`]: it receives the mutable
//! context, the request and a [`Next`] handle, and either forwards to the
//! rest of the chain or returns its own terminal result.
//!
//! # Example
//!
//! ```ignore
//! use ipamd_middleware::{BoxFuture, Middleware, MiddlewareContext, Next, Reply, RpcRequest};
//! use ipamd_core::RpcResult;
//!
//! struct Timing;
//!
//! impl Middleware for Timing {
//!     fn name(&self) -> &'static str {
//!         "timing"
//!     }
//!
//!     fn process<'a>(
//!         &'a self,
//!         ctx: &'a mut MiddlewareContext,
//!         request: RpcRequest,
//!         next: Next<'a>,
//!     ) -> BoxFuture<'a, RpcResult<Reply>> {
//!         Box::pin(async move {
//!             let result = next.run(ctx, request).await;
//!             tracing::debug!(elapsed = ?ctx.elapsed(), "done");
//!             result
//!         })
//!     }
//! }
//! ```

use crate::context::MiddlewareContext;
use crate::types::{Reply, RpcRequest};
use ipamd_core::RpcResult;

pub use ipamd_core::BoxFuture;

/// The core middleware trait.
///
/// # Invariants
///
/// - A stage calls `next.run()` at most once
/// - A stage never swallows an error returned from further down the chain
/// - A stage never reorders the pipeline
pub trait Middleware: Send + Sync + 'static {
    /// Returns the unique name of this stage.
    fn name(&self) -> &'static str;

    /// Processes the call through this stage.
    fn process<'a>(
        &'a self,
        ctx: &'a mut MiddlewareContext,
        request: RpcRequest,
        next: Next<'a>,
    ) -> BoxFuture<'a, RpcResult<Reply>>;
}

/// Terminal dispatch invoked after the last stage.
pub type Dispatch<'a> = Box<
    dyn FnOnce(&mut MiddlewareContext, RpcRequest) -> BoxFuture<'static, RpcResult<Reply>>
        + Send
        + 'a,
>;

/// Handle to the remainder of the chain.
///
/// Consumed by [`Next::run`], so it can only be invoked once.
pub struct Next<'a> {
    inner: NextInner<'a>,
}

enum NextInner<'a> {
    Chain {
        middleware: &'a dyn Middleware,
        next: Box<Next<'a>>,
    },
    Dispatch(Dispatch<'a>),
}

impl<'a> Next<'a> {
    /// Creates a `Next` that invokes `middleware` with `next` behind it.
    pub(crate) fn new(middleware: &'a dyn Middleware, next: Next<'a>) -> Self {
        Self {
            inner: NextInner::Chain {
                middleware,
                next: Box::new(next),
            },
        }
    }

    /// Creates a terminal `Next` that dispatches to the handler.
    pub fn dispatch<F>(f: F) -> Self
    where
        F: FnOnce(&mut MiddlewareContext, RpcRequest) -> BoxFuture<'static, RpcResult<Reply>>
            + Send
            + 'a,
    {
        Self {
            inner: NextInner::Dispatch(Box::new(f)),
        }
    }

    /// Invokes the next stage or the handler dispatch.
    pub async fn run(self, ctx: &mut MiddlewareContext, request: RpcRequest) -> RpcResult<Reply> {
        match self.inner {
            NextInner::Chain { middleware, next } => middleware.process(ctx, request, *next).await,
            NextInner::Dispatch(dispatch) => dispatch(ctx, request).await,
        }
    }
}
