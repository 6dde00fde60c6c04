//! Handler traits for request processing.
//!
//! Services implement the typed [`Handler`] trait. The registry stores them
//! behind [`ErasedHandler`], which decodes the JSON payload into the request
//! type and encodes the response back.

use crate::{RequestContext, RpcError, RpcResult};
use serde::{de::DeserializeOwned, Serialize};
use std::future::Future;
use std::marker::PhantomData;
use std::pin::Pin;

/// A boxed future that is `Send` and has a lifetime `'a`.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// A trait for handling typed requests.
///
/// # Example
///
/// ```rust,ignore
/// use ipamd_core::{Handler, RequestContext, RpcResult};
/// use serde::{Deserialize, Serialize};
///
/// #[derive(Deserialize)]
/// struct GetVlanRequest {
///     id: u32,
/// }
///
/// #[derive(Serialize)]
/// struct Vlan {
///     id: u32,
///     name: String,
/// }
///
/// struct GetVlanHandler;
///
/// impl Handler<GetVlanRequest, Vlan> for GetVlanHandler {
///     async fn handle(&self, ctx: &RequestContext, req: GetVlanRequest) -> RpcResult<Vlan> {
///         Ok(Vlan { id: req.id, name: "mgmt".to_string() })
///     }
/// }
/// ```
pub trait Handler<Req, Res>: Send + Sync + 'static
where
    Req: DeserializeOwned + Send + 'static,
    Res: Serialize + Send + 'static,
{
    /// Handles a decoded request.
    fn handle(
        &self,
        ctx: &RequestContext,
        request: Req,
    ) -> impl Future<Output = RpcResult<Res>> + Send;
}

/// A type-erased handler stored in the registry.
pub trait ErasedHandler: Send + Sync + 'static {
    /// Decodes `payload`, runs the handler and encodes its response.
    fn call<'a>(
        &'a self,
        ctx: &'a RequestContext,
        payload: serde_json::Value,
    ) -> BoxFuture<'a, RpcResult<serde_json::Value>>;
}

/// Adapts a typed [`Handler`] to [`ErasedHandler`].
pub struct TypedHandler<H, Req, Res> {
    handler: H,
    _marker: PhantomData<fn(Req) -> Res>,
}

impl<H, Req, Res> TypedHandler<H, Req, Res> {
    /// Wraps a typed handler.
    #[must_use]
    pub const fn new(handler: H) -> Self {
        Self {
            handler,
            _marker: PhantomData,
        }
    }
}

impl<H, Req, Res> ErasedHandler for TypedHandler<H, Req, Res>
where
    H: Handler<Req, Res>,
    Req: DeserializeOwned + Send + 'static,
    Res: Serialize + Send + 'static,
{
    fn call<'a>(
        &'a self,
        ctx: &'a RequestContext,
        payload: serde_json::Value,
    ) -> BoxFuture<'a, RpcResult<serde_json::Value>> {
        Box::pin(async move {
            let request: Req = decode_payload(payload)?;
            let response = self.handler.handle(ctx, request).await?;
            serde_json::to_value(response)
                .map_err(|e| RpcError::internal_with_source("failed to encode response", e))
        })
    }
}

/// Decodes a request payload. A JSON `null` stands for an empty message.
fn decode_payload<Req: DeserializeOwned>(payload: serde_json::Value) -> RpcResult<Req> {
    let payload = if payload.is_null() {
        serde_json::Value::Object(serde_json::Map::new())
    } else {
        payload
    };
    serde_json::from_value(payload)
        .map_err(|e| RpcError::invalid_argument(format!("malformed request payload: {e}")))
}

/// A closure-based handler.
///
/// The closure receives an owned copy of the context so the returned future
/// can be `'static`.
///
/// # Example
///
/// ```rust,ignore
/// let handler = FnHandler::new(|ctx: RequestContext, req: Empty| async move {
///     Ok(serde_json::json!({ "status": "SERVING" }))
/// });
/// ```
pub struct FnHandler<F> {
    func: F,
}

impl<F> FnHandler<F> {
    /// Creates a new closure-based handler.
    #[must_use]
    pub const fn new(func: F) -> Self {
        Self { func }
    }
}

impl<F, Fut, Req, Res> Handler<Req, Res> for FnHandler<F>
where
    F: Fn(RequestContext, Req) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = RpcResult<Res>> + Send + 'static,
    Req: DeserializeOwned + Send + 'static,
    Res: Serialize + Send + 'static,
{
    fn handle(
        &self,
        ctx: &RequestContext,
        request: Req,
    ) -> impl Future<Output = RpcResult<Res>> + Send {
        (self.func)(ctx.clone(), request)
    }
}

/// Empty request or response message.
#[derive(Debug, Clone, Default, serde::Deserialize, serde::Serialize)]
pub struct Empty {}
