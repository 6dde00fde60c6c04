//! Middleware context types.
//!
//! The [`MiddlewareContext`] carries state through the middleware pipeline.
//! Stages enrich it (viewer, identity, extensions); once the pipeline reaches
//! handler dispatch it is frozen into an immutable [`RequestContext`].

use crate::types::{metadata_keys, RpcRequest};
use ipamd_core::{CallerIdentity, Deadline, OperationId, RequestContext, RequestId, RpcError, Viewer};
use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Instant;

/// Context that flows through the middleware pipeline.
///
/// # Example
///
/// ```
/// use ipamd_core::{Deadline, Viewer};
/// use ipamd_middleware::context::MiddlewareContext;
/// use std::time::Duration;
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() {
/// let mut ctx = MiddlewareContext::new(
///     "/ipam.service.v1.SystemService/GetStats",
///     Deadline::after(Duration::from_secs(5)),
/// );
/// ctx.set_viewer(Viewer::System);
/// assert!(ctx.viewer().is_some_and(|v| v.is_system()));
/// # }
/// ```
#[derive(Debug)]
pub struct MiddlewareContext {
    request_id: RequestId,
    operation_id: OperationId,
    identity: CallerIdentity,
    viewer: Option<Viewer>,
    tenant_id: Option<u32>,
    deadline: Deadline,
    peer_address: Option<SocketAddr>,
    started_at: Instant,

    /// Authentication failure waiting to be audited and returned.
    rejection: Option<RpcError>,

    /// Type-erased extension data.
    extensions: HashMap<TypeId, Box<dyn Any + Send + Sync>>,
}

impl MiddlewareContext {
    /// Creates a context with a fresh request ID and an anonymous caller.
    #[must_use]
    pub fn new(operation_id: impl Into<OperationId>, deadline: Deadline) -> Self {
        Self {
            request_id: RequestId::new(),
            operation_id: operation_id.into(),
            identity: CallerIdentity::Anonymous,
            viewer: None,
            tenant_id: None,
            deadline,
            peer_address: None,
            started_at: Instant::now(),
            rejection: None,
            extensions: HashMap::new(),
        }
    }

    /// Creates the context for an inbound request.
    ///
    /// The request id is taken from the `x-request-id` metadata when it holds
    /// a UUID and generated otherwise. The tenant id is taken from
    /// `x-md-global-tenant-id` when it parses as an unsigned integer.
    #[must_use]
    pub fn for_request(request: &RpcRequest, deadline: Deadline) -> Self {
        let mut ctx = Self::new(request.operation().clone(), deadline);

        if let Some(request_id) = request
            .metadata_str(metadata_keys::REQUEST_ID)
            .and_then(RequestId::parse)
        {
            ctx.request_id = request_id;
        }

        ctx.tenant_id = request
            .metadata_str(metadata_keys::TENANT_ID)
            .and_then(|v| v.trim().parse().ok());
        ctx.peer_address = request.peer().address();
        ctx
    }

    /// Returns the request ID.
    #[must_use]
    pub const fn request_id(&self) -> RequestId {
        self.request_id
    }

    /// Returns the operation being invoked.
    #[must_use]
    pub const fn operation_id(&self) -> &OperationId {
        &self.operation_id
    }

    /// Returns the caller identity.
    #[must_use]
    pub const fn identity(&self) -> &CallerIdentity {
        &self.identity
    }

    /// Sets the caller identity.
    ///
    /// Only the mutual-TLS stage should call this.
    pub fn set_identity(&mut self, identity: CallerIdentity) {
        self.identity = identity;
    }

    /// Returns the privilege marker, if injected.
    #[must_use]
    pub const fn viewer(&self) -> Option<Viewer> {
        self.viewer
    }

    /// Sets the privilege marker.
    pub fn set_viewer(&mut self, viewer: Viewer) {
        self.viewer = Some(viewer);
    }

    /// Returns the tenant id supplied by the caller.
    #[must_use]
    pub const fn tenant_id(&self) -> Option<u32> {
        self.tenant_id
    }

    /// Returns the call deadline.
    #[must_use]
    pub const fn deadline(&self) -> &Deadline {
        &self.deadline
    }

    /// Returns the remote peer address, if known.
    #[must_use]
    pub const fn peer_address(&self) -> Option<SocketAddr> {
        self.peer_address
    }

    /// Returns the elapsed time since the call entered the pipeline.
    #[must_use]
    pub fn elapsed(&self) -> std::time::Duration {
        self.started_at.elapsed()
    }

    /// Marks the call as rejected by authentication.
    ///
    /// The rejection is returned to the caller by the first later stage that
    /// checks for it; the handler never runs while one is pending.
    pub fn reject(&mut self, error: RpcError) {
        self.rejection = Some(error);
    }

    /// Returns `true` if an authentication rejection is pending.
    #[must_use]
    pub const fn is_rejected(&self) -> bool {
        self.rejection.is_some()
    }

    /// Takes the pending authentication rejection.
    pub fn take_rejection(&mut self) -> Option<RpcError> {
        self.rejection.take()
    }

    /// Stores a typed extension value.
    pub fn set_extension<T: Send + Sync + 'static>(&mut self, value: T) {
        self.extensions.insert(TypeId::of::<T>(), Box::new(value));
    }

    /// Retrieves a typed extension value.
    #[must_use]
    pub fn get_extension<T: Send + Sync + 'static>(&self) -> Option<&T> {
        self.extensions
            .get(&TypeId::of::<T>())
            .and_then(|v| v.downcast_ref())
    }

    /// Removes and returns a typed extension value.
    pub fn remove_extension<T: Send + Sync + 'static>(&mut self) -> Option<T> {
        self.extensions
            .remove(&TypeId::of::<T>())
            .and_then(|v| v.downcast().ok())
            .map(|b| *b)
    }

    /// Freezes this context into the [`RequestContext`] handed to handlers.
    #[must_use]
    pub fn to_request_context(&self) -> RequestContext {
        let mut ctx = RequestContext::new(self.operation_id.clone())
            .with_request_id(self.request_id)
            .with_identity(self.identity.clone())
            .with_deadline(self.deadline.clone())
            .with_started_at(self.started_at);

        if let Some(viewer) = self.viewer {
            ctx = ctx.with_viewer(viewer);
        }
        if let Some(tenant_id) = self.tenant_id {
            ctx = ctx.with_tenant_id(tenant_id);
        }
        if let Some(peer_address) = self.peer_address {
            ctx = ctx.with_peer_address(peer_address);
        }

        ctx
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::PeerInfo;
    use http::{HeaderName, HeaderValue};
    use ipamd_core::QueryScope;
    use std::time::Duration;

    fn deadline() -> Deadline {
        Deadline::after(Duration::from_secs(5))
    }

    #[tokio::test]
    async fn test_new_context_is_anonymous() {
        let ctx = MiddlewareContext::new("op", deadline());
        assert!(!ctx.identity().is_authenticated());
        assert!(ctx.viewer().is_none());
        assert!(!ctx.is_rejected());
    }

    #[tokio::test]
    async fn test_for_request_reads_metadata() {
        let request_id = RequestId::new();
        let addr: SocketAddr = "192.0.2.10:41000".parse().unwrap();
        let request = RpcRequest::new("/ipam.service.v1.SystemService/GetStats", serde_json::Value::Null)
            .with_metadata(
                HeaderName::from_static(metadata_keys::REQUEST_ID),
                HeaderValue::from_str(&request_id.to_string()).unwrap(),
            )
            .with_metadata(
                HeaderName::from_static(metadata_keys::TENANT_ID),
                HeaderValue::from_static(" 42 "),
            )
            .with_peer(PeerInfo::new().with_address(addr));

        let ctx = MiddlewareContext::for_request(&request, deadline());
        assert_eq!(ctx.request_id(), request_id);
        assert_eq!(ctx.tenant_id(), Some(42));
        assert_eq!(ctx.peer_address(), Some(addr));
        assert_eq!(ctx.operation_id().method(), "GetStats");
    }

    #[tokio::test]
    async fn test_for_request_ignores_garbage_metadata() {
        let request = RpcRequest::new("op", serde_json::Value::Null)
            .with_metadata(
                HeaderName::from_static(metadata_keys::REQUEST_ID),
                HeaderValue::from_static("not-a-uuid"),
            )
            .with_metadata(
                HeaderName::from_static(metadata_keys::TENANT_ID),
                HeaderValue::from_static("tenant-a"),
            );

        let ctx = MiddlewareContext::for_request(&request, deadline());
        assert_eq!(ctx.tenant_id(), None);
        assert_eq!(ctx.request_id().as_uuid().get_version_num(), 7);
    }

    #[tokio::test]
    async fn test_rejection_is_taken_once() {
        let mut ctx = MiddlewareContext::new("op", deadline());
        ctx.reject(RpcError::permission_denied("no certificate"));
        assert!(ctx.is_rejected());
        assert!(ctx.take_rejection().is_some());
        assert!(ctx.take_rejection().is_none());
    }

    #[tokio::test]
    async fn test_extensions() {
        #[derive(Debug, Clone, PartialEq)]
        struct Marker(u8);

        let mut ctx = MiddlewareContext::new("op", deadline());
        assert!(ctx.get_extension::<Marker>().is_none());

        ctx.set_extension(Marker(1));
        assert_eq!(ctx.get_extension::<Marker>(), Some(&Marker(1)));
        assert_eq!(ctx.remove_extension::<Marker>(), Some(Marker(1)));
        assert!(ctx.get_extension::<Marker>().is_none());
    }

    #[tokio::test]
    async fn test_to_request_context() {
        let mut ctx = MiddlewareContext::new("/ipam.service.v1.SystemService/GetStats", deadline());
        ctx.set_viewer(Viewer::System);
        ctx.set_identity(CallerIdentity::certificate("admin-gateway", vec![]));

        let req_ctx = ctx.to_request_context();
        assert_eq!(req_ctx.request_id(), ctx.request_id());
        assert_eq!(req_ctx.operation_id(), ctx.operation_id());
        assert_eq!(req_ctx.identity().actor(), "admin-gateway");
        assert_eq!(req_ctx.query_scope(), QueryScope::AllTenants);
        assert_eq!(req_ctx.deadline().instant(), ctx.deadline().instant());
    }
}
