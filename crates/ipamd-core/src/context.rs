//! Request context types.
//!
//! The [`RequestContext`] is built once per call after the pipeline's
//! pre-handler stages have run and is handed to the handler by reference.
//! It has no setters: stages enrich the mutable middleware context, and the
//! handler sees the frozen result.

use crate::error::{RpcError, RpcResult};
use crate::identity::CallerIdentity;
use crate::viewer::{QueryScope, Viewer};
use serde::{Deserialize, Serialize, Serializer};
use std::borrow::Borrow;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// A unique identifier for each request, using UUID v7.
///
/// UUID v7 is time-ordered, which keeps audit entries and log lines sortable
/// by request id.
///
/// # Example
///
/// ```
/// use ipamd_core::RequestId;
///
/// let id = RequestId::new();
/// println!("Request ID: {}", id);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(Uuid);

impl RequestId {
    /// Creates a new unique request ID using UUID v7.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    /// Creates a `RequestId` from an existing UUID.
    #[must_use]
    pub const fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Parses a request id supplied by the caller.
    ///
    /// Returns `None` if the value is not a UUID.
    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        Uuid::parse_str(value.trim()).ok().map(Self)
    }

    /// Returns the underlying UUID.
    #[must_use]
    pub const fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<Uuid> for RequestId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

/// Service-qualified method name of a remote call,
/// e.g. `/ipam.service.v1.SystemService/GetStats`.
///
/// Cloning is a reference-count bump.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OperationId(Arc<str>);

impl OperationId {
    /// Creates an operation identifier.
    #[must_use]
    pub fn new(name: impl AsRef<str>) -> Self {
        Self(Arc::from(name.as_ref()))
    }

    /// Returns the identifier as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns the method part (`GetStats` for `/pkg.Service/GetStats`).
    #[must_use]
    pub fn method(&self) -> &str {
        self.0.rsplit('/').next().unwrap_or(&self.0)
    }

    /// Returns the service part (`pkg.Service` for `/pkg.Service/GetStats`),
    /// if the identifier is fully qualified.
    #[must_use]
    pub fn service(&self) -> Option<&str> {
        let trimmed = self.0.strip_prefix('/')?;
        trimmed.split_once('/').map(|(service, _)| service)
    }
}

impl std::fmt::Display for OperationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for OperationId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl Borrow<str> for OperationId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl From<&str> for OperationId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for OperationId {
    fn from(value: String) -> Self {
        Self(Arc::from(value))
    }
}

impl Serialize for OperationId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for OperationId {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        String::deserialize(deserializer).map(Self::from)
    }
}

/// The point in time a call must finish by, together with the caller's
/// cancellation signal.
///
/// Every stage that can block (certificate verification, audit sink writes,
/// handler dispatch) runs its work through [`Deadline::run`], which gives up
/// as soon as either the deadline elapses or the call is cancelled.
#[derive(Debug, Clone)]
pub struct Deadline {
    at: Instant,
    cancellation: CancellationToken,
}

impl Deadline {
    /// Creates a deadline `timeout` from now with a fresh cancellation token.
    #[must_use]
    pub fn after(timeout: Duration) -> Self {
        Self::at(Instant::now() + timeout)
    }

    /// Creates a deadline at the given instant with a fresh cancellation token.
    #[must_use]
    pub fn at(at: Instant) -> Self {
        Self {
            at,
            cancellation: CancellationToken::new(),
        }
    }

    /// Replaces the cancellation token.
    #[must_use]
    pub fn with_cancellation(mut self, cancellation: CancellationToken) -> Self {
        self.cancellation = cancellation;
        self
    }

    /// Returns a deadline that is no later than `now + timeout`.
    #[must_use]
    pub fn tightened(&self, timeout: Duration) -> Self {
        let candidate = Instant::now() + timeout;
        Self {
            at: self.at.min(candidate),
            cancellation: self.cancellation.clone(),
        }
    }

    /// Returns the same deadline pushed back by `grace`, sharing the
    /// cancellation token.
    #[must_use]
    pub fn extended(&self, grace: Duration) -> Self {
        Self {
            at: self.at + grace,
            cancellation: self.cancellation.clone(),
        }
    }

    /// Returns the instant the deadline elapses.
    #[must_use]
    pub const fn instant(&self) -> Instant {
        self.at
    }

    /// Returns the time left before the deadline, zero if already elapsed.
    #[must_use]
    pub fn remaining(&self) -> Duration {
        self.at.saturating_duration_since(Instant::now())
    }

    /// Returns `true` if the deadline has elapsed.
    #[must_use]
    pub fn is_expired(&self) -> bool {
        Instant::now() >= self.at
    }

    /// Returns the cancellation token of the call.
    #[must_use]
    pub const fn cancellation(&self) -> &CancellationToken {
        &self.cancellation
    }

    /// Returns `true` if the caller cancelled the call.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }

    /// Drives `future` to completion unless the call is cancelled or the
    /// deadline elapses first.
    ///
    /// The future is polled before the cancellation and timer checks, so
    /// work that is already complete is never discarded.
    pub async fn run<F>(&self, activity: &str, future: F) -> RpcResult<F::Output>
    where
        F: Future,
    {
        tokio::select! {
            biased;
            output = future => Ok(output),
            () = self.cancellation.cancelled() => {
                Err(RpcError::cancelled(format!("call cancelled during {activity}")))
            }
            () = tokio::time::sleep_until(self.at) => {
                Err(RpcError::deadline_exceeded(format!("deadline elapsed during {activity}")))
            }
        }
    }

    /// Like [`run`](Self::run), for work that must outlive the call
    /// itself, such as persisting its audit entry.
    ///
    /// The deadline is pushed back by `grace`. Cancellation does not abort
    /// the work at once: it starts a `grace` countdown, never reaching past
    /// the extended deadline.
    pub async fn run_with_grace<F>(
        &self,
        activity: &str,
        grace: Duration,
        future: F,
    ) -> RpcResult<F::Output>
    where
        F: Future,
    {
        let hard_stop = self.extended(grace).instant();
        tokio::pin!(future);

        tokio::select! {
            biased;
            output = &mut future => return Ok(output),
            () = tokio::time::sleep_until(hard_stop) => {
                return Err(RpcError::deadline_exceeded(format!(
                    "deadline elapsed during {activity}"
                )));
            }
            () = self.cancellation.cancelled() => {}
        }

        let cutoff = hard_stop.min(Instant::now() + grace);
        tokio::select! {
            biased;
            output = future => Ok(output),
            () = tokio::time::sleep_until(cutoff) => {
                Err(RpcError::cancelled(format!("call cancelled during {activity}")))
            }
        }
    }
}

/// Per-call context handed to handlers.
///
/// # Example
///
/// ```
/// use ipamd_core::{QueryScope, RequestContext, Viewer};
///
/// let ctx = RequestContext::new("/ipam.service.v1.SystemService/GetStats")
///     .with_viewer(Viewer::System);
/// assert_eq!(ctx.query_scope(), QueryScope::AllTenants);
/// ```
#[derive(Debug, Clone)]
pub struct RequestContext {
    request_id: RequestId,
    operation_id: OperationId,
    identity: CallerIdentity,
    viewer: Option<Viewer>,
    tenant_id: Option<u32>,
    deadline: Deadline,
    peer_address: Option<SocketAddr>,
    started_at: std::time::Instant,
}

impl RequestContext {
    /// Default deadline for contexts built outside a server.
    pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

    /// Creates a context for `operation_id` with a fresh request id, an
    /// anonymous caller, no viewer and the default deadline.
    #[must_use]
    pub fn new(operation_id: impl Into<OperationId>) -> Self {
        Self {
            request_id: RequestId::new(),
            operation_id: operation_id.into(),
            identity: CallerIdentity::Anonymous,
            viewer: None,
            tenant_id: None,
            deadline: Deadline::after(Self::DEFAULT_TIMEOUT),
            peer_address: None,
            started_at: std::time::Instant::now(),
        }
    }

    /// Creates a context for unit tests.
    #[must_use]
    pub fn mock() -> Self {
        Self::new("/test.v1.TestService/Test")
    }

    /// Sets the request id.
    #[must_use]
    pub fn with_request_id(mut self, request_id: RequestId) -> Self {
        self.request_id = request_id;
        self
    }

    /// Sets the caller identity.
    #[must_use]
    pub fn with_identity(mut self, identity: CallerIdentity) -> Self {
        self.identity = identity;
        self
    }

    /// Sets the privilege marker.
    #[must_use]
    pub fn with_viewer(mut self, viewer: Viewer) -> Self {
        self.viewer = Some(viewer);
        self
    }

    /// Sets the tenant id supplied by the caller.
    #[must_use]
    pub fn with_tenant_id(mut self, tenant_id: u32) -> Self {
        self.tenant_id = Some(tenant_id);
        self
    }

    /// Sets the call deadline.
    #[must_use]
    pub fn with_deadline(mut self, deadline: Deadline) -> Self {
        self.deadline = deadline;
        self
    }

    /// Sets the remote peer address.
    #[must_use]
    pub fn with_peer_address(mut self, peer_address: SocketAddr) -> Self {
        self.peer_address = Some(peer_address);
        self
    }

    /// Sets when processing of the call started.
    #[must_use]
    pub fn with_started_at(mut self, started_at: std::time::Instant) -> Self {
        self.started_at = started_at;
        self
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

    /// Returns the privilege marker, if one was injected.
    #[must_use]
    pub const fn viewer(&self) -> Option<Viewer> {
        self.viewer
    }

    /// Returns the tenant id supplied by the caller, if any.
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

    /// Returns the elapsed time since the call started.
    #[must_use]
    pub fn elapsed(&self) -> Duration {
        self.started_at.elapsed()
    }

    /// Returns how storage queries issued for this call must be filtered.
    ///
    /// An injected viewer always wins. Without one, the caller-supplied
    /// tenant id scopes the query; with neither the query is denied.
    #[must_use]
    pub fn query_scope(&self) -> QueryScope {
        match (self.viewer, self.tenant_id) {
            (Some(viewer), _) => viewer.scope(),
            (None, Some(tenant_id)) => QueryScope::Tenant(tenant_id),
            (None, None) => QueryScope::Denied,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_id_uniqueness() {
        let id1 = RequestId::new();
        let id2 = RequestId::new();
        assert_ne!(id1, id2);
    }

    #[test]
    fn test_request_id_parse() {
        let id = RequestId::new();
        assert_eq!(RequestId::parse(&id.to_string()), Some(id));
        assert_eq!(RequestId::parse("not-a-uuid"), None);
    }

    #[test]
    fn test_operation_id_parts() {
        let op = OperationId::new("/ipam.service.v1.SystemService/GetStats");
        assert_eq!(op.method(), "GetStats");
        assert_eq!(op.service(), Some("ipam.service.v1.SystemService"));

        let bare = OperationId::new("HealthCheck");
        assert_eq!(bare.method(), "HealthCheck");
        assert_eq!(bare.service(), None);
    }

    #[test]
    fn test_operation_id_serializes_as_string() {
        let op = OperationId::new("/grpc.health.v1.Health/Check");
        let json = serde_json::to_string(&op).unwrap();
        assert_eq!(json, "\"/grpc.health.v1.Health/Check\"");
        let back: OperationId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, op);
    }

    #[test]
    fn test_query_scope_resolution() {
        let ctx = RequestContext::mock();
        assert_eq!(ctx.query_scope(), QueryScope::Denied);

        let ctx = RequestContext::mock().with_tenant_id(9);
        assert_eq!(ctx.query_scope(), QueryScope::Tenant(9));

        let ctx = RequestContext::mock()
            .with_tenant_id(9)
            .with_viewer(Viewer::System);
        assert_eq!(ctx.query_scope(), QueryScope::AllTenants);
    }

    #[test]
    fn test_context_defaults() {
        let ctx = RequestContext::new("/ipam.service.v1.SystemService/HealthCheck");
        assert!(!ctx.identity().is_authenticated());
        assert!(ctx.viewer().is_none());
        assert!(ctx.peer_address().is_none());
        assert!(!ctx.deadline().is_expired());
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_run_completes() {
        let deadline = Deadline::after(Duration::from_secs(1));
        let result = deadline.run("lookup", async { 7 }).await;
        assert_eq!(result.unwrap(), 7);
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_run_times_out() {
        let deadline = Deadline::after(Duration::from_millis(50));
        let result = deadline
            .run("slow lookup", std::future::pending::<()>())
            .await;
        let err = result.unwrap_err();
        assert!(matches!(err, RpcError::DeadlineExceeded { .. }));
        assert!(err.to_string().contains("slow lookup"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_run_observes_cancellation() {
        let deadline = Deadline::after(Duration::from_secs(60));
        let token = deadline.cancellation().clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            token.cancel();
        });

        let result = deadline.run("sink write", std::future::pending::<()>()).await;
        assert!(matches!(result, Err(RpcError::Cancelled { .. })));
        assert!(deadline.is_cancelled());
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_with_grace_finishes_after_cancellation() {
        let deadline = Deadline::after(Duration::from_secs(60));
        deadline.cancellation().cancel();

        let result = deadline
            .run_with_grace("sink write", Duration::from_secs(1), async {
                tokio::task::yield_now().await;
                tokio::time::sleep(Duration::from_millis(200)).await;
                3
            })
            .await;
        assert_eq!(result.unwrap(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_with_grace_gives_up_after_grace() {
        let deadline = Deadline::after(Duration::from_secs(60));
        deadline.cancellation().cancel();
        let started = Instant::now();

        let result = deadline
            .run_with_grace("sink write", Duration::from_secs(1), std::future::pending::<()>())
            .await;
        assert!(matches!(result, Err(RpcError::Cancelled { .. })));
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_with_grace_bounded_by_extended_deadline() {
        let deadline = Deadline::after(Duration::from_millis(100));

        let result = deadline
            .run_with_grace("sink write", Duration::from_millis(50), std::future::pending::<()>())
            .await;
        assert!(matches!(result, Err(RpcError::DeadlineExceeded { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn test_ready_work_wins_over_expired_deadline() {
        let deadline = Deadline::after(Duration::ZERO);
        tokio::time::advance(Duration::from_millis(1)).await;
        assert!(deadline.is_expired());
        assert_eq!(deadline.run("ready", async { 1 }).await.unwrap(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_extended_and_tightened() {
        let deadline = Deadline::after(Duration::from_secs(10));
        let extended = deadline.extended(Duration::from_secs(1));
        assert!(extended.instant() > deadline.instant());

        let tightened = deadline.tightened(Duration::from_secs(2));
        assert!(tightened.remaining() <= Duration::from_secs(2));

        let not_loosened = deadline.tightened(Duration::from_secs(60));
        assert_eq!(not_loosened.instant(), deadline.instant());
    }
}
