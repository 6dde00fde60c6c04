//! Mutual-TLS authentication middleware.
//!
//! Installed only when the server loaded a TLS identity. For protected
//! operations the client certificate chain captured during the handshake
//! must verify against the trusted CA bundle.
//!
//! A refused call is not short-circuited here. The refusal is recorded in
//! the context and the call continues to the audit stage, which writes the
//! failure entry and returns the refusal. No later stage and no handler runs
//! while a refusal is pending.
//!
//! # Pipeline Position
//!
//! ```text
//! Recovery → Viewer → AccessLog → [MutualTls] → Audit → Validation → Handler
//! ```

use crate::{
    context::MiddlewareContext,
    matcher::EndpointMatcher,
    middleware::{BoxFuture, Middleware, Next},
    types::{Reply, RpcRequest},
};
use bytes::Bytes;
use ipamd_core::{CallerIdentity, RpcError, RpcResult};
use std::sync::Arc;
use thiserror::Error;

/// Verifies a client certificate chain.
///
/// Implementations may perform I/O (revocation lookups, remote trust
/// stores); the middleware bounds every call by the call deadline.
pub trait CertificateVerifier: Send + Sync + 'static {
    /// Verifies `chain` (DER, leaf first) and returns the peer's identity.
    fn verify<'a>(&'a self, chain: &'a [Bytes]) -> BoxFuture<'a, Result<VerifiedPeer, CertificateError>>;
}

/// Identity extracted from a verified leaf certificate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifiedPeer {
    /// Subject common name, or the full subject if it has none.
    pub subject: String,
    /// DNS and URI subject alternative names.
    pub sans: Vec<String>,
}

/// Why a certificate chain was refused.
#[derive(Debug, Error)]
pub enum CertificateError {
    /// No certificate was presented.
    #[error("client certificate required")]
    Missing,

    /// The chain does not verify against the trusted CA bundle.
    #[error("client certificate not trusted: {0}")]
    Untrusted(String),

    /// The leaf certificate could not be parsed.
    #[error("client certificate malformed: {0}")]
    Malformed(String),
}

/// Result of the authentication stage, stored as a context extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerAuthentication {
    /// The operation is public; no certificate was required.
    Exempt,
    /// The certificate verified.
    Verified,
    /// The call was refused.
    Rejected,
}

/// Enforces client certificates on protected operations.
pub struct MutualTlsMiddleware {
    public: EndpointMatcher,
    verifier: Arc<dyn CertificateVerifier>,
}

impl MutualTlsMiddleware {
    /// Creates the stage from the public allow-list and a verifier.
    #[must_use]
    pub fn new(public: EndpointMatcher, verifier: Arc<dyn CertificateVerifier>) -> Self {
        Self { public, verifier }
    }
}

impl std::fmt::Debug for MutualTlsMiddleware {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MutualTlsMiddleware")
            .field("public", &self.public)
            .finish_non_exhaustive()
    }
}

impl Middleware for MutualTlsMiddleware {
    fn name(&self) -> &'static str {
        "mutual_tls"
    }

    fn process<'a>(
        &'a self,
        ctx: &'a mut MiddlewareContext,
        request: RpcRequest,
        next: Next<'a>,
    ) -> BoxFuture<'a, RpcResult<Reply>> {
        Box::pin(async move {
            let operation = ctx.operation_id().clone();
            if !self.public.is_protected(operation.as_str()) {
                ctx.set_extension(PeerAuthentication::Exempt);
                return next.run(ctx, request).await;
            }

            let verification = if request.peer().has_certificate() {
                ctx.deadline()
                    .run(
                        "client certificate verification",
                        self.verifier.verify(request.peer().certificates()),
                    )
                    .await
            } else {
                Ok(Err(CertificateError::Missing))
            };

            match verification {
                Ok(Ok(peer)) => {
                    tracing::debug!(
                        operation = %operation,
                        request_id = %ctx.request_id(),
                        subject = %peer.subject,
                        "client certificate verified"
                    );
                    ctx.set_identity(CallerIdentity::certificate(peer.subject, peer.sans));
                    ctx.set_extension(PeerAuthentication::Verified);
                }
                Ok(Err(e)) => {
                    tracing::warn!(
                        operation = %operation,
                        request_id = %ctx.request_id(),
                        peer = ?ctx.peer_address(),
                        error = %e,
                        "client certificate rejected"
                    );
                    ctx.set_extension(PeerAuthentication::Rejected);
                    ctx.reject(RpcError::permission_denied_for_operation(
                        e.to_string(),
                        operation.as_str(),
                    ));
                }
                Err(e) => {
                    tracing::warn!(
                        operation = %operation,
                        request_id = %ctx.request_id(),
                        error = %e,
                        "client certificate verification abandoned"
                    );
                    ctx.set_extension(PeerAuthentication::Rejected);
                    ctx.reject(e);
                }
            }

            next.run(ctx, request).await
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::PeerInfo;
    use ipamd_core::Deadline;
    use std::time::Duration;

    /// Trusts exactly one DER blob.
    struct FixedVerifier {
        trusted: Bytes,
    }

    impl CertificateVerifier for FixedVerifier {
        fn verify<'a>(
            &'a self,
            chain: &'a [Bytes],
        ) -> BoxFuture<'a, Result<VerifiedPeer, CertificateError>> {
            Box::pin(async move {
                match chain.first() {
                    Some(leaf) if *leaf == self.trusted => Ok(VerifiedPeer {
                        subject: "admin-gateway".to_string(),
                        sans: vec!["spiffe://ipam.internal/admin-gateway".to_string()],
                    }),
                    Some(_) => Err(CertificateError::Untrusted("unknown issuer".to_string())),
                    None => Err(CertificateError::Missing),
                }
            })
        }
    }

    /// Never answers.
    struct HangingVerifier;

    impl CertificateVerifier for HangingVerifier {
        fn verify<'a>(
            &'a self,
            _chain: &'a [Bytes],
        ) -> BoxFuture<'a, Result<VerifiedPeer, CertificateError>> {
            Box::pin(std::future::pending::<Result<VerifiedPeer, CertificateError>>())
        }
    }

    fn stage(verifier: Arc<dyn CertificateVerifier>) -> MutualTlsMiddleware {
        MutualTlsMiddleware::new(EndpointMatcher::new(["HealthCheck"]), verifier)
    }

    fn fixed() -> Arc<dyn CertificateVerifier> {
        Arc::new(FixedVerifier {
            trusted: Bytes::from_static(b"trusted-leaf"),
        })
    }

    fn ctx(operation: &str) -> MiddlewareContext {
        MiddlewareContext::new(operation, Deadline::after(Duration::from_secs(5)))
    }

    fn echo_identity() -> Next<'static> {
        Next::dispatch(|ctx, _req| {
            let actor = ctx.identity().actor().to_string();
            let rejected = ctx.is_rejected();
            Box::pin(async move { Ok(serde_json::json!({"actor": actor, "rejected": rejected})) })
        })
    }

    #[tokio::test]
    async fn test_public_operation_needs_no_certificate() {
        let middleware = stage(fixed());
        let mut ctx = ctx("HealthCheck");

        let reply = middleware
            .process(&mut ctx, RpcRequest::new("HealthCheck", Reply::Null), echo_identity())
            .await
            .unwrap();
        assert_eq!(reply["rejected"], false);
        assert_eq!(reply["actor"], "anonymous");
        assert_eq!(
            ctx.get_extension::<PeerAuthentication>(),
            Some(&PeerAuthentication::Exempt)
        );
    }

    #[tokio::test]
    async fn test_missing_certificate_is_rejected() {
        let middleware = stage(fixed());
        let mut ctx = ctx("GetStats");

        middleware
            .process(&mut ctx, RpcRequest::new("GetStats", Reply::Null), echo_identity())
            .await
            .unwrap();
        let rejection = ctx.take_rejection().expect("rejection pending");
        assert!(matches!(rejection, RpcError::PermissionDenied { .. }));
        assert!(rejection.to_string().contains("client certificate required"));
    }

    #[tokio::test]
    async fn test_untrusted_certificate_is_rejected() {
        let middleware = stage(fixed());
        let mut ctx = ctx("GetStats");
        let request = RpcRequest::new("GetStats", Reply::Null).with_peer(
            PeerInfo::new().with_certificates(vec![Bytes::from_static(b"rogue-leaf")]),
        );

        middleware.process(&mut ctx, request, echo_identity()).await.unwrap();
        assert!(matches!(
            ctx.take_rejection(),
            Some(RpcError::PermissionDenied { .. })
        ));
        assert_eq!(
            ctx.get_extension::<PeerAuthentication>(),
            Some(&PeerAuthentication::Rejected)
        );
    }

    #[tokio::test]
    async fn test_trusted_certificate_sets_identity() {
        let middleware = stage(fixed());
        let mut ctx = ctx("GetStats");
        let request = RpcRequest::new("GetStats", Reply::Null).with_peer(
            PeerInfo::new().with_certificates(vec![Bytes::from_static(b"trusted-leaf")]),
        );

        let reply = middleware.process(&mut ctx, request, echo_identity()).await.unwrap();
        assert_eq!(reply["actor"], "admin-gateway");
        assert_eq!(reply["rejected"], false);
        assert_eq!(
            ctx.identity().spiffe_id(),
            Some("spiffe://ipam.internal/admin-gateway")
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_hanging_verifier_hits_deadline() {
        let middleware = stage(Arc::new(HangingVerifier));
        let mut ctx = MiddlewareContext::new("GetStats", Deadline::after(Duration::from_millis(100)));
        let request = RpcRequest::new("GetStats", Reply::Null).with_peer(
            PeerInfo::new().with_certificates(vec![Bytes::from_static(b"any")]),
        );

        middleware.process(&mut ctx, request, echo_identity()).await.unwrap();
        assert!(matches!(
            ctx.take_rejection(),
            Some(RpcError::DeadlineExceeded { .. })
        ));
    }
}
