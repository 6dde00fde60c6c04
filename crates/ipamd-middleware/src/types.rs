//! Request and reply types used throughout the middleware pipeline.

use bytes::Bytes;
use http::header::{HeaderMap, HeaderName, HeaderValue};
use ipamd_core::OperationId;
use std::net::SocketAddr;
use std::time::Duration;

/// Decoded reply message.
pub type Reply = serde_json::Value;

/// Metadata keys the pipeline understands.
pub mod metadata_keys {
    /// Caller-supplied request id (UUID).
    pub const REQUEST_ID: &str = "x-request-id";

    /// Tenant the caller acts for.
    pub const TENANT_ID: &str = "x-md-global-tenant-id";
}

/// Transport-level facts about the remote peer.
#[derive(Debug, Clone, Default)]
pub struct PeerInfo {
    address: Option<SocketAddr>,
    certificates: Vec<Bytes>,
}

impl PeerInfo {
    /// Creates peer info without an address or certificates.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the remote address.
    #[must_use]
    pub fn with_address(mut self, address: SocketAddr) -> Self {
        self.address = Some(address);
        self
    }

    /// Sets the DER-encoded certificate chain presented during the TLS
    /// handshake, leaf first.
    #[must_use]
    pub fn with_certificates(mut self, certificates: Vec<Bytes>) -> Self {
        self.certificates = certificates;
        self
    }

    /// Returns the remote address, if known.
    #[must_use]
    pub const fn address(&self) -> Option<SocketAddr> {
        self.address
    }

    /// Returns the presented certificate chain, leaf first.
    #[must_use]
    pub fn certificates(&self) -> &[Bytes] {
        &self.certificates
    }

    /// Returns `true` if the peer presented at least one certificate.
    #[must_use]
    pub fn has_certificate(&self) -> bool {
        !self.certificates.is_empty()
    }
}

/// An inbound remote call after transport decoding.
#[derive(Debug, Clone)]
pub struct RpcRequest {
    operation: OperationId,
    metadata: HeaderMap,
    peer: PeerInfo,
    payload: serde_json::Value,
    timeout: Option<Duration>,
}

impl RpcRequest {
    /// Creates a request for `operation` with the given decoded payload.
    #[must_use]
    pub fn new(operation: impl Into<OperationId>, payload: serde_json::Value) -> Self {
        Self {
            operation: operation.into(),
            metadata: HeaderMap::new(),
            peer: PeerInfo::default(),
            payload,
            timeout: None,
        }
    }

    /// Adds a metadata entry.
    #[must_use]
    pub fn with_metadata(mut self, key: HeaderName, value: HeaderValue) -> Self {
        self.metadata.insert(key, value);
        self
    }

    /// Sets the peer information.
    #[must_use]
    pub fn with_peer(mut self, peer: PeerInfo) -> Self {
        self.peer = peer;
        self
    }

    /// Sets the caller-requested timeout.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Returns the operation being invoked.
    #[must_use]
    pub const fn operation(&self) -> &OperationId {
        &self.operation
    }

    /// Returns the call metadata.
    #[must_use]
    pub const fn metadata(&self) -> &HeaderMap {
        &self.metadata
    }

    /// Returns a mutable reference to the call metadata.
    pub fn metadata_mut(&mut self) -> &mut HeaderMap {
        &mut self.metadata
    }

    /// Returns a metadata value as a string, if present and valid UTF-8.
    #[must_use]
    pub fn metadata_str(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).and_then(|v| v.to_str().ok())
    }

    /// Returns the peer information.
    #[must_use]
    pub const fn peer(&self) -> &PeerInfo {
        &self.peer
    }

    /// Returns the decoded payload.
    #[must_use]
    pub const fn payload(&self) -> &serde_json::Value {
        &self.payload
    }

    /// Consumes the request and returns its payload.
    #[must_use]
    pub fn into_payload(self) -> serde_json::Value {
        self.payload
    }

    /// Returns the caller-requested timeout, if any.
    #[must_use]
    pub const fn timeout(&self) -> Option<Duration> {
        self.timeout
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_metadata() {
        let request = RpcRequest::new("/grpc.health.v1.Health/Check", serde_json::Value::Null)
            .with_metadata(
                HeaderName::from_static(metadata_keys::TENANT_ID),
                HeaderValue::from_static("12"),
            );

        assert_eq!(request.metadata_str(metadata_keys::TENANT_ID), Some("12"));
        assert_eq!(request.metadata_str(metadata_keys::REQUEST_ID), None);
    }

    #[test]
    fn test_peer_info() {
        let addr: SocketAddr = "10.1.2.3:50443".parse().unwrap();
        let peer = PeerInfo::new()
            .with_address(addr)
            .with_certificates(vec![Bytes::from_static(b"der")]);

        assert_eq!(peer.address(), Some(addr));
        assert!(peer.has_certificate());
        assert_eq!(peer.certificates().len(), 1);
        assert!(!PeerInfo::new().has_certificate());
    }

    #[test]
    fn test_into_payload() {
        let request = RpcRequest::new("op", serde_json::json!({"cidr": "10.0.0.0/8"}))
            .with_timeout(Duration::from_secs(2));
        assert_eq!(request.timeout(), Some(Duration::from_secs(2)));
        assert_eq!(request.into_payload()["cidr"], "10.0.0.0/8");
    }
}
