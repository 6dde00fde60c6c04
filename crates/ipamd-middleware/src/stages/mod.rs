//! Pipeline stages.
//!
//! Stages run in a fixed order that [`crate::pipeline::Stage`] encodes:
//!
//! 1. [`recovery`] - Convert faults from any later stage into `InternalFault`
//! 2. [`viewer`] - Inject the system privilege marker
//! 3. [`access_log`] - One log line and metric sample per call
//! 4. [`mtls`] - Client certificate enforcement (only with a TLS identity)
//! 5. [`audit`] - One audit entry per non-skip-listed call
//! 6. [`validation`] - Request payload constraints

pub mod access_log;
pub mod audit;
pub mod mtls;
pub mod recovery;
pub mod validation;
pub mod viewer;

pub use access_log::{AccessLogMiddleware, CallSummary};
pub use audit::{
    AuditEntry, AuditMetadata, AuditMiddleware, AuditOutcome, AuditSink, AuditSinkError,
    InMemoryAuditSink, TracingAuditSink,
};
pub use mtls::{
    CertificateError, CertificateVerifier, MutualTlsMiddleware, PeerAuthentication, VerifiedPeer,
};
pub use recovery::RecoveryMiddleware;
pub use validation::{FieldFormat, FieldType, PayloadSchema, SchemaSet, ValidationMiddleware};
pub use viewer::ViewerMiddleware;
