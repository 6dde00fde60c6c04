//! Server error types.

use std::path::PathBuf;

use thiserror::Error;

/// Result type for server assembly.
pub type ServerResult<T> = Result<T, ServerError>;

/// Errors raised while assembling the server.
///
/// Call-level failures are [`RpcError`](ipamd_core::RpcError)s and never
/// surface here.
#[derive(Debug, Error)]
pub enum ServerError {
    /// Two handlers were registered for the same operation.
    #[error("operation already registered: {0}")]
    DuplicateOperation(String),

    /// The configuration failed to load or validate.
    #[error("configuration error: {0}")]
    Config(#[from] ipamd_config::ConfigError),

    /// Logging or metrics could not be installed.
    #[error("telemetry error: {0}")]
    Telemetry(#[from] ipamd_telemetry::TelemetryError),
}

impl ServerError {
    /// Creates a duplicate registration error.
    pub fn duplicate_operation(operation: impl Into<String>) -> Self {
        Self::DuplicateOperation(operation.into())
    }
}

/// Errors raised while loading the TLS identity.
///
/// None of these abort startup; the server runs without mutual TLS and
/// reports the reason through its security posture.
#[derive(Debug, Error)]
pub enum TlsError {
    /// TLS is switched off in the configuration.
    #[error("TLS not configured")]
    Disabled,

    /// TLS is enabled but a path is missing.
    #[error("TLS enabled but tls.{0} is not set")]
    MissingPath(&'static str),

    /// A PEM file could not be read.
    #[error("failed to read {path}: {source}")]
    Read {
        /// Path of the file.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },

    /// The file holds no certificates.
    #[error("no certificates found in {0}")]
    NoCertificates(PathBuf),

    /// The file holds no private key.
    #[error("no private key found in {0}")]
    NoPrivateKey(PathBuf),

    /// The CA bundle holds no usable trust anchors.
    #[error("no valid CA certificates found in {0}")]
    NoTrustAnchors(PathBuf),

    /// The client certificate verifier could not be built.
    #[error("failed to build client verifier: {0}")]
    Verifier(#[from] rustls::server::VerifierBuilderError),

    /// The server certificate and key were rejected.
    #[error("invalid server certificate or key: {0}")]
    Identity(#[from] rustls::Error),
}

impl TlsError {
    /// Creates a read error.
    pub fn read(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Read {
            path: path.into(),
            source,
        }
    }

    /// Returns `true` if TLS was not requested at all.
    #[must_use]
    pub const fn is_disabled(&self) -> bool {
        matches!(self, Self::Disabled)
    }
}
