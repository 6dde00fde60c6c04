//! Caller identity established by the authenticator.

use serde::{Deserialize, Serialize};

/// The identity of the caller of an RPC.
///
/// Calls start out [`Anonymous`](CallerIdentity::Anonymous). The mutual-TLS
/// stage replaces it with [`Certificate`](CallerIdentity::Certificate) once
/// the presented client certificate has been verified.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type")]
pub enum CallerIdentity {
    /// No verified credentials.
    #[default]
    Anonymous,
    /// Verified client certificate.
    Certificate {
        /// Subject common name, or the full distinguished name if it has none.
        subject: String,
        /// DNS and URI subject alternative names.
        sans: Vec<String>,
    },
}

impl CallerIdentity {
    /// Creates a certificate identity.
    #[must_use]
    pub fn certificate(subject: impl Into<String>, sans: Vec<String>) -> Self {
        Self::Certificate {
            subject: subject.into(),
            sans,
        }
    }

    /// Returns `true` if the caller presented a verified certificate.
    #[must_use]
    pub const fn is_authenticated(&self) -> bool {
        matches!(self, Self::Certificate { .. })
    }

    /// Returns the actor name recorded in audit entries and logs.
    #[must_use]
    pub fn actor(&self) -> &str {
        match self {
            Self::Anonymous => "anonymous",
            Self::Certificate { subject, .. } => subject,
        }
    }

    /// Returns the SPIFFE URI among the subject alternative names, if any.
    #[must_use]
    pub fn spiffe_id(&self) -> Option<&str> {
        match self {
            Self::Certificate { sans, .. } => sans
                .iter()
                .map(String::as_str)
                .find(|san| san.starts_with("spiffe://")),
            Self::Anonymous => None,
        }
    }
}
