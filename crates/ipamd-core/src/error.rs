//! Error types for the RPC pipeline.
//!
//! [`RpcError`] is the terminal outcome of a failed call. Every variant maps
//! to an [`ErrorCategory`] (used for audit classification and metrics) and to
//! a canonical gRPC status code (used by transports).
//!
//! | Variant | Category | Status |
//! |---|---|---|
//! | `Internal` | `internal_fault` | `INTERNAL` (13) |
//! | `PermissionDenied` | `permission_denied` | `PERMISSION_DENIED` (7) |
//! | `InvalidArgument` | `invalid_argument` | `INVALID_ARGUMENT` (3) |
//! | `DeadlineExceeded` | `deadline_exceeded` | `DEADLINE_EXCEEDED` (4) |
//! | `Unauthenticated` | `unauthenticated` | `UNAUTHENTICATED` (16) |
//! | `Unimplemented` | `unimplemented` | `UNIMPLEMENTED` (12) |
//! | `Cancelled` | `cancelled` | `CANCELLED` (1) |

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;

/// Result type alias using [`RpcError`].
pub type RpcResult<T> = Result<T, RpcError>;

/// Classification of a failed call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// Unexpected fault during handling, recovered and reported.
    InternalFault,
    /// Certificate missing or untrusted on a protected operation.
    PermissionDenied,
    /// Payload failed structural validation.
    InvalidArgument,
    /// A stage gave up because the call deadline elapsed.
    DeadlineExceeded,
    /// Credentials were required by the transport but absent.
    Unauthenticated,
    /// No handler is registered for the operation.
    Unimplemented,
    /// The caller abandoned the call.
    Cancelled,
}

impl ErrorCategory {
    /// Returns the canonical gRPC status code name.
    #[must_use]
    pub const fn status_name(&self) -> &'static str {
        match self {
            Self::InternalFault => "INTERNAL",
            Self::PermissionDenied => "PERMISSION_DENIED",
            Self::InvalidArgument => "INVALID_ARGUMENT",
            Self::DeadlineExceeded => "DEADLINE_EXCEEDED",
            Self::Unauthenticated => "UNAUTHENTICATED",
            Self::Unimplemented => "UNIMPLEMENTED",
            Self::Cancelled => "CANCELLED",
        }
    }

    /// Returns the numeric gRPC status code.
    #[must_use]
    pub const fn grpc_code(&self) -> i32 {
        match self {
            Self::Cancelled => 1,
            Self::InvalidArgument => 3,
            Self::DeadlineExceeded => 4,
            Self::PermissionDenied => 7,
            Self::Unimplemented => 12,
            Self::InternalFault => 13,
            Self::Unauthenticated => 16,
        }
    }

    /// Returns the `snake_case` label used in logs and metric labels.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::InternalFault => "internal_fault",
            Self::PermissionDenied => "permission_denied",
            Self::InvalidArgument => "invalid_argument",
            Self::DeadlineExceeded => "deadline_exceeded",
            Self::Unauthenticated => "unauthenticated",
            Self::Unimplemented => "unimplemented",
            Self::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Terminal error of an RPC call.
///
/// # Example
///
/// ```
/// use ipamd_core::{ErrorCategory, RpcError};
///
/// fn check_cidr(cidr: &str) -> Result<(), RpcError> {
///     if cidr.is_empty() {
///         return Err(RpcError::invalid_argument("cidr must not be empty"));
///     }
///     Ok(())
/// }
///
/// let err = check_cidr("").unwrap_err();
/// assert_eq!(err.category(), ErrorCategory::InvalidArgument);
/// ```
#[derive(Error, Debug)]
pub enum RpcError {
    /// Unexpected fault during handling.
    #[error("Internal error: {message}")]
    Internal {
        /// Human-readable error message.
        message: String,
        /// The underlying error (not exposed to callers).
        #[source]
        source: Option<anyhow::Error>,
    },

    /// The caller is not allowed to invoke the operation.
    #[error("Permission denied: {message}")]
    PermissionDenied {
        /// Human-readable error message.
        message: String,
        /// The operation that was denied.
        operation_id: Option<String>,
    },

    /// The request payload is invalid.
    #[error("Invalid argument: {message}")]
    InvalidArgument {
        /// Human-readable error message.
        message: String,
        /// Field-specific validation errors.
        #[source]
        field_errors: Option<FieldErrors>,
    },

    /// The call deadline elapsed.
    #[error("Deadline exceeded: {message}")]
    DeadlineExceeded {
        /// Human-readable error message.
        message: String,
    },

    /// The transport required credentials that were not presented.
    #[error("Unauthenticated: {message}")]
    Unauthenticated {
        /// Human-readable error message.
        message: String,
    },

    /// No handler is registered for the operation.
    #[error("Unimplemented: no handler registered for {operation_id}")]
    Unimplemented {
        /// The operation that has no handler.
        operation_id: String,
    },

    /// The caller abandoned the call.
    #[error("Cancelled: {message}")]
    Cancelled {
        /// Human-readable error message.
        message: String,
    },
}

impl RpcError {
    /// Creates an internal error.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
            source: None,
        }
    }

    /// Creates an internal error with a source error.
    pub fn internal_with_source(
        message: impl Into<String>,
        source: impl Into<anyhow::Error>,
    ) -> Self {
        Self::Internal {
            message: message.into(),
            source: Some(source.into()),
        }
    }

    /// Creates a permission denied error.
    #[must_use]
    pub fn permission_denied(message: impl Into<String>) -> Self {
        Self::PermissionDenied {
            message: message.into(),
            operation_id: None,
        }
    }

    /// Creates a permission denied error naming the operation.
    #[must_use]
    pub fn permission_denied_for_operation(
        message: impl Into<String>,
        operation_id: impl Into<String>,
    ) -> Self {
        Self::PermissionDenied {
            message: message.into(),
            operation_id: Some(operation_id.into()),
        }
    }

    /// Creates an invalid argument error.
    #[must_use]
    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::InvalidArgument {
            message: message.into(),
            field_errors: None,
        }
    }

    /// Creates an invalid argument error with field-specific errors.
    #[must_use]
    pub fn invalid_argument_with_fields(
        message: impl Into<String>,
        field_errors: FieldErrors,
    ) -> Self {
        Self::InvalidArgument {
            message: message.into(),
            field_errors: Some(field_errors),
        }
    }

    /// Creates a deadline exceeded error.
    #[must_use]
    pub fn deadline_exceeded(message: impl Into<String>) -> Self {
        Self::DeadlineExceeded {
            message: message.into(),
        }
    }

    /// Creates an unauthenticated error.
    #[must_use]
    pub fn unauthenticated(message: impl Into<String>) -> Self {
        Self::Unauthenticated {
            message: message.into(),
        }
    }

    /// Creates an unimplemented error for an operation without a handler.
    #[must_use]
    pub fn unimplemented(operation_id: impl Into<String>) -> Self {
        Self::Unimplemented {
            operation_id: operation_id.into(),
        }
    }

    /// Creates a cancelled error.
    #[must_use]
    pub fn cancelled(message: impl Into<String>) -> Self {
        Self::Cancelled {
            message: message.into(),
        }
    }

    /// Returns the error category.
    #[must_use]
    pub const fn category(&self) -> ErrorCategory {
        match self {
            Self::Internal { .. } => ErrorCategory::InternalFault,
            Self::PermissionDenied { .. } => ErrorCategory::PermissionDenied,
            Self::InvalidArgument { .. } => ErrorCategory::InvalidArgument,
            Self::DeadlineExceeded { .. } => ErrorCategory::DeadlineExceeded,
            Self::Unauthenticated { .. } => ErrorCategory::Unauthenticated,
            Self::Unimplemented { .. } => ErrorCategory::Unimplemented,
            Self::Cancelled { .. } => ErrorCategory::Cancelled,
        }
    }

    /// Returns the gRPC status code name for this error.
    #[must_use]
    pub const fn status_name(&self) -> &'static str {
        self.category().status_name()
    }

    /// Returns the message that is safe to show to callers.
    ///
    /// Internal sources are never included.
    #[must_use]
    pub fn public_message(&self) -> String {
        match self {
            Self::Internal { message, .. }
            | Self::PermissionDenied { message, .. }
            | Self::InvalidArgument { message, .. }
            | Self::DeadlineExceeded { message }
            | Self::Unauthenticated { message }
            | Self::Cancelled { message } => message.clone(),
            Self::Unimplemented { operation_id } => {
                format!("no handler registered for {operation_id}")
            }
        }
    }

    /// Converts this error to a serializable error envelope.
    #[must_use]
    pub fn to_envelope(&self, request_id: Option<&str>) -> ErrorEnvelope {
        ErrorEnvelope {
            error: ErrorDetail {
                code: self.status_name().to_string(),
                grpc_code: self.category().grpc_code(),
                message: self.public_message(),
                category: self.category(),
                details: self.error_details(),
            },
            request_id: request_id.map(ToString::to_string),
        }
    }

    fn error_details(&self) -> Option<serde_json::Value> {
        match self {
            Self::InvalidArgument {
                field_errors: Some(errors),
                ..
            } => serde_json::to_value(errors).ok(),
            Self::PermissionDenied {
                operation_id: Some(op),
                ..
            } => Some(serde_json::json!({ "operation_id": op })),
            Self::Unimplemented { operation_id } => {
                Some(serde_json::json!({ "operation_id": operation_id }))
            }
            _ => None,
        }
    }
}

/// Field-specific validation errors.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, Error)]
#[error("Field validation errors")]
pub struct FieldErrors {
    /// Map of field path to list of error messages.
    pub fields: HashMap<String, Vec<String>>,
}

impl FieldErrors {
    /// Creates a new empty `FieldErrors`.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds an error for a field.
    pub fn add(&mut self, field: impl Into<String>, message: impl Into<String>) {
        self.fields
            .entry(field.into())
            .or_default()
            .push(message.into());
    }

    /// Returns `true` if there are no field errors.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Returns the number of fields with errors.
    #[must_use]
    pub fn len(&self) -> usize {
        self.fields.len()
    }
}

/// Serializable error envelope for transports.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorEnvelope {
    /// The error details.
    pub error: ErrorDetail,
    /// The request ID for correlation.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
}

/// Error detail within an envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorDetail {
    /// gRPC status code name.
    pub code: String,
    /// Numeric gRPC status code.
    pub grpc_code: i32,
    /// Caller-safe error message.
    pub message: String,
    /// Error category.
    pub category: ErrorCategory,
    /// Additional error details.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}
