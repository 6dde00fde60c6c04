//! # ipamd Core
//!
//! Core types shared by every stage of the ipamd RPC pipeline.
//!
//! - [`RequestContext`] - Immutable per-call context handed to handlers
//! - [`RequestId`] - UUID v7 request identifier
//! - [`OperationId`] - Service-qualified method name of a remote call
//! - [`Deadline`] - Call deadline plus cancellation signal
//! - [`CallerIdentity`] - Who is calling (certificate subject or anonymous)
//! - [`Viewer`] - Typed privilege marker consumed by storage code
//! - [`RpcError`] - Terminal error taxonomy of a call
//! - [`Handler`] - Typed handler trait and its type-erased form

#![doc(html_root_url = "https://docs.rs/ipamd-core/0.1.0")]
#![warn(missing_docs)]
#![forbid(unsafe_code)]

mod context;
mod error;
pub mod handler;
mod identity;
mod viewer;

pub use context::{Deadline, OperationId, RequestContext, RequestId};
pub use error::{ErrorCategory, ErrorDetail, ErrorEnvelope, FieldErrors, RpcError, RpcResult};
pub use handler::{BoxFuture, Empty, ErasedHandler, FnHandler, Handler, TypedHandler};
pub use identity::CallerIdentity;
pub use viewer::{QueryScope, Viewer};
