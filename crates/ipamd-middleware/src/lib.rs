//! # ipamd Middleware
//!
//! The ordered interceptor chain every inbound RPC passes through before it
//! reaches a handler.
//!
//! ## Pipeline Stages
//!
//! ```text
//! Call → Recovery → Viewer → AccessLog → MutualTls? → Audit → Validation → Handler
//! ```
//!
//! | Stage | Middleware  | Purpose                                             |
//! |-------|-------------|-----------------------------------------------------|
//! | 1     | Recovery    | Convert faults into `InternalFault` for this call   |
//! | 2     | Viewer      | Mark the call as issued by the system viewer        |
//! | 3     | Access log  | Log line, duration and outcome metrics              |
//! | 4     | Mutual TLS  | Client certificate on protected operations          |
//! | 5     | Audit       | One audit entry per non-skip-listed call            |
//! | 6     | Validation  | Structural checks on the request payload            |
//!
//! The mutual-TLS stage exists only when the server loaded a TLS identity.
//! The same [`EndpointMatcher`] semantics decide both which operations skip
//! authentication and which skip auditing.
//!
//! ## Example
//!
//! ```
//! use ipamd_middleware::pipeline::Stage;
//!
//! let stages = Stage::all();
//! assert_eq!(stages.len(), 6);
//! assert_eq!(stages[0].name(), "recovery");
//! assert_eq!(stages[5].name(), "validation");
//! ```

#![doc(html_root_url = "https://docs.rs/ipamd-middleware/0.1.0")]
#![warn(missing_docs)]
#![forbid(unsafe_code)]

pub mod context;
pub mod labels;
pub mod matcher;
pub mod middleware;
pub mod pipeline;
pub mod stages;
pub mod types;

pub use context::MiddlewareContext;
pub use labels::{OperationLabels, UNREGISTERED_OPERATION};
pub use matcher::{EndpointMatcher, BASELINE_PUBLIC_OPERATIONS};
pub use middleware::{BoxFuture, Dispatch, Middleware, Next};
pub use pipeline::{ClientAuth, Pipeline, PipelineBuilder, PipelineSettings, Stage};
pub use types::{metadata_keys, PeerInfo, Reply, RpcRequest};
