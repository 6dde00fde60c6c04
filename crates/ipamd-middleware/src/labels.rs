//! Metric labels for operations.
//!
//! Operation identifiers come from callers, so only operations with a
//! registered handler are used verbatim as metric labels. Everything else is
//! folded into [`UNREGISTERED_OPERATION`], keeping the exporter's series
//! count bounded by the registry size.

use std::collections::HashSet;
use std::sync::Arc;

/// Label used for operations without a registered handler.
pub const UNREGISTERED_OPERATION: &str = "unregistered";

/// Registered operations allowed as metric labels.
#[derive(Debug, Clone, Default)]
pub struct OperationLabels {
    known: Arc<HashSet<String>>,
}

impl OperationLabels {
    /// Creates the label set from the registered operations.
    pub fn new<I, S>(operations: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            known: Arc::new(operations.into_iter().map(Into::into).collect()),
        }
    }

    /// Returns the label to record for `operation`.
    #[must_use]
    pub fn label<'a>(&self, operation: &'a str) -> &'a str {
        if self.known.contains(operation) {
            operation
        } else {
            UNREGISTERED_OPERATION
        }
    }

    /// Returns the number of registered operations.
    #[must_use]
    pub fn len(&self) -> usize {
        self.known.len()
    }

    /// Returns `true` if no operation is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.known.is_empty()
    }
}
