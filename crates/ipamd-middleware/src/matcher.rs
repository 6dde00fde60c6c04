//! Endpoint classification.
//!
//! An [`EndpointMatcher`] holds a set of operation identifiers built once at
//! assembly time. Any identifier not exactly present in the set is protected.
//! The same type backs both the authentication allow-list and the audit
//! skip-list, so the two classify operations with identical semantics.

use std::collections::HashSet;
use std::sync::Arc;

/// Operations that are always public and never audited unless the
/// configuration explicitly replaces the baseline.
pub const BASELINE_PUBLIC_OPERATIONS: [&str; 3] = [
    "/grpc.health.v1.Health/Check",
    "/grpc.health.v1.Health/Watch",
    "/ipam.service.v1.SystemService/HealthCheck",
];

/// Read-only set of exempt operation identifiers.
///
/// Cloning shares the underlying set.
///
/// # Example
///
/// ```
/// use ipamd_middleware::EndpointMatcher;
///
/// let matcher = EndpointMatcher::new(["HealthCheck"]);
/// assert!(!matcher.is_protected("HealthCheck"));
/// assert!(matcher.is_protected("GetStats"));
/// assert!(matcher.is_protected("healthcheck"));
/// ```
#[derive(Debug, Clone, Default)]
pub struct EndpointMatcher {
    exempt: Arc<HashSet<String>>,
}

impl EndpointMatcher {
    /// Creates a matcher from an explicit set of exempt operations.
    pub fn new<I, S>(operations: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            exempt: Arc::new(operations.into_iter().map(Into::into).collect()),
        }
    }

    /// Creates a matcher containing the baseline operations plus `extra`.
    pub fn with_baseline<I, S>(extra: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::new(
            BASELINE_PUBLIC_OPERATIONS
                .iter()
                .map(|op| (*op).to_string())
                .chain(extra.into_iter().map(Into::into)),
        )
    }

    /// Returns `true` unless `operation` is exactly present in the set.
    #[must_use]
    pub fn is_protected(&self, operation: &str) -> bool {
        !self.exempt.contains(operation)
    }

    /// Returns `true` if `operation` is exempt.
    #[must_use]
    pub fn is_exempt(&self, operation: &str) -> bool {
        self.exempt.contains(operation)
    }

    /// Returns the number of exempt operations.
    #[must_use]
    pub fn len(&self) -> usize {
        self.exempt.len()
    }

    /// Returns `true` if no operation is exempt.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.exempt.is_empty()
    }

    /// Returns the exempt operations in sorted order.
    #[must_use]
    pub fn operations(&self) -> Vec<&str> {
        let mut ops: Vec<&str> = self.exempt.iter().map(String::as_str).collect();
        ops.sort_unstable();
        ops
    }

    /// Returns the operations exempt in exactly one of `self` and `other`.
    #[must_use]
    pub fn divergence<'a>(&'a self, other: &'a Self) -> Vec<&'a str> {
        let mut ops: Vec<&str> = self
            .exempt
            .symmetric_difference(&other.exempt)
            .map(String::as_str)
            .collect();
        ops.sort_unstable();
        ops
    }
}
