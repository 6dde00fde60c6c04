//! Security posture and readiness.
//!
//! A server that could not load its TLS identity keeps serving without
//! mutual authentication. [`SecurityPosture`] makes that state queryable:
//! it is returned by [`RpcServer::security_posture`](crate::RpcServer::security_posture),
//! embedded in the `HealthCheck` reply and fed into [`ReadinessCheck`] so
//! deployments that require mutual TLS can gate traffic on it.
//!
//! # Example
//!
//! ```rust
//! use ipamd_server::{ReadinessCheck, SecurityPosture};
//!
//! let posture = SecurityPosture::degraded("TLS not configured");
//! let readiness = ReadinessCheck::new()
//!     .add_check("config_loaded", || true)
//!     .with_mutual_tls_requirement(&posture, true);
//!
//! let status = readiness.status();
//! assert!(!status.is_ready());
//! assert_eq!(status.check("mutual_tls"), Some(false));
//! ```

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

/// Name of the readiness check tied to mutual TLS.
pub const MUTUAL_TLS_CHECK: &str = "mutual_tls";

/// Whether client certificates are enforced, and why not if they aren't.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecurityPosture {
    /// `true` when the mutual-TLS stage is installed.
    pub mutual_tls: bool,
    /// Why mutual TLS is off.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl SecurityPosture {
    /// Mutual TLS enforced.
    #[must_use]
    pub const fn enforced() -> Self {
        Self {
            mutual_tls: true,
            reason: None,
        }
    }

    /// Running without mutual TLS.
    #[must_use]
    pub fn degraded(reason: impl Into<String>) -> Self {
        Self {
            mutual_tls: false,
            reason: Some(reason.into()),
        }
    }

    /// Returns `true` if protected operations accept callers without a
    /// certificate.
    #[must_use]
    pub const fn is_degraded(&self) -> bool {
        !self.mutual_tls
    }
}

/// Readiness status.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReadinessStatus {
    ready: bool,
    checks: HashMap<String, bool>,
}

impl ReadinessStatus {
    /// Creates a new readiness status.
    #[must_use]
    pub fn new(ready: bool, checks: HashMap<String, bool>) -> Self {
        Self { ready, checks }
    }

    /// Returns whether the service is ready.
    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.ready
    }

    /// Returns the individual check results.
    #[must_use]
    pub fn checks(&self) -> &HashMap<String, bool> {
        &self.checks
    }

    /// Returns the result of a specific check.
    #[must_use]
    pub fn check(&self, name: &str) -> Option<bool> {
        self.checks.get(name).copied()
    }
}

type ReadinessCheckFn = Arc<dyn Fn() -> bool + Send + Sync>;

/// Readiness made of named checks.
///
/// Ready when every check passes and the server has not been marked
/// not-ready (during shutdown, for instance).
#[derive(Clone)]
pub struct ReadinessCheck {
    checks: Vec<(String, ReadinessCheckFn)>,
    ready_override: Arc<AtomicBool>,
}

impl std::fmt::Debug for ReadinessCheck {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReadinessCheck")
            .field("checks", &self.checks.iter().map(|(n, _)| n).collect::<Vec<_>>())
            .field("ready_override", &self.ready_override)
            .finish()
    }
}

impl Default for ReadinessCheck {
    fn default() -> Self {
        Self::new()
    }
}

impl ReadinessCheck {
    /// Creates a readiness check with no checks; it reports ready.
    #[must_use]
    pub fn new() -> Self {
        Self {
            checks: Vec::new(),
            ready_override: Arc::new(AtomicBool::new(true)),
        }
    }

    /// Adds a named check returning `true` when the component is ready.
    #[must_use]
    pub fn add_check<F>(mut self, name: impl Into<String>, check: F) -> Self
    where
        F: Fn() -> bool + Send + Sync + 'static,
    {
        self.checks.push((name.into(), Arc::new(check)));
        self
    }

    /// Adds the `mutual_tls` check.
    ///
    /// With `required`, the check fails while `posture` is degraded.
    /// Otherwise it always passes and only reports the posture.
    #[must_use]
    pub fn with_mutual_tls_requirement(self, posture: &SecurityPosture, required: bool) -> Self {
        let ready = posture.mutual_tls || !required;
        self.add_check(MUTUAL_TLS_CHECK, move || ready)
    }

    /// Returns whether the service is ready.
    #[must_use]
    pub fn is_ready(&self) -> bool {
        if !self.ready_override.load(Ordering::SeqCst) {
            return false;
        }
        self.checks.iter().all(|(_, check)| check())
    }

    /// Returns the full status with individual check results.
    #[must_use]
    pub fn status(&self) -> ReadinessStatus {
        let checks: HashMap<String, bool> = self
            .checks
            .iter()
            .map(|(name, check)| (name.clone(), check()))
            .collect();

        let ready = self.ready_override.load(Ordering::SeqCst) && checks.values().all(|&v| v);

        ReadinessStatus::new(ready, checks)
    }

    /// Marks the service not ready regardless of the checks.
    pub fn set_not_ready(&self) {
        self.ready_override.store(false, Ordering::SeqCst);
    }

    /// Clears a previous [`set_not_ready`](Self::set_not_ready).
    pub fn set_ready(&self) {
        self.ready_override.store(true, Ordering::SeqCst);
    }

    /// Returns the number of registered checks.
    #[must_use]
    pub fn check_count(&self) -> usize {
        self.checks.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_posture_serialization() {
        let json = serde_json::to_value(SecurityPosture::enforced()).unwrap();
        assert_eq!(json, serde_json::json!({"mutual_tls": true}));

        let json = serde_json::to_value(SecurityPosture::degraded("TLS not configured")).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"mutual_tls": false, "reason": "TLS not configured"})
        );
    }

    #[test]
    fn test_readiness_empty_is_ready() {
        assert!(ReadinessCheck::new().is_ready());
    }

    #[test]
    fn test_mutual_tls_required_and_degraded() {
        let readiness = ReadinessCheck::new()
            .with_mutual_tls_requirement(&SecurityPosture::degraded("no CA bundle"), true);
        assert!(!readiness.is_ready());
        assert_eq!(readiness.status().check(MUTUAL_TLS_CHECK), Some(false));
    }

    #[test]
    fn test_mutual_tls_not_required() {
        let readiness = ReadinessCheck::new()
            .with_mutual_tls_requirement(&SecurityPosture::degraded("TLS not configured"), false);
        assert!(readiness.is_ready());
    }

    #[test]
    fn test_mutual_tls_required_and_enforced() {
        let readiness =
            ReadinessCheck::new().with_mutual_tls_requirement(&SecurityPosture::enforced(), true);
        assert!(readiness.is_ready());
    }

    #[test]
    fn test_ready_override() {
        let readiness = ReadinessCheck::new().add_check("registry", || true);
        readiness.set_not_ready();
        assert!(!readiness.is_ready());
        assert!(!readiness.status().is_ready());
        readiness.set_ready();
        assert!(readiness.is_ready());
        assert_eq!(readiness.check_count(), 1);
    }
}
