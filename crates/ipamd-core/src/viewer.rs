//! Typed privilege marker for data-layer queries.
//!
//! Storage code never consults ambient state to decide whether tenant
//! isolation applies. It asks the [`RequestContext`](crate::RequestContext)
//! for a [`QueryScope`] instead.

use serde::{Deserialize, Serialize};

/// The actor on whose behalf data is read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "tenant_id")]
pub enum Viewer {
    /// Internal system actor; tenant filters are bypassed.
    System,
    /// End user bound to a single tenant.
    Tenant(u32),
}

impl Viewer {
    /// Returns `true` for the system viewer.
    #[must_use]
    pub const fn is_system(&self) -> bool {
        matches!(self, Self::System)
    }

    /// Returns the query scope this viewer grants.
    #[must_use]
    pub const fn scope(&self) -> QueryScope {
        match self {
            Self::System => QueryScope::AllTenants,
            Self::Tenant(id) => QueryScope::Tenant(*id),
        }
    }
}

/// How a storage query must be filtered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueryScope {
    /// No tenant filter.
    AllTenants,
    /// Restrict rows to one tenant.
    Tenant(u32),
    /// No viewer and no tenant; the query must return nothing.
    Denied,
}

impl QueryScope {
    /// Returns `true` if rows owned by `tenant_id` are visible in this scope.
    #[must_use]
    pub const fn permits(&self, tenant_id: u32) -> bool {
        match self {
            Self::AllTenants => true,
            Self::Tenant(id) => *id == tenant_id,
            Self::Denied => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_system_viewer_sees_all_tenants() {
        let scope = Viewer::System.scope();
        assert_eq!(scope, QueryScope::AllTenants);
        assert!(scope.permits(1));
        assert!(scope.permits(42));
    }

    #[test]
    fn test_tenant_viewer_is_isolated() {
        let scope = Viewer::Tenant(7).scope();
        assert!(scope.permits(7));
        assert!(!scope.permits(8));
    }

    #[test]
    fn test_denied_scope_permits_nothing() {
        assert!(!QueryScope::Denied.permits(0));
    }

    #[test]
    fn test_viewer_serialization() {
        let json = serde_json::to_value(Viewer::Tenant(3)).unwrap();
        assert_eq!(json, serde_json::json!({"kind": "tenant", "tenant_id": 3}));

        let json = serde_json::to_value(Viewer::System).unwrap();
        assert_eq!(json, serde_json::json!({"kind": "system"}));
    }
}
