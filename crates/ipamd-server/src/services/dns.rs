//! DNS resolver settings: `GetDnsConfig` and `UpdateDnsConfig`.
//!
//! Settings are keyed by tenant; `None` holds the installation-wide
//! defaults. A tenant that never stored settings reads the defaults
//! below without an `id`.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use ipamd_core::{Handler, QueryScope, RequestContext, RpcError, RpcResult};
use ipamd_middleware::stages::{FieldFormat, FieldType, PayloadSchema};
use ipamd_middleware::BoxFuture;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::error::ServerResult;
use crate::registry::{HandlerRegistry, ServiceRegistrar};

/// Operation identifier of the settings read.
pub const GET_DNS_CONFIG: &str = "/ipam.service.v1.SystemService/GetDnsConfig";

/// Operation identifier of the settings write.
pub const UPDATE_DNS_CONFIG: &str = "/ipam.service.v1.SystemService/UpdateDnsConfig";

/// Lookup timeout used when none is stored or supplied.
pub const DEFAULT_DNS_TIMEOUT_MS: i32 = 5000;

/// Longest accepted lookup timeout.
pub const MAX_DNS_TIMEOUT_MS: i32 = 60_000;

/// Resolver settings of one tenant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DnsConfig {
    /// Storage identifier; absent for unsaved defaults.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<u64>,
    /// Owning tenant.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tenant_id: Option<u32>,
    /// Resolvers as `ip` or `ip:port`, tried in order.
    pub dns_servers: Vec<String>,
    /// Per-lookup timeout.
    pub timeout_ms: i32,
    /// Fall back to the host resolver when every listed server fails.
    pub use_system_dns_fallback: bool,
    /// Whether reverse lookups run at all.
    pub reverse_dns_enabled: bool,
    /// First write.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    /// Latest write.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

impl DnsConfig {
    /// Settings reported for a tenant with nothing stored.
    #[must_use]
    pub fn defaults(tenant_id: Option<u32>) -> Self {
        Self {
            id: None,
            tenant_id,
            dns_servers: Vec::new(),
            timeout_ms: DEFAULT_DNS_TIMEOUT_MS,
            use_system_dns_fallback: true,
            reverse_dns_enabled: true,
            created_at: None,
            updated_at: None,
        }
    }
}

/// A full replacement of one tenant's settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DnsConfigUpdate {
    /// Owning tenant.
    pub tenant_id: Option<u32>,
    /// Resolvers, already checked.
    pub dns_servers: Vec<String>,
    /// Per-lookup timeout.
    pub timeout_ms: i32,
    /// Host resolver fallback.
    pub use_system_dns_fallback: bool,
    /// Reverse lookups on or off.
    pub reverse_dns_enabled: bool,
}

/// Failure of a [`DnsConfigStore`].
#[derive(Debug, Error)]
pub enum DnsConfigError {
    /// The query scope does not reach the requested tenant.
    #[error("tenant {0:?} is outside the caller's scope")]
    OutOfScope(Option<u32>),
    /// The backing store failed.
    #[error("dns settings unavailable: {0}")]
    Storage(String),
}

impl From<DnsConfigError> for RpcError {
    fn from(e: DnsConfigError) -> Self {
        match e {
            DnsConfigError::OutOfScope(_) => Self::permission_denied(e.to_string()),
            DnsConfigError::Storage(_) => Self::internal(e.to_string()),
        }
    }
}

/// Storage of per-tenant resolver settings.
pub trait DnsConfigStore: Send + Sync + 'static {
    /// Reads the settings stored for `tenant_id`, if any.
    fn fetch(
        &self,
        scope: QueryScope,
        tenant_id: Option<u32>,
    ) -> BoxFuture<'_, Result<Option<DnsConfig>, DnsConfigError>>;

    /// Creates or replaces the settings of `update.tenant_id`.
    fn upsert(
        &self,
        scope: QueryScope,
        update: DnsConfigUpdate,
    ) -> BoxFuture<'_, Result<DnsConfig, DnsConfigError>>;
}

fn reaches(scope: QueryScope, tenant_id: Option<u32>) -> bool {
    match scope {
        QueryScope::AllTenants => true,
        QueryScope::Tenant(own) => tenant_id == Some(own),
        QueryScope::Denied => false,
    }
}

/// Keeps settings in process memory.
#[derive(Debug, Default)]
pub struct InMemoryDnsConfigStore {
    state: Mutex<StoreState>,
}

#[derive(Debug, Default)]
struct StoreState {
    next_id: u64,
    rows: HashMap<Option<u32>, DnsConfig>,
}

impl InMemoryDnsConfigStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl DnsConfigStore for InMemoryDnsConfigStore {
    fn fetch(
        &self,
        scope: QueryScope,
        tenant_id: Option<u32>,
    ) -> BoxFuture<'_, Result<Option<DnsConfig>, DnsConfigError>> {
        let result = if reaches(scope, tenant_id) {
            Ok(self.state.lock().rows.get(&tenant_id).cloned())
        } else {
            Err(DnsConfigError::OutOfScope(tenant_id))
        };
        Box::pin(std::future::ready(result))
    }

    fn upsert(
        &self,
        scope: QueryScope,
        update: DnsConfigUpdate,
    ) -> BoxFuture<'_, Result<DnsConfig, DnsConfigError>> {
        if !reaches(scope, update.tenant_id) {
            return Box::pin(std::future::ready(Err(DnsConfigError::OutOfScope(
                update.tenant_id,
            ))));
        }

        let now = Utc::now();
        let mut state = self.state.lock();
        let existing = state
            .rows
            .get(&update.tenant_id)
            .map(|row| (row.id, row.created_at));
        let (id, created_at) = match existing {
            Some((id, created_at)) => (id, created_at.or(Some(now))),
            None => {
                state.next_id += 1;
                (Some(state.next_id), Some(now))
            }
        };

        let row = DnsConfig {
            id,
            tenant_id: update.tenant_id,
            dns_servers: update.dns_servers,
            timeout_ms: update.timeout_ms,
            use_system_dns_fallback: update.use_system_dns_fallback,
            reverse_dns_enabled: update.reverse_dns_enabled,
            created_at,
            updated_at: Some(now),
        };
        state.rows.insert(update.tenant_id, row.clone());
        Box::pin(std::future::ready(Ok(row)))
    }
}

/// `GetDnsConfig` request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetDnsConfigRequest {
    /// Tenant to read; absent reads the installation defaults.
    #[serde(default)]
    pub tenant_id: Option<u32>,
}

/// `UpdateDnsConfig` request. Omitted settings fall back to the defaults.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateDnsConfigRequest {
    /// Tenant to write.
    #[serde(default)]
    pub tenant_id: Option<u32>,
    /// Resolvers as `ip` or `ip:port`.
    #[serde(default)]
    pub dns_servers: Vec<String>,
    /// Per-lookup timeout.
    #[serde(default)]
    pub timeout_ms: Option<i32>,
    /// Host resolver fallback.
    #[serde(default)]
    pub use_system_dns_fallback: Option<bool>,
    /// Reverse lookups on or off.
    #[serde(default)]
    pub reverse_dns_enabled: Option<bool>,
}

/// Reply of both DNS settings calls.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DnsConfigResponse {
    /// Effective settings.
    pub config: DnsConfig,
}

/// Registers `GetDnsConfig` and `UpdateDnsConfig`.
pub struct DnsConfigService {
    store: Arc<dyn DnsConfigStore>,
}

impl std::fmt::Debug for DnsConfigService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DnsConfigService").finish_non_exhaustive()
    }
}

impl DnsConfigService {
    /// Creates the service.
    #[must_use]
    pub fn new(store: Arc<dyn DnsConfigStore>) -> Self {
        Self { store }
    }

    fn tenant_field(schema: PayloadSchema) -> PayloadSchema {
        schema.optional("tenant_id", FieldType::Integer).format(
            "tenant_id",
            FieldFormat::Range {
                min: 0,
                max: i64::from(u32::MAX),
            },
        )
    }

    /// Payload schema of `GetDnsConfig`.
    #[must_use]
    pub fn get_schema() -> PayloadSchema {
        Self::tenant_field(PayloadSchema::new()).deny_additional()
    }

    /// Payload schema of `UpdateDnsConfig`.
    #[must_use]
    pub fn update_schema() -> PayloadSchema {
        Self::tenant_field(PayloadSchema::new())
            .optional("dns_servers", FieldType::Array)
            .optional("timeout_ms", FieldType::Integer)
            .format(
                "timeout_ms",
                FieldFormat::Range {
                    min: 1,
                    max: i64::from(MAX_DNS_TIMEOUT_MS),
                },
            )
            .optional("use_system_dns_fallback", FieldType::Boolean)
            .optional("reverse_dns_enabled", FieldType::Boolean)
            .deny_additional()
    }
}

impl ServiceRegistrar for DnsConfigService {
    fn service_name(&self) -> &'static str {
        "dns_config"
    }

    fn register(&self, registry: &mut HandlerRegistry) -> ServerResult<()> {
        registry.register_with_schema(
            GET_DNS_CONFIG,
            GetDnsConfigHandler {
                store: Arc::clone(&self.store),
            },
            Self::get_schema(),
        )?;
        registry.register_with_schema(
            UPDATE_DNS_CONFIG,
            UpdateDnsConfigHandler {
                store: Arc::clone(&self.store),
            },
            Self::update_schema(),
        )
    }
}

struct GetDnsConfigHandler {
    store: Arc<dyn DnsConfigStore>,
}

impl Handler<GetDnsConfigRequest, DnsConfigResponse> for GetDnsConfigHandler {
    async fn handle(
        &self,
        ctx: &RequestContext,
        request: GetDnsConfigRequest,
    ) -> RpcResult<DnsConfigResponse> {
        let stored = ctx
            .deadline()
            .run(
                "dns settings read",
                self.store.fetch(ctx.query_scope(), request.tenant_id),
            )
            .await??;

        Ok(DnsConfigResponse {
            config: stored.unwrap_or_else(|| DnsConfig::defaults(request.tenant_id)),
        })
    }
}

struct UpdateDnsConfigHandler {
    store: Arc<dyn DnsConfigStore>,
}

/// Accepts `ip` or `ip:port`, IPv6 with a port in brackets.
fn check_server(server: &str) -> RpcResult<()> {
    if server.parse::<IpAddr>().is_ok() || server.parse::<SocketAddr>().is_ok() {
        Ok(())
    } else {
        Err(RpcError::invalid_argument(format!(
            "dns_servers: {server:?} is not an address"
        )))
    }
}

impl Handler<UpdateDnsConfigRequest, DnsConfigResponse> for UpdateDnsConfigHandler {
    async fn handle(
        &self,
        ctx: &RequestContext,
        request: UpdateDnsConfigRequest,
    ) -> RpcResult<DnsConfigResponse> {
        for server in &request.dns_servers {
            check_server(server)?;
        }

        let update = DnsConfigUpdate {
            tenant_id: request.tenant_id,
            dns_servers: request.dns_servers,
            timeout_ms: request.timeout_ms.unwrap_or(DEFAULT_DNS_TIMEOUT_MS),
            use_system_dns_fallback: request.use_system_dns_fallback.unwrap_or(true),
            reverse_dns_enabled: request.reverse_dns_enabled.unwrap_or(true),
        };

        tracing::info!(
            request_id = %ctx.request_id(),
            tenant_id = ?update.tenant_id,
            servers = update.dns_servers.len(),
            "updating dns settings"
        );

        let config = ctx
            .deadline()
            .run(
                "dns settings write",
                self.store.upsert(ctx.query_scope(), update),
            )
            .await??;
        Ok(DnsConfigResponse { config })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ipamd_core::{ErrorCategory, Viewer};
    use serde_json::json;

    fn registry(store: Arc<dyn DnsConfigStore>) -> HandlerRegistry {
        let mut registry = HandlerRegistry::new();
        registry
            .register_service(&DnsConfigService::new(store))
            .unwrap();
        registry
    }

    fn system_ctx(operation: &str) -> RequestContext {
        RequestContext::new(operation).with_viewer(Viewer::System)
    }

    #[tokio::test]
    async fn test_unsaved_tenant_reads_defaults() {
        let dns = registry(Arc::new(InMemoryDnsConfigStore::new()));
        let reply = dns
            .get(GET_DNS_CONFIG)
            .unwrap()
            .call(&system_ctx(GET_DNS_CONFIG), json!({"tenant_id": 4}))
            .await
            .unwrap();
        let reply: DnsConfigResponse = serde_json::from_value(reply).unwrap();

        assert_eq!(reply.config, DnsConfig::defaults(Some(4)));
        assert!(reply.config.id.is_none());
    }

    #[tokio::test]
    async fn test_update_then_read_back() {
        let dns = registry(Arc::new(InMemoryDnsConfigStore::new()));
        let written = dns
            .get(UPDATE_DNS_CONFIG)
            .unwrap()
            .call(
                &system_ctx(UPDATE_DNS_CONFIG),
                json!({
                    "tenant_id": 4,
                    "dns_servers": ["10.0.0.53", "[fd00::53]:5353"],
                    "reverse_dns_enabled": false
                }),
            )
            .await
            .unwrap();
        assert_eq!(written["config"]["timeout_ms"], DEFAULT_DNS_TIMEOUT_MS);
        assert_eq!(written["config"]["use_system_dns_fallback"], true);
        assert_eq!(written["config"]["reverse_dns_enabled"], false);

        let read = dns
            .get(GET_DNS_CONFIG)
            .unwrap()
            .call(&system_ctx(GET_DNS_CONFIG), json!({"tenant_id": 4}))
            .await
            .unwrap();
        assert_eq!(read, written);

        let other = dns
            .get(GET_DNS_CONFIG)
            .unwrap()
            .call(&system_ctx(GET_DNS_CONFIG), json!({"tenant_id": 5}))
            .await
            .unwrap();
        assert!(other["config"].get("id").is_none());
    }

    #[tokio::test]
    async fn test_second_update_keeps_identity() {
        let store = InMemoryDnsConfigStore::new();
        let update = DnsConfigUpdate {
            tenant_id: Some(1),
            dns_servers: vec!["1.1.1.1".to_string()],
            timeout_ms: 2000,
            use_system_dns_fallback: false,
            reverse_dns_enabled: true,
        };

        let first = store
            .upsert(QueryScope::AllTenants, update.clone())
            .await
            .unwrap();
        let second = store
            .upsert(
                QueryScope::AllTenants,
                DnsConfigUpdate {
                    timeout_ms: 3000,
                    ..update
                },
            )
            .await
            .unwrap();

        assert_eq!(first.id, second.id);
        assert_eq!(first.created_at, second.created_at);
        assert_eq!(second.timeout_ms, 3000);
    }

    #[tokio::test]
    async fn test_tenant_scope_cannot_reach_other_tenant() {
        let store = InMemoryDnsConfigStore::new();

        assert!(store.fetch(QueryScope::Tenant(2), Some(2)).await.is_ok());
        let err = RpcError::from(
            store
                .fetch(QueryScope::Tenant(2), Some(3))
                .await
                .unwrap_err(),
        );
        assert_eq!(err.category(), ErrorCategory::PermissionDenied);
        assert!(store.fetch(QueryScope::Denied, None).await.is_err());
    }

    #[tokio::test]
    async fn test_rejects_unparseable_server() {
        let dns = registry(Arc::new(InMemoryDnsConfigStore::new()));
        let err = dns
            .get(UPDATE_DNS_CONFIG)
            .unwrap()
            .call(
                &system_ctx(UPDATE_DNS_CONFIG),
                json!({"dns_servers": ["ns1.example.net"]}),
            )
            .await
            .unwrap_err();

        assert_eq!(err.category(), ErrorCategory::InvalidArgument);
    }

    #[test]
    fn test_update_schema() {
        let schema = DnsConfigService::update_schema();
        assert!(schema
            .validate(&json!({"tenant_id": 1, "timeout_ms": 500}))
            .is_ok());
        assert!(schema.validate(&json!({"timeout_ms": 0})).is_err());
        assert!(schema
            .validate(&json!({"timeout_ms": MAX_DNS_TIMEOUT_MS + 1}))
            .is_err());
        assert!(schema.validate(&json!({"dns_servers": "10.0.0.1"})).is_err());
        assert!(schema.validate(&json!({"retries": 3})).is_err());
    }
}
