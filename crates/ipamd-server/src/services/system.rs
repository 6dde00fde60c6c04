//! System service: health check and inventory statistics.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use ipamd_core::{Empty, Handler, QueryScope, RequestContext, RpcResult};
use ipamd_middleware::stages::{FieldFormat, FieldType, PayloadSchema};
use ipamd_middleware::BoxFuture;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::error::ServerResult;
use crate::health::SecurityPosture;
use crate::registry::{HandlerRegistry, ServiceRegistrar};

/// Operation identifier of the liveness call.
pub const HEALTH_CHECK: &str = "/ipam.service.v1.SystemService/HealthCheck";

/// Operation identifier of the statistics call.
pub const GET_STATS: &str = "/ipam.service.v1.SystemService/GetStats";

/// Inventory counts read by `GetStats`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StatisticKind {
    /// Number of subnets.
    Subnets,
    /// Sum of the capacity of every subnet.
    TotalAddresses,
    /// Number of recorded IP addresses.
    UsedAddresses,
    /// Number of VLANs.
    Vlans,
    /// Number of devices.
    Devices,
    /// Number of locations.
    Locations,
}

impl StatisticKind {
    /// Returns the name used in logs.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Subnets => "subnets",
            Self::TotalAddresses => "total_addresses",
            Self::UsedAddresses => "used_addresses",
            Self::Vlans => "vlans",
            Self::Devices => "devices",
            Self::Locations => "locations",
        }
    }
}

/// A count could not be read.
#[derive(Debug, Error)]
#[error("statistic unavailable: {0}")]
pub struct StatisticsError(pub String);

/// Storage-side provider of inventory counts.
///
/// `scope` carries the caller's privilege; the system viewer yields
/// [`QueryScope::AllTenants`].
pub trait StatisticsSource: Send + Sync + 'static {
    /// Reads one count.
    fn count(
        &self,
        scope: QueryScope,
        kind: StatisticKind,
    ) -> BoxFuture<'_, Result<i64, StatisticsError>>;
}

/// Fixed counts, for tests and deployments without an inventory store.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StaticStatistics {
    /// Number of subnets.
    pub subnets: i64,
    /// Sum of subnet capacity.
    pub total_addresses: i64,
    /// Number of recorded addresses.
    pub used_addresses: i64,
    /// Number of VLANs.
    pub vlans: i64,
    /// Number of devices.
    pub devices: i64,
    /// Number of locations.
    pub locations: i64,
}

impl StatisticsSource for StaticStatistics {
    fn count(
        &self,
        _scope: QueryScope,
        kind: StatisticKind,
    ) -> BoxFuture<'_, Result<i64, StatisticsError>> {
        let value = match kind {
            StatisticKind::Subnets => self.subnets,
            StatisticKind::TotalAddresses => self.total_addresses,
            StatisticKind::UsedAddresses => self.used_addresses,
            StatisticKind::Vlans => self.vlans,
            StatisticKind::Devices => self.devices,
            StatisticKind::Locations => self.locations,
        };
        Box::pin(std::future::ready(Ok(value)))
    }
}

/// `HealthCheck` reply.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthCheckResponse {
    /// Always `healthy` while the process serves calls.
    pub status: String,
    /// Crate version.
    pub version: String,
    /// Time of the reply.
    pub timestamp: DateTime<Utc>,
    /// Whether client certificates are enforced.
    pub mtls_enabled: bool,
    /// Why they are not.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mtls_reason: Option<String>,
}

/// `GetStats` request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetStatsRequest {
    /// Accepted for wire compatibility and logged, never used to filter.
    ///
    /// The pipeline runs every call as the system viewer, whose query
    /// scope spans all tenants, so the reply always totals every tenant.
    #[serde(default)]
    pub tenant_id: Option<u32>,
}

/// `GetStats` reply.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GetStatsResponse {
    /// Number of subnets.
    pub total_subnets: i64,
    /// Sum of subnet capacity.
    pub total_addresses: i64,
    /// Number of recorded addresses.
    pub used_addresses: i64,
    /// `max(total - used, 0)`.
    pub available_addresses: i64,
    /// Number of VLANs.
    pub total_vlans: i64,
    /// Number of devices.
    pub total_devices: i64,
    /// Number of locations.
    pub total_locations: i64,
    /// Used over total, in percent; zero without capacity.
    pub overall_utilization: f64,
}

/// Registers `HealthCheck` and `GetStats`.
pub struct SystemService {
    statistics: Arc<dyn StatisticsSource>,
    posture: SecurityPosture,
}

impl std::fmt::Debug for SystemService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SystemService")
            .field("posture", &self.posture)
            .finish_non_exhaustive()
    }
}

impl SystemService {
    /// Creates the service.
    #[must_use]
    pub fn new(statistics: Arc<dyn StatisticsSource>, posture: SecurityPosture) -> Self {
        Self {
            statistics,
            posture,
        }
    }

    /// Payload schema of `GetStats`.
    #[must_use]
    pub fn get_stats_schema() -> PayloadSchema {
        PayloadSchema::new()
            .optional("tenant_id", FieldType::Integer)
            .format(
                "tenant_id",
                FieldFormat::Range {
                    min: 0,
                    max: i64::from(u32::MAX),
                },
            )
            .deny_additional()
    }
}

impl ServiceRegistrar for SystemService {
    fn service_name(&self) -> &'static str {
        "system"
    }

    fn register(&self, registry: &mut HandlerRegistry) -> ServerResult<()> {
        registry.register(
            HEALTH_CHECK,
            HealthCheckHandler {
                posture: self.posture.clone(),
            },
        )?;
        registry.register_with_schema(
            GET_STATS,
            GetStatsHandler {
                statistics: Arc::clone(&self.statistics),
            },
            Self::get_stats_schema(),
        )
    }
}

struct HealthCheckHandler {
    posture: SecurityPosture,
}

impl Handler<Empty, HealthCheckResponse> for HealthCheckHandler {
    async fn handle(&self, _ctx: &RequestContext, _request: Empty) -> RpcResult<HealthCheckResponse> {
        Ok(HealthCheckResponse {
            status: "healthy".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            timestamp: Utc::now(),
            mtls_enabled: self.posture.mutual_tls,
            mtls_reason: self.posture.reason.clone(),
        })
    }
}

struct GetStatsHandler {
    statistics: Arc<dyn StatisticsSource>,
}

impl GetStatsHandler {
    /// A failed read is logged and counts as zero.
    async fn read(&self, ctx: &RequestContext, kind: StatisticKind) -> RpcResult<i64> {
        let result = ctx
            .deadline()
            .run("statistics read", self.statistics.count(ctx.query_scope(), kind))
            .await?;

        Ok(result.unwrap_or_else(|e| {
            tracing::error!(
                statistic = kind.as_str(),
                request_id = %ctx.request_id(),
                error = %e,
                "failed to read statistic"
            );
            0
        }))
    }
}

/// Counts are read under the context's query scope, not `tenant_id`.
impl Handler<GetStatsRequest, GetStatsResponse> for GetStatsHandler {
    async fn handle(
        &self,
        ctx: &RequestContext,
        request: GetStatsRequest,
    ) -> RpcResult<GetStatsResponse> {
        tracing::debug!(
            request_id = %ctx.request_id(),
            tenant_id = ?request.tenant_id,
            "collecting inventory statistics"
        );

        let total_addresses = self.read(ctx, StatisticKind::TotalAddresses).await?;
        let used_addresses = self.read(ctx, StatisticKind::UsedAddresses).await?;

        let overall_utilization = if total_addresses > 0 {
            used_addresses as f64 / total_addresses as f64 * 100.0
        } else {
            0.0
        };

        Ok(GetStatsResponse {
            total_subnets: self.read(ctx, StatisticKind::Subnets).await?,
            total_addresses,
            used_addresses,
            available_addresses: (total_addresses - used_addresses).max(0),
            total_vlans: self.read(ctx, StatisticKind::Vlans).await?,
            total_devices: self.read(ctx, StatisticKind::Devices).await?,
            total_locations: self.read(ctx, StatisticKind::Locations).await?,
            overall_utilization,
        })
    }
}
