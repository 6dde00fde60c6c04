//! Built-in services.

pub mod dns;
pub mod system;

pub use dns::{
    DnsConfig, DnsConfigError, DnsConfigResponse, DnsConfigService, DnsConfigStore,
    DnsConfigUpdate, GetDnsConfigRequest, InMemoryDnsConfigStore, UpdateDnsConfigRequest,
};

pub use system::{
    GetStatsRequest, GetStatsResponse, HealthCheckResponse, StaticStatistics, StatisticKind,
    StatisticsError, StatisticsSource, SystemService,
};
