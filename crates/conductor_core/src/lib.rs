pub mod config;
pub mod logging;

pub use config::{
    ConductorConfig, ConfigError, CostConfig, HealthConfig, LaunchConfig, ProcessConfig,
    ProviderConfig, ProviderKind, RouteTarget, RoutingRule,
};
