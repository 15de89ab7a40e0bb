pub mod backend;
pub mod control;
pub mod cost;
pub mod dispatch;
pub mod error;
pub mod events;
pub mod health;
pub mod orchestrator;
pub mod process;
pub mod registry;
pub mod routing;
pub mod types;

// Re-export the public surface at crate root for convenience.
pub use backend::{Backend, BackendError, Completion, HttpBackend};
pub use control::{ControlApi, ControlResponse, ControlStatus};
pub use cost::{BudgetPeriod, BudgetState, CostTracker, SpendLedger};
pub use dispatch::{Dispatcher, TaskResult};
pub use error::{
    CandidateFailure, DispatchError, FailureReason, ProcessError, RegistryError, RoutingError,
    SetupError,
};
pub use events::{EngineEvent, EventBus};
pub use health::{HealthMonitor, HealthProbe, HttpHealthProbe};
pub use orchestrator::Orchestrator;
pub use process::ProcessManager;
pub use registry::{ProviderRegistry, ProviderSnapshot};
pub use routing::{Routed, Router, RoutingTable};
pub use types::*;
