use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use conductor_core::config::{LaunchConfig, ProviderConfig};
pub use conductor_core::config::ProviderKind;

// ---------------------------------------------------------------------------
// Providers
// ---------------------------------------------------------------------------

/// A configured backend. Immutable after load except for `enabled`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Provider {
    pub id: String,
    pub endpoint: String,
    pub kind: ProviderKind,
    pub models: Vec<String>,
    pub priority: u32,
    pub cost_per_token: f64,
    pub daily_budget: Option<f64>,
    pub monthly_budget: Option<f64>,
    pub enabled: bool,
    pub health_path: String,
    pub launch: Option<LaunchConfig>,
}

impl Provider {
    /// A provider with priority 0, no cost, no budgets and no launch command.
    pub fn new(
        id: impl Into<String>,
        endpoint: impl Into<String>,
        kind: ProviderKind,
        models: &[&str],
    ) -> Self {
        Self {
            id: id.into(),
            endpoint: endpoint.into(),
            kind,
            models: models.iter().map(|m| m.to_string()).collect(),
            priority: 0,
            cost_per_token: 0.0,
            daily_budget: None,
            monthly_budget: None,
            enabled: true,
            health_path: "/health".into(),
            launch: None,
        }
    }

    pub fn with_priority(mut self, priority: u32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_cost_per_token(mut self, cost: f64) -> Self {
        self.cost_per_token = cost;
        self
    }

    pub fn with_daily_budget(mut self, cap: f64) -> Self {
        self.daily_budget = Some(cap);
        self
    }

    pub fn with_monthly_budget(mut self, cap: f64) -> Self {
        self.monthly_budget = Some(cap);
        self
    }

    pub fn with_launch(mut self, launch: LaunchConfig) -> Self {
        self.launch = Some(launch);
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    pub fn supports(&self, model: &str) -> bool {
        self.models.iter().any(|m| m == model)
    }

    /// Whether the orchestrator owns this provider's server process.
    pub fn is_managed(&self) -> bool {
        self.kind == ProviderKind::LocalProcess && self.launch.is_some()
    }

    /// URL of the lightweight liveness endpoint.
    pub fn health_url(&self) -> String {
        format!(
            "{}{}",
            self.endpoint.trim_end_matches('/'),
            self.health_path
        )
    }
}

impl From<&ProviderConfig> for Provider {
    fn from(config: &ProviderConfig) -> Self {
        Self {
            id: config.id.clone(),
            endpoint: config.endpoint.clone(),
            kind: config.kind,
            models: config.models.clone(),
            priority: config.priority,
            cost_per_token: config.cost_per_token,
            daily_budget: config.daily_budget,
            monthly_budget: config.monthly_budget,
            enabled: config.enabled,
            health_path: config.health_path.clone(),
            launch: config.launch.clone(),
        }
    }
}

// ---------------------------------------------------------------------------
// Health
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    #[default]
    Unknown,
    Healthy,
    Degraded,
    Unreachable,
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Unknown => "unknown",
            Self::Healthy => "healthy",
            Self::Degraded => "degraded",
            Self::Unreachable => "unreachable",
        };
        f.write_str(s)
    }
}

/// Live health of one provider, mutated only through the health monitor.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ProviderHealth {
    pub status: HealthStatus,
    pub last_success: Option<DateTime<Utc>>,
    /// Exponentially weighted average of successful probe latencies.
    pub avg_latency_ms: Option<f64>,
    pub consecutive_failures: u32,
}

// ---------------------------------------------------------------------------
// Processes
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessState {
    #[default]
    Stopped,
    Starting,
    Running,
    Stopping,
    Crashed,
}

impl ProcessState {
    /// `starting` and `running` handles occupy their port.
    pub fn occupies_port(self) -> bool {
        matches!(self, Self::Starting | Self::Running)
    }
}

impl std::fmt::Display for ProcessState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Stopped => "stopped",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Stopping => "stopping",
            Self::Crashed => "crashed",
        };
        f.write_str(s)
    }
}

/// Snapshot of a locally spawned inference server.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProcessHandle {
    pub provider_id: String,
    pub model: String,
    pub state: ProcessState,
    pub port: u16,
    pub pid: Option<u32>,
    pub started_at: Option<DateTime<Utc>>,
    pub log_path: PathBuf,
}

// ---------------------------------------------------------------------------
// Tasks
// ---------------------------------------------------------------------------

/// A unit of work submitted by a caller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskDescriptor {
    /// Caller-supplied correlation id, stable across retries.
    pub id: String,
    /// Routing category, e.g. `simple`, `complex`, `code`.
    pub category: String,
    pub prompt: String,
    #[serde(default)]
    pub model_preference: Option<String>,
    /// Timeout for each attempt. Falls back to the engine default.
    #[serde(default)]
    pub latency_budget: Option<Duration>,
    /// Overall time allowed for the task, measured from submission.
    #[serde(default)]
    pub deadline: Option<Duration>,
}

impl TaskDescriptor {
    pub fn new(category: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            category: category.into(),
            prompt: prompt.into(),
            model_preference: None,
            latency_budget: None,
            deadline: None,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model_preference = Some(model.into());
        self
    }

    pub fn with_latency_budget(mut self, budget: Duration) -> Self {
        self.latency_budget = Some(budget);
        self
    }

    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }
}

// ---------------------------------------------------------------------------
// Routing
// ---------------------------------------------------------------------------

/// One (provider, model) pair considered for a task.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Candidate {
    pub provider: String,
    pub model: String,
}

impl std::fmt::Display for Candidate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.provider, self.model)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RoutingOutcome {
    Success,
    FallbackUsed,
    Exhausted,
}

/// What the router did for one task. Kept for observability only.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RoutingDecision {
    pub task_id: String,
    pub candidates: Vec<Candidate>,
    pub used: Option<Candidate>,
    pub elapsed: Duration,
    pub outcome: RoutingOutcome,
}
