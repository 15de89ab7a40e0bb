//! Configuration snapshot consumed by the orchestration engine.
//!
//! The document enumerates providers, per-category routing rules and the
//! tuning knobs of the background workers. It is loaded once, validated, and
//! handed to the engine as an immutable value. Reloading means loading a new
//! snapshot and passing it to the engine again.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use serde::{Deserialize, Serialize};
use tracing::info;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Fatal problems with a configuration document.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config {path}: {message}")]
    Parse { path: PathBuf, message: String },

    #[error("Provider id must not be empty")]
    EmptyProviderId,

    #[error("Duplicate provider id: {0}")]
    DuplicateProvider(String),

    #[error("Provider {0} lists no models")]
    NoModels(String),

    #[error("Provider {provider}: {field} must not be negative")]
    Negative { provider: String, field: &'static str },

    #[error("Provider {0} is a remote API but declares a launch command")]
    LaunchOnRemote(String),

    #[error("Routing rule {category} references unknown provider {provider}")]
    UnknownRouteProvider { category: String, provider: String },

    #[error("Routing rule {category} pins model {model} which {provider} does not serve")]
    UnknownRouteModel {
        category: String,
        provider: String,
        model: String,
    },

    #[error("Invalid setting {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

// ---------------------------------------------------------------------------
// Providers
// ---------------------------------------------------------------------------

/// Where a provider's inference runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ProviderKind {
    /// A server process spawned and supervised on this machine.
    LocalProcess,
    /// A network API operated by someone else.
    RemoteApi,
}

impl std::fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::LocalProcess => f.write_str("local-process"),
            Self::RemoteApi => f.write_str("remote-api"),
        }
    }
}

/// How to launch a local inference server.
///
/// `{model}` and `{port}` inside `args` are substituted at start time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LaunchConfig {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    pub port: u16,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    /// Start this process when the orchestrator starts.
    #[serde(default)]
    pub autostart: bool,
}

/// One configured backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderConfig {
    pub id: String,
    pub endpoint: String,
    pub kind: ProviderKind,
    /// Supported models, most preferred first.
    pub models: Vec<String>,
    /// Lower number is tried first.
    #[serde(default)]
    pub priority: u32,
    /// USD per token.
    #[serde(default)]
    pub cost_per_token: f64,
    #[serde(default)]
    pub daily_budget: Option<f64>,
    #[serde(default)]
    pub monthly_budget: Option<f64>,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_health_path")]
    pub health_path: String,
    #[serde(default)]
    pub launch: Option<LaunchConfig>,
}

fn default_true() -> bool {
    true
}

fn default_health_path() -> String {
    "/health".into()
}

// ---------------------------------------------------------------------------
// Routing
// ---------------------------------------------------------------------------

/// A provider named by a routing rule, optionally pinned to one model.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteTarget {
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
}

/// Candidate providers for one task category.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoutingRule {
    #[serde(default)]
    pub primary: Vec<RouteTarget>,
    #[serde(default)]
    pub fallback: Vec<RouteTarget>,
}

impl RoutingRule {
    /// All targets, primaries first.
    pub fn targets(&self) -> impl Iterator<Item = &RouteTarget> {
        self.primary.iter().chain(self.fallback.iter())
    }
}

// ---------------------------------------------------------------------------
// Worker settings
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CostConfig {
    /// Fraction of a cap at which a warning is raised.
    pub alert_threshold: f64,
}

impl Default for CostConfig {
    fn default() -> Self {
        Self {
            alert_threshold: 0.8,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    #[serde(with = "duration_ms")]
    pub interval: Duration,
    #[serde(with = "duration_ms")]
    pub probe_timeout: Duration,
    /// Consecutive failures before a provider is marked unreachable.
    pub failure_threshold: u32,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(5),
            probe_timeout: Duration::from_secs(2),
            failure_threshold: 3,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcessConfig {
    pub readiness_attempts: u32,
    #[serde(with = "duration_ms")]
    pub readiness_initial_backoff: Duration,
    #[serde(with = "duration_ms")]
    pub readiness_max_backoff: Duration,
    /// Upper bound on a single readiness check.
    #[serde(with = "duration_ms")]
    pub readiness_probe_timeout: Duration,
    /// How long a process gets to exit after SIGTERM before it is killed.
    #[serde(with = "duration_ms")]
    pub grace_period: Duration,
    #[serde(with = "duration_ms")]
    pub supervise_interval: Duration,
    /// Directory for per-provider process logs. Defaults to `~/.conductor/logs`.
    pub log_dir: Option<PathBuf>,
}

impl Default for ProcessConfig {
    fn default() -> Self {
        Self {
            readiness_attempts: 30,
            readiness_initial_backoff: Duration::from_millis(250),
            readiness_max_backoff: Duration::from_secs(5),
            readiness_probe_timeout: Duration::from_secs(2),
            grace_period: Duration::from_secs(10),
            supervise_interval: Duration::from_secs(2),
            log_dir: None,
        }
    }
}

// ---------------------------------------------------------------------------
// ConductorConfig
// ---------------------------------------------------------------------------

/// The whole configuration snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConductorConfig {
    pub providers: Vec<ProviderConfig>,
    /// Task category -> ordered candidates.
    pub routing: HashMap<String, RoutingRule>,
    pub cost_management: CostConfig,
    pub health: HealthConfig,
    pub process: ProcessConfig,
    /// Per-attempt timeout when a task does not set its own.
    #[serde(with = "duration_ms")]
    pub default_latency_budget: Duration,
    pub log_level: String,
}

impl Default for ConductorConfig {
    fn default() -> Self {
        Self {
            providers: Vec::new(),
            routing: HashMap::new(),
            cost_management: CostConfig::default(),
            health: HealthConfig::default(),
            process: ProcessConfig::default(),
            default_latency_budget: Duration::from_secs(30),
            log_level: "info".into(),
        }
    }
}

impl ConductorConfig {
    /// Returns the base directory: `~/.conductor/`
    pub fn base_dir() -> anyhow::Result<PathBuf> {
        let home = dirs::home_dir().context("Could not determine home directory")?;
        Ok(home.join(".conductor"))
    }

    /// Returns the logs directory: `~/.conductor/logs/`
    pub fn logs_dir() -> anyhow::Result<PathBuf> {
        Ok(Self::base_dir()?.join("logs"))
    }

    /// Where managed processes write their output.
    pub fn process_log_dir(&self) -> anyhow::Result<PathBuf> {
        match &self.process.log_dir {
            Some(dir) => Ok(dir.clone()),
            None => Self::logs_dir(),
        }
    }

    /// Load and validate a config file. `.json` files are parsed as JSON,
    /// everything else as TOML.
    pub fn load_from_path(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;

        let is_json = path
            .extension()
            .is_some_and(|ext| ext.eq_ignore_ascii_case("json"));
        let config = if is_json {
            Self::from_json(&content)
        } else {
            Self::from_toml(&content)
        }
        .map_err(|message| ConfigError::Parse {
            path: path.to_path_buf(),
            message,
        })?;

        config.validate()?;
        info!(
            path = %path.display(),
            providers = config.providers.len(),
            categories = config.routing.len(),
            "Loaded configuration"
        );
        Ok(config)
    }

    fn from_json(content: &str) -> Result<Self, String> {
        serde_json::from_str(content).map_err(|e| e.to_string())
    }

    fn from_toml(content: &str) -> Result<Self, String> {
        toml::from_str(content).map_err(|e| e.to_string())
    }

    /// Look up a provider definition.
    pub fn provider(&self, id: &str) -> Option<&ProviderConfig> {
        self.providers.iter().find(|p| p.id == id)
    }

    /// Check every structural rule. Any violation is fatal at load time.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut seen = HashSet::new();
        for p in &self.providers {
            if p.id.trim().is_empty() {
                return Err(ConfigError::EmptyProviderId);
            }
            if !seen.insert(p.id.as_str()) {
                return Err(ConfigError::DuplicateProvider(p.id.clone()));
            }
            if p.models.is_empty() {
                return Err(ConfigError::NoModels(p.id.clone()));
            }
            if p.cost_per_token < 0.0 {
                return Err(negative(&p.id, "cost_per_token"));
            }
            if p.daily_budget.is_some_and(|b| b < 0.0) {
                return Err(negative(&p.id, "daily_budget"));
            }
            if p.monthly_budget.is_some_and(|b| b < 0.0) {
                return Err(negative(&p.id, "monthly_budget"));
            }
            if p.kind == ProviderKind::RemoteApi && p.launch.is_some() {
                return Err(ConfigError::LaunchOnRemote(p.id.clone()));
            }
        }

        for (category, rule) in &self.routing {
            for target in rule.targets() {
                let Some(provider) = self.provider(&target.provider) else {
                    return Err(ConfigError::UnknownRouteProvider {
                        category: category.clone(),
                        provider: target.provider.clone(),
                    });
                };
                if let Some(model) = &target.model
                    && !provider.models.contains(model)
                {
                    return Err(ConfigError::UnknownRouteModel {
                        category: category.clone(),
                        provider: provider.id.clone(),
                        model: model.clone(),
                    });
                }
            }
        }

        let threshold = self.cost_management.alert_threshold;
        if !(threshold > 0.0 && threshold <= 1.0) {
            return Err(ConfigError::Invalid {
                field: "cost_management.alert_threshold",
                reason: format!("{threshold} is outside (0, 1]"),
            });
        }
        if self.health.failure_threshold == 0 {
            return Err(ConfigError::Invalid {
                field: "health.failure_threshold",
                reason: "must be at least 1".into(),
            });
        }
        if self.process.readiness_attempts == 0 {
            return Err(ConfigError::Invalid {
                field: "process.readiness_attempts",
                reason: "must be at least 1".into(),
            });
        }
        if self.process.readiness_probe_timeout.is_zero() {
            return Err(ConfigError::Invalid {
                field: "process.readiness_probe_timeout",
                reason: "must be greater than zero".into(),
            });
        }
        Ok(())
    }
}

fn negative(provider: &str, field: &'static str) -> ConfigError {
    ConfigError::Negative {
        provider: provider.to_string(),
        field,
    }
}

// ---------------------------------------------------------------------------
// Serde helpers
// ---------------------------------------------------------------------------

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(dur: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(dur.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let ms = u64::deserialize(d)?;
        Ok(Duration::from_millis(ms))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
