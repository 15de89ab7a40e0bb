//! Error types for the orchestration engine.

use std::time::Duration;

use serde::Serialize;

/// Registry lookups and registrations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    #[error("Provider already registered: {0}")]
    Duplicate(String),

    #[error("Provider not found: {0}")]
    NotFound(String),
}

/// Process lifecycle failures. All are recoverable: the caller may retry or
/// pick another slot.
#[derive(Debug, thiserror::Error)]
pub enum ProcessError {
    #[error("Port {port} is already held by {holder}")]
    PortInUse { port: u16, holder: String },

    #[error("Failed to spawn {provider}: {source}")]
    Spawn {
        provider: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{provider} not ready after {attempts} readiness checks")]
    ReadinessTimeout { provider: String, attempts: u32 },

    #[error("{provider} exited during startup (code {code:?})")]
    ExitedDuringStartup { provider: String, code: Option<i32> },

    #[error("Start of {0} was aborted by a concurrent stop")]
    StartAborted(String),

    #[error("Provider {0} has no launch configuration")]
    NotManaged(String),

    #[error("Failed to signal {provider}: {source}")]
    Signal {
        provider: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to read log for {provider}: {source}")]
    Log {
        provider: String,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error("Restart failed (stop: {stop}; start: {start})")]
    Restart {
        stop: Box<ProcessError>,
        start: Box<ProcessError>,
    },
}

/// Why a single candidate attempt failed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum FailureReason {
    /// The attempt ran past its latency budget.
    Timeout(Duration),
    /// The task's overall deadline expired during the attempt.
    DeadlineExceeded,
    /// The backend answered with an error.
    Backend(String),
}

impl std::fmt::Display for FailureReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Timeout(budget) => write!(f, "timed out after {}ms", budget.as_millis()),
            Self::DeadlineExceeded => f.write_str("deadline exceeded"),
            Self::Backend(msg) => f.write_str(msg),
        }
    }
}

/// A candidate that was tried and failed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CandidateFailure {
    pub provider: String,
    pub model: String,
    pub reason: FailureReason,
}

fn describe(failures: &[CandidateFailure]) -> String {
    failures
        .iter()
        .map(|f| format!("{}/{}: {}", f.provider, f.model, f.reason))
        .collect::<Vec<_>>()
        .join("; ")
}

/// Task-level routing failures, always with full candidate diagnostics.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum RoutingError {
    #[error("No eligible provider for category {category}")]
    NoEligibleProvider { category: String },

    #[error("All {} candidates failed for task {task_id}: {}", .failures.len(), describe(.failures))]
    AllProvidersFailed {
        task_id: String,
        failures: Vec<CandidateFailure>,
    },

    #[error("Deadline exceeded for task {task_id} after {} attempts: {}", .failures.len(), describe(.failures))]
    DeadlineExceeded {
        task_id: String,
        failures: Vec<CandidateFailure>,
    },
}

impl RoutingError {
    /// Per-candidate failures collected before giving up.
    pub fn failures(&self) -> &[CandidateFailure] {
        match self {
            Self::NoEligibleProvider { .. } => &[],
            Self::AllProvidersFailed { failures, .. } | Self::DeadlineExceeded { failures, .. } => {
                failures
            }
        }
    }
}

/// Errors surfaced by the task submission entry point.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum DispatchError {
    #[error("Invalid task: {0}")]
    InvalidTask(String),

    #[error(transparent)]
    Routing(#[from] RoutingError),
}

/// Failures while wiring the engine from a configuration snapshot.
#[derive(Debug, thiserror::Error)]
pub enum SetupError {
    #[error(transparent)]
    Config(#[from] conductor_core::ConfigError),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error("Process log directory unavailable: {0}")]
    LogDir(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn all_failed_lists_every_candidate() {
        let err = RoutingError::AllProvidersFailed {
            task_id: "t1".into(),
            failures: vec![
                CandidateFailure {
                    provider: "a".into(),
                    model: "m".into(),
                    reason: FailureReason::Timeout(Duration::from_millis(50)),
                },
                CandidateFailure {
                    provider: "b".into(),
                    model: "n".into(),
                    reason: FailureReason::Backend("HTTP 502".into()),
                },
            ],
        };
        let msg = err.to_string();
        assert!(msg.contains("All 2 candidates failed"));
        assert!(msg.contains("a/m: timed out after 50ms"));
        assert!(msg.contains("b/n: HTTP 502"));
        assert_eq!(err.failures().len(), 2);
    }

    #[test]
    fn restart_error_reports_both_sides() {
        let err = ProcessError::Restart {
            stop: Box::new(ProcessError::NotManaged("x".into())),
            start: Box::new(ProcessError::PortInUse {
                port: 8080,
                holder: "y".into(),
            }),
        };
        let msg = err.to_string();
        assert!(msg.contains("no launch configuration"));
        assert!(msg.contains("Port 8080"));
    }
}
