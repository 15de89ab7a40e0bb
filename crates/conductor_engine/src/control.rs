//! Operator control surface: thin pass-throughs to the lifecycle manager and
//! registry that never fail outright. Every call returns a
//! [`ControlResponse`] suitable for a dashboard or CLI.

use std::sync::Arc;

use serde::Serialize;
use tracing::info;

use crate::health::HealthMonitor;
use crate::process::{LOG_TAIL_LINES, ProcessManager};
use crate::registry::ProviderRegistry;
use crate::types::{HealthStatus, ProcessState};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ControlStatus {
    Success,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ControlResponse {
    pub status: ControlStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub logs: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub process_state: Option<ProcessState>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub health: Option<HealthStatus>,
}

impl ControlResponse {
    fn success(message: impl Into<String>) -> Self {
        Self {
            status: ControlStatus::Success,
            message: Some(message.into()),
            logs: None,
            port: None,
            pid: None,
            process_state: None,
            health: None,
        }
    }

    fn error(err: impl std::fmt::Display) -> Self {
        Self {
            status: ControlStatus::Error,
            message: Some(err.to_string()),
            ..Self::success("")
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == ControlStatus::Success
    }
}

#[derive(Clone)]
pub struct ControlApi {
    registry: Arc<ProviderRegistry>,
    processes: Arc<ProcessManager>,
    health: Arc<HealthMonitor>,
}

impl ControlApi {
    pub fn new(
        registry: Arc<ProviderRegistry>,
        processes: Arc<ProcessManager>,
        health: Arc<HealthMonitor>,
    ) -> Self {
        Self {
            registry,
            processes,
            health,
        }
    }

    /// Start a provider's server, optionally overriding the model.
    pub async fn start_provider(&self, id: &str, model: Option<&str>) -> ControlResponse {
        let handle = match self.processes.start(id, model).await {
            Ok(handle) => handle,
            Err(e) => return ControlResponse::error(e),
        };
        info!(provider = id, port = handle.port, "Provider started via control API");

        // Probe right away so routing need not wait a full health interval.
        if let Ok(provider) = self.registry.get(id) {
            self.health.check(&provider).await;
        }

        ControlResponse {
            port: Some(handle.port),
            pid: handle.pid,
            process_state: Some(handle.state),
            ..ControlResponse::success(format!(
                "Started {id} ({}) on port {}",
                handle.model, handle.port
            ))
        }
    }

    pub async fn stop_provider(&self, id: &str) -> ControlResponse {
        match self.processes.stop(id).await {
            Ok(()) => {
                info!(provider = id, "Provider stopped via control API");
                ControlResponse {
                    process_state: self.processes.handle(id).map(|h| h.state),
                    ..ControlResponse::success(format!("Stopped {id}"))
                }
            }
            Err(e) => ControlResponse::error(e),
        }
    }

    pub fn get_provider_status(&self, id: &str) -> ControlResponse {
        let snap = match self.registry.snapshot(id) {
            Ok(snap) => snap,
            Err(e) => return ControlResponse::error(e),
        };
        let handle = self.processes.handle(id);
        let availability = match (snap.provider.enabled, snap.process_running) {
            (false, _) => "disabled",
            (true, Some(false)) => "no running process",
            (true, _) => "enabled",
        };
        ControlResponse {
            port: handle.as_ref().map(|h| h.port),
            pid: handle.as_ref().and_then(|h| h.pid),
            process_state: handle.as_ref().map(|h| h.state),
            health: Some(snap.health.status),
            ..ControlResponse::success(format!(
                "{id}: {}, health {}",
                availability, snap.health.status
            ))
        }
    }

    /// The last lines of the provider's process log.
    pub async fn get_provider_log(&self, id: &str) -> ControlResponse {
        match self.processes.provider_log(id, LOG_TAIL_LINES).await {
            Ok(logs) => ControlResponse {
                logs: Some(logs),
                ..ControlResponse::success(format!("Log for {id}"))
            },
            Err(e) => ControlResponse::error(e),
        }
    }
}
