//! Engine events for external observers (dashboards, audit logs).
//!
//! Events go out over a broadcast channel. Emitting never blocks and is a
//! no-op when nobody is subscribed; slow subscribers lag rather than stall
//! the engine.

use serde::Serialize;
use tokio::sync::broadcast;
use tracing::trace;

use crate::cost::BudgetPeriod;
use crate::types::{HealthStatus, ProcessState, RoutingOutcome};

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EngineEvent {
    HealthChanged {
        provider: String,
        from: HealthStatus,
        to: HealthStatus,
    },
    ProcessStateChanged {
        provider: String,
        from: ProcessState,
        to: ProcessState,
    },
    BudgetWarning {
        provider: String,
        period: BudgetPeriod,
        spent: f64,
        cap: f64,
    },
    BudgetExhausted {
        provider: String,
        period: BudgetPeriod,
        spent: f64,
        cap: f64,
    },
    Routed {
        task_id: String,
        category: String,
        outcome: RoutingOutcome,
        provider: Option<String>,
        model: Option<String>,
        attempts: usize,
        elapsed_ms: u64,
    },
}

/// Cloneable sender side of the event channel.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<EngineEvent>,
}

impl EventBus {
    pub const DEFAULT_CAPACITY: usize = 256;

    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.tx.subscribe()
    }

    pub fn emit(&self, event: EngineEvent) {
        if self.tx.send(event).is_err() {
            trace!("No event subscribers");
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(Self::DEFAULT_CAPACITY)
    }
}
