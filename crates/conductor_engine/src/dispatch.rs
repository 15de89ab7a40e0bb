//! Task submission entry point. Validates and delegates to the router.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tracing::debug;

use crate::error::DispatchError;
use crate::routing::Router;
use crate::types::{RoutingDecision, RoutingOutcome, TaskDescriptor};

/// What a caller gets back for a served task.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TaskResult {
    /// Always `"success"`; failures come back as `DispatchError`.
    pub status: &'static str,
    pub provider_used: String,
    pub model_used: String,
    pub latency_ms: u64,
    pub outcome: RoutingOutcome,
    pub content: String,
    pub tokens_used: u64,
    #[serde(skip)]
    pub decision: RoutingDecision,
}

#[derive(Clone)]
pub struct Dispatcher {
    router: Arc<Router>,
}

fn validate(task: &TaskDescriptor) -> Result<(), DispatchError> {
    let invalid = |msg: &str| Err(DispatchError::InvalidTask(msg.to_string()));
    if task.id.trim().is_empty() {
        return invalid("id must not be empty");
    }
    if task.category.trim().is_empty() {
        return invalid("category must not be empty");
    }
    if task.prompt.trim().is_empty() {
        return invalid("prompt must not be empty");
    }
    if task.model_preference.as_deref().is_some_and(|m| m.trim().is_empty()) {
        return invalid("model preference must not be blank");
    }
    if task.latency_budget == Some(Duration::ZERO) {
        return invalid("latency budget must be positive");
    }
    if task.deadline == Some(Duration::ZERO) {
        return invalid("deadline must be positive");
    }
    Ok(())
}

impl Dispatcher {
    pub fn new(router: Arc<Router>) -> Self {
        Self { router }
    }

    pub async fn submit(&self, task: TaskDescriptor) -> Result<TaskResult, DispatchError> {
        validate(&task)?;
        debug!(task_id = %task.id, category = %task.category, "Task submitted");

        let routed = self.router.route(&task).await?;
        let decision = routed.decision;
        // `route` only returns Ok with a candidate in hand.
        let (provider_used, model_used) = decision
            .used
            .as_ref()
            .map(|c| (c.provider.clone(), c.model.clone()))
            .unwrap_or_default();

        Ok(TaskResult {
            status: "success",
            provider_used,
            model_used,
            latency_ms: decision.elapsed.as_millis() as u64,
            outcome: decision.outcome,
            content: routed.completion.content,
            tokens_used: routed.completion.tokens_used,
            decision,
        })
    }
}
