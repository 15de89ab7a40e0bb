//! Routing Engine
//!
//! Turns a task into an ordered candidate list and walks it with fallback.
//!
//! Candidate order: the category's primary targets, then its fallback
//! targets. Within each group providers are ranked by static priority, with
//! ties broken by the health monitor's rolling latency (unknown latency
//! last). The ranking is recomputed on every call and frozen for the rest of
//! that call.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use conductor_core::config::{RouteTarget, RoutingRule};
use parking_lot::RwLock;
use tracing::{debug, info, warn};

use crate::backend::{Backend, Completion};
use crate::cost::CostTracker;
use crate::error::{CandidateFailure, FailureReason, RoutingError};
use crate::events::{EngineEvent, EventBus};
use crate::health::HealthMonitor;
use crate::registry::{ProviderRegistry, ProviderSnapshot};
use crate::types::{Candidate, HealthStatus, RoutingDecision, RoutingOutcome, TaskDescriptor};

/// Rule used for categories with no rule of their own.
pub const DEFAULT_CATEGORY: &str = "default";

/// Immutable routing configuration. Reloads swap in a new snapshot.
#[derive(Debug, Clone, PartialEq)]
pub struct RoutingTable {
    pub rules: HashMap<String, RoutingRule>,
    pub default_latency_budget: Duration,
}

impl RoutingTable {
    pub fn new(rules: HashMap<String, RoutingRule>, default_latency_budget: Duration) -> Self {
        Self {
            rules,
            default_latency_budget,
        }
    }

    pub fn rule(&self, category: &str) -> Option<&RoutingRule> {
        self.rules
            .get(category)
            .or_else(|| self.rules.get(DEFAULT_CATEGORY))
    }
}

/// A successful routing call.
#[derive(Debug, Clone, PartialEq)]
pub struct Routed {
    pub decision: RoutingDecision,
    pub completion: Completion,
}

struct Ranked {
    candidate: Candidate,
    priority: u32,
    latency_ms: Option<f64>,
}

pub struct Router {
    registry: Arc<ProviderRegistry>,
    health: Arc<HealthMonitor>,
    costs: Arc<CostTracker>,
    backend: Arc<dyn Backend>,
    events: EventBus,
    table: RwLock<Arc<RoutingTable>>,
}

impl Router {
    pub fn new(
        registry: Arc<ProviderRegistry>,
        health: Arc<HealthMonitor>,
        costs: Arc<CostTracker>,
        backend: Arc<dyn Backend>,
        table: RoutingTable,
        events: EventBus,
    ) -> Self {
        Self {
            registry,
            health,
            costs,
            backend,
            events,
            table: RwLock::new(Arc::new(table)),
        }
    }

    pub fn table(&self) -> Arc<RoutingTable> {
        Arc::clone(&self.table.read())
    }

    /// Atomically replace the routing table. In-flight calls keep the
    /// snapshot they started with.
    pub fn swap_table(&self, table: RoutingTable) {
        *self.table.write() = Arc::new(table);
        info!("Routing table replaced");
    }

    /// Resolve the model a target would serve for this task, if any.
    fn resolve_model(target: &RouteTarget, snap: &ProviderSnapshot, task: &TaskDescriptor) -> Option<String> {
        let provider = &snap.provider;
        match (&task.model_preference, &target.model) {
            (Some(wanted), Some(pinned)) if wanted != pinned => None,
            (Some(wanted), _) => provider.supports(wanted).then(|| wanted.clone()),
            (None, Some(pinned)) => provider.supports(pinned).then(|| pinned.clone()),
            (None, None) => provider.models.first().cloned(),
        }
    }

    fn eligible(&self, snap: &ProviderSnapshot) -> Result<(), &'static str> {
        if !snap.provider.enabled {
            return Err("disabled");
        }
        if snap.health.status == HealthStatus::Unreachable {
            return Err("unreachable");
        }
        if snap.process_running == Some(false) {
            return Err("no running process");
        }
        if self.costs.is_throttled(&snap.provider.id) {
            return Err("budget exhausted");
        }
        Ok(())
    }

    fn rank_group(
        &self,
        targets: &[RouteTarget],
        snaps: &HashMap<String, ProviderSnapshot>,
        task: &TaskDescriptor,
        seen: &mut HashSet<Candidate>,
    ) -> Vec<Candidate> {
        let mut group: Vec<Ranked> = Vec::new();
        for target in targets {
            let Some(snap) = snaps.get(&target.provider) else {
                debug!(provider = %target.provider, "Routing target not registered");
                continue;
            };
            if let Err(why) = self.eligible(snap) {
                debug!(task_id = %task.id, provider = %target.provider, why, "Candidate filtered");
                continue;
            }
            let Some(model) = Self::resolve_model(target, snap, task) else {
                debug!(task_id = %task.id, provider = %target.provider, "No matching model");
                continue;
            };
            let candidate = Candidate {
                provider: target.provider.clone(),
                model,
            };
            if !seen.insert(candidate.clone()) {
                continue;
            }
            group.push(Ranked {
                candidate,
                priority: snap.provider.priority,
                latency_ms: snap.health.avg_latency_ms,
            });
        }

        // Stable: equal keys keep configuration order.
        group.sort_by(|a, b| {
            a.priority.cmp(&b.priority).then_with(|| match (a.latency_ms, b.latency_ms) {
                (Some(x), Some(y)) => x.total_cmp(&y),
                (Some(_), None) => std::cmp::Ordering::Less,
                (None, Some(_)) => std::cmp::Ordering::Greater,
                (None, None) => std::cmp::Ordering::Equal,
            })
        });
        group.into_iter().map(|r| r.candidate).collect()
    }

    fn candidates_in(&self, table: &RoutingTable, task: &TaskDescriptor) -> Vec<Candidate> {
        let Some(rule) = table.rule(&task.category) else {
            return Vec::new();
        };
        let snaps = self
            .registry
            .snapshots(rule.targets().map(|t| t.provider.as_str()));
        let mut seen = HashSet::new();
        let mut candidates = self.rank_group(&rule.primary, &snaps, task, &mut seen);
        candidates.extend(self.rank_group(&rule.fallback, &snaps, task, &mut seen));
        candidates
    }

    /// The ordered, filtered candidate list for a task. Issues no requests.
    pub fn candidates(&self, task: &TaskDescriptor) -> Vec<Candidate> {
        self.candidates_in(&self.table(), task)
    }

    fn publish(&self, task: &TaskDescriptor, decision: &RoutingDecision, attempts: usize) {
        self.events.emit(EngineEvent::Routed {
            task_id: task.id.clone(),
            category: task.category.clone(),
            outcome: decision.outcome,
            provider: decision.used.as_ref().map(|c| c.provider.clone()),
            model: decision.used.as_ref().map(|c| c.model.clone()),
            attempts,
            elapsed_ms: decision.elapsed.as_millis() as u64,
        });
    }

    fn publish_exhausted(
        &self,
        task: &TaskDescriptor,
        candidates: &[Candidate],
        started: Instant,
        attempts: usize,
    ) {
        let decision = RoutingDecision {
            task_id: task.id.clone(),
            candidates: candidates.to_vec(),
            used: None,
            elapsed: started.elapsed(),
            outcome: RoutingOutcome::Exhausted,
        };
        self.publish(task, &decision, attempts);
    }

    /// Try candidates strictly in order until one succeeds.
    pub async fn route(&self, task: &TaskDescriptor) -> Result<Routed, RoutingError> {
        let started = Instant::now();
        let table = self.table();
        let deadline = task.deadline.map(|d| started + d);
        let budget = task.latency_budget.unwrap_or(table.default_latency_budget);
        let candidates = self.candidates_in(&table, task);

        if candidates.is_empty() {
            warn!(task_id = %task.id, category = %task.category, "No eligible provider");
            self.publish_exhausted(task, &candidates, started, 0);
            return Err(RoutingError::NoEligibleProvider {
                category: task.category.clone(),
            });
        }
        debug!(task_id = %task.id, candidates = ?candidates.iter().map(|c| c.to_string()).collect::<Vec<_>>(), "Routing task");

        let mut failures: Vec<CandidateFailure> = Vec::new();
        for (index, candidate) in candidates.iter().enumerate() {
            let mut timeout = budget;
            let mut deadline_bound = false;
            if let Some(deadline) = deadline {
                let remaining = deadline.saturating_duration_since(Instant::now());
                if remaining.is_zero() {
                    warn!(task_id = %task.id, attempts = failures.len(), "Deadline exceeded");
                    self.publish_exhausted(task, &candidates, started, failures.len());
                    return Err(RoutingError::DeadlineExceeded {
                        task_id: task.id.clone(),
                        failures,
                    });
                }
                if remaining < budget {
                    timeout = remaining;
                    deadline_bound = true;
                }
            }

            let reason = match self.registry.get(&candidate.provider) {
                // Removed by a concurrent reload.
                Err(e) => FailureReason::Backend(e.to_string()),
                Ok(provider) => {
                    let result = tokio::time::timeout(
                        timeout,
                        self.backend.execute(&provider, &candidate.model, task),
                    )
                    .await;
                    match result {
                        Ok(Ok(completion)) => {
                            self.health.record_request_success(&provider.id);
                            self.costs.record_usage(&provider.id, completion.tokens_used);
                            let outcome = if index == 0 {
                                RoutingOutcome::Success
                            } else {
                                RoutingOutcome::FallbackUsed
                            };
                            let decision = RoutingDecision {
                                task_id: task.id.clone(),
                                candidates: candidates.clone(),
                                used: Some(candidate.clone()),
                                elapsed: started.elapsed(),
                                outcome,
                            };
                            info!(
                                task_id = %task.id,
                                provider = %candidate.provider,
                                model = %candidate.model,
                                ?outcome,
                                elapsed_ms = decision.elapsed.as_millis() as u64,
                                "Task routed"
                            );
                            self.publish(task, &decision, index + 1);
                            return Ok(Routed {
                                decision,
                                completion,
                            });
                        }
                        Ok(Err(e)) => FailureReason::Backend(e.to_string()),
                        Err(_) if deadline_bound => FailureReason::DeadlineExceeded,
                        Err(_) => FailureReason::Timeout(timeout),
                    }
                }
            };

            warn!(
                task_id = %task.id,
                provider = %candidate.provider,
                model = %candidate.model,
                %reason,
                "Candidate failed"
            );
            self.health.record_failure(&candidate.provider, &reason.to_string());
            failures.push(CandidateFailure {
                provider: candidate.provider.clone(),
                model: candidate.model.clone(),
                reason,
            });
        }

        self.publish_exhausted(task, &candidates, started, failures.len());
        let deadline_hit = failures
            .last()
            .is_some_and(|f| f.reason == FailureReason::DeadlineExceeded);
        if deadline_hit {
            warn!(task_id = %task.id, attempts = failures.len(), "Deadline exceeded");
            Err(RoutingError::DeadlineExceeded {
                task_id: task.id.clone(),
                failures,
            })
        } else {
            warn!(task_id = %task.id, attempts = failures.len(), "All candidates failed");
            Err(RoutingError::AllProvidersFailed {
                task_id: task.id.clone(),
                failures,
            })
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::BackendError;
    use crate::health::HealthProbe;
    use crate::types::{Provider, ProviderKind};
    use async_trait::async_trait;
    use conductor_core::config::{CostConfig, HealthConfig};
    use parking_lot::Mutex;

    struct AlwaysUp;

    #[async_trait]
    impl HealthProbe for AlwaysUp {
        async fn probe(&self, _provider: &Provider) -> Result<(), String> {
            Ok(())
        }
    }

    #[derive(Clone)]
    enum Script {
        Ok(u64),
        Fail,
        Sleep(Duration),
    }

    #[derive(Default)]
    struct ScriptedBackend {
        script: HashMap<String, Script>,
        calls: Mutex<Vec<String>>,
    }

    impl ScriptedBackend {
        fn with(mut self, id: &str, script: Script) -> Self {
            self.script.insert(id.into(), script);
            self
        }
    }

    #[async_trait]
    impl Backend for ScriptedBackend {
        async fn execute(
            &self,
            provider: &crate::types::Provider,
            model: &str,
            _task: &TaskDescriptor,
        ) -> Result<Completion, BackendError> {
            self.calls.lock().push(format!("{}/{model}", provider.id));
            let reply = Completion {
                content: format!("from {}", provider.id),
                tokens_used: 10,
            };
            match self.script.get(&provider.id).cloned().unwrap_or(Script::Ok(10)) {
                Script::Ok(tokens) => Ok(Completion {
                    tokens_used: tokens,
                    ..reply
                }),
                Script::Fail => Err(BackendError::Status {
                    status: 502,
                    body: "bad gateway".into(),
                }),
                Script::Sleep(d) => {
                    tokio::time::sleep(d).await;
                    Ok(reply)
                }
            }
        }
    }

    struct Fixture {
        registry: Arc<ProviderRegistry>,
        health: Arc<HealthMonitor>,
        costs: Arc<CostTracker>,
        backend: Arc<ScriptedBackend>,
        events: EventBus,
        router: Router,
    }

    fn target(provider: &str) -> RouteTarget {
        RouteTarget {
            provider: provider.into(),
            model: None,
        }
    }

    fn rule(primary: &[&str], fallback: &[&str]) -> RoutingRule {
        RoutingRule {
            primary: primary.iter().map(|p| target(p)).collect(),
            fallback: fallback.iter().map(|p| target(p)).collect(),
        }
    }

    fn remote(id: &str, priority: u32, models: &[&str]) -> Provider {
        Provider::new(id, format!("https://{id}.example.com"), ProviderKind::RemoteApi, models)
            .with_priority(priority)
    }

    fn fixture(
        providers: Vec<Provider>,
        rules: Vec<(&str, RoutingRule)>,
        backend: ScriptedBackend,
    ) -> Fixture {
        let registry = Arc::new(ProviderRegistry::with_providers(providers).unwrap());
        let events = EventBus::default();
        let health = Arc::new(HealthMonitor::new(
            Arc::clone(&registry),
            Arc::new(AlwaysUp),
            HealthConfig {
                failure_threshold: 2,
                ..HealthConfig::default()
            },
            events.clone(),
        ));
        let costs = Arc::new(CostTracker::new(
            Arc::clone(&registry),
            &CostConfig::default(),
            events.clone(),
        ));
        let backend = Arc::new(backend);
        let table = RoutingTable::new(
            rules.into_iter().map(|(c, r)| (c.to_string(), r)).collect(),
            Duration::from_secs(5),
        );
        let router = Router::new(
            Arc::clone(&registry),
            Arc::clone(&health),
            Arc::clone(&costs),
            backend.clone(),
            table,
            events.clone(),
        );
        Fixture {
            registry,
            health,
            costs,
            backend,
            events,
            router,
        }
    }

    fn ids(candidates: &[Candidate]) -> Vec<String> {
        candidates.iter().map(|c| c.to_string()).collect()
    }

    #[test]
    fn primary_before_fallback_then_priority() {
        let f = fixture(
            vec![remote("a", 3, &["m"]), remote("b", 1, &["m"]), remote("c", 0, &["m"])],
            vec![("code", rule(&["a", "b"], &["c"]))],
            ScriptedBackend::default(),
        );
        let task = TaskDescriptor::new("code", "x");
        assert_eq!(ids(&f.router.candidates(&task)), ["b/m", "a/m", "c/m"]);
    }

    #[test]
    fn equal_priority_prefers_lower_latency() {
        let f = fixture(
            vec![remote("slow", 1, &["m"]), remote("fast", 1, &["m"]), remote("new", 1, &["m"])],
            vec![("code", rule(&["new", "slow", "fast"], &[]))],
            ScriptedBackend::default(),
        );
        f.health.record_success("slow", Duration::from_millis(400));
        f.health.record_success("fast", Duration::from_millis(20));
        let task = TaskDescriptor::new("code", "x");
        assert_eq!(ids(&f.router.candidates(&task)), ["fast/m", "slow/m", "new/m"]);

        // Recomputed on the next call.
        for _ in 0..10 {
            f.health.record_success("slow", Duration::from_millis(1));
        }
        assert_eq!(ids(&f.router.candidates(&task)), ["slow/m", "fast/m", "new/m"]);
    }

    #[test]
    fn ineligible_providers_are_filtered() {
        let f = fixture(
            vec![
                remote("off", 1, &["m"]).disabled(),
                remote("down", 1, &["m"]),
                remote("broke", 1, &["m"]).with_daily_budget(1.0),
                remote("other-model", 1, &["x"]),
                remote("ok", 9, &["m"]),
            ],
            vec![("code", rule(&["off", "down", "broke", "other-model", "ok"], &[]))],
            ScriptedBackend::default(),
        );
        f.health.record_failure("down", "refused");
        f.health.record_failure("down", "refused");
        f.costs.record_spend("broke", 1.0);

        let task = TaskDescriptor::new("code", "x").with_model("m");
        assert_eq!(ids(&f.router.candidates(&task)), ["ok/m"]);
    }

    #[test]
    fn degraded_provider_stays_eligible() {
        let f = fixture(
            vec![remote("a", 1, &["m"])],
            vec![("code", rule(&["a"], &[]))],
            ScriptedBackend::default(),
        );
        f.health.record_failure("a", "blip");
        assert_eq!(f.registry.health("a").unwrap().status, HealthStatus::Degraded);
        assert_eq!(f.router.candidates(&TaskDescriptor::new("code", "x")).len(), 1);
    }

    #[test]
    fn pinned_models_and_preferences() {
        let mut pinned = rule(&[], &["b"]);
        pinned.primary.push(RouteTarget {
            provider: "a".into(),
            model: Some("big".into()),
        });
        let f = fixture(
            vec![remote("a", 1, &["small", "big"]), remote("b", 2, &["small"])],
            vec![("code", pinned)],
            ScriptedBackend::default(),
        );

        let any = TaskDescriptor::new("code", "x");
        assert_eq!(ids(&f.router.candidates(&any)), ["a/big", "b/small"]);

        let small = TaskDescriptor::new("code", "x").with_model("small");
        assert_eq!(ids(&f.router.candidates(&small)), ["b/small"]);
    }

    #[test]
    fn duplicate_targets_are_tried_once() {
        let f = fixture(
            vec![remote("a", 1, &["m"])],
            vec![("code", rule(&["a", "a"], &["a"]))],
            ScriptedBackend::default(),
        );
        assert_eq!(ids(&f.router.candidates(&TaskDescriptor::new("code", "x"))), ["a/m"]);
    }

    #[test]
    fn unknown_category_uses_default_rule() {
        let f = fixture(
            vec![remote("a", 1, &["m"])],
            vec![(DEFAULT_CATEGORY, rule(&["a"], &[]))],
            ScriptedBackend::default(),
        );
        assert_eq!(ids(&f.router.candidates(&TaskDescriptor::new("poetry", "x"))), ["a/m"]);
    }

    #[tokio::test]
    async fn first_candidate_success() {
        let f = fixture(
            vec![remote("a", 1, &["m"]).with_cost_per_token(0.01)],
            vec![("code", rule(&["a"], &[]))],
            ScriptedBackend::default().with("a", Script::Ok(200)),
        );
        let routed = f.router.route(&TaskDescriptor::new("code", "x")).await.unwrap();
        assert_eq!(routed.decision.outcome, RoutingOutcome::Success);
        assert_eq!(routed.completion.content, "from a");
        assert!((f.costs.ledger("a").unwrap().day_spend - 2.0).abs() < 1e-9);
        assert_eq!(f.registry.health("a").unwrap().status, HealthStatus::Healthy);
    }

    #[tokio::test]
    async fn served_request_keeps_probe_latency() {
        let f = fixture(
            vec![remote("a", 1, &["m"])],
            vec![("code", rule(&["a"], &[]))],
            ScriptedBackend::default().with("a", Script::Sleep(Duration::from_millis(300))),
        );
        f.health.record_success("a", Duration::from_millis(20));
        f.health.record_failure("a", "connection reset");

        f.router.route(&TaskDescriptor::new("code", "x")).await.unwrap();
        let health = f.registry.health("a").unwrap();
        assert_eq!(health.status, HealthStatus::Healthy);
        assert_eq!(health.consecutive_failures, 0);
        assert_eq!(health.avg_latency_ms, Some(20.0));
    }

    #[tokio::test]
    async fn error_falls_back_and_feeds_health() {
        let f = fixture(
            vec![remote("a", 1, &["m"]), remote("b", 2, &["m"])],
            vec![("code", rule(&["a"], &["b"]))],
            ScriptedBackend::default().with("a", Script::Fail),
        );
        let mut rx = f.events.subscribe();
        let routed = f.router.route(&TaskDescriptor::new("code", "x")).await.unwrap();
        assert_eq!(routed.decision.outcome, RoutingOutcome::FallbackUsed);
        assert_eq!(routed.decision.used.unwrap().provider, "b");
        assert_eq!(f.registry.health("a").unwrap().consecutive_failures, 1);

        let mut routed_events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            if let EngineEvent::Routed { attempts, outcome, .. } = event {
                routed_events.push((attempts, outcome));
            }
        }
        assert_eq!(routed_events, [(2, RoutingOutcome::FallbackUsed)]);
    }

    #[tokio::test]
    async fn all_failures_are_reported_in_order() {
        let f = fixture(
            vec![remote("a", 1, &["m"]), remote("b", 2, &["m"])],
            vec![("code", rule(&["a", "b"], &[]))],
            ScriptedBackend::default()
                .with("a", Script::Fail)
                .with("b", Script::Sleep(Duration::from_secs(5))),
        );
        let task = TaskDescriptor::new("code", "x").with_latency_budget(Duration::from_millis(50));
        let err = f.router.route(&task).await.unwrap_err();
        let RoutingError::AllProvidersFailed { failures, .. } = err.clone() else {
            panic!("unexpected error: {err:?}");
        };
        assert_eq!(failures.len(), 2);
        assert_eq!(failures[0].provider, "a");
        assert!(matches!(failures[0].reason, FailureReason::Backend(_)));
        assert_eq!(failures[1].provider, "b");
        assert_eq!(failures[1].reason, FailureReason::Timeout(Duration::from_millis(50)));
    }

    #[tokio::test]
    async fn deadline_abandons_attempt_and_stops() {
        let f = fixture(
            vec![remote("a", 1, &["m"]), remote("b", 2, &["m"])],
            vec![("code", rule(&["a", "b"], &[]))],
            ScriptedBackend::default().with("a", Script::Sleep(Duration::from_secs(5))),
        );
        let task = TaskDescriptor::new("code", "x").with_deadline(Duration::from_millis(80));
        let started = Instant::now();
        let err = f.router.route(&task).await.unwrap_err();
        assert!(started.elapsed() < Duration::from_secs(2));

        let RoutingError::DeadlineExceeded { failures, .. } = err.clone() else {
            panic!("unexpected error: {err:?}");
        };
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].reason, FailureReason::DeadlineExceeded);
        assert_eq!(*f.backend.calls.lock(), ["a/m"]);
    }

    #[tokio::test]
    async fn no_candidates_issues_no_requests() {
        let f = fixture(
            vec![remote("a", 1, &["m"]).disabled()],
            vec![("code", rule(&["a"], &[]))],
            ScriptedBackend::default(),
        );
        let err = f.router.route(&TaskDescriptor::new("code", "x")).await.unwrap_err();
        assert_eq!(
            err,
            RoutingError::NoEligibleProvider {
                category: "code".into()
            }
        );
        assert!(f.backend.calls.lock().is_empty());
    }

    #[tokio::test]
    async fn swapped_table_applies_to_new_calls() {
        let f = fixture(
            vec![remote("a", 1, &["m"]), remote("b", 1, &["m"])],
            vec![("code", rule(&["a"], &[]))],
            ScriptedBackend::default(),
        );
        f.router.swap_table(RoutingTable::new(
            [("code".to_string(), rule(&["b"], &[]))].into_iter().collect(),
            Duration::from_secs(1),
        ));
        let routed = f.router.route(&TaskDescriptor::new("code", "x")).await.unwrap();
        assert_eq!(routed.decision.used.unwrap().provider, "b");
        assert_eq!(f.router.table().default_latency_budget, Duration::from_secs(1));
    }

    #[tokio::test]
    async fn concurrent_routes_do_not_serialize() {
        let f = fixture(
            vec![remote("a", 1, &["m"])],
            vec![("code", rule(&["a"], &[]))],
            ScriptedBackend::default().with("a", Script::Sleep(Duration::from_millis(200))),
        );
        let t1 = TaskDescriptor::new("code", "x");
        let t2 = TaskDescriptor::new("code", "y");
        let started = Instant::now();
        let (r1, r2) = tokio::join!(f.router.route(&t1), f.router.route(&t2));
        assert!(r1.is_ok() && r2.is_ok());
        assert!(started.elapsed() < Duration::from_millis(380));
    }
}
