//! Health Monitor
//!
//! Probes every enabled provider on a fixed interval and folds the results
//! into the registry with hysteresis: a provider turns `unreachable` only
//! after `failure_threshold` consecutive failures, and one success brings it
//! back to `healthy`. Request failures observed by the router feed the same
//! counter.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use conductor_core::config::HealthConfig;
use futures::future::join_all;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::events::{EngineEvent, EventBus};
use crate::registry::ProviderRegistry;
use crate::types::{HealthStatus, Provider, ProviderHealth};

/// Weight of the newest sample in the rolling latency average.
const LATENCY_ALPHA: f64 = 0.3;

// ---------------------------------------------------------------------------
// Probe trait
// ---------------------------------------------------------------------------

/// A lightweight liveness check. Also used as the readiness check for newly
/// started local processes.
#[async_trait]
pub trait HealthProbe: Send + Sync {
    async fn probe(&self, provider: &Provider) -> Result<(), String>;
}

/// `GET {endpoint}{health_path}`; any 2xx counts as alive.
pub struct HttpHealthProbe {
    client: reqwest::Client,
}

impl HttpHealthProbe {
    pub fn new(timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self { client }
    }
}

#[async_trait]
impl HealthProbe for HttpHealthProbe {
    async fn probe(&self, provider: &Provider) -> Result<(), String> {
        let url = provider.health_url();
        match self.client.get(&url).send().await {
            Ok(resp) if resp.status().is_success() => Ok(()),
            Ok(resp) => Err(format!("{url} returned {}", resp.status())),
            Err(e) => Err(format!("{url}: {e}")),
        }
    }
}

// ---------------------------------------------------------------------------
// Status transitions
// ---------------------------------------------------------------------------

impl ProviderHealth {
    /// Apply a successful observation. Only probe round trips carry a
    /// latency sample. Returns the previous status.
    fn observe_success(&mut self, latency: Option<Duration>) -> HealthStatus {
        if let Some(latency) = latency {
            let sample = latency.as_secs_f64() * 1000.0;
            self.avg_latency_ms = Some(match self.avg_latency_ms {
                Some(avg) => avg + LATENCY_ALPHA * (sample - avg),
                None => sample,
            });
        }
        self.consecutive_failures = 0;
        self.last_success = Some(Utc::now());
        std::mem::replace(&mut self.status, HealthStatus::Healthy)
    }

    /// Apply a failed observation. Returns the previous status.
    fn observe_failure(&mut self, threshold: u32) -> HealthStatus {
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        let next = if self.consecutive_failures >= threshold {
            HealthStatus::Unreachable
        } else {
            HealthStatus::Degraded
        };
        std::mem::replace(&mut self.status, next)
    }
}

// ---------------------------------------------------------------------------
// HealthMonitor
// ---------------------------------------------------------------------------

pub struct HealthMonitor {
    registry: Arc<ProviderRegistry>,
    probe: Arc<dyn HealthProbe>,
    config: HealthConfig,
    events: EventBus,
}

impl HealthMonitor {
    pub fn new(
        registry: Arc<ProviderRegistry>,
        probe: Arc<dyn HealthProbe>,
        config: HealthConfig,
        events: EventBus,
    ) -> Self {
        Self {
            registry,
            probe,
            config,
            events,
        }
    }

    pub fn config(&self) -> &HealthConfig {
        &self.config
    }

    /// Record a successful probe and its round-trip latency.
    pub fn record_success(&self, provider_id: &str, latency: Duration) {
        self.apply_success(provider_id, Some(latency));
    }

    /// Record a request the provider served. Clears the failure streak but
    /// leaves the probe latency average alone.
    pub fn record_request_success(&self, provider_id: &str) {
        self.apply_success(provider_id, None);
    }

    fn apply_success(&self, provider_id: &str, latency: Option<Duration>) {
        match self
            .registry
            .update_health(provider_id, |h| (h.observe_success(latency), h.status))
        {
            Ok((from, to)) => self.announce(provider_id, from, to),
            Err(e) => debug!(provider = provider_id, "Ignoring health success: {e}"),
        }
    }

    /// Record a failed probe or request.
    pub fn record_failure(&self, provider_id: &str, reason: &str) {
        let threshold = self.config.failure_threshold;
        match self
            .registry
            .update_health(provider_id, |h| {
                (h.observe_failure(threshold), h.status, h.consecutive_failures)
            }) {
            Ok((from, to, failures)) => {
                debug!(provider = provider_id, failures, reason, "Health failure recorded");
                self.announce(provider_id, from, to);
            }
            Err(e) => debug!(provider = provider_id, "Ignoring health failure: {e}"),
        }
    }

    fn announce(&self, provider: &str, from: HealthStatus, to: HealthStatus) {
        if from == to {
            return;
        }
        match to {
            HealthStatus::Healthy => info!(provider, %from, "Provider healthy"),
            _ => warn!(provider, %from, %to, "Provider health changed"),
        }
        self.events.emit(EngineEvent::HealthChanged {
            provider: provider.to_string(),
            from,
            to,
        });
    }

    /// Probe one provider with the configured timeout and record the result.
    pub async fn check(&self, provider: &Provider) -> HealthStatus {
        let started = Instant::now();
        let result = tokio::time::timeout(self.config.probe_timeout, self.probe.probe(provider))
            .await
            .unwrap_or_else(|_| {
                Err(format!(
                    "probe timed out after {}ms",
                    self.config.probe_timeout.as_millis()
                ))
            });

        match result {
            Ok(()) => self.record_success(&provider.id, started.elapsed()),
            Err(reason) => self.record_failure(&provider.id, &reason),
        }
        self.registry
            .health(&provider.id)
            .map(|h| h.status)
            .unwrap_or(HealthStatus::Unknown)
    }

    /// Probe every enabled provider concurrently. A slow provider only
    /// delays its own result.
    pub async fn run_cycle(&self) {
        let providers = self.registry.list_enabled();
        let checks = providers.iter().map(|p| self.check(p));
        let statuses = join_all(checks).await;
        let healthy = statuses
            .iter()
            .filter(|s| **s == HealthStatus::Healthy)
            .count();
        debug!(probed = statuses.len(), healthy, "Health cycle complete");
    }

    /// Run probe cycles on the configured interval until shutdown.
    pub fn spawn(self: Arc<Self>, mut shutdown: broadcast::Receiver<()>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.config.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => self.run_cycle().await,
                    _ = shutdown.recv() => {
                        debug!("Health monitor shutting down");
                        break;
                    }
                }
            }
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ProviderKind;
    use parking_lot::Mutex;
    use std::collections::{HashMap, VecDeque};

    /// Replays a scripted sequence of results per provider, then succeeds.
    #[derive(Default)]
    struct ScriptedProbe {
        script: Mutex<HashMap<String, VecDeque<Result<(), String>>>>,
        delay: HashMap<String, Duration>,
    }

    impl ScriptedProbe {
        fn push(&self, id: &str, results: &[bool]) {
            let mut script = self.script.lock();
            let queue = script.entry(id.to_string()).or_default();
            for ok in results {
                queue.push_back(if *ok { Ok(()) } else { Err("down".into()) });
            }
        }
    }

    #[async_trait]
    impl HealthProbe for ScriptedProbe {
        async fn probe(&self, provider: &Provider) -> Result<(), String> {
            if let Some(delay) = self.delay.get(&provider.id) {
                tokio::time::sleep(*delay).await;
            }
            self.script
                .lock()
                .get_mut(&provider.id)
                .and_then(|q| q.pop_front())
                .unwrap_or(Ok(()))
        }
    }

    fn setup(
        ids: &[&str],
        probe: Arc<ScriptedProbe>,
        threshold: u32,
    ) -> (Arc<ProviderRegistry>, HealthMonitor, EventBus) {
        let providers = ids
            .iter()
            .map(|id| Provider::new(*id, "http://x", ProviderKind::RemoteApi, &["m"]))
            .collect();
        let registry = Arc::new(ProviderRegistry::with_providers(providers).unwrap());
        let events = EventBus::default();
        let config = HealthConfig {
            interval: Duration::from_millis(20),
            probe_timeout: Duration::from_millis(100),
            failure_threshold: threshold,
        };
        let monitor = HealthMonitor::new(Arc::clone(&registry), probe, config, events.clone());
        (registry, monitor, events)
    }

    #[tokio::test]
    async fn unreachable_after_exactly_threshold_failures() {
        let probe = Arc::new(ScriptedProbe::default());
        probe.push("a", &[false, false, false]);
        let (registry, monitor, _) = setup(&["a"], Arc::clone(&probe), 3);
        let provider = registry.get("a").unwrap();

        assert_eq!(monitor.check(&provider).await, HealthStatus::Degraded);
        assert_eq!(monitor.check(&provider).await, HealthStatus::Degraded);
        assert_eq!(monitor.check(&provider).await, HealthStatus::Unreachable);
        assert_eq!(registry.health("a").unwrap().consecutive_failures, 3);
    }

    #[tokio::test]
    async fn one_success_restores_healthy() {
        let probe = Arc::new(ScriptedProbe::default());
        probe.push("a", &[false, false, false, false, true]);
        let (registry, monitor, _) = setup(&["a"], Arc::clone(&probe), 2);
        let provider = registry.get("a").unwrap();

        for _ in 0..4 {
            monitor.check(&provider).await;
        }
        assert_eq!(registry.health("a").unwrap().status, HealthStatus::Unreachable);

        assert_eq!(monitor.check(&provider).await, HealthStatus::Healthy);
        let health = registry.health("a").unwrap();
        assert_eq!(health.consecutive_failures, 0);
        assert!(health.last_success.is_some());
        assert!(health.avg_latency_ms.is_some());
    }

    #[tokio::test]
    async fn request_success_leaves_latency_untouched() {
        let probe = Arc::new(ScriptedProbe::default());
        probe.push("a", &[true, false]);
        let (registry, monitor, _) = setup(&["a"], Arc::clone(&probe), 3);
        let provider = registry.get("a").unwrap();

        monitor.check(&provider).await;
        let before = registry.health("a").unwrap().avg_latency_ms;
        assert_eq!(monitor.check(&provider).await, HealthStatus::Degraded);

        monitor.record_request_success("a");
        let health = registry.health("a").unwrap();
        assert_eq!(health.status, HealthStatus::Healthy);
        assert_eq!(health.consecutive_failures, 0);
        assert_eq!(health.avg_latency_ms, before);
    }

    #[tokio::test]
    async fn interrupted_failure_streak_resets_count() {
        let probe = Arc::new(ScriptedProbe::default());
        probe.push("a", &[false, false, true, false, false]);
        let (registry, monitor, _) = setup(&["a"], Arc::clone(&probe), 3);
        let provider = registry.get("a").unwrap();

        let mut seen = Vec::new();
        for _ in 0..5 {
            seen.push(monitor.check(&provider).await);
        }
        assert!(!seen.contains(&HealthStatus::Unreachable));
        assert_eq!(registry.health("a").unwrap().consecutive_failures, 2);
    }

    #[tokio::test]
    async fn probe_timeout_counts_as_failure() {
        let mut probe = ScriptedProbe::default();
        probe.delay.insert("slow".into(), Duration::from_secs(5));
        let (registry, monitor, _) = setup(&["slow"], Arc::new(probe), 1);
        let provider = registry.get("slow").unwrap();

        assert_eq!(monitor.check(&provider).await, HealthStatus::Unreachable);
    }

    #[tokio::test]
    async fn slow_provider_does_not_block_others() {
        let mut probe = ScriptedProbe::default();
        probe.delay.insert("slow".into(), Duration::from_secs(5));
        let (registry, monitor, _) = setup(&["slow", "fast"], Arc::new(probe), 1);

        let started = Instant::now();
        monitor.run_cycle().await;
        // Bounded by one probe timeout, not the slow provider's delay.
        assert!(started.elapsed() < Duration::from_secs(2));
        assert_eq!(registry.health("fast").unwrap().status, HealthStatus::Healthy);
        assert_eq!(registry.health("slow").unwrap().status, HealthStatus::Unreachable);
    }

    #[tokio::test]
    async fn transitions_emit_events_once() {
        let probe = Arc::new(ScriptedProbe::default());
        probe.push("a", &[true, true, false]);
        let (registry, monitor, events) = setup(&["a"], Arc::clone(&probe), 3);
        let mut rx = events.subscribe();
        let provider = registry.get("a").unwrap();

        for _ in 0..3 {
            monitor.check(&provider).await;
        }

        let first = rx.try_recv().unwrap();
        assert_eq!(
            first,
            EngineEvent::HealthChanged {
                provider: "a".into(),
                from: HealthStatus::Unknown,
                to: HealthStatus::Healthy,
            }
        );
        let second = rx.try_recv().unwrap();
        assert!(matches!(second, EngineEvent::HealthChanged { to: HealthStatus::Degraded, .. }));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn latency_average_is_weighted() {
        let mut health = ProviderHealth::default();
        health.observe_success(Some(Duration::from_millis(100)));
        assert_eq!(health.avg_latency_ms, Some(100.0));
        health.observe_success(Some(Duration::from_millis(200)));
        let avg = health.avg_latency_ms.unwrap();
        assert!((avg - 130.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn disabled_providers_are_not_probed() {
        let probe = Arc::new(ScriptedProbe::default());
        let (registry, monitor, _) = setup(&["a", "b"], Arc::clone(&probe), 3);
        registry.set_enabled("b", false).unwrap();

        monitor.run_cycle().await;
        assert_eq!(registry.health("a").unwrap().status, HealthStatus::Healthy);
        assert_eq!(registry.health("b").unwrap().status, HealthStatus::Unknown);
    }

    #[tokio::test]
    async fn background_loop_stops_on_shutdown() {
        let probe = Arc::new(ScriptedProbe::default());
        let (registry, monitor, _) = setup(&["a"], probe, 3);
        let (tx, rx) = broadcast::channel(1);
        let handle = Arc::new(monitor).spawn(rx);

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(registry.health("a").unwrap().status, HealthStatus::Healthy);

        tx.send(()).unwrap();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("monitor did not stop")
            .unwrap();
    }
}
