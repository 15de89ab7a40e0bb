//! Wires the engine components together from one configuration snapshot and
//! owns their background loops.

use std::sync::Arc;

use conductor_core::ConductorConfig;
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::backend::Backend;
use crate::control::ControlApi;
use crate::cost::CostTracker;
use crate::dispatch::Dispatcher;
use crate::error::SetupError;
use crate::events::{EngineEvent, EventBus};
use crate::health::{HealthMonitor, HealthProbe};
use crate::process::ProcessManager;
use crate::registry::ProviderRegistry;
use crate::routing::{Router, RoutingTable};
use crate::types::Provider;

fn providers_of(config: &ConductorConfig) -> Vec<Provider> {
    config.providers.iter().map(Provider::from).collect()
}

fn table_of(config: &ConductorConfig) -> RoutingTable {
    RoutingTable::new(config.routing.clone(), config.default_latency_budget)
}

pub struct Orchestrator {
    registry: Arc<ProviderRegistry>,
    health: Arc<HealthMonitor>,
    processes: Arc<ProcessManager>,
    costs: Arc<CostTracker>,
    router: Arc<Router>,
    events: EventBus,
    shutdown_tx: broadcast::Sender<()>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Orchestrator {
    /// Validate the snapshot and build every component. Nothing runs until
    /// [`start`](Self::start).
    pub fn from_config(
        config: &ConductorConfig,
        backend: Arc<dyn Backend>,
        probe: Arc<dyn HealthProbe>,
    ) -> Result<Self, SetupError> {
        config.validate()?;
        let log_dir = config
            .process_log_dir()
            .map_err(|e| SetupError::LogDir(e.to_string()))?;

        let events = EventBus::default();
        let registry = Arc::new(ProviderRegistry::with_providers(providers_of(config))?);
        let health = Arc::new(HealthMonitor::new(
            Arc::clone(&registry),
            Arc::clone(&probe),
            config.health.clone(),
            events.clone(),
        ));
        let processes = Arc::new(ProcessManager::new(
            Arc::clone(&registry),
            probe,
            config.process.clone(),
            log_dir,
            events.clone(),
        ));
        let costs = Arc::new(CostTracker::new(
            Arc::clone(&registry),
            &config.cost_management,
            events.clone(),
        ));
        let router = Arc::new(Router::new(
            Arc::clone(&registry),
            Arc::clone(&health),
            Arc::clone(&costs),
            backend,
            table_of(config),
            events.clone(),
        ));
        let (shutdown_tx, _) = broadcast::channel(1);

        info!(
            providers = registry.len(),
            categories = config.routing.len(),
            "Orchestrator configured"
        );
        Ok(Self {
            registry,
            health,
            processes,
            costs,
            router,
            events,
            shutdown_tx,
            tasks: Mutex::new(Vec::new()),
        })
    }

    /// Spawn the health loop and process supervisor, then start every
    /// provider marked `autostart`.
    pub async fn start(&self) {
        {
            let mut tasks = self.tasks.lock();
            tasks.push(Arc::clone(&self.health).spawn(self.shutdown_tx.subscribe()));
            tasks.push(Arc::clone(&self.processes).spawn_supervisor(self.shutdown_tx.subscribe()));
        }
        self.autostart().await;
        info!("Orchestrator started");
    }

    /// Start every enabled managed provider marked `autostart` and probe it
    /// once it is ready. Failures are logged, not fatal. Returns the ids
    /// that came up.
    pub async fn autostart(&self) -> Vec<String> {
        let candidates: Vec<String> = self
            .registry
            .list_enabled()
            .into_iter()
            .filter(|p| p.is_managed() && p.launch.as_ref().is_some_and(|l| l.autostart))
            .map(|p| p.id)
            .collect();
        let mut started = Vec::new();
        for id in candidates {
            match self.processes.start(&id, None).await {
                Ok(handle) => {
                    info!(provider = %id, port = handle.port, "Autostarted provider");
                    // Clear any unreachable verdict left from before the start.
                    if let Ok(provider) = self.registry.get(&id) {
                        self.health.check(&provider).await;
                    }
                    started.push(id);
                }
                Err(e) => warn!(provider = %id, "Autostart failed: {e}"),
            }
        }
        started
    }

    /// Stop background loops and every managed process.
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
        self.processes.stop_all().await;
        let tasks: Vec<_> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            if let Err(e) = task.await {
                warn!("Background task ended abnormally: {e}");
            }
        }
        info!("Orchestrator stopped");
    }

    /// Apply a new configuration snapshot: providers are replaced under the
    /// registry lock and the routing table is swapped atomically. Health and
    /// process tuning keep their startup values.
    pub fn reload(&self, config: &ConductorConfig) -> Result<(), SetupError> {
        config.validate()?;
        self.registry.replace(providers_of(config))?;
        self.router.swap_table(table_of(config));
        self.costs
            .set_alert_threshold(config.cost_management.alert_threshold);
        info!(providers = self.registry.len(), "Configuration reloaded");
        Ok(())
    }

    pub fn dispatcher(&self) -> Dispatcher {
        Dispatcher::new(Arc::clone(&self.router))
    }

    pub fn control(&self) -> ControlApi {
        ControlApi::new(
            Arc::clone(&self.registry),
            Arc::clone(&self.processes),
            Arc::clone(&self.health),
        )
    }

    pub fn events(&self) -> broadcast::Receiver<EngineEvent> {
        self.events.subscribe()
    }

    pub fn registry(&self) -> &Arc<ProviderRegistry> {
        &self.registry
    }

    pub fn costs(&self) -> &Arc<CostTracker> {
        &self.costs
    }

    pub fn health(&self) -> &Arc<HealthMonitor> {
        &self.health
    }

    pub fn processes(&self) -> &Arc<ProcessManager> {
        &self.processes
    }

    pub fn router(&self) -> &Arc<Router> {
        &self.router
    }
}
