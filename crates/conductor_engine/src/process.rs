//! Process Lifecycle Manager
//!
//! Owns the locally spawned inference servers, one slot per provider:
//!
//! ```text
//! stopped -> starting -> running -> stopping -> stopped
//!               |           |
//!               +-> crashed <+
//! ```
//!
//! The slot table sits behind a `parking_lot::Mutex` that is never held
//! across an await. Port reservation happens under that lock, so two
//! concurrent starts on the same port serialize and the loser gets
//! `PortInUse`.

use std::collections::HashMap;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use conductor_core::config::{LaunchConfig, ProcessConfig};
#[cfg(unix)]
use nix::{
    errno::Errno,
    sys::signal::{Signal, killpg},
    unistd::Pid,
};
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::process::{Child, Command};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::ProcessError;
use crate::events::{EngineEvent, EventBus};
use crate::health::HealthProbe;
use crate::registry::ProviderRegistry;
use crate::types::{ProcessHandle, ProcessState, Provider};

/// Lines returned by `provider_log` when the caller asks for a tail.
pub const LOG_TAIL_LINES: usize = 200;

/// Bytes read per step when scanning a log backwards for its tail.
const LOG_READ_CHUNK: u64 = 64 * 1024;

struct Slot {
    handle: ProcessHandle,
    child: Option<Child>,
    /// Bumped by every start and stop so an in-flight start can tell it has
    /// been superseded.
    generation: u64,
}

pub struct ProcessManager {
    registry: Arc<ProviderRegistry>,
    probe: Arc<dyn HealthProbe>,
    config: ProcessConfig,
    log_dir: PathBuf,
    events: EventBus,
    slots: Mutex<HashMap<String, Slot>>,
}

fn expand_args(args: &[String], model: &str, port: u16) -> Vec<String> {
    args.iter()
        .map(|a| {
            a.replace("{model}", model)
                .replace("{port}", &port.to_string())
        })
        .collect()
}

impl ProcessManager {
    pub fn new(
        registry: Arc<ProviderRegistry>,
        probe: Arc<dyn HealthProbe>,
        config: ProcessConfig,
        log_dir: PathBuf,
        events: EventBus,
    ) -> Self {
        Self {
            registry,
            probe,
            config,
            log_dir,
            events,
            slots: Mutex::new(HashMap::new()),
        }
    }

    pub fn log_path(&self, provider_id: &str) -> PathBuf {
        self.log_dir.join(format!("{provider_id}.log"))
    }

    pub fn handle(&self, provider_id: &str) -> Option<ProcessHandle> {
        self.slots.lock().get(provider_id).map(|s| s.handle.clone())
    }

    pub fn handles(&self) -> Vec<ProcessHandle> {
        let mut handles: Vec<_> = self.slots.lock().values().map(|s| s.handle.clone()).collect();
        handles.sort_by(|a, b| a.provider_id.cmp(&b.provider_id));
        handles
    }

    /// Record a state change: log it, mirror availability into the registry
    /// and publish an event. Called with the slot lock held.
    fn transition(&self, slot: &mut Slot, to: ProcessState) {
        let from = std::mem::replace(&mut slot.handle.state, to);
        if from == to {
            return;
        }
        let provider = slot.handle.provider_id.clone();
        match to {
            ProcessState::Crashed => warn!(provider = %provider, %from, "Process crashed"),
            _ => info!(provider = %provider, %from, %to, port = slot.handle.port, "Process state changed"),
        }
        self.registry
            .set_process_running(&provider, to == ProcessState::Running);
        self.events.emit(EngineEvent::ProcessStateChanged { provider, from, to });
    }

    /// Mark a slot crashed if it still belongs to `generation`.
    fn crash(&self, provider_id: &str, generation: u64) -> Option<Child> {
        let mut slots = self.slots.lock();
        let slot = slots.get_mut(provider_id)?;
        if slot.generation != generation {
            return None;
        }
        slot.handle.pid = None;
        self.transition(slot, ProcessState::Crashed);
        slot.child.take()
    }

    fn managed_provider(&self, provider_id: &str) -> Result<(Provider, LaunchConfig), ProcessError> {
        let provider = self.registry.get(provider_id)?;
        match (&provider.launch, provider.is_managed()) {
            (Some(launch), true) => {
                let launch = launch.clone();
                Ok((provider, launch))
            }
            _ => Err(ProcessError::NotManaged(provider_id.to_string())),
        }
    }

    /// Reserve the port, spawn the server and wait for it to pass readiness.
    ///
    /// `model` defaults to the provider's first listed model.
    pub async fn start(
        &self,
        provider_id: &str,
        model: Option<&str>,
    ) -> Result<ProcessHandle, ProcessError> {
        let (provider, launch) = self.managed_provider(provider_id)?;
        let model = model
            .map(str::to_string)
            .or_else(|| provider.models.first().cloned())
            .unwrap_or_default();
        let log_path = self.log_path(provider_id);

        // Reserve the slot.
        let generation = {
            let mut slots = self.slots.lock();
            if let Some(holder) = slots
                .values()
                .find(|s| s.handle.port == launch.port && s.handle.state.occupies_port())
            {
                return Err(ProcessError::PortInUse {
                    port: launch.port,
                    holder: holder.handle.provider_id.clone(),
                });
            }
            let slot = slots.entry(provider_id.to_string()).or_insert_with(|| Slot {
                handle: ProcessHandle {
                    provider_id: provider_id.to_string(),
                    model: model.clone(),
                    state: ProcessState::Stopped,
                    port: launch.port,
                    pid: None,
                    started_at: None,
                    log_path: log_path.clone(),
                },
                child: None,
                generation: 0,
            });
            slot.generation += 1;
            slot.child = None;
            slot.handle.model = model.clone();
            slot.handle.port = launch.port;
            slot.handle.pid = None;
            slot.handle.started_at = Some(Utc::now());
            slot.handle.log_path = log_path.clone();
            self.transition(slot, ProcessState::Starting);
            slot.generation
        };

        let guard = StartGuard {
            manager: self,
            provider_id,
            generation,
            armed: true,
        };
        let result = self
            .launch(&provider, &launch, &model, &log_path, generation)
            .await;
        guard.disarm();
        result
    }

    /// Spawn the reserved slot's process and wait for readiness.
    async fn launch(
        &self,
        provider: &Provider,
        launch: &LaunchConfig,
        model: &str,
        log_path: &Path,
        generation: u64,
    ) -> Result<ProcessHandle, ProcessError> {
        let provider_id = provider.id.as_str();
        let child = match self.spawn_child(launch, model, log_path).await {
            Ok(child) => child,
            Err(source) => {
                self.crash(provider_id, generation);
                return Err(ProcessError::Spawn {
                    provider: provider_id.to_string(),
                    source,
                });
            }
        };
        let pid = child.id();
        info!(provider = provider_id, model, port = launch.port, pid = ?pid, "Process spawned");

        // A stop may have claimed the slot while we were spawning.
        let superseded = {
            let mut slots = self.slots.lock();
            match slots.get_mut(provider_id) {
                Some(slot)
                    if slot.generation == generation
                        && slot.handle.state == ProcessState::Starting =>
                {
                    slot.child = Some(child);
                    slot.handle.pid = pid;
                    None
                }
                _ => Some(child),
            }
        };
        if let Some(child) = superseded {
            terminate(provider_id, child, Duration::ZERO).await.ok();
            return Err(ProcessError::StartAborted(provider_id.to_string()));
        }

        self.await_ready(provider, generation).await
    }

    async fn spawn_child(
        &self,
        launch: &LaunchConfig,
        model: &str,
        log_path: &Path,
    ) -> std::io::Result<Child> {
        tokio::fs::create_dir_all(&self.log_dir).await?;
        let stdout = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(log_path)
            .await?
            .into_std()
            .await;
        let stderr = stdout.try_clone()?;

        let args = expand_args(&launch.args, model, launch.port);
        debug!(command = %launch.command, ?args, "Spawning inference server");

        let mut cmd = Command::new(&launch.command);
        cmd.args(&args)
            .envs(&launch.env)
            .stdin(Stdio::null())
            .stdout(Stdio::from(stdout))
            .stderr(Stdio::from(stderr))
            .kill_on_drop(true);

        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt as _;
            cmd.process_group(0);
        }

        cmd.spawn()
    }

    /// Poll readiness with exponential backoff. Each check is cut off after
    /// `readiness_probe_timeout`. The process exiting or the attempt bound
    /// running out both end in `crashed`.
    async fn await_ready(
        &self,
        provider: &Provider,
        generation: u64,
    ) -> Result<ProcessHandle, ProcessError> {
        let id = provider.id.as_str();
        let mut backoff = self.config.readiness_initial_backoff;

        for attempt in 1..=self.config.readiness_attempts {
            {
                let mut slots = self.slots.lock();
                let Some(slot) = slots
                    .get_mut(id)
                    .filter(|s| s.generation == generation && s.handle.state == ProcessState::Starting)
                else {
                    return Err(ProcessError::StartAborted(id.to_string()));
                };
                let exited = match slot.child.as_mut().map(|c| c.try_wait()) {
                    Some(Ok(Some(status))) => Some(status.code()),
                    Some(Ok(None)) => None,
                    Some(Err(e)) => {
                        warn!(provider = id, "Could not poll process: {e}");
                        None
                    }
                    None => Some(None),
                };
                if let Some(code) = exited {
                    slot.child = None;
                    slot.handle.pid = None;
                    self.transition(slot, ProcessState::Crashed);
                    return Err(ProcessError::ExitedDuringStartup {
                        provider: id.to_string(),
                        code,
                    });
                }
            }

            let timeout = self.config.readiness_probe_timeout;
            let check = tokio::time::timeout(timeout, self.probe.probe(provider))
                .await
                .unwrap_or_else(|_| Err(format!("no answer within {}ms", timeout.as_millis())));
            match check {
                Ok(()) => {
                    let mut slots = self.slots.lock();
                    let Some(slot) = slots
                        .get_mut(id)
                        .filter(|s| s.generation == generation && s.handle.state == ProcessState::Starting)
                    else {
                        return Err(ProcessError::StartAborted(id.to_string()));
                    };
                    self.transition(slot, ProcessState::Running);
                    info!(provider = id, attempt, pid = ?slot.handle.pid, "Process ready");
                    return Ok(slot.handle.clone());
                }
                Err(reason) => {
                    debug!(provider = id, attempt, %reason, "Readiness check failed");
                }
            }

            if attempt < self.config.readiness_attempts {
                tokio::time::sleep(backoff).await;
                backoff = (backoff * 2).min(self.config.readiness_max_backoff);
            }
        }

        if let Some(child) = self.crash(id, generation) {
            terminate(id, child, Duration::ZERO).await.ok();
        }
        Err(ProcessError::ReadinessTimeout {
            provider: id.to_string(),
            attempts: self.config.readiness_attempts,
        })
    }

    /// Graceful stop: SIGTERM, wait up to the grace period, then kill.
    /// Always leaves the slot `stopped`; stopping a stopped slot is a no-op.
    pub async fn stop(&self, provider_id: &str) -> Result<(), ProcessError> {
        let (child, generation) = {
            let mut slots = self.slots.lock();
            let Some(slot) = slots.get_mut(provider_id) else {
                // Unknown ids are an error; known but never started is a no-op.
                self.registry.get(provider_id)?;
                return Ok(());
            };
            slot.generation += 1;
            match slot.child.take() {
                Some(child) => {
                    self.transition(slot, ProcessState::Stopping);
                    (child, slot.generation)
                }
                None => {
                    slot.handle.pid = None;
                    self.transition(slot, ProcessState::Stopped);
                    return Ok(());
                }
            }
        };

        let result = terminate(provider_id, child, self.config.grace_period).await;

        let mut slots = self.slots.lock();
        if let Some(slot) = slots.get_mut(provider_id)
            && slot.generation == generation
        {
            slot.handle.pid = None;
            self.transition(slot, ProcessState::Stopped);
        }
        result
    }

    /// Stop then start. A failed stop does not prevent the start; if both
    /// fail, both errors are returned.
    pub async fn restart(
        &self,
        provider_id: &str,
        model: Option<&str>,
    ) -> Result<ProcessHandle, ProcessError> {
        let stopped = self.stop(provider_id).await;
        let started = self.start(provider_id, model).await;
        match (stopped, started) {
            (Err(stop), Err(start)) => Err(ProcessError::Restart {
                stop: Box::new(stop),
                start: Box::new(start),
            }),
            (Err(stop), Ok(handle)) => {
                warn!(provider = provider_id, "Stop failed during restart: {stop}");
                Ok(handle)
            }
            (Ok(()), started) => started,
        }
    }

    /// Move every `running` slot whose process has exited to `crashed`.
    /// Returns the affected provider ids.
    pub fn reap_exited(&self) -> Vec<String> {
        let mut crashed = Vec::new();
        let mut slots = self.slots.lock();
        for slot in slots.values_mut() {
            if slot.handle.state != ProcessState::Running {
                continue;
            }
            let Some(child) = slot.child.as_mut() else {
                continue;
            };
            match child.try_wait() {
                Ok(Some(status)) => {
                    warn!(provider = %slot.handle.provider_id, code = ?status.code(), "Process exited unexpectedly");
                    slot.child = None;
                    slot.handle.pid = None;
                    self.transition(slot, ProcessState::Crashed);
                    crashed.push(slot.handle.provider_id.clone());
                }
                Ok(None) => {}
                Err(e) => warn!(provider = %slot.handle.provider_id, "Could not poll process: {e}"),
            }
        }
        crashed
    }

    /// Reap exited processes on the configured interval until shutdown.
    pub fn spawn_supervisor(self: Arc<Self>, mut shutdown: broadcast::Receiver<()>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.config.supervise_interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        self.reap_exited();
                    }
                    _ = shutdown.recv() => {
                        debug!("Process supervisor shutting down");
                        break;
                    }
                }
            }
        })
    }

    /// Stop every slot that still holds a process.
    pub async fn stop_all(&self) {
        let ids: Vec<String> = self
            .slots
            .lock()
            .iter()
            .filter(|(_, s)| s.child.is_some())
            .map(|(id, _)| id.clone())
            .collect();
        for id in ids {
            if let Err(e) = self.stop(&id).await {
                warn!(provider = %id, "Failed to stop process: {e}");
            }
        }
    }

    /// The last `lines` lines of a provider's process log. A missing log
    /// file reads as empty.
    pub async fn provider_log(&self, provider_id: &str, lines: usize) -> Result<String, ProcessError> {
        self.registry.get(provider_id)?;
        read_tail(&self.log_path(provider_id), lines)
            .await
            .map_err(|source| ProcessError::Log {
                provider: provider_id.to_string(),
                source,
            })
    }
}

/// Releases a reserved slot if the `start` future is dropped mid-flight:
/// the slot goes to `crashed` and its process group is killed.
struct StartGuard<'a> {
    manager: &'a ProcessManager,
    provider_id: &'a str,
    generation: u64,
    armed: bool,
}

impl StartGuard<'_> {
    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for StartGuard<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let child = {
            let mut slots = self.manager.slots.lock();
            match slots.get_mut(self.provider_id) {
                Some(slot)
                    if slot.generation == self.generation
                        && slot.handle.state == ProcessState::Starting =>
                {
                    warn!(provider = self.provider_id, "Start cancelled before readiness");
                    slot.handle.pid = None;
                    self.manager.transition(slot, ProcessState::Crashed);
                    slot.child.take()
                }
                _ => None,
            }
        };
        if let Some(mut child) = child {
            #[cfg(unix)]
            signal_group(self.provider_id, &child, Signal::SIGKILL);
            let _ = child.start_kill();
        }
    }
}

/// The last `lines` lines of the file at `path`, reading backwards from
/// the end. A missing file reads as empty.
async fn read_tail(path: &Path, lines: usize) -> std::io::Result<String> {
    let mut file = match tokio::fs::File::open(path).await {
        Ok(file) => file,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(String::new()),
        Err(e) => return Err(e),
    };
    let mut pos = file.metadata().await?.len();
    let mut buf: Vec<u8> = Vec::new();
    // One newline more than requested guarantees the first kept line is whole.
    while pos > 0 && buf.iter().filter(|b| **b == b'\n').count() <= lines {
        let step = LOG_READ_CHUNK.min(pos);
        pos -= step;
        file.seek(SeekFrom::Start(pos)).await?;
        let mut chunk = vec![0; step as usize];
        file.read_exact(&mut chunk).await?;
        chunk.extend_from_slice(&buf);
        buf = chunk;
    }
    let text = String::from_utf8_lossy(&buf);
    let all: Vec<&str> = text.lines().collect();
    let start = all.len().saturating_sub(lines);
    Ok(all[start..].join("\n"))
}

/// Signal the process group led by `child`. A group that is already gone
/// is not an error.
#[cfg(unix)]
fn signal_group(provider: &str, child: &Child, signal: Signal) {
    let Some(pid) = child.id() else {
        return;
    };
    match killpg(Pid::from_raw(pid as i32), signal) {
        Ok(()) | Err(Errno::ESRCH) => {}
        Err(e) => debug!(provider, pid, signal = signal.as_str(), "Signal failed: {e}"),
    }
}

/// Send SIGTERM to the process group, wait up to `grace`, then SIGKILL.
async fn terminate(provider: &str, mut child: Child, grace: Duration) -> Result<(), ProcessError> {
    #[cfg(unix)]
    signal_group(provider, &child, Signal::SIGTERM);
    #[cfg(not(unix))]
    let _ = child.start_kill();

    match tokio::time::timeout(grace, child.wait()).await {
        Ok(Ok(status)) => {
            debug!(provider, code = ?status.code(), "Process exited");
            Ok(())
        }
        Ok(Err(e)) => {
            warn!(provider, "Waiting for process failed: {e}");
            force_kill(provider, &mut child).await
        }
        Err(_) => {
            warn!(provider, grace_ms = grace.as_millis() as u64, "Process ignored SIGTERM; killing");
            force_kill(provider, &mut child).await
        }
    }
}

async fn force_kill(provider: &str, child: &mut Child) -> Result<(), ProcessError> {
    #[cfg(unix)]
    signal_group(provider, child, Signal::SIGKILL);
    match child.kill().await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::InvalidInput => Ok(()),
        Err(source) => Err(ProcessError::Signal {
            provider: provider.to_string(),
            source,
        }),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
