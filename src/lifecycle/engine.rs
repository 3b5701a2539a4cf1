//! Lifecycle engine: state machine driver for workers
//!
//! One engine instance owns every worker. Cold starts are coalesced: the
//! first caller of [`LifecycleEngine::ensure_running`] spawns a driver task
//! and every concurrent caller subscribes to the same outcome; a caller
//! disconnecting never cancels the driver. Background probe tasks keep
//! `running` workers honest and recover flaked backends.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::{broadcast, watch};
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::provisioner::InstanceState;
use super::worker::Worker;
use super::{LifecycleError, ProvisionerError, WorkerState};
use crate::config::ScalerConfig;

/// Timings and thresholds for the state machine
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub readiness_path: String,
    /// How long a successful probe keeps a worker `running`-fresh
    pub readiness_ttl: Duration,
    pub probe_timeout: Duration,
    /// Probe cadence while `starting`
    pub starting_probe_period: Duration,
    /// Background liveness cadence while `running`
    pub running_probe_period: Duration,
    /// Give up on a cold start after this long
    pub start_timeout: Duration,
    /// Give up waiting for a stop confirmation after this long
    pub stop_timeout: Duration,
    /// Consecutive probe failures before `running` degrades to `starting`
    pub failure_threshold: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            readiness_path: "/api/tags".to_string(),
            readiness_ttl: Duration::from_secs(30),
            probe_timeout: Duration::from_secs(3),
            starting_probe_period: Duration::from_secs(3),
            running_probe_period: Duration::from_secs(30),
            start_timeout: Duration::from_secs(600),
            stop_timeout: Duration::from_secs(300),
            failure_threshold: 3,
        }
    }
}

impl EngineConfig {
    pub fn from_scaler_config(config: &ScalerConfig) -> Self {
        Self {
            readiness_path: config.readiness_path.clone(),
            readiness_ttl: config.readiness_ttl(),
            ..Default::default()
        }
    }
}

/// Emitted on every state transition; the scaler and the control WebSocket
/// subscribe to push fresh snapshots
#[derive(Debug, Clone)]
pub enum EngineEvent {
    StateChanged { worker: String, state: WorkerState },
}

type StartOutcome = Option<Result<(), String>>;

/// Mutable per-worker state owned by the engine
pub struct WorkerHandle {
    pub worker: Worker,
    state: RwLock<WorkerState>,
    /// Last successful readiness probe; `running` is only trusted while
    /// this is fresher than `readiness_ttl`
    last_ready_at: Mutex<Option<Instant>>,
    /// URL the last successful probe went through
    ready_url: Mutex<Option<String>>,
    models: Mutex<Vec<String>>,
    consecutive_failures: AtomicU32,
    /// Shared outcome slot for the in-flight cold start, if any
    inflight: tokio::sync::Mutex<Option<watch::Receiver<StartOutcome>>>,
    became_running: Mutex<Option<Instant>>,
    requests: AtomicU64,
    cold_starts: AtomicU64,
}

impl WorkerHandle {
    fn new(worker: Worker) -> Self {
        Self {
            worker,
            state: RwLock::new(WorkerState::Stopped),
            last_ready_at: Mutex::new(None),
            ready_url: Mutex::new(None),
            models: Mutex::new(Vec::new()),
            consecutive_failures: AtomicU32::new(0),
            inflight: tokio::sync::Mutex::new(None),
            became_running: Mutex::new(None),
            requests: AtomicU64::new(0),
            cold_starts: AtomicU64::new(0),
        }
    }

    pub fn state(&self) -> WorkerState {
        *self.state.read().expect("state lock poisoned")
    }

    fn probe_fresh(&self, ttl: Duration) -> bool {
        self.last_ready_at
            .lock()
            .expect("lock poisoned")
            .map(|t| t.elapsed() < ttl)
            .unwrap_or(false)
    }

    pub fn record_request(&self) {
        self.requests.fetch_add(1, Ordering::Relaxed);
    }

    /// How long this worker has been in `running`, if it is
    pub fn running_for(&self) -> Option<Duration> {
        self.became_running
            .lock()
            .expect("lock poisoned")
            .map(|t| t.elapsed())
    }

    pub fn ready_url(&self) -> Option<String> {
        self.ready_url.lock().expect("lock poisoned").clone()
    }
}

/// Point-in-time view of one worker for the control API
#[derive(Debug, Clone, Serialize)]
pub struct WorkerSnapshot {
    pub name: String,
    pub kind: String,
    pub url: String,
    pub state: WorkerState,
    pub ready: bool,
    pub models: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub uptime_secs: Option<u64>,
    pub requests: u64,
    pub cold_starts: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instance_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub zone: Option<String>,
}

pub struct LifecycleEngine {
    workers: HashMap<String, Arc<WorkerHandle>>,
    local_name: Option<String>,
    cloud_name: Option<String>,
    mesh_name: Option<String>,
    http: reqwest::Client,
    config: EngineConfig,
    events: broadcast::Sender<EngineEvent>,
}

impl LifecycleEngine {
    pub fn new(config: EngineConfig) -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            workers: HashMap::new(),
            local_name: None,
            cloud_name: None,
            mesh_name: None,
            http: reqwest::Client::new(),
            config,
            events,
        }
    }

    /// Build the engine from the scaler config, wiring shell provisioners
    pub fn from_scaler_config(config: &ScalerConfig) -> Self {
        let mut engine = Self::new(EngineConfig::from_scaler_config(config));
        if let Some(local) = &config.workers.local {
            engine.add_local(Worker::local(local));
        }
        if let Some(cloud) = &config.workers.cloud {
            let provisioner =
                Arc::new(super::provisioner::ShellProvisioner::new(&cloud.provisioner));
            engine.add_cloud(Worker::remote_instance(cloud, provisioner));
        }
        if let Some(mesh) = &config.workers.mesh {
            let provisioner =
                Arc::new(super::provisioner::ShellProvisioner::new(&mesh.provisioner));
            engine.add_mesh(Worker::mesh(mesh, provisioner));
        }
        engine
    }

    pub fn add_local(&mut self, worker: Worker) {
        self.local_name = Some(worker.name().to_string());
        self.add_worker(worker);
    }

    pub fn add_cloud(&mut self, worker: Worker) {
        self.cloud_name = Some(worker.name().to_string());
        self.add_worker(worker);
    }

    pub fn add_mesh(&mut self, worker: Worker) {
        self.mesh_name = Some(worker.name().to_string());
        self.add_worker(worker);
    }

    fn add_worker(&mut self, worker: Worker) {
        self.workers
            .insert(worker.name().to_string(), Arc::new(WorkerHandle::new(worker)));
    }

    pub fn local_name(&self) -> Option<&str> {
        self.local_name.as_deref()
    }

    pub fn cloud_name(&self) -> Option<&str> {
        self.cloud_name.as_deref()
    }

    pub fn mesh_name(&self) -> Option<&str> {
        self.mesh_name.as_deref()
    }

    /// Workers that are started on demand and shut down when idle, in
    /// preference order (cloud before mesh-only)
    pub fn on_demand_names(&self) -> Vec<&str> {
        [self.cloud_name(), self.mesh_name()]
            .into_iter()
            .flatten()
            .collect()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.events.subscribe()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn handle(&self, name: &str) -> Result<Arc<WorkerHandle>, LifecycleError> {
        self.workers
            .get(name)
            .cloned()
            .ok_or_else(|| LifecycleError::WorkerNotFound(name.to_string()))
    }

    pub fn worker_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.workers.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn cold_start_total(&self) -> u64 {
        self.workers
            .values()
            .map(|h| h.cold_starts.load(Ordering::Relaxed))
            .sum()
    }

    fn transition(&self, handle: &WorkerHandle, next: WorkerState) {
        let previous = {
            let mut state = handle.state.write().expect("state lock poisoned");
            let previous = *state;
            *state = next;
            previous
        };
        if previous == next {
            return;
        }

        let mut became_running = handle.became_running.lock().expect("lock poisoned");
        match next {
            WorkerState::Running => *became_running = Some(Instant::now()),
            _ => *became_running = None,
        }
        drop(became_running);

        if next != WorkerState::Running {
            *handle.last_ready_at.lock().expect("lock poisoned") = None;
        }

        info!(worker = handle.worker.name(), from = %previous, to = %next, "worker state changed");
        let _ = self.events.send(EngineEvent::StateChanged {
            worker: handle.worker.name().to_string(),
            state: next,
        });
    }

    /// Probe the instance API and backend once to decide each worker's
    /// initial state. Called once at scaler boot.
    pub async fn init(&self) {
        for handle in self.workers.values() {
            let state = match handle.worker.query_state().await {
                Ok(InstanceState::Running) => {
                    if self.probe_and_record(handle).await {
                        WorkerState::Running
                    } else {
                        WorkerState::Starting
                    }
                }
                Ok(InstanceState::Pending) => WorkerState::Starting,
                Ok(InstanceState::Stopping) => WorkerState::Stopping,
                Ok(InstanceState::Stopped) => WorkerState::Stopped,
                Ok(InstanceState::Unknown) => WorkerState::Unknown,
                Err(e) => {
                    warn!(worker = handle.worker.name(), "instance API unreachable at boot: {e}");
                    WorkerState::Unknown
                }
            };
            self.transition(handle, state);
        }
    }

    /// Spawn one background probe task per worker. While `running` this is
    /// the 30s liveness check; while `starting` with no driver in flight it
    /// is the 3s flake-recovery probe.
    pub fn spawn_background_probes(self: &Arc<Self>, shutdown: CancellationToken) {
        for handle in self.workers.values() {
            let engine = self.clone();
            let handle = handle.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                loop {
                    let period = match handle.state() {
                        WorkerState::Running => engine.config.running_probe_period,
                        _ => engine.config.starting_probe_period,
                    };
                    tokio::select! {
                        _ = sleep(period) => {}
                        _ = shutdown.cancelled() => break,
                    }

                    if handle.inflight.lock().await.is_some() {
                        continue;
                    }

                    match handle.state() {
                        WorkerState::Running => {
                            if !engine.probe_and_record(&handle).await {
                                let fails =
                                    handle.consecutive_failures.fetch_add(1, Ordering::SeqCst) + 1;
                                if fails >= engine.config.failure_threshold {
                                    warn!(
                                        worker = handle.worker.name(),
                                        fails, "backend flaked, closing the request gate"
                                    );
                                    engine.transition(&handle, WorkerState::Starting);
                                }
                            }
                        }
                        WorkerState::Starting => {
                            if engine.probe_and_record(&handle).await {
                                engine.transition(&handle, WorkerState::Running);
                            }
                        }
                        _ => {}
                    }
                }
            });
        }
    }

    /// Block until the worker is `running` or the deadline passes.
    ///
    /// Concurrent calls for the same worker coalesce onto one start driver;
    /// all callers receive the same outcome. The driver keeps going if a
    /// caller gives up.
    pub async fn ensure_running(
        self: &Arc<Self>,
        name: &str,
        deadline: Duration,
    ) -> Result<(), LifecycleError> {
        let handle = self.handle(name)?;
        let deadline_at = Instant::now() + deadline;

        loop {
            if handle.state() == WorkerState::Running {
                if handle.probe_fresh(self.config.readiness_ttl) {
                    return Ok(());
                }
                // Stale probe: re-validate inline before trusting the state
                if self.probe_and_record(&handle).await {
                    return Ok(());
                }
                warn!(worker = name, "readiness went stale, re-entering starting");
                self.transition(&handle, WorkerState::Starting);
            }

            let mut rx = {
                let mut slot = handle.inflight.lock().await;
                match slot.as_ref() {
                    Some(rx) => rx.clone(),
                    None => {
                        if !handle.worker.can_cold_start() {
                            return Err(LifecycleError::ColdStartUnavailable(name.to_string()));
                        }
                        let (tx, rx) = watch::channel(None);
                        *slot = Some(rx.clone());
                        let engine = self.clone();
                        let driver_handle = handle.clone();
                        tokio::spawn(async move {
                            let result = engine
                                .run_start(&driver_handle)
                                .await
                                .map_err(|e| e.to_string());
                            *driver_handle.inflight.lock().await = None;
                            let _ = tx.send(Some(result));
                        });
                        rx
                    }
                }
            };

            let Some(remaining) = deadline_at.checked_duration_since(Instant::now()) else {
                return Err(LifecycleError::ColdStartTimeout {
                    worker: name.to_string(),
                });
            };

            let outcome = tokio::time::timeout(remaining, async {
                loop {
                    if let Some(result) = rx.borrow().clone() {
                        return result;
                    }
                    if rx.changed().await.is_err() {
                        return Err("start driver ended unexpectedly".to_string());
                    }
                }
            })
            .await;

            match outcome {
                Err(_) => {
                    return Err(LifecycleError::ColdStartTimeout {
                        worker: name.to_string(),
                    })
                }
                Ok(Err(reason)) => {
                    return Err(LifecycleError::StartFailed {
                        worker: name.to_string(),
                        reason,
                    })
                }
                // Loop back to re-validate readiness at the top
                Ok(Ok(())) => {}
            }
        }
    }

    /// The single driver of one cold start: provision, wait for the
    /// instance API to report running, then probe readiness until the
    /// backend answers or the start timeout expires.
    async fn run_start(&self, handle: &Arc<WorkerHandle>) -> Result<(), LifecycleError> {
        let name = handle.worker.name().to_string();
        let start_deadline = Instant::now() + self.config.start_timeout;

        // A stop in progress finishes first; the new request then triggers
        // a fresh cold start rather than cancelling the stop.
        while handle.state() == WorkerState::Stopping {
            if Instant::now() >= start_deadline {
                return Err(LifecycleError::StartTimeout { worker: name });
            }
            if let Ok(InstanceState::Stopped) = handle.worker.query_state().await {
                self.transition(handle, WorkerState::Stopped);
                break;
            }
            sleep(self.config.starting_probe_period).await;
        }

        match handle.state() {
            WorkerState::Running => return Ok(()),
            WorkerState::Starting => {
                // Flake recovery: the instance is up, only the backend needs
                // to come back. No provisioner call, no cold-start count.
            }
            _ => {
                self.transition(handle, WorkerState::Starting);
                handle.cold_starts.fetch_add(1, Ordering::SeqCst);
                info!(worker = %name, "cold start initiated");
                if let Err(e) = handle.worker.start().await {
                    let next = match &e {
                        ProvisionerError::Unreachable(_) => WorkerState::Unknown,
                        _ => WorkerState::Stopped,
                    };
                    self.transition(handle, next);
                    return Err(LifecycleError::StartFailed {
                        worker: name,
                        reason: e.to_string(),
                    });
                }
            }
        }

        loop {
            if Instant::now() >= start_deadline {
                self.abort_start(handle).await;
                return Err(LifecycleError::StartTimeout { worker: name });
            }
            match handle.worker.query_state().await {
                Ok(InstanceState::Running) => break,
                Ok(state) => debug!(worker = %name, ?state, "waiting for instance to boot"),
                Err(e) => debug!(worker = %name, "instance query failed while starting: {e}"),
            }
            sleep(self.config.starting_probe_period).await;
        }

        loop {
            if Instant::now() >= start_deadline {
                self.abort_start(handle).await;
                return Err(LifecycleError::StartTimeout { worker: name });
            }
            if self.probe_and_record(handle).await {
                self.transition(handle, WorkerState::Running);
                info!(worker = %name, "worker is running");
                return Ok(());
            }
            sleep(self.config.starting_probe_period).await;
        }
    }

    async fn abort_start(&self, handle: &Arc<WorkerHandle>) {
        error!(
            worker = handle.worker.name(),
            "start timed out, stopping instance best-effort"
        );
        if let Err(e) = handle.worker.stop().await {
            warn!(worker = handle.worker.name(), "best-effort stop failed: {e}");
        }
        self.transition(handle, WorkerState::Stopped);
    }

    /// Stop a worker and wait for the instance API to confirm.
    /// Stopping an already-stopped worker is a successful no-op.
    pub async fn stop(&self, name: &str) -> Result<(), LifecycleError> {
        let handle = self.handle(name)?;

        if handle.worker.is_local() {
            warn!(worker = name, "local worker is always-on, ignoring stop");
            return Ok(());
        }

        match handle.state() {
            WorkerState::Stopped | WorkerState::Stopping => return Ok(()),
            _ => {}
        }

        self.transition(&handle, WorkerState::Stopping);
        if let Err(e) = handle.worker.stop().await {
            // Best-effort: stay in stopping and keep polling for
            // confirmation; the operator can override.
            warn!(worker = name, "stop command failed, awaiting instance API: {e}");
        }

        let deadline = Instant::now() + self.config.stop_timeout;
        loop {
            if Instant::now() >= deadline {
                error!(worker = name, "stop unconfirmed within timeout, state unknown");
                self.transition(&handle, WorkerState::Unknown);
                return Err(LifecycleError::StopTimeout {
                    worker: name.to_string(),
                });
            }
            match handle.worker.query_state().await {
                Ok(InstanceState::Stopped) => {
                    self.transition(&handle, WorkerState::Stopped);
                    return Ok(());
                }
                Ok(state) => debug!(worker = name, ?state, "waiting for stop confirmation"),
                Err(e) => debug!(worker = name, "instance query failed while stopping: {e}"),
            }
            sleep(self.config.starting_probe_period).await;
        }
    }

    /// Operator override: force a worker into a target state
    pub fn force_state(&self, name: &str, state: WorkerState) -> Result<(), LifecycleError> {
        let handle = self.handle(name)?;
        info!(worker = name, %state, "manual state override");
        self.transition(&handle, state);
        Ok(())
    }

    /// Probe the worker's candidate URLs in preference order and record the
    /// first success. Returns whether the worker answered ready.
    pub async fn probe_and_record(&self, handle: &Arc<WorkerHandle>) -> bool {
        for url in handle.worker.reachable_urls() {
            if let Some(models) = self.probe_url(url).await {
                *handle.last_ready_at.lock().expect("lock poisoned") = Some(Instant::now());
                *handle.ready_url.lock().expect("lock poisoned") = Some(url.to_string());
                *handle.models.lock().expect("lock poisoned") = models;
                handle.consecutive_failures.store(0, Ordering::SeqCst);
                return true;
            }
        }
        false
    }

    /// One readiness probe: 2xx with a "models" key means ready
    async fn probe_url(&self, url: &str) -> Option<Vec<String>> {
        let full = format!("{}{}", url, self.config.readiness_path);
        let response = self
            .http
            .get(&full)
            .timeout(self.config.probe_timeout)
            .send()
            .await
            .ok()?;
        if !response.status().is_success() {
            return None;
        }
        let body: serde_json::Value = response.json().await.ok()?;
        let models = body.get("models")?;
        Some(parse_model_names(models))
    }

    /// Whether a worker is `running` with a fresh readiness probe
    pub fn is_ready(&self, name: &str) -> bool {
        self.workers
            .get(name)
            .map(|h| h.state() == WorkerState::Running && h.probe_fresh(self.config.readiness_ttl))
            .unwrap_or(false)
    }

    pub fn snapshot(&self, name: &str) -> Option<WorkerSnapshot> {
        let handle = self.workers.get(name)?;
        let kind = match &handle.worker {
            Worker::Local(_) => "local",
            Worker::RemoteInstance(_) => "cloud",
            Worker::Mesh(_) => "mesh",
        };
        let url = handle
            .ready_url()
            .unwrap_or_else(|| {
                handle
                    .worker
                    .reachable_urls()
                    .first()
                    .map(|s| s.to_string())
                    .unwrap_or_default()
            });
        Some(WorkerSnapshot {
            name: name.to_string(),
            kind: kind.to_string(),
            url,
            state: handle.state(),
            ready: self.is_ready(name),
            models: handle.models.lock().expect("lock poisoned").clone(),
            uptime_secs: handle
                .became_running
                .lock()
                .expect("lock poisoned")
                .map(|t| t.elapsed().as_secs()),
            requests: handle.requests.load(Ordering::Relaxed),
            cold_starts: handle.cold_starts.load(Ordering::Relaxed),
            instance_id: handle.worker.instance_id().map(str::to_string),
            region: handle.worker.region().map(str::to_string),
            zone: handle.worker.zone().map(str::to_string),
        })
    }

    pub fn snapshots(&self) -> Vec<WorkerSnapshot> {
        self.worker_names()
            .iter()
            .filter_map(|n| self.snapshot(n))
            .collect()
    }
}

fn parse_model_names(models: &serde_json::Value) -> Vec<String> {
    match models {
        serde_json::Value::Array(items) => items
            .iter()
            .filter_map(|item| match item {
                serde_json::Value::String(s) => Some(s.clone()),
                serde_json::Value::Object(obj) => obj
                    .get("name")
                    .and_then(|n| n.as_str())
                    .map(str::to_string),
                _ => None,
            })
            .collect(),
        _ => Vec::new(),
    }
}
