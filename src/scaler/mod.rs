//! Scaler core state
//!
//! The scaler owns the idle clock, the request counters, the pause flag and
//! the routing mode. Everything here is atomics or short critical sections;
//! request handlers touch this state on every admission.

pub mod proxy;
pub mod routing;
pub mod watchdog;

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use tokio::sync::broadcast;
use tracing::info;

use crate::config::ScalerConfig;
use crate::fleet::Fleet;
use crate::lifecycle::LifecycleEngine;
use routing::RoutingMode;

pub struct Scaler {
    pub engine: Arc<LifecycleEngine>,
    pub fleet: Arc<Fleet>,
    pub config: ScalerConfig,
    pub http: reqwest::Client,

    mode: RwLock<RoutingMode>,
    paused: AtomicBool,

    /// Monotonic base for the idle clock
    started: Instant,

    /// Milliseconds since `started` of the last admitted request; advanced
    /// only by request admission, never by control paths or probes
    last_request_ms: AtomicU64,

    requests_total: AtomicU64,
    requests_blocked_cold_start: AtomicU64,

    /// Fires on pause/resume/mode changes; the control WebSocket pushes a
    /// fresh snapshot on every tick
    changed: broadcast::Sender<()>,
}

impl Scaler {
    pub fn new(config: ScalerConfig, engine: Arc<LifecycleEngine>, fleet: Arc<Fleet>) -> Self {
        let (changed, _) = broadcast::channel(32);
        Self {
            engine,
            fleet,
            config,
            http: reqwest::Client::new(),
            mode: RwLock::new(RoutingMode::Auto),
            paused: AtomicBool::new(false),
            started: Instant::now(),
            last_request_ms: AtomicU64::new(0),
            requests_total: AtomicU64::new(0),
            requests_blocked_cold_start: AtomicU64::new(0),
            changed,
        }
    }

    pub fn mode(&self) -> RoutingMode {
        *self.mode.read().expect("mode lock poisoned")
    }

    pub fn set_mode(&self, mode: RoutingMode) {
        let previous = {
            let mut guard = self.mode.write().expect("mode lock poisoned");
            std::mem::replace(&mut *guard, mode)
        };
        if previous != mode {
            info!(%previous, current = %mode, "routing mode changed");
            self.notify_changed();
        }
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    /// Pause auto-scaling. Pausing while paused is a no-op.
    pub fn pause(&self) {
        if !self.paused.swap(true, Ordering::SeqCst) {
            info!("scaler paused: no auto-shutdown, no automatic cold starts");
            self.notify_changed();
        }
    }

    pub fn resume(&self) {
        if self.paused.swap(false, Ordering::SeqCst) {
            info!("scaler resumed");
            self.notify_changed();
        }
    }

    /// Record an admitted proxy request against a route target.
    /// This is the only place the idle clock advances.
    pub fn admit_request(&self, worker: &str) {
        let now_ms = self.started.elapsed().as_millis() as u64;
        self.last_request_ms.fetch_max(now_ms, Ordering::SeqCst);
        self.requests_total.fetch_add(1, Ordering::Relaxed);
        if let Ok(handle) = self.engine.handle(worker) {
            handle.record_request();
        }
    }

    pub fn record_blocked_on_cold_start(&self) {
        self.requests_blocked_cold_start.fetch_add(1, Ordering::Relaxed);
    }

    /// Time since the last admitted request (or since boot when none)
    pub fn idle_duration(&self) -> Duration {
        let now_ms = self.started.elapsed().as_millis() as u64;
        let last = self.last_request_ms.load(Ordering::SeqCst);
        Duration::from_millis(now_ms.saturating_sub(last))
    }

    pub fn requests_total(&self) -> u64 {
        self.requests_total.load(Ordering::Relaxed)
    }

    pub fn requests_blocked_cold_start(&self) -> u64 {
        self.requests_blocked_cold_start.load(Ordering::Relaxed)
    }

    pub fn cold_start_count(&self) -> u64 {
        self.engine.cold_start_total()
    }

    pub fn uptime(&self) -> Duration {
        self.started.elapsed()
    }

    /// Seconds until the idle watchdog would stop an on-demand worker,
    /// when one is running and the scaler is not paused
    pub fn time_until_shutdown(&self) -> Option<u64> {
        if self.is_paused() {
            return None;
        }
        for worker in self.engine.on_demand_names() {
            let Ok(handle) = self.engine.handle(worker) else {
                continue;
            };
            if handle.state() != crate::lifecycle::WorkerState::Running {
                continue;
            }
            // Same clamp as the watchdog: a fresh worker gets a full window
            let Some(running_for) = handle.running_for() else {
                continue;
            };
            let idle = self.idle_duration().min(running_for);
            return Some(
                self.config
                    .idle_timeout()
                    .saturating_sub(idle)
                    .as_secs(),
            );
        }
        None
    }

    pub fn notify_changed(&self) {
        let _ = self.changed.send(());
    }

    pub fn subscribe_changes(&self) -> broadcast::Receiver<()> {
        self.changed.subscribe()
    }
}
