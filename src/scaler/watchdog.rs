//! Idle-shutdown watchdog
//!
//! A background ticker that stops on-demand workers (cloud and mesh-only)
//! once the idle timeout elapses with no admitted requests. The ticker may
//! observe a slightly stale idle duration, so it re-reads the authoritative
//! clock immediately before issuing the stop.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::Scaler;
use crate::lifecycle::WorkerState;

/// Ticker period: min(5s, idle_timeout / 10)
pub fn watchdog_period(idle_timeout: Duration) -> Duration {
    Duration::from_secs(5).min(idle_timeout / 10).max(Duration::from_millis(10))
}

/// Spawn the watchdog task; cancelled via `shutdown`
pub fn spawn_idle_watchdog(scaler: Arc<Scaler>, shutdown: CancellationToken) {
    let idle_timeout = scaler.config.idle_timeout();
    let period = watchdog_period(idle_timeout);

    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown.cancelled() => break,
            }

            if scaler.is_paused() {
                continue;
            }
            for worker in scaler.engine.on_demand_names() {
                let Ok(handle) = scaler.engine.handle(worker) else {
                    continue;
                };
                if handle.state() != WorkerState::Running {
                    continue;
                }
                // Idle is measured from the last admitted request, clamped
                // by how long the worker has been running: a freshly
                // started worker gets a full idle window even before its
                // first request.
                let Some(running_for) = handle.running_for() else {
                    continue;
                };
                if scaler.idle_duration().min(running_for) < idle_timeout {
                    continue;
                }

                // Re-check against the authoritative timestamp: a request
                // may have been admitted between the ticks.
                let idle = scaler.idle_duration().min(running_for);
                if idle < idle_timeout || scaler.is_paused() {
                    debug!("idle shutdown raced with a fresh request, skipping");
                    continue;
                }

                info!(
                    worker,
                    idle_secs = idle.as_secs(),
                    "idle timeout reached, stopping worker"
                );
                if let Err(e) = scaler.engine.stop(worker).await {
                    warn!(worker, "idle shutdown failed: {e}");
                }
            }
        }
    });
}
