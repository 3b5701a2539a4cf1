//! Worker Lifecycle Engine
//!
//! Translates "I want worker X running" into provisioner calls and drives
//! each worker's state machine through its transient states. The engine is
//! the only component that talks to instance provisioners; the scaler asks
//! it to [`ensure_running`](engine::LifecycleEngine::ensure_running) and
//! [`stop`](engine::LifecycleEngine::stop) workers and observes state
//! changes through its event channel.

pub mod engine;
pub mod provisioner;
pub mod worker;

use serde::{Deserialize, Serialize};

pub use engine::{EngineConfig, EngineEvent, LifecycleEngine, WorkerSnapshot};
pub use provisioner::{InstanceState, Provisioner, ProvisionerError, ShellProvisioner};
pub use worker::{LocalWorker, MeshWorker, RemoteInstanceWorker, Worker};

/// Worker state as viewed by the lifecycle engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum WorkerState {
    #[default]
    Stopped,
    Starting,
    Running,
    Stopping,
    Unknown,
}

impl std::fmt::Display for WorkerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Stopped => "stopped",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Stopping => "stopping",
            Self::Unknown => "unknown",
        };
        write!(f, "{s}")
    }
}

/// Errors surfaced to lifecycle callers
#[derive(thiserror::Error, Debug)]
pub enum LifecycleError {
    #[error("worker '{0}' not found")]
    WorkerNotFound(String),

    #[error("provisioner error: {0}")]
    Provisioner(#[from] ProvisionerError),

    #[error("worker '{worker}' failed to start: {reason}")]
    StartFailed { worker: String, reason: String },

    #[error("cold start of worker '{worker}' did not finish within the deadline")]
    ColdStartTimeout { worker: String },

    #[error("worker '{worker}' did not become ready within the start timeout")]
    StartTimeout { worker: String },

    #[error("worker '{worker}' did not confirm stop within the stop timeout")]
    StopTimeout { worker: String },

    #[error("worker '{0}' cannot be cold-started")]
    ColdStartUnavailable(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_worker_state_display() {
        assert_eq!(WorkerState::Stopped.to_string(), "stopped");
        assert_eq!(WorkerState::Starting.to_string(), "starting");
        assert_eq!(WorkerState::Unknown.to_string(), "unknown");
    }

    #[test]
    fn test_worker_state_serde_lowercase() {
        assert_eq!(
            serde_json::to_string(&WorkerState::Running).unwrap(),
            r#""running""#
        );
        let back: WorkerState = serde_json::from_str(r#""stopping""#).unwrap();
        assert_eq!(back, WorkerState::Stopping);
    }
}
