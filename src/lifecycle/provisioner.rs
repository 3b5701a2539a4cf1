//! Instance provisioner seam
//!
//! The engine is written against the [`Provisioner`] trait only. Concrete
//! cloud-SDK integration lives outside the core: [`ShellProvisioner`] shells
//! out to whatever CLI the deployment uses (aws, hcloud, a local script),
//! and tests inject [`mock::MockProvisioner`].

use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, warn};

use crate::config::ProvisionerConfig;

/// How long a provisioner command may run before it is considered hung
const COMMAND_TIMEOUT: Duration = Duration::from_secs(60);

/// Abstract instance state as reported by the cloud API
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstanceState {
    Running,
    Stopped,
    Pending,
    Stopping,
    Unknown,
}

impl std::str::FromStr for InstanceState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "running" => Ok(Self::Running),
            "stopped" | "terminated" => Ok(Self::Stopped),
            "pending" | "provisioning" | "booting" => Ok(Self::Pending),
            "stopping" | "shutting-down" => Ok(Self::Stopping),
            other => Err(format!("unknown instance state '{other}'")),
        }
    }
}

#[derive(Error, Debug)]
pub enum ProvisionerError {
    #[error("provisioner command '{command}' failed with exit code {code:?}: {stderr}")]
    CommandFailed {
        command: String,
        code: Option<i32>,
        stderr: String,
    },

    #[error("provisioner command '{0}' timed out")]
    CommandTimeout(String),

    #[error("instance API unreachable: {0}")]
    Unreachable(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Start / stop / describe a compute instance
#[async_trait]
pub trait Provisioner: Send + Sync {
    async fn start(&self) -> Result<(), ProvisionerError>;
    async fn stop(&self) -> Result<(), ProvisionerError>;
    async fn describe(&self) -> Result<InstanceState, ProvisionerError>;
}

/// Provisioner that drives the instance through configured shell commands.
/// The status command must print one of: running, stopped, pending, stopping.
pub struct ShellProvisioner {
    start_cmd: String,
    stop_cmd: String,
    status_cmd: String,
}

impl ShellProvisioner {
    pub fn new(config: &ProvisionerConfig) -> Self {
        Self {
            start_cmd: config.start_cmd.clone(),
            stop_cmd: config.stop_cmd.clone(),
            status_cmd: config.status_cmd.clone(),
        }
    }

    async fn run(&self, command: &str) -> Result<String, ProvisionerError> {
        debug!(command, "running provisioner command");
        let child = Command::new("sh")
            .arg("-c")
            .arg(command)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;

        let output = tokio::time::timeout(COMMAND_TIMEOUT, child.wait_with_output())
            .await
            .map_err(|_| ProvisionerError::CommandTimeout(command.to_string()))??;

        if !output.status.success() {
            return Err(ProvisionerError::CommandFailed {
                command: command.to_string(),
                code: output.status.code(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }
}

#[async_trait]
impl Provisioner for ShellProvisioner {
    async fn start(&self) -> Result<(), ProvisionerError> {
        self.run(&self.start_cmd).await.map(|_| ())
    }

    async fn stop(&self) -> Result<(), ProvisionerError> {
        self.run(&self.stop_cmd).await.map(|_| ())
    }

    async fn describe(&self) -> Result<InstanceState, ProvisionerError> {
        let stdout = self.run(&self.status_cmd).await?;
        let first_line = stdout.lines().next().unwrap_or("").trim();
        match first_line.parse() {
            Ok(state) => Ok(state),
            Err(e) => {
                warn!("status command printed unrecognized state: {e}");
                Ok(InstanceState::Unknown)
            }
        }
    }
}

/// Scripted provisioner for tests and dry runs
pub mod mock {
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::{Duration, Instant};

    use async_trait::async_trait;

    use super::{InstanceState, Provisioner, ProvisionerError};

    /// In-memory instance that "boots" after a configurable delay
    pub struct MockProvisioner {
        state: Mutex<InstanceState>,
        started_at: Mutex<Option<Instant>>,
        boot_delay: Duration,
        fail_next_start: AtomicBool,
        start_calls: AtomicUsize,
        stop_calls: AtomicUsize,
    }

    impl MockProvisioner {
        pub fn new(initial: InstanceState) -> Self {
            Self {
                state: Mutex::new(initial),
                started_at: Mutex::new(None),
                boot_delay: Duration::ZERO,
                fail_next_start: AtomicBool::new(false),
                start_calls: AtomicUsize::new(0),
                stop_calls: AtomicUsize::new(0),
            }
        }

        pub fn with_boot_delay(mut self, delay: Duration) -> Self {
            self.boot_delay = delay;
            self
        }

        pub fn fail_next_start(&self) {
            self.fail_next_start.store(true, Ordering::SeqCst);
        }

        pub fn set_state(&self, state: InstanceState) {
            *self.state.lock().unwrap() = state;
        }

        pub fn start_calls(&self) -> usize {
            self.start_calls.load(Ordering::SeqCst)
        }

        pub fn stop_calls(&self) -> usize {
            self.stop_calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Provisioner for MockProvisioner {
        async fn start(&self) -> Result<(), ProvisionerError> {
            self.start_calls.fetch_add(1, Ordering::SeqCst);
            if self.fail_next_start.swap(false, Ordering::SeqCst) {
                return Err(ProvisionerError::Unreachable(
                    "scripted start failure".to_string(),
                ));
            }
            *self.state.lock().unwrap() = InstanceState::Pending;
            *self.started_at.lock().unwrap() = Some(Instant::now());
            Ok(())
        }

        async fn stop(&self) -> Result<(), ProvisionerError> {
            self.stop_calls.fetch_add(1, Ordering::SeqCst);
            *self.state.lock().unwrap() = InstanceState::Stopped;
            Ok(())
        }

        async fn describe(&self) -> Result<InstanceState, ProvisionerError> {
            let mut state = self.state.lock().unwrap();
            if *state == InstanceState::Pending {
                let booted = self
                    .started_at
                    .lock()
                    .unwrap()
                    .map(|t| t.elapsed() >= self.boot_delay)
                    .unwrap_or(false);
                if booted {
                    *state = InstanceState::Running;
                }
            }
            Ok(*state)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::mock::MockProvisioner;
    use super::*;

    #[test]
    fn test_instance_state_parsing() {
        assert_eq!("running".parse::<InstanceState>().unwrap(), InstanceState::Running);
        assert_eq!("Stopped".parse::<InstanceState>().unwrap(), InstanceState::Stopped);
        assert_eq!(
            "shutting-down".parse::<InstanceState>().unwrap(),
            InstanceState::Stopping
        );
        assert!("weird".parse::<InstanceState>().is_err());
    }

    #[tokio::test]
    async fn test_shell_provisioner_describe() {
        let provisioner = ShellProvisioner::new(&ProvisionerConfig {
            start_cmd: "true".to_string(),
            stop_cmd: "true".to_string(),
            status_cmd: "echo running".to_string(),
        });
        assert_eq!(provisioner.describe().await.unwrap(), InstanceState::Running);
    }

    #[tokio::test]
    async fn test_shell_provisioner_failure_carries_stderr() {
        let provisioner = ShellProvisioner::new(&ProvisionerConfig {
            start_cmd: "echo boom >&2; exit 3".to_string(),
            stop_cmd: "true".to_string(),
            status_cmd: "echo running".to_string(),
        });
        let err = provisioner.start().await.unwrap_err();
        match err {
            ProvisionerError::CommandFailed { code, stderr, .. } => {
                assert_eq!(code, Some(3));
                assert_eq!(stderr, "boom");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_shell_provisioner_unrecognized_state_is_unknown() {
        let provisioner = ShellProvisioner::new(&ProvisionerConfig {
            start_cmd: "true".to_string(),
            stop_cmd: "true".to_string(),
            status_cmd: "echo banana".to_string(),
        });
        assert_eq!(provisioner.describe().await.unwrap(), InstanceState::Unknown);
    }

    #[tokio::test]
    async fn test_mock_boots_through_pending() {
        let mock = MockProvisioner::new(InstanceState::Stopped);
        assert_eq!(mock.describe().await.unwrap(), InstanceState::Stopped);

        mock.start().await.unwrap();
        // Zero boot delay: first describe after start already reports running
        assert_eq!(mock.describe().await.unwrap(), InstanceState::Running);
        assert_eq!(mock.start_calls(), 1);

        mock.stop().await.unwrap();
        assert_eq!(mock.describe().await.unwrap(), InstanceState::Stopped);
    }
}
