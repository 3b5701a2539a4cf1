//! Command execution on the node
//!
//! The agent executes fleet commands through the [`Executor`] trait.
//! [`ShellExecutor`] is the real one: shell-outs under a hard deadline for
//! process commands, backend HTTP calls for model management. Tests inject
//! [`mock::ScriptedExecutor`].

use std::path::PathBuf;
use std::process::Stdio;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::process::Command as ProcessCommand;
use tracing::{info, warn};

use crate::proto::{Command, CommandKind, CommandResult};

/// Execution deadline when the command carries none
pub const DEFAULT_DEADLINE: Duration = Duration::from_secs(300);

#[async_trait]
pub trait Executor: Send + Sync {
    /// Execute one command, producing exactly one result
    async fn execute(&self, command: &Command) -> CommandResult;
}

/// Production executor backed by the shell and the backend HTTP API
pub struct ShellExecutor {
    backend_url: String,
    start_cmd: Option<String>,
    stop_cmd: Option<String>,
    config_dir: PathBuf,
    http: reqwest::Client,
}

impl ShellExecutor {
    pub fn new(
        backend_url: impl Into<String>,
        start_cmd: Option<String>,
        stop_cmd: Option<String>,
    ) -> Self {
        Self {
            backend_url: backend_url.into(),
            start_cmd,
            stop_cmd,
            config_dir: std::env::temp_dir().join("cloudburst-agent"),
            http: reqwest::Client::new(),
        }
    }

    pub fn with_config_dir(mut self, dir: PathBuf) -> Self {
        self.config_dir = dir;
        self
    }

    fn deadline(command: &Command) -> Duration {
        command
            .deadline_secs
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_DEADLINE)
    }

    /// Run a shell command with a hard kill at the deadline
    async fn run_shell(&self, command_id: &str, shell_cmd: &str, deadline: Duration) -> CommandResult {
        let started = Instant::now();
        let spawned = ProcessCommand::new("sh")
            .arg("-c")
            .arg(shell_cmd)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn();

        let child = match spawned {
            Ok(child) => child,
            Err(e) => return failure(command_id, started, format!("spawn failed: {e}")),
        };

        match tokio::time::timeout(deadline, child.wait_with_output()).await {
            Ok(Ok(output)) => CommandResult {
                command_id: command_id.to_string(),
                success: output.status.success(),
                exit_code: output.status.code(),
                stdout: Some(truncate_output(&String::from_utf8_lossy(&output.stdout))),
                stderr: Some(truncate_output(&String::from_utf8_lossy(&output.stderr))),
                duration_ms: started.elapsed().as_millis() as u64,
                error: (!output.status.success()).then(|| "command exited non-zero".to_string()),
            },
            Ok(Err(e)) => failure(command_id, started, format!("wait failed: {e}")),
            Err(_) => {
                // kill_on_drop: the timed-out future drops the child and the
                // process is hard-killed with it
                warn!(command_id, "command exceeded its deadline, killed");
                failure(
                    command_id,
                    started,
                    format!("deadline of {}s exceeded", deadline.as_secs()),
                )
            }
        }
    }

    async fn configured_shell(
        &self,
        command_id: &str,
        configured: &Option<String>,
        what: &str,
        deadline: Duration,
    ) -> CommandResult {
        match configured {
            Some(cmd) => self.run_shell(command_id, cmd, deadline).await,
            None => failure(
                command_id,
                Instant::now(),
                format!("{what} command not configured on this node"),
            ),
        }
    }

    async fn backend_call(
        &self,
        command_id: &str,
        method: reqwest::Method,
        path: &str,
        body: Option<serde_json::Value>,
        deadline: Duration,
    ) -> CommandResult {
        let started = Instant::now();
        let url = format!("{}{}", self.backend_url, path);
        let mut request = self.http.request(method, &url).timeout(deadline);
        if let Some(body) = body {
            request = request.json(&body);
        }

        match request.send().await {
            Ok(response) => {
                let status = response.status();
                let body = response.text().await.unwrap_or_default();
                CommandResult {
                    command_id: command_id.to_string(),
                    success: status.is_success(),
                    exit_code: None,
                    stdout: Some(truncate_output(&body)),
                    stderr: None,
                    duration_ms: started.elapsed().as_millis() as u64,
                    error: (!status.is_success()).then(|| format!("backend answered {status}")),
                }
            }
            Err(e) => failure(command_id, started, format!("backend call failed: {e}")),
        }
    }

    fn payload_str<'a>(command: &'a Command, key: &str) -> Option<&'a str> {
        command.payload.get(key).and_then(|v| v.as_str())
    }
}

#[async_trait]
impl Executor for ShellExecutor {
    async fn execute(&self, command: &Command) -> CommandResult {
        let deadline = Self::deadline(command);
        let id = command.command_id.as_str();
        info!(command_id = id, kind = %command.kind, "executing command");

        match command.kind {
            CommandKind::ExecShell => match Self::payload_str(command, "command") {
                Some(shell_cmd) => self.run_shell(id, shell_cmd, deadline).await,
                None => failure(id, Instant::now(), "payload is missing 'command'"),
            },

            CommandKind::StartBackend => {
                self.configured_shell(id, &self.start_cmd, "start-backend", deadline)
                    .await
            }

            CommandKind::StopBackend => {
                self.configured_shell(id, &self.stop_cmd, "stop-backend", deadline)
                    .await
            }

            CommandKind::Restart => {
                let stopped = self
                    .configured_shell(id, &self.stop_cmd, "stop-backend", deadline)
                    .await;
                if !stopped.success {
                    return stopped;
                }
                self.configured_shell(id, &self.start_cmd, "start-backend", deadline)
                    .await
            }

            CommandKind::LoadModel => match Self::payload_str(command, "model") {
                Some(model) => {
                    self.backend_call(
                        id,
                        reqwest::Method::POST,
                        "/api/pull",
                        Some(serde_json::json!({"model": model, "stream": false})),
                        deadline,
                    )
                    .await
                }
                None => failure(id, Instant::now(), "payload is missing 'model'"),
            },

            CommandKind::UnloadModel => match Self::payload_str(command, "model") {
                Some(model) => {
                    // keep_alive 0 asks the backend to evict the model
                    self.backend_call(
                        id,
                        reqwest::Method::POST,
                        "/api/generate",
                        Some(serde_json::json!({"model": model, "keep_alive": 0})),
                        deadline,
                    )
                    .await
                }
                None => failure(id, Instant::now(), "payload is missing 'model'"),
            },

            CommandKind::HealthCheck => {
                self.backend_call(id, reqwest::Method::GET, "/api/tags", None, deadline)
                    .await
            }

            CommandKind::SyncConfig => {
                let started = Instant::now();
                let Some(content) = Self::payload_str(command, "content") else {
                    return failure(id, started, "payload is missing 'content'");
                };
                let name = Self::payload_str(command, "name").unwrap_or("agent.yaml");
                if name.contains('/') || name.contains("..") {
                    return failure(id, started, format!("invalid config name '{name}'"));
                }
                let path = self.config_dir.join(name);
                let write = std::fs::create_dir_all(&self.config_dir)
                    .and_then(|_| std::fs::write(&path, content));
                match write {
                    Ok(()) => CommandResult {
                        command_id: id.to_string(),
                        success: true,
                        exit_code: None,
                        stdout: Some(format!("wrote {}", path.display())),
                        stderr: None,
                        duration_ms: started.elapsed().as_millis() as u64,
                        error: None,
                    },
                    Err(e) => failure(id, started, format!("config write failed: {e}")),
                }
            }
        }
    }
}

fn failure(command_id: &str, started: Instant, error: impl Into<String>) -> CommandResult {
    CommandResult {
        command_id: command_id.to_string(),
        success: false,
        exit_code: None,
        stdout: None,
        stderr: None,
        duration_ms: started.elapsed().as_millis() as u64,
        error: Some(error.into()),
    }
}

/// Cap captured output so a chatty command cannot bloat the stream
fn truncate_output(s: &str) -> String {
    const MAX: usize = 16 * 1024;
    if s.len() <= MAX {
        return s.to_string();
    }
    let mut end = MAX;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}…[truncated]", &s[..end])
}

/// Scripted executor for tests
pub mod mock {
    use std::collections::VecDeque;
    use std::sync::Mutex;

    use async_trait::async_trait;

    use super::Executor;
    use crate::proto::{Command, CommandResult};

    /// Returns pre-scripted results in order; records every command it saw
    pub struct ScriptedExecutor {
        results: Mutex<VecDeque<CommandResult>>,
        pub executed: Mutex<Vec<Command>>,
    }

    impl ScriptedExecutor {
        pub fn new(results: Vec<CommandResult>) -> Self {
            Self {
                results: Mutex::new(results.into()),
                executed: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl Executor for ScriptedExecutor {
        async fn execute(&self, command: &Command) -> CommandResult {
            self.executed.lock().unwrap().push(command.clone());
            self.results
                .lock()
                .unwrap()
                .pop_front()
                .map(|mut r| {
                    r.command_id = command.command_id.clone();
                    r
                })
                .unwrap_or_else(|| CommandResult {
                    command_id: command.command_id.clone(),
                    success: true,
                    exit_code: Some(0),
                    stdout: None,
                    stderr: None,
                    duration_ms: 0,
                    error: None,
                })
        }
    }
}
