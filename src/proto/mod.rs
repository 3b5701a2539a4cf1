//! Wire protocol between the fleet control plane and worker agents
//!
//! Every message exchanged over the agent channel is defined here so that
//! both sides of the wire share one schema. Agents talk to the fleet over
//! two request/response calls (`Register`, `Heartbeat`) plus a persistent
//! WebSocket carrying two discriminated unions: [`AgentMessage`] upstream
//! and [`ControlMessage`] downstream.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Kind of node joining the fleet
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum NodeType {
    /// Ephemeral cloud instance carrying one or more GPUs
    #[default]
    GpuWorker,
    /// Mesh coordination node (no inference backend)
    Lighthouse,
    /// Always-on node in the home cluster
    Local,
}

impl std::fmt::Display for NodeType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::GpuWorker => write!(f, "gpu-worker"),
            Self::Lighthouse => write!(f, "lighthouse"),
            Self::Local => write!(f, "local"),
        }
    }
}

impl std::str::FromStr for NodeType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "gpu-worker" => Ok(Self::GpuWorker),
            "lighthouse" => Ok(Self::Lighthouse),
            "local" => Ok(Self::Local),
            other => Err(format!("unknown node type '{other}'")),
        }
    }
}

/// Hardware capabilities declared at registration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct NodeCapabilities {
    #[serde(default)]
    pub has_gpu: bool,

    #[serde(default)]
    pub gpu_count: u32,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub gpu_model: Option<String>,
}

impl NodeCapabilities {
    pub fn with_gpu(count: u32, model: impl Into<String>) -> Self {
        Self {
            has_gpu: count > 0,
            gpu_count: count,
            gpu_model: Some(model.into()),
        }
    }
}

/// First message an agent sends; creates or refreshes its Node record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterRequest {
    pub node_id: String,

    pub node_type: NodeType,

    /// Cloud instance id, when running on a provisioned VM
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instance_id: Option<String>,

    /// Address on the overlay network
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mesh_ip: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub public_ip: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub private_ip: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub zone: Option<String>,

    #[serde(default)]
    pub capabilities: NodeCapabilities,

    /// Free-form labels; `override=true` permits claiming a reserved identity
    #[serde(default)]
    pub labels: HashMap<String, String>,
}

/// Fleet's answer to [`RegisterRequest`]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterResponse {
    pub accepted: bool,

    pub message: String,

    /// Identity the fleet will address this node by
    #[serde(skip_serializing_if = "Option::is_none")]
    pub assigned_id: Option<String>,

    pub heartbeat_interval_sec: u64,

    pub status_interval_sec: u64,
}

impl RegisterResponse {
    pub fn accepted(id: impl Into<String>, heartbeat: u64, status: u64) -> Self {
        Self {
            accepted: true,
            message: "registered".to_string(),
            assigned_id: Some(id.into()),
            heartbeat_interval_sec: heartbeat,
            status_interval_sec: status,
        }
    }

    pub fn rejected(message: impl Into<String>) -> Self {
        Self {
            accepted: false,
            message: message.into(),
            assigned_id: None,
            heartbeat_interval_sec: 0,
            status_interval_sec: 0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatRequest {
    pub node_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatResponse {
    pub ok: bool,
    pub server_time: DateTime<Utc>,
}

// ============================================================================
// Node status
// ============================================================================

/// Periodic snapshot an agent streams to the fleet
///
/// Counters are monotonic within one agent lifetime; the fleet treats any
/// decrease as an agent restart and resets its derived state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeStatus {
    pub hostname: String,

    pub node_type: NodeType,

    pub uptime_secs: u64,

    pub cpu_percent: f64,

    pub memory_used_bytes: u64,
    pub memory_total_bytes: u64,

    pub disk_used_bytes: u64,
    pub disk_total_bytes: u64,

    pub network_rx_bytes: u64,
    pub network_tx_bytes: u64,

    #[serde(default)]
    pub has_gpu: bool,

    #[serde(default)]
    pub gpus: Vec<GpuStatus>,

    /// Metrics of the inference backend process, when one is reachable
    #[serde(skip_serializing_if = "Option::is_none")]
    pub backend: Option<BackendStatus>,

    /// Whether the agent's broker publisher is currently connected
    #[serde(skip_serializing_if = "Option::is_none")]
    pub broker_connected: Option<bool>,

    pub collected_at: DateTime<Utc>,
}

/// Per-GPU sample, one row of `nvidia-smi --query-gpu` output
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GpuStatus {
    pub index: u32,
    pub utilization_percent: f64,
    pub memory_used_mib: u64,
    pub memory_total_mib: u64,
    pub temperature_c: f64,
    pub power_watts: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct BackendStatus {
    #[serde(default)]
    pub models: Vec<ModelState>,

    #[serde(default)]
    pub request_count: u64,

    #[serde(default)]
    pub prompt_tokens: u64,

    #[serde(default)]
    pub completion_tokens: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelState {
    pub name: String,
    #[serde(default)]
    pub loaded: bool,
}

// ============================================================================
// Commands
// ============================================================================

/// Enumerated command set the fleet may dispatch to an agent
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CommandKind {
    StartBackend,
    StopBackend,
    LoadModel,
    UnloadModel,
    Restart,
    ExecShell,
    SyncConfig,
    HealthCheck,
}

impl std::fmt::Display for CommandKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::StartBackend => "start-backend",
            Self::StopBackend => "stop-backend",
            Self::LoadModel => "load-model",
            Self::UnloadModel => "unload-model",
            Self::Restart => "restart",
            Self::ExecShell => "exec-shell",
            Self::SyncConfig => "sync-config",
            Self::HealthCheck => "health-check",
        };
        write!(f, "{s}")
    }
}

/// Unit of work dispatched over the stream; correlated by `command_id`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Command {
    pub command_id: String,

    pub kind: CommandKind,

    /// Kind-specific arguments (e.g. `{"model": "…"}`, `{"command": "…"}`)
    #[serde(default)]
    pub payload: serde_json::Value,

    /// Execution deadline in seconds; agent default applies when absent
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deadline_secs: Option<u64>,
}

impl Command {
    pub fn new(kind: CommandKind, payload: serde_json::Value) -> Self {
        Self {
            command_id: Uuid::new_v4().to_string(),
            kind,
            payload,
            deadline_secs: None,
        }
    }

    pub fn with_deadline(mut self, secs: u64) -> Self {
        self.deadline_secs = Some(secs);
        self
    }
}

/// Exactly one result is produced per delivered command
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandResult {
    pub command_id: String,

    pub success: bool,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub stdout: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub stderr: Option<String>,

    pub duration_ms: u64,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    pub level: String,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

/// Interval overrides pushed by the fleet mid-stream
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ConfigUpdate {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub heartbeat_interval_sec: Option<u64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub status_interval_sec: Option<u64>,
}

// ============================================================================
// Stream unions
// ============================================================================

/// Messages an agent sends upstream on the persistent stream
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentMessage {
    Status(NodeStatus),
    CommandResult(CommandResult),
    Log(LogEntry),
}

/// Messages the fleet sends downstream on the persistent stream
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlMessage {
    Command(Command),
    ConfigUpdate(ConfigUpdate),
}

// ============================================================================
// Fleet inspection
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FleetStatusResponse {
    pub nodes_total: usize,
    pub nodes_connected: usize,
    pub nodes: Vec<NodeSummary>,
    pub generated_at: DateTime<Utc>,
}

/// One node as seen in the fleet inspection view
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeSummary {
    pub node_id: String,
    pub node_type: NodeType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instance_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mesh_ip: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub public_ip: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub zone: Option<String>,
    pub stream_active: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub pending_commands: usize,
    pub capabilities: NodeCapabilities,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<NodeStatus>,
}

// ============================================================================
// Validation
// ============================================================================

/// Node identity policy: non-empty, bounded, filesystem-safe characters
pub fn validate_node_id(id: &str) -> bool {
    !id.is_empty()
        && id.len() <= 128
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_node_id() {
        assert!(validate_node_id("gpu-worker-1"));
        assert!(validate_node_id("node.eu-west-1a_01"));
        assert!(!validate_node_id(""));
        assert!(!validate_node_id("has spaces"));
        assert!(!validate_node_id(&"x".repeat(129)));
    }

    #[test]
    fn test_node_type_round_trip() {
        for (s, t) in [
            ("gpu-worker", NodeType::GpuWorker),
            ("lighthouse", NodeType::Lighthouse),
            ("local", NodeType::Local),
        ] {
            assert_eq!(s.parse::<NodeType>().unwrap(), t);
            assert_eq!(t.to_string(), s);
        }
        assert!("balloon".parse::<NodeType>().is_err());
    }

    #[test]
    fn test_node_type_serde_kebab() {
        let json = serde_json::to_string(&NodeType::GpuWorker).unwrap();
        assert_eq!(json, r#""gpu-worker""#);
    }

    #[test]
    fn test_agent_message_tagged() {
        let msg = AgentMessage::CommandResult(CommandResult {
            command_id: "c-1".to_string(),
            success: true,
            exit_code: Some(0),
            stdout: None,
            stderr: None,
            duration_ms: 12,
            error: None,
        });
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains(r#""type":"command_result""#), "{json}");

        let back: AgentMessage = serde_json::from_str(&json).unwrap();
        match back {
            AgentMessage::CommandResult(r) => assert_eq!(r.command_id, "c-1"),
            other => panic!("wrong variant: {other:?}"),
        }
    }

    #[test]
    fn test_control_message_tagged() {
        let cmd = Command::new(CommandKind::LoadModel, serde_json::json!({"model": "llama3"}))
            .with_deadline(120);
        let msg = ControlMessage::Command(cmd);
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains(r#""type":"command""#), "{json}");
        assert!(json.contains(r#""kind":"load-model""#), "{json}");

        let back: ControlMessage = serde_json::from_str(&json).unwrap();
        match back {
            ControlMessage::Command(c) => {
                assert_eq!(c.kind, CommandKind::LoadModel);
                assert_eq!(c.deadline_secs, Some(120));
            }
            other => panic!("wrong variant: {other:?}"),
        }
    }

    #[test]
    fn test_register_response_builders() {
        let ok = RegisterResponse::accepted("node-1", 60, 30);
        assert!(ok.accepted);
        assert_eq!(ok.assigned_id.as_deref(), Some("node-1"));
        assert_eq!(ok.heartbeat_interval_sec, 60);

        let no = RegisterResponse::rejected("reserved identity");
        assert!(!no.accepted);
        assert!(no.assigned_id.is_none());
    }

    #[test]
    fn test_node_status_serialization() {
        let status = NodeStatus {
            hostname: "burst-1".to_string(),
            node_type: NodeType::GpuWorker,
            uptime_secs: 300,
            cpu_percent: 12.5,
            memory_used_bytes: 1 << 30,
            memory_total_bytes: 8 << 30,
            disk_used_bytes: 10 << 30,
            disk_total_bytes: 100u64 << 30,
            network_rx_bytes: 1024,
            network_tx_bytes: 2048,
            has_gpu: true,
            gpus: vec![GpuStatus {
                index: 0,
                utilization_percent: 80.0,
                memory_used_mib: 20_000,
                memory_total_mib: 24_576,
                temperature_c: 61.0,
                power_watts: 280.0,
            }],
            backend: Some(BackendStatus {
                models: vec![ModelState {
                    name: "llama3:70b".to_string(),
                    loaded: true,
                }],
                request_count: 42,
                prompt_tokens: 1000,
                completion_tokens: 2000,
            }),
            broker_connected: Some(true),
            collected_at: Utc::now(),
        };

        let json = serde_json::to_string(&status).unwrap();
        let back: NodeStatus = serde_json::from_str(&json).unwrap();
        assert_eq!(back.gpus.len(), 1);
        assert_eq!(back.backend.unwrap().request_count, 42);
        assert_eq!(back.broker_connected, Some(true));
    }

    #[test]
    fn test_command_kind_wire_names() {
        let json = serde_json::to_string(&CommandKind::ExecShell).unwrap();
        assert_eq!(json, r#""exec-shell""#);
        assert_eq!(CommandKind::HealthCheck.to_string(), "health-check");
    }
}
