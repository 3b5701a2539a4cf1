//! Fleet Manager - authoritative registry of worker nodes
//!
//! The fleet tracks every node that has ever registered, mediates command
//! dispatch over per-node bounded queues, and enforces the single-stream
//! invariant: at most one active agent stream per node id, with a newer
//! stream superseding the old one.
//!
//! All state is in-memory. A scaler restart loses registrations, queued
//! commands, and counters; agents rebuild the registry as they reconnect.

pub mod api;
pub mod queue;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use thiserror::Error;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::proto::{
    Command, CommandResult, ControlMessage, FleetStatusResponse, HeartbeatResponse,
    NodeCapabilities, NodeStatus, NodeSummary, NodeType, RegisterRequest, RegisterResponse,
    validate_node_id,
};
use queue::{CommandQueue, COMMAND_QUEUE_CAPACITY};

/// Close reason sent on the superseded stream
pub const SUPERSEDED_CLOSE_REASON: &str = "superseded";

#[derive(Error, Debug)]
pub enum FleetError {
    #[error("node '{0}' not found")]
    NodeNotFound(String),

    #[error("node '{0}' has no active stream")]
    NodeDisconnected(String),

    #[error("command '{command_id}' to node '{node_id}' timed out")]
    CommandTimeout { node_id: String, command_id: String },

    #[error("result channel for command '{0}' closed")]
    ResultChannelClosed(String),
}

/// Fleet-side knobs; intervals are recommendations handed to agents
#[derive(Debug, Clone)]
pub struct FleetConfig {
    pub heartbeat_interval_sec: u64,
    pub status_interval_sec: u64,
    /// Identities agents may not claim without the `override=true` label
    pub reserved_node_ids: Vec<String>,
    pub command_queue_capacity: usize,
}

impl Default for FleetConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_sec: crate::config::HEARTBEAT_INTERVAL_SECS,
            status_interval_sec: crate::config::STATUS_INTERVAL_SECS,
            reserved_node_ids: Vec::new(),
            command_queue_capacity: COMMAND_QUEUE_CAPACITY,
        }
    }
}

impl FleetConfig {
    /// TTL after which a silent node is marked disconnected
    pub fn node_ttl(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_sec * 5)
    }
}

/// Everything the fleet knows about one node
#[derive(Debug, Clone)]
pub struct NodeRecord {
    pub node_id: String,
    pub node_type: NodeType,
    pub instance_id: Option<String>,
    pub mesh_ip: Option<String>,
    pub public_ip: Option<String>,
    pub private_ip: Option<String>,
    pub region: Option<String>,
    pub zone: Option<String>,
    pub capabilities: NodeCapabilities,
    pub labels: std::collections::HashMap<String, String>,
    pub registered_at: DateTime<Utc>,
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub stream_active: bool,
    pub last_status: Option<NodeStatus>,
    /// Logical clock advanced on every status update
    pub status_seq: u64,
}

impl NodeRecord {
    fn from_request(req: &RegisterRequest) -> Self {
        Self {
            node_id: req.node_id.clone(),
            node_type: req.node_type,
            instance_id: req.instance_id.clone(),
            mesh_ip: req.mesh_ip.clone(),
            public_ip: req.public_ip.clone(),
            private_ip: req.private_ip.clone(),
            region: req.region.clone(),
            zone: req.zone.clone(),
            capabilities: req.capabilities.clone(),
            labels: req.labels.clone(),
            registered_at: Utc::now(),
            last_heartbeat: Some(Utc::now()),
            stream_active: false,
            last_status: None,
            status_seq: 0,
        }
    }

    pub fn is_stale(&self, ttl: Duration) -> bool {
        match self.last_heartbeat {
            Some(t) => (Utc::now() - t).num_seconds() > ttl.as_secs() as i64,
            None => true,
        }
    }
}

struct StreamSession {
    epoch: u64,
    cancel: CancellationToken,
}

struct NodeEntry {
    record: NodeRecord,
    queue: Arc<CommandQueue>,
    session: Option<StreamSession>,
}

/// Handle held by a stream task for the lifetime of one agent connection
pub struct StreamHandle {
    pub node_id: String,
    pub epoch: u64,
    pub queue: Arc<CommandQueue>,
    /// Cancelled when a newer stream supersedes this one
    pub superseded: CancellationToken,
}

/// The shared in-memory fleet state
pub struct Fleet {
    nodes: DashMap<String, NodeEntry>,
    pending_results: DashMap<String, oneshot::Sender<CommandResult>>,
    config: FleetConfig,
    epoch: AtomicU64,
}

impl Fleet {
    pub fn new(config: FleetConfig) -> Self {
        Self {
            nodes: DashMap::new(),
            pending_results: DashMap::new(),
            config,
            epoch: AtomicU64::new(0),
        }
    }

    pub fn config(&self) -> &FleetConfig {
        &self.config
    }

    /// Register a node, creating or refreshing its record.
    ///
    /// Re-registration adopts the new request's capabilities and identity
    /// fields, clears `stream_active`, and retains any pending commands so
    /// the next stream delivers them.
    pub fn register(&self, req: &RegisterRequest) -> RegisterResponse {
        if !validate_node_id(&req.node_id) {
            return RegisterResponse::rejected(format!(
                "node_id '{}' violates identity policy",
                req.node_id
            ));
        }

        let reserved = self.config.reserved_node_ids.contains(&req.node_id);
        let overridden = req.labels.get("override").map(String::as_str) == Some("true");
        if reserved && !overridden {
            warn!(node_id = %req.node_id, "rejecting registration for reserved identity");
            return RegisterResponse::rejected(format!(
                "node_id '{}' is reserved; supply the override label to claim it",
                req.node_id
            ));
        }

        match self.nodes.get_mut(&req.node_id) {
            Some(mut entry) => {
                let registered_at = entry.record.registered_at;
                if let Some(session) = entry.session.take() {
                    session.cancel.cancel();
                }
                entry.record = NodeRecord::from_request(req);
                entry.record.registered_at = registered_at;
                info!(node_id = %req.node_id, pending = entry.queue.len(), "node re-registered");
            }
            None => {
                self.nodes.insert(
                    req.node_id.clone(),
                    NodeEntry {
                        record: NodeRecord::from_request(req),
                        queue: Arc::new(CommandQueue::new(self.config.command_queue_capacity)),
                        session: None,
                    },
                );
                info!(node_id = %req.node_id, node_type = %req.node_type, "node registered");
            }
        }

        RegisterResponse::accepted(
            req.node_id.clone(),
            self.config.heartbeat_interval_sec,
            self.config.status_interval_sec,
        )
    }

    pub fn heartbeat(&self, node_id: &str) -> Result<HeartbeatResponse, FleetError> {
        let mut entry = self
            .nodes
            .get_mut(node_id)
            .ok_or_else(|| FleetError::NodeNotFound(node_id.to_string()))?;
        entry.record.last_heartbeat = Some(Utc::now());
        Ok(HeartbeatResponse {
            ok: true,
            server_time: Utc::now(),
        })
    }

    /// Store the latest status snapshot and advance the logical clock.
    ///
    /// A decrease in the backend request counter means the agent restarted;
    /// the stored snapshot is replaced wholesale either way, the restart is
    /// just logged so derived dashboards know counters reset.
    pub fn update_status(&self, node_id: &str, status: NodeStatus) -> Result<(), FleetError> {
        let mut entry = self
            .nodes
            .get_mut(node_id)
            .ok_or_else(|| FleetError::NodeNotFound(node_id.to_string()))?;

        if let (Some(prev), Some(next)) = (
            entry.record.last_status.as_ref().and_then(|s| s.backend.as_ref()),
            status.backend.as_ref(),
        ) {
            if next.request_count < prev.request_count {
                info!(
                    node_id,
                    previous = prev.request_count,
                    current = next.request_count,
                    "backend counters decreased, treating as agent restart"
                );
            }
        }

        entry.record.status_seq += 1;
        entry.record.last_status = Some(status);
        Ok(())
    }

    /// Enqueue a command for delivery over the node's stream
    pub fn send_command(&self, node_id: &str, command: Command) -> Result<(), FleetError> {
        let entry = self
            .nodes
            .get(node_id)
            .ok_or_else(|| FleetError::NodeNotFound(node_id.to_string()))?;
        if !entry.record.stream_active {
            return Err(FleetError::NodeDisconnected(node_id.to_string()));
        }
        debug!(node_id, command_id = %command.command_id, kind = %command.kind, "command enqueued");
        entry
            .queue
            .push(node_id, ControlMessage::Command(command));
        Ok(())
    }

    /// Push a config update onto the node's queue
    pub fn send_config_update(
        &self,
        node_id: &str,
        update: crate::proto::ConfigUpdate,
    ) -> Result<(), FleetError> {
        let entry = self
            .nodes
            .get(node_id)
            .ok_or_else(|| FleetError::NodeNotFound(node_id.to_string()))?;
        if !entry.record.stream_active {
            return Err(FleetError::NodeDisconnected(node_id.to_string()));
        }
        entry
            .queue
            .push(node_id, ControlMessage::ConfigUpdate(update));
        Ok(())
    }

    /// Send a command and await its correlated result within `deadline`.
    ///
    /// The fleet itself keeps no command timers; deadline enforcement lives
    /// with the issuer, and this helper is that issuer-side correlation.
    pub async fn dispatch(
        &self,
        node_id: &str,
        command: Command,
        deadline: Duration,
    ) -> Result<CommandResult, FleetError> {
        let command_id = command.command_id.clone();
        let (tx, rx) = oneshot::channel();
        self.pending_results.insert(command_id.clone(), tx);

        if let Err(e) = self.send_command(node_id, command) {
            self.pending_results.remove(&command_id);
            return Err(e);
        }

        match tokio::time::timeout(deadline, rx).await {
            Ok(Ok(result)) => Ok(result),
            Ok(Err(_)) => {
                self.pending_results.remove(&command_id);
                Err(FleetError::ResultChannelClosed(command_id))
            }
            Err(_) => {
                self.pending_results.remove(&command_id);
                Err(FleetError::CommandTimeout {
                    node_id: node_id.to_string(),
                    command_id,
                })
            }
        }
    }

    /// Route an incoming result to its waiting issuer, if any
    pub fn complete_result(&self, result: CommandResult) {
        match self.pending_results.remove(&result.command_id) {
            Some((_, tx)) => {
                let _ = tx.send(result);
            }
            None => {
                debug!(command_id = %result.command_id, success = result.success,
                    "command result with no waiting issuer");
            }
        }
    }

    /// Associate a new stream with a node, superseding any existing one.
    ///
    /// The previous session's cancellation token fires so its socket task
    /// can close with the deterministic "superseded" reason. Pending
    /// commands stay queued and are delivered FIFO on the new stream.
    pub fn open_stream(&self, node_id: &str) -> Result<StreamHandle, FleetError> {
        let mut entry = self
            .nodes
            .get_mut(node_id)
            .ok_or_else(|| FleetError::NodeNotFound(node_id.to_string()))?;

        if let Some(old) = entry.session.take() {
            info!(node_id, old_epoch = old.epoch, "stream superseded by new connection");
            old.cancel.cancel();
        }

        let epoch = self.epoch.fetch_add(1, Ordering::SeqCst) + 1;
        let cancel = CancellationToken::new();
        entry.session = Some(StreamSession {
            epoch,
            cancel: cancel.clone(),
        });
        entry.record.stream_active = true;

        Ok(StreamHandle {
            node_id: node_id.to_string(),
            epoch,
            queue: entry.queue.clone(),
            superseded: cancel,
        })
    }

    /// Record the end of a stream. Only the owning epoch may clear the
    /// active flag; a superseded stream closing late must not clobber the
    /// session that replaced it.
    pub fn close_stream(&self, node_id: &str, epoch: u64) {
        if let Some(mut entry) = self.nodes.get_mut(node_id) {
            let owns = entry.session.as_ref().map(|s| s.epoch) == Some(epoch);
            if owns {
                entry.session = None;
                entry.record.stream_active = false;
                info!(node_id, epoch, "stream closed");
            }
        }
    }

    /// Mark nodes disconnected after the TTL without a heartbeat.
    /// Records are kept for operator visibility; re-registration revives.
    pub fn expire_stale(&self) {
        let ttl = self.config.node_ttl();
        for mut entry in self.nodes.iter_mut() {
            if entry.record.stream_active && entry.record.is_stale(ttl) {
                warn!(node_id = %entry.record.node_id, "node missed heartbeats, marking disconnected");
                if let Some(session) = entry.session.take() {
                    session.cancel.cancel();
                }
                entry.record.stream_active = false;
            }
        }
    }

    pub fn get_node(&self, node_id: &str) -> Option<NodeRecord> {
        self.nodes.get(node_id).map(|e| e.record.clone())
    }

    pub fn list_nodes(&self) -> Vec<NodeRecord> {
        self.nodes.iter().map(|e| e.record.clone()).collect()
    }

    pub fn pending_commands(&self, node_id: &str) -> usize {
        self.nodes.get(node_id).map(|e| e.queue.len()).unwrap_or(0)
    }

    pub fn fleet_status(&self) -> FleetStatusResponse {
        let mut nodes: Vec<NodeSummary> = self
            .nodes
            .iter()
            .map(|e| NodeSummary {
                node_id: e.record.node_id.clone(),
                node_type: e.record.node_type,
                instance_id: e.record.instance_id.clone(),
                mesh_ip: e.record.mesh_ip.clone(),
                public_ip: e.record.public_ip.clone(),
                region: e.record.region.clone(),
                zone: e.record.zone.clone(),
                stream_active: e.record.stream_active,
                last_heartbeat: e.record.last_heartbeat,
                pending_commands: e.queue.len(),
                capabilities: e.record.capabilities.clone(),
                status: e.record.last_status.clone(),
            })
            .collect();
        nodes.sort_by(|a, b| a.node_id.cmp(&b.node_id));

        FleetStatusResponse {
            nodes_total: nodes.len(),
            nodes_connected: nodes.iter().filter(|n| n.stream_active).count(),
            nodes,
            generated_at: Utc::now(),
        }
    }
}

/// Spawn the TTL sweeper that marks silent nodes disconnected
pub fn spawn_ttl_sweeper(fleet: Arc<Fleet>, shutdown: CancellationToken) {
    let period = Duration::from_secs(fleet.config.heartbeat_interval_sec.max(1));
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        loop {
            tokio::select! {
                _ = ticker.tick() => fleet.expire_stale(),
                _ = shutdown.cancelled() => break,
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proto::CommandKind;

    fn request(id: &str) -> RegisterRequest {
        RegisterRequest {
            node_id: id.to_string(),
            node_type: NodeType::GpuWorker,
            instance_id: Some("i-123".to_string()),
            mesh_ip: None,
            public_ip: Some("203.0.113.5".to_string()),
            private_ip: None,
            region: Some("us-east-1".to_string()),
            zone: Some("us-east-1a".to_string()),
            capabilities: NodeCapabilities::with_gpu(1, "RTX 4090"),
            labels: Default::default(),
        }
    }

    fn fleet() -> Fleet {
        Fleet::new(FleetConfig::default())
    }

    #[test]
    fn test_register_creates_record() {
        let fleet = fleet();
        let resp = fleet.register(&request("gpu-1"));
        assert!(resp.accepted);
        assert_eq!(resp.assigned_id.as_deref(), Some("gpu-1"));

        let node = fleet.get_node("gpu-1").unwrap();
        assert_eq!(node.capabilities.gpu_count, 1);
        assert!(!node.stream_active);
    }

    #[test]
    fn test_register_twice_keeps_one_record_with_new_capabilities() {
        let fleet = fleet();
        fleet.register(&request("gpu-1"));

        let mut second = request("gpu-1");
        second.capabilities = NodeCapabilities::with_gpu(4, "H100");
        fleet.register(&second);

        assert_eq!(fleet.list_nodes().len(), 1);
        let node = fleet.get_node("gpu-1").unwrap();
        assert_eq!(node.capabilities.gpu_count, 4);
        assert_eq!(node.capabilities.gpu_model.as_deref(), Some("H100"));
    }

    #[test]
    fn test_register_rejects_bad_id() {
        let fleet = fleet();
        let mut req = request("gpu-1");
        req.node_id = "bad id".to_string();
        assert!(!fleet.register(&req).accepted);
    }

    #[test]
    fn test_register_rejects_reserved_identity_without_override() {
        let fleet = Fleet::new(FleetConfig {
            reserved_node_ids: vec!["cloud".to_string()],
            ..Default::default()
        });

        assert!(!fleet.register(&request("cloud")).accepted);

        let mut with_override = request("cloud");
        with_override
            .labels
            .insert("override".to_string(), "true".to_string());
        assert!(fleet.register(&with_override).accepted);
    }

    #[test]
    fn test_send_command_requires_stream() {
        let fleet = fleet();
        let cmd = Command::new(CommandKind::HealthCheck, serde_json::Value::Null);

        assert!(matches!(
            fleet.send_command("ghost", cmd.clone()),
            Err(FleetError::NodeNotFound(_))
        ));

        fleet.register(&request("gpu-1"));
        assert!(matches!(
            fleet.send_command("gpu-1", cmd),
            Err(FleetError::NodeDisconnected(_))
        ));
    }

    #[test]
    fn test_open_stream_supersedes_and_retains_queue() {
        let fleet = fleet();
        fleet.register(&request("gpu-1"));

        let first = fleet.open_stream("gpu-1").unwrap();
        assert!(!first.superseded.is_cancelled());

        // Enqueue while the first stream is nominally active
        fleet
            .send_command(
                "gpu-1",
                Command::new(CommandKind::LoadModel, serde_json::json!({"model": "m"})),
            )
            .unwrap();

        let second = fleet.open_stream("gpu-1").unwrap();
        assert!(first.superseded.is_cancelled());
        assert!(!second.superseded.is_cancelled());
        assert!(second.epoch > first.epoch);

        // Pending command survives for the new stream
        assert_eq!(second.queue.len(), 1);

        // The superseded stream closing late must not clear the new session
        fleet.close_stream("gpu-1", first.epoch);
        assert!(fleet.get_node("gpu-1").unwrap().stream_active);

        fleet.close_stream("gpu-1", second.epoch);
        assert!(!fleet.get_node("gpu-1").unwrap().stream_active);
    }

    #[test]
    fn test_status_update_advances_logical_clock() {
        let fleet = fleet();
        fleet.register(&request("gpu-1"));

        let status = sample_status();
        fleet.update_status("gpu-1", status.clone()).unwrap();
        fleet.update_status("gpu-1", status).unwrap();

        let node = fleet.get_node("gpu-1").unwrap();
        assert_eq!(node.status_seq, 2);
        assert!(node.last_status.is_some());
    }

    #[test]
    fn test_expire_stale_marks_disconnected_but_keeps_record() {
        let fleet = Fleet::new(FleetConfig {
            heartbeat_interval_sec: 1,
            ..Default::default()
        });
        fleet.register(&request("gpu-1"));
        let _stream = fleet.open_stream("gpu-1").unwrap();

        // Age the heartbeat past 5x the interval
        {
            let mut entry = fleet.nodes.get_mut("gpu-1").unwrap();
            entry.record.last_heartbeat =
                Some(Utc::now() - chrono::Duration::seconds(10));
        }
        fleet.expire_stale();

        let node = fleet.get_node("gpu-1").unwrap();
        assert!(!node.stream_active);
        assert_eq!(fleet.list_nodes().len(), 1);

        // A follow-up register re-activates
        assert!(fleet.register(&request("gpu-1")).accepted);
    }

    #[test]
    fn test_config_update_is_queued_for_delivery() {
        let fleet = fleet();
        fleet.register(&request("gpu-1"));
        let stream = fleet.open_stream("gpu-1").unwrap();

        fleet
            .send_config_update(
                "gpu-1",
                crate::proto::ConfigUpdate {
                    status_interval_sec: Some(10),
                    heartbeat_interval_sec: None,
                },
            )
            .unwrap();

        match stream.queue.try_pop().unwrap() {
            ControlMessage::ConfigUpdate(update) => {
                assert_eq!(update.status_interval_sec, Some(10));
            }
            other => panic!("expected config update, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_dispatch_times_out_without_result() {
        let fleet = fleet();
        fleet.register(&request("gpu-1"));
        let _stream = fleet.open_stream("gpu-1").unwrap();

        let cmd = Command::new(CommandKind::HealthCheck, serde_json::Value::Null);
        let err = fleet
            .dispatch("gpu-1", cmd, Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(matches!(err, FleetError::CommandTimeout { .. }));
    }

    #[tokio::test]
    async fn test_dispatch_receives_correlated_result() {
        let fleet = Arc::new(fleet());
        fleet.register(&request("gpu-1"));
        let stream = fleet.open_stream("gpu-1").unwrap();

        let cmd = Command::new(CommandKind::ExecShell, serde_json::json!({"command": "true"}));
        let command_id = cmd.command_id.clone();

        let responder = {
            let fleet = fleet.clone();
            tokio::spawn(async move {
                // Act as the stream: take the command, return a result
                let msg = stream.queue.pop().await;
                let ControlMessage::Command(c) = msg else {
                    panic!("expected command");
                };
                fleet.complete_result(CommandResult {
                    command_id: c.command_id,
                    success: true,
                    exit_code: Some(0),
                    stdout: Some("ok".to_string()),
                    stderr: None,
                    duration_ms: 3,
                    error: None,
                });
            })
        };

        let result = fleet
            .dispatch("gpu-1", cmd, Duration::from_secs(2))
            .await
            .unwrap();
        assert!(result.success);
        assert_eq!(result.command_id, command_id);
        responder.await.unwrap();
    }

    fn sample_status() -> NodeStatus {
        NodeStatus {
            hostname: "host".to_string(),
            node_type: NodeType::GpuWorker,
            uptime_secs: 10,
            cpu_percent: 1.0,
            memory_used_bytes: 1,
            memory_total_bytes: 2,
            disk_used_bytes: 1,
            disk_total_bytes: 2,
            network_rx_bytes: 0,
            network_tx_bytes: 0,
            has_gpu: false,
            gpus: vec![],
            backend: None,
            broker_connected: None,
            collected_at: Utc::now(),
        }
    }
}
