//! Scaler configuration
//!
//! The scaler is configured from a YAML file (kubeconfig-style), with CLI
//! flags overriding the listen addresses. Validation happens once at boot;
//! a malformed config is fatal.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Default port the proxy front door listens on
pub const PROXY_PORT: u16 = 8080;

/// Default port the fleet control plane listens on
pub const FLEET_PORT: u16 = 8181;

/// Reserved path prefix for control endpoints; never proxied
pub const CONTROL_PREFIX: &str = "/_";

/// Default heartbeat interval recommended to agents, seconds
pub const HEARTBEAT_INTERVAL_SECS: u64 = 60;

/// Default status interval recommended to agents, seconds
pub const STATUS_INTERVAL_SECS: u64 = 30;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file {0}: {1}")]
    Read(PathBuf, std::io::Error),

    #[error("failed to parse config file {0}: {1}")]
    Parse(PathBuf, serde_yaml::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Top-level scaler configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScalerConfig {
    /// Address both listeners bind to
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,

    #[serde(default = "default_proxy_port")]
    pub proxy_port: u16,

    #[serde(default = "default_fleet_port")]
    pub fleet_port: u16,

    /// Seconds without an admitted request before the cloud worker is stopped
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_secs: u64,

    /// How long a request may block waiting for a cold start
    #[serde(default = "default_cold_start_deadline")]
    pub cold_start_deadline_secs: u64,

    /// Freshness window for the readiness probe backing `running`
    #[serde(default = "default_readiness_ttl")]
    pub readiness_ttl_secs: u64,

    /// Path probed on worker backends; ready iff 2xx with a "models" key
    #[serde(default = "default_readiness_path")]
    pub readiness_path: String,

    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_sec: u64,

    #[serde(default = "default_status_interval")]
    pub status_interval_sec: u64,

    /// Grace period for draining in-flight requests on shutdown
    #[serde(default = "default_shutdown_grace")]
    pub shutdown_grace_secs: u64,

    pub workers: WorkersConfig,
}

/// The worker topology the scaler manages: an always-on local backend, a
/// cloud worker started and stopped on demand, and optionally a mesh-only
/// worker that has no public address at all.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkersConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub local: Option<LocalWorkerConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub cloud: Option<CloudWorkerConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub mesh: Option<MeshWorkerConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocalWorkerConfig {
    #[serde(default = "default_local_name")]
    pub name: String,

    /// Backend URL, e.g. http://127.0.0.1:11434
    pub url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CloudWorkerConfig {
    #[serde(default = "default_cloud_name")]
    pub name: String,

    /// Backend URL over the instance's public interface
    pub public_url: String,

    /// Backend URL over the overlay network, preferred when reachable
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mesh_url: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub instance_id: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub zone: Option<String>,

    /// Commands the shell provisioner runs to drive the instance
    pub provisioner: ProvisionerConfig,
}

/// Worker reachable only over the overlay network
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MeshWorkerConfig {
    #[serde(default = "default_mesh_name")]
    pub name: String,

    /// Backend URL on the overlay network, the node's only interface
    pub mesh_url: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub instance_id: Option<String>,

    pub provisioner: ProvisionerConfig,
}

/// Shell command triplet the injectable provisioner seam executes.
/// Real cloud SDK integration plugs in here (e.g. `aws ec2 start-instances`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProvisionerConfig {
    pub start_cmd: String,
    pub stop_cmd: String,
    /// Must print one of: running, stopped, pending, stopping
    pub status_cmd: String,
}

fn default_bind_addr() -> String {
    "0.0.0.0".to_string()
}

fn default_proxy_port() -> u16 {
    PROXY_PORT
}

fn default_fleet_port() -> u16 {
    FLEET_PORT
}

fn default_idle_timeout() -> u64 {
    900
}

fn default_cold_start_deadline() -> u64 {
    180
}

fn default_readiness_ttl() -> u64 {
    30
}

fn default_readiness_path() -> String {
    "/api/tags".to_string()
}

fn default_heartbeat_interval() -> u64 {
    HEARTBEAT_INTERVAL_SECS
}

fn default_status_interval() -> u64 {
    STATUS_INTERVAL_SECS
}

fn default_shutdown_grace() -> u64 {
    30
}

fn default_local_name() -> String {
    "local".to_string()
}

fn default_cloud_name() -> String {
    "cloud".to_string()
}

fn default_mesh_name() -> String {
    "mesh".to_string()
}

impl ScalerConfig {
    /// Load and validate a config file
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::Read(path.to_path_buf(), e))?;
        let config: Self = serde_yaml::from_str(&content)
            .map_err(|e| ConfigError::Parse(path.to_path_buf(), e))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_str(content: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_yaml::from_str(content)
            .map_err(|e| ConfigError::Parse(PathBuf::from("<inline>"), e))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.workers.local.is_none()
            && self.workers.cloud.is_none()
            && self.workers.mesh.is_none()
        {
            return Err(ConfigError::Invalid(
                "at least one worker (local, cloud, or mesh) must be configured".to_string(),
            ));
        }
        if self.idle_timeout_secs == 0 {
            return Err(ConfigError::Invalid(
                "idle_timeout_secs must be greater than zero".to_string(),
            ));
        }
        if self.cold_start_deadline_secs == 0 {
            return Err(ConfigError::Invalid(
                "cold_start_deadline_secs must be greater than zero".to_string(),
            ));
        }
        if !self.readiness_path.starts_with('/') {
            return Err(ConfigError::Invalid(format!(
                "readiness_path must start with '/', got '{}'",
                self.readiness_path
            )));
        }
        for url in self.worker_urls() {
            if !url.starts_with("http://") && !url.starts_with("https://") {
                return Err(ConfigError::Invalid(format!(
                    "worker URL '{url}' must be http(s)"
                )));
            }
        }
        let names = self.reserved_node_ids();
        for (i, name) in names.iter().enumerate() {
            if names[i + 1..].contains(name) {
                return Err(ConfigError::Invalid(format!(
                    "two workers share the name '{name}'"
                )));
            }
        }
        Ok(())
    }

    fn worker_urls(&self) -> Vec<&str> {
        let mut urls = Vec::new();
        if let Some(local) = &self.workers.local {
            urls.push(local.url.as_str());
        }
        if let Some(cloud) = &self.workers.cloud {
            urls.push(cloud.public_url.as_str());
            if let Some(mesh) = &cloud.mesh_url {
                urls.push(mesh.as_str());
            }
        }
        if let Some(mesh) = &self.workers.mesh {
            urls.push(mesh.mesh_url.as_str());
        }
        urls
    }

    /// Worker names agents may not register as without an override label
    pub fn reserved_node_ids(&self) -> Vec<String> {
        let mut ids = Vec::new();
        if let Some(local) = &self.workers.local {
            ids.push(local.name.clone());
        }
        if let Some(cloud) = &self.workers.cloud {
            ids.push(cloud.name.clone());
        }
        if let Some(mesh) = &self.workers.mesh {
            ids.push(mesh.name.clone());
        }
        ids
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn cold_start_deadline(&self) -> Duration {
        Duration::from_secs(self.cold_start_deadline_secs)
    }

    pub fn readiness_ttl(&self) -> Duration {
        Duration::from_secs(self.readiness_ttl_secs)
    }
}

/// Default config file location, `~/.config/cloudburst/config.yaml`
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("cloudburst")
        .join("config.yaml")
}

// ============================================================================
// Agent configuration (assembled from CLI flags, not a file)
// ============================================================================

/// Runtime configuration of the worker agent
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Control plane address, `HOST:PORT`
    pub control_plane: String,

    pub node_id: Option<String>,

    pub node_type: crate::proto::NodeType,

    pub health_port: u16,

    pub instance_id: Option<String>,
    pub mesh_ip: Option<String>,
    pub public_ip: Option<String>,
    pub region: Option<String>,
    pub zone: Option<String>,

    /// NATS URL for the optional fire-and-forget publisher
    pub broker_url: Option<String>,

    /// Backend the agent manages on this node
    pub backend_url: String,

    /// Shell commands for backend control; absent kinds report failure
    pub backend_start_cmd: Option<String>,
    pub backend_stop_cmd: Option<String>,

    pub reconnect_delay: Duration,
    pub reconnect_delay_max: Duration,

    pub labels: HashMap<String, String>,
}

impl AgentConfig {
    pub fn new(control_plane: impl Into<String>) -> Self {
        Self {
            control_plane: control_plane.into(),
            node_id: None,
            node_type: crate::proto::NodeType::GpuWorker,
            health_port: 9090,
            instance_id: None,
            mesh_ip: None,
            public_ip: None,
            region: None,
            zone: None,
            broker_url: None,
            backend_url: "http://127.0.0.1:11434".to_string(),
            backend_start_cmd: None,
            backend_stop_cmd: None,
            reconnect_delay: Duration::from_secs(5),
            reconnect_delay_max: Duration::from_secs(60),
            labels: HashMap::new(),
        }
    }

    pub fn register_url(&self) -> String {
        format!("http://{}/v1/register", self.control_plane)
    }

    pub fn heartbeat_url(&self) -> String {
        format!("http://{}/v1/heartbeat", self.control_plane)
    }

    pub fn connect_url(&self, node_id: &str) -> String {
        format!("ws://{}/v1/connect?node_id={}", self.control_plane, node_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
workers:
  local:
    url: http://127.0.0.1:11434
"#;

    const FULL: &str = r#"
bind_addr: 127.0.0.1
proxy_port: 9080
idle_timeout_secs: 60
workers:
  local:
    name: basement
    url: http://127.0.0.1:11434
  cloud:
    name: burst-1
    public_url: http://203.0.113.10:11434
    mesh_url: http://100.64.0.9:11434
    instance_id: i-0abc123
    region: us-east-1
    zone: us-east-1a
    provisioner:
      start_cmd: "aws ec2 start-instances --instance-ids i-0abc123"
      stop_cmd: "aws ec2 stop-instances --instance-ids i-0abc123"
      status_cmd: "instance-state i-0abc123"
"#;

    #[test]
    fn test_minimal_config_defaults() {
        let config = ScalerConfig::from_str(MINIMAL).unwrap();
        assert_eq!(config.proxy_port, PROXY_PORT);
        assert_eq!(config.fleet_port, FLEET_PORT);
        assert_eq!(config.idle_timeout_secs, 900);
        assert_eq!(config.readiness_path, "/api/tags");
        assert_eq!(config.workers.local.unwrap().name, "local");
        assert!(config.workers.cloud.is_none());
    }

    #[test]
    fn test_full_config() {
        let config = ScalerConfig::from_str(FULL).unwrap();
        assert_eq!(config.proxy_port, 9080);
        assert_eq!(config.idle_timeout_secs, 60);
        let cloud = config.workers.cloud.as_ref().unwrap();
        assert_eq!(cloud.name, "burst-1");
        assert_eq!(cloud.mesh_url.as_deref(), Some("http://100.64.0.9:11434"));
        assert_eq!(
            config.reserved_node_ids(),
            vec!["basement".to_string(), "burst-1".to_string()]
        );
    }

    #[test]
    fn test_mesh_worker_config() {
        let yaml = r#"
workers:
  local:
    name: basement
    url: http://127.0.0.1:11434
  mesh:
    name: relay-1
    mesh_url: http://100.64.0.17:11434
    instance_id: i-0mesh
    provisioner:
      start_cmd: "true"
      stop_cmd: "true"
      status_cmd: "echo stopped"
"#;
        let config = ScalerConfig::from_str(yaml).unwrap();
        let mesh = config.workers.mesh.as_ref().unwrap();
        assert_eq!(mesh.name, "relay-1");
        assert_eq!(mesh.mesh_url, "http://100.64.0.17:11434");
        assert_eq!(
            config.reserved_node_ids(),
            vec!["basement".to_string(), "relay-1".to_string()]
        );
    }

    #[test]
    fn test_mesh_only_config_is_valid() {
        let yaml = r#"
workers:
  mesh:
    mesh_url: http://100.64.0.17:11434
    provisioner:
      start_cmd: "true"
      stop_cmd: "true"
      status_cmd: "echo stopped"
"#;
        let config = ScalerConfig::from_str(yaml).unwrap();
        assert_eq!(config.workers.mesh.unwrap().name, "mesh");
    }

    #[test]
    fn test_rejects_empty_workers() {
        let err = ScalerConfig::from_str("workers: {}").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)), "{err}");
    }

    #[test]
    fn test_rejects_bad_url() {
        let err =
            ScalerConfig::from_str("workers:\n  local:\n    url: ftp://example.com\n").unwrap_err();
        assert!(err.to_string().contains("http(s)"), "{err}");
    }

    #[test]
    fn test_rejects_duplicate_names() {
        let yaml = r#"
workers:
  local:
    name: same
    url: http://127.0.0.1:1
  cloud:
    name: same
    public_url: http://127.0.0.1:2
    provisioner:
      start_cmd: "true"
      stop_cmd: "true"
      status_cmd: "echo running"
"#;
        let err = ScalerConfig::from_str(yaml).unwrap_err();
        assert!(err.to_string().contains("share the name"), "{err}");
    }

    #[test]
    fn test_rejects_zero_idle_timeout() {
        let yaml = "idle_timeout_secs: 0\nworkers:\n  local:\n    url: http://127.0.0.1:1\n";
        assert!(ScalerConfig::from_str(yaml).is_err());
    }

    #[test]
    fn test_agent_urls() {
        let config = AgentConfig::new("10.0.0.1:8181");
        assert_eq!(config.register_url(), "http://10.0.0.1:8181/v1/register");
        assert_eq!(
            config.connect_url("gpu-1"),
            "ws://10.0.0.1:8181/v1/connect?node_id=gpu-1"
        );
    }
}
