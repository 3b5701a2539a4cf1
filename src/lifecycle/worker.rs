//! Worker variants managed by the lifecycle engine
//!
//! Three kinds of worker exist: the always-on local backend, a cloud
//! instance reachable over its public interface (and optionally the mesh),
//! and a mesh-only worker that has no public address at all. The engine
//! dispatches through [`Worker`] and never touches a variant directly.

use std::sync::Arc;

use super::provisioner::{InstanceState, Provisioner, ProvisionerError};
use crate::config::{CloudWorkerConfig, LocalWorkerConfig, MeshWorkerConfig};
use crate::scaler::routing::RoutingMode;

/// Always-on backend on a named URL; no provisioner, never cold-started
pub struct LocalWorker {
    pub name: String,
    pub url: String,
}

/// Cloud VM with external start/stop; preferred over the mesh when both
/// interfaces are configured and reachable
pub struct RemoteInstanceWorker {
    pub name: String,
    pub public_url: String,
    pub mesh_url: Option<String>,
    pub instance_id: Option<String>,
    pub region: Option<String>,
    pub zone: Option<String>,
    pub provisioner: Arc<dyn Provisioner>,
}

/// Worker reachable only via the overlay network
pub struct MeshWorker {
    pub name: String,
    pub mesh_url: String,
    pub instance_id: Option<String>,
    pub provisioner: Arc<dyn Provisioner>,
}

pub enum Worker {
    Local(LocalWorker),
    RemoteInstance(RemoteInstanceWorker),
    Mesh(MeshWorker),
}

impl Worker {
    pub fn local(config: &LocalWorkerConfig) -> Self {
        Self::Local(LocalWorker {
            name: config.name.clone(),
            url: config.url.clone(),
        })
    }

    pub fn remote_instance(config: &CloudWorkerConfig, provisioner: Arc<dyn Provisioner>) -> Self {
        Self::RemoteInstance(RemoteInstanceWorker {
            name: config.name.clone(),
            public_url: config.public_url.clone(),
            mesh_url: config.mesh_url.clone(),
            instance_id: config.instance_id.clone(),
            region: config.region.clone(),
            zone: config.zone.clone(),
            provisioner,
        })
    }

    pub fn mesh(config: &MeshWorkerConfig, provisioner: Arc<dyn Provisioner>) -> Self {
        Self::Mesh(MeshWorker {
            name: config.name.clone(),
            mesh_url: config.mesh_url.clone(),
            instance_id: config.instance_id.clone(),
            provisioner,
        })
    }

    pub fn name(&self) -> &str {
        match self {
            Self::Local(w) => &w.name,
            Self::RemoteInstance(w) => &w.name,
            Self::Mesh(w) => &w.name,
        }
    }

    pub fn is_local(&self) -> bool {
        matches!(self, Self::Local(_))
    }

    /// Whether this worker may be started on demand
    pub fn can_cold_start(&self) -> bool {
        !self.is_local()
    }

    /// Candidate backend URLs in preference order (mesh before public)
    pub fn reachable_urls(&self) -> Vec<&str> {
        match self {
            Self::Local(w) => vec![w.url.as_str()],
            Self::RemoteInstance(w) => {
                let mut urls = Vec::with_capacity(2);
                if let Some(mesh) = &w.mesh_url {
                    urls.push(mesh.as_str());
                }
                urls.push(w.public_url.as_str());
                urls
            }
            Self::Mesh(w) => vec![w.mesh_url.as_str()],
        }
    }

    /// URL the given routing mode pins this worker to, if any
    pub fn url_for_mode(&self, mode: RoutingMode) -> Option<&str> {
        match (self, mode) {
            (Self::Local(w), RoutingMode::Local | RoutingMode::Auto) => Some(w.url.as_str()),
            (Self::RemoteInstance(w), RoutingMode::Remote) => Some(w.public_url.as_str()),
            (Self::RemoteInstance(w), RoutingMode::Mesh) => w.mesh_url.as_deref(),
            (Self::RemoteInstance(_), RoutingMode::Auto) => None,
            (Self::Mesh(w), RoutingMode::Mesh | RoutingMode::Auto) => Some(w.mesh_url.as_str()),
            _ => None,
        }
    }

    pub fn instance_id(&self) -> Option<&str> {
        match self {
            Self::Local(_) => None,
            Self::RemoteInstance(w) => w.instance_id.as_deref(),
            Self::Mesh(w) => w.instance_id.as_deref(),
        }
    }

    pub fn region(&self) -> Option<&str> {
        match self {
            Self::RemoteInstance(w) => w.region.as_deref(),
            _ => None,
        }
    }

    pub fn zone(&self) -> Option<&str> {
        match self {
            Self::RemoteInstance(w) => w.zone.as_deref(),
            _ => None,
        }
    }

    /// Issue the provisioner start. A local worker is always on; starting
    /// it is a no-op.
    pub async fn start(&self) -> Result<(), ProvisionerError> {
        match self {
            Self::Local(_) => Ok(()),
            Self::RemoteInstance(w) => w.provisioner.start().await,
            Self::Mesh(w) => w.provisioner.start().await,
        }
    }

    /// Issue the provisioner stop; no-op for the local worker
    pub async fn stop(&self) -> Result<(), ProvisionerError> {
        match self {
            Self::Local(_) => Ok(()),
            Self::RemoteInstance(w) => w.provisioner.stop().await,
            Self::Mesh(w) => w.provisioner.stop().await,
        }
    }

    /// Instance-level state from the cloud API. The local machine is by
    /// definition on; only its backend can be down.
    pub async fn query_state(&self) -> Result<InstanceState, ProvisionerError> {
        match self {
            Self::Local(_) => Ok(InstanceState::Running),
            Self::RemoteInstance(w) => w.provisioner.describe().await,
            Self::Mesh(w) => w.provisioner.describe().await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lifecycle::provisioner::mock::MockProvisioner;

    fn remote(mesh: Option<&str>) -> Worker {
        Worker::RemoteInstance(RemoteInstanceWorker {
            name: "burst-1".to_string(),
            public_url: "http://203.0.113.10:11434".to_string(),
            mesh_url: mesh.map(str::to_string),
            instance_id: Some("i-0abc".to_string()),
            region: Some("us-east-1".to_string()),
            zone: None,
            provisioner: Arc::new(MockProvisioner::new(InstanceState::Stopped)),
        })
    }

    #[test]
    fn test_reachable_urls_prefer_mesh() {
        let worker = remote(Some("http://100.64.0.9:11434"));
        assert_eq!(
            worker.reachable_urls(),
            vec!["http://100.64.0.9:11434", "http://203.0.113.10:11434"]
        );

        let no_mesh = remote(None);
        assert_eq!(no_mesh.reachable_urls(), vec!["http://203.0.113.10:11434"]);
    }

    #[test]
    fn test_url_for_mode() {
        let worker = remote(Some("http://100.64.0.9:11434"));
        assert_eq!(
            worker.url_for_mode(RoutingMode::Remote),
            Some("http://203.0.113.10:11434")
        );
        assert_eq!(
            worker.url_for_mode(RoutingMode::Mesh),
            Some("http://100.64.0.9:11434")
        );
        assert_eq!(worker.url_for_mode(RoutingMode::Local), None);

        let local = Worker::local(&LocalWorkerConfig {
            name: "local".to_string(),
            url: "http://127.0.0.1:11434".to_string(),
        });
        assert_eq!(
            local.url_for_mode(RoutingMode::Local),
            Some("http://127.0.0.1:11434")
        );
        assert_eq!(local.url_for_mode(RoutingMode::Remote), None);
    }

    #[test]
    fn test_local_cannot_cold_start() {
        let local = Worker::local(&LocalWorkerConfig {
            name: "local".to_string(),
            url: "http://127.0.0.1:11434".to_string(),
        });
        assert!(!local.can_cold_start());
        assert!(remote(None).can_cold_start());
    }

    fn mesh_worker() -> Worker {
        Worker::mesh(
            &MeshWorkerConfig {
                name: "relay-1".to_string(),
                mesh_url: "http://100.64.0.17:11434".to_string(),
                instance_id: Some("i-0mesh".to_string()),
                provisioner: crate::config::ProvisionerConfig {
                    start_cmd: String::new(),
                    stop_cmd: String::new(),
                    status_cmd: String::new(),
                },
            },
            Arc::new(MockProvisioner::new(InstanceState::Stopped)),
        )
    }

    #[test]
    fn test_mesh_worker_has_only_the_overlay_interface() {
        let worker = mesh_worker();
        assert_eq!(worker.name(), "relay-1");
        assert!(worker.can_cold_start());
        assert_eq!(worker.reachable_urls(), vec!["http://100.64.0.17:11434"]);
        assert_eq!(worker.instance_id(), Some("i-0mesh"));

        // Reachable via the overlay only; remote and local modes cannot
        // pin it
        assert_eq!(
            worker.url_for_mode(RoutingMode::Mesh),
            Some("http://100.64.0.17:11434")
        );
        assert_eq!(
            worker.url_for_mode(RoutingMode::Auto),
            Some("http://100.64.0.17:11434")
        );
        assert_eq!(worker.url_for_mode(RoutingMode::Remote), None);
        assert_eq!(worker.url_for_mode(RoutingMode::Local), None);
    }

    #[tokio::test]
    async fn test_mesh_worker_drives_its_provisioner() {
        let provisioner = Arc::new(MockProvisioner::new(InstanceState::Stopped));
        let worker = Worker::Mesh(MeshWorker {
            name: "relay-1".to_string(),
            mesh_url: "http://100.64.0.17:11434".to_string(),
            instance_id: None,
            provisioner: provisioner.clone(),
        });

        assert_eq!(worker.query_state().await.unwrap(), InstanceState::Stopped);
        worker.start().await.unwrap();
        assert_eq!(provisioner.start_calls(), 1);
        assert_eq!(worker.query_state().await.unwrap(), InstanceState::Running);
        worker.stop().await.unwrap();
        assert_eq!(worker.query_state().await.unwrap(), InstanceState::Stopped);
    }

    #[tokio::test]
    async fn test_local_query_state_always_running() {
        let local = Worker::local(&LocalWorkerConfig {
            name: "local".to_string(),
            url: "http://127.0.0.1:11434".to_string(),
        });
        assert_eq!(local.query_state().await.unwrap(), InstanceState::Running);
        assert!(local.start().await.is_ok());
        assert!(local.stop().await.is_ok());
    }
}
