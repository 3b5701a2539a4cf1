//! Node identity autodetection
//!
//! Fills in whatever the operator did not supply on the command line:
//! instance id, public/private IP and placement from EC2-style instance
//! metadata (1s timeout, absent outside the cloud), hostname as the final
//! fallback for the node id.

use std::time::Duration;

use reqwest::Client;
use tracing::debug;

use crate::config::AgentConfig;

/// Default instance metadata service endpoint
const METADATA_BASE: &str = "http://169.254.169.254/latest/meta-data";

/// Timeout per metadata lookup; the service either answers instantly or
/// does not exist on this machine
const METADATA_TIMEOUT: Duration = Duration::from_secs(1);

/// Resolved identity of this node
#[derive(Debug, Clone)]
pub struct NodeIdentity {
    pub node_id: String,
    pub instance_id: Option<String>,
    pub public_ip: Option<String>,
    pub private_ip: Option<String>,
    pub mesh_ip: Option<String>,
    pub region: Option<String>,
    pub zone: Option<String>,
}

/// Lookup client, endpoint injectable for tests
pub struct MetadataClient {
    base: String,
    http: Client,
}

impl MetadataClient {
    pub fn new() -> Self {
        Self::with_base(METADATA_BASE)
    }

    pub fn with_base(base: impl Into<String>) -> Self {
        Self {
            base: base.into(),
            http: Client::new(),
        }
    }

    async fn get(&self, path: &str) -> Option<String> {
        let url = format!("{}/{}", self.base, path);
        let response = self
            .http
            .get(&url)
            .timeout(METADATA_TIMEOUT)
            .send()
            .await
            .ok()?;
        if !response.status().is_success() {
            return None;
        }
        let text = response.text().await.ok()?;
        let trimmed = text.trim().to_string();
        (!trimmed.is_empty()).then_some(trimmed)
    }

    pub async fn instance_id(&self) -> Option<String> {
        self.get("instance-id").await
    }

    pub async fn public_ip(&self) -> Option<String> {
        self.get("public-ipv4").await
    }

    pub async fn private_ip(&self) -> Option<String> {
        self.get("local-ipv4").await
    }

    pub async fn zone(&self) -> Option<String> {
        self.get("placement/availability-zone").await
    }
}

impl Default for MetadataClient {
    fn default() -> Self {
        Self::new()
    }
}

/// Derive the region from an availability zone ("us-east-1a" -> "us-east-1")
pub fn region_from_zone(zone: &str) -> Option<String> {
    let stripped = zone.trim_end_matches(|c: char| c.is_ascii_alphabetic());
    (!stripped.is_empty() && stripped != zone).then(|| stripped.to_string())
}

pub fn local_hostname() -> String {
    hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "unknown".to_string())
}

/// Resolve this node's identity: CLI flags win, then instance metadata,
/// then the hostname
pub async fn detect(config: &AgentConfig, metadata: &MetadataClient) -> NodeIdentity {
    let instance_id = match &config.instance_id {
        Some(id) => Some(id.clone()),
        None => metadata.instance_id().await,
    };
    let public_ip = match &config.public_ip {
        Some(ip) => Some(ip.clone()),
        None => metadata.public_ip().await,
    };
    let private_ip = metadata.private_ip().await;
    let zone = match &config.zone {
        Some(z) => Some(z.clone()),
        None => metadata.zone().await,
    };
    let region = match &config.region {
        Some(r) => Some(r.clone()),
        None => zone.as_deref().and_then(region_from_zone),
    };

    let node_id = config
        .node_id
        .clone()
        .or_else(|| instance_id.clone())
        .unwrap_or_else(local_hostname);

    debug!(
        node_id,
        ?instance_id,
        ?public_ip,
        ?zone,
        "node identity resolved"
    );

    NodeIdentity {
        node_id,
        instance_id,
        public_ip,
        private_ip,
        mesh_ip: config.mesh_ip.clone(),
        region,
        zone,
    }
}
