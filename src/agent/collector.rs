//! Node status collection
//!
//! Samples host metrics with `sysinfo` and GPU metrics by spawning the
//! local `nvidia-smi` and parsing its CSV output. A failed GPU probe
//! reports `has_gpu = false`, never an omitted field. Backend process
//! metrics come from the backend's own HTTP API when it answers.

use std::time::{Duration, Instant};

use chrono::Utc;
use sysinfo::{Disks, Networks, System};
use tokio::process::Command;
use tracing::debug;

use crate::proto::{BackendStatus, GpuStatus, ModelState, NodeCapabilities, NodeStatus, NodeType};

/// Columns requested from nvidia-smi, in order
const NVIDIA_SMI_QUERY: &str =
    "index,utilization.gpu,memory.used,memory.total,temperature.gpu,power.draw";

const BACKEND_TIMEOUT: Duration = Duration::from_secs(3);

pub struct StatusCollector {
    system: System,
    disks: Disks,
    networks: Networks,
    started: Instant,
    node_type: NodeType,
    backend_url: String,
    http: reqwest::Client,
}

impl StatusCollector {
    pub fn new(node_type: NodeType, backend_url: impl Into<String>) -> Self {
        Self {
            system: System::new_all(),
            disks: Disks::new_with_refreshed_list(),
            networks: Networks::new_with_refreshed_list(),
            started: Instant::now(),
            node_type,
            backend_url: backend_url.into(),
            http: reqwest::Client::new(),
        }
    }

    /// Take a full snapshot for the periodic status message
    pub async fn collect(&mut self, broker_connected: Option<bool>) -> NodeStatus {
        self.system.refresh_cpu_all();
        self.system.refresh_memory();
        self.disks.refresh(true);
        self.networks.refresh(true);

        let cpu_percent = self.system.global_cpu_usage() as f64;
        let memory_total = self.system.total_memory();
        let memory_used = self.system.used_memory();

        let (disk_total, disk_used) = self
            .disks
            .iter()
            .map(|d| (d.total_space(), d.total_space() - d.available_space()))
            .fold((0u64, 0u64), |(t, u), (dt, du)| (t + dt, u + du));

        let (rx, tx) = self
            .networks
            .iter()
            .map(|(_, data)| (data.total_received(), data.total_transmitted()))
            .fold((0u64, 0u64), |(r, t), (dr, dt)| (r + dr, t + dt));

        let gpus = probe_gpus().await;
        let backend = self.probe_backend().await;

        NodeStatus {
            hostname: super::identity::local_hostname(),
            node_type: self.node_type,
            uptime_secs: self.started.elapsed().as_secs(),
            cpu_percent,
            memory_used_bytes: memory_used,
            memory_total_bytes: memory_total,
            disk_used_bytes: disk_used,
            disk_total_bytes: disk_total,
            network_rx_bytes: rx,
            network_tx_bytes: tx,
            has_gpu: !gpus.is_empty(),
            gpus,
            backend,
            broker_connected,
            collected_at: Utc::now(),
        }
    }

    /// Model list and load state from the backend, when it answers
    async fn probe_backend(&self) -> Option<BackendStatus> {
        let tags: serde_json::Value = self
            .http
            .get(format!("{}/api/tags", self.backend_url))
            .timeout(BACKEND_TIMEOUT)
            .send()
            .await
            .ok()?
            .json()
            .await
            .ok()?;

        let mut models: Vec<ModelState> = tags
            .get("models")?
            .as_array()?
            .iter()
            .filter_map(|m| m.get("name").and_then(|n| n.as_str()))
            .map(|name| ModelState {
                name: name.to_string(),
                loaded: false,
            })
            .collect();

        // Loaded models, best-effort; absent on backends without /api/ps
        if let Ok(response) = self
            .http
            .get(format!("{}/api/ps", self.backend_url))
            .timeout(BACKEND_TIMEOUT)
            .send()
            .await
        {
            if let Ok(ps) = response.json::<serde_json::Value>().await {
                let loaded: Vec<&str> = ps
                    .get("models")
                    .and_then(|m| m.as_array())
                    .map(|items| {
                        items
                            .iter()
                            .filter_map(|m| m.get("name").and_then(|n| n.as_str()))
                            .collect()
                    })
                    .unwrap_or_default();
                for model in &mut models {
                    model.loaded = loaded.contains(&model.name.as_str());
                }
            }
        }

        Some(BackendStatus {
            models,
            ..Default::default()
        })
    }
}

/// Spawn nvidia-smi once and parse its CSV output. Any failure (binary
/// missing, non-zero exit, garbled output) yields an empty list.
pub async fn probe_gpus() -> Vec<GpuStatus> {
    let output = Command::new("nvidia-smi")
        .arg(format!("--query-gpu={NVIDIA_SMI_QUERY}"))
        .arg("--format=csv,noheader,nounits")
        .output()
        .await;

    match output {
        Ok(out) if out.status.success() => {
            parse_nvidia_smi_csv(&String::from_utf8_lossy(&out.stdout))
        }
        Ok(out) => {
            debug!(code = ?out.status.code(), "nvidia-smi exited non-zero");
            Vec::new()
        }
        Err(e) => {
            debug!("nvidia-smi not available: {e}");
            Vec::new()
        }
    }
}

/// GPU capabilities for the registration request
pub async fn gpu_capabilities() -> NodeCapabilities {
    let name_output = Command::new("nvidia-smi")
        .arg("--query-gpu=name")
        .arg("--format=csv,noheader")
        .output()
        .await;

    let names: Vec<String> = match name_output {
        Ok(out) if out.status.success() => String::from_utf8_lossy(&out.stdout)
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .collect(),
        _ => Vec::new(),
    };

    if names.is_empty() {
        NodeCapabilities::default()
    } else {
        NodeCapabilities::with_gpu(names.len() as u32, names[0].clone())
    }
}

/// Parse `nvidia-smi --query-gpu --format=csv,noheader,nounits` lines;
/// rows that do not parse are skipped
pub fn parse_nvidia_smi_csv(output: &str) -> Vec<GpuStatus> {
    output
        .lines()
        .filter_map(|line| {
            let fields: Vec<&str> = line.split(',').map(str::trim).collect();
            if fields.len() != 6 {
                return None;
            }
            Some(GpuStatus {
                index: fields[0].parse().ok()?,
                utilization_percent: fields[1].parse().ok()?,
                memory_used_mib: fields[2].parse().ok()?,
                memory_total_mib: fields[3].parse().ok()?,
                temperature_c: fields[4].parse().ok()?,
                power_watts: fields[5].parse().unwrap_or(0.0),
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_single_gpu() {
        let output = "0, 87, 20313, 24576, 64, 287.45\n";
        let gpus = parse_nvidia_smi_csv(output);
        assert_eq!(gpus.len(), 1);
        assert_eq!(gpus[0].index, 0);
        assert_eq!(gpus[0].utilization_percent, 87.0);
        assert_eq!(gpus[0].memory_used_mib, 20313);
        assert_eq!(gpus[0].memory_total_mib, 24576);
        assert_eq!(gpus[0].temperature_c, 64.0);
        assert!((gpus[0].power_watts - 287.45).abs() < f64::EPSILON);
    }

    #[test]
    fn test_parse_multi_gpu() {
        let output = "0, 10, 100, 24576, 40, 80.0\n1, 95, 23000, 24576, 78, 350.2\n";
        let gpus = parse_nvidia_smi_csv(output);
        assert_eq!(gpus.len(), 2);
        assert_eq!(gpus[1].index, 1);
        assert_eq!(gpus[1].utilization_percent, 95.0);
    }

    #[test]
    fn test_parse_skips_garbage_rows() {
        let output = "0, 10, 100, 24576, 40, 80.0\nnot,a,gpu\n[N/A]\n";
        let gpus = parse_nvidia_smi_csv(output);
        assert_eq!(gpus.len(), 1);
    }

    #[test]
    fn test_parse_empty_output() {
        assert!(parse_nvidia_smi_csv("").is_empty());
    }

    #[tokio::test]
    async fn test_collect_reports_host_metrics() {
        let mut collector = StatusCollector::new(NodeType::Local, "http://127.0.0.1:9");
        let status = collector.collect(None).await;

        assert!(!status.hostname.is_empty());
        assert!(status.memory_total_bytes > 0);
        assert_eq!(status.node_type, NodeType::Local);
        // No backend is listening on port 9
        assert!(status.backend.is_none());
        assert_eq!(status.broker_connected, None);
        // has_gpu mirrors the gpu list, never omitted
        assert_eq!(status.has_gpu, !status.gpus.is_empty());
    }
}
