//! Optional message broker publisher
//!
//! When the agent is configured with a broker URL it additionally publishes
//! its registration and periodic status to NATS subjects. The stream to the
//! fleet stays authoritative; broker publishing is observational and
//! fire-and-forget — a broker failure never blocks the primary channel.

use std::time::Duration;

use tracing::{debug, info, warn};

use crate::proto::{NodeStatus, RegisterRequest};

/// Subject prefix for all agent publishes
const SUBJECT_PREFIX: &str = "cloudburst.agent";

const PUBLISH_TIMEOUT: Duration = Duration::from_secs(3);

pub struct BrokerPublisher {
    client: async_nats::Client,
}

impl BrokerPublisher {
    /// Connect to the broker; a failure is logged and reported as `None`,
    /// never an error, so the agent starts without it
    pub async fn connect(url: &str) -> Option<Self> {
        match async_nats::connect(url).await {
            Ok(client) => {
                info!(url, "broker connected");
                Some(Self { client })
            }
            Err(e) => {
                warn!(url, "broker unavailable, continuing without it: {e}");
                None
            }
        }
    }

    pub fn is_connected(&self) -> bool {
        self.client.connection_state() == async_nats::connection::State::Connected
    }

    pub async fn publish_registration(&self, request: &RegisterRequest) {
        let subject = format!("{SUBJECT_PREFIX}.register.{}", request.node_id);
        self.publish(subject, request).await;
    }

    pub async fn publish_status(&self, node_id: &str, status: &NodeStatus) {
        let subject = format!("{SUBJECT_PREFIX}.status.{node_id}");
        self.publish(subject, status).await;
    }

    async fn publish<T: serde::Serialize>(&self, subject: String, payload: &T) {
        let bytes = match serde_json::to_vec(payload) {
            Ok(b) => b,
            Err(e) => {
                warn!(%subject, "broker payload encode failed: {e}");
                return;
            }
        };

        let publish = self.client.publish(subject.clone(), bytes.into());
        match tokio::time::timeout(PUBLISH_TIMEOUT, publish).await {
            Ok(Ok(())) => debug!(%subject, "broker publish ok"),
            Ok(Err(e)) => warn!(%subject, "broker publish failed: {e}"),
            Err(_) => warn!(%subject, "broker publish timed out"),
        }
    }

    pub async fn flush(&self) {
        if let Err(e) = self.client.flush().await {
            debug!("broker flush failed: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_connect_failure_is_none() {
        // Nothing listening on this port
        let publisher = BrokerPublisher::connect("nats://127.0.0.1:9").await;
        assert!(publisher.is_none());
    }

    #[test]
    fn test_subject_shapes() {
        assert_eq!(
            format!("{SUBJECT_PREFIX}.status.gpu-1"),
            "cloudburst.agent.status.gpu-1"
        );
    }
}
