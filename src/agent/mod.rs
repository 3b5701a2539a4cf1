//! Worker agent
//!
//! The on-node daemon. Registers with the fleet, opens the bidirectional
//! stream, and runs three cooperative loops: status snapshots on a ticker,
//! heartbeats on a ticker, and command execution off the stream. On any
//! stream failure it reconnects from registration with exponential backoff.

pub mod broker;
pub mod collector;
pub mod executor;
pub mod health;
pub mod identity;

use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::AgentConfig;
use crate::proto::{
    AgentMessage, ConfigUpdate, ControlMessage, HeartbeatRequest, RegisterRequest,
    RegisterResponse,
};
use broker::BrokerPublisher;
use collector::StatusCollector;
use executor::{Executor, ShellExecutor};
use health::AgentHealth;
use identity::{MetadataClient, NodeIdentity};

/// Timeout for the registration and heartbeat HTTP calls
const CONTROL_PLANE_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Error, Debug)]
pub enum AgentError {
    /// Fatal: the agent must exit non-zero
    #[error("registration rejected: {0}")]
    RegistrationRejected(String),

    #[error("control plane request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("stream error: {0}")]
    Stream(String),
}

/// How a stream session ended
enum SessionEnd {
    /// Clean shutdown was requested
    Shutdown,
    /// The stream dropped; reconnect after the delay
    Disconnected,
}

pub struct Agent {
    config: AgentConfig,
    health: Arc<AgentHealth>,
    executor: Arc<dyn Executor>,
    http: reqwest::Client,
}

impl Agent {
    pub fn new(config: AgentConfig) -> Self {
        let executor = Arc::new(ShellExecutor::new(
            config.backend_url.clone(),
            config.backend_start_cmd.clone(),
            config.backend_stop_cmd.clone(),
        ));
        Self::with_executor(config, executor)
    }

    pub fn with_executor(config: AgentConfig, executor: Arc<dyn Executor>) -> Self {
        Self {
            config,
            health: Arc::new(AgentHealth::default()),
            executor,
            http: reqwest::Client::new(),
        }
    }

    /// Run until shutdown. Returns an error only on fatal conditions
    /// (registration rejection); everything else is retried with backoff.
    pub async fn run(&self, shutdown: CancellationToken) -> Result<(), AgentError> {
        let identity = identity::detect(&self.config, &MetadataClient::new()).await;
        info!(node_id = %identity.node_id, node_type = %self.config.node_type, "agent starting");

        if let Err(e) = health::spawn_health_server(self.config.health_port, self.health.clone()).await
        {
            warn!(port = self.config.health_port, "health endpoint unavailable: {e}");
        }

        let broker = match &self.config.broker_url {
            Some(url) => BrokerPublisher::connect(url).await,
            None => None,
        };
        self.health
            .set_broker_up(broker.as_ref().map(|b| b.is_connected()).unwrap_or(false));

        let mut delay = self.config.reconnect_delay;
        loop {
            match self.session(&identity, broker.as_ref(), &shutdown).await {
                Ok(SessionEnd::Shutdown) => {
                    if let Some(b) = &broker {
                        b.flush().await;
                    }
                    info!("agent shut down cleanly");
                    return Ok(());
                }
                Ok(SessionEnd::Disconnected) => {
                    // The session was established; start the backoff over
                    delay = self.config.reconnect_delay;
                    warn!(delay_secs = delay.as_secs(), "stream lost, reconnecting");
                }
                Err(AgentError::RegistrationRejected(message)) => {
                    error!("registration rejected by control plane: {message}");
                    return Err(AgentError::RegistrationRejected(message));
                }
                Err(e) => {
                    warn!(delay_secs = delay.as_secs(), "session failed: {e}");
                }
            }

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = shutdown.cancelled() => return Ok(()),
            }
            delay = (delay * 2).min(self.config.reconnect_delay_max);
        }
    }

    /// One registration + stream session
    async fn session(
        &self,
        identity: &NodeIdentity,
        broker: Option<&BrokerPublisher>,
        shutdown: &CancellationToken,
    ) -> Result<SessionEnd, AgentError> {
        let capabilities = collector::gpu_capabilities().await;
        let request = RegisterRequest {
            node_id: identity.node_id.clone(),
            node_type: self.config.node_type,
            instance_id: identity.instance_id.clone(),
            mesh_ip: identity.mesh_ip.clone(),
            public_ip: identity.public_ip.clone(),
            private_ip: identity.private_ip.clone(),
            region: identity.region.clone(),
            zone: identity.zone.clone(),
            capabilities,
            labels: self.config.labels.clone(),
        };

        let response: RegisterResponse = self
            .http
            .post(self.config.register_url())
            .timeout(CONTROL_PLANE_TIMEOUT)
            .json(&request)
            .send()
            .await?
            .json()
            .await?;

        if !response.accepted {
            return Err(AgentError::RegistrationRejected(response.message));
        }
        if let Some(b) = broker {
            b.publish_registration(&request).await;
        }

        let node_id = response
            .assigned_id
            .unwrap_or_else(|| identity.node_id.clone());
        let status_period = Duration::from_secs(response.status_interval_sec.max(1));
        let heartbeat_period = Duration::from_secs(response.heartbeat_interval_sec.max(1));
        info!(
            %node_id,
            status_interval = response.status_interval_sec,
            heartbeat_interval = response.heartbeat_interval_sec,
            "registered with control plane"
        );

        let url = self.config.connect_url(&node_id);
        let (stream, _) = connect_async(&url)
            .await
            .map_err(|e| AgentError::Stream(e.to_string()))?;
        info!(%node_id, "stream connected");
        self.health.set_stream_up(true);

        let ended = self
            .stream_loop(stream, &node_id, broker, status_period, heartbeat_period, shutdown)
            .await;
        self.health.set_stream_up(false);
        Ok(ended)
    }

    async fn stream_loop(
        &self,
        stream: tokio_tungstenite::WebSocketStream<
            tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
        >,
        node_id: &str,
        broker: Option<&BrokerPublisher>,
        status_period: Duration,
        heartbeat_period: Duration,
        shutdown: &CancellationToken,
    ) -> SessionEnd {
        let (mut ws_tx, mut ws_rx) = stream.split();
        let (out_tx, mut out_rx) = mpsc::channel::<AgentMessage>(32);

        let mut collector = StatusCollector::new(self.config.node_type, &self.config.backend_url);
        let mut status_ticker = tokio::time::interval(status_period);
        status_ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let mut heartbeat_ticker = tokio::time::interval(heartbeat_period);
        heartbeat_ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let mut heartbeat_failures = 0u32;

        loop {
            // Interval changes are applied after the select so the ticker
            // futures are not borrowed while we replace them
            let mut pending_update: Option<ConfigUpdate> = None;

            tokio::select! {
                _ = shutdown.cancelled() => {
                    let _ = ws_tx.send(Message::Close(None)).await;
                    return SessionEnd::Shutdown;
                }

                _ = status_ticker.tick() => {
                    let broker_up = broker.map(|b| b.is_connected());
                    self.health.set_broker_up(broker_up == Some(true));
                    let status = collector.collect(broker_up).await;
                    if let Some(b) = broker {
                        b.publish_status(node_id, &status).await;
                    }
                    if out_tx.try_send(AgentMessage::Status(status)).is_err() {
                        debug!("outgoing queue full, dropping status snapshot");
                    }
                }

                _ = heartbeat_ticker.tick() => {
                    let sent = self
                        .http
                        .post(self.config.heartbeat_url())
                        .timeout(CONTROL_PLANE_TIMEOUT)
                        .json(&HeartbeatRequest { node_id: node_id.to_string() })
                        .send()
                        .await;
                    match sent {
                        Ok(response) if response.status().is_success() => {
                            if heartbeat_failures > 0 {
                                info!("heartbeat recovered after {heartbeat_failures} failures");
                            }
                            heartbeat_failures = 0;
                        }
                        Ok(response) => {
                            heartbeat_failures += 1;
                            warn!(status = %response.status(), "heartbeat rejected");
                        }
                        Err(e) => {
                            heartbeat_failures += 1;
                            if heartbeat_failures >= 3 {
                                error!("heartbeat failed {heartbeat_failures} consecutive times: {e}");
                            } else {
                                warn!("heartbeat failed: {e}");
                            }
                        }
                    }
                }

                Some(msg) = out_rx.recv() => {
                    let text = match serde_json::to_string(&msg) {
                        Ok(t) => t,
                        Err(e) => {
                            warn!("failed to encode agent message: {e}");
                            continue;
                        }
                    };
                    if ws_tx.send(Message::Text(text.into())).await.is_err() {
                        return SessionEnd::Disconnected;
                    }
                }

                incoming = ws_rx.next() => {
                    match incoming {
                        Some(Ok(Message::Text(text))) => {
                            pending_update = self.handle_control(text.as_str(), &out_tx);
                        }
                        Some(Ok(Message::Ping(data))) => {
                            let _ = ws_tx.send(Message::Pong(data)).await;
                        }
                        Some(Ok(Message::Close(frame))) => {
                            let reason = frame
                                .map(|f| f.reason.to_string())
                                .unwrap_or_default();
                            info!(%reason, "control plane closed the stream");
                            return SessionEnd::Disconnected;
                        }
                        Some(Err(e)) => {
                            warn!("stream receive error: {e}");
                            return SessionEnd::Disconnected;
                        }
                        None => return SessionEnd::Disconnected,
                        Some(Ok(_)) => {}
                    }
                }
            }

            if let Some(update) = pending_update {
                if let Some(secs) = update.status_interval_sec {
                    info!(secs, "status interval updated");
                    status_ticker = tokio::time::interval(Duration::from_secs(secs.max(1)));
                    status_ticker
                        .set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
                }
                if let Some(secs) = update.heartbeat_interval_sec {
                    info!(secs, "heartbeat interval updated");
                    heartbeat_ticker = tokio::time::interval(Duration::from_secs(secs.max(1)));
                    heartbeat_ticker
                        .set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
                }
            }
        }
    }

    /// Dispatch one control message. Commands run on their own task so a
    /// long execution never stalls heartbeats; the result goes back through
    /// the outgoing queue, correlated by command id. A config update is
    /// returned to the caller, which owns the tickers.
    fn handle_control(
        &self,
        text: &str,
        out_tx: &mpsc::Sender<AgentMessage>,
    ) -> Option<ConfigUpdate> {
        let msg: ControlMessage = match serde_json::from_str(text) {
            Ok(m) => m,
            Err(e) => {
                warn!("unparseable control message: {e}");
                return None;
            }
        };

        match msg {
            ControlMessage::Command(command) => {
                info!(command_id = %command.command_id, kind = %command.kind, "command received");
                let executor = self.executor.clone();
                let out_tx = out_tx.clone();
                tokio::spawn(async move {
                    let result = executor.execute(&command).await;
                    if out_tx
                        .send(AgentMessage::CommandResult(result))
                        .await
                        .is_err()
                    {
                        warn!(command_id = %command.command_id, "result dropped, stream gone");
                    }
                });
                None
            }
            ControlMessage::ConfigUpdate(update) => Some(update),
        }
    }
}
