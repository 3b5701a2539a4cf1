//! Command-line interface

use std::path::PathBuf;

use clap::{ArgAction, Args, Parser, Subcommand};

use crate::config::AgentConfig;

#[derive(Parser, Debug)]
#[command(name = "cloudburst")]
#[command(about = "Cloud-burst scaler and fleet control plane for LLM inference workers")]
#[command(version)]
pub struct Cli {
    /// Enable verbose logging output (-v, -vv, -vvv)
    #[arg(short, long, action = ArgAction::Count, global = true)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the scaler: proxy front door, fleet control plane, lifecycle engine
    Serve(ServeArgs),
    /// Run the worker agent on a node
    Agent(AgentArgs),
}

#[derive(Args, Debug)]
pub struct ServeArgs {
    /// Path to the scaler config (default: ~/.config/cloudburst/config.yaml)
    #[arg(short, long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Override the bind address from the config
    #[arg(long, value_name = "ADDR")]
    pub bind_addr: Option<String>,

    /// Override the proxy listener port
    #[arg(long, value_name = "PORT")]
    pub proxy_port: Option<u16>,

    /// Override the fleet listener port
    #[arg(long, value_name = "PORT")]
    pub fleet_port: Option<u16>,

    /// Path to a .env file to load before starting
    #[arg(long, value_name = "FILE")]
    pub env_file: Option<PathBuf>,
}

#[derive(Args, Debug)]
pub struct AgentArgs {
    /// Control plane address
    #[arg(long, env = "CONTROL_PLANE_ADDR", value_name = "HOST:PORT")]
    pub control_plane: String,

    /// Node type: gpu-worker, lighthouse, or local
    #[arg(long = "type", value_name = "TYPE", default_value = "gpu-worker")]
    pub node_type: String,

    /// Node identity; autodetected from instance metadata or hostname
    #[arg(long, value_name = "ID")]
    pub node_id: Option<String>,

    /// Port for the local /health and /ready endpoints
    #[arg(long, value_name = "PORT", default_value_t = 9090)]
    pub health_port: u16,

    #[arg(long, value_name = "ID")]
    pub instance_id: Option<String>,

    #[arg(long, value_name = "IP")]
    pub mesh_ip: Option<String>,

    #[arg(long, value_name = "IP")]
    pub public_ip: Option<String>,

    #[arg(long, value_name = "REGION")]
    pub region: Option<String>,

    #[arg(long, value_name = "ZONE")]
    pub zone: Option<String>,

    /// NATS URL for the optional observational publisher
    #[arg(long, value_name = "URL")]
    pub broker_url: Option<String>,

    /// Inference backend this agent manages
    #[arg(long, value_name = "URL", default_value = "http://127.0.0.1:11434")]
    pub backend_url: String,

    /// Shell command that starts the backend service
    #[arg(long, value_name = "CMD")]
    pub backend_start_cmd: Option<String>,

    /// Shell command that stops the backend service
    #[arg(long, value_name = "CMD")]
    pub backend_stop_cmd: Option<String>,

    /// Path to a .env file to load before starting
    #[arg(long, value_name = "FILE")]
    pub env_file: Option<PathBuf>,
}

impl AgentArgs {
    /// Assemble the runtime agent configuration; fails on a bad node type
    pub fn to_config(&self) -> Result<AgentConfig, String> {
        let node_type = self.node_type.parse()?;
        let mut config = AgentConfig::new(self.control_plane.clone());
        config.node_type = node_type;
        config.node_id = self.node_id.clone();
        config.health_port = self.health_port;
        config.instance_id = self.instance_id.clone();
        config.mesh_ip = self.mesh_ip.clone();
        config.public_ip = self.public_ip.clone();
        config.region = self.region.clone();
        config.zone = self.zone.clone();
        config.broker_url = self.broker_url.clone();
        config.backend_url = self.backend_url.clone();
        config.backend_start_cmd = self.backend_start_cmd.clone();
        config.backend_stop_cmd = self.backend_stop_cmd.clone();
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proto::NodeType;

    #[test]
    fn test_parse_serve() {
        let cli = Cli::try_parse_from([
            "cloudburst",
            "serve",
            "--config",
            "/etc/cloudburst.yaml",
            "--proxy-port",
            "9080",
            "-vv",
        ])
        .unwrap();
        assert_eq!(cli.verbose, 2);
        match cli.command {
            Commands::Serve(args) => {
                assert_eq!(args.config.unwrap().to_str().unwrap(), "/etc/cloudburst.yaml");
                assert_eq!(args.proxy_port, Some(9080));
            }
            other => panic!("wrong command: {other:?}"),
        }
    }

    #[test]
    fn test_parse_agent_defaults() {
        let cli = Cli::try_parse_from([
            "cloudburst",
            "agent",
            "--control-plane",
            "10.0.0.1:8181",
        ])
        .unwrap();
        match cli.command {
            Commands::Agent(args) => {
                let config = args.to_config().unwrap();
                assert_eq!(config.control_plane, "10.0.0.1:8181");
                assert_eq!(config.node_type, NodeType::GpuWorker);
                assert_eq!(config.health_port, 9090);
                assert!(config.broker_url.is_none());
            }
            other => panic!("wrong command: {other:?}"),
        }
    }

    #[test]
    fn test_parse_agent_full() {
        let cli = Cli::try_parse_from([
            "cloudburst",
            "agent",
            "--control-plane",
            "cp:8181",
            "--type",
            "local",
            "--node-id",
            "basement",
            "--mesh-ip",
            "100.64.0.2",
            "--broker-url",
            "nats://127.0.0.1:4222",
        ])
        .unwrap();
        match cli.command {
            Commands::Agent(args) => {
                let config = args.to_config().unwrap();
                assert_eq!(config.node_type, NodeType::Local);
                assert_eq!(config.node_id.as_deref(), Some("basement"));
                assert_eq!(config.mesh_ip.as_deref(), Some("100.64.0.2"));
                assert_eq!(config.broker_url.as_deref(), Some("nats://127.0.0.1:4222"));
            }
            other => panic!("wrong command: {other:?}"),
        }
    }

    #[test]
    fn test_agent_rejects_bad_type() {
        let cli = Cli::try_parse_from([
            "cloudburst",
            "agent",
            "--control-plane",
            "cp:8181",
            "--type",
            "mainframe",
        ])
        .unwrap();
        match cli.command {
            Commands::Agent(args) => assert!(args.to_config().is_err()),
            other => panic!("wrong command: {other:?}"),
        }
    }

    #[test]
    fn test_agent_requires_control_plane() {
        // Neither the flag nor the env var is set
        std::env::remove_var("CONTROL_PLANE_ADDR");
        assert!(Cli::try_parse_from(["cloudburst", "agent"]).is_err());
    }
}
