use std::future::IntoFuture;
use std::process;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use cloudburst::agent::{Agent, AgentError};
use cloudburst::cli::{AgentArgs, Cli, Commands, ServeArgs};
use cloudburst::config::{default_config_path, ScalerConfig};
use cloudburst::fleet::{api::create_fleet_router, spawn_ttl_sweeper, Fleet, FleetConfig};
use cloudburst::lifecycle::LifecycleEngine;
use cloudburst::scaler::{proxy::create_proxy_router, watchdog::spawn_idle_watchdog, Scaler};

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let filter = match cli.verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .init();

    let result = match cli.command {
        Commands::Serve(args) => run_serve(args).await,
        Commands::Agent(args) => run_agent(args).await,
    };

    if let Err(e) = result {
        error!("{e}");
        process::exit(1);
    }
}

async fn run_serve(args: ServeArgs) -> anyhow::Result<()> {
    if let Some(ref env_file) = args.env_file {
        dotenvy::from_path(env_file)
            .with_context(|| format!("failed to load env file {}", env_file.display()))?;
    }

    let config_path = args.config.unwrap_or_else(default_config_path);
    let mut config = ScalerConfig::load(&config_path)?;
    if let Some(bind) = args.bind_addr {
        config.bind_addr = bind;
    }
    if let Some(port) = args.proxy_port {
        config.proxy_port = port;
    }
    if let Some(port) = args.fleet_port {
        config.fleet_port = port;
    }

    let shutdown = CancellationToken::new();

    let fleet = Arc::new(Fleet::new(FleetConfig {
        heartbeat_interval_sec: config.heartbeat_interval_sec,
        status_interval_sec: config.status_interval_sec,
        reserved_node_ids: config.reserved_node_ids(),
        ..Default::default()
    }));
    spawn_ttl_sweeper(fleet.clone(), shutdown.clone());

    let engine = Arc::new(LifecycleEngine::from_scaler_config(&config));
    info!(workers = ?engine.worker_names(), "probing initial worker states");
    engine.init().await;
    engine.spawn_background_probes(shutdown.clone());

    let scaler = Arc::new(Scaler::new(config.clone(), engine, fleet.clone()));
    spawn_idle_watchdog(scaler.clone(), shutdown.clone());

    let proxy_addr = format!("{}:{}", config.bind_addr, config.proxy_port);
    let fleet_addr = format!("{}:{}", config.bind_addr, config.fleet_port);

    let proxy_listener = tokio::net::TcpListener::bind(&proxy_addr)
        .await
        .with_context(|| format!("failed to bind proxy listener on {proxy_addr}"))?;
    let fleet_listener = tokio::net::TcpListener::bind(&fleet_addr)
        .await
        .with_context(|| format!("failed to bind fleet listener on {fleet_addr}"))?;

    info!("proxy listening on {proxy_addr}");
    info!("fleet control plane listening on {fleet_addr}");
    info!("control endpoints under {}/", cloudburst::config::CONTROL_PREFIX);

    let proxy_app = create_proxy_router(scaler);
    let fleet_app = create_fleet_router(fleet);

    let proxy_task = tokio::spawn(
        axum::serve(proxy_listener, proxy_app)
            .with_graceful_shutdown(shutdown.clone().cancelled_owned())
            .into_future(),
    );
    let fleet_task = tokio::spawn(
        axum::serve(fleet_listener, fleet_app)
            .with_graceful_shutdown(shutdown.clone().cancelled_owned())
            .into_future(),
    );

    // SIGINT/SIGTERM triggers the top-level cancellation
    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        wait_for_signal().await;
        info!("shutdown signal received, draining");
        signal_token.cancel();
    });

    shutdown.cancelled().await;

    // Drain in-flight requests, bounded by the grace period
    let grace = Duration::from_secs(config.shutdown_grace_secs);
    let drained = tokio::time::timeout(grace, async {
        let _ = proxy_task.await;
        let _ = fleet_task.await;
    })
    .await;
    if drained.is_err() {
        warn!(grace_secs = grace.as_secs(), "drain grace expired, exiting anyway");
    }

    info!("scaler stopped");
    Ok(())
}

async fn run_agent(args: AgentArgs) -> anyhow::Result<()> {
    if let Some(ref env_file) = args.env_file {
        dotenvy::from_path(env_file)
            .with_context(|| format!("failed to load env file {}", env_file.display()))?;
    }

    let config = args.to_config().map_err(anyhow::Error::msg)?;
    let agent = Agent::new(config);

    let shutdown = CancellationToken::new();
    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        wait_for_signal().await;
        info!("shutdown signal received");
        signal_token.cancel();
    });

    match agent.run(shutdown).await {
        Ok(()) => Ok(()),
        // Registration rejection is the agent's fatal exit path
        Err(e @ AgentError::RegistrationRejected(_)) => Err(e.into()),
        Err(e) => Err(e).context("agent failed"),
    }
}

async fn wait_for_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
