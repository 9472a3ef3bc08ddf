//! ClinicFlow: scenario-driven messaging automation for clinics.
//!
//! Wires the in-memory engine, the due-step sweeper and the operator API.

use std::sync::Arc;

use clap::Parser;
use clinicflow_api::{ApiServer, AppState};
use clinicflow_core::config::AppConfig;
use clinicflow_core::event_bus::TracingSink;
use clinicflow_scenario::clock::SystemClock;
use clinicflow_scenario::providers::{InMemoryAttributeProvider, TracingActionExecutor};
use clinicflow_scenario::{EngineContext, ScenarioEngine};
use tokio::sync::watch;
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(name = "clinicflow")]
#[command(about = "Scenario-driven messaging automation for clinics")]
#[command(version)]
struct Cli {
    /// Node identifier (overrides config)
    #[arg(long, env = "CLINICFLOW__NODE_ID")]
    node_id: Option<String>,

    /// HTTP port (overrides config)
    #[arg(long, env = "CLINICFLOW__API__HTTP_PORT")]
    http_port: Option<u16>,

    /// Seconds between due-step sweeps (overrides config)
    #[arg(long, env = "CLINICFLOW__ENGINE__SWEEP_INTERVAL_SECS")]
    sweep_interval_secs: Option<u64>,

    /// Serve the API without running due steps on this node
    #[arg(long, default_value_t = false)]
    no_sweeper: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "clinicflow=info,tower_http=info".into()),
        )
        .json()
        .init();

    let cli = Cli::parse();

    info!("ClinicFlow starting up");

    let mut config = AppConfig::load().unwrap_or_else(|e| {
        tracing::warn!(error = %e, "Failed to load config, using defaults");
        AppConfig::default()
    });

    if let Some(node_id) = cli.node_id {
        config.node_id = node_id;
    }
    if let Some(port) = cli.http_port {
        config.api.http_port = port;
    }
    if let Some(secs) = cli.sweep_interval_secs {
        config.engine.sweep_interval_secs = secs;
    }

    info!(
        node_id = %config.node_id,
        http_port = config.api.http_port,
        sweep_interval_secs = config.engine.sweep_interval_secs,
        timezone = %config.engine.timezone,
        "Configuration loaded"
    );

    let clock = Arc::new(SystemClock);
    let attributes = Arc::new(InMemoryAttributeProvider::new(clock.clone()));
    let ctx = EngineContext::from_config(
        config.node_id.clone(),
        &config.engine,
        attributes,
        Arc::new(TracingActionExecutor),
    )?
    .with_clock(clock)
    .with_event_sink(Arc::new(TracingSink));
    let engine = ScenarioEngine::new(ctx);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let sweeper_task = if cli.no_sweeper {
        info!("Sweeper disabled, serving API only");
        None
    } else {
        let sweeper = engine.sweeper();
        Some(tokio::spawn(sweeper.run(shutdown_rx.clone())))
    };

    let api_server = ApiServer::new(config.clone(), AppState::new(engine, config.node_id.clone()));

    if config.metrics.enabled {
        if let Err(e) = api_server.start_metrics() {
            error!(error = %e, "Failed to start metrics exporter");
        }
    }

    info!("ClinicFlow is ready");

    let mut http_shutdown = shutdown_rx;
    let served = api_server
        .start_http(async move {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = http_shutdown.changed() => {}
            }
        })
        .await;

    info!("Shutting down");
    let _ = shutdown_tx.send(true);
    if let Some(task) = sweeper_task {
        if let Err(e) = task.await {
            error!(error = %e, "Sweeper task failed");
        }
    }

    served
}
