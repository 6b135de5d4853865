use std::sync::Arc;

use anyhow::Context;
use anyhow::Result;
use clap::Parser;
use npu_scheduler::api::ExtenderServer;
use npu_scheduler::config::{Cli, Commands, DaemonArgs, SchedulerConfig, SimulateArgs};
use npu_scheduler::simulate::{self, Snapshot};
use npu_scheduler::SchedulerContext;
use tokio::sync::oneshot;
use utils::logging;
use utils::version;

/// Sets up global panic hooks.
fn setup_global_hooks() {
    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |panic_info| {
        default_hook(panic_info);
        tracing::error!("Thread panicked: {}", panic_info);
    }));
}

#[tokio::main]
async fn main() -> Result<()> {
    setup_global_hooks();

    let cli = Cli::parse();

    match cli.command {
        Commands::Daemon(daemon_args) => run_daemon(*daemon_args).await,
        Commands::Simulate(simulate_args) => run_simulate(simulate_args),
    }
}

async fn run_daemon(daemon_args: DaemonArgs) -> Result<()> {
    let _guard = logging::init(daemon_args.log_path.clone());

    tracing::info!("Starting npu scheduler {}", &**version::VERSION);

    let config = daemon_args
        .resolve_config()
        .map_err(|report| anyhow::anyhow!("{report:?}"))
        .context("load scheduler configuration failed")?;
    tracing::info!(
        families = ?config.enabled_families,
        degraded_penalty = config.degraded_penalty,
        super_pod_penalty = config.super_pod_penalty,
        "configuration loaded"
    );

    let context = Arc::new(SchedulerContext::from_config(&config));
    let server = ExtenderServer::new(context, config.listen_addr.clone());

    let (shutdown_tx, shutdown_rx) = oneshot::channel();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("failed to listen for shutdown signal: {e}");
            return;
        }
        tracing::info!("shutdown signal received");
        let _ = shutdown_tx.send(());
    });

    server
        .run(shutdown_rx)
        .await
        .map_err(|report| anyhow::anyhow!("{report:?}"))
        .context("extender server failed")?;

    tracing::info!("npu scheduler stopped");
    Ok(())
}

fn run_simulate(simulate_args: SimulateArgs) -> Result<()> {
    let _guard = logging::init(None);

    let config = match &simulate_args.config {
        Some(path) => SchedulerConfig::load(path).map_err(|report| anyhow::anyhow!("{report:?}"))?,
        None => SchedulerConfig::default(),
    };
    let snapshot = Snapshot::load(&simulate_args.snapshot)
        .map_err(|report| anyhow::anyhow!("{report:?}"))
        .context("load snapshot failed")?;

    let context = SchedulerContext::from_config(&config);
    let report = simulate::run_cycle(&context, snapshot);

    let json = serde_json::to_string_pretty(&report).context("serialize cycle report failed")?;
    println!("{json}");
    Ok(())
}
