//! Controller binary. Loads an operational config (`ControllerOpts`)
//! and a static cluster topology, builds the placement backend chosen
//! at startup, and serves until `ctrl_c`.

use std::sync::Arc;

use cinder_common::config::ControllerOpts;
use cinder_controller::config::ClusterConfig;
use cinder_controller::placement::linear::LinearBackend;
use cinder_controller::placement::topology::TopologyBackend;
use cinder_controller::placement::PlacementBackend;
use cinder_controller::rpc::server;
use cinder_controller::Controller;
use clap::Parser;
use tokio::sync::{mpsc, watch};

#[derive(Parser, Debug)]
#[command(name = "cinderd", about = "Cinder cluster controller")]
struct Args {
    /// Path to the controller's operational config (TOML).
    #[arg(long, default_value = "cinderd.toml")]
    config: String,
    /// Path to the static cluster topology (TOML).
    #[arg(long, default_value = "cluster.toml")]
    cluster: String,
    /// Placement backend: "linear" or "topology".
    #[arg(long, default_value = "linear")]
    backend: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    cinder_common::logging::init("cinderd");
    let args = Args::parse();

    let opts: ControllerOpts = cinder_common::config::load(&args.config).unwrap_or_else(|e| {
        tracing::warn!(error = %e, "falling back to default controller config");
        ControllerOpts::default()
    });
    let cluster = ClusterConfig::load(&args.cluster)?;
    let machine_dims = cluster.machine_dims();
    let (nodes, partitions, agent_addrs) = cluster.build()?;

    let backend: Arc<dyn PlacementBackend> = match args.backend.as_str() {
        "topology" => Arc::new(TopologyBackend::new(machine_dims)),
        _ => Arc::new(LinearBackend),
    };

    let (sched_wake_tx, mut sched_wake_rx) = mpsc::channel(16);
    let controller = Controller::new(nodes, partitions, agent_addrs, backend, opts, sched_wake_tx)?;

    // Drain the wake channel: `run_pass` is cheap and idempotent, so
    // an explicit wake just nudges the periodic timer rather than
    // driving a second pass loop.
    let wake_scheduler = controller.scheduler.clone();
    tokio::spawn(async move {
        while sched_wake_rx.recv().await.is_some() {
            if let Err(e) = wake_scheduler.run_pass().await {
                tracing::error!(error = %e, "scheduler pass failed");
            }
        }
    });

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        let _ = shutdown_tx.send(true);
    });

    server::serve(controller, shutdown_rx).await?;
    Ok(())
}
