//! Step-shim binary: spawned once per step by the node agent that
//! owns its lead node (spec 2). Lives only as long as the step does;
//! exits when both its listeners stop accepting connections.

use std::sync::Arc;

use cinder_common::config::ShimOpts;
use cinder_rpc_client::ControllerClient;
use cinder_shim::io::{IoMode, StdinMode};
use cinder_shim::{Shim, StepIdentity};
use clap::Parser;

#[derive(Parser, Debug)]
#[command(name = "cinder-shimd", about = "Cinder step shim")]
struct Args {
    /// Path to tuning knobs not passed positionally by the node agent
    /// (frame/key/value size caps, SIGINT escalation window).
    #[arg(long, default_value = "cinder-shimd.toml")]
    config: String,
    #[arg(long)]
    job_id: u64,
    #[arg(long)]
    step_id: u32,
    #[arg(long)]
    task_count: u32,
    #[arg(long)]
    io_mode: String,
    #[arg(long)]
    stdin_mode: String,
    #[arg(long)]
    pmi_listen: String,
    #[arg(long)]
    io_listen: String,
    /// Address of the controlling `cinderd`, used only to relay
    /// client SIGINTs (spec 4.7). Empty disables the relay.
    #[arg(long, default_value = "")]
    controller_addr: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    cinder_common::logging::init("cinder-shimd");
    let args = Args::parse();

    let mut opts: ShimOpts = cinder_common::config::load(&args.config).unwrap_or_else(|e| {
        tracing::debug!(error = %e, "no shim tuning config found, using defaults");
        ShimOpts::default()
    });
    opts.pmi_listen_addr = args.pmi_listen;
    opts.io_listen_addr = args.io_listen;

    let controller = if args.controller_addr.is_empty() {
        None
    } else {
        match ControllerClient::connect(args.controller_addr).await {
            Ok(c) => Some(c),
            Err(e) => {
                tracing::warn!(error = %e, "failed to connect to controller; SIGINT relay disabled");
                None
            }
        }
    };

    let identity = StepIdentity {
        job_id: args.job_id,
        step_id: args.step_id,
        task_count: args.task_count,
    };
    let shim = Arc::new(Shim::new(
        opts,
        identity,
        IoMode::parse(&args.io_mode),
        StdinMode::parse(&args.stdin_mode),
        controller,
    ));
    shim.serve().await?;
    Ok(())
}
