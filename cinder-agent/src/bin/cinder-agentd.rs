//! Node-agent binary: one per compute node. Connects to the
//! controller, verifies/executes credentialed launches, and serves
//! until `ctrl_c`.

use std::sync::Arc;

use cinder_agent::rpc::server;
use cinder_agent::Agent;
use cinder_common::config::AgentOpts;
use cinder_common::credential::{CredentialSigner, HmacSha256Signer};
use cinder_rpc_client::ControllerClient;
use clap::Parser;
use tokio::sync::watch;

#[derive(Parser, Debug)]
#[command(name = "cinder-agentd", about = "Cinder node agent")]
struct Args {
    /// Path to the agent's operational config (TOML).
    #[arg(long, default_value = "cinder-agentd.toml")]
    config: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    cinder_common::logging::init("cinder-agentd");
    let args = Args::parse();

    let opts: AgentOpts = cinder_common::config::load(&args.config).unwrap_or_else(|e| {
        tracing::warn!(error = %e, "falling back to default agent config");
        AgentOpts::default()
    });

    let signer: Arc<dyn CredentialSigner> = Arc::new(HmacSha256Signer::from_hex(&opts.credential_key_hex)?);
    let controller = ControllerClient::connect(opts.controller_addr.clone()).await?;
    let agent = Arc::new(Agent::new(opts, signer, controller));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        let _ = shutdown_tx.send(true);
    });

    server::serve(agent, shutdown_rx).await?;
    Ok(())
}
