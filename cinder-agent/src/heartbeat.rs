//! Periodic heartbeat to the controller (spec 4.1, 5): reports this
//! node's liveness and free-CPU count so the registry can clear
//! `NO_RESPOND` on receipt and so a missed heartbeat can be detected
//! controller-side after `slurmd_timeout` seconds.

use std::sync::Arc;
use std::time::Duration;

use cinder_pb::controller::HeartbeatRequest;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use crate::Agent;

/// Spawns the heartbeat loop, returning a handle and shutdown sender
/// the caller pushes onto its sub-task shutdown list, mirroring the
/// controller's `scheduler::start_periodic` convention.
pub fn start(agent: Arc<Agent>, interval: Duration) -> (JoinHandle<()>, oneshot::Sender<()>) {
    let (shutdown_tx, mut shutdown_rx) = oneshot::channel();
    let handle = tokio::spawn(async move {
        let mut tick = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = &mut shutdown_rx => {
                    tracing::info!("heartbeat task shutting down");
                    return;
                }
                _ = tick.tick() => {
                    send_one(&agent).await;
                }
            }
        }
    });
    (handle, shutdown_tx)
}

async fn send_one(agent: &Arc<Agent>) {
    let cpus_free = agent.opts.cpus.saturating_sub(agent.steps.local_task_count());
    let req = HeartbeatRequest {
        node_name: agent.opts.node_name.clone(),
        observed_unix: cinder_common::time::now_unix(),
        cpus_free,
    };
    let mut client = agent.controller.inner();
    if let Err(e) = client.heartbeat(req).await {
        tracing::warn!(error = %e, "heartbeat RPC failed");
    }
}
