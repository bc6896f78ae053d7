//! Node-agent process startup: binds the gRPC listener and spawns the
//! heartbeat sub-task, mirroring the controller's `rpc::server::serve`
//! shape.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use cinder_common::error::{Error, ErrorKind, Result};
use cinder_pb::agent::agent_service_server::AgentServiceServer;
use tokio::sync::watch;
use tonic::transport::Server;

use crate::heartbeat;
use crate::rpc::service::AgentServiceImpl;
use crate::Agent;

pub async fn serve(agent: Arc<Agent>, mut shutdown: watch::Receiver<bool>) -> Result<()> {
    let addr: SocketAddr = agent
        .opts
        .listen_addr
        .parse()
        .map_err(|e| Error::with_source(ErrorKind::Validation, "invalid agent listen_addr", e))?;

    let (hb_handle, hb_shutdown) =
        heartbeat::start(agent.clone(), Duration::from_secs(agent.opts.heartbeat_interval_secs));

    let service = AgentServiceImpl::new(agent.clone());
    tracing::info!(%addr, node = %agent.opts.node_name, "agent listening");

    let result = Server::builder()
        .add_service(AgentServiceServer::new(service))
        .serve_with_shutdown(addr, async move {
            let _ = shutdown.changed().await;
            tracing::info!("agent shutting down");
        })
        .await
        .map_err(|e| Error::with_source(ErrorKind::Internal, "agent server exited with error", e));

    let _ = hb_shutdown.send(());
    let _ = hb_handle.await;
    result
}
