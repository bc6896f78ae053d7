//! Controller process startup: binds the gRPC listener, boots the
//! metrics endpoint, and spawns the scheduler's periodic sub-task. One
//! function owns the whole server lifetime and returns only on
//! shutdown signal.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use cinder_common::error::{Error, ErrorKind, Result};
use cinder_pb::controller::controller_service_server::ControllerServiceServer;
use tokio::sync::watch;
use tonic::transport::Server;

use crate::rpc::service::ControllerServiceImpl;
use crate::scheduler;
use crate::Controller;

/// Runs the controller's gRPC server until `shutdown` fires or
/// `ctrl_c` is received, whichever comes first. Spawns (and tears
/// down) the scheduler periodic task for the duration of the call.
pub async fn serve(controller: Arc<Controller>, mut shutdown: watch::Receiver<bool>) -> Result<()> {
    let addr: SocketAddr = controller
        .opts
        .listen_addr
        .parse()
        .map_err(|e| Error::with_source(ErrorKind::Validation, "invalid controller listen_addr", e))?;

    if let Some(metrics_addr) = controller.opts.prometheus_addr.as_deref() {
        let metrics_addr: SocketAddr = metrics_addr
            .parse()
            .map_err(|e| Error::with_source(ErrorKind::Validation, "invalid prometheus_addr", e))?;
        cinder_common::metrics::MetricsManager::boot_metrics_service(
            metrics_addr,
            prometheus::default_registry().clone(),
        );
    }

    let (sched_handle, sched_shutdown) = scheduler::start_periodic(
        controller.scheduler.clone(),
        Duration::from_secs(controller.opts.sched_interval_secs),
        Duration::from_secs(controller.opts.deadline_sweep_secs),
        controller.opts.slurmd_timeout_secs,
    );

    let service = ControllerServiceImpl::new(controller.clone());
    tracing::info!(%addr, "controller listening");

    let result = Server::builder()
        .add_service(ControllerServiceServer::new(service))
        .serve_with_shutdown(addr, async move {
            let _ = shutdown.changed().await;
            tracing::info!("controller shutting down");
        })
        .await
        .map_err(|e| Error::with_source(ErrorKind::Internal, "controller server exited with error", e));

    let _ = sched_shutdown.send(());
    let _ = sched_handle.await;
    result
}
