//! Step shim: one per job step, spawned by the node agent on the
//! step's lead node (spec 2, 4.6, 4.7). Hosts the per-step PMI KV
//! store and barrier, the legacy PMGR collective dialect, and the
//! task I/O fan-out every task in the step dials into before it
//! execs. One `Shim` value per process.

pub mod barrier;
pub mod io;
pub mod kvs;
pub mod pmgr;
pub mod pmi;
pub mod signal;

use std::sync::Arc;

use cinder_common::config::ShimOpts;
use cinder_rpc_client::ControllerClient;

use barrier::Barrier;
use io::{IoContext, IoMode, IoRouter, StdinMode};
use kvs::Kvs;
use pmgr::PmgrCoordinator;
use pmi::PmiServer;
use signal::SignalRelay;

pub struct StepIdentity {
    pub job_id: u64,
    pub step_id: u32,
    pub task_count: u32,
}

pub struct Shim {
    pub opts: ShimOpts,
    pub identity: StepIdentity,
    pub kvs: Arc<Kvs>,
    pub barrier: Arc<Barrier>,
    pub pmgr: Arc<PmgrCoordinator>,
    pub pmi: Arc<PmiServer>,
    pub io: Arc<IoRouter>,
}

impl Shim {
    pub fn new(
        opts: ShimOpts,
        identity: StepIdentity,
        io_mode: IoMode,
        stdin_mode: StdinMode,
        controller: Option<ControllerClient>,
    ) -> Self {
        let kvs = Arc::new(Kvs::new(opts.max_key_bytes, opts.max_value_bytes));
        let size = identity.task_count as usize;
        let barrier = Arc::new(Barrier::new(size, kvs.clone()));
        let pmgr = Arc::new(PmgrCoordinator::new(size));
        let pmi = Arc::new(PmiServer {
            kvs: kvs.clone(),
            barrier: barrier.clone(),
            size: identity.task_count,
            max_frame_bytes: opts.max_frame_bytes,
        });
        let relay = controller.map(|c| {
            SignalRelay::new(identity.job_id, identity.step_id, opts.sigint_escalate_secs, c)
        });
        let io_ctx = IoContext {
            job_id: identity.job_id,
            step_id: identity.step_id,
        };
        let io = IoRouter::new(io_ctx, io_mode, stdin_mode, relay);
        Self {
            opts,
            identity,
            kvs,
            barrier,
            pmgr,
            pmi,
            io,
        }
    }

    /// Binds both listeners and runs them to completion; returns once
    /// both accept loops exit (normally only on a bind/accept error,
    /// since the shim has no controlled shutdown path of its own — the
    /// node agent that spawned it owns its lifetime).
    pub async fn serve(self: Arc<Self>) -> cinder_common::error::Result<()> {
        let (pmi_listener, pmi_addr) = PmiServer::bind(&self.opts.pmi_listen_addr).await?;
        let (io_listener, io_addr) = IoRouter::bind(&self.opts.io_listen_addr).await?;
        tracing::info!(
            job_id = self.identity.job_id,
            step_id = self.identity.step_id,
            %pmi_addr,
            %io_addr,
            "step shim listening"
        );
        let pmi = self.pmi.clone();
        let io = self.io.clone();
        tokio::join!(pmi.serve(pmi_listener), io.serve(io_listener));
        Ok(())
    }
}
