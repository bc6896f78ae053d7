//! Controller: authoritative cluster state (nodes, partitions, jobs,
//! steps), the scheduler, and the control-plane RPC surface (spec
//! 4.1-4.5, 6). One `Controller` value is constructed at process
//! start and threaded into every RPC handler and background task —
//! no package-level mutable state, per the design notes.

pub mod allocation;
pub mod config;
pub mod job;
pub mod launch;
pub mod metrics;
pub mod partition;
pub mod placement;
pub mod registry;
pub mod rpc;
pub mod scheduler;
pub mod state;
pub mod step;

use std::sync::Arc;

use cinder_common::credential::{CredentialSigner, HmacSha256Signer};
use cinder_common::error::Result;
use cinder_rpc_client::AgentClientPool;
use tokio::sync::mpsc;

use partition::PartitionTable;
use placement::PlacementBackend;
use registry::NodeRegistry;
use scheduler::Scheduler;
use state::ControllerState;

pub struct Controller {
    pub registry: Arc<NodeRegistry>,
    pub partitions: Arc<PartitionTable>,
    pub state: Arc<ControllerState>,
    pub scheduler: Arc<Scheduler>,
    pub signer: Arc<dyn CredentialSigner>,
    pub agent_pool: Arc<AgentClientPool>,
    /// Agent RPC address for each node, keyed by node index.
    pub agent_addrs: Vec<String>,
    pub sched_wake: mpsc::Sender<()>,
    pub opts: cinder_common::config::ControllerOpts,
}

impl Controller {
    pub fn new(
        nodes: Vec<registry::NodeRecord>,
        partitions: Vec<partition::PartitionRecord>,
        agent_addrs: Vec<String>,
        backend: Arc<dyn PlacementBackend>,
        opts: cinder_common::config::ControllerOpts,
        sched_wake: mpsc::Sender<()>,
    ) -> Result<Arc<Self>> {
        let registry = Arc::new(NodeRegistry::new(nodes));
        let partitions = Arc::new(PartitionTable::new(partitions));
        let state = Arc::new(ControllerState::new());
        let signer: Arc<dyn CredentialSigner> =
            Arc::new(HmacSha256Signer::from_hex(&opts.credential_key_hex)?);
        let scheduler = Arc::new(Scheduler::new(
            registry.clone(),
            partitions.clone(),
            state.clone(),
            backend,
            signer.clone(),
        ));
        Ok(Arc::new(Self {
            registry,
            partitions,
            state,
            scheduler,
            signer,
            agent_pool: Arc::new(AgentClientPool::new()),
            agent_addrs,
            sched_wake,
            opts,
        }))
    }

    pub fn agent_addr(&self, idx: cinder_common::ids::NodeIndex) -> Option<&str> {
        self.agent_addrs.get(idx.get() as usize).map(|s| s.as_str())
    }

    pub async fn wake_scheduler(&self) {
        let _ = self.sched_wake.try_send(());
    }
}
