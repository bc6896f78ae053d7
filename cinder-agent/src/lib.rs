//! Node agent: one per compute node (spec 4.5). Owns local task
//! processes, enforces resource limits, verifies launch credentials,
//! and reports heartbeats/launch results/step endings back to the
//! controller. One `Agent` value per process, threaded into every RPC
//! handler and background task, per the design notes' "no
//! package-level mutable state" rule.

pub mod credential_cache;
pub mod exit_codes;
pub mod heartbeat;
pub mod launch;
pub mod rpc;
pub mod signal;
pub mod tasks;

use std::sync::Arc;

use cinder_common::credential::CredentialSigner;
use cinder_common::config::AgentOpts;
use cinder_rpc_client::ControllerClient;

use credential_cache::CredentialCache;
use exit_codes::ExitCodeTable;
use tasks::StepTable;

pub struct Agent {
    pub opts: AgentOpts,
    pub signer: Arc<dyn CredentialSigner>,
    pub steps: Arc<StepTable>,
    pub seen_credentials: Arc<CredentialCache>,
    pub exit_codes: Arc<ExitCodeTable>,
    pub controller: ControllerClient,
}

impl Agent {
    pub fn new(opts: AgentOpts, signer: Arc<dyn CredentialSigner>, controller: ControllerClient) -> Self {
        Self {
            opts,
            signer,
            steps: Arc::new(StepTable::new()),
            seen_credentials: Arc::new(CredentialCache::new()),
            exit_codes: Arc::new(ExitCodeTable::new()),
            controller,
        }
    }
}
