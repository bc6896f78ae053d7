//! Allocation: the node set and time bounds granted to a job (spec 3).
//! Exists for the RUNNING+COMPLETING lifetime of a job.

use cinder_common::credential::Credential;
use cinder_common::ids::{JobId, NodeIndex};

#[derive(Debug, Clone)]
pub struct Allocation {
    pub job_id: JobId,
    pub nodes: Vec<NodeIndex>,
    pub node_names: Vec<String>,
    pub cpus_per_node: Vec<u32>,
    /// Credential authorizing step launches within this allocation.
    /// Reissued (new nonce) per step, not shared across steps.
    pub credential: Credential,
    pub deadline_unix: i64,
}
