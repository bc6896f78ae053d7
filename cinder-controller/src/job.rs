//! Job data model (spec 3, 4.3). `JobSpec` is what a submitter sends;
//! `JobRecord` is the controller's authoritative, arena-owned view —
//! cross-references to nodes/steps are indices/ids, never pointers,
//! per the design notes.

use std::collections::HashMap;

use cinder_common::ids::{JobId, NodeIndex};

use crate::partition::SharePolicy;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobState {
    Pending,
    Running,
    Completing,
    Completed,
    Failed,
    Cancelled,
    Timeout,
    NodeFail,
}

#[derive(Debug, Clone)]
pub struct JobSpec {
    pub user: String,
    pub uid: u32,
    pub gid: u32,
    pub partition: String,
    pub min_nodes: u32,
    pub max_nodes: u32,
    pub cpus_per_node: u32,
    pub time_limit_secs: u64,
    pub depends_on: Option<JobId>,
    pub features: Vec<String>,
    pub include_nodes: Vec<String>,
    pub exclude_nodes: Vec<String>,
    pub priority: i32,
    pub nice: i32,
    pub contiguous: bool,
    pub share: SharePolicy,
    /// A node-fail only fails this job's step, not the whole job.
    pub no_kill: bool,
    /// Fail immediately instead of queueing if not schedulable now.
    pub immediate: bool,
    /// Job-level request for whole-node allocation.
    pub exclusive: bool,
    pub mem_per_cpu_mb: u64,
    pub licenses: String,
    pub name: String,
    pub argv: Vec<String>,
    pub env: HashMap<String, String>,
    pub cwd: String,
}

#[derive(Debug, Clone)]
pub struct JobRecord {
    pub id: JobId,
    pub spec: JobSpec,
    pub state: JobState,
    pub submit_time_unix: i64,
    pub start_time_unix: Option<i64>,
    pub end_time_unix: Option<i64>,
    pub fail_reason: Option<String>,
    /// Non-empty iff state is in {Running, Completing}; invariant
    /// enforced by the scheduler/state store, never set elsewhere.
    pub allocated_nodes: Vec<NodeIndex>,
    pub cpus_per_node: Vec<u32>,
    pub exit_status: Option<i32>,
}

impl JobRecord {
    pub fn has_allocation(&self) -> bool {
        matches!(self.state, JobState::Running | JobState::Completing)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self.state,
            JobState::Completed
                | JobState::Failed
                | JobState::Cancelled
                | JobState::Timeout
                | JobState::NodeFail
        )
    }
}
