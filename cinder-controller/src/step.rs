//! Step and task data model (spec 3). One parallel execution within an
//! allocation; owns tasks. Keyed by `(JobId, StepId)` in the
//! controller's `steps` nested mapping, never by pointer.

use std::collections::HashMap;

use cinder_common::ids::{JobId, NodeIndex, StepId, TaskGlobalId};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepState {
    Launching,
    Starting,
    Running,
    Ended,
    Failed,
    /// A node running this step missed its heartbeat deadline (spec 5).
    NodeFail,
}

#[derive(Debug, Clone)]
pub struct TaskRecord {
    pub global_id: TaskGlobalId,
    pub local_id: u32,
    pub node: NodeIndex,
    pub pid: Option<u32>,
    pub exit_status: Option<i32>,
}

#[derive(Debug, Clone)]
pub struct StepRecord {
    pub job_id: JobId,
    pub step_id: StepId,
    pub task_count: u32,
    pub tasks_per_node: Vec<u32>,
    pub tasks: Vec<TaskRecord>,
    pub state: StepState,
    pub io_mode: String,
    pub stdin_mode: String,
    pub shim_node: NodeIndex,
    pub shim_io_endpoint: String,
    pub shim_pmi_endpoint: String,
    /// Per-node launch confirmation state, for the at-most-once launch
    /// protocol of spec 4.5.
    pub launch_confirmed: HashMap<NodeIndex, bool>,
}

impl StepRecord {
    pub fn nodes(&self) -> impl Iterator<Item = NodeIndex> + '_ {
        self.tasks.iter().map(|t| t.node)
    }

    pub fn all_launches_confirmed(&self) -> bool {
        self.launch_confirmed.values().all(|&v| v)
    }

    pub fn all_tasks_exited(&self) -> bool {
        self.tasks.iter().all(|t| t.exit_status.is_some())
    }
}
