//! Per-step task bookkeeping the agent keeps locally: which pids
//! belong to which step, so `Signal`/`Terminate` RPCs (spec 4.5) can
//! find them without a round trip through the controller. The step
//! shim owns each task's *logical* state for aggregation (spec 3);
//! this table only owns the OS-level pid set and a task count used to
//! derive the free-CPU figure reported on heartbeats.

use std::collections::HashMap;

use cinder_common::ids::{StepKey, TaskGlobalId};
use parking_lot::RwLock;

#[derive(Debug, Clone)]
pub struct TaskHandle {
    pub global_id: TaskGlobalId,
    pub local_id: u32,
    pub pid: u32,
}

struct StepEntry {
    tasks: Vec<TaskHandle>,
}

#[derive(Default)]
pub struct StepTable {
    steps: RwLock<HashMap<StepKey, StepEntry>>,
}

impl StepTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, key: StepKey, tasks: Vec<TaskHandle>) {
        self.steps.write().insert(key, StepEntry { tasks });
    }

    pub fn pids(&self, key: &StepKey) -> Vec<u32> {
        self.steps
            .read()
            .get(key)
            .map(|e| e.tasks.iter().map(|t| t.pid).collect())
            .unwrap_or_default()
    }

    pub fn remove(&self, key: &StepKey) -> Option<Vec<TaskHandle>> {
        self.steps.write().remove(key).map(|e| e.tasks)
    }

    pub fn contains(&self, key: &StepKey) -> bool {
        self.steps.read().contains_key(key)
    }

    /// Total local task count across all steps this agent is
    /// currently running, used to derive the `cpus_free` heartbeat
    /// figure under the simplifying assumption of one CPU per task
    /// (the node agent doesn't see the partition's CPU-binding policy,
    /// only the controller does).
    pub fn local_task_count(&self) -> u32 {
        self.steps.read().values().map(|e| e.tasks.len() as u32).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cinder_common::ids::{JobId, StepId};

    fn key(job: u64, step: u32) -> StepKey {
        StepKey {
            job_id: JobId(job),
            step_id: StepId(step),
        }
    }

    #[test]
    fn insert_and_remove_round_trip() {
        let table = StepTable::new();
        let k = key(1, 0);
        table.insert(
            k,
            vec![TaskHandle {
                global_id: TaskGlobalId(0),
                local_id: 0,
                pid: 4242,
            }],
        );
        assert_eq!(table.pids(&k), vec![4242]);
        assert_eq!(table.local_task_count(), 1);
        assert!(table.remove(&k).is_some());
        assert!(!table.contains(&k));
        assert_eq!(table.local_task_count(), 0);
    }
}
