//! Per-step exit-code aggregation (spec 4.5: "node agents report
//! aggregated exit status to the controller"). Each local task's exit
//! code is recorded as its reaper observes it; once every task this
//! node is responsible for has reported, the aggregate is handed to
//! the caller and the entry is dropped.

use std::collections::HashMap;

use cinder_common::ids::StepKey;
use parking_lot::Mutex;

#[derive(Default)]
struct StepExitCodes {
    by_global_id: HashMap<u32, i32>,
}

#[derive(Default)]
pub struct ExitCodeTable {
    steps: Mutex<HashMap<StepKey, StepExitCodes>>,
}

impl ExitCodeTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, key: StepKey, global_id: u32, exit_code: i32) {
        self.steps
            .lock()
            .entry(key)
            .or_default()
            .by_global_id
            .insert(global_id, exit_code);
    }

    /// `true` once `local_task_count` distinct tasks have reported for
    /// `key`.
    pub fn all_reported(&self, key: StepKey, local_task_count: usize) -> bool {
        self.steps
            .lock()
            .get(&key)
            .map(|s| s.by_global_id.len() >= local_task_count)
            .unwrap_or(false)
    }

    /// Drains the recorded codes for `key` in global-id order.
    pub fn take(&self, key: StepKey) -> Vec<i32> {
        let Some(entry) = self.steps.lock().remove(&key) else {
            return Vec::new();
        };
        let mut pairs: Vec<(u32, i32)> = entry.by_global_id.into_iter().collect();
        pairs.sort_unstable_by_key(|(id, _)| *id);
        pairs.into_iter().map(|(_, code)| code).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cinder_common::ids::{JobId, StepId};

    fn key() -> StepKey {
        StepKey {
            job_id: JobId(1),
            step_id: StepId(0),
        }
    }

    #[test]
    fn reports_in_global_id_order_once_complete() {
        let table = ExitCodeTable::new();
        table.record(key(), 2, 7);
        assert!(!table.all_reported(key(), 2));
        table.record(key(), 0, 0);
        assert!(table.all_reported(key(), 2));
        assert_eq!(table.take(key()), vec![0, 7]);
        assert!(!table.all_reported(key(), 2));
    }
}
