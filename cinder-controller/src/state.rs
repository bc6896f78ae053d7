//! Controller-owned state store (spec 4.3): `jobs`, `nodeAlloc`,
//! `steps`, with the secondary indices the scheduler and query RPCs
//! need. A single `tokio::sync::RwLock` is the coarse write lock
//! described in spec 5 — the scheduler loop is the sole holder of the
//! write side during a pass; RPC query handlers take the read side.

use std::collections::HashMap;

use cinder_common::ids::{JobId, NodeIndex, StepId, StepKey};
use tokio::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::allocation::Allocation;
use crate::job::{JobRecord, JobState};
use crate::step::StepRecord;

#[derive(Default)]
pub struct Tables {
    pub jobs: HashMap<JobId, JobRecord>,
    pub steps: HashMap<StepKey, StepRecord>,
    pub node_alloc: HashMap<NodeIndex, Vec<JobId>>,
    pub allocations: HashMap<JobId, Allocation>,
    next_job_id: u64,
}

impl Tables {
    /// Pending queue ordered by priority desc, then submit time asc,
    /// then job id asc — the deterministic tie-break of spec 4.4.
    pub fn pending_queue(&self) -> Vec<JobId> {
        let mut ids: Vec<&JobRecord> = self
            .jobs
            .values()
            .filter(|j| j.state == JobState::Pending)
            .collect();
        ids.sort_by(|a, b| {
            b.spec
                .priority
                .cmp(&a.spec.priority)
                .then(a.submit_time_unix.cmp(&b.submit_time_unix))
                .then(a.id.cmp(&b.id))
        });
        ids.into_iter().map(|j| j.id).collect()
    }

    pub fn running_jobs(&self) -> Vec<JobId> {
        self.jobs
            .values()
            .filter(|j| j.state == JobState::Running)
            .map(|j| j.id)
            .collect()
    }
}

pub struct ControllerState {
    tables: RwLock<Tables>,
}

impl ControllerState {
    pub fn new() -> Self {
        Self {
            tables: RwLock::new(Tables {
                next_job_id: 1,
                ..Default::default()
            }),
        }
    }

    pub async fn read(&self) -> RwLockReadGuard<'_, Tables> {
        self.tables.read().await
    }

    pub async fn write(&self) -> RwLockWriteGuard<'_, Tables> {
        self.tables.write().await
    }

    pub async fn allocate_job_id(&self) -> JobId {
        let mut tables = self.tables.write().await;
        let id = tables.next_job_id;
        tables.next_job_id += 1;
        JobId(id)
    }
}

impl Default for ControllerState {
    fn default() -> Self {
        Self::new()
    }
}
