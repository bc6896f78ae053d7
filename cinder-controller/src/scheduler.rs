//! Scheduler loop (spec 4.4). Single-writer pass over controller
//! state, triggered by submit, completion, or a periodic timer. The
//! sub-task spawn shape is a `JoinHandle` plus a oneshot shutdown
//! sender pushed onto a `sub_tasks` vector.

use std::sync::Arc;
use std::time::Duration;

use cinder_common::credential::{CredentialPayload, CredentialSigner};
use cinder_common::error::{Error, Result};
use cinder_common::ids::{JobId, StepId};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::job::{JobRecord, JobState};
use crate::metrics::ControllerMetrics;
use crate::partition::PartitionTable;
use crate::placement::{PlacementBackend, PlacementError, PlacementRequest};
use crate::registry::{self, NodeRegistry};
use crate::state::ControllerState;
use crate::step::StepState;

pub type SubTask = (JoinHandle<()>, oneshot::Sender<()>);

/// What the scheduler produces for one job in a pass, before it is
/// atomically applied to live state.
struct Commit {
    job_id: JobId,
    nodes: Vec<cinder_common::ids::NodeIndex>,
    cpus_per_node: Vec<u32>,
    node_names: Vec<String>,
}

pub struct Scheduler {
    pub registry: Arc<NodeRegistry>,
    pub partitions: Arc<PartitionTable>,
    pub state: Arc<ControllerState>,
    pub backend: Arc<dyn PlacementBackend>,
    pub signer: Arc<dyn CredentialSigner>,
    pub max_nonce_source: std::sync::atomic::AtomicU64,
    pub metrics: ControllerMetrics,
}

/// Notifies the scheduler loop to run a pass immediately (submit or
/// completion trigger), in addition to its periodic timer.
pub type SchedWakeRef = mpsc::Sender<()>;

impl Scheduler {
    pub fn new(
        registry: Arc<NodeRegistry>,
        partitions: Arc<PartitionTable>,
        state: Arc<ControllerState>,
        backend: Arc<dyn PlacementBackend>,
        signer: Arc<dyn CredentialSigner>,
    ) -> Self {
        Self {
            registry,
            partitions,
            state,
            backend,
            signer,
            max_nonce_source: std::sync::atomic::AtomicU64::new(1),
            metrics: ControllerMetrics::new(),
        }
    }

    fn next_nonce(&self) -> u64 {
        self.max_nonce_source
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed)
    }

    /// One scheduler pass: spec 4.4 algorithm steps 1-4.
    pub async fn run_pass(&self) -> Result<usize> {
        let _timer = self.metrics.scheduler_pass_duration.start_timer();
        let snapshot = self.registry.snapshot().await;
        let (pending, mut occupants) = {
            let tables = self.state.read().await;
            (tables.pending_queue(), node_occupant_counts(&tables.node_alloc))
        };

        let mut commits = Vec::new();
        // Tracks CPUs reserved by earlier commits in *this* pass so we
        // never double-book a node within one pass, even though the
        // live registry isn't touched until step 4.
        let mut reserved: std::collections::HashMap<cinder_common::ids::NodeIndex, u32> =
            std::collections::HashMap::new();

        for job_id in pending {
            let spec = {
                let tables = self.state.read().await;
                match tables.jobs.get(&job_id) {
                    Some(j) if j.state == JobState::Pending => j.spec.clone(),
                    _ => continue,
                }
            };

            let partition = match self.partitions.get(&spec.partition).await {
                Ok(p) if p.is_usable() && p.group_allowed(&spec.user) => p,
                Ok(_) => {
                    self.fail_job(job_id, "partition down or user not permitted").await?;
                    continue;
                }
                Err(e) => {
                    self.fail_job(job_id, &e.reason).await?;
                    continue;
                }
            };

            if let Some(dep) = spec.depends_on {
                let satisfied = {
                    let tables = self.state.read().await;
                    tables
                        .jobs
                        .get(&dep)
                        .map(|d| d.state == JobState::Completed)
                        .unwrap_or(false)
                };
                if !satisfied {
                    continue;
                }
            }

            let request = PlacementRequest {
                want_nodes_min: spec.min_nodes,
                want_nodes_max: spec.max_nodes.max(spec.min_nodes),
                cpus_per_node: spec.cpus_per_node,
                required_features: spec.features.clone(),
                include_nodes: spec.include_nodes.clone(),
                exclude_nodes: spec.exclude_nodes.clone(),
                contiguous: spec.contiguous,
                topology: None,
                exclusive: spec.exclusive,
                mem_per_cpu_mb: spec.mem_per_cpu_mb,
            };

            // Apply already-committed reservations from this pass on
            // top of the snapshot before trying to place this job.
            let adjusted = apply_reservations(&snapshot, &reserved);

            match self.backend.place(&adjusted, &partition, &request, &occupants) {
                Ok(plan) => {
                    for (&node, &cpus) in plan.nodes.iter().zip(plan.cpus_per_node.iter()) {
                        *reserved.entry(node).or_insert(0) += cpus;
                        *occupants.entry(node).or_insert(0) += 1;
                    }
                    let node_names: Vec<String> = plan
                        .nodes
                        .iter()
                        .filter_map(|idx| adjusted.iter().find(|n| n.index == *idx).map(|n| n.name.clone()))
                        .collect();
                    commits.push(Commit {
                        job_id,
                        nodes: plan.nodes,
                        cpus_per_node: plan.cpus_per_node,
                        node_names,
                    });
                }
                Err(PlacementError::NoFit) => continue,
                Err(PlacementError::TooLarge) => {
                    self.fail_job(job_id, "request exceeds partition capacity").await?;
                }
                Err(PlacementError::NoWires) => {
                    self.fail_job(job_id, "no switch wiring available for request").await?;
                }
            }
        }

        let n_commits = commits.len();
        for commit in commits {
            self.apply_commit(commit).await?;
        }
        self.metrics.scheduler_pass_commits.inc_by(n_commits as u64);
        Ok(n_commits)
    }

    async fn fail_job(&self, job_id: JobId, reason: &str) -> Result<()> {
        let mut tables = self.state.write().await;
        if let Some(job) = tables.jobs.get_mut(&job_id) {
            job.state = JobState::Failed;
            job.fail_reason = Some(reason.to_string());
            job.end_time_unix = Some(registry::now_unix());
        }
        Ok(())
    }

    async fn apply_commit(&self, commit: Commit) -> Result<()> {
        for (&node, &cpus) in commit.nodes.iter().zip(commit.cpus_per_node.iter()) {
            self.registry.reserve(node, cpus).await?;
            self.metrics.node_state_transitions.with_label_values(&["allocated"]).inc();
        }

        let deadline = {
            let tables = self.state.read().await;
            let job = tables
                .jobs
                .get(&commit.job_id)
                .ok_or_else(|| Error::internal("commit references missing job"))?;
            registry::now_unix() + job.spec.time_limit_secs as i64
        };

        let payload = CredentialPayload {
            job_id: commit.job_id,
            step_id: StepId(0),
            uid: 0,
            gid: 0,
            node_set: commit.nodes.clone(),
            deadline_unix: deadline,
            nonce: self.next_nonce(),
        };
        let credential = self.signer.sign(&payload);

        let mut tables = self.state.write().await;
        if let Some(job) = tables.jobs.get_mut(&commit.job_id) {
            job.state = JobState::Running;
            job.allocated_nodes = commit.nodes.clone();
            job.cpus_per_node = commit.cpus_per_node.clone();
            job.start_time_unix = Some(registry::now_unix());
        }
        for &node in &commit.nodes {
            tables.node_alloc.entry(node).or_default().push(commit.job_id);
        }
        tables.allocations.insert(
            commit.job_id,
            crate::allocation::Allocation {
                job_id: commit.job_id,
                nodes: commit.nodes,
                node_names: commit.node_names,
                cpus_per_node: commit.cpus_per_node,
                credential,
                deadline_unix: deadline,
            },
        );
        Ok(())
    }

    /// Advisory-only `WillRun` (spec 6): evaluates feasibility against
    /// a hypothetical snapshot that already reserves nodes for every
    /// currently-PENDING job with priority >= the hypothetical job's,
    /// since those would be scheduled first by spec 4.4's tie-break
    /// rules. Never commits.
    pub async fn will_run(
        &self,
        partition_name: &str,
        priority: i32,
        request: &PlacementRequest,
    ) -> Result<(bool, Option<i64>, Option<String>)> {
        let snapshot = self.registry.snapshot().await;
        let partition = self.partitions.get(partition_name).await?;

        let (ahead, mut occupants): (Vec<(JobRecord, crate::job::JobSpec)>, _) = {
            let tables = self.state.read().await;
            let ahead = tables
                .pending_queue()
                .into_iter()
                .filter_map(|id| tables.jobs.get(&id).cloned())
                .filter(|j| j.spec.priority >= priority)
                .map(|j| (j.clone(), j.spec.clone()))
                .collect();
            (ahead, node_occupant_counts(&tables.node_alloc))
        };

        let mut reserved: std::collections::HashMap<cinder_common::ids::NodeIndex, u32> =
            std::collections::HashMap::new();
        for (_job, spec) in &ahead {
            let adjusted = apply_reservations(&snapshot, &reserved);
            if let Ok(other_partition) = self.partitions.get(&spec.partition).await {
                let req = PlacementRequest {
                    want_nodes_min: spec.min_nodes,
                    want_nodes_max: spec.max_nodes.max(spec.min_nodes),
                    cpus_per_node: spec.cpus_per_node,
                    required_features: spec.features.clone(),
                    include_nodes: spec.include_nodes.clone(),
                    exclude_nodes: spec.exclude_nodes.clone(),
                    contiguous: spec.contiguous,
                    topology: None,
                    exclusive: spec.exclusive,
                    mem_per_cpu_mb: spec.mem_per_cpu_mb,
                };
                if let Ok(plan) = self.backend.place(&adjusted, &other_partition, &req, &occupants) {
                    for (&node, &cpus) in plan.nodes.iter().zip(plan.cpus_per_node.iter()) {
                        *reserved.entry(node).or_insert(0) += cpus;
                        *occupants.entry(node).or_insert(0) += 1;
                    }
                }
            }
        }

        let adjusted = apply_reservations(&snapshot, &reserved);
        match self.backend.place(&adjusted, &partition, request, &occupants) {
            Ok(_) => Ok((true, Some(registry::now_unix()), None)),
            Err(PlacementError::NoFit) => Ok((
                false,
                None,
                Some("insufficient idle capacity right now".to_string()),
            )),
            Err(PlacementError::TooLarge) => {
                Ok((false, None, Some("request exceeds partition capacity".to_string())))
            }
            Err(PlacementError::NoWires) => {
                Ok((false, None, Some("no switch wiring available".to_string())))
            }
        }
    }

    /// Node-failure sweeper (spec 5): a node that misses
    /// `slurmd_timeout_secs` worth of heartbeats fails every step
    /// running on it. Unless the job was submitted with `--no-kill`,
    /// the whole job is marked NODE_FAIL and its surviving nodes are
    /// released back to the pool; with `--no-kill` only the step
    /// running on the dead node fails and the job carries on.
    pub async fn sweep_node_failures(&self, timeout_secs: u64) -> Result<Vec<JobId>> {
        let newly_down = self.registry.sweep_heartbeats(registry::now_unix(), timeout_secs).await;
        if newly_down.is_empty() {
            return Ok(Vec::new());
        }
        let down: std::collections::HashSet<_> = newly_down.into_iter().collect();

        for _ in &down {
            self.metrics.node_state_transitions.with_label_values(&["no_respond"]).inc();
        }

        let mut tables = self.state.write().await;
        for step in tables.steps.values_mut() {
            if !matches!(step.state, StepState::Ended | StepState::Failed | StepState::NodeFail)
                && step.nodes().any(|n| down.contains(&n))
            {
                step.state = StepState::NodeFail;
            }
        }

        let mut failed_jobs = Vec::new();
        let mut released: Vec<(cinder_common::ids::NodeIndex, u32)> = Vec::new();
        for job in tables.jobs.values_mut() {
            if job.state != JobState::Running {
                continue;
            }
            if !job.allocated_nodes.iter().any(|n| down.contains(n)) {
                continue;
            }
            if job.spec.no_kill {
                // Only the step on the failed node died; the job's
                // allocation is untouched so its other steps continue.
                continue;
            }
            job.state = JobState::NodeFail;
            job.end_time_unix = Some(registry::now_unix());
            job.fail_reason = Some("node failure".to_string());
            released.extend(job.allocated_nodes.iter().copied().zip(job.cpus_per_node.iter().copied()));
            failed_jobs.push(job.id);
        }
        for &job_id in &failed_jobs {
            tables.allocations.remove(&job_id);
        }
        for (node, _) in &released {
            if let Some(occupants) = tables.node_alloc.get_mut(node) {
                occupants.retain(|&j| !failed_jobs.contains(&j));
            }
        }
        drop(tables);

        for (node, cpus) in released {
            self.registry.release(node, cpus).await?;
        }
        self.metrics.node_failure_jobs.inc_by(failed_jobs.len() as u64);
        Ok(failed_jobs)
    }

    /// Deadline sweeper (spec 4.4): scans RUNNING jobs every 30s,
    /// transitions overdue ones to TIMEOUT.
    pub async fn sweep_deadlines(&self) -> Result<Vec<JobId>> {
        let now = registry::now_unix();
        let running = {
            let tables = self.state.read().await;
            tables.running_jobs()
        };
        let mut timed_out = Vec::new();
        let mut tables = self.state.write().await;
        for job_id in running {
            if let Some(job) = tables.jobs.get_mut(&job_id) {
                if let Some(start) = job.start_time_unix {
                    if start + job.spec.time_limit_secs as i64 <= now {
                        job.state = JobState::Timeout;
                        job.end_time_unix = Some(now);
                        timed_out.push(job_id);
                    }
                }
            }
        }
        Ok(timed_out)
    }
}

fn apply_reservations(
    snapshot: &registry::NodeSnapshot,
    reserved: &std::collections::HashMap<cinder_common::ids::NodeIndex, u32>,
) -> registry::NodeSnapshot {
    if reserved.is_empty() {
        return snapshot.clone();
    }
    let mut views: Vec<_> = snapshot.as_ref().clone();
    for view in &mut views {
        if let Some(&cpus) = reserved.get(&view.index) {
            view.cpus_free = view.cpus_free.saturating_sub(cpus);
            if view.cpus_free == 0 {
                view.base = registry::BaseState::Allocated;
            } else {
                view.base = registry::BaseState::Mixed;
            }
        }
    }
    Arc::new(views)
}

/// Counts distinct jobs currently allocated to each node (spec 3's
/// `node_alloc`), the baseline a placement pass layers per-pass
/// cotenancy on top of to enforce `partition.share`.
fn node_occupant_counts(
    node_alloc: &std::collections::HashMap<cinder_common::ids::NodeIndex, Vec<JobId>>,
) -> std::collections::HashMap<cinder_common::ids::NodeIndex, u32> {
    node_alloc.iter().map(|(&node, jobs)| (node, jobs.len() as u32)).collect()
}

/// Spawns the periodic scheduler-pass + deadline/heartbeat-sweeper
/// timer, returning a `SubTask` the caller pushes onto its shutdown
/// list.
pub fn start_periodic(
    scheduler: Arc<Scheduler>,
    sched_interval: Duration,
    sweep_interval: Duration,
    slurmd_timeout_secs: u64,
) -> SubTask {
    let (shutdown_tx, mut shutdown_rx) = oneshot::channel();
    let handle = tokio::spawn(async move {
        let mut sched_tick = tokio::time::interval(sched_interval);
        let mut sweep_tick = tokio::time::interval(sweep_interval);
        loop {
            tokio::select! {
                _ = &mut shutdown_rx => {
                    tracing::info!("scheduler periodic task shutting down");
                    return;
                }
                _ = sched_tick.tick() => {
                    match scheduler.run_pass().await {
                        Ok(n) if n > 0 => tracing::info!(commits = n, "scheduler pass committed allocations"),
                        Ok(_) => {}
                        Err(e) => tracing::error!(error = %e, "scheduler pass failed"),
                    }
                }
                _ = sweep_tick.tick() => {
                    match scheduler.sweep_deadlines().await {
                        Ok(timed_out) if !timed_out.is_empty() => {
                            tracing::warn!(?timed_out, "jobs exceeded their time limit");
                        }
                        Ok(_) => {}
                        Err(e) => tracing::error!(error = %e, "deadline sweep failed"),
                    }
                    match scheduler.sweep_node_failures(slurmd_timeout_secs).await {
                        Ok(failed) if !failed.is_empty() => {
                            tracing::warn!(?failed, "jobs failed due to unresponsive nodes");
                        }
                        Ok(_) => {}
                        Err(e) => tracing::error!(error = %e, "node-failure sweep failed"),
                    }
                }
            }
        }
    });
    (handle, shutdown_tx)
}
