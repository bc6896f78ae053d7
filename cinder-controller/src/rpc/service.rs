//! `ControllerService` tonic implementation (spec 6). One method per
//! RPC, each a thin translation between wire messages and the
//! controller's internal tables; all real work happens in
//! `scheduler`/`launch`/`registry`/`partition`.

use std::time::Duration;

use cinder_common::error::{Error, Result as CinderResult};
use cinder_common::ids::{JobId, NodeIndex, StepId, StepKey};
use tonic::{Request, Response, Status};

use cinder_pb::common;
use cinder_pb::controller::controller_service_server::ControllerService;
use cinder_pb::controller::*;

use crate::job::{JobRecord, JobSpec, JobState};
use crate::launch::{self, StepLaunchSpec};
use crate::partition::{parse_availability, SharePolicy};
use crate::registry;
use crate::step::{StepRecord, StepState, TaskRecord};
use crate::Controller;

pub struct ControllerServiceImpl {
    controller: std::sync::Arc<Controller>,
}

impl ControllerServiceImpl {
    pub fn new(controller: std::sync::Arc<Controller>) -> Self {
        Self { controller }
    }
}

fn spec_from_pb(pb: cinder_pb::controller::JobSpec) -> CinderResult<JobSpec> {
    Ok(JobSpec {
        user: pb.user,
        uid: pb.uid,
        gid: pb.gid,
        partition: pb.partition,
        min_nodes: pb.min_nodes.max(1),
        max_nodes: if pb.max_nodes == 0 { pb.min_nodes.max(1) } else { pb.max_nodes },
        cpus_per_node: pb.cpus_per_node.max(1),
        time_limit_secs: pb.time_limit_secs,
        depends_on: pb.depends_on.map(JobId),
        features: pb.features,
        include_nodes: pb.include_nodes,
        exclude_nodes: pb.exclude_nodes,
        priority: pb.priority,
        nice: pb.nice,
        contiguous: pb.contiguous,
        share: SharePolicy::parse(&pb.share)?,
        no_kill: pb.no_kill,
        immediate: pb.immediate,
        exclusive: pb.exclusive,
        mem_per_cpu_mb: pb.mem_per_cpu_mb,
        licenses: pb.licenses,
        name: pb.name,
        argv: pb.argv,
        env: pb.env,
        cwd: pb.cwd,
    })
}

fn allocation_to_pb(alloc: &crate::allocation::Allocation) -> Allocation {
    Allocation {
        job_id: alloc.job_id.get(),
        node_names: alloc.node_names.clone(),
        cpus_per_node: alloc.cpus_per_node.clone(),
        deadline_unix: alloc.deadline_unix,
        credential: Some(alloc.credential.clone().into()),
    }
}

fn node_host(addr: &str) -> &str {
    addr.split(':').next().unwrap_or(addr)
}

#[tonic::async_trait]
impl ControllerService for ControllerServiceImpl {
    async fn submit_job(
        &self,
        request: Request<SubmitJobRequest>,
    ) -> Result<Response<SubmitJobResponse>, Status> {
        let req = request.into_inner();
        let pb_spec = req.spec.ok_or_else(|| Error::validation("missing job spec"))?;
        let result = async {
            let spec = spec_from_pb(pb_spec)?;
            self.controller.partitions.get(&spec.partition).await?;
            if spec.immediate {
                let snapshot = self.controller.registry.snapshot().await;
                let partition = self.controller.partitions.get(&spec.partition).await?;
                let placement_req = crate::placement::PlacementRequest {
                    want_nodes_min: spec.min_nodes,
                    want_nodes_max: spec.max_nodes,
                    cpus_per_node: spec.cpus_per_node,
                    required_features: spec.features.clone(),
                    include_nodes: spec.include_nodes.clone(),
                    exclude_nodes: spec.exclude_nodes.clone(),
                    contiguous: spec.contiguous,
                    topology: None,
                    exclusive: spec.exclusive,
                    mem_per_cpu_mb: spec.mem_per_cpu_mb,
                };
                let occupants = {
                    let tables = self.controller.state.read().await;
                    tables
                        .node_alloc
                        .iter()
                        .map(|(&node, jobs)| (node, jobs.len() as u32))
                        .collect()
                };
                if self
                    .controller
                    .scheduler
                    .backend
                    .place(&snapshot, &partition, &placement_req, &occupants)
                    .is_err()
                {
                    return Err(Error::transient("not immediately schedulable"));
                }
            }
            let job_id = self.controller.state.allocate_job_id().await;
            let record = JobRecord {
                id: job_id,
                spec,
                state: JobState::Pending,
                submit_time_unix: registry::now_unix(),
                start_time_unix: None,
                end_time_unix: None,
                fail_reason: None,
                allocated_nodes: vec![],
                cpus_per_node: vec![],
                exit_status: None,
            };
            self.controller.state.write().await.jobs.insert(job_id, record);
            self.controller.wake_scheduler().await;
            Ok(job_id)
        }
        .await;

        let reply = match result {
            Ok(job_id) => SubmitJobResponse {
                result: Some(submit_job_response::Result::JobId(job_id.get())),
            },
            Err(e) => SubmitJobResponse {
                result: Some(submit_job_response::Result::Rejected(common::Status::from(&e))),
            },
        };
        Ok(Response::new(reply))
    }

    async fn allocate_blocking(
        &self,
        request: Request<AllocateBlockingRequest>,
    ) -> Result<Response<AllocateBlockingResponse>, Status> {
        let req = request.into_inner();
        let pb_spec = req.spec.ok_or_else(|| Error::validation("missing job spec"))?;
        let spec = spec_from_pb(pb_spec).map_err(Status::from)?;
        self.controller
            .partitions
            .get(&spec.partition)
            .await
            .map_err(Status::from)?;

        let job_id = self.controller.state.allocate_job_id().await;
        let record = JobRecord {
            id: job_id,
            spec,
            state: JobState::Pending,
            submit_time_unix: registry::now_unix(),
            start_time_unix: None,
            end_time_unix: None,
            fail_reason: None,
            allocated_nodes: vec![],
            cpus_per_node: vec![],
            exit_status: None,
        };
        self.controller.state.write().await.jobs.insert(job_id, record);
        self.controller.wake_scheduler().await;

        let timeout = Duration::from_millis(req.timeout_ms.max(1));
        let deadline = tokio::time::Instant::now() + timeout;
        let result = loop {
            {
                let tables = self.controller.state.read().await;
                if let Some(job) = tables.jobs.get(&job_id) {
                    if let Some(alloc) = tables.allocations.get(&job_id) {
                        break AllocateBlockingResponse {
                            result: Some(allocate_blocking_response::Result::Allocation(
                                allocation_to_pb(alloc),
                            )),
                        };
                    }
                    if job.is_terminal() {
                        break AllocateBlockingResponse {
                            result: Some(allocate_blocking_response::Result::Rejected(
                                common::Status {
                                    kind: common::ErrorKind::Policy as i32,
                                    reason: job.fail_reason.clone().unwrap_or_default(),
                                },
                            )),
                        };
                    }
                }
            }
            if tokio::time::Instant::now() >= deadline {
                break AllocateBlockingResponse {
                    result: Some(allocate_blocking_response::Result::TimedOut(true)),
                };
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        };
        Ok(Response::new(result))
    }

    async fn will_run(
        &self,
        request: Request<WillRunRequest>,
    ) -> Result<Response<WillRunResponse>, Status> {
        let req = request.into_inner();
        let pb_spec = req.spec.ok_or_else(|| Error::validation("missing job spec"))?;
        let spec = spec_from_pb(pb_spec).map_err(Status::from)?;
        let placement_req = crate::placement::PlacementRequest {
            want_nodes_min: spec.min_nodes,
            want_nodes_max: spec.max_nodes,
            cpus_per_node: spec.cpus_per_node,
            required_features: spec.features.clone(),
            include_nodes: spec.include_nodes.clone(),
            exclude_nodes: spec.exclude_nodes.clone(),
            contiguous: spec.contiguous,
            topology: None,
            exclusive: spec.exclusive,
            mem_per_cpu_mb: spec.mem_per_cpu_mb,
        };
        let (feasible, expected_start, reason) = self
            .controller
            .scheduler
            .will_run(&spec.partition, spec.priority, &placement_req)
            .await
            .map_err(Status::from)?;
        Ok(Response::new(WillRunResponse {
            feasible,
            expected_start_unix: expected_start.unwrap_or(0),
            reason: reason.unwrap_or_default(),
        }))
    }

    async fn lookup_allocation(
        &self,
        request: Request<LookupAllocationRequest>,
    ) -> Result<Response<LookupAllocationResponse>, Status> {
        let req = request.into_inner();
        let job_id = JobId(req.job_id);
        let tables = self.controller.state.read().await;
        let result = match tables.allocations.get(&job_id) {
            Some(alloc) => {
                if alloc.deadline_unix <= registry::now_unix() {
                    lookup_allocation_response::Result::Expired(true)
                } else {
                    lookup_allocation_response::Result::Allocation(allocation_to_pb(alloc))
                }
            }
            None => lookup_allocation_response::Result::NotFound(true),
        };
        Ok(Response::new(LookupAllocationResponse { result: Some(result) }))
    }

    async fn launch_step(
        &self,
        request: Request<LaunchStepRequest>,
    ) -> Result<Response<LaunchStepResponse>, Status> {
        let req = request.into_inner();
        let step_spec = req.spec.ok_or_else(|| Error::validation("missing step spec"))?;
        let pb_credential = req.credential.ok_or_else(|| Error::validation("missing credential"))?;
        let credential: cinder_common::credential::Credential = pb_credential.into();
        self.controller
            .signer
            .verify(&credential)
            .map_err(Status::from)?;

        let job_id = JobId(step_spec.job_id);
        let result = async {
            let alloc = {
                let tables = self.controller.state.read().await;
                tables
                    .allocations
                    .get(&job_id)
                    .cloned()
                    .ok_or_else(|| Error::validation("job has no active allocation"))?
            };
            if alloc.deadline_unix <= registry::now_unix() {
                return Err(Error::integrity("allocation has expired"));
            }

            let step_id = StepId(
                (self.controller.state.read().await.steps.len() as u32)
                    .wrapping_add(1),
            );
            let tasks_per_node = if step_spec.tasks_per_node.is_empty() {
                vec![1u32; alloc.nodes.len()]
            } else {
                step_spec.tasks_per_node.clone()
            };
            let nodes: Vec<(NodeIndex, String, String)> = alloc
                .nodes
                .iter()
                .zip(alloc.node_names.iter())
                .filter_map(|(&idx, name)| {
                    self.controller
                        .agent_addr(idx)
                        .map(|addr| (idx, name.clone(), addr.to_string()))
                })
                .collect();
            let shim_node = nodes.first().map(|(idx, _, _)| *idx).unwrap_or(NodeIndex(0));
            let shim_host = nodes.first().map(|(_, _, addr)| node_host(addr).to_string()).unwrap_or_default();
            let io_endpoint = format!("{shim_host}:6820");
            let pmi_endpoint = format!("{shim_host}:6819");

            let launch_spec = StepLaunchSpec {
                job_id,
                step_id,
                argv: step_spec.argv.clone(),
                env: step_spec.env.clone(),
                cwd: step_spec.cwd.clone(),
                nodes: nodes.clone(),
                tasks_per_node: tasks_per_node.clone(),
                io_endpoint: io_endpoint.clone(),
                pmi_endpoint: pmi_endpoint.clone(),
                io_mode: step_spec.io_mode.clone(),
                stdin_mode: step_spec.stdin_mode.clone(),
                deadline_unix: alloc.deadline_unix,
            };
            let outcome = launch::launch_step(
                &launch_spec,
                self.controller.signer.as_ref(),
                self.controller.agent_pool.clone(),
                Duration::from_secs(self.controller.opts.launch_timeout_secs),
            )
            .await?;

            let mut task_id = 0u32;
            let mut tasks = Vec::new();
            for (pos, (idx, _, _)) in nodes.iter().enumerate() {
                let count = tasks_per_node.get(pos).copied().unwrap_or(0);
                for local in 0..count {
                    tasks.push(TaskRecord {
                        global_id: cinder_common::ids::TaskGlobalId(task_id),
                        local_id: local,
                        node: *idx,
                        pid: None,
                        exit_status: None,
                    });
                    task_id += 1;
                }
            }
            let launch_confirmed = nodes
                .iter()
                .map(|(idx, _, _)| (*idx, outcome.confirmed.contains(idx)))
                .collect();

            let record = StepRecord {
                job_id,
                step_id,
                task_count: tasks.len() as u32,
                tasks_per_node,
                tasks,
                state: outcome.state.clone(),
                io_mode: step_spec.io_mode.clone(),
                stdin_mode: step_spec.stdin_mode.clone(),
                shim_node,
                shim_io_endpoint: io_endpoint,
                shim_pmi_endpoint: pmi_endpoint,
                launch_confirmed,
            };
            self.controller
                .state
                .write()
                .await
                .steps
                .insert(StepKey { job_id, step_id }, record);

            if outcome.state == StepState::Failed {
                let reasons = outcome
                    .failed
                    .iter()
                    .map(|(idx, reason)| format!("{idx}: {reason}"))
                    .collect::<Vec<_>>()
                    .join("; ");
                return Err(Error::unavailable(format!("step launch failed on some nodes: {reasons}")));
            }
            Ok(step_id)
        }
        .await;

        let reply = match result {
            Ok(step_id) => LaunchStepResponse {
                result: Some(launch_step_response::Result::StepId(step_id.get())),
            },
            Err(e) => LaunchStepResponse {
                result: Some(launch_step_response::Result::Error(common::Status::from(&e))),
            },
        };
        Ok(Response::new(reply))
    }

    async fn signal_step(
        &self,
        request: Request<SignalStepRequest>,
    ) -> Result<Response<SignalStepResponse>, Status> {
        let req = request.into_inner();
        let key = StepKey {
            job_id: JobId(req.job_id),
            step_id: StepId(req.step_id),
        };
        let nodes = self.step_nodes(&key).await.map_err(Status::from)?;
        launch::signal_step(&nodes, key.job_id, key.step_id, req.signo, self.controller.agent_pool.clone())
            .await
            .map_err(Status::from)?;
        Ok(Response::new(SignalStepResponse {
            status: Some(common::Status {
                kind: common::ErrorKind::Unspecified as i32,
                reason: String::new(),
            }),
        }))
    }

    async fn terminate_step(
        &self,
        request: Request<TerminateStepRequest>,
    ) -> Result<Response<TerminateStepResponse>, Status> {
        let req = request.into_inner();
        let key = StepKey {
            job_id: JobId(req.job_id),
            step_id: StepId(req.step_id),
        };
        let nodes = self.step_nodes(&key).await.map_err(Status::from)?;
        launch::terminate_all(&nodes, key.job_id, key.step_id, self.controller.agent_pool.clone()).await;
        if let Some(step) = self.controller.state.write().await.steps.get_mut(&key) {
            step.state = StepState::Ended;
        }
        Ok(Response::new(TerminateStepResponse {
            status: Some(common::Status {
                kind: common::ErrorKind::Unspecified as i32,
                reason: String::new(),
            }),
        }))
    }

    async fn complete(
        &self,
        request: Request<CompleteRequest>,
    ) -> Result<Response<CompleteResponse>, Status> {
        let req = request.into_inner();
        let job_id = JobId(req.job_id);
        let mut tables = self.controller.state.write().await;
        if let Some(job) = tables.jobs.get_mut(&job_id) {
            job.state = if req.exit_status == 0 { JobState::Completed } else { JobState::Failed };
            job.exit_status = Some(req.exit_status);
            job.end_time_unix = Some(registry::now_unix());
        }
        // `allocations` is the idempotence gate: a job's entry is
        // removed exactly once, the first time it transitions out of
        // RUNNING, so a repeated Complete(job_id) is a no-op rather
        // than re-releasing CPUs another job on the same node holds.
        let released = tables.allocations.remove(&job_id).is_some();
        let nodes = if released {
            tables
                .jobs
                .get(&job_id)
                .map(|j| j.allocated_nodes.clone())
                .unwrap_or_default()
        } else {
            vec![]
        };
        let cpus = if released {
            tables
                .jobs
                .get(&job_id)
                .map(|j| j.cpus_per_node.clone())
                .unwrap_or_default()
        } else {
            vec![]
        };
        for node in &nodes {
            if let Some(occupants) = tables.node_alloc.get_mut(node) {
                occupants.retain(|&j| j != job_id);
            }
        }
        drop(tables);
        for (&node, &cpus) in nodes.iter().zip(cpus.iter()) {
            let _ = self.controller.registry.release(node, cpus).await;
        }
        self.controller.wake_scheduler().await;
        Ok(Response::new(CompleteResponse {
            status: Some(common::Status {
                kind: common::ErrorKind::Unspecified as i32,
                reason: String::new(),
            }),
        }))
    }

    async fn list_jobs(
        &self,
        request: Request<ListJobsRequest>,
    ) -> Result<Response<ListJobsResponse>, Status> {
        let req = request.into_inner();
        let tables = self.controller.state.read().await;
        let jobs = tables
            .jobs
            .values()
            .filter(|j| req.user.as_deref().map(|u| u == j.spec.user).unwrap_or(true))
            .filter(|j| req.partition.as_deref().map(|p| p == j.spec.partition).unwrap_or(true))
            .map(|j| JobView {
                job_id: j.id.get(),
                user: j.spec.user.clone(),
                partition: j.spec.partition.clone(),
                state: format!("{:?}", j.state).to_uppercase(),
                node_names: tables
                    .allocations
                    .get(&j.id)
                    .map(|a| a.node_names.clone())
                    .unwrap_or_default(),
                priority: j.spec.priority,
            })
            .collect();
        Ok(Response::new(ListJobsResponse { jobs }))
    }

    async fn list_nodes(
        &self,
        _request: Request<ListNodesRequest>,
    ) -> Result<Response<ListNodesResponse>, Status> {
        let snapshot = self.controller.registry.snapshot().await;
        let nodes = snapshot
            .iter()
            .map(|n| NodeView {
                name: n.name.clone(),
                index: n.index.get(),
                base_state: format!("{:?}", n.base).to_uppercase(),
                flags: flag_names(n.flags),
                cpus: n.cpus,
                cpus_free: n.cpus_free,
                features: n.features.clone(),
            })
            .collect();
        Ok(Response::new(ListNodesResponse { nodes }))
    }

    async fn list_partitions(
        &self,
        _request: Request<ListPartitionsRequest>,
    ) -> Result<Response<ListPartitionsResponse>, Status> {
        let partitions = self
            .controller
            .partitions
            .list()
            .await
            .into_iter()
            .map(|p| PartitionView {
                name: p.name,
                min_nodes: p.min_nodes,
                max_nodes: p.max_nodes,
                max_time_secs: p.max_time_secs,
                priority: p.priority,
                share: share_name(p.share),
                availability: format!("{:?}", p.availability).to_lowercase(),
                default: p.default,
            })
            .collect();
        Ok(Response::new(ListPartitionsResponse { partitions }))
    }

    async fn update_node(
        &self,
        request: Request<UpdateNodeRequest>,
    ) -> Result<Response<UpdateNodeResponse>, Status> {
        let req = request.into_inner();
        let idx = self
            .controller
            .registry
            .lookup_by_name(&req.node_name)
            .await
            .map_err(Status::from)?;
        if let Some(state) = req.admin_state.as_deref() {
            let reason = req.reason.clone().unwrap_or_default();
            match state {
                "drain" => self.controller.registry.drain(&[idx], reason).await.map_err(Status::from)?,
                "resume" => self.controller.registry.resume(&[idx]).await.map_err(Status::from)?,
                "down" => self.controller.registry.down(&[idx], reason).await.map_err(Status::from)?,
                other => return Err(Error::validation(format!("unknown admin_state {other}")).into()),
            }
        }
        if !req.set_features.is_empty() {
            self.controller
                .registry
                .set_features(&[idx], req.set_features.clone())
                .await
                .map_err(Status::from)?;
        }
        Ok(Response::new(UpdateNodeResponse {
            status: Some(common::Status {
                kind: common::ErrorKind::Unspecified as i32,
                reason: String::new(),
            }),
        }))
    }

    async fn update_partition(
        &self,
        request: Request<UpdatePartitionRequest>,
    ) -> Result<Response<UpdatePartitionResponse>, Status> {
        let req = request.into_inner();
        if let Some(avail) = req.availability.as_deref() {
            let avail = parse_availability(avail).map_err(Status::from)?;
            self.controller
                .partitions
                .update_availability(&req.partition_name, avail)
                .await
                .map_err(Status::from)?;
        }
        Ok(Response::new(UpdatePartitionResponse {
            status: Some(common::Status {
                kind: common::ErrorKind::Unspecified as i32,
                reason: String::new(),
            }),
        }))
    }

    async fn heartbeat(
        &self,
        request: Request<HeartbeatRequest>,
    ) -> Result<Response<HeartbeatResponse>, Status> {
        let req = request.into_inner();
        self.controller
            .registry
            .update_heartbeat(&req.node_name, req.observed_unix)
            .await
            .map_err(Status::from)?;
        Ok(Response::new(HeartbeatResponse {
            status: Some(common::Status {
                kind: common::ErrorKind::Unspecified as i32,
                reason: String::new(),
            }),
        }))
    }

    async fn report_launch_result(
        &self,
        request: Request<ReportLaunchResultRequest>,
    ) -> Result<Response<ReportLaunchResultResponse>, Status> {
        let req = request.into_inner();
        let key = StepKey {
            job_id: JobId(req.job_id),
            step_id: StepId(req.step_id),
        };
        let idx = self
            .controller
            .registry
            .lookup_by_name(&req.node_name)
            .await
            .map_err(Status::from)?;
        let mut tables = self.controller.state.write().await;
        if let Some(step) = tables.steps.get_mut(&key) {
            step.launch_confirmed.insert(idx, req.ok);
            if !req.ok && !step.all_launches_confirmed() {
                step.state = StepState::Failed;
            }
        }
        Ok(Response::new(ReportLaunchResultResponse {
            status: Some(common::Status {
                kind: common::ErrorKind::Unspecified as i32,
                reason: String::new(),
            }),
        }))
    }

    async fn report_step_ended(
        &self,
        request: Request<ReportStepEndedRequest>,
    ) -> Result<Response<ReportStepEndedResponse>, Status> {
        let req = request.into_inner();
        let key = StepKey {
            job_id: JobId(req.job_id),
            step_id: StepId(req.step_id),
        };
        let mut tables = self.controller.state.write().await;
        if let Some(step) = tables.steps.get_mut(&key) {
            let idx = self
                .controller
                .registry
                .lookup_by_name(&req.node_name)
                .await
                .map_err(Status::from)?;
            for (task, exit) in step
                .tasks
                .iter_mut()
                .filter(|t| t.node == idx)
                .zip(req.task_exit_codes.iter())
            {
                task.exit_status = Some(*exit);
            }
            if step.all_tasks_exited() {
                step.state = if req.failed { StepState::Failed } else { StepState::Ended };
            }
        }
        Ok(Response::new(ReportStepEndedResponse {
            status: Some(common::Status {
                kind: common::ErrorKind::Unspecified as i32,
                reason: String::new(),
            }),
        }))
    }
}

impl ControllerServiceImpl {
    async fn step_nodes(&self, key: &StepKey) -> CinderResult<Vec<(NodeIndex, String, String)>> {
        let tables = self.controller.state.read().await;
        let step = tables
            .steps
            .get(key)
            .ok_or_else(|| Error::validation(format!("unknown step {key}")))?;
        let alloc = tables
            .allocations
            .get(&key.job_id)
            .ok_or_else(|| Error::validation("job has no active allocation"))?;
        let wanted: std::collections::HashSet<NodeIndex> = step.nodes().collect();
        Ok(alloc
            .nodes
            .iter()
            .zip(alloc.node_names.iter())
            .filter(|(idx, _)| wanted.contains(idx))
            .filter_map(|(&idx, name)| {
                self.controller
                    .agent_addr(idx)
                    .map(|addr| (idx, name.clone(), addr.to_string()))
            })
            .collect())
    }
}

fn flag_names(flags: registry::NodeFlags) -> Vec<String> {
    use registry::NodeFlags as F;
    let table: &[(F, &str)] = &[
        (F::DRAIN, "DRAIN"),
        (F::COMPLETING, "COMPLETING"),
        (F::NO_RESPOND, "NO_RESPOND"),
        (F::POWER_SAVE, "POWER_SAVE"),
        (F::FAIL, "FAIL"),
        (F::MAINT, "MAINT"),
        (F::RES, "RES"),
    ];
    table
        .iter()
        .filter(|(bit, _)| flags.contains(*bit))
        .map(|(_, name)| name.to_string())
        .collect()
}

fn share_name(share: SharePolicy) -> String {
    match share {
        SharePolicy::Exclusive => "exclusive".to_string(),
        SharePolicy::No => "no".to_string(),
        SharePolicy::Yes(n) => format!("yes:{n}"),
        SharePolicy::Force(n) => format!("force:{n}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cinder_common::credential::CredentialSigner;
    use crate::placement::linear::LinearBackend;
    use crate::registry::{BaseState, NodeFlags, NodeRecord};

    async fn controller_with_shared_node() -> (std::sync::Arc<Controller>, JobId, JobId) {
        let node = NodeRecord {
            name: "n0".to_string(),
            index: NodeIndex(0),
            cpus: 4,
            cpus_free: 4,
            real_mem_mb: 0,
            tmp_disk_mb: 0,
            features: vec![],
            weight: 0,
            reason: String::new(),
            base: BaseState::Idle,
            flags: NodeFlags::empty(),
            last_heartbeat_unix: 0,
            coords: None,
        };
        let partition = crate::partition::PartitionRecord {
            name: "P".to_string(),
            nodes: std::iter::once(NodeIndex(0)).collect(),
            min_nodes: 1,
            max_nodes: 64,
            max_time_secs: 3600,
            priority: 0,
            share: SharePolicy::Yes(2),
            root_only: false,
            hidden: false,
            allowed_groups: vec![],
            allowed_alloc_nodes: vec![],
            availability: crate::partition::Availability::Up,
            default: true,
            features: vec![],
        };
        let (tx, _rx) = tokio::sync::mpsc::channel(1);
        let controller = Controller::new(
            vec![node],
            vec![partition],
            vec!["127.0.0.1:0".to_string()],
            std::sync::Arc::new(LinearBackend),
            cinder_common::config::ControllerOpts::default(),
            tx,
        )
        .unwrap();

        // Two jobs share n0 at 2 CPUs each, cpus_free already driven
        // to 0 by both reservations, matching run_pass's bookkeeping.
        controller.registry.reserve(NodeIndex(0), 2).await.unwrap();
        controller.registry.reserve(NodeIndex(0), 2).await.unwrap();

        let job_x = controller.state.allocate_job_id().await;
        let job_y = controller.state.allocate_job_id().await;
        {
            let mut tables = controller.state.write().await;
            for &job_id in &[job_x, job_y] {
                tables.jobs.insert(
                    job_id,
                    JobRecord {
                        id: job_id,
                        spec: crate::job::JobSpec {
                            user: "alice".to_string(),
                            uid: 1000,
                            gid: 1000,
                            partition: "P".to_string(),
                            min_nodes: 1,
                            max_nodes: 1,
                            cpus_per_node: 2,
                            time_limit_secs: 3600,
                            depends_on: None,
                            features: vec![],
                            include_nodes: vec![],
                            exclude_nodes: vec![],
                            priority: 0,
                            nice: 0,
                            contiguous: false,
                            share: SharePolicy::No,
                            no_kill: false,
                            immediate: false,
                            exclusive: false,
                            mem_per_cpu_mb: 0,
                            licenses: String::new(),
                            name: "job".to_string(),
                            argv: vec!["/bin/true".to_string()],
                            env: std::collections::HashMap::new(),
                            cwd: String::new(),
                        },
                        state: JobState::Running,
                        submit_time_unix: 0,
                        start_time_unix: Some(0),
                        end_time_unix: None,
                        fail_reason: None,
                        allocated_nodes: vec![NodeIndex(0)],
                        cpus_per_node: vec![2],
                        exit_status: None,
                    },
                );
                tables.node_alloc.entry(NodeIndex(0)).or_default().push(job_id);
                let payload = cinder_common::credential::CredentialPayload {
                    job_id,
                    step_id: StepId(0),
                    uid: 1000,
                    gid: 1000,
                    node_set: vec![NodeIndex(0)],
                    deadline_unix: 0,
                    nonce: job_id.get(),
                };
                let credential = controller.signer.sign(&payload);
                tables.allocations.insert(
                    job_id,
                    crate::allocation::Allocation {
                        job_id,
                        nodes: vec![NodeIndex(0)],
                        node_names: vec!["n0".to_string()],
                        cpus_per_node: vec![2],
                        credential,
                        deadline_unix: 0,
                    },
                );
            }
        }
        (controller, job_x, job_y)
    }

    #[tokio::test]
    async fn complete_is_idempotent_and_does_not_release_a_cotenants_cpus() {
        let (controller, job_x, _job_y) = controller_with_shared_node().await;
        let svc = ControllerServiceImpl::new(controller.clone());

        for _ in 0..2 {
            svc.complete(Request::new(CompleteRequest {
                auth_token: String::new(),
                job_id: job_x.get(),
                exit_status: 0,
            }))
            .await
            .unwrap();
        }

        let snapshot = controller.registry.snapshot().await;
        let n0 = snapshot.iter().find(|n| n.index == NodeIndex(0)).unwrap();
        assert_eq!(n0.cpus_free, 2, "second Complete(job_x) must not re-release job_y's CPUs");

        let tables = controller.state.read().await;
        assert!(!tables.node_alloc[&NodeIndex(0)].contains(&job_x));
    }
}
