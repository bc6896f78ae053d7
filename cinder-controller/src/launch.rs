//! Credentialed launch fan-out (spec 4.5). Turns an allocation into a
//! running step: dispatches a `Launch` RPC to every node in the
//! step's node set in parallel, tracks per-node confirmation, and
//! rolls back (broadcasts `Terminate`) if any required node fails to
//! confirm within `launch_timeout`. One object holds shared state
//! behind a lock; a runner owns the actual fan-out task.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use cinder_common::credential::{Credential, CredentialPayload, CredentialSigner};
use cinder_common::error::{Error, ErrorKind, Result};
use cinder_common::ids::{JobId, NodeIndex, StepId};
use cinder_pb::agent::{LaunchRequest as PbLaunchRequest, SignalRequest, TerminateRequest};
use cinder_rpc_client::AgentClientPoolRef;
use futures::future::join_all;

use crate::step::StepState;

#[derive(Debug, Clone)]
pub struct StepLaunchSpec {
    pub job_id: JobId,
    pub step_id: StepId,
    pub argv: Vec<String>,
    pub env: HashMap<String, String>,
    pub cwd: String,
    pub nodes: Vec<(NodeIndex, String, String)>, // (index, name, agent addr)
    pub tasks_per_node: Vec<u32>,
    pub io_endpoint: String,
    pub pmi_endpoint: String,
    pub io_mode: String,
    pub stdin_mode: String,
    pub deadline_unix: i64,
}

pub struct LaunchOutcome {
    pub confirmed: Vec<NodeIndex>,
    pub failed: Vec<(NodeIndex, String)>,
    pub state: StepState,
}

/// Fans a `LaunchStep` out to every node in the step concurrently and
/// waits up to `timeout` for every node to confirm.
pub async fn launch_step(
    spec: &StepLaunchSpec,
    signer: &dyn CredentialSigner,
    pool: AgentClientPoolRef,
    timeout: Duration,
) -> Result<LaunchOutcome> {
    let node_set: Vec<NodeIndex> = spec.nodes.iter().map(|(idx, _, _)| *idx).collect();

    // Precompute each node's task-id range eagerly (not inside the
    // lazily-driven future below) so offsets reflect submission order.
    let mut offsets = Vec::with_capacity(spec.nodes.len());
    let mut cursor = 0u32;
    for node_pos in 0..spec.nodes.len() {
        let tasks_on_node = spec.tasks_per_node.get(node_pos).copied().unwrap_or(0);
        offsets.push(cursor..cursor + tasks_on_node);
        cursor += tasks_on_node;
    }

    let futs = spec.nodes.iter().enumerate().map(|(node_pos, (idx, _name, addr))| {
        let pool = pool.clone();
        let node_set = node_set.clone();
        let task_ids: Vec<u32> = offsets[node_pos].clone().collect();
        let payload = CredentialPayload {
            job_id: spec.job_id,
            step_id: spec.step_id,
            uid: 0,
            gid: 0,
            node_set,
            deadline_unix: spec.deadline_unix,
            nonce: rand::random(),
        };
        let credential: Credential = signer.sign(&payload);
        let req = PbLaunchRequest {
            job_id: spec.job_id.get(),
            step_id: spec.step_id.get(),
            uid: 0,
            gid: 0,
            argv: spec.argv.clone(),
            envp: spec.env.clone(),
            cwd: spec.cwd.clone(),
            task_global_ids: task_ids.clone(),
            io_endpoint: spec.io_endpoint.clone(),
            pmi_endpoint: spec.pmi_endpoint.clone(),
            credential: Some(credential.into()),
            limits: vec![],
            propagate_user_limits: false,
            step_size: spec.tasks_per_node.iter().sum(),
            node_id: idx.get(),
            num_nodes: spec.nodes.len() as u32,
            nodelist: spec.nodes.iter().map(|(_, n, _)| n.clone()).collect::<Vec<_>>().join(","),
            distribution: "block".to_string(),
            cpu_bind: String::new(),
            mem_bind: String::new(),
            io_mode: spec.io_mode.clone(),
            stdin_mode: spec.stdin_mode.clone(),
        };
        let addr = addr.clone();
        let idx = *idx;
        async move {
            let result = async {
                let mut client = pool.get(&addr).await?.inner();
                let resp = tokio::time::timeout(timeout, client.launch(req))
                    .await
                    .map_err(|_| Error::unavailable("launch RPC timed out"))?
                    .map_err(|e| Error::unavailable(format!("launch RPC failed: {e}")))?;
                match resp.into_inner().result {
                    Some(cinder_pb::agent::launch_response::Result::Ok(_)) => Ok(()),
                    Some(cinder_pb::agent::launch_response::Result::Rejected(code)) => {
                        Err(Error::integrity(format!("node rejected launch: {code}")))
                    }
                    None => Err(Error::internal("empty launch response")),
                }
            }
            .await;
            (idx, result)
        }
    });

    let results = join_all(futs).await;

    let mut confirmed = Vec::new();
    let mut failed = Vec::new();
    for (idx, result) in results {
        match result {
            Ok(()) => confirmed.push(idx),
            Err(e) => failed.push((idx, e.reason)),
        }
    }

    let state = if failed.is_empty() {
        StepState::Running
    } else {
        StepState::Failed
    };

    if !failed.is_empty() {
        // Broadcast terminate to the nodes that did confirm, per spec
        // 4.5: "the controller broadcasts a terminate to all nodes
        // that did confirm."
        terminate_nodes(&confirmed, &spec.nodes, spec.job_id, spec.step_id, pool.clone()).await;
    }

    Ok(LaunchOutcome {
        confirmed,
        failed,
        state,
    })
}

/// Sends `Terminate` to every node in `nodes` regardless of launch
/// confirmation, for the `TerminateStep` RPC handler.
pub(crate) async fn terminate_all(
    nodes: &[(NodeIndex, String, String)],
    job_id: JobId,
    step_id: StepId,
    pool: AgentClientPoolRef,
) {
    let all: Vec<NodeIndex> = nodes.iter().map(|(idx, _, _)| *idx).collect();
    terminate_nodes(&all, nodes, job_id, step_id, pool).await;
}

async fn terminate_nodes(
    confirmed: &[NodeIndex],
    nodes: &[(NodeIndex, String, String)],
    job_id: JobId,
    step_id: StepId,
    pool: AgentClientPoolRef,
) {
    let futs = nodes
        .iter()
        .filter(|(idx, _, _)| confirmed.contains(idx))
        .map(|(_, _, addr)| {
            let pool = pool.clone();
            let addr = addr.clone();
            async move {
                if let Ok(client) = pool.get(&addr).await {
                    let mut client = client.inner();
                    let _ = client
                        .terminate(TerminateRequest {
                            job_id: job_id.get(),
                            step_id: step_id.get(),
                        })
                        .await;
                }
            }
        });
    join_all(futs).await;
}

pub async fn signal_step(
    nodes: &[(NodeIndex, String, String)],
    job_id: JobId,
    step_id: StepId,
    signo: i32,
    pool: AgentClientPoolRef,
) -> Result<()> {
    let futs = nodes.iter().map(|(_, _, addr)| {
        let pool = pool.clone();
        let addr = addr.clone();
        async move {
            let client = pool.get(&addr).await?;
            let mut client = client.inner();
            client
                .signal(SignalRequest {
                    job_id: job_id.get(),
                    step_id: step_id.get(),
                    signo,
                })
                .await
                .map_err(|e| Error::new(ErrorKind::Unavailable, format!("signal RPC failed: {e}")))?;
            Ok::<_, Error>(())
        }
    });
    let results = join_all(futs).await;
    results.into_iter().collect::<Result<Vec<()>>>()?;
    Ok(())
}
