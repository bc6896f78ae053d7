//! Credentialed task spawn (spec 4.5): verifies the launch credential,
//! enforces resource limits, forks one child per task, injects the
//! per-task MPI/PMI bootstrap environment (spec 6), and — on the lead
//! node of the step's node list — spawns the step shim before any
//! task execs, since every task dials the shim's I/O/PMI endpoints on
//! startup. Stdio is piped rather than inherited: the agent itself
//! forwards each task's stdout/stderr/stdin to the shim over TCP
//! (spec 4.5 step 4, "redirect stdio to the step shim's endpoint"),
//! since an arbitrary `argv` has no idea the shim exists.

use std::os::unix::process::CommandExt as _;
use std::process::Stdio;
use std::sync::Arc;

use cinder_common::credential::Credential;
use cinder_common::error::{Error, ErrorKind, Result};
use cinder_common::ids::{NodeIndex, StepKey, TaskGlobalId};
use cinder_pb::agent::LaunchRequest;
use cinder_pb::controller::ReportStepEndedRequest;
use nix::sys::resource::{setrlimit, Resource};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::process::{Child, Command};

use crate::tasks::TaskHandle;
use crate::Agent;

pub struct LaunchOutcome {
    pub pids: Vec<u32>,
}

/// Entry point called by the `AgentService::launch` RPC handler.
pub async fn handle_launch(agent: &Arc<Agent>, req: LaunchRequest) -> Result<LaunchOutcome> {
    let pb_cred = req
        .credential
        .clone()
        .ok_or_else(|| Error::validation("launch request missing credential"))?;
    let credential: Credential = pb_cred.into();

    agent
        .signer
        .verify(&credential)
        .map_err(|_| Error::integrity("INVALID_CRED: credential signature verification failed"))?;

    let my_index = NodeIndex(req.node_id);
    if !credential.payload.names_node(my_index) {
        return Err(Error::integrity("INVALID_CRED: credential does not name this node"));
    }

    let now = cinder_common::time::now_unix();
    if credential.payload.is_expired(now) {
        return Err(Error::integrity("credential deadline has passed"));
    }

    let key = StepKey {
        job_id: credential.payload.job_id,
        step_id: credential.payload.step_id,
    };
    let identity = credential.payload.identity();
    let expiry = credential.payload.deadline_unix + agent.opts.credential_grace_secs as i64;
    if !agent.seen_credentials.check_and_insert(identity, now, expiry) {
        return Err(Error::integrity("ALREADY_LAUNCHED: credential already processed on this node"));
    }

    if is_lead_node(&req, &agent.opts.node_name) {
        spawn_shim(agent, &req).await?;
    }

    let mut pids = Vec::with_capacity(req.task_global_ids.len());
    let mut handles = Vec::with_capacity(req.task_global_ids.len());
    let mut children = Vec::with_capacity(req.task_global_ids.len());
    for (local_id, &global_id) in req.task_global_ids.iter().enumerate() {
        let (pid, child) = spawn_task(agent, &req, global_id, local_id as u32)?;
        pids.push(pid);
        handles.push(TaskHandle {
            global_id: TaskGlobalId(global_id),
            local_id: local_id as u32,
            pid,
        });
        children.push((global_id, child));
    }
    // Register before spawning reapers so the "all tasks on this node
    // reported" check below always sees the full task count, even if
    // a child exits immediately.
    agent.steps.insert(key, handles);
    for (global_id, child) in children {
        spawn_reaper(agent.clone(), key, global_id, child);
    }

    Ok(LaunchOutcome { pids })
}

fn is_lead_node(req: &LaunchRequest, my_name: &str) -> bool {
    req.nodelist.split(',').next() == Some(my_name)
}

async fn spawn_shim(agent: &Agent, req: &LaunchRequest) -> Result<()> {
    let pmi_port = endpoint_port(&req.pmi_endpoint)?;
    let io_port = endpoint_port(&req.io_endpoint)?;
    let mut cmd = Command::new(&agent.opts.shim_binary_path);
    cmd.arg("--job-id").arg(req.job_id.to_string())
        .arg("--step-id").arg(req.step_id.to_string())
        .arg("--task-count").arg(req.step_size.to_string())
        .arg("--io-mode").arg(&req.io_mode)
        .arg("--stdin-mode").arg(&req.stdin_mode)
        .arg("--pmi-listen").arg(format!("0.0.0.0:{pmi_port}"))
        .arg("--io-listen").arg(format!("0.0.0.0:{io_port}"))
        .arg("--controller-addr").arg(&agent.opts.controller_addr)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null());
    cmd.spawn()
        .map_err(|e| Error::with_source(ErrorKind::Internal, "failed to spawn step shim", e))?;
    // The shim needs a moment to bind its listeners before tasks try
    // to dial them; a fixed short sleep is simpler than a readiness
    // probe for a process spawned on the local host.
    tokio::time::sleep(std::time::Duration::from_millis(200)).await;
    Ok(())
}

fn endpoint_port(endpoint: &str) -> Result<String> {
    endpoint
        .rsplit(':')
        .next()
        .map(|s| s.to_string())
        .ok_or_else(|| Error::validation(format!("malformed endpoint {endpoint}")))
}

fn spawn_task(
    agent: &Agent,
    req: &LaunchRequest,
    global_id: u32,
    local_id: u32,
) -> Result<(u32, Child)> {
    let argv0 = req
        .argv
        .first()
        .ok_or_else(|| Error::validation("empty argv"))?;
    let mut cmd = Command::new(argv0);
    if req.argv.len() > 1 {
        cmd.args(&req.argv[1..]);
    }
    if !req.cwd.is_empty() {
        cmd.current_dir(&req.cwd);
    }
    cmd.env_clear();
    cmd.envs(&req.envp);
    cmd.env("JOB_ID", req.job_id.to_string());
    cmd.env("JOB_STEP_ID", req.step_id.to_string());
    cmd.env("JOB_NUM_NODES", req.num_nodes.to_string());
    cmd.env("JOB_NODELIST", &req.nodelist);
    cmd.env("JOB_CPUS_PER_NODE", req.limits.len().to_string());
    cmd.env("STEP_NUM_TASKS", req.step_size.to_string());
    cmd.env("PROCID", global_id.to_string());
    cmd.env("LOCALID", local_id.to_string());
    cmd.env("NODEID", req.node_id.to_string());
    cmd.env("NPROCS", req.step_size.to_string());
    cmd.env("DISTRIBUTION", &req.distribution);
    cmd.env("CPU_BIND", &req.cpu_bind);
    cmd.env("MEM_BIND", &req.mem_bind);
    cmd.env("PMI_RANK", global_id.to_string());
    cmd.env("PMI_SIZE", req.step_size.to_string());
    cmd.env("PMI_SPAWNED", "0");
    // Internal plumbing, not part of the application-facing names
    // enumerated in spec 6: how this task finds the step shim.
    cmd.env("CINDER_IO_ENDPOINT", &req.io_endpoint);
    cmd.env("CINDER_PMI_ENDPOINT", &req.pmi_endpoint);

    apply_limits(&mut cmd, req)?;

    let uid = req.uid;
    let gid = req.gid;
    unsafe {
        cmd.pre_exec(move || {
            nix::unistd::setgid(nix::unistd::Gid::from_raw(gid))
                .map_err(|e| std::io::Error::from_raw_os_error(e as i32))?;
            nix::unistd::setuid(nix::unistd::Uid::from_raw(uid))
                .map_err(|e| std::io::Error::from_raw_os_error(e as i32))?;
            Ok(())
        });
    }

    cmd.stdin(Stdio::piped());
    cmd.stdout(Stdio::piped());
    cmd.stderr(Stdio::piped());

    let mut child = cmd
        .spawn()
        .map_err(|e| Error::with_source(ErrorKind::Internal, "spawn task failed", e))?;
    let pid = child.id().ok_or_else(|| Error::internal("spawned child reported no pid"))?;

    let stdout = child.stdout.take();
    let stderr = child.stderr.take();
    let stdin = child.stdin.take();
    spawn_io_forwarders(req.io_endpoint.clone(), global_id, req.node_id, stdout, stderr, stdin);

    Ok((pid, child))
}

/// Named limits the controller propagates (spec 4.5: "CPU, mem, file
/// descriptors, stack, core size, etc."), mapped onto POSIX rlimits.
fn apply_limits(cmd: &mut Command, req: &LaunchRequest) -> Result<()> {
    if !req.propagate_user_limits && req.limits.is_empty() {
        return Ok(());
    }
    let mut resolved = Vec::with_capacity(req.limits.len());
    for limit in &req.limits {
        let resource = resource_for_name(&limit.name)?;
        resolved.push((resource, limit.soft, limit.hard));
    }
    unsafe {
        cmd.pre_exec(move || {
            for &(resource, soft, hard) in &resolved {
                setrlimit(resource, soft, hard)
                    .map_err(|e| std::io::Error::from_raw_os_error(e as i32))?;
            }
            Ok(())
        });
    }
    Ok(())
}

fn resource_for_name(name: &str) -> Result<Resource> {
    Ok(match name {
        "cpu" => Resource::RLIMIT_CPU,
        "fsize" => Resource::RLIMIT_FSIZE,
        "data" => Resource::RLIMIT_DATA,
        "stack" => Resource::RLIMIT_STACK,
        "core" => Resource::RLIMIT_CORE,
        "rss" => Resource::RLIMIT_RSS,
        "nproc" => Resource::RLIMIT_NPROC,
        "nofile" => Resource::RLIMIT_NOFILE,
        "memlock" => Resource::RLIMIT_MEMLOCK,
        "as" => Resource::RLIMIT_AS,
        other => return Err(Error::validation(format!("unknown rlimit name {other}"))),
    })
}

/// Dials the shim's I/O endpoint once per stream direction and pipes
/// bytes in the background. Each connection opens with a one-line
/// header identifying `(task, node, stream)` so the shim can demux
/// without a shared control channel (spec 4.7).
fn spawn_io_forwarders(
    io_endpoint: String,
    task_id: u32,
    node_id: u32,
    stdout: Option<tokio::process::ChildStdout>,
    stderr: Option<tokio::process::ChildStderr>,
    stdin: Option<tokio::process::ChildStdin>,
) {
    if let Some(mut out) = stdout {
        let endpoint = io_endpoint.clone();
        tokio::spawn(async move {
            match dial(&endpoint, task_id, node_id, "stdout").await {
                Ok(mut sock) => {
                    if let Err(e) = tokio::io::copy(&mut out, &mut sock).await {
                        tracing::debug!(task_id, error = %e, "stdout forwarder ended");
                    }
                }
                Err(e) => tracing::warn!(task_id, error = %e, "failed to dial shim for stdout"),
            }
        });
    }
    if let Some(mut err) = stderr {
        let endpoint = io_endpoint.clone();
        tokio::spawn(async move {
            match dial(&endpoint, task_id, node_id, "stderr").await {
                Ok(mut sock) => {
                    if let Err(e) = tokio::io::copy(&mut err, &mut sock).await {
                        tracing::debug!(task_id, error = %e, "stderr forwarder ended");
                    }
                }
                Err(e) => tracing::warn!(task_id, error = %e, "failed to dial shim for stderr"),
            }
        });
    }
    if let Some(mut input) = stdin {
        tokio::spawn(async move {
            match dial(&io_endpoint, task_id, node_id, "stdin").await {
                Ok(mut sock) => {
                    let mut buf = [0u8; 8192];
                    loop {
                        match sock.read(&mut buf).await {
                            Ok(0) | Err(_) => break,
                            Ok(n) => {
                                if input.write_all(&buf[..n]).await.is_err() {
                                    break;
                                }
                            }
                        }
                    }
                }
                Err(e) => tracing::warn!(task_id, error = %e, "failed to dial shim for stdin"),
            }
        });
    }
}

async fn dial(endpoint: &str, task_id: u32, node_id: u32, stream: &str) -> std::io::Result<TcpStream> {
    let mut sock = TcpStream::connect(endpoint).await?;
    let header = format!("TASK {task_id} NODE {node_id} STREAM {stream}\n");
    sock.write_all(header.as_bytes()).await?;
    Ok(sock)
}

/// Waits for one task's exit, then — once every task on this node for
/// the step has exited — reports the aggregate back to the controller
/// (spec 4.5: "node agents report aggregated exit status to the
/// controller which transitions the step to ENDED/FAILED").
fn spawn_reaper(agent: Arc<Agent>, key: StepKey, global_id: u32, mut child: Child) {
    tokio::spawn(async move {
        let status = child.wait().await;
        let exit_code = match &status {
            Ok(s) => s.code().unwrap_or(-1),
            Err(_) => -1,
        };
        let failed = !matches!(&status, Ok(s) if s.success());
        agent.exit_codes.record(key, global_id, exit_code);
        if agent.exit_codes.all_reported(key, agent.steps.pids(&key).len()) {
            let codes = agent.exit_codes.take(key);
            let mut client = agent.controller.inner();
            let req = ReportStepEndedRequest {
                job_id: key.job_id.get(),
                step_id: key.step_id.get(),
                node_name: agent.opts.node_name.clone(),
                task_exit_codes: codes,
                failed,
            };
            if let Err(e) = client.report_step_ended(req).await {
                tracing::warn!(error = %e, "failed to report step ended");
            }
            agent.steps.remove(&key);
        }
    });
}
