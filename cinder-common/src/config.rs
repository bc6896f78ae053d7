//! Configuration for each process. One `*Opts` struct per binary: a
//! small `clap::Parser` surface for the handful of flags an operator
//! sets at process start, backed by a TOML file for everything else.
//! The interactive client CLIs are out of scope; these opts are
//! operational knobs only.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::error::{Error, Result};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ControllerOpts {
    pub listen_addr: String,
    pub prometheus_addr: Option<String>,
    /// Seconds between scheduler passes when nothing else wakes it.
    pub sched_interval_secs: u64,
    /// Seconds a node may miss heartbeats before NO_RESPOND.
    pub slurmd_timeout_secs: u64,
    /// Seconds the deadline sweeper waits between RUNNING job scans.
    pub deadline_sweep_secs: u64,
    /// Seconds a node agent has to confirm a launch fan-out.
    pub launch_timeout_secs: u64,
    /// Shared HMAC key material used to sign step-launch credentials.
    pub credential_key_hex: String,
    pub max_retries: u32,
}

impl Default for ControllerOpts {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:6817".to_string(),
            prometheus_addr: Some("0.0.0.0:9095".to_string()),
            sched_interval_secs: 30,
            slurmd_timeout_secs: 300,
            deadline_sweep_secs: 30,
            launch_timeout_secs: 30,
            credential_key_hex: "00".repeat(32),
            max_retries: 10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentOpts {
    pub listen_addr: String,
    pub controller_addr: String,
    pub node_name: String,
    /// This node's total CPU count, reported on every heartbeat minus
    /// whatever the agent currently has tasks occupying.
    pub cpus: u32,
    pub heartbeat_interval_secs: u64,
    pub credential_key_hex: String,
    /// Grace period between SIGTERM and escalation to SIGKILL.
    pub kill_grace_secs: u64,
    /// How long past an allocation's deadline a seen credential id is
    /// still remembered, to reject replays.
    pub credential_grace_secs: u64,
    /// Path to the `cinder-shimd` binary, spawned on the lead node of
    /// a step's allocation (spec 2: "step shim ... spawned by the node
    /// agent on one lead node").
    pub shim_binary_path: String,
}

impl Default for AgentOpts {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:6818".to_string(),
            controller_addr: "http://127.0.0.1:6817".to_string(),
            node_name: String::new(),
            cpus: 1,
            heartbeat_interval_secs: 10,
            credential_key_hex: "00".repeat(32),
            kill_grace_secs: 30,
            credential_grace_secs: 300,
            shim_binary_path: "cinder-shimd".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ShimOpts {
    pub pmi_listen_addr: String,
    pub io_listen_addr: String,
    pub max_frame_bytes: usize,
    pub max_key_bytes: usize,
    pub max_value_bytes: usize,
    /// Seconds between repeated client SIGINTs that escalate to a
    /// forced termination, per spec 4.7.
    pub sigint_escalate_secs: u64,
}

impl Default for ShimOpts {
    fn default() -> Self {
        Self {
            pmi_listen_addr: "0.0.0.0:0".to_string(),
            io_listen_addr: "0.0.0.0:0".to_string(),
            max_frame_bytes: 64 * 1024,
            max_key_bytes: 256,
            max_value_bytes: 1024,
            sigint_escalate_secs: 1,
        }
    }
}

pub fn load<T>(path: impl AsRef<Path>) -> Result<T>
where
    T: serde::de::DeserializeOwned,
{
    let path = path.as_ref();
    let text = std::fs::read_to_string(path).map_err(|e| {
        Error::with_source(
            crate::ErrorKind::Validation,
            format!("failed to read config {}", path.display()),
            e,
        )
    })?;
    toml::from_str(&text).map_err(|e| {
        Error::with_source(
            crate::ErrorKind::Validation,
            format!("failed to parse config {}", path.display()),
            e,
        )
    })
}

pub fn duration_secs(secs: u64) -> Duration {
    Duration::from_secs(secs)
}
