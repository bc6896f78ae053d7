//! Static cluster topology fed to a controller at startup: the node
//! and partition tables, analogous to `slurm.conf`/`topology.conf`.
//! Loaded once from a TOML document; there is no dynamic node-join
//! protocol — nodes are provisioned by editing this file and
//! restarting, matching the rest of the workspace's "no plugin
//! discovery at runtime" stance.

use std::collections::{HashMap, HashSet};

use serde::Deserialize;

use cinder_common::error::{Error, Result};
use cinder_common::ids::NodeIndex;

use crate::partition::{Availability, PartitionRecord, SharePolicy};
use crate::registry::{self, BaseState, NodeFlags, NodeRecord};

#[derive(Debug, Deserialize)]
pub struct ClusterConfig {
    #[serde(default)]
    pub node: Vec<NodeEntry>,
    #[serde(default)]
    pub partition: Vec<PartitionEntry>,
    /// Physical machine dimensions in midplanes, used by the topology
    /// placement backend; irrelevant when running the linear backend.
    #[serde(default = "default_machine_dims")]
    pub machine_dims: [u32; 3],
}

fn default_machine_dims() -> [u32; 3] {
    [1, 1, 1]
}

#[derive(Debug, Deserialize)]
pub struct NodeEntry {
    pub name: String,
    pub agent_addr: String,
    pub cpus: u32,
    #[serde(default)]
    pub real_mem_mb: u64,
    #[serde(default)]
    pub tmp_disk_mb: u64,
    #[serde(default)]
    pub features: Vec<String>,
    #[serde(default)]
    pub weight: u32,
    #[serde(default)]
    pub coords: Option<[u32; 3]>,
}

#[derive(Debug, Deserialize)]
pub struct PartitionEntry {
    pub name: String,
    pub nodes: Vec<String>,
    #[serde(default)]
    pub min_nodes: u32,
    #[serde(default = "default_max_nodes")]
    pub max_nodes: u32,
    #[serde(default)]
    pub max_time_secs: u64,
    #[serde(default)]
    pub priority: i32,
    #[serde(default = "default_share")]
    pub share: String,
    #[serde(default)]
    pub root_only: bool,
    #[serde(default)]
    pub hidden: bool,
    #[serde(default)]
    pub allowed_groups: Vec<String>,
    #[serde(default)]
    pub default: bool,
    #[serde(default)]
    pub features: Vec<String>,
}

fn default_max_nodes() -> u32 {
    u32::MAX
}

fn default_share() -> String {
    "no".to_string()
}

impl ClusterConfig {
    pub fn load(path: impl AsRef<std::path::Path>) -> Result<Self> {
        cinder_common::config::load(path)
    }

    /// Builds the registry/partition seed data plus the agent-address
    /// table, indexed so `agent_addrs[i]` is node `i`'s address.
    pub fn machine_dims(&self) -> [u32; 3] {
        self.machine_dims
    }

    pub fn build(self) -> Result<(Vec<NodeRecord>, Vec<PartitionRecord>, Vec<String>)> {
        let mut by_name: HashMap<String, NodeIndex> = HashMap::new();
        let mut nodes = Vec::with_capacity(self.node.len());
        let mut agent_addrs = Vec::with_capacity(self.node.len());

        for (i, entry) in self.node.into_iter().enumerate() {
            let index = NodeIndex(i as u32);
            by_name.insert(entry.name.clone(), index);
            agent_addrs.push(entry.agent_addr);
            nodes.push(NodeRecord {
                name: entry.name,
                index,
                cpus: entry.cpus,
                cpus_free: entry.cpus,
                real_mem_mb: entry.real_mem_mb,
                tmp_disk_mb: entry.tmp_disk_mb,
                features: entry.features,
                weight: entry.weight,
                reason: String::new(),
                base: BaseState::Idle,
                flags: NodeFlags::empty(),
                last_heartbeat_unix: registry::now_unix(),
                coords: entry.coords,
            });
        }

        let mut partitions = Vec::with_capacity(self.partition.len());
        for entry in self.partition {
            let node_set: HashSet<NodeIndex> = entry
                .nodes
                .iter()
                .map(|n| {
                    by_name
                        .get(n)
                        .copied()
                        .ok_or_else(|| Error::validation(format!("partition {} references unknown node {n}", entry.name)))
                })
                .collect::<Result<_>>()?;
            partitions.push(PartitionRecord {
                name: entry.name,
                nodes: node_set,
                min_nodes: entry.min_nodes.max(1),
                max_nodes: entry.max_nodes,
                max_time_secs: entry.max_time_secs,
                priority: entry.priority,
                share: SharePolicy::parse(&entry.share)?,
                root_only: entry.root_only,
                hidden: entry.hidden,
                allowed_groups: entry.allowed_groups,
                allowed_alloc_nodes: vec![],
                availability: Availability::Up,
                default: entry.default,
                features: entry.features,
            });
        }

        Ok((nodes, partitions, agent_addrs))
    }
}
