//! Node registry and state machine (spec 4.1). Owns the dense
//! `[0, N)` node table; readers take a consistent [`NodeSnapshot`]
//! that never blocks the writer, an `ArcSwap`-style snapshot idiom.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use cinder_common::error::{Error, Result};
use cinder_common::ids::NodeIndex;
use tokio::sync::RwLock;

bitflags::bitflags! {
    /// Orthogonal flag bits layered on top of the base state.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct NodeFlags: u16 {
        const DRAIN       = 1 << 0;
        const COMPLETING  = 1 << 1;
        const NO_RESPOND  = 1 << 2;
        const POWER_SAVE  = 1 << 3;
        const FAIL        = 1 << 4;
        const MAINT       = 1 << 5;
        const RES         = 1 << 6;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BaseState {
    Unknown,
    Down,
    Idle,
    Allocated,
    Mixed,
    Future,
}

#[derive(Debug, Clone)]
pub struct NodeRecord {
    pub name: String,
    pub index: NodeIndex,
    pub cpus: u32,
    pub cpus_free: u32,
    pub real_mem_mb: u64,
    pub tmp_disk_mb: u64,
    pub features: Vec<String>,
    pub weight: u32,
    pub reason: String,
    pub base: BaseState,
    pub flags: NodeFlags,
    pub last_heartbeat_unix: i64,
    /// Physical grid coordinates, set only on machines using the
    /// topology placement backend (spec 4.2).
    pub coords: Option<[u32; 3]>,
}

impl NodeRecord {
    /// Spec 4.1: schedulable iff base in {Idle, Mixed}, no blocking
    /// flag set, and (if already allocated) CPU budget remains.
    pub fn is_schedulable(&self, want_cpus: u32) -> bool {
        let base_ok = matches!(self.base, BaseState::Idle | BaseState::Mixed);
        let blocking = self.flags.intersects(
            NodeFlags::DRAIN | NodeFlags::NO_RESPOND | NodeFlags::FAIL | NodeFlags::MAINT,
        );
        base_ok && self.base != BaseState::Down && !blocking && self.cpus_free >= want_cpus
    }
}

/// Immutable point-in-time view handed to the scheduler and to
/// placement backends; never mutated once created.
#[derive(Debug, Clone)]
pub struct NodeView {
    pub name: String,
    pub index: NodeIndex,
    pub cpus: u32,
    pub cpus_free: u32,
    pub real_mem_mb: u64,
    pub features: Vec<String>,
    pub weight: u32,
    pub base: BaseState,
    pub flags: NodeFlags,
    pub coords: Option<[u32; 3]>,
}

pub type NodeSnapshot = Arc<Vec<NodeView>>;

pub struct NodeRegistry {
    inner: RwLock<Inner>,
}

struct Inner {
    nodes: Vec<NodeRecord>,
    by_name: HashMap<String, NodeIndex>,
}

impl NodeRegistry {
    pub fn new(nodes: Vec<NodeRecord>) -> Self {
        let by_name = nodes.iter().map(|n| (n.name.clone(), n.index)).collect();
        Self {
            inner: RwLock::new(Inner { nodes, by_name }),
        }
    }

    pub async fn lookup_by_name(&self, name: &str) -> Result<NodeIndex> {
        self.inner
            .read()
            .await
            .by_name
            .get(name)
            .copied()
            .ok_or_else(|| Error::validation(format!("unknown node {name}")))
    }

    pub async fn snapshot(&self) -> NodeSnapshot {
        let inner = self.inner.read().await;
        Arc::new(
            inner
                .nodes
                .iter()
                .map(|n| NodeView {
                    name: n.name.clone(),
                    index: n.index,
                    cpus: n.cpus,
                    cpus_free: n.cpus_free,
                    real_mem_mb: n.real_mem_mb,
                    features: n.features.clone(),
                    weight: n.weight,
                    base: n.base,
                    flags: n.flags,
                    coords: n.coords,
                })
                .collect(),
        )
    }

    pub async fn get(&self, index: NodeIndex) -> Result<NodeRecord> {
        self.inner
            .read()
            .await
            .nodes
            .get(index.get() as usize)
            .cloned()
            .ok_or_else(|| Error::internal(format!("node index {index} out of range")))
    }

    /// Applies a scheduler commit: decrements free CPU and flips base
    /// state to Allocated/Mixed. Only the scheduler calls this.
    pub async fn reserve(&self, index: NodeIndex, cpus: u32) -> Result<()> {
        let mut inner = self.inner.write().await;
        let node = inner
            .nodes
            .get_mut(index.get() as usize)
            .ok_or_else(|| Error::internal(format!("node index {index} out of range")))?;
        if cpus > node.cpus_free {
            return Err(Error::internal(format!(
                "over-allocation on node {}: requested {cpus}, free {}",
                node.name, node.cpus_free
            )));
        }
        node.cpus_free -= cpus;
        node.base = if node.cpus_free == 0 {
            BaseState::Allocated
        } else {
            BaseState::Mixed
        };
        Ok(())
    }

    /// Releases CPU back to a node on job/step completion.
    pub async fn release(&self, index: NodeIndex, cpus: u32) -> Result<()> {
        let mut inner = self.inner.write().await;
        let node = inner
            .nodes
            .get_mut(index.get() as usize)
            .ok_or_else(|| Error::internal(format!("node index {index} out of range")))?;
        node.cpus_free = (node.cpus_free + cpus).min(node.cpus);
        node.base = if node.cpus_free == node.cpus {
            BaseState::Idle
        } else {
            BaseState::Mixed
        };
        Ok(())
    }

    /// Missing a heartbeat for `timeout_secs` transitions to
    /// NO_RESPOND; a subsequent heartbeat clears the flag without
    /// otherwise disturbing base state.
    pub async fn update_heartbeat(
        &self,
        name: &str,
        observed_unix: i64,
    ) -> Result<()> {
        let mut inner = self.inner.write().await;
        let index = *inner
            .by_name
            .get(name)
            .ok_or_else(|| Error::validation(format!("unknown node {name}")))?;
        let node = &mut inner.nodes[index.get() as usize];
        node.last_heartbeat_unix = observed_unix;
        node.flags.remove(NodeFlags::NO_RESPOND);
        Ok(())
    }

    /// Scans all nodes for missed heartbeats; called by the
    /// controller's periodic timer alongside the scheduler pass.
    pub async fn sweep_heartbeats(&self, now_unix: i64, timeout_secs: u64) -> Vec<NodeIndex> {
        let mut inner = self.inner.write().await;
        let mut newly_unresponsive = Vec::new();
        for node in &mut inner.nodes {
            if node.flags.contains(NodeFlags::NO_RESPOND) {
                continue;
            }
            if now_unix - node.last_heartbeat_unix > timeout_secs as i64 {
                node.flags.insert(NodeFlags::NO_RESPOND);
                newly_unresponsive.push(node.index);
            }
        }
        newly_unresponsive
    }

    pub async fn drain(&self, indices: &[NodeIndex], reason: String) -> Result<()> {
        let mut inner = self.inner.write().await;
        for &idx in indices {
            let node = inner
                .nodes
                .get_mut(idx.get() as usize)
                .ok_or_else(|| Error::internal(format!("node index {idx} out of range")))?;
            node.flags.insert(NodeFlags::DRAIN);
            node.reason = reason.clone();
        }
        Ok(())
    }

    pub async fn resume(&self, indices: &[NodeIndex]) -> Result<()> {
        let mut inner = self.inner.write().await;
        for &idx in indices {
            let node = inner
                .nodes
                .get_mut(idx.get() as usize)
                .ok_or_else(|| Error::internal(format!("node index {idx} out of range")))?;
            node.flags.remove(NodeFlags::DRAIN);
            node.reason.clear();
        }
        Ok(())
    }

    pub async fn down(&self, indices: &[NodeIndex], reason: String) -> Result<()> {
        let mut inner = self.inner.write().await;
        for &idx in indices {
            let node = inner
                .nodes
                .get_mut(idx.get() as usize)
                .ok_or_else(|| Error::internal(format!("node index {idx} out of range")))?;
            node.base = BaseState::Down;
            node.reason = reason.clone();
        }
        Ok(())
    }

    pub async fn set_features(&self, indices: &[NodeIndex], features: Vec<String>) -> Result<()> {
        let mut inner = self.inner.write().await;
        for &idx in indices {
            let node = inner
                .nodes
                .get_mut(idx.get() as usize)
                .ok_or_else(|| Error::internal(format!("node index {idx} out of range")))?;
            node.features = features.clone();
        }
        Ok(())
    }
}

pub fn now_unix() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}
