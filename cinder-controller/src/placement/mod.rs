//! Placement backend trait (spec 4.2). Purely functional over a
//! [`NodeSnapshot`]; never mutates shared state. The scheduler applies
//! or discards the result atomically, per spec 4.2 and the "plugin
//! style backend selection" design note — backends are trait objects
//! selected at startup by configuration, never by `dlopen`.

pub mod linear;
pub mod topology;

use std::collections::HashMap;

use cinder_common::ids::NodeIndex;

use crate::partition::PartitionRecord;
use crate::registry::NodeSnapshot;

#[derive(Debug, Clone)]
pub struct PlacementRequest {
    pub want_nodes_min: u32,
    pub want_nodes_max: u32,
    pub cpus_per_node: u32,
    pub required_features: Vec<String>,
    pub include_nodes: Vec<String>,
    pub exclude_nodes: Vec<String>,
    pub contiguous: bool,
    pub topology: Option<TopologyRequest>,
    /// Job-level request for whole-node allocation (spec 3 supplement):
    /// a matching node must be entirely idle and is handed over with
    /// its full CPU count rather than just `cpus_per_node`.
    pub exclusive: bool,
    /// Minimum `real_mem_mb / cpus_per_node` a candidate node must
    /// offer; 0 means no memory constraint.
    pub mem_per_cpu_mb: u64,
}

#[derive(Debug, Clone)]
pub struct TopologyRequest {
    pub node_count: u32,
    pub geometry: [u32; 3],
    pub conn_type: ConnType,
    pub rotate: bool,
    pub elongate: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnType {
    Torus,
    Mesh,
    Small,
    Nav,
}

#[derive(Debug, Clone)]
pub struct PlacementPlan {
    /// Ordered node list: (weight asc, index asc) per spec 4.4.
    pub nodes: Vec<NodeIndex>,
    pub cpus_per_node: Vec<u32>,
    /// Present only for topology placement.
    pub wiring: Option<WiringPlan>,
}

#[derive(Debug, Clone)]
pub struct WiringPlan {
    /// Axis permutation actually used, one of the six in spec 4.4's
    /// fixed rotation order.
    pub rotation: &'static str,
    /// `true` if the midplane-spanning pass-through used torus wires;
    /// `false` for mesh. Per design notes open question: `nav`
    /// prefers torus and records the choice here.
    pub used_torus: bool,
    pub switch_ports: Vec<(NodeIndex, NodeIndex)>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlacementError {
    TooLarge,
    NoFit,
    NoWires,
}

pub trait PlacementBackend: Send + Sync {
    /// `occupants` counts distinct jobs currently allocated to each
    /// node (spec 3/4.2's `node_alloc`), so a backend can enforce the
    /// partition's share policy: `exclusive`/`no` cap co-tenants at 1,
    /// `yes:N`/`force:N` at N, regardless of remaining `cpus_free`.
    fn place(
        &self,
        snapshot: &NodeSnapshot,
        partition: &PartitionRecord,
        request: &PlacementRequest,
        occupants: &HashMap<NodeIndex, u32>,
    ) -> Result<PlacementPlan, PlacementError>;
}
