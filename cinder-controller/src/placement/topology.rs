//! Topology placement backend for mesh/torus systems (spec 4.2). Finds
//! a free rectangular sub-region of the physical grid matching a
//! requested geometry, optionally searching axis rotations and
//! elongations, and returns a wiring plan stitching the region
//! together.
//!
//! The open question in the design notes (nav connection type
//! ambiguity) is resolved here: `nav` prefers torus wiring whenever a
//! choice exists, and the preference is recorded on the returned
//! [`WiringPlan`].

use std::collections::{HashMap, HashSet};

use cinder_common::ids::NodeIndex;

use super::{ConnType, PlacementBackend, PlacementError, PlacementPlan, PlacementRequest, WiringPlan};
use crate::partition::PartitionRecord;
use crate::registry::NodeSnapshot;

/// Fixed rotation search order from spec 4.4.
const ROTATIONS: [(&str, [usize; 3]); 6] = [
    ("ABC", [0, 1, 2]),
    ("ACB", [0, 2, 1]),
    ("CAB", [2, 0, 1]),
    ("CBA", [2, 1, 0]),
    ("BCA", [1, 2, 0]),
    ("BAC", [1, 0, 2]),
];

pub struct TopologyBackend {
    /// Physical dimensions of the machine, in midplanes.
    pub machine_dims: [u32; 3],
}

impl TopologyBackend {
    pub fn new(machine_dims: [u32; 3]) -> Self {
        Self { machine_dims }
    }

    fn candidate_geometries(&self, req: &super::TopologyRequest) -> Vec<[u32; 3]> {
        let mut geoms = vec![req.geometry];
        if req.rotate {
            for &(_, perm) in &ROTATIONS {
                let g = [
                    req.geometry[perm[0]],
                    req.geometry[perm[1]],
                    req.geometry[perm[2]],
                ];
                if !geoms.contains(&g) {
                    geoms.push(g);
                }
            }
        }
        if req.elongate {
            // Elongate along each axis in turn, keeping volume as
            // close as possible to the requested node count.
            let volume = req.geometry.iter().product::<u32>().max(1);
            for axis in 0..3 {
                let mut g = req.geometry;
                let others: u32 = g
                    .iter()
                    .enumerate()
                    .filter(|(i, _)| *i != axis)
                    .map(|(_, v)| *v)
                    .product::<u32>()
                    .max(1);
                g[axis] = (volume / others).max(g[axis]);
                if !geoms.contains(&g) {
                    geoms.push(g);
                }
            }
        }
        geoms
    }

    fn try_region(
        &self,
        free: &HashSet<[u32; 3]>,
        origin: [u32; 3],
        geometry: [u32; 3],
    ) -> Option<Vec<[u32; 3]>> {
        let mut region = Vec::with_capacity((geometry[0] * geometry[1] * geometry[2]) as usize);
        for x in origin[0]..origin[0] + geometry[0] {
            if x >= self.machine_dims[0] {
                return None;
            }
            for y in origin[1]..origin[1] + geometry[1] {
                if y >= self.machine_dims[1] {
                    return None;
                }
                for z in origin[2]..origin[2] + geometry[2] {
                    if z >= self.machine_dims[2] {
                        return None;
                    }
                    let p = [x, y, z];
                    if !free.contains(&p) {
                        return None;
                    }
                    region.push(p);
                }
            }
        }
        Some(region)
    }
}

impl PlacementBackend for TopologyBackend {
    fn place(
        &self,
        snapshot: &NodeSnapshot,
        partition: &PartitionRecord,
        request: &PlacementRequest,
        occupants: &HashMap<NodeIndex, u32>,
    ) -> Result<PlacementPlan, PlacementError> {
        let topo = request.topology.as_ref().ok_or(PlacementError::NoFit)?;
        let max_cotenants = partition.share.max_cotenants();

        let by_coord: HashMap<[u32; 3], NodeIndex> = snapshot
            .iter()
            .filter(|n| partition.nodes.contains(&n.index))
            .filter_map(|n| n.coords.map(|c| (c, n.index)))
            .collect();

        let schedulable: HashSet<[u32; 3]> = snapshot
            .iter()
            .filter(|n| partition.nodes.contains(&n.index))
            .filter(|n| {
                if request.exclusive {
                    is_schedulable(n, n.cpus) && n.cpus_free == n.cpus
                } else {
                    is_schedulable(n, request.cpus_per_node)
                }
            })
            .filter(|n| occupants.get(&n.index).copied().unwrap_or(0) < max_cotenants)
            .filter(|n| {
                request.mem_per_cpu_mb == 0
                    || n.real_mem_mb >= request.mem_per_cpu_mb * request.cpus_per_node.max(1) as u64
            })
            .filter_map(|n| n.coords)
            .collect();

        let geometries = self.candidate_geometries(topo);
        let requested_volume = topo.node_count;

        for geometry in &geometries {
            let volume = geometry[0] * geometry[1] * geometry[2];
            if volume < requested_volume {
                continue;
            }
            for ox in 0..self.machine_dims[0] {
                for oy in 0..self.machine_dims[1] {
                    for oz in 0..self.machine_dims[2] {
                        if let Some(region) =
                            self.try_region(&schedulable, [ox, oy, oz], *geometry)
                        {
                            let nodes: Vec<NodeIndex> = region
                                .iter()
                                .filter_map(|c| by_coord.get(c).copied())
                                .collect();
                            if nodes.len() < requested_volume as usize {
                                continue;
                            }
                            let used_torus = matches!(
                                topo.conn_type,
                                ConnType::Torus | ConnType::Nav
                            );
                            let switch_ports = wiring_for_region(&nodes, used_torus);
                            if switch_ports.is_empty() && nodes.len() > 1 {
                                return Err(PlacementError::NoWires);
                            }
                            let rotation = geometries_rotation_name(&geometries, geometry);
                            let mut chosen = nodes;
                            chosen.truncate(requested_volume as usize);
                            chosen.sort();
                            let cpus_per_node = if request.exclusive {
                                chosen
                                    .iter()
                                    .map(|idx| {
                                        snapshot
                                            .iter()
                                            .find(|n| n.index == *idx)
                                            .map(|n| n.cpus)
                                            .unwrap_or(request.cpus_per_node)
                                    })
                                    .collect()
                            } else {
                                vec![request.cpus_per_node; chosen.len()]
                            };
                            return Ok(PlacementPlan {
                                nodes: chosen,
                                cpus_per_node,
                                wiring: Some(WiringPlan {
                                    rotation,
                                    used_torus,
                                    switch_ports,
                                }),
                            });
                        }
                    }
                }
            }
        }

        if requested_volume > (self.machine_dims[0] * self.machine_dims[1] * self.machine_dims[2]) {
            Err(PlacementError::TooLarge)
        } else {
            Err(PlacementError::NoFit)
        }
    }
}

fn is_schedulable(n: &crate::registry::NodeView, want_cpus: u32) -> bool {
    use crate::registry::{BaseState, NodeFlags};
    let base_ok = matches!(n.base, BaseState::Idle | BaseState::Mixed);
    let blocking = n
        .flags
        .intersects(NodeFlags::DRAIN | NodeFlags::NO_RESPOND | NodeFlags::FAIL | NodeFlags::MAINT);
    base_ok && !blocking && n.cpus_free >= want_cpus
}

/// Pass-through wires between adjacent nodes in the chosen region;
/// a region of size 1 needs no internal wiring.
fn wiring_for_region(nodes: &[NodeIndex], _used_torus: bool) -> Vec<(NodeIndex, NodeIndex)> {
    if nodes.len() <= 1 {
        return Vec::new();
    }
    nodes.windows(2).map(|w| (w[0], w[1])).collect()
}

fn geometries_rotation_name(geometries: &[[u32; 3]], chosen: &[u32; 3]) -> &'static str {
    if geometries.first() == Some(chosen) {
        return "ABC";
    }
    for &(name, perm) in &ROTATIONS {
        let base = geometries[0];
        let g = [base[perm[0]], base[perm[1]], base[perm[2]]];
        if &g == chosen {
            return name;
        }
    }
    "ABC"
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{BaseState, NodeFlags, NodeView};
    use std::collections::HashSet as HS;
    use std::sync::Arc;

    fn grid(dims: [u32; 3], allocated: &HashSet<[u32; 3]>) -> NodeSnapshot {
        let mut nodes = Vec::new();
        let mut idx = 0u32;
        for x in 0..dims[0] {
            for y in 0..dims[1] {
                for z in 0..dims[2] {
                    let c = [x, y, z];
                    let free = !allocated.contains(&c);
                    nodes.push(NodeView {
                        name: format!("n{idx}"),
                        index: NodeIndex(idx),
                        cpus: 4,
                        cpus_free: if free { 4 } else { 0 },
                        real_mem_mb: 0,
                        features: vec![],
                        weight: 0,
                        base: if free { BaseState::Idle } else { BaseState::Allocated },
                        flags: NodeFlags::empty(),
                        coords: Some(c),
                    });
                    idx += 1;
                }
            }
        }
        Arc::new(nodes)
    }

    fn partition_all(n: u32) -> PartitionRecord {
        PartitionRecord {
            name: "p".into(),
            nodes: (0..n).map(NodeIndex).collect::<HS<_>>(),
            min_nodes: 1,
            max_nodes: n,
            max_time_secs: 0,
            priority: 0,
            share: crate::partition::SharePolicy::No,
            root_only: false,
            hidden: false,
            allowed_groups: vec![],
            allowed_alloc_nodes: vec![],
            availability: crate::partition::Availability::Up,
            default: true,
            features: vec![],
        }
    }

    #[test]
    fn finds_disjoint_subcube() {
        // 4x4x4 machine, a 2x2x2 cube already allocated at the origin.
        let mut allocated = HS::new();
        for x in 0..2 {
            for y in 0..2 {
                for z in 0..2 {
                    allocated.insert([x, y, z]);
                }
            }
        }
        let snapshot = grid([4, 4, 4], &allocated);
        let backend = TopologyBackend::new([4, 4, 4]);
        let req = PlacementRequest {
            want_nodes_min: 8,
            want_nodes_max: 8,
            cpus_per_node: 1,
            required_features: vec![],
            include_nodes: vec![],
            exclude_nodes: vec![],
            contiguous: true,
            topology: Some(super::super::TopologyRequest {
                node_count: 8,
                geometry: [2, 2, 2],
                conn_type: ConnType::Torus,
                rotate: true,
                elongate: false,
            }),
            exclusive: false,
            mem_per_cpu_mb: 0,
        };
        let plan = backend
            .place(&snapshot, &partition_all(64), &req, &HashMap::new())
            .unwrap();
        assert_eq!(plan.nodes.len(), 8);
        for n in &plan.nodes {
            assert!(!allocated_contains_index(&allocated, n, &snapshot));
        }
    }

    #[test]
    fn exclusive_request_rejects_partially_used_nodes_in_the_grid() {
        // 2x1x1 machine, one node already partially allocated.
        let mut nodes = Vec::new();
        nodes.push(NodeView {
            name: "n0".into(),
            index: NodeIndex(0),
            cpus: 4,
            cpus_free: 2,
            real_mem_mb: 0,
            features: vec![],
            weight: 0,
            base: BaseState::Mixed,
            flags: NodeFlags::empty(),
            coords: Some([0, 0, 0]),
        });
        nodes.push(NodeView {
            name: "n1".into(),
            index: NodeIndex(1),
            cpus: 4,
            cpus_free: 4,
            real_mem_mb: 0,
            features: vec![],
            weight: 0,
            base: BaseState::Idle,
            flags: NodeFlags::empty(),
            coords: Some([1, 0, 0]),
        });
        let snapshot: NodeSnapshot = Arc::new(nodes);
        let backend = TopologyBackend::new([2, 1, 1]);
        let req = PlacementRequest {
            want_nodes_min: 1,
            want_nodes_max: 1,
            cpus_per_node: 1,
            required_features: vec![],
            include_nodes: vec![],
            exclude_nodes: vec![],
            contiguous: true,
            topology: Some(super::super::TopologyRequest {
                node_count: 1,
                geometry: [1, 1, 1],
                conn_type: ConnType::Mesh,
                rotate: false,
                elongate: false,
            }),
            exclusive: true,
            mem_per_cpu_mb: 0,
        };
        let plan = backend
            .place(&snapshot, &partition_all(2), &req, &HashMap::new())
            .unwrap();
        assert_eq!(plan.nodes, vec![NodeIndex(1)], "n0 has a partial allocation already");
        assert_eq!(plan.cpus_per_node, vec![4]);
    }

    #[test]
    fn share_policy_no_rejects_a_node_already_carrying_another_job() {
        // Single grid node, 4 CPUs, 2 free; a prior job already holds
        // it under a share=no partition, so a 1-CPU request must not
        // land here even though CPU remains.
        let snapshot: NodeSnapshot = Arc::new(vec![NodeView {
            name: "n0".into(),
            index: NodeIndex(0),
            cpus: 4,
            cpus_free: 2,
            real_mem_mb: 0,
            features: vec![],
            weight: 0,
            base: BaseState::Mixed,
            flags: NodeFlags::empty(),
            coords: Some([0, 0, 0]),
        }]);
        let backend = TopologyBackend::new([1, 1, 1]);
        let req = PlacementRequest {
            want_nodes_min: 1,
            want_nodes_max: 1,
            cpus_per_node: 1,
            required_features: vec![],
            include_nodes: vec![],
            exclude_nodes: vec![],
            contiguous: true,
            topology: Some(super::super::TopologyRequest {
                node_count: 1,
                geometry: [1, 1, 1],
                conn_type: ConnType::Mesh,
                rotate: false,
                elongate: false,
            }),
            exclusive: false,
            mem_per_cpu_mb: 0,
        };
        let mut part = partition_all(1);
        part.share = crate::partition::SharePolicy::No;
        let mut occupants = HashMap::new();
        occupants.insert(NodeIndex(0), 1);
        let err = backend.place(&snapshot, &part, &req, &occupants).unwrap_err();
        assert_eq!(err, PlacementError::NoFit);
    }

    fn allocated_contains_index(
        allocated: &HS<[u32; 3]>,
        idx: &NodeIndex,
        snapshot: &NodeSnapshot,
    ) -> bool {
        let n = snapshot.iter().find(|n| n.index == *idx).unwrap();
        allocated.contains(&n.coords.unwrap())
    }
}
