//! Linear placement backend for commodity clusters (spec 4.2): a
//! contiguous-by-weight prefix of schedulable nodes, ties broken by
//! weight then index.

use std::collections::HashMap;

use cinder_common::ids::NodeIndex;

use super::{PlacementBackend, PlacementError, PlacementPlan, PlacementRequest};
use crate::partition::PartitionRecord;
use crate::registry::NodeSnapshot;

pub struct LinearBackend;

impl PlacementBackend for LinearBackend {
    fn place(
        &self,
        snapshot: &NodeSnapshot,
        partition: &PartitionRecord,
        request: &PlacementRequest,
        occupants: &HashMap<NodeIndex, u32>,
    ) -> Result<PlacementPlan, PlacementError> {
        let max_cotenants = partition.share.max_cotenants();
        let mut candidates: Vec<_> = snapshot
            .iter()
            .filter(|n| partition.nodes.contains(&n.index))
            .filter(|n| {
                if request.exclusive {
                    n.is_schedulable_cpus(n.cpus) && n.cpus_free == n.cpus
                } else {
                    n.is_schedulable_cpus(request.cpus_per_node)
                }
            })
            .filter(|n| occupants.get(&n.index).copied().unwrap_or(0) < max_cotenants)
            .filter(|n| {
                request.mem_per_cpu_mb == 0
                    || n.real_mem_mb >= request.mem_per_cpu_mb * request.cpus_per_node.max(1) as u64
            })
            .filter(|n| {
                request
                    .required_features
                    .iter()
                    .all(|f| n.features.iter().any(|nf| nf == f))
            })
            .filter(|n| !request.exclude_nodes.iter().any(|e| e == &n.name))
            .collect();

        // Spec 4.4: within a placement plan, nodes are ordered by
        // (weight asc, index asc).
        candidates.sort_by_key(|n| (n.weight, n.index.get()));

        if (candidates.len() as u32) < request.want_nodes_min {
            return Err(PlacementError::NoFit);
        }
        if request.want_nodes_max > 0 && request.want_nodes_min > request.want_nodes_max {
            return Err(PlacementError::TooLarge);
        }

        let take = request
            .want_nodes_max
            .min(candidates.len() as u32)
            .max(request.want_nodes_min);

        let included: Vec<NodeIndex> = request
            .include_nodes
            .iter()
            .filter_map(|name| candidates.iter().find(|n| &n.name == name).map(|n| n.index))
            .collect();

        let mut chosen: Vec<NodeIndex> = included.clone();
        for n in &candidates {
            if chosen.len() as u32 >= take {
                break;
            }
            if !chosen.contains(&n.index) {
                chosen.push(n.index);
            }
        }

        if (chosen.len() as u32) < request.want_nodes_min {
            return Err(PlacementError::NoFit);
        }

        chosen.sort();
        let per_node_cpus = if request.exclusive {
            chosen
                .iter()
                .map(|idx| candidates.iter().find(|n| n.index == *idx).map(|n| n.cpus).unwrap_or(request.cpus_per_node))
                .collect()
        } else {
            vec![request.cpus_per_node; chosen.len()]
        };
        let cpus_per_node = per_node_cpus;
        Ok(PlacementPlan {
            nodes: chosen,
            cpus_per_node,
            wiring: None,
        })
    }
}

trait SchedulableExt {
    fn is_schedulable_cpus(&self, want: u32) -> bool;
}

impl SchedulableExt for crate::registry::NodeView {
    fn is_schedulable_cpus(&self, want: u32) -> bool {
        use crate::registry::{BaseState, NodeFlags};
        let base_ok = matches!(self.base, BaseState::Idle | BaseState::Mixed);
        let blocking = self.flags.intersects(
            NodeFlags::DRAIN | NodeFlags::NO_RESPOND | NodeFlags::FAIL | NodeFlags::MAINT,
        );
        base_ok && !blocking && self.cpus_free >= want
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{BaseState, NodeFlags, NodeView};
    use std::collections::HashSet;
    use std::sync::Arc;

    fn node(name: &str, idx: u32, weight: u32, cpus_free: u32) -> NodeView {
        NodeView {
            name: name.to_string(),
            index: NodeIndex(idx),
            cpus: 4,
            cpus_free,
            real_mem_mb: 0,
            features: vec![],
            weight,
            base: if cpus_free == 4 {
                BaseState::Idle
            } else {
                BaseState::Mixed
            },
            flags: NodeFlags::empty(),
            coords: None,
        }
    }

    fn partition(indices: &[u32]) -> PartitionRecord {
        PartitionRecord {
            name: "p".into(),
            nodes: indices.iter().map(|&i| NodeIndex(i)).collect::<HashSet<_>>(),
            min_nodes: 1,
            max_nodes: 100,
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
    fn picks_lowest_weight_then_index() {
        let snapshot: NodeSnapshot = Arc::new(vec![
            node("n0", 0, 2, 4),
            node("n1", 1, 1, 4),
            node("n2", 2, 1, 4),
        ]);
        let req = PlacementRequest {
            want_nodes_min: 1,
            want_nodes_max: 1,
            cpus_per_node: 2,
            required_features: vec![],
            include_nodes: vec![],
            exclude_nodes: vec![],
            contiguous: false,
            topology: None,
            exclusive: false,
            mem_per_cpu_mb: 0,
        };
        let plan = LinearBackend
            .place(&snapshot, &partition(&[0, 1, 2]), &req, &HashMap::new())
            .unwrap();
        assert_eq!(plan.nodes, vec![NodeIndex(1)]);
    }

    #[test]
    fn exclusive_request_skips_partially_used_nodes_and_takes_the_whole_node() {
        let snapshot: NodeSnapshot = Arc::new(vec![node("n0", 0, 1, 2), node("n1", 1, 2, 4)]);
        let req = PlacementRequest {
            want_nodes_min: 1,
            want_nodes_max: 1,
            cpus_per_node: 1,
            required_features: vec![],
            include_nodes: vec![],
            exclude_nodes: vec![],
            contiguous: false,
            topology: None,
            exclusive: true,
            mem_per_cpu_mb: 0,
        };
        let plan = LinearBackend
            .place(&snapshot, &partition(&[0, 1]), &req, &HashMap::new())
            .unwrap();
        assert_eq!(plan.nodes, vec![NodeIndex(1)], "n0 has a partial allocation already");
        assert_eq!(plan.cpus_per_node, vec![4], "exclusive takes the whole node, not just cpus_per_node");
    }

    #[test]
    fn mem_per_cpu_rejects_nodes_without_enough_memory() {
        let mut low_mem = node("n0", 0, 0, 4);
        low_mem.real_mem_mb = 100;
        let snapshot: NodeSnapshot = Arc::new(vec![low_mem]);
        let req = PlacementRequest {
            want_nodes_min: 1,
            want_nodes_max: 1,
            cpus_per_node: 2,
            required_features: vec![],
            include_nodes: vec![],
            exclude_nodes: vec![],
            contiguous: false,
            topology: None,
            exclusive: false,
            mem_per_cpu_mb: 1000,
        };
        let err = LinearBackend
            .place(&snapshot, &partition(&[0]), &req, &HashMap::new())
            .unwrap_err();
        assert_eq!(err, PlacementError::NoFit);
    }

    #[test]
    fn share_policy_no_rejects_a_node_already_carrying_another_job() {
        // 4-CPU node with 2 CPUs free; a prior job already occupies it
        // under a share=no partition, so a second job must not land
        // here even though CPU remains.
        let snapshot: NodeSnapshot = Arc::new(vec![node("n0", 0, 0, 2)]);
        let req = PlacementRequest {
            want_nodes_min: 1,
            want_nodes_max: 1,
            cpus_per_node: 2,
            required_features: vec![],
            include_nodes: vec![],
            exclude_nodes: vec![],
            contiguous: false,
            topology: None,
            exclusive: false,
            mem_per_cpu_mb: 0,
        };
        let mut occupants = HashMap::new();
        occupants.insert(NodeIndex(0), 1);
        let mut part = partition(&[0]);
        part.share = crate::partition::SharePolicy::No;
        let err = LinearBackend.place(&snapshot, &part, &req, &occupants).unwrap_err();
        assert_eq!(err, PlacementError::NoFit);
    }

    #[test]
    fn share_policy_yes_n_admits_up_to_its_cotenant_cap() {
        let snapshot: NodeSnapshot = Arc::new(vec![node("n0", 0, 0, 2)]);
        let req = PlacementRequest {
            want_nodes_min: 1,
            want_nodes_max: 1,
            cpus_per_node: 1,
            required_features: vec![],
            include_nodes: vec![],
            exclude_nodes: vec![],
            contiguous: false,
            topology: None,
            exclusive: false,
            mem_per_cpu_mb: 0,
        };
        let mut part = partition(&[0]);
        part.share = crate::partition::SharePolicy::Yes(2);

        let mut at_cap = HashMap::new();
        at_cap.insert(NodeIndex(0), 2);
        let err = LinearBackend.place(&snapshot, &part, &req, &at_cap).unwrap_err();
        assert_eq!(err, PlacementError::NoFit);

        let mut under_cap = HashMap::new();
        under_cap.insert(NodeIndex(0), 1);
        let plan = LinearBackend.place(&snapshot, &part, &req, &under_cap).unwrap();
        assert_eq!(plan.nodes, vec![NodeIndex(0)]);
    }

    #[test]
    fn reports_no_fit_when_not_enough_nodes() {
        let snapshot: NodeSnapshot = Arc::new(vec![node("n0", 0, 1, 4)]);
        let req = PlacementRequest {
            want_nodes_min: 2,
            want_nodes_max: 2,
            cpus_per_node: 1,
            required_features: vec![],
            include_nodes: vec![],
            exclude_nodes: vec![],
            contiguous: false,
            topology: None,
            exclusive: false,
            mem_per_cpu_mb: 0,
        };
        let err = LinearBackend
            .place(&snapshot, &partition(&[0]), &req, &HashMap::new())
            .unwrap_err();
        assert_eq!(err, PlacementError::NoFit);
    }
}
