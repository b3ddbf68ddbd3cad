//! Load-balancing policies.
//!
//! Candidates arrive already filtered by the matcher and ranked by the
//! scorer. They are grouped by cluster, each cluster's configured
//! algorithm picks one node, and the per-cluster winners are reduced by
//! score (ties by node id).
//!
//! Round robin keeps the last node it picked per cluster and moves on to
//! the next eligible node id after it, so nodes dropping out of the
//! candidate set never make the rotation skip or repeat the others.

use std::collections::{BTreeMap, HashMap};

use tracing::debug;

use framegrid_cluster::ClusterRegistry;
use framegrid_placement::{NodeScore, compare_scores};
use framegrid_state::{ClusterId, LoadBalancingAlgorithm, NodeId, TaskRequirements};

/// Smooth weighted round robin.
///
/// Every pick adds each candidate's weight to its running weight, selects
/// the largest running weight and subtracts the total from the winner.
/// Over a full cycle each node is picked in proportion to its weight,
/// interleaved rather than in bursts.
#[derive(Debug, Default)]
pub struct SmoothWeightedBalancer {
    current: HashMap<NodeId, i64>,
}

impl SmoothWeightedBalancer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pick one of `candidates` (node id, weight). Zero weights count as 1.
    pub fn pick(&mut self, candidates: &[(&NodeId, u32)]) -> Option<usize> {
        if candidates.is_empty() {
            return None;
        }
        let mut total = 0i64;
        let mut best: Option<(usize, i64)> = None;
        for (idx, (node_id, weight)) in candidates.iter().enumerate() {
            let weight = i64::from((*weight).max(1));
            total += weight;
            let running = self.current.entry((*node_id).clone()).or_insert(0);
            *running += weight;
            if best.is_none_or(|(_, w)| *running > w) {
                best = Some((idx, *running));
            }
        }
        let (idx, _) = best?;
        if let Some(running) = self.current.get_mut(candidates[idx].0) {
            *running -= total;
        }
        Some(idx)
    }

    /// Drop running weights of nodes that left the fleet.
    pub fn retain(&mut self, keep: impl Fn(&NodeId) -> bool) {
        self.current.retain(|id, _| keep(id));
    }
}

/// Per-cluster balancing state for every algorithm.
#[derive(Debug, Default)]
pub struct LoadBalancer {
    /// Last node picked by round robin, per cluster.
    round_robin: HashMap<ClusterId, NodeId>,
    weighted: HashMap<ClusterId, SmoothWeightedBalancer>,
}

struct ClusterPick {
    score: NodeScore,
    region_match: bool,
}

impl LoadBalancer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Forget rotation state of a removed cluster.
    pub fn forget_cluster(&mut self, cluster_id: &str) {
        self.round_robin.remove(cluster_id);
        self.weighted.remove(cluster_id);
    }

    /// Choose a node among ranked candidates.
    ///
    /// When a geographic cluster found a node in one of the preferred
    /// regions, only such region matches compete in the final reduction.
    pub fn select(
        &mut self,
        registry: &ClusterRegistry,
        candidates: &[NodeScore],
        requirements: &TaskRequirements,
    ) -> Option<NodeScore> {
        let mut by_cluster: BTreeMap<&ClusterId, Vec<&NodeScore>> = BTreeMap::new();
        for candidate in candidates {
            by_cluster
                .entry(&candidate.cluster_id)
                .or_default()
                .push(candidate);
        }

        let mut picks = Vec::with_capacity(by_cluster.len());
        for (cluster_id, mut group) in by_cluster {
            group.sort_by(|a, b| compare_scores(a, b));
            if let Some(pick) = self.pick_in_cluster(registry, cluster_id, &group, requirements) {
                picks.push(pick);
            }
        }

        if picks.iter().any(|p| p.region_match) {
            picks.retain(|p| p.region_match);
        }
        picks
            .into_iter()
            .map(|p| p.score)
            .min_by(compare_scores)
    }

    fn pick_in_cluster(
        &mut self,
        registry: &ClusterRegistry,
        cluster_id: &ClusterId,
        group: &[&NodeScore],
        requirements: &TaskRequirements,
    ) -> Option<ClusterPick> {
        let cluster = registry.get_cluster(cluster_id)?;
        let algorithm = cluster.load_balancer.algorithm;
        let best = *group.first()?;

        let (chosen, region_match) = match algorithm {
            LoadBalancingAlgorithm::PerformanceBased => (best, false),

            LoadBalancingAlgorithm::RoundRobin => {
                let chosen = next_in_rotation(group, self.round_robin.get(cluster_id))?;
                self.round_robin
                    .insert(cluster_id.clone(), chosen.node_id.clone());
                (chosen, false)
            }

            LoadBalancingAlgorithm::LeastConnections => {
                // Group is score-ordered, so min_by_key keeps the best-scored
                // node among equal loads.
                let chosen = group
                    .iter()
                    .copied()
                    .min_by_key(|s| cluster.node(&s.node_id).map_or(u32::MAX, |n| n.current_load))?;
                (chosen, false)
            }

            LoadBalancingAlgorithm::WeightedRoundRobin => {
                let mut by_id: Vec<&NodeScore> = group.to_vec();
                by_id.sort_by(|a, b| a.node_id.cmp(&b.node_id));
                let weighted: Vec<(&NodeId, u32)> = by_id
                    .iter()
                    .map(|s| {
                        let w = cluster.load_balancer.weights.get(&s.node_id).copied().unwrap_or(1);
                        (&s.node_id, w)
                    })
                    .collect();
                let wrr = self.weighted.entry(cluster_id.clone()).or_default();
                wrr.retain(|id| cluster.node(id).is_some());
                let idx = wrr.pick(&weighted)?;
                (by_id[idx], false)
            }

            LoadBalancingAlgorithm::Geographic => {
                let preferred = &requirements.preferred_regions;
                let local = group.iter().copied().find(|s| {
                    cluster
                        .node(&s.node_id)
                        .is_some_and(|n| preferred.contains(&n.location))
                });
                match local {
                    Some(chosen) => (chosen, true),
                    None => (best, false),
                }
            }
        };

        debug!(
            %cluster_id,
            ?algorithm,
            node_id = %chosen.node_id,
            score = chosen.score,
            "cluster candidate selected"
        );
        Some(ClusterPick {
            score: chosen.clone(),
            region_match,
        })
    }
}

/// The candidate with the smallest node id after `last`, wrapping to the
/// smallest id overall.
fn next_in_rotation<'a>(group: &[&'a NodeScore], last: Option<&NodeId>) -> Option<&'a NodeScore> {
    let first = group.iter().copied().min_by(|a, b| a.node_id.cmp(&b.node_id));
    let Some(last) = last else {
        return first;
    };
    group
        .iter()
        .copied()
        .filter(|s| &s.node_id > last)
        .min_by(|a, b| a.node_id.cmp(&b.node_id))
        .or(first)
}

#[cfg(test)]
mod tests {
    use super::*;
    use framegrid_state::{
        Cluster, Node, NodeCapabilities, NodePerformance, NodeStatus, NodeUsage, Resolution,
    };

    const NOW: u64 = 1_000;

    fn make_node(id: &str, location: &str, load: u32, speed: f64) -> Node {
        Node {
            id: id.to_string(),
            name: id.to_string(),
            location: location.to_string(),
            status: NodeStatus::Online,
            capabilities: NodeCapabilities {
                cpu_cores: 8,
                gpu_count: 0,
                gpu_memory_gb: 0,
                ram_gb: 16,
                storage_gb: 100,
                supported_codecs: vec![],
                max_resolution: Resolution::FULL_HD,
                specializations: vec![],
            },
            current_load: load,
            max_load: 4,
            performance: NodePerformance {
                average_render_speed: speed,
                ..NodePerformance::default()
            },
            usage: NodeUsage::default(),
            last_heartbeat: NOW,
            task_queue: vec![],
        }
    }

    fn registry(algorithm: LoadBalancingAlgorithm, nodes: Vec<Node>) -> ClusterRegistry {
        let mut cluster = Cluster::new("c1", "c1", "eu-west-1");
        cluster.load_balancer.algorithm = algorithm;
        cluster.nodes = nodes;
        let mut reg = ClusterRegistry::new();
        reg.add_cluster(cluster);
        reg
    }

    fn pick(lb: &mut LoadBalancer, reg: &ClusterRegistry, req: &TaskRequirements) -> String {
        let candidates = reg.list_available_nodes(Some(req), NOW);
        lb.select(reg, &candidates, req).unwrap().node_id
    }

    #[test]
    fn performance_based_picks_best_score() {
        let reg = registry(
            LoadBalancingAlgorithm::PerformanceBased,
            vec![make_node("slow", "eu", 0, 1.0), make_node("fast", "eu", 0, 2.0)],
        );
        let mut lb = LoadBalancer::new();
        assert_eq!(pick(&mut lb, &reg, &TaskRequirements::default()), "fast");
    }

    #[test]
    fn round_robin_rotates_independent_of_score() {
        let reg = registry(
            LoadBalancingAlgorithm::RoundRobin,
            vec![
                make_node("b", "eu", 0, 3.0),
                make_node("a", "eu", 0, 1.0),
                make_node("c", "eu", 0, 2.0),
            ],
        );
        let mut lb = LoadBalancer::new();
        let req = TaskRequirements::default();
        let picks: Vec<_> = (0..4).map(|_| pick(&mut lb, &reg, &req)).collect();
        assert_eq!(picks, ["a", "b", "c", "a"]);
    }

    #[test]
    fn round_robin_skips_nodes_that_drop_out() {
        let mut reg = registry(
            LoadBalancingAlgorithm::RoundRobin,
            vec![
                make_node("a", "eu", 0, 1.0),
                make_node("b", "eu", 0, 1.0),
                make_node("c", "eu", 0, 1.0),
            ],
        );
        let mut lb = LoadBalancer::new();
        let req = TaskRequirements::default();
        assert_eq!(pick(&mut lb, &reg, &req), "a");

        // A full node is not a candidate; the rotation continues past it.
        reg.node_mut("b").unwrap().current_load = 4;
        let picks: Vec<_> = (0..3).map(|_| pick(&mut lb, &reg, &req)).collect();
        assert_eq!(picks, ["c", "a", "c"]);

        // The last picked node leaving the fleet does not reset the cycle.
        reg.remove_node("c1", "c");
        reg.node_mut("b").unwrap().current_load = 0;
        let picks: Vec<_> = (0..3).map(|_| pick(&mut lb, &reg, &req)).collect();
        assert_eq!(picks, ["a", "b", "a"]);
    }

    #[test]
    fn round_robin_state_is_per_cluster() {
        let mut reg = registry(
            LoadBalancingAlgorithm::RoundRobin,
            vec![make_node("a", "eu", 0, 1.0), make_node("b", "eu", 0, 1.0)],
        );
        let mut other = Cluster::new("c2", "c2", "eu-west-1");
        other.load_balancer.algorithm = LoadBalancingAlgorithm::RoundRobin;
        other.nodes = vec![make_node("x", "eu", 0, 1.0), make_node("y", "eu", 0, 1.0)];
        reg.add_cluster(other);

        let mut lb = LoadBalancer::new();
        let req = TaskRequirements::default();
        let only = |cluster: &str| -> Vec<NodeScore> {
            reg.list_available_nodes(Some(&req), NOW)
                .into_iter()
                .filter(|c| c.cluster_id == cluster)
                .collect()
        };
        let c1 = only("c1");
        let c2 = only("c2");
        assert_eq!(lb.select(&reg, &c1, &req).unwrap().node_id, "a");
        assert_eq!(lb.select(&reg, &c2, &req).unwrap().node_id, "x");
        assert_eq!(lb.select(&reg, &c1, &req).unwrap().node_id, "b");
        assert_eq!(lb.select(&reg, &c2, &req).unwrap().node_id, "y");

        lb.forget_cluster("c1");
        assert_eq!(lb.select(&reg, &c1, &req).unwrap().node_id, "a");
    }

    #[test]
    fn least_connections_prefers_lowest_load() {
        let reg = registry(
            LoadBalancingAlgorithm::LeastConnections,
            vec![
                make_node("busy-fast", "eu", 3, 5.0),
                make_node("idle-slow", "eu", 1, 0.5),
                make_node("idle-fast", "eu", 1, 1.0),
            ],
        );
        let mut lb = LoadBalancer::new();
        assert_eq!(pick(&mut lb, &reg, &TaskRequirements::default()), "idle-fast");
    }

    #[test]
    fn weighted_round_robin_follows_weights() {
        let mut reg = registry(
            LoadBalancingAlgorithm::WeightedRoundRobin,
            vec![make_node("heavy", "eu", 0, 1.0), make_node("light", "eu", 0, 1.0)],
        );
        let cluster = reg.cluster_mut("c1").unwrap();
        cluster.load_balancer.weights.insert("heavy".to_string(), 3);
        cluster.load_balancer.weights.insert("light".to_string(), 0);

        let mut lb = LoadBalancer::new();
        let req = TaskRequirements::default();
        let picks: Vec<_> = (0..8).map(|_| pick(&mut lb, &reg, &req)).collect();
        let heavy = picks.iter().filter(|p| *p == "heavy").count();
        assert_eq!(heavy, 6);
        // Smooth: never two light picks in a row.
        assert!(picks.windows(2).all(|w| !(w[0] == "light" && w[1] == "light")));
    }

    #[test]
    fn geographic_prefers_region_then_falls_back() {
        let reg = registry(
            LoadBalancingAlgorithm::Geographic,
            vec![make_node("eu-node", "eu-west-1", 0, 1.0), make_node("us-node", "us-east-1", 0, 3.0)],
        );
        let mut lb = LoadBalancer::new();

        let eu = TaskRequirements {
            preferred_regions: vec!["eu-west-1".to_string()],
            ..Default::default()
        };
        assert_eq!(pick(&mut lb, &reg, &eu), "eu-node");

        let nowhere = TaskRequirements {
            preferred_regions: vec!["ap-south-1".to_string()],
            ..Default::default()
        };
        assert_eq!(pick(&mut lb, &reg, &nowhere), "us-node");
    }

    #[test]
    fn cross_cluster_reduction_uses_score() {
        let mut reg = registry(
            LoadBalancingAlgorithm::RoundRobin,
            vec![make_node("c1-a", "eu", 0, 1.0)],
        );
        let mut other = Cluster::new("c2", "c2", "us-east-1");
        other.nodes = vec![make_node("c2-a", "us", 0, 2.0)];
        reg.add_cluster(other);

        let mut lb = LoadBalancer::new();
        let selected = {
            let req = TaskRequirements::default();
            let candidates = reg.list_available_nodes(Some(&req), NOW);
            lb.select(&reg, &candidates, &req).unwrap()
        };
        assert_eq!(selected.node_id, "c2-a");
        assert_eq!(selected.cluster_id, "c2");
    }

    #[test]
    fn empty_candidates_select_nothing() {
        let reg = registry(LoadBalancingAlgorithm::PerformanceBased, vec![]);
        let mut lb = LoadBalancer::new();
        assert!(lb.select(&reg, &[], &TaskRequirements::default()).is_none());
    }
}
