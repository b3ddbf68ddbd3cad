//! Cluster registry: tracks clusters, their worker nodes and node liveness.
//!
//! Liveness is never stored. A node whose last heartbeat is older than
//! its cluster's heartbeat timeout is treated as offline on every read.

use std::collections::{BTreeMap, HashMap};

use thiserror::Error;
use tracing::{debug, info, warn};

use framegrid_placement::{NodeScore, ScoringWeights, check_eligibility, rank_nodes};
use framegrid_state::{Cluster, ClusterId, Node, NodeId, NodeStatus, TaskRequirements};

/// Heartbeats a node may miss before it is considered offline.
pub const DEFAULT_MISSED_HEARTBEATS: u32 = 3;

/// Errors from registry lookups and mutations.
#[derive(Debug, Error, PartialEq)]
pub enum RegistryError {
    #[error("cluster not found: {0}")]
    ClusterNotFound(ClusterId),

    #[error("node not found: {0}")]
    NodeNotFound(NodeId),

    #[error("node {node_id} is already registered in cluster {cluster_id}")]
    NodeAlreadyRegistered { node_id: NodeId, cluster_id: ClusterId },
}

pub type RegistryResult<T> = Result<T, RegistryError>;

/// In-memory registry of clusters and nodes.
///
/// Node ids are unique across the whole fleet; an index maps each node to
/// the cluster that owns it.
#[derive(Debug, Clone)]
pub struct ClusterRegistry {
    clusters: BTreeMap<ClusterId, Cluster>,
    node_index: HashMap<NodeId, ClusterId>,
    missed_heartbeats: u32,
    weights: ScoringWeights,
}

impl Default for ClusterRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ClusterRegistry {
    pub fn new() -> Self {
        Self {
            clusters: BTreeMap::new(),
            node_index: HashMap::new(),
            missed_heartbeats: DEFAULT_MISSED_HEARTBEATS,
            weights: ScoringWeights::default(),
        }
    }

    /// Set how many heartbeat intervals may pass before a node is offline.
    pub fn with_missed_heartbeats(mut self, missed: u32) -> Self {
        self.missed_heartbeats = missed.max(1);
        self
    }

    /// Override the placement scoring weights.
    pub fn with_scoring_weights(mut self, weights: ScoringWeights) -> Self {
        self.weights = weights;
        self
    }

    pub fn scoring_weights(&self) -> &ScoringWeights {
        &self.weights
    }

    pub fn missed_heartbeats(&self) -> u32 {
        self.missed_heartbeats
    }

    // ── Clusters ──────────────────────────────────────────────────

    /// Register a cluster, replacing any cluster with the same id.
    ///
    /// Returns the replaced cluster, if any.
    pub fn add_cluster(&mut self, cluster: Cluster) -> Option<Cluster> {
        let id = cluster.id.clone();
        let replaced = self.remove_cluster_quietly(&id);
        for node in &cluster.nodes {
            self.node_index.insert(node.id.clone(), id.clone());
        }
        info!(
            cluster_id = %id,
            region = %cluster.region,
            nodes = cluster.nodes.len(),
            replaced = replaced.is_some(),
            "cluster registered"
        );
        self.clusters.insert(id, cluster);
        replaced
    }

    /// Remove a cluster and all of its nodes. Unknown ids are a no-op.
    pub fn remove_cluster(&mut self, cluster_id: &str) -> Option<Cluster> {
        let removed = self.remove_cluster_quietly(cluster_id);
        if removed.is_some() {
            info!(%cluster_id, "cluster removed");
        } else {
            debug!(%cluster_id, "remove of unknown cluster ignored");
        }
        removed
    }

    fn remove_cluster_quietly(&mut self, cluster_id: &str) -> Option<Cluster> {
        let cluster = self.clusters.remove(cluster_id)?;
        for node in &cluster.nodes {
            self.node_index.remove(&node.id);
        }
        Some(cluster)
    }

    pub fn get_cluster(&self, cluster_id: &str) -> Option<&Cluster> {
        self.clusters.get(cluster_id)
    }

    pub fn cluster_mut(&mut self, cluster_id: &str) -> Option<&mut Cluster> {
        self.clusters.get_mut(cluster_id)
    }

    /// All clusters, ordered by id.
    pub fn list_clusters(&self) -> Vec<&Cluster> {
        self.clusters.values().collect()
    }

    pub fn contains_cluster(&self, cluster_id: &str) -> bool {
        self.clusters.contains_key(cluster_id)
    }

    pub fn cluster_count(&self) -> usize {
        self.clusters.len()
    }

    /// Heartbeat timeout of a cluster in milliseconds.
    pub fn heartbeat_timeout_ms(&self, cluster_id: &str) -> RegistryResult<u64> {
        self.clusters
            .get(cluster_id)
            .map(|c| c.heartbeat_timeout_ms(self.missed_heartbeats))
            .ok_or_else(|| RegistryError::ClusterNotFound(cluster_id.to_string()))
    }

    // ── Nodes ─────────────────────────────────────────────────────

    /// Add a node to a cluster.
    ///
    /// Re-adding a node to the cluster that already owns it replaces the
    /// stored node.
    pub fn add_node(&mut self, cluster_id: &str, node: Node) -> RegistryResult<()> {
        if let Some(owner) = self.node_index.get(&node.id)
            && owner != cluster_id
        {
            return Err(RegistryError::NodeAlreadyRegistered {
                node_id: node.id.clone(),
                cluster_id: owner.clone(),
            });
        }

        let cluster = self
            .clusters
            .get_mut(cluster_id)
            .ok_or_else(|| RegistryError::ClusterNotFound(cluster_id.to_string()))?;

        let node_id = node.id.clone();
        match cluster.node_mut(&node_id) {
            Some(existing) => *existing = node,
            None => cluster.nodes.push(node),
        }
        self.node_index.insert(node_id.clone(), cluster_id.to_string());
        info!(%cluster_id, %node_id, "node added");
        Ok(())
    }

    /// Remove a node from a cluster. Unknown ids are a no-op.
    pub fn remove_node(&mut self, cluster_id: &str, node_id: &str) -> Option<Node> {
        let cluster = self.clusters.get_mut(cluster_id)?;
        let pos = cluster.nodes.iter().position(|n| n.id == node_id)?;
        let node = cluster.nodes.remove(pos);
        self.node_index.remove(node_id);
        info!(%cluster_id, %node_id, "node removed");
        Some(node)
    }

    /// Look up a node and the id of the cluster that owns it.
    pub fn get_node(&self, node_id: &str) -> RegistryResult<(&ClusterId, &Node)> {
        let not_found = || RegistryError::NodeNotFound(node_id.to_string());
        let (cluster_id, cluster) = self
            .node_index
            .get(node_id)
            .and_then(|cid| self.clusters.get_key_value(cid))
            .ok_or_else(not_found)?;
        let node = cluster.node(node_id).ok_or_else(not_found)?;
        Ok((cluster_id, node))
    }

    pub fn node_mut(&mut self, node_id: &str) -> RegistryResult<&mut Node> {
        let not_found = || RegistryError::NodeNotFound(node_id.to_string());
        let cluster_id = self.node_index.get(node_id).ok_or_else(not_found)?;
        self.clusters
            .get_mut(cluster_id)
            .and_then(|c| c.node_mut(node_id))
            .ok_or_else(not_found)
    }

    pub fn contains_node(&self, node_id: &str) -> bool {
        self.node_index.contains_key(node_id)
    }

    pub fn node_count(&self) -> usize {
        self.node_index.len()
    }

    /// Record a heartbeat from a node.
    pub fn heartbeat(&mut self, node_id: &str, now: u64) -> RegistryResult<()> {
        match self.node_mut(node_id) {
            Ok(node) => {
                node.last_heartbeat = now;
                debug!(%node_id, "heartbeat received");
                Ok(())
            }
            Err(e) => {
                warn!(%node_id, "heartbeat from unknown node");
                Err(e)
            }
        }
    }

    /// Set the stored status of a node. Returns the previous status.
    pub fn set_node_status(&mut self, node_id: &str, status: NodeStatus) -> RegistryResult<NodeStatus> {
        let node = self.node_mut(node_id)?;
        let previous = std::mem::replace(&mut node.status, status);
        if previous != status {
            info!(%node_id, from = ?previous, to = ?status, "node status changed");
        }
        Ok(previous)
    }

    /// Status of a node with heartbeat staleness applied.
    pub fn effective_status(&self, node_id: &str, now: u64) -> RegistryResult<NodeStatus> {
        let (cluster_id, node) = self.get_node(node_id)?;
        let timeout = self.heartbeat_timeout_ms(cluster_id)?;
        Ok(node.effective_status(now, timeout))
    }

    /// Iterate `(cluster id, node)` pairs across the fleet, clusters in id
    /// order and nodes in registration order.
    pub fn nodes(&self) -> impl Iterator<Item = (&ClusterId, &Node)> {
        self.clusters
            .iter()
            .flat_map(|(id, c)| c.nodes.iter().map(move |n| (id, n)))
    }

    /// Nodes that pass the matcher for `requirements`, without scoring.
    pub fn eligible_nodes(
        &self,
        requirements: Option<&TaskRequirements>,
        now: u64,
    ) -> Vec<(&ClusterId, &Node)> {
        let mut eligible = Vec::new();
        for (cluster_id, cluster) in &self.clusters {
            let timeout = cluster.heartbeat_timeout_ms(self.missed_heartbeats);
            for node in &cluster.nodes {
                match check_eligibility(node, requirements, now, timeout) {
                    Ok(()) => eligible.push((cluster_id, node)),
                    Err(reason) => {
                        debug!(%cluster_id, node_id = %node.id, %reason, "node not eligible");
                    }
                }
            }
        }
        eligible
    }

    /// Every eligible node across all clusters, best score first.
    ///
    /// With `None` only derived liveness and saturation are checked.
    pub fn list_available_nodes(
        &self,
        requirements: Option<&TaskRequirements>,
        now: u64,
    ) -> Vec<NodeScore> {
        rank_nodes(self.eligible_nodes(requirements, now), &self.weights)
    }

    /// Nodes whose heartbeat is older than their cluster's timeout.
    pub fn stale_nodes(&self, now: u64) -> Vec<NodeId> {
        let mut stale = Vec::new();
        for cluster in self.clusters.values() {
            let timeout = cluster.heartbeat_timeout_ms(self.missed_heartbeats);
            for node in &cluster.nodes {
                if now.saturating_sub(node.last_heartbeat) > timeout {
                    stale.push(node.id.clone());
                }
            }
        }
        if !stale.is_empty() {
            debug!(count = stale.len(), "stale nodes detected");
        }
        stale
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use framegrid_state::{NodeCapabilities, NodePerformance, NodeUsage, Resolution};

    const NOW: u64 = 1_000_000;

    fn make_node(id: &str, cpu: u32) -> Node {
        Node {
            id: id.to_string(),
            name: id.to_string(),
            location: "eu-west-1".to_string(),
            status: NodeStatus::Online,
            capabilities: NodeCapabilities {
                cpu_cores: cpu,
                gpu_count: 0,
                gpu_memory_gb: 0,
                ram_gb: 16,
                storage_gb: 100,
                supported_codecs: vec!["h264".to_string()],
                max_resolution: Resolution::FULL_HD,
                specializations: vec![],
            },
            current_load: 0,
            max_load: 2,
            performance: NodePerformance::default(),
            usage: NodeUsage::default(),
            last_heartbeat: NOW,
            task_queue: vec![],
        }
    }

    fn registry_with(nodes: &[(&str, &str)]) -> ClusterRegistry {
        let mut reg = ClusterRegistry::new();
        for (cluster_id, node_id) in nodes {
            if !reg.contains_cluster(cluster_id) {
                reg.add_cluster(Cluster::new(*cluster_id, *cluster_id, "eu-west-1"));
            }
            reg.add_node(cluster_id, make_node(node_id, 8)).unwrap();
        }
        reg
    }

    #[test]
    fn add_and_lookup_node() {
        let reg = registry_with(&[("c1", "n1"), ("c1", "n2")]);
        let (cluster_id, node) = reg.get_node("n2").unwrap();
        assert_eq!(cluster_id, "c1");
        assert_eq!(node.id, "n2");
        assert_eq!(reg.node_count(), 2);
    }

    #[test]
    fn add_node_to_unknown_cluster_fails() {
        let mut reg = ClusterRegistry::new();
        let err = reg.add_node("missing", make_node("n1", 8)).unwrap_err();
        assert_eq!(err, RegistryError::ClusterNotFound("missing".to_string()));
        assert!(!reg.contains_node("n1"));
    }

    #[test]
    fn node_ids_are_unique_across_clusters() {
        let mut reg = registry_with(&[("c1", "n1")]);
        reg.add_cluster(Cluster::new("c2", "c2", "us-east-1"));
        let err = reg.add_node("c2", make_node("n1", 8)).unwrap_err();
        assert!(matches!(err, RegistryError::NodeAlreadyRegistered { .. }));
    }

    #[test]
    fn readding_node_replaces_it() {
        let mut reg = registry_with(&[("c1", "n1")]);
        reg.add_node("c1", make_node("n1", 32)).unwrap();
        let (_, node) = reg.get_node("n1").unwrap();
        assert_eq!(node.capabilities.cpu_cores, 32);
        assert_eq!(reg.get_cluster("c1").unwrap().nodes.len(), 1);
    }

    #[test]
    fn removing_unknown_entities_is_noop() {
        let mut reg = registry_with(&[("c1", "n1")]);
        assert!(reg.remove_node("c1", "ghost").is_none());
        assert!(reg.remove_node("ghost", "n1").is_none());
        assert!(reg.remove_cluster("ghost").is_none());
        assert_eq!(reg.node_count(), 1);
        assert_eq!(reg.cluster_count(), 1);
    }

    #[test]
    fn removing_cluster_drops_its_nodes() {
        let mut reg = registry_with(&[("c1", "n1"), ("c2", "n2")]);
        let removed = reg.remove_cluster("c1").unwrap();
        assert_eq!(removed.nodes.len(), 1);
        assert!(reg.get_node("n1").is_err());
        assert!(reg.get_node("n2").is_ok());
    }

    #[test]
    fn replacing_cluster_reindexes_nodes() {
        let mut reg = registry_with(&[("c1", "n1")]);
        let mut replacement = Cluster::new("c1", "c1", "eu-west-1");
        replacement.nodes.push(make_node("n9", 8));
        assert!(reg.add_cluster(replacement).is_some());
        assert!(!reg.contains_node("n1"));
        assert!(reg.contains_node("n9"));
    }

    #[test]
    fn clusters_are_listed_in_id_order() {
        let reg = registry_with(&[("zeta", "n1"), ("alpha", "n2"), ("mid", "n3")]);
        let ids: Vec<_> = reg.list_clusters().iter().map(|c| c.id.as_str()).collect();
        assert_eq!(ids, ["alpha", "mid", "zeta"]);
    }

    #[test]
    fn heartbeat_updates_last_seen() {
        let mut reg = registry_with(&[("c1", "n1")]);
        reg.heartbeat("n1", NOW + 5_000).unwrap();
        assert_eq!(reg.get_node("n1").unwrap().1.last_heartbeat, NOW + 5_000);
    }

    #[test]
    fn heartbeat_unknown_node_is_error() {
        let mut reg = ClusterRegistry::new();
        assert_eq!(
            reg.heartbeat("ghost", NOW),
            Err(RegistryError::NodeNotFound("ghost".to_string()))
        );
    }

    #[test]
    fn stale_nodes_use_cluster_timeout() {
        // Default interval is 10s; three missed beats give a 30s timeout.
        let mut reg = registry_with(&[("c1", "n1"), ("c1", "n2")]);
        reg.heartbeat("n2", NOW + 25_000).unwrap();

        assert!(reg.stale_nodes(NOW + 30_000).is_empty());
        assert_eq!(reg.stale_nodes(NOW + 30_001), vec!["n1".to_string()]);
        assert_eq!(
            reg.effective_status("n1", NOW + 30_001).unwrap(),
            NodeStatus::Offline
        );
        assert_eq!(
            reg.effective_status("n2", NOW + 30_001).unwrap(),
            NodeStatus::Online
        );
    }

    #[test]
    fn missed_heartbeats_scales_timeout() {
        let reg = registry_with(&[("c1", "n1")]).with_missed_heartbeats(6);
        assert_eq!(reg.heartbeat_timeout_ms("c1").unwrap(), 60_000);
        assert!(reg.stale_nodes(NOW + 59_000).is_empty());
    }

    #[test]
    fn available_nodes_filter_and_rank() {
        let mut reg = registry_with(&[("c1", "small"), ("c2", "busy"), ("c2", "idle")]);
        reg.node_mut("small").unwrap().capabilities.cpu_cores = 4;
        reg.node_mut("busy").unwrap().current_load = 1;

        let req = TaskRequirements {
            min_cpu_cores: 8,
            ..Default::default()
        };
        let ranked = reg.list_available_nodes(Some(&req), NOW);
        let ids: Vec<_> = ranked.iter().map(|s| s.node_id.as_str()).collect();
        assert_eq!(ids, ["idle", "busy"]);
        assert_eq!(ranked[0].cluster_id, "c2");
    }

    #[test]
    fn available_nodes_without_requirements_checks_liveness_only() {
        let mut reg = registry_with(&[("c1", "n1"), ("c1", "n2"), ("c1", "n3")]);
        reg.set_node_status("n2", NodeStatus::Maintenance).unwrap();
        reg.node_mut("n3").unwrap().current_load = 2;

        let ranked = reg.list_available_nodes(None, NOW);
        assert_eq!(ranked.len(), 1);
        assert_eq!(ranked[0].node_id, "n1");

        assert!(reg.list_available_nodes(None, NOW + 60_000).is_empty());
    }

    #[test]
    fn set_status_returns_previous() {
        let mut reg = registry_with(&[("c1", "n1")]);
        let prev = reg.set_node_status("n1", NodeStatus::Error).unwrap();
        assert_eq!(prev, NodeStatus::Online);
        assert_eq!(reg.get_node("n1").unwrap().1.status, NodeStatus::Error);
    }
}
