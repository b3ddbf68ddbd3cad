//! Autoscaler: per-cluster load signals.
//!
//! Evaluates the clusters persisted in the state store against their
//! `AutoScalingConfig` and emits scaling intents. The state store view may
//! lag the scheduler by a tick, which is fine for a signal that is rate
//! limited by minutes-long cooldowns.

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use framegrid_state::*;

/// Which way a cluster should be resized.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScaleDirection {
    Up,
    Down,
}

/// A request to the fleet manager to resize a cluster.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScaleIntent {
    pub cluster_id: ClusterId,
    pub direction: ScaleDirection,
    pub system_load: f64,
    pub node_count: u32,
    pub desired_nodes: u32,
}

/// Outcome of evaluating one cluster.
#[derive(Debug, Clone, PartialEq)]
pub enum ScaleDecision {
    ScaleUp(ScaleIntent),
    ScaleDown(ScaleIntent),
    NoChange,
}

impl ScaleDecision {
    pub fn intent(&self) -> Option<&ScaleIntent> {
        match self {
            ScaleDecision::ScaleUp(intent) | ScaleDecision::ScaleDown(intent) => Some(intent),
            ScaleDecision::NoChange => None,
        }
    }
}

/// Callback type for handing intents to the fleet manager.
pub type ScaleCallback = Box<dyn Fn(ScaleIntent) -> BoxFuture + Send + Sync>;

type BoxFuture = std::pin::Pin<
    Box<dyn std::future::Future<Output = anyhow::Result<()>> + Send>,
>;

/// Aggregate load of a cluster: claimed capacity over total capacity.
pub fn system_load(cluster: &Cluster) -> f64 {
    let (load, capacity) = cluster
        .nodes
        .iter()
        .fold((0u64, 0u64), |(load, capacity), node| {
            (
                load + u64::from(node.current_load),
                capacity + u64::from(node.max_load),
            )
        });
    if capacity == 0 {
        0.0
    } else {
        load as f64 / capacity as f64
    }
}

/// Emits scaling intents for clusters, one cooldown per cluster.
pub struct Autoscaler {
    state: StateStore,
    /// Time (ms) of the last signal emitted per cluster.
    last_signal: HashMap<ClusterId, u64>,
    scale_fn: Option<ScaleCallback>,
}

impl Autoscaler {
    pub fn new(state: StateStore) -> Self {
        Self {
            state,
            last_signal: HashMap::new(),
            scale_fn: None,
        }
    }

    /// Set the callback that receives scaling intents.
    pub fn with_scale_fn(mut self, f: ScaleCallback) -> Self {
        self.scale_fn = Some(f);
        self
    }

    /// Evaluate a single cluster at time `now` (epoch ms).
    pub fn evaluate(&mut self, cluster: &Cluster, now: u64) -> ScaleDecision {
        let policy = &cluster.autoscaling;
        if !policy.enabled {
            return ScaleDecision::NoChange;
        }

        let cooldown_ms = policy.cooldown_secs.saturating_mul(1000);
        if let Some(last) = self.last_signal.get(&cluster.id)
            && now.saturating_sub(*last) < cooldown_ms
        {
            debug!(cluster_id = %cluster.id, "autoscaler in cooldown");
            return ScaleDecision::NoChange;
        }

        let load = system_load(cluster);
        let node_count = u32::try_from(cluster.nodes.len()).unwrap_or(u32::MAX);

        let direction = if load >= policy.scale_up_threshold && node_count < policy.max_nodes {
            ScaleDirection::Up
        } else if load <= policy.scale_down_threshold && node_count > policy.min_nodes {
            ScaleDirection::Down
        } else {
            return ScaleDecision::NoChange;
        };

        let desired_nodes = match direction {
            ScaleDirection::Up => (node_count + 1).min(policy.max_nodes),
            ScaleDirection::Down => node_count.saturating_sub(1).max(policy.min_nodes),
        };
        let intent = ScaleIntent {
            cluster_id: cluster.id.clone(),
            direction,
            system_load: load,
            node_count,
            desired_nodes,
        };

        self.last_signal.insert(cluster.id.clone(), now);
        info!(
            cluster_id = %cluster.id,
            direction = ?direction,
            system_load = load,
            from = node_count,
            to = desired_nodes,
            "scaling signal"
        );

        match direction {
            ScaleDirection::Up => ScaleDecision::ScaleUp(intent),
            ScaleDirection::Down => ScaleDecision::ScaleDown(intent),
        }
    }

    /// Evaluate every persisted cluster and hand intents to the callback.
    pub async fn evaluate_all(&mut self) -> anyhow::Result<Vec<(ClusterId, ScaleDecision)>> {
        self.evaluate_all_at(epoch_millis()).await
    }

    pub async fn evaluate_all_at(&mut self, now: u64) -> anyhow::Result<Vec<(ClusterId, ScaleDecision)>> {
        let clusters = self.state.list_clusters()?;
        let mut decisions = Vec::with_capacity(clusters.len());

        for cluster in &clusters {
            let decision = self.evaluate(cluster, now);

            if let Some(intent) = decision.intent()
                && let Some(ref scale_fn) = self.scale_fn
                && let Err(e) = scale_fn(intent.clone()).await
            {
                warn!(
                    cluster_id = %cluster.id,
                    desired_nodes = intent.desired_nodes,
                    error = %e,
                    "scaling callback failed"
                );
            }

            decisions.push((cluster.id.clone(), decision));
        }

        Ok(decisions)
    }

    /// Run the autoscaler loop.
    pub async fn run(
        &mut self,
        interval: Duration,
        mut shutdown: tokio::sync::watch::Receiver<bool>,
    ) {
        info!(interval_secs = interval.as_secs(), "autoscaler started");

        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {
                    if let Err(e) = self.evaluate_all().await {
                        tracing::error!(error = %e, "autoscaler evaluation failed");
                    }
                }
                _ = shutdown.changed() => {
                    info!("autoscaler shutting down");
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    const NOW: u64 = 10_000_000;

    fn make_node(id: usize, load: u32, max: u32) -> Node {
        Node {
            id: format!("n{id}"),
            name: format!("n{id}"),
            location: "eu-west-1".to_string(),
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
            max_load: max,
            performance: NodePerformance::default(),
            usage: NodeUsage::default(),
            last_heartbeat: NOW,
            task_queue: vec![],
        }
    }

    /// `nodes` nodes of capacity 10 with a combined load of `load`.
    fn cluster_with_load(nodes: usize, load: u32) -> Cluster {
        let mut cluster = Cluster::new("c1", "render", "eu-west-1");
        let mut remaining = load;
        for i in 0..nodes {
            let here = remaining.min(10);
            remaining -= here;
            cluster.nodes.push(make_node(i, here, 10));
        }
        cluster
    }

    #[test]
    fn system_load_is_claimed_over_total_capacity() {
        let cluster = cluster_with_load(4, 10);
        assert!((system_load(&cluster) - 0.25).abs() < 1e-9);
        assert_eq!(system_load(&Cluster::new("c", "c", "r")), 0.0);
    }

    #[test]
    fn scale_up_then_cooldown() {
        let mut scaler = Autoscaler::new(StateStore::open_in_memory().unwrap());
        let cluster = cluster_with_load(5, 45);

        let decision = scaler.evaluate(&cluster, NOW);
        let ScaleDecision::ScaleUp(intent) = decision else {
            panic!("expected scale up, got {decision:?}");
        };
        assert_eq!(intent.node_count, 5);
        assert_eq!(intent.desired_nodes, 6);
        assert!((intent.system_load - 0.9).abs() < 1e-9);

        // Default cooldown is five minutes.
        assert_eq!(scaler.evaluate(&cluster, NOW + 60_000), ScaleDecision::NoChange);
        assert_eq!(scaler.evaluate(&cluster, NOW + 299_999), ScaleDecision::NoChange);
        assert!(matches!(
            scaler.evaluate(&cluster, NOW + 300_000),
            ScaleDecision::ScaleUp(_)
        ));
    }

    #[test]
    fn no_scale_up_at_max_nodes() {
        let mut scaler = Autoscaler::new(StateStore::open_in_memory().unwrap());
        let mut cluster = cluster_with_load(5, 50);
        cluster.autoscaling.max_nodes = 5;
        assert_eq!(scaler.evaluate(&cluster, NOW), ScaleDecision::NoChange);
    }

    #[test]
    fn scale_down_when_idle_but_not_below_min() {
        let mut scaler = Autoscaler::new(StateStore::open_in_memory().unwrap());
        let cluster = cluster_with_load(3, 2);

        let decision = scaler.evaluate(&cluster, NOW);
        assert!(matches!(
            decision,
            ScaleDecision::ScaleDown(ref i) if i.desired_nodes == 2 && i.direction == ScaleDirection::Down
        ));

        let mut single = cluster_with_load(1, 0);
        single.id = "c2".to_string();
        assert_eq!(scaler.evaluate(&single, NOW), ScaleDecision::NoChange);
    }

    #[test]
    fn no_change_between_thresholds() {
        let mut scaler = Autoscaler::new(StateStore::open_in_memory().unwrap());
        let cluster = cluster_with_load(4, 20);
        assert_eq!(scaler.evaluate(&cluster, NOW), ScaleDecision::NoChange);
    }

    #[test]
    fn disabled_cluster_never_signals() {
        let mut scaler = Autoscaler::new(StateStore::open_in_memory().unwrap());
        let mut cluster = cluster_with_load(5, 50);
        cluster.autoscaling.enabled = false;
        assert_eq!(scaler.evaluate(&cluster, NOW), ScaleDecision::NoChange);
    }

    #[test]
    fn cooldowns_are_per_cluster() {
        let mut scaler = Autoscaler::new(StateStore::open_in_memory().unwrap());
        let hot = cluster_with_load(5, 50);
        let mut other = cluster_with_load(5, 50);
        other.id = "c2".to_string();

        assert!(matches!(scaler.evaluate(&hot, NOW), ScaleDecision::ScaleUp(_)));
        assert!(matches!(scaler.evaluate(&other, NOW + 1), ScaleDecision::ScaleUp(_)));
    }

    #[tokio::test]
    async fn evaluate_all_reads_from_state_and_calls_back() {
        let state = StateStore::open_in_memory().unwrap();
        state.put_cluster(&cluster_with_load(5, 45)).unwrap();

        let received = Arc::new(Mutex::new(Vec::new()));
        let sink = received.clone();
        let mut scaler = Autoscaler::new(state).with_scale_fn(Box::new(move |intent| {
            sink.lock().unwrap().push(intent);
            Box::pin(async { Ok(()) })
        }));

        let decisions = scaler.evaluate_all_at(NOW).await.unwrap();
        assert_eq!(decisions.len(), 1);
        assert!(matches!(decisions[0].1, ScaleDecision::ScaleUp(_)));

        let decisions = scaler.evaluate_all_at(NOW + 1_000).await.unwrap();
        assert_eq!(decisions[0].1, ScaleDecision::NoChange);

        let received = received.lock().unwrap();
        assert_eq!(received.len(), 1);
        assert_eq!(received[0].cluster_id, "c1");
    }
}
