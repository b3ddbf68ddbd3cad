//! Metrics collector: samples node usage and checks alert thresholds.
//!
//! Node usage comes from a [`MetricsSource`], the seam to whatever system
//! monitor runs next to the render nodes. Samples are handed to a callback
//! (the daemon forwards them to the scheduler) so this crate stays
//! independent of the scheduler.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use framegrid_state::{Cluster, ClusterId, NodeId, NodeUsage, StateStore, epoch_millis};

/// Instantaneous usage percentages (0..100) of render nodes.
#[async_trait]
pub trait MetricsSource: Send + Sync {
    async fn cpu_usage(&self, node_id: &str) -> Option<f64>;
    async fn memory_usage(&self, node_id: &str) -> Option<f64>;
    async fn gpu_usage(&self, node_id: &str) -> Option<f64>;
}

/// Metrics source fed by pushed samples.
#[derive(Default)]
pub struct InMemoryMetricsSource {
    samples: RwLock<HashMap<NodeId, (f64, f64, f64)>>,
}

impl InMemoryMetricsSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the latest cpu / memory / gpu percentages of a node.
    pub async fn push(&self, node_id: &str, cpu: f64, memory: f64, gpu: f64) {
        self.samples
            .write()
            .await
            .insert(node_id.to_string(), (cpu, memory, gpu));
    }

    pub async fn forget(&self, node_id: &str) {
        self.samples.write().await.remove(node_id);
    }
}

#[async_trait]
impl MetricsSource for InMemoryMetricsSource {
    async fn cpu_usage(&self, node_id: &str) -> Option<f64> {
        self.samples.read().await.get(node_id).map(|s| s.0)
    }

    async fn memory_usage(&self, node_id: &str) -> Option<f64> {
        self.samples.read().await.get(node_id).map(|s| s.1)
    }

    async fn gpu_usage(&self, node_id: &str) -> Option<f64> {
        self.samples.read().await.get(node_id).map(|s| s.2)
    }
}

/// Resource an alert fired on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlertResource {
    Cpu,
    Memory,
    Gpu,
}

impl fmt::Display for AlertResource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AlertResource::Cpu => write!(f, "cpu"),
            AlertResource::Memory => write!(f, "memory"),
            AlertResource::Gpu => write!(f, "gpu"),
        }
    }
}

/// A node usage sample above its cluster's alert threshold.
#[derive(Debug, Clone, PartialEq)]
pub struct Alert {
    pub cluster_id: ClusterId,
    pub node_id: NodeId,
    pub resource: AlertResource,
    pub value: f64,
    pub threshold: f64,
}

/// Callback receiving every collected sample.
pub type UsageCallback = Box<dyn Fn(NodeId, NodeUsage) -> BoxFuture + Send + Sync>;

type BoxFuture = std::pin::Pin<
    Box<dyn std::future::Future<Output = anyhow::Result<()>> + Send>,
>;

/// Periodically samples node usage for every persisted cluster.
pub struct MetricsCollector {
    source: Arc<dyn MetricsSource>,
    state: StateStore,
    interval: Duration,
    usage_fn: Option<UsageCallback>,
}

impl MetricsCollector {
    pub fn new(source: Arc<dyn MetricsSource>, state: StateStore, interval: Duration) -> Self {
        Self {
            source,
            state,
            interval,
            usage_fn: None,
        }
    }

    /// Set the callback that receives usage samples.
    pub fn with_usage_fn(mut self, f: UsageCallback) -> Self {
        self.usage_fn = Some(f);
        self
    }

    /// Poll the source for every node of every monitored cluster.
    ///
    /// Nodes the source knows nothing about are skipped. Missing memory or
    /// gpu readings count as zero.
    pub async fn collect(&self, now: u64) -> anyhow::Result<Vec<(ClusterId, NodeId, NodeUsage)>> {
        let clusters = self.state.list_clusters()?;
        let mut samples = Vec::new();

        for cluster in clusters.iter().filter(|c| c.monitoring.enabled) {
            for node in &cluster.nodes {
                let Some(cpu) = self.source.cpu_usage(&node.id).await else {
                    debug!(node_id = %node.id, "no usage sample for node");
                    continue;
                };
                let usage = NodeUsage {
                    cpu_percent: cpu,
                    memory_percent: self.source.memory_usage(&node.id).await.unwrap_or(0.0),
                    gpu_percent: self.source.gpu_usage(&node.id).await.unwrap_or(0.0),
                    sampled_at: now,
                };
                samples.push((cluster.id.clone(), node.id.clone(), usage));
            }
        }

        Ok(samples)
    }

    /// Compare samples against the thresholds of their clusters.
    pub fn evaluate_alerts(
        clusters: &[Cluster],
        samples: &[(ClusterId, NodeId, NodeUsage)],
    ) -> Vec<Alert> {
        let thresholds: HashMap<&str, _> = clusters
            .iter()
            .filter(|c| c.monitoring.enabled)
            .map(|c| (c.id.as_str(), &c.monitoring.alert_thresholds))
            .collect();

        let mut alerts = Vec::new();
        for (cluster_id, node_id, usage) in samples {
            let Some(limits) = thresholds.get(cluster_id.as_str()) else {
                continue;
            };
            for (resource, value, threshold) in [
                (AlertResource::Cpu, usage.cpu_percent, limits.cpu_percent),
                (AlertResource::Memory, usage.memory_percent, limits.memory_percent),
                (AlertResource::Gpu, usage.gpu_percent, limits.gpu_percent),
            ] {
                if value > threshold {
                    alerts.push(Alert {
                        cluster_id: cluster_id.clone(),
                        node_id: node_id.clone(),
                        resource,
                        value,
                        threshold,
                    });
                }
            }
        }
        alerts
    }

    /// One sampling pass: collect, forward samples, log alerts.
    pub async fn sample(&self) -> anyhow::Result<Vec<Alert>> {
        let samples = self.collect(epoch_millis()).await?;

        if let Some(ref usage_fn) = self.usage_fn {
            for (_, node_id, usage) in &samples {
                if let Err(e) = usage_fn(node_id.clone(), usage.clone()).await {
                    warn!(%node_id, error = %e, "failed to apply usage sample");
                }
            }
        }

        let clusters = self.state.list_clusters()?;
        let alerts = Self::evaluate_alerts(&clusters, &samples);
        for alert in &alerts {
            warn!(
                cluster_id = %alert.cluster_id,
                node_id = %alert.node_id,
                resource = %alert.resource,
                value = alert.value,
                threshold = alert.threshold,
                "node usage above alert threshold"
            );
        }

        debug!(samples = samples.len(), alerts = alerts.len(), "usage sampled");
        Ok(alerts)
    }

    /// Run the sampling loop until shutdown signal.
    pub async fn run(&self, mut shutdown: tokio::sync::watch::Receiver<bool>) {
        info!(
            interval_secs = self.interval.as_secs(),
            "metrics collector started"
        );

        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.interval) => {
                    if let Err(e) = self.sample().await {
                        tracing::error!(error = %e, "metrics sampling failed");
                    }
                }
                _ = shutdown.changed() => {
                    info!("metrics collector shutting down");
                    break;
                }
            }
        }
    }
}
