//! Simulated render nodes.
//!
//! Stands in for the real render workers: assigned tasks "render" for
//! their estimated duration (scaled by node speed and a time factor) and
//! report back over a channel. A node agent loop keeps the configured
//! nodes heartbeating and publishes their usage to the metrics source.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Mutex, mpsc, watch};
use tokio::task::AbortHandle;
use tracing::{debug, info, warn};

use framegrid_metrics::InMemoryMetricsSource;
use framegrid_scheduler::{RenderExecutor, Scheduler, TaskOutcome, TaskReport};
use framegrid_state::{Node, RenderTask, TaskId, TaskOutput};

/// Executor that renders nothing and reports completion after a delay.
pub struct SimulatedExecutor {
    reports: mpsc::UnboundedSender<TaskReport>,
    running: Arc<Mutex<HashMap<TaskId, AbortHandle>>>,
    /// Wall-clock seconds per simulated second.
    time_scale: f64,
}

impl SimulatedExecutor {
    pub fn new(time_scale: f64) -> (Self, mpsc::UnboundedReceiver<TaskReport>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let executor = Self {
            reports: tx,
            running: Arc::new(Mutex::new(HashMap::new())),
            time_scale: time_scale.max(0.0),
        };
        (executor, rx)
    }

    fn render_time(&self, task: &RenderTask, node: &Node) -> Duration {
        let speed = node.performance.average_render_speed.max(0.01);
        let secs = task.estimated_duration_ms as f64 / 1000.0 / speed * self.time_scale;
        Duration::from_secs_f64(secs)
    }
}

#[async_trait]
impl RenderExecutor for SimulatedExecutor {
    async fn assign(&self, task: &RenderTask, node: &Node) -> anyhow::Result<()> {
        let wall = self.render_time(task, node);
        let reports = self.reports.clone();
        let running = self.running.clone();
        let task_id = task.id.clone();
        let node_id = node.id.clone();
        let actual_ms = (task.estimated_duration_ms as f64
            / node.performance.average_render_speed.max(0.01))
        .round() as u64;
        let output = TaskOutput {
            uri: format!("sim://{}/{}.{}", task.job_id, task.id, task.settings.codec),
            size_bytes: task.total_frames() * 64 * 1024,
            format: task.settings.codec.clone(),
        };

        // Held across the spawn so the task's own removal cannot run first.
        let mut tracked = self.running.lock().await;
        let handle = tokio::spawn(async move {
            tokio::time::sleep(wall / 2).await;
            let _ = reports.send(TaskReport::progress(&task_id, &node_id, 0.5));
            tokio::time::sleep(wall - wall / 2).await;

            let report = TaskReport {
                task_id: task_id.clone(),
                node_id,
                outcome: TaskOutcome::Completed {
                    actual_duration_ms: actual_ms,
                    storage_bytes: output.size_bytes,
                    bandwidth_bytes: output.size_bytes,
                    outputs: vec![output],
                },
            };
            if reports.send(report).is_err() {
                debug!(%task_id, "report channel closed");
            }
            running.lock().await.remove(&task_id);
        });

        tracked.insert(task.id.clone(), handle.abort_handle());
        drop(tracked);
        debug!(task_id = %task.id, node_id = %node.id, ?wall, "simulated render started");
        Ok(())
    }

    async fn stop(&self, node_id: &str, task_id: &str) -> anyhow::Result<()> {
        match self.running.lock().await.remove(task_id) {
            Some(handle) => {
                handle.abort();
                debug!(%task_id, %node_id, "simulated render stopped");
                Ok(())
            }
            None => anyhow::bail!("task {task_id} is not running on {node_id}"),
        }
    }
}

/// Feed executor reports back into the scheduler until shutdown.
pub async fn forward_reports(
    scheduler: Arc<Scheduler>,
    mut reports: mpsc::UnboundedReceiver<TaskReport>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            report = reports.recv() => {
                let Some(report) = report else { break };
                let task_id = report.task_id.clone();
                if let Err(e) = scheduler.handle_report(report).await {
                    warn!(%task_id, error = %e, "failed to apply task report");
                }
            }
            _ = shutdown.changed() => {
                info!("report forwarder shutting down");
                break;
            }
        }
    }
}

/// Heartbeat every registered node and publish its usage, derived from
/// its task load, to the metrics source.
pub async fn run_node_agents(
    scheduler: Arc<Scheduler>,
    source: Arc<InMemoryMetricsSource>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    info!(interval_secs = interval.as_secs(), "node agents started");

    loop {
        for cluster in scheduler.list_clusters().await {
            for node in &cluster.nodes {
                if let Err(e) = scheduler.heartbeat(&node.id).await {
                    warn!(node_id = %node.id, error = %e, "heartbeat failed");
                    continue;
                }
                let busy = node.load_ratio() * 100.0;
                let gpu = if node.capabilities.gpu_count > 0 { busy } else { 0.0 };
                source.push(&node.id, busy, 20.0 + busy * 0.6, gpu).await;
            }
        }

        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            _ = shutdown.changed() => {
                info!("node agents shutting down");
                break;
            }
        }
    }
}
