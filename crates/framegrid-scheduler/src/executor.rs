//! Render executor seam.
//!
//! The scheduler hands placed tasks to a [`RenderExecutor`] and learns
//! about their fate through [`TaskReport`]s fed back into
//! `Scheduler::handle_report`.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use framegrid_state::{Node, NodeId, RenderTask, TaskId, TaskOutput};

/// Runs render tasks on worker nodes.
///
/// Calls are made while the scheduler lock is held, so implementations
/// should hand work off quickly and report results asynchronously.
#[async_trait]
pub trait RenderExecutor: Send + Sync {
    /// Start `task` on `node`. An error counts as a failed attempt.
    async fn assign(&self, task: &RenderTask, node: &Node) -> anyhow::Result<()>;

    /// Stop a task that is running on `node_id`.
    async fn stop(&self, node_id: &str, task_id: &str) -> anyhow::Result<()>;
}

/// Executor that accepts everything and does nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopExecutor;

#[async_trait]
impl RenderExecutor for NoopExecutor {
    async fn assign(&self, task: &RenderTask, node: &Node) -> anyhow::Result<()> {
        debug!(task_id = %task.id, node_id = %node.id, "noop assign");
        Ok(())
    }

    async fn stop(&self, node_id: &str, task_id: &str) -> anyhow::Result<()> {
        debug!(%task_id, %node_id, "noop stop");
        Ok(())
    }
}

/// What an executor observed about a task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TaskOutcome {
    Completed {
        actual_duration_ms: u64,
        #[serde(default)]
        outputs: Vec<TaskOutput>,
        #[serde(default)]
        storage_bytes: u64,
        #[serde(default)]
        bandwidth_bytes: u64,
    },
    Failed {
        error: String,
    },
    Progress {
        progress: f64,
    },
}

/// A report about one task attempt on one node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskReport {
    pub task_id: TaskId,
    pub node_id: NodeId,
    pub outcome: TaskOutcome,
}

impl TaskReport {
    pub fn completed(task_id: impl Into<String>, node_id: impl Into<String>, actual_duration_ms: u64) -> Self {
        Self {
            task_id: task_id.into(),
            node_id: node_id.into(),
            outcome: TaskOutcome::Completed {
                actual_duration_ms,
                outputs: Vec::new(),
                storage_bytes: 0,
                bandwidth_bytes: 0,
            },
        }
    }

    pub fn failed(task_id: impl Into<String>, node_id: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            task_id: task_id.into(),
            node_id: node_id.into(),
            outcome: TaskOutcome::Failed { error: error.into() },
        }
    }

    pub fn progress(task_id: impl Into<String>, node_id: impl Into<String>, progress: f64) -> Self {
        Self {
            task_id: task_id.into(),
            node_id: node_id.into(),
            outcome: TaskOutcome::Progress { progress },
        }
    }
}
