//! Retry and failure accounting.
//!
//! `retry_count` counts failed attempts. A failure bumps the count; the
//! task is retried while the count stays below `max_retries` and fails
//! terminally once it reaches it.

use tracing::{info, warn};

use framegrid_state::{Node, NodeStatus, RenderTask, TaskStatus};

use crate::error::SchedulerError;

/// Outcome of a task failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// The task is `Retrying` and must be re-enqueued.
    Retry { attempt: u32 },
    /// The retry budget is spent; the task is terminally `Failed`.
    Exhausted { attempts: u32 },
}

/// Applies the retry budget to failed tasks and failure counters to nodes.
#[derive(Debug, Clone, Copy, Default)]
pub struct RetryCoordinator;

impl RetryCoordinator {
    pub fn new() -> Self {
        Self
    }

    /// Record a failed attempt on `task`.
    ///
    /// The assignment is cleared in both outcomes. A retried task lands in
    /// `Retrying` until the scheduler queues it again.
    pub fn on_failure(&self, task: &mut RenderTask, reason: &str, now: u64) -> RetryDecision {
        task.retry_count = (task.retry_count + 1).min(task.max_retries);
        task.assigned_node = None;
        task.assigned_cluster = None;
        task.progress = 0.0;
        task.started_at = None;

        if task.retry_count < task.max_retries {
            task.error = Some(reason.to_string());
            info!(
                task_id = %task.id,
                attempt = task.retry_count,
                max_retries = task.max_retries,
                %reason,
                "task failed, retrying"
            );
            task.status = TaskStatus::Retrying;
            RetryDecision::Retry {
                attempt: task.retry_count,
            }
        } else {
            let attempts = task.retry_count.max(1);
            let exceeded = SchedulerError::RetryBudgetExceeded {
                task_id: task.id.clone(),
                attempts,
            };
            warn!(task_id = %task.id, attempts, %reason, "task failed permanently");
            task.status = TaskStatus::Failed;
            task.error = Some(format!("{exceeded}: {reason}"));
            task.completed_at = Some(now);
            RetryDecision::Exhausted { attempts }
        }
    }

    /// Charge a failure to a node. Returns true when the node was failed
    /// over into `Error` status by this failure.
    ///
    /// A `failover_threshold` of zero disables failover.
    pub fn record_node_failure(&self, node: &mut Node, failover_threshold: u32) -> bool {
        node.performance.record_failure();
        let tripped = failover_threshold > 0
            && node.performance.consecutive_failures >= failover_threshold
            && node.status != NodeStatus::Error;
        if tripped {
            node.status = NodeStatus::Error;
            warn!(
                node_id = %node.id,
                consecutive_failures = node.performance.consecutive_failures,
                "node failed over"
            );
        }
        tripped
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use framegrid_state::{
        FrameRange, NodeCapabilities, NodePerformance, NodeUsage, RenderSettings, Resolution,
        TaskMetadata, TaskPriority, TaskRequirements, TaskType,
    };

    fn running_task(max_retries: u32) -> RenderTask {
        RenderTask {
            id: "t1".to_string(),
            job_id: "j1".to_string(),
            project_id: "p1".to_string(),
            task_type: TaskType::VideoRender,
            priority: TaskPriority::Normal,
            status: TaskStatus::Running,
            frame_range: FrameRange { start: 0, end: 99 },
            settings: RenderSettings::default(),
            requirements: TaskRequirements::default(),
            target_cluster: None,
            assigned_node: Some("n1".to_string()),
            assigned_cluster: Some("c1".to_string()),
            progress: 0.4,
            created_at: 0,
            started_at: Some(10),
            completed_at: None,
            estimated_duration_ms: 10_000,
            actual_duration_ms: None,
            retry_count: 0,
            max_retries,
            dependencies: vec![],
            outputs: vec![],
            metadata: TaskMetadata::default(),
            error: None,
            cost: 0.0,
        }
    }

    fn node() -> Node {
        Node {
            id: "n1".to_string(),
            name: "n1".to_string(),
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
            current_load: 0,
            max_load: 2,
            performance: NodePerformance::default(),
            usage: NodeUsage::default(),
            last_heartbeat: 0,
            task_queue: vec![],
        }
    }

    #[test]
    fn first_failure_retries_and_resets_assignment() {
        let coord = RetryCoordinator::new();
        let mut task = running_task(3);

        let decision = coord.on_failure(&mut task, "encoder crashed", 50);
        assert_eq!(decision, RetryDecision::Retry { attempt: 1 });
        assert_eq!(task.status, TaskStatus::Retrying);
        assert_eq!(task.retry_count, 1);
        assert_eq!(task.progress, 0.0);
        assert!(task.assigned_node.is_none());
        assert!(task.assigned_cluster.is_none());
        assert_eq!(task.error.as_deref(), Some("encoder crashed"));
    }

    #[test]
    fn third_failure_exhausts_budget_of_three() {
        let coord = RetryCoordinator::new();
        let mut task = running_task(3);

        assert!(matches!(coord.on_failure(&mut task, "x", 1), RetryDecision::Retry { .. }));
        task.status = TaskStatus::Running;
        assert!(matches!(coord.on_failure(&mut task, "x", 2), RetryDecision::Retry { .. }));
        task.status = TaskStatus::Running;
        let last = coord.on_failure(&mut task, "x", 3);

        assert_eq!(last, RetryDecision::Exhausted { attempts: 3 });
        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(task.retry_count, 3);
        assert_eq!(task.completed_at, Some(3));
        assert!(task.error.as_deref().unwrap().contains("retry budget"));
    }

    #[test]
    fn zero_budget_fails_immediately() {
        let coord = RetryCoordinator::new();
        let mut task = running_task(0);
        assert_eq!(
            coord.on_failure(&mut task, "x", 1),
            RetryDecision::Exhausted { attempts: 1 }
        );
        assert_eq!(task.retry_count, 0);
    }

    #[test]
    fn node_fails_over_at_threshold() {
        let coord = RetryCoordinator::new();
        let mut n = node();

        assert!(!coord.record_node_failure(&mut n, 2));
        assert_eq!(n.status, NodeStatus::Online);
        assert!(coord.record_node_failure(&mut n, 2));
        assert_eq!(n.status, NodeStatus::Error);
        // Already failed over: not reported twice.
        assert!(!coord.record_node_failure(&mut n, 2));
        assert_eq!(n.performance.failed_tasks, 3);
    }

    #[test]
    fn zero_threshold_disables_failover() {
        let coord = RetryCoordinator::new();
        let mut n = node();
        for _ in 0..10 {
            assert!(!coord.record_node_failure(&mut n, 0));
        }
        assert_eq!(n.status, NodeStatus::Online);
        assert_eq!(n.performance.reliability, 0.0);
    }
}
