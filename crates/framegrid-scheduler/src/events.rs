//! Scheduler event bus.
//!
//! Every state change of interest is published on a broadcast channel.
//! Subscribers that fall behind lose the oldest events; the scheduler
//! never blocks on them.

use tokio::sync::broadcast;
use tracing::trace;

use framegrid_state::{Cluster, ClusterId, Node, RenderJob, RenderTask};

/// Default number of events buffered per subscriber.
pub const DEFAULT_EVENT_CAPACITY: usize = 1024;

/// A state change published by the scheduler.
#[derive(Debug, Clone)]
pub enum SchedulerEvent {
    ClusterAdded(Cluster),
    ClusterRemoved(Cluster),
    NodeAdded { cluster_id: ClusterId, node: Node },
    NodeRemoved { cluster_id: ClusterId, node: Node },
    /// A node was put in `Error` status after repeated task failures.
    NodeFailedOver { cluster_id: ClusterId, node: Node },
    JobSubmitted(RenderJob),
    JobCompleted(RenderJob),
    JobFailed(RenderJob),
    JobCancelled(RenderJob),
    TaskSubmitted(RenderTask),
    TaskAssigned(RenderTask),
    TaskCompleted(RenderTask),
    /// The task as it entered `Retrying`; it is queued again right after.
    TaskRetried(RenderTask),
    TaskFailed(RenderTask),
    TaskCancelled(RenderTask),
    SystemInitialized { clusters: usize, jobs: usize, tasks: usize },
    InitializationError(String),
}

impl SchedulerEvent {
    /// Short snake_case name, used as a log field.
    pub fn kind(&self) -> &'static str {
        match self {
            SchedulerEvent::ClusterAdded(_) => "cluster_added",
            SchedulerEvent::ClusterRemoved(_) => "cluster_removed",
            SchedulerEvent::NodeAdded { .. } => "node_added",
            SchedulerEvent::NodeRemoved { .. } => "node_removed",
            SchedulerEvent::NodeFailedOver { .. } => "node_failed_over",
            SchedulerEvent::JobSubmitted(_) => "job_submitted",
            SchedulerEvent::JobCompleted(_) => "job_completed",
            SchedulerEvent::JobFailed(_) => "job_failed",
            SchedulerEvent::JobCancelled(_) => "job_cancelled",
            SchedulerEvent::TaskSubmitted(_) => "task_submitted",
            SchedulerEvent::TaskAssigned(_) => "task_assigned",
            SchedulerEvent::TaskCompleted(_) => "task_completed",
            SchedulerEvent::TaskRetried(_) => "task_retried",
            SchedulerEvent::TaskFailed(_) => "task_failed",
            SchedulerEvent::TaskCancelled(_) => "task_cancelled",
            SchedulerEvent::SystemInitialized { .. } => "system_initialized",
            SchedulerEvent::InitializationError(_) => "initialization_error",
        }
    }
}

/// Fan-out of scheduler events to any number of subscribers.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<SchedulerEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_CAPACITY)
    }
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SchedulerEvent> {
        self.tx.subscribe()
    }

    /// Publish an event. Having no subscribers is not an error.
    pub fn emit(&self, event: SchedulerEvent) {
        let kind = event.kind();
        match self.tx.send(event) {
            Ok(receivers) => trace!(kind, receivers, "event published"),
            Err(_) => trace!(kind, "event dropped, no subscribers"),
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscribers_receive_events_in_order() {
        let bus = EventBus::new(8);
        let mut rx = bus.subscribe();

        bus.emit(SchedulerEvent::InitializationError("boom".to_string()));
        bus.emit(SchedulerEvent::SystemInitialized {
            clusters: 1,
            jobs: 2,
            tasks: 3,
        });

        assert_eq!(rx.recv().await.unwrap().kind(), "initialization_error");
        match rx.recv().await.unwrap() {
            SchedulerEvent::SystemInitialized { tasks, .. } => assert_eq!(tasks, 3),
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn emit_without_subscribers_is_fine() {
        let bus = EventBus::default();
        assert_eq!(bus.subscriber_count(), 0);
        bus.emit(SchedulerEvent::InitializationError("nobody listens".to_string()));
    }
}
