//! Scheduler: owns the fleet registry, render tasks, jobs and the queue.
//!
//! All mutable scheduling state lives in one `SchedulerCore` behind a
//! single async mutex. A tick, a submission, an executor report, a
//! cancellation or a registry change is one critical section, so node
//! load and task state always move together. Executor calls are awaited
//! inside the critical section: a task cancelled before placement can
//! never be dispatched.
//!
//! Every mutation is written through to the `StateStore`, which the
//! autoscaler and metrics exposition read as an eventually consistent
//! view.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, broadcast, watch};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use framegrid_cluster::ClusterRegistry;
use framegrid_cost::{CostEstimator, CostRates};
use framegrid_placement::NodeScore;
use framegrid_state::*;

use crate::decompose::{Decomposer, JobRequest, TaskRequest};
use crate::error::{SchedulerError, SchedulerResult};
use crate::events::{DEFAULT_EVENT_CAPACITY, EventBus, SchedulerEvent};
use crate::executor::{RenderExecutor, TaskOutcome, TaskReport};
use crate::load_balancer::LoadBalancer;
use crate::queue::TaskQueue;
use crate::retry::{RetryCoordinator, RetryDecision};

/// Reason recorded on tasks whose node stopped sending heartbeats.
pub const HEARTBEAT_TIMEOUT_REASON: &str = "node heartbeat timeout";

/// Scheduler tuning.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub tick_interval: Duration,
    pub missed_heartbeats: u32,
    pub decomposer: Decomposer,
    pub cost_rates: CostRates,
    pub event_capacity: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_secs(1),
            missed_heartbeats: framegrid_cluster::DEFAULT_MISSED_HEARTBEATS,
            decomposer: Decomposer::default(),
            cost_rates: CostRates::default(),
            event_capacity: DEFAULT_EVENT_CAPACITY,
        }
    }
}

/// What one tick did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickReport {
    /// Tasks dispatched to a node.
    pub placed: usize,
    /// Queued tasks left waiting (no node, unmet dependencies, rejected).
    pub unplaced: usize,
    /// Running tasks failed because their node went stale or vanished.
    pub reaped: usize,
}

struct SchedulerCore {
    registry: ClusterRegistry,
    tasks: HashMap<TaskId, RenderTask>,
    jobs: HashMap<JobId, RenderJob>,
    queue: TaskQueue,
    balancer: LoadBalancer,
}

enum Dependencies {
    Ready,
    Waiting,
    Broken(TaskId),
}

fn dependency_state(tasks: &HashMap<TaskId, RenderTask>, task: &RenderTask) -> Dependencies {
    let mut waiting = false;
    for dep in &task.dependencies {
        match tasks.get(dep).map(|t| t.status) {
            Some(TaskStatus::Completed) => {}
            Some(TaskStatus::Failed | TaskStatus::Cancelled) | None => {
                return Dependencies::Broken(dep.clone());
            }
            Some(_) => waiting = true,
        }
    }
    if waiting {
        Dependencies::Waiting
    } else {
        Dependencies::Ready
    }
}

/// The render scheduler.
///
/// Cheap to share behind an `Arc`; every public method takes `&self`.
pub struct Scheduler {
    core: Mutex<SchedulerCore>,
    state: StateStore,
    executor: Arc<dyn RenderExecutor>,
    events: EventBus,
    decomposer: Decomposer,
    costs: CostEstimator,
    retry: RetryCoordinator,
    tick_interval: Duration,
}

impl Scheduler {
    pub fn new(config: SchedulerConfig, state: StateStore, executor: Arc<dyn RenderExecutor>) -> Self {
        let registry = ClusterRegistry::new().with_missed_heartbeats(config.missed_heartbeats);
        Self {
            core: Mutex::new(SchedulerCore {
                registry,
                tasks: HashMap::new(),
                jobs: HashMap::new(),
                queue: TaskQueue::new(),
                balancer: LoadBalancer::new(),
            }),
            state,
            executor,
            events: EventBus::new(config.event_capacity),
            decomposer: config.decomposer,
            costs: CostEstimator::new(config.cost_rates),
            retry: RetryCoordinator::new(),
            tick_interval: config.tick_interval,
        }
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SchedulerEvent> {
        self.events.subscribe()
    }

    pub fn state(&self) -> &StateStore {
        &self.state
    }

    pub fn tick_interval(&self) -> Duration {
        self.tick_interval
    }

    // ── Lifecycle ─────────────────────────────────────────────────

    /// Restore clusters, jobs and tasks from the state store.
    ///
    /// Unfinished tasks go back on the queue. Tasks that were running when
    /// the previous process stopped are requeued without touching their
    /// retry budget, and node loads start from zero.
    pub async fn initialize(&self) -> SchedulerResult<()> {
        match self.restore().await {
            Ok((clusters, jobs, tasks)) => {
                info!(clusters, jobs, tasks, "scheduler initialized");
                self.events.emit(SchedulerEvent::SystemInitialized {
                    clusters,
                    jobs,
                    tasks,
                });
                Ok(())
            }
            Err(e) => {
                error!(error = %e, "scheduler initialization failed");
                self.events
                    .emit(SchedulerEvent::InitializationError(e.to_string()));
                Err(SchedulerError::Initialization(e.to_string()))
            }
        }
    }

    async fn restore(&self) -> SchedulerResult<(usize, usize, usize)> {
        let clusters = self.state.list_clusters()?;
        let jobs = self.state.list_jobs()?;
        let mut tasks = self.state.list_tasks()?;
        tasks.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));

        let mut guard = self.core.lock().await;
        let core = &mut *guard;

        for mut cluster in clusters {
            for node in &mut cluster.nodes {
                node.current_load = 0;
                node.task_queue.clear();
            }
            self.state.put_cluster(&cluster)?;
            core.balancer.forget_cluster(&cluster.id);
            core.registry.add_cluster(cluster);
        }
        for job in jobs {
            core.jobs.insert(job.id.clone(), job);
        }

        let mut requeued = 0usize;
        for mut task in tasks {
            if !task.status.is_terminal() {
                if task.status == TaskStatus::Running {
                    requeued += 1;
                }
                task.status = TaskStatus::Queued;
                task.assigned_node = None;
                task.assigned_cluster = None;
                task.progress = 0.0;
                task.started_at = None;
                self.state.put_task(&task)?;
                core.queue.push(&task);
            }
            core.tasks.insert(task.id.clone(), task);
        }
        if requeued > 0 {
            warn!(requeued, "requeued tasks that were running at shutdown");
        }

        Ok((core.registry.cluster_count(), core.jobs.len(), core.tasks.len()))
    }

    /// Run the placement loop until `shutdown` changes.
    pub async fn run(&self, interval: Duration, mut shutdown: watch::Receiver<bool>) {
        info!(interval_ms = interval.as_millis() as u64, "scheduler loop started");

        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {
                    match self.tick().await {
                        Ok(report) if report.placed > 0 || report.reaped > 0 => {
                            debug!(
                                placed = report.placed,
                                unplaced = report.unplaced,
                                reaped = report.reaped,
                                "scheduler tick"
                            );
                        }
                        Ok(_) => {}
                        Err(e) => error!(error = %e, "scheduler tick failed"),
                    }
                }
                _ = shutdown.changed() => {
                    info!("scheduler loop shutting down");
                    break;
                }
            }
        }
    }

    // ── Tick ──────────────────────────────────────────────────────

    pub async fn tick(&self) -> SchedulerResult<TickReport> {
        self.tick_at(epoch_millis()).await
    }

    /// One scheduling pass at time `now`.
    ///
    /// Reaps tasks of dead nodes, then walks the queue head-first and
    /// places every task that has a ready node. A task that cannot be
    /// placed never blocks the tasks behind it.
    pub async fn tick_at(&self, now: u64) -> SchedulerResult<TickReport> {
        let mut guard = self.core.lock().await;
        let core = &mut *guard;

        let mut report = TickReport {
            reaped: self.reap_orphans(core, now)?,
            ..TickReport::default()
        };

        for task_id in core.queue.snapshot() {
            let Some(task) = core.tasks.get(&task_id) else {
                core.queue.remove(&task_id);
                continue;
            };
            match dependency_state(&core.tasks, task) {
                Dependencies::Ready => {}
                Dependencies::Waiting => {
                    report.unplaced += 1;
                    continue;
                }
                Dependencies::Broken(dep) => {
                    self.fail_on_dependency(core, &task_id, &dep, now)?;
                    continue;
                }
            }
            let requirements = task.requirements.clone();
            let target = task.target_cluster.clone();

            let mut candidates = core.registry.list_available_nodes(Some(&requirements), now);
            if let Some(target) = &target {
                candidates.retain(|c| &c.cluster_id == target);
            }

            let Some(choice) = core
                .balancer
                .select(&core.registry, &candidates, &requirements)
            else {
                debug!(%task_id, reason = %SchedulerError::NoEligibleNode(task_id.clone()), "task stays queued");
                report.unplaced += 1;
                continue;
            };

            if self.dispatch(core, &task_id, &choice, now).await? {
                report.placed += 1;
            } else {
                report.unplaced += 1;
            }
        }

        Ok(report)
    }

    /// Claim capacity on the chosen node and hand the task to the executor.
    async fn dispatch(
        &self,
        core: &mut SchedulerCore,
        task_id: &TaskId,
        choice: &NodeScore,
        now: u64,
    ) -> SchedulerResult<bool> {
        let node = core.registry.node_mut(&choice.node_id)?;
        if !node.acquire(task_id) {
            return Ok(false);
        }
        let node_snapshot = node.clone();
        core.queue.remove(task_id);

        let task = core
            .tasks
            .get_mut(task_id)
            .ok_or_else(|| SchedulerError::TaskNotFound(task_id.clone()))?;
        task.status = TaskStatus::Running;
        task.assigned_node = Some(choice.node_id.clone());
        task.assigned_cluster = Some(choice.cluster_id.clone());
        task.started_at = Some(now);
        let task_snapshot = task.clone();

        if let Err(e) = self.executor.assign(&task_snapshot, &node_snapshot).await {
            warn!(%task_id, node_id = %choice.node_id, error = %e, "executor rejected assignment");
            let reason = SchedulerError::Executor(e).to_string();
            self.fail_task(core, task_id, &reason, now)?;
            return Ok(false);
        }

        info!(
            %task_id,
            node_id = %choice.node_id,
            cluster_id = %choice.cluster_id,
            score = choice.score,
            "task assigned"
        );
        self.state.put_task(&task_snapshot)?;
        self.persist_cluster(core, &choice.cluster_id)?;
        self.events
            .emit(SchedulerEvent::TaskAssigned(task_snapshot.clone()));
        self.refresh_job(core, &task_snapshot.job_id, now)
            .map(|()| true)
    }

    /// Fail running tasks whose node is stale or no longer registered.
    fn reap_orphans(&self, core: &mut SchedulerCore, now: u64) -> SchedulerResult<usize> {
        let stale: HashSet<NodeId> = core.registry.stale_nodes(now).into_iter().collect();
        let mut orphans: Vec<TaskId> = core
            .tasks
            .values()
            .filter(|t| t.status == TaskStatus::Running)
            .filter(|t| match &t.assigned_node {
                Some(node_id) => stale.contains(node_id) || !core.registry.contains_node(node_id),
                None => true,
            })
            .map(|t| t.id.clone())
            .collect();
        orphans.sort();

        for task_id in &orphans {
            warn!(%task_id, "reaping task from unresponsive node");
            self.fail_task(core, task_id, HEARTBEAT_TIMEOUT_REASON, now)?;
        }
        Ok(orphans.len())
    }

    // ── Failure, completion, cancellation ─────────────────────────

    /// Route a failed attempt through the retry coordinator.
    fn fail_task(
        &self,
        core: &mut SchedulerCore,
        task_id: &str,
        reason: &str,
        now: u64,
    ) -> SchedulerResult<()> {
        let task = core
            .tasks
            .get_mut(task_id)
            .ok_or_else(|| SchedulerError::TaskNotFound(task_id.to_string()))?;
        let node_id = task.assigned_node.clone();

        let decision = self.retry.on_failure(task, reason, now);
        let snapshot = task.clone();

        if let Some(node_id) = node_id {
            self.charge_node_failure(core, task_id, &node_id)?;
        }

        self.state.put_task(&snapshot)?;
        let job_id = snapshot.job_id.clone();
        match decision {
            RetryDecision::Retry { .. } => {
                self.events.emit(SchedulerEvent::TaskRetried(snapshot));
                self.requeue(core, task_id)?;
            }
            RetryDecision::Exhausted { .. } => self.events.emit(SchedulerEvent::TaskFailed(snapshot)),
        }
        self.refresh_job(core, &job_id, now)
    }

    /// Move a `Retrying` task back into the queue.
    fn requeue(&self, core: &mut SchedulerCore, task_id: &str) -> SchedulerResult<()> {
        let task = core
            .tasks
            .get_mut(task_id)
            .ok_or_else(|| SchedulerError::TaskNotFound(task_id.to_string()))?;
        task.status = TaskStatus::Queued;
        core.queue.push(task);
        self.state.put_task(task)?;
        debug!(%task_id, attempt = task.retry_count, "task requeued");
        Ok(())
    }

    /// Release the failed task's capacity and count the failure against
    /// the node, failing the node over at its cluster's threshold.
    fn charge_node_failure(
        &self,
        core: &mut SchedulerCore,
        task_id: &str,
        node_id: &str,
    ) -> SchedulerResult<()> {
        let Ok((cluster_id, _)) = core.registry.get_node(node_id) else {
            debug!(%node_id, "failed task's node is gone");
            return Ok(());
        };
        let cluster_id = cluster_id.clone();
        let threshold = core
            .registry
            .get_cluster(&cluster_id)
            .map_or(0, |c| c.load_balancer.failover_threshold);

        let node = core.registry.node_mut(node_id)?;
        node.release(task_id);
        let failed_over = self
            .retry
            .record_node_failure(node, threshold)
            .then(|| node.clone());

        self.persist_cluster(core, &cluster_id)?;
        if let Some(node) = failed_over {
            self.events
                .emit(SchedulerEvent::NodeFailedOver { cluster_id, node });
        }
        Ok(())
    }

    /// Fail a task terminally because a dependency can never complete.
    fn fail_on_dependency(
        &self,
        core: &mut SchedulerCore,
        task_id: &str,
        dependency: &str,
        now: u64,
    ) -> SchedulerResult<()> {
        core.queue.remove(task_id);
        let task = core
            .tasks
            .get_mut(task_id)
            .ok_or_else(|| SchedulerError::TaskNotFound(task_id.to_string()))?;
        task.status = TaskStatus::Failed;
        task.error = Some(format!("dependency {dependency} did not complete"));
        task.completed_at = Some(now);
        let snapshot = task.clone();

        warn!(%task_id, %dependency, "task failed on dependency");
        self.state.put_task(&snapshot)?;
        let job_id = snapshot.job_id.clone();
        self.events.emit(SchedulerEvent::TaskFailed(snapshot));
        self.refresh_job(core, &job_id, now)
    }

    pub async fn handle_report(&self, report: TaskReport) -> SchedulerResult<()> {
        self.handle_report_at(report, epoch_millis()).await
    }

    /// Apply an executor report.
    ///
    /// Reports for tasks that are not running on the reporting node (late
    /// reports after a cancellation, retry or reap) are ignored.
    pub async fn handle_report_at(&self, report: TaskReport, now: u64) -> SchedulerResult<()> {
        let mut guard = self.core.lock().await;
        let core = &mut *guard;

        let task = core
            .tasks
            .get(&report.task_id)
            .ok_or_else(|| SchedulerError::TaskNotFound(report.task_id.clone()))?;
        if task.status != TaskStatus::Running
            || task.assigned_node.as_deref() != Some(report.node_id.as_str())
        {
            debug!(
                task_id = %report.task_id,
                node_id = %report.node_id,
                status = ?task.status,
                "ignoring report for task not running on node"
            );
            return Ok(());
        }

        match report.outcome {
            TaskOutcome::Progress { progress } => {
                if !progress.is_finite() {
                    return Ok(());
                }
                let task = core
                    .tasks
                    .get_mut(&report.task_id)
                    .ok_or_else(|| SchedulerError::TaskNotFound(report.task_id.clone()))?;
                task.progress = progress.clamp(0.0, 1.0);
                self.state.put_task(task)?;
                let job_id = task.job_id.clone();
                self.refresh_job(core, &job_id, now)
            }
            TaskOutcome::Failed { error } => self.fail_task(core, &report.task_id, &error, now),
            TaskOutcome::Completed {
                actual_duration_ms,
                outputs,
                storage_bytes,
                bandwidth_bytes,
            } => {
                let storage_bytes = if storage_bytes > 0 {
                    storage_bytes
                } else {
                    outputs.iter().map(|o| o.size_bytes).sum()
                };
                self.complete_task(
                    core,
                    &report.task_id,
                    &report.node_id,
                    actual_duration_ms,
                    outputs,
                    storage_bytes,
                    bandwidth_bytes,
                    now,
                )
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn complete_task(
        &self,
        core: &mut SchedulerCore,
        task_id: &str,
        node_id: &str,
        actual_duration_ms: u64,
        outputs: Vec<TaskOutput>,
        storage_bytes: u64,
        bandwidth_bytes: u64,
        now: u64,
    ) -> SchedulerResult<()> {
        if let Ok(node) = core.registry.node_mut(node_id) {
            node.release(task_id);
            node.performance.record_success();
        }
        let cluster_id = core.registry.get_node(node_id).ok().map(|(c, _)| c.clone());

        let task = core
            .tasks
            .get_mut(task_id)
            .ok_or_else(|| SchedulerError::TaskNotFound(task_id.to_string()))?;
        task.status = TaskStatus::Completed;
        task.progress = 1.0;
        task.completed_at = Some(now);
        task.actual_duration_ms = Some(actual_duration_ms);
        task.outputs = outputs;
        task.assigned_node = None;
        task.error = None;

        task.cost = match core.jobs.get_mut(&task.job_id) {
            Some(job) => self.costs.record_completion(
                &mut job.cost,
                job.priority,
                actual_duration_ms,
                storage_bytes,
                bandwidth_bytes,
            ),
            None => self.costs.task_cost(actual_duration_ms),
        };
        let snapshot = task.clone();

        info!(
            %task_id,
            %node_id,
            actual_duration_ms,
            cost = snapshot.cost,
            "task completed"
        );
        self.state.put_task(&snapshot)?;
        if let Some(cluster_id) = cluster_id {
            self.persist_cluster(core, &cluster_id)?;
        }
        let job_id = snapshot.job_id.clone();
        self.events.emit(SchedulerEvent::TaskCompleted(snapshot));
        self.refresh_job(core, &job_id, now)
    }

    pub async fn cancel_task(&self, task_id: &str) -> SchedulerResult<RenderTask> {
        self.cancel_task_at(task_id, epoch_millis()).await
    }

    /// Cancel a task. Terminal tasks are returned unchanged.
    pub async fn cancel_task_at(&self, task_id: &str, now: u64) -> SchedulerResult<RenderTask> {
        let mut guard = self.core.lock().await;
        let core = &mut *guard;

        self.cancel_locked(core, task_id, now).await?;
        let task = core
            .tasks
            .get(task_id)
            .cloned()
            .ok_or_else(|| SchedulerError::TaskNotFound(task_id.to_string()))?;
        self.refresh_job(core, &task.job_id, now)?;
        Ok(task)
    }

    /// Cancel every unfinished task of a job and mark the job cancelled.
    ///
    /// A job that already finished is returned unchanged.
    pub async fn cancel_job(&self, job_id: &str) -> SchedulerResult<RenderJob> {
        self.cancel_job_at(job_id, epoch_millis()).await
    }

    pub async fn cancel_job_at(&self, job_id: &str, now: u64) -> SchedulerResult<RenderJob> {
        let mut guard = self.core.lock().await;
        let core = &mut *guard;

        let job = core
            .jobs
            .get(job_id)
            .ok_or_else(|| SchedulerError::JobNotFound(job_id.to_string()))?;
        if job.status.is_terminal() {
            return Ok(job.clone());
        }

        let task_ids = job.task_ids.clone();
        let mut cancelled = 0usize;
        for task_id in &task_ids {
            if core.tasks.contains_key(task_id) && self.cancel_locked(core, task_id, now).await? {
                cancelled += 1;
            }
        }

        let job = core
            .jobs
            .get_mut(job_id)
            .ok_or_else(|| SchedulerError::JobNotFound(job_id.to_string()))?;
        job.status = JobStatus::Cancelled;
        job.completed_at = Some(now);
        job.estimated_completion = None;
        let snapshot = job.clone();

        info!(%job_id, cancelled, "job cancelled");
        self.state.put_job(&snapshot)?;
        self.events
            .emit(SchedulerEvent::JobCancelled(snapshot.clone()));
        Ok(snapshot)
    }

    /// Returns false when the task was already terminal.
    async fn cancel_locked(
        &self,
        core: &mut SchedulerCore,
        task_id: &str,
        now: u64,
    ) -> SchedulerResult<bool> {
        let task = core
            .tasks
            .get_mut(task_id)
            .ok_or_else(|| SchedulerError::TaskNotFound(task_id.to_string()))?;
        if task.status.is_terminal() {
            debug!(%task_id, status = ?task.status, "cancel of finished task ignored");
            return Ok(false);
        }

        let running_on = match task.status {
            TaskStatus::Running => task.assigned_node.clone(),
            _ => None,
        };
        task.status = TaskStatus::Cancelled;
        task.assigned_node = None;
        task.completed_at = Some(now);
        let snapshot = task.clone();
        core.queue.remove(task_id);

        if let Some(node_id) = &running_on {
            if let Ok(node) = core.registry.node_mut(node_id) {
                node.release(task_id);
            }
            if let Ok((cluster_id, _)) = core.registry.get_node(node_id) {
                let cluster_id = cluster_id.clone();
                self.persist_cluster(core, &cluster_id)?;
            }
            if let Err(e) = self.executor.stop(node_id, task_id).await {
                warn!(%task_id, %node_id, error = %e, "failed to stop cancelled task");
            }
        }

        info!(%task_id, was_running = running_on.is_some(), "task cancelled");
        self.state.put_task(&snapshot)?;
        self.events.emit(SchedulerEvent::TaskCancelled(snapshot));
        Ok(true)
    }

    /// Recompute progress, frames, status and completion estimate of a job.
    fn refresh_job(&self, core: &mut SchedulerCore, job_id: &str, now: u64) -> SchedulerResult<()> {
        let Some(job) = core.jobs.get_mut(job_id) else {
            return Ok(());
        };
        let tasks: Vec<&RenderTask> = job
            .task_ids
            .iter()
            .filter_map(|id| core.tasks.get(id))
            .collect();
        let statuses: Vec<TaskStatus> = tasks.iter().map(|t| t.status).collect();

        let completed_frames: u64 = tasks
            .iter()
            .filter(|t| t.status == TaskStatus::Completed)
            .filter(|t| !(t.task_type == TaskType::Encoding && !t.dependencies.is_empty()))
            .map(|t| t.total_frames())
            .sum();
        job.completed_frames = completed_frames.min(job.total_frames);

        let weight = |t: &RenderTask| t.estimated_duration_ms.max(1) as f64;
        let total_weight: f64 = tasks.iter().map(|t| weight(t)).sum();
        let done_weight: f64 = tasks
            .iter()
            .map(|t| match t.status {
                TaskStatus::Completed => weight(t),
                _ => weight(t) * t.progress,
            })
            .sum();
        job.progress = if total_weight > 0.0 {
            (done_weight / total_weight).clamp(0.0, 1.0)
        } else {
            0.0
        };

        if job.started_at.is_none() && tasks.iter().any(|t| t.started_at.is_some()) {
            job.started_at = Some(now);
        }

        let previous = job.status;
        let next = job.derive_status(&statuses);
        job.status = next;
        if next.is_terminal() {
            job.completed_at.get_or_insert(now);
            job.estimated_completion = None;
        } else {
            let remaining: f64 = tasks
                .iter()
                .filter(|t| !t.status.is_terminal())
                .map(|t| t.estimated_duration_ms as f64 * (1.0 - t.progress))
                .sum();
            job.estimated_completion = Some(now.saturating_add(remaining.round() as u64));
        }
        let snapshot = job.clone();

        self.state.put_job(&snapshot)?;
        if next != previous {
            info!(%job_id, from = ?previous, to = ?next, progress = snapshot.progress, "job status changed");
            match next {
                JobStatus::Completed => self.events.emit(SchedulerEvent::JobCompleted(snapshot)),
                JobStatus::Failed => self.events.emit(SchedulerEvent::JobFailed(snapshot)),
                JobStatus::Cancelled => self.events.emit(SchedulerEvent::JobCancelled(snapshot)),
                _ => {}
            }
        }
        Ok(())
    }

    // ── Submission ────────────────────────────────────────────────

    pub async fn submit_job(&self, request: JobRequest) -> SchedulerResult<RenderJob> {
        self.submit_job_at(request, epoch_millis()).await
    }

    /// Validate a job, split it into tasks, estimate its cost and queue it.
    pub async fn submit_job_at(&self, request: JobRequest, now: u64) -> SchedulerResult<RenderJob> {
        request.validate()?;
        self.decomposer.check_job(&request)?;

        let mut guard = self.core.lock().await;
        let core = &mut *guard;
        if let Some(target) = &request.target_cluster
            && !core.registry.contains_cluster(target)
        {
            return Err(SchedulerError::ClusterNotFound(target.clone()));
        }

        let job_id = Uuid::new_v4().to_string();
        let mut tasks = self.decomposer.decompose(&request, &job_id, now);
        for task in &mut tasks {
            task.status = TaskStatus::Queued;
        }
        let job = self.new_job(
            job_id,
            request.name.clone(),
            &request.project_id,
            request.priority,
            request.frame_range.total_frames(),
            &tasks,
            now,
        );

        self.state.put_tasks(&tasks)?;
        self.state.put_job(&job)?;

        info!(
            job_id = %job.id,
            name = %job.name,
            tasks = tasks.len(),
            priority = ?job.priority,
            estimated_cost = job.cost.estimated,
            "job submitted"
        );
        self.events.emit(SchedulerEvent::JobSubmitted(job.clone()));
        core.jobs.insert(job.id.clone(), job.clone());
        for task in tasks {
            core.queue.push(&task);
            self.events.emit(SchedulerEvent::TaskSubmitted(task.clone()));
            core.tasks.insert(task.id.clone(), task);
        }
        Ok(job)
    }

    pub async fn submit_task(&self, request: TaskRequest) -> SchedulerResult<RenderTask> {
        self.submit_task_at(request, epoch_millis()).await
    }

    /// Queue a loose task. It is wrapped in an implicit single-task job.
    pub async fn submit_task_at(&self, request: TaskRequest, now: u64) -> SchedulerResult<RenderTask> {
        request.validate()?;

        let mut guard = self.core.lock().await;
        let core = &mut *guard;
        if let Some(target) = &request.target_cluster
            && !core.registry.contains_cluster(target)
        {
            return Err(SchedulerError::ClusterNotFound(target.clone()));
        }
        if let Some(unknown) = request
            .dependencies
            .iter()
            .find(|d| !core.tasks.contains_key(*d))
        {
            return Err(SchedulerError::InvalidRequest(format!(
                "unknown dependency {unknown}"
            )));
        }

        let job_id = Uuid::new_v4().to_string();
        let mut task = self.decomposer.single_task(&request, &job_id, now);
        task.status = TaskStatus::Queued;
        let job = self.new_job(
            job_id,
            format!("{:?} task {}", task.task_type, task.id),
            &request.project_id,
            request.priority,
            task.total_frames(),
            std::slice::from_ref(&task),
            now,
        );

        self.state.put_task(&task)?;
        self.state.put_job(&job)?;

        info!(task_id = %task.id, job_id = %job.id, priority = ?task.priority, "task submitted");
        self.events.emit(SchedulerEvent::JobSubmitted(job.clone()));
        self.events.emit(SchedulerEvent::TaskSubmitted(task.clone()));
        core.jobs.insert(job.id.clone(), job);
        core.queue.push(&task);
        core.tasks.insert(task.id.clone(), task.clone());
        Ok(task)
    }

    #[allow(clippy::too_many_arguments)]
    fn new_job(
        &self,
        id: JobId,
        name: String,
        project_id: &str,
        priority: TaskPriority,
        total_frames: u64,
        tasks: &[RenderTask],
        now: u64,
    ) -> RenderJob {
        let estimated_ms = tasks
            .iter()
            .fold(0u64, |acc, t| acc.saturating_add(t.estimated_duration_ms));
        RenderJob {
            id,
            name,
            project_id: project_id.to_string(),
            status: JobStatus::Queued,
            task_ids: tasks.iter().map(|t| t.id.clone()).collect(),
            total_frames,
            completed_frames: 0,
            progress: 0.0,
            estimated_completion: Some(now.saturating_add(estimated_ms)),
            cost: self.costs.estimate_job(tasks, priority),
            priority,
            created_at: now,
            started_at: None,
            completed_at: None,
        }
    }

    // ── Fleet ─────────────────────────────────────────────────────

    fn persist_cluster(&self, core: &SchedulerCore, cluster_id: &str) -> SchedulerResult<()> {
        if let Some(cluster) = core.registry.get_cluster(cluster_id) {
            self.state.put_cluster(cluster)?;
        }
        Ok(())
    }

    /// Register a cluster, replacing any cluster with the same id.
    pub async fn add_cluster(&self, cluster: Cluster) -> SchedulerResult<()> {
        if !cluster.load_balancer.has_valid_interval() {
            return Err(SchedulerError::InvalidRequest(format!(
                "cluster {}: health check interval {}s is outside 1..={}s",
                cluster.id,
                cluster.load_balancer.health_check_interval_secs,
                MAX_HEALTH_CHECK_INTERVAL_SECS
            )));
        }
        let mut guard = self.core.lock().await;
        let core = &mut *guard;

        self.state.put_cluster(&cluster)?;
        core.balancer.forget_cluster(&cluster.id);
        core.registry.add_cluster(cluster.clone());
        self.events.emit(SchedulerEvent::ClusterAdded(cluster));
        Ok(())
    }

    /// Remove a cluster and its nodes. Unknown ids are a no-op.
    ///
    /// Tasks still running on the removed nodes are reaped by the next tick.
    pub async fn remove_cluster(&self, cluster_id: &str) -> SchedulerResult<Option<Cluster>> {
        let mut guard = self.core.lock().await;
        let core = &mut *guard;

        let Some(cluster) = core.registry.remove_cluster(cluster_id) else {
            return Ok(None);
        };
        self.state.delete_cluster(cluster_id)?;
        core.balancer.forget_cluster(cluster_id);
        self.events
            .emit(SchedulerEvent::ClusterRemoved(cluster.clone()));
        Ok(Some(cluster))
    }

    pub async fn add_node(&self, cluster_id: &str, node: Node) -> SchedulerResult<()> {
        let mut guard = self.core.lock().await;
        let core = &mut *guard;

        core.registry.add_node(cluster_id, node.clone())?;
        self.persist_cluster(core, cluster_id)?;
        self.events.emit(SchedulerEvent::NodeAdded {
            cluster_id: cluster_id.to_string(),
            node,
        });
        Ok(())
    }

    /// Remove a node. Unknown ids are a no-op.
    pub async fn remove_node(&self, cluster_id: &str, node_id: &str) -> SchedulerResult<Option<Node>> {
        let mut guard = self.core.lock().await;
        let core = &mut *guard;

        let Some(node) = core.registry.remove_node(cluster_id, node_id) else {
            return Ok(None);
        };
        self.persist_cluster(core, cluster_id)?;
        self.events.emit(SchedulerEvent::NodeRemoved {
            cluster_id: cluster_id.to_string(),
            node: node.clone(),
        });
        Ok(Some(node))
    }

    pub async fn heartbeat(&self, node_id: &str) -> SchedulerResult<()> {
        self.heartbeat_at(node_id, epoch_millis()).await
    }

    pub async fn heartbeat_at(&self, node_id: &str, now: u64) -> SchedulerResult<()> {
        let mut guard = self.core.lock().await;
        let core = &mut *guard;

        core.registry.heartbeat(node_id, now)?;
        let (cluster_id, _) = core.registry.get_node(node_id)?;
        let cluster_id = cluster_id.clone();
        self.persist_cluster(core, &cluster_id)
    }

    /// Set a node's stored status. Bringing a node back online clears its
    /// consecutive failure count.
    pub async fn set_node_status(&self, node_id: &str, status: NodeStatus) -> SchedulerResult<()> {
        let mut guard = self.core.lock().await;
        let core = &mut *guard;

        core.registry.set_node_status(node_id, status)?;
        if status == NodeStatus::Online {
            core.registry.node_mut(node_id)?.performance.consecutive_failures = 0;
        }
        let (cluster_id, _) = core.registry.get_node(node_id)?;
        let cluster_id = cluster_id.clone();
        self.persist_cluster(core, &cluster_id)
    }

    /// Store the latest usage sample of a node.
    pub async fn record_node_usage(&self, node_id: &str, usage: NodeUsage) -> SchedulerResult<()> {
        let mut guard = self.core.lock().await;
        let core = &mut *guard;

        core.registry.node_mut(node_id)?.usage = usage;
        let (cluster_id, _) = core.registry.get_node(node_id)?;
        let cluster_id = cluster_id.clone();
        self.persist_cluster(core, &cluster_id)
    }

    // ── Queries ───────────────────────────────────────────────────

    pub async fn get_task(&self, task_id: &str) -> Option<RenderTask> {
        self.core.lock().await.tasks.get(task_id).cloned()
    }

    pub async fn get_job(&self, job_id: &str) -> Option<RenderJob> {
        self.core.lock().await.jobs.get(job_id).cloned()
    }

    /// All tasks, oldest first.
    pub async fn list_tasks(&self) -> Vec<RenderTask> {
        let core = self.core.lock().await;
        let mut tasks: Vec<RenderTask> = core.tasks.values().cloned().collect();
        tasks.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        tasks
    }

    /// All jobs, oldest first.
    pub async fn list_jobs(&self) -> Vec<RenderJob> {
        let core = self.core.lock().await;
        let mut jobs: Vec<RenderJob> = core.jobs.values().cloned().collect();
        jobs.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        jobs
    }

    /// Tasks of a job in decomposition order.
    pub async fn job_tasks(&self, job_id: &str) -> SchedulerResult<Vec<RenderTask>> {
        let core = self.core.lock().await;
        let job = core
            .jobs
            .get(job_id)
            .ok_or_else(|| SchedulerError::JobNotFound(job_id.to_string()))?;
        Ok(job
            .task_ids
            .iter()
            .filter_map(|id| core.tasks.get(id).cloned())
            .collect())
    }

    /// Queued task ids in placement order.
    pub async fn queued_task_ids(&self) -> Vec<TaskId> {
        self.core.lock().await.queue.snapshot()
    }

    pub async fn list_clusters(&self) -> Vec<Cluster> {
        let core = self.core.lock().await;
        core.registry.list_clusters().into_iter().cloned().collect()
    }

    pub async fn get_cluster(&self, cluster_id: &str) -> Option<Cluster> {
        self.core.lock().await.registry.get_cluster(cluster_id).cloned()
    }

    pub async fn get_node(&self, node_id: &str) -> SchedulerResult<Node> {
        let core = self.core.lock().await;
        let (_, node) = core.registry.get_node(node_id)?;
        Ok(node.clone())
    }

    pub async fn list_available_nodes(&self, requirements: Option<&TaskRequirements>) -> Vec<NodeScore> {
        self.list_available_nodes_at(requirements, epoch_millis()).await
    }

    pub async fn list_available_nodes_at(
        &self,
        requirements: Option<&TaskRequirements>,
        now: u64,
    ) -> Vec<NodeScore> {
        self.core
            .lock()
            .await
            .registry
            .list_available_nodes(requirements, now)
    }
}
