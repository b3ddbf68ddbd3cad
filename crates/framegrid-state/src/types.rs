//! Domain types for the framegrid state store.
//!
//! These types represent the persisted state of clusters, nodes, render
//! tasks and render jobs. All types are serializable to/from JSON for
//! storage in redb tables.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Unique identifier for a cluster.
pub type ClusterId = String;

/// Unique identifier for a worker node.
pub type NodeId = String;

/// Unique identifier for a render task.
pub type TaskId = String;

/// Unique identifier for a render job.
pub type JobId = String;

/// Identifier of the studio project that owns a job.
pub type ProjectId = String;

// ── Cluster ───────────────────────────────────────────────────────

/// A named pool of worker nodes in one region.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Cluster {
    pub id: ClusterId,
    pub name: String,
    pub region: String,
    /// Nodes owned by this cluster, in registration order.
    pub nodes: Vec<Node>,
    pub load_balancer: LoadBalancerConfig,
    pub autoscaling: AutoScalingConfig,
    pub monitoring: MonitoringConfig,
    /// Unix timestamp (milliseconds) when the cluster was registered.
    pub created_at: u64,
}

impl Cluster {
    /// Create an empty cluster with default policies.
    pub fn new(id: impl Into<String>, name: impl Into<String>, region: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            region: region.into(),
            nodes: Vec::new(),
            load_balancer: LoadBalancerConfig::default(),
            autoscaling: AutoScalingConfig::default(),
            monitoring: MonitoringConfig::default(),
            created_at: 0,
        }
    }

    /// Heartbeat staleness threshold for nodes of this cluster.
    pub fn heartbeat_timeout_ms(&self, missed_heartbeats: u32) -> u64 {
        self.load_balancer
            .health_check_interval_secs
            .saturating_mul(1000)
            .saturating_mul(u64::from(missed_heartbeats.max(1)))
    }

    pub fn node(&self, node_id: &str) -> Option<&Node> {
        self.nodes.iter().find(|n| n.id == node_id)
    }

    pub fn node_mut(&mut self, node_id: &str) -> Option<&mut Node> {
        self.nodes.iter_mut().find(|n| n.id == node_id)
    }
}

/// Load-balancing algorithm used to pick among eligible nodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum LoadBalancingAlgorithm {
    #[default]
    PerformanceBased,
    RoundRobin,
    LeastConnections,
    WeightedRoundRobin,
    Geographic,
}

/// Longest accepted node heartbeat interval (one day).
pub const MAX_HEALTH_CHECK_INTERVAL_SECS: u64 = 86_400;

/// Per-cluster load-balancing parameters.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LoadBalancerConfig {
    pub algorithm: LoadBalancingAlgorithm,
    /// Expected heartbeat interval for nodes of this cluster.
    pub health_check_interval_secs: u64,
    /// Consecutive task failures before a node is failed over (0 disables).
    pub failover_threshold: u32,
    /// Per-node weights for weighted round robin. Missing nodes weigh 1.
    #[serde(default)]
    pub weights: HashMap<NodeId, u32>,
}

impl LoadBalancerConfig {
    /// Whether the heartbeat interval is within `1..=MAX_HEALTH_CHECK_INTERVAL_SECS`.
    pub fn has_valid_interval(&self) -> bool {
        (1..=MAX_HEALTH_CHECK_INTERVAL_SECS).contains(&self.health_check_interval_secs)
    }
}

impl Default for LoadBalancerConfig {
    fn default() -> Self {
        Self {
            algorithm: LoadBalancingAlgorithm::PerformanceBased,
            health_check_interval_secs: 10,
            failover_threshold: 3,
            weights: HashMap::new(),
        }
    }
}

/// Autoscaling thresholds for a cluster.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AutoScalingConfig {
    pub enabled: bool,
    pub min_nodes: u32,
    pub max_nodes: u32,
    /// System load (0..1) at or above which a scale-up intent is emitted.
    pub scale_up_threshold: f64,
    /// System load (0..1) at or below which a scale-down intent is emitted.
    pub scale_down_threshold: f64,
    /// Minimum time between two scaling signals.
    pub cooldown_secs: u64,
}

impl Default for AutoScalingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            min_nodes: 1,
            max_nodes: 10,
            scale_up_threshold: 0.8,
            scale_down_threshold: 0.3,
            cooldown_secs: 300,
        }
    }
}

/// Monitoring parameters for a cluster.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MonitoringConfig {
    pub enabled: bool,
    pub interval_secs: u64,
    pub alert_thresholds: AlertThresholds,
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: 30,
            alert_thresholds: AlertThresholds::default(),
        }
    }
}

/// Usage percentages (0..100) above which an alert is raised.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AlertThresholds {
    pub cpu_percent: f64,
    pub memory_percent: f64,
    pub gpu_percent: f64,
}

impl Default for AlertThresholds {
    fn default() -> Self {
        Self {
            cpu_percent: 90.0,
            memory_percent: 90.0,
            gpu_percent: 95.0,
        }
    }
}

// ── Node ──────────────────────────────────────────────────────────

/// Stored lifecycle status of a worker node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    Online,
    Offline,
    Busy,
    Maintenance,
    Error,
}

/// Tagged worker capability required by some tasks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Specialization {
    GpuAcceleration,
    AiProcessing,
    AudioProcessing,
    VideoEncoding,
    AvatarAnimation,
    Compositing,
}

/// Output resolution in pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

impl Resolution {
    pub const HD: Resolution = Resolution { width: 1280, height: 720 };
    pub const FULL_HD: Resolution = Resolution { width: 1920, height: 1080 };
    pub const UHD: Resolution = Resolution { width: 3840, height: 2160 };

    pub fn pixels(&self) -> u64 {
        u64::from(self.width) * u64::from(self.height)
    }
}

/// Static hardware description of a node.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NodeCapabilities {
    pub cpu_cores: u32,
    pub gpu_count: u32,
    pub gpu_memory_gb: u32,
    pub ram_gb: u32,
    pub storage_gb: u32,
    pub supported_codecs: Vec<String>,
    pub max_resolution: Resolution,
    pub specializations: Vec<Specialization>,
}

/// Historical performance of a node.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NodePerformance {
    /// Average throughput, in the same units across all nodes.
    pub average_render_speed: f64,
    /// Ratio of successful tasks (0..1).
    pub reliability: f64,
    pub uptime_percent: f64,
    pub completed_tasks: u64,
    pub failed_tasks: u64,
    /// Failures since the last success, drives failover.
    #[serde(default)]
    pub consecutive_failures: u32,
}

impl Default for NodePerformance {
    fn default() -> Self {
        Self {
            average_render_speed: 1.0,
            reliability: 1.0,
            uptime_percent: 100.0,
            completed_tasks: 0,
            failed_tasks: 0,
            consecutive_failures: 0,
        }
    }
}

impl NodePerformance {
    /// Record a successful task and refresh reliability.
    pub fn record_success(&mut self) {
        self.completed_tasks += 1;
        self.consecutive_failures = 0;
        self.refresh_reliability();
    }

    /// Record a failed task and refresh reliability.
    pub fn record_failure(&mut self) {
        self.failed_tasks += 1;
        self.consecutive_failures += 1;
        self.refresh_reliability();
    }

    fn refresh_reliability(&mut self) {
        let total = self.completed_tasks + self.failed_tasks;
        if total > 0 {
            self.reliability = self.completed_tasks as f64 / total as f64;
        }
    }
}

/// Last instantaneous usage sample reported by the metrics source.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct NodeUsage {
    pub cpu_percent: f64,
    pub memory_percent: f64,
    pub gpu_percent: f64,
    pub sampled_at: u64,
}

/// A worker capable of executing render tasks.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Node {
    pub id: NodeId,
    pub name: String,
    /// Region the node runs in, matched against preferred regions.
    pub location: String,
    pub status: NodeStatus,
    pub capabilities: NodeCapabilities,
    pub current_load: u32,
    pub max_load: u32,
    pub performance: NodePerformance,
    #[serde(default)]
    pub usage: NodeUsage,
    /// Unix timestamp (milliseconds) of the last heartbeat.
    pub last_heartbeat: u64,
    /// Tasks currently assigned to this node (advisory, for display).
    #[serde(default)]
    pub task_queue: Vec<TaskId>,
}

impl Node {
    /// Status as derived from the stored status and heartbeat freshness.
    ///
    /// A node whose last heartbeat is older than `heartbeat_timeout_ms`
    /// is offline whatever its stored status says.
    pub fn effective_status(&self, now: u64, heartbeat_timeout_ms: u64) -> NodeStatus {
        if now.saturating_sub(self.last_heartbeat) > heartbeat_timeout_ms {
            NodeStatus::Offline
        } else {
            self.status
        }
    }

    pub fn is_saturated(&self) -> bool {
        self.current_load >= self.max_load
    }

    /// Fraction of capacity in use (0..1). Zero-capacity nodes count as full.
    pub fn load_ratio(&self) -> f64 {
        if self.max_load == 0 {
            1.0
        } else {
            f64::from(self.current_load) / f64::from(self.max_load)
        }
    }

    /// Claim one unit of capacity for a task. Returns false when saturated.
    pub fn acquire(&mut self, task_id: &str) -> bool {
        if self.is_saturated() {
            return false;
        }
        self.current_load += 1;
        self.task_queue.push(task_id.to_string());
        true
    }

    /// Release the unit of capacity held by a task.
    pub fn release(&mut self, task_id: &str) {
        let before = self.task_queue.len();
        self.task_queue.retain(|t| t != task_id);
        if self.task_queue.len() < before {
            self.current_load = self.current_load.saturating_sub(1);
        }
    }
}

// ── Tasks ─────────────────────────────────────────────────────────

/// Kind of rendering work a task performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    VideoRender,
    AudioProcessing,
    SlideRender,
    AvatarAnimation,
    Compositing,
    Encoding,
}

/// Scheduling priority of a task or job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TaskPriority {
    Low,
    #[default]
    Normal,
    High,
    Urgent,
}

impl TaskPriority {
    /// Queue weight: urgent=4 > high=3 > normal=2 > low=1.
    pub fn weight(self) -> u8 {
        match self {
            TaskPriority::Low => 1,
            TaskPriority::Normal => 2,
            TaskPriority::High => 3,
            TaskPriority::Urgent => 4,
        }
    }
}

/// Lifecycle status of a render task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Queued,
    Running,
    Retrying,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Queued => "queued",
            TaskStatus::Running => "running",
            TaskStatus::Retrying => "retrying",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
        }
    }
}

/// Inclusive frame range rendered by a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameRange {
    pub start: u64,
    pub end: u64,
}

impl FrameRange {
    pub fn total_frames(&self) -> u64 {
        if self.end < self.start {
            0
        } else {
            (self.end - self.start).saturating_add(1)
        }
    }
}

/// Quality preset of a render.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RenderQuality {
    Draft,
    #[default]
    Standard,
    High,
    Ultra,
}

/// Output settings handed to the executor.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RenderSettings {
    pub resolution: Resolution,
    pub fps: u32,
    pub codec: String,
    pub bitrate_kbps: u32,
    pub quality: RenderQuality,
    #[serde(default)]
    pub effects: Vec<String>,
}

impl Default for RenderSettings {
    fn default() -> Self {
        Self {
            resolution: Resolution::FULL_HD,
            fps: 30,
            codec: "h264".to_string(),
            bitrate_kbps: 8_000,
            quality: RenderQuality::Standard,
            effects: Vec::new(),
        }
    }
}

/// Hard requirements a node must meet to run a task.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct TaskRequirements {
    pub min_cpu_cores: u32,
    pub min_gpu_memory_gb: u32,
    pub min_ram_gb: u32,
    #[serde(default)]
    pub required_codecs: Vec<String>,
    #[serde(default)]
    pub specializations: Vec<Specialization>,
    pub max_latency_ms: Option<u64>,
    #[serde(default)]
    pub preferred_regions: Vec<String>,
}

impl TaskRequirements {
    /// True when every requirement of `self` is no stricter than `other`.
    pub fn fits_within(&self, other: &TaskRequirements) -> bool {
        self.min_cpu_cores <= other.min_cpu_cores
            && self.min_gpu_memory_gb <= other.min_gpu_memory_gb
            && self.min_ram_gb <= other.min_ram_gb
            && self
                .required_codecs
                .iter()
                .all(|c| other.required_codecs.contains(c))
            && self
                .specializations
                .iter()
                .all(|s| other.specializations.contains(s))
    }
}

/// Artifact produced by a completed task.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskOutput {
    pub uri: String,
    pub size_bytes: u64,
    pub format: String,
}

/// Descriptive metadata carried with a task.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskMetadata {
    #[serde(default)]
    pub source_files: Vec<String>,
    /// Relative complexity multiplier (1.0 = typical slide deck).
    pub complexity: f64,
    pub client_info: Option<String>,
}

impl Default for TaskMetadata {
    fn default() -> Self {
        Self {
            source_files: Vec::new(),
            complexity: 1.0,
            client_info: None,
        }
    }
}

/// One schedulable unit of rendering work.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RenderTask {
    pub id: TaskId,
    pub job_id: JobId,
    pub project_id: ProjectId,
    pub task_type: TaskType,
    pub priority: TaskPriority,
    pub status: TaskStatus,
    pub frame_range: FrameRange,
    pub settings: RenderSettings,
    pub requirements: TaskRequirements,
    /// Restricts placement to one cluster when set.
    #[serde(default)]
    pub target_cluster: Option<ClusterId>,
    pub assigned_node: Option<NodeId>,
    pub assigned_cluster: Option<ClusterId>,
    /// Fraction complete (0..1), reported by the executor.
    pub progress: f64,
    pub created_at: u64,
    pub started_at: Option<u64>,
    pub completed_at: Option<u64>,
    pub estimated_duration_ms: u64,
    pub actual_duration_ms: Option<u64>,
    pub retry_count: u32,
    pub max_retries: u32,
    pub dependencies: Vec<TaskId>,
    pub outputs: Vec<TaskOutput>,
    pub metadata: TaskMetadata,
    pub error: Option<String>,
    /// Actual cost accrued by this task.
    pub cost: f64,
}

impl RenderTask {
    pub fn total_frames(&self) -> u64 {
        self.frame_range.total_frames()
    }
}

// ── Jobs ──────────────────────────────────────────────────────────

/// Lifecycle status of a render job, derived from its tasks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Created,
    Queued,
    Processing,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Created => "created",
            JobStatus::Queued => "queued",
            JobStatus::Processing => "processing",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }
}

/// Cost line items of a job.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct CostBreakdown {
    pub compute: f64,
    pub storage: f64,
    pub bandwidth: f64,
    pub premium: f64,
}

impl CostBreakdown {
    pub fn total(&self) -> f64 {
        self.compute + self.storage + self.bandwidth + self.premium
    }
}

/// Predicted and accrued cost of a job.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct JobCost {
    pub estimated: f64,
    pub actual: f64,
    pub breakdown: CostBreakdown,
}

/// A client-visible unit of work composed of one or more tasks.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RenderJob {
    pub id: JobId,
    pub name: String,
    pub project_id: ProjectId,
    pub status: JobStatus,
    pub task_ids: Vec<TaskId>,
    pub total_frames: u64,
    pub completed_frames: u64,
    pub progress: f64,
    pub estimated_completion: Option<u64>,
    pub cost: JobCost,
    pub priority: TaskPriority,
    pub created_at: u64,
    pub started_at: Option<u64>,
    pub completed_at: Option<u64>,
}

impl RenderJob {
    /// Derive the job status from the statuses of its tasks.
    ///
    /// Cancelled is sticky. A job completes when every task completed and
    /// fails once a task failed terminally and no other task is in flight.
    pub fn derive_status(&self, task_statuses: &[TaskStatus]) -> JobStatus {
        if self.status == JobStatus::Cancelled {
            return JobStatus::Cancelled;
        }
        if task_statuses.is_empty() {
            return self.status;
        }
        if task_statuses.iter().all(|s| *s == TaskStatus::Completed) {
            return JobStatus::Completed;
        }
        let any_failed = task_statuses.iter().any(|s| *s == TaskStatus::Failed);
        let in_flight = task_statuses.iter().any(|s| !s.is_terminal());
        if any_failed && !in_flight {
            return JobStatus::Failed;
        }
        if !in_flight {
            // Only completed and cancelled tasks remain.
            return JobStatus::Cancelled;
        }
        let started = task_statuses.iter().any(|s| {
            matches!(
                s,
                TaskStatus::Running
                    | TaskStatus::Retrying
                    | TaskStatus::Completed
                    | TaskStatus::Failed
            )
        });
        if started {
            JobStatus::Processing
        } else {
            JobStatus::Queued
        }
    }
}
