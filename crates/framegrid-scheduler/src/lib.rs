//! framegrid-scheduler: render task queue, placement and retries.
//!
//! Turns submitted jobs into render tasks and places them onto the nodes
//! of the fleet. The scheduler:
//!
//! - Decomposes jobs into frame chunks (plus an encoding task for videos)
//! - Keeps a priority queue ordered by priority, then submission time
//! - Places queued tasks on eligible, best-scored nodes each tick
//! - Applies per-cluster load-balancing algorithms
//! - Retries failed tasks within their budget and fails nodes over
//! - Tracks job progress, status and cost
//! - Broadcasts lifecycle events
//!
//! # Architecture
//!
//! ```text
//! Scheduler
//!   ├── StateStore (write-through of clusters, jobs, tasks)
//!   ├── RenderExecutor (assign / stop on render nodes)
//!   ├── EventBus (broadcast of SchedulerEvent)
//!   └── Mutex<core>
//!       ├── ClusterRegistry (nodes, liveness, eligibility, scoring)
//!       ├── TaskQueue (priority ↓, created_at ↑)
//!       ├── LoadBalancer (per-cluster algorithm state)
//!       └── tasks / jobs
//! ```

pub mod decompose;
pub mod error;
pub mod events;
pub mod executor;
pub mod load_balancer;
pub mod queue;
pub mod retry;
pub mod scheduler;

pub use decompose::{Decomposer, JobRequest, MAX_FRAMES, MAX_TASKS_PER_JOB, TaskRequest};
pub use error::{SchedulerError, SchedulerResult};
pub use events::{EventBus, SchedulerEvent};
pub use executor::{NoopExecutor, RenderExecutor, TaskOutcome, TaskReport};
pub use load_balancer::LoadBalancer;
pub use queue::TaskQueue;
pub use retry::{RetryCoordinator, RetryDecision};
pub use scheduler::{HEARTBEAT_TIMEOUT_REASON, Scheduler, SchedulerConfig, TickReport};
