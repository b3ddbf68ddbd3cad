//! Scheduler error types.

use thiserror::Error;

use framegrid_cluster::RegistryError;
use framegrid_state::{StateError, TaskId};

/// Errors that can occur during scheduling operations.
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("cluster not found: {0}")]
    ClusterNotFound(String),

    #[error("node not found: {0}")]
    NodeNotFound(String),

    #[error("task not found: {0}")]
    TaskNotFound(String),

    #[error("job not found: {0}")]
    JobNotFound(String),

    #[error("no eligible node for task {0}")]
    NoEligibleNode(TaskId),

    #[error("task {task_id} exhausted its retry budget after {attempts} attempts")]
    RetryBudgetExceeded { task_id: TaskId, attempts: u32 },

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("initialization failed: {0}")]
    Initialization(String),

    #[error("executor error: {0}")]
    Executor(anyhow::Error),

    #[error("state store error: {0}")]
    State(#[from] StateError),
}

impl From<RegistryError> for SchedulerError {
    fn from(err: RegistryError) -> Self {
        match err {
            RegistryError::ClusterNotFound(id) => SchedulerError::ClusterNotFound(id),
            RegistryError::NodeNotFound(id) => SchedulerError::NodeNotFound(id),
            other @ RegistryError::NodeAlreadyRegistered { .. } => {
                SchedulerError::InvalidRequest(other.to_string())
            }
        }
    }
}

pub type SchedulerResult<T> = Result<T, SchedulerError>;
