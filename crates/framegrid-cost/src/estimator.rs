//! Cost estimation for render jobs.

use serde::{Deserialize, Serialize};
use tracing::debug;

use framegrid_state::{JobCost, RenderTask, TaskPriority};

const MS_PER_HOUR: f64 = 3_600_000.0;
const BYTES_PER_GB: f64 = 1_073_741_824.0;

/// Unit prices used by the estimator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CostRates {
    pub compute_per_hour: f64,
    pub storage_per_gb: f64,
    pub bandwidth_per_gb: f64,
    /// Multiplier applied to urgent compute. 1.5 adds a 50% premium;
    /// values below 1 add nothing.
    pub urgent_premium_multiplier: f64,
}

impl Default for CostRates {
    fn default() -> Self {
        Self {
            compute_per_hour: 2.50,
            storage_per_gb: 0.023,
            bandwidth_per_gb: 0.09,
            urgent_premium_multiplier: 1.5,
        }
    }
}

/// Computes job estimates and accrues actual cost as tasks complete.
#[derive(Debug, Clone, Default)]
pub struct CostEstimator {
    rates: CostRates,
}

impl CostEstimator {
    pub fn new(rates: CostRates) -> Self {
        Self { rates }
    }

    pub fn rates(&self) -> &CostRates {
        &self.rates
    }

    /// Compute cost of `duration_ms` of render time.
    pub fn task_cost(&self, duration_ms: u64) -> f64 {
        duration_ms as f64 / MS_PER_HOUR * self.rates.compute_per_hour
    }

    fn premium(&self, compute: f64, priority: TaskPriority) -> f64 {
        if priority == TaskPriority::Urgent {
            compute * (self.rates.urgent_premium_multiplier.max(1.0) - 1.0)
        } else {
            0.0
        }
    }

    /// Estimate the cost of a job from its tasks' estimated durations.
    ///
    /// Storage and bandwidth are unknown before rendering and only appear
    /// in the accrued cost.
    pub fn estimate_job(&self, tasks: &[RenderTask], priority: TaskPriority) -> JobCost {
        let compute: f64 = tasks
            .iter()
            .map(|t| self.task_cost(t.estimated_duration_ms))
            .sum();
        let premium = self.premium(compute, priority);

        let cost = JobCost {
            estimated: compute + premium,
            ..JobCost::default()
        };
        debug!(
            tasks = tasks.len(),
            ?priority,
            estimated = cost.estimated,
            "job cost estimated"
        );
        cost
    }

    /// Accrue the cost of one completed task into `cost`.
    ///
    /// Returns the amount accrued for the task.
    pub fn record_completion(
        &self,
        cost: &mut JobCost,
        priority: TaskPriority,
        actual_duration_ms: u64,
        storage_bytes: u64,
        bandwidth_bytes: u64,
    ) -> f64 {
        let compute = self.task_cost(actual_duration_ms);
        let premium = self.premium(compute, priority);
        let storage = storage_bytes as f64 / BYTES_PER_GB * self.rates.storage_per_gb;
        let bandwidth = bandwidth_bytes as f64 / BYTES_PER_GB * self.rates.bandwidth_per_gb;

        let breakdown = &mut cost.breakdown;
        breakdown.compute += compute;
        breakdown.premium += premium;
        breakdown.storage += storage;
        breakdown.bandwidth += bandwidth;
        cost.actual = breakdown.total();

        compute + premium + storage + bandwidth
    }
}
