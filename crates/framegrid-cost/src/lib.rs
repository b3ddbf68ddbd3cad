//! framegrid-cost: predicted and accrued cost of render jobs.
//!
//! Costs are plain numbers in whatever unit the configured rates use.
//! Compute is billed per hour of render time; storage and bandwidth per
//! gigabyte; urgent work carries a premium on top of compute.

pub mod estimator;

pub use estimator::{CostEstimator, CostRates};
