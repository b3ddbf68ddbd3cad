//! framegrid placement: decides which nodes may run a render task and
//! how good each of them is.
//!
//! This crate is pure: it reads node and requirement snapshots and never
//! mutates load or task state (that's `framegrid-scheduler`).
//!
//! # Components
//!
//! - **`matcher`**: Structural eligibility (liveness, capacity, hardware,
//!   codecs, specializations). All rules must hold; no partial credit.
//! - **`scorer`**: Weighted blend of headroom, throughput and reliability,
//!   with deterministic ranking.

pub mod matcher;
pub mod scorer;

pub use matcher::{Ineligibility, check_eligibility, is_eligible};
pub use scorer::{NodeScore, ScoreBreakdown, ScoringWeights, compare_scores, rank_nodes, score_node};
