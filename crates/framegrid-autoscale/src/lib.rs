//! framegrid-autoscale: load-driven scaling signals for render clusters.
//!
//! Reads clusters from the state store, computes each cluster's system
//! load and emits scale-up / scale-down intents. Provisioning is done by
//! an external fleet manager behind a callback.
//!
//! # Signal rules
//!
//! ```text
//! system_load = Σ current_load / Σ max_load      (0 when Σ max_load = 0)
//!
//! if load >= scale_up_threshold and nodes < max_nodes:
//!     ScaleUp(nodes + 1)
//!
//! if load <= scale_down_threshold and nodes > min_nodes:
//!     ScaleDown(nodes - 1)
//! ```
//!
//! One cooldown per cluster (`cooldown_secs`) separates any two signals.

pub mod scaler;

pub use scaler::{Autoscaler, ScaleCallback, ScaleDecision, ScaleDirection, ScaleIntent, system_load};
