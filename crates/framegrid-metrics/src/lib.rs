//! framegrid-metrics: observability for the render fleet.
//!
//! Polls per-node usage from a pluggable metrics source, raises alerts
//! against each cluster's thresholds, and renders the persisted fleet in
//! the Prometheus text exposition format.
//!
//! # Architecture
//!
//! ```text
//! MetricsCollector
//!   ├── MetricsSource (cpu / memory / gpu usage per node)
//!   ├── collect() → NodeUsage samples for every persisted node
//!   ├── evaluate_alerts() → threshold breaches per cluster
//!   └── run() → periodic sampling loop, samples handed to a callback
//!
//! Prometheus exposition
//!   └── render_prometheus() → text/plain for scraping
//! ```

pub mod collector;
pub mod prometheus;

pub use collector::{
    Alert, AlertResource, InMemoryMetricsSource, MetricsCollector, MetricsSource, UsageCallback,
};
pub use prometheus::render_prometheus;
