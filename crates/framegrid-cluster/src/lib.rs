//! framegrid-cluster: the registry of render clusters and their nodes.
//!
//! The registry is a plain in-memory container. It is owned by the
//! scheduler, which serializes access to it and writes changes through to
//! the state store.
//!
//! ```text
//! ClusterRegistry
//!   ├── clusters (ordered by id)
//!   │   └── nodes (registration order)
//!   ├── node index: node id → cluster id
//!   └── liveness: heartbeat timeout = health check interval × missed heartbeats
//! ```

pub mod registry;

pub use registry::{ClusterRegistry, DEFAULT_MISSED_HEARTBEATS, RegistryError, RegistryResult};
