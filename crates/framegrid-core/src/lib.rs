pub mod config;

pub use config::{FleetConfig, parse_duration};
