//! Metrics module
//!
//! Prometheus counters for discovery rounds, registry and probe failures.

mod prometheus;

pub use self::prometheus::*;
