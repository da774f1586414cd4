//! Admin HTTP API: health probes and metrics

mod health;

pub use health::*;
