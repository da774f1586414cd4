//! Orchestration-API discovery backend

mod client;
mod discovery;

pub use client::{select_candidates, OrchestrationClient};
pub use discovery::OrchestrationDiscovery;
