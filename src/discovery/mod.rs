//! Cluster membership discovery
//!
//! A [`DiscoveryBackend`] finds the presence records of the other members of
//! a cluster; the [`DiscoveryCoordinator`] turns a round into a set of
//! addresses for the membership layer.

mod backend;
mod coordinator;

pub use backend::{create_backend, DiscoveryBackend};
pub use coordinator::DiscoveryCoordinator;
