//! Cluster Discovery - membership discovery for clustered nodes
//!
//! Finds the other members of a cluster so the membership layer can contact
//! them. Two backends:
//! - a coordination-service registry of ephemeral per-node presence records
//! - an orchestration-API poller that probes each candidate container
//!
//! plus the presence server answering those probes.

pub mod config;
pub mod models;
pub mod retry;
pub mod registry;
pub mod orchestration;
pub mod presence;
pub mod discovery;
pub mod api;
pub mod metrics;

// Re-export commonly used types
pub use config::Settings;
pub use models::{DiscoveryError, DiscoveryResult, Endpoint, PhysicalAddress, PresenceRecord, ViewId};
pub use registry::{CoordinationStore, EtcdStore, MemoryEnsemble, PeerRegistry};
pub use orchestration::{OrchestrationClient, OrchestrationDiscovery};
pub use presence::{LocalPresence, PresenceServer};
pub use discovery::{create_backend, DiscoveryBackend, DiscoveryCoordinator};

/// Version of cluster-discovery
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
