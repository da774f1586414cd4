//! Coordination-service registry backend

mod etcd;
mod memory;
mod peer_registry;
mod store;

pub use etcd::EtcdStore;
pub use memory::{MemoryEnsemble, MemoryStore};
pub use peer_registry::{ClusterPath, PeerRegistry};
pub use store::{immediate_children, make_path, CoordinationStore};
