//! This node's presence: the published snapshot and the probe server

mod local;
mod server;

pub use local::LocalPresence;
pub use server::PresenceServer;
