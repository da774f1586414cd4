//! Data models for cluster discovery
//!
//! Presence records exchanged between nodes, the orchestration pod model and
//! the error type shared by every component.

mod error;
mod pod;
mod presence;

pub use error::*;
pub use pod::*;
pub use presence::*;
