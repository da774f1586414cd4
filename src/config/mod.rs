//! Configuration module for cluster discovery
//!
//! Supports loading configuration from TOML files and environment variables,
//! with named environment-variable fallbacks resolved once at load time.

mod settings;

pub use settings::*;
