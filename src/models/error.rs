//! Error types for cluster discovery

use thiserror::Error;

/// Discovery errors
#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error("Coordination service unreachable: {0}")]
    Connection(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Failed to read {path}: {reason}")]
    TransientRead { path: String, reason: String },

    #[error("Failed to write {path}: {reason}")]
    TransientWrite { path: String, reason: String },

    #[error("Probe of {endpoint} failed: {reason}")]
    Probe { endpoint: String, reason: String },

    #[error("Interrupted: {0}")]
    Interrupted(String),

    #[error("Malformed presence record: {0}")]
    Malformed(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl DiscoveryError {
    pub fn transient_read(path: impl Into<String>, reason: impl ToString) -> Self {
        DiscoveryError::TransientRead {
            path: path.into(),
            reason: reason.to_string(),
        }
    }

    pub fn transient_write(path: impl Into<String>, reason: impl ToString) -> Self {
        DiscoveryError::TransientWrite {
            path: path.into(),
            reason: reason.to_string(),
        }
    }

    pub fn probe(endpoint: impl Into<String>, reason: impl ToString) -> Self {
        DiscoveryError::Probe {
            endpoint: endpoint.into(),
            reason: reason.to_string(),
        }
    }

    /// Whether this error must abort node startup
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            DiscoveryError::Connection(_) | DiscoveryError::Configuration(_)
        )
    }

    /// Whether another attempt of the same call could succeed
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            DiscoveryError::Connection(_)
                | DiscoveryError::Network(_)
                | DiscoveryError::TransientRead { .. }
                | DiscoveryError::TransientWrite { .. }
                | DiscoveryError::Probe { .. }
        )
    }
}

impl From<std::io::Error> for DiscoveryError {
    fn from(err: std::io::Error) -> Self {
        DiscoveryError::Internal(err.to_string())
    }
}

impl From<serde_json::Error> for DiscoveryError {
    fn from(err: serde_json::Error) -> Self {
        DiscoveryError::Serialization(err.to_string())
    }
}

impl From<reqwest::Error> for DiscoveryError {
    fn from(err: reqwest::Error) -> Self {
        DiscoveryError::Network(err.to_string())
    }
}

impl From<config::ConfigError> for DiscoveryError {
    fn from(err: config::ConfigError) -> Self {
        DiscoveryError::Configuration(err.to_string())
    }
}

/// Result type for discovery operations
pub type DiscoveryResult<T> = Result<T, DiscoveryError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatal_classification() {
        assert!(DiscoveryError::Connection("down".into()).is_fatal());
        assert!(DiscoveryError::Configuration("missing".into()).is_fatal());
        assert!(!DiscoveryError::probe("10.0.0.1:8888", "refused").is_fatal());
        assert!(!DiscoveryError::transient_read("/a/b", "gone").is_fatal());
    }
}
