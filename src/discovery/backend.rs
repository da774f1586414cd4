//! Discovery backend seam and factory

use async_trait::async_trait;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::config::{BackendKind, Settings};
use crate::models::{DiscoveryResult, PresenceRecord};
use crate::orchestration::OrchestrationDiscovery;
use crate::presence::LocalPresence;
use crate::registry::PeerRegistry;

/// A way of finding the other members of a cluster
#[async_trait]
pub trait DiscoveryBackend: Send + Sync {
    /// Short name for logs
    fn name(&self) -> &'static str;

    /// Make this node discoverable in `cluster_name`
    async fn start(&self, cluster_name: &str) -> DiscoveryResult<()>;

    /// One discovery round: presence records of the reachable members
    async fn fetch_cluster_members(&self, cluster_name: &str) -> DiscoveryResult<Vec<PresenceRecord>>;

    /// Stop being discoverable and release resources
    async fn stop(&self) -> DiscoveryResult<()>;
}

/// Build the backend selected by `discovery.backend`
///
/// The registry backend connects here, so a coordination service that stays
/// unreachable fails node startup.
pub async fn create_backend(
    settings: &Settings,
    presence: LocalPresence,
    cancel: &CancellationToken,
) -> DiscoveryResult<Arc<dyn DiscoveryBackend>> {
    settings.validate()?;

    let backend: Arc<dyn DiscoveryBackend> = match settings.discovery.backend {
        BackendKind::Registry => {
            let registry = PeerRegistry::connect(&settings.registry, presence, cancel).await?;
            Arc::new(registry)
        }
        BackendKind::Orchestration => {
            let discovery = OrchestrationDiscovery::new(
                &settings.orchestration,
                settings.presence.clone(),
                presence,
                cancel.child_token(),
            )?;
            Arc::new(discovery)
        }
    };

    info!(backend = backend.name(), "Discovery backend created");
    Ok(backend)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::DiscoveryError;

    fn presence() -> LocalPresence {
        LocalPresence::new(PresenceRecord::new("n1", "one"))
    }

    #[tokio::test]
    async fn test_orchestration_backend_selected() {
        let mut settings = Settings::default();
        settings.discovery.backend = BackendKind::Orchestration;
        settings.orchestration.host = Some("master".to_string());
        settings.orchestration.port = Some(8080);

        let backend = create_backend(&settings, presence(), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(backend.name(), "orchestration");
    }

    #[tokio::test]
    async fn test_invalid_settings_rejected_before_connecting() {
        let mut settings = Settings::default();
        settings.discovery.backend = BackendKind::Registry;
        settings.registry.connection = None;

        let err = create_backend(&settings, presence(), &CancellationToken::new())
            .await
            .err()
            .unwrap();
        assert!(matches!(err, DiscoveryError::Configuration(_)));
        assert!(err.is_fatal());
    }
}
