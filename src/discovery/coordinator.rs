//! Discovery rounds on behalf of the membership layer

use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::DiscoveryBackend;
use crate::metrics;
use crate::models::{DiscoveryResult, PhysicalAddress, PresenceRecord};

/// Drives discovery rounds against one backend
#[derive(Clone)]
pub struct DiscoveryCoordinator {
    backend: Arc<dyn DiscoveryBackend>,
}

impl DiscoveryCoordinator {
    pub fn new(backend: Arc<dyn DiscoveryBackend>) -> Self {
        Self { backend }
    }

    pub fn backend(&self) -> &Arc<dyn DiscoveryBackend> {
        &self.backend
    }

    /// Make this node discoverable; startup errors propagate
    pub async fn start(&self, cluster_name: &str) -> DiscoveryResult<()> {
        self.backend.start(cluster_name).await?;
        info!(cluster = cluster_name, backend = self.backend.name(), "Discovery started");
        Ok(())
    }

    /// Distinct physical addresses of the members found this round
    ///
    /// Never fails: a failed round is logged and yields an empty set.
    pub async fn fetch_cluster_members(&self, cluster_name: &str) -> BTreeSet<PhysicalAddress> {
        let members = match self.backend.fetch_cluster_members(cluster_name).await {
            Ok(records) => collect_addresses(&records),
            Err(e) => {
                warn!(cluster = cluster_name, backend = self.backend.name(), error = %e, "Discovery round failed");
                BTreeSet::new()
            }
        };

        metrics::record_discovery_round(members.len());
        debug!(cluster = cluster_name, members = members.len(), "Discovery round finished");
        members
    }

    /// Stop the backend; errors are logged
    pub async fn stop(&self) {
        if let Err(e) = self.backend.stop().await {
            warn!(backend = self.backend.name(), error = %e, "Failed to stop discovery");
        }
    }
}

impl std::fmt::Debug for DiscoveryCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DiscoveryCoordinator")
            .field("backend", &self.backend.name())
            .finish()
    }
}

fn collect_addresses(records: &[PresenceRecord]) -> BTreeSet<PhysicalAddress> {
    records
        .iter()
        .flat_map(|record| record.addresses.iter().cloned())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::DiscoveryError;
    use crate::presence::LocalPresence;
    use crate::registry::{MemoryEnsemble, PeerRegistry};
    use crate::config::RegistrySettings;
    use async_trait::async_trait;
    use parking_lot::Mutex;

    /// Backend returning canned rounds
    struct ScriptedBackend {
        rounds: Mutex<Vec<DiscoveryResult<Vec<PresenceRecord>>>>,
        stopped: Mutex<bool>,
    }

    impl ScriptedBackend {
        fn new(rounds: Vec<DiscoveryResult<Vec<PresenceRecord>>>) -> Arc<Self> {
            Arc::new(Self {
                rounds: Mutex::new(rounds),
                stopped: Mutex::new(false),
            })
        }
    }

    #[async_trait]
    impl DiscoveryBackend for ScriptedBackend {
        fn name(&self) -> &'static str {
            "scripted"
        }

        async fn start(&self, _cluster_name: &str) -> DiscoveryResult<()> {
            Ok(())
        }

        async fn fetch_cluster_members(&self, _cluster_name: &str) -> DiscoveryResult<Vec<PresenceRecord>> {
            self.rounds.lock().remove(0)
        }

        async fn stop(&self) -> DiscoveryResult<()> {
            *self.stopped.lock() = true;
            Err(DiscoveryError::Internal("already gone".to_string()))
        }
    }

    fn record(node_id: &str, addresses: &[(&str, u16)]) -> PresenceRecord {
        addresses
            .iter()
            .fold(PresenceRecord::new(node_id, node_id), |r, (host, port)| {
                r.with_address(PhysicalAddress::new(*host, *port))
            })
    }

    #[tokio::test]
    async fn test_addresses_are_deduplicated() {
        let backend = ScriptedBackend::new(vec![Ok(vec![
            record("a", &[("10.0.0.1", 7800), ("10.0.0.2", 7800)]),
            record("a-again", &[("10.0.0.1", 7800)]),
            record("b", &[("10.0.0.3", 7800)]),
        ])]);
        let coordinator = DiscoveryCoordinator::new(backend);

        let members = coordinator.fetch_cluster_members("c").await;
        assert_eq!(members.len(), 3);
        assert!(members.contains(&PhysicalAddress::new("10.0.0.3", 7800)));
    }

    #[tokio::test]
    async fn test_failed_round_is_empty_and_stop_swallows_errors() {
        let backend = ScriptedBackend::new(vec![Err(DiscoveryError::Network("down".to_string()))]);
        let coordinator = DiscoveryCoordinator::new(backend.clone());

        assert!(coordinator.fetch_cluster_members("c").await.is_empty());

        coordinator.stop().await;
        assert!(*backend.stopped.lock());
    }

    #[tokio::test]
    async fn test_registry_round_sees_self() {
        let ensemble = MemoryEnsemble::new();
        let presence = LocalPresence::new(record("a", &[("10.0.0.1", 7800)]));
        let registry = PeerRegistry::with_store(
            Arc::new(ensemble.connect()),
            &RegistrySettings::default(),
            presence,
        );
        let coordinator = DiscoveryCoordinator::new(Arc::new(registry));

        coordinator.start("c").await.unwrap();
        let members = coordinator.fetch_cluster_members("c").await;
        assert_eq!(members.into_iter().collect::<Vec<_>>(), vec![PhysicalAddress::new("10.0.0.1", 7800)]);

        coordinator.stop().await;
        assert_eq!(ensemble.open_sessions(), 0);
    }
}
