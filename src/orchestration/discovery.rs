//! Discovery through the orchestration API

use async_trait::async_trait;
use futures::future::join_all;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::OrchestrationClient;
use crate::config::{OrchestrationSettings, PresenceSettings};
use crate::discovery::DiscoveryBackend;
use crate::metrics;
use crate::models::{DiscoveryResult, PresenceRecord};
use crate::presence::{LocalPresence, PresenceServer};

/// Finds peers by listing pods and probing each candidate's presence server
#[derive(Debug)]
pub struct OrchestrationDiscovery {
    client: OrchestrationClient,
    server: PresenceServer,
    cancel: CancellationToken,
}

impl OrchestrationDiscovery {
    pub fn new(
        settings: &OrchestrationSettings,
        presence_settings: PresenceSettings,
        presence: LocalPresence,
        cancel: CancellationToken,
    ) -> DiscoveryResult<Self> {
        let client = OrchestrationClient::new(settings)?;
        Ok(Self {
            client,
            server: PresenceServer::new(presence_settings, presence),
            cancel,
        })
    }

    pub fn client(&self) -> &OrchestrationClient {
        &self.client
    }

    pub fn server(&self) -> &PresenceServer {
        &self.server
    }

    /// One discovery round: list candidates, then probe them concurrently
    ///
    /// A candidate that cannot be probed is dropped; only a failed listing
    /// fails the round.
    pub async fn discover(&self) -> DiscoveryResult<Vec<PresenceRecord>> {
        let candidates = self.client.list_candidates(&self.cancel).await?;
        if candidates.is_empty() {
            debug!(api = %self.client.info(), "No probe candidates found");
            return Ok(Vec::new());
        }

        let probes: Vec<_> = candidates
            .iter()
            .map(|endpoint| self.client.fetch_snapshot(endpoint, &self.cancel))
            .collect();

        let results = join_all(probes).await;

        let mut records = Vec::with_capacity(results.len());
        for (endpoint, result) in candidates.iter().zip(results) {
            match result {
                Ok(record) => records.push(record),
                Err(e) => {
                    metrics::record_probe_failure();
                    warn!(endpoint = %endpoint, container = %endpoint.container, error = %e, "Peer unreachable, skipping");
                }
            }
        }

        debug!(candidates = candidates.len(), reachable = records.len(), "Probe round finished");
        Ok(records)
    }
}

#[async_trait]
impl DiscoveryBackend for OrchestrationDiscovery {
    fn name(&self) -> &'static str {
        "orchestration"
    }

    async fn start(&self, cluster_name: &str) -> DiscoveryResult<()> {
        self.server.start()?;
        info!(cluster = cluster_name, api = %self.client.info(), "Orchestration discovery started");
        Ok(())
    }

    async fn fetch_cluster_members(&self, _cluster_name: &str) -> DiscoveryResult<Vec<PresenceRecord>> {
        self.discover().await
    }

    async fn stop(&self) -> DiscoveryResult<()> {
        self.cancel.cancel();
        self.server.stop().await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::PhysicalAddress;
    use httpmock::prelude::*;
    use serde_json::json;

    fn orchestration_settings(api: &MockServer) -> OrchestrationSettings {
        OrchestrationSettings {
            host: Some(api.host()),
            port: Some(api.port()),
            list_attempts: 2,
            list_interval_ms: 10,
            probe_attempts: 2,
            probe_interval_ms: 10,
            ..Default::default()
        }
    }

    fn local_presence_settings() -> PresenceSettings {
        PresenceSettings {
            bind_host: "127.0.0.1".to_string(),
            port: 0,
            workers: 1,
        }
    }

    fn presence(node_id: &str, port: u16) -> LocalPresence {
        LocalPresence::new(
            PresenceRecord::new(node_id, node_id).with_address(PhysicalAddress::new("127.0.0.1", port)),
        )
    }

    fn pod_item(ip: &str, port_name: &str, port: u16) -> serde_json::Value {
        json!({
            "currentState": {"host": "minion-1", "podIP": ip},
            "desiredState": {"manifest": {"containers": [
                {"name": "app", "ports": [{"name": port_name, "containerPort": port}]}
            ]}}
        })
    }

    /// Port on which nothing is listening
    fn closed_port() -> u16 {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    }

    #[actix_rt::test]
    async fn test_zero_match_poll_returns_empty() {
        let api = MockServer::start_async().await;
        api.mock_async(|when, then| {
            when.method(GET).path("/api/v1beta1/pods");
            then.status(200).json_body(json!({"items": []}));
        })
        .await;

        let discovery = OrchestrationDiscovery::new(
            &orchestration_settings(&api),
            local_presence_settings(),
            presence("self", 7800),
            CancellationToken::new(),
        )
        .unwrap();

        assert!(discovery.fetch_cluster_members("c").await.unwrap().is_empty());
    }

    #[actix_rt::test]
    async fn test_probe_isolation() {
        // A live peer answering probes
        let peer = PresenceServer::new(local_presence_settings(), presence("peer", 7801));
        peer.start().unwrap();
        let peer_port = peer.local_addr().unwrap().port();
        let dead_port = closed_port();

        let api = MockServer::start_async().await;
        api.mock_async(|when, then| {
            when.method(GET).path("/api/v1beta1/pods");
            then.status(200).json_body(json!({"items": [
                pod_item("127.0.0.1", "ping", peer_port),
                pod_item("127.0.0.1", "PING", dead_port),
                pod_item("127.0.0.1", "http", peer_port),
            ]}));
        })
        .await;

        let discovery = OrchestrationDiscovery::new(
            &orchestration_settings(&api),
            local_presence_settings(),
            presence("self", 7800),
            CancellationToken::new(),
        )
        .unwrap();

        let records = discovery.fetch_cluster_members("c").await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].node_id, "peer");

        peer.stop().await;
    }

    #[actix_rt::test]
    async fn test_two_nodes_find_each_other() {
        let api = MockServer::start_async().await;

        let a = OrchestrationDiscovery::new(
            &orchestration_settings(&api),
            local_presence_settings(),
            presence("a", 7800),
            CancellationToken::new(),
        )
        .unwrap();
        let b = OrchestrationDiscovery::new(
            &orchestration_settings(&api),
            local_presence_settings(),
            presence("b", 7801),
            CancellationToken::new(),
        )
        .unwrap();
        a.start("c").await.unwrap();
        b.start("c").await.unwrap();

        let a_port = a.server().local_addr().unwrap().port();
        let b_port = b.server().local_addr().unwrap().port();
        api.mock_async(|when, then| {
            when.method(GET).path("/api/v1beta1/pods");
            then.status(200).json_body(json!({"items": [
                pod_item("127.0.0.1", "ping", a_port),
                pod_item("127.0.0.1", "ping", b_port),
            ]}));
        })
        .await;

        let mut ids: Vec<String> = a
            .fetch_cluster_members("c")
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.node_id)
            .collect();
        ids.sort();
        assert_eq!(ids, vec!["a", "b"]);

        b.stop().await.unwrap();
        let after_stop = a.fetch_cluster_members("c").await.unwrap();
        assert_eq!(after_stop.len(), 1);
        assert_eq!(after_stop[0].node_id, "a");

        a.stop().await.unwrap();
    }

    #[actix_rt::test]
    async fn test_listing_failure_fails_the_round() {
        let api = MockServer::start_async().await;
        api.mock_async(|when, then| {
            when.method(GET).path("/api/v1beta1/pods");
            then.status(500);
        })
        .await;

        let discovery = OrchestrationDiscovery::new(
            &orchestration_settings(&api),
            local_presence_settings(),
            presence("self", 7800),
            CancellationToken::new(),
        )
        .unwrap();

        assert!(discovery.fetch_cluster_members("c").await.is_err());
    }
}
