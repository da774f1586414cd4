//! Orchestration control-plane client and peer prober

use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::config::OrchestrationSettings;
use crate::models::{DiscoveryError, DiscoveryResult, Endpoint, Pod, PodListResponse, PresenceRecord};
use crate::retry::RetryPolicy;

const CONTROL_PLANE_TIMEOUT: Duration = Duration::from_secs(30);
const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Client for the pod listing API and for probing candidate peers
pub struct OrchestrationClient {
    root_url: String,
    labels: Option<String>,
    probe_port_name: String,
    list_policy: RetryPolicy,
    probe_policy: RetryPolicy,
    http_client: reqwest::Client,
    probe_client: reqwest::Client,
}

impl OrchestrationClient {
    /// Build a client from settings
    ///
    /// With a client certificate configured the control plane is reached over
    /// https with mutual TLS; peers are always probed over plain http.
    pub fn new(settings: &OrchestrationSettings) -> DiscoveryResult<Self> {
        let host = settings.host.as_deref().ok_or_else(|| {
            DiscoveryError::Configuration("Orchestration API host is not configured".to_string())
        })?;
        let port = settings.port.ok_or_else(|| {
            DiscoveryError::Configuration("Orchestration API port is not configured".to_string())
        })?;

        let scheme = if settings.uses_tls() { "https" } else { "http" };
        let root_url = format!("{}://{}:{}/api/{}", scheme, host, port, settings.api_version);

        let mut builder = reqwest::Client::builder().timeout(CONTROL_PLANE_TIMEOUT);
        if let Some(cert_file) = settings.cert_file.as_deref() {
            let key_file = settings.key_file.as_deref().ok_or_else(|| {
                DiscoveryError::Configuration("Client certificate configured without a key file".to_string())
            })?;

            let mut pem = read_pem(cert_file)?;
            pem.push(b'\n');
            pem.extend(read_pem(key_file)?);
            let identity = reqwest::Identity::from_pem(&pem).map_err(|e| {
                DiscoveryError::Configuration(format!("Invalid client identity: {}", e))
            })?;
            builder = builder.identity(identity);

            if let Some(ca_file) = settings.ca_file.as_deref() {
                let ca = reqwest::Certificate::from_pem(&read_pem(ca_file)?).map_err(|e| {
                    DiscoveryError::Configuration(format!("Invalid CA certificate {}: {}", ca_file, e))
                })?;
                builder = builder.add_root_certificate(ca);
            }
        }

        let http_client = builder
            .build()
            .map_err(|e| DiscoveryError::Configuration(format!("Failed to create HTTP client: {}", e)))?;

        let probe_client = reqwest::Client::builder()
            .timeout(PROBE_TIMEOUT)
            .build()
            .map_err(|e| DiscoveryError::Configuration(format!("Failed to create probe client: {}", e)))?;

        Ok(Self {
            root_url,
            labels: settings.labels.clone(),
            probe_port_name: settings.probe_port_name.clone(),
            list_policy: RetryPolicy::new(settings.list_attempts, settings.list_interval()),
            probe_policy: RetryPolicy::new(settings.probe_attempts, settings.probe_interval()),
            http_client,
            probe_client,
        })
    }

    pub fn root_url(&self) -> &str {
        &self.root_url
    }

    pub fn labels(&self) -> Option<&str> {
        self.labels.as_deref()
    }

    /// Short description for logs
    pub fn info(&self) -> String {
        format!(
            "{} (labels: {}, probe port: {})",
            self.root_url,
            self.labels.as_deref().unwrap_or("<none>"),
            self.probe_port_name
        )
    }

    fn pods_url(&self, labels: Option<&str>) -> String {
        match labels {
            Some(selector) if !selector.is_empty() => format!(
                "{}/pods?labels={}",
                self.root_url,
                urlencoding::encode(selector)
            ),
            _ => format!("{}/pods", self.root_url),
        }
    }

    /// List pods matching the label selector
    pub async fn list_pods(&self, labels: Option<&str>, cancel: &CancellationToken) -> DiscoveryResult<Vec<Pod>> {
        let url = self.pods_url(labels);

        let response: PodListResponse = self
            .list_policy
            .run("list pods", cancel, || self.get_pod_list(&url))
            .await?;

        let pods = response.into_pods();
        debug!(url = %url, count = pods.len(), "Listed pods");
        Ok(pods)
    }

    async fn get_pod_list(&self, url: &str) -> DiscoveryResult<PodListResponse> {
        let response = self
            .http_client
            .get(url)
            .send()
            .await
            .map_err(|e| DiscoveryError::Network(e.to_string()))?;

        if !response.status().is_success() {
            return Err(DiscoveryError::Network(format!(
                "Pod listing failed: {}",
                response.status()
            )));
        }

        response
            .json()
            .await
            .map_err(|e| DiscoveryError::Network(format!("Invalid pod listing: {}", e)))
    }

    /// Endpoints of every container exposing the probe port
    pub async fn list_candidates(&self, cancel: &CancellationToken) -> DiscoveryResult<Vec<Endpoint>> {
        let pods = self.list_pods(self.labels.as_deref(), cancel).await?;
        Ok(select_candidates(pods, &self.probe_port_name))
    }

    /// Probe one candidate for its presence record
    pub async fn fetch_snapshot(&self, endpoint: &Endpoint, cancel: &CancellationToken) -> DiscoveryResult<PresenceRecord> {
        let url = endpoint.probe_url();
        let what = format!("probe {}", endpoint);

        let record = self
            .probe_policy
            .run(&what, cancel, || self.probe_once(endpoint, &url))
            .await
            .map_err(|e| match e {
                DiscoveryError::Interrupted(_) | DiscoveryError::Malformed(_) => e,
                other => DiscoveryError::probe(endpoint.to_string(), other),
            })?;

        debug!(endpoint = %endpoint, node_id = %record.node_id, "Probe succeeded");
        Ok(record)
    }

    async fn probe_once(&self, endpoint: &Endpoint, url: &str) -> DiscoveryResult<PresenceRecord> {
        let response = self
            .probe_client
            .get(url)
            .send()
            .await
            .map_err(|e| DiscoveryError::probe(endpoint.to_string(), e))?;

        if !response.status().is_success() {
            return Err(DiscoveryError::probe(
                endpoint.to_string(),
                format!("status {}", response.status()),
            ));
        }

        let body = response
            .bytes()
            .await
            .map_err(|e| DiscoveryError::probe(endpoint.to_string(), e))?;

        PresenceRecord::decode(&body)
    }
}

/// Keep one endpoint per container whose ports include `port_name`
pub fn select_candidates(pods: Vec<Pod>, port_name: &str) -> Vec<Endpoint> {
    let mut endpoints = Vec::new();

    for pod in pods {
        let Some(ip) = pod.ip else {
            continue;
        };

        for container in pod.containers {
            let Some(port) = container.find_port(port_name) else {
                continue;
            };
            let Some(container_port) = port.container_port else {
                debug!(container = %container.name, ip = %ip, "Probe port has no container port, skipping");
                continue;
            };

            endpoints.push(Endpoint {
                pod_host: pod.host.clone(),
                container: container.name.clone(),
                ip: ip.clone(),
                port: container_port,
            });
        }
    }

    endpoints
}

fn read_pem(path: &str) -> DiscoveryResult<Vec<u8>> {
    std::fs::read(path).map_err(|e| DiscoveryError::Configuration(format!("Cannot read {}: {}", path, e)))
}

impl Clone for OrchestrationClient {
    fn clone(&self) -> Self {
        Self {
            root_url: self.root_url.clone(),
            labels: self.labels.clone(),
            probe_port_name: self.probe_port_name.clone(),
            list_policy: self.list_policy,
            probe_policy: self.probe_policy,
            http_client: self.http_client.clone(),
            probe_client: self.probe_client.clone(),
        }
    }
}

impl std::fmt::Debug for OrchestrationClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OrchestrationClient")
            .field("root_url", &self.root_url)
            .field("labels", &self.labels)
            .finish()
    }
}
