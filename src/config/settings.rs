//! Node configuration settings

use config::{Config, Environment, File};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

use crate::models::{DiscoveryError, DiscoveryResult, PhysicalAddress};

/// Environment variable holding comma-separated etcd endpoints
pub const ENV_ETCD_ENDPOINTS: &str = "ETCD_ENDPOINTS";
pub const ENV_MASTER_HOST: &str = "OPENSHIFT_MASTER_HOST";
pub const ENV_MASTER_PORT: &str = "OPENSHIFT_MASTER_PORT";
pub const ENV_RO_SERVICE_HOST: &str = "KUBERNETES_RO_SERVICE_HOST";
pub const ENV_RO_SERVICE_PORT: &str = "KUBERNETES_RO_SERVICE_PORT";
pub const ENV_CLIENT_CERT_FILE: &str = "KUBERNETES_CLIENT_CERTIFICATE_FILE";
pub const ENV_CLIENT_KEY_FILE: &str = "KUBERNETES_CLIENT_KEY_FILE";
pub const ENV_CA_CERT_FILE: &str = "KUBERNETES_CA_CERTIFICATE_FILE";

/// Main node configuration
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub node: NodeSettings,
    #[serde(default)]
    pub discovery: DiscoverySettings,
    #[serde(default)]
    pub registry: RegistrySettings,
    #[serde(default)]
    pub orchestration: OrchestrationSettings,
    #[serde(default)]
    pub presence: PresenceSettings,
    #[serde(default)]
    pub admin: AdminSettings,
}

/// Node identity settings
#[derive(Debug, Clone, Deserialize)]
pub struct NodeSettings {
    /// Unique node identifier
    #[serde(default = "default_node_id")]
    pub node_id: String,
    /// Human readable name, defaults to the node id
    pub logical_name: Option<String>,
    /// Cluster to join
    #[serde(default = "default_cluster_name")]
    pub cluster_name: String,
    /// Host peers should connect to
    #[serde(default = "default_advertise_host")]
    pub advertise_host: String,
    /// Port peers should connect to
    #[serde(default = "default_advertise_port")]
    pub advertise_port: u16,
}

fn default_node_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

fn default_cluster_name() -> String {
    "default".to_string()
}

fn default_advertise_host() -> String {
    "127.0.0.1".to_string()
}

fn default_advertise_port() -> u16 {
    7800
}

impl Default for NodeSettings {
    fn default() -> Self {
        NodeSettings {
            node_id: default_node_id(),
            logical_name: None,
            cluster_name: default_cluster_name(),
            advertise_host: default_advertise_host(),
            advertise_port: default_advertise_port(),
        }
    }
}

impl NodeSettings {
    pub fn logical_name(&self) -> &str {
        self.logical_name.as_deref().unwrap_or(&self.node_id)
    }

    pub fn advertise_address(&self) -> PhysicalAddress {
        PhysicalAddress::new(self.advertise_host.clone(), self.advertise_port)
    }
}

/// Which discovery backend to run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    Registry,
    Orchestration,
}

impl Default for BackendKind {
    fn default() -> Self {
        BackendKind::Registry
    }
}

/// Discovery round settings
#[derive(Debug, Clone, Deserialize)]
pub struct DiscoverySettings {
    #[serde(default)]
    pub backend: BackendKind,
    /// Interval between discovery rounds driven by the node binary
    #[serde(default = "default_round_interval")]
    pub round_interval_sec: u64,
}

fn default_round_interval() -> u64 {
    30
}

impl Default for DiscoverySettings {
    fn default() -> Self {
        DiscoverySettings {
            backend: BackendKind::default(),
            round_interval_sec: default_round_interval(),
        }
    }
}

/// Coordination-service registry settings
#[derive(Debug, Clone, Deserialize)]
pub struct RegistrySettings {
    /// Comma-separated endpoints (env fallback: ETCD_ENDPOINTS)
    pub connection: Option<String>,
    /// Root under which cluster paths live
    #[serde(default = "default_root_path")]
    pub root_path: String,
    #[serde(default = "default_connection_timeout")]
    pub connection_timeout_ms: u64,
    /// Lifetime of ephemeral records without keep-alive
    #[serde(default = "default_session_timeout")]
    pub session_timeout_ms: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_interval")]
    pub retry_interval_ms: u64,
    /// Self-write refresh period
    #[serde(default = "default_refresh_interval")]
    pub refresh_interval_sec: u64,
}

fn default_root_path() -> String {
    "/cluster-discovery/registry".to_string()
}

fn default_connection_timeout() -> u64 {
    15_000
}

fn default_session_timeout() -> u64 {
    60_000
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_interval() -> u64 {
    500
}

fn default_refresh_interval() -> u64 {
    60
}

impl Default for RegistrySettings {
    fn default() -> Self {
        RegistrySettings {
            connection: None,
            root_path: default_root_path(),
            connection_timeout_ms: default_connection_timeout(),
            session_timeout_ms: default_session_timeout(),
            max_retries: default_max_retries(),
            retry_interval_ms: default_retry_interval(),
            refresh_interval_sec: default_refresh_interval(),
        }
    }
}

impl RegistrySettings {
    pub fn endpoints(&self) -> Vec<String> {
        self.connection
            .as_deref()
            .unwrap_or_default()
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(String::from)
            .collect()
    }

    pub fn connection_timeout(&self) -> Duration {
        Duration::from_millis(self.connection_timeout_ms)
    }

    pub fn session_timeout(&self) -> Duration {
        Duration::from_millis(self.session_timeout_ms)
    }

    pub fn retry_interval(&self) -> Duration {
        Duration::from_millis(self.retry_interval_ms)
    }

    pub fn refresh_interval(&self) -> Duration {
        Duration::from_secs(self.refresh_interval_sec)
    }
}

/// Orchestration API settings
#[derive(Debug, Clone, Deserialize)]
pub struct OrchestrationSettings {
    /// Control-plane host (env fallback: OPENSHIFT_MASTER_HOST, KUBERNETES_RO_SERVICE_HOST)
    pub host: Option<String>,
    /// Control-plane port (env fallback: OPENSHIFT_MASTER_PORT, KUBERNETES_RO_SERVICE_PORT)
    pub port: Option<u16>,
    #[serde(default = "default_api_version")]
    pub api_version: String,
    /// Label selector; unset lists every pod in scope
    pub labels: Option<String>,
    /// Name of the container port that answers probes
    #[serde(default = "default_probe_port_name")]
    pub probe_port_name: String,
    #[serde(default = "default_list_attempts")]
    pub list_attempts: u32,
    #[serde(default = "default_list_interval")]
    pub list_interval_ms: u64,
    #[serde(default = "default_probe_attempts")]
    pub probe_attempts: u32,
    #[serde(default = "default_probe_interval")]
    pub probe_interval_ms: u64,
    /// PEM client certificate for mutual TLS
    pub cert_file: Option<String>,
    /// PEM private key matching `cert_file`
    pub key_file: Option<String>,
    /// PEM CA bundle used to verify the control plane
    pub ca_file: Option<String>,
}

fn default_api_version() -> String {
    "v1beta1".to_string()
}

fn default_probe_port_name() -> String {
    "ping".to_string()
}

fn default_list_attempts() -> u32 {
    60
}

fn default_list_interval() -> u64 {
    1_000
}

fn default_probe_attempts() -> u32 {
    100
}

fn default_probe_interval() -> u64 {
    500
}

impl Default for OrchestrationSettings {
    fn default() -> Self {
        OrchestrationSettings {
            host: None,
            port: None,
            api_version: default_api_version(),
            labels: None,
            probe_port_name: default_probe_port_name(),
            list_attempts: default_list_attempts(),
            list_interval_ms: default_list_interval(),
            probe_attempts: default_probe_attempts(),
            probe_interval_ms: default_probe_interval(),
            cert_file: None,
            key_file: None,
            ca_file: None,
        }
    }
}

impl OrchestrationSettings {
    pub fn list_interval(&self) -> Duration {
        Duration::from_millis(self.list_interval_ms)
    }

    pub fn probe_interval(&self) -> Duration {
        Duration::from_millis(self.probe_interval_ms)
    }

    pub fn uses_tls(&self) -> bool {
        self.cert_file.is_some()
    }
}

/// Presence server settings
#[derive(Debug, Clone, Deserialize)]
pub struct PresenceSettings {
    #[serde(default = "default_presence_host")]
    pub bind_host: String,
    #[serde(default = "default_presence_port")]
    pub port: u16,
    #[serde(default = "default_presence_workers")]
    pub workers: usize,
}

fn default_presence_host() -> String {
    "127.0.0.1".to_string()
}

fn default_presence_port() -> u16 {
    8888
}

fn default_presence_workers() -> usize {
    2
}

impl Default for PresenceSettings {
    fn default() -> Self {
        PresenceSettings {
            bind_host: default_presence_host(),
            port: default_presence_port(),
            workers: default_presence_workers(),
        }
    }
}

/// Admin HTTP server settings (health and metrics)
#[derive(Debug, Clone, Deserialize)]
pub struct AdminSettings {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_admin_host")]
    pub host: String,
    #[serde(default = "default_admin_port")]
    pub port: u16,
}

fn default_true() -> bool {
    true
}

fn default_admin_host() -> String {
    "0.0.0.0".to_string()
}

fn default_admin_port() -> u16 {
    9090
}

impl Default for AdminSettings {
    fn default() -> Self {
        AdminSettings {
            enabled: true,
            host: default_admin_host(),
            port: default_admin_port(),
        }
    }
}

/// Treat empty and whitespace-only values as unset
fn trim_to_none(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

impl Settings {
    /// Load settings from file and environment
    pub fn load() -> DiscoveryResult<Self> {
        Self::load_from("config")
    }

    /// Load settings from a specific config file path (without extension)
    pub fn load_from<P: AsRef<Path>>(path: P) -> DiscoveryResult<Self> {
        let config_path = path.as_ref();

        let builder = Config::builder()
            .set_default("node.cluster_name", default_cluster_name())?
            .set_default("discovery.backend", "registry")?
            .set_default("registry.root_path", default_root_path())?
            .set_default("orchestration.api_version", default_api_version())?
            .set_default("orchestration.probe_port_name", default_probe_port_name())?
            .set_default("presence.bind_host", default_presence_host())?
            .set_default("presence.port", default_presence_port() as i64)?
            // Add config file if it exists
            .add_source(File::with_name(config_path.to_str().unwrap_or("config")).required(false))
            // Add environment variables with prefix CLUSTER_DISCOVERY__
            .add_source(
                Environment::with_prefix("CLUSTER_DISCOVERY")
                    .prefix_separator("__")
                    .separator("__"),
            );

        let mut settings: Settings = builder.build()?.try_deserialize()?;
        settings.resolve_env_fallbacks(|name| std::env::var(name).ok())?;
        Ok(settings)
    }

    /// Fill still-unset values from their named environment variables
    ///
    /// Runs once after loading; explicit values always win.
    pub fn resolve_env_fallbacks<F>(&mut self, lookup: F) -> DiscoveryResult<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = |name: &str| trim_to_none(lookup(name));

        let registry = &mut self.registry;
        registry.connection = trim_to_none(registry.connection.take()).or_else(|| env(ENV_ETCD_ENDPOINTS));

        let orchestration = &mut self.orchestration;
        orchestration.host = trim_to_none(orchestration.host.take())
            .or_else(|| env(ENV_MASTER_HOST))
            .or_else(|| env(ENV_RO_SERVICE_HOST));

        if orchestration.port.is_none() {
            if let Some(raw) = env(ENV_MASTER_PORT).or_else(|| env(ENV_RO_SERVICE_PORT)) {
                let port = raw.parse::<u16>().map_err(|e| {
                    DiscoveryError::Configuration(format!("Invalid control-plane port {:?}: {}", raw, e))
                })?;
                orchestration.port = Some(port);
            }
        }

        orchestration.labels = trim_to_none(orchestration.labels.take());
        orchestration.cert_file = trim_to_none(orchestration.cert_file.take()).or_else(|| env(ENV_CLIENT_CERT_FILE));
        orchestration.key_file = trim_to_none(orchestration.key_file.take()).or_else(|| env(ENV_CLIENT_KEY_FILE));
        orchestration.ca_file = trim_to_none(orchestration.ca_file.take()).or_else(|| env(ENV_CA_CERT_FILE));

        Ok(())
    }

    /// Check required keys for the selected backend before any I/O
    pub fn validate(&self) -> DiscoveryResult<()> {
        if self.node.node_id.trim().is_empty() || self.node.node_id.contains('/') {
            return Err(DiscoveryError::Configuration(format!(
                "Invalid node id: {:?}",
                self.node.node_id
            )));
        }
        if self.node.cluster_name.trim().is_empty() || self.node.cluster_name.contains('/') {
            return Err(DiscoveryError::Configuration(format!(
                "Invalid cluster name: {:?}",
                self.node.cluster_name
            )));
        }

        match self.discovery.backend {
            BackendKind::Registry => {
                if self.registry.endpoints().is_empty() {
                    return Err(DiscoveryError::Configuration(format!(
                        "Missing registry.connection (or {})",
                        ENV_ETCD_ENDPOINTS
                    )));
                }
                if self.registry.refresh_interval_sec == 0 {
                    return Err(DiscoveryError::Configuration(
                        "registry.refresh_interval_sec must be positive".to_string(),
                    ));
                }
            }
            BackendKind::Orchestration => {
                let orchestration = &self.orchestration;
                if orchestration.host.is_none() {
                    return Err(DiscoveryError::Configuration(format!(
                        "Missing orchestration.host (or {} / {})",
                        ENV_MASTER_HOST, ENV_RO_SERVICE_HOST
                    )));
                }
                if orchestration.port.is_none() {
                    return Err(DiscoveryError::Configuration(format!(
                        "Missing orchestration.port (or {} / {})",
                        ENV_MASTER_PORT, ENV_RO_SERVICE_PORT
                    )));
                }
                if orchestration.probe_port_name.trim().is_empty() {
                    return Err(DiscoveryError::Configuration(
                        "orchestration.probe_port_name must not be empty".to_string(),
                    ));
                }
                if orchestration.cert_file.is_some() && orchestration.key_file.is_none() {
                    return Err(DiscoveryError::Configuration(
                        "orchestration.cert_file requires orchestration.key_file".to_string(),
                    ));
                }
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn test_default_settings() {
        let settings = Settings::default();
        assert_eq!(settings.discovery.backend, BackendKind::Registry);
        assert_eq!(settings.registry.refresh_interval_sec, 60);
        assert_eq!(settings.registry.max_retries, 3);
        assert_eq!(settings.orchestration.probe_port_name, "ping");
        assert_eq!(settings.orchestration.list_attempts, 60);
        assert_eq!(settings.orchestration.probe_attempts, 100);
        assert_eq!(settings.presence.port, 8888);
        assert_eq!(settings.presence.bind_host, "127.0.0.1");
    }

    #[test]
    fn test_explicit_value_wins_over_env() {
        let mut settings = Settings::default();
        settings.registry.connection = Some("etcd-a:2379".to_string());
        settings
            .resolve_env_fallbacks(lookup(&[(ENV_ETCD_ENDPOINTS, "etcd-b:2379")]))
            .unwrap();
        assert_eq!(settings.registry.endpoints(), vec!["etcd-a:2379"]);
    }

    #[test]
    fn test_env_fallback_order() {
        let mut settings = Settings::default();
        settings
            .resolve_env_fallbacks(lookup(&[
                (ENV_ETCD_ENDPOINTS, "e1:2379, e2:2379"),
                (ENV_MASTER_HOST, "   "),
                (ENV_RO_SERVICE_HOST, "10.0.0.1"),
                (ENV_RO_SERVICE_PORT, "443"),
                (ENV_CLIENT_CERT_FILE, "/certs/client.pem"),
            ]))
            .unwrap();

        assert_eq!(settings.registry.endpoints(), vec!["e1:2379", "e2:2379"]);
        assert_eq!(settings.orchestration.host.as_deref(), Some("10.0.0.1"));
        assert_eq!(settings.orchestration.port, Some(443));
        assert_eq!(settings.orchestration.cert_file.as_deref(), Some("/certs/client.pem"));
        assert!(settings.orchestration.key_file.is_none());
    }

    #[test]
    fn test_invalid_env_port() {
        let mut settings = Settings::default();
        let err = settings
            .resolve_env_fallbacks(lookup(&[(ENV_MASTER_PORT, "not-a-port")]))
            .unwrap_err();
        assert!(matches!(err, DiscoveryError::Configuration(_)));
    }

    #[test]
    fn test_validate_requires_backend_keys() {
        let mut settings = Settings::default();
        assert!(matches!(settings.validate(), Err(DiscoveryError::Configuration(_))));

        settings.registry.connection = Some("localhost:2379".to_string());
        assert!(settings.validate().is_ok());

        settings.discovery.backend = BackendKind::Orchestration;
        assert!(settings.validate().is_err());

        settings.orchestration.host = Some("master".to_string());
        settings.orchestration.port = Some(8443);
        assert!(settings.validate().is_ok());

        settings.orchestration.cert_file = Some("client.pem".to_string());
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_node_id_with_slash() {
        let mut settings = Settings::default();
        settings.registry.connection = Some("localhost:2379".to_string());
        settings.node.node_id = "rack1/node-a".to_string();
        assert!(matches!(settings.validate(), Err(DiscoveryError::Configuration(_))));

        settings.node.node_id = "rack1-node-a".to_string();
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let mut file = std::fs::File::create(dir.path().join("cluster.toml")).unwrap();
        writeln!(
            file,
            r#"
[node]
node_id = "node-1"
cluster_name = "orders"

[discovery]
backend = "orchestration"

[orchestration]
host = "master.local"
port = 8443
labels = "app=orders"
probe_port_name = "PING"
"#
        )
        .unwrap();

        drop(file);
        let settings = Settings::load_from(dir.path().join("cluster")).unwrap();

        assert_eq!(settings.node.node_id, "node-1");
        assert_eq!(settings.node.logical_name(), "node-1");
        assert_eq!(settings.node.cluster_name, "orders");
        assert_eq!(settings.discovery.backend, BackendKind::Orchestration);
        assert_eq!(settings.orchestration.labels.as_deref(), Some("app=orders"));
        assert_eq!(settings.orchestration.api_version, "v1beta1");
        assert!(settings.validate().is_ok());
    }
}
