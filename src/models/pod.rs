//! Orchestration model: pods, containers and their named ports
//!
//! Built fresh from every control-plane poll; nothing here survives between
//! polls.

use serde::{Deserialize, Serialize};
use std::fmt;

/// A named container port
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Port {
    pub name: Option<String>,
    pub host_port: Option<u16>,
    pub container_port: Option<u16>,
}

impl Port {
    /// Case-insensitive name match
    pub fn is_named(&self, name: &str) -> bool {
        self.name
            .as_deref()
            .map(|n| n.eq_ignore_ascii_case(name))
            .unwrap_or(false)
    }
}

/// A container inside a pod
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Container {
    pub name: String,
    pub ports: Vec<Port>,
}

impl Container {
    /// First port whose name matches `port_name`, ignoring case
    pub fn find_port(&self, port_name: &str) -> Option<&Port> {
        self.ports.iter().find(|p| p.is_named(port_name))
    }
}

/// A workload instance as reported by the control plane
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pod {
    /// Node the pod is scheduled on
    pub host: Option<String>,
    pub ip: Option<String>,
    pub containers: Vec<Container>,
}

/// A directly probeable container
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Endpoint {
    pub pod_host: Option<String>,
    pub container: String,
    pub ip: String,
    pub port: u16,
}

impl Endpoint {
    /// Base URL used to probe this endpoint
    pub fn probe_url(&self) -> String {
        format!("http://{}", self)
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.ip.contains(':') {
            write!(f, "[{}]:{}", self.ip, self.port)
        } else {
            write!(f, "{}:{}", self.ip, self.port)
        }
    }
}

// ============================================================================
// Control-plane wire format
// ============================================================================

/// `GET /api/<version>/pods` response body
#[derive(Debug, Default, Deserialize)]
pub struct PodListResponse {
    #[serde(default)]
    pub items: Vec<PodItem>,
}

#[derive(Debug, Default, Deserialize)]
pub struct PodItem {
    #[serde(default, rename = "currentState")]
    pub current_state: CurrentState,
    #[serde(default, rename = "desiredState")]
    pub desired_state: DesiredState,
}

#[derive(Debug, Default, Deserialize)]
pub struct CurrentState {
    #[serde(default)]
    pub host: Option<String>,
    #[serde(default, rename = "podIP")]
    pub pod_ip: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct DesiredState {
    #[serde(default)]
    pub manifest: Manifest,
}

#[derive(Debug, Default, Deserialize)]
pub struct Manifest {
    #[serde(default)]
    pub containers: Option<Vec<ContainerSpec>>,
}

#[derive(Debug, Default, Deserialize)]
pub struct ContainerSpec {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub ports: Option<Vec<PortSpec>>,
}

#[derive(Debug, Default, Deserialize)]
pub struct PortSpec {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default, rename = "hostPort")]
    pub host_port: Option<u16>,
    #[serde(default, rename = "containerPort")]
    pub container_port: Option<u16>,
}

impl From<PodItem> for Pod {
    fn from(item: PodItem) -> Self {
        let containers = item
            .desired_state
            .manifest
            .containers
            .unwrap_or_default()
            .into_iter()
            .map(|spec| Container {
                name: spec.name.unwrap_or_default(),
                ports: spec
                    .ports
                    .unwrap_or_default()
                    .into_iter()
                    .map(|p| Port {
                        name: p.name,
                        host_port: p.host_port,
                        container_port: p.container_port,
                    })
                    .collect(),
            })
            .collect();

        Pod {
            host: item.current_state.host,
            ip: item.current_state.pod_ip,
            containers,
        }
    }
}

impl PodListResponse {
    pub fn into_pods(self) -> Vec<Pod> {
        self.items.into_iter().map(Pod::from).collect()
    }
}
