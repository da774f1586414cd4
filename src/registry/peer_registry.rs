//! Peer registry on top of a coordination store
//!
//! Every node keeps one ephemeral presence record at
//! `root/cluster_name/node_id` and lists its siblings to find peers.

use async_trait::async_trait;
use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::etcd::EtcdStore;
use super::store::{make_path, CoordinationStore};
use crate::config::RegistrySettings;
use crate::discovery::DiscoveryBackend;
use crate::metrics;
use crate::models::{DiscoveryError, DiscoveryResult, PresenceRecord};
use crate::presence::LocalPresence;

/// Location of a node's record: `root/cluster/node_id`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterPath {
    root: String,
    cluster: String,
    node_id: String,
}

impl ClusterPath {
    /// Build the path, rejecting names that are not a single path segment
    pub fn new(
        root: impl Into<String>,
        cluster: impl Into<String>,
        node_id: impl Into<String>,
    ) -> DiscoveryResult<Self> {
        let path = Self {
            root: root.into(),
            cluster: cluster.into(),
            node_id: node_id.into(),
        };
        check_segment("cluster name", &path.cluster)?;
        check_segment("node id", &path.node_id)?;
        Ok(path)
    }

    pub fn cluster(&self) -> &str {
        &self.cluster
    }

    /// Directory holding every member of the cluster
    pub fn cluster_dir(&self) -> String {
        make_path(&self.root, &self.cluster)
    }

    /// This node's record
    pub fn node_path(&self) -> String {
        make_path(&self.cluster_dir(), &self.node_id)
    }

    /// Record path of another member of the same cluster
    pub fn member_path(&self, node_id: &str) -> String {
        make_path(&self.cluster_dir(), node_id)
    }
}

impl fmt::Display for ClusterPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.node_path())
    }
}

fn check_segment(what: &str, value: &str) -> DiscoveryResult<()> {
    if value.trim().is_empty() || value.contains('/') {
        return Err(DiscoveryError::Configuration(format!(
            "Invalid {}: {:?} must be a non-empty name without '/'",
            what, value
        )));
    }
    Ok(())
}

struct RefreshTask {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// Directory of live per-node presence records
pub struct PeerRegistry {
    store: Arc<dyn CoordinationStore>,
    root_path: String,
    node_id: String,
    refresh_interval: Duration,
    presence: LocalPresence,
    /// Set once at join, read without locking afterwards
    joined: Arc<OnceCell<ClusterPath>>,
    write_lock: Arc<tokio::sync::Mutex<()>>,
    refresh: Arc<Mutex<Option<RefreshTask>>>,
    closed: Arc<AtomicBool>,
}

impl PeerRegistry {
    /// Connect to the coordination service named in `settings`
    ///
    /// The connection is made exactly once here and shared by every
    /// operation afterwards. Exhausting the configured retries is fatal.
    pub async fn connect(
        settings: &RegistrySettings,
        presence: LocalPresence,
        cancel: &CancellationToken,
    ) -> DiscoveryResult<Self> {
        check_segment("node id", &presence.node_id())?;
        let store = EtcdStore::connect(settings, cancel).await?;
        Ok(Self::with_store(Arc::new(store), settings, presence))
    }

    /// Build a registry over an already connected store
    ///
    /// The node id is checked when a cluster path is first derived, so an id
    /// containing `/` fails at `join` or `write_self`.
    pub fn with_store(
        store: Arc<dyn CoordinationStore>,
        settings: &RegistrySettings,
        presence: LocalPresence,
    ) -> Self {
        Self {
            store,
            root_path: settings.root_path.clone(),
            node_id: presence.node_id(),
            refresh_interval: settings.refresh_interval(),
            presence,
            joined: Arc::new(OnceCell::new()),
            write_lock: Arc::new(tokio::sync::Mutex::new(())),
            refresh: Arc::new(Mutex::new(None)),
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Override the refresh period
    pub fn with_refresh_interval(mut self, interval: Duration) -> Self {
        self.refresh_interval = interval;
        self
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// Path of the joined cluster, if any
    pub fn cluster_path(&self) -> Option<&ClusterPath> {
        self.joined.get()
    }

    fn path_for(&self, cluster_name: &str) -> DiscoveryResult<ClusterPath> {
        match self.joined.get() {
            Some(path) if path.cluster() == cluster_name => Ok(path.clone()),
            Some(path) => Err(DiscoveryError::Configuration(format!(
                "Registry joined cluster {} and cannot serve {}",
                path.cluster(),
                cluster_name
            ))),
            None => ClusterPath::new(&self.root_path, cluster_name, &self.node_id),
        }
    }

    /// Fix the cluster path, write the first record and start refreshing
    pub async fn join(&self, cluster_name: &str) -> DiscoveryResult<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(DiscoveryError::Internal("Registry already stopped".to_string()));
        }

        let path = ClusterPath::new(&self.root_path, cluster_name, &self.node_id)?;
        let joined = self.joined.get_or_init(|| path.clone());
        if joined != &path {
            return Err(DiscoveryError::Configuration(format!(
                "Already joined cluster {}",
                joined.cluster()
            )));
        }

        let record = self.presence.snapshot();
        self.write_self(cluster_name, &record).await?;
        self.start_refresh();

        info!(cluster = cluster_name, path = %path, "Joined registry");
        Ok(())
    }

    /// Create or overwrite this node's ephemeral record
    pub async fn write_self(&self, cluster_name: &str, record: &PresenceRecord) -> DiscoveryResult<()> {
        let path = self.path_for(cluster_name)?;
        self.write_at(&path, record).await
    }

    async fn write_at(&self, path: &ClusterPath, record: &PresenceRecord) -> DiscoveryResult<()> {
        let data = record.encode()?;
        let node_path = path.node_path();

        let _guard = self.write_lock.lock().await;
        if self.closed.load(Ordering::Acquire) {
            return Err(DiscoveryError::transient_write(&node_path, "registry stopped"));
        }

        self.store
            .put_ephemeral(&node_path, data)
            .await
            .map_err(|e| {
                metrics::record_registry_write_failure();
                error!(path = %node_path, error = %e, "Error saving presence record");
                match e {
                    DiscoveryError::TransientWrite { .. } => e,
                    other => DiscoveryError::transient_write(&node_path, other),
                }
            })?;

        debug!(path = %node_path, "Presence record written");
        Ok(())
    }

    /// Read every decodable record in the cluster
    ///
    /// Never fails: a child that vanished between listing and reading, or
    /// that cannot be read or decoded, is skipped; if the listing itself
    /// fails the result is empty.
    pub async fn read_all(&self, cluster_name: &str) -> Vec<PresenceRecord> {
        let path = match self.path_for(cluster_name) {
            Ok(path) => path,
            Err(e) => {
                warn!(cluster = cluster_name, error = %e, "Cannot read registry");
                return Vec::new();
            }
        };
        let cluster_dir = path.cluster_dir();

        let children = match self.store.children(&cluster_dir).await {
            Ok(children) => children,
            Err(e) => {
                debug!(cluster = cluster_name, error = %e, "Failed to list registry members");
                return Vec::new();
            }
        };

        let mut records = Vec::with_capacity(children.len());
        for child in children {
            let child_path = path.member_path(&child);
            match self.store.get_data(&child_path).await {
                Ok(Some(data)) => match PresenceRecord::decode(&data) {
                    Ok(record) => records.push(record),
                    Err(e) => {
                        metrics::record_skipped_record("malformed");
                        warn!(path = %child_path, error = %e, "Skipping malformed presence record");
                    }
                },
                Ok(None) => {
                    metrics::record_skipped_record("vanished");
                    debug!(path = %child_path, "Member left while reading");
                }
                Err(e) => {
                    metrics::record_skipped_record("unreadable");
                    debug!(path = %child_path, error = %e, "Failed to read presence record");
                }
            }
        }

        records
    }

    /// Best-effort delete of this node's record
    pub async fn remove_self(&self, cluster_name: &str) {
        if let Ok(path) = self.path_for(cluster_name) {
            let node_path = path.node_path();
            self.delete_path(&node_path).await;
        }
    }

    /// Best-effort delete of another member's record
    pub async fn remove(&self, cluster_name: &str, node_id: &str) {
        if let Ok(path) = self.path_for(cluster_name) {
            let member_path = path.member_path(node_id);
            self.delete_path(&member_path).await;
        }
    }

    async fn delete_path(&self, path: &str) {
        match self.store.delete(path).await {
            Ok(true) => debug!(path, "Presence record removed"),
            Ok(false) => debug!(path, "Presence record already gone"),
            Err(e) => error!(path, error = %e, "Failed removing presence record"),
        }
    }

    fn start_refresh(&self) {
        let mut refresh = self.refresh.lock();
        if refresh.is_some() || self.refresh_interval.is_zero() {
            return;
        }

        let cancel = CancellationToken::new();
        let registry = self.clone();
        let token = cancel.clone();
        let period = self.refresh_interval;

        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.tick().await; // Skip first immediate tick

            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = interval.tick() => {}
                }

                let Some(path) = registry.joined.get() else {
                    continue;
                };
                // Failures are logged by write_at and retried next tick
                let record = registry.presence.snapshot();
                let _ = registry.write_at(path, &record).await;
            }
        });

        *refresh = Some(RefreshTask { cancel, handle });
    }

    /// Cancel the refresh task and wait until it has finished
    async fn stop_refresh(&self) {
        let task = self.refresh.lock().take();
        if let Some(task) = task {
            task.cancel.cancel();
            if let Err(e) = task.handle.await {
                if !e.is_cancelled() {
                    warn!(error = %e, "Refresh task ended abnormally");
                }
            }
        }
    }

    /// Leave the cluster: stop refreshing, remove the record, close the store
    ///
    /// The refresh task is cancelled and awaited before the record is
    /// removed. Cleanup failures are logged; shutdown always completes.
    pub async fn shutdown(&self) {
        self.stop_refresh().await;

        {
            // Wait for any in-flight write before deleting
            let _guard = self.write_lock.lock().await;
            if self.closed.swap(true, Ordering::AcqRel) {
                return;
            }
        }

        if let Some(path) = self.joined.get() {
            self.delete_path(&path.node_path()).await;
        }

        if let Err(e) = self.store.close().await {
            warn!(error = %e, "Failed to close coordination store");
        }

        info!(node_id = %self.node_id, "Registry stopped");
    }
}

impl Clone for PeerRegistry {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            root_path: self.root_path.clone(),
            node_id: self.node_id.clone(),
            refresh_interval: self.refresh_interval,
            presence: self.presence.clone(),
            joined: Arc::clone(&self.joined),
            write_lock: Arc::clone(&self.write_lock),
            refresh: Arc::clone(&self.refresh),
            closed: Arc::clone(&self.closed),
        }
    }
}

impl fmt::Debug for PeerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PeerRegistry")
            .field("node_id", &self.node_id)
            .field("cluster_path", &self.joined.get())
            .finish()
    }
}

#[async_trait]
impl DiscoveryBackend for PeerRegistry {
    fn name(&self) -> &'static str {
        "registry"
    }

    async fn start(&self, cluster_name: &str) -> DiscoveryResult<()> {
        self.join(cluster_name).await
    }

    /// Read peers first, then write self
    async fn fetch_cluster_members(&self, cluster_name: &str) -> DiscoveryResult<Vec<PresenceRecord>> {
        let records = self.read_all(cluster_name).await;

        let snapshot = self.presence.snapshot();
        if let Err(e) = self.write_self(cluster_name, &snapshot).await {
            debug!(cluster = cluster_name, error = %e, "Self-write after read failed");
        }

        Ok(records)
    }

    async fn stop(&self) -> DiscoveryResult<()> {
        self.shutdown().await;
        Ok(())
    }
}
