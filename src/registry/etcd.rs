//! etcd-backed coordination store
//!
//! A session is an etcd lease: every ephemeral entry is put with the session
//! lease, a background task keeps the lease alive, and revoking it on close
//! removes the entries. If the process dies the lease expires after the
//! session timeout and the entries vanish on their own.

use async_trait::async_trait;
use bytes::Bytes;
use etcd_client::{Client, ConnectOptions, GetOptions, LeaseKeepAliveStream, LeaseKeeper, PutOptions};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use super::store::{immediate_children, CoordinationStore};
use crate::config::RegistrySettings;
use crate::models::{DiscoveryError, DiscoveryResult};
use crate::retry::RetryPolicy;

struct KeepAlive {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// etcd session
///
/// The client connection lives as long as the store. The session lease does
/// not: when it expires it is re-granted on the same client and the next put
/// re-creates the entry.
pub struct EtcdStore {
    client: Client,
    ttl: i64,
    lease_id: AtomicI64,
    /// Set by the keep-alive task once the current lease is gone
    lease_lost: Arc<AtomicBool>,
    /// Serializes lease re-grants
    renew: tokio::sync::Mutex<()>,
    keepalive: Mutex<Option<KeepAlive>>,
    closed: AtomicBool,
}

impl EtcdStore {
    /// Connect and open a session, retrying `max_retries` times
    pub async fn connect(settings: &RegistrySettings, cancel: &CancellationToken) -> DiscoveryResult<Self> {
        let endpoints = settings.endpoints();
        if endpoints.is_empty() {
            return Err(DiscoveryError::Configuration(
                "No coordination service endpoints configured".to_string(),
            ));
        }

        let options = ConnectOptions::new()
            .with_connect_timeout(settings.connection_timeout())
            .with_timeout(settings.connection_timeout());

        let ttl = session_ttl_secs(settings.session_timeout());
        let policy = RetryPolicy::new(settings.max_retries.saturating_add(1), settings.retry_interval());
        let (client, lease_id, keeper, stream) = policy
            .run("connect to etcd", cancel, || {
                let endpoints = endpoints.clone();
                let options = options.clone();
                async move {
                    open_session(endpoints, options, ttl).await.map_err(|e| {
                        warn!(error = %e, "etcd connection failed, retrying");
                        DiscoveryError::Connection(e.to_string())
                    })
                }
            })
            .await
            .map_err(|e| match e {
                DiscoveryError::Interrupted(_) => e,
                other => DiscoveryError::Connection(other.to_string()),
            })?;

        let store = Self {
            client,
            ttl,
            lease_id: AtomicI64::new(lease_id),
            lease_lost: Arc::new(AtomicBool::new(false)),
            renew: tokio::sync::Mutex::new(()),
            keepalive: Mutex::new(None),
            closed: AtomicBool::new(false),
        };
        store.replace_keepalive(keeper, stream, lease_id);

        info!(endpoints = ?endpoints, lease_id, ttl, "Connected to etcd");
        Ok(store)
    }

    /// Lease the ephemeral entries are currently bound to
    pub fn lease_id(&self) -> i64 {
        self.lease_id.load(Ordering::Acquire)
    }

    fn ensure_open(&self) -> DiscoveryResult<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(DiscoveryError::Connection("etcd session closed".to_string()));
        }
        Ok(())
    }

    fn keepalive_period(&self) -> Duration {
        Duration::from_secs((self.ttl as u64 / 3).max(1))
    }

    /// Start a keep-alive task for `lease_id`, cancelling the previous one
    fn replace_keepalive(&self, keeper: LeaseKeeper, stream: LeaseKeepAliveStream, lease_id: i64) {
        let cancel = CancellationToken::new();
        let handle = spawn_keepalive_task(
            keeper,
            stream,
            lease_id,
            self.keepalive_period(),
            Arc::clone(&self.lease_lost),
            cancel.clone(),
        );

        let previous = self.keepalive.lock().replace(KeepAlive { cancel, handle });
        if let Some(previous) = previous {
            previous.cancel.cancel();
        }
    }

    /// Grant a fresh lease on the existing client unless `stale` was already replaced
    async fn renew_lease(&self, stale: i64) -> DiscoveryResult<i64> {
        let _guard = self.renew.lock().await;
        self.ensure_open()?;

        let current = self.lease_id();
        if current != stale {
            return Ok(current);
        }

        let mut client = self.client.clone();
        let lease_id = client
            .lease_grant(self.ttl, None)
            .await
            .map_err(|e| DiscoveryError::Connection(format!("Failed to re-grant session lease: {}", e)))?
            .id();
        let (keeper, stream) = client
            .lease_keep_alive(lease_id)
            .await
            .map_err(|e| DiscoveryError::Connection(format!("Failed to keep session lease alive: {}", e)))?;

        self.lease_id.store(lease_id, Ordering::Release);
        self.lease_lost.store(false, Ordering::Release);
        self.replace_keepalive(keeper, stream, lease_id);

        warn!(stale_lease_id = stale, lease_id, "Session lease lost, granted a new one");
        Ok(lease_id)
    }

    async fn put_with_lease(&self, path: &str, data: &Bytes, lease_id: i64) -> Result<(), etcd_client::Error> {
        let mut client = self.client.clone();
        client
            .put(path, data.to_vec(), Some(PutOptions::new().with_lease(lease_id)))
            .await?;
        Ok(())
    }
}

/// Connect, grant the session lease and open its keep-alive stream
async fn open_session(
    endpoints: Vec<String>,
    options: ConnectOptions,
    ttl: i64,
) -> Result<(Client, i64, LeaseKeeper, LeaseKeepAliveStream), etcd_client::Error> {
    let mut client = Client::connect(endpoints, Some(options)).await?;
    let lease_id = client.lease_grant(ttl, None).await?.id();
    let (keeper, stream) = client.lease_keep_alive(lease_id).await?;
    Ok((client, lease_id, keeper, stream))
}

/// Lease TTL in whole seconds, never below one
fn session_ttl_secs(session_timeout: Duration) -> i64 {
    session_timeout.as_secs().max(1) as i64
}

/// Whether etcd rejected a request because its lease no longer exists
fn is_lease_missing(message: &str) -> bool {
    message.contains("lease not found")
}

/// Spawn background task to send periodic keep-alive requests for the lease.
///
/// A failed keep-alive is logged and retried on the next tick. Once the lease
/// is reported expired or the stream closes, `lost` is raised and the task
/// ends; the next put grants a new lease.
fn spawn_keepalive_task(
    mut keeper: LeaseKeeper,
    mut stream: LeaseKeepAliveStream,
    lease_id: i64,
    period: Duration,
    lost: Arc<AtomicBool>,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        interval.tick().await; // Skip first immediate tick

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = interval.tick() => {}
            }

            if let Err(e) = keeper.keep_alive().await {
                warn!(lease_id, error = %e, "Keep-alive send failed");
                continue;
            }

            match stream.message().await {
                Ok(Some(resp)) if resp.ttl() > 0 => {
                    trace!(lease_id, ttl = resp.ttl(), "Keep-alive OK");
                }
                Ok(Some(_)) => {
                    error!(lease_id, "Session lease expired, presence records are gone");
                    lost.store(true, Ordering::Release);
                    break;
                }
                Ok(None) => {
                    error!(lease_id, "Keep-alive stream closed");
                    lost.store(true, Ordering::Release);
                    break;
                }
                Err(e) => {
                    warn!(lease_id, error = %e, "Keep-alive failed");
                }
            }
        }
    })
}

#[async_trait]
impl CoordinationStore for EtcdStore {
    async fn put_ephemeral(&self, path: &str, data: Bytes) -> DiscoveryResult<()> {
        self.ensure_open()?;

        let mut lease_id = self.lease_id();
        if self.lease_lost.load(Ordering::Acquire) {
            lease_id = self.renew_lease(lease_id).await?;
        }

        match self.put_with_lease(path, &data, lease_id).await {
            Ok(()) => Ok(()),
            Err(e) if is_lease_missing(&e.to_string()) => {
                let lease_id = self.renew_lease(lease_id).await?;
                self.put_with_lease(path, &data, lease_id)
                    .await
                    .map_err(|e| DiscoveryError::transient_write(path, e))
            }
            Err(e) => Err(DiscoveryError::transient_write(path, e)),
        }
    }

    async fn children(&self, path: &str) -> DiscoveryResult<Vec<String>> {
        self.ensure_open()?;
        let prefix = format!("{}/", path.trim_end_matches('/'));
        let mut client = self.client.clone();
        let resp = client
            .get(prefix.as_str(), Some(GetOptions::new().with_prefix().with_keys_only()))
            .await
            .map_err(|e| DiscoveryError::transient_read(path, e))?;

        let keys: Vec<&str> = resp.kvs().iter().filter_map(|kv| kv.key_str().ok()).collect();
        Ok(immediate_children(path, keys))
    }

    async fn get_data(&self, path: &str) -> DiscoveryResult<Option<Bytes>> {
        self.ensure_open()?;
        let mut client = self.client.clone();
        let resp = client
            .get(path, None)
            .await
            .map_err(|e| DiscoveryError::transient_read(path, e))?;

        Ok(resp.kvs().first().map(|kv| Bytes::copy_from_slice(kv.value())))
    }

    async fn delete(&self, path: &str) -> DiscoveryResult<bool> {
        self.ensure_open()?;
        let mut client = self.client.clone();
        let resp = client
            .delete(path, None)
            .await
            .map_err(|e| DiscoveryError::transient_write(path, e))?;
        Ok(resp.deleted() > 0)
    }

    async fn close(&self) -> DiscoveryResult<()> {
        // Wait out an in-flight lease re-grant
        let _guard = self.renew.lock().await;
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        let keepalive = self.keepalive.lock().take();
        if let Some(keepalive) = keepalive {
            keepalive.cancel.cancel();
            let _ = keepalive.handle.await;
        }

        let lease_id = self.lease_id();
        let mut client = self.client.clone();
        client
            .lease_revoke(lease_id)
            .await
            .map_err(|e| DiscoveryError::Connection(format!("Failed to revoke session lease: {}", e)))?;

        debug!(lease_id, "etcd session closed");
        Ok(())
    }
}

impl std::fmt::Debug for EtcdStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EtcdStore")
            .field("lease_id", &self.lease_id())
            .field("lease_lost", &self.lease_lost.load(Ordering::Relaxed))
            .field("closed", &self.closed.load(Ordering::Relaxed))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_ttl_secs() {
        assert_eq!(session_ttl_secs(Duration::from_millis(60_000)), 60);
        assert_eq!(session_ttl_secs(Duration::from_millis(200)), 1);
    }

    #[test]
    fn test_lease_missing_detection() {
        assert!(is_lease_missing(
            "grpc request error: status: NotFound, message: \"etcdserver: requested lease not found\""
        ));
        assert!(!is_lease_missing("grpc request error: status: Unavailable"));
    }

    #[tokio::test]
    async fn test_connect_without_endpoints_is_configuration_error() {
        let settings = RegistrySettings::default();
        let err = EtcdStore::connect(&settings, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, DiscoveryError::Configuration(_)));
    }

    #[tokio::test]
    async fn test_connect_exhausts_retries() {
        let settings = RegistrySettings {
            connection: Some("127.0.0.1:1".to_string()),
            connection_timeout_ms: 100,
            max_retries: 1,
            retry_interval_ms: 10,
            ..Default::default()
        };
        let err = EtcdStore::connect(&settings, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, DiscoveryError::Connection(_)));
    }

    /// Needs a live etcd at `ETCD_ENDPOINTS`
    #[cfg(feature = "integration")]
    #[tokio::test]
    async fn test_session_entries_against_live_etcd() {
        let settings = RegistrySettings {
            connection: std::env::var(crate::config::ENV_ETCD_ENDPOINTS).ok(),
            session_timeout_ms: 5_000,
            ..Default::default()
        };
        let cancel = CancellationToken::new();
        let store = EtcdStore::connect(&settings, &cancel).await.unwrap();
        let reader = EtcdStore::connect(&settings, &cancel).await.unwrap();

        let dir = format!("/cluster-discovery-it/{}", uuid::Uuid::new_v4());
        let path = format!("{}/node-1", dir);
        store.put_ephemeral(&path, Bytes::from_static(b"one")).await.unwrap();
        store.put_ephemeral(&path, Bytes::from_static(b"two")).await.unwrap();

        assert_eq!(reader.children(&dir).await.unwrap(), vec!["node-1"]);
        assert_eq!(reader.get_data(&path).await.unwrap(), Some(Bytes::from_static(b"two")));

        store.close().await.unwrap();
        assert!(reader.children(&dir).await.unwrap().is_empty());
        reader.close().await.unwrap();
    }

    /// Needs a live etcd at `ETCD_ENDPOINTS`
    #[cfg(feature = "integration")]
    #[tokio::test]
    async fn test_expired_lease_is_regranted_on_next_put() {
        let settings = RegistrySettings {
            connection: std::env::var(crate::config::ENV_ETCD_ENDPOINTS).ok(),
            session_timeout_ms: 5_000,
            ..Default::default()
        };
        let cancel = CancellationToken::new();
        let store = EtcdStore::connect(&settings, &cancel).await.unwrap();

        let dir = format!("/cluster-discovery-it/{}", uuid::Uuid::new_v4());
        let path = format!("{}/node-1", dir);
        store.put_ephemeral(&path, Bytes::from_static(b"one")).await.unwrap();

        // Expire the session from outside, as etcd does after a long pause
        let stale = store.lease_id();
        let mut admin = Client::connect(settings.endpoints(), None).await.unwrap();
        admin.lease_revoke(stale).await.unwrap();
        assert!(store.get_data(&path).await.unwrap().is_none());

        store.put_ephemeral(&path, Bytes::from_static(b"two")).await.unwrap();
        assert_ne!(store.lease_id(), stale);
        assert_eq!(store.get_data(&path).await.unwrap(), Some(Bytes::from_static(b"two")));

        store.close().await.unwrap();
        assert!(store.children(&dir).await.is_err());
        assert!(admin.get(path.as_str(), None).await.unwrap().kvs().is_empty());
    }
}
