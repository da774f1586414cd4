//! In-process coordination store
//!
//! A [`MemoryEnsemble`] plays the role of the coordination service; every
//! [`MemoryEnsemble::connect`] opens a new session against it. Used by tests
//! and by embedders that run several nodes inside one process.

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use super::store::{immediate_children, CoordinationStore};
use crate::models::{DiscoveryError, DiscoveryResult};

#[derive(Debug, Clone)]
struct Entry {
    data: Bytes,
    session: u64,
}

/// Shared state of the in-process coordination service
#[derive(Debug, Default)]
pub struct MemoryEnsemble {
    entries: RwLock<BTreeMap<String, Entry>>,
    next_session: AtomicU64,
    open_sessions: AtomicU64,
}

impl MemoryEnsemble {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Open a new session
    pub fn connect(self: &Arc<Self>) -> MemoryStore {
        let session = self.next_session.fetch_add(1, Ordering::SeqCst) + 1;
        self.open_sessions.fetch_add(1, Ordering::SeqCst);
        MemoryStore {
            ensemble: Arc::clone(self),
            session,
            closed: AtomicBool::new(false),
        }
    }

    /// Number of sessions opened and not yet closed
    pub fn open_sessions(&self) -> u64 {
        self.open_sessions.load(Ordering::SeqCst)
    }

    /// Number of sessions ever opened
    pub fn total_sessions(&self) -> u64 {
        self.next_session.load(Ordering::SeqCst)
    }

    /// Drop every entry of `session`, as a session timeout would
    pub fn expire_session(&self, session: u64) {
        self.entries.write().retain(|_, entry| entry.session != session);
    }

    /// Delete a path behind every session's back
    pub fn remove(&self, path: &str) -> bool {
        self.entries.write().remove(path).is_some()
    }

    /// Raw value at `path`
    pub fn get(&self, path: &str) -> Option<Bytes> {
        self.entries.read().get(path).map(|e| e.data.clone())
    }

    /// Insert a value not bound to any live session
    pub fn insert(&self, path: &str, data: impl Into<Bytes>) {
        self.entries.write().insert(
            path.to_string(),
            Entry {
                data: data.into(),
                session: 0,
            },
        );
    }

    /// Immediate children of `path`
    pub fn children(&self, path: &str) -> Vec<String> {
        let entries = self.entries.read();
        immediate_children(path, entries.keys().map(String::as_str))
    }
}

/// One session against a [`MemoryEnsemble`]
#[derive(Debug)]
pub struct MemoryStore {
    ensemble: Arc<MemoryEnsemble>,
    session: u64,
    closed: AtomicBool,
}

impl MemoryStore {
    pub fn session_id(&self) -> u64 {
        self.session
    }

    pub fn ensemble(&self) -> &Arc<MemoryEnsemble> {
        &self.ensemble
    }

    fn ensure_open(&self) -> DiscoveryResult<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(DiscoveryError::Connection(format!("Session {} closed", self.session)));
        }
        Ok(())
    }
}

#[async_trait]
impl CoordinationStore for MemoryStore {
    async fn put_ephemeral(&self, path: &str, data: Bytes) -> DiscoveryResult<()> {
        self.ensure_open()?;
        self.ensemble.entries.write().insert(
            path.to_string(),
            Entry {
                data,
                session: self.session,
            },
        );
        Ok(())
    }

    async fn children(&self, path: &str) -> DiscoveryResult<Vec<String>> {
        self.ensure_open()?;
        Ok(self.ensemble.children(path))
    }

    async fn get_data(&self, path: &str) -> DiscoveryResult<Option<Bytes>> {
        self.ensure_open()?;
        Ok(self.ensemble.get(path))
    }

    async fn delete(&self, path: &str) -> DiscoveryResult<bool> {
        self.ensure_open()?;
        Ok(self.ensemble.remove(path))
    }

    async fn close(&self) -> DiscoveryResult<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.ensemble.expire_session(self.session);
        self.ensemble.open_sessions.fetch_sub(1, Ordering::SeqCst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_ephemeral_entries_vanish_on_close() {
        let ensemble = MemoryEnsemble::new();
        let a = ensemble.connect();
        let b = ensemble.connect();

        a.put_ephemeral("/r/c/a", Bytes::from_static(b"a")).await.unwrap();
        b.put_ephemeral("/r/c/b", Bytes::from_static(b"b")).await.unwrap();
        assert_eq!(b.children("/r/c").await.unwrap(), vec!["a", "b"]);

        a.close().await.unwrap();
        a.close().await.unwrap();
        assert_eq!(ensemble.open_sessions(), 1);
        assert_eq!(b.children("/r/c").await.unwrap(), vec!["b"]);
        assert!(a.get_data("/r/c/b").await.is_err());
    }

    #[tokio::test]
    async fn test_overwrite_and_delete() {
        let ensemble = MemoryEnsemble::new();
        let store = ensemble.connect();

        store.put_ephemeral("/p", Bytes::from_static(b"1")).await.unwrap();
        store.put_ephemeral("/p", Bytes::from_static(b"2")).await.unwrap();
        assert_eq!(store.get_data("/p").await.unwrap(), Some(Bytes::from_static(b"2")));

        assert!(store.delete("/p").await.unwrap());
        assert!(!store.delete("/p").await.unwrap());
        assert_eq!(store.get_data("/p").await.unwrap(), None);
    }
}
