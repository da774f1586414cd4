//! Coordination-service capability used by the peer registry

use async_trait::async_trait;
use bytes::Bytes;

use crate::models::DiscoveryResult;

/// Hierarchical store with session-scoped ephemeral entries
///
/// Paths are `/`-separated. A store value is one client session: entries
/// written through [`CoordinationStore::put_ephemeral`] disappear when the
/// session closes or expires.
#[async_trait]
pub trait CoordinationStore: Send + Sync {
    /// Create `path` bound to this session, or overwrite it if present
    async fn put_ephemeral(&self, path: &str, data: Bytes) -> DiscoveryResult<()>;

    /// Names of the immediate children of `path`; empty when `path` has none
    async fn children(&self, path: &str) -> DiscoveryResult<Vec<String>>;

    /// Value at `path`, `None` when it does not exist
    async fn get_data(&self, path: &str) -> DiscoveryResult<Option<Bytes>>;

    /// Delete `path`; returns whether anything was removed
    async fn delete(&self, path: &str) -> DiscoveryResult<bool>;

    /// End the session, dropping its ephemeral entries
    async fn close(&self) -> DiscoveryResult<()>;
}

/// Join a parent path and a child name
pub fn make_path(parent: &str, child: &str) -> String {
    format!("{}/{}", parent.trim_end_matches('/'), child.trim_start_matches('/'))
}

/// Immediate child names under `parent` from a list of full keys
pub fn immediate_children<'a, I>(parent: &str, keys: I) -> Vec<String>
where
    I: IntoIterator<Item = &'a str>,
{
    let prefix = format!("{}/", parent.trim_end_matches('/'));
    let mut names: Vec<String> = keys
        .into_iter()
        .filter_map(|key| key.strip_prefix(prefix.as_str()))
        .filter_map(|rest| rest.split('/').next())
        .filter(|name| !name.is_empty())
        .map(String::from)
        .collect();
    names.sort();
    names.dedup();
    names
}
