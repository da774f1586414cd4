//! This node's published presence snapshot

use arc_swap::ArcSwap;
use std::sync::Arc;

use crate::models::{PhysicalAddress, PresenceRecord, ViewId};

/// Latest presence record published by the membership layer
///
/// Readers get a consistent snapshot without taking a lock, so the refresh
/// timer and probe handlers never contend with the membership layer.
#[derive(Clone)]
pub struct LocalPresence {
    current: Arc<ArcSwap<PresenceRecord>>,
}

impl LocalPresence {
    pub fn new(record: PresenceRecord) -> Self {
        Self {
            current: Arc::new(ArcSwap::from_pointee(record)),
        }
    }

    /// Current snapshot
    pub fn snapshot(&self) -> Arc<PresenceRecord> {
        self.current.load_full()
    }

    pub fn node_id(&self) -> String {
        self.current.load().node_id.clone()
    }

    /// Replace the whole record
    pub fn publish(&self, record: PresenceRecord) {
        self.current.store(Arc::new(record));
    }

    /// Apply `f` to a copy of the current record and publish the result
    pub fn update<F>(&self, f: F)
    where
        F: Fn(&mut PresenceRecord),
    {
        self.current.rcu(|current| {
            let mut next = PresenceRecord::clone(current);
            f(&mut next);
            next
        });
    }

    /// Record a newly installed view
    pub fn set_view(&self, view_id: ViewId, is_coordinator: bool) {
        self.update(|record| {
            record.view_id = Some(view_id.clone());
            record.is_coordinator = is_coordinator;
        });
    }

    /// Replace the advertised physical addresses
    pub fn set_addresses<I>(&self, addresses: I)
    where
        I: IntoIterator<Item = PhysicalAddress>,
    {
        let addresses: Vec<PhysicalAddress> = addresses.into_iter().collect();
        self.update(|record| {
            record.addresses = addresses.iter().cloned().collect();
        });
    }
}

impl std::fmt::Debug for LocalPresence {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalPresence")
            .field("current", &self.current.load())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshots_are_isolated_from_updates() {
        let presence = LocalPresence::new(
            PresenceRecord::new("n1", "one").with_address(PhysicalAddress::new("10.0.0.1", 7800)),
        );
        let before = presence.snapshot();

        presence.set_addresses([PhysicalAddress::new("10.0.0.2", 7800)]);
        presence.set_view(
            ViewId {
                coordinator: "n1".to_string(),
                id: 3,
            },
            true,
        );

        let after = presence.snapshot();
        assert!(before.addresses.contains(&PhysicalAddress::new("10.0.0.1", 7800)));
        assert!(after.addresses.contains(&PhysicalAddress::new("10.0.0.2", 7800)));
        assert_eq!(after.addresses.len(), 1);
        assert!(after.is_coordinator);
        assert_eq!(after.view_id.as_ref().map(|v| v.id), Some(3));
        assert_eq!(presence.node_id(), "n1");
    }
}
