//! Pool membership and coordinator failover.

use parking_lot::RwLock;
use poolsync_core::{views, ObjectStore};

/// What the connection knows about the pool's topology.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PoolMembership {
    /// Management addresses of every member host.
    pub members: Vec<String>,
    /// Address of the current coordinator.
    pub coordinator: Option<String>,
    /// Whether the coordinator role can move (high availability is on).
    pub coordinator_may_change: bool,
}

/// Re-derives [`PoolMembership`] from the store.
#[derive(Debug, Default)]
pub struct MembershipTracker {
    current: RwLock<PoolMembership>,
}

impl MembershipTracker {
    /// Creates an empty tracker.
    pub fn new() -> Self {
        Self::default()
    }

    /// Recomputes membership from pool and host records.
    ///
    /// Returns true if anything changed.
    pub fn refresh(&self, store: &ObjectStore) -> bool {
        let pool = views::pool(store);
        let next = PoolMembership {
            members: views::member_addresses(store),
            coordinator: views::coordinator(store)
                .map(|h| h.address)
                .filter(|a| !a.is_empty()),
            coordinator_may_change: pool.map(|p| p.ha_enabled).unwrap_or(false),
        };
        let mut current = self.current.write();
        if *current == next {
            return false;
        }
        *current = next;
        true
    }

    /// Returns the current membership.
    pub fn snapshot(&self) -> PoolMembership {
        self.current.read().clone()
    }

    /// Returns the addresses to try, in order, when reconnecting.
    ///
    /// The last address always comes first. The coordinator and the other
    /// members follow only when the coordinator may have moved.
    pub fn failover_candidates(&self, last: &str) -> Vec<String> {
        let current = self.current.read();
        let mut candidates = vec![last.to_string()];
        if current.coordinator_may_change {
            for address in current.coordinator.iter().chain(current.members.iter()) {
                if !candidates.contains(address) {
                    candidates.push(address.clone());
                }
            }
        }
        candidates
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use poolsync_protocol::{ObjectRecord, ObjectRef, ObjectType};

    fn store(ha: bool) -> ObjectStore {
        let store = ObjectStore::new();
        store.put(
            ObjectType::Pool,
            ObjectRef::new("OpaqueRef:pool"),
            ObjectRecord::new(ObjectType::Pool)
                .field("master", ObjectRef::new("OpaqueRef:h2"))
                .field("ha_enabled", ha),
        );
        for (h, addr) in [("OpaqueRef:h1", "10.0.0.1"), ("OpaqueRef:h2", "10.0.0.2"), ("OpaqueRef:h3", "10.0.0.3")] {
            store.put(
                ObjectType::Host,
                ObjectRef::new(h),
                ObjectRecord::new(ObjectType::Host).field("address", addr),
            );
        }
        store
    }

    #[test]
    fn refresh_reports_changes() {
        let tracker = MembershipTracker::new();
        let s = store(true);
        assert!(tracker.refresh(&s));
        assert!(!tracker.refresh(&s));
        let m = tracker.snapshot();
        assert_eq!(m.members.len(), 3);
        assert_eq!(m.coordinator.as_deref(), Some("10.0.0.2"));
        assert!(m.coordinator_may_change);
    }

    #[test]
    fn candidates_with_ha() {
        let tracker = MembershipTracker::new();
        tracker.refresh(&store(true));
        assert_eq!(
            tracker.failover_candidates("10.0.0.1"),
            vec!["10.0.0.1", "10.0.0.2", "10.0.0.3"]
        );
    }

    #[test]
    fn candidates_without_ha() {
        let tracker = MembershipTracker::new();
        tracker.refresh(&store(false));
        assert_eq!(tracker.failover_candidates("10.0.0.2"), vec!["10.0.0.2"]);
    }
}
