//! Inflight command tracking.
//!
//! Every replicate or delete command the manager dispatches is recorded here
//! until the effect is observed in a replica report, the command times out,
//! or the target node leaves the healthy in-service set. Buckets are keyed
//! by container id; a `(container, datanode)` pair appears at most once per
//! map.

use crate::node::DatanodeDetails;
use crate::types::ContainerId;
use parking_lot::RwLock;
use std::collections::HashMap;

/// A dispatched command awaiting its observable effect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InflightAction {
    pub datanode: DatanodeDetails,
    /// Clock milliseconds at dispatch time.
    pub issued_at: u64,
}

impl InflightAction {
    pub fn new(datanode: DatanodeDetails, issued_at: u64) -> Self {
        Self {
            datanode,
            issued_at,
        }
    }
}

/// Per-container buckets of inflight actions.
pub struct InflightMap {
    inner: RwLock<HashMap<ContainerId, Vec<InflightAction>>>,
}

impl InflightMap {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(HashMap::new()),
        }
    }

    /// Record an action. Returns false if the datanode already has an action
    /// inflight for this container.
    pub fn record(&self, id: ContainerId, action: InflightAction) -> bool {
        let mut inner = self.inner.write();
        let bucket = inner.entry(id).or_default();
        if bucket.iter().any(|a| a.datanode == action.datanode) {
            return false;
        }
        bucket.push(action);
        true
    }

    pub fn contains(&self, id: ContainerId) -> bool {
        self.inner.read().contains_key(&id)
    }

    pub fn count(&self, id: ContainerId) -> usize {
        self.inner.read().get(&id).map_or(0, Vec::len)
    }

    /// Snapshot of the actions for one container.
    pub fn actions(&self, id: ContainerId) -> Vec<InflightAction> {
        self.inner.read().get(&id).cloned().unwrap_or_default()
    }

    /// Datanodes with an action inflight for one container.
    pub fn datanodes(&self, id: ContainerId) -> Vec<DatanodeDetails> {
        self.inner
            .read()
            .get(&id)
            .map(|bucket| bucket.iter().map(|a| a.datanode.clone()).collect())
            .unwrap_or_default()
    }

    /// Remove the action for the given datanode; empty buckets are dropped.
    pub fn remove(&self, id: ContainerId, datanode: &DatanodeDetails) {
        let mut inner = self.inner.write();
        if let Some(bucket) = inner.get_mut(&id) {
            bucket.retain(|a| a.datanode != *datanode);
            if bucket.is_empty() {
                inner.remove(&id);
            }
        }
    }

    pub fn clear(&self) {
        self.inner.write().clear();
    }

    /// Full snapshot, for introspection.
    pub fn snapshot(&self) -> HashMap<ContainerId, Vec<InflightAction>> {
        self.inner.read().clone()
    }
}

impl Default for InflightMap {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_and_remove() {
        let map = InflightMap::new();
        let id = ContainerId(1);
        let dn = DatanodeDetails::random();

        assert!(!map.contains(id));
        assert!(map.record(id, InflightAction::new(dn.clone(), 100)));
        assert!(map.contains(id));
        assert_eq!(map.count(id), 1);
        assert_eq!(map.datanodes(id), vec![dn.clone()]);

        map.remove(id, &dn);
        assert!(!map.contains(id));
        assert_eq!(map.count(id), 0);
    }

    #[test]
    fn test_duplicate_datanode_rejected() {
        let map = InflightMap::new();
        let id = ContainerId(1);
        let dn = DatanodeDetails::random();

        assert!(map.record(id, InflightAction::new(dn.clone(), 100)));
        assert!(!map.record(id, InflightAction::new(dn.clone(), 200)));
        assert_eq!(map.count(id), 1);
        assert_eq!(map.actions(id)[0].issued_at, 100);
    }

    #[test]
    fn test_same_container_multiple_datanodes() {
        let map = InflightMap::new();
        let id = ContainerId(1);
        let a = DatanodeDetails::random();
        let b = DatanodeDetails::random();

        map.record(id, InflightAction::new(a.clone(), 1));
        map.record(id, InflightAction::new(b.clone(), 2));
        assert_eq!(map.count(id), 2);

        map.remove(id, &a);
        assert_eq!(map.datanodes(id), vec![b]);
    }

    #[test]
    fn test_clear() {
        let map = InflightMap::new();
        map.record(ContainerId(1), InflightAction::new(DatanodeDetails::random(), 1));
        map.record(ContainerId(2), InflightAction::new(DatanodeDetails::random(), 2));
        assert_eq!(map.snapshot().len(), 2);

        map.clear();
        assert!(map.snapshot().is_empty());
    }
}
