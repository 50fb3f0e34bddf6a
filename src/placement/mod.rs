//! Placement policy integration.
//!
//! The rules that decide where replicas may live (racks, zones, capacity)
//! are pluggable: the replication manager consults a [`PlacementPolicy`]
//! through the [`PlacementEvaluator`] wrapper and never interprets topology
//! itself. A rack-aware reference policy is provided for tests and small
//! deployments.

use crate::error::{BasaltError, Result};
use crate::node::DatanodeDetails;
use crate::types::ContainerReplica;
use parking_lot::RwLock;
use rand::seq::SliceRandom;
use rand::thread_rng;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

/// Verdict of a placement-policy validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlacementStatus {
    /// Placement groups (racks/zones) the policy expects to be used.
    pub expected_placement_count: usize,
    /// Placement groups actually used by the validated replica set.
    pub actual_placement_count: usize,
    /// Human-readable explanation when unsatisfied.
    pub reason: Option<String>,
}

impl PlacementStatus {
    pub fn satisfied(count: usize) -> Self {
        Self {
            expected_placement_count: count,
            actual_placement_count: count,
            reason: None,
        }
    }

    pub fn is_policy_satisfied(&self) -> bool {
        self.actual_placement_count >= self.expected_placement_count
    }

    /// Number of additional placement groups required to satisfy the policy.
    pub fn mis_replication_count(&self) -> usize {
        self.expected_placement_count
            .saturating_sub(self.actual_placement_count)
    }
}

/// Pluggable replica placement policy.
pub trait PlacementPolicy: Send + Sync {
    /// Judge whether the given replica locations satisfy the policy for a
    /// container requiring `required` replicas.
    fn validate(&self, replicas: &[DatanodeDetails], required: usize) -> PlacementStatus;

    /// Choose `required` new locations, avoiding everything in `exclude`.
    /// `size_hint` is the container size in bytes, for capacity-aware
    /// policies.
    fn choose(
        &self,
        exclude: &[DatanodeDetails],
        required: usize,
        size_hint: u64,
    ) -> Result<Vec<DatanodeDetails>>;
}

/// Thin wrapper the replication manager uses to consult the policy.
#[derive(Clone)]
pub struct PlacementEvaluator {
    policy: Arc<dyn PlacementPolicy>,
}

impl PlacementEvaluator {
    pub fn new(policy: Arc<dyn PlacementPolicy>) -> Self {
        Self { policy }
    }

    pub fn validate(&self, replicas: &[DatanodeDetails], required: usize) -> PlacementStatus {
        self.policy.validate(replicas, required)
    }

    /// Validate the locations of a replica snapshot.
    pub fn placement_of(&self, replicas: &[ContainerReplica], required: usize) -> PlacementStatus {
        let datanodes: Vec<DatanodeDetails> =
            replicas.iter().map(|r| r.datanode.clone()).collect();
        self.policy.validate(&datanodes, required)
    }

    pub fn choose(
        &self,
        exclude: &[DatanodeDetails],
        required: usize,
        size_hint: u64,
    ) -> Result<Vec<DatanodeDetails>> {
        self.policy.choose(exclude, required, size_hint)
    }

    /// Whether two placement verdicts are *actually* equal: both satisfied,
    /// or both unsatisfied with the same actual placement count. This is the
    /// equivalence that lets a replica be removed from an already
    /// mis-replicated container without making the placement worse.
    pub fn actually_equal(a: &PlacementStatus, b: &PlacementStatus) -> bool {
        (a.is_policy_satisfied() && b.is_policy_satisfied())
            || (!a.is_policy_satisfied()
                && a.actual_placement_count == b.actual_placement_count)
    }
}

/// Rack-aware reference policy: replicas should span as many racks as the
/// cluster offers, up to the replication factor.
pub struct RackAwarePlacement {
    nodes: RwLock<HashMap<DatanodeDetails, String>>,
}

impl RackAwarePlacement {
    pub fn new() -> Self {
        Self {
            nodes: RwLock::new(HashMap::new()),
        }
    }

    /// Register a datanode on the given rack.
    pub fn register(&self, datanode: DatanodeDetails, rack: impl Into<String>) {
        self.nodes.write().insert(datanode, rack.into());
    }

    pub fn remove(&self, datanode: &DatanodeDetails) {
        self.nodes.write().remove(datanode);
    }
}

impl Default for RackAwarePlacement {
    fn default() -> Self {
        Self::new()
    }
}

impl PlacementPolicy for RackAwarePlacement {
    fn validate(&self, replicas: &[DatanodeDetails], required: usize) -> PlacementStatus {
        let nodes = self.nodes.read();
        let total_racks = nodes.values().collect::<HashSet<_>>().len();
        let expected = required.min(total_racks.max(1));

        let used_racks: HashSet<&String> = replicas
            .iter()
            .filter_map(|dn| nodes.get(dn))
            .collect();
        let actual = used_racks.len();

        let reason = (actual < expected).then(|| {
            format!(
                "replicas span {} rack(s), policy requires {}",
                actual, expected
            )
        });

        PlacementStatus {
            expected_placement_count: expected,
            actual_placement_count: actual,
            reason,
        }
    }

    fn choose(
        &self,
        exclude: &[DatanodeDetails],
        required: usize,
        _size_hint: u64,
    ) -> Result<Vec<DatanodeDetails>> {
        let nodes = self.nodes.read();
        let excluded: HashSet<&DatanodeDetails> = exclude.iter().collect();

        let mut available: Vec<(&DatanodeDetails, &String)> = nodes
            .iter()
            .filter(|(dn, _)| !excluded.contains(dn))
            .collect();

        if available.len() < required {
            return Err(BasaltError::PlacementFailed(format!(
                "not enough datanodes: need {}, have {}",
                required,
                available.len()
            )));
        }

        available.shuffle(&mut thread_rng());

        // Racks already covered by the excluded (existing) replicas.
        let mut covered: HashSet<String> = exclude
            .iter()
            .filter_map(|dn| nodes.get(dn).cloned())
            .collect();

        // Prefer uncovered racks, then fill with whatever remains.
        let mut chosen = Vec::with_capacity(required);
        for (dn, rack) in &available {
            if chosen.len() == required {
                break;
            }
            if !covered.contains(*rack) {
                covered.insert((*rack).clone());
                chosen.push((*dn).clone());
            }
        }
        for (dn, _) in &available {
            if chosen.len() == required {
                break;
            }
            if !chosen.contains(*dn) {
                chosen.push((*dn).clone());
            }
        }

        Ok(chosen)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_cluster(racks: &[&str]) -> (RackAwarePlacement, Vec<DatanodeDetails>) {
        let policy = RackAwarePlacement::new();
        let mut datanodes = Vec::new();
        for rack in racks {
            let dn = DatanodeDetails::random();
            policy.register(dn.clone(), *rack);
            datanodes.push(dn);
        }
        (policy, datanodes)
    }

    #[test]
    fn test_validate_counts_racks() {
        let (policy, dns) = make_cluster(&["r1", "r1", "r2", "r3"]);

        // Two replicas on the same rack, k = 3, cluster has 3 racks.
        let status = policy.validate(&dns[..2].to_vec(), 3);
        assert!(!status.is_policy_satisfied());
        assert_eq!(status.actual_placement_count, 1);
        assert_eq!(status.mis_replication_count(), 2);

        // One replica per rack.
        let spread = vec![dns[0].clone(), dns[2].clone(), dns[3].clone()];
        let status = policy.validate(&spread, 3);
        assert!(status.is_policy_satisfied());
        assert_eq!(status.mis_replication_count(), 0);
    }

    #[test]
    fn test_validate_single_rack_cluster() {
        let (policy, dns) = make_cluster(&["r1", "r1", "r1"]);
        let status = policy.validate(&dns, 3);
        // A single-rack cluster can never do better than one rack.
        assert!(status.is_policy_satisfied());
    }

    #[test]
    fn test_choose_excludes_and_prefers_new_racks() {
        let (policy, dns) = make_cluster(&["r1", "r2", "r3", "r3"]);

        let chosen = policy.choose(&dns[..2].to_vec(), 1, 0).unwrap();
        assert_eq!(chosen.len(), 1);
        assert!(!dns[..2].contains(&chosen[0]));
        // Both remaining candidates are on r3; either satisfies the policy.
        assert!(dns[2..].contains(&chosen[0]));
    }

    #[test]
    fn test_choose_insufficient_nodes() {
        let (policy, dns) = make_cluster(&["r1", "r2"]);
        let result = policy.choose(&dns, 1, 0);
        assert!(matches!(result, Err(BasaltError::PlacementFailed(_))));
    }

    #[test]
    fn test_actually_equal() {
        let sat3 = PlacementStatus::satisfied(3);
        let sat2 = PlacementStatus::satisfied(2);
        let unsat = |actual| PlacementStatus {
            expected_placement_count: 3,
            actual_placement_count: actual,
            reason: None,
        };

        assert!(PlacementEvaluator::actually_equal(&sat3, &sat2));
        assert!(PlacementEvaluator::actually_equal(&unsat(2), &unsat(2)));
        assert!(!PlacementEvaluator::actually_equal(&unsat(2), &unsat(1)));
        assert!(!PlacementEvaluator::actually_equal(&unsat(2), &sat3));
    }
}
