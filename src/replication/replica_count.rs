//! Replica set analysis.
//!
//! [`ReplicaCount`] captures everything needed to decide whether a container
//! is under- or over-replicated: the observed replicas classified by the
//! operational state of their hosts, plus the inflight adds and deletes that
//! have been issued but not yet observed.
//!
//! Counting rules:
//! - replicas on decommissioning or decommissioned nodes never count toward
//!   sufficiency;
//! - replicas on maintenance nodes substitute for full replication only
//!   while `min(k, maintenance_minimum)` copies remain outside maintenance;
//! - an inflight add is assumed to succeed when judging under-replication,
//!   and ignored when judging over-replication (it may fail, and deleting on
//!   its promise could lose data);
//! - an inflight delete is assumed to succeed on both sides.

use crate::node::NodeManager;
use crate::types::{compare_state, ContainerInfo, ContainerReplica, LifecycleState, ReplicaState};

/// Replication arithmetic for one container at one point in time.
#[derive(Debug, Clone)]
pub struct ReplicaCount {
    container: ContainerInfo,
    replicas: Vec<ContainerReplica>,
    healthy: usize,
    maintenance: usize,
    decommission: usize,
    inflight_add: usize,
    inflight_del: usize,
    required: usize,
    maintenance_minimum: usize,
}

impl ReplicaCount {
    pub fn new(
        container: ContainerInfo,
        replicas: Vec<ContainerReplica>,
        nodes: &dyn NodeManager,
        inflight_add: usize,
        inflight_del: usize,
        maintenance_minimum: usize,
    ) -> Self {
        let mut healthy = 0;
        let mut maintenance = 0;
        let mut decommission = 0;

        for replica in &replicas {
            // Replicas on unknown nodes count nowhere.
            let Ok(status) = nodes.node_status(&replica.datanode) else {
                continue;
            };
            if status.operational.is_decommission() {
                decommission += 1;
            } else if status.operational.is_maintenance() {
                maintenance += 1;
            } else {
                healthy += 1;
            }
        }

        let required = container.replication_factor;
        Self {
            container,
            replicas,
            healthy,
            maintenance,
            decommission,
            inflight_add,
            inflight_del,
            required,
            maintenance_minimum,
        }
    }

    pub fn container(&self) -> &ContainerInfo {
        &self.container
    }

    pub fn replicas(&self) -> &[ContainerReplica] {
        &self.replicas
    }

    pub fn healthy_count(&self) -> usize {
        self.healthy
    }

    pub fn maintenance_count(&self) -> usize {
        self.maintenance
    }

    pub fn decommission_count(&self) -> usize {
        self.decommission
    }

    /// Signed replica delta before inflight corrections: positive means this
    /// many replicas are missing, negative that many are surplus.
    fn missing_replicas(&self) -> i64 {
        let delta = self.required as i64 - self.healthy as i64;
        if delta <= 0 {
            return delta;
        }

        // Maintenance copies stand in for full replication, as long as the
        // configured minimum of copies remains outside maintenance.
        let adjusted = (delta - self.maintenance as i64).max(0);
        let needed_for_maintenance = if self.maintenance > 0 {
            (self.maintenance_minimum.min(self.required) as i64 - self.healthy as i64).max(0)
        } else {
            0
        };
        adjusted.max(needed_for_maintenance)
    }

    fn excess_replicas(&self) -> i64 {
        (self.healthy as i64 - self.required as i64).max(0)
    }

    /// Signed repair delta. Positive: that many replicas must be created.
    /// Negative: that many are surplus and may be deleted.
    pub fn additional_replica_needed(&self) -> i64 {
        let delta = self.missing_replicas();
        if delta < 0 {
            // Surplus; pending deletes will shrink it and may flip the
            // container back to under-replicated.
            delta + self.inflight_del as i64
        } else {
            (delta - self.inflight_add as i64).max(0)
        }
    }

    pub fn is_sufficiently_replicated(&self) -> bool {
        self.missing_replicas() - self.inflight_add as i64 <= 0
    }

    pub fn is_over_replicated(&self) -> bool {
        self.excess_replicas() - self.inflight_del as i64 > 0
    }

    /// A container is healthy when it has settled (CLOSED or QUASI_CLOSED)
    /// and every replica is in the exact matching state.
    pub fn is_healthy(&self) -> bool {
        matches!(
            self.container.state,
            LifecycleState::Closed | LifecycleState::QuasiClosed
        ) && self
            .replicas
            .iter()
            .all(|r| compare_state(self.container.state, r.state))
    }
}

/// True when the container is CLOSED, carries no data, and every replica is
/// an empty CLOSED copy.
pub fn is_container_empty(container: &ContainerInfo, replicas: &[ContainerReplica]) -> bool {
    container.state == LifecycleState::Closed
        && container.used_bytes == 0
        && container.key_count == 0
        && replicas.iter().all(|r| {
            r.state == ReplicaState::Closed && r.bytes_used == 0 && r.key_count == 0
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::{
        DatanodeDetails, InMemoryNodeManager, NodeHealth, NodeOperationalState, NodeStatus,
    };
    use crate::types::ContainerId;

    struct Fixture {
        nodes: InMemoryNodeManager,
        container: ContainerInfo,
        replicas: Vec<ContainerReplica>,
    }

    impl Fixture {
        fn new(k: usize) -> Self {
            Self {
                nodes: InMemoryNodeManager::new(),
                container: ContainerInfo::new(ContainerId(1), LifecycleState::Closed, k),
                replicas: Vec::new(),
            }
        }

        fn with_replica(mut self, op: NodeOperationalState) -> Self {
            let dn = DatanodeDetails::random();
            self.nodes
                .register(&dn, NodeStatus::new(op, NodeHealth::Healthy));
            self.replicas.push(ContainerReplica::new(
                self.container.id,
                dn,
                ReplicaState::Closed,
            ));
            self
        }

        fn count(&self, add: usize, del: usize, maintenance_min: usize) -> ReplicaCount {
            ReplicaCount::new(
                self.container.clone(),
                self.replicas.clone(),
                &self.nodes,
                add,
                del,
                maintenance_min,
            )
        }
    }

    #[test]
    fn test_perfectly_replicated() {
        let fixture = Fixture::new(3)
            .with_replica(NodeOperationalState::InService)
            .with_replica(NodeOperationalState::InService)
            .with_replica(NodeOperationalState::InService);
        let rc = fixture.count(0, 0, 2);

        assert_eq!(rc.additional_replica_needed(), 0);
        assert!(rc.is_sufficiently_replicated());
        assert!(!rc.is_over_replicated());
        assert!(rc.is_healthy());
    }

    #[test]
    fn test_under_replicated() {
        let fixture = Fixture::new(3)
            .with_replica(NodeOperationalState::InService)
            .with_replica(NodeOperationalState::InService);
        let rc = fixture.count(0, 0, 2);

        assert_eq!(rc.additional_replica_needed(), 1);
        assert!(!rc.is_sufficiently_replicated());
    }

    #[test]
    fn test_inflight_add_suppresses_new_repair() {
        let fixture = Fixture::new(3)
            .with_replica(NodeOperationalState::InService)
            .with_replica(NodeOperationalState::InService);
        let rc = fixture.count(1, 0, 2);

        assert_eq!(rc.additional_replica_needed(), 0);
        assert!(rc.is_sufficiently_replicated());
        // A pending add must never justify deleting an observed replica.
        assert!(!rc.is_over_replicated());
    }

    #[test]
    fn test_over_replicated() {
        let fixture = Fixture::new(3)
            .with_replica(NodeOperationalState::InService)
            .with_replica(NodeOperationalState::InService)
            .with_replica(NodeOperationalState::InService)
            .with_replica(NodeOperationalState::InService);
        let rc = fixture.count(0, 0, 2);

        assert_eq!(rc.additional_replica_needed(), -1);
        assert!(rc.is_over_replicated());
        assert!(rc.is_sufficiently_replicated());
    }

    #[test]
    fn test_inflight_delete_suppresses_trim_and_flips_to_under() {
        let four = Fixture::new(3)
            .with_replica(NodeOperationalState::InService)
            .with_replica(NodeOperationalState::InService)
            .with_replica(NodeOperationalState::InService)
            .with_replica(NodeOperationalState::InService);

        // One delete already pending: not over-replicated any more.
        let rc = four.count(0, 1, 2);
        assert!(!rc.is_over_replicated());
        assert_eq!(rc.additional_replica_needed(), 0);

        // Too many pending deletes make the container need a new replica.
        let rc = four.count(0, 2, 2);
        assert_eq!(rc.additional_replica_needed(), 1);
    }

    #[test]
    fn test_decommissioning_replicas_do_not_count() {
        let fixture = Fixture::new(3)
            .with_replica(NodeOperationalState::InService)
            .with_replica(NodeOperationalState::InService)
            .with_replica(NodeOperationalState::Decommissioning);
        let rc = fixture.count(0, 0, 2);

        assert_eq!(rc.decommission_count(), 1);
        assert_eq!(rc.additional_replica_needed(), 1);
        assert!(!rc.is_sufficiently_replicated());
    }

    #[test]
    fn test_maintenance_replica_counts_with_enough_healthy() {
        // k = 3, m = 2: two healthy copies plus one in maintenance is fine.
        let fixture = Fixture::new(3)
            .with_replica(NodeOperationalState::InService)
            .with_replica(NodeOperationalState::InService)
            .with_replica(NodeOperationalState::InMaintenance);
        let rc = fixture.count(0, 0, 2);

        assert_eq!(rc.maintenance_count(), 1);
        assert_eq!(rc.additional_replica_needed(), 0);
        assert!(rc.is_sufficiently_replicated());
    }

    #[test]
    fn test_maintenance_below_minimum_needs_repair() {
        // Only one healthy copy outside maintenance with m = 2.
        let fixture = Fixture::new(3)
            .with_replica(NodeOperationalState::InService)
            .with_replica(NodeOperationalState::InMaintenance)
            .with_replica(NodeOperationalState::InMaintenance);
        let rc = fixture.count(0, 0, 2);

        assert_eq!(rc.additional_replica_needed(), 1);
        assert!(!rc.is_sufficiently_replicated());
    }

    #[test]
    fn test_unknown_node_counts_nowhere() {
        let mut fixture = Fixture::new(3)
            .with_replica(NodeOperationalState::InService)
            .with_replica(NodeOperationalState::InService);
        // Replica on a node the node manager has never heard of.
        fixture.replicas.push(ContainerReplica::new(
            fixture.container.id,
            DatanodeDetails::random(),
            ReplicaState::Closed,
        ));
        let rc = fixture.count(0, 0, 2);

        assert_eq!(rc.healthy_count(), 2);
        assert_eq!(rc.additional_replica_needed(), 1);
    }

    #[test]
    fn test_unhealthy_state_detected() {
        let mut fixture = Fixture::new(3)
            .with_replica(NodeOperationalState::InService)
            .with_replica(NodeOperationalState::InService)
            .with_replica(NodeOperationalState::InService);
        fixture.replicas[2].state = ReplicaState::QuasiClosed;
        let rc = fixture.count(0, 0, 2);

        assert!(rc.is_sufficiently_replicated());
        assert!(!rc.is_healthy());
    }

    #[test]
    fn test_container_empty() {
        let fixture = Fixture::new(3)
            .with_replica(NodeOperationalState::InService)
            .with_replica(NodeOperationalState::InService);
        assert!(is_container_empty(&fixture.container, &fixture.replicas));

        let used = Fixture::new(3).with_replica(NodeOperationalState::InService);
        let mut container = used.container.clone();
        container.used_bytes = 1024;
        assert!(!is_container_empty(&container, &used.replicas));

        let mut replicas = used.replicas.clone();
        replicas[0].key_count = 4;
        assert!(!is_container_empty(&used.container, &replicas));
    }
}
