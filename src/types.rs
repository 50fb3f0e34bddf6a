//! Core type definitions for the Basalt replication control plane.
//!
//! This module contains the fundamental data types used throughout Basalt:
//! container metadata, replica descriptors, and the lifecycle state machine
//! the replication manager reconciles against.
//!
//! # Key Types
//!
//! - [`ContainerId`]: Unique, totally ordered identifier for a container
//! - [`ContainerInfo`]: Immutable container metadata plus lifecycle state
//! - [`ContainerReplica`]: One instance of a container on one datanode
//! - [`MoveDataNodePair`]: Source/target pair of an in-progress replica move
//!
//! # Lifecycle
//!
//! ```text
//! OPEN ──> CLOSING ──> QUASI_CLOSED ──> CLOSED ──> DELETING ──> DELETED
//! ```
//!
//! The replication manager only actively reconciles `CLOSING`,
//! `QUASI_CLOSED`, `CLOSED` and `DELETING` containers. `OPEN` containers are
//! inspected solely to request a close when unhealthy; `DELETED` is a sink.

use crate::node::DatanodeDetails;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique identifier for a storage container. Totally ordered.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default,
)]
pub struct ContainerId(pub u64);

impl std::fmt::Display for ContainerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Unique identifier for a write pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PipelineId(pub Uuid);

impl PipelineId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for PipelineId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for PipelineId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Block commit sequence id (BCSID). Monotonically increasing version number
/// attached to each replica; `-1` means unknown.
pub type SequenceId = i64;

/// Container lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LifecycleState {
    Open,
    Closing,
    QuasiClosed,
    Closed,
    Deleting,
    Deleted,
}

/// State of a single container replica as reported by its datanode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ReplicaState {
    Open,
    Closing,
    QuasiClosed,
    Closed,
    Unhealthy,
}

/// Compares the container state with a replica state.
///
/// A replica matches only the exact corresponding state; `Deleting` and
/// `Deleted` containers match no replica state.
pub fn compare_state(container_state: LifecycleState, replica_state: ReplicaState) -> bool {
    matches!(
        (container_state, replica_state),
        (LifecycleState::Open, ReplicaState::Open)
            | (LifecycleState::Closing, ReplicaState::Closing)
            | (LifecycleState::QuasiClosed, ReplicaState::QuasiClosed)
            | (LifecycleState::Closed, ReplicaState::Closed)
    )
}

/// Container metadata plus mutable lifecycle state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerInfo {
    pub id: ContainerId,
    pub state: LifecycleState,
    /// Required number of replicas (replication factor k).
    pub replication_factor: usize,
    pub used_bytes: u64,
    pub key_count: u64,
    pub pipeline: PipelineId,
    /// Last known block commit sequence id, `-1` if unknown.
    pub sequence_id: SequenceId,
}

impl ContainerInfo {
    pub fn new(id: ContainerId, state: LifecycleState, replication_factor: usize) -> Self {
        Self {
            id,
            state,
            replication_factor,
            used_bytes: 0,
            key_count: 0,
            pipeline: PipelineId::new(),
            sequence_id: -1,
        }
    }

    pub fn with_usage(mut self, used_bytes: u64, key_count: u64) -> Self {
        self.used_bytes = used_bytes;
        self.key_count = key_count;
        self
    }

    pub fn with_sequence_id(mut self, sequence_id: SequenceId) -> Self {
        self.sequence_id = sequence_id;
        self
    }
}

/// One instance of a container hosted on one datanode.
///
/// `origin_node` identifies the datanode lineage this replica descends from,
/// which is not necessarily its current location.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerReplica {
    pub container_id: ContainerId,
    pub datanode: DatanodeDetails,
    pub state: ReplicaState,
    pub bytes_used: u64,
    pub key_count: u64,
    pub sequence_id: SequenceId,
    pub origin_node: crate::node::DatanodeId,
}

impl ContainerReplica {
    pub fn new(container_id: ContainerId, datanode: DatanodeDetails, state: ReplicaState) -> Self {
        let origin_node = datanode.id;
        Self {
            container_id,
            datanode,
            state,
            bytes_used: 0,
            key_count: 0,
            sequence_id: -1,
            origin_node,
        }
    }

    pub fn with_usage(mut self, bytes_used: u64, key_count: u64) -> Self {
        self.bytes_used = bytes_used;
        self.key_count = key_count;
        self
    }

    pub fn with_sequence_id(mut self, sequence_id: SequenceId) -> Self {
        self.sequence_id = sequence_id;
        self
    }

    pub fn with_origin(mut self, origin: crate::node::DatanodeId) -> Self {
        self.origin_node = origin;
        self
    }
}

/// Source and target datanodes of an in-progress replica move.
///
/// Persisted through the move table, so the record survives leader
/// re-election.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MoveDataNodePair {
    pub src: DatanodeDetails,
    pub tgt: DatanodeDetails,
}

impl MoveDataNodePair {
    pub fn new(src: DatanodeDetails, tgt: DatanodeDetails) -> Self {
        Self { src, tgt }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::DatanodeDetails;

    #[test]
    fn test_container_id_ordering() {
        assert!(ContainerId(1) < ContainerId(2));
        assert_eq!(ContainerId(7).to_string(), "#7");
    }

    #[test]
    fn test_compare_state_exact_match() {
        assert!(compare_state(LifecycleState::Open, ReplicaState::Open));
        assert!(compare_state(LifecycleState::Closed, ReplicaState::Closed));
        assert!(!compare_state(LifecycleState::Closed, ReplicaState::QuasiClosed));
        assert!(!compare_state(LifecycleState::Open, ReplicaState::Closing));
    }

    #[test]
    fn test_compare_state_terminal_states_match_nothing() {
        for rs in [
            ReplicaState::Open,
            ReplicaState::Closing,
            ReplicaState::QuasiClosed,
            ReplicaState::Closed,
            ReplicaState::Unhealthy,
        ] {
            assert!(!compare_state(LifecycleState::Deleting, rs));
            assert!(!compare_state(LifecycleState::Deleted, rs));
        }
    }

    #[test]
    fn test_replica_defaults_origin_to_host() {
        let dn = DatanodeDetails::random();
        let replica = ContainerReplica::new(ContainerId(1), dn.clone(), ReplicaState::Closed);
        assert_eq!(replica.origin_node, dn.id);
        assert_eq!(replica.sequence_id, -1);
    }

    #[test]
    fn test_move_pair_roundtrip() {
        let pair = MoveDataNodePair::new(DatanodeDetails::random(), DatanodeDetails::random());
        let bytes = bincode::serialize(&pair).unwrap();
        let back: MoveDataNodePair = bincode::deserialize(&bytes).unwrap();
        assert_eq!(pair, back);
    }
}
