//! Datanode identity and status tracking.
//!
//! The replication manager never talks to datanodes directly; it looks up
//! their operational state and health through a [`NodeManager`] and addresses
//! commands to them over the event bus. Heartbeat ingestion and the state
//! transitions themselves live outside this crate.

use crate::error::{BasaltError, Result};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// Unique identifier for a datanode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DatanodeId(pub Uuid);

impl DatanodeId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for DatanodeId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for DatanodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Descriptor of a datanode.
///
/// Equality and hashing consider only the node id, so two descriptors of the
/// same node collapse in sets and maps even if their addresses differ.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatanodeDetails {
    pub id: DatanodeId,
    pub address: String,
}

impl DatanodeDetails {
    pub fn new(id: DatanodeId, address: impl Into<String>) -> Self {
        Self {
            id,
            address: address.into(),
        }
    }

    /// A fresh datanode with a random id. Handy in tests and simulations.
    pub fn random() -> Self {
        let id = DatanodeId::new();
        let address = format!("{}.datanode.basalt", id.0.simple());
        Self { id, address }
    }
}

impl PartialEq for DatanodeDetails {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for DatanodeDetails {}

impl std::hash::Hash for DatanodeDetails {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl std::fmt::Display for DatanodeDetails {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}({})", self.id, self.address)
    }
}

/// Liveness of a datanode as judged by heartbeat tracking.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NodeHealth {
    Healthy,
    Stale,
    Dead,
}

/// Administrative state of a datanode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NodeOperationalState {
    InService,
    Decommissioning,
    Decommissioned,
    EnteringMaintenance,
    InMaintenance,
}

impl NodeOperationalState {
    /// True for both decommissioning and decommissioned nodes.
    pub fn is_decommission(&self) -> bool {
        matches!(
            self,
            NodeOperationalState::Decommissioning | NodeOperationalState::Decommissioned
        )
    }

    /// True for nodes entering or in maintenance.
    pub fn is_maintenance(&self) -> bool {
        matches!(
            self,
            NodeOperationalState::EnteringMaintenance | NodeOperationalState::InMaintenance
        )
    }
}

/// Combined operational state and health of a datanode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeStatus {
    pub operational: NodeOperationalState,
    pub health: NodeHealth,
}

impl NodeStatus {
    pub fn new(operational: NodeOperationalState, health: NodeHealth) -> Self {
        Self {
            operational,
            health,
        }
    }

    /// Healthy and in service.
    pub fn healthy_in_service() -> Self {
        Self::new(NodeOperationalState::InService, NodeHealth::Healthy)
    }

    pub fn is_healthy(&self) -> bool {
        self.health == NodeHealth::Healthy
    }

    pub fn is_in_service(&self) -> bool {
        self.operational == NodeOperationalState::InService
    }
}

/// Lookup of datanode status. Implemented by the node-management subsystem;
/// an in-memory registry is provided for tests and embedding.
pub trait NodeManager: Send + Sync {
    /// Current status of the given datanode.
    fn node_status(&self, datanode: &DatanodeDetails) -> Result<NodeStatus>;
}

/// In-memory node registry.
pub struct InMemoryNodeManager {
    nodes: RwLock<HashMap<DatanodeId, NodeStatus>>,
}

impl InMemoryNodeManager {
    pub fn new() -> Self {
        Self {
            nodes: RwLock::new(HashMap::new()),
        }
    }

    /// Register a node, replacing any previous status.
    pub fn register(&self, datanode: &DatanodeDetails, status: NodeStatus) {
        self.nodes.write().insert(datanode.id, status);
    }

    /// Update the status of a known node.
    pub fn set_status(&self, datanode: &DatanodeDetails, status: NodeStatus) {
        self.nodes.write().insert(datanode.id, status);
    }

    /// Forget a node entirely.
    pub fn remove(&self, datanode: &DatanodeDetails) {
        self.nodes.write().remove(&datanode.id);
    }

    pub fn len(&self) -> usize {
        self.nodes.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.read().is_empty()
    }
}

impl Default for InMemoryNodeManager {
    fn default() -> Self {
        Self::new()
    }
}

impl NodeManager for InMemoryNodeManager {
    fn node_status(&self, datanode: &DatanodeDetails) -> Result<NodeStatus> {
        self.nodes
            .read()
            .get(&datanode.id)
            .copied()
            .ok_or(BasaltError::NodeNotFound(datanode.id))
    }
}
