//! Container metadata access.
//!
//! The replication manager reads container and replica snapshots through a
//! [`ContainerManager`] and requests lifecycle transitions through it. The
//! authoritative metadata store lives outside this crate; the in-memory
//! implementation here backs tests and single-process embedding.

use crate::error::{BasaltError, Result};
use crate::types::{ContainerId, ContainerInfo, ContainerReplica, LifecycleState};
use parking_lot::RwLock;
use std::collections::BTreeMap;

/// Lifecycle events the replication manager may request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleEvent {
    /// `CLOSED -> DELETING`, issued once an empty container's replicas are
    /// scheduled for deletion.
    Delete,
    /// `DELETING -> DELETED`, issued once no replicas remain.
    Cleanup,
}

/// Access to container metadata and replica reports.
pub trait ContainerManager: Send + Sync {
    /// Snapshot of every known container.
    fn containers(&self) -> Vec<ContainerInfo>;

    /// Snapshot of a single container.
    fn container(&self, id: ContainerId) -> Result<ContainerInfo>;

    /// Snapshot of the known replicas of a container.
    fn container_replicas(&self, id: ContainerId) -> Result<Vec<ContainerReplica>>;

    /// Apply a lifecycle event to a container.
    fn update_container_state(&self, id: ContainerId, event: LifecycleEvent) -> Result<()>;
}

struct ContainerRecord {
    info: ContainerInfo,
    replicas: Vec<ContainerReplica>,
}

/// In-memory container store with checked lifecycle transitions.
pub struct InMemoryContainerManager {
    containers: RwLock<BTreeMap<ContainerId, ContainerRecord>>,
}

impl InMemoryContainerManager {
    pub fn new() -> Self {
        Self {
            containers: RwLock::new(BTreeMap::new()),
        }
    }

    /// Insert or replace a container.
    pub fn add_container(&self, info: ContainerInfo) {
        self.containers.write().insert(
            info.id,
            ContainerRecord {
                info,
                replicas: Vec::new(),
            },
        );
    }

    /// Replace the replica set of a container.
    pub fn set_replicas(&self, id: ContainerId, replicas: Vec<ContainerReplica>) {
        if let Some(record) = self.containers.write().get_mut(&id) {
            record.replicas = replicas;
        }
    }

    /// Add a single replica report.
    pub fn add_replica(&self, replica: ContainerReplica) {
        if let Some(record) = self.containers.write().get_mut(&replica.container_id) {
            record.replicas.retain(|r| r.datanode != replica.datanode);
            record.replicas.push(replica);
        }
    }

    /// Drop the replica hosted by the given datanode, if present.
    pub fn remove_replica(&self, id: ContainerId, datanode: &crate::node::DatanodeDetails) {
        if let Some(record) = self.containers.write().get_mut(&id) {
            record.replicas.retain(|r| r.datanode != *datanode);
        }
    }

    /// Remove a container entirely.
    pub fn remove_container(&self, id: ContainerId) {
        self.containers.write().remove(&id);
    }
}

impl Default for InMemoryContainerManager {
    fn default() -> Self {
        Self::new()
    }
}

impl ContainerManager for InMemoryContainerManager {
    fn containers(&self) -> Vec<ContainerInfo> {
        self.containers
            .read()
            .values()
            .map(|r| r.info.clone())
            .collect()
    }

    fn container(&self, id: ContainerId) -> Result<ContainerInfo> {
        self.containers
            .read()
            .get(&id)
            .map(|r| r.info.clone())
            .ok_or(BasaltError::ContainerNotFound(id))
    }

    fn container_replicas(&self, id: ContainerId) -> Result<Vec<ContainerReplica>> {
        self.containers
            .read()
            .get(&id)
            .map(|r| r.replicas.clone())
            .ok_or(BasaltError::ContainerNotFound(id))
    }

    fn update_container_state(&self, id: ContainerId, event: LifecycleEvent) -> Result<()> {
        let mut containers = self.containers.write();
        let record = containers
            .get_mut(&id)
            .ok_or(BasaltError::ContainerNotFound(id))?;

        let next = match (record.info.state, event) {
            (LifecycleState::Closed, LifecycleEvent::Delete) => LifecycleState::Deleting,
            (LifecycleState::Deleting, LifecycleEvent::Cleanup) => LifecycleState::Deleted,
            (state, event) => {
                return Err(BasaltError::InvalidStateTransition {
                    container: id,
                    state: format!("{:?}", state),
                    event: format!("{:?}", event),
                })
            }
        };
        record.info.state = next;
        Ok(())
    }
}
