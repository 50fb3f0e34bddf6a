//! Outbound datanode commands.
//!
//! Commands are delivered through the cluster event bus wrapped in a
//! [`CommandEnvelope`] carrying the leader term of the issuing epoch and a
//! container token, so datanodes can reject instructions from stale leaders.
//! The wire encoding of commands is owned by the transport layer, not by
//! this crate.

use crate::node::DatanodeDetails;
use crate::types::{ContainerId, PipelineId};

/// A command the replication manager can issue to a datanode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DatanodeCommand {
    /// Close the local replica. `force` closes a QUASI_CLOSED replica.
    CloseContainer {
        container_id: ContainerId,
        pipeline: PipelineId,
        force: bool,
    },
    /// Fetch a replica of the container from one of `sources`.
    ReplicateContainer {
        container_id: ContainerId,
        sources: Vec<DatanodeDetails>,
    },
    /// Delete the local replica. `force` deletes a replica that is not
    /// CLOSED.
    DeleteContainer {
        container_id: ContainerId,
        force: bool,
    },
}

impl DatanodeCommand {
    pub fn container_id(&self) -> ContainerId {
        match self {
            DatanodeCommand::CloseContainer { container_id, .. }
            | DatanodeCommand::ReplicateContainer { container_id, .. }
            | DatanodeCommand::DeleteContainer { container_id, .. } => *container_id,
        }
    }
}

/// A command addressed to one datanode, stamped with the leader term.
#[derive(Debug, Clone)]
pub struct CommandEnvelope {
    pub target: DatanodeDetails,
    pub term: u64,
    pub token: String,
    pub command: DatanodeCommand,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_container_id_accessor() {
        let id = ContainerId(42);
        let close = DatanodeCommand::CloseContainer {
            container_id: id,
            pipeline: PipelineId::new(),
            force: false,
        };
        let replicate = DatanodeCommand::ReplicateContainer {
            container_id: id,
            sources: vec![],
        };
        let delete = DatanodeCommand::DeleteContainer {
            container_id: id,
            force: true,
        };
        assert_eq!(close.container_id(), id);
        assert_eq!(replicate.container_id(), id);
        assert_eq!(delete.container_id(), id);
    }
}
