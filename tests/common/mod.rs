//! Common test harness for replication integration tests.

use basalt::clock::ManualClock;
use basalt::config::ReplicationConfig;
use basalt::container::{ContainerManager, InMemoryContainerManager};
use basalt::events::{ClusterEvent, EventBus};
use basalt::ha::{ClusterContext, InMemoryMoveTable, LocalConsensus};
use basalt::node::{DatanodeDetails, InMemoryNodeManager, NodeStatus};
use basalt::placement::RackAwarePlacement;
use basalt::replication::{CommandEnvelope, DatanodeCommand, ReplicationManager};
use basalt::types::{ContainerId, ContainerInfo, ContainerReplica, LifecycleState, ReplicaState};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

/// A single-process cluster: in-memory collaborators around a running
/// replication manager, with a subscriber collecting outbound commands.
pub struct Cluster {
    pub manager: Arc<ReplicationManager>,
    pub containers: Arc<InMemoryContainerManager>,
    pub nodes: Arc<InMemoryNodeManager>,
    pub policy: Arc<RackAwarePlacement>,
    pub clock: Arc<ManualClock>,
    pub context: Arc<ClusterContext>,
    pub move_table: Arc<InMemoryMoveTable>,
    events: broadcast::Receiver<ClusterEvent>,
}

impl Cluster {
    pub async fn start() -> Self {
        Self::start_with_config(test_config()).await
    }

    pub async fn start_with_config(config: ReplicationConfig) -> Self {
        let containers = Arc::new(InMemoryContainerManager::new());
        let nodes = Arc::new(InMemoryNodeManager::new());
        let policy = Arc::new(RackAwarePlacement::new());
        let bus = EventBus::new(1024);
        let events = bus.subscribe();
        let context = ClusterContext::leader(1);
        let clock = Arc::new(ManualClock::new(10_000_000));
        let move_table = Arc::new(InMemoryMoveTable::new());

        let manager = ReplicationManager::new(
            config,
            containers.clone(),
            policy.clone(),
            bus,
            context.clone(),
            nodes.clone(),
            clock.clone(),
            Arc::new(LocalConsensus),
            move_table.clone(),
        )
        .expect("valid configuration");
        manager.start();
        manager.notify_status_changed().await;

        Self {
            manager,
            containers,
            nodes,
            policy,
            clock,
            context,
            move_table,
            events,
        }
    }

    /// Start a second manager over the same metadata and move table, as a
    /// freshly elected leader would.
    pub async fn elect_new_leader(&self, term: u64) -> (Arc<ReplicationManager>, broadcast::Receiver<ClusterEvent>) {
        let bus = EventBus::new(1024);
        let events = bus.subscribe();
        let context = ClusterContext::leader(term);

        let manager = ReplicationManager::new(
            test_config(),
            self.containers.clone(),
            self.policy.clone(),
            bus,
            context,
            self.nodes.clone(),
            self.clock.clone(),
            Arc::new(LocalConsensus),
            self.move_table.clone(),
        )
        .expect("valid configuration");
        manager.start();
        manager.notify_status_changed().await;
        (manager, events)
    }

    /// Register a healthy in-service datanode on the given rack.
    pub fn add_datanode(&self, rack: &str) -> DatanodeDetails {
        let datanode = DatanodeDetails::random();
        self.nodes
            .register(&datanode, NodeStatus::healthy_in_service());
        self.policy.register(datanode.clone(), rack);
        datanode
    }

    pub fn set_node_status(&self, datanode: &DatanodeDetails, status: NodeStatus) {
        self.nodes.set_status(datanode, status);
    }

    /// Add a container with the given replicas.
    pub fn add_container(
        &self,
        container: ContainerInfo,
        replicas: Vec<(DatanodeDetails, ReplicaState)>,
    ) -> ContainerId {
        let id = container.id;
        let usage = (container.used_bytes, container.key_count);
        self.containers.add_container(container);
        self.containers.set_replicas(
            id,
            replicas
                .into_iter()
                .map(|(dn, state)| {
                    ContainerReplica::new(id, dn, state).with_usage(usage.0, usage.1)
                })
                .collect(),
        );
        id
    }

    /// The datanode observed the replicate command: a CLOSED replica of the
    /// container appears on it.
    pub fn report_replica(&self, id: ContainerId, datanode: &DatanodeDetails) {
        let container = self.containers.container(id).expect("container exists");
        self.containers.add_replica(
            ContainerReplica::new(id, datanode.clone(), ReplicaState::Closed)
                .with_usage(container.used_bytes, container.key_count),
        );
    }

    /// The datanode observed the delete command: its replica disappears.
    pub fn report_replica_gone(&self, id: ContainerId, datanode: &DatanodeDetails) {
        self.containers.remove_replica(id, datanode);
    }

    /// Collect every datanode command fired since the last drain.
    pub fn drain_commands(&mut self) -> Vec<CommandEnvelope> {
        let mut commands = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            if let ClusterEvent::DatanodeCommand(envelope) = event {
                commands.push(envelope);
            }
        }
        commands
    }

    /// Collect close-container events fired since the last drain.
    pub fn drain_close_events(&mut self) -> Vec<ContainerId> {
        let mut ids = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            if let ClusterEvent::CloseContainer(id) = event {
                ids.push(id);
            }
        }
        ids
    }
}

/// Configuration with no post-safe-mode grace and a short event timeout.
pub fn test_config() -> ReplicationConfig {
    ReplicationConfig {
        interval: Duration::from_secs(300),
        event_timeout: Duration::from_secs(60),
        maintenance_replica_minimum: 2,
        wait_after_safe_mode_exit: Duration::ZERO,
    }
}

/// A CLOSED container carrying data.
pub fn closed_container(id: u64, factor: usize) -> ContainerInfo {
    ContainerInfo::new(ContainerId(id), LifecycleState::Closed, factor).with_usage(1 << 30, 128)
}

pub fn deletes_in(commands: &[CommandEnvelope]) -> Vec<&CommandEnvelope> {
    commands
        .iter()
        .filter(|e| matches!(e.command, DatanodeCommand::DeleteContainer { .. }))
        .collect()
}

pub fn replicates_in(commands: &[CommandEnvelope]) -> Vec<&CommandEnvelope> {
    commands
        .iter()
        .filter(|e| matches!(e.command, DatanodeCommand::ReplicateContainer { .. }))
        .collect()
}

pub fn closes_in(commands: &[CommandEnvelope]) -> Vec<&CommandEnvelope> {
    commands
        .iter()
        .filter(|e| matches!(e.command, DatanodeCommand::CloseContainer { .. }))
        .collect()
}
