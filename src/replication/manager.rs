//! The replication manager.
//!
//! A single long-running monitor wakes at a configured interval, walks every
//! container, and drives each toward its desired replication state: closing
//! containers whose replicas diverge, creating replicas for under-replicated
//! containers, trimming surplus replicas, and cleaning up deleted
//! containers. User-requested replica moves are layered on top as
//! replicate-then-delete, with the delete gated by the placement policy.
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                    Replication Manager                       │
//! ├──────────────────────────────────────────────────────────────┤
//! │ Monitor loop │ Container processing │ Move orchestration     │
//! ├──────────────────────────────────────────────────────────────┤
//! │ ReplicaCount │ PlacementEvaluator │ InflightMap │ Scheduler  │
//! ├──────────────────────────────────────────────────────────────┤
//! │        Event bus (close / replicate / delete commands)       │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! All decisions about one container run under that container's mutex, which
//! is shared with the replica-report and move entry points, so the monitor
//! never races a concurrent view of the same container.

use crate::clock::Clock;
use crate::config::ReplicationConfig;
use crate::container::{ContainerManager, LifecycleEvent};
use crate::error::{BasaltError, Result};
use crate::events::{ClusterEvent, EventBus};
use crate::ha::{ClusterContext, ConsensusLog, MoveTable, ServiceStateTracker};
use crate::node::{DatanodeDetails, NodeManager, NodeStatus};
use crate::placement::{PlacementEvaluator, PlacementPolicy, PlacementStatus};
use crate::replication::commands::{CommandEnvelope, DatanodeCommand};
use crate::replication::inflight::{InflightAction, InflightMap};
use crate::replication::metrics::ReplicationMetrics;
use crate::replication::move_scheduler::MoveScheduler;
use crate::replication::replica_count::{is_container_empty, ReplicaCount};
use crate::types::{
    compare_state, ContainerId, ContainerInfo, ContainerReplica, LifecycleState,
    MoveDataNodePair, ReplicaState,
};
use futures::FutureExt;
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, HashSet};
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{oneshot, watch};
use tracing::{debug, error, info, warn};

/// Terminal outcome of a move request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MoveResult {
    /// Replication and deletion both finished.
    Completed,
    /// The replication manager is not running.
    FailNotRunning,
    /// This node is not the control-plane leader.
    FailNotLeader,
    /// The container has no replica on the source datanode.
    ReplicationFailNotExistInSource,
    /// The container already has a replica on the target datanode.
    ReplicationFailExistInTarget,
    /// The container is not CLOSED.
    ReplicationFailContainerNotClosed,
    /// The container has a deletion inflight.
    ReplicationFailInflightDeletion,
    /// The container has a replication inflight.
    ReplicationFailInflightReplication,
    /// The replication to the target timed out.
    ReplicationFailTimeout,
    /// The target left the IN_SERVICE state.
    ReplicationFailNodeNotInService,
    /// The target became unhealthy.
    ReplicationFailNodeUnhealthy,
    /// The source left the IN_SERVICE state during deletion.
    DeletionFailNodeNotInService,
    /// The deletion of the source timed out.
    DeletionFailTimeout,
    /// The source became unhealthy during deletion.
    DeletionFailNodeUnhealthy,
    /// Replication succeeded but deleting the source would violate the
    /// placement policy or the replication factor.
    DeleteFailPolicy,
    /// Replicas plus target minus source would violate the placement policy.
    PlacementPolicyNotSatisfied,
    /// The move source vanished from the replication inflight list.
    UnexpectedRemoveSourceAtInflightReplication,
    /// The move target vanished from the deletion inflight list.
    UnexpectedRemoveTargetAtInflightDeletion,
    /// The move record could not be committed to the move table.
    FailCanNotRecordToDb,
}

/// Resolves with the terminal [`MoveResult`] of a move request.
pub type MoveFuture = oneshot::Receiver<MoveResult>;

fn resolved(result: MoveResult) -> MoveFuture {
    let (tx, rx) = oneshot::channel();
    let _ = tx.send(result);
    rx
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum InflightKind {
    Replication,
    Deletion,
}

#[derive(Debug, Clone, Copy, Default)]
struct RemovalFlags {
    completed: bool,
    timeout: bool,
    unhealthy: bool,
    not_in_service: bool,
}

/// Per-container mutexes, created on first use.
struct ContainerLocks {
    inner: RwLock<HashMap<ContainerId, Arc<tokio::sync::Mutex<()>>>>,
}

impl ContainerLocks {
    fn new() -> Self {
        Self {
            inner: RwLock::new(HashMap::new()),
        }
    }

    fn get(&self, id: ContainerId) -> Arc<tokio::sync::Mutex<()>> {
        if let Some(lock) = self.inner.read().get(&id) {
            return lock.clone();
        }
        self.inner.write().entry(id).or_default().clone()
    }
}

/// The replication manager. See the module documentation.
pub struct ReplicationManager {
    config: ReplicationConfig,
    containers: Arc<dyn ContainerManager>,
    placement: PlacementEvaluator,
    event_bus: Arc<EventBus>,
    context: Arc<ClusterContext>,
    nodes: Arc<dyn NodeManager>,
    clock: Arc<dyn Clock>,
    metrics: Arc<ReplicationMetrics>,
    inflight_replication: InflightMap,
    inflight_deletion: InflightMap,
    move_futures: Mutex<HashMap<ContainerId, oneshot::Sender<MoveResult>>>,
    move_scheduler: MoveScheduler,
    locks: ContainerLocks,
    running: AtomicBool,
    service: ServiceStateTracker,
    shutdown: watch::Sender<bool>,
}

impl ReplicationManager {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: ReplicationConfig,
        containers: Arc<dyn ContainerManager>,
        placement: Arc<dyn PlacementPolicy>,
        event_bus: Arc<EventBus>,
        context: Arc<ClusterContext>,
        nodes: Arc<dyn NodeManager>,
        clock: Arc<dyn Clock>,
        consensus: Arc<dyn ConsensusLog>,
        move_table: Arc<dyn MoveTable>,
    ) -> Result<Arc<Self>> {
        config.validate()?;
        let (shutdown, _) = watch::channel(false);
        Ok(Arc::new(Self {
            config,
            containers,
            placement: PlacementEvaluator::new(placement),
            event_bus,
            context,
            nodes,
            clock,
            metrics: Arc::new(ReplicationMetrics::new()),
            inflight_replication: InflightMap::new(),
            inflight_deletion: InflightMap::new(),
            move_futures: Mutex::new(HashMap::new()),
            move_scheduler: MoveScheduler::new(consensus, move_table)?,
            locks: ContainerLocks::new(),
            running: AtomicBool::new(false),
            service: ServiceStateTracker::new(),
            shutdown,
        }))
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    /// Start the replication monitor.
    pub fn start(self: &Arc<Self>) {
        if self.running.swap(true, Ordering::SeqCst) {
            info!("Replication monitor is already running");
            return;
        }
        info!("Starting replication monitor");
        let _ = self.shutdown.send(false);
        let this = Arc::clone(self);
        tokio::spawn(async move {
            this.run_monitor().await;
        });
    }

    /// Stop the replication monitor and drop all inflight bookkeeping.
    /// Pending move futures are left unresolved; the next leader resolves
    /// them through recovery.
    pub fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            info!("Replication monitor is not running");
            return;
        }
        info!("Stopping replication monitor");
        self.inflight_replication.clear();
        self.inflight_deletion.clear();
        let _ = self.shutdown.send(true);
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    async fn run_monitor(self: Arc<Self>) {
        let mut shutdown = self.shutdown.subscribe();
        let mut ticker = tokio::time::interval(self.config.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let cycle = AssertUnwindSafe(self.process_all()).catch_unwind().await;
                    if cycle.is_err() {
                        // A broken monitor must not stall cluster-wide
                        // reconciliation silently.
                        error!("Replication monitor cycle panicked, terminating");
                        std::process::exit(1);
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        info!("Replication monitor stopped");
    }

    /// Process every container now and wait for completion. The monitor
    /// calls this once per interval; tests call it directly.
    pub async fn process_all(&self) {
        let start = self.clock.millis();
        let containers = self.containers.containers();
        let count = containers.len();
        for container in containers {
            self.process_container(container).await;
        }
        info!(
            elapsed_ms = self.clock.millis().saturating_sub(start),
            containers = count,
            "Replication monitor processed all containers"
        );
    }

    /// Leader/safe-mode transition notification from the HA layer.
    pub async fn notify_status_changed(&self) {
        if self.context.is_leader_ready() && !self.context.is_in_safe_mode() {
            if self.service.mark_running(self.clock.as_ref()) {
                info!("Replication manager transitions to RUNNING");
                self.on_leader_ready().await;
            }
        } else {
            self.service.mark_pausing();
        }
    }

    /// Whether the monitor should take action: the service is RUNNING and
    /// the post-safe-mode grace period has elapsed.
    pub fn should_run(&self) -> bool {
        self.service.ready_for(
            self.clock.as_ref(),
            self.config.wait_after_safe_mode_exit.as_millis() as u64,
        )
    }

    // ------------------------------------------------------------------
    // Introspection
    // ------------------------------------------------------------------

    pub fn metrics(&self) -> &Arc<ReplicationMetrics> {
        &self.metrics
    }

    pub fn inflight_replication(&self) -> HashMap<ContainerId, Vec<InflightAction>> {
        self.inflight_replication.snapshot()
    }

    pub fn inflight_deletion(&self) -> HashMap<ContainerId, Vec<InflightAction>> {
        self.inflight_deletion.snapshot()
    }

    pub fn inflight_move(&self) -> HashMap<ContainerId, MoveDataNodePair> {
        self.move_scheduler.inflight_moves()
    }

    pub fn move_scheduler(&self) -> &MoveScheduler {
        &self.move_scheduler
    }

    pub fn is_container_replicating_or_deleting(&self, id: ContainerId) -> bool {
        self.inflight_replication.contains(id) || self.inflight_deletion.contains(id)
    }

    /// Replica arithmetic for a container id.
    pub async fn container_replica_count(&self, id: ContainerId) -> Result<ReplicaCount> {
        let container = self.containers.container(id)?;
        self.container_replica_count_of(&container).await
    }

    /// Replica arithmetic for an already fetched container.
    pub async fn container_replica_count_of(
        &self,
        container: &ContainerInfo,
    ) -> Result<ReplicaCount> {
        let lock = self.locks.get(container.id);
        let _guard = lock.lock().await;
        let replicas = self.containers.container_replicas(container.id)?;
        Ok(self.replica_count(container, &replicas))
    }

    fn replica_count(
        &self,
        container: &ContainerInfo,
        replicas: &[ContainerReplica],
    ) -> ReplicaCount {
        ReplicaCount::new(
            container.clone(),
            replicas.to_vec(),
            self.nodes.as_ref(),
            self.inflight_replication.count(container.id),
            self.inflight_deletion.count(container.id),
            self.config.maintenance_replica_minimum,
        )
    }

    // ------------------------------------------------------------------
    // Container processing
    // ------------------------------------------------------------------

    async fn process_container(&self, container: ContainerInfo) {
        if !self.should_run() {
            return;
        }
        let id = container.id;
        let lock = self.locks.get(id);
        let _guard = lock.lock().await;
        match self.process_container_locked(&container).await {
            Ok(()) => {}
            Err(BasaltError::ContainerNotFound(_)) => {
                warn!(container_id = %id, "Missing container");
            }
            Err(e) => {
                warn!(container_id = %id, error = %e, "Failed to process container");
            }
        }
    }

    async fn process_container_locked(&self, container: &ContainerInfo) -> Result<()> {
        let id = container.id;
        let replicas = self.containers.container_replicas(id)?;

        // An OPEN container is left alone while healthy; divergent replicas
        // trigger a close request instead of repair.
        if container.state == LifecycleState::Open {
            if !self.is_open_container_healthy(container, &replicas) {
                self.event_bus.fire(ClusterEvent::CloseContainer(id));
            }
            return Ok(());
        }

        // CLOSING replicas may still be OPEN or CLOSING; in either case the
        // close command is resent.
        if container.state == LifecycleState::Closing {
            for replica in &replicas {
                self.send_close_command(container, &replica.datanode, false);
            }
            return Ok(());
        }

        if container.state == LifecycleState::QuasiClosed
            && self.can_force_close(container, &replicas)
        {
            self.force_close(container, &replicas);
            return Ok(());
        }

        // Reconcile the inflight bookkeeping against the freshly fetched
        // replicas before classifying the container.
        self.update_inflight_action(container, InflightKind::Replication, &replicas)
            .await;
        self.update_inflight_action(container, InflightKind::Deletion, &replicas)
            .await;

        if container.state == LifecycleState::Deleting {
            return self.handle_container_under_delete(container, &replicas);
        }
        if container.state == LifecycleState::Deleted {
            return Ok(());
        }

        let replica_set = self.replica_count(container, &replicas);
        let placement_status = self
            .placement
            .placement_of(&replicas, container.replication_factor);

        if is_container_empty(container, &replicas) {
            return self.delete_container_replicas(container, &replicas);
        }

        if !replica_set.is_sufficiently_replicated()
            || !placement_status.is_policy_satisfied()
        {
            self.handle_under_replicated(container, &replica_set, &placement_status);
            return Ok(());
        }

        if replica_set.is_over_replicated() {
            self.handle_over_replicated(container, &replica_set);
            return Ok(());
        }

        if !replica_set.is_healthy() {
            self.handle_unstable_container(container, &replicas);
        }
        Ok(())
    }

    fn is_open_container_healthy(
        &self,
        container: &ContainerInfo,
        replicas: &[ContainerReplica],
    ) -> bool {
        replicas
            .iter()
            .all(|r| compare_state(container.state, r.state))
    }

    /// True when more than half of the replicas with distinct origins are
    /// QUASI_CLOSED, i.e. a quorum of lineages has sealed its data.
    fn can_force_close(&self, container: &ContainerInfo, replicas: &[ContainerReplica]) -> bool {
        let factor = container.replication_factor;
        let unique_quasi_closed = replicas
            .iter()
            .filter(|r| r.state == ReplicaState::QuasiClosed)
            .map(|r| r.origin_node)
            .collect::<HashSet<_>>()
            .len();
        unique_quasi_closed > factor / 2
    }

    /// Force-close the QUASI_CLOSED replicas carrying the highest sequence
    /// id.
    fn force_close(&self, container: &ContainerInfo, replicas: &[ContainerReplica]) {
        let quasi_closed: Vec<&ContainerReplica> = replicas
            .iter()
            .filter(|r| r.state == ReplicaState::QuasiClosed)
            .collect();

        let sequence_id = quasi_closed
            .iter()
            .map(|r| r.sequence_id)
            .max()
            .unwrap_or(-1);

        info!(
            container_id = %container.id,
            sequence_id,
            "Force closing QUASI_CLOSED container"
        );

        if sequence_id == -1 {
            return;
        }
        for replica in quasi_closed {
            if replica.sequence_id == sequence_id {
                self.send_close_command(container, &replica.datanode, true);
            }
        }
    }

    fn handle_container_under_delete(
        &self,
        container: &ContainerInfo,
        replicas: &[ContainerReplica],
    ) -> Result<()> {
        let id = container.id;
        if replicas.is_empty() {
            self.containers
                .update_container_state(id, LifecycleEvent::Cleanup)?;
            debug!(container_id = %id, "Container state changes to DELETED");
        } else {
            let deletion_in_flight = self.inflight_deletion.datanodes(id);
            let mut resent = false;
            for replica in replicas {
                if !deletion_in_flight.contains(&replica.datanode) {
                    self.send_delete_command(container, &replica.datanode, false);
                    resent = true;
                }
            }
            if resent {
                debug!(container_id = %id, "Resent delete container command");
            }
        }
        Ok(())
    }

    /// Schedule deletion of every replica of an empty container and move it
    /// to DELETING.
    fn delete_container_replicas(
        &self,
        container: &ContainerInfo,
        replicas: &[ContainerReplica],
    ) -> Result<()> {
        debug_assert!(container.state == LifecycleState::Closed);
        debug_assert!(container.used_bytes == 0 && container.key_count == 0);

        for replica in replicas {
            self.send_delete_command(container, &replica.datanode, false);
        }
        self.containers
            .update_container_state(container.id, LifecycleEvent::Delete)?;
        debug!(container_id = %container.id, "Deleting empty container replicas");
        Ok(())
    }

    // ------------------------------------------------------------------
    // Inflight reconciliation
    // ------------------------------------------------------------------

    fn inflight_map(&self, kind: InflightKind) -> &InflightMap {
        match kind {
            InflightKind::Replication => &self.inflight_replication,
            InflightKind::Deletion => &self.inflight_deletion,
        }
    }

    async fn update_inflight_action(
        &self,
        container: &ContainerInfo,
        kind: InflightKind,
        replicas: &[ContainerReplica],
    ) {
        let id = container.id;
        let map = self.inflight_map(kind);
        let actions = map.actions(id);
        if actions.is_empty() {
            return;
        }

        let deadline = self
            .clock
            .millis()
            .saturating_sub(self.config.event_timeout.as_millis() as u64);

        for action in actions {
            let status = match self.nodes.node_status(&action.datanode) {
                Ok(status) => status,
                Err(_) => {
                    // The node vanished from the node manager: drop the
                    // action silently.
                    map.remove(id, &action.datanode);
                    continue;
                }
            };

            let on_replica = replicas.iter().any(|r| r.datanode == action.datanode);
            let flags = RemovalFlags {
                completed: match kind {
                    InflightKind::Replication => on_replica,
                    InflightKind::Deletion => !on_replica,
                },
                timeout: action.issued_at < deadline,
                unhealthy: !status.is_healthy(),
                not_in_service: !status.is_in_service(),
            };

            if !(flags.completed || flags.timeout || flags.unhealthy || flags.not_in_service) {
                continue;
            }
            map.remove(id, &action.datanode);

            if flags.timeout {
                match kind {
                    InflightKind::Replication => self.metrics.incr_replication_cmds_timeout(),
                    InflightKind::Deletion => self.metrics.incr_deletion_cmds_timeout(),
                }
            } else if flags.completed {
                match kind {
                    InflightKind::Replication => {
                        self.metrics.incr_replication_cmds_completed();
                        self.metrics
                            .incr_replication_bytes_completed(container.used_bytes);
                    }
                    InflightKind::Deletion => self.metrics.incr_deletion_cmds_completed(),
                }
            }

            if let Err(e) = self
                .update_move_if_needed(flags, container, &action.datanode, kind)
                .await
            {
                warn!(
                    container_id = %id,
                    error = %e,
                    "Failed to update move after inflight removal"
                );
            }
        }
    }

    // ------------------------------------------------------------------
    // Move orchestration
    // ------------------------------------------------------------------

    /// Request that the container's replica on `src` be migrated to `tgt`.
    ///
    /// The returned future resolves exactly once with the terminal
    /// [`MoveResult`]. Unknown containers and datanodes are errors; every
    /// other failed precondition resolves the future instead.
    pub async fn move_container(
        &self,
        id: ContainerId,
        src: DatanodeDetails,
        tgt: DatanodeDetails,
    ) -> Result<MoveFuture> {
        if !self.is_running() {
            return Ok(resolved(MoveResult::FailNotRunning));
        }
        if !self.context.is_leader() {
            return Ok(resolved(MoveResult::FailNotLeader));
        }

        for datanode in [&src, &tgt] {
            let status = self.nodes.node_status(datanode)?;
            if !status.is_healthy() {
                return Ok(resolved(MoveResult::ReplicationFailNodeUnhealthy));
            }
            if !status.is_in_service() {
                return Ok(resolved(MoveResult::ReplicationFailNodeNotInService));
            }
        }

        let container = self.containers.container(id)?;
        let lock = self.locks.get(id);
        let _guard = lock.lock().await;

        let replicas = self.containers.container_replicas(id)?;
        if replicas.iter().any(|r| r.datanode == tgt) {
            return Ok(resolved(MoveResult::ReplicationFailExistInTarget));
        }
        if !replicas.iter().any(|r| r.datanode == src) {
            return Ok(resolved(MoveResult::ReplicationFailNotExistInSource));
        }

        // A container already being replicated or deleted has a
        // non-deterministic replica count; refuse the move for this round.
        if self.inflight_replication.contains(id) {
            return Ok(resolved(MoveResult::ReplicationFailInflightReplication));
        }
        if self.inflight_deletion.contains(id) {
            return Ok(resolved(MoveResult::ReplicationFailInflightDeletion));
        }

        if container.state != LifecycleState::Closed {
            return Ok(resolved(MoveResult::ReplicationFailContainerNotClosed));
        }

        if !self.is_policy_satisfied_after_move(&container, &src, &tgt, &replicas) {
            return Ok(resolved(MoveResult::PlacementPolicyNotSatisfied));
        }

        let pair = MoveDataNodePair::new(src.clone(), tgt.clone());
        if let Err(e) = self.move_scheduler.start_move(id, pair).await {
            warn!(container_id = %id, error = %e, "Failed to record move");
            return Ok(resolved(MoveResult::FailCanNotRecordToDb));
        }

        let (tx, rx) = oneshot::channel();
        self.move_futures.lock().entry(id).or_insert(tx);
        self.send_replicate_command(&container, &tgt, vec![src.clone()]);

        info!(
            container_id = %id,
            src = %src,
            tgt = %tgt,
            "Received a move request"
        );
        Ok(rx)
    }

    /// Whether `{replicas − src + tgt}` satisfies the placement policy.
    fn is_policy_satisfied_after_move(
        &self,
        container: &ContainerInfo,
        src: &DatanodeDetails,
        tgt: &DatanodeDetails,
        replicas: &[ContainerReplica],
    ) -> bool {
        let mut moved: Vec<ContainerReplica> = replicas
            .iter()
            .filter(|r| r.datanode != *src)
            .cloned()
            .collect();
        moved.push(ContainerReplica::new(
            container.id,
            tgt.clone(),
            ReplicaState::Closed,
        ));
        self.placement
            .placement_of(&moved, container.replication_factor)
            .is_policy_satisfied()
    }

    /// Resolve the pending future of a move at most once; callers racing on
    /// the same container see an absent entry and become no-ops.
    fn complete_move_future(&self, id: ContainerId, result: MoveResult) {
        if let Some(sender) = self.move_futures.lock().remove(&id) {
            let _ = sender.send(result);
            info!(container_id = %id, result = ?result, "Move finished");
        }
    }

    async fn complete_move(&self, id: ContainerId) {
        if let Err(e) = self.move_scheduler.complete_move(id).await {
            warn!(container_id = %id, error = %e, "Failed to complete move record");
        }
    }

    /// Hook invoked whenever an inflight entry belonging to an active move
    /// is removed.
    ///
    /// ```text
    ///                  | inflight replication | inflight deletion |
    /// -----------------+----------------------+-------------------+
    ///  source removed  |      unexpected      |     expected      |
    ///  target removed  |      expected        |    unexpected     |
    /// ```
    async fn update_move_if_needed(
        &self,
        flags: RemovalFlags,
        container: &ContainerInfo,
        datanode: &DatanodeDetails,
        kind: InflightKind,
    ) -> Result<()> {
        let id = container.id;
        let Some(pair) = self.move_scheduler.get(id) else {
            return Ok(());
        };
        let is_source = pair.src == *datanode;
        let is_target = pair.tgt == *datanode;
        if !is_source && !is_target {
            return Ok(());
        }
        let in_replication = kind == InflightKind::Replication;

        if is_source && in_replication {
            self.complete_move_future(
                id,
                MoveResult::UnexpectedRemoveSourceAtInflightReplication,
            );
            self.complete_move(id).await;
            return Ok(());
        }
        if is_target && !in_replication {
            self.complete_move_future(
                id,
                MoveResult::UnexpectedRemoveTargetAtInflightDeletion,
            );
            self.complete_move(id).await;
            return Ok(());
        }

        if !(in_replication && flags.completed) {
            let result = if in_replication {
                if flags.unhealthy {
                    MoveResult::ReplicationFailNodeUnhealthy
                } else if flags.not_in_service {
                    MoveResult::ReplicationFailNodeNotInService
                } else {
                    MoveResult::ReplicationFailTimeout
                }
            } else if flags.unhealthy {
                MoveResult::DeletionFailNodeUnhealthy
            } else if flags.timeout {
                MoveResult::DeletionFailTimeout
            } else if flags.not_in_service {
                MoveResult::DeletionFailNodeNotInService
            } else {
                MoveResult::Completed
            };
            self.complete_move_future(id, result);
            self.complete_move(id).await;
        } else {
            // The target replica has appeared; decide whether the source
            // can now be deleted.
            let replicas = self.containers.container_replicas(id)?;
            self.delete_src_dn_for_move(container, &replicas).await;
        }
        Ok(())
    }

    /// The conservative half of a move: replication already succeeded, the
    /// source is deleted only if the container is over-replicated and the
    /// placement does not get worse.
    async fn delete_src_dn_for_move(
        &self,
        container: &ContainerInfo,
        replicas: &[ContainerReplica],
    ) {
        let id = container.id;
        let Some(pair) = self.move_scheduler.get(id) else {
            return;
        };
        let src = pair.src;

        if !replicas.iter().any(|r| r.datanode == src) {
            // The source vanished by other means; the move has effectively
            // succeeded.
            self.complete_move_future(id, MoveResult::Completed);
            self.complete_move(id).await;
            return;
        }

        let replica_count = self.replica_count(container, replicas);
        let factor = container.replication_factor;
        let current_status = self.placement.placement_of(replicas, factor);
        let without_src: Vec<ContainerReplica> = replicas
            .iter()
            .filter(|r| r.datanode != src)
            .cloned()
            .collect();
        let new_status = self.placement.placement_of(&without_src, factor);

        if replica_count.is_over_replicated()
            && PlacementEvaluator::actually_equal(&current_status, &new_status)
        {
            self.send_delete_command(container, &src, true);
        } else {
            info!(
                container_id = %id,
                "Cannot remove the source replica after replicating to the target"
            );
            self.complete_move_future(id, MoveResult::DeleteFailPolicy);
            self.complete_move(id).await;
        }
    }

    /// Recovery of replicated moves after this node becomes a ready leader.
    async fn on_leader_ready(&self) {
        let mut stale = Vec::new();
        for (id, pair) in self.move_scheduler.inflight_moves() {
            let (container, replicas) = match (
                self.containers.container(id),
                self.containers.container_replicas(id),
            ) {
                (Ok(container), Ok(replicas)) => (container, replicas),
                _ => {
                    error!(container_id = %id, "Cannot find container while recovering moves");
                    stale.push(id);
                    continue;
                }
            };

            let src_present = replicas.iter().any(|r| r.datanode == pair.src);
            let tgt_present = replicas.iter().any(|r| r.datanode == pair.tgt);

            if src_present {
                if tgt_present {
                    // The previous leader may or may not have issued the
                    // deletion; decide again.
                    self.delete_src_dn_for_move(&container, &replicas).await;
                } else {
                    self.send_replicate_command(&container, &pair.tgt, vec![pair.src.clone()]);
                }
            } else {
                // Without a source replica the move cannot make progress.
                stale.push(id);
            }
        }
        for id in stale {
            self.complete_move(id).await;
        }
    }

    // ------------------------------------------------------------------
    // Under-replication
    // ------------------------------------------------------------------

    fn handle_under_replicated(
        &self,
        container: &ContainerInfo,
        replica_set: &ReplicaCount,
        placement_status: &PlacementStatus,
    ) {
        debug!(container_id = %container.id, "Handling under-replicated container");
        let id = container.id;

        if replica_set.is_sufficiently_replicated() && placement_status.is_policy_satisfied() {
            info!(
                container_id = %id,
                "Container is sufficiently replicated and not mis-replicated"
            );
            return;
        }

        let rep_delta = replica_set.additional_replica_needed().max(0);
        let deletion_in_flight = self.inflight_deletion.datanodes(id);
        let replication_in_flight = self.inflight_replication.datanodes(id);

        let mut sources: Vec<&ContainerReplica> = replica_set
            .replicas()
            .iter()
            .filter(|r| {
                matches!(r.state, ReplicaState::QuasiClosed | ReplicaState::Closed)
            })
            // Exclude stale and dead nodes. Replicas on maintenance nodes
            // stay in the container manager even after the node dies.
            .filter(|r| {
                self.node_status(&r.datanode)
                    .map(|s| s.is_healthy())
                    .unwrap_or(false)
            })
            .filter(|r| !deletion_in_flight.contains(&r.datanode))
            .collect();
        sources.sort_by(|a, b| b.sequence_id.cmp(&a.sequence_id));

        if sources.is_empty() {
            warn!(container_id = %id, "Cannot replicate container, no healthy replica found");
            return;
        }
        let source_datanodes: Vec<DatanodeDetails> =
            sources.iter().map(|r| r.datanode.clone()).collect();

        let factor = container.replication_factor;

        // Judge mis-replication over the replicas that will exist once the
        // pending adds complete.
        let mut target_datanodes = source_datanodes.clone();
        target_datanodes.extend(replication_in_flight.iter().cloned());
        let mis_delta = self
            .placement
            .validate(&target_datanodes, factor)
            .mis_replication_count() as i64;

        let replicas_needed = rep_delta.max(mis_delta);
        if replicas_needed <= 0 {
            debug!(
                container_id = %id,
                "Container meets replication requirement with inflight replicas"
            );
            return;
        }

        let mut exclude: Vec<DatanodeDetails> = replica_set
            .replicas()
            .iter()
            .map(|r| r.datanode.clone())
            .collect();
        exclude.extend(replication_in_flight);

        let selected = match self.placement.choose(
            &exclude,
            replicas_needed as usize,
            container.used_bytes,
        ) {
            Ok(selected) => selected,
            Err(e) => {
                warn!(container_id = %id, error = %e, "Failed to choose replication targets");
                return;
            }
        };

        if rep_delta > 0 {
            info!(
                container_id = %id,
                expected = factor,
                found = factor as i64 - rep_delta,
                "Container is under replicated"
            );
        }

        let mut new_mis_delta = mis_delta;
        if mis_delta > 0 {
            info!(
                container_id = %id,
                reason = placement_status.reason.as_deref().unwrap_or(""),
                "Container is mis-replicated"
            );
            target_datanodes.extend(selected.iter().cloned());
            new_mis_delta = self
                .placement
                .validate(&target_datanodes, factor)
                .mis_replication_count() as i64;
        }

        if rep_delta > 0 || new_mis_delta < mis_delta {
            for target in &selected {
                self.send_replicate_command(container, target, source_datanodes.clone());
            }
        } else {
            warn!(
                container_id = %id,
                mis_delta,
                "Mis-replication has not improved, no additional replicas scheduled"
            );
        }
    }

    // ------------------------------------------------------------------
    // Over-replication
    // ------------------------------------------------------------------

    fn handle_over_replicated(&self, container: &ContainerInfo, replica_set: &ReplicaCount) {
        let id = container.id;
        let factor = container.replication_factor;
        let mut excess = -replica_set.additional_replica_needed();
        if excess <= 0 {
            return;
        }

        info!(
            container_id = %id,
            expected = factor,
            found = factor as i64 + excess,
            "Container is over replicated"
        );

        // Deterministic candidate order, so concurrent leaders pick the same
        // victims.
        let mut eligible: Vec<ContainerReplica> = replica_set.replicas().to_vec();
        eligible.sort_by(|a, b| {
            (a.container_id, a.datanode.id).cmp(&(b.container_id, b.datanode.id))
        });

        if container.state != LifecycleState::Closed {
            // Keep one replica per origin in the matching state; those carry
            // data lineages that must survive until the container settles.
            let mut protected_origins = HashSet::new();
            let mut protected = HashSet::new();
            for replica in &eligible {
                if compare_state(container.state, replica.state)
                    && protected_origins.insert(replica.origin_node)
                {
                    protected.insert(replica.datanode.id);
                }
            }
            eligible.retain(|r| !protected.contains(&r.datanode.id));
        }

        // Maintenance and decommissioned replicas are not eligible: they do
        // not count toward over-replication and may not be reachable.
        eligible.retain(|r| {
            self.node_status(&r.datanode)
                .map(|s| s.is_in_service())
                .unwrap_or(false)
        });

        let (unhealthy, healthy): (Vec<ContainerReplica>, Vec<ContainerReplica>) = eligible
            .into_iter()
            .partition(|r| !compare_state(container.state, r.state));

        // Unhealthy surplus replicas go first, even where that leaves the
        // placement temporarily unsatisfied; the next cycle sees the
        // container as under-replicated and repairs it.
        for replica in &unhealthy {
            if excess <= 0 {
                break;
            }
            self.send_delete_command(container, &replica.datanode, true);
            excess -= 1;
        }

        self.remove_excess_replicas_if_needed(excess, container, &healthy);
    }

    fn remove_excess_replicas_if_needed(
        &self,
        mut excess: i64,
        container: &ContainerInfo,
        eligible: &[ContainerReplica],
    ) {
        if excess <= 0 {
            return;
        }
        let factor = container.replication_factor;
        let mut remaining: Vec<ContainerReplica> = eligible.to_vec();
        let baseline = self.placement.placement_of(&remaining, factor);

        for replica in eligible {
            if excess <= 0 {
                break;
            }
            // Tentatively remove the candidate and keep the removal only if
            // the placement verdict does not get worse.
            let without: Vec<ContainerReplica> = remaining
                .iter()
                .filter(|r| r.datanode != replica.datanode)
                .cloned()
                .collect();
            let status = self.placement.placement_of(&without, factor);
            if PlacementEvaluator::actually_equal(&baseline, &status) {
                self.send_delete_command(container, &replica.datanode, true);
                excess -= 1;
                remaining = without;
            }
        }

        if excess > 0 {
            info!(
                container_id = %container.id,
                excess,
                "Excess replicas cannot be removed without violating the placement policy"
            );
        }
    }

    // ------------------------------------------------------------------
    // Unstable containers
    // ------------------------------------------------------------------

    /// A container is unstable when some replica state does not match the
    /// container state. OPEN/CLOSING replicas are closed, QUASI_CLOSED
    /// replicas at the container's sequence id are force-closed, and of the
    /// rest exactly one is deleted per cycle so the container goes briefly
    /// under-replicated and a healthy copy is re-replicated next cycle.
    fn handle_unstable_container(
        &self,
        container: &ContainerInfo,
        replicas: &[ContainerReplica],
    ) {
        let mut unhealthy: Vec<&ContainerReplica> = replicas
            .iter()
            .filter(|r| !compare_state(container.state, r.state))
            .collect();

        unhealthy.retain(|replica| match replica.state {
            ReplicaState::Open | ReplicaState::Closing => {
                self.send_close_command(container, &replica.datanode, false);
                false
            }
            ReplicaState::QuasiClosed if container.sequence_id == replica.sequence_id => {
                self.send_close_command(container, &replica.datanode, true);
                false
            }
            _ => true,
        });

        if let Some(replica) = unhealthy.first() {
            self.send_delete_command(container, &replica.datanode, false);
        }
    }

    // ------------------------------------------------------------------
    // Command dispatch
    // ------------------------------------------------------------------

    fn send_close_command(
        &self,
        container: &ContainerInfo,
        datanode: &DatanodeDetails,
        force: bool,
    ) {
        info!(
            container_id = %container.id,
            datanode = %datanode,
            force,
            "Sending close container command"
        );
        let command = DatanodeCommand::CloseContainer {
            container_id: container.id,
            pipeline: container.pipeline,
            force,
        };
        self.send_datanode_command(datanode, command);
    }

    fn send_replicate_command(
        &self,
        container: &ContainerInfo,
        datanode: &DatanodeDetails,
        sources: Vec<DatanodeDetails>,
    ) {
        info!(
            container_id = %container.id,
            datanode = %datanode,
            sources = sources.len(),
            "Sending replicate container command"
        );
        let command = DatanodeCommand::ReplicateContainer {
            container_id: container.id,
            sources,
        };
        if self.send_and_track(datanode, command, &self.inflight_replication) {
            self.metrics.incr_replication_cmds_sent();
            self.metrics
                .incr_replication_bytes_total(container.used_bytes);
        }
    }

    fn send_delete_command(
        &self,
        container: &ContainerInfo,
        datanode: &DatanodeDetails,
        force: bool,
    ) {
        info!(
            container_id = %container.id,
            datanode = %datanode,
            force,
            "Sending delete container command"
        );
        let command = DatanodeCommand::DeleteContainer {
            container_id: container.id,
            force,
        };
        if self.send_and_track(datanode, command, &self.inflight_deletion) {
            self.metrics.incr_deletion_cmds_sent();
        }
    }

    /// Stamp the command with the current leader term and fire it, recording
    /// the inflight action. Commands are skipped entirely when this node is
    /// not the leader.
    fn send_and_track(
        &self,
        datanode: &DatanodeDetails,
        command: DatanodeCommand,
        tracker: &InflightMap,
    ) -> bool {
        let term = match self.context.term_of_leader() {
            Ok(term) => term,
            Err(_) => {
                warn!("Skip sending datanode command, current node is not the leader");
                return false;
            }
        };
        let id = command.container_id();
        let token = self.context.token_generator().generate(id);
        self.event_bus.fire(ClusterEvent::DatanodeCommand(CommandEnvelope {
            target: datanode.clone(),
            term,
            token,
            command,
        }));
        tracker.record(id, InflightAction::new(datanode.clone(), self.clock.millis()));
        true
    }

    /// A close command carries no inflight bookkeeping; its effect shows up
    /// as a replica state change.
    fn send_datanode_command(&self, datanode: &DatanodeDetails, command: DatanodeCommand) {
        let term = match self.context.term_of_leader() {
            Ok(term) => term,
            Err(_) => {
                warn!("Skip sending datanode command, current node is not the leader");
                return;
            }
        };
        let token = self
            .context
            .token_generator()
            .generate(command.container_id());
        self.event_bus.fire(ClusterEvent::DatanodeCommand(CommandEnvelope {
            target: datanode.clone(),
            term,
            token,
            command,
        }));
    }

    fn node_status(&self, datanode: &DatanodeDetails) -> Result<NodeStatus> {
        self.nodes.node_status(datanode)
    }
}
