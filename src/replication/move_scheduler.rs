//! HA-replicated record of active replica moves.
//!
//! Every mutation is committed through the consensus log before the
//! in-memory map changes, and lands in the persistent move table through the
//! transaction buffer. A freshly elected leader calls [`MoveScheduler::
//! reinitialize`] to reload the map from its own copy of the table.

use crate::error::Result;
use crate::ha::{ConsensusLog, MoveOp, MoveTable, TransactionBuffer};
use crate::types::{ContainerId, MoveDataNodePair};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::warn;

pub struct MoveScheduler {
    consensus: Arc<dyn ConsensusLog>,
    buffer: TransactionBuffer,
    inflight: RwLock<HashMap<ContainerId, MoveDataNodePair>>,
}

impl MoveScheduler {
    /// Build a scheduler over the given consensus log and move table,
    /// loading any moves the table already holds.
    pub fn new(consensus: Arc<dyn ConsensusLog>, table: Arc<dyn MoveTable>) -> Result<Self> {
        let scheduler = Self {
            consensus,
            buffer: TransactionBuffer::new(table),
            inflight: RwLock::new(HashMap::new()),
        };
        scheduler.load()?;
        Ok(scheduler)
    }

    /// Record the start of a move. Idempotent per container id: a second
    /// start for the same container leaves the existing record in place.
    pub async fn start_move(&self, id: ContainerId, pair: MoveDataNodePair) -> Result<()> {
        let op = MoveOp::Start {
            id,
            pair: pair.clone(),
        };
        self.consensus.submit(&op).await?;

        let mut inflight = self.inflight.write();
        if !inflight.contains_key(&id) {
            self.buffer.stage_put(id, &pair);
            self.buffer.flush()?;
            inflight.insert(id, pair);
        }
        Ok(())
    }

    /// Remove the record of a finished move. The in-memory entry is dropped
    /// even if the table write fails; the table will be repaired on the next
    /// reinitialize.
    pub async fn complete_move(&self, id: ContainerId) -> Result<()> {
        let op = MoveOp::Complete { id };
        self.consensus.submit(&op).await?;

        self.buffer.stage_remove(id);
        if let Err(e) = self.buffer.flush() {
            warn!(container_id = %id, error = %e, "Failed to persist move completion");
        }
        self.inflight.write().remove(&id);
        Ok(())
    }

    /// The source/target pair of an active move, if any.
    pub fn get(&self, id: ContainerId) -> Option<MoveDataNodePair> {
        self.inflight.read().get(&id).cloned()
    }

    /// Snapshot of every active move.
    pub fn inflight_moves(&self) -> HashMap<ContainerId, MoveDataNodePair> {
        self.inflight.read().clone()
    }

    /// Reload the in-memory map from the given table. Called once per
    /// leadership transition.
    pub fn reinitialize(&self, table: Arc<dyn MoveTable>) -> Result<()> {
        self.buffer.replace_table(table);
        self.inflight.write().clear();
        self.load()
    }

    fn load(&self) -> Result<()> {
        let entries = self.buffer.load_all()?;
        let mut inflight = self.inflight.write();
        for (id, pair) in entries {
            inflight.insert(id, pair);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ha::{InMemoryMoveTable, LocalConsensus};
    use crate::node::DatanodeDetails;

    fn make_scheduler() -> (MoveScheduler, Arc<InMemoryMoveTable>) {
        let table = Arc::new(InMemoryMoveTable::new());
        let scheduler =
            MoveScheduler::new(Arc::new(LocalConsensus), table.clone()).unwrap();
        (scheduler, table)
    }

    fn make_pair() -> MoveDataNodePair {
        MoveDataNodePair::new(DatanodeDetails::random(), DatanodeDetails::random())
    }

    #[tokio::test]
    async fn test_start_and_complete_move() {
        let (scheduler, table) = make_scheduler();
        let id = ContainerId(1);
        let pair = make_pair();

        scheduler.start_move(id, pair.clone()).await.unwrap();
        assert_eq!(scheduler.get(id), Some(pair));
        assert_eq!(table.load_all().unwrap().len(), 1);

        scheduler.complete_move(id).await.unwrap();
        assert_eq!(scheduler.get(id), None);
        assert!(table.load_all().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_start_move_is_idempotent() {
        let (scheduler, _table) = make_scheduler();
        let id = ContainerId(1);
        let first = make_pair();
        let second = make_pair();

        scheduler.start_move(id, first.clone()).await.unwrap();
        scheduler.start_move(id, second).await.unwrap();

        assert_eq!(scheduler.get(id), Some(first));
        assert_eq!(scheduler.inflight_moves().len(), 1);
    }

    #[tokio::test]
    async fn test_reinitialize_reloads_from_table() {
        let (scheduler, table) = make_scheduler();
        let pair = make_pair();
        scheduler.start_move(ContainerId(1), pair.clone()).await.unwrap();

        // A new leader starts from its own table copy.
        let fresh = MoveScheduler::new(Arc::new(LocalConsensus), table.clone()).unwrap();
        assert_eq!(fresh.get(ContainerId(1)), Some(pair.clone()));

        let empty = Arc::new(InMemoryMoveTable::new());
        fresh.reinitialize(empty).unwrap();
        assert!(fresh.inflight_moves().is_empty());

        fresh.reinitialize(table).unwrap();
        assert_eq!(fresh.get(ContainerId(1)), Some(pair));
    }
}
