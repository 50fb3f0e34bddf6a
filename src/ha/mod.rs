//! High-availability plumbing consumed by the replication manager.
//!
//! The control plane runs as a replicated group with a single leader. This
//! module carries the leader-side state the replication manager observes
//! ([`ClusterContext`]), the consensus seam through which move-scheduler
//! mutations are committed before they are applied ([`ConsensusLog`]), and
//! the persistent move table those mutations land in.

use crate::clock::Clock;
use crate::error::{BasaltError, Result};
use crate::types::{ContainerId, MoveDataNodePair};
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::Path;
use std::sync::Arc;

/// Generates the container token stamped on outbound datanode commands.
pub trait ContainerTokenGenerator: Send + Sync {
    fn generate(&self, id: ContainerId) -> String;
}

/// Token generator for deployments without container tokens.
pub struct NoopTokenGenerator;

impl ContainerTokenGenerator for NoopTokenGenerator {
    fn generate(&self, _id: ContainerId) -> String {
        String::new()
    }
}

/// Digest-based token generator keyed by a shared secret.
pub struct DigestTokenGenerator {
    secret: String,
}

impl DigestTokenGenerator {
    pub fn new(secret: impl Into<String>) -> Self {
        Self {
            secret: secret.into(),
        }
    }
}

impl ContainerTokenGenerator for DigestTokenGenerator {
    fn generate(&self, id: ContainerId) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.secret.as_bytes());
        hasher.update(id.0.to_be_bytes());
        format!("sha256={:x}", hasher.finalize())
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct ContextState {
    leader: bool,
    leader_ready: bool,
    safe_mode: bool,
    term: u64,
}

/// Leader-side view of the control-plane group, updated by the HA layer on
/// election and safe-mode transitions.
pub struct ClusterContext {
    state: RwLock<ContextState>,
    tokens: Arc<dyn ContainerTokenGenerator>,
}

impl ClusterContext {
    pub fn new(tokens: Arc<dyn ContainerTokenGenerator>) -> Arc<Self> {
        Arc::new(Self {
            state: RwLock::new(ContextState {
                safe_mode: true,
                ..Default::default()
            }),
            tokens,
        })
    }

    /// A context that is already an out-of-safe-mode, ready leader at the
    /// given term. Convenient for single-node embedding and tests.
    pub fn leader(term: u64) -> Arc<Self> {
        let context = Self::new(Arc::new(NoopTokenGenerator));
        context.set_leader(true, term);
        context.set_leader_ready(true);
        context.set_safe_mode(false);
        context
    }

    pub fn is_leader(&self) -> bool {
        self.state.read().leader
    }

    pub fn is_leader_ready(&self) -> bool {
        let state = self.state.read();
        state.leader && state.leader_ready
    }

    pub fn is_in_safe_mode(&self) -> bool {
        self.state.read().safe_mode
    }

    /// Term of the current leadership epoch; fails when this node is not the
    /// leader.
    pub fn term_of_leader(&self) -> Result<u64> {
        let state = self.state.read();
        if state.leader {
            Ok(state.term)
        } else {
            Err(BasaltError::NotLeader)
        }
    }

    pub fn token_generator(&self) -> &Arc<dyn ContainerTokenGenerator> {
        &self.tokens
    }

    pub fn set_leader(&self, leader: bool, term: u64) {
        let mut state = self.state.write();
        state.leader = leader;
        state.term = term;
        if !leader {
            state.leader_ready = false;
        }
    }

    pub fn set_leader_ready(&self, ready: bool) {
        self.state.write().leader_ready = ready;
    }

    pub fn set_safe_mode(&self, safe_mode: bool) {
        self.state.write().safe_mode = safe_mode;
    }
}

/// A move-scheduler mutation routed through the consensus log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum MoveOp {
    Start {
        id: ContainerId,
        pair: MoveDataNodePair,
    },
    Complete {
        id: ContainerId,
    },
}

/// Commits move-scheduler mutations through the control-plane consensus
/// group. `submit` resolves once the entry is durable on a quorum; the
/// caller then applies the mutation to its in-memory state.
#[async_trait]
pub trait ConsensusLog: Send + Sync {
    async fn submit(&self, op: &MoveOp) -> Result<()>;
}

/// Single-node consensus: every submission commits immediately.
pub struct LocalConsensus;

#[async_trait]
impl ConsensusLog for LocalConsensus {
    async fn submit(&self, _op: &MoveOp) -> Result<()> {
        Ok(())
    }
}

/// Persistent table of in-progress moves, keyed by container id.
pub trait MoveTable: Send + Sync {
    fn put(&self, id: ContainerId, pair: &MoveDataNodePair) -> Result<()>;
    fn remove(&self, id: ContainerId) -> Result<()>;
    fn load_all(&self) -> Result<Vec<(ContainerId, MoveDataNodePair)>>;
}

#[derive(Debug, Clone)]
enum StagedWrite {
    Put(ContainerId, MoveDataNodePair),
    Remove(ContainerId),
}

/// Stages move-table writes between consensus applies and flushes them as a
/// batch, so table mutations track log application rather than interleaving
/// with it.
pub struct TransactionBuffer {
    table: RwLock<Arc<dyn MoveTable>>,
    staged: Mutex<Vec<StagedWrite>>,
}

impl TransactionBuffer {
    pub fn new(table: Arc<dyn MoveTable>) -> Self {
        Self {
            table: RwLock::new(table),
            staged: Mutex::new(Vec::new()),
        }
    }

    pub fn stage_put(&self, id: ContainerId, pair: &MoveDataNodePair) {
        self.staged.lock().push(StagedWrite::Put(id, pair.clone()));
    }

    pub fn stage_remove(&self, id: ContainerId) {
        self.staged.lock().push(StagedWrite::Remove(id));
    }

    /// Apply every staged write to the table.
    pub fn flush(&self) -> Result<()> {
        let staged: Vec<StagedWrite> = self.staged.lock().drain(..).collect();
        let table = self.table.read();
        for write in staged {
            match write {
                StagedWrite::Put(id, pair) => table.put(id, &pair)?,
                StagedWrite::Remove(id) => table.remove(id)?,
            }
        }
        Ok(())
    }

    /// Swap the backing table, dropping any staged writes. Used when a new
    /// leader reinitializes from its own table.
    pub fn replace_table(&self, table: Arc<dyn MoveTable>) {
        self.staged.lock().clear();
        *self.table.write() = table;
    }

    pub fn load_all(&self) -> Result<Vec<(ContainerId, MoveDataNodePair)>> {
        self.table.read().load_all()
    }
}

/// In-memory move table.
pub struct InMemoryMoveTable {
    entries: RwLock<std::collections::BTreeMap<ContainerId, MoveDataNodePair>>,
}

impl InMemoryMoveTable {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(std::collections::BTreeMap::new()),
        }
    }
}

impl Default for InMemoryMoveTable {
    fn default() -> Self {
        Self::new()
    }
}

impl MoveTable for InMemoryMoveTable {
    fn put(&self, id: ContainerId, pair: &MoveDataNodePair) -> Result<()> {
        self.entries.write().insert(id, pair.clone());
        Ok(())
    }

    fn remove(&self, id: ContainerId) -> Result<()> {
        self.entries.write().remove(&id);
        Ok(())
    }

    fn load_all(&self) -> Result<Vec<(ContainerId, MoveDataNodePair)>> {
        Ok(self
            .entries
            .read()
            .iter()
            .map(|(id, pair)| (*id, pair.clone()))
            .collect())
    }
}

const MOVE_PREFIX: &[u8] = b"move_";

/// RocksDB-backed move table.
pub struct RocksMoveTable {
    db: rocksdb::DB,
}

impl RocksMoveTable {
    /// Open or create a move table at the given path.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut opts = rocksdb::Options::default();
        opts.create_if_missing(true);
        opts.set_compression_type(rocksdb::DBCompressionType::Lz4);

        let db = rocksdb::DB::open(&opts, path)?;
        Ok(Self { db })
    }

    fn key(id: ContainerId) -> Vec<u8> {
        let mut key = MOVE_PREFIX.to_vec();
        key.extend_from_slice(&id.0.to_be_bytes());
        key
    }

    fn parse_key(key: &[u8]) -> Result<ContainerId> {
        if key.len() != MOVE_PREFIX.len() + 8 {
            return Err(BasaltError::Storage("invalid move table key".into()));
        }
        let id_bytes: [u8; 8] = key[MOVE_PREFIX.len()..]
            .try_into()
            .map_err(|_| BasaltError::Storage("invalid move table key".into()))?;
        Ok(ContainerId(u64::from_be_bytes(id_bytes)))
    }
}

impl MoveTable for RocksMoveTable {
    fn put(&self, id: ContainerId, pair: &MoveDataNodePair) -> Result<()> {
        let value = bincode::serialize(pair)?;
        self.db.put(Self::key(id), value)?;
        Ok(())
    }

    fn remove(&self, id: ContainerId) -> Result<()> {
        self.db.delete(Self::key(id))?;
        Ok(())
    }

    fn load_all(&self) -> Result<Vec<(ContainerId, MoveDataNodePair)>> {
        let mut entries = Vec::new();
        let iter = self.db.iterator(rocksdb::IteratorMode::From(
            MOVE_PREFIX,
            rocksdb::Direction::Forward,
        ));

        for item in iter {
            let (key, value) = item?;
            if !key.starts_with(MOVE_PREFIX) {
                break;
            }
            let id = Self::parse_key(&key)?;
            let pair: MoveDataNodePair = bincode::deserialize(&value)?;
            entries.push((id, pair));
        }

        Ok(entries)
    }
}

/// Service run-state used by the safe-mode gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceStatus {
    Running,
    Pausing,
}

/// Tracks when the service last became ready, for the post-safe-mode grace
/// period.
pub struct ServiceStateTracker {
    status: RwLock<ServiceStatus>,
    last_ready_millis: RwLock<u64>,
}

impl ServiceStateTracker {
    pub fn new() -> Self {
        Self {
            status: RwLock::new(ServiceStatus::Pausing),
            last_ready_millis: RwLock::new(0),
        }
    }

    pub fn status(&self) -> ServiceStatus {
        *self.status.read()
    }

    /// Transition to RUNNING, recording the time of the transition. Returns
    /// true if this call performed the transition.
    pub fn mark_running(&self, clock: &dyn Clock) -> bool {
        let mut status = self.status.write();
        if *status != ServiceStatus::Running {
            *status = ServiceStatus::Running;
            *self.last_ready_millis.write() = clock.millis();
            true
        } else {
            false
        }
    }

    pub fn mark_pausing(&self) {
        *self.status.write() = ServiceStatus::Pausing;
    }

    /// Whether the service is RUNNING and the grace period has elapsed.
    pub fn ready_for(&self, clock: &dyn Clock, grace_millis: u64) -> bool {
        *self.status.read() == ServiceStatus::Running
            && clock.millis().saturating_sub(*self.last_ready_millis.read()) >= grace_millis
    }
}

impl Default for ServiceStateTracker {
    fn default() -> Self {
        Self::new()
    }
}
