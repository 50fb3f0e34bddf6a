//! Container replication control loop.
//!
//! This module drives every container toward its desired replication state:
//! - [`ReplicaCount`] classifies a container's replica set;
//! - [`InflightMap`] tracks dispatched commands until their effects appear;
//! - [`MoveScheduler`] is the HA-replicated record of active replica moves;
//! - [`ReplicationManager`] runs the monitor loop and orchestrates moves.

mod commands;
mod inflight;
mod manager;
mod metrics;
mod move_scheduler;
mod replica_count;

pub use commands::{CommandEnvelope, DatanodeCommand};
pub use inflight::{InflightAction, InflightMap};
pub use manager::{MoveFuture, MoveResult, ReplicationManager};
pub use metrics::{ReplicationMetrics, ReplicationMetricsSnapshot};
pub use move_scheduler::MoveScheduler;
pub use replica_count::{is_container_empty, ReplicaCount};
