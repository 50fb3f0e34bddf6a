//! Basalt - replication control plane for a distributed object store.
//!
//! Basalt keeps immutable storage containers at their desired replication
//! state. A replication monitor periodically inspects every container and
//! issues close, replicate, and delete commands to datanodes; user-requested
//! replica moves are executed as replicate-then-delete with the deletion
//! gated by the placement policy. All move state survives leader re-election
//! through a consensus-replicated move table.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                         Basalt                              │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Replication Manager: monitor loop | move orchestration     │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Analysis: replica counting | placement evaluation          │
//! ├─────────────────────────────────────────────────────────────┤
//! │  HA: cluster context | consensus log | move table           │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Collaborators: container manager | node manager | bus      │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Quick Start
//!
//! ```no_run
//! use basalt::clock::SystemClock;
//! use basalt::config::ReplicationConfig;
//! use basalt::container::InMemoryContainerManager;
//! use basalt::events::EventBus;
//! use basalt::ha::{ClusterContext, InMemoryMoveTable, LocalConsensus};
//! use basalt::node::InMemoryNodeManager;
//! use basalt::placement::RackAwarePlacement;
//! use basalt::replication::ReplicationManager;
//! use std::sync::Arc;
//!
//! # fn main() -> basalt::Result<()> {
//! let manager = ReplicationManager::new(
//!     ReplicationConfig::default(),
//!     Arc::new(InMemoryContainerManager::new()),
//!     Arc::new(RackAwarePlacement::new()),
//!     EventBus::new(1024),
//!     ClusterContext::leader(1),
//!     Arc::new(InMemoryNodeManager::new()),
//!     Arc::new(SystemClock),
//!     Arc::new(LocalConsensus),
//!     Arc::new(InMemoryMoveTable::new()),
//! )?;
//! manager.start();
//! # Ok(())
//! # }
//! ```

pub mod clock;
pub mod config;
pub mod container;
pub mod error;
pub mod events;
pub mod ha;
pub mod node;
pub mod observability;
pub mod placement;
pub mod replication;
pub mod types;

// Re-exports
pub use error::{BasaltError, Result};
pub use types::*;
