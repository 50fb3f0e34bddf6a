//! Error types for the Basalt replication control plane.
//!
//! This module provides a unified error type [`BasaltError`] for all Basalt
//! operations, along with a convenient [`Result`] type alias.
//!
//! # Error Categories
//!
//! - **Leadership / HA**: leader loss and consensus failures
//! - **Container metadata**: unknown containers, invalid state transitions
//! - **Cluster**: unknown nodes, placement failures
//! - **Storage**: move-table persistence and serialization errors
//! - **Configuration**: invalid settings or missing configuration

use crate::node::DatanodeId;
use crate::types::ContainerId;
use std::io;
use thiserror::Error;

/// Main error type for Basalt operations.
#[derive(Error, Debug)]
pub enum BasaltError {
    // Leadership and consensus errors
    #[error("Not the leader")]
    NotLeader,

    #[error("Consensus failed: {0}")]
    Consensus(String),

    #[error("Replication manager is not running")]
    NotRunning,

    // Container metadata errors
    #[error("Container not found: {0}")]
    ContainerNotFound(ContainerId),

    #[error("Invalid lifecycle transition for container {container}: {state} on {event}")]
    InvalidStateTransition {
        container: ContainerId,
        state: String,
        event: String,
    },

    // Cluster errors
    #[error("Node not found: {0}")]
    NodeNotFound(DatanodeId),

    #[error("Placement failed: {0}")]
    PlacementFailed(String),

    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid configuration: {field}: {reason}")]
    InvalidConfig { field: String, reason: String },

    // Storage errors
    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    // External errors
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("RocksDB error: {0}")]
    RocksDb(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl BasaltError {
    /// Check if error is retryable.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            BasaltError::NotLeader | BasaltError::Consensus(_) | BasaltError::NotRunning
        )
    }
}

impl From<rocksdb::Error> for BasaltError {
    fn from(e: rocksdb::Error) -> Self {
        BasaltError::RocksDb(e.to_string())
    }
}

impl From<bincode::Error> for BasaltError {
    fn from(e: bincode::Error) -> Self {
        BasaltError::Serialization(e.to_string())
    }
}

/// Result type alias for Basalt operations.
pub type Result<T> = std::result::Result<T, BasaltError>;
