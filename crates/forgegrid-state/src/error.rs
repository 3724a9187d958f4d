//! Error types for the forgegrid state store.

use thiserror::Error;

use crate::types::ServerStatus;

/// Result type alias for state store operations.
pub type StateResult<T> = Result<T, StateError>;

/// Errors that can occur during state store operations.
#[derive(Debug, Error)]
pub enum StateError {
    #[error("failed to open database: {0}")]
    Open(String),

    #[error("transaction error: {0}")]
    Transaction(String),

    #[error("table error: {0}")]
    Table(String),

    #[error("read error: {0}")]
    Read(String),

    #[error("write error: {0}")]
    Write(String),

    #[error("serialization error: {0}")]
    Serialize(String),

    #[error("deserialization error: {0}")]
    Deserialize(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error(transparent)]
    Ledger(#[from] LedgerError),
}

/// Placement conflicts rejected by the ledger before anything is dispatched.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum LedgerError {
    #[error("node not found: {0}")]
    NodeNotFound(String),

    #[error("invalid node id {0:?}: use 1-64 characters from [A-Za-z0-9_-]")]
    InvalidNodeId(String),

    #[error("node {0} is in maintenance mode")]
    Maintenance(String),

    #[error("node {node_id} has {available} MB memory free, {requested} MB requested")]
    InsufficientMemory {
        node_id: String,
        requested: u64,
        available: u64,
    },

    #[error("node {node_id} has {available} MB disk free, {requested} MB requested")]
    InsufficientDisk {
        node_id: String,
        requested: u64,
        available: u64,
    },

    #[error("node {0} has no free port allocations")]
    NoFreePort(String),

    #[error("port {port} on node {node_id} is not available")]
    PortUnavailable { node_id: String, port: u16 },

    #[error("no node can fit {memory_mb} MB memory and {disk_mb} MB disk")]
    NoCapacity { memory_mb: u64, disk_mb: u64 },

    #[error("server already exists: {0}")]
    ServerExists(String),

    #[error("server not found: {0}")]
    ServerNotFound(String),

    #[error("server {id} cannot move from {from} to {to}")]
    InvalidTransition {
        id: String,
        from: ServerStatus,
        to: ServerStatus,
    },
}
