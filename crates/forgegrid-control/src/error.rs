//! Control plane error types.

use std::time::Duration;

use forgegrid_state::{LedgerError, StateError};
use thiserror::Error;

/// Failures reaching a node's agent.
#[derive(Debug, Error)]
pub enum PoolError {
    #[error("node not registered: {0}")]
    UnknownNode(String),

    #[error("invalid endpoint for node {node_id}: {reason}")]
    InvalidEndpoint { node_id: String, reason: String },

    #[error("cannot load credentials for node {node_id}: {reason}")]
    Credentials { node_id: String, reason: String },

    #[error("failed to connect to node {node_id} after {attempts} attempt(s): {source}")]
    Connect {
        node_id: String,
        attempts: u32,
        #[source]
        source: tonic::transport::Error,
    },

    #[error("call to node {node_id} timed out after {timeout:?}")]
    Timeout { node_id: String, timeout: Duration },

    #[error("node {node_id} returned {}: {}", status.code(), status.message())]
    Rpc { node_id: String, status: tonic::Status },

    #[error("connection pool is shut down")]
    Closed,

    #[error(transparent)]
    State(#[from] StateError),
}

impl PoolError {
    /// The call never reached a healthy agent.
    pub fn is_unavailable(&self) -> bool {
        match self {
            PoolError::Connect { .. } | PoolError::Timeout { .. } | PoolError::Closed => true,
            PoolError::Rpc { status, .. } => matches!(
                status.code(),
                tonic::Code::Unavailable | tonic::Code::Unknown | tonic::Code::Unauthenticated
            ),
            _ => false,
        }
    }
}

/// Failures of a control-plane operation on a server.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error(transparent)]
    State(#[from] StateError),

    #[error("node {node_id} unavailable: {source}")]
    NodeUnavailable {
        node_id: String,
        #[source]
        source: PoolError,
    },

    #[error("agent on node {node_id} failed to {op}: {message}")]
    Agent {
        node_id: String,
        op: &'static str,
        message: String,
    },

    #[error("server {0} has no container yet")]
    NoContainer(String),
}

impl From<LedgerError> for DispatchError {
    fn from(e: LedgerError) -> Self {
        DispatchError::State(e.into())
    }
}

impl DispatchError {
    /// Capacity or port conflict rejected before anything was dispatched.
    pub fn ledger(&self) -> Option<&LedgerError> {
        match self {
            DispatchError::State(StateError::Ledger(e)) => Some(e),
            _ => None,
        }
    }
}

pub type PoolResult<T> = Result<T, PoolError>;
pub type DispatchResult<T> = Result<T, DispatchError>;
