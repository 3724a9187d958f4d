use std::path::PathBuf;

use thiserror::Error;

use crate::engine::EngineError;

/// Failures of a lifecycle operation.
#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error("invalid workload id {0:?}: expected 1-64 characters of [A-Za-z0-9_-]")]
    InvalidId(String),

    #[error("no container for workload {0}")]
    NotFound(String),

    #[error("workload {workload_id} already has container {container_id}")]
    Exists {
        workload_id: String,
        container_id: String,
    },

    #[error("workload {0} is not running")]
    NotRunning(String),

    #[error("empty console command")]
    EmptyCommand,

    #[error("failed to prepare data directory {}: {source}", path.display())]
    DataDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Engine(#[from] EngineError),
}

impl LifecycleError {
    /// True when the workload has no container at all.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            LifecycleError::NotFound(_) | LifecycleError::Engine(EngineError::NotFound(_))
        )
    }
}

pub type LifecycleResult<T> = Result<T, LifecycleError>;
