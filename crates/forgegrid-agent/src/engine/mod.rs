//! Container engine abstraction.
//!
//! The lifecycle manager talks to the engine only through
//! [`ContainerEngine`]. [`DockerEngine`] drives a real Docker daemon via
//! bollard; [`MemoryEngine`] keeps containers in a map and is used by the
//! test suites and by `forged agent --engine memory` dry runs.

pub mod docker;
pub mod memory;

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream::BoxStream;
use thiserror::Error;

pub use docker::DockerEngine;
pub use memory::{FailPoint, MemoryEngine};

/// Label carrying the workload id on every container the agent creates.
///
/// The engine's labels are the source of truth for which container
/// belongs to which workload.
pub const WORKLOAD_LABEL: &str = "forgegrid.workload.id";

/// Errors reported by a container engine.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("no such container: {0}")]
    NotFound(String),

    #[error("failed to pull image {image}: {reason}")]
    Pull { image: String, reason: String },

    #[error("engine unavailable: {0}")]
    Unavailable(String),

    #[error("{0}")]
    Engine(String),
}

pub type EngineResult<T> = Result<T, EngineError>;

/// Fully resolved container definition handed to the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
    /// `KEY=value` pairs.
    pub env: Vec<String>,
    pub labels: HashMap<String, String>,
    pub ports: Vec<PublishedPort>,
    pub memory_bytes: i64,
    /// Memory + swap cap; equal to `memory_bytes` so no swap is granted.
    pub memory_swap_bytes: i64,
    pub cpu_period: i64,
    /// 0 leaves the CPU unlimited.
    pub cpu_quota: i64,
    /// `host_path:container_path` bind mounts.
    pub binds: Vec<String>,
}

/// A container port published on a host port (tcp and udp).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PublishedPort {
    pub host_port: u16,
    pub container_port: u16,
}

/// Run state as the engine reports it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Created,
    Running,
    Restarting,
    Paused,
    Exited,
    Dead,
    Unknown,
}

impl RunState {
    pub fn parse(s: &str) -> Self {
        match s {
            "created" => RunState::Created,
            "running" => RunState::Running,
            "restarting" => RunState::Restarting,
            "paused" => RunState::Paused,
            "exited" => RunState::Exited,
            "dead" => RunState::Dead,
            _ => RunState::Unknown,
        }
    }

    pub fn is_running(self) -> bool {
        matches!(self, RunState::Running | RunState::Restarting)
    }
}

/// Entry from a label query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerSummary {
    pub id: String,
    pub workload_id: Option<String>,
    pub state: RunState,
}

/// Result of inspecting a single container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerInfo {
    pub id: String,
    pub state: RunState,
    pub exit_code: Option<i64>,
    pub oom_killed: bool,
    pub error: Option<String>,
}

/// Cumulative CPU counters at one instant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CpuSample {
    /// CPU time consumed by the container, nanoseconds.
    pub total_usage_ns: u64,
    /// CPU time elapsed on the host across all cores, nanoseconds.
    pub system_usage_ns: u64,
    pub online_cpus: u32,
}

/// Decoded engine usage report for one container.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct EngineStats {
    pub cpu: CpuSample,
    /// Previous sample when the engine includes one.
    pub precpu: Option<CpuSample>,
    pub memory_usage_bytes: u64,
    /// Page cache counted in `memory_usage_bytes` (inactive_file or cache).
    pub memory_cache_bytes: u64,
    pub memory_limit_bytes: u64,
    pub network_rx_bytes: u64,
    pub network_tx_bytes: u64,
    pub block_read_bytes: u64,
    pub block_write_bytes: u64,
    pub pids: u64,
}

/// Host facts reported by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct EngineInfo {
    pub cpu_cores: u32,
    pub memory_total_bytes: u64,
}

/// One console line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogLine {
    pub text: String,
    pub timestamp_ms: i64,
}

/// Follows a container's output until dropped.
pub type LogStream = BoxStream<'static, EngineResult<LogLine>>;

/// Operations the agent needs from a container engine.
#[async_trait]
pub trait ContainerEngine: Send + Sync {
    async fn image_exists(&self, image: &str) -> EngineResult<bool>;

    async fn pull_image(&self, image: &str) -> EngineResult<()>;

    /// Create (but do not start) a container. Returns its id.
    async fn create_container(&self, spec: &ContainerSpec) -> EngineResult<String>;

    async fn start_container(&self, id: &str) -> EngineResult<()>;

    async fn stop_container(&self, id: &str, timeout: Duration) -> EngineResult<()>;

    /// Remove a container. Volumes and bind-mounted data are kept.
    async fn remove_container(&self, id: &str, force: bool) -> EngineResult<()>;

    async fn inspect_container(&self, id: &str) -> EngineResult<ContainerInfo>;

    /// Find the container whose `key` label equals `value`.
    async fn find_by_label(&self, key: &str, value: &str) -> EngineResult<Option<ContainerSummary>>;

    /// All containers carrying the `key` label.
    async fn list_labeled(&self, key: &str) -> EngineResult<Vec<ContainerSummary>>;

    async fn stats(&self, id: &str) -> EngineResult<EngineStats>;

    /// Replay the last `tail` lines, then follow new output.
    async fn logs(&self, id: &str, tail: u32) -> EngineResult<LogStream>;

    /// Run a command inside the container without waiting for it.
    async fn exec_detached(&self, id: &str, cmd: Vec<String>) -> EngineResult<()>;

    async fn info(&self) -> EngineResult<EngineInfo>;
}
