//! Container lifecycle manager.
//!
//! Turns workload operations into engine calls. Every container the
//! agent creates carries the [`WORKLOAD_LABEL`] label; the in-memory
//! [`ContainerRegistry`] only caches that mapping.
//!
//! # Create pipeline
//!
//! ```text
//! validate id → mkdir <data_root>/<id> → ensure image → create container → cache id
//! ```
//!
//! A failure aborts the remaining steps. The data directory and a pulled
//! image are not cleaned up: both steps are idempotent, so a retry with
//! the same id reuses them.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::engine::{
    ContainerEngine, ContainerSpec, ContainerSummary, EngineError, LogStream, PublishedPort,
    RunState, WORKLOAD_LABEL,
};
use crate::error::{LifecycleError, LifecycleResult};
use crate::registry::ContainerRegistry;
use crate::stats::{StatsTracker, memory_usage};

/// CFS period used for every container, microseconds.
pub const CPU_PERIOD_US: i64 = 100_000;

const MAX_ID_LEN: usize = 64;

/// Static agent-side settings for workloads.
#[derive(Debug, Clone)]
pub struct LifecycleConfig {
    /// Parent of the per-workload data directories.
    pub data_root: PathBuf,
    /// Image used when a create request names none.
    pub default_image: String,
    /// Port the game server listens on inside the container.
    pub container_port: u16,
    /// Mount point of the data directory inside the container.
    pub container_data_path: String,
    /// Grace period for stop requests that do not set one.
    pub stop_timeout: Duration,
    /// Prefix prepended to console commands before exec.
    pub console_command: Vec<String>,
    /// Lines of history replayed when a console stream does not ask.
    pub console_tail: u32,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            data_root: PathBuf::from("/var/lib/forgegrid/workloads"),
            default_image: "itzg/minecraft-server:latest".to_string(),
            container_port: 25565,
            container_data_path: "/data".to_string(),
            stop_timeout: Duration::from_secs(30),
            console_command: vec!["rcon-cli".to_string()],
            console_tail: 100,
        }
    }
}

impl LifecycleConfig {
    pub fn new(data_root: impl Into<PathBuf>) -> Self {
        Self {
            data_root: data_root.into(),
            ..Default::default()
        }
    }

    pub fn with_default_image(mut self, image: impl Into<String>) -> Self {
        self.default_image = image.into();
        self
    }

    pub fn with_stop_timeout(mut self, timeout: Duration) -> Self {
        self.stop_timeout = timeout;
        self
    }
}

/// Request to create a workload container.
#[derive(Debug, Clone, Default)]
pub struct CreateWorkload {
    /// Generated when empty.
    pub id: String,
    pub name: String,
    /// Falls back to [`LifecycleConfig::default_image`].
    pub image: Option<String>,
    pub memory_mb: u64,
    /// 100 = one core, 0 = unlimited.
    pub cpu_percent: u32,
    pub env: HashMap<String, String>,
    /// `container_port` 0 means the configured container port.
    pub ports: Vec<PublishedPort>,
    pub disk_mb: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreatedWorkload {
    pub workload_id: String,
    pub container_id: String,
}

/// Workload state as the agent reports it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkloadState {
    Installing,
    Running,
    Offline,
    Errored,
}

impl WorkloadState {
    fn from_engine(state: RunState, oom_killed: bool) -> Self {
        match state {
            RunState::Created => WorkloadState::Installing,
            RunState::Running | RunState::Restarting => WorkloadState::Running,
            RunState::Dead => WorkloadState::Errored,
            RunState::Exited if oom_killed => WorkloadState::Errored,
            RunState::Exited | RunState::Paused | RunState::Unknown => WorkloadState::Offline,
        }
    }
}

/// Point-in-time view of one workload.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkloadReport {
    pub workload_id: String,
    pub state: WorkloadState,
    pub container_id: Option<String>,
    pub cpu_percent: f64,
    pub memory_bytes: u64,
    pub memory_limit_bytes: u64,
    pub timestamp_ms: i64,
    pub error: Option<String>,
}

impl WorkloadReport {
    fn offline(workload_id: &str) -> Self {
        Self {
            workload_id: workload_id.to_string(),
            state: WorkloadState::Offline,
            container_id: None,
            cpu_percent: 0.0,
            memory_bytes: 0,
            memory_limit_bytes: 0,
            timestamp_ms: now_ms(),
            error: None,
        }
    }
}

/// Node-wide usage summary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct NodeReport {
    pub running_workloads: u32,
    pub total_workloads: u32,
    pub cpu_cores: u32,
    pub memory_total_bytes: u64,
    pub disk_used_bytes: u64,
}

pub(crate) fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

/// Workload ids name directories on the host, so only a safe alphabet
/// is accepted.
pub fn validate_workload_id(id: &str) -> LifecycleResult<()> {
    let valid = !id.is_empty()
        && id.len() <= MAX_ID_LEN
        && id
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_');
    if valid {
        Ok(())
    } else {
        Err(LifecycleError::InvalidId(id.to_string()))
    }
}

/// Engine name of a workload's container.
pub fn container_name(workload_id: &str) -> String {
    format!("forgegrid-{workload_id}")
}

/// Build the engine definition for a workload.
pub fn build_container_spec(
    config: &LifecycleConfig,
    workload_id: &str,
    data_dir: &Path,
    image: &str,
    req: &CreateWorkload,
) -> ContainerSpec {
    let mut env: Vec<String> = req
        .env
        .iter()
        .filter(|(k, _)| k.as_str() != "EULA" && k.as_str() != "MEMORY")
        .map(|(k, v)| format!("{k}={v}"))
        .collect();
    env.sort();
    env.push("EULA=TRUE".to_string());
    env.push(format!("MEMORY={}M", req.memory_mb));

    let ports = req
        .ports
        .iter()
        .map(|p| PublishedPort {
            host_port: p.host_port,
            container_port: if p.container_port == 0 {
                config.container_port
            } else {
                p.container_port
            },
        })
        .collect();

    let memory_bytes = i64::try_from(req.memory_mb.saturating_mul(1024 * 1024)).unwrap_or(i64::MAX);
    let cpu_quota = i64::from(req.cpu_percent) * CPU_PERIOD_US / 100;

    ContainerSpec {
        name: container_name(workload_id),
        image: image.to_string(),
        env,
        labels: HashMap::from([(WORKLOAD_LABEL.to_string(), workload_id.to_string())]),
        ports,
        memory_bytes,
        memory_swap_bytes: memory_bytes,
        cpu_period: CPU_PERIOD_US,
        cpu_quota,
        binds: vec![format!(
            "{}:{}",
            data_dir.display(),
            config.container_data_path
        )],
    }
}

/// Bytes used by regular files under `root`. Missing roots count as 0.
pub fn disk_usage(root: &Path) -> u64 {
    WalkDir::new(root)
        .into_iter()
        .filter_map(Result::ok)
        .filter(|entry| entry.file_type().is_file())
        .filter_map(|entry| entry.metadata().ok())
        .map(|meta| meta.len())
        .sum()
}

/// Executes workload operations against a [`ContainerEngine`].
pub struct LifecycleManager {
    engine: Arc<dyn ContainerEngine>,
    registry: ContainerRegistry,
    stats: StatsTracker,
    config: LifecycleConfig,
}

impl LifecycleManager {
    pub fn new(engine: Arc<dyn ContainerEngine>, config: LifecycleConfig) -> Self {
        Self {
            engine,
            registry: ContainerRegistry::new(),
            stats: StatsTracker::new(),
            config,
        }
    }

    pub fn config(&self) -> &LifecycleConfig {
        &self.config
    }

    pub fn registry(&self) -> &ContainerRegistry {
        &self.registry
    }

    /// Host directory bind-mounted into the workload's container.
    pub fn data_dir(&self, workload_id: &str) -> PathBuf {
        let root = std::path::absolute(&self.config.data_root)
            .unwrap_or_else(|_| self.config.data_root.clone());
        root.join(workload_id)
    }

    async fn lookup(&self, workload_id: &str) -> LifecycleResult<String> {
        validate_workload_id(workload_id)?;
        self.registry
            .resolve(workload_id, self.engine.as_ref())
            .await?
            .ok_or_else(|| LifecycleError::NotFound(workload_id.to_string()))
    }

    pub async fn create(&self, req: CreateWorkload) -> LifecycleResult<CreatedWorkload> {
        let workload_id = if req.id.is_empty() {
            uuid::Uuid::new_v4().simple().to_string()
        } else {
            req.id.clone()
        };
        validate_workload_id(&workload_id)?;

        if let Some(existing) = self
            .registry
            .resolve(&workload_id, self.engine.as_ref())
            .await?
        {
            return Err(LifecycleError::Exists {
                workload_id,
                container_id: existing,
            });
        }

        let data_dir = self.data_dir(&workload_id);
        tokio::fs::create_dir_all(&data_dir)
            .await
            .map_err(|source| LifecycleError::DataDir {
                path: data_dir.clone(),
                source,
            })?;

        let image = req
            .image
            .clone()
            .filter(|i| !i.is_empty())
            .unwrap_or_else(|| self.config.default_image.clone());
        if !self.engine.image_exists(&image).await? {
            self.engine.pull_image(&image).await?;
        }

        let spec = build_container_spec(&self.config, &workload_id, &data_dir, &image, &req);
        let container_id = self.engine.create_container(&spec).await?;
        self.registry.insert(&workload_id, &container_id).await;

        info!(
            %workload_id,
            %container_id,
            name = %req.name,
            %image,
            memory_mb = req.memory_mb,
            cpu_percent = req.cpu_percent,
            "workload created"
        );
        Ok(CreatedWorkload {
            workload_id,
            container_id,
        })
    }

    pub async fn start(&self, workload_id: &str) -> LifecycleResult<()> {
        let container_id = self.lookup(workload_id).await?;
        self.engine.start_container(&container_id).await?;
        info!(%workload_id, %container_id, "workload started");
        Ok(())
    }

    /// Graceful stop; `None` uses the configured grace period.
    pub async fn stop(&self, workload_id: &str, timeout: Option<Duration>) -> LifecycleResult<()> {
        let container_id = self.lookup(workload_id).await?;
        let timeout = timeout.unwrap_or(self.config.stop_timeout);
        self.engine.stop_container(&container_id, timeout).await?;
        info!(%workload_id, %container_id, timeout_secs = timeout.as_secs(), "workload stopped");
        Ok(())
    }

    /// Stop followed by start. A status query between the two reports
    /// the workload offline.
    pub async fn restart(&self, workload_id: &str) -> LifecycleResult<()> {
        self.stop(workload_id, None).await?;
        self.start(workload_id).await
    }

    /// Remove the container. The data directory stays on disk.
    pub async fn delete(&self, workload_id: &str, force: bool) -> LifecycleResult<()> {
        let container_id = self.lookup(workload_id).await?;
        let result = self.engine.remove_container(&container_id, force).await;
        if matches!(result, Ok(()) | Err(EngineError::NotFound(_))) {
            self.registry.remove(workload_id).await;
            self.stats.forget(&container_id).await;
        }
        result?;
        info!(%workload_id, %container_id, force, "workload deleted");
        Ok(())
    }

    /// Current state and usage. Never fails: unknown workloads and engine
    /// errors are reported as offline, the latter with the error message.
    pub async fn status(&self, workload_id: &str) -> WorkloadReport {
        let container_id = match self.lookup(workload_id).await {
            Ok(id) => id,
            Err(LifecycleError::NotFound(_)) => return WorkloadReport::offline(workload_id),
            Err(e) => {
                let mut report = WorkloadReport::offline(workload_id);
                report.error = Some(e.to_string());
                return report;
            }
        };

        let info = match self.engine.inspect_container(&container_id).await {
            Ok(info) => info,
            Err(EngineError::NotFound(_)) => {
                // Removed behind our back.
                self.registry.remove(workload_id).await;
                return WorkloadReport::offline(workload_id);
            }
            Err(e) => {
                warn!(%workload_id, %container_id, error = %e, "inspect failed");
                let mut report = WorkloadReport::offline(workload_id);
                report.container_id = Some(container_id);
                report.error = Some(e.to_string());
                return report;
            }
        };

        let mut report = WorkloadReport {
            workload_id: workload_id.to_string(),
            state: WorkloadState::from_engine(info.state, info.oom_killed),
            container_id: Some(container_id.clone()),
            cpu_percent: 0.0,
            memory_bytes: 0,
            memory_limit_bytes: 0,
            timestamp_ms: now_ms(),
            error: info.error,
        };
        if info.oom_killed && report.error.is_none() {
            report.error = Some("container was killed by the OOM killer".to_string());
        }
        if info.state.is_running() {
            self.fill_usage(&container_id, &mut report).await;
        }
        report
    }

    async fn fill_usage(&self, container_id: &str, report: &mut WorkloadReport) {
        match self.engine.stats(container_id).await {
            Ok(stats) => {
                report.cpu_percent = self.stats.observe(container_id, &stats).await;
                report.memory_bytes = memory_usage(&stats);
                report.memory_limit_bytes = stats.memory_limit_bytes;
            }
            Err(e) => debug!(%container_id, error = %e, "stats unavailable"),
        }
    }

    /// Every container carrying the workload label. Refreshes the registry.
    pub async fn list(&self) -> LifecycleResult<Vec<WorkloadReport>> {
        let containers = self.engine.list_labeled(WORKLOAD_LABEL).await?;
        let mut reports = Vec::with_capacity(containers.len());
        for ContainerSummary {
            id,
            workload_id,
            state,
        } in containers
        {
            let Some(workload_id) = workload_id else {
                continue;
            };
            self.registry.insert(&workload_id, &id).await;
            let mut report = WorkloadReport {
                workload_id,
                state: WorkloadState::from_engine(state, false),
                container_id: Some(id.clone()),
                cpu_percent: 0.0,
                memory_bytes: 0,
                memory_limit_bytes: 0,
                timestamp_ms: now_ms(),
                error: None,
            };
            if state.is_running() {
                self.fill_usage(&id, &mut report).await;
            }
            reports.push(report);
        }
        reports.sort_by(|a, b| a.workload_id.cmp(&b.workload_id));
        Ok(reports)
    }

    /// Follow the workload's console output. `tail` 0 uses the configured
    /// replay length.
    pub async fn console(&self, workload_id: &str, tail: u32) -> LifecycleResult<LogStream> {
        let container_id = self.lookup(workload_id).await?;
        let tail = if tail == 0 { self.config.console_tail } else { tail };
        Ok(self.engine.logs(&container_id, tail).await?)
    }

    /// Run a console command inside the running container, detached.
    pub async fn send_command(&self, workload_id: &str, command: &str) -> LifecycleResult<()> {
        if command.trim().is_empty() {
            return Err(LifecycleError::EmptyCommand);
        }
        let container_id = self.lookup(workload_id).await?;
        let info = self.engine.inspect_container(&container_id).await?;
        if !info.state.is_running() {
            return Err(LifecycleError::NotRunning(workload_id.to_string()));
        }
        let mut cmd = self.config.console_command.clone();
        cmd.push(command.to_string());
        self.engine.exec_detached(&container_id, cmd).await?;
        debug!(%workload_id, %container_id, %command, "console command sent");
        Ok(())
    }

    pub async fn node_stats(&self) -> LifecycleResult<NodeReport> {
        let containers = self.engine.list_labeled(WORKLOAD_LABEL).await?;
        let info = self.engine.info().await?;
        let root = self.config.data_root.clone();
        let disk_used_bytes = tokio::task::spawn_blocking(move || disk_usage(&root))
            .await
            .unwrap_or_else(|e| {
                warn!(error = %e, "disk usage scan failed");
                0
            });
        Ok(NodeReport {
            running_workloads: containers.iter().filter(|c| c.state.is_running()).count() as u32,
            total_workloads: containers.len() as u32,
            cpu_cores: info.cpu_cores,
            memory_total_bytes: info.memory_total_bytes,
            disk_used_bytes,
        })
    }
}
