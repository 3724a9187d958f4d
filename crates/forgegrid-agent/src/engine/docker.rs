//! Docker engine backed by bollard.

use std::collections::HashMap;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use bollard::Docker;
use bollard::container::{
    Config, CreateContainerOptions, InspectContainerOptions, ListContainersOptions, LogsOptions,
    MemoryStatsStats, RemoveContainerOptions, Stats, StatsOptions, StopContainerOptions,
};
use bollard::exec::{CreateExecOptions, StartExecOptions};
use bollard::image::CreateImageOptions;
use bollard::models::{HostConfig, PortBinding};
use futures_util::{StreamExt, TryStreamExt};
use tracing::{debug, info};

use super::*;

/// [`ContainerEngine`] talking to the local Docker daemon.
#[derive(Clone)]
pub struct DockerEngine {
    docker: Docker,
}

impl DockerEngine {
    /// Connect using `DOCKER_HOST` or the platform's default socket.
    pub fn connect() -> EngineResult<Self> {
        let docker = Docker::connect_with_local_defaults()
            .map_err(|e| EngineError::Unavailable(e.to_string()))?;
        Ok(Self { docker })
    }
}

fn map_bollard(id: &str, err: bollard::errors::Error) -> EngineError {
    match err {
        bollard::errors::Error::DockerResponseServerError {
            status_code: 404, ..
        } => EngineError::NotFound(id.to_string()),
        bollard::errors::Error::HyperResponseError { .. }
        | bollard::errors::Error::IOError { .. } => EngineError::Unavailable(err.to_string()),
        other => EngineError::Engine(other.to_string()),
    }
}

fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

#[async_trait]
impl ContainerEngine for DockerEngine {
    async fn image_exists(&self, image: &str) -> EngineResult<bool> {
        match self.docker.inspect_image(image).await {
            Ok(_) => Ok(true),
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => Ok(false),
            Err(e) => Err(map_bollard(image, e)),
        }
    }

    async fn pull_image(&self, image: &str) -> EngineResult<()> {
        info!(%image, "pulling image");
        let options = CreateImageOptions {
            from_image: image,
            ..Default::default()
        };
        self.docker
            .create_image(Some(options), None, None)
            .try_for_each(|progress| async move {
                if let Some(status) = progress.status {
                    debug!(%status, "pull progress");
                }
                Ok(())
            })
            .await
            .map_err(|e| EngineError::Pull {
                image: image.to_string(),
                reason: e.to_string(),
            })
    }

    async fn create_container(&self, spec: &ContainerSpec) -> EngineResult<String> {
        let mut exposed_ports = HashMap::new();
        let mut port_bindings = HashMap::new();
        for port in &spec.ports {
            for proto in ["tcp", "udp"] {
                let key = format!("{}/{proto}", port.container_port);
                exposed_ports.insert(key.clone(), HashMap::new());
                port_bindings.insert(
                    key,
                    Some(vec![PortBinding {
                        host_ip: Some("0.0.0.0".to_string()),
                        host_port: Some(port.host_port.to_string()),
                    }]),
                );
            }
        }

        let host_config = HostConfig {
            binds: Some(spec.binds.clone()),
            memory: Some(spec.memory_bytes),
            memory_swap: Some(spec.memory_swap_bytes),
            cpu_period: Some(spec.cpu_period),
            cpu_quota: (spec.cpu_quota > 0).then_some(spec.cpu_quota),
            port_bindings: Some(port_bindings),
            ..Default::default()
        };

        let config = Config {
            image: Some(spec.image.clone()),
            env: Some(spec.env.clone()),
            labels: Some(spec.labels.clone()),
            exposed_ports: Some(exposed_ports),
            host_config: Some(host_config),
            tty: Some(true),
            open_stdin: Some(true),
            ..Default::default()
        };

        let options = CreateContainerOptions {
            name: spec.name.clone(),
            platform: None,
        };

        let response = self
            .docker
            .create_container(Some(options), config)
            .await
            .map_err(|e| map_bollard(&spec.name, e))?;
        for warning in &response.warnings {
            debug!(container = %spec.name, %warning, "engine warning on create");
        }
        Ok(response.id)
    }

    async fn start_container(&self, id: &str) -> EngineResult<()> {
        self.docker
            .start_container::<String>(id, None)
            .await
            .map_err(|e| map_bollard(id, e))
    }

    async fn stop_container(&self, id: &str, timeout: Duration) -> EngineResult<()> {
        let options = StopContainerOptions {
            t: timeout.as_secs() as i64,
        };
        match self.docker.stop_container(id, Some(options)).await {
            Ok(()) => Ok(()),
            // 304: already stopped.
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 304, ..
            }) => Ok(()),
            Err(e) => Err(map_bollard(id, e)),
        }
    }

    async fn remove_container(&self, id: &str, force: bool) -> EngineResult<()> {
        let options = RemoveContainerOptions {
            force,
            v: false,
            link: false,
        };
        self.docker
            .remove_container(id, Some(options))
            .await
            .map_err(|e| map_bollard(id, e))
    }

    async fn inspect_container(&self, id: &str) -> EngineResult<ContainerInfo> {
        let inspect = self
            .docker
            .inspect_container(id, None::<InspectContainerOptions>)
            .await
            .map_err(|e| map_bollard(id, e))?;
        let state = inspect.state.unwrap_or_default();
        let run_state = state
            .status
            .map(|s| RunState::parse(&s.to_string()))
            .unwrap_or(RunState::Unknown);
        Ok(ContainerInfo {
            id: inspect.id.unwrap_or_else(|| id.to_string()),
            state: run_state,
            exit_code: state.exit_code,
            oom_killed: state.oom_killed.unwrap_or(false),
            error: state.error.filter(|e| !e.is_empty()),
        })
    }

    async fn find_by_label(&self, key: &str, value: &str) -> EngineResult<Option<ContainerSummary>> {
        let filter = format!("{key}={value}");
        Ok(self.query_labeled(key, filter).await?.into_iter().next())
    }

    async fn list_labeled(&self, key: &str) -> EngineResult<Vec<ContainerSummary>> {
        self.query_labeled(key, key.to_string()).await
    }

    async fn stats(&self, id: &str) -> EngineResult<EngineStats> {
        // Non one-shot so the daemon fills in `precpu_stats`.
        let options = StatsOptions {
            stream: false,
            one_shot: false,
        };
        let stream = self.docker.stats(id, Some(options));
        let mut stream = std::pin::pin!(stream);
        let stats = stream
            .next()
            .await
            .ok_or_else(|| EngineError::Engine(format!("no stats for {id}")))?
            .map_err(|e| map_bollard(id, e))?;
        Ok(decode_stats(&stats))
    }

    async fn logs(&self, id: &str, tail: u32) -> EngineResult<LogStream> {
        // Fail fast on unknown containers; the log endpoint itself only
        // errors once polled.
        self.inspect_container(id).await?;
        let options = LogsOptions::<String> {
            follow: true,
            stdout: true,
            stderr: true,
            tail: tail.to_string(),
            ..Default::default()
        };
        let owned_id = id.to_string();
        let stream = self.docker.logs(id, Some(options)).map(move |item| {
            item.map(|output| LogLine {
                text: output.to_string().trim_end_matches(['\r', '\n']).to_string(),
                timestamp_ms: now_ms(),
            })
            .map_err(|e| map_bollard(&owned_id, e))
        });
        Ok(stream.boxed())
    }

    async fn exec_detached(&self, id: &str, cmd: Vec<String>) -> EngineResult<()> {
        let exec = self
            .docker
            .create_exec(
                id,
                CreateExecOptions {
                    cmd: Some(cmd),
                    attach_stdout: Some(false),
                    attach_stderr: Some(false),
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| map_bollard(id, e))?;
        self.docker
            .start_exec(
                &exec.id,
                Some(StartExecOptions {
                    detach: true,
                    ..Default::default()
                }),
            )
            .await
            .map_err(|e| map_bollard(id, e))?;
        Ok(())
    }

    async fn info(&self) -> EngineResult<EngineInfo> {
        let info = self
            .docker
            .info()
            .await
            .map_err(|e| EngineError::Unavailable(e.to_string()))?;
        Ok(EngineInfo {
            cpu_cores: info.ncpu.unwrap_or(0).max(0) as u32,
            memory_total_bytes: info.mem_total.unwrap_or(0).max(0) as u64,
        })
    }
}

impl DockerEngine {
    async fn query_labeled(&self, key: &str, filter: String) -> EngineResult<Vec<ContainerSummary>> {
        let mut filters = HashMap::new();
        filters.insert("label".to_string(), vec![filter]);
        let options = ListContainersOptions::<String> {
            all: true,
            filters,
            ..Default::default()
        };
        let containers = self
            .docker
            .list_containers(Some(options))
            .await
            .map_err(|e| map_bollard(key, e))?;
        Ok(containers
            .into_iter()
            .filter_map(|c| {
                let id = c.id?;
                Some(ContainerSummary {
                    workload_id: c.labels.and_then(|mut l| l.remove(key)),
                    state: c
                        .state
                        .as_deref()
                        .map(RunState::parse)
                        .unwrap_or(RunState::Unknown),
                    id,
                })
            })
            .collect())
    }
}

/// Decode the full usage report returned by the stats endpoint.
fn decode_stats(stats: &Stats) -> EngineStats {
    let cpu = CpuSample {
        total_usage_ns: stats.cpu_stats.cpu_usage.total_usage,
        system_usage_ns: stats.cpu_stats.system_cpu_usage.unwrap_or(0),
        online_cpus: online_cpus(&stats.cpu_stats),
    };
    let pre = CpuSample {
        total_usage_ns: stats.precpu_stats.cpu_usage.total_usage,
        system_usage_ns: stats.precpu_stats.system_cpu_usage.unwrap_or(0),
        online_cpus: online_cpus(&stats.precpu_stats),
    };
    let precpu = (pre.system_usage_ns > 0).then_some(pre);

    let memory_cache_bytes = match &stats.memory_stats.stats {
        Some(MemoryStatsStats::V1(v1)) => v1.cache,
        Some(MemoryStatsStats::V2(v2)) => v2.inactive_file,
        None => 0,
    };

    let (network_rx_bytes, network_tx_bytes) = stats
        .networks
        .as_ref()
        .map(|nets| {
            nets.values()
                .fold((0u64, 0u64), |(rx, tx), n| (rx + n.rx_bytes, tx + n.tx_bytes))
        })
        .unwrap_or((0, 0));

    let (block_read_bytes, block_write_bytes) = stats
        .blkio_stats
        .io_service_bytes_recursive
        .as_ref()
        .map(|entries| {
            entries.iter().fold((0u64, 0u64), |(r, w), e| {
                match e.op.to_ascii_lowercase().as_str() {
                    "read" => (r + e.value, w),
                    "write" => (r, w + e.value),
                    _ => (r, w),
                }
            })
        })
        .unwrap_or((0, 0));

    EngineStats {
        cpu,
        precpu,
        memory_usage_bytes: stats.memory_stats.usage.unwrap_or(0),
        memory_cache_bytes,
        memory_limit_bytes: stats.memory_stats.limit.unwrap_or(0),
        network_rx_bytes,
        network_tx_bytes,
        block_read_bytes,
        block_write_bytes,
        pids: stats.pids_stats.current.unwrap_or(0),
    }
}

/// cgroup v1 daemons omit `online_cpus`; fall back to the per-cpu vector.
fn online_cpus(cpu: &bollard::container::CPUStats) -> u32 {
    cpu.online_cpus
        .map(|n| n as u32)
        .or_else(|| cpu.cpu_usage.percpu_usage.as_ref().map(|v| v.len() as u32))
        .unwrap_or(0)
}
