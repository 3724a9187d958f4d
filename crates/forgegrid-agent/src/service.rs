//! Agent gRPC service.
//!
//! Implements `AgentService` on top of the [`LifecycleManager`]. Mutating
//! calls answer with `success`/`error`/`not_found` in the body; gRPC
//! statuses are reserved for transport problems, bad arguments on the
//! streaming call, and authentication (see [`crate::auth`]).

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use futures_util::StreamExt;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tonic::{Request, Response, Status};
use tracing::{debug, warn};

use crate::engine::PublishedPort;
use crate::error::{LifecycleError, LifecycleResult};
use crate::lifecycle::{CreateWorkload, LifecycleManager, WorkloadReport, WorkloadState, now_ms};
use crate::proto;
use crate::proto::agent_service_server::AgentService;

/// Buffered console lines per stream before the reader waits on the client.
const CONSOLE_BUFFER: usize = 256;

/// gRPC implementation of the agent service.
pub struct AgentServer {
    node_id: String,
    lifecycle: Arc<LifecycleManager>,
    started: Instant,
    console_readers: Arc<AtomicUsize>,
}

impl AgentServer {
    pub fn new(node_id: impl Into<String>, lifecycle: Arc<LifecycleManager>) -> Self {
        Self {
            node_id: node_id.into(),
            lifecycle,
            started: Instant::now(),
            console_readers: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Live console reader tasks. The counter is shared, so it stays
    /// readable after the server has been handed to tonic.
    pub fn console_readers(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.console_readers)
    }
}

/// Decrements a gauge when the owning task ends.
struct GaugeGuard(Arc<AtomicUsize>);

impl GaugeGuard {
    fn enter(gauge: &Arc<AtomicUsize>) -> Self {
        gauge.fetch_add(1, Ordering::SeqCst);
        Self(Arc::clone(gauge))
    }
}

impl Drop for GaugeGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

fn action(workload_id: &str, op: &str, result: LifecycleResult<()>) -> proto::ActionResponse {
    match result {
        Ok(()) => proto::ActionResponse {
            success: true,
            ..Default::default()
        },
        Err(e) => {
            warn!(%workload_id, op, error = %e, "workload operation failed");
            proto::ActionResponse {
                success: false,
                not_found: e.is_not_found(),
                error: e.to_string(),
            }
        }
    }
}

fn to_proto_state(state: WorkloadState) -> proto::WorkloadState {
    match state {
        WorkloadState::Installing => proto::WorkloadState::Installing,
        WorkloadState::Running => proto::WorkloadState::Running,
        WorkloadState::Offline => proto::WorkloadState::Offline,
        WorkloadState::Errored => proto::WorkloadState::Errored,
    }
}

fn to_proto_status(report: WorkloadReport) -> proto::WorkloadStatus {
    proto::WorkloadStatus {
        workload_id: report.workload_id,
        state: to_proto_state(report.state).into(),
        cpu_percent: report.cpu_percent,
        memory_bytes: report.memory_bytes,
        memory_limit_bytes: report.memory_limit_bytes,
        timestamp_ms: report.timestamp_ms,
        container_id: report.container_id.unwrap_or_default(),
        error: report.error.unwrap_or_default(),
    }
}

fn to_status(e: LifecycleError) -> Status {
    match e {
        LifecycleError::InvalidId(_) => Status::invalid_argument(e.to_string()),
        e if e.is_not_found() => Status::not_found(e.to_string()),
        e => Status::internal(e.to_string()),
    }
}

fn port(value: u32, field: &str) -> Result<u16, String> {
    u16::try_from(value).map_err(|_| format!("{field} {value} is not a valid port"))
}

fn create_request(req: proto::CreateWorkloadRequest) -> Result<CreateWorkload, String> {
    let mut ports = Vec::with_capacity(req.ports.len());
    for binding in &req.ports {
        let host_port = port(binding.host_port, "host_port")?;
        if host_port == 0 {
            return Err("host_port must be set".to_string());
        }
        ports.push(PublishedPort {
            host_port,
            container_port: port(binding.container_port, "container_port")?,
        });
    }
    Ok(CreateWorkload {
        id: req.id,
        name: req.name,
        image: Some(req.image).filter(|i| !i.is_empty()),
        memory_mb: req.memory_mb,
        cpu_percent: req.cpu_percent,
        env: req.env,
        ports,
        disk_mb: req.disk_mb,
    })
}

#[tonic::async_trait]
impl AgentService for AgentServer {
    async fn create_workload(
        &self,
        request: Request<proto::CreateWorkloadRequest>,
    ) -> Result<Response<proto::CreateWorkloadResponse>, Status> {
        let req = request.into_inner();
        let requested_id = req.id.clone();
        let failed = |error: String| proto::CreateWorkloadResponse {
            success: false,
            workload_id: requested_id.clone(),
            container_id: String::new(),
            error,
        };

        let create = match create_request(req) {
            Ok(create) => create,
            Err(error) => return Ok(Response::new(failed(error))),
        };
        match self.lifecycle.create(create).await {
            Ok(created) => Ok(Response::new(proto::CreateWorkloadResponse {
                success: true,
                workload_id: created.workload_id,
                container_id: created.container_id,
                error: String::new(),
            })),
            Err(e) => {
                warn!(workload_id = %requested_id, error = %e, "create failed");
                Ok(Response::new(failed(e.to_string())))
            }
        }
    }

    async fn start_workload(
        &self,
        request: Request<proto::WorkloadRef>,
    ) -> Result<Response<proto::ActionResponse>, Status> {
        let id = request.into_inner().workload_id;
        let result = self.lifecycle.start(&id).await;
        Ok(Response::new(action(&id, "start", result)))
    }

    async fn stop_workload(
        &self,
        request: Request<proto::StopWorkloadRequest>,
    ) -> Result<Response<proto::ActionResponse>, Status> {
        let req = request.into_inner();
        let timeout = (req.timeout_secs > 0).then(|| Duration::from_secs(u64::from(req.timeout_secs)));
        let result = self.lifecycle.stop(&req.workload_id, timeout).await;
        Ok(Response::new(action(&req.workload_id, "stop", result)))
    }

    async fn restart_workload(
        &self,
        request: Request<proto::WorkloadRef>,
    ) -> Result<Response<proto::ActionResponse>, Status> {
        let id = request.into_inner().workload_id;
        let result = self.lifecycle.restart(&id).await;
        Ok(Response::new(action(&id, "restart", result)))
    }

    async fn delete_workload(
        &self,
        request: Request<proto::DeleteWorkloadRequest>,
    ) -> Result<Response<proto::ActionResponse>, Status> {
        let req = request.into_inner();
        let result = self.lifecycle.delete(&req.workload_id, req.force).await;
        Ok(Response::new(action(&req.workload_id, "delete", result)))
    }

    async fn get_workload_status(
        &self,
        request: Request<proto::WorkloadRef>,
    ) -> Result<Response<proto::WorkloadStatus>, Status> {
        let id = request.into_inner().workload_id;
        let report = self.lifecycle.status(&id).await;
        Ok(Response::new(to_proto_status(report)))
    }

    async fn list_workloads(
        &self,
        _request: Request<proto::ListWorkloadsRequest>,
    ) -> Result<Response<proto::ListWorkloadsResponse>, Status> {
        let reports = self
            .lifecycle
            .list()
            .await
            .map_err(|e| Status::internal(e.to_string()))?;
        Ok(Response::new(proto::ListWorkloadsResponse {
            workloads: reports.into_iter().map(to_proto_status).collect(),
        }))
    }

    type StreamConsoleStream = ReceiverStream<Result<proto::ConsoleLine, Status>>;

    async fn stream_console(
        &self,
        request: Request<proto::StreamConsoleRequest>,
    ) -> Result<Response<Self::StreamConsoleStream>, Status> {
        let req = request.into_inner();
        let workload_id = req.workload_id;
        let mut logs = self
            .lifecycle
            .console(&workload_id, req.tail)
            .await
            .map_err(to_status)?;

        let (tx, rx) = mpsc::channel(CONSOLE_BUFFER);
        let guard = GaugeGuard::enter(&self.console_readers);
        debug!(%workload_id, "console stream opened");

        tokio::spawn(async move {
            let _guard = guard;
            loop {
                tokio::select! {
                    _ = tx.closed() => {
                        debug!(%workload_id, "console client went away");
                        break;
                    }
                    next = logs.next() => match next {
                        Some(Ok(line)) => {
                            let line = proto::ConsoleLine {
                                line: line.text,
                                timestamp_ms: line.timestamp_ms,
                            };
                            if tx.send(Ok(line)).await.is_err() {
                                break;
                            }
                        }
                        Some(Err(e)) => {
                            let _ = tx.send(Err(Status::internal(e.to_string()))).await;
                            break;
                        }
                        None => {
                            debug!(%workload_id, "console output ended");
                            break;
                        }
                    },
                }
            }
            // Release the engine stream before the gauge.
            drop(logs);
        });

        Ok(Response::new(ReceiverStream::new(rx)))
    }

    async fn send_command(
        &self,
        request: Request<proto::SendCommandRequest>,
    ) -> Result<Response<proto::ActionResponse>, Status> {
        let req = request.into_inner();
        let result = self.lifecycle.send_command(&req.workload_id, &req.command).await;
        Ok(Response::new(action(&req.workload_id, "command", result)))
    }

    async fn get_node_stats(
        &self,
        _request: Request<proto::NodeStatsRequest>,
    ) -> Result<Response<proto::NodeStats>, Status> {
        let report = self
            .lifecycle
            .node_stats()
            .await
            .map_err(|e| Status::internal(e.to_string()))?;
        Ok(Response::new(proto::NodeStats {
            node_id: self.node_id.clone(),
            running_workloads: report.running_workloads,
            total_workloads: report.total_workloads,
            cpu_cores: report.cpu_cores,
            memory_total_bytes: report.memory_total_bytes,
            disk_used_bytes: report.disk_used_bytes,
        }))
    }

    async fn ping(
        &self,
        _request: Request<proto::PingRequest>,
    ) -> Result<Response<proto::PingResponse>, Status> {
        Ok(Response::new(proto::PingResponse {
            node_id: self.node_id.clone(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            timestamp_ms: now_ms(),
            uptime_ms: self.started.elapsed().as_millis() as u64,
        }))
    }
}
