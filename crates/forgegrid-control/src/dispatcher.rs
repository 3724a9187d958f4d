//! Dispatcher — applies server operations to the ledger and the agents.
//!
//! Creating a server is a two-phase operation:
//!
//! ```text
//! reserve_placement ──► CreateWorkload ──► set_container_id ──► StartWorkload ──► running
//!        │                    │ failure / timeout                    │ failure
//!        │                    ▼                                      ▼
//!        │             (timeout: force delete)               force delete
//!        │                    └──────────────► rollback_placement ◄──┘
//!        ▼
//!   LedgerError: nothing dispatched
//! ```
//!
//! Capacity and port conflicts are rejected by the ledger before any
//! network traffic. Once the agent call starts, every failure ends in a
//! rollback, so the caller sees either a running server or an error with
//! the ledger unchanged.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use forgegrid_agent::proto::{
    ConsoleLine, CreateWorkloadRequest, DeleteWorkloadRequest, PortBinding, SendCommandRequest,
    StopWorkloadRequest, StreamConsoleRequest, WorkloadRef, WorkloadState, WorkloadStatus,
};
use forgegrid_state::{LedgerError, PlacementRequest, Server, ServerStatus, StateStore};
use tonic::Streaming;
use tracing::{info, warn};

use crate::error::{DispatchError, DispatchResult, PoolError};
use crate::pool::ConnectionPool;

/// A new server as requested by an operator.
#[derive(Debug, Clone, Default)]
pub struct ServerRequest {
    pub name: String,
    /// Picked by the ledger when absent.
    pub node_id: Option<String>,
    /// Lowest free allocation when absent.
    pub port: Option<u16>,
    pub memory_mb: u64,
    pub disk_mb: u64,
    pub cpu_percent: u32,
    /// Agent default image when absent.
    pub image: Option<String>,
    pub env: HashMap<String, String>,
}

pub struct Dispatcher {
    state: StateStore,
    pool: Arc<ConnectionPool>,
}

fn epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Whole seconds for the wire, where 0 asks the agent for its default.
/// A sub-second timeout rounds up to one second.
fn stop_timeout_secs(timeout: Option<Duration>) -> u32 {
    timeout
        .map(|t| u32::try_from(t.as_secs()).unwrap_or(u32::MAX).max(1))
        .unwrap_or(0)
}

fn unavailable(node_id: &str, source: PoolError) -> DispatchError {
    DispatchError::NodeUnavailable {
        node_id: node_id.to_string(),
        source,
    }
}

impl Dispatcher {
    pub fn new(state: StateStore, pool: Arc<ConnectionPool>) -> Self {
        Self { state, pool }
    }

    pub fn state(&self) -> &StateStore {
        &self.state
    }

    fn server(&self, server_id: &str) -> DispatchResult<Server> {
        Ok(self
            .state
            .get_server(server_id)?
            .ok_or_else(|| LedgerError::ServerNotFound(server_id.to_string()))?)
    }

    /// Place, create and start a new server.
    pub async fn create_server(&self, req: ServerRequest) -> DispatchResult<Server> {
        let server_id = uuid::Uuid::new_v4().simple().to_string();
        let placement = PlacementRequest {
            server_id: server_id.clone(),
            name: req.name,
            node_id: req.node_id,
            port: req.port,
            memory_mb: req.memory_mb,
            disk_mb: req.disk_mb,
            cpu_percent: req.cpu_percent,
            image: req.image.unwrap_or_default(),
            env: req.env,
        };

        // Phase one: capacity and port, nothing leaves this process yet.
        let reservation = self.state.reserve_placement(&placement, epoch_secs())?;
        let server = reservation.server;
        let node_id = server.node_id.clone();

        // Phase two: the agent.
        let container_id = match self.dispatch_create(&server).await {
            Ok(id) => id,
            Err(e) => {
                // A create that timed out may still finish on the agent.
                let timed_out = matches!(
                    &e,
                    DispatchError::NodeUnavailable {
                        source: PoolError::Timeout { .. },
                        ..
                    }
                );
                self.rollback(&server.id, &node_id, timed_out).await;
                return Err(e);
            }
        };
        if let Err(e) = self
            .state
            .set_container_id(&server.id, &container_id, epoch_secs())
        {
            warn!(server_id = %server.id, %node_id, error = %e, "recording container failed");
            self.rollback(&server.id, &node_id, true).await;
            return Err(e.into());
        }

        if let Err(e) = self.dispatch_start(&node_id, &server.id).await {
            warn!(server_id = %server.id, %node_id, error = %e, "start after create failed");
            self.rollback(&server.id, &node_id, true).await;
            return Err(e);
        }

        let server = match self.state.update_server_status(
            &server.id,
            ServerStatus::Running,
            None,
            epoch_secs(),
        ) {
            Ok(server) => server,
            Err(e) => {
                warn!(server_id = %server.id, %node_id, error = %e, "recording running state failed");
                self.rollback(&server.id, &node_id, true).await;
                return Err(e.into());
            }
        };
        info!(
            server_id = %server.id,
            %node_id,
            port = server.port,
            %container_id,
            "server running"
        );
        Ok(server)
    }

    async fn dispatch_create(&self, server: &Server) -> DispatchResult<String> {
        let request = CreateWorkloadRequest {
            id: server.id.clone(),
            name: server.name.clone(),
            image: server.image.clone(),
            memory_mb: server.memory_mb,
            cpu_percent: server.cpu_percent,
            env: server.env.clone(),
            ports: vec![PortBinding {
                host_port: u32::from(server.port),
                container_port: 0,
            }],
            disk_mb: server.disk_mb,
        };
        let response = self
            .pool
            .call(&server.node_id, |mut c| async move {
                c.create_workload(request).await
            })
            .await
            .map_err(|e| unavailable(&server.node_id, e))?;
        if !response.success {
            return Err(DispatchError::Agent {
                node_id: server.node_id.clone(),
                op: "create",
                message: response.error,
            });
        }
        Ok(response.container_id)
    }

    async fn dispatch_start(&self, node_id: &str, server_id: &str) -> DispatchResult<()> {
        let workload_id = server_id.to_string();
        let response = self
            .pool
            .call(node_id, |mut c| async move {
                c.start_workload(WorkloadRef { workload_id }).await
            })
            .await
            .map_err(|e| unavailable(node_id, e))?;
        if !response.success {
            return Err(DispatchError::Agent {
                node_id: node_id.to_string(),
                op: "start",
                message: response.error,
            });
        }
        Ok(())
    }

    /// Give the reservation back. With `remove_container` the agent is first
    /// asked to force-delete whatever it may have created; that call is
    /// best effort.
    async fn rollback(&self, server_id: &str, node_id: &str, remove_container: bool) {
        if remove_container {
            let workload_id = server_id.to_string();
            let deleted = self
                .pool
                .call(node_id, |mut c| async move {
                    c.delete_workload(DeleteWorkloadRequest {
                        workload_id,
                        force: true,
                    })
                    .await
                })
                .await;
            if let Err(e) = deleted {
                warn!(%server_id, %node_id, error = %e, "cleanup delete failed, container may be orphaned");
            }
        }
        match self.state.rollback_placement(server_id) {
            Ok(rolled_back) => info!(%server_id, %node_id, rolled_back, "placement rolled back"),
            Err(e) => warn!(%server_id, %node_id, error = %e, "placement rollback failed"),
        }
    }

    fn record_failure(&self, server: &Server, message: &str) {
        if let Err(e) = self.state.update_server_status(
            &server.id,
            ServerStatus::Errored,
            Some(message.to_string()),
            epoch_secs(),
        ) {
            warn!(server_id = %server.id, error = %e, "could not record failure");
        }
    }

    /// Run a workload action and turn agent refusals into errors. Agent
    /// failures are also recorded on the server as `errored`.
    async fn action<F, Fut>(&self, server: &Server, op: &'static str, f: F) -> DispatchResult<()>
    where
        F: FnOnce(crate::pool::AgentClient, String) -> Fut,
        Fut: std::future::Future<
                Output = Result<tonic::Response<forgegrid_agent::proto::ActionResponse>, tonic::Status>,
            >,
    {
        let workload_id = server.id.clone();
        let response = self
            .pool
            .call(&server.node_id, |c| f(c, workload_id))
            .await
            .map_err(|e| unavailable(&server.node_id, e))?;
        if response.success {
            return Ok(());
        }
        self.record_failure(server, &response.error);
        Err(DispatchError::Agent {
            node_id: server.node_id.clone(),
            op,
            message: response.error,
        })
    }

    fn live_server(&self, server_id: &str) -> DispatchResult<Server> {
        let server = self.server(server_id)?;
        if server.status == ServerStatus::Removed {
            return Err(LedgerError::ServerNotFound(server_id.to_string()).into());
        }
        if server.container_id.is_none() {
            return Err(DispatchError::NoContainer(server_id.to_string()));
        }
        Ok(server)
    }

    pub async fn start_server(&self, server_id: &str) -> DispatchResult<Server> {
        let server = self.live_server(server_id)?;
        self.action(&server, "start", |mut c, workload_id| async move {
            c.start_workload(WorkloadRef { workload_id }).await
        })
        .await?;
        Ok(self
            .state
            .update_server_status(server_id, ServerStatus::Running, None, epoch_secs())?)
    }

    /// Graceful stop; `timeout` `None` lets the agent use its default.
    pub async fn stop_server(&self, server_id: &str, timeout: Option<Duration>) -> DispatchResult<Server> {
        let server = self.live_server(server_id)?;
        let timeout_secs = stop_timeout_secs(timeout);
        self.action(&server, "stop", |mut c, workload_id| async move {
            c.stop_workload(StopWorkloadRequest {
                workload_id,
                timeout_secs,
            })
            .await
        })
        .await?;
        Ok(self
            .state
            .update_server_status(server_id, ServerStatus::Offline, None, epoch_secs())?)
    }

    pub async fn restart_server(&self, server_id: &str) -> DispatchResult<Server> {
        let server = self.live_server(server_id)?;
        self.action(&server, "restart", |mut c, workload_id| async move {
            c.restart_workload(WorkloadRef { workload_id }).await
        })
        .await?;
        Ok(self
            .state
            .update_server_status(server_id, ServerStatus::Running, None, epoch_secs())?)
    }

    /// Force-delete the container and release the server's resources.
    ///
    /// A workload the agent no longer knows is treated as deleted.
    pub async fn delete_server(&self, server_id: &str) -> DispatchResult<Server> {
        let server = self.server(server_id)?;
        if server.status == ServerStatus::Removed {
            return Ok(server);
        }
        if server.container_id.is_some() {
            let workload_id = server.id.clone();
            let response = self
                .pool
                .call(&server.node_id, |mut c| async move {
                    c.delete_workload(DeleteWorkloadRequest {
                        workload_id,
                        force: true,
                    })
                    .await
                })
                .await
                .map_err(|e| unavailable(&server.node_id, e))?;
            if !response.success && !response.not_found {
                return Err(DispatchError::Agent {
                    node_id: server.node_id.clone(),
                    op: "delete",
                    message: response.error,
                });
            }
        }
        let released = self.state.release_server(server_id, epoch_secs())?;
        info!(%server_id, node_id = %released.node_id, "server deleted");
        Ok(released)
    }

    /// Ask the agent for the current state and persist what it observed.
    pub async fn refresh_status(&self, server_id: &str) -> DispatchResult<(Server, WorkloadStatus)> {
        let server = self.server(server_id)?;
        let workload_id = server.id.clone();
        let status = self
            .pool
            .call(&server.node_id, |mut c| async move {
                c.get_workload_status(WorkloadRef { workload_id }).await
            })
            .await
            .map_err(|e| unavailable(&server.node_id, e))?;

        let observed = match status.state() {
            WorkloadState::Running => Some(ServerStatus::Running),
            WorkloadState::Offline => Some(ServerStatus::Offline),
            WorkloadState::Errored => Some(ServerStatus::Errored),
            _ => None,
        };
        let error = (!status.error.is_empty()).then(|| status.error.clone());
        let server = match observed {
            Some(next) if next != server.status && server.status.can_transition_to(next) => self
                .state
                .update_server_status(server_id, next, error, epoch_secs())?,
            _ => server,
        };
        Ok((server, status))
    }

    /// Open the server's console stream.
    pub async fn console(&self, server_id: &str, tail: u32) -> DispatchResult<Streaming<ConsoleLine>> {
        let server = self.live_server(server_id)?;
        let workload_id = server.id.clone();
        self.pool
            .call(&server.node_id, |mut c| async move {
                c.stream_console(StreamConsoleRequest { workload_id, tail }).await
            })
            .await
            .map_err(|e| unavailable(&server.node_id, e))
    }

    pub async fn send_command(&self, server_id: &str, command: &str) -> DispatchResult<()> {
        let server = self.live_server(server_id)?;
        let workload_id = server.id.clone();
        let command = command.to_string();
        let response = self
            .pool
            .call(&server.node_id, |mut c| async move {
                c.send_command(SendCommandRequest {
                    workload_id,
                    command,
                })
                .await
            })
            .await
            .map_err(|e| unavailable(&server.node_id, e))?;
        if !response.success {
            return Err(DispatchError::Agent {
                node_id: server.node_id,
                op: "send command",
                message: response.error,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stop_timeout_is_clamped_for_the_wire() {
        assert_eq!(stop_timeout_secs(None), 0);
        assert_eq!(stop_timeout_secs(Some(Duration::from_millis(300))), 1);
        assert_eq!(stop_timeout_secs(Some(Duration::from_secs(45))), 45);
        assert_eq!(stop_timeout_secs(Some(Duration::from_secs(u64::MAX))), u32::MAX);
    }
}
