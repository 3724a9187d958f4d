//! Connection pool — one authenticated gRPC channel per node.
//!
//! Channels are created on first use from the node's stored address and
//! credentials, then shared: a tonic `Channel` multiplexes concurrent
//! calls over one HTTP/2 connection, so callers just clone the client.
//!
//! A channel is evicted when a call fails in a way that suggests the
//! connection is gone (transport error, `Unavailable`, deadline), and the
//! next call reconnects. Each channel carries a generation number so a
//! late failure on an old channel never evicts its replacement.
//! [`ConnectionPool::shutdown`] drops every channel
//! and makes later calls fail with [`PoolError::Closed`]; calls already
//! in flight hold their own clone and finish or time out on their own.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use forgegrid_agent::BearerToken;
use forgegrid_agent::proto::agent_service_client::AgentServiceClient;
use forgegrid_agent::proto::{PingRequest, PingResponse};
use forgegrid_state::{Node, NodeAuth, StateStore};
use tokio::sync::RwLock;
use tonic::service::interceptor::InterceptedService;
use tonic::transport::{Certificate, Channel, ClientTlsConfig, Endpoint, Identity};
use tonic::{Code, Response, Status};
use tracing::{debug, info, warn};

use crate::error::{PoolError, PoolResult};

/// Client handed out by the pool.
pub type AgentClient = AgentServiceClient<InterceptedService<Channel, BearerToken>>;

/// Timeouts and retry policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolConfig {
    /// Per attempt.
    pub connect_timeout: Duration,
    /// Deadline for a single RPC, or for the first response of a stream.
    pub rpc_timeout: Duration,
    pub max_connect_attempts: u32,
    /// Base delay between connect attempts; attempt `n` waits `n × backoff`.
    pub retry_backoff: Duration,
    pub keepalive: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(5),
            rpc_timeout: Duration::from_secs(30),
            max_connect_attempts: 3,
            retry_backoff: Duration::from_millis(250),
            keepalive: Duration::from_secs(30),
        }
    }
}

/// A connected client and the generation it was stored under.
#[derive(Clone)]
struct Pooled {
    generation: u64,
    client: AgentClient,
}

pub struct ConnectionPool {
    state: StateStore,
    config: PoolConfig,
    /// node_id → connected client.
    clients: RwLock<HashMap<String, Pooled>>,
    next_generation: AtomicU64,
    closed: AtomicBool,
}

/// Whether a failed call means the channel should be rebuilt.
fn should_evict(status: &Status) -> bool {
    matches!(status.code(), Code::Unavailable | Code::Unknown)
}

impl ConnectionPool {
    pub fn new(state: StateStore, config: PoolConfig) -> Self {
        Self {
            state,
            config,
            clients: RwLock::new(HashMap::new()),
            next_generation: AtomicU64::new(1),
            closed: AtomicBool::new(false),
        }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Nodes with a live channel, sorted.
    pub async fn connected_nodes(&self) -> Vec<String> {
        let mut nodes: Vec<String> = self.clients.read().await.keys().cloned().collect();
        nodes.sort();
        nodes
    }

    /// Client for `node_id`, connecting if needed.
    pub async fn client(&self, node_id: &str) -> PoolResult<AgentClient> {
        Ok(self.checkout(node_id).await?.client)
    }

    async fn checkout(&self, node_id: &str) -> PoolResult<Pooled> {
        if self.is_closed() {
            return Err(PoolError::Closed);
        }
        if let Some(pooled) = self.clients.read().await.get(node_id) {
            return Ok(pooled.clone());
        }

        let node = self
            .state
            .get_node(node_id)?
            .ok_or_else(|| PoolError::UnknownNode(node_id.to_string()))?;
        // Connect without holding the lock; a racing caller may win.
        let client = self.connect(&node).await?;
        self.store(node_id, client).await
    }

    /// Keep `client` for `node_id` unless another caller stored one first.
    async fn store(&self, node_id: &str, client: AgentClient) -> PoolResult<Pooled> {
        let mut clients = self.clients.write().await;
        if self.is_closed() {
            return Err(PoolError::Closed);
        }
        Ok(clients
            .entry(node_id.to_string())
            .or_insert_with(|| Pooled {
                generation: self.next_generation.fetch_add(1, Ordering::SeqCst),
                client,
            })
            .clone())
    }

    async fn endpoint(&self, node: &Node) -> PoolResult<(Endpoint, Option<String>)> {
        let invalid = |reason: String| PoolError::InvalidEndpoint {
            node_id: node.id.clone(),
            reason,
        };
        let mut endpoint = Endpoint::from_shared(node.endpoint_uri())
            .map_err(|e| invalid(e.to_string()))?
            .connect_timeout(self.config.connect_timeout)
            .tcp_keepalive(Some(self.config.keepalive))
            .http2_keep_alive_interval(self.config.keepalive)
            .keep_alive_while_idle(true);

        let token = match &node.auth {
            NodeAuth::Certificate {
                ca_cert,
                client_cert,
                client_key,
                domain,
            } => {
                let read = |path: &std::path::Path| {
                    let path = path.to_path_buf();
                    async move {
                        tokio::fs::read(&path).await.map_err(|e| PoolError::Credentials {
                            node_id: node.id.clone(),
                            reason: format!("{}: {e}", path.display()),
                        })
                    }
                };
                let ca = read(ca_cert).await?;
                let cert = read(client_cert).await?;
                let key = read(client_key).await?;
                let tls = ClientTlsConfig::new()
                    .ca_certificate(Certificate::from_pem(ca))
                    .identity(Identity::from_pem(cert, key))
                    .domain_name(domain.clone().unwrap_or_else(|| node.address.clone()));
                endpoint = endpoint.tls_config(tls).map_err(|e| invalid(e.to_string()))?;
                None
            }
            NodeAuth::Token { token } => Some(token.clone()),
            NodeAuth::None => None,
        };
        Ok((endpoint, token))
    }

    async fn connect(&self, node: &Node) -> PoolResult<AgentClient> {
        forgegrid_agent::tls::install_crypto_provider();
        let (endpoint, token) = self.endpoint(node).await?;
        let bearer = BearerToken::new(token.as_deref()).map_err(|e| PoolError::Credentials {
            node_id: node.id.clone(),
            reason: e.to_string(),
        })?;

        let attempts = self.config.max_connect_attempts.max(1);
        let mut attempt = 1;
        loop {
            match endpoint.connect().await {
                Ok(channel) => {
                    info!(node_id = %node.id, uri = %node.endpoint_uri(), attempt, "connected to agent");
                    return Ok(AgentServiceClient::with_interceptor(channel, bearer));
                }
                Err(source) if attempt >= attempts => {
                    return Err(PoolError::Connect {
                        node_id: node.id.clone(),
                        attempts,
                        source,
                    });
                }
                Err(e) => {
                    warn!(node_id = %node.id, attempt, error = %e, "agent connect failed, retrying");
                    tokio::time::sleep(self.config.retry_backoff * attempt).await;
                    attempt += 1;
                }
            }
        }
    }

    /// Drop the node's channel if it is still the one from `generation`.
    /// Returns whether it was dropped.
    async fn evict(&self, node_id: &str, generation: u64) -> bool {
        let mut clients = self.clients.write().await;
        let current = clients.get(node_id).map(|p| p.generation);
        if current != Some(generation) {
            return false;
        }
        clients.remove(node_id);
        debug!(%node_id, generation, "channel evicted");
        true
    }

    /// Run one RPC against `node_id` under the per-call deadline.
    pub async fn call<T, F, Fut>(&self, node_id: &str, f: F) -> PoolResult<T>
    where
        F: FnOnce(AgentClient) -> Fut,
        Fut: Future<Output = Result<Response<T>, Status>>,
    {
        self.run(node_id, f, should_evict).await
    }

    async fn run<T, F, Fut>(
        &self,
        node_id: &str,
        f: F,
        evict_on: fn(&Status) -> bool,
    ) -> PoolResult<T>
    where
        F: FnOnce(AgentClient) -> Fut,
        Fut: Future<Output = Result<Response<T>, Status>>,
    {
        let Pooled { generation, client } = self.checkout(node_id).await?;
        let timeout = self.config.rpc_timeout;
        match tokio::time::timeout(timeout, f(client)).await {
            Ok(Ok(response)) => Ok(response.into_inner()),
            Ok(Err(status)) => {
                if evict_on(&status) {
                    self.evict(node_id, generation).await;
                }
                Err(PoolError::Rpc {
                    node_id: node_id.to_string(),
                    status,
                })
            }
            Err(_) => {
                self.evict(node_id, generation).await;
                Err(PoolError::Timeout {
                    node_id: node_id.to_string(),
                    timeout,
                })
            }
        }
    }

    /// Ping a node. Any failed ping evicts its channel.
    pub async fn probe(&self, node_id: &str) -> PoolResult<PingResponse> {
        self.run(node_id, |mut c| async move { c.ping(PingRequest {}).await }, |_| true)
            .await
    }

    /// Close every channel. Later calls fail with [`PoolError::Closed`].
    pub async fn shutdown(&self) {
        self.closed.store(true, Ordering::SeqCst);
        let dropped = {
            let mut clients = self.clients.write().await;
            let n = clients.len();
            clients.clear();
            n
        };
        info!(channels = dropped, "connection pool shut down");
    }
}
