//! Transport security gate.
//!
//! The agent runs in exactly one of two modes:
//!
//! - **mutual TLS**: TLS 1.3 only, client certificates must chain to the
//!   configured CA. The handshake happens in a `tokio-rustls` acceptor in
//!   front of tonic, so no handler runs for an unauthenticated peer.
//! - **shared token**: plaintext transport, every request must carry
//!   `authorization: Bearer <token>`. Without a configured token the
//!   agent is open to anyone on the network.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_rustls::TlsAcceptor;
use tokio_rustls::server::TlsStream;
use tokio_stream::wrappers::{ReceiverStream, TcpListenerStream};
use tonic::metadata::{Ascii, MetadataValue};
use tonic::service::Interceptor;
use tonic::transport::Server;
use tonic::{Request, Status};
use tracing::{debug, info, warn};

use crate::proto::agent_service_server::AgentServiceServer;
use crate::service::AgentServer;
use crate::tls::{self, TlsFiles};

const AUTHORIZATION: &str = "authorization";
const BEARER: &str = "Bearer ";

/// How callers prove who they are.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthMode {
    MutualTls(TlsFiles),
    /// `None` accepts every caller.
    SharedToken(Option<String>),
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

/// Server-side interceptor checking the bearer token.
#[derive(Clone, Default)]
pub struct TokenGate {
    expected: Option<Arc<str>>,
}

impl TokenGate {
    pub fn new(token: Option<String>) -> Self {
        Self {
            expected: token.filter(|t| !t.is_empty()).map(Arc::from),
        }
    }

    /// Lets every request through.
    pub fn open() -> Self {
        Self::default()
    }

    pub fn is_open(&self) -> bool {
        self.expected.is_none()
    }
}

impl Interceptor for TokenGate {
    fn call(&mut self, request: Request<()>) -> Result<Request<()>, Status> {
        let Some(expected) = &self.expected else {
            return Ok(request);
        };
        let presented = request
            .metadata()
            .get(AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix(BEARER));
        match presented {
            Some(token) if constant_time_eq(token.as_bytes(), expected.as_bytes()) => Ok(request),
            Some(_) => Err(Status::unauthenticated("invalid bearer token")),
            None => Err(Status::unauthenticated("missing bearer token")),
        }
    }
}

/// Client-side interceptor attaching the bearer token, if any.
#[derive(Clone, Default)]
pub struct BearerToken {
    header: Option<MetadataValue<Ascii>>,
}

impl BearerToken {
    pub fn new(token: Option<&str>) -> Result<Self, tonic::metadata::errors::InvalidMetadataValue> {
        let header = token
            .filter(|t| !t.is_empty())
            .map(|t| format!("{BEARER}{t}").parse())
            .transpose()?;
        Ok(Self { header })
    }
}

impl Interceptor for BearerToken {
    fn call(&mut self, mut request: Request<()>) -> Result<Request<()>, Status> {
        if let Some(header) = &self.header {
            request.metadata_mut().insert(AUTHORIZATION, header.clone());
        }
        Ok(request)
    }
}

/// Accept connections on `listener` until `shutdown` resolves.
pub async fn serve<F>(
    listener: TcpListener,
    agent: AgentServer,
    mode: AuthMode,
    shutdown: F,
) -> anyhow::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let addr = listener.local_addr()?;
    match mode {
        AuthMode::MutualTls(files) => {
            tls::install_crypto_provider();
            let config = tls::server_config(&files)?;
            info!(%addr, ca = %files.ca.display(), "agent listening with mutual TLS");
            let service = AgentServiceServer::with_interceptor(agent, TokenGate::open());
            Server::builder()
                .add_service(service)
                .serve_with_incoming_shutdown(tls_incoming(listener, TlsAcceptor::from(config)), shutdown)
                .await?;
        }
        AuthMode::SharedToken(token) => {
            let gate = TokenGate::new(token);
            if gate.is_open() {
                warn!(%addr, "no shared token configured, agent accepts unauthenticated requests");
            } else {
                info!(%addr, "agent listening with shared-token authentication");
            }
            let service = AgentServiceServer::with_interceptor(agent, gate);
            Server::builder()
                .add_service(service)
                .serve_with_incoming_shutdown(TcpListenerStream::new(listener), shutdown)
                .await?;
        }
    }
    info!(%addr, "agent stopped");
    Ok(())
}

/// Completed TLS handshakes from `listener`.
///
/// Each handshake runs in its own task so a slow or hostile peer cannot
/// hold up the accept loop. Failed handshakes are dropped.
fn tls_incoming(
    listener: TcpListener,
    acceptor: TlsAcceptor,
) -> ReceiverStream<Result<TlsStream<TcpStream>, std::io::Error>> {
    let (tx, rx) = mpsc::channel(64);
    tokio::spawn(async move {
        loop {
            let (tcp, peer) = tokio::select! {
                _ = tx.closed() => break,
                accepted = listener.accept() => match accepted {
                    Ok(conn) => conn,
                    Err(e) => {
                        warn!(error = %e, "accept failed");
                        tokio::time::sleep(Duration::from_millis(100)).await;
                        continue;
                    }
                },
            };
            let acceptor = acceptor.clone();
            let tx = tx.clone();
            tokio::spawn(async move {
                match acceptor.accept(tcp).await {
                    Ok(stream) => {
                        let _ = tx.send(Ok(stream)).await;
                    }
                    Err(e) => debug!(%peer, error = %e, "TLS handshake rejected"),
                }
            });
        }
    });
    ReceiverStream::new(rx)
}
