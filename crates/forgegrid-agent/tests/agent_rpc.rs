//! Agent RPC integration tests.
//!
//! Every test starts a real tonic server on `127.0.0.1:0` backed by the
//! in-memory engine and talks to it through the generated client.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use forgegrid_agent::engine::{FailPoint, MemoryEngine};
use forgegrid_agent::proto::agent_service_client::AgentServiceClient;
use forgegrid_agent::proto::{self, WorkloadState};
use forgegrid_agent::tls::{CertificateAuthority, TlsFiles};
use forgegrid_agent::{AgentServer, AuthMode, BearerToken, LifecycleConfig, LifecycleManager, auth};
use tokio::sync::oneshot;
use tonic::Code;
use tonic::service::interceptor::InterceptedService;
use tonic::transport::{Certificate, Channel, ClientTlsConfig, Identity};

struct TestAgent {
    addr: SocketAddr,
    engine: MemoryEngine,
    console_readers: Arc<AtomicUsize>,
    _shutdown: oneshot::Sender<()>,
    _data: tempfile::TempDir,
}

async fn spawn_agent(mode: AuthMode) -> TestAgent {
    let data = tempfile::tempdir().unwrap();
    let engine = MemoryEngine::new();
    let lifecycle = Arc::new(LifecycleManager::new(
        Arc::new(engine.clone()),
        LifecycleConfig::new(data.path()).with_default_image("game:latest"),
    ));
    let server = AgentServer::new("node-1", lifecycle);
    let console_readers = server.console_readers();

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (tx, rx) = oneshot::channel::<()>();
    tokio::spawn(auth::serve(listener, server, mode, async move {
        let _ = rx.await;
    }));

    TestAgent {
        addr,
        engine,
        console_readers,
        _shutdown: tx,
        _data: data,
    }
}

type Client = AgentServiceClient<InterceptedService<Channel, BearerToken>>;

async fn token_client(addr: SocketAddr, token: Option<&str>) -> Client {
    let channel = Channel::from_shared(format!("http://{addr}"))
        .unwrap()
        .connect()
        .await
        .unwrap();
    AgentServiceClient::with_interceptor(channel, BearerToken::new(token).unwrap())
}

fn create_request(id: &str) -> proto::CreateWorkloadRequest {
    proto::CreateWorkloadRequest {
        id: id.to_string(),
        name: "survival".to_string(),
        image: String::new(),
        memory_mb: 2048,
        cpu_percent: 100,
        env: HashMap::new(),
        ports: vec![proto::PortBinding {
            host_port: 25565,
            container_port: 0,
        }],
        disk_mb: 10_240,
    }
}

async fn wait_for_zero(gauge: &AtomicUsize) {
    for _ in 0..200 {
        if gauge.load(Ordering::SeqCst) == 0 {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("gauge stuck at {}", gauge.load(Ordering::SeqCst));
}

// ── Shared token ───────────────────────────────────────────────

#[tokio::test]
async fn token_mode_rejects_missing_and_wrong_tokens() {
    let agent = spawn_agent(AuthMode::SharedToken(Some("s3cret".to_string()))).await;

    let mut anonymous = token_client(agent.addr, None).await;
    let err = anonymous.ping(proto::PingRequest {}).await.unwrap_err();
    assert_eq!(err.code(), Code::Unauthenticated);

    let mut wrong = token_client(agent.addr, Some("guess")).await;
    let err = wrong.ping(proto::PingRequest {}).await.unwrap_err();
    assert_eq!(err.code(), Code::Unauthenticated);

    let mut client = token_client(agent.addr, Some("s3cret")).await;
    let pong = client.ping(proto::PingRequest {}).await.unwrap().into_inner();
    assert_eq!(pong.node_id, "node-1");
    assert!(!pong.version.is_empty());
    assert!(pong.timestamp_ms > 0);
}

#[tokio::test]
async fn open_mode_accepts_anyone() {
    let agent = spawn_agent(AuthMode::SharedToken(None)).await;
    let mut client = token_client(agent.addr, None).await;
    client.ping(proto::PingRequest {}).await.unwrap();
    let mut with_token = token_client(agent.addr, Some("whatever")).await;
    with_token.ping(proto::PingRequest {}).await.unwrap();
}

// ── Lifecycle over the wire ────────────────────────────────────

#[tokio::test]
async fn workload_lifecycle_round_trip() {
    let agent = spawn_agent(AuthMode::SharedToken(None)).await;
    let mut client = token_client(agent.addr, None).await;

    let created = client
        .create_workload(create_request("srv-1"))
        .await
        .unwrap()
        .into_inner();
    assert!(created.success, "{}", created.error);
    assert_eq!(created.workload_id, "srv-1");
    assert!(!created.container_id.is_empty());

    let started = client
        .start_workload(proto::WorkloadRef {
            workload_id: "srv-1".to_string(),
        })
        .await
        .unwrap()
        .into_inner();
    assert!(started.success);

    let status = client
        .get_workload_status(proto::WorkloadRef {
            workload_id: "srv-1".to_string(),
        })
        .await
        .unwrap()
        .into_inner();
    assert_eq!(status.state(), WorkloadState::Running);
    assert_eq!(status.container_id, created.container_id);
    assert_eq!(status.memory_limit_bytes, 2048 * 1024 * 1024);

    let command = client
        .send_command(proto::SendCommandRequest {
            workload_id: "srv-1".to_string(),
            command: "say hello".to_string(),
        })
        .await
        .unwrap()
        .into_inner();
    assert!(command.success);
    assert_eq!(agent.engine.execs_of(&created.container_id).len(), 1);

    let listed = client
        .list_workloads(proto::ListWorkloadsRequest {})
        .await
        .unwrap()
        .into_inner();
    assert_eq!(listed.workloads.len(), 1);

    let node = client
        .get_node_stats(proto::NodeStatsRequest {})
        .await
        .unwrap()
        .into_inner();
    assert_eq!(node.node_id, "node-1");
    assert_eq!(node.running_workloads, 1);

    let stopped = client
        .stop_workload(proto::StopWorkloadRequest {
            workload_id: "srv-1".to_string(),
            timeout_secs: 5,
        })
        .await
        .unwrap()
        .into_inner();
    assert!(stopped.success);

    let deleted = client
        .delete_workload(proto::DeleteWorkloadRequest {
            workload_id: "srv-1".to_string(),
            force: false,
        })
        .await
        .unwrap()
        .into_inner();
    assert!(deleted.success);
    assert_eq!(agent.engine.container_count(), 0);
}

#[tokio::test]
async fn failures_are_reported_in_the_body() {
    let agent = spawn_agent(AuthMode::SharedToken(None)).await;
    let mut client = token_client(agent.addr, None).await;

    let bad = client
        .create_workload(create_request("../escape"))
        .await
        .unwrap()
        .into_inner();
    assert!(!bad.success);
    assert!(bad.error.contains("invalid workload id"));

    let missing = client
        .delete_workload(proto::DeleteWorkloadRequest {
            workload_id: "ghost".to_string(),
            force: true,
        })
        .await
        .unwrap()
        .into_inner();
    assert!(!missing.success);
    assert!(missing.not_found);

    let status = client
        .get_workload_status(proto::WorkloadRef {
            workload_id: "ghost".to_string(),
        })
        .await
        .unwrap()
        .into_inner();
    assert_eq!(status.state(), WorkloadState::Offline);

    let err = client
        .stream_console(proto::StreamConsoleRequest {
            workload_id: "ghost".to_string(),
            tail: 0,
        })
        .await
        .unwrap_err();
    assert_eq!(err.code(), Code::NotFound);
}

#[tokio::test]
async fn engine_errors_are_internal() {
    let agent = spawn_agent(AuthMode::SharedToken(None)).await;
    let mut client = token_client(agent.addr, None).await;
    agent.engine.fail_on(FailPoint::List, "daemon busy");

    let err = client
        .list_workloads(proto::ListWorkloadsRequest {})
        .await
        .unwrap_err();
    assert_eq!(err.code(), Code::Internal);
    assert!(err.message().contains("daemon busy"));

    let err = client
        .get_node_stats(proto::NodeStatsRequest {})
        .await
        .unwrap_err();
    assert_eq!(err.code(), Code::Internal);
}

// ── Console streaming ──────────────────────────────────────────

#[tokio::test]
async fn dropping_console_stream_stops_reader() {
    let agent = spawn_agent(AuthMode::SharedToken(None)).await;
    let mut client = token_client(agent.addr, None).await;
    let created = client
        .create_workload(create_request("srv-1"))
        .await
        .unwrap()
        .into_inner();
    client
        .start_workload(proto::WorkloadRef {
            workload_id: "srv-1".to_string(),
        })
        .await
        .unwrap();
    agent.engine.push_log(&created.container_id, "Done (3.2s)!");

    for round in 0..5 {
        let mut stream = client
            .stream_console(proto::StreamConsoleRequest {
                workload_id: "srv-1".to_string(),
                tail: 10,
            })
            .await
            .unwrap()
            .into_inner();
        let first = stream.message().await.unwrap().unwrap();
        assert_eq!(first.line, "Done (3.2s)!");

        let live = format!("tick {round}");
        agent.engine.push_log(&created.container_id, &live);
        // History grows by one line per round.
        let mut seen = Vec::new();
        while let Some(line) = stream.message().await.unwrap() {
            seen.push(line.line.clone());
            if line.line == live {
                break;
            }
        }
        assert_eq!(seen.last(), Some(&live));
        assert_eq!(agent.console_readers.load(Ordering::SeqCst), 1);

        drop(stream);
        wait_for_zero(&agent.console_readers).await;
    }
    assert_eq!(agent.engine.active_log_readers(), 0);
}

// ── Mutual TLS ─────────────────────────────────────────────────

struct Pki {
    dir: tempfile::TempDir,
    server: TlsFiles,
    ca_pem: String,
    client: Identity,
}

fn pki() -> Pki {
    pki_with(|ca| ca)
}

/// `issuer` picks the CA that signs the leaves; `ca.pem` always holds the
/// originally generated certificate.
fn pki_with(issuer: impl FnOnce(CertificateAuthority) -> CertificateAuthority) -> Pki {
    let dir = tempfile::tempdir().unwrap();
    let original = CertificateAuthority::generate().unwrap();
    let ca_pair = original.pair();
    std::fs::write(dir.path().join("ca.pem"), &ca_pair.cert_pem).unwrap();
    let ca = issuer(original);
    ca.issue_server("node-1", &["localhost".to_string(), "127.0.0.1".to_string()])
        .unwrap()
        .write(&dir.path().join("agent.pem"), &dir.path().join("agent.key"))
        .unwrap();
    let client = ca.issue_client("control").unwrap();
    Pki {
        server: TlsFiles {
            cert: dir.path().join("agent.pem"),
            key: dir.path().join("agent.key"),
            ca: dir.path().join("ca.pem"),
        },
        ca_pem: ca_pair.cert_pem,
        client: Identity::from_pem(client.cert_pem, client.key_pem),
        dir,
    }
}

async fn tls_channel(addr: SocketAddr, tls: ClientTlsConfig) -> Result<Channel, tonic::transport::Error> {
    Channel::from_shared(format!("https://{addr}"))
        .unwrap()
        .tls_config(tls)?
        .connect_timeout(Duration::from_secs(5))
        .connect()
        .await
}

#[tokio::test]
async fn mutual_tls_requires_client_certificate() {
    forgegrid_agent::tls::install_crypto_provider();
    let pki = pki();
    let agent = spawn_agent(AuthMode::MutualTls(pki.server.clone())).await;

    let trusted = ClientTlsConfig::new()
        .ca_certificate(Certificate::from_pem(&pki.ca_pem))
        .domain_name("localhost")
        .identity(pki.client.clone());
    let channel = tls_channel(agent.addr, trusted).await.unwrap();
    let mut client = AgentServiceClient::new(channel);
    let pong = client.ping(proto::PingRequest {}).await.unwrap().into_inner();
    assert_eq!(pong.node_id, "node-1");

    let anonymous = ClientTlsConfig::new()
        .ca_certificate(Certificate::from_pem(&pki.ca_pem))
        .domain_name("localhost");
    let rejected = match tls_channel(agent.addr, anonymous).await {
        Err(_) => true,
        Ok(channel) => AgentServiceClient::new(channel)
            .ping(proto::PingRequest {})
            .await
            .is_err(),
    };
    assert!(rejected, "client without certificate must be refused");
    drop(pki.dir);
}

#[tokio::test]
async fn certificates_from_reloaded_ca_are_trusted() {
    forgegrid_agent::tls::install_crypto_provider();
    let pki = pki_with(|ca| CertificateAuthority::from_key_pem(&ca.pair().key_pem).unwrap());
    let agent = spawn_agent(AuthMode::MutualTls(pki.server.clone())).await;

    let tls = ClientTlsConfig::new()
        .ca_certificate(Certificate::from_pem(&pki.ca_pem))
        .domain_name("localhost")
        .identity(pki.client.clone());
    let channel = tls_channel(agent.addr, tls).await.unwrap();
    let pong = AgentServiceClient::new(channel)
        .ping(proto::PingRequest {})
        .await
        .unwrap()
        .into_inner();
    assert_eq!(pong.node_id, "node-1");
}
