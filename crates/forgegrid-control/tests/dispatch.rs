//! End-to-end dispatch tests.
//!
//! A real agent (tonic server, in-memory engine) listens on
//! `127.0.0.1:0`; the dispatcher reaches it through the connection pool
//! with the node's stored token, exactly as in production.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use forgegrid_agent::engine::{ContainerEngine, FailPoint, MemoryEngine, RunState};
use forgegrid_agent::proto::{ListWorkloadsRequest, NodeStatsRequest, WorkloadState};
use forgegrid_agent::{AgentServer, AuthMode, LifecycleConfig, LifecycleManager, auth};
use forgegrid_control::{
    ConnectionPool, DispatchError, Dispatcher, PoolConfig, PoolError, ServerRequest,
};
use forgegrid_state::*;
use tokio::sync::oneshot;

const TOKEN: &str = "s3cret";

struct TestAgent {
    addr: SocketAddr,
    engine: MemoryEngine,
    shutdown: Option<oneshot::Sender<()>>,
    _data: tempfile::TempDir,
}

async fn spawn_agent() -> TestAgent {
    let data = tempfile::tempdir().unwrap();
    let engine = MemoryEngine::new();
    let lifecycle = Arc::new(LifecycleManager::new(
        Arc::new(engine.clone()),
        LifecycleConfig::new(data.path()).with_default_image("game:latest"),
    ));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (tx, rx) = oneshot::channel::<()>();
    tokio::spawn(auth::serve(
        listener,
        AgentServer::new("node-1", lifecycle),
        AuthMode::SharedToken(Some(TOKEN.to_string())),
        async move {
            let _ = rx.await;
        },
    ));
    TestAgent {
        addr,
        engine,
        shutdown: Some(tx),
        _data: data,
    }
}

fn register_node(state: &StateStore, id: &str, port: u16) {
    state
        .put_node(&Node {
            id: id.to_string(),
            name: id.to_string(),
            address: "127.0.0.1".to_string(),
            port,
            scheme: Scheme::Http,
            memory_total_mb: 8192,
            disk_total_mb: 100_000,
            memory_allocated_mb: 0,
            disk_allocated_mb: 0,
            auth: NodeAuth::Token {
                token: TOKEN.to_string(),
            },
            maintenance: false,
        })
        .unwrap();
    let ports: Vec<u16> = (25565..25575).collect();
    state.add_allocations(id, &ports).unwrap();
}

fn pool_config() -> PoolConfig {
    PoolConfig {
        connect_timeout: Duration::from_millis(500),
        rpc_timeout: Duration::from_secs(5),
        max_connect_attempts: 2,
        retry_backoff: Duration::from_millis(10),
        keepalive: Duration::from_secs(30),
    }
}

fn setup(agent_port: u16) -> (StateStore, Arc<ConnectionPool>, Dispatcher) {
    setup_with(agent_port, pool_config())
}

fn setup_with(agent_port: u16, config: PoolConfig) -> (StateStore, Arc<ConnectionPool>, Dispatcher) {
    let state = StateStore::open_in_memory().unwrap();
    register_node(&state, "node-1", agent_port);
    let pool = Arc::new(ConnectionPool::new(state.clone(), config));
    let dispatcher = Dispatcher::new(state.clone(), pool.clone());
    (state, pool, dispatcher)
}

fn request(memory_mb: u64) -> ServerRequest {
    ServerRequest {
        name: "survival".to_string(),
        node_id: Some("node-1".to_string()),
        memory_mb,
        disk_mb: 10_240,
        cpu_percent: 200,
        env: HashMap::from([("MOTD".to_string(), "hello".to_string())]),
        ..Default::default()
    }
}

fn unused_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

// ── Scenarios ──────────────────────────────────────────────────

#[tokio::test]
async fn happy_path_reserves_and_runs() {
    let agent = spawn_agent().await;
    let (state, _pool, dispatcher) = setup(agent.addr.port());

    let server = dispatcher.create_server(request(2048)).await.unwrap();
    assert_eq!(server.status, ServerStatus::Running);
    assert_eq!(server.port, 25565);
    let container_id = server.container_id.clone().unwrap();

    let node = state.get_node("node-1").unwrap().unwrap();
    assert_eq!(node.memory_allocated_mb, 2048);
    assert_eq!(node.disk_allocated_mb, 10_240);

    let alloc = state.get_allocation("node-1", 25565).unwrap().unwrap();
    assert!(alloc.assigned);
    assert_eq!(alloc.server_id.as_deref(), Some(server.id.as_str()));

    let spec = agent.engine.spec_of(&container_id).unwrap();
    assert_eq!(spec.memory_bytes, 2048 * 1024 * 1024);
    assert_eq!(spec.cpu_quota, 200_000);
    assert_eq!(spec.ports[0].host_port, 25565);
}

#[tokio::test]
async fn over_commit_is_rejected_before_dispatch() {
    let agent = spawn_agent().await;
    let (state, _pool, dispatcher) = setup(agent.addr.port());

    dispatcher.create_server(request(2048)).await.unwrap();
    let err = dispatcher.create_server(request(7000)).await.unwrap_err();
    assert!(matches!(
        err.ledger(),
        Some(LedgerError::InsufficientMemory {
            requested: 7000,
            available: 6144,
            ..
        })
    ));

    assert_eq!(agent.engine.container_count(), 1);
    let node = state.get_node("node-1").unwrap().unwrap();
    assert_eq!(node.memory_allocated_mb, 2048);
    assert_eq!(state.list_servers().unwrap().len(), 1);
}

#[tokio::test]
async fn unreachable_node_rolls_back() {
    let (state, _pool, dispatcher) = setup(unused_port());

    let err = dispatcher.create_server(request(2048)).await.unwrap_err();
    assert!(matches!(
        err,
        DispatchError::NodeUnavailable {
            source: PoolError::Connect { .. },
            ..
        }
    ));

    let node = state.get_node("node-1").unwrap().unwrap();
    assert_eq!(node.memory_allocated_mb, 0);
    assert_eq!(node.disk_allocated_mb, 0);
    assert!(!state.get_allocation("node-1", 25565).unwrap().unwrap().assigned);
    assert!(state.list_servers().unwrap().is_empty());
}

#[tokio::test]
async fn agent_failure_rolls_back() {
    let agent = spawn_agent().await;
    let (state, _pool, dispatcher) = setup(agent.addr.port());
    agent.engine.fail_on(FailPoint::Pull, "registry unreachable");

    let err = dispatcher.create_server(request(2048)).await.unwrap_err();
    match &err {
        DispatchError::Agent { op, message, .. } => {
            assert_eq!(*op, "create");
            assert!(message.contains("registry unreachable"));
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(state.get_node("node-1").unwrap().unwrap().memory_allocated_mb, 0);

    // The same request succeeds once the engine recovers.
    agent.engine.clear_failure(FailPoint::Pull);
    let server = dispatcher.create_server(request(2048)).await.unwrap();
    assert_eq!(server.port, 25565);
}

#[tokio::test]
async fn start_failure_removes_container_and_rolls_back() {
    let agent = spawn_agent().await;
    let (state, _pool, dispatcher) = setup(agent.addr.port());
    agent.engine.fail_on(FailPoint::Start, "port already bound");

    let err = dispatcher.create_server(request(2048)).await.unwrap_err();
    assert!(matches!(err, DispatchError::Agent { op: "start", .. }));
    assert_eq!(agent.engine.container_count(), 0);
    assert!(state.list_servers().unwrap().is_empty());
    assert_eq!(state.get_node("node-1").unwrap().unwrap().memory_allocated_mb, 0);
}

#[tokio::test]
async fn create_timeout_rolls_back() {
    let agent = spawn_agent().await;
    let (state, _pool, dispatcher) = setup_with(
        agent.addr.port(),
        PoolConfig {
            rpc_timeout: Duration::from_millis(200),
            ..pool_config()
        },
    );
    agent.engine.delay_on(FailPoint::Create, Duration::from_millis(800));

    let err = dispatcher.create_server(request(2048)).await.unwrap_err();
    assert!(
        matches!(
            err,
            DispatchError::NodeUnavailable {
                source: PoolError::Timeout { .. },
                ..
            }
        ),
        "unexpected error: {err}"
    );

    let node = state.get_node("node-1").unwrap().unwrap();
    assert_eq!(node.memory_allocated_mb, 0);
    assert_eq!(node.disk_allocated_mb, 0);
    assert!(!state.get_allocation("node-1", 25565).unwrap().unwrap().assigned);
    assert!(state.list_servers().unwrap().is_empty());

    // The abandoned create is cancelled on the agent and never lands.
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(agent.engine.container_count(), 0);
}

#[tokio::test]
async fn reservation_lost_during_create_removes_container() {
    let agent = spawn_agent().await;
    let (state, _pool, dispatcher) = setup(agent.addr.port());
    agent.engine.delay_on(FailPoint::Create, Duration::from_millis(300));

    let create = tokio::spawn(async move { dispatcher.create_server(request(2048)).await });

    // Drop the reservation while the agent is still creating the container.
    let server_id = loop {
        if let Some(server) = state.list_servers().unwrap().pop() {
            break server.id;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    };
    assert!(state.rollback_placement(&server_id).unwrap());

    let err = create.await.unwrap().unwrap_err();
    assert!(matches!(err.ledger(), Some(LedgerError::ServerNotFound(_))));
    assert_eq!(agent.engine.container_count(), 0);
    assert!(state.list_servers().unwrap().is_empty());
    assert_eq!(state.get_node("node-1").unwrap().unwrap().memory_allocated_mb, 0);
}

#[tokio::test]
async fn delete_releases_resources() {
    let agent = spawn_agent().await;
    let (state, _pool, dispatcher) = setup(agent.addr.port());

    let server = dispatcher.create_server(request(2048)).await.unwrap();
    let removed = dispatcher.delete_server(&server.id).await.unwrap();
    assert_eq!(removed.status, ServerStatus::Removed);
    assert_eq!(agent.engine.container_count(), 0);

    let node = state.get_node("node-1").unwrap().unwrap();
    assert_eq!(node.memory_allocated_mb, 0);
    assert!(!state.get_allocation("node-1", server.port).unwrap().unwrap().assigned);

    // Deleting again is a no-op.
    let again = dispatcher.delete_server(&server.id).await.unwrap();
    assert_eq!(again.status, ServerStatus::Removed);
}

#[tokio::test]
async fn delete_tolerates_container_gone_on_agent() {
    let agent = spawn_agent().await;
    let (state, _pool, dispatcher) = setup(agent.addr.port());

    let server = dispatcher.create_server(request(1024)).await.unwrap();
    let container_id = server.container_id.clone().unwrap();
    agent.engine.set_state(&container_id, RunState::Exited);
    agent.engine.remove_container(&container_id, true).await.unwrap();

    let removed = dispatcher.delete_server(&server.id).await.unwrap();
    assert_eq!(removed.status, ServerStatus::Removed);
    assert_eq!(state.get_node("node-1").unwrap().unwrap().memory_allocated_mb, 0);
}

#[tokio::test]
async fn stop_start_restart_and_refresh() {
    let agent = spawn_agent().await;
    let (_state, _pool, dispatcher) = setup(agent.addr.port());
    let server = dispatcher.create_server(request(2048)).await.unwrap();

    let stopped = dispatcher
        .stop_server(&server.id, Some(Duration::from_secs(1)))
        .await
        .unwrap();
    assert_eq!(stopped.status, ServerStatus::Offline);

    let started = dispatcher.start_server(&server.id).await.unwrap();
    assert_eq!(started.status, ServerStatus::Running);

    let restarted = dispatcher.restart_server(&server.id).await.unwrap();
    assert_eq!(restarted.status, ServerStatus::Running);

    // Crash observed by the agent is persisted on refresh.
    let container_id = server.container_id.clone().unwrap();
    agent.engine.set_state(&container_id, RunState::Exited);
    let (refreshed, status) = dispatcher.refresh_status(&server.id).await.unwrap();
    assert_eq!(status.state(), WorkloadState::Offline);
    assert_eq!(refreshed.status, ServerStatus::Offline);
}

#[tokio::test]
async fn console_and_command_pass_through() {
    let agent = spawn_agent().await;
    let (_state, _pool, dispatcher) = setup(agent.addr.port());
    let server = dispatcher.create_server(request(2048)).await.unwrap();
    let container_id = server.container_id.clone().unwrap();
    agent.engine.push_log(&container_id, "Starting minecraft server");

    let mut console = dispatcher.console(&server.id, 10).await.unwrap();
    let line = console.message().await.unwrap().unwrap();
    assert_eq!(line.line, "Starting minecraft server");
    drop(console);

    dispatcher.send_command(&server.id, "whitelist add alice").await.unwrap();
    assert_eq!(
        agent.engine.execs_of(&container_id),
        vec![vec!["rcon-cli".to_string(), "whitelist add alice".to_string()]]
    );
}

#[tokio::test]
async fn parallel_creates_never_over_commit() {
    let agent = spawn_agent().await;
    let (state, _pool, dispatcher) = setup(agent.addr.port());
    let dispatcher = Arc::new(dispatcher);

    let mut handles = Vec::new();
    for _ in 0..10 {
        let dispatcher = dispatcher.clone();
        handles.push(tokio::spawn(async move {
            dispatcher.create_server(request(2000)).await
        }));
    }
    let mut ok = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(_) => ok += 1,
            Err(e) => assert!(e.ledger().is_some(), "unexpected error: {e}"),
        }
    }
    assert_eq!(ok, 4);
    let node = state.get_node("node-1").unwrap().unwrap();
    assert_eq!(node.memory_allocated_mb, 8000);
    assert_eq!(agent.engine.container_count(), 4);
}

// ── Pool behaviour ─────────────────────────────────────────────

#[tokio::test]
async fn probe_reuses_channel_and_evicts_dead_agent() {
    let mut agent = spawn_agent().await;
    let (_state, pool, _dispatcher) = setup(agent.addr.port());

    let pong = pool.probe("node-1").await.unwrap();
    assert_eq!(pong.node_id, "node-1");
    pool.probe("node-1").await.unwrap();
    assert_eq!(pool.connected_nodes().await, vec!["node-1".to_string()]);

    let _ = agent.shutdown.take().unwrap().send(());
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(pool.probe("node-1").await.is_err());
    assert!(pool.connected_nodes().await.is_empty());
}

#[tokio::test]
async fn engine_errors_keep_the_channel() {
    let agent = spawn_agent().await;
    let (_state, pool, _dispatcher) = setup(agent.addr.port());
    pool.probe("node-1").await.unwrap();
    agent.engine.fail_on(FailPoint::List, "daemon busy");

    let err = pool
        .call("node-1", |mut c| async move {
            c.list_workloads(ListWorkloadsRequest {}).await
        })
        .await
        .unwrap_err();
    match err {
        PoolError::Rpc { status, .. } => assert_eq!(status.code(), tonic::Code::Internal),
        other => panic!("unexpected error: {other}"),
    }
    let err = pool
        .call("node-1", |mut c| async move {
            c.get_node_stats(NodeStatsRequest {}).await
        })
        .await
        .unwrap_err();
    assert!(matches!(err, PoolError::Rpc { .. }));
    assert_eq!(pool.connected_nodes().await, vec!["node-1".to_string()]);
}

#[tokio::test]
async fn wrong_token_is_unauthenticated() {
    let agent = spawn_agent().await;
    let (state, pool, _dispatcher) = setup(agent.addr.port());
    let mut node = state.get_node("node-1").unwrap().unwrap();
    node.auth = NodeAuth::Token {
        token: "guess".to_string(),
    };
    state.put_node(&node).unwrap();

    let err = pool.probe("node-1").await.unwrap_err();
    match err {
        PoolError::Rpc { status, .. } => assert_eq!(status.code(), tonic::Code::Unauthenticated),
        other => panic!("unexpected error: {other}"),
    }
}

#[tokio::test]
async fn shutdown_closes_pool() {
    let agent = spawn_agent().await;
    let (_state, pool, dispatcher) = setup(agent.addr.port());
    pool.probe("node-1").await.unwrap();

    pool.shutdown().await;
    assert!(pool.connected_nodes().await.is_empty());
    let err = dispatcher.create_server(request(1024)).await.unwrap_err();
    assert!(matches!(
        err,
        DispatchError::NodeUnavailable {
            source: PoolError::Closed,
            ..
        }
    ));
}
