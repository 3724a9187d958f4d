//! Control-plane commands: node registry, server lifecycle and probes.
//!
//! Every invocation opens the state database, runs one command and closes
//! the agent channels it opened.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use forgegrid_agent::proto::WorkloadStatus;
use forgegrid_control::{ConnectionPool, Dispatcher, PoolConfig, ServerRequest};
use forgegrid_state::{Node, NodeAuth, Scheme, Server, StateStore};
use serde_json::json;
use tracing::info;

use crate::{NodeAddArgs, NodeCommand, ServerCommand, ServerCreateArgs};

fn open_state(db: &Path) -> anyhow::Result<StateStore> {
    if let Some(parent) = db.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("creating {}", parent.display()))?;
    }
    StateStore::open(db).with_context(|| format!("opening {}", db.display()))
}

fn print_json(value: &impl serde::Serialize) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

// ── Nodes ─────────────────────────────────────────────────────────

/// Node record for `node add`. Allocated totals carry over from `existing`.
fn node_from_args(args: &NodeAddArgs, existing: Option<&Node>) -> Node {
    let (scheme, auth) = match (&args.ca_cert, &args.client_cert, &args.client_key, &args.token) {
        (Some(ca), Some(cert), Some(key), _) => (
            Scheme::Https,
            NodeAuth::Certificate {
                ca_cert: ca.clone(),
                client_cert: cert.clone(),
                client_key: key.clone(),
                domain: args.domain.clone(),
            },
        ),
        (_, _, _, Some(token)) => (Scheme::Http, NodeAuth::Token { token: token.clone() }),
        _ => (Scheme::Http, NodeAuth::None),
    };
    Node {
        id: args.id.clone(),
        name: args.name.clone().unwrap_or_else(|| args.id.clone()),
        address: args.address.clone(),
        port: args.port,
        scheme,
        memory_total_mb: args.memory_mb,
        disk_total_mb: args.disk_mb,
        memory_allocated_mb: existing.map_or(0, |n| n.memory_allocated_mb),
        disk_allocated_mb: existing.map_or(0, |n| n.disk_allocated_mb),
        auth,
        maintenance: existing.is_some_and(|n| n.maintenance),
    }
}

pub async fn run_node(db: &Path, command: NodeCommand) -> anyhow::Result<()> {
    let state = open_state(db)?;
    match command {
        NodeCommand::Add(args) => {
            let existing = state.get_node(&args.id)?;
            let node = node_from_args(&args, existing.as_ref());
            state.put_node(&node)?;
            let added = match &args.ports {
                Some(ports) => state.add_allocations(&node.id, &ports.0)?,
                None => 0,
            };
            info!(node_id = %node.id, uri = %node.endpoint_uri(), ports = added, "node registered");
            print_json(&node)?;
        }
        NodeCommand::Ports { id, ports } => {
            let added = state.add_allocations(&id, &ports.0)?;
            println!("{added} port(s) added to {id}");
        }
        NodeCommand::List => {
            let mut rows = Vec::new();
            for node in state.list_nodes()? {
                let allocations = state.list_allocations(&node.id)?;
                let free = allocations.iter().filter(|a| !a.assigned).count();
                rows.push(json!({
                    "id": node.id,
                    "endpoint": node.endpoint_uri(),
                    "maintenance": node.maintenance,
                    "memory_free_mb": node.memory_free_mb(),
                    "memory_total_mb": node.memory_total_mb,
                    "disk_free_mb": node.disk_free_mb(),
                    "disk_total_mb": node.disk_total_mb,
                    "ports_free": free,
                    "ports_total": allocations.len(),
                }));
            }
            print_json(&rows)?;
        }
        NodeCommand::Maintenance { id, off } => {
            if !state.set_maintenance(&id, !off)? {
                anyhow::bail!("node {id} not found");
            }
            println!("{id}: maintenance {}", if off { "off" } else { "on" });
        }
        NodeCommand::Remove { id } => {
            if !state.delete_node(&id)? {
                anyhow::bail!("node {id} not found");
            }
            println!("{id} removed");
        }
    }
    Ok(())
}

// ── Servers ───────────────────────────────────────────────────────

fn server_request(args: ServerCreateArgs) -> ServerRequest {
    ServerRequest {
        name: args.name,
        node_id: args.node,
        port: args.port,
        memory_mb: args.memory_mb,
        disk_mb: args.disk_mb,
        cpu_percent: args.cpu,
        image: args.image,
        env: args.env.into_iter().collect(),
    }
}

fn dispatcher(db: &Path) -> anyhow::Result<(Dispatcher, Arc<ConnectionPool>)> {
    let state = open_state(db)?;
    let pool = Arc::new(ConnectionPool::new(state.clone(), PoolConfig::default()));
    Ok((Dispatcher::new(state, pool.clone()), pool))
}

pub async fn run_server(db: &Path, command: ServerCommand) -> anyhow::Result<()> {
    let (dispatcher, pool) = dispatcher(db)?;
    let result = server_command(&dispatcher, command).await;
    pool.shutdown().await;
    result
}

async fn server_command(dispatcher: &Dispatcher, command: ServerCommand) -> anyhow::Result<()> {
    let server: Server = match command {
        ServerCommand::Create(args) => dispatcher.create_server(server_request(args)).await?,
        ServerCommand::Start { id } => dispatcher.start_server(&id).await?,
        ServerCommand::Stop { id, timeout } => {
            dispatcher
                .stop_server(&id, timeout.map(Duration::from_secs))
                .await?
        }
        ServerCommand::Restart { id } => dispatcher.restart_server(&id).await?,
        ServerCommand::Delete { id } => dispatcher.delete_server(&id).await?,
        ServerCommand::Status { id } => {
            let (server, observed) = dispatcher.refresh_status(&id).await?;
            return print_json(&json!({
                "server": server,
                "observed": {
                    "state": workload_state(&observed),
                    "cpu_percent": observed.cpu_percent,
                    "memory_bytes": observed.memory_bytes,
                    "memory_limit_bytes": observed.memory_limit_bytes,
                    "error": observed.error,
                },
            }));
        }
        ServerCommand::List => return print_json(&dispatcher.state().list_servers()?),
        ServerCommand::Console { id, tail } => {
            let mut stream = dispatcher.console(&id, tail).await?;
            let shutdown = crate::shutdown_signal();
            tokio::pin!(shutdown);
            loop {
                tokio::select! {
                    _ = &mut shutdown => break,
                    line = stream.message() => match line? {
                        Some(line) => println!("{}", line.line),
                        None => break,
                    },
                }
            }
            return Ok(());
        }
        ServerCommand::Command { id, command } => {
            dispatcher.send_command(&id, &command.join(" ")).await?;
            return Ok(());
        }
    };
    print_json(&server)
}

/// `running`, `offline`, … as the agent reported it.
fn workload_state(status: &WorkloadStatus) -> String {
    status
        .state()
        .as_str_name()
        .trim_start_matches("WORKLOAD_STATE_")
        .to_ascii_lowercase()
}

// ── Probe ─────────────────────────────────────────────────────────

pub async fn run_ping(db: &Path, node_id: &str) -> anyhow::Result<()> {
    let state = open_state(db)?;
    let pool = ConnectionPool::new(state, PoolConfig::default());
    let result = pool.probe(node_id).await;
    pool.shutdown().await;
    let pong = result?;
    print_json(&json!({
        "node_id": pong.node_id,
        "version": pong.version,
        "uptime_ms": pong.uptime_ms,
    }))
}
