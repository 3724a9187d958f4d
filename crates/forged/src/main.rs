//! forged — the forgegrid daemon.
//!
//! One binary for both sides of a deployment:
//! - `forged agent` runs the per-node agent next to the container engine
//! - `forged certs` bootstraps the CA and the mutual-TLS material
//! - `forged node …`, `forged server …` and `forged ping` drive the control
//!   plane against a local state database
//!
//! # Usage
//!
//! ```text
//! forged certs --node-id node-1 --san node1.example.net
//! forged agent --node-id node-1
//! forged node add node-1 --address node1.example.net --memory-mb 16384 \
//!     --disk-mb 200000 --ports 25565-25600 --ca-cert ca.pem \
//!     --client-cert control.pem --client-key control.key
//! forged server create --name survival --memory-mb 4096
//! ```

mod agent_mode;
mod certs;
mod control_plane;

use std::net::SocketAddr;
use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueEnum};
use forgegrid_agent::config::{
    DEFAULT_LISTEN, ENV_CA_FILE, ENV_CERT_FILE, ENV_DATA_ROOT, ENV_DEFAULT_IMAGE, ENV_ENGINE,
    ENV_INSECURE, ENV_KEY_FILE, ENV_LISTEN, ENV_NODE_ID, ENV_STOP_TIMEOUT, ENV_TOKEN,
    default_config_dir, default_data_root, default_tls_files,
};
use tracing_subscriber::EnvFilter;

const DEFAULT_FILTER: &str = "info,forged=debug,forgegrid=debug";
const ENV_DB: &str = "FORGED_DB";

#[derive(Parser)]
#[command(name = "forged", version, about = "forgegrid daemon")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the node agent.
    Agent(AgentArgs),

    /// Generate a CA, an agent server certificate and a control-plane
    /// client certificate.
    Certs(CertsArgs),

    /// Manage nodes in the control-plane database.
    Node {
        #[command(flatten)]
        db: DbArgs,
        #[command(subcommand)]
        command: NodeCommand,
    },

    /// Manage game servers.
    Server {
        #[command(flatten)]
        db: DbArgs,
        #[command(subcommand)]
        command: ServerCommand,
    },

    /// Check that a node's agent answers.
    Ping {
        #[command(flatten)]
        db: DbArgs,
        node_id: String,
    },
}

// ── Agent ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum EngineKind {
    /// Local Docker daemon.
    Docker,
    /// In-process engine that runs nothing; for dry runs.
    Memory,
}

#[derive(Args, Debug)]
struct AgentArgs {
    #[arg(long, env = ENV_NODE_ID)]
    node_id: String,

    #[arg(long, env = ENV_LISTEN, default_value = DEFAULT_LISTEN)]
    listen: SocketAddr,

    /// Root of the per-workload data directories.
    #[arg(long, env = ENV_DATA_ROOT, default_value_os_t = default_data_root())]
    data_root: PathBuf,

    #[arg(long, env = ENV_CERT_FILE, default_value_os_t = default_tls_files().cert)]
    cert_file: PathBuf,

    #[arg(long, env = ENV_KEY_FILE, default_value_os_t = default_tls_files().key)]
    key_file: PathBuf,

    #[arg(long, env = ENV_CA_FILE, default_value_os_t = default_tls_files().ca)]
    ca_file: PathBuf,

    /// Serve plaintext gRPC, authenticated by `--token` when set.
    #[arg(long, env = ENV_INSECURE)]
    insecure: bool,

    /// Shared secret callers must present in insecure mode.
    #[arg(long, env = ENV_TOKEN, hide_env_values = true)]
    token: Option<String>,

    /// Image used when a create request names none.
    #[arg(long, env = ENV_DEFAULT_IMAGE)]
    default_image: Option<String>,

    /// Seconds a stop waits before killing, when the caller sends none.
    #[arg(long, env = ENV_STOP_TIMEOUT, default_value_t = 30)]
    stop_timeout: u64,

    #[arg(long, env = ENV_ENGINE, value_enum, default_value_t = EngineKind::Docker)]
    engine: EngineKind,
}

// ── Certificates ──────────────────────────────────────────────────

#[derive(Args, Debug)]
struct CertsArgs {
    /// Where the PEM files are written.
    #[arg(long, default_value_os_t = default_config_dir())]
    out_dir: PathBuf,

    /// Node the agent certificate is issued to.
    #[arg(long, env = ENV_NODE_ID)]
    node_id: String,

    /// Address or DNS name the agent is reached at; repeatable.
    #[arg(long = "san")]
    sans: Vec<String>,

    /// Common name of the control-plane client certificate.
    #[arg(long, default_value = "control")]
    client_name: String,

    /// Overwrite existing files.
    #[arg(long)]
    force: bool,
}

// ── Control plane ─────────────────────────────────────────────────

#[derive(Args, Debug)]
struct DbArgs {
    /// Control-plane state database.
    #[arg(long, env = ENV_DB, default_value_os_t = default_data_root().join("control.redb"))]
    db: PathBuf,
}

/// Inclusive port list such as `25565-25600,25700`.
#[derive(Debug, Clone, PartialEq, Eq)]
struct PortList(Vec<u16>);

fn parse_ports(s: &str) -> Result<PortList, String> {
    let mut ports = Vec::new();
    for part in s.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        let (lo, hi) = match part.split_once('-') {
            Some((lo, hi)) => (lo.trim(), hi.trim()),
            None => (part, part),
        };
        let lo: u16 = lo.parse().map_err(|_| format!("invalid port: {lo}"))?;
        let hi: u16 = hi.parse().map_err(|_| format!("invalid port: {hi}"))?;
        if lo == 0 || lo > hi {
            return Err(format!("invalid port range: {part}"));
        }
        ports.extend(lo..=hi);
    }
    if ports.is_empty() {
        return Err("no ports given".to_string());
    }
    ports.sort_unstable();
    ports.dedup();
    Ok(PortList(ports))
}

fn parse_env(s: &str) -> Result<(String, String), String> {
    match s.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
        _ => Err(format!("expected KEY=VALUE, got {s:?}")),
    }
}

#[derive(Args, Debug)]
struct NodeAddArgs {
    id: String,

    /// Display name; defaults to the id.
    #[arg(long)]
    name: Option<String>,

    /// Hostname or IP of the agent.
    #[arg(long)]
    address: String,

    #[arg(long, default_value_t = 8444)]
    port: u16,

    #[arg(long)]
    memory_mb: u64,

    #[arg(long)]
    disk_mb: u64,

    /// Host ports servers on this node may bind.
    #[arg(long, value_parser = parse_ports)]
    ports: Option<PortList>,

    /// Bearer token for an agent running with `--insecure --token`.
    #[arg(long, conflicts_with = "ca_cert")]
    token: Option<String>,

    /// CA that signed the agent certificate; selects mutual TLS.
    #[arg(long, requires_all = ["client_cert", "client_key"])]
    ca_cert: Option<PathBuf>,

    #[arg(long, requires = "ca_cert")]
    client_cert: Option<PathBuf>,

    #[arg(long, requires = "ca_cert")]
    client_key: Option<PathBuf>,

    /// Name to verify on the agent certificate; defaults to the address.
    #[arg(long, requires = "ca_cert")]
    domain: Option<String>,
}

#[derive(Subcommand, Debug)]
enum NodeCommand {
    /// Register a node, or replace its address and credentials.
    Add(NodeAddArgs),
    /// Add ports to a node's allocation pool.
    Ports {
        id: String,
        #[arg(value_parser = parse_ports)]
        ports: PortList,
    },
    List,
    /// Take a node out of placement, or put it back with `--off`.
    Maintenance {
        id: String,
        #[arg(long)]
        off: bool,
    },
    /// Forget a node that no longer hosts servers.
    Remove { id: String },
}

#[derive(Args, Debug)]
struct ServerCreateArgs {
    #[arg(long)]
    name: String,

    /// Target node; the ledger picks one when absent.
    #[arg(long)]
    node: Option<String>,

    /// Host port; the lowest free allocation when absent.
    #[arg(long)]
    port: Option<u16>,

    #[arg(long)]
    memory_mb: u64,

    #[arg(long, default_value_t = 10_240)]
    disk_mb: u64,

    /// CPU share where 100 is one core; 0 leaves it unlimited.
    #[arg(long, default_value_t = 100)]
    cpu: u32,

    #[arg(long)]
    image: Option<String>,

    /// Container environment; repeatable.
    #[arg(long = "env", value_parser = parse_env)]
    env: Vec<(String, String)>,
}

#[derive(Subcommand, Debug)]
enum ServerCommand {
    /// Place, create and start a server.
    Create(ServerCreateArgs),
    Start { id: String },
    Stop {
        id: String,
        /// Seconds to wait before the container is killed.
        #[arg(long)]
        timeout: Option<u64>,
    },
    Restart { id: String },
    /// Remove the container and release the server's resources.
    Delete { id: String },
    /// Ask the agent for live state and print it.
    Status { id: String },
    List,
    /// Follow the server console until interrupted.
    Console {
        id: String,
        #[arg(long, default_value_t = 100)]
        tail: u32,
    },
    /// Send a console command.
    Command {
        id: String,
        #[arg(required = true, trailing_var_arg = true)]
        command: Vec<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER)),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Command::Agent(args) => agent_mode::run(args).await,
        Command::Certs(args) => certs::run(args),
        Command::Node { db, command } => control_plane::run_node(&db.db, command).await,
        Command::Server { db, command } => control_plane::run_server(&db.db, command).await,
        Command::Ping { db, node_id } => control_plane::run_ping(&db.db, &node_id).await,
    }
}

/// Resolves on Ctrl-C.
async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::warn!(error = %e, "failed to listen for Ctrl-C");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutdown signal received");
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn port_lists_expand_ranges() {
        assert_eq!(parse_ports("25565").unwrap(), PortList(vec![25565]));
        assert_eq!(
            parse_ports("25567-25569, 25565,25568").unwrap(),
            PortList(vec![25565, 25567, 25568, 25569])
        );
        assert!(parse_ports("0").is_err());
        assert!(parse_ports("30000-20000").is_err());
        assert!(parse_ports("abc").is_err());
        assert!(parse_ports("").is_err());
    }

    #[test]
    fn env_pairs_need_a_key() {
        assert_eq!(
            parse_env("EULA=TRUE").unwrap(),
            ("EULA".to_string(), "TRUE".to_string())
        );
        assert_eq!(parse_env("MOTD=a=b").unwrap().1, "a=b");
        assert!(parse_env("=x").is_err());
        assert!(parse_env("NOVALUE").is_err());
    }

    #[test]
    fn agent_flags_parse() {
        let cli = Cli::try_parse_from([
            "forged",
            "agent",
            "--node-id",
            "node-1",
            "--listen",
            "127.0.0.1:9000",
            "--insecure",
            "--token",
            "s3cret",
            "--engine",
            "memory",
        ])
        .unwrap();
        let Command::Agent(args) = cli.command else {
            panic!("expected agent command");
        };
        assert_eq!(args.node_id, "node-1");
        assert_eq!(args.listen.port(), 9000);
        assert!(args.insecure);
        assert_eq!(args.token.as_deref(), Some("s3cret"));
        assert_eq!(args.engine, EngineKind::Memory);
    }

    #[test]
    fn node_add_rejects_token_with_certificates() {
        let result = Cli::try_parse_from([
            "forged", "node", "add", "n1", "--address", "10.0.0.5", "--memory-mb", "8192",
            "--disk-mb", "50000", "--token", "t", "--ca-cert", "ca.pem", "--client-cert",
            "c.pem", "--client-key", "c.key",
        ]);
        assert!(result.is_err());
    }

    #[test]
    fn node_add_requires_complete_client_identity() {
        let result = Cli::try_parse_from([
            "forged", "node", "add", "n1", "--address", "10.0.0.5", "--memory-mb", "8192",
            "--disk-mb", "50000", "--ca-cert", "ca.pem",
        ]);
        assert!(result.is_err());
    }

    #[test]
    fn server_command_collects_trailing_words() {
        let cli = Cli::try_parse_from([
            "forged", "server", "--db", "x.redb", "command", "abc", "say", "hello", "world",
        ])
        .unwrap();
        let Command::Server {
            db,
            command: ServerCommand::Command { id, command },
        } = cli.command
        else {
            panic!("expected server command");
        };
        assert_eq!(db.db, PathBuf::from("x.redb"));
        assert_eq!(id, "abc");
        assert_eq!(command.join(" "), "say hello world");
    }
}
