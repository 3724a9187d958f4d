//! Domain types for the forgegrid state store.
//!
//! These types represent the persisted state of nodes, port allocations
//! and game-server workloads. All types are serializable to/from JSON for
//! storage in redb tables.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;

/// Unique identifier for a node.
pub type NodeId = String;

/// Unique identifier for a server (workload).
pub type ServerId = String;

// ── Node ──────────────────────────────────────────────────────────

/// A remote host running one agent and one container engine.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Node {
    pub id: NodeId,
    pub name: String,
    /// Hostname or IP the agent listens on.
    pub address: String,
    /// Agent gRPC port.
    pub port: u16,
    pub scheme: Scheme,
    /// Declared memory capacity in MB.
    pub memory_total_mb: u64,
    /// Declared disk capacity in MB.
    pub disk_total_mb: u64,
    /// Memory reserved by placed servers, in MB.
    pub memory_allocated_mb: u64,
    /// Disk reserved by placed servers, in MB.
    pub disk_allocated_mb: u64,
    pub auth: NodeAuth,
    /// Nodes in maintenance accept no new placements.
    pub maintenance: bool,
}

/// Transport scheme used to reach a node's agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Scheme {
    Http,
    #[default]
    Https,
}

impl Scheme {
    pub fn as_str(&self) -> &'static str {
        match self {
            Scheme::Http => "http",
            Scheme::Https => "https",
        }
    }
}

impl fmt::Display for Scheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Credentials the control plane presents to a node's agent.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum NodeAuth {
    /// Mutual TLS: trust anchor for the agent plus our client identity.
    Certificate {
        ca_cert: PathBuf,
        client_cert: PathBuf,
        client_key: PathBuf,
        /// Name to verify on the agent certificate; the address is used when absent.
        domain: Option<String>,
    },
    /// Shared secret sent as a bearer credential on every call.
    Token { token: String },
    #[default]
    None,
}

const MAX_NODE_ID_LEN: usize = 64;

/// Node ids prefix allocation keys (`node:port`), so `:` and anything
/// outside `[A-Za-z0-9_-]` is refused.
pub fn validate_node_id(id: &str) -> Result<(), crate::error::LedgerError> {
    let valid = !id.is_empty()
        && id.len() <= MAX_NODE_ID_LEN
        && id
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_');
    if valid {
        Ok(())
    } else {
        Err(crate::error::LedgerError::InvalidNodeId(id.to_string()))
    }
}

impl Node {
    /// `scheme://address:port` as understood by the gRPC endpoint builder.
    pub fn endpoint_uri(&self) -> String {
        format!("{}://{}:{}", self.scheme, self.address, self.port)
    }

    pub fn memory_free_mb(&self) -> u64 {
        self.memory_total_mb.saturating_sub(self.memory_allocated_mb)
    }

    pub fn disk_free_mb(&self) -> u64 {
        self.disk_total_mb.saturating_sub(self.disk_allocated_mb)
    }

    /// Whether a request of this size fits without over-committing.
    pub fn fits(&self, memory_mb: u64, disk_mb: u64) -> bool {
        self.memory_allocated_mb.saturating_add(memory_mb) <= self.memory_total_mb
            && self.disk_allocated_mb.saturating_add(disk_mb) <= self.disk_total_mb
    }
}

// ── Allocation ────────────────────────────────────────────────────

/// A `(node, port)` pair that can be handed to one server at a time.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Allocation {
    pub node_id: NodeId,
    pub port: u16,
    pub server_id: Option<ServerId>,
    pub assigned: bool,
}

impl Allocation {
    pub fn new(node_id: &str, port: u16) -> Self {
        Self {
            node_id: node_id.to_string(),
            port,
            server_id: None,
            assigned: false,
        }
    }

    /// Build the composite key for the allocations table.
    pub fn table_key(&self) -> String {
        allocation_key(&self.node_id, self.port)
    }
}

/// Zero-padded so lexical order matches numeric port order.
pub fn allocation_key(node_id: &str, port: u16) -> String {
    format!("{node_id}:{port:05}")
}

// ── Server ────────────────────────────────────────────────────────

/// One game-server instance, backed by exactly one container.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Server {
    pub id: ServerId,
    pub name: String,
    pub node_id: NodeId,
    /// Host port from the server's allocation.
    pub port: u16,
    pub memory_mb: u64,
    pub disk_mb: u64,
    /// CPU share where 100 = one core; 0 = unlimited.
    pub cpu_percent: u32,
    pub image: String,
    pub status: ServerStatus,
    /// Engine-assigned container id, set once the agent created it.
    pub container_id: Option<String>,
    pub env: HashMap<String, String>,
    /// Last lifecycle failure reported for this server.
    pub error: Option<String>,
    /// Unix timestamp (seconds) when the placement was accepted.
    pub created_at: u64,
    /// Unix timestamp (seconds) of the last status change.
    pub updated_at: u64,
}

/// Lifecycle status of a server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServerStatus {
    Installing,
    Running,
    Offline,
    Errored,
    Removed,
}

impl ServerStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ServerStatus::Installing => "installing",
            ServerStatus::Running => "running",
            ServerStatus::Offline => "offline",
            ServerStatus::Errored => "errored",
            ServerStatus::Removed => "removed",
        }
    }

    /// `removed` is terminal; `installing` can only be entered at placement.
    pub fn can_transition_to(self, next: ServerStatus) -> bool {
        use ServerStatus::*;
        match (self, next) {
            (Removed, _) => false,
            (_, Installing) => false,
            (Installing, Offline) => false,
            _ => true,
        }
    }

    /// Whether the server still holds its allocation and ledger reservation.
    pub fn holds_resources(self) -> bool {
        self != ServerStatus::Removed
    }
}

impl fmt::Display for ServerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
