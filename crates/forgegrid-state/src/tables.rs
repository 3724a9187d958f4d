//! redb table definitions for the forgegrid state store.
//!
//! Each table uses `&str` keys and `&[u8]` values (JSON-serialized domain types).

use redb::TableDefinition;

/// Node records keyed by `{node_id}`.
pub const NODES: TableDefinition<&str, &[u8]> = TableDefinition::new("nodes");

/// Port allocations keyed by `{node_id}:{port:05}` so a prefix scan yields
/// a node's ports in ascending order.
pub const ALLOCATIONS: TableDefinition<&str, &[u8]> = TableDefinition::new("allocations");

/// Server (workload) records keyed by `{server_id}`.
pub const SERVERS: TableDefinition<&str, &[u8]> = TableDefinition::new("servers");
