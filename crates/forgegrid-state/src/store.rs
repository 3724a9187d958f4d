//! StateStore — redb-backed state persistence for forgegrid.
//!
//! Provides typed CRUD operations over nodes, allocations and servers.
//! All values are JSON-serialized into redb's `&[u8]` value columns. The
//! store supports both on-disk and in-memory backends (the latter for
//! testing). Operations that must move several records together live in
//! [`crate::ledger`].

use std::path::Path;
use std::sync::Arc;

use redb::{Database, ReadableDatabase, ReadableTable, Table};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::error::{LedgerError, StateResult};
use crate::tables::*;
use crate::types::*;

/// Convert any `Display` error into a `StateError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| $crate::error::StateError::$variant(e.to_string())
    };
}

pub(crate) use map_err;

/// Thread-safe state store backed by redb.
#[derive(Clone)]
pub struct StateStore {
    pub(crate) db: Arc<Database>,
}

impl StateStore {
    /// Open (or create) a persistent state store at the given path.
    pub fn open(path: &Path) -> StateResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!(?path, "state store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory state store (for testing).
    pub fn open_in_memory() -> StateResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!("in-memory state store opened");
        Ok(store)
    }

    /// Create all tables if they don't exist yet.
    fn ensure_tables(&self) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        // Opening a table in a write transaction creates it if absent.
        txn.open_table(NODES).map_err(map_err!(Table))?;
        txn.open_table(ALLOCATIONS).map_err(map_err!(Table))?;
        txn.open_table(SERVERS).map_err(map_err!(Table))?;
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    // ── Nodes ──────────────────────────────────────────────────────

    /// Insert or update a node.
    ///
    /// Node ids key the allocation table, so they are limited to
    /// `[A-Za-z0-9_-]`.
    pub fn put_node(&self, node: &Node) -> StateResult<()> {
        validate_node_id(&node.id)?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(NODES).map_err(map_err!(Table))?;
            put_row(&mut table, &node.id, node)?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(node_id = %node.id, "node stored");
        Ok(())
    }

    /// Get a node by ID.
    pub fn get_node(&self, node_id: &str) -> StateResult<Option<Node>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(NODES).map_err(map_err!(Table))?;
        get_row(&table, node_id)
    }

    /// List all nodes, ordered by ID.
    pub fn list_nodes(&self) -> StateResult<Vec<Node>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(NODES).map_err(map_err!(Table))?;
        scan_rows(&table, "")
    }

    /// Toggle a node's maintenance flag. Returns false if the node is unknown.
    pub fn set_maintenance(&self, node_id: &str, maintenance: bool) -> StateResult<bool> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let found;
        {
            let mut table = txn.open_table(NODES).map_err(map_err!(Table))?;
            let node: Option<Node> = get_row(&table, node_id)?;
            found = node.is_some();
            if let Some(mut node) = node {
                node.maintenance = maintenance;
                put_row(&mut table, node_id, &node)?;
            }
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(%node_id, maintenance, found, "node maintenance updated");
        Ok(found)
    }

    /// Delete a node and its free allocations.
    ///
    /// Refused while any server still holds resources on the node.
    pub fn delete_node(&self, node_id: &str) -> StateResult<bool> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let existed;
        {
            let mut allocations = txn.open_table(ALLOCATIONS).map_err(map_err!(Table))?;
            let rows = node_allocations(&allocations, node_id)?;
            if let Some(busy) = rows.iter().find(|a| a.assigned) {
                return Err(LedgerError::PortUnavailable {
                    node_id: node_id.to_string(),
                    port: busy.port,
                }
                .into());
            }
            for alloc in &rows {
                allocations
                    .remove(alloc.table_key().as_str())
                    .map_err(map_err!(Write))?;
            }
            let mut nodes = txn.open_table(NODES).map_err(map_err!(Table))?;
            existed = nodes.remove(node_id).map_err(map_err!(Write))?.is_some();
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(%node_id, existed, "node deleted");
        Ok(existed)
    }

    // ── Allocations ────────────────────────────────────────────────

    /// Seed a node's port pool. Ports already present are left untouched.
    ///
    /// Returns the number of new allocations.
    pub fn add_allocations(&self, node_id: &str, ports: &[u16]) -> StateResult<u32> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let mut added = 0u32;
        {
            let nodes = txn.open_table(NODES).map_err(map_err!(Table))?;
            let node: Option<Node> = get_row(&nodes, node_id)?;
            if node.is_none() {
                return Err(LedgerError::NodeNotFound(node_id.to_string()).into());
            }
            let mut table = txn.open_table(ALLOCATIONS).map_err(map_err!(Table))?;
            for &port in ports {
                let key = allocation_key(node_id, port);
                let existing: Option<Allocation> = get_row(&table, &key)?;
                if existing.is_none() {
                    put_row(&mut table, &key, &Allocation::new(node_id, port))?;
                    added += 1;
                }
            }
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(%node_id, added, "allocations added");
        Ok(added)
    }

    /// Get a single allocation.
    pub fn get_allocation(&self, node_id: &str, port: u16) -> StateResult<Option<Allocation>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(ALLOCATIONS).map_err(map_err!(Table))?;
        get_row(&table, &allocation_key(node_id, port))
    }

    /// List a node's allocations in ascending port order.
    pub fn list_allocations(&self, node_id: &str) -> StateResult<Vec<Allocation>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(ALLOCATIONS).map_err(map_err!(Table))?;
        node_allocations(&table, node_id)
    }

    // ── Servers ────────────────────────────────────────────────────

    /// Get a server by ID.
    pub fn get_server(&self, server_id: &str) -> StateResult<Option<Server>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(SERVERS).map_err(map_err!(Table))?;
        get_row(&table, server_id)
    }

    /// List all servers, including removed ones.
    pub fn list_servers(&self) -> StateResult<Vec<Server>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(SERVERS).map_err(map_err!(Table))?;
        scan_rows(&table, "")
    }

    /// List the servers placed on a node.
    pub fn list_servers_for_node(&self, node_id: &str) -> StateResult<Vec<Server>> {
        Ok(self
            .list_servers()?
            .into_iter()
            .filter(|s| s.node_id == node_id)
            .collect())
    }

    /// Record the container id the agent assigned to a server.
    pub fn set_container_id(&self, server_id: &str, container_id: &str, now: u64) -> StateResult<Server> {
        self.modify_server(server_id, |server| {
            server.container_id = Some(container_id.to_string());
            server.updated_at = now;
            Ok(())
        })
    }

    /// Move a server to a new status, validating the transition.
    ///
    /// `removed` cannot be reached here; use [`StateStore::release_server`]
    /// so the allocation and reservation go with it.
    pub fn update_server_status(
        &self,
        server_id: &str,
        status: ServerStatus,
        error: Option<String>,
        now: u64,
    ) -> StateResult<Server> {
        self.modify_server(server_id, |server| {
            if status == ServerStatus::Removed || !server.status.can_transition_to(status) {
                return Err(LedgerError::InvalidTransition {
                    id: server.id.clone(),
                    from: server.status,
                    to: status,
                }
                .into());
            }
            server.status = status;
            server.error = error;
            server.updated_at = now;
            Ok(())
        })
    }

    fn modify_server<F>(&self, server_id: &str, f: F) -> StateResult<Server>
    where
        F: FnOnce(&mut Server) -> StateResult<()>,
    {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let server;
        {
            let mut table = txn.open_table(SERVERS).map_err(map_err!(Table))?;
            let mut current: Server = get_row(&table, server_id)?
                .ok_or_else(|| LedgerError::ServerNotFound(server_id.to_string()))?;
            f(&mut current)?;
            put_row(&mut table, server_id, &current)?;
            server = current;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(%server_id, status = %server.status, "server updated");
        Ok(server)
    }
}

// ── Row helpers ────────────────────────────────────────────────────

pub(crate) fn get_row<T, R>(table: &R, key: &str) -> StateResult<Option<T>>
where
    T: DeserializeOwned,
    R: ReadableTable<&'static str, &'static [u8]>,
{
    match table.get(key).map_err(map_err!(Read))? {
        Some(guard) => {
            let value = serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
            Ok(Some(value))
        }
        None => Ok(None),
    }
}

pub(crate) fn put_row<T: Serialize>(
    table: &mut Table<'_, &'static str, &'static [u8]>,
    key: &str,
    value: &T,
) -> StateResult<()> {
    let bytes = serde_json::to_vec(value).map_err(map_err!(Serialize))?;
    table
        .insert(key, bytes.as_slice())
        .map_err(map_err!(Write))?;
    Ok(())
}

/// All rows whose key starts with `prefix`, in key order.
pub(crate) fn scan_rows<T, R>(table: &R, prefix: &str) -> StateResult<Vec<T>>
where
    T: DeserializeOwned,
    R: ReadableTable<&'static str, &'static [u8]>,
{
    let mut results = Vec::new();
    for entry in table.iter().map_err(map_err!(Read))? {
        let (key, value) = entry.map_err(map_err!(Read))?;
        if key.value().starts_with(prefix) {
            let row = serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
            results.push(row);
        }
    }
    Ok(results)
}

/// A node's allocations in port order. Rows are matched on their stored
/// node id, not only the key prefix.
pub(crate) fn node_allocations<R>(table: &R, node_id: &str) -> StateResult<Vec<Allocation>>
where
    R: ReadableTable<&'static str, &'static [u8]>,
{
    let rows: Vec<Allocation> = scan_rows(table, &format!("{node_id}:"))?;
    Ok(rows.into_iter().filter(|a| a.node_id == node_id).collect())
}
