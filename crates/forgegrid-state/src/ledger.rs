//! Resource ledger — capacity reservation and port assignment.
//!
//! Every operation here touches the node, allocation and server tables
//! together and runs in one redb write transaction, so a placement is
//! either fully recorded or not at all. redb serializes write transactions,
//! which is what keeps two concurrent placements on the same node from
//! both passing the capacity check.
//!
//! ```text
//! reserve_placement ──► server row (installing)
//!                      allocation.assigned = true
//!                      node.allocated += request
//!
//! rollback_placement ─► undo all three, drop the server row
//! release_server ─────► same release, server row kept as `removed`
//! ```

use std::collections::HashMap;

use redb::{ReadableTable, Table};
use tracing::{debug, info};

use crate::error::{LedgerError, StateResult};
use crate::store::{StateStore, get_row, map_err, node_allocations, put_row, scan_rows};
use crate::tables::*;
use crate::types::*;

/// Everything the ledger needs to accept a new server.
#[derive(Debug, Clone, PartialEq)]
pub struct PlacementRequest {
    pub server_id: ServerId,
    pub name: String,
    /// Target node; when absent the ledger picks one (see [`select_node`]).
    pub node_id: Option<NodeId>,
    /// Specific port to claim; when absent the lowest free port is used.
    pub port: Option<u16>,
    pub memory_mb: u64,
    pub disk_mb: u64,
    pub cpu_percent: u32,
    pub image: String,
    pub env: HashMap<String, String>,
}

/// A placement accepted by the ledger and not yet committed or rolled back.
#[derive(Debug, Clone, PartialEq)]
pub struct Reservation {
    pub server: Server,
    /// Node snapshot after the reservation was applied.
    pub node: Node,
}

/// Choose a node for a request when the caller did not name one.
///
/// Candidates are nodes outside maintenance that fit both dimensions. The
/// node with the most free memory wins; ties go to the lowest node id so
/// the choice is deterministic.
pub fn select_node(nodes: &[Node], memory_mb: u64, disk_mb: u64) -> Option<&Node> {
    nodes
        .iter()
        .filter(|n| !n.maintenance && n.fits(memory_mb, disk_mb))
        .min_by(|a, b| {
            b.memory_free_mb()
                .cmp(&a.memory_free_mb())
                .then_with(|| a.id.cmp(&b.id))
        })
}

impl StateStore {
    /// Reserve capacity and a port for a new server.
    ///
    /// On success the server row exists in `installing` state, its port is
    /// assigned and the node's allocated totals include the request.
    pub fn reserve_placement(&self, req: &PlacementRequest, now: u64) -> StateResult<Reservation> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let reservation;
        {
            let mut servers = txn.open_table(SERVERS).map_err(map_err!(Table))?;
            let existing: Option<Server> = get_row(&servers, &req.server_id)?;
            if existing.is_some_and(|s| s.status.holds_resources()) {
                return Err(LedgerError::ServerExists(req.server_id.clone()).into());
            }

            let mut nodes = txn.open_table(NODES).map_err(map_err!(Table))?;
            let mut node = match &req.node_id {
                Some(node_id) => {
                    let node: Node = get_row(&nodes, node_id)?
                        .ok_or_else(|| LedgerError::NodeNotFound(node_id.clone()))?;
                    check_capacity(&node, req)?;
                    node
                }
                None => {
                    let all: Vec<Node> = scan_rows(&nodes, "")?;
                    select_node(&all, req.memory_mb, req.disk_mb)
                        .cloned()
                        .ok_or(LedgerError::NoCapacity {
                            memory_mb: req.memory_mb,
                            disk_mb: req.disk_mb,
                        })?
                }
            };

            let mut allocations = txn.open_table(ALLOCATIONS).map_err(map_err!(Table))?;
            let mut allocation = claim_port(&allocations, &node.id, req.port)?;
            allocation.assigned = true;
            allocation.server_id = Some(req.server_id.clone());
            put_row(&mut allocations, &allocation.table_key(), &allocation)?;

            node.memory_allocated_mb += req.memory_mb;
            node.disk_allocated_mb += req.disk_mb;
            put_row(&mut nodes, &node.id, &node)?;

            let server = Server {
                id: req.server_id.clone(),
                name: req.name.clone(),
                node_id: node.id.clone(),
                port: allocation.port,
                memory_mb: req.memory_mb,
                disk_mb: req.disk_mb,
                cpu_percent: req.cpu_percent,
                image: req.image.clone(),
                status: ServerStatus::Installing,
                container_id: None,
                env: req.env.clone(),
                error: None,
                created_at: now,
                updated_at: now,
            };
            put_row(&mut servers, &server.id, &server)?;

            reservation = Reservation { server, node };
        }
        txn.commit().map_err(map_err!(Transaction))?;

        info!(
            server_id = %reservation.server.id,
            node_id = %reservation.node.id,
            port = reservation.server.port,
            memory_mb = req.memory_mb,
            node_memory_allocated_mb = reservation.node.memory_allocated_mb,
            "placement reserved"
        );
        Ok(reservation)
    }

    /// Undo a reservation whose dispatch failed.
    ///
    /// The server row is dropped entirely, so retrying the same request
    /// behaves as if the first attempt never happened. Returns false when
    /// there was nothing to roll back.
    pub fn rollback_placement(&self, server_id: &str) -> StateResult<bool> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let rolled_back;
        {
            let mut servers = txn.open_table(SERVERS).map_err(map_err!(Table))?;
            let server: Option<Server> = get_row(&servers, server_id)?;
            rolled_back = match server {
                Some(server) if server.status.holds_resources() => {
                    free_resources(&txn, &server)?;
                    servers.remove(server_id).map_err(map_err!(Write))?;
                    true
                }
                _ => false,
            };
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(%server_id, rolled_back, "placement rolled back");
        Ok(rolled_back)
    }

    /// Mark a server removed and hand its port and capacity back.
    ///
    /// Idempotent: releasing an already removed server returns it unchanged.
    pub fn release_server(&self, server_id: &str, now: u64) -> StateResult<Server> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let server;
        {
            let mut servers = txn.open_table(SERVERS).map_err(map_err!(Table))?;
            let mut current: Server = get_row(&servers, server_id)?
                .ok_or_else(|| LedgerError::ServerNotFound(server_id.to_string()))?;
            if current.status.holds_resources() {
                free_resources(&txn, &current)?;
                current.status = ServerStatus::Removed;
                current.updated_at = now;
                put_row(&mut servers, server_id, &current)?;
            }
            server = current;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        info!(%server_id, node_id = %server.node_id, port = server.port, "server released");
        Ok(server)
    }
}

fn check_capacity(node: &Node, req: &PlacementRequest) -> Result<(), LedgerError> {
    if node.maintenance {
        return Err(LedgerError::Maintenance(node.id.clone()));
    }
    if node.memory_allocated_mb.saturating_add(req.memory_mb) > node.memory_total_mb {
        return Err(LedgerError::InsufficientMemory {
            node_id: node.id.clone(),
            requested: req.memory_mb,
            available: node.memory_free_mb(),
        });
    }
    if node.disk_allocated_mb.saturating_add(req.disk_mb) > node.disk_total_mb {
        return Err(LedgerError::InsufficientDisk {
            node_id: node.id.clone(),
            requested: req.disk_mb,
            available: node.disk_free_mb(),
        });
    }
    Ok(())
}

/// Pick the requested port if it is free, otherwise the lowest free one.
fn claim_port<R>(table: &R, node_id: &str, wanted: Option<u16>) -> StateResult<Allocation>
where
    R: ReadableTable<&'static str, &'static [u8]>,
{
    match wanted {
        Some(port) => {
            let alloc: Option<Allocation> = get_row(table, &allocation_key(node_id, port))?;
            match alloc {
                Some(a) if !a.assigned => Ok(a),
                _ => Err(LedgerError::PortUnavailable {
                    node_id: node_id.to_string(),
                    port,
                }
                .into()),
            }
        }
        None => {
            node_allocations(table, node_id)?
                .into_iter()
                .find(|a| !a.assigned)
                .ok_or_else(|| LedgerError::NoFreePort(node_id.to_string()).into())
        }
    }
}

/// Free the server's allocation and subtract its reservation from the node.
fn free_resources(txn: &redb::WriteTransaction, server: &Server) -> StateResult<()> {
    let mut allocations: Table<'_, &'static str, &'static [u8]> =
        txn.open_table(ALLOCATIONS).map_err(map_err!(Table))?;
    let key = allocation_key(&server.node_id, server.port);
    let alloc: Option<Allocation> = get_row(&allocations, &key)?;
    if let Some(mut alloc) = alloc {
        if alloc.server_id.as_deref() == Some(server.id.as_str()) {
            alloc.assigned = false;
            alloc.server_id = None;
            put_row(&mut allocations, &key, &alloc)?;
        }
    }

    let mut nodes: Table<'_, &'static str, &'static [u8]> =
        txn.open_table(NODES).map_err(map_err!(Table))?;
    let node: Option<Node> = get_row(&nodes, &server.node_id)?;
    if let Some(mut node) = node {
        node.memory_allocated_mb = node.memory_allocated_mb.saturating_sub(server.memory_mb);
        node.disk_allocated_mb = node.disk_allocated_mb.saturating_sub(server.disk_mb);
        put_row(&mut nodes, &node.id, &node)?;
    }
    Ok(())
}
