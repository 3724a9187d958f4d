//! forgegrid-state — embedded state store and resource ledger.
//!
//! Backed by [redb](https://docs.rs/redb), persists the three record kinds
//! the control plane needs to place game-server workloads on nodes:
//!
//! - **nodes** — address, authentication material, declared capacity and
//!   the currently allocated totals
//! - **allocations** — `(node, port)` pairs, unique by construction since
//!   the pair is the table key
//! - **servers** — workload rows carrying limits, status and the
//!   engine-assigned container id
//!
//! # Ledger
//!
//! The capacity checks, port assignment and their release live in
//! [`ledger`]. Each ledger operation runs inside a single redb write
//! transaction. redb admits one writer at a time, so two placements on the
//! same node can never both pass the capacity check against stale totals.
//!
//! The `StateStore` is `Clone` + `Send` + `Sync` (backed by `Arc<Database>`)
//! and can be shared across async tasks.

pub mod error;
pub mod ledger;
pub mod store;
pub mod tables;
pub mod types;

pub use error::{LedgerError, StateError, StateResult};
pub use ledger::{PlacementRequest, Reservation};
pub use store::StateStore;
pub use types::*;
