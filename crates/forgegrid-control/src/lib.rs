//! forgegrid-control — the control plane's side of the node protocol.
//!
//! Reaches node agents and keeps the ledger in step with what they run:
//!
//! - [`ConnectionPool`] holds one authenticated gRPC channel per node,
//!   connects lazily with bounded retries and evicts broken channels
//! - [`Dispatcher`] turns server operations into ledger transactions plus
//!   agent calls, rolling the ledger back when dispatch fails
//!
//! # Architecture
//!
//! ```text
//! Dispatcher
//!   ├── StateStore (reserve / commit / rollback / release)
//!   └── ConnectionPool
//!       └── node_id → AgentServiceClient (mTLS or bearer token)
//! ```

pub mod dispatcher;
pub mod error;
pub mod pool;

pub use dispatcher::{Dispatcher, ServerRequest};
pub use error::{DispatchError, DispatchResult, PoolError, PoolResult};
pub use pool::{AgentClient, ConnectionPool, PoolConfig};
