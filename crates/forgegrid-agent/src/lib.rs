//! forgegrid-agent — the per-node agent.
//!
//! Owns the local container engine and exposes workload lifecycle,
//! console and health RPCs to the control plane over an authenticated
//! gRPC channel.
//!
//! # Architecture
//!
//! ```text
//! Control Plane
//!   └── gRPC (mTLS or bearer token) ──► auth::serve
//!                                         └── AgentServer (service)
//!                                               └── LifecycleManager
//!                                                     ├── ContainerRegistry (cache)
//!                                                     ├── StatsTracker
//!                                                     └── dyn ContainerEngine
//!                                                           ├── DockerEngine (bollard)
//!                                                           └── MemoryEngine
//! ```

pub mod auth;
pub mod config;
pub mod engine;
pub mod error;
pub mod lifecycle;
pub mod registry;
pub mod service;
pub mod stats;
pub mod tls;

/// Generated protobuf types and gRPC service stubs.
pub mod proto {
    tonic::include_proto!("forgegrid.agent");
}

pub use auth::{AuthMode, BearerToken, TokenGate};
pub use config::AgentConfig;
pub use error::{LifecycleError, LifecycleResult};
pub use lifecycle::{LifecycleConfig, LifecycleManager};
pub use service::AgentServer;
