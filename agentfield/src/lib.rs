//! AgentField - control plane for distributed AI agent nodes
//!
//! # Architecture
//!
//! - `nodes` - Node registration, leases, liveness sweeps and shutdown
//! - `executions` - Execution records, routing to agent nodes, audit hooks
//! - `workflow` - Run/step tree built from parent-child executions
//! - `events` - In-process event buses with per-subscriber queues
//! - `delivery` - Signed webhook delivery, retries, dead letters and redrive
//! - `gc` - Stale-execution timeouts and retention cleanup
//! - `storage` - Persistence contract and the in-memory backend
//! - `api` - REST and Server-Sent Events surface
//! - `client` - Lease client used by agent nodes

pub mod api;
pub mod app;
pub mod client;
pub mod delivery;
pub mod events;
pub mod executions;
pub mod gc;
pub mod nodes;
pub mod storage;
pub mod workflow;

pub use agentfield_core::{ControlPlaneConfig, ControlPlaneError, Result};
pub use app::{Collaborators, ControlPlane};
pub use client::LeaseClient;

/// AgentField version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
