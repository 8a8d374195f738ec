//! Core types and configuration for the AgentField control plane.
//!
//! This crate provides the domain model (nodes, executions, workflows,
//! webhooks, dead letters), the error taxonomy, and configuration loading
//! used by the control plane service.

pub mod config;
pub mod error;
pub mod types;

pub use config::ControlPlaneConfig;
pub use error::{ControlPlaneError, Result};
pub use types::*;

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::ControlPlaneConfig;
    pub use crate::error::{ControlPlaneError, Result};
    pub use crate::types::*;
}
