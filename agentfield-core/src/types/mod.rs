//! Domain model shared by the control plane services.

pub mod dead_letter;
pub mod execution;
pub mod node;
pub mod webhook;
pub mod workflow;

pub use dead_letter::*;
pub use execution::*;
pub use node::*;
pub use webhook::*;
pub use workflow::*;
