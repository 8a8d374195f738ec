//! Execution records, routing to agent nodes, and audit hooks.

pub mod audit;
pub mod invoker;
pub mod service;
pub mod store;

pub use audit::{AuditTrail, ExecutionAudit, ExecutionAuditHook, LogAuditHook};
pub use invoker::{AgentCall, AgentInvoker, AgentReply, HttpAgentInvoker};
pub use service::ExecutionService;
pub use store::{ExecutionPage, ExecutionRecordStore};
