//! Workflow run tracking.

pub mod tracker;

pub use tracker::{WorkflowRunDetail, WorkflowRunPage, WorkflowTracker};
