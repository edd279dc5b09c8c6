//! Workflow orchestration for marketflow
//!
//! This crate hosts the engineering core: dependency resolution over stage
//! declarations, group-wise concurrent execution with retries and
//! checkpointing, and the mode-driven run controller.

pub mod controller;
pub mod engine;
pub mod registry;

// Re-export for convenience
pub use controller::{MonitorPolicy, ResetPolicy, RunController, StageCatalog};
pub use engine::{RunOutcome, RunState, WorkflowEngine};
pub use registry::StageRegistry;
