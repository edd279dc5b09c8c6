//! Checkpoint persistence for marketflow
//!
//! Couples `SharedState` and `RunProgress` into one durable snapshot so a
//! resumed run never observes state and progress drifting apart.

pub mod checkpoint;
pub mod store;

// Re-export for convenience
pub use checkpoint::{Checkpoint, FORMAT_VERSION};
pub use store::CheckpointStore;
