//! Core abstractions for marketflow
//!
//! This crate defines the vocabulary shared by the whole workspace: the
//! [`Stage`] trait and its [`StageSpec`] declaration, the versioned
//! [`SharedState`] record, [`RunProgress`], run modes and configuration, and
//! the error taxonomy.

pub mod config;
pub mod error;
pub mod progress;
pub mod stage;
pub mod state;

// Re-export for convenience
pub use config::{CheckpointPolicy, Mode, RunConfig};
pub use error::{Error, Result};
pub use progress::{ProgressSummary, RunProgress};
pub use stage::{Stage, StageSpec, StateUpdate};
pub use state::{SharedState, StateView};
