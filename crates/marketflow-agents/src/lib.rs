//! Market analysis stages for marketflow
//!
//! Models each analysis agent from the market report workflow as a stage
//! that reads a subset of shared state, calls a pluggable backend, and
//! returns a partial update. The roster and its dependencies are
//! configuration data; the engine never hard-codes them.

pub mod backend;
pub mod stages;

// Re-export for convenience
pub use backend::{AnalysisBackend, AnalysisRequest, StubBackend};
pub use stages::{AnalysisStage, MarketCatalog, market_stage_specs};
