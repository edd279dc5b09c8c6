//! Shared utilities for marketflow

pub mod logging;

pub use logging::init_tracing;
