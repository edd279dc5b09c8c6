//! The analysis backend boundary
//!
//! Everything market-specific about an individual stage (prompt content,
//! model choice, retrieval) lives behind [`AnalysisBackend`]. The
//! orchestration core only sees "a stage reads some state, calls the
//! backend, and returns a partial update".

use async_trait::async_trait;
use marketflow_core::{Mode, Result};
use serde_json::{Value, json};
use std::collections::{BTreeMap, BTreeSet};

/// One backend invocation on behalf of a stage
#[derive(Debug, Clone)]
pub struct AnalysisRequest {
    /// Name of the invoking stage
    pub stage: String,
    /// The state keys the stage will populate; the backend must return a
    /// JSON object keyed by (a subset of) these
    pub writes: BTreeSet<String>,
    /// The stage's visible inputs (restricted to its declared reads)
    pub inputs: BTreeMap<String, Value>,
    /// The mode of the active run, for cost/depth decisions
    pub mode: Mode,
}

/// External analysis capability (LLM or retrieval backend)
#[async_trait]
pub trait AnalysisBackend: Send + Sync {
    /// Produce analysis output for one stage invocation
    ///
    /// Must return a JSON object whose keys are among `request.writes`.
    async fn analyze(&self, request: AnalysisRequest) -> Result<Value>;
}

/// Deterministic backend for test mode and graph validation
///
/// Produces a self-describing payload per write key without any external
/// call, so a `test` run exercises the full orchestration path at zero
/// cost.
#[derive(Debug, Default, Clone)]
pub struct StubBackend;

impl StubBackend {
    /// Create a stub backend
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl AnalysisBackend for StubBackend {
    async fn analyze(&self, request: AnalysisRequest) -> Result<Value> {
        let inputs_seen: Vec<&String> = request.inputs.keys().collect();
        let fields: serde_json::Map<String, Value> = request
            .writes
            .iter()
            .map(|key| {
                (
                    key.clone(),
                    json!({
                        "stage": request.stage,
                        "field": key,
                        "mode": request.mode.as_str(),
                        "derived_from": inputs_seen,
                        "stub": true,
                    }),
                )
            })
            .collect();
        Ok(Value::Object(fields))
    }
}
