//! The market analysis stage roster
//!
//! Seven stages arranged as two research chains joined by chart and report
//! synthesis:
//!
//! ```text
//! market_research ──► consumer_analysis ──┐
//! company_analysis ─┬► tech_analysis ─────┼─► chart_generation ─► report_generation
//!                   └► stock_analysis ────┘
//! ```
//!
//! The arrows are not wired anywhere: they fall out of the declared
//! read/write key sets when the registry resolves the graph. Changing a
//! dependency (stock analysis once ran independently, then grew a
//! company-list input) means editing one declaration, not the engine.

use crate::backend::{AnalysisBackend, AnalysisRequest, StubBackend};
use async_trait::async_trait;
use marketflow_core::{Error, Mode, Result, RunConfig, Stage, StageSpec, StateUpdate, StateView};
use marketflow_engine::StageCatalog;
use std::sync::Arc;
use tracing::debug;

/// A stage backed by an [`AnalysisBackend`] call
///
/// Holds no run data; inputs arrive through the restricted view and
/// outputs are validated against the declared writes before leaving.
pub struct AnalysisStage {
    spec: StageSpec,
    backend: Arc<dyn AnalysisBackend>,
}

impl AnalysisStage {
    /// Create a stage from its declaration and backend
    pub fn new(spec: StageSpec, backend: Arc<dyn AnalysisBackend>) -> Self {
        Self { spec, backend }
    }
}

#[async_trait]
impl Stage for AnalysisStage {
    fn spec(&self) -> &StageSpec {
        &self.spec
    }

    async fn run(&self, input: &StateView, config: &RunConfig) -> Result<StateUpdate> {
        let request = AnalysisRequest {
            stage: self.spec.name.clone(),
            writes: self.spec.writes.clone(),
            inputs: input
                .iter()
                .map(|(k, v)| (k.to_string(), v.clone()))
                .collect(),
            mode: config.mode,
        };
        debug!(stage = %self.spec.name, inputs = input.len(), "invoking analysis backend");

        let output = self.backend.analyze(request).await?;
        let Some(fields) = output.as_object() else {
            return Err(Error::InvalidStageOutput {
                stage: self.spec.name.clone(),
                reason: "backend returned a non-object payload".to_string(),
            });
        };

        let update: StateUpdate = fields
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        self.spec.check_update(&update)?;
        Ok(update)
    }
}

/// Declarations for the full market analysis roster
pub fn market_stage_specs() -> Vec<StageSpec> {
    vec![
        StageSpec::new("market_research")
            .writes(["market_trends", "government_policies", "market_data"])
            .concurrency_group("research"),
        StageSpec::new("company_analysis")
            .writes(["company_analysis", "company_tech_data"])
            .concurrency_group("research"),
        StageSpec::new("consumer_analysis")
            .reads(["market_trends", "government_policies"])
            .writes(["consumer_patterns"])
            .concurrency_group("analysis"),
        StageSpec::new("tech_analysis")
            .reads(["company_tech_data"])
            .writes(["tech_trends"])
            .concurrency_group("analysis"),
        StageSpec::new("stock_analysis")
            .reads(["company_analysis"])
            .writes(["stock_analysis"])
            .concurrency_group("analysis"),
        StageSpec::new("chart_generation")
            .reads([
                "market_data",
                "consumer_patterns",
                "company_analysis",
                "tech_trends",
                "stock_analysis",
            ])
            .writes(["charts"])
            .concurrency_group("synthesis"),
        StageSpec::new("report_generation")
            .reads([
                "charts",
                "market_trends",
                "consumer_patterns",
                "company_analysis",
                "tech_trends",
                "stock_analysis",
            ])
            .writes(["final_report"])
            .concurrency_group("reporting")
            .required(),
    ]
}

/// Stage catalog for the market analysis workflow
///
/// `quick` skips the expensive stock and tech stages; `test` runs a minimal
/// research → report pair against the stub backend regardless of the wired
/// backend.
pub struct MarketCatalog {
    backend: Arc<dyn AnalysisBackend>,
    stub: Arc<StubBackend>,
}

impl MarketCatalog {
    /// Create a catalog over the given backend
    pub fn new(backend: Arc<dyn AnalysisBackend>) -> Self {
        Self {
            backend,
            stub: Arc::new(StubBackend::new()),
        }
    }

    /// Catalog backed entirely by the stub (no external calls)
    pub fn stubbed() -> Self {
        Self::new(Arc::new(StubBackend::new()))
    }
}

impl StageCatalog for MarketCatalog {
    fn stages_for(&self, mode: Mode) -> Vec<Arc<dyn Stage>> {
        let specs = market_stage_specs();
        match mode {
            Mode::Full | Mode::Monitor => specs
                .into_iter()
                .map(|spec| {
                    Arc::new(AnalysisStage::new(spec, Arc::clone(&self.backend)))
                        as Arc<dyn Stage>
                })
                .collect(),
            Mode::Quick => specs
                .into_iter()
                .filter(|spec| spec.name != "stock_analysis" && spec.name != "tech_analysis")
                .map(|spec| {
                    Arc::new(AnalysisStage::new(spec, Arc::clone(&self.backend)))
                        as Arc<dyn Stage>
                })
                .collect(),
            Mode::Test => specs
                .into_iter()
                .filter(|spec| spec.name == "market_research" || spec.name == "report_generation")
                .map(|spec| {
                    let stub = Arc::clone(&self.stub) as Arc<dyn AnalysisBackend>;
                    Arc::new(AnalysisStage::new(spec, stub)) as Arc<dyn Stage>
                })
                .collect(),
        }
    }
}
