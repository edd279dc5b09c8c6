//! Run controller: mode selection, resume, and monitor cycles
//!
//! The controller is the top-level entry point. It translates a requested
//! mode into a concrete stage subset (via a [`StageCatalog`]), concurrency
//! budget, and checkpoint policy, then drives [`WorkflowEngine`] to
//! completion or failure.

use crate::engine::{RunOutcome, WorkflowEngine};
use crate::registry::StageRegistry;
use marketflow_checkpoint::CheckpointStore;
use marketflow_core::{CheckpointPolicy, Mode, Result, RunConfig, SharedState, Stage};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{info, warn};

/// Supplies the stage subset for a requested mode
///
/// The graph is configuration data, not hard-coded control flow: catalogs
/// decide which stages exist per mode, the engine only sees declarations.
pub trait StageCatalog: Send + Sync {
    /// Stages to register for the given mode
    fn stages_for(&self, mode: Mode) -> Vec<Arc<dyn Stage>>;
}

/// State handling between monitor cycles
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResetPolicy {
    /// Carry shared state into the next cycle (stages refresh their keys)
    KeepState,
    /// Start each cycle from an empty state
    ClearState,
}

/// Schedule for monitor mode
#[derive(Debug, Clone)]
pub struct MonitorPolicy {
    /// Pause between cycles
    pub interval: Duration,
    /// Stop after this many cycles (`None` = run until aborted)
    pub max_cycles: Option<u32>,
    /// What happens to shared state between cycles
    pub reset: ResetPolicy,
}

impl Default for MonitorPolicy {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(300),
            max_cycles: None,
            reset: ResetPolicy::KeepState,
        }
    }
}

/// Top-level entry point for starting and resuming runs
pub struct RunController {
    catalog: Arc<dyn StageCatalog>,
    store: Arc<CheckpointStore>,
    monitor: MonitorPolicy,
}

impl RunController {
    /// Create a controller over a stage catalog and checkpoint store
    pub fn new(catalog: Arc<dyn StageCatalog>, store: Arc<CheckpointStore>) -> Self {
        Self {
            catalog,
            store,
            monitor: MonitorPolicy::default(),
        }
    }

    /// Override the monitor schedule
    pub fn with_monitor_policy(mut self, policy: MonitorPolicy) -> Self {
        self.monitor = policy;
        self
    }

    /// Concrete run configuration for a mode
    pub fn config_for(mode: Mode) -> RunConfig {
        match mode {
            Mode::Full | Mode::Monitor => RunConfig {
                mode,
                ..RunConfig::default()
            },
            Mode::Quick => RunConfig {
                mode,
                concurrency_budget: 8,
                max_attempts: 2,
                stage_timeout: Duration::from_secs(60),
                checkpoint_policy: CheckpointPolicy::AtEnd,
                ..RunConfig::default()
            },
            Mode::Test => RunConfig {
                mode,
                concurrency_budget: 2,
                max_attempts: 1,
                stage_timeout: Duration::from_secs(10),
                checkpoint_policy: CheckpointPolicy::AtEnd,
                ..RunConfig::default()
            },
        }
    }

    /// Start a fresh run in the given mode
    pub async fn run(&self, mode: Mode) -> Result<RunOutcome> {
        match mode {
            Mode::Monitor => self.run_monitor().await,
            _ => {
                let registry = self.registry_for(mode)?;
                let config = Self::config_for(mode);
                let mut engine =
                    WorkflowEngine::new(registry, config, Some(Arc::clone(&self.store)));
                engine.run().await
            }
        }
    }

    /// Resume the run recorded in the named checkpoint
    ///
    /// Fails with `ResumeTargetNotFound` if the checkpoint cannot be
    /// loaded. The stage subset is rebuilt for the mode the checkpoint was
    /// taken under, so resumed runs see the same graph.
    pub async fn resume(&self, checkpoint_id: &str) -> Result<RunOutcome> {
        let checkpoint = self.store.load(checkpoint_id)?;
        let mode = checkpoint.mode;
        info!(checkpoint = %checkpoint_id, %mode, "resuming run");

        let registry = self.registry_for(mode)?;
        let config = Self::config_for(mode);
        let mut engine = WorkflowEngine::from_checkpoint(
            registry,
            config,
            Some(Arc::clone(&self.store)),
            checkpoint,
        );
        engine.run().await
    }

    /// Monitor mode: repeated cycles on a schedule
    ///
    /// Each cycle is a full engine run; shared state is carried or cleared
    /// between cycles per the reset policy. An aborted cycle stops the
    /// monitor so the failure surfaces instead of repeating silently.
    async fn run_monitor(&self) -> Result<RunOutcome> {
        let mut carried: Option<SharedState> = None;
        let mut cycle = 0u32;
        loop {
            cycle += 1;
            info!(cycle, "monitor cycle starting");

            let registry = self.registry_for(Mode::Monitor)?;
            let config = Self::config_for(Mode::Monitor);
            let mut engine = WorkflowEngine::new(registry, config, Some(Arc::clone(&self.store)));
            if let Some(state) = carried.take() {
                engine = engine.with_state(state);
            }

            let outcome = engine.run().await?;
            let summary = outcome.progress.summary();
            info!(
                cycle,
                completed = summary.completed,
                failed = summary.failed,
                "monitor cycle finished"
            );

            if !outcome.is_completed() {
                warn!(cycle, "monitor cycle aborted, stopping");
                return Ok(outcome);
            }
            if self.monitor.max_cycles.is_some_and(|max| cycle >= max) {
                return Ok(outcome);
            }

            if self.monitor.reset == ResetPolicy::KeepState {
                carried = Some(outcome.shared_state);
            }
            sleep(self.monitor.interval).await;
        }
    }

    fn registry_for(&self, mode: Mode) -> Result<Arc<StageRegistry>> {
        let registry = StageRegistry::from_stages(self.catalog.stages_for(mode))?;
        Ok(Arc::new(registry))
    }
}
