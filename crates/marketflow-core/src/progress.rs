//! Run progress tracking
//!
//! [`RunProgress`] records which stages have completed, failed, or are still
//! pending for the active run. It is persisted together with `SharedState`
//! inside every checkpoint so a resumed run never sees state and progress
//! drift apart.

use crate::config::Mode;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Progress record for the active run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunProgress {
    /// Identifier for this run (also the checkpoint id prefix)
    pub run_id: String,
    /// The mode this run was started with
    pub mode: Mode,
    /// Concurrency budget the run was started with
    pub concurrency_budget: usize,
    /// Ordered, append-only sequence of completed stage names
    completed_stages: Vec<String>,
    /// Failed stage name → failure reason
    failed_stages: BTreeMap<String, String>,
    /// Stages not yet attempted
    pending_stages: Vec<String>,
}

impl RunProgress {
    /// Create progress for a fresh run with all stages pending
    pub fn new(
        run_id: impl Into<String>,
        mode: Mode,
        concurrency_budget: usize,
        pending: Vec<String>,
    ) -> Self {
        Self {
            run_id: run_id.into(),
            mode,
            concurrency_budget,
            completed_stages: Vec::new(),
            failed_stages: BTreeMap::new(),
            pending_stages: pending,
        }
    }

    /// Whether a stage has already completed (resume support)
    pub fn is_completed(&self, stage: &str) -> bool {
        self.completed_stages.iter().any(|s| s == stage)
    }

    /// Record a stage as completed, removing it from pending
    ///
    /// Appending is idempotent: a stage completed in a previous run segment
    /// is never recorded twice.
    pub fn mark_completed(&mut self, stage: &str) {
        if !self.is_completed(stage) {
            self.completed_stages.push(stage.to_string());
        }
        self.pending_stages.retain(|s| s != stage);
        // A retried stage that now succeeded is no longer failed.
        self.failed_stages.remove(stage);
    }

    /// Re-queue a stage for execution (resume re-attempts failed stages)
    pub fn push_pending(&mut self, stage: impl Into<String>) {
        let stage = stage.into();
        if !self.is_completed(&stage) && !self.pending_stages.contains(&stage) {
            self.failed_stages.remove(&stage);
            self.pending_stages.push(stage);
        }
    }

    /// Record a stage as failed with a reason, removing it from pending
    pub fn mark_failed(&mut self, stage: &str, reason: impl Into<String>) {
        self.failed_stages.insert(stage.to_string(), reason.into());
        self.pending_stages.retain(|s| s != stage);
    }

    /// Completed stage names in completion order
    pub fn completed(&self) -> &[String] {
        &self.completed_stages
    }

    /// Failed stages with their reasons
    pub fn failed(&self) -> &BTreeMap<String, String> {
        &self.failed_stages
    }

    /// Stages not yet attempted
    pub fn pending(&self) -> &[String] {
        &self.pending_stages
    }

    /// Snapshot of per-run completion counts
    pub fn summary(&self) -> ProgressSummary {
        let completed = self.completed_stages.len();
        let failed = self.failed_stages.len();
        let pending = self.pending_stages.len();
        let total = completed + failed + pending;
        ProgressSummary {
            completed,
            failed,
            pending,
            ratio: if total == 0 {
                1.0
            } else {
                completed as f64 / total as f64
            },
        }
    }
}

/// Counts reported at the end of a run (and between monitor cycles)
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProgressSummary {
    /// Stages that completed successfully
    pub completed: usize,
    /// Stages recorded as failed
    pub failed: usize,
    /// Stages never attempted (e.g. after an abort)
    pub pending: usize,
    /// Completed / total, in `0.0..=1.0`
    pub ratio: f64,
}
