//! Stage declarations and the stage invocation boundary
//!
//! A [`StageSpec`] is an immutable declaration of a unit of work: which state
//! keys it reads, which it may write, whether its failure aborts the run, and
//! which concurrency group it belongs to. The [`Stage`] trait is the sole
//! interface to the excluded analysis logic: a stage receives a read-only
//! view of shared state restricted to its declared reads and returns a
//! partial update restricted to its declared writes.

use crate::config::RunConfig;
use crate::state::StateView;
use crate::{Error, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Partial state update returned by a stage: key → opaque payload
pub type StateUpdate = BTreeMap<String, serde_json::Value>;

/// Immutable declaration of a unit of work
///
/// Stages are validated at registration time, not at run time. The
/// read/write key sets define the dependency graph: a stage depends on
/// every stage that writes one of its read keys.
///
/// # Example
///
/// ```
/// use marketflow_core::StageSpec;
///
/// let spec = StageSpec::new("consumer_analysis")
///     .reads(["market_trends", "government_policies"])
///     .writes(["consumer_patterns"])
///     .concurrency_group("analysis");
///
/// assert!(!spec.required);
/// assert!(spec.reads.contains("market_trends"));
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageSpec {
    /// Unique stage name
    pub name: String,
    /// State keys this stage depends on
    pub reads: BTreeSet<String>,
    /// State keys this stage may produce
    pub writes: BTreeSet<String>,
    /// Stages sharing a group tag may run in parallel once ready
    pub concurrency_group: String,
    /// If true, failure of this stage aborts the whole run
    pub required: bool,
}

impl StageSpec {
    /// Create a new stage declaration with no reads or writes
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            reads: BTreeSet::new(),
            writes: BTreeSet::new(),
            concurrency_group: "default".to_string(),
            required: false,
        }
    }

    /// Declare the state keys this stage reads
    pub fn reads<I, S>(mut self, keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.reads = keys.into_iter().map(Into::into).collect();
        self
    }

    /// Declare the state keys this stage may write
    pub fn writes<I, S>(mut self, keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.writes = keys.into_iter().map(Into::into).collect();
        self
    }

    /// Set the concurrency group tag
    pub fn concurrency_group(mut self, group: impl Into<String>) -> Self {
        self.concurrency_group = group.into();
        self
    }

    /// Mark this stage as required (its failure aborts the run)
    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    /// Validate a produced update against the declared writes
    ///
    /// Every key in `update` must appear in `writes`. The engine applies
    /// this check again inside `SharedState::apply`; checking here lets a
    /// stage implementation fail fast with an `InvalidStageOutput` before
    /// the update is handed to the engine.
    pub fn check_update(&self, update: &StateUpdate) -> Result<()> {
        for key in update.keys() {
            if !self.writes.contains(key) {
                return Err(Error::InvalidStageOutput {
                    stage: self.name.clone(),
                    reason: format!("undeclared output key '{key}'"),
                });
            }
        }
        Ok(())
    }
}

/// Core trait implemented by every workflow stage
///
/// Implementations hold no run data between invocations; all inputs arrive
/// through the restricted [`StateView`] and all outputs leave through the
/// returned [`StateUpdate`].
#[async_trait]
pub trait Stage: Send + Sync {
    /// The stage's immutable declaration
    fn spec(&self) -> &StageSpec;

    /// Execute the stage against a read-only view of shared state
    ///
    /// Returns a partial update restricted to the declared writes, or an
    /// error carrying a human-readable failure reason.
    async fn run(&self, input: &StateView, config: &RunConfig) -> Result<StateUpdate>;
}

impl std::fmt::Debug for dyn Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stage").field("spec", self.spec()).finish()
    }
}
