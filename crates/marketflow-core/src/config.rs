//! Run modes and configuration
//!
//! A [`Mode`] selects which stages run and with what budget; the controller
//! translates it into a concrete [`RunConfig`] that parameterizes the engine.

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// Requested run mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    /// All registered stages, checkpoint after every group
    Full,
    /// Reduced stage subset, checkpoint only at the end
    Quick,
    /// Minimal stage subset against stubbed inputs, for validating the graph
    Test,
    /// Repeated full cycles on a schedule
    Monitor,
}

impl Mode {
    /// All known modes, for help output
    pub const ALL: [Mode; 4] = [Mode::Full, Mode::Quick, Mode::Test, Mode::Monitor];

    /// Mode name as used on the command line
    pub fn as_str(&self) -> &'static str {
        match self {
            Mode::Full => "full",
            Mode::Quick => "quick",
            Mode::Test => "test",
            Mode::Monitor => "monitor",
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Mode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "full" => Ok(Mode::Full),
            "quick" => Ok(Mode::Quick),
            "test" => Ok(Mode::Test),
            "monitor" => Ok(Mode::Monitor),
            other => Err(Error::UnknownMode(other.to_string())),
        }
    }
}

/// When the engine persists checkpoints
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointPolicy {
    /// After every concurrency group (bounds crash loss to one group)
    EveryGroup,
    /// Only once, after the final group
    AtEnd,
}

/// Concrete parameters for one run, derived from the requested mode
#[derive(Debug, Clone, PartialEq)]
pub struct RunConfig {
    /// The mode that produced this configuration
    pub mode: Mode,
    /// Maximum stages executing simultaneously within a group
    pub concurrency_budget: usize,
    /// Attempts per stage before it is recorded as failed
    pub max_attempts: u32,
    /// Base delay between retry attempts (scaled by attempt number)
    pub retry_backoff: Duration,
    /// Bounded wait for a single stage invocation
    pub stage_timeout: Duration,
    /// When to persist checkpoints
    pub checkpoint_policy: CheckpointPolicy,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            mode: Mode::Full,
            concurrency_budget: 4,
            max_attempts: 3,
            retry_backoff: Duration::from_secs(2),
            stage_timeout: Duration::from_secs(120),
            checkpoint_policy: CheckpointPolicy::EveryGroup,
        }
    }
}
