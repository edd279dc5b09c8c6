//! Error types for marketflow-core
//!
//! The taxonomy mirrors how failures propagate through a run:
//! configuration errors surface before any stage executes, state errors are
//! fatal implementation bugs, stage failures are absorbed per the stage's
//! required/optional policy, and checkpoint errors split into fatal writes
//! and recoverable reads.

use thiserror::Error;

/// Result type alias for marketflow operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for workflow operations
#[derive(Error, Debug)]
pub enum Error {
    // ----- configuration errors (fatal, pre-run) -----
    /// A stage with this name is already registered
    #[error("duplicate stage: {0}")]
    DuplicateStage(String),

    /// Registering this stage would make the read/write graph cyclic
    #[error("dependency cycle involving stages: {0}")]
    DependencyCycle(String),

    /// Two stages in the same concurrency group declare the same write key
    #[error("conflicting writes to '{key}' within one group: {first} and {second}")]
    ConflictingWrites {
        key: String,
        first: String,
        second: String,
    },

    /// Requested run mode is not recognized
    #[error("unknown mode: {0}")]
    UnknownMode(String),

    // ----- state errors (fatal, indicates a bug) -----
    /// A stage produced a key outside its declared writes
    #[error("stage '{stage}' wrote undeclared key '{key}'")]
    UnauthorizedWrite { stage: String, key: String },

    /// A stage overwrote a key it neither reads nor previously wrote
    #[error("stage '{stage}' overwrote '{key}' without reading the prior value")]
    IllegalOverwrite { stage: String, key: String },

    // ----- stage failures (recoverable per required/optional policy) -----
    /// A stage invocation failed after exhausting retries
    #[error("stage '{stage}' failed: {reason}")]
    StageFailed { stage: String, reason: String },

    /// A stage returned output that does not match its declared writes
    #[error("stage '{stage}' returned invalid output: {reason}")]
    InvalidStageOutput { stage: String, reason: String },

    // ----- checkpoint errors -----
    /// The named checkpoint does not exist
    #[error("checkpoint not found: {0}")]
    ResumeTargetNotFound(String),

    /// A checkpoint failed its integrity check
    #[error("corrupt checkpoint '{id}': {reason}")]
    CorruptCheckpoint { id: String, reason: String },

    /// I/O error while persisting or loading a checkpoint
    #[error("checkpoint I/O error: {0}")]
    CheckpointIo(#[from] std::io::Error),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl Error {
    /// Whether this error must abort the run regardless of stage policy.
    ///
    /// Stage failures are handled by the engine's required/optional policy;
    /// everything else indicates a configuration or implementation problem.
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self,
            Error::StageFailed { .. } | Error::InvalidStageOutput { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::DuplicateStage("market_research".to_string());
        assert_eq!(err.to_string(), "duplicate stage: market_research");

        let err = Error::UnauthorizedWrite {
            stage: "stock_analysis".to_string(),
            key: "charts".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "stage 'stock_analysis' wrote undeclared key 'charts'"
        );
    }

    #[test]
    fn test_fatality() {
        assert!(Error::UnknownMode("turbo".to_string()).is_fatal());
        assert!(
            Error::UnauthorizedWrite {
                stage: "a".to_string(),
                key: "k".to_string(),
            }
            .is_fatal()
        );
        assert!(
            !Error::StageFailed {
                stage: "a".to_string(),
                reason: "backend down".to_string(),
            }
            .is_fatal()
        );
    }
}
