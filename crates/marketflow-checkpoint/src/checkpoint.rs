//! The checkpoint artifact
//!
//! A [`Checkpoint`] is an immutable, timestamped snapshot of `SharedState`
//! and `RunProgress` taken together after a concurrency group completes.
//! The file format is self-describing JSON carrying a format version so a
//! resumed process can reject incompatible snapshots.

use chrono::{DateTime, Utc};
use marketflow_core::{Error, Mode, Result, RunProgress, SharedState};
use serde::{Deserialize, Serialize};

/// Current checkpoint file format version
pub const FORMAT_VERSION: u32 = 1;

/// Immutable snapshot of state plus progress
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    /// File format version, for compatibility validation on load
    pub format_version: u32,
    /// Copy of `shared_state.version()` at capture time
    pub state_version: u64,
    /// Ordinal of this snapshot within the run, starting at 1
    ///
    /// The state version alone cannot distinguish snapshots: a group in
    /// which every optional stage fails leaves the version unchanged. The
    /// sequence makes every save land in a fresh file.
    pub sequence: u32,
    /// The shared state at capture time
    pub shared_state: SharedState,
    /// The run progress at capture time
    pub run_progress: RunProgress,
    /// The mode the captured run was started with
    pub mode: Mode,
    /// Capture time
    pub timestamp: DateTime<Utc>,
}

impl Checkpoint {
    /// Capture the `sequence`-th snapshot of the given state and progress
    pub fn capture(shared_state: &SharedState, run_progress: &RunProgress, sequence: u32) -> Self {
        Self {
            format_version: FORMAT_VERSION,
            state_version: shared_state.version(),
            sequence,
            shared_state: shared_state.clone(),
            run_progress: run_progress.clone(),
            mode: run_progress.mode,
            timestamp: Utc::now(),
        }
    }

    /// Identifier under which this snapshot is stored
    ///
    /// Combines the run id, state version, and save sequence; the sequence
    /// keeps ids unique across saves that did not advance the state.
    pub fn id(&self) -> String {
        format!(
            "{}_v{:04}_c{:02}",
            self.run_progress.run_id, self.state_version, self.sequence
        )
    }

    /// Internal integrity check applied on load
    ///
    /// Rejects unknown format versions and snapshots whose recorded version
    /// disagrees with the embedded state (a sign of a torn or hand-edited
    /// file).
    pub fn validate(&self) -> Result<()> {
        if self.format_version != FORMAT_VERSION {
            return Err(Error::CorruptCheckpoint {
                id: self.id(),
                reason: format!(
                    "unsupported format version {} (expected {FORMAT_VERSION})",
                    self.format_version
                ),
            });
        }
        if self.state_version != self.shared_state.version() {
            return Err(Error::CorruptCheckpoint {
                id: self.id(),
                reason: format!(
                    "state version mismatch: header {} vs state {}",
                    self.state_version,
                    self.shared_state.version()
                ),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use marketflow_core::{Mode, StageSpec, StateUpdate};

    fn sample() -> Checkpoint {
        let spec = StageSpec::new("market_research").writes(["market_trends"]);
        let mut state = SharedState::new();
        let mut update = StateUpdate::new();
        update.insert("market_trends".to_string(), serde_json::json!("up"));
        state.apply(update, &spec).unwrap();

        let mut progress = RunProgress::new(
            "wf_20260829_120000",
            Mode::Full,
            4,
            vec!["market_research".to_string()],
        );
        progress.mark_completed("market_research");

        Checkpoint::capture(&state, &progress, 1)
    }

    #[test]
    fn test_capture_records_versions() {
        let cp = sample();
        assert_eq!(cp.format_version, FORMAT_VERSION);
        assert_eq!(cp.state_version, 1);
        assert_eq!(cp.sequence, 1);
        assert_eq!(cp.id(), "wf_20260829_120000_v0001_c01");
        cp.validate().unwrap();
    }

    #[test]
    fn test_id_distinguishes_saves_at_same_state_version() {
        // A group of failing optional stages advances the sequence but not
        // the state; the two snapshots must not collide on disk.
        let first = sample();
        let mut second = first.clone();
        second.sequence = 2;
        assert_ne!(first.id(), second.id());
    }

    #[test]
    fn test_validate_rejects_format_mismatch() {
        let mut cp = sample();
        cp.format_version = 99;
        let err = cp.validate().unwrap_err();
        assert!(matches!(err, Error::CorruptCheckpoint { .. }));
    }

    #[test]
    fn test_validate_rejects_version_drift() {
        let mut cp = sample();
        cp.state_version = 7;
        let err = cp.validate().unwrap_err();
        assert!(matches!(err, Error::CorruptCheckpoint { .. }));
    }
}
