//! Shared workflow state
//!
//! [`SharedState`] is the single owner of run data: a versioned mapping from
//! semantic field names ("market_trends", "company_analysis", ...) to opaque
//! JSON payloads. All mutation goes through [`SharedState::apply`], which
//! enforces the write-authorization and overwrite rules and records which
//! stage last wrote each key.

use crate::stage::{StageSpec, StateUpdate};
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// The versioned shared record threaded through a run
///
/// Invariants:
/// - a key is only ever written by a stage declaring it in `writes`;
/// - an existing key may be overwritten only by a stage that reads the
///   prior value, or by the stage that wrote it (retried updates);
/// - `version` increases by exactly one per successful `apply`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SharedState {
    values: BTreeMap<String, serde_json::Value>,
    version: u64,
    /// key → name of the stage that last wrote it
    history: BTreeMap<String, String>,
}

impl SharedState {
    /// Create an empty state at version zero
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the current value for a key, or `None` if not yet produced
    pub fn get(&self, key: &str) -> Option<&serde_json::Value> {
        self.values.get(key)
    }

    /// Check whether a key has been produced
    pub fn contains_key(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    /// Current state version
    pub fn version(&self) -> u64 {
        self.version
    }

    /// The stage that last wrote a key, if any
    pub fn last_author(&self, key: &str) -> Option<&str> {
        self.history.get(key).map(String::as_str)
    }

    /// Names of all produced keys
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.values.keys().map(String::as_str)
    }

    /// Number of produced keys
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Whether no keys have been produced yet
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Build a read-only view restricted to the given keys
    ///
    /// Keys that have not been produced yet are simply absent from the view;
    /// stages must check readiness explicitly via [`StateView::get`].
    pub fn view(&self, reads: &BTreeSet<String>) -> StateView {
        let values = reads
            .iter()
            .filter_map(|key| self.values.get(key).map(|v| (key.clone(), v.clone())))
            .collect();
        StateView { values }
    }

    /// Atomically merge a stage's partial update
    ///
    /// Fails without modifying the state if any key is outside the author's
    /// declared `writes`, or overwrites an existing key the author neither
    /// reads nor previously wrote. On success bumps `version` once and
    /// records the author against each written key.
    pub fn apply(&mut self, update: StateUpdate, author: &StageSpec) -> Result<()> {
        // Validate the whole update before touching anything.
        for key in update.keys() {
            if !author.writes.contains(key) {
                return Err(Error::UnauthorizedWrite {
                    stage: author.name.clone(),
                    key: key.clone(),
                });
            }
            if self.values.contains_key(key)
                && !author.reads.contains(key)
                && self.history.get(key) != Some(&author.name)
            {
                return Err(Error::IllegalOverwrite {
                    stage: author.name.clone(),
                    key: key.clone(),
                });
            }
        }

        for (key, value) in update {
            self.history.insert(key.clone(), author.name.clone());
            self.values.insert(key, value);
        }
        self.version += 1;
        Ok(())
    }
}

/// Read-only snapshot of shared state restricted to one stage's reads
///
/// Views are owned copies taken when the stage is launched, so a running
/// stage never observes concurrent mutation.
#[derive(Debug, Clone, Default)]
pub struct StateView {
    values: BTreeMap<String, serde_json::Value>,
}

impl StateView {
    /// Get a value, or `None` if the key was never produced (e.g. an
    /// upstream optional stage failed)
    pub fn get(&self, key: &str) -> Option<&serde_json::Value> {
        self.values.get(key)
    }

    /// Check whether a key is present in the view
    pub fn contains_key(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    /// Iterate over all present entries
    pub fn iter(&self) -> impl Iterator<Item = (&str, &serde_json::Value)> {
        self.values.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Number of present entries
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Whether the view holds no entries
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}
