//! Durable checkpoint storage
//!
//! Snapshots are JSON files named `<run_id>_v<version>_c<sequence>.json`
//! inside the store directory, with a `LATEST` pointer file naming the most recent
//! complete snapshot. Saves are write-then-rename: the pointer is only
//! moved after the snapshot file is fully on disk, so a reader can never
//! observe a partially written snapshot.

use crate::checkpoint::Checkpoint;
use marketflow_core::{Error, Result};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Name of the pointer file holding the latest snapshot id
const LATEST_POINTER: &str = "LATEST";

/// File-backed checkpoint store
pub struct CheckpointStore {
    dir: PathBuf,
    retain: usize,
}

impl CheckpointStore {
    /// Open (creating if needed) a store rooted at `dir`
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir, retain: 10 })
    }

    /// Keep at most `n` snapshots; the current latest is never deleted
    pub fn with_retention(mut self, n: usize) -> Self {
        self.retain = n.max(1);
        self
    }

    /// Directory backing this store
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Persist a snapshot and atomically move the latest pointer to it
    ///
    /// Returns the snapshot id usable with [`CheckpointStore::load`].
    pub fn save(&self, checkpoint: &Checkpoint) -> Result<String> {
        let id = checkpoint.id();
        let bytes = serde_json::to_vec_pretty(checkpoint)?;

        let final_path = self.snapshot_path(&id);
        let tmp_path = self.dir.join(format!(".{id}.json.tmp"));
        fs::write(&tmp_path, &bytes)?;
        fs::rename(&tmp_path, &final_path)?;

        // The pointer moves only once the snapshot is durable.
        let pointer_tmp = self.dir.join(".LATEST.tmp");
        fs::write(&pointer_tmp, id.as_bytes())?;
        fs::rename(&pointer_tmp, self.dir.join(LATEST_POINTER))?;

        debug!(checkpoint = %id, "checkpoint saved");
        self.apply_retention(&id)?;
        Ok(id)
    }

    /// Load a snapshot by id
    ///
    /// Fails with `ResumeTargetNotFound` if no such snapshot exists, or
    /// `CorruptCheckpoint` if it fails the integrity check.
    pub fn load(&self, id: &str) -> Result<Checkpoint> {
        let path = self.snapshot_path(id);
        if !path.exists() {
            return Err(Error::ResumeTargetNotFound(id.to_string()));
        }
        self.read_snapshot(&path, id)
    }

    /// Load the most recent complete snapshot, or `None` if the store is
    /// empty
    ///
    /// A corrupt latest snapshot is skipped with a warning and the
    /// next-most-recent valid snapshot is returned instead.
    pub fn load_latest(&self) -> Result<Option<Checkpoint>> {
        let pointer = self.dir.join(LATEST_POINTER);
        let mut tried: Option<String> = None;

        if pointer.exists() {
            let id = fs::read_to_string(&pointer)?.trim().to_string();
            match self.load(&id) {
                Ok(cp) => return Ok(Some(cp)),
                Err(err) => {
                    warn!(checkpoint = %id, %err, "latest checkpoint unusable, scanning for fallback");
                    tried = Some(id);
                }
            }
        }

        // Fallback: newest-first scan over everything on disk.
        for (id, path) in self.snapshots_newest_first()? {
            if tried.as_deref() == Some(id.as_str()) {
                continue;
            }
            match self.read_snapshot(&path, &id) {
                Ok(cp) => return Ok(Some(cp)),
                Err(err) => warn!(checkpoint = %id, %err, "skipping unusable checkpoint"),
            }
        }
        Ok(None)
    }

    fn snapshot_path(&self, id: &str) -> PathBuf {
        self.dir.join(format!("{id}.json"))
    }

    fn read_snapshot(&self, path: &Path, id: &str) -> Result<Checkpoint> {
        let bytes = fs::read(path)?;
        let checkpoint: Checkpoint =
            serde_json::from_slice(&bytes).map_err(|e| Error::CorruptCheckpoint {
                id: id.to_string(),
                reason: e.to_string(),
            })?;
        checkpoint.validate()?;
        Ok(checkpoint)
    }

    /// Snapshot ids and paths, most recently modified first
    fn snapshots_newest_first(&self) -> Result<Vec<(String, PathBuf)>> {
        let mut entries = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            if stem.starts_with('.') {
                continue;
            }
            let modified = entry.metadata()?.modified()?;
            entries.push((modified, stem.to_string(), path));
        }
        entries.sort_by(|a, b| b.0.cmp(&a.0).then_with(|| b.1.cmp(&a.1)));
        Ok(entries.into_iter().map(|(_, id, path)| (id, path)).collect())
    }

    /// Delete snapshots beyond the retention limit, never the latest
    fn apply_retention(&self, latest_id: &str) -> Result<()> {
        let snapshots = self.snapshots_newest_first()?;
        for (id, path) in snapshots.into_iter().skip(self.retain) {
            if id == latest_id {
                continue;
            }
            debug!(checkpoint = %id, "pruning old checkpoint");
            fs::remove_file(path)?;
        }
        Ok(())
    }
}
