//! Durable resume state: the per-batch checkpoint and the run-level progress
//! record.
//!
//! Both are small, versioned JSON files written atomically (temp file +
//! rename), so a crash mid-write can never leave a truncated record behind.
//! Persistence is best-effort, not transactional: a crash loses at most one
//! flush interval's worth of checkpoint updates.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use tempfile::NamedTempFile;

use crate::prelude::*;

/// Format version for [`Checkpoint`] files.
pub const CHECKPOINT_VERSION: u32 = 1;

/// Which images have already been attempted, per batch.
///
/// "Attempted" covers successes and permanent failures alike: the point of
/// this set is to avoid re-sending images to the API, not to track successes.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct Checkpoint {
    /// Format version, for future migrations.
    pub version: u32,

    /// Batch name → filenames already attempted in that batch.
    pub batches: BTreeMap<String, BTreeSet<String>>,
}

impl Default for Checkpoint {
    fn default() -> Self {
        Self {
            version: CHECKPOINT_VERSION,
            batches: BTreeMap::new(),
        }
    }
}

impl Checkpoint {
    /// The set of filenames already attempted in `batch`.
    pub fn attempted(&self, batch: &str) -> Option<&BTreeSet<String>> {
        self.batches.get(batch)
    }

    /// Record that `filename` in `batch` has been attempted.
    pub fn mark_attempted(&mut self, batch: &str, filename: &str) {
        self.batches
            .entry(batch.to_owned())
            .or_default()
            .insert(filename.to_owned());
    }
}

/// Which batches have been fully processed, and when we last updated.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct ProgressRecord {
    /// Batch names whose entire image set has been attempted and whose CSV
    /// export has been written, in completion order.
    pub completed_batches: Vec<String>,

    /// When this record was last updated.
    pub last_updated: Option<DateTime<Utc>>,
}

impl ProgressRecord {
    /// Has this batch already been fully processed?
    pub fn is_complete(&self, batch: &str) -> bool {
        self.completed_batches.iter().any(|name| name == batch)
    }

    /// Record a batch as fully processed. Call this only after the batch's
    /// CSV export is durably on disk.
    pub fn mark_complete(&mut self, batch: &str) {
        if !self.is_complete(batch) {
            self.completed_batches.push(batch.to_owned());
        }
        self.last_updated = Some(Utc::now());
    }
}

/// A JSON file holding either resume record.
pub struct StateFile<T> {
    path: PathBuf,
    _marker: std::marker::PhantomData<T>,
}

impl<T> StateFile<T>
where
    T: Serialize + DeserializeOwned + Default,
{
    /// Create a handle to the state file at `path`.
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            _marker: std::marker::PhantomData,
        }
    }

    /// Where this state lives.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the state, or the default value if the file doesn't exist yet.
    /// A file that exists but can't be parsed is an error: silently starting
    /// over would re-bill every card in the corpus.
    pub fn load(&self) -> Result<T> {
        match std::fs::read_to_string(&self.path) {
            Ok(text) => serde_json::from_str(&text)
                .with_context(|| format!("failed to parse {}", self.path.display())),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(T::default()),
            Err(err) => Err(err)
                .with_context(|| format!("failed to read {}", self.path.display())),
        }
    }

    /// Persist the state atomically.
    pub fn save(&self, state: &T) -> Result<()> {
        let parent = self.path.parent().unwrap_or_else(|| Path::new("."));
        let file = NamedTempFile::new_in(parent)
            .context("failed to create temporary state file")?;
        serde_json::to_writer_pretty(&file, state)
            .with_context(|| format!("failed to serialize {}", self.path.display()))?;
        file.persist(&self.path)
            .with_context(|| format!("failed to replace {}", self.path.display()))?;
        Ok(())
    }

    /// Delete the state file, if present. Used once a run fully completes and
    /// resumability state is no longer needed.
    pub fn delete(&self) -> Result<()> {
        match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err)
                .with_context(|| format!("failed to delete {}", self.path.display())),
        }
    }
}

/// Load a checkpoint, verifying the format version.
pub fn load_checkpoint(store: &StateFile<Checkpoint>) -> Result<Checkpoint> {
    let checkpoint = store.load()?;
    if checkpoint.version != CHECKPOINT_VERSION {
        return Err(anyhow!(
            "checkpoint {} has unsupported version {} (expected {}); \
             delete it to start over",
            store.path().display(),
            checkpoint.version,
            CHECKPOINT_VERSION
        ));
    }
    Ok(checkpoint)
}
