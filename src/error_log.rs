//! The shared, append-only error log.
//!
//! Workers from the same batch append concurrently, so all writes go through
//! one async mutex to keep entries from interleaving.

use chrono::Local;
use tokio::{
    fs::{File, OpenOptions},
    io::AsyncWriteExt as _,
    sync::Mutex,
};

use crate::prelude::*;

/// Separator line between log entries.
const SEPARATOR: &str = "--------------------------------------------------------------------------------";

/// A durable, human-readable log of per-card and per-batch failures.
pub struct ErrorLog {
    /// Where the log lives on disk.
    path: PathBuf,

    /// The open log file, if we've written anything yet. The mutex serializes
    /// whole entries, not individual writes.
    file: Mutex<Option<File>>,
}

impl ErrorLog {
    /// Create a handle to the error log at `path`. The file is opened lazily
    /// on first append.
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            file: Mutex::new(None),
        }
    }

    /// Where this log lives.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one timestamped entry.
    pub async fn append(
        &self,
        batch: &str,
        filename: &str,
        message: &str,
        details: Option<&str>,
    ) -> Result<()> {
        let mut entry = format!(
            "[{}] Batch: {} | Datei: {}\n⚠️  {}\n",
            Local::now().to_rfc3339(),
            batch,
            filename,
            message
        );
        if let Some(details) = details {
            entry.push_str(&format!("Details: {details}\n"));
        }
        entry.push_str(SEPARATOR);
        entry.push('\n');

        let mut guard = self.file.lock().await;
        if guard.is_none() {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&self.path)
                .await
                .with_context(|| {
                    format!("failed to open error log {}", self.path.display())
                })?;
            *guard = Some(file);
        }
        if let Some(file) = guard.as_mut() {
            file.write_all(entry.as_bytes())
                .await
                .context("failed to append to error log")?;
            file.flush().await.context("failed to flush error log")?;
        }
        Ok(())
    }
}
