//! The run orchestrator: every batch under the input root, in order.
//!
//! Batches run strictly sequentially. Progress is persisted after every
//! batch, so an interrupted run resumes where it left off; once every batch
//! is recorded complete, the resume state is deleted.

use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use crate::{
    batch::{BatchContext, BatchOutcome, BatchStats, run_batch},
    cancel::CancelFlag,
    checkpoint::{Checkpoint, ProgressRecord, StateFile},
    client::{ExtractBackend, RetryPolicy},
    error_log::ErrorLog,
    prelude::*,
    table,
    ui::Ui,
    worker::WorkerContext,
};

/// Where everything a run produces lives, under one base directory.
#[derive(Clone, Debug)]
pub struct OutputLayout {
    /// Per-card JSON files, one subdirectory per batch.
    pub json_dir: PathBuf,

    /// Per-batch CSV exports.
    pub csv_dir: PathBuf,

    /// The consolidated table.
    pub final_csv: PathBuf,

    /// The append-only error log.
    pub error_log: PathBuf,

    /// The per-batch checkpoint file.
    pub checkpoint: PathBuf,

    /// The run-level progress record.
    pub progress: PathBuf,
}

impl OutputLayout {
    /// The standard layout under `base`.
    pub fn new(base: &Path) -> Self {
        Self {
            json_dir: base.join("json"),
            csv_dir: base.join("csv"),
            final_csv: base.join("metadata_vlm_complete.csv"),
            error_log: base.join("vlm_errors.log"),
            checkpoint: base.join("batch_checkpoint.json"),
            progress: base.join("batch_progress.json"),
        }
    }

    /// Create the output directories.
    pub fn ensure_dirs(&self) -> Result<()> {
        std::fs::create_dir_all(&self.json_dir)
            .with_context(|| format!("failed to create {}", self.json_dir.display()))?;
        std::fs::create_dir_all(&self.csv_dir)
            .with_context(|| format!("failed to create {}", self.csv_dir.display()))?;
        Ok(())
    }
}

/// Configuration for a full run.
#[derive(Clone, Debug)]
pub struct RunConfig {
    /// The directory containing the batch directories.
    pub input_dir: PathBuf,

    /// Batch directory name pattern (`*` wildcards). If nothing matches,
    /// every subdirectory is treated as a batch.
    pub batch_pattern: String,

    /// Maximum concurrent cards in flight within a batch.
    pub jobs: usize,

    /// Retry policy for extraction calls.
    pub retry: RetryPolicy,

    /// Output layout.
    pub layout: OutputLayout,
}

/// What a full run accomplished.
#[derive(Debug, Default)]
pub struct RunSummary {
    /// Batch directories discovered.
    pub batches_discovered: usize,

    /// Batches skipped because the progress record already listed them.
    pub batches_skipped: usize,

    /// Per-batch statistics for batches processed this run.
    pub stats: Vec<BatchStats>,

    /// Rows in the consolidated table, if the merge ran.
    pub merged_rows: Option<usize>,

    /// Was the run interrupted by the operator?
    pub interrupted: bool,

    /// Were checkpoint and progress files deleted after full completion?
    pub cleaned_up: bool,

    /// Wall-clock time for the whole run.
    pub elapsed: Duration,
}

impl RunSummary {
    /// Total cards attempted this run.
    pub fn attempted(&self) -> usize {
        self.stats.iter().map(|s| s.attempted).sum()
    }

    /// Total cards extracted successfully this run.
    pub fn succeeded(&self) -> usize {
        self.stats.iter().map(|s| s.succeeded).sum()
    }

    /// Total terminal failures this run.
    pub fn failed(&self) -> usize {
        self.stats.iter().map(|s| s.failed).sum()
    }
}

/// Process every batch under the input root.
#[instrument(level = "debug", skip_all)]
pub async fn run_all(
    ui: &Ui,
    config: &RunConfig,
    backend: Arc<dyn ExtractBackend>,
    cancel: CancelFlag,
) -> Result<RunSummary> {
    let started = Instant::now();
    config.layout.ensure_dirs()?;

    let batch_dirs = discover_batch_dirs(&config.input_dir, &config.batch_pattern)?;
    if batch_dirs.is_empty() {
        return Err(anyhow!(
            "no batch directories found in {} (pattern {:?})",
            config.input_dir.display(),
            config.batch_pattern
        ));
    }
    let total_batches = batch_dirs.len();
    ui.display_message("📦", &format!("{total_batches} batch directories found"));

    let progress_store = StateFile::<ProgressRecord>::new(config.layout.progress.clone());
    let mut progress = progress_store.load()?;
    let error_log = Arc::new(ErrorLog::new(config.layout.error_log.clone()));
    let batch_ctx = BatchContext {
        worker: WorkerContext {
            backend,
            retry: config.retry,
            json_dir: config.layout.json_dir.clone(),
            error_log: error_log.clone(),
        },
        checkpoint_store: StateFile::<Checkpoint>::new(config.layout.checkpoint.clone()),
        csv_dir: config.layout.csv_dir.clone(),
        jobs: config.jobs,
        cancel: cancel.clone(),
        ui: ui.clone(),
    };

    let mut summary = RunSummary {
        batches_discovered: total_batches,
        ..RunSummary::default()
    };

    for (idx, batch_dir) in batch_dirs.iter().enumerate() {
        if cancel.is_cancelled() {
            summary.interrupted = true;
            break;
        }
        let batch_name = batch_dir
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();
        if progress.is_complete(&batch_name) {
            summary.batches_skipped += 1;
            ui.display_message(
                "✅",
                &format!(
                    "Batch {}/{}: {} (already complete)",
                    idx + 1,
                    total_batches,
                    batch_name
                ),
            );
            continue;
        }

        match run_batch(&batch_ctx, batch_dir, idx + 1, total_batches).await {
            // An unexpected per-batch failure skips the batch for this run;
            // later batches continue.
            Err(err) => {
                error!("batch {batch_name} failed: {err:#}");
                if let Err(log_err) = error_log
                    .append(&batch_name, "BATCH", &format!("batch failed: {err:#}"), None)
                    .await
                {
                    warn!("failed to write error log entry: {log_err:#}");
                }
            }
            Ok(BatchOutcome::NoImages) => {}
            Ok(BatchOutcome::AlreadyComplete { .. }) => {
                progress.mark_complete(&batch_name);
                progress_store.save(&progress)?;
            }
            Ok(BatchOutcome::Finished(stats)) => {
                ui.display_message(
                    "✅",
                    &format!(
                        "{batch_name}: {}/{} ok, {} errors, {} composers, {} signatures",
                        stats.succeeded,
                        stats.attempted,
                        stats.failed,
                        stats.with_komponist,
                        stats.with_signatur,
                    ),
                );
                summary.stats.push(stats);
                progress.mark_complete(&batch_name);
                progress_store.save(&progress)?;
            }
            Ok(BatchOutcome::Interrupted(stats)) => {
                summary.stats.push(stats);
                summary.interrupted = true;
                break;
            }
        }
    }

    summary.interrupted = summary.interrupted || cancel.is_cancelled();
    summary.elapsed = started.elapsed();
    if summary.interrupted {
        ui.display_message("⏸", "interrupted — progress saved, rerun to resume");
        return Ok(summary);
    }

    // Rebuild the consolidated table from the per-batch exports.
    let rows = table::merge_batch_csvs(&config.layout.csv_dir, &config.layout.final_csv)?;
    ui.display_message(
        "💾",
        &format!(
            "consolidated table written: {} ({rows} rows)",
            config.layout.final_csv.display()
        ),
    );
    summary.merged_rows = Some(rows);

    // Once every known batch is complete, resume state is no longer needed.
    let all_complete = batch_dirs.iter().all(|dir| {
        dir.file_name()
            .map(|name| progress.is_complete(&name.to_string_lossy()))
            .unwrap_or(false)
    });
    if all_complete {
        batch_ctx.checkpoint_store.delete()?;
        progress_store.delete()?;
        summary.cleaned_up = true;
        ui.display_message("🎉", "all batches complete, resume state cleared");
    }

    summary.elapsed = started.elapsed();
    Ok(summary)
}

/// Find batch directories under `root`: subdirectories matching `pattern`,
/// or every subdirectory if the pattern matches none. Sorted by name.
pub fn discover_batch_dirs(root: &Path, pattern: &str) -> Result<Vec<PathBuf>> {
    let subdirs = {
        let mut subdirs = Vec::new();
        let entries = std::fs::read_dir(root)
            .with_context(|| format!("failed to list {}", root.display()))?;
        for entry in entries {
            let path = entry.context("failed to read directory entry")?.path();
            if path.is_dir() {
                subdirs.push(path);
            }
        }
        subdirs
    };

    let mut batch_dirs: Vec<PathBuf> = subdirs
        .iter()
        .filter(|path| {
            path.file_name()
                .map(|name| matches_pattern(&name.to_string_lossy(), pattern))
                .unwrap_or(false)
        })
        .cloned()
        .collect();
    if batch_dirs.is_empty() {
        batch_dirs = subdirs;
    }
    batch_dirs.sort();
    Ok(batch_dirs)
}

/// Simple wildcard matching: `*` alone matches everything, a single embedded
/// `*` splits the pattern into a required prefix and suffix, and a pattern
/// without `*` must match exactly.
fn matches_pattern(name: &str, pattern: &str) -> bool {
    match pattern.split_once('*') {
        None => name == pattern,
        Some((prefix, suffix)) => {
            name.len() >= prefix.len() + suffix.len()
                && name.starts_with(prefix)
                && name.ends_with(suffix)
        }
    }
}
