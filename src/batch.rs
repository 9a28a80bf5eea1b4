//! The batch runner: every not-yet-attempted image in one directory.
//!
//! Cards are dispatched across a bounded number of concurrent workers and
//! consumed in completion order, so everything aggregated here (counts,
//! checkpoint set) is order-independent. The checkpoint is flushed
//! periodically, so a crash loses at most one flush interval's worth of
//! attempts.

use std::time::Duration;

use futures::{StreamExt as _, future, stream};
use tokio::time::Instant;

use crate::{
    cancel::CancelFlag,
    checkpoint::{Checkpoint, StateFile, load_checkpoint},
    prelude::*,
    table,
    ui::{ProgressConfig, Ui},
    worker::{CardOutcome, CardResult, WorkerContext, process_card},
};

/// Flush the checkpoint at least this often while a batch is running.
const FLUSH_INTERVAL: Duration = Duration::from_secs(5);

/// ... or after this many completions, whichever comes first.
const FLUSH_EVERY: usize = 50;

/// Aggregate statistics for one batch run.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BatchStats {
    /// The batch name.
    pub batch: String,

    /// Total images in the batch directory, attempted or not.
    pub total_images: usize,

    /// Cards attempted in this run.
    pub attempted: usize,

    /// Cards extracted successfully.
    pub succeeded: usize,

    /// Cards that failed terminally.
    pub failed: usize,

    /// Successful cards with a composer.
    pub with_komponist: usize,

    /// Successful cards with a signature.
    pub with_signatur: usize,

    /// Successful cards whose signature matches a known format.
    pub valid_signatur: usize,
}

impl BatchStats {
    /// Fold one card outcome into the stats. Commutative, since outcomes
    /// arrive in completion order.
    pub fn observe(&mut self, outcome: &CardOutcome) {
        self.attempted += 1;
        match &outcome.result {
            CardResult::Extracted {
                has_komponist,
                has_signatur,
                valid_signatur,
                ..
            } => {
                self.succeeded += 1;
                self.with_komponist += usize::from(*has_komponist);
                self.with_signatur += usize::from(*has_signatur);
                self.valid_signatur += usize::from(*valid_signatur);
            }
            CardResult::Failed { .. } => self.failed += 1,
        }
    }
}

/// What happened to a batch.
#[derive(Debug)]
pub enum BatchOutcome {
    /// Every image was already in the checkpoint; nothing to do and no
    /// output rewritten.
    AlreadyComplete { processed: usize },

    /// The directory contains no images.
    NoImages,

    /// All remaining images were attempted and outputs written.
    Finished(BatchStats),

    /// Cancellation stopped dispatch before the batch drained. Checkpoint
    /// state is saved; the batch must not be marked complete.
    Interrupted(BatchStats),
}

/// Shared context for running batches.
pub struct BatchContext {
    /// Per-card worker context.
    pub worker: WorkerContext,

    /// The durable checkpoint file.
    pub checkpoint_store: StateFile<Checkpoint>,

    /// Where per-batch CSVs go.
    pub csv_dir: PathBuf,

    /// Maximum concurrent cards in flight.
    pub jobs: usize,

    /// Cooperative cancellation flag.
    pub cancel: CancelFlag,

    /// Progress reporting.
    pub ui: Ui,
}

/// Process one batch directory.
#[instrument(level = "debug", skip_all, fields(batch = %batch_dir.display()))]
pub async fn run_batch(
    ctx: &BatchContext,
    batch_dir: &Path,
    position: usize,
    total_batches: usize,
) -> Result<BatchOutcome> {
    let batch_name = batch_dir
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .ok_or_else(|| anyhow!("batch directory has no name: {}", batch_dir.display()))?;

    let mut checkpoint = load_checkpoint(&ctx.checkpoint_store)?;
    let all_images = list_batch_images(batch_dir)?;
    if all_images.is_empty() {
        ctx.ui
            .display_message("⚠️", &format!("{batch_name}: no images found"));
        return Ok(BatchOutcome::NoImages);
    }

    let attempted_before = checkpoint.attempted(&batch_name).cloned().unwrap_or_default();
    let remaining: Vec<PathBuf> = all_images
        .iter()
        .filter(|path| {
            path.file_name()
                .map(|name| !attempted_before.contains(&*name.to_string_lossy()))
                .unwrap_or(false)
        })
        .cloned()
        .collect();
    let already_done = all_images.len() - remaining.len();

    if remaining.is_empty() {
        ctx.ui.display_message(
            "✅",
            &format!("{batch_name}: already complete ({already_done} cards)"),
        );
        return Ok(BatchOutcome::AlreadyComplete {
            processed: already_done,
        });
    }

    ctx.ui.display_message(
        "📦",
        &format!(
            "Batch {position}/{total_batches}: {batch_name} — {} new, {} already done",
            remaining.len(),
            already_done
        ),
    );
    let pb = ctx.ui.new_progress_bar(
        &ProgressConfig {
            emoji: "📇",
            msg: &batch_name,
            done_msg: &format!("{batch_name} done"),
        },
        remaining.len() as u64,
    );

    let remaining_count = remaining.len();
    let worker_ctx = ctx.worker.clone();
    let batch = batch_name.clone();
    let cancel = ctx.cancel.clone();
    let mut outcomes = stream::iter(remaining)
        .take_while(move |_| future::ready(!cancel.is_cancelled()))
        .map(move |image| {
            let worker_ctx = worker_ctx.clone();
            let batch = batch.clone();
            async move { process_card(&worker_ctx, &image, &batch).await }
        })
        .buffer_unordered(ctx.jobs);

    let mut stats = BatchStats {
        batch: batch_name.clone(),
        total_images: all_images.len(),
        ..BatchStats::default()
    };
    let mut records = Vec::new();
    let mut last_flush = Instant::now();
    let mut since_flush = 0usize;

    while let Some(outcome) = outcomes.next().await {
        checkpoint.mark_attempted(&batch_name, &outcome.filename);
        stats.observe(&outcome);
        since_flush += 1;
        if let CardResult::Extracted { record, .. } = outcome.result {
            records.push(record);
        }

        pb.set_message(format!(
            "{batch_name} ✓{} ✗{}",
            stats.succeeded, stats.failed
        ));
        pb.inc(1);

        if since_flush >= FLUSH_EVERY || last_flush.elapsed() >= FLUSH_INTERVAL {
            ctx.checkpoint_store.save(&checkpoint)?;
            since_flush = 0;
            last_flush = Instant::now();
        }
    }
    drop(outcomes);

    // The CSV export must be on disk before the final checkpoint state, and
    // both before the caller marks the batch complete.
    if !records.is_empty() {
        let csv_path = ctx.csv_dir.join(format!("{batch_name}.csv"));
        table::update_batch_csv(&csv_path, &records)?;
        debug!(rows = records.len(), "wrote batch CSV");
    }
    ctx.checkpoint_store.save(&checkpoint)?;

    if ctx.cancel.is_cancelled() && stats.attempted < remaining_count {
        pb.finish_and_clear();
        Ok(BatchOutcome::Interrupted(stats))
    } else {
        Ok(BatchOutcome::Finished(stats))
    }
}

/// List a batch directory's images, sorted by filename.
pub fn list_batch_images(batch_dir: &Path) -> Result<Vec<PathBuf>> {
    let mut images = Vec::new();
    let entries = std::fs::read_dir(batch_dir)
        .with_context(|| format!("failed to list {}", batch_dir.display()))?;
    for entry in entries {
        let path = entry.context("failed to read directory entry")?.path();
        let is_image = path
            .extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| {
                let ext = ext.to_ascii_lowercase();
                ext == "jpg" || ext == "jpeg" || ext == "png"
            })
            .unwrap_or(false);
        if path.is_file() && is_image {
            images.push(path);
        }
    }
    images.sort();
    Ok(images)
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, time::Duration};

    use super::*;
    use crate::{
        client::{
            RetryPolicy,
            testing::{FailingBackend, StaticBackend},
        },
        error_log::ErrorLog,
        schema::FieldMap,
        worker::CardOutcome,
    };

    fn test_fields() -> FieldMap {
        let mut fields = FieldMap::new();
        fields.insert("Komponist".to_owned(), "Lincke, Paul".to_owned());
        fields.insert("Signatur".to_owned(), "TOB 1728".to_owned());
        fields
    }

    fn test_context(
        backend: Arc<dyn crate::client::ExtractBackend>,
        out: &Path,
    ) -> BatchContext {
        BatchContext {
            worker: WorkerContext {
                backend,
                retry: RetryPolicy {
                    max_attempts: 2,
                    base_delay: Duration::from_millis(0),
                },
                json_dir: out.join("json"),
                error_log: Arc::new(ErrorLog::new(out.join("errors.log"))),
            },
            checkpoint_store: StateFile::new(out.join("checkpoint.json")),
            csv_dir: out.join("csv"),
            jobs: 3,
            cancel: CancelFlag::new(),
            ui: Ui::init_for_tests(),
        }
    }

    fn make_batch(dir: &Path, name: &str, files: &[&str]) -> PathBuf {
        let batch_dir = dir.join(name);
        std::fs::create_dir_all(&batch_dir).unwrap();
        for file in files {
            std::fs::write(batch_dir.join(file), b"jpeg").unwrap();
        }
        batch_dir
    }

    #[tokio::test]
    async fn resumes_from_checkpoint_and_skips_attempted_images() {
        let dir = tempfile::tempdir().unwrap();
        let batch_dir = make_batch(dir.path(), "Batch_01", &["a.jpg", "b.jpg"]);
        let backend = StaticBackend::new(test_fields());
        let ctx = test_context(backend.clone(), dir.path());
        std::fs::create_dir_all(&ctx.csv_dir).unwrap();

        let mut checkpoint = Checkpoint::default();
        checkpoint.mark_attempted("Batch_01", "a.jpg");
        ctx.checkpoint_store.save(&checkpoint).unwrap();

        let outcome = run_batch(&ctx, &batch_dir, 1, 1).await.unwrap();
        match outcome {
            BatchOutcome::Finished(stats) => {
                assert_eq!(stats.attempted, 1);
                assert_eq!(stats.succeeded, 1);
                assert_eq!(stats.total_images, 2);
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
        // Only the unattempted image hit the backend.
        assert_eq!(backend.seen_filenames(), vec!["b.jpg"]);

        let reloaded = load_checkpoint(&ctx.checkpoint_store).unwrap();
        let attempted = reloaded.attempted("Batch_01").unwrap();
        assert!(attempted.contains("a.jpg") && attempted.contains("b.jpg"));
    }

    #[tokio::test]
    async fn fully_checkpointed_batch_makes_no_calls_and_writes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let batch_dir = make_batch(dir.path(), "Batch_01", &["a.jpg", "b.jpg"]);
        let backend = StaticBackend::new(test_fields());
        let ctx = test_context(backend.clone(), dir.path());
        std::fs::create_dir_all(&ctx.csv_dir).unwrap();

        let mut checkpoint = Checkpoint::default();
        checkpoint.mark_attempted("Batch_01", "a.jpg");
        checkpoint.mark_attempted("Batch_01", "b.jpg");
        ctx.checkpoint_store.save(&checkpoint).unwrap();

        let outcome = run_batch(&ctx, &batch_dir, 1, 1).await.unwrap();
        assert!(matches!(
            outcome,
            BatchOutcome::AlreadyComplete { processed: 2 }
        ));
        assert!(backend.seen_filenames().is_empty());
        assert!(!ctx.csv_dir.join("Batch_01.csv").exists());
    }

    #[tokio::test]
    async fn failed_cards_are_checkpointed_but_kept_out_of_the_csv() {
        let dir = tempfile::tempdir().unwrap();
        let batch_dir = make_batch(dir.path(), "Batch_01", &["a.jpg"]);
        let ctx = test_context(FailingBackend::transient(), dir.path());
        std::fs::create_dir_all(&ctx.csv_dir).unwrap();

        let outcome = run_batch(&ctx, &batch_dir, 1, 1).await.unwrap();
        match outcome {
            BatchOutcome::Finished(stats) => {
                assert_eq!(stats.failed, 1);
                assert_eq!(stats.succeeded, 0);
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
        // Attempted even though it failed: we never re-bill this card.
        let checkpoint = load_checkpoint(&ctx.checkpoint_store).unwrap();
        assert!(checkpoint.attempted("Batch_01").unwrap().contains("a.jpg"));
        assert!(!ctx.csv_dir.join("Batch_01.csv").exists());
    }

    #[tokio::test]
    async fn cancellation_before_dispatch_interrupts_the_batch() {
        let dir = tempfile::tempdir().unwrap();
        let batch_dir = make_batch(dir.path(), "Batch_01", &["a.jpg", "b.jpg"]);
        let ctx = test_context(StaticBackend::new(test_fields()), dir.path());
        std::fs::create_dir_all(&ctx.csv_dir).unwrap();

        ctx.cancel.cancel();
        let outcome = run_batch(&ctx, &batch_dir, 1, 1).await.unwrap();
        match outcome {
            BatchOutcome::Interrupted(stats) => assert_eq!(stats.attempted, 0),
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[test]
    fn stats_are_order_independent() {
        let ok = CardOutcome {
            filename: "a.jpg".to_owned(),
            batch: "B".to_owned(),
            duration: Duration::from_secs(1),
            result: CardResult::Extracted {
                record: crate::schema::CardRecord::new(
                    "a.jpg".to_owned(),
                    "B".to_owned(),
                    test_fields(),
                ),
                has_komponist: true,
                has_signatur: true,
                valid_signatur: true,
            },
        };
        let failed = CardOutcome {
            filename: "b.jpg".to_owned(),
            batch: "B".to_owned(),
            duration: Duration::from_secs(1),
            result: CardResult::Failed {
                error: "boom".to_owned(),
            },
        };

        let mut forward = BatchStats::default();
        forward.observe(&ok);
        forward.observe(&failed);
        let mut backward = BatchStats::default();
        backward.observe(&failed);
        backward.observe(&ok);
        assert_eq!(forward, backward);
        assert_eq!(forward.succeeded, 1);
        assert_eq!(forward.failed, 1);
        assert_eq!(forward.with_komponist, 1);
    }

    #[test]
    fn lists_only_images_sorted_by_name() {
        let dir = tempfile::tempdir().unwrap();
        let batch_dir = make_batch(
            dir.path(),
            "Batch_01",
            &["b.JPG", "a.jpg", "c.png", "notes.txt"],
        );
        let images: Vec<String> = list_batch_images(&batch_dir)
            .unwrap()
            .into_iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(images, vec!["a.jpg", "b.JPG", "c.png"]);
    }
}
