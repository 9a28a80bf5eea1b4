//! The card worker: one image end to end.
//!
//! A worker extracts one card, writes the per-card JSON file, and shapes the
//! result for the batch runner. Failures are logged and folded into the
//! returned [`CardOutcome`]; nothing escapes this boundary, so one bad card
//! can never abort its batch.

use std::{sync::Arc, time::Duration};

use tokio::time::Instant;

use crate::{
    client::{ExtractBackend, RetryPolicy, extract_with_retries},
    error_log::ErrorLog,
    prelude::*,
    schema::{CardRecord, is_valid_signature},
};

/// The result of processing one card.
#[derive(Clone, Debug)]
pub struct CardOutcome {
    /// The source image filename.
    pub filename: String,

    /// The batch the card belongs to.
    pub batch: String,

    /// How long processing took, including retries.
    pub duration: Duration,

    /// What happened.
    pub result: CardResult,
}

/// Success or terminal failure for one card.
#[derive(Clone, Debug)]
pub enum CardResult {
    /// Extraction succeeded and the per-card JSON was written.
    Extracted {
        record: CardRecord,
        /// Is the composer field filled in?
        has_komponist: bool,
        /// Is the signature field filled in?
        has_signatur: bool,
        /// Does the signature match a known archive format?
        valid_signatur: bool,
    },

    /// Extraction failed after exhausting retries (or fatally).
    Failed { error: String },
}

impl CardOutcome {
    /// Did this card succeed?
    pub fn succeeded(&self) -> bool {
        matches!(self.result, CardResult::Extracted { .. })
    }
}

/// Everything a worker needs besides the image itself.
#[derive(Clone)]
pub struct WorkerContext {
    /// The extraction backend.
    pub backend: Arc<dyn ExtractBackend>,

    /// Retry policy for the extraction call.
    pub retry: RetryPolicy,

    /// Root of the per-card JSON output tree.
    pub json_dir: PathBuf,

    /// The shared error log.
    pub error_log: Arc<ErrorLog>,
}

/// Process a single card. Infallible by design: any error is logged and
/// returned as a failed [`CardOutcome`].
pub async fn process_card(ctx: &WorkerContext, image: &Path, batch: &str) -> CardOutcome {
    let started = Instant::now();
    let filename = image
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();

    let result = match process_card_inner(ctx, image, batch, &filename).await {
        Ok(result) => result,
        Err(err) => {
            let error = format!("{err:#}");
            if let Err(log_err) = ctx.error_log.append(batch, &filename, &error, None).await
            {
                warn!("failed to write error log entry: {log_err:#}");
            }
            CardResult::Failed { error }
        }
    };

    CardOutcome {
        filename,
        batch: batch.to_owned(),
        duration: started.elapsed(),
        result,
    }
}

/// The fallible part of card processing.
async fn process_card_inner(
    ctx: &WorkerContext,
    image: &Path,
    batch: &str,
    filename: &str,
) -> Result<CardResult> {
    let fields = extract_with_retries(ctx.backend.as_ref(), image, &ctx.retry).await?;
    let record = CardRecord::new(filename.to_owned(), batch.to_owned(), fields);

    write_card_json(&ctx.json_dir, batch, image, &record).await?;

    let signatur = record.field("Signatur");
    Ok(CardResult::Extracted {
        has_komponist: !record.field("Komponist").is_empty(),
        has_signatur: !signatur.is_empty(),
        valid_signatur: is_valid_signature(signatur),
        record,
    })
}

/// Write the per-card JSON file atomically (write to a sibling temp file,
/// then rename), named after the image's stem.
async fn write_card_json(
    json_dir: &Path,
    batch: &str,
    image: &Path,
    record: &CardRecord,
) -> Result<()> {
    let batch_dir = json_dir.join(batch);
    tokio::fs::create_dir_all(&batch_dir)
        .await
        .with_context(|| format!("failed to create {}", batch_dir.display()))?;

    let stem = image
        .file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_else(|| "card".to_owned());
    let path = batch_dir.join(format!("{stem}.json"));
    let tmp_path = batch_dir.join(format!("{stem}.json.tmp"));

    let json = serde_json::to_string_pretty(record).context("failed to serialize record")?;
    tokio::fs::write(&tmp_path, json.as_bytes())
        .await
        .with_context(|| format!("failed to write {}", tmp_path.display()))?;
    tokio::fs::rename(&tmp_path, &path)
        .await
        .with_context(|| format!("failed to move record into place at {}", path.display()))?;
    Ok(())
}
