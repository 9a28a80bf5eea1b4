//! The `review` subcommand: batch quality statistics and corrections.

use clap::{Args, Subcommand};

use crate::{cmd::OutputOpts, prelude::*, review, ui::Ui};

/// Options for the `review` subcommand.
#[derive(Debug, Args)]
pub struct ReviewOpts {
    #[clap(subcommand)]
    action: ReviewAction,
}

#[derive(Debug, Subcommand)]
enum ReviewAction {
    /// List the batches that have an export.
    Batches {
        #[clap(flatten)]
        output: OutputOpts,
    },

    /// Show quality statistics for one batch.
    Stats {
        /// Batch name, e.g. "Batch_01".
        batch: String,

        #[clap(flatten)]
        output: OutputOpts,
    },

    /// Apply field-level corrections from a JSONL file.
    Apply {
        /// Corrections file: one JSON object per line with "batch",
        /// "filename", "field" and "value".
        corrections: PathBuf,

        #[clap(flatten)]
        output: OutputOpts,
    },
}

/// The `review` subcommand.
#[instrument(level = "debug", skip_all)]
pub async fn cmd_review(ui: Ui, opts: &ReviewOpts) -> Result<()> {
    match &opts.action {
        ReviewAction::Batches { output } => {
            let layout = output.layout();
            for batch in review::list_batches(&layout.csv_dir)? {
                println!("{batch}");
            }
        }
        ReviewAction::Stats { batch, output } => {
            let layout = output.layout();
            let quality = review::batch_quality(&layout.csv_dir, batch)?;
            println!("{}: {} cards", quality.batch, quality.total);
            for (field, count) in &quality.field_presence {
                println!("  {field}: {count}");
            }
            println!("  complete (≥6 fields): {}", quality.complete);
            println!("  sparse (≤2 fields): {}", quality.sparse);
        }
        ReviewAction::Apply {
            corrections,
            output,
        } => {
            let layout = output.layout();
            let corrections = review::read_corrections(corrections)?;
            let report = review::apply_corrections(&layout, &corrections)?;
            ui.display_message(
                "✏️",
                &format!(
                    "{} corrections applied, {} skipped",
                    report.applied, report.skipped
                ),
            );
        }
    }
    Ok(())
}
