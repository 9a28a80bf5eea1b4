//! The `merge` subcommand: rebuild the consolidated table offline.

use clap::Args;

use crate::{cmd::OutputOpts, prelude::*, table, ui::Ui};

/// Options for the `merge` subcommand.
#[derive(Debug, Args)]
pub struct MergeOpts {
    #[clap(flatten)]
    output: OutputOpts,
}

/// The `merge` subcommand.
#[instrument(level = "debug", skip_all)]
pub async fn cmd_merge(ui: Ui, opts: &MergeOpts) -> Result<()> {
    let layout = opts.output.layout();
    let rows = table::merge_batch_csvs(&layout.csv_dir, &layout.final_csv)?;
    ui.display_message(
        "💾",
        &format!("wrote {} ({rows} rows)", layout.final_csv.display()),
    );
    Ok(())
}
