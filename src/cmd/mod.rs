//! Command-line entry points.

use clap::Args;

use crate::{prelude::*, run::OutputLayout};

pub mod merge;
pub mod review;
pub mod run;

/// Common options for subcommands that work with the output tree.
#[derive(Debug, Clone, Args)]
pub struct OutputOpts {
    /// Directory holding (or receiving) all run output.
    #[clap(long = "output", default_value = "output_batches")]
    output_dir: PathBuf,
}

impl OutputOpts {
    /// The standard layout under the chosen output directory.
    pub fn layout(&self) -> OutputLayout {
        OutputLayout::new(&self.output_dir)
    }
}
