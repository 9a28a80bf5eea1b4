use std::str::FromStr;

use clap::{Parser, Subcommand};
use tracing_subscriber::{
    EnvFilter, Layer as _, filter::Directive, fmt::format::FmtSpan, layer::SubscriberExt,
    util::SubscriberInitExt as _,
};

use self::{prelude::*, ui::Ui};

mod batch;
mod cancel;
mod checkpoint;
mod client;
mod cmd;
mod data_url;
mod error_log;
mod prelude;
mod prompt;
mod rate_limit;
mod retry;
mod review;
mod run;
mod schema;
mod table;
mod ui;
mod worker;

/// Digitize scanned archive index cards with a vision model.
#[derive(Debug, Parser)]
#[clap(
    version,
    author,
    after_help = r#"
Environment Variables:
  - KARTEI_API_KEY: The API key for the chat completions endpoint.
    If unset, `run` prompts for it. The key is never written to disk.

  These variables may be set in a standard `.env` file.
"#
)]
struct Opts {
    #[clap(subcommand)]
    subcmd: Cmd,
}

/// The subcommands we support.
#[derive(Debug, Subcommand)]
enum Cmd {
    /// Process every batch of card scans, resuming where a previous run
    /// stopped.
    Run(cmd::run::RunOpts),
    /// Rebuild the consolidated CSV from the per-batch exports.
    Merge(cmd::merge::MergeOpts),
    /// Inspect extraction quality and apply corrections.
    Review(cmd::review::ReviewOpts),
}

/// Our entry point, which can return an error. [`anyhow::Result`] will
/// automatically print a nice error message with optional backtrace.
#[tokio::main]
async fn main() -> Result<()> {
    let ui = Ui::init();

    // Initialize tracing.
    let directive = Directive::from_str("info").expect("built-in directive should be valid");
    let env_filter = EnvFilter::builder()
        .with_default_directive(directive)
        .from_env_lossy();

    let subscriber = tracing_subscriber::fmt::layer()
        .with_span_events(FmtSpan::NEW | FmtSpan::CLOSE)
        .with_writer(ui.get_stderr_writer())
        .with_filter(env_filter);

    // We can stack multiple layers here if we need to.
    tracing_subscriber::registry().with(subscriber).init();

    // Call our real `main` function now that logging is set up.
    real_main(ui).await
}

/// Our real entry point.
#[instrument(level = "debug", name = "main", skip_all)]
async fn real_main(ui: Ui) -> Result<()> {
    // Load environment variables from a `.env` file, if it exists.
    dotenvy::dotenv().ok();

    // Parse command-line arguments.
    let opts = Opts::parse();
    debug!("Parsed options: {:?}", opts);

    // Run the appropriate subcommand.
    match &opts.subcmd {
        Cmd::Run(run_opts) => {
            cmd::run::cmd_run(ui, run_opts).await?;
        }
        Cmd::Merge(merge_opts) => {
            cmd::merge::cmd_merge(ui, merge_opts).await?;
        }
        Cmd::Review(review_opts) => {
            cmd::review::cmd_review(ui, review_opts).await?;
        }
    }
    Ok(())
}
