//! The `run` subcommand: process every batch of card scans.

use std::{io::Write as _, sync::Arc, time::Duration};

use clap::Args;
use tokio::io::{AsyncBufReadExt as _, BufReader};

use crate::{
    cancel::CancelFlag,
    client::{ClientOpts, DEFAULT_API_BASE, DEFAULT_MODEL, HttpBackend, RetryPolicy},
    cmd::OutputOpts,
    prelude::*,
    rate_limit::RateLimit,
    run::{RunConfig, RunSummary, run_all},
    ui::Ui,
};

/// Options for the `run` subcommand.
#[derive(Debug, Args)]
pub struct RunOpts {
    /// Directory containing the batch directories of card scans.
    input_dir: PathBuf,

    /// Batch directory name pattern ("*" wildcards). If nothing matches,
    /// every subdirectory is processed.
    #[clap(long, default_value = "*")]
    batch_pattern: String,

    /// Max number of cards to process at a time.
    #[clap(short = 'j', long = "jobs", default_value = "5")]
    job_count: usize,

    /// Base URL of the chat completions API.
    #[clap(long, default_value = DEFAULT_API_BASE)]
    api_base: String,

    /// Vision model to request.
    #[clap(long, default_value = DEFAULT_MODEL)]
    model: String,

    /// Attempts per card, including the first.
    #[clap(long, default_value = "3")]
    max_retries: u32,

    /// Base retry backoff in seconds; attempt N waits N times this.
    #[clap(long, default_value = "2", value_name = "SECONDS")]
    retry_delay: u64,

    /// Per-request timeout in seconds.
    #[clap(long, default_value = "120", value_name = "SECONDS")]
    timeout: u64,

    /// Proactive request rate limit, e.g. "10/s" or "600/m".
    #[clap(long)]
    rate_limit: Option<RateLimit>,

    #[clap(flatten)]
    output: OutputOpts,
}

/// The `run` subcommand.
#[instrument(level = "debug", skip_all)]
pub async fn cmd_run(ui: Ui, opts: &RunOpts) -> Result<()> {
    let api_key = resolve_api_key().await?;
    let client_opts = ClientOpts {
        api_base: opts.api_base.clone(),
        model: opts.model.clone(),
        timeout: Duration::from_secs(opts.timeout),
        rate_limit: opts.rate_limit.clone(),
    };
    let backend = Arc::new(HttpBackend::new(&client_opts, api_key)?);

    let cancel = CancelFlag::new();
    cancel.install_ctrl_c_handler();

    let config = RunConfig {
        input_dir: opts.input_dir.clone(),
        batch_pattern: opts.batch_pattern.clone(),
        jobs: opts.job_count,
        retry: RetryPolicy {
            max_attempts: opts.max_retries,
            base_delay: Duration::from_secs(opts.retry_delay),
        },
        layout: opts.output.layout(),
    };
    let summary = run_all(&ui, &config, backend, cancel).await?;
    display_summary(&ui, &summary);
    Ok(())
}

/// Show the final run summary.
fn display_summary(ui: &Ui, summary: &RunSummary) {
    let elapsed = summary.elapsed.as_secs_f64();
    let cards_per_hour = if elapsed > 0.0 {
        summary.attempted() as f64 / (elapsed / 3600.0)
    } else {
        0.0
    };
    ui.display_message(
        "📊",
        &format!(
            "{} cards processed ({} ok, {} errors) in {:.0} s ({:.0} cards/h)",
            summary.attempted(),
            summary.succeeded(),
            summary.failed(),
            elapsed,
            cards_per_hour,
        ),
    );
}

/// Get the API credential: `KARTEI_API_KEY` from the environment (or `.env`),
/// otherwise prompt for it. The key is never written to disk.
async fn resolve_api_key() -> Result<String> {
    if let Ok(key) = std::env::var("KARTEI_API_KEY")
        && !key.trim().is_empty()
    {
        return Ok(key.trim().to_owned());
    }

    eprint!("API key (KARTEI_API_KEY not set): ");
    std::io::stderr().flush().context("failed to flush stderr")?;
    let mut key = String::new();
    BufReader::new(tokio::io::stdin())
        .read_line(&mut key)
        .await
        .context("failed to read API key from stdin")?;
    let key = key.trim();
    if key.is_empty() {
        return Err(anyhow!("no API key provided"));
    }
    Ok(key.to_owned())
}
