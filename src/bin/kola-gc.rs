//! Garbage collector for instances leaked by interrupted kola runs.
//!
//! Terminates every instance carrying the `mantle` creator tag on the
//! configured platform once it is older than the grace period. Exits non-zero
//! when any instance could not be inspected or deleted; the rest are still swept.

use std::io::Write as _;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use kola::command::ProcessCommandRunner;
use kola::config::KolaConfig;
use kola::logging::create_logger;
use kola::provider::{self, Platform, ProviderConfig};

#[derive(Debug, Parser)]
#[command(
    name = "kola-gc",
    about = "Terminate tagged test instances older than the grace period"
)]
struct Cli {
    /// Minimum instance age in seconds; defaults to the configured grace period.
    #[arg(long, value_name = "SECONDS")]
    grace_period: Option<u64>,
    /// Platform to sweep; defaults to the configured platform.
    #[arg(long, value_name = "PLATFORM")]
    platform: Option<Platform>,
    /// Log debug records.
    #[arg(long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> Result<(), String> {
    let cli = Cli::parse();
    let config = KolaConfig::load_without_cli_args().map_err(|err| err.to_string())?;
    let platform = match cli.platform {
        Some(platform) => platform,
        None => config.platform().map_err(|err| err.to_string())?,
    };
    let grace_period = cli
        .grace_period
        .map_or_else(|| config.gc_grace_period(), Duration::from_secs);

    let (log, _guard) = create_logger(cli.debug);
    let provider_config = ProviderConfig::load(platform).map_err(|err| err.to_string())?;
    let backend = provider::build(provider_config, Arc::new(ProcessCommandRunner), &log)
        .map_err(|err| err.to_string())?;
    let summary = backend
        .gc(grace_period)
        .await
        .map_err(|err| err.to_string())?;
    writeln!(
        std::io::stdout(),
        "gc sweep complete: platform={platform}, terminated={}, skipped={}, failed={}",
        summary.terminated.len(),
        summary.skipped,
        summary.failures.len()
    )
    .map_err(|err| err.to_string())?;
    if summary.failures.is_empty() {
        return Ok(());
    }
    let failed: Vec<String> = summary.failures.iter().map(ToString::to_string).collect();
    Err(format!("gc left instances behind: {}", failed.join("; ")))
}
