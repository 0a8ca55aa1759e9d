//! Command-line interface definitions for the `kola` binary.
//!
//! This module centralises the clap parser structures so both the main binary
//! and the build script can reuse them when generating the manual page.

use clap::Parser;

/// Top-level CLI for the `kola` binary.
#[derive(Debug, Parser)]
#[command(
    name = "kola",
    about = "Run integration tests against short-lived cloud machines",
    arg_required_else_help = true
)]
pub(crate) enum Cli {
    /// Run the selected tests and write a JSON report.
    #[command(name = "run", about = "Run the selected tests and write a JSON report")]
    Run(RunCommand),
    /// List the registered tests.
    #[command(name = "list", about = "List the registered tests")]
    List(ListCommand),
}

/// Arguments for the `kola run` subcommand.
#[derive(Debug, Parser)]
pub(crate) struct RunCommand {
    /// Only run tests whose name contains PATTERN. Repeat to require several.
    #[arg(long, value_name = "PATTERN")]
    pub(crate) include: Vec<String>,
    /// Skip tests whose name contains PATTERN.
    #[arg(long, value_name = "PATTERN")]
    pub(crate) exclude: Vec<String>,
    /// Override the number of tests running at once.
    #[arg(long, value_name = "N")]
    pub(crate) parallel: Option<usize>,
    /// Log debug records.
    #[arg(long)]
    pub(crate) debug: bool,
}

/// Arguments for the `kola list` subcommand.
#[derive(Debug, Parser)]
pub(crate) struct ListCommand {
    /// Only list tests that run on PLATFORM.
    #[arg(long, value_name = "PLATFORM")]
    pub(crate) platform: Option<String>,
}
