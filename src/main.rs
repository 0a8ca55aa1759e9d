//! Binary entry point for the kola test runner.

use std::io::{self, Write};
use std::process;
use std::sync::Arc;

use camino::Utf8PathBuf;
use cap_std::{ambient_authority, fs_utf8::Dir};
use clap::Parser;
use slog::{Logger, info, o};
use thiserror::Error;

use kola::command::{CommandRunner, ProcessCommandRunner};
use kola::config::KolaConfig;
use kola::harness::{
    Harness, HarnessError, HarnessOptions, ProviderClusterFactory, RunSummary, SuiteOptions, Test,
    cancel_on_interrupt,
};
use kola::logging::create_logger;
use kola::provider::{Platform, ProviderConfig, ProviderError};
use kola::reporter::{JsonReporter, Outcome, ReporterError};
use kola::ssh::{OpenSsh, SshConfig};
use kola::suite;

mod cli;

use cli::{Cli, ListCommand, RunCommand};

const REPORT_DIR: &str = "reports";
const REPORT_FILE: &str = "report.json";

#[derive(Debug, Error)]
enum CliError {
    #[error("configuration error: {0}")]
    Config(String),
    #[error(transparent)]
    Provider(#[from] ProviderError),
    #[error(transparent)]
    Harness(#[from] HarnessError),
    #[error(transparent)]
    Report(#[from] ReporterError),
    #[error("{0}")]
    Io(String),
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let exit_code = match dispatch(cli).await {
        Ok(code) => code,
        Err(err) => {
            report_error(&err);
            1
        }
    };

    process::exit(exit_code);
}

async fn dispatch(cli: Cli) -> Result<i32, CliError> {
    match cli {
        Cli::Run(command) => run_command(command).await,
        Cli::List(command) => list_command(&command),
    }
}

fn registered_tests() -> Result<Vec<Test>, CliError> {
    let options = HarnessOptions {
        platform: Platform::Aws,
        include: Vec::new(),
        exclude: Vec::new(),
        parallel: 1,
        suite: SuiteOptions::default(),
    };
    let mut harness = Harness::new(options, &Logger::root(slog::Discard, o!()));
    suite::register_all(&mut harness)?;
    Ok(harness.tests().to_vec())
}

fn list_command(args: &ListCommand) -> Result<i32, CliError> {
    let platform = args
        .platform
        .as_deref()
        .map(str::parse::<Platform>)
        .transpose()
        .map_err(|err| CliError::Config(err.to_string()))?;
    write_test_list(io::stdout(), platform)?;
    Ok(0)
}

fn write_test_list(mut target: impl Write, platform: Option<Platform>) -> Result<(), CliError> {
    for test in registered_tests()? {
        if platform.is_some_and(|selected| !test.runs_on(selected)) {
            continue;
        }
        let platforms = if test.platforms.is_empty() {
            String::from("all")
        } else {
            test.platforms
                .iter()
                .map(|entry| entry.as_str())
                .collect::<Vec<_>>()
                .join(",")
        };
        writeln!(target, "{}\t{platforms}", test.name)
            .map_err(|err| CliError::Io(err.to_string()))?;
    }
    Ok(())
}

async fn run_command(args: RunCommand) -> Result<i32, CliError> {
    let mut config =
        KolaConfig::load_without_cli_args().map_err(|err| CliError::Config(err.to_string()))?;
    if let Some(parallel) = args.parallel {
        config.parallel = parallel;
    }
    config
        .validate()
        .map_err(|err| CliError::Config(err.to_string()))?;
    let platform = config
        .platform()
        .map_err(|err| CliError::Config(err.to_string()))?;
    let ssh_public_key = config
        .ssh_public_key()
        .map_err(|err| CliError::Config(err.to_string()))?;
    let ssh_config =
        SshConfig::load_without_cli_args().map_err(|err| CliError::Config(err.to_string()))?;
    ssh_config
        .validate()
        .map_err(|err| CliError::Config(err.to_string()))?;
    let provider_config = ProviderConfig::load(platform)?;

    let (log, _guard) = create_logger(args.debug);
    let output_dir = config.output_path();
    let report_dir = output_dir.join(REPORT_DIR);
    Dir::create_ambient_dir_all(&report_dir, ambient_authority())
        .map_err(|err| CliError::Io(format!("{report_dir}: {err}")))?;
    let reporter = JsonReporter::create(
        &report_dir.join(REPORT_FILE),
        platform.as_str(),
        config.report_version.clone(),
    )?;

    let runner: Arc<dyn CommandRunner> = Arc::new(ProcessCommandRunner);
    let ssh = Arc::new(OpenSsh::new(ssh_config, Arc::clone(&runner)));
    let factory = ProviderClusterFactory::new(provider_config, runner, ssh, output_dir, &log)
        .with_base_name(config.base_name.clone())
        .with_ssh_public_key(ssh_public_key)
        .with_boot_poll(config.boot_poll())
        .with_no_ssh_key_in_metadata(config.no_ssh_key_in_metadata);

    let options = HarnessOptions {
        platform,
        include: args.include,
        exclude: args.exclude,
        parallel: config.parallel,
        suite: SuiteOptions {
            update_payload: config.update_payload.as_deref().map(Utf8PathBuf::from),
            kolet: Some(Utf8PathBuf::from(&config.kolet_path)),
        },
    };
    let mut harness = Harness::new(options, &log);
    suite::register_all(&mut harness)?;

    let cancel = cancel_on_interrupt(&log).map_err(|err| CliError::Io(err.to_string()))?;
    let summary = harness
        .run(Arc::new(factory), Box::new(reporter), cancel)
        .await?;
    info!(log, "report written"; "path" => %report_dir.join(REPORT_FILE));
    write_summary(io::stdout(), &summary).map_err(|err| CliError::Io(err.to_string()))?;

    Ok(i32::from(summary.result == Outcome::Fail))
}

fn write_summary(mut target: impl Write, summary: &RunSummary) -> io::Result<()> {
    for record in &summary.records {
        writeln!(
            target,
            "--- {}: {} ({:.3}s)",
            record.result,
            record.name,
            record.duration.as_secs_f64()
        )?;
        for line in record.output.lines() {
            writeln!(target, "        {line}")?;
        }
    }
    writeln!(target, "{}", summary.result)
}

fn report_error(err: &CliError) {
    write_error(io::stderr(), err);
}

fn write_error(mut target: impl Write, err: &CliError) {
    writeln!(target, "{err}").ok();
}

#[cfg(test)]
mod main_tests;
