//! Thin wrapper around a vendor CLI.

use std::ffi::OsString;
use std::io::Write as _;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use tempfile::NamedTempFile;

use crate::command::CommandRunner;

use super::ProviderError;

/// Runs one vendor CLI with a fixed set of global arguments appended to
/// every call.
#[derive(Clone, Debug)]
pub(crate) struct VendorCli {
    program: String,
    leading_args: Vec<OsString>,
    global_args: Vec<OsString>,
    runner: Arc<dyn CommandRunner>,
}

impl VendorCli {
    pub(crate) fn new(
        program: impl Into<String>,
        global_args: Vec<OsString>,
        runner: Arc<dyn CommandRunner>,
    ) -> Self {
        Self {
            program: program.into(),
            leading_args: Vec::new(),
            global_args,
            runner,
        }
    }

    /// Arguments placed before the subcommand, for CLIs that only accept
    /// global options in that position.
    pub(crate) fn with_leading_args(mut self, args: Vec<OsString>) -> Self {
        self.leading_args = args;
        self
    }

    /// Runs the CLI and returns stdout when it exits successfully.
    pub(crate) async fn run(
        &self,
        step: &str,
        args: Vec<OsString>,
    ) -> Result<String, ProviderError> {
        let mut full = self.leading_args.clone();
        full.extend(args);
        full.extend(self.global_args.iter().cloned());
        let output = self
            .runner
            .run(&self.program, &full)
            .await
            .and_then(|out| out.check(&self.program))
            .map_err(|source| ProviderError::Command {
                step: step.to_owned(),
                source,
            })?;
        Ok(output.stdout)
    }

    /// Runs the CLI and parses stdout as JSON.
    pub(crate) async fn json<T: DeserializeOwned>(
        &self,
        step: &str,
        args: Vec<OsString>,
    ) -> Result<T, ProviderError> {
        let stdout = self.run(step, args).await?;
        serde_json::from_str(&stdout).map_err(|err| ProviderError::Parse {
            step: step.to_owned(),
            message: err.to_string(),
        })
    }
}

/// Writes `contents` to a scratch file handed to a CLI by path. The file is
/// removed when the returned handle drops.
pub(crate) fn scratch_file(step: &str, contents: &str) -> Result<NamedTempFile, ProviderError> {
    let io_error = |err: std::io::Error| ProviderError::Io {
        step: step.to_owned(),
        message: err.to_string(),
    };
    let mut file = NamedTempFile::new().map_err(io_error)?;
    file.write_all(contents.as_bytes()).map_err(io_error)?;
    file.flush().map_err(io_error)?;
    Ok(file)
}

/// Renders a scratch file path as a CLI argument.
pub(crate) fn path_arg(prefix: &str, file: &NamedTempFile) -> OsString {
    let mut arg = OsString::from(prefix);
    arg.push(file.path().as_os_str());
    arg
}
