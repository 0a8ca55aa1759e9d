//! Remote command execution on cluster machines.
//!
//! [`SshExecutor`] is the seam the machine layer talks through. The
//! production [`OpenSsh`] drives the system `ssh` and `scp` clients via a
//! [`CommandRunner`]; tests substitute a scripted executor.

use std::ffi::OsString;
use std::fmt;
use std::future::Future;
use std::net::IpAddr;
use std::pin::Pin;
use std::sync::Arc;

use camino::Utf8Path;
use thiserror::Error;

use crate::command::{CommandError, CommandOutput, CommandRunner};

mod config;

pub use config::{SshConfig, expand_tilde};

/// Exit status `ssh` reports for its own connection failures.
const SSH_TRANSPORT_STATUS: i32 = 255;

/// Output of a successful remote command.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct SshOutput {
    /// Captured standard output.
    pub stdout: String,
    /// Captured standard error.
    pub stderr: String,
}

/// Errors raised by [`SshExecutor`] implementations.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum SshError {
    /// The remote command ran and exited non-zero.
    #[error("command {command:?} on {host} exited with status {status}: {stderr}")]
    Failed {
        /// Machine the command ran on.
        host: IpAddr,
        /// Command line that failed.
        command: String,
        /// Exit status.
        status: i32,
        /// Captured standard output.
        stdout: String,
        /// Captured standard error.
        stderr: String,
    },
    /// The client could not reach or authenticate with the machine.
    #[error("ssh to {host} failed: {message}")]
    Transport {
        /// Unreachable machine.
        host: IpAddr,
        /// Client diagnostics.
        message: String,
    },
    /// The client binary could not be started.
    #[error("failed to run ssh client: {0}")]
    Spawn(String),
}

impl SshError {
    /// Returns `true` for failures that may clear up once the machine has
    /// finished booting.
    #[must_use]
    pub const fn is_transport(&self) -> bool {
        matches!(self, Self::Transport { .. })
    }
}

/// Future returned by [`SshExecutor`] operations.
pub type SshFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, SshError>> + Send + 'a>>;

/// Runs commands on, and copies files to, a machine.
pub trait SshExecutor: fmt::Debug + Send + Sync {
    /// Runs one command on `host`. Never retries.
    fn exec<'a>(&'a self, host: IpAddr, command: &'a str) -> SshFuture<'a, SshOutput>;

    /// Uploads `local` to `remote` on `host`.
    fn copy_to<'a>(
        &'a self,
        host: IpAddr,
        local: &'a Utf8Path,
        remote: &'a str,
    ) -> SshFuture<'a, ()>;
}

/// [`SshExecutor`] backed by the OpenSSH client binaries.
#[derive(Clone, Debug)]
pub struct OpenSsh {
    config: SshConfig,
    runner: Arc<dyn CommandRunner>,
}

impl OpenSsh {
    /// Creates an executor using `runner` to spawn the clients.
    #[must_use]
    pub fn new(config: SshConfig, runner: Arc<dyn CommandRunner>) -> Self {
        Self { config, runner }
    }

    fn common_options(&self, port_flag: &str) -> Vec<OsString> {
        let mut args = vec![
            OsString::from(port_flag),
            OsString::from(self.config.port.to_string()),
            OsString::from("-o"),
            OsString::from(format!(
                "ConnectTimeout={}",
                self.config.connect_timeout_secs
            )),
        ];

        if let Some(ref identity_file) = self.config.identity_file {
            args.push(OsString::from("-i"));
            args.push(OsString::from(expand_tilde(identity_file)));
        }

        if self.config.batch_mode {
            args.push(OsString::from("-o"));
            args.push(OsString::from("BatchMode=yes"));
        }

        if !self.config.strict_host_key_checking {
            args.push(OsString::from("-o"));
            args.push(OsString::from("StrictHostKeyChecking=no"));
        }

        if !self.config.known_hosts_file.trim().is_empty() {
            args.push(OsString::from("-o"));
            args.push(OsString::from(format!(
                "UserKnownHostsFile={}",
                self.config.known_hosts_file
            )));
        }

        args
    }

    fn ssh_args(&self, host: IpAddr, command: &str) -> Vec<OsString> {
        let mut args = self.common_options("-p");
        args.push(OsString::from(format!("{}@{host}", self.config.user)));
        args.push(OsString::from(command));
        args
    }

    fn scp_args(&self, host: IpAddr, local: &Utf8Path, remote: &str) -> Vec<OsString> {
        let mut args = self.common_options("-P");
        args.push(OsString::from(local.as_str()));
        let target = match host {
            IpAddr::V4(v4) => format!("{}@{v4}:{remote}", self.config.user),
            IpAddr::V6(v6) => format!("{}@[{v6}]:{remote}", self.config.user),
        };
        args.push(OsString::from(target));
        args
    }

    async fn execute(
        &self,
        program: &str,
        host: IpAddr,
        command: &str,
        args: Vec<OsString>,
    ) -> Result<SshOutput, SshError> {
        let output = self.runner.run(program, &args).await.map_err(|err| match err {
            CommandError::Spawn { message, .. } => SshError::Spawn(message),
            CommandError::Failure { stderr, .. } => SshError::Spawn(stderr),
        })?;
        classify(host, command, output)
    }
}

fn classify(host: IpAddr, command: &str, output: CommandOutput) -> Result<SshOutput, SshError> {
    match output.code {
        Some(0) => Ok(SshOutput {
            stdout: output.stdout,
            stderr: output.stderr,
        }),
        Some(SSH_TRANSPORT_STATUS) | None => Err(SshError::Transport {
            host,
            message: output.stderr.trim().to_owned(),
        }),
        Some(status) => Err(SshError::Failed {
            host,
            command: command.to_owned(),
            status,
            stdout: output.stdout,
            stderr: output.stderr,
        }),
    }
}

impl SshExecutor for OpenSsh {
    fn exec<'a>(&'a self, host: IpAddr, command: &'a str) -> SshFuture<'a, SshOutput> {
        Box::pin(async move {
            let args = self.ssh_args(host, command);
            self.execute(&self.config.ssh_bin, host, command, args).await
        })
    }

    fn copy_to<'a>(
        &'a self,
        host: IpAddr,
        local: &'a Utf8Path,
        remote: &'a str,
    ) -> SshFuture<'a, ()> {
        Box::pin(async move {
            let args = self.scp_args(host, local, remote);
            let label = format!("scp {local} {remote}");
            self.execute(&self.config.scp_bin, host, &label, args)
                .await
                .map(drop)
        })
    }
}
