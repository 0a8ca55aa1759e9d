//! A single provisioned instance plus its local bookkeeping.
//!
//! Machines are created by [`crate::cluster::Cluster::new_machine`] and only
//! handed out once they have booted. Each machine owns a directory under the
//! cluster's output directory holding `user-data`, `journal.txt` and, after
//! destruction, `console.txt`.

use std::fmt;
use std::net::IpAddr;
use std::sync::{Arc, Weak};

use camino::{Utf8Path, Utf8PathBuf};
use cap_std::{ambient_authority, fs_utf8::Dir};
use slog::{Logger, debug, info, o, warn};

use crate::cleanup::{Cleanup, TeardownError};
use crate::cluster::ClusterContext;
use crate::journal::Journal;
use crate::provider::{Addresses, Instance, ProviderError};
use crate::retry::poll_for;
use crate::ssh::{SshExecutor, SshOutput};

mod error;

pub use error::MachineError;

/// Prints the kernel's identifier for the current boot.
pub const BOOT_ID_COMMAND: &str = "cat /proc/sys/kernel/random/boot_id";
/// Lists failed systemd units, one per line.
pub const FAILED_UNITS_COMMAND: &str = "systemctl --failed --no-legend --plain --no-pager";
/// Reboots the machine.
pub const REBOOT_COMMAND: &str = "sudo systemctl reboot";

/// File receiving the captured serial console.
pub const CONSOLE_FILE: &str = "console.txt";
/// File receiving the rendered user-data.
pub const USER_DATA_FILE: &str = "user-data";

/// Provider-assigned machine identifier.
#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct MachineId(String);

impl MachineId {
    /// Wraps a provider identifier.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Identifier text.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MachineId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Lifecycle position of a machine.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum MachineState {
    /// The instance exists but has not been contacted.
    Created,
    /// Waiting for SSH after creation or a reboot.
    Booting,
    /// Reachable and passing baseline checks.
    Ready,
    /// Torn down; only local artefacts remain.
    Destroyed,
}

impl fmt::Display for MachineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Created => "created",
            Self::Booting => "booting",
            Self::Ready => "ready",
            Self::Destroyed => "destroyed",
        })
    }
}

/// A provisioned instance.
#[derive(Debug)]
pub struct Machine {
    id: MachineId,
    instance: Instance,
    state: MachineState,
    dir: Option<Utf8PathBuf>,
    journal: Option<Journal>,
    console: Option<String>,
    boot_id: Option<String>,
    cluster: Weak<ClusterContext>,
    log: Logger,
}

impl Machine {
    pub(crate) fn new(instance: Instance, cluster: Weak<ClusterContext>, log: &Logger) -> Self {
        let id = MachineId::new(instance.id.clone());
        Self {
            log: log.new(o!("machine" => id.to_string())),
            id,
            instance,
            state: MachineState::Created,
            dir: None,
            journal: None,
            console: None,
            boot_id: None,
            cluster,
        }
    }

    /// Machine identifier.
    #[must_use]
    pub const fn id(&self) -> &MachineId {
        &self.id
    }

    /// Name requested from the provider.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.instance.name
    }

    /// Address reachable from the test host.
    #[must_use]
    pub const fn public_ip(&self) -> Option<IpAddr> {
        self.instance.addresses.public
    }

    /// Address on the provider network. Falls back to the public address
    /// on providers that expose only one.
    #[must_use]
    pub fn private_ip(&self) -> Option<IpAddr> {
        self.instance.addresses.private.or(self.instance.addresses.public)
    }

    /// Current lifecycle state.
    #[must_use]
    pub const fn state(&self) -> MachineState {
        self.state
    }

    /// Directory holding this machine's artefacts, once created.
    #[must_use]
    pub fn dir(&self) -> Option<&Utf8Path> {
        self.dir.as_deref()
    }

    /// Boot identifier observed at the last successful boot.
    #[must_use]
    pub fn boot_id(&self) -> Option<&str> {
        self.boot_id.as_deref()
    }

    /// Serial console captured during [`Machine::destroy`].
    #[must_use]
    pub fn console_output(&self) -> Option<&str> {
        self.console.as_deref()
    }

    /// Last collected journal, or an empty string when none exists yet.
    #[must_use]
    pub fn journal_output(&self) -> String {
        let Some(journal) = &self.journal else {
            return String::new();
        };
        journal.read().unwrap_or_else(|err| {
            warn!(self.log, "reading journal failed"; "error" => %err);
            String::new()
        })
    }

    fn context(&self) -> Result<Arc<ClusterContext>, MachineError> {
        self.cluster.upgrade().ok_or_else(|| MachineError::ClusterGone {
            machine: self.id.to_string(),
        })
    }

    fn host(&self) -> Result<IpAddr, MachineError> {
        self.public_ip().ok_or_else(|| MachineError::NoAddress {
            machine: self.id.to_string(),
        })
    }

    fn io_error(&self, path: &Utf8Path, err: &std::io::Error) -> MachineError {
        MachineError::Io {
            machine: self.id.to_string(),
            path: path.to_string(),
            message: err.to_string(),
        }
    }

    /// Creates `<output_dir>/<id>/`, writes the rendered user-data and opens
    /// the journal.
    pub(crate) fn prepare(
        &mut self,
        output_dir: &Utf8Path,
        user_data: &str,
    ) -> Result<(), MachineError> {
        let dir = output_dir.join(self.id.as_str());
        Dir::create_ambient_dir_all(&dir, ambient_authority())
            .map_err(|err| self.io_error(&dir, &err))?;
        self.dir = Some(dir.clone());
        let handle = Dir::open_ambient_dir(&dir, ambient_authority())
            .map_err(|err| self.io_error(&dir, &err))?;
        handle
            .write(USER_DATA_FILE, user_data.as_bytes())
            .map_err(|err| self.io_error(&dir.join(USER_DATA_FILE), &err))?;
        let journal = Journal::open(&dir).map_err(|source| MachineError::Journal {
            machine: self.id.to_string(),
            source,
        })?;
        self.journal = Some(journal);
        Ok(())
    }

    /// Waits for SSH, snapshots the journal and checks for failed units.
    pub(crate) async fn boot(&mut self) -> Result<(), MachineError> {
        let ctx = self.context()?;
        let host = self.host()?;
        self.state = MachineState::Booting;
        let machine = self.id.to_string();
        let boot_id = poll_for(ctx.boot_poll, &ctx.cancel, || {
            probe_boot_id(ctx.ssh.as_ref(), host, &machine, &self.log)
        })
        .await
        .map_err(|err| MachineError::Readiness {
            machine: machine.clone(),
            step: "wait for ssh",
            source: Box::new(err),
        })?;
        debug!(self.log, "ssh reachable"; "boot_id" => &boot_id);
        self.boot_id = Some(boot_id);
        self.collect_journal(ctx.ssh.as_ref()).await?;
        self.check_failed_units(ctx.ssh.as_ref()).await?;
        self.state = MachineState::Ready;
        info!(self.log, "machine ready"; "address" => %host);
        Ok(())
    }

    async fn collect_journal(&mut self, ssh: &dyn SshExecutor) -> Result<(), MachineError> {
        let host = self.host()?;
        let machine = self.id.to_string();
        if let Some(journal) = self.journal.as_mut() {
            journal
                .collect(ssh, host)
                .await
                .map_err(|source| MachineError::Journal { machine, source })?;
        }
        Ok(())
    }

    async fn check_failed_units(&self, ssh: &dyn SshExecutor) -> Result<(), MachineError> {
        let output = self.run(ssh, FAILED_UNITS_COMMAND).await?;
        let units: Vec<String> = output
            .stdout
            .lines()
            .filter_map(|line| line.split_whitespace().next())
            .map(str::to_owned)
            .collect();
        if units.is_empty() {
            Ok(())
        } else {
            Err(MachineError::FailedUnits {
                machine: self.id.to_string(),
                units,
            })
        }
    }

    async fn run(&self, ssh: &dyn SshExecutor, command: &str) -> Result<SshOutput, MachineError> {
        let host = self.host()?;
        ssh.exec(host, command)
            .await
            .map_err(|source| MachineError::Ssh {
                machine: self.id.to_string(),
                source,
            })
    }

    /// Runs one command on the machine. Never retries.
    ///
    /// # Errors
    ///
    /// Returns [`MachineError::Ssh`] when the command cannot run or exits
    /// non-zero, and [`MachineError::ClusterGone`] once the cluster has been
    /// dropped.
    pub async fn ssh(&self, command: &str) -> Result<SshOutput, MachineError> {
        let ctx = self.context()?;
        self.run(ctx.ssh.as_ref(), command).await
    }

    /// Copies a local file onto the machine.
    ///
    /// # Errors
    ///
    /// Same as [`Machine::ssh`].
    pub async fn copy_to(&self, local: &Utf8Path, remote: &str) -> Result<(), MachineError> {
        let ctx = self.context()?;
        let host = self.host()?;
        ctx.ssh
            .copy_to(host, local, remote)
            .await
            .map_err(|source| MachineError::Ssh {
                machine: self.id.to_string(),
                source,
            })
    }

    /// Reboots the machine and waits until it comes back with a new boot
    /// id, re-reading its addresses from the provider while waiting.
    ///
    /// # Errors
    ///
    /// Returns [`MachineError::InvalidState`] unless the machine is ready,
    /// and [`MachineError::Readiness`] when it does not come back in time
    /// or the provider lookup fails.
    pub async fn reboot(&mut self) -> Result<(), MachineError> {
        if self.state != MachineState::Ready {
            return Err(MachineError::InvalidState {
                machine: self.id.to_string(),
                operation: "reboot",
                state: self.state,
            });
        }
        let ctx = self.context()?;
        let previous = self.boot_id.clone().unwrap_or_default();
        if let Err(err) = self.run(ctx.ssh.as_ref(), REBOOT_COMMAND).await {
            // The connection usually drops before the command returns.
            debug!(self.log, "reboot command returned an error"; "error" => %err);
        }
        self.state = MachineState::Booting;
        let machine = self.id.to_string();
        let instance = self.instance.clone();
        let log = self.log.clone();
        let (addresses, boot_id) = poll_for(ctx.boot_poll, &ctx.cancel, || {
            probe_new_boot(&ctx, &instance, &previous, &machine, &log)
        })
        .await
        .map_err(|err| MachineError::Readiness {
            machine: machine.clone(),
            step: "wait for reboot",
            source: Box::new(err),
        })?;
        if addresses != self.instance.addresses {
            info!(self.log, "addresses changed across reboot";
                "public" => ?addresses.public, "private" => ?addresses.private);
        }
        self.instance.addresses = addresses;
        self.boot_id = Some(boot_id);
        self.collect_journal(ctx.ssh.as_ref()).await?;
        self.state = MachineState::Ready;
        Ok(())
    }

    /// Tears the machine down: journal snapshot, console capture, instance
    /// termination, journal close.
    ///
    /// Every step is attempted regardless of earlier failures, and steps
    /// whose resources were never set up are skipped. Calling it again
    /// after it has run is a no-op.
    ///
    /// # Errors
    ///
    /// Returns [`TeardownError`] listing each failed step.
    pub async fn destroy(&mut self) -> Result<(), TeardownError> {
        if self.state == MachineState::Destroyed {
            return Ok(());
        }
        let mut cleanup = Cleanup::new(self.id.as_str(), &self.log);
        let ctx = cleanup.step("resolve cluster", self.context());

        if let Some(ctx) = &ctx
            && self.boot_id.is_some()
            && self.journal.as_ref().is_some_and(|journal| !journal.is_closed())
        {
            let result = self.collect_journal(ctx.ssh.as_ref()).await;
            cleanup.step("collect journal", result);
        }

        if let Some(ctx) = &ctx {
            let console = ctx.provider.console_output(&self.instance).await;
            if let Some(bytes) = cleanup.step("fetch console", console) {
                self.console = Some(String::from_utf8_lossy(&bytes).into_owned());
            }
        }
        if let Some(dir) = self.dir.clone() {
            let contents = self.console.clone().unwrap_or_default();
            let saved = Dir::open_ambient_dir(&dir, ambient_authority())
                .and_then(|handle| handle.write(CONSOLE_FILE, contents.as_bytes()))
                .map_err(|err| self.io_error(&dir.join(CONSOLE_FILE), &err));
            cleanup.step("save console", saved);
        }

        if let Some(ctx) = &ctx {
            let terminated: Result<(), ProviderError> =
                ctx.provider.terminate_instance(&self.instance).await;
            cleanup.step("terminate instance", terminated);
        }

        if let Some(journal) = self.journal.as_mut() {
            journal.close();
        }
        self.state = MachineState::Destroyed;
        cleanup.finish()
    }
}

async fn probe_boot_id(
    ssh: &dyn SshExecutor,
    host: IpAddr,
    machine: &str,
    log: &Logger,
) -> Result<Option<String>, MachineError> {
    match ssh.exec(host, BOOT_ID_COMMAND).await {
        Ok(output) => {
            let boot_id = output.stdout.trim();
            Ok((!boot_id.is_empty()).then(|| boot_id.to_owned()))
        }
        Err(err) if err.is_transport() => {
            debug!(log, "ssh not ready yet"; "error" => %err);
            Ok(None)
        }
        Err(source) => Err(MachineError::Ssh {
            machine: machine.to_owned(),
            source,
        }),
    }
}

async fn probe_new_boot(
    ctx: &ClusterContext,
    instance: &Instance,
    previous: &str,
    machine: &str,
    log: &Logger,
) -> Result<Option<(Addresses, String)>, MachineError> {
    let addresses = ctx
        .provider
        .refresh_addresses(instance)
        .await
        .map_err(|source| MachineError::Provider {
            machine: machine.to_owned(),
            source,
        })?;
    let Some(host) = addresses.public else {
        return Ok(None);
    };
    match ctx.ssh.exec(host, BOOT_ID_COMMAND).await {
        Ok(output) => {
            let boot_id = output.stdout.trim();
            if boot_id.is_empty() || boot_id == previous {
                Ok(None)
            } else {
                Ok(Some((addresses, boot_id.to_owned())))
            }
        }
        Err(err) => {
            debug!(log, "waiting for machine to come back"; "error" => %err);
            Ok(None)
        }
    }
}

#[cfg(test)]
mod tests;
