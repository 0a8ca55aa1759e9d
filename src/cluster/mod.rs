//! A homogeneous set of machines sharing one provider identity.
//!
//! [`Cluster::new`] performs the provider's one-time setup. Machines are then
//! added one at a time and torn down in reverse creation order by
//! [`Cluster::destroy`], which always attempts every machine before
//! releasing the provider's shared resources.

use std::sync::Arc;

use camino::{Utf8Path, Utf8PathBuf};
use cap_std::{ambient_authority, fs_utf8::Dir};
use slog::{Logger, info, o, warn};
use thiserror::Error;

use crate::cleanup::{Cleanup, TeardownError, append_teardown_note};
use crate::machine::{Machine, MachineError, MachineId};
use crate::provider::{ClusterIdentity, InstanceRequest, Platform, Provider, ProviderError};
use crate::retry::{CancelSignal, Poll};
use crate::ssh::{SshExecutor, SshOutput};
use crate::userdata::UserData;

/// Settings for one cluster.
#[derive(Clone, Debug)]
pub struct ClusterOptions {
    /// Cluster name; machines are named `<name>-<n>`.
    pub name: String,
    /// Directory receiving one sub-directory per machine.
    pub output_dir: Utf8PathBuf,
    /// Public key registered with the provider.
    pub ssh_public_key: Option<String>,
    /// Budget for a machine to accept SSH after boot or reboot.
    pub boot_poll: Poll,
    /// Leave the key out of provider metadata.
    pub no_ssh_key_in_metadata: bool,
    /// Aborts provider and boot waits.
    pub cancel: CancelSignal,
}

/// State shared between a cluster and its machines.
#[derive(Debug)]
pub(crate) struct ClusterContext {
    pub(crate) name: String,
    pub(crate) provider: Box<dyn Provider>,
    pub(crate) ssh: Arc<dyn SshExecutor>,
    pub(crate) boot_poll: Poll,
    pub(crate) cancel: CancelSignal,
}

/// Errors raised by [`Cluster`] operations.
#[derive(Debug, Error)]
pub enum ClusterError {
    /// Provider setup failed; no machine can be created.
    #[error("cluster {cluster}: setup failed: {source}")]
    Setup {
        /// Cluster name.
        cluster: String,
        /// Provider failure.
        #[source]
        source: ProviderError,
    },
    /// The output directory could not be created.
    #[error("cluster {cluster}: {path}: {message}")]
    Io {
        /// Cluster name.
        cluster: String,
        /// Directory involved.
        path: Utf8PathBuf,
        /// Underlying I/O error.
        message: String,
    },
    /// The provider could not create an instance.
    #[error("cluster {cluster}: creating {name}: {source}")]
    Provision {
        /// Cluster name.
        cluster: String,
        /// Requested machine name.
        name: String,
        /// Provider failure.
        #[source]
        source: ProviderError,
    },
    /// The instance was created but did not become usable. It has been
    /// destroyed again.
    #[error("machine setup failed: {message}")]
    Machine {
        /// Failure description including any teardown problem.
        message: String,
        /// Underlying machine failure.
        #[source]
        source: MachineError,
    },
    /// A command or reboot on a registered machine failed.
    #[error("cluster {cluster}: {source}")]
    Operation {
        /// Cluster name.
        cluster: String,
        /// Machine failure.
        #[source]
        source: MachineError,
    },
    /// No machine with this id belongs to the cluster.
    #[error("cluster {cluster}: unknown machine {id}")]
    UnknownMachine {
        /// Cluster name.
        cluster: String,
        /// Requested id.
        id: MachineId,
    },
    /// The cluster has already been destroyed.
    #[error("cluster {cluster} has been destroyed")]
    Destroyed {
        /// Cluster name.
        cluster: String,
    },
    /// Destroying a machine failed.
    #[error(transparent)]
    Teardown(#[from] TeardownError),
}

impl ClusterError {
    /// Returns `true` when the failure was a readiness timeout rather than
    /// a hard error.
    #[must_use]
    pub fn is_timeout(&self) -> bool {
        match self {
            Self::Setup { source, .. } | Self::Provision { source, .. } => source.is_timeout(),
            Self::Machine { source, .. } | Self::Operation { source, .. } => source.is_timeout(),
            _ => false,
        }
    }
}

/// Machines created through one provider.
#[derive(Debug)]
pub struct Cluster {
    context: Arc<ClusterContext>,
    output_dir: Utf8PathBuf,
    machines: Vec<Machine>,
    next_index: usize,
    destroyed: bool,
    log: Logger,
}

impl Cluster {
    /// Creates the output directory and runs the provider's one-time setup.
    ///
    /// # Errors
    ///
    /// Returns [`ClusterError::Io`] when the output directory cannot be
    /// created and [`ClusterError::Setup`] when the provider setup fails.
    pub async fn new(
        options: ClusterOptions,
        provider: Box<dyn Provider>,
        ssh: Arc<dyn SshExecutor>,
        parent_log: &Logger,
    ) -> Result<Self, ClusterError> {
        let log = parent_log.new(o!(
            "cluster" => options.name.clone(),
            "platform" => provider.platform().as_str(),
        ));
        Dir::create_ambient_dir_all(&options.output_dir, ambient_authority()).map_err(|err| {
            ClusterError::Io {
                cluster: options.name.clone(),
                path: options.output_dir.clone(),
                message: err.to_string(),
            }
        })?;

        let identity = ClusterIdentity {
            name: options.name.clone(),
            ssh_public_key: if options.no_ssh_key_in_metadata {
                None
            } else {
                options.ssh_public_key.clone()
            },
        };
        provider
            .setup(&identity)
            .await
            .map_err(|source| ClusterError::Setup {
                cluster: options.name.clone(),
                source,
            })?;
        info!(log, "cluster set up");

        Ok(Self {
            context: Arc::new(ClusterContext {
                name: options.name,
                provider,
                ssh,
                boot_poll: options.boot_poll,
                cancel: options.cancel,
            }),
            output_dir: options.output_dir,
            machines: Vec::new(),
            next_index: 0,
            destroyed: false,
            log,
        })
    }

    /// Cluster name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.context.name
    }

    /// Platform of the underlying provider.
    #[must_use]
    pub fn platform(&self) -> Platform {
        self.context.provider.platform()
    }

    /// Directory holding the machine directories.
    #[must_use]
    pub fn output_dir(&self) -> &Utf8Path {
        &self.output_dir
    }

    /// Cluster logger.
    #[must_use]
    pub const fn log(&self) -> &Logger {
        &self.log
    }

    /// Creates a machine and waits until it has booted.
    ///
    /// Placeholders in `user_data` are swapped for the platform's metadata
    /// variables. A machine that fails after its instance was created is
    /// destroyed before the error is returned.
    ///
    /// # Errors
    ///
    /// Returns [`ClusterError::Provision`] when the instance cannot be
    /// created and [`ClusterError::Machine`] when it does not boot.
    pub async fn new_machine(&mut self, user_data: &UserData) -> Result<&Machine, ClusterError> {
        if self.destroyed {
            return Err(ClusterError::Destroyed {
                cluster: self.context.name.clone(),
            });
        }
        self.next_index += 1;
        let name = format!("{}-{}", self.context.name, self.next_index);
        let rendered = user_data.render_for(self.platform().ip_placeholders());
        let request = InstanceRequest {
            name: name.clone(),
            user_data: rendered,
        };
        let instance = self
            .context
            .provider
            .create_instance(&request, &self.context.cancel)
            .await
            .map_err(|source| ClusterError::Provision {
                cluster: self.context.name.clone(),
                name,
                source,
            })?;

        let mut machine = Machine::new(instance, Arc::downgrade(&self.context), &self.log);
        let started = match machine.prepare(&self.output_dir, &request.user_data) {
            Ok(()) => machine.boot().await,
            Err(err) => Err(err),
        };
        if let Err(err) = started {
            warn!(
                self.log,
                "machine failed to start";
                "machine" => %machine.id(),
                "error" => %err
            );
            let teardown = machine.destroy().await.err();
            return Err(ClusterError::Machine {
                message: append_teardown_note(err.to_string(), teardown.as_ref()),
                source: err,
            });
        }

        info!(self.log, "machine added"; "machine" => %machine.id());
        let id = machine.id().clone();
        self.machines.push(machine);
        self.machine(&id).ok_or_else(|| ClusterError::UnknownMachine {
            cluster: self.context.name.clone(),
            id,
        })
    }

    /// Looks up a machine.
    #[must_use]
    pub fn machine(&self, id: &MachineId) -> Option<&Machine> {
        self.machines.iter().find(|machine| machine.id() == id)
    }

    /// Looks up a machine for reboots.
    #[must_use]
    pub fn machine_mut(&mut self, id: &MachineId) -> Option<&mut Machine> {
        self.machines.iter_mut().find(|machine| machine.id() == id)
    }

    /// Machines in creation order.
    #[must_use]
    pub fn machines(&self) -> &[Machine] {
        &self.machines
    }

    /// Identifiers in creation order.
    #[must_use]
    pub fn machine_ids(&self) -> Vec<MachineId> {
        self.machines.iter().map(|machine| machine.id().clone()).collect()
    }

    /// Runs `command` on a registered machine.
    ///
    /// # Errors
    ///
    /// Returns [`ClusterError::UnknownMachine`] for foreign ids and
    /// [`ClusterError::Operation`] when the command fails.
    pub async fn ssh(&self, id: &MachineId, command: &str) -> Result<SshOutput, ClusterError> {
        let machine = self.machine(id).ok_or_else(|| self.unknown(id))?;
        machine.ssh(command).await.map_err(|source| ClusterError::Operation {
            cluster: self.context.name.clone(),
            source,
        })
    }

    /// Copies a local file onto a registered machine.
    ///
    /// # Errors
    ///
    /// Returns [`ClusterError::UnknownMachine`] for foreign ids and
    /// [`ClusterError::Operation`] when the copy fails.
    pub async fn copy_to(
        &self,
        id: &MachineId,
        local: &Utf8Path,
        remote: &str,
    ) -> Result<(), ClusterError> {
        let machine = self.machine(id).ok_or_else(|| self.unknown(id))?;
        machine
            .copy_to(local, remote)
            .await
            .map_err(|source| ClusterError::Operation {
                cluster: self.context.name.clone(),
                source,
            })
    }

    /// Reboots a registered machine and waits until it is back.
    ///
    /// # Errors
    ///
    /// Returns [`ClusterError::UnknownMachine`] for foreign ids and
    /// [`ClusterError::Operation`] when the machine does not come back.
    pub async fn reboot(&mut self, id: &MachineId) -> Result<(), ClusterError> {
        let unknown = self.unknown(id);
        let cluster = self.context.name.clone();
        let machine = self.machine_mut(id).ok_or(unknown)?;
        machine
            .reboot()
            .await
            .map_err(|source| ClusterError::Operation { cluster, source })
    }

    fn unknown(&self, id: &MachineId) -> ClusterError {
        ClusterError::UnknownMachine {
            cluster: self.context.name.clone(),
            id: id.clone(),
        }
    }

    /// Destroys one machine and removes it from the cluster.
    ///
    /// The machine is deregistered even when some teardown step fails.
    ///
    /// # Errors
    ///
    /// Returns [`ClusterError::UnknownMachine`] for foreign ids and
    /// [`ClusterError::Teardown`] when a teardown step fails.
    pub async fn destroy_machine(&mut self, id: &MachineId) -> Result<(), ClusterError> {
        let position = self
            .machines
            .iter()
            .position(|machine| machine.id() == id)
            .ok_or_else(|| self.unknown(id))?;
        let mut machine = self.machines.remove(position);
        machine.destroy().await?;
        Ok(())
    }

    /// Destroys every machine in reverse creation order, then releases the
    /// provider's shared resources.
    ///
    /// Every machine is attempted even when earlier ones fail. Calling it
    /// again is a no-op.
    ///
    /// # Errors
    ///
    /// Returns one [`TeardownError`] listing every failed step.
    pub async fn destroy(&mut self) -> Result<(), TeardownError> {
        if self.destroyed {
            return Ok(());
        }
        let mut cleanup = Cleanup::new(self.context.name.as_str(), &self.log);
        while let Some(mut machine) = self.machines.pop() {
            cleanup.absorb(machine.destroy().await);
        }
        let teardown = self.context.provider.teardown().await;
        cleanup.step("release cluster resources", teardown);
        self.destroyed = true;
        info!(self.log, "cluster destroyed");
        cleanup.finish()
    }
}

impl Drop for Cluster {
    fn drop(&mut self) {
        if !self.destroyed {
            warn!(
                self.log,
                "cluster dropped without destroy; instances may leak";
                "machines" => self.machines.len()
            );
        }
    }
}

#[cfg(test)]
mod tests;
