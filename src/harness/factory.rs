//! Builds one cluster per test.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use camino::Utf8PathBuf;
use slog::Logger;

use crate::cluster::{Cluster, ClusterError, ClusterOptions};
use crate::command::CommandRunner;
use crate::provider::{self, ProviderConfig};
use crate::retry::{CancelSignal, Poll};
use crate::ssh::SshExecutor;

/// Future returned by [`ClusterFactory::create`].
pub type ClusterFuture<'a> =
    Pin<Box<dyn Future<Output = Result<Cluster, ClusterError>> + Send + 'a>>;

/// Source of fresh clusters for the harness.
pub trait ClusterFactory: fmt::Debug + Send + Sync {
    /// Creates and sets up a cluster for the test called `test`.
    fn create<'a>(&'a self, test: &'a str, cancel: &'a CancelSignal) -> ClusterFuture<'a>;
}

/// Creates clusters backed by the configured cloud provider.
///
/// Every cluster gets its own provider instance so that per-cluster setup
/// state (keys, networks) is never shared between tests.
#[derive(Debug)]
pub struct ProviderClusterFactory {
    config: ProviderConfig,
    runner: Arc<dyn CommandRunner>,
    ssh: Arc<dyn SshExecutor>,
    base_name: String,
    output_dir: Utf8PathBuf,
    ssh_public_key: Option<String>,
    boot_poll: Poll,
    no_ssh_key_in_metadata: bool,
    log: Logger,
}

impl ProviderClusterFactory {
    /// Creates a factory writing artefacts below `output_dir`.
    #[must_use]
    pub fn new(
        config: ProviderConfig,
        runner: Arc<dyn CommandRunner>,
        ssh: Arc<dyn SshExecutor>,
        output_dir: Utf8PathBuf,
        log: &Logger,
    ) -> Self {
        Self {
            config,
            runner,
            ssh,
            base_name: String::from("kola"),
            output_dir,
            ssh_public_key: None,
            boot_poll: Poll::INSTANCE_BOOT,
            no_ssh_key_in_metadata: false,
            log: log.clone(),
        }
    }

    /// Sets the prefix of cluster names.
    #[must_use]
    pub fn with_base_name(mut self, base_name: impl Into<String>) -> Self {
        self.base_name = base_name.into();
        self
    }

    /// Registers `key` with the provider for every cluster.
    #[must_use]
    pub fn with_ssh_public_key(mut self, key: Option<String>) -> Self {
        self.ssh_public_key = key;
        self
    }

    /// Overrides the machine boot budget.
    #[must_use]
    pub const fn with_boot_poll(mut self, poll: Poll) -> Self {
        self.boot_poll = poll;
        self
    }

    /// Keeps the key out of provider metadata.
    #[must_use]
    pub const fn with_no_ssh_key_in_metadata(mut self, enabled: bool) -> Self {
        self.no_ssh_key_in_metadata = enabled;
        self
    }

    fn cluster_name(&self) -> String {
        let suffix: String = uuid::Uuid::new_v4().simple().to_string().chars().take(8).collect();
        format!("{}-{suffix}", self.base_name)
    }
}

impl ClusterFactory for ProviderClusterFactory {
    fn create<'a>(&'a self, test: &'a str, cancel: &'a CancelSignal) -> ClusterFuture<'a> {
        Box::pin(async move {
            let name = self.cluster_name();
            let provider = provider::build(self.config.clone(), Arc::clone(&self.runner), &self.log)
                .map_err(|source| ClusterError::Setup {
                    cluster: name.clone(),
                    source,
                })?;
            let options = ClusterOptions {
                name,
                output_dir: self.output_dir.join(test),
                ssh_public_key: self.ssh_public_key.clone(),
                boot_poll: self.boot_poll,
                no_ssh_key_in_metadata: self.no_ssh_key_in_metadata,
                cancel: cancel.clone(),
            };
            Cluster::new(options, provider, Arc::clone(&self.ssh), &self.log).await
        })
    }
}
