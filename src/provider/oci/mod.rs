//! Oracle Cloud Infrastructure provider driven through the `oci` CLI.
//!
//! The serial console is captured into a console history object, read
//! back once it settles and then deleted again.

use std::collections::HashMap;
use std::ffi::OsString;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use serde::Deserialize;
use slog::{Logger, debug, info, o, warn};
use tempfile::NamedTempFile;

use crate::command::{CommandRunner, os_args};
use crate::retry::{CancelSignal, Poll, poll_for};

use super::cli::{VendorCli, scratch_file};
use super::rollback::Rollback;
use super::{
    Addresses, ClusterIdentity, GcSummary, Instance, InstanceRequest, Platform, Provider,
    ProviderError, ProviderFuture, is_expired, parse_address, parse_timestamp,
};

mod config;

pub use config::OciConfig;

const CREATED_BY_TAG_KEY: &str = "created-by";
const CREATED_BY_TAG_VALUE: &str = "mantle";

/// OCI implementation of [`Provider`].
#[derive(Debug)]
pub struct OciProvider {
    config: OciConfig,
    cli: VendorCli,
    log: Logger,
    poll: Poll,
    console_poll: Poll,
    ssh_key_file: OnceLock<Option<NamedTempFile>>,
}

#[derive(Debug, Deserialize)]
struct Envelope<T> {
    data: T,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "kebab-case")]
struct OciInstance {
    id: String,
    lifecycle_state: String,
    time_created: Option<String>,
    #[serde(default)]
    freeform_tags: HashMap<String, String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "kebab-case")]
struct Vnic {
    public_ip: Option<String>,
    private_ip: Option<String>,
    #[serde(default)]
    is_primary: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "kebab-case")]
struct ConsoleHistory {
    id: String,
    lifecycle_state: String,
}

impl OciInstance {
    fn created_by_mantle(&self) -> bool {
        self.freeform_tags
            .get(CREATED_BY_TAG_KEY)
            .is_some_and(|value| value == CREATED_BY_TAG_VALUE)
    }

    fn is_stopping(&self) -> bool {
        matches!(self.lifecycle_state.as_str(), "TERMINATING" | "TERMINATED")
    }
}

impl OciProvider {
    /// Creates the provider after validating `config`.
    ///
    /// # Errors
    ///
    /// Returns [`ProviderError::InvalidOptions`] when required settings are
    /// missing.
    pub fn new(
        config: OciConfig,
        runner: Arc<dyn CommandRunner>,
        log: &Logger,
    ) -> Result<Self, ProviderError> {
        config
            .validate()
            .map_err(|err| ProviderError::InvalidOptions {
                platform: Platform::Oci,
                message: err.to_string(),
            })?;
        let leading = config
            .profile
            .as_deref()
            .map(|profile| os_args(["--profile", profile]))
            .unwrap_or_default();
        let cli =
            VendorCli::new(config.cli_bin.clone(), Vec::new(), runner).with_leading_args(leading);
        Ok(Self {
            cli,
            log: log.new(o!("platform" => "oci")),
            config,
            poll: Poll::INSTANCE_BOOT,
            console_poll: Poll::SERVICE,
            ssh_key_file: OnceLock::new(),
        })
    }

    /// Overrides the instance readiness budget.
    #[must_use]
    pub const fn with_poll(mut self, poll: Poll) -> Self {
        self.poll = poll;
        self
    }

    /// Overrides the console capture budget.
    #[must_use]
    pub const fn with_console_poll(mut self, poll: Poll) -> Self {
        self.console_poll = poll;
        self
    }

    fn do_setup(&self, identity: &ClusterIdentity) -> Result<(), ProviderError> {
        if self.ssh_key_file.get().is_some() {
            return Err(ProviderError::AlreadySetUp {
                platform: Platform::Oci,
            });
        }
        let file = identity
            .ssh_public_key
            .as_deref()
            .map(|key| scratch_file("write public key", key))
            .transpose()?;
        self.ssh_key_file
            .set(file)
            .map_err(|_| ProviderError::AlreadySetUp {
                platform: Platform::Oci,
            })
    }

    async fn create(
        &self,
        request: &InstanceRequest,
        cancel: &CancelSignal,
    ) -> Result<Instance, ProviderError> {
        let user_data = scratch_file("write user-data", &request.user_data)?;
        let tags = format!(r#"{{"{CREATED_BY_TAG_KEY}":"{CREATED_BY_TAG_VALUE}"}}"#);
        let mut args = os_args([
            "compute",
            "instance",
            "launch",
            "--compartment-id",
            self.config.compartment.as_str(),
            "--availability-domain",
            self.config.availability_domain.as_str(),
            "--shape",
            self.config.shape.as_str(),
            "--image-id",
            self.config.image.as_str(),
            "--subnet-id",
            self.config.subnet.as_str(),
            "--display-name",
            request.name.as_str(),
            "--assign-public-ip",
            "true",
            "--freeform-tags",
            tags.as_str(),
            "--user-data-file",
        ]);
        args.push(user_data.path().as_os_str().to_owned());
        if let Some(key_file) = self.ssh_key_file.get().and_then(Option::as_ref) {
            args.push(OsString::from("--ssh-authorized-keys-file"));
            args.push(key_file.path().as_os_str().to_owned());
        }
        let launched: Envelope<OciInstance> = self.cli.json("launch instance", args).await?;
        let instance_id = launched.data.id;
        debug!(self.log, "instance launched"; "instance" => &instance_id);

        let mut rollback = Rollback::new(&self.cli, &self.log);
        rollback.push("terminate instance", terminate_args(&instance_id));

        match poll_for(self.poll, cancel, || self.running_addresses(&instance_id)).await {
            Ok(addresses) => {
                rollback.commit();
                info!(self.log, "instance running"; "instance" => &instance_id);
                Ok(Instance {
                    id: instance_id,
                    name: request.name.clone(),
                    addresses,
                    floating_ip: None,
                })
            }
            Err(err) => {
                rollback.unwind().await;
                Err(ProviderError::readiness("wait for instance running", err))
            }
        }
    }

    async fn get(&self, instance_id: &str) -> Result<OciInstance, ProviderError> {
        let shown: Envelope<OciInstance> = self
            .cli
            .json(
                "get instance",
                os_args(["compute", "instance", "get", "--instance-id", instance_id]),
            )
            .await?;
        Ok(shown.data)
    }

    async fn running_addresses(
        &self,
        instance_id: &str,
    ) -> Result<Option<Addresses>, ProviderError> {
        let instance = self.get(instance_id).await?;
        if instance.is_stopping() {
            return Err(ProviderError::InstanceFailed {
                instance_id: instance.id,
                state: instance.lifecycle_state,
            });
        }
        if instance.lifecycle_state != "RUNNING" {
            return Ok(None);
        }
        let addresses = self.primary_addresses(instance_id).await?;
        Ok(addresses.public.is_some().then_some(addresses))
    }

    async fn primary_addresses(&self, instance_id: &str) -> Result<Addresses, ProviderError> {
        let vnics: Envelope<Vec<Vnic>> = self
            .cli
            .json(
                "list vnics",
                os_args([
                    "compute",
                    "instance",
                    "list-vnics",
                    "--instance-id",
                    instance_id,
                ]),
            )
            .await?;
        Ok(vnics
            .data
            .iter()
            .find(|vnic| vnic.is_primary)
            .or_else(|| vnics.data.first())
            .map(|vnic| Addresses {
                public: parse_address(vnic.public_ip.as_deref()),
                private: parse_address(vnic.private_ip.as_deref()),
            })
            .unwrap_or_default())
    }

    async fn capture_console(&self, instance: &Instance) -> Result<Vec<u8>, ProviderError> {
        let captured: Envelope<ConsoleHistory> = self
            .cli
            .json(
                "capture console history",
                os_args([
                    "compute",
                    "console-history",
                    "capture",
                    "--instance-id",
                    instance.id.as_str(),
                ]),
            )
            .await?;
        let history_id = captured.data.id;
        let content = self.read_history(&history_id).await;
        if let Err(err) = self
            .cli
            .run(
                "delete console history",
                history_args("delete", &history_id, &["--force"]),
            )
            .await
        {
            warn!(
                self.log,
                "console history left behind";
                "history" => &history_id,
                "error" => %err
            );
        }
        content
    }

    async fn read_history(&self, history_id: &str) -> Result<Vec<u8>, ProviderError> {
        poll_for(self.console_poll, &CancelSignal::never(), || async {
            let shown: Envelope<ConsoleHistory> = self
                .cli
                .json("get console history", history_args("get", history_id, &[]))
                .await?;
            match shown.data.lifecycle_state.as_str() {
                "SUCCEEDED" => Ok(Some(())),
                "FAILED" => Err(ProviderError::Parse {
                    step: String::from("get console history"),
                    message: format!("console history {} failed", shown.data.id),
                }),
                _ => Ok(None),
            }
        })
        .await
        .map_err(|err| ProviderError::readiness("wait for console history", err))?;
        let content = self
            .cli
            .run(
                "read console history",
                history_args("get-content", history_id, &["--file", "-"]),
            )
            .await?;
        Ok(content.into_bytes())
    }

    async fn collect_garbage(&self, grace_period: Duration) -> Result<GcSummary, ProviderError> {
        let listed: Envelope<Vec<OciInstance>> = self
            .cli
            .json(
                "list instances",
                os_args([
                    "compute",
                    "instance",
                    "list",
                    "--compartment-id",
                    self.config.compartment.as_str(),
                    "--all",
                ]),
            )
            .await?;
        let now = chrono::Utc::now();
        let mut summary = GcSummary::default();
        for instance in listed.data.into_iter().filter(OciInstance::created_by_mantle) {
            let expired = match instance.time_created.as_deref() {
                Some(created) => match parse_timestamp("list instances", created) {
                    Ok(stamp) => is_expired(stamp, now, grace_period),
                    Err(err) => {
                        summary.record_failure(
                            &self.log,
                            &instance.id,
                            "read creation time",
                            &err,
                        );
                        continue;
                    }
                },
                None => false,
            };
            if expired && !instance.is_stopping() {
                let terminated = self
                    .cli
                    .run("terminate expired instance", terminate_args(&instance.id))
                    .await;
                match terminated {
                    Ok(_) => summary.terminated.push(instance.id),
                    Err(err) => summary.record_failure(
                        &self.log,
                        &instance.id,
                        "terminate expired instance",
                        &err,
                    ),
                }
            } else {
                summary.skipped += 1;
            }
        }
        Ok(summary)
    }
}

fn terminate_args(instance_id: &str) -> Vec<OsString> {
    os_args([
        "compute",
        "instance",
        "terminate",
        "--instance-id",
        instance_id,
        "--force",
    ])
}

fn history_args(action: &str, history_id: &str, extra: &[&str]) -> Vec<OsString> {
    let mut args = os_args([
        "compute",
        "console-history",
        action,
        "--instance-console-history-id",
        history_id,
    ]);
    args.extend(os_args(extra.iter().copied()));
    args
}

impl Provider for OciProvider {
    fn platform(&self) -> Platform {
        Platform::Oci
    }

    fn setup<'a>(&'a self, identity: &'a ClusterIdentity) -> ProviderFuture<'a, ()> {
        Box::pin(async move { self.do_setup(identity) })
    }

    fn create_instance<'a>(
        &'a self,
        request: &'a InstanceRequest,
        cancel: &'a CancelSignal,
    ) -> ProviderFuture<'a, Instance> {
        Box::pin(self.create(request, cancel))
    }

    fn refresh_addresses<'a>(&'a self, instance: &'a Instance) -> ProviderFuture<'a, Addresses> {
        Box::pin(self.primary_addresses(&instance.id))
    }

    fn console_output<'a>(&'a self, instance: &'a Instance) -> ProviderFuture<'a, Vec<u8>> {
        Box::pin(self.capture_console(instance))
    }

    fn terminate_instance<'a>(&'a self, instance: &'a Instance) -> ProviderFuture<'a, ()> {
        Box::pin(async move {
            self.cli
                .run("terminate instance", terminate_args(&instance.id))
                .await
                .map(drop)
        })
    }

    fn teardown(&self) -> ProviderFuture<'_, ()> {
        Box::pin(async { Ok(()) })
    }

    fn gc(&self, grace_period: Duration) -> ProviderFuture<'_, GcSummary> {
        Box::pin(self.collect_garbage(grace_period))
    }
}
