//! Azure provider driven through the `az` CLI.
//!
//! Every cluster gets its own resource group holding a `kola-vn` virtual
//! network. Deleting the group at teardown releases everything the cluster
//! created. Instances are addressed by VM name inside that group.

use std::collections::HashMap;
use std::ffi::OsString;
use std::sync::{Arc, LazyLock, OnceLock};
use std::time::Duration;

use serde::Deserialize;
use slog::{Logger, debug, info, o};

use crate::command::{CommandRunner, os_args};
use crate::retry::{CancelSignal, Poll, poll_for};

use super::cli::{VendorCli, scratch_file};
use super::locks::lock_named;
use super::rollback::Rollback;
use super::{
    Addresses, ClusterIdentity, GcSummary, Instance, InstanceRequest, Platform, Provider,
    ProviderError, ProviderFuture, is_expired, parse_address, parse_timestamp,
};

mod config;

pub use config::AzureConfig;

const VNET_NAME: &str = "kola-vn";
const SUBNET_NAME: &str = "kola-subnet";
const CREATED_BY_TAG: &str = "createdBy=mantle";
const HTTP_TIMEOUT: Duration = Duration::from_secs(30);

static HTTP_CLIENT: LazyLock<reqwest::Client> = LazyLock::new(|| {
    reqwest::Client::builder()
        .timeout(HTTP_TIMEOUT)
        .build()
        .unwrap_or_else(|_| reqwest::Client::new())
});

#[derive(Debug)]
struct Shared {
    resource_group: String,
    ssh_public_key: Option<String>,
}

/// Azure implementation of [`Provider`].
#[derive(Debug)]
pub struct AzureProvider {
    config: AzureConfig,
    cli: VendorCli,
    log: Logger,
    poll: Poll,
    shared: OnceLock<Shared>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct VmDetails {
    provisioning_state: Option<String>,
    public_ips: Option<String>,
    private_ips: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BootLogUris {
    serial_console_log_blob_uri: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ResourceGroup {
    name: String,
    #[serde(default)]
    tags: Option<HashMap<String, String>>,
}

impl VmDetails {
    fn addresses(&self) -> Addresses {
        Addresses {
            public: first_address(self.public_ips.as_deref()),
            private: first_address(self.private_ips.as_deref()),
        }
    }
}

/// `vm show -d` reports comma separated address lists.
fn first_address(list: Option<&str>) -> Option<std::net::IpAddr> {
    parse_address(list.and_then(|text| text.split(',').next()))
}

impl AzureProvider {
    /// Creates the provider after validating `config`.
    ///
    /// # Errors
    ///
    /// Returns [`ProviderError::InvalidOptions`] when required settings are
    /// missing.
    pub fn new(
        config: AzureConfig,
        runner: Arc<dyn CommandRunner>,
        log: &Logger,
    ) -> Result<Self, ProviderError> {
        config
            .validate()
            .map_err(|err| ProviderError::InvalidOptions {
                platform: Platform::Azure,
                message: err.to_string(),
            })?;
        let mut global_args = os_args(["--output", "json"]);
        if let Some(subscription) = &config.subscription {
            global_args.extend(os_args(["--subscription", subscription.as_str()]));
        }
        Ok(Self {
            cli: VendorCli::new(config.cli_bin.clone(), global_args, runner),
            log: log.new(o!("platform" => "azure", "location" => config.location.clone())),
            config,
            poll: Poll::AZURE_PROVISION,
            shared: OnceLock::new(),
        })
    }

    /// Overrides the VM provisioning budget.
    #[must_use]
    pub const fn with_poll(mut self, poll: Poll) -> Self {
        self.poll = poll;
        self
    }

    fn shared(&self) -> Result<&Shared, ProviderError> {
        self.shared.get().ok_or(ProviderError::NotSetUp {
            platform: Platform::Azure,
        })
    }

    async fn do_setup(&self, identity: &ClusterIdentity) -> Result<(), ProviderError> {
        if self.shared.get().is_some() {
            return Err(ProviderError::AlreadySetUp {
                platform: Platform::Azure,
            });
        }
        let group = identity.name.as_str();
        let _guard = lock_named(&format!("azure-resource-group-{group}")).await;
        let created_at = format!("createdAt={}", chrono::Utc::now().to_rfc3339());
        self.cli
            .run(
                "create resource group",
                os_args([
                    "group",
                    "create",
                    "--name",
                    group,
                    "--location",
                    self.config.location.as_str(),
                    "--tags",
                    CREATED_BY_TAG,
                    created_at.as_str(),
                ]),
            )
            .await?;
        info!(self.log, "created resource group"; "group" => group);

        let mut rollback = Rollback::new(&self.cli, &self.log);
        rollback.push("delete resource group", delete_group_args(group));
        let vnet = self
            .cli
            .run(
                "create virtual network",
                os_args([
                    "network",
                    "vnet",
                    "create",
                    "--resource-group",
                    group,
                    "--name",
                    VNET_NAME,
                    "--address-prefixes",
                    "10.0.0.0/16",
                    "--subnet-name",
                    SUBNET_NAME,
                    "--subnet-prefixes",
                    "10.0.0.0/24",
                ]),
            )
            .await;
        if let Err(err) = vnet {
            rollback.unwind().await;
            return Err(err);
        }
        rollback.commit();

        self.shared
            .set(Shared {
                resource_group: group.to_owned(),
                ssh_public_key: identity.ssh_public_key.clone(),
            })
            .map_err(|_| ProviderError::AlreadySetUp {
                platform: Platform::Azure,
            })
    }

    async fn create(
        &self,
        request: &InstanceRequest,
        cancel: &CancelSignal,
    ) -> Result<Instance, ProviderError> {
        let shared = self.shared()?;
        let group = shared.resource_group.as_str();
        let custom_data = scratch_file("write custom data", &request.user_data)?;

        let mut args = os_args([
            "vm",
            "create",
            "--resource-group",
            group,
            "--name",
            request.name.as_str(),
            "--image",
            self.config.image.as_str(),
            "--size",
            self.config.size.as_str(),
            "--admin-username",
            self.config.admin_user.as_str(),
            "--vnet-name",
            VNET_NAME,
            "--subnet",
            SUBNET_NAME,
            "--tags",
            CREATED_BY_TAG,
            "--no-wait",
        ]);
        args.push(OsString::from("--custom-data"));
        args.push(custom_data.path().as_os_str().to_owned());
        match &shared.ssh_public_key {
            Some(key) => args.extend(os_args(["--ssh-key-values", key.as_str()])),
            None => args.push(OsString::from("--generate-ssh-keys")),
        }
        self.cli.run("create vm", args).await?;
        debug!(self.log, "vm requested"; "vm" => &request.name);

        let mut rollback = Rollback::new(&self.cli, &self.log);
        rollback.push("delete vm", delete_vm_args(group, &request.name));

        let waited = poll_for(self.poll, cancel, || self.provisioned(group, &request.name)).await;
        match waited {
            Ok(addresses) => {
                rollback.commit();
                info!(self.log, "vm provisioned"; "vm" => &request.name);
                Ok(Instance {
                    id: request.name.clone(),
                    name: request.name.clone(),
                    addresses,
                    floating_ip: None,
                })
            }
            Err(err) => {
                rollback.unwind().await;
                Err(ProviderError::readiness("wait for vm provisioning", err))
            }
        }
    }

    async fn show(&self, group: &str, name: &str) -> Result<VmDetails, ProviderError> {
        self.cli
            .json(
                "show vm",
                os_args([
                    "vm",
                    "show",
                    "--resource-group",
                    group,
                    "--name",
                    name,
                    "--show-details",
                ]),
            )
            .await
    }

    async fn provisioned(
        &self,
        group: &str,
        name: &str,
    ) -> Result<Option<Addresses>, ProviderError> {
        let details = self.show(group, name).await?;
        match details.provisioning_state.as_deref() {
            Some("Succeeded") => {
                let addresses = details.addresses();
                Ok(addresses.public.is_some().then_some(addresses))
            }
            Some(state @ ("Failed" | "Canceled")) => Err(ProviderError::InstanceFailed {
                instance_id: name.to_owned(),
                state: state.to_owned(),
            }),
            _ => Ok(None),
        }
    }

    async fn console(&self, instance: &Instance) -> Result<Vec<u8>, ProviderError> {
        let group = self.shared()?.resource_group.as_str();
        let uris: BootLogUris = self
            .cli
            .json(
                "get boot log uris",
                os_args([
                    "vm",
                    "boot-diagnostics",
                    "get-boot-log-uris",
                    "--resource-group",
                    group,
                    "--name",
                    instance.name.as_str(),
                ]),
            )
            .await?;
        let Some(uri) = uris.serial_console_log_blob_uri else {
            return Ok(Vec::new());
        };
        let http_error = |err: reqwest::Error| ProviderError::Http {
            step: String::from("download serial console"),
            message: err.to_string(),
        };
        let response = HTTP_CLIENT
            .get(&uri)
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .map_err(http_error)?;
        Ok(response.bytes().await.map_err(http_error)?.to_vec())
    }

    async fn collect_garbage(&self, grace_period: Duration) -> Result<GcSummary, ProviderError> {
        let groups: Vec<ResourceGroup> = self
            .cli
            .json(
                "list tagged resource groups",
                os_args(["group", "list", "--tag", CREATED_BY_TAG]),
            )
            .await?;
        let now = chrono::Utc::now();
        let mut summary = GcSummary::default();
        for group in groups {
            let created = group
                .tags
                .as_ref()
                .and_then(|tags| tags.get("createdAt"))
                .map(|stamp| parse_timestamp("list tagged resource groups", stamp));
            match created {
                Some(Ok(stamp)) if is_expired(stamp, now, grace_period) => {
                    let mut args = delete_group_args(&group.name);
                    args.push(OsString::from("--no-wait"));
                    match self.cli.run("delete expired resource group", args).await {
                        Ok(_) => summary.terminated.push(group.name),
                        Err(err) => summary.record_failure(
                            &self.log,
                            &group.name,
                            "delete expired resource group",
                            &err,
                        ),
                    }
                }
                Some(Err(err)) => {
                    summary.record_failure(&self.log, &group.name, "read createdAt", &err);
                }
                _ => summary.skipped += 1,
            }
        }
        Ok(summary)
    }
}

fn delete_group_args(group: &str) -> Vec<OsString> {
    os_args(["group", "delete", "--name", group, "--yes"])
}

fn delete_vm_args(group: &str, name: &str) -> Vec<OsString> {
    os_args(["vm", "delete", "--resource-group", group, "--name", name, "--yes"])
}

impl Provider for AzureProvider {
    fn platform(&self) -> Platform {
        Platform::Azure
    }

    fn setup<'a>(&'a self, identity: &'a ClusterIdentity) -> ProviderFuture<'a, ()> {
        Box::pin(self.do_setup(identity))
    }

    fn create_instance<'a>(
        &'a self,
        request: &'a InstanceRequest,
        cancel: &'a CancelSignal,
    ) -> ProviderFuture<'a, Instance> {
        Box::pin(self.create(request, cancel))
    }

    fn refresh_addresses<'a>(&'a self, instance: &'a Instance) -> ProviderFuture<'a, Addresses> {
        Box::pin(async move {
            let group = self.shared()?.resource_group.as_str();
            Ok(self.show(group, &instance.name).await?.addresses())
        })
    }

    fn console_output<'a>(&'a self, instance: &'a Instance) -> ProviderFuture<'a, Vec<u8>> {
        Box::pin(self.console(instance))
    }

    fn terminate_instance<'a>(&'a self, instance: &'a Instance) -> ProviderFuture<'a, ()> {
        Box::pin(async move {
            let group = self.shared()?.resource_group.as_str();
            self.cli
                .run("delete vm", delete_vm_args(group, &instance.name))
                .await
                .map(drop)
        })
    }

    fn teardown(&self) -> ProviderFuture<'_, ()> {
        Box::pin(async move {
            let Some(shared) = self.shared.get() else {
                return Ok(());
            };
            self.cli
                .run(
                    "delete resource group",
                    delete_group_args(&shared.resource_group),
                )
                .await
                .map(drop)
        })
    }

    fn gc(&self, grace_period: Duration) -> ProviderFuture<'_, GcSummary> {
        Box::pin(self.collect_garbage(grace_period))
    }
}

#[cfg(test)]
mod tests;
