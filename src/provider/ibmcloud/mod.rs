//! IBM Cloud VPC provider driven through `ibmcloud is`.
//!
//! Instances get a floating address on their primary interface. Tags are
//! attached through the global tagging service, so garbage collection
//! first searches tagged CRNs and then matches them against the instance
//! list for creation times.

use std::collections::HashSet;
use std::ffi::OsString;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use serde::Deserialize;
use slog::{Logger, debug, info, o};

use crate::command::{CommandRunner, os_args};
use crate::retry::{CancelSignal, Poll, wait_until_ready};

use super::cli::{VendorCli, path_arg, scratch_file};
use super::rollback::Rollback;
use super::{
    Addresses, ClusterIdentity, FloatingIp, GcSummary, Instance, InstanceRequest, Platform,
    Provider, ProviderError, ProviderFuture, is_expired, parse_address, parse_timestamp,
};

mod config;

pub use config::IbmCloudConfig;

const CREATED_BY_TAG: &str = "created-by:mantle";

/// IBM Cloud implementation of [`Provider`].
#[derive(Debug)]
pub struct IbmCloudProvider {
    config: IbmCloudConfig,
    cli: VendorCli,
    log: Logger,
    poll: Poll,
    key_id: OnceLock<Option<String>>,
}

#[derive(Debug, Deserialize)]
struct CreatedKey {
    id: String,
}

#[derive(Debug, Deserialize)]
struct VpcInstance {
    id: String,
    #[serde(default)]
    crn: String,
    #[serde(default)]
    status: String,
    created_at: Option<String>,
    primary_network_interface: Option<NetworkInterface>,
}

#[derive(Debug, Deserialize)]
struct NetworkInterface {
    id: String,
    primary_ip: Option<ReservedIp>,
}

#[derive(Debug, Deserialize)]
struct ReservedIp {
    address: String,
}

#[derive(Debug, Deserialize)]
struct ReservedFloatingIp {
    id: String,
    address: String,
}

#[derive(Debug, Deserialize)]
struct SearchResults {
    #[serde(default)]
    items: Vec<SearchItem>,
}

#[derive(Debug, Deserialize)]
struct SearchItem {
    crn: String,
}

impl VpcInstance {
    fn private_address(&self) -> Option<std::net::IpAddr> {
        parse_address(
            self.primary_network_interface
                .as_ref()
                .and_then(|nic| nic.primary_ip.as_ref())
                .map(|ip| ip.address.as_str()),
        )
    }
}

impl IbmCloudProvider {
    /// Creates the provider after validating `config`.
    ///
    /// # Errors
    ///
    /// Returns [`ProviderError::InvalidOptions`] when required settings are
    /// missing.
    pub fn new(
        config: IbmCloudConfig,
        runner: Arc<dyn CommandRunner>,
        log: &Logger,
    ) -> Result<Self, ProviderError> {
        config
            .validate()
            .map_err(|err| ProviderError::InvalidOptions {
                platform: Platform::IbmCloud,
                message: err.to_string(),
            })?;
        Ok(Self {
            cli: VendorCli::new(config.cli_bin.clone(), os_args(["--output", "json"]), runner),
            log: log.new(o!("platform" => "ibmcloud", "zone" => config.zone.clone())),
            config,
            poll: Poll::INSTANCE_BOOT,
            key_id: OnceLock::new(),
        })
    }

    /// Overrides the instance readiness budget.
    #[must_use]
    pub const fn with_poll(mut self, poll: Poll) -> Self {
        self.poll = poll;
        self
    }

    async fn do_setup(&self, identity: &ClusterIdentity) -> Result<(), ProviderError> {
        if self.key_id.get().is_some() {
            return Err(ProviderError::AlreadySetUp {
                platform: Platform::IbmCloud,
            });
        }
        self.cli
            .run(
                "target region",
                os_args(["target", "-r", self.config.region.as_str()]),
            )
            .await?;
        let key_id = match &identity.ssh_public_key {
            Some(key) => {
                let file = scratch_file("write public key", key)?;
                let mut args = os_args(["is", "key-create", identity.name.as_str()]);
                args.push(path_arg("@", &file));
                let created: CreatedKey = self.cli.json("create key", args).await?;
                Some(created.id)
            }
            None => None,
        };
        self.key_id
            .set(key_id)
            .map_err(|_| ProviderError::AlreadySetUp {
                platform: Platform::IbmCloud,
            })
    }

    async fn create(
        &self,
        request: &InstanceRequest,
        cancel: &CancelSignal,
    ) -> Result<Instance, ProviderError> {
        let user_data = scratch_file("write user-data", &request.user_data)?;
        let mut args = os_args([
            "is",
            "instance-create",
            request.name.as_str(),
            self.config.vpc.as_str(),
            self.config.zone.as_str(),
            self.config.profile.as_str(),
            self.config.subnet.as_str(),
            "--image",
            self.config.image.as_str(),
        ]);
        args.push(OsString::from("--user-data"));
        args.push(path_arg("@", &user_data));
        if let Some(key_id) = self.key_id.get().and_then(Option::as_deref) {
            args.extend(os_args(["--keys", key_id]));
        }
        let created: VpcInstance = self.cli.json("create instance", args).await?;
        debug!(self.log, "instance requested"; "instance" => &created.id);

        let mut rollback = Rollback::new(&self.cli, &self.log);
        rollback.push("delete instance", delete_instance_args(&created.id));

        match self.finish_create(&created, &request.name, &mut rollback, cancel).await {
            Ok((private, floating_ip)) => {
                rollback.commit();
                info!(self.log, "instance running"; "instance" => &created.id);
                Ok(Instance {
                    id: created.id,
                    name: request.name.clone(),
                    addresses: Addresses {
                        public: Some(floating_ip.address),
                        private,
                    },
                    floating_ip: Some(floating_ip),
                })
            }
            Err(err) => {
                rollback.unwind().await;
                Err(err)
            }
        }
    }

    async fn finish_create(
        &self,
        created: &VpcInstance,
        name: &str,
        rollback: &mut Rollback<'_>,
        cancel: &CancelSignal,
    ) -> Result<(Option<std::net::IpAddr>, FloatingIp), ProviderError> {
        self.cli
            .run(
                "tag instance",
                os_args([
                    "resource",
                    "tag-attach",
                    "--tag-names",
                    CREATED_BY_TAG,
                    "--resource-id",
                    created.crn.as_str(),
                ]),
            )
            .await?;

        let nic = created
            .primary_network_interface
            .as_ref()
            .ok_or_else(|| ProviderError::Parse {
                step: String::from("create instance"),
                message: String::from("no primary network interface"),
            })?;
        let fip_name = format!("{name}-fip");
        let reserved: ReservedFloatingIp = self
            .cli
            .json(
                "reserve floating ip",
                os_args([
                    "is",
                    "floating-ip-reserve",
                    fip_name.as_str(),
                    "--nic",
                    nic.id.as_str(),
                    "--in",
                    created.id.as_str(),
                ]),
            )
            .await?;
        rollback.push("release floating ip", release_ip_args(&reserved.id));
        let address = reserved.address.parse().map_err(|_| ProviderError::Parse {
            step: String::from("reserve floating ip"),
            message: format!("invalid address {:?}", reserved.address),
        })?;

        wait_until_ready(self.poll, cancel, || self.running(&created.id))
            .await
            .map_err(|err| ProviderError::readiness("wait for instance running", err))?;
        let private = self.show(&created.id).await?.private_address();
        Ok((
            private,
            FloatingIp {
                id: reserved.id,
                address,
            },
        ))
    }

    async fn show(&self, instance_id: &str) -> Result<VpcInstance, ProviderError> {
        self.cli
            .json("show instance", os_args(["is", "instance", instance_id]))
            .await
    }

    async fn running(&self, instance_id: &str) -> Result<bool, ProviderError> {
        let instance = self.show(instance_id).await?;
        match instance.status.as_str() {
            "running" => Ok(true),
            "failed" => Err(ProviderError::InstanceFailed {
                instance_id: instance.id,
                state: instance.status,
            }),
            _ => Ok(false),
        }
    }

    async fn terminate(&self, instance: &Instance) -> Result<(), ProviderError> {
        let released = match &instance.floating_ip {
            Some(ip) => self
                .cli
                .run("release floating ip", release_ip_args(&ip.id))
                .await
                .map(drop),
            None => Ok(()),
        };
        self.cli
            .run("delete instance", delete_instance_args(&instance.id))
            .await?;
        released
    }

    async fn collect_garbage(&self, grace_period: Duration) -> Result<GcSummary, ProviderError> {
        let query = format!("tags:\"{CREATED_BY_TAG}\" AND type:instance");
        let tagged: SearchResults = self
            .cli
            .json(
                "search tagged instances",
                os_args(["resource", "search", query.as_str()]),
            )
            .await?;
        let crns: HashSet<String> = tagged.items.into_iter().map(|item| item.crn).collect();
        let instances: Vec<VpcInstance> = self
            .cli
            .json("list instances", os_args(["is", "instances"]))
            .await?;

        let now = chrono::Utc::now();
        let mut summary = GcSummary::default();
        for instance in instances.into_iter().filter(|i| crns.contains(&i.crn)) {
            let expired = match instance.created_at.as_deref() {
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
            if expired && instance.status != "deleting" {
                let deleted = self
                    .cli
                    .run("delete expired instance", delete_instance_args(&instance.id))
                    .await;
                match deleted {
                    Ok(_) => summary.terminated.push(instance.id),
                    Err(err) => summary.record_failure(
                        &self.log,
                        &instance.id,
                        "delete expired instance",
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

fn delete_instance_args(instance_id: &str) -> Vec<OsString> {
    os_args(["is", "instance-delete", instance_id, "--force"])
}

fn release_ip_args(fip_id: &str) -> Vec<OsString> {
    os_args(["is", "floating-ip-release", fip_id, "--force"])
}

impl Provider for IbmCloudProvider {
    fn platform(&self) -> Platform {
        Platform::IbmCloud
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
            let current = self.show(&instance.id).await?;
            Ok(Addresses {
                public: instance.floating_ip.as_ref().map(|ip| ip.address),
                private: current.private_address(),
            })
        })
    }

    fn console_output<'a>(&'a self, _instance: &'a Instance) -> ProviderFuture<'a, Vec<u8>> {
        Box::pin(async { Ok(Vec::new()) })
    }

    fn terminate_instance<'a>(&'a self, instance: &'a Instance) -> ProviderFuture<'a, ()> {
        Box::pin(self.terminate(instance))
    }

    fn teardown(&self) -> ProviderFuture<'_, ()> {
        Box::pin(async move {
            if let Some(key_id) = self.key_id.get().and_then(Option::as_deref) {
                self.cli
                    .run(
                        "delete key",
                        os_args(["is", "key-delete", key_id, "--force"]),
                    )
                    .await?;
            }
            Ok(())
        })
    }

    fn gc(&self, grace_period: Duration) -> ProviderFuture<'_, GcSummary> {
        Box::pin(self.collect_garbage(grace_period))
    }
}

#[cfg(test)]
mod tests;
