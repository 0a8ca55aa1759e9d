//! Packet (Equinix Metal) provider driven through the `metal` CLI.
//!
//! Bare metal devices take several minutes to provision and expose no
//! serial console through the API, so console output is always empty.

use std::ffi::OsString;
use std::net::IpAddr;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use serde::Deserialize;
use slog::{Logger, debug, info, o};

use crate::command::{CommandRunner, os_args};
use crate::retry::{CancelSignal, Poll, poll_for};

use super::cli::{VendorCli, path_arg, scratch_file};
use super::rollback::Rollback;
use super::{
    Addresses, ClusterIdentity, GcSummary, Instance, InstanceRequest, Platform, Provider,
    ProviderError, ProviderFuture, is_expired, parse_timestamp,
};

mod config;

pub use config::PacketConfig;

const CREATED_BY_TAG: &str = "created-by:mantle";

/// Packet implementation of [`Provider`].
#[derive(Debug)]
pub struct PacketProvider {
    config: PacketConfig,
    cli: VendorCli,
    log: Logger,
    poll: Poll,
    key_id: OnceLock<Option<String>>,
}

#[derive(Debug, Deserialize)]
struct Created {
    id: String,
}

#[derive(Debug, Deserialize)]
struct Device {
    id: String,
    state: String,
    #[serde(default)]
    tags: Vec<String>,
    created_at: Option<String>,
    #[serde(default)]
    ip_addresses: Vec<DeviceAddress>,
}

#[derive(Debug, Deserialize)]
struct DeviceAddress {
    address: String,
    public: bool,
    address_family: u8,
}

impl Device {
    fn ipv4(&self, public: bool) -> Option<IpAddr> {
        self.ip_addresses
            .iter()
            .filter(|entry| entry.address_family == 4 && entry.public == public)
            .find_map(|entry| entry.address.parse().ok())
    }

    fn addresses(&self) -> Addresses {
        Addresses {
            public: self.ipv4(true),
            private: self.ipv4(false),
        }
    }
}

impl PacketProvider {
    /// Creates the provider after validating `config`.
    ///
    /// # Errors
    ///
    /// Returns [`ProviderError::InvalidOptions`] when required settings are
    /// missing.
    pub fn new(
        config: PacketConfig,
        runner: Arc<dyn CommandRunner>,
        log: &Logger,
    ) -> Result<Self, ProviderError> {
        config
            .validate()
            .map_err(|err| ProviderError::InvalidOptions {
                platform: Platform::Packet,
                message: err.to_string(),
            })?;
        Ok(Self {
            cli: VendorCli::new(config.cli_bin.clone(), os_args(["--output", "json"]), runner),
            log: log.new(o!("platform" => "packet", "metro" => config.metro.clone())),
            config,
            poll: Poll::INSTANCE_BOOT,
            key_id: OnceLock::new(),
        })
    }

    /// Overrides the device readiness budget.
    #[must_use]
    pub const fn with_poll(mut self, poll: Poll) -> Self {
        self.poll = poll;
        self
    }

    async fn do_setup(&self, identity: &ClusterIdentity) -> Result<(), ProviderError> {
        if self.key_id.get().is_some() {
            return Err(ProviderError::AlreadySetUp {
                platform: Platform::Packet,
            });
        }
        let key_id = match &identity.ssh_public_key {
            Some(key) => {
                let created: Created = self
                    .cli
                    .json(
                        "create ssh key",
                        os_args([
                            "ssh-key",
                            "create",
                            "--key",
                            key.as_str(),
                            "--label",
                            identity.name.as_str(),
                        ]),
                    )
                    .await?;
                Some(created.id)
            }
            None => None,
        };
        self.key_id
            .set(key_id)
            .map_err(|_| ProviderError::AlreadySetUp {
                platform: Platform::Packet,
            })
    }

    async fn create(
        &self,
        request: &InstanceRequest,
        cancel: &CancelSignal,
    ) -> Result<Instance, ProviderError> {
        let user_data = scratch_file("write user-data", &request.user_data)?;
        let mut args = os_args([
            "device",
            "create",
            "--project-id",
            self.config.project.as_str(),
            "--hostname",
            request.name.as_str(),
            "--plan",
            self.config.plan.as_str(),
            "--metro",
            self.config.metro.as_str(),
            "--operating-system",
            self.config.operating_system.as_str(),
            "--tags",
            CREATED_BY_TAG,
        ]);
        args.push(OsString::from("--userdata-file"));
        args.push(path_arg("", &user_data));
        let created: Created = self.cli.json("create device", args).await?;
        debug!(self.log, "device requested"; "device" => &created.id);

        let mut rollback = Rollback::new(&self.cli, &self.log);
        rollback.push("delete device", delete_device_args(&created.id));

        let ready = poll_for(self.poll, cancel, || self.active(&created.id))
            .await
            .map_err(|err| ProviderError::readiness("wait for device active", err))
            .and_then(|device| require_addresses(&device));
        match ready {
            Ok(addresses) => {
                rollback.commit();
                info!(self.log, "device active"; "device" => &created.id);
                Ok(Instance {
                    id: created.id,
                    name: request.name.clone(),
                    addresses,
                    floating_ip: None,
                })
            }
            Err(err) => {
                rollback.unwind().await;
                Err(err)
            }
        }
    }

    async fn get(&self, device_id: &str) -> Result<Device, ProviderError> {
        self.cli
            .json("get device", os_args(["device", "get", "--id", device_id]))
            .await
    }

    async fn active(&self, device_id: &str) -> Result<Option<Device>, ProviderError> {
        let device = self.get(device_id).await?;
        match device.state.as_str() {
            "active" => Ok(Some(device)),
            "failed" => Err(ProviderError::InstanceFailed {
                instance_id: device.id,
                state: device.state,
            }),
            _ => Ok(None),
        }
    }

    async fn collect_garbage(&self, grace_period: Duration) -> Result<GcSummary, ProviderError> {
        let devices: Vec<Device> = self
            .cli
            .json(
                "list devices",
                os_args(["device", "get", "--project-id", self.config.project.as_str()]),
            )
            .await?;
        let now = chrono::Utc::now();
        let mut summary = GcSummary::default();
        for device in devices
            .into_iter()
            .filter(|device| device.tags.iter().any(|tag| tag == CREATED_BY_TAG))
        {
            let expired = match device.created_at.as_deref() {
                Some(created) => match parse_timestamp("list devices", created) {
                    Ok(stamp) => is_expired(stamp, now, grace_period),
                    Err(err) => {
                        summary.record_failure(&self.log, &device.id, "read creation time", &err);
                        continue;
                    }
                },
                None => false,
            };
            if expired && device.state != "deprovisioning" {
                let deleted = self
                    .cli
                    .run("delete expired device", delete_device_args(&device.id))
                    .await;
                match deleted {
                    Ok(_) => summary.terminated.push(device.id),
                    Err(err) => summary.record_failure(
                        &self.log,
                        &device.id,
                        "delete expired device",
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

/// Kola needs both ends: SSH uses the public address and tests talk over the
/// private one.
fn require_addresses(device: &Device) -> Result<Addresses, ProviderError> {
    let addresses = device.addresses();
    if addresses.public.is_none() {
        return Err(ProviderError::MissingAddress {
            instance_id: device.id.clone(),
            kind: "public",
        });
    }
    if addresses.private.is_none() {
        return Err(ProviderError::MissingAddress {
            instance_id: device.id.clone(),
            kind: "private",
        });
    }
    Ok(addresses)
}

fn delete_device_args(device_id: &str) -> Vec<OsString> {
    os_args(["device", "delete", "--id", device_id, "--force"])
}

impl Provider for PacketProvider {
    fn platform(&self) -> Platform {
        Platform::Packet
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
        Box::pin(async move { Ok(self.get(&instance.id).await?.addresses()) })
    }

    fn console_output<'a>(&'a self, _instance: &'a Instance) -> ProviderFuture<'a, Vec<u8>> {
        Box::pin(async { Ok(Vec::new()) })
    }

    fn terminate_instance<'a>(&'a self, instance: &'a Instance) -> ProviderFuture<'a, ()> {
        Box::pin(async move {
            self.cli
                .run("delete device", delete_device_args(&instance.id))
                .await
                .map(drop)
        })
    }

    fn teardown(&self) -> ProviderFuture<'_, ()> {
        Box::pin(async move {
            if let Some(key_id) = self.key_id.get().and_then(Option::as_deref) {
                self.cli
                    .run(
                        "delete ssh key",
                        os_args(["ssh-key", "delete", "--id", key_id, "--force"]),
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
