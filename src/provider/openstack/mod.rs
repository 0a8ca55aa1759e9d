//! OpenStack provider driven through the `openstack` CLI.
//!
//! Servers boot on the configured network. When a floating network is
//! configured each server also gets a floating address, which becomes its
//! public endpoint and is released together with the server.

use std::ffi::OsString;
use std::net::IpAddr;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use serde::Deserialize;
use serde_json::Value;
use slog::{Logger, debug, info, o};

use crate::command::{CommandRunner, os_args};
use crate::retry::{CancelSignal, Poll, poll_for};

use super::cli::{VendorCli, scratch_file};
use super::rollback::Rollback;
use super::{
    Addresses, CREATED_BY_KEY, CREATED_BY_VALUE, ClusterIdentity, FloatingIp, GcSummary, Instance,
    InstanceRequest, Platform, Provider, ProviderError, ProviderFuture, is_expired,
    parse_timestamp,
};

mod config;

pub use config::OpenStackConfig;

/// OpenStack implementation of [`Provider`].
#[derive(Debug)]
pub struct OpenStackProvider {
    config: OpenStackConfig,
    cli: VendorCli,
    log: Logger,
    poll: Poll,
    key_name: OnceLock<Option<String>>,
}

#[derive(Debug, Deserialize)]
struct CreatedServer {
    id: String,
}

#[derive(Debug, Deserialize)]
struct ServerDetails {
    id: String,
    status: String,
    #[serde(default)]
    addresses: Value,
    created: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ListedServer {
    #[serde(rename = "ID")]
    id: String,
}

#[derive(Debug, Deserialize)]
struct CreatedFloatingIp {
    id: String,
    floating_ip_address: String,
}

impl ServerDetails {
    /// Fixed addresses in the order the API reports them. Accepts both the
    /// structured and the legacy `net=a, b` rendering.
    fn fixed_addresses(&self) -> Vec<IpAddr> {
        let mut found = Vec::new();
        collect_addresses(&self.addresses, &mut found);
        found
    }

    fn endpoints(&self, floating: Option<&FloatingIp>) -> Addresses {
        let fixed = self.fixed_addresses();
        let private = fixed.first().copied();
        let public = floating
            .map(|ip| ip.address)
            .or_else(|| fixed.get(1).copied())
            .or(private);
        Addresses { public, private }
    }
}

fn collect_addresses(value: &Value, found: &mut Vec<IpAddr>) {
    match value {
        Value::String(text) => {
            let listed = text.split(';').flat_map(|network| {
                network
                    .split_once('=')
                    .map_or(network, |(_, rest)| rest)
                    .split(',')
            });
            found.extend(listed.filter_map(|item| item.trim().parse::<IpAddr>().ok()));
        }
        Value::Array(items) => {
            for item in items {
                collect_addresses(item, found);
            }
        }
        Value::Object(map) => {
            if let Some(Value::String(addr)) = map.get("addr") {
                found.extend(addr.parse::<IpAddr>().ok());
            } else {
                for item in map.values() {
                    collect_addresses(item, found);
                }
            }
        }
        Value::Null | Value::Bool(_) | Value::Number(_) => {}
    }
}

impl OpenStackProvider {
    /// Creates the provider after validating `config`.
    ///
    /// # Errors
    ///
    /// Returns [`ProviderError::InvalidOptions`] when required settings are
    /// missing.
    pub fn new(
        config: OpenStackConfig,
        runner: Arc<dyn CommandRunner>,
        log: &Logger,
    ) -> Result<Self, ProviderError> {
        config
            .validate()
            .map_err(|err| ProviderError::InvalidOptions {
                platform: Platform::OpenStack,
                message: err.to_string(),
            })?;
        let leading = config
            .cloud
            .as_deref()
            .map_or_else(Vec::new, |cloud| os_args(["--os-cloud", cloud]));
        let cli =
            VendorCli::new(config.cli_bin.clone(), Vec::new(), runner).with_leading_args(leading);
        Ok(Self {
            cli,
            log: log.new(o!("platform" => "openstack")),
            config,
            poll: Poll::INSTANCE_BOOT,
            key_name: OnceLock::new(),
        })
    }

    /// Overrides the server readiness budget.
    #[must_use]
    pub const fn with_poll(mut self, poll: Poll) -> Self {
        self.poll = poll;
        self
    }

    async fn do_setup(&self, identity: &ClusterIdentity) -> Result<(), ProviderError> {
        if self.key_name.get().is_some() {
            return Err(ProviderError::AlreadySetUp {
                platform: Platform::OpenStack,
            });
        }
        let key_name = match &identity.ssh_public_key {
            Some(key) => {
                let file = scratch_file("write public key", key)?;
                let mut args = os_args(["keypair", "create", "--public-key"]);
                args.push(file.path().as_os_str().to_owned());
                args.extend(os_args(["-f", "json", identity.name.as_str()]));
                self.cli.run("create keypair", args).await?;
                Some(identity.name.clone())
            }
            None => None,
        };
        self.key_name
            .set(key_name)
            .map_err(|_| ProviderError::AlreadySetUp {
                platform: Platform::OpenStack,
            })
    }

    async fn create(
        &self,
        request: &InstanceRequest,
        cancel: &CancelSignal,
    ) -> Result<Instance, ProviderError> {
        let user_data = scratch_file("write user-data", &request.user_data)?;
        let property = format!("{CREATED_BY_KEY}={CREATED_BY_VALUE}");
        let mut args = os_args([
            "server",
            "create",
            "--flavor",
            self.config.flavor.as_str(),
            "--image",
            self.config.image.as_str(),
            "--property",
            property.as_str(),
        ]);
        if let Some(network) = &self.config.network {
            args.extend(os_args(["--network", network.as_str()]));
        }
        if let Some(key) = self.key_name.get().and_then(Option::as_deref) {
            args.extend(os_args(["--key-name", key]));
        }
        args.push(OsString::from("--user-data"));
        args.push(user_data.path().as_os_str().to_owned());
        args.extend(os_args(["-f", "json", request.name.as_str()]));

        let created: CreatedServer = self.cli.json("create server", args).await?;
        debug!(self.log, "server requested"; "server" => &created.id);

        let mut rollback = Rollback::new(&self.cli, &self.log);
        rollback.push("delete server", delete_server_args(&created.id));

        let outcome = self.finish_create(&created.id, &mut rollback, cancel).await;
        match outcome {
            Ok((details, floating_ip)) => {
                rollback.commit();
                info!(self.log, "server active"; "server" => &created.id);
                Ok(Instance {
                    addresses: details.endpoints(floating_ip.as_ref()),
                    id: created.id,
                    name: request.name.clone(),
                    floating_ip,
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
        server_id: &str,
        rollback: &mut Rollback<'_>,
        cancel: &CancelSignal,
    ) -> Result<(ServerDetails, Option<FloatingIp>), ProviderError> {
        let details = poll_for(self.poll, cancel, || self.active(server_id))
            .await
            .map_err(|err| ProviderError::readiness("wait for server active", err))?;

        let Some(network) = &self.config.floating_ip_network else {
            return Ok((details, None));
        };
        let allocated: CreatedFloatingIp = self
            .cli
            .json(
                "create floating ip",
                os_args(["floating", "ip", "create", "-f", "json", network.as_str()]),
            )
            .await?;
        rollback.push(
            "delete floating ip",
            os_args(["floating", "ip", "delete", allocated.id.as_str()]),
        );
        let address = allocated
            .floating_ip_address
            .parse()
            .map_err(|_| ProviderError::Parse {
                step: String::from("create floating ip"),
                message: format!("invalid address {:?}", allocated.floating_ip_address),
            })?;
        self.cli
            .run(
                "associate floating ip",
                os_args([
                    "server",
                    "add",
                    "floating",
                    "ip",
                    server_id,
                    allocated.floating_ip_address.as_str(),
                ]),
            )
            .await?;
        Ok((
            details,
            Some(FloatingIp {
                id: allocated.id,
                address,
            }),
        ))
    }

    async fn show(&self, server_id: &str) -> Result<ServerDetails, ProviderError> {
        self.cli
            .json("show server", os_args(["server", "show", "-f", "json", server_id]))
            .await
    }

    async fn active(&self, server_id: &str) -> Result<Option<ServerDetails>, ProviderError> {
        let details = self.show(server_id).await?;
        match details.status.as_str() {
            "ACTIVE" if !details.fixed_addresses().is_empty() => Ok(Some(details)),
            "ERROR" => Err(ProviderError::InstanceFailed {
                instance_id: details.id,
                state: details.status,
            }),
            _ => Ok(None),
        }
    }

    async fn terminate(&self, instance: &Instance) -> Result<(), ProviderError> {
        let released = match &instance.floating_ip {
            Some(ip) => self
                .cli
                .run(
                    "delete floating ip",
                    os_args(["floating", "ip", "delete", ip.id.as_str()]),
                )
                .await
                .map(drop),
            None => Ok(()),
        };
        let mut args = os_args(["server", "delete", "--wait"]);
        args.extend(os_args([instance.id.as_str()]));
        self.cli.run("delete server", args).await?;
        released
    }

    async fn collect_garbage(&self, grace_period: Duration) -> Result<GcSummary, ProviderError> {
        let property = format!("{CREATED_BY_KEY}={CREATED_BY_VALUE}");
        let servers: Vec<ListedServer> = self
            .cli
            .json(
                "list tagged servers",
                os_args(["server", "list", "--property", property.as_str(), "-f", "json"]),
            )
            .await?;
        let now = chrono::Utc::now();
        let mut summary = GcSummary::default();
        for server in servers {
            let expired = self.show(&server.id).await.and_then(|details| {
                details.created.as_deref().map_or(Ok(false), |created| {
                    parse_timestamp("show server", created)
                        .map(|stamp| is_expired(stamp, now, grace_period))
                })
            });
            match expired {
                Ok(true) => {
                    let deleted = self
                        .cli
                        .run("delete expired server", delete_server_args(&server.id))
                        .await;
                    match deleted {
                        Ok(_) => summary.terminated.push(server.id),
                        Err(err) => summary.record_failure(
                            &self.log,
                            &server.id,
                            "delete expired server",
                            &err,
                        ),
                    }
                }
                Ok(false) => summary.skipped += 1,
                Err(err) => {
                    summary.record_failure(&self.log, &server.id, "read creation time", &err);
                }
            }
        }
        Ok(summary)
    }
}

fn delete_server_args(server_id: &str) -> Vec<OsString> {
    os_args(["server", "delete", server_id])
}

impl Provider for OpenStackProvider {
    fn platform(&self) -> Platform {
        Platform::OpenStack
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
            let details = self.show(&instance.id).await?;
            Ok(details.endpoints(instance.floating_ip.as_ref()))
        })
    }

    fn console_output<'a>(&'a self, instance: &'a Instance) -> ProviderFuture<'a, Vec<u8>> {
        Box::pin(async move {
            let log = self
                .cli
                .run(
                    "show console log",
                    os_args(["console", "log", "show", instance.id.as_str()]),
                )
                .await?;
            Ok(log.into_bytes())
        })
    }

    fn terminate_instance<'a>(&'a self, instance: &'a Instance) -> ProviderFuture<'a, ()> {
        Box::pin(self.terminate(instance))
    }

    fn teardown(&self) -> ProviderFuture<'_, ()> {
        Box::pin(async move {
            if let Some(key) = self.key_name.get().and_then(Option::as_deref) {
                self.cli
                    .run("delete keypair", os_args(["keypair", "delete", key]))
                    .await?;
            }
            Ok(())
        })
    }

    fn gc(&self, grace_period: Duration) -> ProviderFuture<'_, GcSummary> {
        Box::pin(self.collect_garbage(grace_period))
    }
}
