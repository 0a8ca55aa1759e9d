//! Amazon EC2 provider driven through the `aws` CLI.
//!
//! Instances share one security group per account and region. The group is
//! looked up by name and created in the default VPC on first use, under a
//! named lock so concurrent clusters do not race to create it.

use std::ffi::OsString;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use serde::Deserialize;
use slog::{Logger, debug, info, o};

use crate::command::{CommandRunner, os_args};
use crate::retry::{CancelSignal, Poll, poll_for};

use super::cli::{VendorCli, path_arg, scratch_file};
use super::locks::lock_named;
use super::rollback::Rollback;
use super::{
    Addresses, CREATED_BY_KEY, CREATED_BY_VALUE, ClusterIdentity, GcSummary, Instance,
    InstanceRequest, Platform, Provider, ProviderError, ProviderFuture, is_expired,
    parse_address, parse_timestamp,
};

mod config;

pub use config::AwsConfig;

const SECURITY_GROUP_DESCRIPTION: &str = "mantle security group for testing";

/// EC2 implementation of [`Provider`].
#[derive(Debug)]
pub struct AwsProvider {
    config: AwsConfig,
    cli: VendorCli,
    log: Logger,
    poll: Poll,
    key_name: OnceLock<Option<String>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct SecurityGroups {
    #[serde(default)]
    security_groups: Vec<SecurityGroup>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct SecurityGroup {
    group_id: String,
    vpc_id: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct Vpcs {
    #[serde(default)]
    vpcs: Vec<Vpc>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct Vpc {
    vpc_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct CreatedGroup {
    group_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct Subnets {
    #[serde(default)]
    subnets: Vec<Subnet>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct Subnet {
    subnet_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct RunInstances {
    #[serde(default)]
    instances: Vec<Ec2Instance>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct Reservations {
    #[serde(default)]
    reservations: Vec<Reservation>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct Reservation {
    #[serde(default)]
    instances: Vec<Ec2Instance>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct Ec2Instance {
    instance_id: String,
    state: Option<Ec2State>,
    public_ip_address: Option<String>,
    private_ip_address: Option<String>,
    launch_time: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct Ec2State {
    name: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ConsoleOutput {
    output: Option<String>,
}

impl Ec2Instance {
    fn addresses(&self) -> Addresses {
        Addresses {
            public: parse_address(self.public_ip_address.as_deref()),
            private: parse_address(self.private_ip_address.as_deref()),
        }
    }

    fn state_name(&self) -> &str {
        self.state.as_ref().map_or("unknown", |state| state.name.as_str())
    }
}

impl AwsProvider {
    /// Creates the provider after validating `config`.
    ///
    /// # Errors
    ///
    /// Returns [`ProviderError::InvalidOptions`] when required settings are
    /// missing.
    pub fn new(
        config: AwsConfig,
        runner: Arc<dyn CommandRunner>,
        log: &Logger,
    ) -> Result<Self, ProviderError> {
        config
            .validate()
            .map_err(|err| ProviderError::InvalidOptions {
                platform: Platform::Aws,
                message: err.to_string(),
            })?;
        let mut global_args = os_args(["--output", "json", "--region", config.region.as_str()]);
        if let Some(profile) = &config.profile {
            global_args.extend(os_args(["--profile", profile.as_str()]));
        }
        let cli = VendorCli::new(config.cli_bin.clone(), global_args, runner);
        Ok(Self {
            cli,
            log: log.new(o!("platform" => "aws", "region" => config.region.clone())),
            config,
            poll: Poll::INSTANCE_BOOT,
            key_name: OnceLock::new(),
        })
    }

    /// Overrides the instance readiness budget.
    #[must_use]
    pub const fn with_poll(mut self, poll: Poll) -> Self {
        self.poll = poll;
        self
    }

    fn key_name(&self) -> Option<&str> {
        self.key_name.get().and_then(Option::as_deref)
    }

    async fn do_setup(&self, identity: &ClusterIdentity) -> Result<(), ProviderError> {
        if self.key_name.get().is_some() {
            return Err(ProviderError::AlreadySetUp {
                platform: Platform::Aws,
            });
        }
        let key_name = match &identity.ssh_public_key {
            Some(key) => {
                let file = scratch_file("write public key", key)?;
                let mut args = os_args([
                    "ec2",
                    "import-key-pair",
                    "--key-name",
                    identity.name.as_str(),
                ]);
                args.push(OsString::from("--public-key-material"));
                args.push(path_arg("fileb://", &file));
                self.cli.run("import key pair", args).await?;
                info!(self.log, "imported key pair"; "key" => &identity.name);
                Some(identity.name.clone())
            }
            None => None,
        };
        self.key_name
            .set(key_name)
            .map_err(|_| ProviderError::AlreadySetUp {
                platform: Platform::Aws,
            })
    }

    async fn ensure_security_group(&self) -> Result<SecurityGroup, ProviderError> {
        let name = self.config.security_group.as_str();
        let _guard = lock_named(&format!("aws-security-group-{name}")).await;
        let filter = format!("Name=group-name,Values={name}");
        let existing: SecurityGroups = self
            .cli
            .json(
                "describe security groups",
                os_args(["ec2", "describe-security-groups", "--filters", filter.as_str()]),
            )
            .await?;
        if let Some(group) = existing.security_groups.into_iter().next() {
            return Ok(group);
        }

        let vpcs: Vpcs = self
            .cli
            .json(
                "describe default vpc",
                os_args(["ec2", "describe-vpcs", "--filters", "Name=isDefault,Values=true"]),
            )
            .await?;
        let vpc_id = vpcs
            .vpcs
            .into_iter()
            .next()
            .map(|vpc| vpc.vpc_id)
            .ok_or_else(|| ProviderError::Parse {
                step: String::from("describe default vpc"),
                message: String::from("account has no default VPC"),
            })?;

        let created: CreatedGroup = self
            .cli
            .json(
                "create security group",
                os_args([
                    "ec2",
                    "create-security-group",
                    "--group-name",
                    name,
                    "--description",
                    SECURITY_GROUP_DESCRIPTION,
                    "--vpc-id",
                    vpc_id.as_str(),
                ]),
            )
            .await?;
        info!(self.log, "created security group"; "group" => &created.group_id);

        if let Err(err) = self.authorize_ingress(&created.group_id).await {
            let delete = os_args([
                "ec2",
                "delete-security-group",
                "--group-id",
                created.group_id.as_str(),
            ]);
            let mut rollback = Rollback::new(&self.cli, &self.log);
            rollback.push("delete security group", delete);
            rollback.unwind().await;
            return Err(err);
        }

        Ok(SecurityGroup {
            group_id: created.group_id,
            vpc_id: Some(vpc_id),
        })
    }

    async fn authorize_ingress(&self, group_id: &str) -> Result<(), ProviderError> {
        self.cli
            .run(
                "authorize ssh ingress",
                os_args([
                    "ec2",
                    "authorize-security-group-ingress",
                    "--group-id",
                    group_id,
                    "--protocol",
                    "tcp",
                    "--port",
                    "22",
                    "--cidr",
                    "0.0.0.0/0",
                ]),
            )
            .await?;
        self.cli
            .run(
                "authorize intra-group ingress",
                os_args([
                    "ec2",
                    "authorize-security-group-ingress",
                    "--group-id",
                    group_id,
                    "--protocol",
                    "all",
                    "--source-group",
                    group_id,
                ]),
            )
            .await?;
        Ok(())
    }

    async fn subnet_for(&self, vpc_id: &str) -> Result<String, ProviderError> {
        let filter = format!("Name=vpc-id,Values={vpc_id}");
        let subnets: Subnets = self
            .cli
            .json(
                "describe subnets",
                os_args(["ec2", "describe-subnets", "--filters", filter.as_str()]),
            )
            .await?;
        subnets
            .subnets
            .into_iter()
            .next()
            .map(|subnet| subnet.subnet_id)
            .ok_or_else(|| ProviderError::Parse {
                step: String::from("describe subnets"),
                message: format!("no subnet in {vpc_id}"),
            })
    }

    async fn create(
        &self,
        request: &InstanceRequest,
        cancel: &CancelSignal,
    ) -> Result<Instance, ProviderError> {
        let group = self.ensure_security_group().await?;
        let vpc_id = group.vpc_id.clone().ok_or_else(|| ProviderError::Parse {
            step: String::from("describe security groups"),
            message: format!("security group {} has no VPC", group.group_id),
        })?;
        let subnet_id = self.subnet_for(&vpc_id).await?;
        let user_data = scratch_file("write user-data", &request.user_data)?;
        let tags = format!(
            "ResourceType=instance,Tags=[{{Key=Name,Value={}}},{{Key={CREATED_BY_KEY},Value={CREATED_BY_VALUE}}}]",
            request.name
        );

        let mut args = os_args([
            "ec2",
            "run-instances",
            "--image-id",
            self.config.ami.as_str(),
            "--instance-type",
            self.config.instance_type.as_str(),
            "--count",
            "1",
            "--security-group-ids",
            group.group_id.as_str(),
            "--subnet-id",
            subnet_id.as_str(),
            "--tag-specifications",
            tags.as_str(),
        ]);
        args.push(OsString::from("--user-data"));
        args.push(path_arg("file://", &user_data));
        if let Some(key) = self.key_name() {
            args.extend(os_args(["--key-name", key]));
        }

        let launched: RunInstances = self.cli.json("run instances", args).await?;
        let instance_id = launched
            .instances
            .into_iter()
            .next()
            .map(|instance| instance.instance_id)
            .ok_or_else(|| ProviderError::Parse {
                step: String::from("run instances"),
                message: String::from("no instance in response"),
            })?;
        debug!(self.log, "instance launched"; "instance" => &instance_id, "name" => &request.name);

        let mut rollback = Rollback::new(&self.cli, &self.log);
        rollback.push("terminate instance", terminate_args(&[instance_id.as_str()]));

        let waited = poll_for(self.poll, cancel, || self.running_addresses(&instance_id)).await;
        match waited {
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

    async fn describe(&self, instance_id: &str) -> Result<Ec2Instance, ProviderError> {
        let described: Reservations = self
            .cli
            .json(
                "describe instance",
                os_args(["ec2", "describe-instances", "--instance-ids", instance_id]),
            )
            .await?;
        described
            .reservations
            .into_iter()
            .flat_map(|reservation| reservation.instances)
            .find(|instance| instance.instance_id == instance_id)
            .ok_or_else(|| ProviderError::Parse {
                step: String::from("describe instance"),
                message: format!("instance {instance_id} not found"),
            })
    }

    async fn running_addresses(
        &self,
        instance_id: &str,
    ) -> Result<Option<Addresses>, ProviderError> {
        let instance = self.describe(instance_id).await?;
        match instance.state_name() {
            "running" => {
                let addresses = instance.addresses();
                Ok(addresses.public.is_some().then_some(addresses))
            }
            "shutting-down" | "terminated" => Err(ProviderError::InstanceFailed {
                state: instance.state_name().to_owned(),
                instance_id: instance.instance_id,
            }),
            _ => Ok(None),
        }
    }

    async fn console(&self, instance: &Instance) -> Result<Vec<u8>, ProviderError> {
        let console: ConsoleOutput = self
            .cli
            .json(
                "get console output",
                os_args([
                    "ec2",
                    "get-console-output",
                    "--instance-id",
                    instance.id.as_str(),
                    "--latest",
                ]),
            )
            .await?;
        Ok(console.output.unwrap_or_default().into_bytes())
    }

    async fn collect_garbage(&self, grace_period: Duration) -> Result<GcSummary, ProviderError> {
        let tag_filter = format!("Name=tag:{CREATED_BY_KEY},Values={CREATED_BY_VALUE}");
        let listed: Reservations = self
            .cli
            .json(
                "list tagged instances",
                os_args([
                    "ec2",
                    "describe-instances",
                    "--filters",
                    tag_filter.as_str(),
                    "Name=instance-state-name,Values=pending,running,stopped",
                ]),
            )
            .await?;

        let now = chrono::Utc::now();
        let mut summary = GcSummary::default();
        let mut expired = Vec::new();
        for instance in listed.reservations.into_iter().flat_map(|r| r.instances) {
            let Some(launched) = instance.launch_time.as_deref() else {
                summary.skipped += 1;
                continue;
            };
            match parse_timestamp("list tagged instances", launched) {
                Ok(stamp) if is_expired(stamp, now, grace_period) => {
                    expired.push(instance.instance_id);
                }
                Ok(_) => summary.skipped += 1,
                Err(err) => summary.record_failure(
                    &self.log,
                    &instance.instance_id,
                    "read launch time",
                    &err,
                ),
            }
        }

        if !expired.is_empty() {
            let ids: Vec<&str> = expired.iter().map(String::as_str).collect();
            let args = terminate_args(&ids);
            match self.cli.run("terminate expired instances", args).await {
                Ok(_) => {
                    info!(self.log, "terminated expired instances"; "count" => expired.len());
                    summary.terminated = expired;
                }
                Err(err) => summary.record_failure(
                    &self.log,
                    &expired.join(","),
                    "terminate expired instances",
                    &err,
                ),
            }
        }
        Ok(summary)
    }
}

fn terminate_args(ids: &[&str]) -> Vec<OsString> {
    let mut args = os_args(["ec2", "terminate-instances", "--instance-ids"]);
    args.extend(os_args(ids.iter().copied()));
    args
}

impl Provider for AwsProvider {
    fn platform(&self) -> Platform {
        Platform::Aws
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
        Box::pin(async move { Ok(self.describe(&instance.id).await?.addresses()) })
    }

    fn console_output<'a>(&'a self, instance: &'a Instance) -> ProviderFuture<'a, Vec<u8>> {
        Box::pin(self.console(instance))
    }

    fn terminate_instance<'a>(&'a self, instance: &'a Instance) -> ProviderFuture<'a, ()> {
        Box::pin(async move {
            self.cli
                .run("terminate instance", terminate_args(&[instance.id.as_str()]))
                .await
                .map(drop)
        })
    }

    fn teardown(&self) -> ProviderFuture<'_, ()> {
        Box::pin(async move {
            if let Some(key) = self.key_name() {
                self.cli
                    .run(
                        "delete key pair",
                        os_args(["ec2", "delete-key-pair", "--key-name", key]),
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
