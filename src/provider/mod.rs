//! Cloud provider capability contract.
//!
//! A [`Provider`] is the only component that talks to a vendor API. The
//! cluster selects one implementation at construction time and drives every
//! machine through it. All vendor access goes through the vendor's own CLI
//! (`aws`, `az`, `openstack`, `metal`, `ibmcloud`, `oci`) executed with a
//! [`CommandRunner`], so authentication is whatever profile that CLI has
//! been configured with.

use std::fmt;
use std::future::Future;
use std::net::IpAddr;
use std::pin::Pin;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use slog::{Logger, warn};
use thiserror::Error;

use crate::cleanup::StepFailure;
use crate::command::CommandRunner;
use crate::retry::CancelSignal;

pub mod aws;
pub mod azure;
mod cli;
mod error;
pub mod ibmcloud;
mod locks;
pub mod oci;
pub mod openstack;
pub mod packet;
mod rollback;

pub use error::ProviderError;

/// Tag key applied to every instance created by this tool.
pub const CREATED_BY_KEY: &str = "CreatedBy";
/// Tag value applied to every instance created by this tool.
pub const CREATED_BY_VALUE: &str = "mantle";

/// Future returned by provider operations.
pub type ProviderFuture<'a, T> =
    Pin<Box<dyn Future<Output = Result<T, ProviderError>> + Send + 'a>>;

/// Supported cloud platforms.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum Platform {
    /// Amazon EC2.
    Aws,
    /// Microsoft Azure.
    Azure,
    /// OpenStack compute.
    OpenStack,
    /// Packet (Equinix Metal) bare metal.
    Packet,
    /// IBM Cloud VPC.
    IbmCloud,
    /// Oracle Cloud Infrastructure.
    Oci,
}

/// Placeholder names substituted into user-data before boot.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct IpPlaceholders {
    /// Replacement for `$public_ipv4`.
    pub public_ipv4: &'static str,
    /// Replacement for `$private_ipv4`.
    pub private_ipv4: &'static str,
}

impl Platform {
    /// Every supported platform.
    pub const ALL: [Self; 6] = [
        Self::Aws,
        Self::Azure,
        Self::OpenStack,
        Self::Packet,
        Self::IbmCloud,
        Self::Oci,
    ];

    /// Lowercase name used in configuration and reports.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Aws => "aws",
            Self::Azure => "azure",
            Self::OpenStack => "openstack",
            Self::Packet => "packet",
            Self::IbmCloud => "ibmcloud",
            Self::Oci => "oci",
        }
    }

    /// Metadata variables the guest agent expands for this platform.
    #[must_use]
    pub const fn ip_placeholders(self) -> IpPlaceholders {
        match self {
            Self::Aws => IpPlaceholders {
                public_ipv4: "${COREOS_AWS_IPV4_PUBLIC_0}",
                private_ipv4: "${COREOS_AWS_IPV4_PRIVATE_0}",
            },
            // Azure exposes a single dynamic address to the guest.
            Self::Azure => IpPlaceholders {
                public_ipv4: "${COREOS_AZURE_IPV4_DYNAMIC}",
                private_ipv4: "${COREOS_AZURE_IPV4_DYNAMIC}",
            },
            Self::OpenStack => IpPlaceholders {
                public_ipv4: "${COREOS_OPENSTACK_IPV4_PUBLIC}",
                private_ipv4: "${COREOS_OPENSTACK_IPV4_LOCAL}",
            },
            Self::Packet => IpPlaceholders {
                public_ipv4: "${COREOS_PACKET_IPV4_PUBLIC_0}",
                private_ipv4: "${COREOS_PACKET_IPV4_PRIVATE_0}",
            },
            Self::IbmCloud => IpPlaceholders {
                public_ipv4: "${COREOS_IBMCLOUD_IPV4_PUBLIC_0}",
                private_ipv4: "${COREOS_IBMCLOUD_IPV4_PRIVATE_0}",
            },
            Self::Oci => IpPlaceholders {
                public_ipv4: "${COREOS_OCI_IPV4_PUBLIC_0}",
                private_ipv4: "${COREOS_OCI_IPV4_PRIVATE_0}",
            },
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Raised when a platform name is not recognised.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
#[error("unknown platform {name:?}; expected one of aws, azure, openstack, packet, ibmcloud, oci")]
pub struct UnknownPlatform {
    /// The rejected name.
    pub name: String,
}

impl FromStr for Platform {
    type Err = UnknownPlatform;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let wanted = value.trim().to_ascii_lowercase();
        Self::ALL
            .into_iter()
            .find(|platform| platform.as_str() == wanted)
            .ok_or_else(|| UnknownPlatform {
                name: value.to_owned(),
            })
    }
}

/// Network endpoints of an instance. Either side may be absent until the
/// provider has assigned it.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct Addresses {
    /// Address reachable from the test host.
    pub public: Option<IpAddr>,
    /// Address on the provider's internal network.
    pub private: Option<IpAddr>,
}

/// Provider handle for a created instance.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Instance {
    /// Provider-assigned identifier.
    pub id: String,
    /// Name requested at creation.
    pub name: String,
    /// Last known endpoints.
    pub addresses: Addresses,
    /// Floating address allocated for this instance, released on termination.
    pub floating_ip: Option<FloatingIp>,
}

/// A floating address owned by one instance.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct FloatingIp {
    /// Provider identifier of the allocation.
    pub id: String,
    /// The allocated address.
    pub address: IpAddr,
}

/// Parameters for [`Provider::create_instance`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct InstanceRequest {
    /// Instance name, unique within the cluster.
    pub name: String,
    /// Rendered user-data payload.
    pub user_data: String,
}

/// Cluster-level identity handed to [`Provider::setup`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ClusterIdentity {
    /// Cluster name, used to name shared provider resources.
    pub name: String,
    /// Public key registered with the provider, when metadata injection is
    /// enabled.
    pub ssh_public_key: Option<String>,
}

/// Outcome of a garbage collection sweep.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct GcSummary {
    /// Identifiers of terminated instances.
    pub terminated: Vec<String>,
    /// Tagged instances left alone because they are younger than the grace
    /// period or already stopping.
    pub skipped: usize,
    /// Instances whose age could not be read or whose deletion failed. The
    /// sweep carries on past each of them.
    pub failures: Vec<StepFailure>,
}

impl GcSummary {
    /// Records a per-instance failure and logs it.
    pub(crate) fn record_failure(
        &mut self,
        log: &Logger,
        subject: &str,
        step: &str,
        err: &ProviderError,
    ) {
        warn!(log, "gc step failed"; "subject" => subject, "step" => step, "error" => %err);
        self.failures.push(StepFailure {
            subject: subject.to_owned(),
            step: step.to_owned(),
            message: err.to_string(),
        });
    }
}

/// Capabilities every cloud backend provides.
///
/// Calls on one provider may run concurrently from several tasks; shared
/// named resources are created under a process-wide named lock.
pub trait Provider: fmt::Debug + Send + Sync {
    /// Platform implemented by this provider.
    fn platform(&self) -> Platform;

    /// One-time cluster setup: key registration and shared network
    /// resources. Called exactly once, before any instance is created.
    fn setup<'a>(&'a self, identity: &'a ClusterIdentity) -> ProviderFuture<'a, ()>;

    /// Creates an instance and waits until it is running with an address.
    ///
    /// Every resource created along the way is released again when a later
    /// step fails.
    fn create_instance<'a>(
        &'a self,
        request: &'a InstanceRequest,
        cancel: &'a CancelSignal,
    ) -> ProviderFuture<'a, Instance>;

    /// Re-reads the current endpoints of `instance`.
    fn refresh_addresses<'a>(&'a self, instance: &'a Instance) -> ProviderFuture<'a, Addresses>;

    /// Returns the captured serial console, or nothing when the platform
    /// offers none.
    fn console_output<'a>(&'a self, instance: &'a Instance) -> ProviderFuture<'a, Vec<u8>>;

    /// Deletes the instance together with its floating address.
    fn terminate_instance<'a>(&'a self, instance: &'a Instance) -> ProviderFuture<'a, ()>;

    /// Releases the shared resources created by [`Provider::setup`].
    fn teardown(&self) -> ProviderFuture<'_, ()>;

    /// Terminates tagged instances older than `grace_period`.
    fn gc(&self, grace_period: Duration) -> ProviderFuture<'_, GcSummary>;
}

/// Provider-specific configuration sections loaded for a run.
#[derive(Clone, Debug)]
pub enum ProviderConfig {
    /// `[aws]` settings.
    Aws(aws::AwsConfig),
    /// `[azure]` settings.
    Azure(azure::AzureConfig),
    /// `[openstack]` settings.
    OpenStack(openstack::OpenStackConfig),
    /// `[packet]` settings.
    Packet(packet::PacketConfig),
    /// `[ibmcloud]` settings.
    IbmCloud(ibmcloud::IbmCloudConfig),
    /// `[oci]` settings.
    Oci(oci::OciConfig),
}

impl ProviderConfig {
    /// Loads the configuration section for `platform`.
    ///
    /// # Errors
    ///
    /// Returns [`ProviderError::InvalidOptions`] when the section cannot be
    /// merged from its sources.
    pub fn load(platform: Platform) -> Result<Self, ProviderError> {
        let invalid = |err: crate::config::ConfigError| ProviderError::InvalidOptions {
            platform,
            message: err.to_string(),
        };
        Ok(match platform {
            Platform::Aws => Self::Aws(aws::AwsConfig::load_without_cli_args().map_err(invalid)?),
            Platform::Azure => {
                Self::Azure(azure::AzureConfig::load_without_cli_args().map_err(invalid)?)
            }
            Platform::OpenStack => Self::OpenStack(
                openstack::OpenStackConfig::load_without_cli_args().map_err(invalid)?,
            ),
            Platform::Packet => {
                Self::Packet(packet::PacketConfig::load_without_cli_args().map_err(invalid)?)
            }
            Platform::IbmCloud => Self::IbmCloud(
                ibmcloud::IbmCloudConfig::load_without_cli_args().map_err(invalid)?,
            ),
            Platform::Oci => Self::Oci(oci::OciConfig::load_without_cli_args().map_err(invalid)?),
        })
    }
}

/// Builds the provider selected by `config`, validating its options first.
///
/// # Errors
///
/// Returns [`ProviderError::InvalidOptions`] when required settings are
/// missing.
pub fn build(
    config: ProviderConfig,
    runner: Arc<dyn CommandRunner>,
    log: &Logger,
) -> Result<Box<dyn Provider>, ProviderError> {
    Ok(match config {
        ProviderConfig::Aws(cfg) => Box::new(aws::AwsProvider::new(cfg, runner, log)?),
        ProviderConfig::Azure(cfg) => Box::new(azure::AzureProvider::new(cfg, runner, log)?),
        ProviderConfig::OpenStack(cfg) => {
            Box::new(openstack::OpenStackProvider::new(cfg, runner, log)?)
        }
        ProviderConfig::Packet(cfg) => Box::new(packet::PacketProvider::new(cfg, runner, log)?),
        ProviderConfig::IbmCloud(cfg) => {
            Box::new(ibmcloud::IbmCloudProvider::new(cfg, runner, log)?)
        }
        ProviderConfig::Oci(cfg) => Box::new(oci::OciProvider::new(cfg, runner, log)?),
    })
}

/// Returns `true` when an instance created at `created` is old enough to be
/// collected.
pub(crate) fn is_expired(
    created: chrono::DateTime<chrono::Utc>,
    now: chrono::DateTime<chrono::Utc>,
    grace_period: Duration,
) -> bool {
    let Ok(grace) = chrono::Duration::from_std(grace_period) else {
        return false;
    };
    now.signed_duration_since(created) >= grace
}

/// Parses an RFC 3339 timestamp reported by a vendor CLI.
pub(crate) fn parse_timestamp(
    step: &str,
    value: &str,
) -> Result<chrono::DateTime<chrono::Utc>, ProviderError> {
    chrono::DateTime::parse_from_rfc3339(value)
        .map(|stamp| stamp.with_timezone(&chrono::Utc))
        .map_err(|err| ProviderError::Parse {
            step: step.to_owned(),
            message: format!("invalid timestamp {value:?}: {err}"),
        })
}

/// Parses an address reported by a vendor CLI, treating blanks as absent.
pub(crate) fn parse_address(value: Option<&str>) -> Option<IpAddr> {
    value
        .map(str::trim)
        .filter(|text| !text.is_empty())
        .and_then(|text| text.parse().ok())
}
