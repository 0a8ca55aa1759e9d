//! `[ibmcloud]` configuration section.

use ortho_config::OrthoConfig;
use serde::Deserialize;

use crate::config::{ConfigError, FieldMetadata, require_field};

/// IBM Cloud VPC settings loaded via `ortho-config`.
#[derive(Clone, Debug, Deserialize, OrthoConfig, PartialEq, Eq)]
#[ortho_config(
    prefix = "KOLA_IBMCLOUD",
    discovery(
        app_name = "kola",
        env_var = "KOLA_CONFIG_PATH",
        config_file_name = "kola.toml",
        dotfile_name = ".kola.toml",
        project_file_name = "kola.toml"
    )
)]
pub struct IbmCloudConfig {
    /// Path to the `ibmcloud` executable.
    #[ortho_config(default = "ibmcloud".to_owned())]
    pub cli_bin: String,
    /// Region targeted before any call.
    #[ortho_config(default = "us-south".to_owned())]
    pub region: String,
    /// Zone receiving every instance.
    #[ortho_config(default = "us-south-1".to_owned())]
    pub zone: String,
    /// VPC id.
    #[ortho_config(default = String::new())]
    pub vpc: String,
    /// Subnet id inside the VPC and zone.
    #[ortho_config(default = String::new())]
    pub subnet: String,
    /// Instance profile.
    #[ortho_config(default = "bx2-2x8".to_owned())]
    pub profile: String,
    /// Image id.
    #[ortho_config(default = String::new())]
    pub image: String,
}

impl IbmCloudConfig {
    /// Loads the section from defaults, `kola.toml` and the environment.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] when the merge fails.
    pub fn load_without_cli_args() -> Result<Self, ConfigError> {
        Self::load_from_iter([std::ffi::OsString::from("kola")])
            .map_err(|err| ConfigError::Parse(err.to_string()))
    }

    /// Ensures required settings are present.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::MissingField`] naming the env var and TOML key
    /// to set.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let fields = [
            (
                &self.cli_bin,
                FieldMetadata::new(
                    "IBM Cloud CLI binary",
                    "KOLA_IBMCLOUD_CLI_BIN",
                    "cli_bin",
                    "ibmcloud",
                ),
            ),
            (
                &self.region,
                FieldMetadata::new("region", "KOLA_IBMCLOUD_REGION", "region", "ibmcloud"),
            ),
            (
                &self.zone,
                FieldMetadata::new("zone", "KOLA_IBMCLOUD_ZONE", "zone", "ibmcloud"),
            ),
            (
                &self.vpc,
                FieldMetadata::new("VPC id", "KOLA_IBMCLOUD_VPC", "vpc", "ibmcloud"),
            ),
            (
                &self.subnet,
                FieldMetadata::new("subnet id", "KOLA_IBMCLOUD_SUBNET", "subnet", "ibmcloud"),
            ),
            (
                &self.profile,
                FieldMetadata::new(
                    "instance profile",
                    "KOLA_IBMCLOUD_PROFILE",
                    "profile",
                    "ibmcloud",
                ),
            ),
            (
                &self.image,
                FieldMetadata::new("image id", "KOLA_IBMCLOUD_IMAGE", "image", "ibmcloud"),
            ),
        ];
        for (value, metadata) in &fields {
            require_field(value, metadata)?;
        }
        Ok(())
    }
}
