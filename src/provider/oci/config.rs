//! `[oci]` configuration section.

use ortho_config::OrthoConfig;
use serde::Deserialize;

use crate::config::{ConfigError, FieldMetadata, require_field};

/// Oracle Cloud Infrastructure settings loaded via `ortho-config`.
#[derive(Clone, Debug, Deserialize, OrthoConfig, PartialEq, Eq)]
#[ortho_config(
    prefix = "KOLA_OCI",
    discovery(
        app_name = "kola",
        env_var = "KOLA_CONFIG_PATH",
        config_file_name = "kola.toml",
        dotfile_name = ".kola.toml",
        project_file_name = "kola.toml"
    )
)]
pub struct OciConfig {
    /// Path to the `oci` executable.
    #[ortho_config(default = "oci".to_owned())]
    pub cli_bin: String,
    /// Profile from the OCI CLI config file; `DEFAULT` applies when unset.
    pub profile: Option<String>,
    /// Compartment OCID receiving every instance.
    #[ortho_config(default = String::new())]
    pub compartment: String,
    /// Availability domain name.
    #[ortho_config(default = String::new())]
    pub availability_domain: String,
    /// Compute shape.
    #[ortho_config(default = "VM.Standard2.1".to_owned())]
    pub shape: String,
    /// Image OCID.
    #[ortho_config(default = String::new())]
    pub image: String,
    /// Subnet OCID.
    #[ortho_config(default = String::new())]
    pub subnet: String,
}

impl OciConfig {
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
                FieldMetadata::new("OCI CLI binary", "KOLA_OCI_CLI_BIN", "cli_bin", "oci"),
            ),
            (
                &self.compartment,
                FieldMetadata::new(
                    "compartment OCID",
                    "KOLA_OCI_COMPARTMENT",
                    "compartment",
                    "oci",
                ),
            ),
            (
                &self.availability_domain,
                FieldMetadata::new(
                    "availability domain",
                    "KOLA_OCI_AVAILABILITY_DOMAIN",
                    "availability_domain",
                    "oci",
                ),
            ),
            (
                &self.shape,
                FieldMetadata::new("shape", "KOLA_OCI_SHAPE", "shape", "oci"),
            ),
            (
                &self.image,
                FieldMetadata::new("image OCID", "KOLA_OCI_IMAGE", "image", "oci"),
            ),
            (
                &self.subnet,
                FieldMetadata::new("subnet OCID", "KOLA_OCI_SUBNET", "subnet", "oci"),
            ),
        ];
        for (value, metadata) in &fields {
            require_field(value, metadata)?;
        }
        Ok(())
    }
}
