//! `[aws]` configuration section.

use ortho_config::OrthoConfig;
use serde::Deserialize;

use crate::config::{ConfigError, FieldMetadata, require_field};

/// EC2 settings loaded via `ortho-config`.
#[derive(Clone, Debug, Deserialize, OrthoConfig, PartialEq, Eq)]
#[ortho_config(
    prefix = "KOLA_AWS",
    discovery(
        app_name = "kola",
        env_var = "KOLA_CONFIG_PATH",
        config_file_name = "kola.toml",
        dotfile_name = ".kola.toml",
        project_file_name = "kola.toml"
    )
)]
pub struct AwsConfig {
    /// Path to the `aws` executable.
    #[ortho_config(default = "aws".to_owned())]
    pub cli_bin: String,
    /// Region receiving every resource.
    #[ortho_config(default = "us-west-2".to_owned())]
    pub region: String,
    /// Named CLI profile; the default credential chain applies when unset.
    pub profile: Option<String>,
    /// AMI booted by every instance.
    #[ortho_config(default = String::new())]
    pub ami: String,
    /// Instance type.
    #[ortho_config(default = "t3.small".to_owned())]
    pub instance_type: String,
    /// Security group shared by every cluster, created on first use.
    #[ortho_config(default = "kola".to_owned())]
    pub security_group: String,
}

impl AwsConfig {
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
        require_field(
            &self.cli_bin,
            &FieldMetadata::new("AWS CLI binary", "KOLA_AWS_CLI_BIN", "cli_bin", "aws"),
        )?;
        require_field(
            &self.region,
            &FieldMetadata::new("AWS region", "KOLA_AWS_REGION", "region", "aws"),
        )?;
        require_field(
            &self.ami,
            &FieldMetadata::new("AMI identifier", "KOLA_AWS_AMI", "ami", "aws"),
        )?;
        require_field(
            &self.instance_type,
            &FieldMetadata::new(
                "instance type",
                "KOLA_AWS_INSTANCE_TYPE",
                "instance_type",
                "aws",
            ),
        )?;
        require_field(
            &self.security_group,
            &FieldMetadata::new(
                "security group name",
                "KOLA_AWS_SECURITY_GROUP",
                "security_group",
                "aws",
            ),
        )?;
        Ok(())
    }
}
