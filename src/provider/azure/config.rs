//! `[azure]` configuration section.

use ortho_config::OrthoConfig;
use serde::Deserialize;

use crate::config::{ConfigError, FieldMetadata, require_field};

/// Azure settings loaded via `ortho-config`.
#[derive(Clone, Debug, Deserialize, OrthoConfig, PartialEq, Eq)]
#[ortho_config(
    prefix = "KOLA_AZURE",
    discovery(
        app_name = "kola",
        env_var = "KOLA_CONFIG_PATH",
        config_file_name = "kola.toml",
        dotfile_name = ".kola.toml",
        project_file_name = "kola.toml"
    )
)]
pub struct AzureConfig {
    /// Path to the `az` executable.
    #[ortho_config(default = "az".to_owned())]
    pub cli_bin: String,
    /// Subscription used for every call; the CLI default applies when unset.
    pub subscription: Option<String>,
    /// Location of the per-cluster resource group.
    #[ortho_config(default = "westus".to_owned())]
    pub location: String,
    /// Image URN or resource id booted by every VM.
    #[ortho_config(default = String::new())]
    pub image: String,
    /// VM size.
    #[ortho_config(default = "Standard_D2_v2".to_owned())]
    pub size: String,
    /// Administrator account created on every VM.
    #[ortho_config(default = "core".to_owned())]
    pub admin_user: String,
}

impl AzureConfig {
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
            &FieldMetadata::new("Azure CLI binary", "KOLA_AZURE_CLI_BIN", "cli_bin", "azure"),
        )?;
        require_field(
            &self.location,
            &FieldMetadata::new("Azure location", "KOLA_AZURE_LOCATION", "location", "azure"),
        )?;
        require_field(
            &self.image,
            &FieldMetadata::new("VM image", "KOLA_AZURE_IMAGE", "image", "azure"),
        )?;
        require_field(
            &self.size,
            &FieldMetadata::new("VM size", "KOLA_AZURE_SIZE", "size", "azure"),
        )?;
        require_field(
            &self.admin_user,
            &FieldMetadata::new(
                "administrator user",
                "KOLA_AZURE_ADMIN_USER",
                "admin_user",
                "azure",
            ),
        )?;
        Ok(())
    }
}
