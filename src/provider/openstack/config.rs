//! `[openstack]` configuration section.

use ortho_config::OrthoConfig;
use serde::Deserialize;

use crate::config::{ConfigError, FieldMetadata, require_field};

/// OpenStack settings loaded via `ortho-config`.
#[derive(Clone, Debug, Deserialize, OrthoConfig, PartialEq, Eq)]
#[ortho_config(
    prefix = "KOLA_OPENSTACK",
    discovery(
        app_name = "kola",
        env_var = "KOLA_CONFIG_PATH",
        config_file_name = "kola.toml",
        dotfile_name = ".kola.toml",
        project_file_name = "kola.toml"
    )
)]
pub struct OpenStackConfig {
    /// Path to the `openstack` executable.
    #[ortho_config(default = "openstack".to_owned())]
    pub cli_bin: String,
    /// Cloud entry from `clouds.yaml`; `OS_*` variables apply when unset.
    pub cloud: Option<String>,
    /// Flavor name or id.
    #[ortho_config(default = "v1-standard-1".to_owned())]
    pub flavor: String,
    /// Image name or id.
    #[ortho_config(default = String::new())]
    pub image: String,
    /// Network attached to every server.
    pub network: Option<String>,
    /// External network to allocate floating addresses from; servers keep
    /// only their fixed address when unset.
    pub floating_ip_network: Option<String>,
}

impl OpenStackConfig {
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
            &FieldMetadata::new(
                "OpenStack CLI binary",
                "KOLA_OPENSTACK_CLI_BIN",
                "cli_bin",
                "openstack",
            ),
        )?;
        require_field(
            &self.flavor,
            &FieldMetadata::new("flavor", "KOLA_OPENSTACK_FLAVOR", "flavor", "openstack"),
        )?;
        require_field(
            &self.image,
            &FieldMetadata::new("image", "KOLA_OPENSTACK_IMAGE", "image", "openstack"),
        )?;
        Ok(())
    }
}
