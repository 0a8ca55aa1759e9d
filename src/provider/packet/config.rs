//! `[packet]` configuration section.

use ortho_config::OrthoConfig;
use serde::Deserialize;

use crate::config::{ConfigError, FieldMetadata, require_field};

/// Packet (Equinix Metal) settings loaded via `ortho-config`.
#[derive(Clone, Debug, Deserialize, OrthoConfig, PartialEq, Eq)]
#[ortho_config(
    prefix = "KOLA_PACKET",
    discovery(
        app_name = "kola",
        env_var = "KOLA_CONFIG_PATH",
        config_file_name = "kola.toml",
        dotfile_name = ".kola.toml",
        project_file_name = "kola.toml"
    )
)]
pub struct PacketConfig {
    /// Path to the `metal` executable.
    #[ortho_config(default = "metal".to_owned())]
    pub cli_bin: String,
    /// Project owning every device.
    #[ortho_config(default = String::new())]
    pub project: String,
    /// Metro devices are provisioned in.
    #[ortho_config(default = "sv".to_owned())]
    pub metro: String,
    /// Hardware plan.
    #[ortho_config(default = "c3.small.x86".to_owned())]
    pub plan: String,
    /// Operating system slug.
    #[ortho_config(default = "flatcar_stable".to_owned())]
    pub operating_system: String,
}

impl PacketConfig {
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
            &FieldMetadata::new("Metal CLI binary", "KOLA_PACKET_CLI_BIN", "cli_bin", "packet"),
        )?;
        require_field(
            &self.project,
            &FieldMetadata::new("project ID", "KOLA_PACKET_PROJECT", "project", "packet"),
        )?;
        require_field(
            &self.metro,
            &FieldMetadata::new("metro", "KOLA_PACKET_METRO", "metro", "packet"),
        )?;
        require_field(
            &self.plan,
            &FieldMetadata::new("plan", "KOLA_PACKET_PLAN", "plan", "packet"),
        )?;
        require_field(
            &self.operating_system,
            &FieldMetadata::new(
                "operating system",
                "KOLA_PACKET_OPERATING_SYSTEM",
                "operating_system",
                "packet",
            ),
        )?;
        Ok(())
    }
}
