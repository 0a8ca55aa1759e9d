//! `[ssh]` configuration section.

use ortho_config::OrthoConfig;
use serde::Deserialize;

use crate::config::{ConfigError, FieldMetadata, require_field};

/// SSH client settings loaded via `ortho-config`.
#[derive(Clone, Debug, Deserialize, OrthoConfig, PartialEq, Eq)]
#[ortho_config(
    prefix = "KOLA_SSH",
    discovery(
        app_name = "kola",
        env_var = "KOLA_CONFIG_PATH",
        config_file_name = "kola.toml",
        dotfile_name = ".kola.toml",
        project_file_name = "kola.toml"
    )
)]
pub struct SshConfig {
    /// Path to the `ssh` executable.
    #[ortho_config(default = "ssh".to_owned())]
    pub ssh_bin: String,
    /// Path to the `scp` executable.
    #[ortho_config(default = "scp".to_owned())]
    pub scp_bin: String,
    /// Remote user to connect as.
    #[ortho_config(default = "core".to_owned())]
    pub user: String,
    /// Private key matching the cluster's public key. Supports `~/`
    /// expansion; the client's default keys are tried when unset.
    pub identity_file: Option<String>,
    /// SSH port on the machines.
    #[ortho_config(default = 22)]
    pub port: u16,
    /// Whether to force batch mode so the client never prompts.
    #[ortho_config(default = true)]
    pub batch_mode: bool,
    /// Whether to enforce host key checking. Test machines are fresh on
    /// every run, so this is off by default.
    #[ortho_config(default = false)]
    pub strict_host_key_checking: bool,
    /// Known hosts file override.
    #[ortho_config(default = "/dev/null".to_owned())]
    pub known_hosts_file: String,
    /// Seconds the client waits for the TCP connection.
    #[ortho_config(default = 10)]
    pub connect_timeout_secs: u64,
}

impl SshConfig {
    /// Loads the section from defaults, `kola.toml` and the environment.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] when the merge fails.
    pub fn load_without_cli_args() -> Result<Self, ConfigError> {
        Self::load_from_iter([std::ffi::OsString::from("kola")])
            .map_err(|err| ConfigError::Parse(err.to_string()))
    }

    /// Ensures the client binaries and user are set.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::MissingField`] for blank values and
    /// [`ConfigError::Invalid`] for a blank identity file.
    pub fn validate(&self) -> Result<(), ConfigError> {
        require_field(
            &self.ssh_bin,
            &FieldMetadata::new("ssh binary", "KOLA_SSH_SSH_BIN", "ssh_bin", "ssh"),
        )?;
        require_field(
            &self.scp_bin,
            &FieldMetadata::new("scp binary", "KOLA_SSH_SCP_BIN", "scp_bin", "ssh"),
        )?;
        require_field(
            &self.user,
            &FieldMetadata::new("SSH user", "KOLA_SSH_USER", "user", "ssh"),
        )?;
        match self.identity_file.as_deref() {
            Some(path) if path.trim().is_empty() => Err(ConfigError::Invalid(String::from(
                "identity_file must not be blank (KOLA_SSH_IDENTITY_FILE)",
            ))),
            _ => Ok(()),
        }
    }
}

/// Expands a leading `~/` prefix to the user's home directory.
///
/// The input is returned unchanged when `HOME` is not set.
#[must_use]
pub fn expand_tilde(path: &str) -> String {
    if let Some(rest) = path.strip_prefix("~/")
        && let Some(home) = std::env::var_os("HOME")
    {
        return format!("{}/{rest}", home.to_string_lossy());
    }
    path.to_owned()
}
