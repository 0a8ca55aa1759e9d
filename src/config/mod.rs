//! Configuration loading via `ortho-config`.
//!
//! Settings are split the same way the code is: [`KolaConfig`] holds the run
//! level knobs, [`crate::ssh::SshConfig`] the SSH client settings and each
//! provider owns its own section (`[aws]`, `[azure]`, ...). Every section
//! merges defaults, `kola.toml`, and environment variables.

use std::time::Duration;

use camino::{Utf8Path, Utf8PathBuf};
use ortho_config::OrthoConfig;
use serde::Deserialize;
use thiserror::Error;

use crate::provider::Platform;
use crate::retry::Poll;
use crate::ssh::expand_tilde;
use crate::userdata::read_to_string_ambient;

/// Run-level settings shared by every platform.
#[derive(Clone, Debug, Deserialize, OrthoConfig, PartialEq, Eq)]
#[ortho_config(
    prefix = "KOLA",
    discovery(
        app_name = "kola",
        env_var = "KOLA_CONFIG_PATH",
        config_file_name = "kola.toml",
        dotfile_name = ".kola.toml",
        project_file_name = "kola.toml"
    )
)]
pub struct KolaConfig {
    /// Cloud platform to run against (`aws`, `azure`, `openstack`, `packet`,
    /// `ibmcloud` or `oci`).
    #[ortho_config(default = "aws".to_owned())]
    pub platform: String,
    /// Directory receiving per-test and per-machine artefacts.
    #[ortho_config(default = "_kola_temp".to_owned())]
    pub output_dir: String,
    /// Maximum number of tests running at the same time.
    #[ortho_config(default = 1)]
    pub parallel: usize,
    /// Prefix for cluster and machine names.
    #[ortho_config(default = "kola".to_owned())]
    pub base_name: String,
    /// Public key registered with the provider for every cluster.
    pub ssh_public_key_file: Option<String>,
    /// Skip injecting the SSH key through provider metadata and rely on
    /// user-data alone.
    #[ortho_config(default = false)]
    pub no_ssh_key_in_metadata: bool,
    /// Seconds to wait for a new machine to accept SSH.
    #[ortho_config(default = 600)]
    pub boot_timeout_secs: u64,
    /// Seconds between two SSH readiness probes.
    #[ortho_config(default = 10)]
    pub boot_interval_secs: u64,
    /// Minimum age in seconds before `kola-gc` removes a tagged instance.
    #[ortho_config(default = 3600)]
    pub gc_grace_period_secs: u64,
    /// Version string recorded in the JSON report.
    #[ortho_config(default = "unknown".to_owned())]
    pub report_version: String,
    /// Local update payload served to machines by the update test.
    pub update_payload: Option<String>,
    /// Local path of the `kolet` helper copied to machines.
    #[ortho_config(default = "kolet".to_owned())]
    pub kolet_path: String,
}

/// Metadata for a configuration field, used to generate actionable error messages.
pub(crate) struct FieldMetadata {
    description: &'static str,
    env_var: &'static str,
    toml_key: &'static str,
    section: &'static str,
}

impl FieldMetadata {
    pub(crate) const fn new(
        description: &'static str,
        env_var: &'static str,
        toml_key: &'static str,
        section: &'static str,
    ) -> Self {
        Self {
            description,
            env_var,
            toml_key,
            section,
        }
    }
}

/// Rejects blank values with a message naming the env var and TOML key.
pub(crate) fn require_field(value: &str, metadata: &FieldMetadata) -> Result<(), ConfigError> {
    if value.trim().is_empty() {
        return Err(ConfigError::MissingField(format!(
            "missing {}: set {} or add {} to [{}] in kola.toml",
            metadata.description, metadata.env_var, metadata.toml_key, metadata.section
        )));
    }
    Ok(())
}

impl KolaConfig {
    /// Loads configuration without attempting to parse CLI arguments. Values
    /// still merge defaults, configuration files, and environment variables.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] when the merge fails.
    pub fn load_without_cli_args() -> Result<Self, ConfigError> {
        Self::load_from_iter([std::ffi::OsString::from("kola")])
            .map_err(|err| ConfigError::Parse(err.to_string()))
    }

    /// Performs semantic validation on required fields.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::MissingField`] when a required field is empty
    /// and [`ConfigError::Invalid`] for unknown platforms or a zero
    /// parallelism.
    pub fn validate(&self) -> Result<(), ConfigError> {
        require_field(
            &self.platform,
            &FieldMetadata::new("platform", "KOLA_PLATFORM", "platform", "kola"),
        )?;
        require_field(
            &self.output_dir,
            &FieldMetadata::new("output directory", "KOLA_OUTPUT_DIR", "output_dir", "kola"),
        )?;
        require_field(
            &self.base_name,
            &FieldMetadata::new("cluster base name", "KOLA_BASE_NAME", "base_name", "kola"),
        )?;
        self.platform()?;
        if self.parallel == 0 {
            return Err(ConfigError::Invalid(String::from(
                "parallel must be at least 1 (KOLA_PARALLEL)",
            )));
        }
        if self.boot_interval_secs == 0 {
            return Err(ConfigError::Invalid(String::from(
                "boot_interval_secs must be at least 1 (KOLA_BOOT_INTERVAL_SECS)",
            )));
        }
        Ok(())
    }

    /// Parses the configured platform name.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] for unknown platform names.
    pub fn platform(&self) -> Result<Platform, ConfigError> {
        self.platform
            .parse()
            .map_err(|err: crate::provider::UnknownPlatform| ConfigError::Invalid(err.to_string()))
    }

    /// Readiness budget for new machines.
    #[must_use]
    pub const fn boot_poll(&self) -> Poll {
        Poll::new(
            Duration::from_secs(self.boot_timeout_secs),
            Duration::from_secs(self.boot_interval_secs),
        )
    }

    /// Minimum age of instances removed by garbage collection.
    #[must_use]
    pub const fn gc_grace_period(&self) -> Duration {
        Duration::from_secs(self.gc_grace_period_secs)
    }

    /// Reads the configured public key, trimmed, expanding a leading `~/`.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] when the key file cannot be read.
    pub fn ssh_public_key(&self) -> Result<Option<String>, ConfigError> {
        let Some(path) = self.ssh_public_key_file.as_deref() else {
            return Ok(None);
        };
        let expanded = expand_tilde(path);
        read_to_string_ambient(Utf8Path::new(&expanded))
            .map(|key| Some(key.trim().to_owned()))
            .map_err(|message| {
                ConfigError::Invalid(format!(
                    "ssh public key {path}: {message} (KOLA_SSH_PUBLIC_KEY_FILE)"
                ))
            })
    }

    /// Output directory as a UTF-8 path.
    #[must_use]
    pub fn output_path(&self) -> Utf8PathBuf {
        Utf8PathBuf::from(&self.output_dir)
    }
}

/// Errors raised during configuration loading and validation.
#[derive(Debug, Error, Eq, PartialEq)]
pub enum ConfigError {
    /// Indicates a required configuration field is empty or missing.
    #[error("missing configuration field: {0}")]
    MissingField(String),
    /// Indicates a value that is present but unusable.
    #[error("invalid configuration: {0}")]
    Invalid(String),
    /// Surfaces errors from the `ortho-config` loader.
    #[error("configuration parsing failed: {0}")]
    Parse(String),
}

impl From<ortho_config::OrthoError> for ConfigError {
    fn from(value: ortho_config::OrthoError) -> Self {
        Self::Parse(value.to_string())
    }
}

#[cfg(test)]
mod tests;
