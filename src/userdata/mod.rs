//! User-data payloads handed to new machines.
//!
//! A payload is an Ignition or cloud-config document that may reference
//! `$public_ipv4` and `$private_ipv4`. The cluster swaps those for the
//! platform's metadata variables before the payload reaches the provider;
//! the guest agent expands them at boot.

use camino::Utf8Path;
use cap_std::{ambient_authority, fs_utf8::Dir};
use thiserror::Error;

use crate::provider::IpPlaceholders;
use crate::ssh::expand_tilde;

/// Placeholder for the machine's public IPv4 address.
pub const PUBLIC_IPV4: &str = "$public_ipv4";
/// Placeholder for the machine's private IPv4 address.
pub const PRIVATE_IPV4: &str = "$private_ipv4";

/// Errors raised while loading user-data.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum UserDataError {
    /// Raised when the payload file cannot be read.
    #[error("failed to read user-data from {path}: {message}")]
    Read {
        /// Path after tilde expansion.
        path: String,
        /// Underlying I/O error.
        message: String,
    },
}

/// An unrendered user-data payload.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct UserData {
    contents: String,
}

impl UserData {
    /// Wraps an Ignition or cloud-config document.
    #[must_use]
    pub fn ignition(contents: impl Into<String>) -> Self {
        Self {
            contents: contents.into(),
        }
    }

    /// A payload that configures nothing.
    #[must_use]
    pub fn empty() -> Self {
        Self::default()
    }

    /// Reads a payload from disk, expanding a leading `~/`.
    ///
    /// # Errors
    ///
    /// Returns [`UserDataError::Read`] when the file cannot be read.
    pub fn from_file(path: &str) -> Result<Self, UserDataError> {
        let expanded = expand_tilde(path);
        read_to_string_ambient(Utf8Path::new(&expanded))
            .map(Self::ignition)
            .map_err(|message| UserDataError::Read {
                path: expanded,
                message,
            })
    }

    /// Raw payload text.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.contents
    }

    /// Returns `true` when the payload is blank.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.contents.trim().is_empty()
    }

    /// Replaces every occurrence of each placeholder with its value.
    ///
    /// Values are inserted literally. Substitutions apply in order, so a later
    /// pair sees the output of earlier ones.
    #[must_use]
    pub fn render(&self, substitutions: &[(&str, &str)]) -> String {
        substitutions
            .iter()
            .filter(|(placeholder, _)| !placeholder.is_empty())
            .fold(self.contents.clone(), |text, (placeholder, value)| {
                text.replace(placeholder, value)
            })
    }

    /// Substitutes the address placeholders with a platform's metadata
    /// variables.
    #[must_use]
    pub fn render_for(&self, placeholders: IpPlaceholders) -> String {
        self.render(&[
            (PUBLIC_IPV4, placeholders.public_ipv4),
            (PRIVATE_IPV4, placeholders.private_ipv4),
        ])
    }
}

/// Reads a file through a `cap-std` handle on its parent directory.
pub(crate) fn read_to_string_ambient(path: &Utf8Path) -> Result<String, String> {
    let (dir_path, file_path) = match (path.parent(), path.file_name()) {
        (Some(parent), Some(name)) if !parent.as_str().is_empty() => {
            (parent, Utf8Path::new(name))
        }
        (_, Some(_)) => (Utf8Path::new("."), path),
        (_, None) => return Err(format!("path has no file name: {path}")),
    };
    let dir =
        Dir::open_ambient_dir(dir_path, ambient_authority()).map_err(|err| err.to_string())?;
    dir.read_to_string(file_path).map_err(|err| err.to_string())
}

#[cfg(test)]
mod tests;
