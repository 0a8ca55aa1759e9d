//! Local copy of a machine's systemd journal.

use std::net::IpAddr;

use camino::{Utf8Path, Utf8PathBuf};
use cap_std::{ambient_authority, fs_utf8::Dir};
use thiserror::Error;

use crate::ssh::{SshError, SshExecutor};

/// File name of the journal inside the machine directory.
pub const JOURNAL_FILE: &str = "journal.txt";

const JOURNAL_COMMAND: &str = "journalctl --no-pager --output=short-precise";

/// Errors raised by [`Journal`].
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum JournalError {
    /// Raised when the journal file cannot be written or read.
    #[error("journal {path}: {message}")]
    Io {
        /// Journal file path.
        path: Utf8PathBuf,
        /// Underlying I/O error.
        message: String,
    },
    /// Raised when the remote `journalctl` call fails.
    #[error("collecting journal: {0}")]
    Ssh(#[from] SshError),
    /// Raised when collecting into a closed journal.
    #[error("journal {path} is closed")]
    Closed {
        /// Journal file path.
        path: Utf8PathBuf,
    },
}

/// Journal snapshot stored as `journal.txt` in a machine directory.
#[derive(Debug)]
pub struct Journal {
    dir: Dir,
    path: Utf8PathBuf,
    closed: bool,
}

impl Journal {
    /// Creates an empty `journal.txt` in `machine_dir`.
    ///
    /// # Errors
    ///
    /// Returns [`JournalError::Io`] when the directory cannot be opened or
    /// the file cannot be created.
    pub fn open(machine_dir: &Utf8Path) -> Result<Self, JournalError> {
        let path = machine_dir.join(JOURNAL_FILE);
        let io_error = |err: std::io::Error| JournalError::Io {
            path: path.clone(),
            message: err.to_string(),
        };
        let dir = Dir::open_ambient_dir(machine_dir, ambient_authority()).map_err(io_error)?;
        dir.write(JOURNAL_FILE, b"").map_err(io_error)?;
        Ok(Self {
            dir,
            path,
            closed: false,
        })
    }

    /// Location of the journal file.
    #[must_use]
    pub fn path(&self) -> &Utf8Path {
        &self.path
    }

    /// Returns `true` once [`Journal::close`] has been called.
    #[must_use]
    pub const fn is_closed(&self) -> bool {
        self.closed
    }

    /// Replaces the local copy with the machine's current journal.
    ///
    /// # Errors
    ///
    /// Returns [`JournalError::Closed`] after [`Journal::close`], an SSH
    /// error when `journalctl` fails, and [`JournalError::Io`] when the
    /// snapshot cannot be written.
    pub async fn collect(
        &mut self,
        ssh: &dyn SshExecutor,
        host: IpAddr,
    ) -> Result<(), JournalError> {
        if self.closed {
            return Err(JournalError::Closed {
                path: self.path.clone(),
            });
        }
        let output = ssh.exec(host, JOURNAL_COMMAND).await?;
        self.dir
            .write(JOURNAL_FILE, output.stdout.as_bytes())
            .map_err(|err| self.io_error(&err))
    }

    /// Returns the last collected snapshot.
    ///
    /// # Errors
    ///
    /// Returns [`JournalError::Io`] when the file cannot be read.
    pub fn read(&self) -> Result<String, JournalError> {
        self.dir
            .read_to_string(JOURNAL_FILE)
            .map_err(|err| self.io_error(&err))
    }

    /// Stops further collection. Calling it again has no effect.
    pub fn close(&mut self) {
        self.closed = true;
    }

    fn io_error(&self, err: &std::io::Error) -> JournalError {
        JournalError::Io {
            path: self.path.clone(),
            message: err.to_string(),
        }
    }
}

#[cfg(test)]
mod tests;
