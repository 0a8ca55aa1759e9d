//! Machine error type.

use thiserror::Error;

use crate::journal::JournalError;
use crate::provider::ProviderError;
use crate::retry::PollError;
use crate::ssh::SshError;

use super::MachineState;

/// Errors raised by [`super::Machine`] operations.
#[derive(Debug, Error)]
pub enum MachineError {
    /// The owning cluster has been dropped.
    #[error("machine {machine}: cluster is gone")]
    ClusterGone {
        /// Machine identifier.
        machine: String,
    },
    /// The machine has no public address to connect to.
    #[error("machine {machine} has no public address")]
    NoAddress {
        /// Machine identifier.
        machine: String,
    },
    /// The operation is not valid in the current state.
    #[error("machine {machine}: cannot {operation} while {state}")]
    InvalidState {
        /// Machine identifier.
        machine: String,
        /// Attempted operation.
        operation: &'static str,
        /// State at the time of the call.
        state: MachineState,
    },
    /// A provider call failed.
    #[error("machine {machine}: {source}")]
    Provider {
        /// Machine identifier.
        machine: String,
        /// Provider failure.
        #[source]
        source: ProviderError,
    },
    /// A remote command failed.
    #[error("machine {machine}: {source}")]
    Ssh {
        /// Machine identifier.
        machine: String,
        /// SSH failure.
        #[source]
        source: SshError,
    },
    /// The machine did not reach the awaited state.
    #[error("machine {machine}: {step}: {source}")]
    Readiness {
        /// Machine identifier.
        machine: String,
        /// What was awaited.
        step: &'static str,
        /// Poll failure.
        #[source]
        source: Box<PollError<MachineError>>,
    },
    /// Systemd reported failed units after boot.
    #[error("machine {machine}: failed units: {}", units.join(", "))]
    FailedUnits {
        /// Machine identifier.
        machine: String,
        /// Names of the failed units.
        units: Vec<String>,
    },
    /// Local journal handling failed.
    #[error("machine {machine}: {source}")]
    Journal {
        /// Machine identifier.
        machine: String,
        /// Journal failure.
        #[source]
        source: JournalError,
    },
    /// Writing into the machine directory failed.
    #[error("machine {machine}: {path}: {message}")]
    Io {
        /// Machine identifier.
        machine: String,
        /// File or directory involved.
        path: String,
        /// Underlying I/O error.
        message: String,
    },
}

impl MachineError {
    /// Returns `true` when a readiness wait ran out of time rather than
    /// failing outright.
    #[must_use]
    pub fn is_timeout(&self) -> bool {
        match self {
            Self::Readiness { source, .. } => source.is_timeout(),
            Self::Provider { source, .. } => source.is_timeout(),
            _ => false,
        }
    }
}
