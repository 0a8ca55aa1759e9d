//! Error type shared by every provider.

use thiserror::Error;

use crate::command::CommandError;
use crate::retry::PollError;

use super::Platform;

/// Errors raised by provider operations.
///
/// Each variant names the step that failed so a multi-step creation chain
/// reports where it stopped.
#[derive(Debug, Error)]
pub enum ProviderError {
    /// Raised when provider settings are missing or inconsistent.
    #[error("invalid {platform} options: {message}")]
    InvalidOptions {
        /// Platform whose options were rejected.
        platform: Platform,
        /// Description of the problem.
        message: String,
    },
    /// Raised when a vendor CLI call fails.
    #[error("{step}: {source}")]
    Command {
        /// Step being performed.
        step: String,
        /// Underlying command failure.
        #[source]
        source: CommandError,
    },
    /// Raised when vendor CLI output cannot be interpreted.
    #[error("{step}: failed to parse output: {message}")]
    Parse {
        /// Step being performed.
        step: String,
        /// Parser error message.
        message: String,
    },
    /// Raised when an instance never reached the awaited state.
    #[error("{step}: {source}")]
    Readiness {
        /// Step being awaited.
        step: String,
        /// Timeout, cancellation or the fatal error that stopped the poll.
        #[source]
        source: Box<PollError<ProviderError>>,
    },
    /// Raised when an instance entered a state it cannot recover from.
    #[error("instance {instance_id} entered state {state}")]
    InstanceFailed {
        /// Provider identifier of the instance.
        instance_id: String,
        /// Reported state.
        state: String,
    },
    /// Raised when a running instance lacks a required address.
    #[error("instance {instance_id} has no {kind} address")]
    MissingAddress {
        /// Provider identifier of the instance.
        instance_id: String,
        /// `public` or `private`.
        kind: &'static str,
    },
    /// Raised when an operation needs state created by `setup`.
    #[error("{platform} provider used before cluster setup")]
    NotSetUp {
        /// Platform of the provider.
        platform: Platform,
    },
    /// Raised when `setup` runs more than once.
    #[error("{platform} provider was already set up")]
    AlreadySetUp {
        /// Platform of the provider.
        platform: Platform,
    },
    /// Raised when a local scratch file cannot be written.
    #[error("{step}: {message}")]
    Io {
        /// Step being performed.
        step: String,
        /// Operating system error string.
        message: String,
    },
    /// Raised when fetching console output over HTTP fails.
    #[error("{step}: {message}")]
    Http {
        /// Step being performed.
        step: String,
        /// Transport error message.
        message: String,
    },
}

impl ProviderError {
    /// Returns `true` when the error is a readiness timeout rather than a hard
    /// failure.
    #[must_use]
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Readiness { source, .. } if source.is_timeout())
    }

    pub(crate) fn readiness(step: &str, source: PollError<Self>) -> Self {
        Self::Readiness {
            step: step.to_owned(),
            source: Box::new(source),
        }
    }
}
