//! Best-effort teardown bookkeeping.
//!
//! Destroying a machine or a cluster runs a fixed list of steps. Every step
//! is attempted even when an earlier one failed, and the failures are
//! reported together once the list is exhausted.

use std::fmt;

use slog::{Logger, warn};
use thiserror::Error;

/// A single failed teardown step.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct StepFailure {
    /// Resource the step operated on (machine id, cluster name, ...).
    pub subject: String,
    /// Step name, for example `terminate instance`.
    pub step: String,
    /// Rendered error message.
    pub message: String,
}

impl fmt::Display for StepFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}: {}", self.subject, self.step, self.message)
    }
}

/// Aggregate of every step that failed during teardown.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
#[error("teardown failed: {}", render_failures(.failures))]
pub struct TeardownError {
    /// Failures in the order they happened.
    pub failures: Vec<StepFailure>,
}

impl TeardownError {
    /// Folds another aggregate into this one, keeping order.
    pub fn merge(&mut self, other: Self) {
        self.failures.extend(other.failures);
    }

    /// Returns `true` when any failure was recorded for `step`.
    #[must_use]
    pub fn has_step(&self, step: &str) -> bool {
        self.failures.iter().any(|failure| failure.step == step)
    }
}

fn render_failures(failures: &[StepFailure]) -> String {
    failures
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// Collects step outcomes for one subject.
#[derive(Debug)]
pub struct Cleanup {
    subject: String,
    log: Logger,
    failures: Vec<StepFailure>,
}

impl Cleanup {
    /// Starts a teardown for `subject`.
    #[must_use]
    pub fn new(subject: impl Into<String>, log: &Logger) -> Self {
        Self {
            subject: subject.into(),
            log: log.clone(),
            failures: Vec::new(),
        }
    }

    /// Records the outcome of a step, logging failures.
    pub fn step<T, E: fmt::Display>(&mut self, step: &str, result: Result<T, E>) -> Option<T> {
        match result {
            Ok(value) => Some(value),
            Err(err) => {
                warn!(
                    self.log,
                    "teardown step failed";
                    "subject" => &self.subject,
                    "step" => step,
                    "error" => %err
                );
                self.failures.push(StepFailure {
                    subject: self.subject.clone(),
                    step: step.to_owned(),
                    message: err.to_string(),
                });
                None
            }
        }
    }

    /// Absorbs a nested teardown aggregate.
    pub fn absorb(&mut self, result: Result<(), TeardownError>) {
        if let Err(err) = result {
            self.failures.extend(err.failures);
        }
    }

    /// Finishes the teardown.
    ///
    /// # Errors
    ///
    /// Returns [`TeardownError`] listing every failed step.
    pub fn finish(self) -> Result<(), TeardownError> {
        if self.failures.is_empty() {
            Ok(())
        } else {
            Err(TeardownError {
                failures: self.failures,
            })
        }
    }
}

/// Appends a teardown failure to the message of the error that caused the
/// teardown.
pub(crate) fn append_teardown_note<E: fmt::Display>(
    message: String,
    teardown_error: Option<&E>,
) -> String {
    if let Some(teardown) = teardown_error {
        format!("{message} (teardown also failed: {teardown})")
    } else {
        message
    }
}

#[cfg(test)]
mod tests;
