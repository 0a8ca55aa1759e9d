//! Test result reporting.
//!
//! Reporters accumulate one [`TestRecord`] per finished test and write their
//! output exactly once, when [`Reporter::finish`] consumes them together
//! with the overall run result.

use std::fmt;
use std::time::Duration;

use serde::{Serialize, Serializer};
use thiserror::Error;

mod json;

pub use json::JsonReporter;

/// Result of one test or of a whole run.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Outcome {
    /// Every check passed.
    Pass,
    /// A check failed, the test panicked, or teardown failed.
    Fail,
    /// The test did not run on this platform or configuration.
    Skip,
}

impl Outcome {
    /// Overall result of a run: failed when any test failed.
    #[must_use]
    pub fn overall<'a>(records: impl IntoIterator<Item = &'a TestRecord>) -> Self {
        if records
            .into_iter()
            .any(|record| record.result == Self::Fail)
        {
            Self::Fail
        } else {
            Self::Pass
        }
    }

    /// Upper-case name used in reports.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pass => "PASS",
            Self::Fail => "FAIL",
            Self::Skip => "SKIP",
        }
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of a single test.
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub struct TestRecord {
    /// Registered test name.
    pub name: String,
    /// Test result.
    pub result: Outcome,
    /// Wall-clock run time, serialised as integer nanoseconds.
    #[serde(serialize_with = "serialize_nanos")]
    pub duration: Duration,
    /// Captured test output.
    pub output: String,
}

fn serialize_nanos<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_u64(u64::try_from(duration.as_nanos()).unwrap_or(u64::MAX))
}

/// Errors raised while writing reports.
#[derive(Debug, Error)]
pub enum ReporterError {
    /// The report sink could not be opened or written.
    #[error("writing report {target}: {message}")]
    Io {
        /// File name or sink description.
        target: String,
        /// Underlying I/O error.
        message: String,
    },
    /// The report could not be encoded.
    #[error("encoding report: {0}")]
    Encode(#[from] serde_json::Error),
    /// Several reporters failed.
    #[error("{} reporters failed: {}", .0.len(), render_errors(.0))]
    Sinks(Vec<ReporterError>),
}

fn render_errors(errors: &[ReporterError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// A sink for test results.
pub trait Reporter: fmt::Debug + Send {
    /// Appends one test result.
    fn report_test(&mut self, record: &TestRecord);

    /// Records the overall result and writes the report.
    ///
    /// # Errors
    ///
    /// Returns [`ReporterError`] when the report cannot be written.
    fn finish(self: Box<Self>, result: Outcome) -> Result<(), ReporterError>;
}

/// Fans results out to several reporters.
#[derive(Debug, Default)]
pub struct Reporters {
    reporters: Vec<Box<dyn Reporter>>,
}

impl Reporters {
    /// Creates an empty fan-out.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a reporter.
    pub fn push(&mut self, reporter: Box<dyn Reporter>) {
        self.reporters.push(reporter);
    }

    /// Number of attached reporters.
    #[must_use]
    pub fn len(&self) -> usize {
        self.reporters.len()
    }

    /// Returns `true` when no reporter is attached.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.reporters.is_empty()
    }
}

impl Reporter for Reporters {
    fn report_test(&mut self, record: &TestRecord) {
        for reporter in &mut self.reporters {
            reporter.report_test(record);
        }
    }

    fn finish(self: Box<Self>, result: Outcome) -> Result<(), ReporterError> {
        let errors: Vec<ReporterError> = self
            .reporters
            .into_iter()
            .filter_map(|reporter| reporter.finish(result).err())
            .collect();
        if errors.is_empty() {
            Ok(())
        } else {
            Err(ReporterError::Sinks(errors))
        }
    }
}

#[cfg(test)]
mod tests;
