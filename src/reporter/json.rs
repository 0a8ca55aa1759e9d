//! JSON report in the `{"tests":[...],"result","platform","version"}` layout
//! consumed by existing CI tooling.

use std::io::Write;

use camino::Utf8Path;
use cap_std::{ambient_authority, fs_utf8::Dir, fs_utf8::File};
use serde::Serialize;

use super::{Outcome, Reporter, ReporterError, TestRecord};

#[derive(Serialize)]
struct Report<'a> {
    tests: &'a [TestRecord],
    result: Outcome,
    platform: &'a str,
    version: &'a str,
}

/// Writes every result as a single JSON object.
#[derive(Debug)]
pub struct JsonReporter<W> {
    sink: W,
    target: String,
    platform: String,
    version: String,
    tests: Vec<TestRecord>,
}

impl<W: Write> JsonReporter<W> {
    /// Creates a reporter writing into `sink`.
    #[must_use]
    pub fn new(sink: W, platform: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            sink,
            target: String::from("<writer>"),
            platform: platform.into(),
            version: version.into(),
            tests: Vec::new(),
        }
    }

    /// Results recorded so far.
    #[must_use]
    pub fn tests(&self) -> &[TestRecord] {
        &self.tests
    }

    /// Writes the report and hands back the sink.
    ///
    /// # Errors
    ///
    /// Returns [`ReporterError`] when encoding or writing fails.
    pub fn write_report(mut self, result: Outcome) -> Result<W, ReporterError> {
        let report = Report {
            tests: &self.tests,
            result,
            platform: &self.platform,
            version: &self.version,
        };
        let encoded = serde_json::to_vec(&report)?;
        self.sink
            .write_all(&encoded)
            .and_then(|()| self.sink.flush())
            .map_err(|err| ReporterError::Io {
                target: self.target.clone(),
                message: err.to_string(),
            })?;
        Ok(self.sink)
    }
}

impl JsonReporter<File> {
    /// Creates a reporter writing to `path`, replacing any existing file.
    ///
    /// # Errors
    ///
    /// Returns [`ReporterError::Io`] when the file cannot be created.
    pub fn create(
        path: &Utf8Path,
        platform: impl Into<String>,
        version: impl Into<String>,
    ) -> Result<Self, ReporterError> {
        let io_error = |err: std::io::Error| ReporterError::Io {
            target: path.to_string(),
            message: err.to_string(),
        };
        let parent = match path.parent() {
            Some(parent) if !parent.as_str().is_empty() => parent,
            _ => Utf8Path::new("."),
        };
        let name = path.file_name().ok_or_else(|| ReporterError::Io {
            target: path.to_string(),
            message: String::from("path has no file name"),
        })?;
        let dir = Dir::open_ambient_dir(parent, ambient_authority()).map_err(io_error)?;
        let file = dir.create(name).map_err(io_error)?;
        let mut reporter = Self::new(file, platform, version);
        reporter.target = path.to_string();
        Ok(reporter)
    }
}

impl<W: Write + Send + std::fmt::Debug> Reporter for JsonReporter<W> {
    fn report_test(&mut self, record: &TestRecord) {
        self.tests.push(record.clone());
    }

    fn finish(self: Box<Self>, result: Outcome) -> Result<(), ReporterError> {
        (*self).write_report(result).map(drop)
    }
}
