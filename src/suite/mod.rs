//! Built-in tests run against live clusters.

use std::collections::HashMap;

use crate::harness::{Harness, HarnessError};

mod nfs;
mod update;

/// Registers every built-in test with `harness`.
///
/// # Errors
///
/// Returns [`HarnessError::Duplicate`] when a test is already registered.
pub fn register_all(harness: &mut Harness) -> Result<(), HarnessError> {
    for test in nfs::tests().into_iter().chain(update::tests()) {
        harness.register(test)?;
    }
    Ok(())
}

/// Parses newline separated `KEY=VALUE` pairs. Lines without `=` are
/// ignored and values keep any further `=` characters.
#[must_use]
pub fn split_newline_env(envs: &str) -> HashMap<String, String> {
    envs.lines()
        .filter_map(|line| line.split_once('='))
        .map(|(key, value)| (key.to_owned(), value.to_owned()))
        .collect()
}

/// Parses whitespace separated `KEY=VALUE` pairs such as a kernel command
/// line. Words without `=` are ignored.
#[must_use]
pub fn split_space_env(envs: &str) -> HashMap<String, String> {
    envs.split_whitespace()
        .filter_map(|word| word.split_once('='))
        .map(|(key, value)| (key.to_owned(), value.to_owned()))
        .collect()
}
