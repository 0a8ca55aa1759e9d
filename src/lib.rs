//! Core library for the kola cloud test runner.
//!
//! The crate provisions short-lived machines on one of several cloud
//! providers, groups them into clusters owned by a single test, runs test
//! bodies against them over SSH and reports the results as JSON. Every
//! resource created along the way is released again, even when a test
//! fails, panics or is interrupted.

pub mod cleanup;
pub mod cluster;
pub mod command;
pub mod config;
pub mod harness;
pub mod journal;
pub mod logging;
pub mod machine;
pub mod provider;
pub mod reporter;
pub mod retry;
pub mod ssh;
pub mod suite;
pub mod test_support;
pub mod userdata;

pub use cleanup::TeardownError;
pub use cluster::{Cluster, ClusterError, ClusterOptions};
pub use config::{ConfigError, KolaConfig};
pub use harness::{Harness, HarnessError, HarnessOptions, Test, TestCluster, TestFailure};
pub use machine::{Machine, MachineError, MachineId, MachineState};
pub use provider::{Platform, Provider, ProviderConfig, ProviderError};
pub use reporter::{JsonReporter, Outcome, Reporter, Reporters, TestRecord};
pub use retry::{CancelSignal, Poll, PollError};
pub use ssh::{OpenSsh, SshConfig, SshError, SshExecutor};
pub use userdata::UserData;
