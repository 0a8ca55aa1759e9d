//! Runs registered tests, one cluster per test, and feeds the reporters.
//!
//! Each selected test waits for a slot of the parallelism budget, gets a
//! fresh [`Cluster`] from the [`ClusterFactory`], has its machines created
//! up front and then runs its body in a separate task so that a panic only
//! ends that test. The cluster is destroyed afterwards whatever the body
//! did, and a teardown failure fails the test.

use std::any::Any;
use std::fmt;
use std::future::Future;
use std::net::IpAddr;
use std::pin::Pin;
use std::sync::{Arc, PoisonError};
use std::time::Duration;

use camino::{Utf8Path, Utf8PathBuf};
use slog::{Logger, error, info, o, warn};
use thiserror::Error;
use tokio::sync::{Mutex, MutexGuard, Semaphore};
use tokio::task::JoinSet;
use tokio::time::Instant;

use crate::cluster::{Cluster, ClusterError};
use crate::machine::{Machine, MachineId};
use crate::provider::Platform;
use crate::reporter::{Outcome, Reporter, ReporterError, TestRecord};
use crate::retry::CancelSignal;
use crate::userdata::UserData;

mod factory;
mod signal;

pub use factory::{ClusterFactory, ClusterFuture, ProviderClusterFactory};
pub use signal::cancel_on_interrupt;

/// Future returned by a test body.
pub type TestFuture = Pin<Box<dyn Future<Output = Result<(), TestFailure>> + Send>>;

/// Why a test body stopped early.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum TestFailure {
    /// A check failed.
    #[error("{0}")]
    Failed(String),
    /// The test cannot produce a meaningful result here.
    #[error("skipped: {0}")]
    Skipped(String),
}

impl TestFailure {
    /// A failed check.
    #[must_use]
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed(message.into())
    }

    /// A skipped test.
    #[must_use]
    pub fn skipped(message: impl Into<String>) -> Self {
        Self::Skipped(message.into())
    }
}

/// Options shared by every test body.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct SuiteOptions {
    /// Update payload served by the update test.
    pub update_payload: Option<Utf8PathBuf>,
    /// Local `kolet` binary copied to machines that run native helpers.
    pub kolet: Option<Utf8PathBuf>,
}

/// A registered test.
#[derive(Clone)]
pub struct Test {
    /// Unique dotted name, e.g. `linux.nfs.v4`.
    pub name: String,
    /// Machines created before the body starts.
    pub cluster_size: usize,
    /// Platforms the test runs on; empty means all.
    pub platforms: Vec<Platform>,
    /// Platforms the test never runs on.
    pub exclude_platforms: Vec<Platform>,
    /// User data for the pre-created machines.
    pub user_data: UserData,
    /// Test body.
    pub run: fn(TestCluster) -> TestFuture,
}

impl fmt::Debug for Test {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Test")
            .field("name", &self.name)
            .field("cluster_size", &self.cluster_size)
            .field("platforms", &self.platforms)
            .field("exclude_platforms", &self.exclude_platforms)
            .finish_non_exhaustive()
    }
}

impl Test {
    /// Returns `true` when the test should run on `platform`.
    #[must_use]
    pub fn runs_on(&self, platform: Platform) -> bool {
        (self.platforms.is_empty() || self.platforms.contains(&platform))
            && !self.exclude_platforms.contains(&platform)
    }
}

/// The view of a cluster handed to a test body.
///
/// Cheap to clone; every clone shares the cluster and the captured output.
#[derive(Clone, Debug)]
pub struct TestCluster {
    test: String,
    platform: Platform,
    cluster: Arc<Mutex<Cluster>>,
    output: Arc<std::sync::Mutex<String>>,
    options: Arc<SuiteOptions>,
    cancel: CancelSignal,
    log: Logger,
}

impl TestCluster {
    fn new(test: &str, cluster: Cluster, runner: &TestRunner, log: &Logger) -> Self {
        Self {
            test: test.to_owned(),
            platform: cluster.platform(),
            cluster: Arc::new(Mutex::new(cluster)),
            output: Arc::new(std::sync::Mutex::new(String::new())),
            options: Arc::clone(&runner.suite),
            cancel: runner.cancel.clone(),
            log: log.clone(),
        }
    }

    /// Name of the running test.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.test
    }

    /// Platform the cluster runs on.
    #[must_use]
    pub const fn platform(&self) -> Platform {
        self.platform
    }

    /// Suite options.
    #[must_use]
    pub fn options(&self) -> &SuiteOptions {
        &self.options
    }

    /// Fires when the run is interrupted.
    #[must_use]
    pub const fn cancel(&self) -> &CancelSignal {
        &self.cancel
    }

    /// Locks the underlying cluster.
    pub async fn cluster(&self) -> MutexGuard<'_, Cluster> {
        self.cluster.lock().await
    }

    /// Identifiers of the cluster's machines in creation order.
    pub async fn machines(&self) -> Vec<MachineId> {
        self.cluster.lock().await.machine_ids()
    }

    /// Adds a machine to the cluster.
    ///
    /// # Errors
    ///
    /// Returns [`TestFailure::Failed`] when the machine does not boot.
    pub async fn new_machine(&self, user_data: &UserData) -> Result<MachineId, TestFailure> {
        let mut cluster = self.cluster.lock().await;
        let machine = cluster
            .new_machine(user_data)
            .await
            .map_err(|err| TestFailure::failed(format!("creating machine: {err}")))?;
        Ok(machine.id().clone())
    }

    /// Private address of machine `id`, or its public one when the platform
    /// has no private network.
    pub async fn private_ip(&self, id: &MachineId) -> Option<IpAddr> {
        self.cluster
            .lock()
            .await
            .machine(id)
            .and_then(Machine::private_ip)
    }

    /// Copies a local file onto machine `id`.
    ///
    /// # Errors
    ///
    /// Returns [`TestFailure::Failed`] when the copy fails.
    pub async fn copy_to(
        &self,
        id: &MachineId,
        local: &Utf8Path,
        remote: &str,
    ) -> Result<(), TestFailure> {
        let cluster = self.cluster.lock().await;
        cluster
            .copy_to(id, local, remote)
            .await
            .map_err(|err| TestFailure::failed(format!("copying {local} to {id}: {err}")))
    }

    /// Runs `command` on machine `id` and returns its trimmed stdout.
    ///
    /// # Errors
    ///
    /// Returns [`ClusterError`] when the machine is unknown or the command
    /// fails.
    pub async fn ssh(&self, id: &MachineId, command: &str) -> Result<String, ClusterError> {
        let cluster = self.cluster.lock().await;
        let output = cluster.ssh(id, command).await?;
        Ok(output.stdout.trim().to_owned())
    }

    /// Like [`TestCluster::ssh`] but turns any error into a test failure.
    ///
    /// # Errors
    ///
    /// Returns [`TestFailure::Failed`] naming the command when it fails.
    pub async fn must_ssh(&self, id: &MachineId, command: &str) -> Result<String, TestFailure> {
        self.ssh(id, command)
            .await
            .map_err(|err| TestFailure::failed(format!("{command:?} on {id} failed: {err}")))
    }

    /// Reboots machine `id` and waits for it to come back.
    ///
    /// # Errors
    ///
    /// Returns [`TestFailure::Failed`] when the machine does not return.
    pub async fn reboot(&self, id: &MachineId) -> Result<(), TestFailure> {
        let mut cluster = self.cluster.lock().await;
        cluster
            .reboot(id)
            .await
            .map_err(|err| TestFailure::failed(format!("rebooting {id}: {err}")))
    }

    /// Appends a line to the test output.
    pub fn log(&self, line: &str) {
        info!(self.log, "{}", line);
        let mut output = self.output.lock().unwrap_or_else(PoisonError::into_inner);
        output.push_str(line);
        output.push('\n');
    }

    fn take_output(&self) -> String {
        std::mem::take(&mut *self.output.lock().unwrap_or_else(PoisonError::into_inner))
    }
}

/// Run-wide harness settings.
#[derive(Clone, Debug)]
pub struct HarnessOptions {
    /// Platform every cluster is created on.
    pub platform: Platform,
    /// Substrings every selected test name must contain.
    pub include: Vec<String>,
    /// Substrings no selected test name may contain.
    pub exclude: Vec<String>,
    /// Maximum number of tests running at once.
    pub parallel: usize,
    /// Options passed to test bodies.
    pub suite: SuiteOptions,
}

/// Errors raised by [`Harness`].
#[derive(Debug, Error)]
pub enum HarnessError {
    /// Two tests share a name.
    #[error("test {0} registered twice")]
    Duplicate(String),
    /// A test runner task died outside the test body.
    #[error("test runner failed: {0}")]
    Runner(String),
    /// Writing the report failed.
    #[error(transparent)]
    Report(#[from] ReporterError),
}

/// Result of a harness run.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RunSummary {
    /// Overall result.
    pub result: Outcome,
    /// One record per selected test, in registration order.
    pub records: Vec<TestRecord>,
}

/// Test registry and runner.
#[derive(Debug)]
pub struct Harness {
    options: HarnessOptions,
    tests: Vec<Test>,
    log: Logger,
}

impl Harness {
    /// Creates an empty harness.
    #[must_use]
    pub fn new(options: HarnessOptions, log: &Logger) -> Self {
        Self {
            log: log.new(o!("platform" => options.platform.as_str())),
            options,
            tests: Vec::new(),
        }
    }

    /// Adds a test.
    ///
    /// # Errors
    ///
    /// Returns [`HarnessError::Duplicate`] when the name is taken.
    pub fn register(&mut self, test: Test) -> Result<(), HarnessError> {
        if self.tests.iter().any(|existing| existing.name == test.name) {
            return Err(HarnessError::Duplicate(test.name));
        }
        self.tests.push(test);
        Ok(())
    }

    /// Every registered test.
    #[must_use]
    pub fn tests(&self) -> &[Test] {
        &self.tests
    }

    /// Tests that pass the name filters and run on the configured platform,
    /// in registration order.
    #[must_use]
    pub fn selected(&self) -> Vec<&Test> {
        self.tests
            .iter()
            .filter(|test| self.matches(&test.name) && test.runs_on(self.options.platform))
            .collect()
    }

    fn matches(&self, name: &str) -> bool {
        self.options.include.iter().all(|inc| name.contains(inc.as_str()))
            && self.options.exclude.iter().all(|exc| !name.contains(exc.as_str()))
    }

    /// Runs the selected tests and writes the report.
    ///
    /// Records reach `reporter` in registration order regardless of the
    /// order in which tests finish. Tests that have not started when
    /// `cancel` fires are skipped.
    ///
    /// # Errors
    ///
    /// Returns [`HarnessError::Runner`] when a runner task dies and
    /// [`HarnessError::Report`] when the report cannot be written.
    pub async fn run(
        &self,
        factory: Arc<dyn ClusterFactory>,
        mut reporter: Box<dyn Reporter>,
        cancel: CancelSignal,
    ) -> Result<RunSummary, HarnessError> {
        let selected: Vec<Test> = self.selected().into_iter().cloned().collect();
        let count = selected.len();
        info!(self.log, "running tests"; "count" => count);
        let semaphore = Arc::new(Semaphore::new(self.options.parallel.max(1)));
        let suite = Arc::new(self.options.suite.clone());
        let mut set = JoinSet::new();
        for (index, test) in selected.into_iter().enumerate() {
            let runner = TestRunner {
                test,
                factory: Arc::clone(&factory),
                suite: Arc::clone(&suite),
                cancel: cancel.clone(),
                log: self.log.clone(),
            };
            let budget = Arc::clone(&semaphore);
            set.spawn(async move {
                let Ok(_permit) = budget.acquire_owned().await else {
                    return (index, runner.skipped("parallelism budget closed"));
                };
                (index, runner.run().await)
            });
        }

        let mut slots: Vec<Option<TestRecord>> = vec![None; count];
        let mut failures = Vec::new();
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok((index, record)) => {
                    if let Some(slot) = slots.get_mut(index) {
                        *slot = Some(record);
                    }
                }
                Err(err) => failures.push(err.to_string()),
            }
        }
        if !failures.is_empty() {
            return Err(HarnessError::Runner(failures.join("; ")));
        }

        let records: Vec<TestRecord> = slots.into_iter().flatten().collect();
        for record in &records {
            reporter.report_test(record);
        }
        let result = Outcome::overall(&records);
        info!(self.log, "run finished"; "result" => %result);
        reporter.finish(result)?;
        Ok(RunSummary { result, records })
    }
}

struct TestRunner {
    test: Test,
    factory: Arc<dyn ClusterFactory>,
    suite: Arc<SuiteOptions>,
    cancel: CancelSignal,
    log: Logger,
}

impl TestRunner {
    fn record(&self, result: Outcome, duration: Duration, output: String) -> TestRecord {
        TestRecord {
            name: self.test.name.clone(),
            result,
            duration,
            output,
        }
    }

    fn skipped(&self, reason: &str) -> TestRecord {
        self.record(Outcome::Skip, Duration::ZERO, format!("{reason}\n"))
    }

    async fn run(self) -> TestRecord {
        let log = self.log.new(o!("test" => self.test.name.clone()));
        if self.cancel.is_cancelled() {
            return self.skipped("run cancelled");
        }
        let started = Instant::now();
        info!(log, "test started");

        let cluster = match self.factory.create(&self.test.name, &self.cancel).await {
            Ok(cluster) => cluster,
            Err(err) => {
                error!(log, "cluster creation failed"; "error" => %err);
                return self.record(
                    Outcome::Fail,
                    started.elapsed(),
                    format!("cluster creation failed: {err}\n"),
                );
            }
        };
        let handle = TestCluster::new(&self.test.name, cluster, &self, &log);

        let mut result = match self.prepare(&handle).await {
            Ok(()) => self.body(&handle).await,
            Err(failure) => {
                handle.log(&failure.to_string());
                Outcome::from(&failure)
            }
        };

        if let Err(err) = handle.cluster.lock().await.destroy().await {
            warn!(log, "cluster teardown failed"; "error" => %err);
            handle.log(&format!("cluster teardown failed: {err}"));
            result = Outcome::Fail;
        }

        let duration = started.elapsed();
        info!(log, "test finished"; "result" => %result, "duration_ms" => duration.as_millis());
        self.record(result, duration, handle.take_output())
    }

    async fn prepare(&self, handle: &TestCluster) -> Result<(), TestFailure> {
        for _ in 0..self.test.cluster_size {
            handle.new_machine(&self.test.user_data).await?;
        }
        Ok(())
    }

    async fn body(&self, handle: &TestCluster) -> Outcome {
        let mut task = tokio::spawn((self.test.run)(handle.clone()));
        tokio::select! {
            joined = &mut task => match joined {
                Ok(Ok(())) => Outcome::Pass,
                Ok(Err(failure)) => {
                    handle.log(&failure.to_string());
                    Outcome::from(&failure)
                }
                Err(err) if err.is_panic() => {
                    handle.log(&format!("test panicked: {}", panic_message(err.into_panic())));
                    Outcome::Fail
                }
                Err(err) => {
                    handle.log(&format!("test aborted: {err}"));
                    Outcome::Fail
                }
            },
            () = self.cancel.cancelled() => {
                task.abort();
                handle.log("run cancelled");
                Outcome::Fail
            }
        }
    }
}

impl From<&TestFailure> for Outcome {
    fn from(failure: &TestFailure) -> Self {
        match failure {
            TestFailure::Failed(_) => Self::Fail,
            TestFailure::Skipped(_) => Self::Skip,
        }
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    match payload.downcast::<String>() {
        Ok(message) => *message,
        Err(other) => other.downcast::<&'static str>().map_or_else(
            |_| String::from("non-string panic payload"),
            |message| (*message).to_owned(),
        ),
    }
}
