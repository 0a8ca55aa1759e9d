//! Test support utilities shared across unit and integration tests.

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::env;
use std::ffi::OsString;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use camino::{Utf8Path, Utf8PathBuf};
use slog::{Logger, o};
use tokio::sync::{Mutex as AsyncMutex, MutexGuard};

use crate::cluster::{Cluster, ClusterOptions};
use crate::command::{CommandError, CommandFuture, CommandOutput, CommandRunner};
use crate::harness::{ClusterFactory, ClusterFuture};
use crate::machine::{BOOT_ID_COMMAND, REBOOT_COMMAND};
use crate::provider::{
    Addresses, ClusterIdentity, GcSummary, Instance, InstanceRequest, Platform, Provider,
    ProviderError, ProviderFuture,
};
use crate::retry::{CancelSignal, Poll};
use crate::ssh::{SshError, SshExecutor, SshFuture, SshOutput};

/// Logger that drops every record.
#[must_use]
pub fn discard_logger() -> Logger {
    Logger::root(slog::Discard, o!())
}

/// Scripted command runner that returns pre-seeded outputs in FIFO order.
///
/// Used to drive deterministic vendor CLI outcomes without spawning
/// processes.
#[derive(Clone, Debug, Default)]
pub struct ScriptedRunner {
    responses: Arc<Mutex<VecDeque<CommandOutput>>>,
    invocations: Arc<Mutex<Vec<CommandInvocation>>>,
}

/// Records a single invocation made through [`ScriptedRunner`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CommandInvocation {
    /// Program name as passed to the runner.
    pub program: String,
    /// Arguments passed to the program.
    pub args: Vec<OsString>,
}

impl CommandInvocation {
    /// Returns a shell-like command string for assertions.
    #[must_use]
    pub fn command_string(&self) -> String {
        let mut parts = Vec::with_capacity(self.args.len() + 1);
        parts.push(self.program.clone());
        parts.extend(
            self.args
                .iter()
                .map(|arg| arg.to_string_lossy().into_owned()),
        );
        parts.join(" ")
    }

    /// Returns `true` when the command line contains `needle`.
    #[must_use]
    pub fn mentions(&self, needle: &str) -> bool {
        self.command_string().contains(needle)
    }

    /// Returns the argument following `flag`, if any.
    #[must_use]
    pub fn flag_value(&self, flag: &str) -> Option<String> {
        self.args
            .iter()
            .skip_while(|arg| arg.as_os_str() != flag)
            .nth(1)
            .map(|arg| arg.to_string_lossy().into_owned())
    }
}

impl ScriptedRunner {
    /// Creates a new runner with no queued responses.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a snapshot of all invocations recorded so far.
    #[must_use]
    pub fn invocations(&self) -> Vec<CommandInvocation> {
        self.invocations
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Returns the invocations whose command line contains `needle`.
    #[must_use]
    pub fn invocations_mentioning(&self, needle: &str) -> Vec<CommandInvocation> {
        self.invocations()
            .into_iter()
            .filter(|invocation| invocation.mentions(needle))
            .collect()
    }

    /// Number of responses not consumed yet.
    #[must_use]
    pub fn remaining(&self) -> usize {
        self.responses
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Pushes a successful exit status with empty output.
    pub fn push_success(&self) {
        self.push_output(Some(0), "", "");
    }

    /// Pushes a successful exit status with `stdout`.
    pub fn push_stdout(&self, stdout: impl Into<String>) {
        self.push_output(Some(0), stdout, "");
    }

    /// Pushes a failing exit code with stderr text.
    pub fn push_failure(&self, code: i32, stderr: impl Into<String>) {
        self.push_output(Some(code), "", stderr);
    }

    /// Pushes an explicit command output response.
    pub fn push_output(
        &self,
        code: Option<i32>,
        stdout: impl Into<String>,
        stderr: impl Into<String>,
    ) {
        self.responses
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_back(CommandOutput {
                code,
                stdout: stdout.into(),
                stderr: stderr.into(),
            });
    }
}

impl CommandRunner for ScriptedRunner {
    fn run<'a>(&'a self, program: &'a str, args: &'a [OsString]) -> CommandFuture<'a> {
        self.invocations
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(CommandInvocation {
                program: program.to_owned(),
                args: args.to_vec(),
            });
        let response = self
            .responses
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front()
            .ok_or_else(|| CommandError::Spawn {
                program: program.to_owned(),
                message: String::from("no scripted response available"),
            });
        Box::pin(async move { response })
    }
}

/// Global mutex used to serialise environment mutation in tests.
pub static ENV_LOCK: AsyncMutex<()> = AsyncMutex::const_new(());

/// Guard that holds the env mutex and restores variables on drop.
pub struct EnvGuard {
    previous: Vec<(String, Option<OsString>)>,
    _guard: MutexGuard<'static, ()>,
}

impl EnvGuard {
    /// Sets multiple environment variables while holding a global mutex.
    pub async fn set_vars(pairs: &[(&str, &str)]) -> Self {
        debug_assert!(
            {
                let mut seen = BTreeSet::new();
                pairs.iter().all(|(key, _)| seen.insert(*key))
            },
            "duplicate environment variable keys passed to EnvGuard::set_vars"
        );

        let guard = ENV_LOCK.lock().await;
        let mut previous = Vec::with_capacity(pairs.len());
        for (key, value) in pairs {
            let old = env::var_os(key);
            // SAFETY: Environment mutation is serialised by `ENV_LOCK`, preventing races.
            unsafe { env::set_var(key, value) };
            previous.push(((*key).to_owned(), old));
        }

        Self {
            previous,
            _guard: guard,
        }
    }
}

impl Drop for EnvGuard {
    fn drop(&mut self) {
        for (key, old) in &self.previous {
            // SAFETY: Environment mutation is serialised by holding `_guard`.
            unsafe {
                match old {
                    Some(val) => env::set_var(key, val),
                    None => env::remove_var(key),
                }
            }
        }
    }
}

/// In-memory [`Provider`] that records every call.
///
/// Instances are numbered `fake-1`, `fake-2`, ... and get the addresses
/// `198.51.100.<n>` (public) and `10.0.0.<n>` (private). Any recorded call
/// can be made to fail with [`FakeProvider::fail_on`].
#[derive(Clone, Debug)]
pub struct FakeProvider {
    platform: Platform,
    state: Arc<Mutex<FakeProviderState>>,
}

#[derive(Debug, Default)]
struct FakeProviderState {
    calls: Vec<String>,
    failures: HashMap<String, String>,
    next_id: u8,
    live: Vec<String>,
    user_data: Vec<String>,
    addresses: HashMap<String, Addresses>,
    console: String,
}

impl FakeProvider {
    /// Creates a provider reporting `platform`.
    #[must_use]
    pub fn new(platform: Platform) -> Self {
        Self {
            platform,
            state: Arc::default(),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, FakeProviderState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Makes the call recorded as `call` (for example `terminate fake-2`)
    /// fail with `message` from now on.
    pub fn fail_on(&self, call: &str, message: &str) {
        self.lock()
            .failures
            .insert(call.to_owned(), message.to_owned());
    }

    /// Sets the console text returned for every instance.
    pub fn set_console(&self, console: &str) {
        console.clone_into(&mut self.lock().console);
    }

    /// Changes the addresses reported by `refresh_addresses` for `id`.
    pub fn set_addresses(&self, id: &str, addresses: Addresses) {
        self.lock().addresses.insert(id.to_owned(), addresses);
    }

    /// Every call in order, rendered as `<operation> <subject>`.
    #[must_use]
    pub fn calls(&self) -> Vec<String> {
        self.lock().calls.clone()
    }

    /// Instances created and not yet terminated.
    #[must_use]
    pub fn live_instances(&self) -> Vec<String> {
        self.lock().live.clone()
    }

    /// User-data payloads received by `create_instance`, in order.
    #[must_use]
    pub fn user_data(&self) -> Vec<String> {
        self.lock().user_data.clone()
    }

    fn record(&self, call: String) -> Result<(), ProviderError> {
        let mut state = self.lock();
        let failure = state.failures.get(&call).cloned();
        state.calls.push(call.clone());
        match failure {
            Some(message) => Err(ProviderError::Io {
                step: call,
                message,
            }),
            None => Ok(()),
        }
    }

    fn create(&self, request: &InstanceRequest) -> Result<Instance, ProviderError> {
        self.record(format!("create {}", request.name))?;
        let mut state = self.lock();
        state.next_id = state.next_id.saturating_add(1);
        let n = state.next_id;
        let id = format!("fake-{n}");
        let addresses = Addresses {
            public: Some(IpAddr::V4(Ipv4Addr::new(198, 51, 100, n))),
            private: Some(IpAddr::V4(Ipv4Addr::new(10, 0, 0, n))),
        };
        state.live.push(id.clone());
        state.user_data.push(request.user_data.clone());
        state.addresses.insert(id.clone(), addresses);
        Ok(Instance {
            id,
            name: request.name.clone(),
            addresses,
            floating_ip: None,
        })
    }
}

impl Provider for FakeProvider {
    fn platform(&self) -> Platform {
        self.platform
    }

    fn setup<'a>(&'a self, identity: &'a ClusterIdentity) -> ProviderFuture<'a, ()> {
        let result = self.record(format!("setup {}", identity.name));
        Box::pin(async move { result })
    }

    fn create_instance<'a>(
        &'a self,
        request: &'a InstanceRequest,
        _cancel: &'a CancelSignal,
    ) -> ProviderFuture<'a, Instance> {
        let result = self.create(request);
        Box::pin(async move { result })
    }

    fn refresh_addresses<'a>(&'a self, instance: &'a Instance) -> ProviderFuture<'a, Addresses> {
        let result = self.record(format!("refresh {}", instance.id)).map(|()| {
            self.lock()
                .addresses
                .get(&instance.id)
                .copied()
                .unwrap_or(instance.addresses)
        });
        Box::pin(async move { result })
    }

    fn console_output<'a>(&'a self, instance: &'a Instance) -> ProviderFuture<'a, Vec<u8>> {
        let result = self
            .record(format!("console {}", instance.id))
            .map(|()| self.lock().console.clone().into_bytes());
        Box::pin(async move { result })
    }

    fn terminate_instance<'a>(&'a self, instance: &'a Instance) -> ProviderFuture<'a, ()> {
        let result = self.record(format!("terminate {}", instance.id));
        if result.is_ok() {
            self.lock().live.retain(|id| id != &instance.id);
        }
        Box::pin(async move { result })
    }

    fn teardown(&self) -> ProviderFuture<'_, ()> {
        let result = self.record(String::from("teardown"));
        Box::pin(async move { result })
    }

    fn gc(&self, _grace_period: Duration) -> ProviderFuture<'_, GcSummary> {
        let result = self.record(String::from("gc")).map(|()| GcSummary {
            terminated: std::mem::take(&mut self.lock().live),
            skipped: 0,
            failures: Vec::new(),
        });
        Box::pin(async move { result })
    }
}

/// Scripted [`SshExecutor`].
///
/// Boot ids read `<host>-boot-<n>`, starting at zero and advancing on every
/// [`REBOOT_COMMAND`], after which the host is unreachable for
/// [`FakeSsh::set_reboot_downtime`] probes. Other commands answer from
/// responses registered with [`FakeSsh::respond`], matched by substring,
/// and succeed with empty output otherwise.
#[derive(Clone, Debug, Default)]
pub struct FakeSsh {
    state: Arc<Mutex<FakeSshState>>,
}

#[derive(Debug, Default)]
struct FakeSshState {
    calls: Vec<(IpAddr, String)>,
    copies: Vec<(IpAddr, Utf8PathBuf, String)>,
    responses: Vec<(String, VecDeque<Result<SshOutput, SshError>>)>,
    boots: HashMap<IpAddr, u32>,
    unreachable: HashMap<IpAddr, u32>,
    reboot_downtime: u32,
}

impl FakeSsh {
    /// Creates an executor where every host is reachable.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, FakeSshState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Queues a response for commands containing `pattern`. The last queued
    /// response keeps answering once earlier ones are used up.
    pub fn respond(&self, pattern: &str, response: Result<SshOutput, SshError>) {
        let mut state = self.lock();
        if let Some((_, queue)) = state.responses.iter_mut().find(|(p, _)| p == pattern) {
            queue.push_back(response);
        } else {
            state
                .responses
                .push((pattern.to_owned(), VecDeque::from([response])));
        }
    }

    /// Queues a successful response with `stdout`.
    pub fn respond_stdout(&self, pattern: &str, stdout: &str) {
        self.respond(
            pattern,
            Ok(SshOutput {
                stdout: stdout.to_owned(),
                stderr: String::new(),
            }),
        );
    }

    /// Makes the next `probes` commands to `host` fail as unreachable.
    pub fn set_unreachable(&self, host: IpAddr, probes: u32) {
        self.lock().unreachable.insert(host, probes);
    }

    /// Number of probes a host stays unreachable after a reboot.
    pub fn set_reboot_downtime(&self, probes: u32) {
        self.lock().reboot_downtime = probes;
    }

    /// Every command in order.
    #[must_use]
    pub fn calls(&self) -> Vec<(IpAddr, String)> {
        self.lock().calls.clone()
    }

    /// Commands containing `needle`.
    #[must_use]
    pub fn calls_mentioning(&self, needle: &str) -> Vec<(IpAddr, String)> {
        self.lock()
            .calls
            .iter()
            .filter(|(_, command)| command.contains(needle))
            .cloned()
            .collect()
    }

    /// Every upload in order.
    #[must_use]
    pub fn copies(&self) -> Vec<(IpAddr, Utf8PathBuf, String)> {
        self.lock().copies.clone()
    }

    fn answer(&self, host: IpAddr, command: &str) -> Result<SshOutput, SshError> {
        let mut state = self.lock();
        state.calls.push((host, command.to_owned()));
        if let Some(remaining) = state.unreachable.get_mut(&host)
            && *remaining > 0
        {
            *remaining -= 1;
            return Err(SshError::Transport {
                host,
                message: String::from("Connection refused"),
            });
        }
        if command == BOOT_ID_COMMAND {
            let boot = state.boots.get(&host).copied().unwrap_or_default();
            return Ok(SshOutput {
                stdout: format!("{host}-boot-{boot}\n"),
                stderr: String::new(),
            });
        }
        if command == REBOOT_COMMAND {
            *state.boots.entry(host).or_default() += 1;
            let downtime = state.reboot_downtime;
            state.unreachable.insert(host, downtime);
            return Ok(SshOutput::default());
        }
        let queued = state
            .responses
            .iter_mut()
            .find(|(pattern, _)| command.contains(pattern.as_str()))
            .and_then(|(_, queue)| {
                if queue.len() > 1 {
                    queue.pop_front()
                } else {
                    queue.front().cloned()
                }
            });
        queued.unwrap_or_else(|| Ok(SshOutput::default()))
    }
}

impl SshExecutor for FakeSsh {
    fn exec<'a>(&'a self, host: IpAddr, command: &'a str) -> SshFuture<'a, SshOutput> {
        let result = self.answer(host, command);
        Box::pin(async move { result })
    }

    fn copy_to<'a>(
        &'a self,
        host: IpAddr,
        local: &'a Utf8Path,
        remote: &'a str,
    ) -> SshFuture<'a, ()> {
        self.lock()
            .copies
            .push((host, local.to_path_buf(), remote.to_owned()));
        Box::pin(async { Ok(()) })
    }
}

/// [`ClusterFactory`] building clusters on [`FakeProvider`]s.
///
/// Each cluster gets its own provider, named after the test, and shares
/// one [`FakeSsh`]. Failures registered with [`FakeClusterFactory::fail_on`]
/// are installed on the provider before setup runs.
#[derive(Clone, Debug)]
pub struct FakeClusterFactory {
    platform: Platform,
    root: Utf8PathBuf,
    ssh: FakeSsh,
    state: Arc<Mutex<FakeFactoryState>>,
}

#[derive(Debug, Default)]
struct FakeFactoryState {
    providers: Vec<(String, FakeProvider)>,
    failures: Vec<(String, String, String)>,
}

impl FakeClusterFactory {
    /// Creates a factory writing cluster output below `root`.
    #[must_use]
    pub fn new(platform: Platform, root: &Utf8Path, ssh: FakeSsh) -> Self {
        Self {
            platform,
            root: root.to_path_buf(),
            ssh,
            state: Arc::default(),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, FakeFactoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Makes `call` fail on the provider of the cluster created for `test`.
    pub fn fail_on(&self, test: &str, call: &str, message: &str) {
        self.lock()
            .failures
            .push((test.to_owned(), call.to_owned(), message.to_owned()));
    }

    /// Provider backing the cluster created for `test`.
    #[must_use]
    pub fn provider_for(&self, test: &str) -> Option<FakeProvider> {
        self.lock()
            .providers
            .iter()
            .find(|(name, _)| name == test)
            .map(|(_, provider)| provider.clone())
    }

    /// Names of the tests a cluster was created for, in creation order.
    #[must_use]
    pub fn clusters(&self) -> Vec<String> {
        self.lock()
            .providers
            .iter()
            .map(|(name, _)| name.clone())
            .collect()
    }
}

impl ClusterFactory for FakeClusterFactory {
    fn create<'a>(&'a self, test: &'a str, cancel: &'a CancelSignal) -> ClusterFuture<'a> {
        let provider = FakeProvider::new(self.platform);
        {
            let mut state = self.lock();
            for (_, call, message) in state.failures.iter().filter(|(name, ..)| name == test) {
                provider.fail_on(call, message);
            }
            state.providers.push((test.to_owned(), provider.clone()));
        }
        let options = ClusterOptions {
            name: test.replace('.', "-"),
            output_dir: self.root.join(test),
            ssh_public_key: None,
            boot_poll: Poll::new(Duration::from_secs(60), Duration::from_secs(1)),
            no_ssh_key_in_metadata: false,
            cancel: cancel.clone(),
        };
        let ssh: Arc<dyn SshExecutor> = Arc::new(self.ssh.clone());
        Box::pin(async move {
            Cluster::new(options, Box::new(provider), ssh, &discard_logger()).await
        })
    }
}
