//! Unit tests for the machine lifecycle.

use std::sync::Arc;
use std::time::Duration;

use camino::Utf8PathBuf;
use rstest::{fixture, rstest};
use tempfile::TempDir;

use super::*;
use crate::cluster::{Cluster, ClusterError, ClusterOptions};
use crate::provider::Platform;
use crate::retry::{CancelSignal, Poll};
use crate::ssh::SshError;
use crate::test_support::{FakeProvider, FakeSsh, discard_logger};
use crate::userdata::UserData;

const BOOT_POLL: Poll = Poll::new(Duration::from_secs(60), Duration::from_secs(10));

struct TestBed {
    _tmp: TempDir,
    root: Utf8PathBuf,
    provider: FakeProvider,
    ssh: FakeSsh,
}

#[fixture]
fn bed() -> TestBed {
    let tmp = TempDir::new().expect("tempdir");
    let root = Utf8PathBuf::from_path_buf(tmp.path().to_path_buf()).expect("utf8 tempdir");
    TestBed {
        _tmp: tmp,
        root,
        provider: FakeProvider::new(Platform::Aws),
        ssh: FakeSsh::new(),
    }
}

impl TestBed {
    async fn cluster(&self) -> Cluster {
        Cluster::new(
            ClusterOptions {
                name: String::from("kola-test"),
                output_dir: self.root.join("out"),
                ssh_public_key: None,
                boot_poll: BOOT_POLL,
                no_ssh_key_in_metadata: false,
                cancel: CancelSignal::never(),
            },
            Box::new(self.provider.clone()),
            Arc::new(self.ssh.clone()),
            &discard_logger(),
        )
        .await
        .expect("cluster setup")
    }

    fn context(&self) -> Arc<ClusterContext> {
        Arc::new(ClusterContext {
            name: String::from("kola-test"),
            provider: Box::new(self.provider.clone()),
            ssh: Arc::new(self.ssh.clone()),
            boot_poll: BOOT_POLL,
            cancel: CancelSignal::never(),
        })
    }
}

fn host(n: u8) -> IpAddr {
    IpAddr::from([198, 51, 100, n])
}

fn bare_instance() -> Instance {
    Instance {
        id: String::from("fake-9"),
        name: String::from("kola-test-9"),
        addresses: Addresses {
            public: Some(host(9)),
            private: None,
        },
        floating_ip: None,
    }
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn new_machine_is_ready_with_artefacts(bed: TestBed) {
    let mut cluster = bed.cluster().await;
    let machine = cluster
        .new_machine(&UserData::ignition("{}"))
        .await
        .expect("machine boots");

    assert_eq!(machine.state(), MachineState::Ready);
    assert_eq!(machine.id().as_str(), "fake-1");
    assert_eq!(machine.public_ip(), Some(host(1)));
    assert_eq!(machine.boot_id(), Some("198.51.100.1-boot-0"));
    let dir = machine.dir().expect("machine dir").to_path_buf();
    assert_eq!(dir, bed.root.join("out").join("fake-1"));
    assert!(dir.join(USER_DATA_FILE).is_file());
    assert!(dir.join(crate::journal::JOURNAL_FILE).is_file());
    assert_eq!(bed.ssh.calls_mentioning(FAILED_UNITS_COMMAND).len(), 1);

    cluster.destroy().await.expect("teardown");
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn boot_retries_unreachable_ssh(bed: TestBed) {
    bed.ssh.set_unreachable(host(1), 2);
    let mut cluster = bed.cluster().await;

    cluster
        .new_machine(&UserData::empty())
        .await
        .expect("machine boots after two refusals");

    assert_eq!(bed.ssh.calls_mentioning(BOOT_ID_COMMAND).len(), 3);
    cluster.destroy().await.expect("teardown");
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn boot_timeout_destroys_the_instance(bed: TestBed) {
    bed.ssh.set_unreachable(host(1), u32::MAX);
    let mut cluster = bed.cluster().await;

    let err = cluster
        .new_machine(&UserData::empty())
        .await
        .expect_err("ssh never comes up");

    assert!(err.is_timeout(), "got {err}");
    assert!(matches!(err, ClusterError::Machine { .. }));
    assert!(bed.provider.live_instances().is_empty());
    assert!(cluster.machines().is_empty());
    cluster.destroy().await.expect("teardown");
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn failed_units_fail_the_boot(bed: TestBed) {
    bed.ssh
        .respond_stdout("systemctl --failed", "bad.service loaded failed failed Bad\n");
    let mut cluster = bed.cluster().await;

    let err = cluster
        .new_machine(&UserData::empty())
        .await
        .expect_err("failed unit");

    let ClusterError::Machine { source, .. } = &err else {
        panic!("expected machine error, got {err}");
    };
    assert!(
        matches!(source, MachineError::FailedUnits { units, .. } if units == &["bad.service"]),
        "got {source}"
    );
    assert!(!err.is_timeout());
    assert!(bed.provider.calls().contains(&String::from("terminate fake-1")));
    cluster.destroy().await.expect("teardown");
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn reboot_waits_for_new_boot_id_and_refreshes_addresses(bed: TestBed) {
    bed.ssh.set_reboot_downtime(2);
    let mut cluster = bed.cluster().await;
    let id = cluster
        .new_machine(&UserData::empty())
        .await
        .expect("machine boots")
        .id()
        .clone();
    let moved = Addresses {
        public: Some(host(200)),
        private: Some(IpAddr::from([10, 0, 0, 200])),
    };
    bed.provider.set_addresses("fake-1", moved);

    let machine = cluster.machine_mut(&id).expect("registered");
    machine.reboot().await.expect("reboot");

    assert_eq!(machine.state(), MachineState::Ready);
    assert_eq!(machine.public_ip(), Some(host(200)));
    assert_eq!(machine.boot_id(), Some("198.51.100.200-boot-0"));
    assert!(bed.provider.calls().contains(&String::from("refresh fake-1")));
    cluster.destroy().await.expect("teardown");
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn reboot_in_place_observes_incremented_boot_id(bed: TestBed) {
    bed.ssh.set_reboot_downtime(1);
    let mut cluster = bed.cluster().await;
    let id = cluster
        .new_machine(&UserData::empty())
        .await
        .expect("machine boots")
        .id()
        .clone();

    let machine = cluster.machine_mut(&id).expect("registered");
    machine.reboot().await.expect("reboot");

    assert_eq!(machine.boot_id(), Some("198.51.100.1-boot-1"));
    assert_eq!(bed.ssh.calls_mentioning(REBOOT_COMMAND).len(), 1);
    cluster.destroy().await.expect("teardown");
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn reboot_aborts_on_provider_error(bed: TestBed) {
    let mut cluster = bed.cluster().await;
    let id = cluster
        .new_machine(&UserData::empty())
        .await
        .expect("machine boots")
        .id()
        .clone();
    bed.provider.fail_on("refresh fake-1", "instance vanished");

    let err = cluster
        .machine_mut(&id)
        .expect("registered")
        .reboot()
        .await
        .expect_err("refresh fails");

    assert!(!err.is_timeout(), "got {err}");
    assert!(err.to_string().contains("instance vanished"), "got {err}");
    assert_eq!(bed.provider.calls().iter().filter(|c| c.starts_with("refresh")).count(), 1);
    cluster.destroy().await.expect("teardown");
}

#[rstest]
#[tokio::test]
async fn destroy_saves_console_and_is_idempotent(bed: TestBed) {
    bed.provider.set_console("login:\n");
    let mut cluster = bed.cluster().await;
    let id = cluster
        .new_machine(&UserData::empty())
        .await
        .expect("machine boots")
        .id()
        .clone();

    let machine = cluster.machine_mut(&id).expect("registered");
    machine.destroy().await.expect("destroy");
    let calls_after_first = bed.provider.calls().len();
    machine.destroy().await.expect("second destroy is a no-op");

    assert_eq!(machine.state(), MachineState::Destroyed);
    assert_eq!(machine.console_output(), Some("login:\n"));
    let console = std::fs::read_to_string(
        machine.dir().expect("machine dir").join(CONSOLE_FILE),
    )
    .expect("console.txt");
    assert_eq!(console, "login:\n");
    assert_eq!(bed.provider.calls().len(), calls_after_first);
    assert!(
        machine
            .reboot()
            .await
            .is_err_and(|err| matches!(err, MachineError::InvalidState { .. }))
    );
    cluster.destroy().await.expect("teardown");
}

#[rstest]
#[tokio::test]
async fn destroy_attempts_every_step_after_failures(bed: TestBed) {
    bed.provider.fail_on("console fake-1", "console unavailable");
    let mut cluster = bed.cluster().await;
    let id = cluster
        .new_machine(&UserData::empty())
        .await
        .expect("machine boots")
        .id()
        .clone();

    let err = cluster
        .machine_mut(&id)
        .expect("registered")
        .destroy()
        .await
        .expect_err("console step fails");

    assert!(err.has_step("fetch console"));
    assert!(bed.provider.calls().contains(&String::from("terminate fake-1")));
    assert!(bed.provider.live_instances().is_empty());
    cluster.destroy().await.expect("teardown");
}

#[rstest]
#[tokio::test]
async fn destroy_handles_partially_initialised_machine(bed: TestBed) {
    let ctx = bed.context();
    let mut machine = Machine::new(bare_instance(), Arc::downgrade(&ctx), &discard_logger());

    machine.destroy().await.expect("nothing to fail");

    assert_eq!(machine.state(), MachineState::Destroyed);
    assert_eq!(machine.journal_output(), "");
    assert_eq!(
        bed.provider.calls(),
        vec![String::from("console fake-9"), String::from("terminate fake-9")]
    );
    assert!(bed.ssh.calls().is_empty());
}

#[rstest]
#[tokio::test]
async fn operations_fail_once_cluster_is_gone(bed: TestBed) {
    let ctx = bed.context();
    let mut machine = Machine::new(bare_instance(), Arc::downgrade(&ctx), &discard_logger());
    drop(ctx);

    let err = machine.ssh("true").await.expect_err("cluster dropped");
    assert!(matches!(err, MachineError::ClusterGone { .. }), "got {err}");

    let teardown = machine.destroy().await.expect_err("cannot terminate");
    assert!(teardown.has_step("resolve cluster"));
    assert_eq!(machine.state(), MachineState::Destroyed);
}

#[rstest]
#[tokio::test]
async fn ssh_does_not_retry(bed: TestBed) {
    bed.ssh.respond(
        "false",
        Err(SshError::Failed {
            host: host(1),
            command: String::from("false"),
            status: 1,
            stdout: String::new(),
            stderr: String::from("nope"),
        }),
    );
    let mut cluster = bed.cluster().await;
    let id = cluster
        .new_machine(&UserData::empty())
        .await
        .expect("machine boots")
        .id()
        .clone();

    let err = cluster
        .machine(&id)
        .expect("registered")
        .ssh("false")
        .await
        .expect_err("remote failure");

    assert!(matches!(err, MachineError::Ssh { .. }), "got {err}");
    assert_eq!(bed.ssh.calls_mentioning("false").len(), 1);
    cluster.destroy().await.expect("teardown");
}
