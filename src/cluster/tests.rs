//! Unit tests for cluster lifecycle and teardown aggregation.

use std::time::Duration;

use rstest::{fixture, rstest};
use tempfile::TempDir;

use super::*;
use crate::ssh::SshError;
use crate::test_support::{FakeProvider, FakeSsh, discard_logger};

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
    fn options(&self) -> ClusterOptions {
        ClusterOptions {
            name: String::from("kola-abc"),
            output_dir: self.root.join("kola-abc"),
            ssh_public_key: Some(String::from("ssh-ed25519 AAAA")),
            boot_poll: Poll::new(Duration::from_secs(60), Duration::from_secs(10)),
            no_ssh_key_in_metadata: false,
            cancel: CancelSignal::never(),
        }
    }

    async fn cluster(&self) -> Cluster {
        Cluster::new(
            self.options(),
            Box::new(self.provider.clone()),
            Arc::new(self.ssh.clone()),
            &discard_logger(),
        )
        .await
        .expect("cluster setup")
    }
}

#[rstest]
#[tokio::test]
async fn single_machine_round_trip(bed: TestBed) {
    let mut cluster = bed.cluster().await;
    assert!(cluster.machines().is_empty());

    let machine = cluster
        .new_machine(&UserData::empty())
        .await
        .expect("machine boots");
    assert!(!machine.id().as_str().is_empty());
    assert!(machine.public_ip().is_some());

    cluster.destroy().await.expect("teardown");

    assert!(cluster.machines().is_empty());
    assert_eq!(
        bed.provider.calls(),
        vec![
            String::from("setup kola-abc"),
            String::from("create kola-abc-1"),
            String::from("console fake-1"),
            String::from("terminate fake-1"),
            String::from("teardown"),
        ]
    );
}

#[rstest]
#[tokio::test]
async fn destroy_continues_past_failures_in_reverse_order(bed: TestBed) {
    let mut cluster = bed.cluster().await;
    for _ in 0..3 {
        cluster
            .new_machine(&UserData::empty())
            .await
            .expect("machine boots");
    }
    bed.provider.fail_on("terminate fake-1", "quota");
    bed.provider.fail_on("terminate fake-3", "throttled");

    let err = cluster.destroy().await.expect_err("two machines fail");

    assert_eq!(err.failures.len(), 2);
    let message = err.to_string();
    assert!(message.contains("fake-1") && message.contains("quota"), "{message}");
    assert!(message.contains("fake-3") && message.contains("throttled"), "{message}");
    let terminations: Vec<String> = bed
        .provider
        .calls()
        .into_iter()
        .filter(|call| call.starts_with("terminate"))
        .collect();
    assert_eq!(
        terminations,
        vec!["terminate fake-3", "terminate fake-2", "terminate fake-1"]
    );
    assert_eq!(bed.provider.calls().last().map(String::as_str), Some("teardown"));
    assert!(cluster.machines().is_empty());
}

#[rstest]
#[tokio::test]
async fn provider_teardown_failure_is_reported(bed: TestBed) {
    bed.provider.fail_on("teardown", "key still in use");
    let mut cluster = bed.cluster().await;

    let err = cluster.destroy().await.expect_err("teardown fails");

    assert!(err.has_step("release cluster resources"));
    cluster.destroy().await.expect("second destroy is a no-op");
}

#[rstest]
#[tokio::test]
async fn placeholders_reach_provider_verbatim(bed: TestBed) {
    let mut cluster = bed.cluster().await;
    let machine = cluster
        .new_machine(&UserData::ignition("etcd --advertise=$public_ipv4"))
        .await
        .expect("machine boots");
    let saved = std::fs::read_to_string(
        machine
            .dir()
            .expect("machine dir")
            .join(crate::machine::USER_DATA_FILE),
    )
    .expect("user-data file");

    assert_eq!(
        bed.provider.user_data(),
        vec![String::from("etcd --advertise=${COREOS_AWS_IPV4_PUBLIC_0}")]
    );
    assert_eq!(saved, "etcd --advertise=${COREOS_AWS_IPV4_PUBLIC_0}");
    cluster.destroy().await.expect("teardown");
}

#[rstest]
#[tokio::test]
async fn setup_failure_is_reported(bed: TestBed) {
    bed.provider.fail_on("setup kola-abc", "no such region");

    let err = Cluster::new(
        bed.options(),
        Box::new(bed.provider.clone()),
        Arc::new(bed.ssh.clone()),
        &discard_logger(),
    )
    .await
    .expect_err("setup fails");

    assert!(matches!(err, ClusterError::Setup { .. }), "got {err}");
    assert!(err.to_string().contains("no such region"));
}

#[rstest]
#[tokio::test]
async fn provision_failure_registers_nothing(bed: TestBed) {
    bed.provider.fail_on("create kola-abc-1", "capacity");
    let mut cluster = bed.cluster().await;

    let err = cluster
        .new_machine(&UserData::empty())
        .await
        .expect_err("create fails");

    assert!(matches!(err, ClusterError::Provision { .. }), "got {err}");
    assert!(cluster.machines().is_empty());
    let id = cluster
        .new_machine(&UserData::empty())
        .await
        .expect("next machine boots")
        .id()
        .clone();
    assert_eq!(cluster.machine(&id).map(Machine::name), Some("kola-abc-2"));
    cluster.destroy().await.expect("teardown");
}

#[rstest]
#[tokio::test]
async fn destroy_machine_deregisters(bed: TestBed) {
    let mut cluster = bed.cluster().await;
    for _ in 0..2 {
        cluster
            .new_machine(&UserData::empty())
            .await
            .expect("machine boots");
    }
    let ids = cluster.machine_ids();

    let first = ids.first().expect("two machines").clone();
    cluster.destroy_machine(&first).await.expect("destroy");

    assert_eq!(cluster.machine_ids(), ids.get(1..).expect("second").to_vec());
    let err = cluster
        .destroy_machine(&first)
        .await
        .expect_err("already removed");
    assert!(matches!(err, ClusterError::UnknownMachine { .. }), "got {err}");
    cluster.destroy().await.expect("teardown");
}

#[rstest]
#[tokio::test]
async fn destroyed_cluster_refuses_new_machines(bed: TestBed) {
    let mut cluster = bed.cluster().await;
    cluster.destroy().await.expect("teardown");

    let err = cluster
        .new_machine(&UserData::empty())
        .await
        .expect_err("cluster is gone");

    assert!(matches!(err, ClusterError::Destroyed { .. }), "got {err}");
}

#[rstest]
#[tokio::test]
async fn commands_and_reboots_go_through_the_cluster(bed: TestBed) {
    bed.ssh.respond_stdout("uname", "Linux\n");
    let mut cluster = bed.cluster().await;
    let id = cluster
        .new_machine(&UserData::empty())
        .await
        .expect("machine boots")
        .id()
        .clone();

    let output = cluster.ssh(&id, "uname").await.expect("command runs");
    cluster.reboot(&id).await.expect("machine returns");

    assert_eq!(output.stdout, "Linux\n");
    let machine = cluster.machine(&id).expect("registered");
    assert_eq!(machine.boot_id(), Some("198.51.100.1-boot-1"));
    let unknown = cluster
        .ssh(&MachineId::new("fake-99"), "uname")
        .await
        .expect_err("foreign id");
    assert!(matches!(unknown, ClusterError::UnknownMachine { .. }), "got {unknown}");
    cluster.destroy().await.expect("teardown");
}

#[rstest]
#[tokio::test]
async fn failing_command_names_the_cluster(bed: TestBed) {
    bed.ssh.respond(
        "false",
        Err(SshError::Failed {
            host: "198.51.100.1".parse().expect("ip"),
            command: String::from("false"),
            status: 1,
            stdout: String::new(),
            stderr: String::new(),
        }),
    );
    let mut cluster = bed.cluster().await;
    let id = cluster
        .new_machine(&UserData::empty())
        .await
        .expect("machine boots")
        .id()
        .clone();

    let err = cluster.ssh(&id, "false").await.expect_err("exit status 1");

    assert!(matches!(err, ClusterError::Operation { .. }), "got {err}");
    assert!(err.to_string().starts_with("cluster kola-abc:"));
    cluster.destroy().await.expect("teardown");
}
