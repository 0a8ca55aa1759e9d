//! Unit tests for the Azure provider.

use std::sync::Arc;
use std::time::Duration;

use rstest::{fixture, rstest};

use super::*;
use crate::test_support::{ScriptedRunner, discard_logger};

const FAST_POLL: Poll = Poll::new(Duration::from_secs(20), Duration::from_secs(10));

#[fixture]
fn config() -> AzureConfig {
    AzureConfig {
        cli_bin: String::from("az"),
        subscription: None,
        location: String::from("westus"),
        image: String::from("kinvolk:flatcar-container-linux:stable:latest"),
        size: String::from("Standard_D2_v2"),
        admin_user: String::from("core"),
    }
}

fn identity() -> ClusterIdentity {
    ClusterIdentity {
        name: String::from("kola-cluster-1"),
        ssh_public_key: Some(String::from("ssh-rsa AAAA test")),
    }
}

fn provider(config: AzureConfig, runner: &ScriptedRunner) -> AzureProvider {
    AzureProvider::new(config, Arc::new(runner.clone()), &discard_logger())
        .expect("provider should build")
        .with_poll(FAST_POLL)
}

async fn set_up(azure: &AzureProvider, runner: &ScriptedRunner) {
    runner.push_stdout("{}");
    runner.push_stdout("{}");
    azure.setup(&identity()).await.expect("setup should succeed");
}

fn request() -> InstanceRequest {
    InstanceRequest {
        name: String::from("kola-cluster-1-m1"),
        user_data: String::from("#cloud-config"),
    }
}

#[rstest]
#[tokio::test]
async fn setup_creates_tagged_group_and_network(config: AzureConfig) {
    let runner = ScriptedRunner::new();
    let azure = provider(config, &runner);
    set_up(&azure, &runner).await;

    let calls = runner.invocations();
    assert!(calls[0].mentions("group create --name kola-cluster-1"));
    assert!(calls[0].mentions("createdBy=mantle"));
    assert!(calls[0].mentions("createdAt="));
    assert!(calls[1].mentions("network vnet create"));
    assert_eq!(calls[1].flag_value("--subnet-name").as_deref(), Some("kola-subnet"));
}

#[rstest]
#[tokio::test]
async fn setup_deletes_group_when_network_creation_fails(config: AzureConfig) {
    let runner = ScriptedRunner::new();
    runner.push_stdout("{}");
    runner.push_failure(1, "QuotaExceeded");
    runner.push_success();
    let azure = provider(config, &runner);

    let err = azure.setup(&identity()).await.expect_err("vnet failure");

    assert!(err.to_string().starts_with("create virtual network"), "got {err}");
    assert_eq!(runner.invocations_mentioning("group delete").len(), 1);
    assert!(matches!(
        azure.create_instance(&request(), &CancelSignal::never()).await,
        Err(ProviderError::NotSetUp { .. })
    ));
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn create_polls_until_provisioned(config: AzureConfig) {
    let runner = ScriptedRunner::new();
    let azure = provider(config, &runner);
    set_up(&azure, &runner).await;
    runner.push_stdout("{}");
    runner.push_stdout(r#"{"provisioningState":"Creating"}"#);
    runner.push_stdout(
        r#"{"provisioningState":"Succeeded","publicIps":"40.1.2.3","privateIps":"10.0.0.4"}"#,
    );

    let instance = azure
        .create_instance(&request(), &CancelSignal::never())
        .await
        .expect("vm should provision");

    assert_eq!(instance.id, "kola-cluster-1-m1");
    assert_eq!(instance.addresses.public, Some("40.1.2.3".parse().expect("ip")));
    assert_eq!(instance.addresses.private, Some("10.0.0.4".parse().expect("ip")));
    let create = runner.invocations_mentioning("vm create").pop().expect("vm create");
    assert_eq!(create.flag_value("--ssh-key-values").as_deref(), Some("ssh-rsa AAAA test"));
    assert_eq!(create.flag_value("--resource-group").as_deref(), Some("kola-cluster-1"));
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn failed_provisioning_deletes_the_vm(config: AzureConfig) {
    let runner = ScriptedRunner::new();
    let azure = provider(config, &runner);
    set_up(&azure, &runner).await;
    runner.push_stdout("{}");
    runner.push_stdout(r#"{"provisioningState":"Failed"}"#);
    runner.push_success();

    let err = azure
        .create_instance(&request(), &CancelSignal::never())
        .await
        .expect_err("failed state is fatal");

    assert!(!err.is_timeout());
    assert_eq!(runner.invocations_mentioning("vm delete").len(), 1);
}

#[rstest]
#[tokio::test]
async fn console_is_empty_without_boot_diagnostics(config: AzureConfig) {
    let runner = ScriptedRunner::new();
    let azure = provider(config, &runner);
    set_up(&azure, &runner).await;
    runner.push_stdout(r#"{"serialConsoleLogBlobUri":null}"#);
    let instance = Instance {
        id: String::from("vm"),
        name: String::from("vm"),
        addresses: Addresses::default(),
        floating_ip: None,
    };

    let console = azure.console_output(&instance).await.expect("console");
    assert!(console.is_empty());
}

#[rstest]
#[tokio::test]
async fn teardown_deletes_the_cluster_group(config: AzureConfig) {
    let runner = ScriptedRunner::new();
    let azure = provider(config, &runner);
    set_up(&azure, &runner).await;
    runner.push_success();

    azure.teardown().await.expect("teardown");
    let delete = runner.invocations_mentioning("group delete");
    assert_eq!(delete[0].flag_value("--name").as_deref(), Some("kola-cluster-1"));
}

#[rstest]
#[tokio::test]
async fn teardown_without_setup_is_a_no_op(config: AzureConfig) {
    let runner = ScriptedRunner::new();
    provider(config, &runner).teardown().await.expect("no-op");
    assert!(runner.invocations().is_empty());
}

#[rstest]
#[tokio::test]
async fn gc_deletes_expired_groups_only(config: AzureConfig) {
    let runner = ScriptedRunner::new();
    runner.push_stdout(
        r#"[
            {"name":"kola-old","tags":{"createdBy":"mantle","createdAt":"2020-05-01T10:00:00+00:00"}},
            {"name":"kola-new","tags":{"createdBy":"mantle","createdAt":"2999-05-01T10:00:00+00:00"}},
            {"name":"kola-untimed","tags":{"createdBy":"mantle"}}
        ]"#,
    );
    runner.push_success();

    let summary = provider(config, &runner)
        .gc(Duration::from_secs(600))
        .await
        .expect("gc");

    assert_eq!(summary.terminated, vec![String::from("kola-old")]);
    assert_eq!(summary.skipped, 2);
    assert!(runner.invocations_mentioning("group delete")[0].mentions("--no-wait"));
}
