//! Unit tests for the IBM Cloud provider.

use std::sync::Arc;
use std::time::Duration;

use rstest::{fixture, rstest};

use super::*;
use crate::test_support::{ScriptedRunner, discard_logger};

#[fixture]
fn config() -> IbmCloudConfig {
    IbmCloudConfig {
        cli_bin: String::from("ibmcloud"),
        region: String::from("us-south"),
        zone: String::from("us-south-1"),
        vpc: String::from("vpc-1"),
        subnet: String::from("subnet-1"),
        profile: String::from("bx2-2x8"),
        image: String::from("img-1"),
    }
}

fn provider(config: IbmCloudConfig, runner: &ScriptedRunner) -> IbmCloudProvider {
    IbmCloudProvider::new(config, Arc::new(runner.clone()), &discard_logger())
        .expect("provider should build")
        .with_poll(Poll::new(Duration::from_secs(60), Duration::from_secs(10)))
}

fn request() -> InstanceRequest {
    InstanceRequest {
        name: String::from("kola-ibm-m1"),
        user_data: String::from("{}"),
    }
}

const CREATED: &str = r#"{
    "id":"inst-1",
    "crn":"crn:v1:inst-1",
    "status":"pending",
    "primary_network_interface":{"id":"nic-1"}
}"#;

fn shown(status: &str) -> String {
    format!(
        r#"{{"id":"inst-1","crn":"crn:v1:inst-1","status":"{status}",
            "primary_network_interface":{{"id":"nic-1","primary_ip":{{"address":"10.240.0.4"}}}}}}"#
    )
}

#[rstest]
fn blank_vpc_is_rejected(config: IbmCloudConfig) {
    let err = IbmCloudProvider::new(
        IbmCloudConfig {
            vpc: String::new(),
            ..config
        },
        Arc::new(ScriptedRunner::new()),
        &discard_logger(),
    )
    .expect_err("vpc is required");
    assert!(err.to_string().contains("KOLA_IBMCLOUD_VPC"), "got {err}");
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn create_tags_reserves_and_waits(config: IbmCloudConfig) {
    let runner = ScriptedRunner::new();
    runner.push_stdout(CREATED);
    runner.push_success();
    runner.push_stdout(r#"{"id":"fip-1","address":"169.48.1.2"}"#);
    runner.push_stdout(shown("starting"));
    runner.push_stdout(shown("running"));
    runner.push_stdout(shown("running"));

    let instance = provider(config, &runner)
        .create_instance(&request(), &CancelSignal::never())
        .await
        .expect("instance should come up");

    assert_eq!(instance.addresses.public, Some("169.48.1.2".parse().expect("ip")));
    assert_eq!(instance.addresses.private, Some("10.240.0.4".parse().expect("ip")));
    assert_eq!(
        instance.floating_ip.as_ref().map(|ip| ip.id.as_str()),
        Some("fip-1")
    );
    let tag = &runner.invocations()[1];
    assert_eq!(tag.flag_value("--tag-names").as_deref(), Some("created-by:mantle"));
    assert_eq!(tag.flag_value("--resource-id").as_deref(), Some("crn:v1:inst-1"));
    assert_eq!(runner.invocations()[2].flag_value("--nic").as_deref(), Some("nic-1"));
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn failed_instance_releases_ip_then_deletes(config: IbmCloudConfig) {
    let runner = ScriptedRunner::new();
    runner.push_stdout(CREATED);
    runner.push_success();
    runner.push_stdout(r#"{"id":"fip-1","address":"169.48.1.2"}"#);
    runner.push_stdout(shown("failed"));
    runner.push_success();
    runner.push_success();

    let err = provider(config, &runner)
        .create_instance(&request(), &CancelSignal::never())
        .await
        .expect_err("failed status aborts");

    assert!(matches!(err, ProviderError::Readiness { .. }), "got {err}");
    let calls = runner.invocations();
    assert!(calls[4].mentions("floating-ip-release fip-1"));
    assert!(calls[5].mentions("instance-delete inst-1"));
}

#[rstest]
#[tokio::test]
async fn terminate_releases_floating_ip(config: IbmCloudConfig) {
    let runner = ScriptedRunner::new();
    runner.push_success();
    runner.push_success();
    let instance = Instance {
        id: String::from("inst-1"),
        name: String::from("kola-ibm-m1"),
        addresses: Addresses::default(),
        floating_ip: Some(FloatingIp {
            id: String::from("fip-1"),
            address: "169.48.1.2".parse().expect("ip"),
        }),
    };

    provider(config, &runner)
        .terminate_instance(&instance)
        .await
        .expect("terminate");

    let calls = runner.invocations();
    assert!(calls[0].mentions("floating-ip-release fip-1 --force"));
    assert!(calls[1].mentions("instance-delete inst-1 --force"));
}

#[rstest]
#[tokio::test]
async fn setup_targets_region_and_registers_key(config: IbmCloudConfig) {
    let runner = ScriptedRunner::new();
    runner.push_success();
    runner.push_stdout(r#"{"id":"key-1"}"#);
    runner.push_success();
    let provider = provider(config, &runner);

    provider
        .setup(&ClusterIdentity {
            name: String::from("kola-ibm"),
            ssh_public_key: Some(String::from("ssh-ed25519 AAAA")),
        })
        .await
        .expect("setup");
    provider.teardown().await.expect("teardown");

    let calls = runner.invocations();
    assert!(calls[0].mentions("target -r us-south"));
    assert!(calls[1].mentions("is key-create kola-ibm @"));
    assert!(calls[2].mentions("is key-delete key-1 --force"));
}

#[rstest]
#[tokio::test]
async fn gc_matches_tagged_crns(config: IbmCloudConfig) {
    let runner = ScriptedRunner::new();
    runner.push_stdout(r#"{"items":[{"crn":"crn:old"},{"crn":"crn:new"}]}"#);
    runner.push_stdout(
        r#"[
            {"id":"old","crn":"crn:old","status":"running","created_at":"2019-01-01T00:00:00Z"},
            {"id":"new","crn":"crn:new","status":"running","created_at":"2999-01-01T00:00:00Z"},
            {"id":"foreign","crn":"crn:foreign","status":"running","created_at":"2019-01-01T00:00:00Z"}
        ]"#,
    );
    runner.push_success();

    let summary = provider(config, &runner)
        .gc(Duration::from_secs(60))
        .await
        .expect("gc");

    assert_eq!(summary.terminated, vec![String::from("old")]);
    assert_eq!(summary.skipped, 1);
    assert!(runner.invocations_mentioning("foreign").is_empty());
}
