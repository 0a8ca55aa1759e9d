//! End-to-end runs of the built-in suite against fake clusters, checking the
//! JSON report left on disk.

use std::sync::Arc;

use camino::{Utf8Path, Utf8PathBuf};
use kola::harness::{Harness, HarnessOptions, SuiteOptions};
use kola::provider::Platform;
use kola::reporter::{JsonReporter, Outcome};
use kola::retry::CancelSignal;
use kola::suite;
use kola::test_support::{FakeClusterFactory, FakeSsh, discard_logger};
use rstest::{fixture, rstest};
use serde_json::Value;
use tempfile::TempDir;

struct Workspace {
    _tmp: TempDir,
    root: Utf8PathBuf,
}

#[fixture]
fn workspace() -> Workspace {
    let tmp = TempDir::new().expect("tempdir");
    let root = Utf8PathBuf::from_path_buf(tmp.path().to_path_buf()).expect("utf8 tempdir");
    Workspace { _tmp: tmp, root }
}

fn options(exclude: &[&str]) -> HarnessOptions {
    HarnessOptions {
        platform: Platform::Aws,
        include: Vec::new(),
        exclude: exclude.iter().map(|pattern| (*pattern).to_owned()).collect(),
        parallel: 2,
        suite: SuiteOptions::default(),
    }
}

fn read_report(path: &Utf8Path) -> Value {
    let contents = std::fs::read_to_string(path).expect("report written");
    serde_json::from_str(&contents).expect("report is json")
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn report_lists_every_selected_test(workspace: Workspace) {
    let ssh = FakeSsh::new();
    ssh.respond_stdout("mktemp", "/tmp/tmp.Q2rv\n");
    ssh.respond_stdout("is-active mnt.mount", "active\n");
    let factory = FakeClusterFactory::new(Platform::Aws, &workspace.root, ssh.clone());
    let report_path = workspace.root.join("report.json");
    let reporter = JsonReporter::create(&report_path, "aws", "2191.5.0").expect("reporter");
    let mut harness = Harness::new(options(&["nfs.v4"]), &discard_logger());
    suite::register_all(&mut harness).expect("register");

    let summary = harness
        .run(Arc::new(factory.clone()), Box::new(reporter), CancelSignal::never())
        .await
        .expect("run completes");

    assert_eq!(summary.result, Outcome::Pass);
    let report = read_report(&report_path);
    assert_eq!(report["result"], "PASS");
    assert_eq!(report["platform"], "aws");
    assert_eq!(report["version"], "2191.5.0");
    let tests = report["tests"].as_array().expect("tests array");
    let results: Vec<(&str, &str)> = tests
        .iter()
        .map(|test| {
            (
                test["name"].as_str().unwrap_or_default(),
                test["result"].as_str().unwrap_or_default(),
            )
        })
        .collect();
    assert_eq!(
        results,
        vec![("linux.nfs.v3", "PASS"), ("coreos.update.updatepayload", "SKIP")]
    );
    assert!(tests.iter().all(|test| test["duration"].is_u64()));
    for test in ["linux.nfs.v3", "coreos.update.updatepayload"] {
        let provider = factory.provider_for(test).expect("cluster created");
        assert!(provider.live_instances().is_empty(), "{test} leaked instances");
    }
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn failing_test_fails_the_report_and_keeps_artefacts(workspace: Workspace) {
    let ssh = FakeSsh::new();
    ssh.respond_stdout("is-active mnt.mount", "failed\n");
    let factory = FakeClusterFactory::new(Platform::Aws, &workspace.root, ssh);
    let report_path = workspace.root.join("report.json");
    let reporter = JsonReporter::create(&report_path, "aws", "dev").expect("reporter");
    let mut harness = Harness::new(options(&["nfs.v4", "coreos"]), &discard_logger());
    suite::register_all(&mut harness).expect("register");

    let summary = harness
        .run(Arc::new(factory), Box::new(reporter), CancelSignal::never())
        .await
        .expect("run completes");

    assert_eq!(summary.result, Outcome::Fail);
    let report = read_report(&report_path);
    assert_eq!(report["result"], "FAIL");
    let output = report["tests"][0]["output"].as_str().expect("output");
    assert!(output.contains("mnt.mount status is \"failed\""), "{output}");
    assert!(workspace.root.join("linux.nfs.v3").is_dir());
}
