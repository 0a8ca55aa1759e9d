//! Unit tests for the reporters.

use std::time::Duration;

use camino::Utf8PathBuf;
use rstest::rstest;
use serde_json::{Value, json};
use tempfile::TempDir;

use super::*;

fn record(name: &str, result: Outcome, secs: u64, output: &str) -> TestRecord {
    TestRecord {
        name: name.to_owned(),
        result,
        duration: Duration::from_secs(secs),
        output: output.to_owned(),
    }
}

#[test]
fn json_report_keeps_call_order_and_context() {
    let mut reporter = JsonReporter::new(Vec::new(), "aws", "2191.0.0");
    reporter.report_test(&record("t1", Outcome::Pass, 2, "ok"));
    reporter.report_test(&record("t2", Outcome::Fail, 1, "boom"));

    let written = reporter.write_report(Outcome::Fail).expect("report");
    let value: Value = serde_json::from_slice(&written).expect("valid json");

    assert_eq!(
        value,
        json!({
            "tests": [
                {"name": "t1", "result": "PASS", "duration": 2_000_000_000_u64, "output": "ok"},
                {"name": "t2", "result": "FAIL", "duration": 1_000_000_000_u64, "output": "boom"}
            ],
            "result": "FAIL",
            "platform": "aws",
            "version": "2191.0.0"
        })
    );
}

#[test]
fn json_fields_are_in_wire_order() {
    let reporter = JsonReporter::new(Vec::new(), "oci", "1.0");
    let written = reporter.write_report(Outcome::Pass).expect("report");

    assert_eq!(
        String::from_utf8(written).expect("utf8"),
        r#"{"tests":[],"result":"PASS","platform":"oci","version":"1.0"}"#
    );
}

#[rstest]
#[case::all_pass(&[Outcome::Pass, Outcome::Pass], Outcome::Pass)]
#[case::skip_is_not_failure(&[Outcome::Pass, Outcome::Skip], Outcome::Pass)]
#[case::any_fail(&[Outcome::Skip, Outcome::Fail, Outcome::Pass], Outcome::Fail)]
#[case::empty(&[], Outcome::Pass)]
fn overall_result(#[case] results: &[Outcome], #[case] expected: Outcome) {
    let records: Vec<TestRecord> = results
        .iter()
        .map(|result| record("t", *result, 0, ""))
        .collect();
    assert_eq!(Outcome::overall(&records), expected);
}

#[test]
fn file_reporter_writes_once_on_finish() {
    let tmp = TempDir::new().expect("tempdir");
    let root = Utf8PathBuf::from_path_buf(tmp.path().to_path_buf()).expect("utf8 tempdir");
    let path = root.join("reports.json");
    let mut reporter: Box<dyn Reporter> =
        Box::new(JsonReporter::create(&path, "packet", "dev").expect("create report"));
    reporter.report_test(&record("linux.nfs.v4", Outcome::Skip, 0, ""));

    reporter.finish(Outcome::Pass).expect("finish");

    let value: Value =
        serde_json::from_str(&std::fs::read_to_string(&path).expect("read report"))
            .expect("valid json");
    assert_eq!(value["tests"][0]["result"], "SKIP");
    assert_eq!(value["platform"], "packet");
}

#[test]
fn fan_out_reports_to_every_sink() {
    let tmp = TempDir::new().expect("tempdir");
    let root = Utf8PathBuf::from_path_buf(tmp.path().to_path_buf()).expect("utf8 tempdir");
    let mut reporters = Reporters::new();
    for name in ["a.json", "b.json"] {
        reporters.push(Box::new(
            JsonReporter::create(&root.join(name), "aws", "dev").expect("create report"),
        ));
    }
    assert_eq!(reporters.len(), 2);
    reporters.report_test(&record("t1", Outcome::Pass, 1, "ok"));

    Box::new(reporters).finish(Outcome::Pass).expect("finish");

    for name in ["a.json", "b.json"] {
        let text = std::fs::read_to_string(root.join(name)).expect("read report");
        assert!(text.contains(r#""name":"t1""#), "{name}: {text}");
    }
}

#[test]
fn create_fails_for_missing_directory() {
    let err = JsonReporter::create(
        Utf8PathBuf::from("/nonexistent/kola/report.json").as_path(),
        "aws",
        "dev",
    )
    .expect_err("parent does not exist");
    assert!(matches!(err, ReporterError::Io { .. }), "got {err}");
}
