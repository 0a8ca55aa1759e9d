//! Unit tests for teardown aggregation.

use rstest::{fixture, rstest};
use slog::{Logger, o};

use super::*;

#[fixture]
fn log() -> Logger {
    Logger::root(slog::Discard, o!())
}

#[rstest]
fn finish_is_ok_when_every_step_succeeds(log: Logger) {
    let mut cleanup = Cleanup::new("machine-a", &log);
    assert_eq!(cleanup.step("save console", Ok::<_, String>(3)), Some(3));
    assert!(cleanup.finish().is_ok());
}

#[rstest]
fn failures_are_collected_in_order_without_stopping(log: Logger) {
    let mut cleanup = Cleanup::new("machine-a", &log);
    cleanup.step("collect journal", Err::<(), _>("ssh unreachable"));
    cleanup.step("save console", Ok::<_, String>(()));
    cleanup.step("terminate instance", Err::<(), _>("403 forbidden"));

    let err = cleanup.finish().expect_err("two steps failed");
    assert_eq!(err.failures.len(), 2);
    assert!(err.has_step("collect journal"));
    assert!(err.has_step("terminate instance"));
    assert!(!err.has_step("save console"));
    assert_eq!(
        err.to_string(),
        "teardown failed: machine-a: collect journal: ssh unreachable; machine-a: terminate instance: 403 forbidden"
    );
}

#[rstest]
fn nested_failures_are_absorbed(log: Logger) {
    let mut inner = Cleanup::new("machine-b", &log);
    inner.step("terminate instance", Err::<(), _>("gone"));

    let mut outer = Cleanup::new("cluster", &log);
    outer.absorb(inner.finish());
    outer.step("provider teardown", Err::<(), _>("group busy"));

    let err = outer.finish().expect_err("failures expected");
    let subjects: Vec<_> = err.failures.iter().map(|f| f.subject.as_str()).collect();
    assert_eq!(subjects, ["machine-b", "cluster"]);
}

#[rstest]
fn merge_appends_failures() {
    let failure = |step: &str| StepFailure {
        subject: String::from("m"),
        step: step.to_owned(),
        message: String::from("boom"),
    };
    let mut first = TeardownError {
        failures: vec![failure("a")],
    };
    first.merge(TeardownError {
        failures: vec![failure("b")],
    });
    assert!(first.has_step("a") && first.has_step("b"));
}

#[rstest]
#[case(None, "boot failed")]
#[case(Some("terminate instance: 500"), "boot failed (teardown also failed: terminate instance: 500)")]
fn teardown_note_is_appended_only_on_failure(
    #[case] teardown: Option<&str>,
    #[case] expected: &str,
) {
    assert_eq!(
        append_teardown_note(String::from("boot failed"), teardown.as_ref()),
        expected
    );
}
