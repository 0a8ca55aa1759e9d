//! Unit tests for command output handling.

use rstest::rstest;

use super::*;

fn output(code: Option<i32>, stderr: &str) -> CommandOutput {
    CommandOutput {
        code,
        stdout: String::from("ignored"),
        stderr: stderr.to_owned(),
    }
}

#[rstest]
#[case(Some(0), true)]
#[case(Some(1), false)]
#[case(None, false)]
fn success_requires_zero_exit(#[case] code: Option<i32>, #[case] expected: bool) {
    assert_eq!(output(code, "").is_success(), expected);
}

#[rstest]
fn check_reports_program_status_and_trimmed_stderr() {
    let err = output(Some(254), "  An error occurred (UnauthorizedOperation)\n")
        .check("aws")
        .expect_err("non-zero exit should fail");

    assert_eq!(
        err,
        CommandError::Failure {
            program: String::from("aws"),
            status: Some(254),
            status_text: String::from("254"),
            stderr: String::from("An error occurred (UnauthorizedOperation)"),
        }
    );
    assert_eq!(
        err.to_string(),
        "aws exited with status 254: An error occurred (UnauthorizedOperation)"
    );
}

#[rstest]
fn check_reports_unknown_status_when_signalled() {
    let err = output(None, "killed").check("az").expect_err("should fail");
    assert!(err.to_string().contains("status unknown"), "got: {err}");
}

#[tokio::test]
async fn process_runner_reports_spawn_failure() {
    let err = ProcessCommandRunner
        .run("kola-definitely-missing-binary", &[])
        .await
        .expect_err("missing binary should not spawn");

    assert!(
        matches!(
            err,
            CommandError::Spawn { ref program, .. } if program == "kola-definitely-missing-binary"
        ),
        "unexpected error: {err}"
    );
}

#[rstest]
fn os_args_accepts_mixed_string_types() {
    let owned = String::from("--region");
    let args = os_args([owned.as_str(), "us-west-2"]);
    assert_eq!(args, vec![OsString::from("--region"), OsString::from("us-west-2")]);
}
