//! Unit tests for the `kola` CLI binary implementation.

use std::time::Duration;

use kola::reporter::TestRecord;
use rstest::rstest;

use super::*;

fn listing(platform: Option<Platform>) -> String {
    let mut buffer = Vec::new();
    write_test_list(&mut buffer, platform).expect("listing succeeds");
    String::from_utf8(buffer).expect("utf8 listing")
}

#[rstest]
fn list_shows_every_test_with_its_platforms() {
    let output = listing(None);

    assert_eq!(
        output,
        "linux.nfs.v3\tall\nlinux.nfs.v4\tall\ncoreos.update.updatepayload\taws\n"
    );
}

#[rstest]
#[case::aws(Platform::Aws, 3)]
#[case::packet(Platform::Packet, 2)]
fn list_filters_by_platform(#[case] platform: Platform, #[case] expected: usize) {
    assert_eq!(listing(Some(platform)).lines().count(), expected);
}

#[rstest]
fn summary_lists_records_and_result() {
    let summary = RunSummary {
        result: Outcome::Fail,
        records: vec![
            TestRecord {
                name: String::from("linux.nfs.v3"),
                result: Outcome::Pass,
                duration: Duration::from_millis(1500),
                output: String::new(),
            },
            TestRecord {
                name: String::from("linux.nfs.v4"),
                result: Outcome::Fail,
                duration: Duration::from_secs(2),
                output: String::from("mnt.mount status is \"failed\"\n"),
            },
        ],
    };
    let mut buffer = Vec::new();

    write_summary(&mut buffer, &summary).expect("summary written");

    assert_eq!(
        String::from_utf8(buffer).expect("utf8 summary"),
        concat!(
            "--- PASS: linux.nfs.v3 (1.500s)\n",
            "--- FAIL: linux.nfs.v4 (2.000s)\n",
            "        mnt.mount status is \"failed\"\n",
            "FAIL\n",
        )
    );
}

#[rstest]
fn errors_are_written_on_one_line() {
    let mut buffer = Vec::new();

    write_error(&mut buffer, &CliError::Config(String::from("missing platform")));

    assert_eq!(
        String::from_utf8(buffer).expect("utf8 error"),
        "configuration error: missing platform\n"
    );
}
