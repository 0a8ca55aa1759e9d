//! Unit tests for user-data rendering.

use camino::Utf8PathBuf;
use cap_std::{ambient_authority, fs_utf8::Dir};
use rstest::rstest;
use tempfile::TempDir;

use super::*;
use crate::provider::Platform;

#[test]
fn aws_placeholder_appears_verbatim() {
    let user_data = UserData::ignition(r#"{"addr":"$public_ipv4","peer":"$private_ipv4"}"#);

    let rendered = user_data.render_for(Platform::Aws.ip_placeholders());

    assert_eq!(
        rendered,
        r#"{"addr":"${COREOS_AWS_IPV4_PUBLIC_0}","peer":"${COREOS_AWS_IPV4_PRIVATE_0}"}"#
    );
}

#[rstest]
#[case::every_occurrence("$a and $a", &[("$a", "x")], "x and x")]
#[case::applied_in_order("$a", &[("$a", "$b"), ("$b", "y")], "y")]
#[case::literal_value("$a", &[("$a", "${VAR}")], "${VAR}")]
#[case::empty_placeholder_ignored("abc", &[("", "zzz")], "abc")]
#[case::untouched_without_match("plain", &[("$a", "x")], "plain")]
fn render_replaces_literally(
    #[case] template: &str,
    #[case] substitutions: &[(&str, &str)],
    #[case] expected: &str,
) {
    assert_eq!(UserData::ignition(template).render(substitutions), expected);
}

#[test]
fn empty_payload_is_blank() {
    assert!(UserData::empty().is_empty());
    assert!(UserData::ignition("  \n").is_empty());
    assert!(!UserData::ignition("{}").is_empty());
}

#[test]
fn from_file_reads_through_cap_std() {
    let tmp = TempDir::new().expect("tempdir");
    let root = Utf8PathBuf::from_path_buf(tmp.path().to_path_buf()).expect("utf8 tempdir");
    let dir = Dir::open_ambient_dir(&root, ambient_authority()).expect("open tempdir");
    dir.write("config.ign", r#"{"ignition":{"version":"2.1.0"}}"#)
        .expect("write payload");

    let loaded = UserData::from_file(root.join("config.ign").as_str()).expect("read payload");

    assert_eq!(loaded.as_str(), r#"{"ignition":{"version":"2.1.0"}}"#);
}

#[test]
fn from_file_reports_missing_path() {
    let err = UserData::from_file("/nonexistent/kola/config.ign").expect_err("missing file");
    let UserDataError::Read { path, .. } = err;
    assert_eq!(path, "/nonexistent/kola/config.ign");
}
