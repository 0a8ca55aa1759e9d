//! Unit tests for journal collection.

use std::net::Ipv4Addr;

use rstest::{fixture, rstest};
use tempfile::TempDir;

use super::*;
use crate::test_support::FakeSsh;

const HOST: IpAddr = IpAddr::V4(Ipv4Addr::new(198, 51, 100, 7));

struct Scratch {
    _tmp: TempDir,
    dir: Utf8PathBuf,
}

#[fixture]
fn scratch() -> Scratch {
    let tmp = TempDir::new().expect("tempdir");
    let dir = Utf8PathBuf::from_path_buf(tmp.path().to_path_buf()).expect("utf8 tempdir");
    Scratch { _tmp: tmp, dir }
}

#[rstest]
fn open_creates_an_empty_file(scratch: Scratch) {
    let journal = Journal::open(&scratch.dir).expect("journal opens");

    assert_eq!(journal.path(), scratch.dir.join(JOURNAL_FILE));
    assert_eq!(journal.read().expect("readable"), "");
    assert!(!journal.is_closed());
}

#[rstest]
fn open_fails_for_missing_directory(scratch: Scratch) {
    let err = Journal::open(&scratch.dir.join("absent")).expect_err("no directory");

    assert!(matches!(err, JournalError::Io { .. }), "got {err}");
}

#[rstest]
#[tokio::test]
async fn collect_replaces_the_snapshot(scratch: Scratch) {
    let ssh = FakeSsh::new();
    ssh.respond_stdout("journalctl", "first boot\n");
    ssh.respond_stdout("journalctl", "second boot\n");
    let mut journal = Journal::open(&scratch.dir).expect("journal opens");

    journal.collect(&ssh, HOST).await.expect("first collect");
    assert_eq!(journal.read().expect("readable"), "first boot\n");
    journal.collect(&ssh, HOST).await.expect("second collect");

    assert_eq!(journal.read().expect("readable"), "second boot\n");
    let calls = ssh.calls_mentioning("journalctl");
    assert_eq!(calls.len(), 2);
    assert!(calls.iter().all(|(host, command)| *host == HOST && command == JOURNAL_COMMAND));
}

#[rstest]
#[tokio::test]
async fn ssh_failure_keeps_previous_snapshot(scratch: Scratch) {
    let ssh = FakeSsh::new();
    ssh.respond_stdout("journalctl", "kept\n");
    let mut journal = Journal::open(&scratch.dir).expect("journal opens");
    journal.collect(&ssh, HOST).await.expect("first collect");
    ssh.set_unreachable(HOST, 1);

    let err = journal.collect(&ssh, HOST).await.expect_err("host unreachable");

    assert!(matches!(err, JournalError::Ssh(_)), "got {err}");
    assert_eq!(journal.read().expect("readable"), "kept\n");
}

#[rstest]
#[tokio::test]
async fn closed_journal_rejects_collection(scratch: Scratch) {
    let ssh = FakeSsh::new();
    let mut journal = Journal::open(&scratch.dir).expect("journal opens");

    journal.close();
    journal.close();
    let err = journal.collect(&ssh, HOST).await.expect_err("closed");

    assert!(journal.is_closed());
    assert_eq!(
        err,
        JournalError::Closed {
            path: scratch.dir.join(JOURNAL_FILE)
        }
    );
    assert!(ssh.calls().is_empty());
}
