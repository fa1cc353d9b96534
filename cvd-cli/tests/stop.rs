use predicates::prelude::*;
use rstest::rstest;

mod common;

#[rstest]
#[case::acknowledged(Some(b'S'), "Successfully stopped")]
#[case::closed_without_reply(None, "without replying")]
fn test_stop_succeeds(#[case] reply: Option<u8>, #[case] message: &str) {
    let launcher = common::FakeLauncher::start(reply);

    common::stop_cvd()
        .arg("--instance-dir")
        .arg(launcher.instance_dir())
        .assert()
        .success()
        .stdout(predicate::str::contains(message));

    assert_eq!(launcher.received(), b"X");
}

#[test]
fn test_stop_refused() {
    let launcher = common::FakeLauncher::start(Some(b'E'));

    common::stop_cvd()
        .arg("--instance-dir")
        .arg(launcher.instance_dir())
        .assert()
        .code(1)
        .stderr(predicate::str::contains("failed to stop"));

    assert_eq!(launcher.received(), b"X");
}

#[test]
fn test_stop_no_launcher() {
    let dir = tempfile::tempdir().unwrap();

    common::stop_cvd()
        .arg("--instance-dir")
        .arg(dir.path())
        .assert()
        .code(1)
        .stderr(predicate::str::contains("Unable to connect"));
}

#[test]
fn test_stop_through_global_config() {
    let launcher = common::FakeLauncher::start(Some(b'S'));
    let home = tempfile::tempdir().unwrap();
    common::link_instance(home.path(), launcher.instance_dir());

    common::stop_cvd()
        .arg("--home")
        .arg(home.path())
        .assert()
        .success();

    assert_eq!(launcher.received(), b"X");
}

#[test]
fn test_stop_without_any_instance() {
    let home = tempfile::tempdir().unwrap();

    common::stop_cvd()
        .arg("--home")
        .arg(home.path())
        .assert()
        .code(1)
        .stderr(predicate::str::contains("no launched instance found"));
}
