//! CLI-level validation, exercised without needing a real FUSE mount.

use assert_cmd::Command;
use predicates::str::contains;

#[test]
fn rejects_a_nonexistent_source_directory() {
    let mount_point = tempfile::tempdir().expect("tempdir");

    Command::cargo_bin("queuefs")
        .unwrap()
        .arg("/no/such/source/directory")
        .arg(mount_point.path())
        .arg("true")
        .assert()
        .code(1)
        .stderr(contains("not accessible"));
}

#[test]
fn requires_a_command_argument() {
    let src = tempfile::tempdir().expect("tempdir");
    let mount_point = tempfile::tempdir().expect("tempdir");

    // spec.md §6: "Exit code 1 on argument error" — clap's own default for a
    // missing required argument is 2, so this must be overridden to 1.
    Command::cargo_bin("queuefs")
        .unwrap()
        .arg(src.path())
        .arg(mount_point.path())
        .assert()
        .code(1);
}

#[test]
fn rejects_an_unrecognized_flag_with_exit_code_one() {
    let src = tempfile::tempdir().expect("tempdir");
    let mount_point = tempfile::tempdir().expect("tempdir");

    Command::cargo_bin("queuefs")
        .unwrap()
        .arg("--not-a-real-flag")
        .arg(src.path())
        .arg(mount_point.path())
        .arg("true")
        .assert()
        .code(1);
}
