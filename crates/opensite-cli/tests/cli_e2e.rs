//! End-to-end checks of the CLI surface: argument validation and exit
//! codes, run against the real binary. Anything touching PostGIS is out of
//! reach here; these paths must fail (or succeed) before the database is
//! needed.

use std::process::Command;

fn opensite_cmd(temp: &std::path::Path) -> Command {
    let mut cmd = Command::new(env!("CARGO_BIN_EXE_opensite"));
    // Keep the binary from writing .env or build folders into the repo.
    cmd.current_dir(temp)
        .env("OPENSITE_SECRET_KEY", "e2e-test-key")
        .env("BUILD_FOLDER", temp.join("build"))
        .env("OPENSITE_LOG", "error");
    cmd
}

#[test]
fn help_exits_zero() {
    let td = tempfile::tempdir().expect("tempdir");
    let output = opensite_cmd(td.path())
        .arg("--help")
        .output()
        .expect("run binary");
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("--clip"));
    assert!(stdout.contains("--graphonly"));
    assert!(stdout.contains("--purgeall"));
}

#[test]
fn version_exits_zero() {
    let td = tempfile::tempdir().expect("tempdir");
    let output = opensite_cmd(td.path())
        .arg("--version")
        .output()
        .expect("run binary");
    assert!(output.status.success());
}

#[test]
fn missing_height_to_tip_is_a_validation_failure() {
    let td = tempfile::tempdir().expect("tempdir");
    let output = opensite_cmd(td.path()).output().expect("run binary");
    assert_eq!(output.status.code(), Some(2));
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("height-to-tip"));
}

#[test]
fn negative_height_to_tip_is_rejected() {
    let td = tempfile::tempdir().expect("tempdir");
    let output = opensite_cmd(td.path())
        .args(["--", "-5"])
        .output()
        .expect("run binary");
    assert_eq!(output.status.code(), Some(2));
}

#[test]
fn server_mode_is_delegated_to_the_wrapper() {
    let td = tempfile::tempdir().expect("tempdir");
    let output = opensite_cmd(td.path())
        .args(["--server", "8000"])
        .output()
        .expect("run binary");
    assert_eq!(output.status.code(), Some(2));
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("admin wrapper"));
}

#[test]
fn unknown_flag_is_a_usage_error() {
    let td = tempfile::tempdir().expect("tempdir");
    let output = opensite_cmd(td.path())
        .arg("--frobnicate")
        .output()
        .expect("run binary");
    assert!(!output.status.success());
}
