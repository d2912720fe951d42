//! CLI surface contract: `--help` and `--version` both exit 0; an unknown
//! flag exits nonzero.
use std::process::Command;

#[test]
fn help_flag_exits_zero() {
    let bin = assert_cmd::cargo::cargo_bin!("fetchguard");
    let out = Command::new(bin).arg("--help").output().expect("run fetchguard --help");
    assert!(out.status.success());
    assert!(String::from_utf8_lossy(&out.stdout).contains("fetchguard"));
}

#[test]
fn version_flag_exits_zero() {
    let bin = assert_cmd::cargo::cargo_bin!("fetchguard");
    let out = Command::new(bin).arg("--version").output().expect("run fetchguard --version");
    assert!(out.status.success());
    assert!(!out.stdout.is_empty());
}

#[test]
fn unknown_flag_exits_nonzero() {
    let bin = assert_cmd::cargo::cargo_bin!("fetchguard");
    let out = Command::new(bin).arg("--not-a-real-flag").output().expect("run fetchguard");
    assert!(!out.status.success());
}
