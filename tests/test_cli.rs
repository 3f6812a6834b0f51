//! Integration tests for the tether binary

use assert_cmd::Command;
use predicates::prelude::*;
use std::io::Write;

fn tether() -> Command {
    Command::cargo_bin("tether").unwrap()
}

#[test]
fn test_command_flag() {
    tether()
        .args(["-c", "echo hi"])
        .assert()
        .success()
        .stdout("hi\n");
}

#[test]
fn test_false_status_exits_one() {
    tether().args(["-c", "false"]).assert().code(1);
}

#[test]
fn test_script_file() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(file, "macro twice, (echo $1; echo $1)").unwrap();
    writeln!(file, "twice hey").unwrap();
    tether()
        .arg(file.path())
        .assert()
        .success()
        .stdout("hey\nhey\n");
}

#[test]
fn test_missing_script_is_usage_error() {
    tether()
        .arg("/nonexistent/script.tr")
        .assert()
        .code(2)
        .stderr(predicate::str::contains("Error reading"));
}

#[test]
fn test_parse_error_fails() {
    tether().args(["-c", "echo (unclosed"]).assert().code(1);
}

#[test]
fn test_version() {
    tether()
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::starts_with("tether "));
}

#[test]
fn test_unknown_flag() {
    tether()
        .arg("--bogus")
        .assert()
        .code(2)
        .stderr(predicate::str::contains("unknown option"));
}
