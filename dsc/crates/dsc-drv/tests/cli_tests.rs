//! End-to-end tests of the `dsc` binary.

use assert_cmd::Command;
use predicates::prelude::*;

fn dsc() -> Command {
    Command::cargo_bin("dsc").unwrap()
}

#[test]
fn test_run_source_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("hello.dc");
    std::fs::write(&path, "Start~#1; Print(#1, 'Hello, world!');\n").unwrap();

    dsc()
        .arg(&path)
        .assert()
        .success()
        .stdout("Hello, world!\n");
}

#[test]
fn test_compile_then_run_object() {
    let dir = tempfile::tempdir().unwrap();
    let source = dir.path().join("hello.dc");
    let object = dir.path().join("hello.dco");
    std::fs::write(&source, "Start~#1; Print(#1, 'from object');\n").unwrap();

    dsc()
        .arg(&source)
        .arg("--compile")
        .arg("--output")
        .arg(&object)
        .assert()
        .success();

    assert!(object.exists());

    dsc()
        .arg(&object)
        .assert()
        .success()
        .stdout("from object\n");
}

#[test]
fn test_compile_errors_fail_with_diagnostics() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("bad.dc");
    std::fs::write(&path, "Start~#1\nBogus(#1)\n").unwrap();

    dsc()
        .arg(&path)
        .assert()
        .failure()
        .stderr(predicate::str::contains("Bogus"));
}

#[test]
fn test_disassemble() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("hello.dc");
    std::fs::write(&path, "Start~#1; Print(#1, 'hi');\n").unwrap();

    dsc()
        .arg(&path)
        .arg("--disassemble")
        .assert()
        .success()
        .stdout(predicate::str::contains("SYSCALL"))
        .stdout(predicate::str::contains(".text"));
}

#[test]
fn test_missing_file_fails() {
    dsc().arg("does-not-exist.dc").assert().failure();
}

#[test]
fn test_debug_mode_reports_events() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("hello.dc");
    std::fs::write(&path, "Start~#1; Print(#1, 'hi');\n").unwrap();

    dsc()
        .arg(&path)
        .arg("--debug")
        .assert()
        .success()
        .stdout(predicate::str::contains("hi"))
        .stdout(predicate::str::contains("activated"));
}
