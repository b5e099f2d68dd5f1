//! Drive the `etch` binary against compiled `.etcx` artifacts.

use etch_engine::ast::builder::*;
use etch_engine::ast::{BinOp, Program, Type};
use etch_engine::bytecode;
use etch_engine::codegen::{emit_program, CodegenOptions};
use std::path::PathBuf;
use std::process::Command;

fn etch_bin() -> Command {
    Command::new(env!("CARGO_BIN_EXE_etch"))
}

/// Compile a tiny program to `<dir>/<name>.etcx` and return its path.
fn write_artifact(dir: &std::path::Path, name: &str, exit: i64) -> PathBuf {
    let mut program = Program::new();
    program.add_function(func(
        "main",
        vec![],
        Type::Int,
        vec![ret(binary(BinOp::Add, int(exit), int(0)))],
    ));
    let compiled = emit_program(&program, &CodegenOptions::default()).unwrap();
    let path = dir.join(format!("{name}.etcx"));
    std::fs::write(&path, bytecode::encode_program(&compiled)).unwrap();
    path
}

#[test]
fn run_executes_bytecode_and_propagates_exit_code() {
    let dir = tempfile::TempDir::new().unwrap();
    let artifact = write_artifact(dir.path(), "ok", 7);

    let status = etch_bin().arg("--run").arg(&artifact).status().unwrap();
    assert_eq!(status.code(), Some(7));
}

#[test]
fn dump_bytecode_prints_disassembly() {
    let dir = tempfile::TempDir::new().unwrap();
    let artifact = write_artifact(dir.path(), "dump", 0);

    let output = etch_bin()
        .arg("--dump-bytecode")
        .arg(&artifact)
        .output()
        .unwrap();
    assert!(output.status.success());
    let text = String::from_utf8_lossy(&output.stdout);
    assert!(text.contains("etch bytecode"), "got: {text}");
    assert!(text.contains("main"), "got: {text}");
}

#[test]
fn test_suite_reports_per_file_results() {
    let dir = tempfile::TempDir::new().unwrap();
    write_artifact(dir.path(), "a", 0);
    write_artifact(dir.path(), "b", 0);

    let output = etch_bin().arg("--test").arg(dir.path()).output().unwrap();
    assert!(output.status.success());
    let text = String::from_utf8_lossy(&output.stdout);
    assert!(text.contains("2 passed, 0 failed"), "got: {text}");
}

#[test]
fn missing_file_is_a_user_error() {
    let status = etch_bin().arg("/does/not/exist.etch").status().unwrap();
    assert_eq!(status.code(), Some(1));
}

#[test]
fn unknown_backend_is_rejected() {
    let output = etch_bin()
        .arg("--gen")
        .arg("jvm")
        .arg("whatever.etch")
        .output()
        .unwrap();
    assert_eq!(output.status.code(), Some(1));
    let text = String::from_utf8_lossy(&output.stderr);
    assert!(text.contains("unknown backend"), "got: {text}");
}

#[test]
fn c_backend_reports_unlinked() {
    let output = etch_bin()
        .arg("--gen")
        .arg("c")
        .arg("whatever.etch")
        .output()
        .unwrap();
    assert_eq!(output.status.code(), Some(1));
    let text = String::from_utf8_lossy(&output.stderr);
    assert!(text.contains("C backend"), "got: {text}");
}
