//! FileCheck-style tests for `.tir` files.
//!
//! Every file under `tests/filetest` carries its own `; RUN:` and `; CHECK:`
//! directives; the runner lowers it with the named options and matches the
//! printed module.

use std::fs;
use std::path::{Path, PathBuf};
use tilegen::tile_ir::check::{TestRunner, TestSpec};

fn filetest_dir() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR")).join("tests/filetest")
}

/// Discovers all .tir files in a directory recursively
fn discover_tir_files(dir: &Path) -> Vec<PathBuf> {
    let mut files = Vec::new();
    if let Ok(entries) = fs::read_dir(dir) {
        for entry in entries.flatten() {
            let path = entry.path();
            if path.is_dir() {
                files.extend(discover_tir_files(&path));
            } else if path.extension().and_then(|s| s.to_str()) == Some("tir") {
                files.push(path);
            }
        }
    }
    files.sort();
    files
}

fn run_filecheck_test(tir_file: &str) {
    let _ = env_logger::builder().is_test(true).try_init();
    let path = filetest_dir().join(tir_file);
    let contents = fs::read_to_string(&path)
        .unwrap_or_else(|e| panic!("Failed to read {}: {}", path.display(), e));
    let spec = TestSpec::parse(&contents)
        .unwrap_or_else(|e| panic!("Failed to parse test spec from {tir_file}: {e}"));
    TestRunner::new(false)
        .run_test(&spec)
        .unwrap_or_else(|e| panic!("Test {tir_file} failed: {e}"));
}

#[test]
fn test_copy_filecheck() {
    run_filecheck_test("copy.tir");
}

#[test]
fn test_reduce_filecheck() {
    run_filecheck_test("reduce.tir");
}

#[test]
fn test_host_filecheck() {
    run_filecheck_test("host.tir");
}

#[test]
fn test_async_copy_filecheck() {
    run_filecheck_test("async_copy.tir");
}

#[test]
fn test_async_fallback_filecheck() {
    run_filecheck_test("async_fallback.tir");
}

#[test]
fn test_double_buffer_filecheck() {
    run_filecheck_test("double_buffer.tir");
}

#[test]
fn test_trans_filecheck() {
    run_filecheck_test("trans.tir");
}

#[test]
fn test_all_filetests() {
    let _ = env_logger::builder().is_test(true).try_init();
    let files = discover_tir_files(&filetest_dir());
    assert!(!files.is_empty(), "no .tir files found");

    let mut failures = Vec::new();
    for path in &files {
        let result = fs::read_to_string(path)
            .map_err(|e| e.to_string())
            .and_then(|contents| TestSpec::parse(&contents))
            .and_then(|spec| TestRunner::new(false).run_test(&spec));
        if let Err(e) = result {
            failures.push(format!("{}: {e}", path.display()));
        }
    }
    assert!(failures.is_empty(), "failed filetests:\n{}", failures.join("\n"));
}
