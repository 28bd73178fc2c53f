mod common;

use std::fs;
use std::path::PathBuf;
use std::process::Command;

use common::*;

fn write_image(name: &str, words: &[u32]) -> PathBuf {
    let path = PathBuf::from(env!("CARGO_TARGET_TMPDIR")).join(name);
    fs::write(&path, words_to_bytes(words)).unwrap();
    path
}

#[test]
fn instruction_limit_spans_several_bursts() {
    let image = write_image("spin.bin", &[addi(A0, A0, 1), jal(ZERO, -4)]);
    let output = Command::new(env!("CARGO_BIN_EXE_riscv-emu"))
        .arg(&image)
        .args(["--max-insns", "25000"])
        .output()
        .unwrap();

    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(output.status.success(), "stderr: {stderr}");
    assert!(stderr.contains("instruction limit (25000) reached"), "stderr: {stderr}");
    assert!(output.stdout.is_empty());
}

#[test]
fn oversized_bootargs_are_reported() {
    let image = write_image("halt.bin", &[jal(ZERO, 0)]);
    let output = Command::new(env!("CARGO_BIN_EXE_riscv-emu"))
        .arg(&image)
        .args(["--max-insns", "1", "--bootargs"])
        .arg("x".repeat(8192))
        .output()
        .unwrap();

    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("does not fit"), "stderr: {stderr}");
}
