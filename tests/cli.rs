use std::path::Path;
use std::process::{Command, Output};

fn run_in(dir: &Path, args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_wavernn"))
        .arg("--data-path")
        .arg(dir.join("data"))
        .arg("--checkpoint-dir")
        .arg(dir.join("ckpt"))
        .arg("--output-dir")
        .arg(dir.join("out"))
        .arg("--log-dir")
        .arg(dir.join("log"))
        .args(args)
        .env_remove("WAVERNN_DATA_PATH")
        .output()
        .expect("run wavernn")
}

#[test]
fn float_and_half_together_is_a_usage_error() {
    let dir = tempfile::tempdir().unwrap();
    let output = run_in(dir.path(), &["--float", "--half"]);
    assert_eq!(output.status.code(), Some(2));
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("--half"), "stderr: {stderr}");
}

#[test]
fn unknown_model_is_a_usage_error() {
    let dir = tempfile::tempdir().unwrap();
    let output = run_in(dir.path(), &["--model", "bogus"]);
    assert_eq!(output.status.code(), Some(2));
}

#[test]
fn loading_another_model_family_is_refused() {
    let dir = tempfile::tempdir().unwrap();
    let load = dir.path().join("wavernn_1000.safetensors");
    let load = load.to_str().unwrap();

    let output = run_in(dir.path(), &["--generate", "--load", load]);
    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("refusing to load"), "stderr: {stderr}");
    assert!(!dir.path().join("out").exists());
}

#[test]
fn force_skips_the_basename_check() {
    let dir = tempfile::tempdir().unwrap();
    let load = dir.path().join("wavernn_1000.safetensors");
    let load = load.to_str().unwrap();

    // Gets past the check, then fails on the missing dataset.
    let output = run_in(dir.path(), &["--generate", "--load", load, "--force"]);
    assert_eq!(output.status.code(), Some(1));
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(!stderr.contains("refusing"), "stderr: {stderr}");
}

#[test]
fn help_lists_the_model_choices() {
    let output = Command::new(env!("CARGO_BIN_EXE_wavernn"))
        .arg("--help")
        .output()
        .expect("run wavernn --help");
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("vqvae"));
    assert!(stdout.contains("nc"));
}
