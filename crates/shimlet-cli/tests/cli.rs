//! Process-level checks of the shimlet driver's exit behavior.

use std::io::Write;
use std::process::{Command, Output, Stdio};

fn run_shimlet(args: &[&str], stdin: &str) -> Output {
    let mut child = Command::new(env!("CARGO_BIN_EXE_shimlet"))
        .args(args)
        .env_remove("SHIM_WORKER")
        .env_remove("SHIM_CORRELATION")
        .env_remove("RUST_LOG")
        .env_remove("LOG_FORMAT")
        .env("SHIM_LOG", "warn")
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .expect("spawn shimlet");

    // The driver may exit before reading when the worker fails to start.
    let _ = child.stdin.take().unwrap().write_all(stdin.as_bytes());
    child.wait_with_output().expect("wait for shimlet")
}

#[test]
fn missing_worker_exits_nonzero() {
    let out = run_shimlet(&["--", "/nonexistent/shimlet-worker"], "{}\n");
    assert!(!out.status.success());
    assert!(out.stdout.is_empty());
}

#[cfg(unix)]
#[test]
fn worker_crash_exits_nonzero() {
    let out = run_shimlet(&["--", "sh", "-c", "read line; exit 1"], "{\"a\":1}\n");
    assert_eq!(out.status.code(), Some(1));
    assert!(out.stdout.is_empty());
}

#[cfg(unix)]
#[test]
fn prints_one_line_per_invocation() {
    let dir = tempfile::tempdir().unwrap();
    let script = dir.path().join("main.sh");
    std::fs::write(
        &script,
        "while read line; do echo '{\"value\":{\"status\":200}}'; done\n",
    )
    .unwrap();

    let out = run_shimlet(
        &["--sequential", "--", "sh", script.to_str().unwrap()],
        "{\"a\":1}\n{\"event\":{\"b\":2},\"context\":{}}\n",
    );

    assert!(out.status.success(), "stderr: {}", String::from_utf8_lossy(&out.stderr));
    assert_eq!(
        String::from_utf8(out.stdout).unwrap(),
        "{\"status\":200}\n{\"status\":200}\n"
    );
}

#[cfg(unix)]
#[test]
fn worker_error_exits_nonzero() {
    let out = run_shimlet(
        &["--", "sh", "-c", "read line; echo '{\"error\":\"boom\"}'; cat > /dev/null"],
        "{}\n",
    );
    assert!(!out.status.success());
    let stderr = String::from_utf8_lossy(&out.stderr);
    assert!(stderr.contains("boom"), "stderr: {stderr}");
    // Logged through tracing as well as reported by the error exit.
    assert!(stderr.contains("Invocation failed"), "stderr: {stderr}");
}
