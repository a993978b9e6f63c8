//! Shared helpers for bridge integration tests.

#![allow(dead_code)]

use std::path::{Path, PathBuf};

use shimlet::{BridgeConfig, FatalPolicy};

/// The demo worker built alongside the library.
pub fn echo_worker() -> PathBuf {
    PathBuf::from(env!("CARGO_BIN_EXE_shimlet-echo"))
}

/// Echo worker that leaves the test process alive when it dies.
pub fn echo_config() -> BridgeConfig {
    BridgeConfig::new(echo_worker())
        .with_env("SHIM_LOG", "warn")
        .with_fatal_policy(FatalPolicy::Continue)
}

/// Write `body` to a shell script in `dir` and configure a bridge that runs it.
///
/// The script runs through `sh` rather than being executed directly, so the
/// freshly written file is never exec'd while a handle to it might be open.
pub fn script_config(dir: &Path, body: &str) -> BridgeConfig {
    let path = dir.join("main.sh");
    std::fs::write(&path, body).expect("write worker script");
    BridgeConfig::new("sh")
        .with_args([path])
        .with_fatal_policy(FatalPolicy::Continue)
}
