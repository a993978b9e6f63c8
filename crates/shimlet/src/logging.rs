//! Tracing setup shared by the host binary and worker binaries.

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Log level for shimlet targets when `RUST_LOG` is not set.
pub const ENV_LOG: &str = "SHIM_LOG";
/// `json` switches to structured output.
pub const ENV_LOG_FORMAT: &str = "LOG_FORMAT";

/// Initialize tracing with SHIM_LOG and LOG_FORMAT support.
///
/// Always writes to stderr: stdout is a protocol channel for workers and the
/// result stream for the host driver. Safe to call more than once.
pub fn init_tracing() {
    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        EnvFilter::new(default_filter(std::env::var(ENV_LOG).ok().as_deref()))
    };

    let use_json = std::env::var(ENV_LOG_FORMAT).as_deref() == Ok("json");

    if use_json {
        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(std::io::stderr));
        let _ = subscriber.try_init();
    } else {
        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_writer(std::io::stderr));
        let _ = subscriber.try_init();
    }
}

fn default_filter(level: Option<&str>) -> String {
    let base_level = match level {
        Some("debug") => "debug",
        Some("trace") => "trace",
        Some("warn") | Some("warning") => "warn",
        Some("error") => "error",
        _ => "info",
    };

    format!(
        "shimlet={level},shimlet_cli={level},shimlet::wire=info",
        level = base_level
    )
}
