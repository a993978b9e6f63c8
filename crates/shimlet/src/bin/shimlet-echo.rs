//! Demo worker: echoes each invocation back, with a few control keys in the
//! event for exercising the host side.
//!
//! - `{"fail": "msg"}`: respond with error `msg`
//! - `{"reply": v}`: respond with value `v`
//! - `{"sleep_ms": n}`: wait before responding
//! - `{"exit": code}`: exit the process without responding
//! - `{"garbage": true}`: write a non-JSON line before the real response
//!
//! `SHIMLET_ECHO_CONCURRENCY` sets how many requests run at once.

use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{Value, json};
use shimlet::{Handler, HandlerError, WorkerConfig, run_worker};

struct Echo;

#[async_trait::async_trait]
impl Handler for Echo {
    async fn handle(&self, event: Value, context: Value) -> Result<Value, HandlerError> {
        if let Some(ms) = event.get("sleep_ms").and_then(Value::as_u64) {
            tokio::time::sleep(Duration::from_millis(ms)).await;
        }
        if let Some(code) = event.get("exit").and_then(Value::as_i64) {
            tracing::warn!(code, "Exiting on request");
            std::process::exit(code as i32);
        }
        if event.get("garbage").and_then(Value::as_bool) == Some(true) {
            let mut stdout = std::io::stdout().lock();
            stdout.write_all(b"this is not json\n")?;
            stdout.flush()?;
        }
        if let Some(msg) = event.get("fail").and_then(Value::as_str) {
            return Err(msg.to_string().into());
        }
        if let Some(reply) = event.get("reply") {
            return Ok(reply.clone());
        }
        Ok(json!({"event": event, "context": context}))
    }
}

#[tokio::main]
async fn main() -> std::io::Result<()> {
    shimlet::logging::init_tracing();

    let concurrency = std::env::var("SHIMLET_ECHO_CONCURRENCY")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(1);

    run_worker(
        Arc::new(Echo),
        WorkerConfig::default().with_concurrency(concurrency),
    )
    .await
}
