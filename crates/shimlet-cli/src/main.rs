//! shimlet: drive a worker locally the way the function host would.
//!
//! Reads JSON values from stdin and invokes the worker once per value,
//! printing each result as one line on stdout.

use std::ffi::OsString;
use std::io::{IsTerminal, Write};

use anyhow::{Context, Result, bail};
use clap::Parser;
use serde_json::{Map, Value};
use shimlet::{BridgeConfig, CorrelationMode, HostAdapter};
use tokio::sync::mpsc;

#[derive(Parser)]
#[command(name = "shimlet")]
#[command(about = "Invoke a stdio JSON worker with events read from stdin")]
struct Args {
    /// Log every line received from the worker
    #[arg(long)]
    debug: bool,

    /// Send requests without ids, one at a time
    #[arg(long)]
    sequential: bool,

    /// Maximum accepted response line length in bytes
    #[arg(long)]
    max_line_bytes: Option<usize>,

    /// Worker program and arguments (defaults to SHIM_WORKER or ./main)
    #[arg(last = true)]
    worker: Vec<OsString>,
}

impl Args {
    fn into_config(self) -> Result<BridgeConfig> {
        let mut config = BridgeConfig::from_env()?;

        let mut worker = self.worker.into_iter();
        if let Some(program) = worker.next() {
            config = config.with_worker(program).with_args(worker);
        }
        if self.debug {
            config = config.with_debug_lines(true);
        }
        if self.sequential {
            config = config.with_correlation(CorrelationMode::Sequential);
        }
        if let Some(n) = self.max_line_bytes {
            config = config.with_max_line_bytes(n);
        }
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    shimlet::logging::init_tracing();

    let config = Args::parse().into_config()?;
    let adapter = HostAdapter::start_or_exit(&config)
        .with_context(|| format!("starting worker {}", config.worker.program.display()))?;
    tracing::debug!(pid = ?adapter.bridge().worker_pid(), "Worker ready");

    let mut inputs = read_inputs();
    let mut stdout = std::io::stdout().lock();

    while let Some(input) = inputs.recv().await {
        let (event, context) = split_input(input.context("parsing input")?);
        match adapter.invoke(event, context).await {
            Ok(value) => {
                serde_json::to_writer(&mut stdout, &value)?;
                writeln!(stdout)?;
                stdout.flush()?;
            }
            Err(e) => {
                tracing::error!(error = %e, "Invocation failed");
                bail!("function response: {e}");
            }
        }
    }

    Ok(())
}

/// Decode JSON values from stdin on a blocking thread. An interactive
/// terminal yields a single empty object instead.
fn read_inputs() -> mpsc::Receiver<serde_json::Result<Value>> {
    let (tx, rx) = mpsc::channel(1);

    if std::io::stdin().is_terminal() {
        let _ = tx.try_send(Ok(Value::Object(Map::new())));
        return rx;
    }

    tokio::task::spawn_blocking(move || {
        let stdin = std::io::stdin().lock();
        for value in serde_json::Deserializer::from_reader(stdin).into_iter::<Value>() {
            let failed = value.is_err();
            if tx.blocking_send(value).is_err() || failed {
                break;
            }
        }
    });
    rx
}

/// `{"event": {...}, "context": ...}` is unwrapped; anything else is the event.
fn split_input(input: Value) -> (Value, Value) {
    match input {
        Value::Object(mut obj) if obj.get("event").is_some_and(Value::is_object) => {
            let event = obj.remove("event").unwrap_or_default();
            let context = match obj.remove("context") {
                Some(Value::Null) | None => Value::Object(Map::new()),
                Some(context) => context,
            };
            (event, context)
        }
        other => (other, Value::Object(Map::new())),
    }
}
