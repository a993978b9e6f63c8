//! Worker side of the protocol - runs inside the worker subprocess.
//!
//! The host side (spawning, routing) is in supervisor.rs and service.rs.
//! A worker reads one request line from stdin per invocation and writes
//! exactly one response line to stdout, echoing the request's `id`.
//! Diagnostics belong on stderr, which the host passes through.

use std::future::Future;
use std::io;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::{FutureExt, SinkExt, StreamExt};
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{Semaphore, mpsc};
use tokio::task::JoinSet;
use tokio_util::codec::{FramedRead, FramedWrite};

use crate::bridge::codec::{DEFAULT_MAX_LINE_BYTES, JsonLinesCodec, LineFramer};
use crate::bridge::protocol::{RequestEnvelope, ResponseEnvelope};

pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// Function body run for every invocation.
#[async_trait::async_trait]
pub trait Handler: Send + Sync + 'static {
    async fn handle(&self, event: Value, context: Value) -> Result<Value, HandlerError>;
}

/// Adapter returned by [`handler_fn`].
pub struct HandlerFn<F> {
    f: F,
}

/// Build a [`Handler`] from an async closure.
pub fn handler_fn<F, Fut>(f: F) -> HandlerFn<F>
where
    F: Fn(Value, Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, HandlerError>> + Send + 'static,
{
    HandlerFn { f }
}

#[async_trait::async_trait]
impl<F, Fut> Handler for HandlerFn<F>
where
    F: Fn(Value, Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, HandlerError>> + Send + 'static,
{
    async fn handle(&self, event: Value, context: Value) -> Result<Value, HandlerError> {
        (self.f)(event, context).await
    }
}

pub struct WorkerConfig {
    /// Requests handled at once. With 1, responses leave in request order.
    pub concurrency: usize,
    pub max_line_bytes: usize,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            concurrency: 1,
            max_line_bytes: DEFAULT_MAX_LINE_BYTES,
        }
    }
}

impl WorkerConfig {
    pub fn with_concurrency(mut self, n: usize) -> Self {
        self.concurrency = n.max(1);
        self
    }
}

/// Serve requests on stdin/stdout until stdin closes.
pub async fn run_worker<H: Handler>(handler: Arc<H>, config: WorkerConfig) -> io::Result<()> {
    run_worker_io(handler, config, tokio::io::stdin(), tokio::io::stdout()).await
}

/// Serve requests over arbitrary streams. Returns after the reader hits EOF
/// and every in-flight request has been answered.
pub async fn run_worker_io<H, R, W>(
    handler: Arc<H>,
    config: WorkerConfig,
    reader: R,
    writer: W,
) -> io::Result<()>
where
    H: Handler,
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let concurrency = config.concurrency.max(1);
    let mut requests = FramedRead::new(reader, LineFramer::with_max_length(config.max_line_bytes));

    let (response_tx, mut response_rx) = mpsc::channel::<ResponseEnvelope>(concurrency);
    let writer_task = tokio::spawn(async move {
        let mut out = FramedWrite::new(writer, JsonLinesCodec::<ResponseEnvelope>::new());
        while let Some(response) = response_rx.recv().await {
            out.send(response).await.map_err(io::Error::other)?;
        }
        Ok::<(), io::Error>(())
    });

    let permits = Arc::new(Semaphore::new(concurrency));
    let mut in_flight = JoinSet::new();
    tracing::info!(concurrency, "Worker ready");

    let read_result = loop {
        let line = match requests.next().await {
            Some(Ok(line)) => line,
            Some(Err(e)) => {
                tracing::error!(error = %e, "Request stream error");
                break Err(io::Error::other(e));
            }
            None => {
                tracing::debug!("Request stream closed");
                break Ok(());
            }
        };

        // Waiting here keeps responses ordered when concurrency is 1.
        let permit = Arc::clone(&permits)
            .acquire_owned()
            .await
            .map_err(io::Error::other)?;

        while in_flight.try_join_next().is_some() {}

        let request = match serde_json::from_slice::<RequestEnvelope>(&line) {
            Ok(request) => request,
            Err(e) => {
                tracing::warn!(error = %e, "Malformed request line");
                let _ = response_tx
                    .send(ResponseEnvelope::failure(None, format!("invalid request: {e}")))
                    .await;
                drop(permit);
                continue;
            }
        };

        let handler = Arc::clone(&handler);
        let response_tx = response_tx.clone();
        in_flight.spawn(async move {
            let response = run_invocation(handler.as_ref(), request).await;
            // Host gone means nobody is listening; nothing to do.
            let _ = response_tx.send(response).await;
            drop(permit);
        });
    };

    while in_flight.join_next().await.is_some() {}
    drop(response_tx);

    match writer_task.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => {
            tracing::error!(error = %e, "Failed to write responses");
            return Err(e);
        }
        Err(e) => return Err(io::Error::other(e)),
    }

    tracing::info!("Worker exiting");
    read_result
}

async fn run_invocation<H: Handler>(handler: &H, request: RequestEnvelope) -> ResponseEnvelope {
    let RequestEnvelope { id, event, context } = request;

    match AssertUnwindSafe(handler.handle(event, context))
        .catch_unwind()
        .await
    {
        Ok(Ok(value)) => ResponseEnvelope::success(id, value),
        Ok(Err(e)) => ResponseEnvelope::failure(id, e.to_string()),
        Err(_) => {
            tracing::error!(?id, "Handler panicked");
            ResponseEnvelope::failure(id, "handler panicked")
        }
    }
}
