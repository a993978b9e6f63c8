//! RequestResponseBridge: turns invocations into request lines and response
//! lines back into completions.
//!
//! The bridge owns the pending table and the single reader of the worker's
//! output. One background task reads framed lines, claims the matching
//! pending invocation and fires its completion. When the worker channel is
//! lost, every pending invocation is failed, the bridge is marked defunct and
//! the configured fatal policy runs.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use serde_json::Value;
use tokio::sync::{Mutex, watch};

use crate::bridge::protocol::{RequestEnvelope, ResponseEnvelope};
use crate::config::{BridgeConfig, CorrelationMode, FatalPolicy};
use crate::invocation::{Completion, Invocation, InvocationError, InvocationResult};
use crate::pending::PendingTable;
use crate::supervisor::{
    FatalReason, SpawnError, WorkerExit, WorkerOutput, WorkerSupervisor, enforce_fatal_policy,
};

/// How long to wait for an exit status after the worker closes stdout.
const EXIT_GRACE: Duration = Duration::from_secs(5);

/// How long to keep reading buffered output after the worker has exited.
const DRAIN_GRACE: Duration = Duration::from_millis(250);

pub struct RequestResponseBridge {
    supervisor: Arc<WorkerSupervisor>,
    pending: Arc<PendingTable>,
    lost_rx: watch::Receiver<Option<FatalReason>>,
    /// Held from install to write, so pending order is the order the worker
    /// reads requests in. Id-less responses rely on it.
    submit_order: Mutex<()>,
}

impl RequestResponseBridge {
    /// Spawn the worker and start routing its output.
    pub fn start(config: &BridgeConfig) -> Result<Self, SpawnError> {
        let supervisor = WorkerSupervisor::start(config)?;
        Self::from_supervisor(supervisor, config)
    }

    /// Attach to an already started worker. Fails if its output was taken.
    pub fn from_supervisor(
        supervisor: WorkerSupervisor,
        config: &BridgeConfig,
    ) -> Result<Self, SpawnError> {
        let output = supervisor
            .take_output()
            .ok_or(SpawnError::MissingPipe("stdout"))?;

        let supervisor = Arc::new(supervisor);
        let pending = Arc::new(PendingTable::new(config.correlation));
        let (lost_tx, lost_rx) = watch::channel(None);

        tracing::info!(
            pid = ?supervisor.pid(),
            correlation = config.correlation.as_str(),
            "Bridge ready"
        );

        tokio::spawn(run_read_loop(
            output,
            Arc::clone(&supervisor),
            Arc::clone(&pending),
            config.debug_lines,
            config.fatal_policy,
            lost_tx,
        ));

        Ok(Self {
            supervisor,
            pending,
            lost_rx,
            submit_order: Mutex::new(()),
        })
    }

    /// Send one invocation to the worker.
    ///
    /// Returns once the request line is written; the result arrives later
    /// through the invocation's completion, which fires exactly once.
    pub async fn submit(&self, invocation: Invocation) {
        let (id, event, context, completion) = invocation.into_parts();

        if self.lost_reason().is_some() {
            completion.complete(Err(InvocationError::Unavailable));
            return;
        }

        let _order = self.submit_order.lock().await;

        if let Err(completion) = self.pending.install(id, completion) {
            tracing::warn!(%id, "Rejecting invocation while another is in flight");
            completion.complete(Err(InvocationError::Busy));
            return;
        }

        // The read loop may have torn down between the check and the install.
        if self.lost_reason().is_some() {
            if let Some(claimed) = self.pending.take(id) {
                claimed
                    .completion
                    .complete(Err(InvocationError::Unavailable));
            }
            return;
        }

        let wire_id = match self.pending.mode() {
            CorrelationMode::Correlated => Some(id),
            CorrelationMode::Sequential => None,
        };

        tracing::debug!(%id, "Submitting invocation");
        if let Err(e) = self
            .supervisor
            .send(RequestEnvelope::new(wire_id, event, context))
            .await
        {
            tracing::error!(%id, error = %e, "Failed to write request to worker");
            if let Some(claimed) = self.pending.take(id) {
                claimed
                    .completion
                    .complete(Err(InvocationError::Send(e.to_string())));
            }
        }
    }

    /// Submit and wait for the result.
    pub async fn invoke(&self, event: Value, context: Value) -> InvocationResult {
        let (completion, rx) = Completion::channel();
        self.submit(Invocation::new(event, context, completion))
            .await;
        rx.await.unwrap_or(Err(InvocationError::Abandoned))
    }

    /// Why the worker channel was lost, if it was.
    pub fn lost_reason(&self) -> Option<FatalReason> {
        (*self.lost_rx.borrow()).clone()
    }

    pub fn is_available(&self) -> bool {
        self.lost_reason().is_none()
    }

    /// Resolve once the worker channel is lost.
    pub async fn closed(&self) -> FatalReason {
        let mut rx = self.lost_rx.clone();
        match rx.wait_for(Option::is_some).await {
            Ok(reason) => (*reason)
                .clone()
                .unwrap_or(FatalReason::Exited(WorkerExit::unknown())),
            Err(_) => FatalReason::Exited(WorkerExit::unknown()),
        }
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn worker_pid(&self) -> Option<u32> {
        self.supervisor.pid()
    }

    /// Resolve once the worker process has ended.
    pub async fn worker_exited(&self) -> WorkerExit {
        self.supervisor.wait_exit().await
    }
}

async fn run_read_loop(
    mut output: WorkerOutput,
    supervisor: Arc<WorkerSupervisor>,
    pending: Arc<PendingTable>,
    debug_lines: bool,
    fatal_policy: FatalPolicy,
    lost_tx: watch::Sender<Option<FatalReason>>,
) {
    let reason = loop {
        tokio::select! {
            biased;

            line = output.next() => match line {
                Some(Ok(line)) => dispatch_line(&pending, &line, debug_lines),
                Some(Err(e)) => {
                    tracing::error!(error = %e, "Worker output framing error");
                    break FatalReason::Framing(e.to_string());
                }
                None => {
                    tracing::debug!("Worker stdout closed");
                    match tokio::time::timeout(EXIT_GRACE, supervisor.wait_exit()).await {
                        Ok(exit) => break FatalReason::Exited(exit),
                        Err(_) => {
                            break FatalReason::Framing(
                                "worker closed its output but kept running".to_string(),
                            );
                        }
                    }
                }
            },

            exit = supervisor.wait_exit() => {
                // Deliver anything the worker flushed before it went away.
                while let Ok(Some(Ok(line))) =
                    tokio::time::timeout(DRAIN_GRACE, output.next()).await
                {
                    dispatch_line(&pending, &line, debug_lines);
                }
                break FatalReason::Exited(exit);
            }
        }
    };

    tracing::error!(%reason, pending = pending.len(), "Worker channel lost");
    lost_tx.send_replace(Some(reason.clone()));

    // Output can no longer be trusted; don't leave a live worker behind.
    if matches!(reason, FatalReason::Framing(_)) {
        supervisor.kill();
    }

    for claimed in pending.drain() {
        tracing::warn!(id = %claimed.id, "Failing invocation due to lost worker");
        claimed
            .completion
            .complete(Err(InvocationError::WorkerLost(reason.clone())));
    }

    enforce_fatal_policy(fatal_policy, &reason);
}

/// Route one framed response line to its pending invocation.
fn dispatch_line(pending: &PendingTable, line: &[u8], debug_lines: bool) {
    if debug_lines {
        tracing::info!(
            target: "shimlet::wire",
            line = %String::from_utf8_lossy(line),
            "Parsing worker line"
        );
    }

    let response = match ResponseEnvelope::from_line(line) {
        Ok(response) => response,
        Err(e) => {
            // No usable id: blame the longest-waiting invocation.
            tracing::error!(error = %e, "Malformed worker response");
            match pending.claim_oldest() {
                Some(claimed) => claimed
                    .completion
                    .complete(Err(InvocationError::Protocol(e.to_string()))),
                None => tracing::warn!("Malformed response with no pending invocation"),
            }
            return;
        }
    };

    match pending.claim(response.id) {
        Ok(claimed) => {
            let result = response.into_result().map_err(InvocationError::Worker);
            tracing::debug!(
                id = %claimed.id,
                elapsed_ms = claimed.elapsed.as_millis() as u64,
                ok = result.is_ok(),
                "Invocation completed"
            );
            claimed.completion.complete(result);
        }
        Err(unmatched) => {
            tracing::warn!(%unmatched, "Discarding worker response");
        }
    }
}
