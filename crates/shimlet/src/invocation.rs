//! Invocation state: one host call from request to completion.

use std::fmt;
use std::sync::{Mutex, PoisonError};

use serde_json::Value;
use tokio::sync::oneshot;

use crate::bridge::protocol::CorrelationId;
use crate::supervisor::FatalReason;

/// Outcome delivered to a completion: the worker's value or why there is none.
pub type InvocationResult = Result<Value, InvocationError>;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum InvocationError {
    /// The worker reported an error for this invocation.
    #[error("{0}")]
    Worker(String),

    /// The worker's response line could not be parsed.
    #[error("malformed worker response: {0}")]
    Protocol(String),

    /// Sequential mode only: another invocation is still outstanding.
    #[error("another invocation is already in flight")]
    Busy,

    #[error("failed to send request to worker: {0}")]
    Send(String),

    #[error("worker lost before responding: {0}")]
    WorkerLost(FatalReason),

    /// The bridge already shut down after a fatal worker failure.
    #[error("worker is unavailable")]
    Unavailable,

    #[error("invocation dropped without a result")]
    Abandoned,
}

type Callback = Box<dyn FnOnce(InvocationResult) + Send + 'static>;

/// Single-use completion callback.
///
/// Fires exactly once: either through [`Completion::complete`] or, if it is
/// dropped unfired, with [`InvocationError::Abandoned`].
///
/// The callback only has to be `Send`; the mutex makes the completion `Sync`
/// so it can sit in the shared pending table.
pub struct Completion {
    callback: Mutex<Option<Callback>>,
}

impl Completion {
    pub fn new(callback: impl FnOnce(InvocationResult) + Send + 'static) -> Self {
        Self {
            callback: Mutex::new(Some(Box::new(callback))),
        }
    }

    fn take_callback(&mut self) -> Option<Callback> {
        self.callback
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    /// Completion that forwards its result into a oneshot channel.
    pub fn channel() -> (Self, oneshot::Receiver<InvocationResult>) {
        let (tx, rx) = oneshot::channel();
        let completion = Self::new(move |result| {
            // Receiver gone means the caller stopped waiting.
            let _ = tx.send(result);
        });
        (completion, rx)
    }

    pub fn complete(mut self, result: InvocationResult) {
        if let Some(callback) = self.take_callback() {
            callback(result);
        }
    }
}

impl fmt::Debug for Completion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let fired = self
            .callback
            .lock()
            .map(|cb| cb.is_none())
            .unwrap_or(true);
        f.debug_struct("Completion").field("fired", &fired).finish()
    }
}

impl Drop for Completion {
    fn drop(&mut self) {
        if let Some(callback) = self.take_callback() {
            tracing::warn!("Completion dropped without a result");
            callback(Err(InvocationError::Abandoned));
        }
    }
}

/// One request from the host runtime.
#[derive(Debug)]
pub struct Invocation {
    id: CorrelationId,
    pub event: Value,
    pub context: Value,
    pub completion: Completion,
}

impl Invocation {
    pub fn new(event: Value, context: Value, completion: Completion) -> Self {
        Self {
            id: CorrelationId::new(),
            event,
            context,
            completion,
        }
    }

    pub fn id(&self) -> CorrelationId {
        self.id
    }

    pub fn into_parts(self) -> (CorrelationId, Value, Value, Completion) {
        (self.id, self.event, self.context, self.completion)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn complete_fires_once() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let completion = Completion::new(move |result| {
            assert_eq!(result, Ok(json!("done")));
            counter.fetch_add(1, Ordering::SeqCst);
        });

        completion.complete(Ok(json!("done")));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn dropped_completion_reports_abandoned() {
        let seen = Arc::new(std::sync::Mutex::new(None));
        let slot = Arc::clone(&seen);
        let completion = Completion::new(move |result| {
            *slot.lock().unwrap() = Some(result);
        });

        drop(completion);
        assert_eq!(
            *seen.lock().unwrap(),
            Some(Err(InvocationError::Abandoned))
        );
    }

    #[tokio::test]
    async fn channel_completion_delivers_result() {
        let (completion, rx) = Completion::channel();
        completion.complete(Err(InvocationError::Worker("boom".into())));
        assert_eq!(rx.await.unwrap(), Err(InvocationError::Worker("boom".into())));
    }

    #[test]
    fn invocations_get_distinct_ids() {
        let a = Invocation::new(json!({}), json!({}), Completion::new(|_| {}));
        let b = Invocation::new(json!({}), json!({}), Completion::new(|_| {}));
        assert_ne!(a.id(), b.id());
    }

    #[test]
    fn completion_is_shareable_across_threads() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<Completion>();
        assert_send_sync::<crate::pending::PendingTable>();
        assert_send_sync::<crate::service::RequestResponseBridge>();
    }

    #[test]
    fn worker_error_displays_verbatim() {
        let err = InvocationError::Worker("boom".to_string());
        assert_eq!(err.to_string(), "boom");
    }
}
