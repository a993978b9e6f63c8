//! HostAdapter: the entry point the host runtime calls once per invocation.

use std::sync::Arc;

use serde_json::Value;

use crate::config::BridgeConfig;
use crate::invocation::{Completion, Invocation, InvocationResult};
use crate::service::RequestResponseBridge;
use crate::supervisor::{FatalReason, SpawnError, enforce_fatal_policy};

/// Host flag that would hold the completion until the event loop is idle.
/// The worker keeps pipes open forever, so it must be off.
pub const WAIT_FOR_EMPTY_EVENT_LOOP: &str = "callbackWaitsForEmptyEventLoop";

/// Translates the host's `(event, context, callback)` contract onto the bridge.
#[derive(Clone)]
pub struct HostAdapter {
    bridge: Arc<RequestResponseBridge>,
}

impl HostAdapter {
    /// Spawn the worker and wire up the bridge.
    pub fn start(config: &BridgeConfig) -> Result<Self, SpawnError> {
        let bridge = RequestResponseBridge::start(config)?;
        Ok(Self::new(Arc::new(bridge)))
    }

    /// Like [`HostAdapter::start`], but a spawn failure goes through the
    /// configured fatal policy. Under the default policy this never returns
    /// an error: the host process exits instead.
    pub fn start_or_exit(config: &BridgeConfig) -> Result<Self, SpawnError> {
        Self::start(config).inspect_err(|e| {
            enforce_fatal_policy(config.fatal_policy, &FatalReason::SpawnFailed(e.to_string()));
        })
    }

    pub fn new(bridge: Arc<RequestResponseBridge>) -> Self {
        Self { bridge }
    }

    pub fn bridge(&self) -> &Arc<RequestResponseBridge> {
        &self.bridge
    }

    /// Host-facing handler. Returns immediately; `callback` fires exactly
    /// once with the worker's value or an error.
    ///
    /// Must be called from within a tokio runtime.
    pub fn handle<F>(&self, event: Value, context: Value, callback: F)
    where
        F: FnOnce(InvocationResult) + Send + 'static,
    {
        let invocation = Invocation::new(
            event,
            prepare_context(context),
            Completion::new(callback),
        );
        let bridge = Arc::clone(&self.bridge);
        tokio::spawn(async move {
            bridge.submit(invocation).await;
        });
    }

    /// Async form of [`HostAdapter::handle`].
    pub async fn invoke(&self, event: Value, context: Value) -> InvocationResult {
        self.bridge.invoke(event, prepare_context(context)).await
    }
}

/// Turn off the host's wait-for-idle flag on object contexts, adding it if
/// absent. Other context shapes are forwarded as they are.
fn prepare_context(mut context: Value) -> Value {
    if let Some(ctx) = context.as_object_mut() {
        ctx.insert(WAIT_FOR_EMPTY_EVENT_LOOP.to_string(), Value::Bool(false));
    }
    context
}
