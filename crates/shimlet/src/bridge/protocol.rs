//! Wire protocol types for host-worker communication.
//!
//! One JSON object per line in each direction over the worker's stdio:
//! - **Request** (host → worker): `{"id"?, "event", "context"}`
//! - **Response** (worker → host): `{"id"?, "error"?, "value"?}`
//!
//! `id` is only present when the bridge runs in correlated mode; legacy
//! workers that never echo it still work when invocations do not overlap.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Correlates a response line with the invocation that caused it.
///
/// UUID v4 so ids are never reused across bridge restarts or workers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CorrelationId(uuid::Uuid);

impl CorrelationId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> &uuid::Uuid {
        &self.0
    }

    pub fn parse(s: &str) -> Result<Self, uuid::Error> {
        let uuid = uuid::Uuid::parse_str(s)?;
        Ok(Self(uuid))
    }
}

impl Default for CorrelationId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One invocation as sent to the worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestEnvelope {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<CorrelationId>,
    #[serde(default)]
    pub event: Value,
    #[serde(default)]
    pub context: Value,
}

impl RequestEnvelope {
    pub fn new(id: Option<CorrelationId>, event: Value, context: Value) -> Self {
        Self { id, event, context }
    }
}

/// One result as reported by the worker.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ResponseEnvelope {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<CorrelationId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
}

impl ResponseEnvelope {
    pub fn success(id: Option<CorrelationId>, value: Value) -> Self {
        Self {
            id,
            error: None,
            value: Some(value),
        }
    }

    pub fn failure(id: Option<CorrelationId>, error: impl Into<String>) -> Self {
        Self {
            id,
            error: Some(error.into()),
            value: None,
        }
    }

    /// Parse one framed line from the worker.
    pub fn from_line(line: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(line)
    }

    /// A non-empty `error` wins; otherwise the value (null when absent).
    pub fn into_result(self) -> Result<Value, String> {
        match self.error {
            Some(error) if !error.is_empty() => Err(error),
            _ => Ok(self.value.unwrap_or(Value::Null)),
        }
    }
}
