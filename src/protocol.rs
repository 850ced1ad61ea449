//! Request/Response data model.
//!
//! A [`Request`] names a task and the response hook its eventual
//! [`Response`] must be delivered to. Both travel as one JSON document:
//!
//! ```text
//! Request  { id, task, args, responsehook, streamurl? }
//! Response { id, result? | error?, streamurl? }
//! ```
//!
//! Success/error handlers and the `proxied` flag live only in the local
//! process and are never serialized.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

use crate::error::{AcommError, Result};

/// Callback invoked with the originating Request and its Response.
pub type ResponseHandler = Arc<dyn Fn(&Request, &Response) + Send + Sync>;

// ─── Errors carried inside a Response ─────────────────────────────────────

/// Classification of a [`ResponseError`].
///
/// Travels as a snake_case string. Kinds this build does not know are kept
/// verbatim in [`ErrorKind::Other`], so relayed errors are not rewritten.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum ErrorKind {
    /// No Response arrived before the request's timeout.
    Timeout,
    /// The peer sent a malformed envelope.
    Protocol,
    /// Local I/O failed while servicing the request.
    Io,
    /// No handler is registered for the requested task.
    UnknownTask,
    /// The task handler itself failed.
    Task,
    /// Any other kind, as received.
    Other(String),
}

impl ErrorKind {
    /// Wire name of the kind.
    #[must_use]
    pub fn as_str(&self) -> &str {
        match self {
            Self::Timeout => "timeout",
            Self::Protocol => "protocol",
            Self::Io => "io",
            Self::UnknownTask => "unknown_task",
            Self::Task => "task",
            Self::Other(kind) => kind.as_str(),
        }
    }
}

impl From<String> for ErrorKind {
    fn from(kind: String) -> Self {
        match kind.as_str() {
            "timeout" => Self::Timeout,
            "protocol" => Self::Protocol,
            "io" => Self::Io,
            "unknown_task" => Self::UnknownTask,
            "task" => Self::Task,
            _ => Self::Other(kind),
        }
    }
}

impl From<ErrorKind> for String {
    fn from(kind: ErrorKind) -> Self {
        match kind {
            ErrorKind::Other(kind) => kind,
            known => known.as_str().to_string(),
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Structured error delivered in place of a result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct ResponseError {
    /// What went wrong.
    pub kind: ErrorKind,
    /// Human-readable description.
    pub message: String,
    /// Extra structured detail (request id, task, error codes, ...).
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub context: BTreeMap<String, Value>,
}

impl ResponseError {
    /// Create an error with no context.
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            context: BTreeMap::new(),
        }
    }

    /// Create a [`ErrorKind::Task`] error.
    pub fn task(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Task, message)
    }

    /// Error synthesized by the Tracker when a request times out.
    #[must_use]
    pub fn timeout(after: Duration) -> Self {
        let millis = u64::try_from(after.as_millis()).unwrap_or(u64::MAX);
        Self::new(ErrorKind::Timeout, format!("no response within {after:?}"))
            .with_context("timeout_ms", millis)
    }

    /// Attach a context entry.
    #[must_use]
    pub fn with_context(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }
}

// ─── Request ───────────────────────────────────────────────────────────────

/// A request for a provider to run a task.
///
/// The ID is generated at creation and cannot be changed afterwards.
#[derive(Clone, Serialize, Deserialize)]
pub struct Request {
    id: String,
    /// Capability name.
    pub task: String,
    /// Caller-defined payload.
    #[serde(default)]
    pub args: Value,
    /// Where the Response must be delivered (`unix://` or `http(s)://`).
    #[serde(rename = "responsehook")]
    pub response_hook: String,
    /// Optional out-of-band input stream.
    #[serde(rename = "streamurl", default, skip_serializing_if = "Option::is_none")]
    pub stream_url: Option<String>,
    #[serde(skip)]
    success_handler: Option<ResponseHandler>,
    #[serde(skip)]
    error_handler: Option<ResponseHandler>,
    #[serde(skip)]
    proxied: bool,
}

impl fmt::Debug for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Request")
            .field("id", &self.id)
            .field("task", &self.task)
            .field("response_hook", &self.response_hook)
            .field("stream_url", &self.stream_url)
            .field("proxied", &self.proxied)
            .finish_non_exhaustive()
    }
}

impl Request {
    /// Create a request with a freshly generated ID.
    pub fn new(task: impl Into<String>, args: Value, response_hook: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            task: task.into(),
            args,
            response_hook: response_hook.into(),
            stream_url: None,
            success_handler: None,
            error_handler: None,
            proxied: false,
        }
    }

    /// Correlation ID.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Attach an input stream URL.
    #[must_use]
    pub fn with_stream_url(mut self, url: impl Into<String>) -> Self {
        self.stream_url = Some(url.into());
        self
    }

    /// Handler invoked when a Response with a result arrives.
    #[must_use]
    pub fn on_success<F>(mut self, handler: F) -> Self
    where
        F: Fn(&Request, &Response) + Send + Sync + 'static,
    {
        self.success_handler = Some(Arc::new(handler));
        self
    }

    /// Handler invoked when a Response with an error arrives (including
    /// timeouts).
    #[must_use]
    pub fn on_error<F>(mut self, handler: F) -> Self
    where
        F: Fn(&Request, &Response) + Send + Sync + 'static,
    {
        self.error_handler = Some(Arc::new(handler));
        self
    }

    pub(crate) fn success_handler(&self) -> Option<&ResponseHandler> {
        self.success_handler.as_ref()
    }

    pub(crate) fn error_handler(&self) -> Option<&ResponseHandler> {
        self.error_handler.as_ref()
    }

    pub(crate) fn set_handlers(
        &mut self,
        success: Option<ResponseHandler>,
        error: Option<ResponseHandler>,
    ) {
        self.success_handler = success;
        self.error_handler = error;
    }

    /// Whether this request's Response is relayed to a remote hook instead
    /// of invoking a local handler.
    pub fn is_proxied(&self) -> bool {
        self.proxied
    }

    pub(crate) fn mark_proxied(&mut self) {
        self.proxied = true;
    }

    /// Copy of this request with the same ID, task, args and stream, but a
    /// different response hook and no handlers.
    pub(crate) fn derive_with_hook(&self, response_hook: impl Into<String>) -> Self {
        Self {
            id: self.id.clone(),
            task: self.task.clone(),
            args: self.args.clone(),
            response_hook: response_hook.into(),
            stream_url: self.stream_url.clone(),
            success_handler: None,
            error_handler: None,
            proxied: false,
        }
    }

    /// Invoke the handler matching the Response.
    ///
    /// Returns `false` when no handler is installed for that outcome.
    pub(crate) fn dispatch(&self, resp: &Response) -> bool {
        let handler = if resp.is_error() {
            self.error_handler.as_ref()
        } else {
            self.success_handler.as_ref()
        };
        match handler {
            Some(handler) => {
                handler(self, resp);
                true
            }
            None => false,
        }
    }

    /// Check the fields a receiver depends on.
    pub fn validate(&self) -> Result<()> {
        if self.id.is_empty() {
            return Err(AcommError::protocol("request has no id"));
        }
        if self.task.is_empty() {
            return Err(AcommError::protocol(format!("request {} has no task", self.id)));
        }
        Ok(())
    }
}

// ─── Response ──────────────────────────────────────────────────────────────

/// The eventual outcome of a Request.
///
/// Exactly one of `result` and `error` is set, except on an acknowledgement
/// (see [`Response::ack`]).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Response {
    /// ID of the originating Request.
    pub id: String,
    /// Task result.
    #[serde(
        default,
        deserialize_with = "deserialize_present",
        skip_serializing_if = "Option::is_none"
    )]
    pub result: Option<Value>,
    /// Task or correlation failure.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ResponseError>,
    /// Optional out-of-band output stream.
    #[serde(rename = "streamurl", default, skip_serializing_if = "Option::is_none")]
    pub stream_url: Option<String>,
}

/// A present `"result": null` is a result, not a missing field.
fn deserialize_present<'de, D>(deserializer: D) -> std::result::Result<Option<Value>, D::Error>
where
    D: Deserializer<'de>,
{
    Value::deserialize(deserializer).map(Some)
}

impl Response {
    /// Successful Response.
    pub fn success(id: impl Into<String>, result: Value) -> Self {
        Self {
            id: id.into(),
            result: Some(result),
            ..Self::default()
        }
    }

    /// Failed Response.
    pub fn failure(id: impl Into<String>, error: ResponseError) -> Self {
        Self {
            id: id.into(),
            error: Some(error),
            ..Self::default()
        }
    }

    /// Empty acknowledgement, the body of a 200 reply to a remote hook POST.
    #[must_use]
    pub fn ack() -> Self {
        Self::default()
    }

    /// Wrap a task handler's outcome.
    pub fn from_outcome(
        id: impl Into<String>,
        outcome: std::result::Result<TaskOutput, ResponseError>,
    ) -> Self {
        match outcome {
            Ok(output) => Self {
                id: id.into(),
                result: Some(output.result),
                error: None,
                stream_url: output.stream_url,
            },
            Err(error) => Self::failure(id, error),
        }
    }

    /// Attach an output stream URL.
    #[must_use]
    pub fn with_stream_url(mut self, url: impl Into<String>) -> Self {
        self.stream_url = Some(url.into());
        self
    }

    /// Whether this Response carries an error.
    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }

    /// Whether this is an empty acknowledgement.
    pub fn is_ack(&self) -> bool {
        self.id.is_empty() && self.result.is_none() && self.error.is_none()
    }

    /// Error kind, if this Response failed.
    pub fn error_kind(&self) -> Option<ErrorKind> {
        self.error.as_ref().map(|e| e.kind.clone())
    }

    /// Enforce the wire contract: non-empty ID, exactly one of
    /// result/error.
    pub fn validate(&self) -> Result<()> {
        if self.id.is_empty() {
            return Err(AcommError::protocol("response has no id"));
        }
        match (&self.result, &self.error) {
            (Some(_), Some(_)) => Err(AcommError::protocol(format!(
                "response {} has both result and error",
                self.id
            ))),
            (None, None) => Err(AcommError::protocol(format!(
                "response {} has neither result nor error",
                self.id
            ))),
            _ => Ok(()),
        }
    }
}

/// Successful outcome of a task handler.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskOutput {
    /// Result payload.
    pub result: Value,
    /// Optional stream carrying bulk output.
    pub stream_url: Option<String>,
}

impl TaskOutput {
    /// Output with a result and no stream.
    #[must_use]
    pub fn new(result: Value) -> Self {
        Self {
            result,
            stream_url: None,
        }
    }

    /// Attach a stream URL.
    #[must_use]
    pub fn with_stream_url(mut self, url: impl Into<String>) -> Self {
        self.stream_url = Some(url.into());
        self
    }
}
