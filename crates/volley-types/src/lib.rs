//! Shared types, errors, store, and verdicts for the Volley toss engine.
//!
//! This crate provides the foundational types used across the other Volley crates:
//! - `VolleyError`: unified error taxonomy
//! - `Store`: injected key-value store for captured values
//! - `HttpRequest` / `ResponseOutcome`: the exchange as seen by the engine
//! - `Interaction`: an ephemeral stub held by the interaction registry
//! - `Verdict`: terminal status of one toss

pub mod duration_serde;

use std::borrow::Cow;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Kind of named handler looked up in the capability table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HandlerKind {
    Retry,
    Expect,
    Capture,
    State,
}

impl fmt::Display for HandlerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            HandlerKind::Retry => "retry",
            HandlerKind::Expect => "expect",
            HandlerKind::Capture => "capture",
            HandlerKind::State => "state",
        };
        f.write_str(s)
    }
}

/// Unified error type for all Volley subsystems.
#[derive(Debug, thiserror::Error)]
pub enum VolleyError {
    // === Exchange Errors ===
    #[error("{0}")]
    Transport(#[from] TransportError),

    #[error("{0}")]
    Assertion(String),

    // === Collaborator Errors ===
    #[error("Unknown {kind} handler '{name}'")]
    UnknownHandler { kind: HandlerKind, name: String },

    #[error("Handler '{name}' failed: {message}")]
    Handler { name: String, message: String },

    #[error("Interaction registry {operation} failed: {message}")]
    Registry { operation: String, message: String },

    #[error("Invalid path '{path}': {message}")]
    InvalidPath { path: String, message: String },

    #[error("Invalid JSON schema: {0}")]
    Schema(String),

    #[error("Snapshot '{name}' error: {message}")]
    Snapshot { name: String, message: String },

    #[error("Configuration error: {0}")]
    Config(String),

    // === Generic ===
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("{0}")]
    Other(String),
}

impl VolleyError {
    /// Shorthand for a failed expectation.
    pub fn assertion(message: impl Into<String>) -> Self {
        VolleyError::Assertion(message.into())
    }

    /// Returns `true` when the dispatch never produced a well-formed response.
    pub fn is_transport(&self) -> bool {
        matches!(self, VolleyError::Transport(_))
    }

    /// Returns `true` when an expectation was violated.
    pub fn is_assertion(&self) -> bool {
        matches!(self, VolleyError::Assertion(_))
    }

    /// The verdict a toss ends with when it fails with this error.
    pub fn verdict(&self) -> Verdict {
        if self.is_transport() {
            Verdict::Error
        } else {
            Verdict::Failed
        }
    }
}

/// A convenience alias for `Result<T, VolleyError>`.
pub type Result<T> = std::result::Result<T, VolleyError>;

// ---------------------------------------------------------------------------
// Verdict
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Verdict {
    Passed,
    Failed,
    Error,
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Verdict::Passed => "PASSED",
            Verdict::Failed => "FAILED",
            Verdict::Error => "ERROR",
        };
        f.write_str(s)
    }
}

// ---------------------------------------------------------------------------
// Store: injected key-value store for captured values
// ---------------------------------------------------------------------------

/// Thread-safe key-value store for values captured by tosses.
///
/// Cloning a `Store` yields another handle to the **same** inner state, so a
/// store handed to several concurrent tosses is shared between them. Values
/// live as long as some handle does; nothing is evicted.
#[derive(Clone, Default)]
pub struct Store {
    inner: Arc<tokio::sync::RwLock<HashMap<String, Value>>>,
}

impl Store {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or overwrite a key.
    pub async fn set(&self, key: impl Into<String>, value: Value) {
        self.inner.write().await.insert(key.into(), value);
    }

    /// Read a value by key (cloned).
    pub async fn get(&self, key: &str) -> Option<Value> {
        self.inner.read().await.get(key).cloned()
    }

    /// Shallow copy of the current values map.
    pub async fn snapshot(&self) -> HashMap<String, Value> {
        self.inner.read().await.clone()
    }

    /// Merge `updates` into the store. Existing keys not present in
    /// `updates` are preserved.
    pub async fn apply_updates(&self, updates: HashMap<String, Value>) {
        self.inner.write().await.extend(updates);
    }
}

// ---------------------------------------------------------------------------
// Headers: case-insensitive header map
// ---------------------------------------------------------------------------

/// Header map whose keys are compared case-insensitively (stored lowercase).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "BTreeMap<String, String>", into = "BTreeMap<String, String>")]
pub struct Headers(BTreeMap<String, String>);

impl Headers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a header, replacing any value stored under the same name.
    pub fn insert(&mut self, name: impl AsRef<str>, value: impl Into<String>) {
        self.0.insert(name.as_ref().to_ascii_lowercase(), value.into());
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.0.get(&name.to_ascii_lowercase()).map(String::as_str)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.0.contains_key(&name.to_ascii_lowercase())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<BTreeMap<String, String>> for Headers {
    fn from(map: BTreeMap<String, String>) -> Self {
        map.into_iter().collect()
    }
}

impl From<Headers> for BTreeMap<String, String> {
    fn from(headers: Headers) -> Self {
        headers.0
    }
}

impl<K: AsRef<str>, V: Into<String>> FromIterator<(K, V)> for Headers {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut headers = Headers::new();
        for (k, v) in iter {
            headers.insert(k, v);
        }
        headers
    }
}

// ---------------------------------------------------------------------------
// HttpRequest: what the transport is asked to send
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum RequestBody {
    Json(Value),
    Text(String),
    Bytes(Vec<u8>),
    Form(BTreeMap<String, String>),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HttpRequest {
    pub method: String,
    pub url: String,
    #[serde(default)]
    pub headers: Headers,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<RequestBody>,
    #[serde(default, skip_serializing_if = "Option::is_none", with = "duration_serde")]
    pub timeout: Option<Duration>,
}

impl HttpRequest {
    pub fn new(method: impl AsRef<str>, url: impl Into<String>) -> Self {
        Self {
            method: method.as_ref().to_ascii_uppercase(),
            url: url.into(),
            headers: Headers::new(),
            body: None,
            timeout: None,
        }
    }

    pub fn get(url: impl Into<String>) -> Self {
        Self::new("GET", url)
    }

    pub fn post(url: impl Into<String>) -> Self {
        Self::new("POST", url)
    }

    pub fn with_header(mut self, name: impl AsRef<str>, value: impl Into<String>) -> Self {
        self.headers.insert(name, value);
        self
    }

    pub fn with_json(mut self, body: Value) -> Self {
        self.body = Some(RequestBody::Json(body));
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

// ---------------------------------------------------------------------------
// Response outcome: a response or a transport-error marker
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HttpResponse {
    pub status: u16,
    #[serde(default)]
    pub headers: Headers,
    #[serde(default)]
    pub body: Vec<u8>,
    /// Best-effort parse of `body`; `None` when the body is not valid JSON.
    #[serde(default)]
    pub json: Option<Value>,
    #[serde(default)]
    pub response_time_ms: u64,
}

impl HttpResponse {
    /// Build a response, parsing the body as JSON when possible.
    pub fn new(status: u16, headers: Headers, body: impl Into<Vec<u8>>) -> Self {
        let body = body.into();
        let json = serde_json::from_slice(&body).ok();
        Self {
            status,
            headers,
            body,
            json,
            response_time_ms: 0,
        }
    }

    pub fn json(status: u16, value: &Value) -> Self {
        let mut headers = Headers::new();
        headers.insert("content-type", "application/json");
        Self::new(status, headers, value.to_string())
    }

    /// Body decoded as UTF-8, replacing invalid sequences.
    pub fn text(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.body)
    }

    /// The parsed JSON body, or `null` when the body is not JSON.
    pub fn json_or_null(&self) -> Value {
        self.json.clone().unwrap_or(Value::Null)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportErrorKind {
    Connect,
    Timeout,
    Request,
    Body,
    Other,
}

/// A dispatch that never produced a well-formed response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, thiserror::Error)]
#[error("{message}")]
pub struct TransportError {
    pub kind: TransportErrorKind,
    pub message: String,
}

impl TransportError {
    pub fn new(kind: TransportErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

/// Final result of dispatching a request: exactly one of a response or a
/// transport-error marker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseOutcome {
    Received(HttpResponse),
    TransportError {
        error: TransportError,
        response_time_ms: u64,
    },
}

impl ResponseOutcome {
    pub fn transport_error(error: TransportError) -> Self {
        ResponseOutcome::TransportError {
            error,
            response_time_ms: 0,
        }
    }

    pub fn response(&self) -> Option<&HttpResponse> {
        match self {
            ResponseOutcome::Received(r) => Some(r),
            ResponseOutcome::TransportError { .. } => None,
        }
    }

    pub fn error(&self) -> Option<&TransportError> {
        match self {
            ResponseOutcome::Received(_) => None,
            ResponseOutcome::TransportError { error, .. } => Some(error),
        }
    }

    pub fn status(&self) -> Option<u16> {
        self.response().map(|r| r.status)
    }

    pub fn response_time_ms(&self) -> u64 {
        match self {
            ResponseOutcome::Received(r) => r.response_time_ms,
            ResponseOutcome::TransportError {
                response_time_ms, ..
            } => *response_time_ms,
        }
    }

    pub fn set_response_time_ms(&mut self, ms: u64) {
        match self {
            ResponseOutcome::Received(r) => r.response_time_ms = ms,
            ResponseOutcome::TransportError {
                response_time_ms, ..
            } => *response_time_ms = ms,
        }
    }
}

// ---------------------------------------------------------------------------
// Interaction: an ephemeral stub held by the registry during one toss
// ---------------------------------------------------------------------------

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InteractionRequest {
    pub method: String,
    pub path: String,
    #[serde(default)]
    pub headers: Headers,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InteractionResponse {
    pub status: u16,
    #[serde(default)]
    pub headers: Headers,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<Value>,
}

/// What the toss checks about an interaction after cleanup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InteractionExpects {
    /// Defaults to `true`: a registered interaction must be hit unless it
    /// opts out with `false`.
    #[serde(default = "default_true")]
    pub exercised: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub call_count: Option<u32>,
}

impl Default for InteractionExpects {
    fn default() -> Self {
        Self {
            exercised: true,
            call_count: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Interaction {
    /// Identifier issued by the registry on registration.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub request: InteractionRequest,
    pub response: InteractionResponse,
    #[serde(default)]
    pub expects: InteractionExpects,
    /// Observed by the registry; `false` until fetched after dispatch.
    #[serde(default)]
    pub exercised: bool,
    #[serde(default)]
    pub call_count: u32,
}

impl Interaction {
    pub fn new(method: impl AsRef<str>, path: impl Into<String>, status: u16) -> Self {
        Self {
            id: None,
            request: InteractionRequest {
                method: method.as_ref().to_ascii_uppercase(),
                path: path.into(),
                headers: Headers::new(),
                body: None,
            },
            response: InteractionResponse {
                status,
                headers: Headers::new(),
                body: None,
            },
            expects: InteractionExpects::default(),
            exercised: false,
            call_count: 0,
        }
    }

    pub fn with_response_body(mut self, body: Value) -> Self {
        self.response.body = Some(body);
        self
    }

    pub fn expect_exercised(mut self, exercised: bool) -> Self {
        self.expects.exercised = exercised;
        self
    }

    pub fn expect_call_count(mut self, count: u32) -> Self {
        self.expects.call_count = Some(count);
        self
    }

    /// `"<METHOD> - <path>"`, as used in interaction failure messages.
    pub fn describe(&self) -> String {
        format!("{} - {}", self.request.method, self.request.path)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
