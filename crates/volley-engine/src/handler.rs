//! Handler capability table: named retry, expect, capture and state handlers.
//!
//! Tosses refer to handlers either by name (resolved here) or inline. A name
//! that is not registered fails with [`VolleyError::UnknownHandler`] instead
//! of being silently ignored.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use volley_types::{
    HandlerKind, HttpRequest, HttpResponse, ResponseOutcome, Result, Store, VolleyError,
};

// ---------------------------------------------------------------------------
// Handler contexts
// ---------------------------------------------------------------------------

/// Input to a retry strategy: the request and the latest outcome.
pub struct RetryContext<'a> {
    pub request: &'a HttpRequest,
    pub outcome: &'a ResponseOutcome,
}

/// Input to a custom expect handler.
pub struct ExpectContext<'a> {
    pub request: &'a HttpRequest,
    pub response: &'a HttpResponse,
    pub data: Option<&'a Value>,
}

/// Input to a capture handler. `store` is a point-in-time view.
pub struct CaptureContext<'a> {
    pub request: &'a HttpRequest,
    pub response: &'a HttpResponse,
    pub store: &'a HashMap<String, Value>,
}

/// Input to a state handler run before interactions are registered.
pub struct StateContext<'a> {
    pub data: Option<&'a Value>,
    pub store: &'a Store,
}

// ---------------------------------------------------------------------------
// Handler signatures
// ---------------------------------------------------------------------------

/// Retry strategy. Returning `true` stops retrying; `false` schedules another
/// dispatch after the configured delay.
pub type RetryFn = Arc<dyn Fn(&RetryContext<'_>) -> bool + Send + Sync>;

/// Capture handler producing a value to record, store or return.
pub type CaptureFn = Arc<dyn Fn(&CaptureContext<'_>) -> Option<Value> + Send + Sync>;

#[async_trait]
pub trait ExpectHandler: Send + Sync {
    /// `Err` fails the toss. The returned flag only matters when strict
    /// handler results are enabled.
    async fn check(&self, ctx: &ExpectContext<'_>) -> Result<bool>;
}

#[async_trait]
impl<F> ExpectHandler for F
where
    F: Fn(&ExpectContext<'_>) -> Result<bool> + Send + Sync,
{
    async fn check(&self, ctx: &ExpectContext<'_>) -> Result<bool> {
        (self)(ctx)
    }
}

#[async_trait]
pub trait StateHandler: Send + Sync {
    async fn apply(&self, ctx: &StateContext<'_>) -> Result<()>;
}

// ---------------------------------------------------------------------------
// HandlerRegistry
// ---------------------------------------------------------------------------

#[derive(Clone, Default)]
pub struct HandlerRegistry {
    retry: HashMap<String, RetryFn>,
    expect: HashMap<String, Arc<dyn ExpectHandler>>,
    capture: HashMap<String, CaptureFn>,
    state: HashMap<String, Arc<dyn StateHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_retry_handler(
        &mut self,
        name: impl Into<String>,
        handler: impl Fn(&RetryContext<'_>) -> bool + Send + Sync + 'static,
    ) {
        self.retry.insert(name.into(), Arc::new(handler));
    }

    pub fn add_expect_handler(&mut self, name: impl Into<String>, handler: impl ExpectHandler + 'static) {
        self.expect.insert(name.into(), Arc::new(handler));
    }

    pub fn add_capture_handler(
        &mut self,
        name: impl Into<String>,
        handler: impl Fn(&CaptureContext<'_>) -> Option<Value> + Send + Sync + 'static,
    ) {
        self.capture.insert(name.into(), Arc::new(handler));
    }

    pub fn add_state_handler(&mut self, name: impl Into<String>, handler: impl StateHandler + 'static) {
        self.state.insert(name.into(), Arc::new(handler));
    }

    pub fn retry_handler(&self, name: &str) -> Result<RetryFn> {
        self.retry
            .get(name)
            .cloned()
            .ok_or_else(|| unknown(HandlerKind::Retry, name))
    }

    pub fn expect_handler(&self, name: &str) -> Result<Arc<dyn ExpectHandler>> {
        self.expect
            .get(name)
            .cloned()
            .ok_or_else(|| unknown(HandlerKind::Expect, name))
    }

    pub fn capture_handler(&self, name: &str) -> Result<CaptureFn> {
        self.capture
            .get(name)
            .cloned()
            .ok_or_else(|| unknown(HandlerKind::Capture, name))
    }

    pub fn state_handler(&self, name: &str) -> Result<Arc<dyn StateHandler>> {
        self.state
            .get(name)
            .cloned()
            .ok_or_else(|| unknown(HandlerKind::State, name))
    }

    pub fn has(&self, kind: HandlerKind, name: &str) -> bool {
        match kind {
            HandlerKind::Retry => self.retry.contains_key(name),
            HandlerKind::Expect => self.expect.contains_key(name),
            HandlerKind::Capture => self.capture.contains_key(name),
            HandlerKind::State => self.state.contains_key(name),
        }
    }
}

impl fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("retry", &sorted_names(self.retry.keys()))
            .field("expect", &sorted_names(self.expect.keys()))
            .field("capture", &sorted_names(self.capture.keys()))
            .field("state", &sorted_names(self.state.keys()))
            .finish()
    }
}

fn sorted_names<'a>(keys: impl Iterator<Item = &'a String>) -> Vec<&'a str> {
    let mut names: Vec<&str> = keys.map(String::as_str).collect();
    names.sort_unstable();
    names
}

fn unknown(kind: HandlerKind, name: &str) -> VolleyError {
    VolleyError::UnknownHandler {
        kind,
        name: name.to_string(),
    }
}

// ---------------------------------------------------------------------------
// Built-in handlers
// ---------------------------------------------------------------------------

/// Retry strategy that stops once a response with a 2xx status arrives.
pub const STATUS_2XX: &str = "status-2xx";

/// Capture handler returning the full response body.
pub const RESPONSE_BODY: &str = "response-body";

/// Registry pre-populated with the built-in handlers.
pub fn builtin_registry() -> HandlerRegistry {
    let mut registry = HandlerRegistry::new();
    registry.add_retry_handler(STATUS_2XX, |ctx| {
        ctx.outcome
            .status()
            .is_some_and(|status| (200..300).contains(&status))
    });
    registry.add_capture_handler(RESPONSE_BODY, |ctx| ctx.response.json.clone());
    registry
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct SeedUser {
        calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl StateHandler for SeedUser {
        async fn apply(&self, ctx: &StateContext<'_>) -> Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let id = ctx.data.cloned().unwrap_or(json!(1));
            ctx.store.set("userId", id).await;
            Ok(())
        }
    }

    #[test]
    fn unknown_names_fail_with_kind() {
        let registry = HandlerRegistry::new();
        let err = registry.retry_handler("till-ok").err().unwrap();
        assert_eq!(err.to_string(), "Unknown retry handler 'till-ok'");
        assert!(matches!(
            registry.capture_handler("token").err().unwrap(),
            VolleyError::UnknownHandler {
                kind: HandlerKind::Capture,
                ..
            }
        ));
    }

    #[test]
    fn builtin_retry_stops_on_success_status() {
        let registry = builtin_registry();
        assert!(registry.has(HandlerKind::Retry, STATUS_2XX));
        let strategy = registry.retry_handler(STATUS_2XX).unwrap();
        let request = HttpRequest::get("http://localhost/");

        let ok = ResponseOutcome::Received(HttpResponse::json(204, &json!(null)));
        let busy = ResponseOutcome::Received(HttpResponse::json(503, &json!(null)));
        assert!(strategy(&RetryContext { request: &request, outcome: &ok }));
        assert!(!strategy(&RetryContext { request: &request, outcome: &busy }));
    }

    #[tokio::test]
    async fn closures_act_as_expect_handlers() {
        let mut registry = HandlerRegistry::new();
        registry.add_expect_handler("has-id", |ctx: &ExpectContext<'_>| -> Result<bool> {
            Ok(ctx.response.json.as_ref().and_then(|b| b.get("id")).is_some())
        });

        let request = HttpRequest::get("http://localhost/");
        let response = HttpResponse::json(200, &json!({"id": 3}));
        let handler = registry.expect_handler("has-id").unwrap();
        let passed = handler
            .check(&ExpectContext {
                request: &request,
                response: &response,
                data: None,
            })
            .await
            .unwrap();
        assert!(passed);
    }

    #[tokio::test]
    async fn state_handler_writes_to_store() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut registry = HandlerRegistry::new();
        registry.add_state_handler("seed user", SeedUser { calls: calls.clone() });

        let store = Store::new();
        let data = json!(42);
        registry
            .state_handler("seed user")
            .unwrap()
            .apply(&StateContext {
                data: Some(&data),
                store: &store,
            })
            .await
            .unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(store.get("userId").await, Some(json!(42)));
    }

    #[test]
    fn clones_share_registered_handlers() {
        let mut registry = builtin_registry();
        registry.add_capture_handler("token", |_| Some(json!("t")));
        let copy = registry.clone();
        assert!(copy.has(HandlerKind::Capture, "token"));
        assert!(copy.has(HandlerKind::Capture, RESPONSE_BODY));
        assert!(!copy.has(HandlerKind::State, "token"));
    }
}
