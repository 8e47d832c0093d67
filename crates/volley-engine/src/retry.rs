//! Retry evaluation for a single toss dispatch.
//!
//! The strategy is consulted after every dispatch. `true` means "stop" and
//! `false` means "retry after `delay`". At most `count` retries happen, so a
//! toss dispatches at most `count + 1` times. A transport error is final and
//! is never retried.

use std::fmt;
use std::time::Duration;

use volley_types::{HttpRequest, ResponseOutcome, Result};

use crate::events::{EventEmitter, TossEvent};
use crate::handler::{HandlerRegistry, RetryContext, RetryFn};
use crate::transport::{dispatch_timed, Transport};

/// Retry strategy, referenced by registered name or given inline.
#[derive(Clone)]
pub enum RetryStrategy {
    Named(String),
    Inline(RetryFn),
}

impl RetryStrategy {
    pub fn named(name: impl Into<String>) -> Self {
        RetryStrategy::Named(name.into())
    }

    pub fn inline(f: impl Fn(&RetryContext<'_>) -> bool + Send + Sync + 'static) -> Self {
        RetryStrategy::Inline(std::sync::Arc::new(f))
    }

    /// The callable behind this strategy. Unknown names are an error.
    pub fn resolve(&self, handlers: &HandlerRegistry) -> Result<RetryFn> {
        match self {
            RetryStrategy::Named(name) => handlers.retry_handler(name),
            RetryStrategy::Inline(f) => Ok(f.clone()),
        }
    }
}

impl fmt::Debug for RetryStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RetryStrategy::Named(name) => f.debug_tuple("Named").field(name).finish(),
            RetryStrategy::Inline(_) => f.write_str("Inline(..)"),
        }
    }
}

/// How often, and on what condition, a toss re-dispatches.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Retries after the first dispatch.
    pub count: usize,
    /// Pause before each retry.
    pub delay: Duration,
    /// With no strategy the first outcome is final.
    pub strategy: Option<RetryStrategy>,
}

impl RetryPolicy {
    pub fn new(strategy: RetryStrategy) -> Self {
        Self {
            strategy: Some(strategy),
            ..Self::default()
        }
    }

    pub fn with_count(mut self, count: usize) -> Self {
        self.count = count;
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            count: 3,
            delay: Duration::from_millis(3),
            strategy: None,
        }
    }
}

/// Final outcome of a dispatch loop.
#[derive(Debug, Clone)]
pub struct RetryRun {
    pub outcome: ResponseOutcome,
    pub attempts: usize,
}

/// Dispatch `request`, re-dispatching while the policy's strategy asks for it.
///
/// A named strategy is resolved before the first dispatch, so an unknown name
/// fails without any network call.
pub async fn dispatch_with_retry(
    transport: &dyn Transport,
    request: &HttpRequest,
    policy: Option<&RetryPolicy>,
    handlers: &HandlerRegistry,
    events: Option<&EventEmitter>,
) -> Result<RetryRun> {
    let strategy = match policy.and_then(|p| p.strategy.as_ref()) {
        Some(s) => Some(s.resolve(handlers)?),
        None => None,
    };

    let mut attempts = 1;
    let mut outcome = dispatch_timed(transport, request).await;
    notify_dispatched(events, request, attempts, &outcome);

    if let (Some(policy), Some(strategy)) = (policy, strategy) {
        for _ in 0..policy.count {
            if outcome.error().is_some() {
                break;
            }
            let stop = strategy(&RetryContext {
                request,
                outcome: &outcome,
            });
            if stop {
                break;
            }

            let delay_ms = policy.delay.as_millis() as u64;
            tracing::info!(url = %request.url, attempt = attempts + 1, delay_ms, "Retrying");
            if let Some(events) = events {
                events.emit(TossEvent::RetryScheduled {
                    url: request.url.clone(),
                    attempt: attempts + 1,
                    delay_ms,
                });
            }
            tokio::time::sleep(policy.delay).await;

            attempts += 1;
            outcome = dispatch_timed(transport, request).await;
            notify_dispatched(events, request, attempts, &outcome);
        }
    }

    Ok(RetryRun { outcome, attempts })
}

fn notify_dispatched(
    events: Option<&EventEmitter>,
    request: &HttpRequest,
    attempt: usize,
    outcome: &ResponseOutcome,
) {
    if let Some(events) = events {
        events.emit(TossEvent::RequestDispatched {
            url: request.url.clone(),
            attempt,
            status: outcome.status(),
            response_time_ms: outcome.response_time_ms(),
        });
    }
}
