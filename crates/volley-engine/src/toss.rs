//! Toss orchestration: one request/response round trip from state setup to
//! verdict.
//!
//! Steps, in order:
//! 1. run state handlers, then resolve `$S{..}` references
//! 2. register interactions
//! 3. dispatch with retry, then drop the request body
//! 4. inspect (log request and response)
//! 5. wait
//! 6. end this toss's log level override
//! 7. fetch observed interaction state
//! 8. remove interactions
//! 9. record and store captured data
//! 10. validate: transport error, interactions, response
//! 11. report and return
//!
//! Steps 6 to 8 run even when an earlier step failed or panicked.

use std::any::Any;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::FutureExt;
use serde_json::Value;
use tracing::level_filters::LevelFilter;

use volley_types::{
    HttpRequest, HttpResponse, Interaction, ResponseOutcome, Result, Store, Verdict, VolleyError,
};

use crate::capture::{capture, request_view, response_view, Capture, CaptureSource};
use crate::events::{EventEmitter, TossEvent, TossReport};
use crate::expect::{validate_interactions, Expectations, ValidationEngine};
use crate::handler::{HandlerRegistry, StateContext};
use crate::levels::{LogLevelControl, LogLevelOverrides};
use crate::registry::{InteractionLifecycle, InteractionRegistry};
use crate::retry::{dispatch_with_retry, RetryPolicy};
use crate::schema::{JsonSchemaValidator, SchemaValidator};
use crate::settings::EngineSettings;
use crate::snapshot::{FileSnapshotStore, SnapshotStore};
use crate::substitute;
use crate::transport::Transport;

// ---------------------------------------------------------------------------
// Toss description
// ---------------------------------------------------------------------------

/// Pause between dispatch and cleanup.
pub enum Wait {
    Delay(Duration),
    /// Resolves when whatever the toss waits on has happened.
    Pending(Pin<Box<dyn Future<Output = ()> + Send>>),
}

impl fmt::Debug for Wait {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Wait::Delay(d) => f.debug_tuple("Delay").field(d).finish(),
            Wait::Pending(_) => f.write_str("Pending(..)"),
        }
    }
}

/// A named state handler to run before interactions are registered.
#[derive(Debug, Clone)]
pub struct StateCall {
    pub name: String,
    pub data: Option<Value>,
}

/// Everything one toss does.
#[derive(Debug)]
pub struct TossSpec {
    pub name: Option<String>,
    pub request: HttpRequest,
    pub retry: Option<RetryPolicy>,
    pub interactions: Vec<Interaction>,
    pub expectations: Expectations,
    pub states: Vec<StateCall>,
    pub wait: Option<Wait>,
    pub inspect: bool,
    /// Log level in force from dispatch until cleanup.
    pub log_level: Option<LevelFilter>,
    pub records: Vec<Capture>,
    pub stores: Vec<Capture>,
    pub returns: Option<CaptureSource>,
}

impl TossSpec {
    /// A toss of `request` with no retry, interactions or expectations.
    pub fn new(request: HttpRequest) -> Self {
        Self {
            name: None,
            request,
            retry: None,
            interactions: Vec::new(),
            expectations: Expectations::default(),
            states: Vec::new(),
            wait: None,
            inspect: false,
            log_level: None,
            records: Vec::new(),
            stores: Vec::new(),
            returns: None,
        }
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Re-dispatch under `policy`. Without one the first outcome is final.
    pub fn with_retry(mut self, policy: RetryPolicy) -> Self {
        self.retry = Some(policy);
        self
    }

    /// Register `interaction` for the duration of the toss.
    pub fn use_interaction(mut self, interaction: Interaction) -> Self {
        self.interactions.push(interaction);
        self
    }

    pub fn with_expectations(mut self, expectations: Expectations) -> Self {
        self.expectations = expectations;
        self
    }

    /// Run state handler `name` before registration. Calls run in order.
    pub fn with_state(mut self, name: impl Into<String>, data: Option<Value>) -> Self {
        self.states.push(StateCall {
            name: name.into(),
            data,
        });
        self
    }

    /// Sleep after dispatch, before cleanup.
    pub fn wait_for(mut self, delay: Duration) -> Self {
        self.wait = Some(Wait::Delay(delay));
        self
    }

    /// Await `until` after dispatch, before cleanup.
    pub fn wait_on(mut self, until: impl Future<Output = ()> + Send + 'static) -> Self {
        self.wait = Some(Wait::Pending(Box::pin(until)));
        self
    }

    /// Log the request and final response.
    pub fn inspect(mut self) -> Self {
        self.inspect = true;
        self
    }

    /// Force `level` while this toss runs. Needs [`Tosser::with_log_control`].
    pub fn with_log_level(mut self, level: LevelFilter) -> Self {
        self.log_level = Some(level);
        self
    }

    /// Capture a value into the report under `name`.
    pub fn records(mut self, name: impl Into<String>, source: CaptureSource) -> Self {
        self.records.push(Capture::new(name, source));
        self
    }

    /// Capture a value into the shared store under `name`.
    pub fn stores(mut self, name: impl Into<String>, source: CaptureSource) -> Self {
        self.stores.push(Capture::new(name, source));
        self
    }

    /// Capture the value handed back in [`TossOutput::value`].
    pub fn returns(mut self, source: CaptureSource) -> Self {
        self.returns = Some(source);
        self
    }
}

/// A passed toss.
#[derive(Debug, Clone)]
pub struct TossOutput {
    pub report: TossReport,
    /// Value extracted by the toss's `returns` source.
    pub value: Option<Value>,
    pub response: HttpResponse,
    pub interactions: Vec<Interaction>,
}

// ---------------------------------------------------------------------------
// Tosser
// ---------------------------------------------------------------------------

/// Runs tosses. One `Tosser` may run many tosses concurrently; they share
/// its store, handlers and collaborators.
pub struct Tosser {
    transport: Arc<dyn Transport>,
    registry: Arc<dyn InteractionRegistry>,
    handlers: HandlerRegistry,
    schema: Arc<dyn SchemaValidator>,
    snapshots: Arc<dyn SnapshotStore>,
    store: Store,
    events: EventEmitter,
    settings: EngineSettings,
    log_levels: Option<Arc<LogLevelOverrides>>,
}

/// Mutable per-toss state threaded through the steps.
struct TossState {
    request: HttpRequest,
    interactions: Vec<Interaction>,
    outcome: Option<ResponseOutcome>,
    attempts: usize,
    recorded: BTreeMap<String, Value>,
}

/// The parts of a [`TossSpec`] consumed by the steps.
struct TossPlan {
    retry: Option<RetryPolicy>,
    expectations: Expectations,
    states: Vec<StateCall>,
    wait: Option<Wait>,
    inspect: bool,
    log_level: Option<LevelFilter>,
    records: Vec<Capture>,
    stores: Vec<Capture>,
}

impl Tosser {
    pub fn new(transport: Arc<dyn Transport>, registry: Arc<dyn InteractionRegistry>) -> Self {
        let settings = EngineSettings::default();
        Self {
            transport,
            registry,
            handlers: HandlerRegistry::default(),
            schema: Arc::new(JsonSchemaValidator),
            snapshots: Arc::new(FileSnapshotStore::new(&settings.snapshot_dir)),
            store: Store::new(),
            events: EventEmitter::default(),
            settings,
            log_levels: None,
        }
    }

    pub fn with_handlers(mut self, handlers: HandlerRegistry) -> Self {
        self.handlers = handlers;
        self
    }

    pub fn with_schema_validator(mut self, schema: Arc<dyn SchemaValidator>) -> Self {
        self.schema = schema;
        self
    }

    pub fn with_snapshot_store(mut self, snapshots: Arc<dyn SnapshotStore>) -> Self {
        self.snapshots = snapshots;
        self
    }

    pub fn with_store(mut self, store: Store) -> Self {
        self.store = store;
        self
    }

    pub fn with_events(mut self, events: EventEmitter) -> Self {
        self.events = events;
        self
    }

    /// Replace the settings. The snapshot store is left as is.
    pub fn with_settings(mut self, settings: EngineSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Let tosses override the log level through `control`. Overrides of
    /// concurrent tosses on this `Tosser` stack; the baseline returns when the
    /// last one ends.
    pub fn with_log_control(mut self, control: Arc<dyn LogLevelControl>) -> Self {
        self.log_levels = Some(Arc::new(LogLevelOverrides::new(control)));
        self
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn events(&self) -> &EventEmitter {
        &self.events
    }

    pub fn handlers(&self) -> &HandlerRegistry {
        &self.handlers
    }

    /// Run one toss to its verdict.
    ///
    /// `Ok` means the toss passed. Otherwise the error's
    /// [`verdict`](VolleyError::verdict) tells a failed expectation from an
    /// exchange that never produced a response.
    pub async fn execute(&self, spec: TossSpec) -> Result<TossOutput> {
        let started_at = chrono::Utc::now();
        let clock = Instant::now();

        let TossSpec {
            name,
            mut request,
            retry,
            interactions,
            mut expectations,
            states,
            wait,
            inspect,
            log_level,
            records,
            stores,
            returns,
        } = spec;

        let label = name
            .clone()
            .unwrap_or_else(|| format!("{} {}", request.method, request.url));
        if expectations.name.is_none() {
            expectations.name = name;
        }
        if self.settings.update_snapshots {
            expectations.update_snapshot = true;
        }
        if request.timeout.is_none() {
            request.timeout = Some(Duration::from_millis(self.settings.request_timeout_ms));
        }

        tracing::info!(toss = %label, method = %request.method, url = %request.url, "Toss started");
        self.events.emit(TossEvent::TossStarted {
            name: label.clone(),
            method: request.method.clone(),
            url: request.url.clone(),
        });

        let mut state = TossState {
            request,
            interactions,
            outcome: None,
            attempts: 0,
            recorded: BTreeMap::new(),
        };
        let plan = TossPlan {
            retry,
            expectations,
            states,
            wait,
            inspect,
            log_level,
            records,
            stores,
        };
        let result = self.run(&label, plan, &mut state).await;

        let (verdict, failure) = match &result {
            Ok(()) => (Verdict::Passed, None),
            Err(e) => (e.verdict(), Some(e.to_string())),
        };
        let report = TossReport {
            name: label.clone(),
            verdict,
            failure,
            method: state.request.method.clone(),
            url: state.request.url.clone(),
            status: state.outcome.as_ref().and_then(ResponseOutcome::status),
            response_time_ms: state.outcome.as_ref().map(ResponseOutcome::response_time_ms),
            attempts: state.attempts,
            interactions: state.interactions.clone(),
            recorded: state.recorded.clone(),
            started_at: started_at.to_rfc3339(),
            duration_ms: clock.elapsed().as_millis() as u64,
        };

        match &report.failure {
            None => tracing::info!(toss = %label, verdict = %verdict, "Toss finished"),
            Some(failure) => {
                tracing::warn!(toss = %label, verdict = %verdict, failure = %failure, "Toss finished")
            }
        }
        if self.settings.auto_report {
            self.events.emit(TossEvent::TossCompleted {
                report: report.clone(),
            });
        }

        if let Err(err) = result {
            if verdict == Verdict::Failed && state.outcome.is_some() {
                print_exchange("Request & Response", &state.request, state.outcome.as_ref());
            }
            return Err(err);
        }

        let Some(ResponseOutcome::Received(response)) = state.outcome else {
            return Err(VolleyError::Other(format!(
                "toss '{label}' passed without a response"
            )));
        };
        let value = match &returns {
            Some(source) => {
                let snapshot = self.store.snapshot().await;
                capture(source, &state.request, &response, &self.handlers, &snapshot)?
            }
            None => None,
        };

        Ok(TossOutput {
            report,
            value,
            response,
            interactions: state.interactions,
        })
    }

    async fn run(&self, label: &str, plan: TossPlan, state: &mut TossState) -> Result<()> {
        let TossPlan {
            retry,
            mut expectations,
            states,
            wait,
            inspect,
            log_level,
            records,
            stores,
        } = plan;

        let level_guard = match (&self.log_levels, log_level) {
            (Some(levels), Some(level)) => Some(levels.push(level)),
            _ => None,
        };
        let mut lifecycle = InteractionLifecycle::new(self.registry.clone());

        let exchange = AssertUnwindSafe(self.exchange(
            label,
            &states,
            &mut lifecycle,
            retry.as_ref(),
            inspect,
            wait,
            state,
        ))
        .catch_unwind()
        .await
        .unwrap_or_else(|panic| {
            let message = panic_message(panic.as_ref());
            tracing::error!(toss = %label, panic = %message, "Toss panicked, cleaning up");
            Err(VolleyError::Other(format!("Toss '{label}' panicked: {message}")))
        });

        // Cleanup runs whether or not the exchange succeeded.
        drop(level_guard);
        let fetched = lifecycle.fetch_observed(&mut state.interactions).await;
        let ids = lifecycle.ids().to_vec();
        let removed = lifecycle.remove_all().await;
        if removed.is_ok() && !ids.is_empty() {
            self.events.emit(TossEvent::InteractionsRemoved {
                name: label.to_string(),
                ids,
            });
        }
        exchange?;
        fetched?;
        removed?;

        let Some(outcome) = state.outcome.as_ref() else {
            return Err(VolleyError::Other("no request was dispatched".into()));
        };

        if let ResponseOutcome::Received(response) = outcome {
            self.capture_data(&records, &stores, &state.request, response, &mut state.recorded)
                .await?;
        }

        let response = match outcome {
            ResponseOutcome::Received(response) => response,
            ResponseOutcome::TransportError { error, .. } => {
                return Err(VolleyError::Transport(error.clone()));
            }
        };
        validate_interactions(&state.interactions)?;
        substitute::apply_to_expectations(&mut expectations, &self.store.snapshot().await);
        ValidationEngine {
            handlers: &self.handlers,
            schema: self.schema.as_ref(),
            snapshots: self.snapshots.as_ref(),
            strict_expect_handlers: self.settings.strict_expect_handlers,
        }
        .validate(&expectations, &state.request, response)
        .await
    }

    /// Steps 1 to 5.
    #[allow(clippy::too_many_arguments)]
    async fn exchange(
        &self,
        label: &str,
        states: &[StateCall],
        lifecycle: &mut InteractionLifecycle,
        retry: Option<&RetryPolicy>,
        inspect: bool,
        wait: Option<Wait>,
        state: &mut TossState,
    ) -> Result<()> {
        for call in states {
            let handler = self.handlers.state_handler(&call.name)?;
            handler
                .apply(&StateContext {
                    data: call.data.as_ref(),
                    store: &self.store,
                })
                .await?;
            self.events.emit(TossEvent::StateApplied {
                name: label.to_string(),
                handler: call.name.clone(),
            });
        }

        let values = self.store.snapshot().await;
        substitute::apply_to_request(&mut state.request, &values);
        for interaction in &mut state.interactions {
            substitute::apply_to_interaction(interaction, &values);
        }

        lifecycle.register_all(&mut state.interactions).await?;
        if !lifecycle.ids().is_empty() {
            self.events.emit(TossEvent::InteractionsRegistered {
                name: label.to_string(),
                ids: lifecycle.ids().to_vec(),
            });
        }

        let run = dispatch_with_retry(
            self.transport.as_ref(),
            &state.request,
            retry,
            &self.handlers,
            Some(&self.events),
        )
        .await?;
        state.request.body = None;
        state.attempts = run.attempts;
        state.outcome = Some(run.outcome);

        if inspect {
            print_exchange("Inspect", &state.request, state.outcome.as_ref());
        }

        match wait {
            Some(Wait::Delay(delay)) => tokio::time::sleep(delay).await,
            Some(Wait::Pending(until)) => until.await,
            None => {}
        }
        Ok(())
    }

    /// Default recorders, then the toss's recorders, then its stores.
    async fn capture_data(
        &self,
        records: &[Capture],
        stores: &[Capture],
        request: &HttpRequest,
        response: &HttpResponse,
        recorded: &mut BTreeMap<String, Value>,
    ) -> Result<()> {
        let snapshot = self.store.snapshot().await;
        for recorder in self.settings.default_recorders.iter().chain(records) {
            if let Some(value) = capture(&recorder.source, request, response, &self.handlers, &snapshot)? {
                recorded.insert(recorder.name.clone(), value);
            }
        }

        let mut updates = HashMap::new();
        for store in stores {
            if let Some(value) = capture(&store.source, request, response, &self.handlers, &snapshot)? {
                updates.insert(store.name.clone(), value);
            }
        }
        if !updates.is_empty() {
            tracing::debug!(keys = ?updates.keys().collect::<Vec<_>>(), "Storing captured values");
            self.store.apply_updates(updates).await;
        }
        Ok(())
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    panic
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string())
}

fn print_exchange(title: &str, request: &HttpRequest, outcome: Option<&ResponseOutcome>) {
    let response = match outcome {
        Some(ResponseOutcome::Received(r)) => response_view(r),
        Some(ResponseOutcome::TransportError { error, .. }) => {
            serde_json::json!({ "error": error.message, "kind": error.kind })
        }
        None => Value::Null,
    };
    tracing::warn!(
        request = %serde_json::to_string_pretty(&request_view(request)).unwrap_or_default(),
        response = %serde_json::to_string_pretty(&response).unwrap_or_default(),
        "{title}"
    );
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
