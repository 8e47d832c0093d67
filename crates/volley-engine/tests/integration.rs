//! End-to-end tests for the toss runner.
//!
//! Each test drives `Tosser::execute` with a stub transport that answers from
//! the in-memory interaction registry, the way a mock server would.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};

use volley_engine::handler::STATUS_2XX;
use volley_engine::{
    builtin_registry, like, CaptureSource, EngineSettings, Expectations, FileSnapshotStore,
    InMemoryRegistry, InteractionRegistry, MemorySnapshotStore, RetryPolicy, RetryStrategy,
    StateContext, StateHandler, TossEvent, TossReport, TossSpec, Tosser, Transport,
};
use volley_types::{
    HttpRequest, HttpResponse, Interaction, ResponseOutcome, Result, TransportError,
    TransportErrorKind, Verdict,
};

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn path_of(url: &str) -> &str {
    let rest = url.split_once("://").map_or(url, |(_, rest)| rest);
    rest.find('/').map_or("/", |i| &rest[i..])
}

/// Answers from registered interactions, 404 otherwise.
struct MockServer {
    registry: Arc<InMemoryRegistry>,
    calls: AtomicUsize,
}

impl MockServer {
    fn new(registry: Arc<InMemoryRegistry>) -> Self {
        Self {
            registry,
            calls: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl Transport for MockServer {
    async fn dispatch(&self, request: &HttpRequest) -> ResponseOutcome {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match self
            .registry
            .record_call(&request.method, path_of(&request.url))
            .await
        {
            Some(stub) => ResponseOutcome::Received(HttpResponse::json(
                stub.status,
                &stub.body.unwrap_or(Value::Null),
            )),
            None => ResponseOutcome::Received(HttpResponse::json(404, &json!({"error": "no stub"}))),
        }
    }
}

/// Replies with the given statuses in order, repeating the last one.
struct Statuses {
    statuses: Vec<u16>,
    calls: AtomicUsize,
}

impl Statuses {
    fn new(statuses: &[u16]) -> Self {
        Self {
            statuses: statuses.to_vec(),
            calls: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl Transport for Statuses {
    async fn dispatch(&self, _request: &HttpRequest) -> ResponseOutcome {
        let n = self.calls.fetch_add(1, Ordering::SeqCst);
        let status = self.statuses[n.min(self.statuses.len() - 1)];
        ResponseOutcome::Received(HttpResponse::json(status, &json!({"attempt": n + 1})))
    }
}

struct Fixed(Value);

#[async_trait]
impl Transport for Fixed {
    async fn dispatch(&self, _request: &HttpRequest) -> ResponseOutcome {
        ResponseOutcome::Received(HttpResponse::json(200, &self.0))
    }
}

struct Slow(Duration);

#[async_trait]
impl Transport for Slow {
    async fn dispatch(&self, _request: &HttpRequest) -> ResponseOutcome {
        tokio::time::sleep(self.0).await;
        ResponseOutcome::Received(HttpResponse::json(200, &json!({})))
    }
}

struct Refused;

#[async_trait]
impl Transport for Refused {
    async fn dispatch(&self, _request: &HttpRequest) -> ResponseOutcome {
        ResponseOutcome::transport_error(TransportError::new(
            TransportErrorKind::Connect,
            "connect ECONNREFUSED 127.0.0.1:9",
        ))
    }
}

/// Delegates to an in-memory registry and counts removals.
struct CountingRegistry {
    inner: Arc<InMemoryRegistry>,
    removals: AtomicUsize,
}

#[async_trait]
impl InteractionRegistry for CountingRegistry {
    async fn register(&self, interaction: &Interaction) -> Result<String> {
        self.inner.register(interaction).await
    }

    async fn fetch(&self, ids: &[String]) -> Result<Vec<Interaction>> {
        self.inner.fetch(ids).await
    }

    async fn remove(&self, ids: &[String]) -> Result<()> {
        self.removals.fetch_add(1, Ordering::SeqCst);
        self.inner.remove(ids).await
    }
}

fn tosser_with(transport: Arc<dyn Transport>, registry: Arc<dyn InteractionRegistry>) -> Tosser {
    Tosser::new(transport, registry)
        .with_handlers(builtin_registry())
        .with_snapshot_store(Arc::new(MemorySnapshotStore::new()))
}

fn completed_reports(rx: &mut tokio::sync::broadcast::Receiver<TossEvent>) -> Vec<TossReport> {
    let mut reports = Vec::new();
    while let Ok(event) = rx.try_recv() {
        if let TossEvent::TossCompleted { report } = event {
            reports.push(report);
        }
    }
    reports
}

// ---------------------------------------------------------------------------
// Test 1: Interaction is served, observed, removed, and the toss passes
// ---------------------------------------------------------------------------

#[tokio::test]
async fn exercised_interaction_passes_and_is_removed() {
    let registry = Arc::new(InMemoryRegistry::new());
    let tosser = tosser_with(Arc::new(MockServer::new(registry.clone())), registry.clone());

    let spec = TossSpec::new(HttpRequest::get("http://orders.local/api/orders/1"))
        .named("get order")
        .use_interaction(
            Interaction::new("GET", "/api/orders/1", 200)
                .with_response_body(json!({"id": 1, "status": "open", "items": [{"sku": "A1"}]})),
        )
        .with_expectations(
            Expectations::new()
                .expect_status(200)
                .expect_json_like(json!({"id": 1, "items": [{"sku": "A1"}]})),
        );

    let output = tosser.execute(spec).await.expect("toss should pass");
    assert_eq!(output.report.verdict, Verdict::Passed);
    assert_eq!(output.interactions.len(), 1);
    assert!(output.interactions[0].exercised);
    assert_eq!(output.interactions[0].call_count, 1);
    assert!(registry.is_empty().await, "interactions must be removed");
}

// ---------------------------------------------------------------------------
// Test 2: Retry never dispatches more than count + 1 times
// ---------------------------------------------------------------------------

#[tokio::test]
async fn retry_is_bounded_by_count_plus_one() {
    let transport = Arc::new(Statuses::new(&[503]));
    let tosser = tosser_with(transport.clone(), Arc::new(InMemoryRegistry::new()));
    let mut rx = tosser.events().subscribe();

    let spec = TossSpec::new(HttpRequest::get("http://svc.local/health"))
        .named("health")
        .with_retry(
            RetryPolicy::new(RetryStrategy::named(STATUS_2XX))
                .with_count(2)
                .with_delay(Duration::from_millis(1)),
        )
        .with_expectations(Expectations::new().expect_status(200));

    let err = tosser.execute(spec).await.unwrap_err();
    assert_eq!(err.to_string(), "HTTP status 503 != 200");
    assert_eq!(transport.calls.load(Ordering::SeqCst), 3);

    let reports = completed_reports(&mut rx);
    assert_eq!(reports.len(), 1);
    assert_eq!(reports[0].attempts, 3);
    assert_eq!(reports[0].verdict, Verdict::Failed);
}

// ---------------------------------------------------------------------------
// Test 3: Retry stops as soon as the strategy is satisfied
// ---------------------------------------------------------------------------

#[tokio::test]
async fn retry_stops_on_first_success() {
    let transport = Arc::new(Statuses::new(&[500, 502, 200]));
    let tosser = tosser_with(transport.clone(), Arc::new(InMemoryRegistry::new()));

    let spec = TossSpec::new(HttpRequest::get("http://svc.local/jobs/7"))
        .with_retry(
            RetryPolicy::new(RetryStrategy::named(STATUS_2XX))
                .with_count(5)
                .with_delay(Duration::from_millis(1)),
        )
        .with_expectations(Expectations::new().expect_status(200))
        .returns(CaptureSource::path("attempt"));

    let output = tosser.execute(spec).await.unwrap();
    assert_eq!(output.report.attempts, 3);
    assert_eq!(output.value, Some(json!(3)));
    assert_eq!(transport.calls.load(Ordering::SeqCst), 3);
}

// ---------------------------------------------------------------------------
// Test 4: Interactions are removed exactly once when validation fails
// ---------------------------------------------------------------------------

#[tokio::test]
async fn failed_toss_removes_interactions_once() {
    let inner = Arc::new(InMemoryRegistry::new());
    let registry = Arc::new(CountingRegistry {
        inner: inner.clone(),
        removals: AtomicUsize::new(0),
    });
    let tosser = tosser_with(Arc::new(MockServer::new(inner.clone())), registry.clone());

    let spec = TossSpec::new(HttpRequest::get("http://orders.local/api/orders/2"))
        .use_interaction(Interaction::new("GET", "/api/orders/2", 200).with_response_body(json!({"id": 2})))
        .with_expectations(Expectations::new().expect_status(201));

    let err = tosser.execute(spec).await.unwrap_err();
    assert_eq!(err.verdict(), Verdict::Failed);
    assert_eq!(registry.removals.load(Ordering::SeqCst), 1);
    assert!(inner.is_empty().await);
}

// ---------------------------------------------------------------------------
// Test 5: Only the first failing expectation is reported
// ---------------------------------------------------------------------------

#[tokio::test]
async fn first_failure_wins() {
    let registry = Arc::new(InMemoryRegistry::new());
    let tosser = tosser_with(Arc::new(MockServer::new(registry.clone())), registry.clone());
    let mut rx = tosser.events().subscribe();

    let spec = TossSpec::new(HttpRequest::get("http://orders.local/api/orders/3"))
        .named("broken order")
        .use_interaction(
            Interaction::new("GET", "/api/orders/3", 500).with_response_body(json!({"error": "boom"})),
        )
        .with_expectations(
            Expectations::new()
                .expect_status(200)
                .expect_body_contains("ok")
                .expect_json_like(json!({"id": 3})),
        );

    let err = tosser.execute(spec).await.unwrap_err();
    assert_eq!(err.to_string(), "HTTP status 500 != 200");

    let reports = completed_reports(&mut rx);
    assert_eq!(reports[0].failure.as_deref(), Some("HTTP status 500 != 200"));
    assert_eq!(reports[0].status, Some(500));
}

// ---------------------------------------------------------------------------
// Test 6: A registered interaction that was never hit fails the toss
// ---------------------------------------------------------------------------

#[tokio::test]
async fn unexercised_interaction_fails() {
    let registry = Arc::new(InMemoryRegistry::new());
    let tosser = tosser_with(Arc::new(MockServer::new(registry.clone())), registry.clone());

    let spec = TossSpec::new(HttpRequest::get("http://orders.local/api/orders/4"))
        .use_interaction(Interaction::new("GET", "/api/orders/4", 200).with_response_body(json!({"id": 4})))
        .use_interaction(Interaction::new("GET", "/api/stock/A1", 200).with_response_body(json!({"left": 1})))
        .with_expectations(Expectations::new().expect_status(200));

    let err = tosser.execute(spec).await.unwrap_err();
    assert_eq!(err.to_string(), "Interaction not exercised: GET - /api/stock/A1");
    assert!(registry.is_empty().await);
}

// ---------------------------------------------------------------------------
// Test 7: Transport errors give an ERROR verdict and still clean up
// ---------------------------------------------------------------------------

#[tokio::test]
async fn transport_error_is_an_error_verdict() {
    let registry = Arc::new(InMemoryRegistry::new());
    let tosser = tosser_with(Arc::new(Refused), registry.clone());
    let mut rx = tosser.events().subscribe();

    let spec = TossSpec::new(HttpRequest::get("http://127.0.0.1:9/"))
        .named("down")
        .with_retry(RetryPolicy::new(RetryStrategy::named(STATUS_2XX)).with_delay(Duration::from_millis(1)))
        .use_interaction(Interaction::new("GET", "/upstream", 200))
        .with_expectations(Expectations::new().expect_status(200));

    let err = tosser.execute(spec).await.unwrap_err();
    assert!(err.is_transport());
    assert_eq!(err.verdict(), Verdict::Error);
    assert!(err.to_string().contains("ECONNREFUSED"));
    assert!(registry.is_empty().await);

    let reports = completed_reports(&mut rx);
    assert_eq!(reports[0].verdict, Verdict::Error);
    assert_eq!(reports[0].attempts, 1, "transport errors are not retried");
}

// ---------------------------------------------------------------------------
// Test 8: Response time limit is exclusive
// ---------------------------------------------------------------------------

#[tokio::test]
async fn slow_response_fails_time_limit() {
    let tosser = tosser_with(
        Arc::new(Slow(Duration::from_millis(30))),
        Arc::new(InMemoryRegistry::new()),
    );

    let strict = TossSpec::new(HttpRequest::get("http://svc.local/slow"))
        .with_expectations(Expectations::new().expect_response_time(5));
    let err = tosser.execute(strict).await.unwrap_err();
    assert!(
        err.to_string().starts_with("Request took longer than 5ms: ("),
        "unexpected message: {err}"
    );

    let relaxed = TossSpec::new(HttpRequest::get("http://svc.local/slow"))
        .with_expectations(Expectations::new().expect_response_time(10_000));
    tosser.execute(relaxed).await.unwrap();
}

// ---------------------------------------------------------------------------
// Test 9: Snapshots are written on first run, then enforced, then updated
// ---------------------------------------------------------------------------

#[tokio::test]
async fn snapshot_lifecycle_on_disk() {
    let dir = tempfile::tempdir().unwrap();
    let run = |body: Value, update: bool| {
        let settings = EngineSettings {
            update_snapshots: update,
            ..EngineSettings::default()
        };
        let tosser = Tosser::new(Arc::new(Fixed(body)), Arc::new(InMemoryRegistry::new()))
            .with_snapshot_store(Arc::new(FileSnapshotStore::new(dir.path())))
            .with_settings(settings);
        let spec = TossSpec::new(HttpRequest::get("http://svc.local/users/1"))
            .named("user profile")
            .with_expectations(
                Expectations::new().expect_json_snapshot(Some(json!({"seen": like(json!("2026-01-01"))}))),
            );
        async move { tosser.execute(spec).await }
    };

    run(json!({"id": 1, "name": "Ada", "seen": "2026-10-01"}), false)
        .await
        .expect("first run records the snapshot");
    let file = dir.path().join("user_profile.json");
    assert!(file.exists());

    // A different timestamp is tolerated by the matcher.
    run(json!({"id": 1, "name": "Ada", "seen": "2026-10-02"}), false)
        .await
        .unwrap();

    let err = run(json!({"id": 1, "name": "Grace", "seen": "2026-10-02"}), false)
        .await
        .unwrap_err();
    assert_eq!(err.verdict(), Verdict::Failed);
    assert!(err.to_string().contains("'$.name'"), "unexpected message: {err}");

    run(json!({"id": 1, "name": "Grace", "seen": "2026-10-03"}), true)
        .await
        .unwrap();
    let stored: Value = serde_json::from_str(&std::fs::read_to_string(&file).unwrap()).unwrap();
    assert_eq!(stored["name"], json!("Grace"));
}

// ---------------------------------------------------------------------------
// Test 10: Concurrent tosses share one store
// ---------------------------------------------------------------------------

struct SeedTenant;

#[async_trait]
impl StateHandler for SeedTenant {
    async fn apply(&self, ctx: &StateContext<'_>) -> Result<()> {
        let tenant = ctx.data.cloned().unwrap_or(json!("default"));
        ctx.store.set("tenant", tenant).await;
        Ok(())
    }
}

#[tokio::test]
async fn concurrent_tosses_share_the_store() {
    let registry = Arc::new(InMemoryRegistry::new());
    let mut handlers = builtin_registry();
    handlers.add_state_handler("seed tenant", SeedTenant);
    let seen = Arc::new(Mutex::new(Vec::new()));
    let seen_by_handler = seen.clone();
    handlers.add_capture_handler("tenant echo", move |ctx| {
        let tenant = ctx.store.get("tenant").cloned();
        seen_by_handler.lock().unwrap().push(tenant.clone());
        tenant
    });

    let tosser = Tosser::new(Arc::new(MockServer::new(registry.clone())), registry.clone())
        .with_handlers(handlers)
        .with_snapshot_store(Arc::new(MemorySnapshotStore::new()));

    let login = TossSpec::new(HttpRequest::post("http://auth.local/api/login").with_json(json!({"user": "ada"})))
        .with_state("seed tenant", Some(json!("acme")))
        .use_interaction(Interaction::new("POST", "/api/login", 200).with_response_body(json!({"token": "t-1"})))
        .with_expectations(Expectations::new().expect_status(200))
        .stores("token", CaptureSource::path("token"));
    let profile = TossSpec::new(HttpRequest::get("http://auth.local/api/profile"))
        .use_interaction(Interaction::new("GET", "/api/profile", 200).with_response_body(json!({"id": 9})))
        .with_expectations(Expectations::new().expect_status(200))
        .stores("profileId", CaptureSource::path("id"));

    let (a, b) = tokio::join!(tosser.execute(login), tosser.execute(profile));
    a.unwrap();
    b.unwrap();

    let store = tosser.store();
    assert_eq!(store.get("token").await, Some(json!("t-1")));
    assert_eq!(store.get("profileId").await, Some(json!(9)));
    assert_eq!(store.get("tenant").await, Some(json!("acme")));

    // A later toss reads what earlier tosses stored.
    let echo = TossSpec::new(HttpRequest::get("http://auth.local/api/profile"))
        .use_interaction(Interaction::new("GET", "/api/profile", 200).with_response_body(json!({"id": 9})))
        .returns(CaptureSource::named("tenant echo"));
    let output = tosser.execute(echo).await.unwrap();
    assert_eq!(output.value, Some(json!("acme")));
    assert_eq!(seen.lock().unwrap().len(), 1);
    assert!(registry.is_empty().await);
}

// ---------------------------------------------------------------------------
// Test 11: Stored values are substituted into later tosses
// ---------------------------------------------------------------------------

#[tokio::test]
async fn stored_values_flow_into_later_tosses() {
    let registry = Arc::new(InMemoryRegistry::new());
    let tosser = tosser_with(Arc::new(MockServer::new(registry.clone())), registry.clone());

    let login = TossSpec::new(HttpRequest::post("http://auth.local/api/login").with_json(json!({"user": "ada"})))
        .use_interaction(Interaction::new("POST", "/api/login", 200).with_response_body(json!({"token": "abc123"})))
        .stores("token", CaptureSource::path("token"));
    tosser.execute(login).await.unwrap();

    let session = TossSpec::new(
        HttpRequest::get("http://auth.local/api/sessions/$S{token}").with_header("Authorization", "Bearer $S{token}"),
    )
    .use_interaction(
        Interaction::new("GET", "/api/sessions/$S{token}", 200)
            .with_response_body(json!({"session": "$S{token}", "active": true})),
    )
    .with_expectations(
        Expectations::new()
            .expect_status(200)
            .expect_json_like(json!({"session": "$S{token}"}))
            .expect_json_at("session", json!("$S{token}")),
    );

    let output = tosser.execute(session).await.expect("substituted toss should pass");
    assert_eq!(output.report.url, "http://auth.local/api/sessions/abc123");
    assert_eq!(output.interactions[0].request.path, "/api/sessions/abc123");
    assert!(output.interactions[0].exercised);

    // With nothing stored under the name, the reference stays literal.
    let unknown = TossSpec::new(HttpRequest::get("http://auth.local/api/sessions/$S{missing}"))
        .with_expectations(Expectations::new().expect_status(200));
    let err = tosser.execute(unknown).await.unwrap_err();
    assert!(err.to_string().contains("404"), "{err}");
}

// ---------------------------------------------------------------------------
// Test 12: Inspect and a fixed wait do not change the verdict
// ---------------------------------------------------------------------------

#[tokio::test]
async fn inspect_and_wait_delay() {
    let tosser = tosser_with(Arc::new(Fixed(json!({"ok": true}))), Arc::new(InMemoryRegistry::new()));

    let inspected = TossSpec::new(HttpRequest::get("http://svc.local/status"))
        .inspect()
        .with_expectations(Expectations::new().expect_json(json!({"ok": true})));
    assert_eq!(tosser.execute(inspected).await.unwrap().report.verdict, Verdict::Passed);

    let waited = TossSpec::new(HttpRequest::get("http://svc.local/status"))
        .wait_for(Duration::from_millis(20))
        .with_expectations(Expectations::new().expect_status(200));
    let output = tosser.execute(waited).await.unwrap();
    assert!(output.report.duration_ms >= 20, "waited only {}ms", output.report.duration_ms);
}

// ---------------------------------------------------------------------------
// Test 13: Strict matching at a path rejects extra fields
// ---------------------------------------------------------------------------

#[tokio::test]
async fn strict_match_at_path_through_a_toss() {
    let tosser = tosser_with(
        Arc::new(Fixed(json!({"owner": {"id": 7, "name": "ada", "admin": true}}))),
        Arc::new(InMemoryRegistry::new()),
    );
    let run = |example: Value| {
        tosser.execute(
            TossSpec::new(HttpRequest::get("http://svc.local/repo"))
                .with_expectations(Expectations::new().expect_json_match_strict_at("owner", example)),
        )
    };

    run(json!({"id": like(json!(1)), "name": "ada", "admin": true})).await.unwrap();

    let err = run(json!({"id": like(json!(1)), "name": "ada"})).await.unwrap_err();
    assert_eq!(err.verdict(), Verdict::Failed);
    assert!(err.to_string().contains("admin"), "{err}");

    assert!(run(json!({"id": 7})).await.is_err());
    let missing = tosser
        .execute(
            TossSpec::new(HttpRequest::get("http://svc.local/repo"))
                .with_expectations(Expectations::new().expect_json_match_strict_at("team", json!(null))),
        )
        .await
        .unwrap_err();
    assert!(missing.to_string().contains("No value at path 'team'"), "{missing}");
}

// ---------------------------------------------------------------------------
// Test 14: A failed registration stops the toss before any dispatch
// ---------------------------------------------------------------------------

#[derive(Default)]
struct RejectingRegistry {
    fetches: AtomicUsize,
    removals: AtomicUsize,
}

#[async_trait]
impl InteractionRegistry for RejectingRegistry {
    async fn register(&self, _interaction: &Interaction) -> Result<String> {
        Err(volley_types::VolleyError::Registry {
            operation: "register".into(),
            message: "HTTP 503".into(),
        })
    }

    async fn fetch(&self, _ids: &[String]) -> Result<Vec<Interaction>> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        Ok(Vec::new())
    }

    async fn remove(&self, _ids: &[String]) -> Result<()> {
        self.removals.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[tokio::test]
async fn registration_failure_skips_dispatch_and_cleanup_calls() {
    let transport = Arc::new(Statuses::new(&[200]));
    let registry = Arc::new(RejectingRegistry::default());
    let tosser = tosser_with(transport.clone(), registry.clone());

    let spec = TossSpec::new(HttpRequest::get("http://svc.local/api/users"))
        .use_interaction(Interaction::new("GET", "/api/users", 200));
    let err = tosser.execute(spec).await.unwrap_err();

    assert!(matches!(err, volley_types::VolleyError::Registry { .. }), "{err}");
    assert_eq!(transport.calls.load(Ordering::SeqCst), 0);
    assert_eq!(registry.fetches.load(Ordering::SeqCst), 0);
    assert_eq!(registry.removals.load(Ordering::SeqCst), 0);
}

// ---------------------------------------------------------------------------
// Test 15: A panicking retry strategy still removes interactions
// ---------------------------------------------------------------------------

#[tokio::test]
async fn panicking_strategy_cleans_up() {
    let inner = Arc::new(InMemoryRegistry::new());
    let registry = Arc::new(CountingRegistry {
        inner: inner.clone(),
        removals: AtomicUsize::new(0),
    });
    let tosser = tosser_with(Arc::new(MockServer::new(inner.clone())), registry.clone());

    let spec = TossSpec::new(HttpRequest::get("http://svc.local/api/users"))
        .use_interaction(Interaction::new("GET", "/api/users", 200).with_response_body(json!([])))
        .with_retry(RetryPolicy::new(RetryStrategy::inline(|_| panic!("strategy bug"))).with_count(2));

    let err = tosser.execute(spec).await.unwrap_err();
    assert!(err.to_string().contains("strategy bug"), "{err}");
    assert_eq!(registry.removals.load(Ordering::SeqCst), 1);
    assert!(inner.is_empty().await);
}
