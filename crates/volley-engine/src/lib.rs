//! Toss engine for HTTP contract testing.
//!
//! This crate implements the Volley toss runner: the orchestrator that takes
//! one request through state setup, interaction registration, dispatch with
//! retry, cleanup, data capture and validation, plus the collaborators it is
//! built from (transport, interaction registry, handler table, path queries,
//! JSON comparison, schema validation and snapshots).

pub mod capture;
pub mod compare;
pub mod events;
pub mod expect;
pub mod handler;
pub mod levels;
pub mod query;
pub mod registry;
pub mod retry;
pub mod schema;
pub mod settings;
pub mod snapshot;
pub mod substitute;
pub mod toss;
pub mod transport;

pub use capture::{capture, request_view, response_view, Capture, CaptureSource};
pub use compare::{
    any_bool, any_number, any_string, each_like, first_difference, json_like, like, match_value,
    matching_rules, raw_value, regex, LikeOutcome, MatchRule, MatchingRules,
};
pub use events::{EventEmitter, TossEvent, TossReport};
pub use expect::{
    validate_interactions, CustomExpectation, ExpectHandlerRef, Expectations, HeaderExpectation,
    PathExpectation, TextMatch, ValidationEngine,
};
pub use handler::{
    builtin_registry, CaptureContext, CaptureFn, ExpectContext, ExpectHandler, HandlerRegistry,
    RetryContext, RetryFn, StateContext, StateHandler,
};
pub use levels::{LevelGuard, LogLevelControl, LogLevelOverrides};
pub use query::query;
pub use registry::{HttpRegistry, InMemoryRegistry, InteractionLifecycle, InteractionRegistry};
pub use retry::{dispatch_with_retry, RetryPolicy, RetryRun, RetryStrategy};
pub use schema::{JsonSchemaValidator, SchemaValidator};
pub use settings::EngineSettings;
pub use snapshot::{FileSnapshotStore, MemorySnapshotStore, SnapshotStore};
pub use toss::{StateCall, TossOutput, TossSpec, Tosser, Wait};
pub use transport::{dispatch_timed, ReqwestTransport, Transport};
