//! Response expectations and the validation engine.
//!
//! Categories are checked in a fixed order and validation stops at the first
//! violation: status, headers, header substrings, body, body substrings,
//! JSON equality, JSON like, JSON at path, JSON like at path, JSON schema,
//! JSON schema at path, JSON match, JSON match at path, strict JSON match,
//! strict JSON match at path, snapshot, response time, custom handlers.

pub mod checks;

use std::fmt;
use std::sync::Arc;

use regex::Regex;
use serde_json::Value;

use volley_types::{HttpRequest, HttpResponse, Result, VolleyError};

use crate::compare::{first_difference, match_value, matching_rules, MatchingRules};
use crate::handler::{ExpectContext, ExpectHandler, HandlerRegistry};
use crate::schema::SchemaValidator;
use crate::snapshot::SnapshotStore;

pub use checks::interactions as validate_interactions;

// ---------------------------------------------------------------------------
// Expectation building blocks
// ---------------------------------------------------------------------------

/// Exact text or a regular expression.
#[derive(Debug, Clone)]
pub enum TextMatch {
    Exact(String),
    Pattern(Regex),
}

/// A response header that must be present, optionally with a given value.
#[derive(Debug, Clone)]
pub struct HeaderExpectation {
    pub name: String,
    /// `None` only requires the header to be present.
    pub value: Option<TextMatch>,
}

/// An expectation applied to the body value at `path`.
#[derive(Debug, Clone, PartialEq)]
pub struct PathExpectation {
    /// [`query`](crate::query::query) syntax.
    pub path: String,
    pub value: Value,
}

#[derive(Clone)]
pub enum ExpectHandlerRef {
    Named(String),
    Inline(Arc<dyn ExpectHandler>),
}

impl fmt::Debug for ExpectHandlerRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExpectHandlerRef::Named(n) => f.debug_tuple("Named").field(n).finish(),
            ExpectHandlerRef::Inline(_) => f.write_str("Inline(..)"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CustomExpectation {
    pub handler: ExpectHandlerRef,
    pub data: Option<Value>,
}

impl CustomExpectation {
    fn label(&self) -> &str {
        match &self.handler {
            ExpectHandlerRef::Named(n) => n,
            ExpectHandlerRef::Inline(_) => "inline",
        }
    }
}

// ---------------------------------------------------------------------------
// Expectations
// ---------------------------------------------------------------------------

/// Everything a toss expects of its response.
#[derive(Debug, Clone, Default)]
pub struct Expectations {
    /// Case name; snapshots are stored under it.
    pub name: Option<String>,
    /// Overwrite the stored snapshot with the actual body before comparing.
    pub update_snapshot: bool,
    pub status: Option<u16>,
    pub headers: Vec<HeaderExpectation>,
    pub header_contains: Vec<HeaderExpectation>,
    pub body: Option<String>,
    pub body_contains: Vec<TextMatch>,
    pub json: Vec<Value>,
    pub json_like: Vec<Value>,
    pub json_at: Vec<PathExpectation>,
    pub json_like_at: Vec<PathExpectation>,
    pub json_schema: Vec<Value>,
    pub json_schema_at: Vec<PathExpectation>,
    pub json_match: Vec<Value>,
    pub json_match_at: Vec<PathExpectation>,
    pub json_match_strict: Vec<Value>,
    pub json_match_strict_at: Vec<PathExpectation>,
    /// One entry per snapshot directive; `Some` carries matchers.
    pub json_snapshot: Vec<Option<Value>>,
    pub response_time_ms: Option<u64>,
    pub custom: Vec<CustomExpectation>,
}

fn at(path: impl Into<String>, value: Value) -> PathExpectation {
    PathExpectation {
        path: path.into(),
        value,
    }
}

impl Expectations {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn update_snapshot(mut self) -> Self {
        self.update_snapshot = true;
        self
    }

    /// Status code must equal `status`.
    pub fn expect_status(mut self, status: u16) -> Self {
        self.status = Some(status);
        self
    }

    /// Header `name` must be present and, with `Some`, equal `value`.
    pub fn expect_header(mut self, name: impl Into<String>, value: Option<&str>) -> Self {
        self.headers.push(HeaderExpectation {
            name: name.into(),
            value: value.map(|v| TextMatch::Exact(v.to_string())),
        });
        self
    }

    pub fn expect_header_matches(mut self, name: impl Into<String>, pattern: Regex) -> Self {
        self.headers.push(HeaderExpectation {
            name: name.into(),
            value: Some(TextMatch::Pattern(pattern)),
        });
        self
    }

    /// Header `name` must contain `value` as a substring.
    pub fn expect_header_contains(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.header_contains.push(HeaderExpectation {
            name: name.into(),
            value: Some(TextMatch::Exact(value.into())),
        });
        self
    }

    /// Raw body text must equal `body`.
    pub fn expect_body(mut self, body: impl Into<String>) -> Self {
        self.body = Some(body.into());
        self
    }

    pub fn expect_body_contains(mut self, value: impl Into<String>) -> Self {
        self.body_contains.push(TextMatch::Exact(value.into()));
        self
    }

    pub fn expect_body_matches(mut self, pattern: Regex) -> Self {
        self.body_contains.push(TextMatch::Pattern(pattern));
        self
    }

    /// Body must deep-equal `value`.
    pub fn expect_json(mut self, value: Value) -> Self {
        self.json.push(value);
        self
    }

    /// Body must contain `value`: extra object fields are allowed.
    pub fn expect_json_like(mut self, value: Value) -> Self {
        self.json_like.push(value);
        self
    }

    /// Value at `path` must deep-equal `value`. A missing path fails.
    pub fn expect_json_at(mut self, path: impl Into<String>, value: Value) -> Self {
        self.json_at.push(at(path, value));
        self
    }

    pub fn expect_json_like_at(mut self, path: impl Into<String>, value: Value) -> Self {
        self.json_like_at.push(at(path, value));
        self
    }

    pub fn expect_json_schema(mut self, schema: Value) -> Self {
        self.json_schema.push(schema);
        self
    }

    pub fn expect_json_schema_at(mut self, path: impl Into<String>, schema: Value) -> Self {
        self.json_schema_at.push(at(path, schema));
        self
    }

    /// Body must match `example` with matchers ([`like`](crate::compare::like) and friends).
    pub fn expect_json_match(mut self, example: Value) -> Self {
        self.json_match.push(example);
        self
    }

    pub fn expect_json_match_at(mut self, path: impl Into<String>, example: Value) -> Self {
        self.json_match_at.push(at(path, example));
        self
    }

    /// Like [`expect_json_match`](Self::expect_json_match) but extra object fields fail.
    pub fn expect_json_match_strict(mut self, example: Value) -> Self {
        self.json_match_strict.push(example);
        self
    }

    pub fn expect_json_match_strict_at(mut self, path: impl Into<String>, example: Value) -> Self {
        self.json_match_strict_at.push(at(path, example));
        self
    }

    /// Compare the body to the snapshot stored under the case name.
    pub fn expect_json_snapshot(mut self, matchers: Option<Value>) -> Self {
        self.json_snapshot.push(matchers);
        self
    }

    /// Response must arrive within `max_ms` milliseconds.
    pub fn expect_response_time(mut self, max_ms: u64) -> Self {
        self.response_time_ms = Some(max_ms);
        self
    }

    /// Run the registered expect handler `name`.
    pub fn expect_handler(mut self, name: impl Into<String>, data: Option<Value>) -> Self {
        self.custom.push(CustomExpectation {
            handler: ExpectHandlerRef::Named(name.into()),
            data,
        });
        self
    }

    pub fn expect_with(mut self, handler: impl ExpectHandler + 'static, data: Option<Value>) -> Self {
        self.custom.push(CustomExpectation {
            handler: ExpectHandlerRef::Inline(Arc::new(handler)),
            data,
        });
        self
    }
}

// ---------------------------------------------------------------------------
// ValidationEngine
// ---------------------------------------------------------------------------

/// Validates a received response against [`Expectations`].
pub struct ValidationEngine<'a> {
    pub handlers: &'a HandlerRegistry,
    pub schema: &'a dyn SchemaValidator,
    pub snapshots: &'a dyn SnapshotStore,
    /// Fail when a custom handler returns `false` instead of ignoring it.
    pub strict_expect_handlers: bool,
}

impl ValidationEngine<'_> {
    pub async fn validate(
        &self,
        exp: &Expectations,
        request: &HttpRequest,
        response: &HttpResponse,
    ) -> Result<()> {
        checks::status(exp, response)?;
        checks::headers(exp, response)?;
        checks::header_contains(exp, response)?;
        checks::body(exp, response)?;
        checks::body_contains(exp, response)?;
        checks::json(exp, response)?;
        checks::json_like_all(exp, response)?;
        checks::json_at(exp, response)?;
        checks::json_like_at(exp, response)?;
        checks::json_schema(exp, response, self.schema)?;
        checks::json_schema_at(exp, response, self.schema)?;
        checks::json_match(exp, response)?;
        checks::json_match_at(exp, response)?;
        checks::json_match_strict(exp, response)?;
        checks::json_match_strict_at(exp, response)?;
        self.snapshot(exp, response).await?;
        checks::response_time(exp, response)?;
        self.custom(exp, request, response).await
    }

    async fn snapshot(&self, exp: &Expectations, response: &HttpResponse) -> Result<()> {
        if exp.json_snapshot.is_empty() {
            return Ok(());
        }
        let name = exp
            .name
            .as_deref()
            .filter(|n| !n.is_empty())
            .ok_or_else(|| VolleyError::assertion("Snapshot name is required"))?;

        let actual = response.json_or_null();
        if exp.update_snapshot {
            tracing::warn!(name, "Update snapshot is enabled");
            self.snapshots.save(name, &actual).await?;
        }
        let expected = self.snapshots.load(name, &actual).await?;

        let mut rules = MatchingRules::new();
        for matchers in exp.json_snapshot.iter().flatten() {
            rules.extend(matching_rules(matchers, "$.body"));
        }

        if rules.is_empty() {
            return match first_difference(&actual, &expected, "$") {
                Some(diff) => Err(VolleyError::assertion(format!(
                    "Snapshot '{name}' mismatch: {diff}"
                ))),
                None => Ok(()),
            };
        }

        let forward = match_value(&actual, &expected, &rules, "$.body", false);
        let backward = || match_value(&expected, &actual, &rules, "$.body", false);
        match forward.or_else(backward) {
            Some(message) => Err(VolleyError::assertion(message.replace("$.body", "$"))),
            None => Ok(()),
        }
    }

    async fn custom(
        &self,
        exp: &Expectations,
        request: &HttpRequest,
        response: &HttpResponse,
    ) -> Result<()> {
        for custom in &exp.custom {
            let handler = match &custom.handler {
                ExpectHandlerRef::Named(name) => self.handlers.expect_handler(name)?,
                ExpectHandlerRef::Inline(h) => h.clone(),
            };
            let passed = handler
                .check(&ExpectContext {
                    request,
                    response,
                    data: custom.data.as_ref(),
                })
                .await?;
            if !passed {
                if self.strict_expect_handlers {
                    return Err(VolleyError::assertion(format!(
                        "Custom expect handler '{}' returned false",
                        custom.label()
                    )));
                }
                tracing::debug!(handler = custom.label(), "Expect handler returned false, ignored");
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
