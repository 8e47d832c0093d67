//! JSON toss files accepted by `volley run` and `volley check`.
//!
//! ```json
//! {
//!   "name": "get user",
//!   "request": { "method": "GET", "url": "http://localhost:3000/api/users/1" },
//!   "retry": { "count": 5, "delay": "200ms", "strategy": "status-2xx" },
//!   "expect": { "status": 200, "json_like": { "id": 1 } },
//!   "stores": { "userId": "id" }
//! }
//! ```

use std::collections::BTreeMap;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{anyhow, Context as _};
use regex::Regex;
use serde::Deserialize;
use serde_json::Value;
use tracing_subscriber::filter::LevelFilter;

use volley_engine::{CaptureSource, Expectations, RetryPolicy, RetryStrategy, TossSpec};
use volley_types::{duration_serde, HttpRequest, Interaction};

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TossFile {
    pub name: Option<String>,
    pub request: HttpRequest,
    #[serde(default)]
    pub retry: Option<RetryFile>,
    #[serde(default)]
    pub interactions: Vec<Interaction>,
    #[serde(default)]
    pub state: Vec<NamedData>,
    #[serde(default)]
    pub expect: ExpectFile,
    #[serde(default)]
    pub records: BTreeMap<String, CaptureFile>,
    #[serde(default)]
    pub stores: BTreeMap<String, CaptureFile>,
    #[serde(default)]
    pub returns: Option<CaptureFile>,
    #[serde(default, with = "duration_serde")]
    pub wait: Option<Duration>,
    #[serde(default)]
    pub inspect: bool,
    #[serde(default)]
    pub log_level: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RetryFile {
    pub count: Option<usize>,
    #[serde(default, with = "duration_serde")]
    pub delay: Option<Duration>,
    /// Name of a registered retry handler.
    pub strategy: String,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NamedData {
    pub name: String,
    #[serde(default)]
    pub data: Option<Value>,
}

/// A path query (`"data.token"`, `"res.headers.etag"`) or `{"handler": "name"}`.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum CaptureFile {
    Path(String),
    Handler { handler: String },
}

impl From<CaptureFile> for CaptureSource {
    fn from(file: CaptureFile) -> Self {
        match file {
            CaptureFile::Path(path) => CaptureSource::Path(path),
            CaptureFile::Handler { handler } => CaptureSource::Named(handler),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ExpectFile {
    pub status: Option<u16>,
    pub headers: BTreeMap<String, String>,
    pub header_matches: BTreeMap<String, String>,
    pub header_contains: BTreeMap<String, String>,
    pub body: Option<String>,
    pub body_contains: Vec<String>,
    pub body_matches: Vec<String>,
    pub json: Option<Value>,
    pub json_like: Option<Value>,
    pub json_at: BTreeMap<String, Value>,
    pub json_like_at: BTreeMap<String, Value>,
    pub json_schema: Option<Value>,
    pub json_schema_at: BTreeMap<String, Value>,
    pub json_match: Option<Value>,
    pub json_match_at: BTreeMap<String, Value>,
    pub json_match_strict: Option<Value>,
    pub json_match_strict_at: BTreeMap<String, Value>,
    pub snapshot: bool,
    /// Matchers for the snapshot comparison; implies `snapshot`.
    pub snapshot_matchers: Option<Value>,
    pub update_snapshot: bool,
    pub response_time_ms: Option<u64>,
    pub handlers: Vec<NamedData>,
}

fn compile(pattern: &str) -> anyhow::Result<Regex> {
    Regex::new(pattern).with_context(|| format!("invalid regex '{pattern}'"))
}

impl ExpectFile {
    fn into_expectations(self) -> anyhow::Result<Expectations> {
        let mut exp = Expectations::new();
        exp.status = self.status;
        exp.update_snapshot = self.update_snapshot;
        for (name, value) in self.headers {
            exp = exp.expect_header(name, Some(value.as_str()));
        }
        for (name, pattern) in self.header_matches {
            exp = exp.expect_header_matches(name, compile(&pattern)?);
        }
        for (name, value) in self.header_contains {
            exp = exp.expect_header_contains(name, value);
        }
        exp.body = self.body;
        for value in self.body_contains {
            exp = exp.expect_body_contains(value);
        }
        for pattern in self.body_matches {
            exp = exp.expect_body_matches(compile(&pattern)?);
        }
        exp.json.extend(self.json);
        exp.json_like.extend(self.json_like);
        exp.json_schema.extend(self.json_schema);
        exp.json_match.extend(self.json_match);
        exp.json_match_strict.extend(self.json_match_strict);
        for (path, value) in self.json_at {
            exp = exp.expect_json_at(path, value);
        }
        for (path, value) in self.json_like_at {
            exp = exp.expect_json_like_at(path, value);
        }
        for (path, value) in self.json_schema_at {
            exp = exp.expect_json_schema_at(path, value);
        }
        for (path, value) in self.json_match_at {
            exp = exp.expect_json_match_at(path, value);
        }
        for (path, value) in self.json_match_strict_at {
            exp = exp.expect_json_match_strict_at(path, value);
        }
        if self.snapshot || self.snapshot_matchers.is_some() {
            exp = exp.expect_json_snapshot(self.snapshot_matchers);
        }
        exp.response_time_ms = self.response_time_ms;
        for handler in self.handlers {
            exp = exp.expect_handler(handler.name, handler.data);
        }
        Ok(exp)
    }
}

impl TossFile {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let source = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        serde_json::from_str(&source).with_context(|| format!("parsing {}", path.display()))
    }

    pub fn into_spec(mut self) -> anyhow::Result<TossSpec> {
        self.request.method.make_ascii_uppercase();
        for interaction in &mut self.interactions {
            interaction.request.method.make_ascii_uppercase();
        }
        let mut spec = TossSpec::new(self.request)
            .with_expectations(self.expect.into_expectations()?);
        spec.name = self.name;
        spec.interactions = self.interactions;
        spec.inspect = self.inspect;

        if let Some(retry) = self.retry {
            let mut policy = RetryPolicy::new(RetryStrategy::Named(retry.strategy));
            if let Some(count) = retry.count {
                policy = policy.with_count(count);
            }
            if let Some(delay) = retry.delay {
                policy = policy.with_delay(delay);
            }
            spec = spec.with_retry(policy);
        }
        for state in self.state {
            spec = spec.with_state(state.name, state.data);
        }
        for (name, source) in self.records {
            spec = spec.records(name, source.into());
        }
        for (name, source) in self.stores {
            spec = spec.stores(name, source.into());
        }
        if let Some(source) = self.returns {
            spec = spec.returns(source.into());
        }
        if let Some(delay) = self.wait {
            spec = spec.wait_for(delay);
        }
        if let Some(level) = self.log_level {
            let level = LevelFilter::from_str(&level)
                .map_err(|e| anyhow!("invalid log_level '{level}': {e}"))?;
            spec = spec.with_log_level(level);
        }
        Ok(spec)
    }
}
