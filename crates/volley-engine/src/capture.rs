//! Data capture from a finished exchange: recorders, stores and returns.
//!
//! A capture source is a path query, a named capture handler or an inline
//! function. Path queries starting with `req.` run against a view of the
//! request and those starting with `res.` against a view of the response
//! (`statusCode`, `headers`, `body`, `responseTime`). Any other path runs
//! against the JSON body.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use serde_json::{json, Value};

use volley_types::{HttpRequest, HttpResponse, RequestBody, Result};

use crate::handler::{CaptureContext, CaptureFn, HandlerRegistry};
use crate::query::query;

#[derive(Clone)]
pub enum CaptureSource {
    Path(String),
    Named(String),
    Inline(CaptureFn),
}

impl CaptureSource {
    pub fn path(path: impl Into<String>) -> Self {
        CaptureSource::Path(path.into())
    }

    pub fn named(name: impl Into<String>) -> Self {
        CaptureSource::Named(name.into())
    }

    pub fn inline(f: impl Fn(&CaptureContext<'_>) -> Option<Value> + Send + Sync + 'static) -> Self {
        CaptureSource::Inline(Arc::new(f))
    }
}

impl fmt::Debug for CaptureSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CaptureSource::Path(p) => f.debug_tuple("Path").field(p).finish(),
            CaptureSource::Named(n) => f.debug_tuple("Named").field(n).finish(),
            CaptureSource::Inline(_) => f.write_str("Inline(..)"),
        }
    }
}

/// A named capture: the key it is recorded or stored under, and its source.
#[derive(Debug, Clone)]
pub struct Capture {
    pub name: String,
    pub source: CaptureSource,
}

impl Capture {
    pub fn new(name: impl Into<String>, source: CaptureSource) -> Self {
        Self {
            name: name.into(),
            source,
        }
    }
}

pub fn request_view(request: &HttpRequest) -> Value {
    let body = match &request.body {
        Some(RequestBody::Json(v)) => v.clone(),
        Some(RequestBody::Text(t)) => Value::String(t.clone()),
        Some(RequestBody::Form(fields)) => json!(fields),
        Some(RequestBody::Bytes(bytes)) => Value::String(String::from_utf8_lossy(bytes).into_owned()),
        None => Value::Null,
    };
    json!({
        "method": request.method,
        "url": request.url,
        "headers": request.headers,
        "body": body,
    })
}

pub fn response_view(response: &HttpResponse) -> Value {
    let body = match &response.json {
        Some(v) => v.clone(),
        None => Value::String(response.text().into_owned()),
    };
    json!({
        "statusCode": response.status,
        "headers": response.headers,
        "body": body,
        "responseTime": response.response_time_ms,
    })
}

/// Evaluate `source` against a received exchange.
pub fn capture(
    source: &CaptureSource,
    request: &HttpRequest,
    response: &HttpResponse,
    handlers: &HandlerRegistry,
    store: &HashMap<String, Value>,
) -> Result<Option<Value>> {
    let ctx = CaptureContext {
        request,
        response,
        store,
    };
    match source {
        CaptureSource::Path(path) => {
            if let Some(rest) = path.strip_prefix("req.") {
                query(&request_view(request), rest)
            } else if let Some(rest) = path.strip_prefix("res.") {
                query(&response_view(response), rest)
            } else {
                query(&response.json_or_null(), path)
            }
        }
        CaptureSource::Named(name) => {
            let handler = handlers.capture_handler(name)?;
            Ok(handler(&ctx))
        }
        CaptureSource::Inline(f) => Ok(f(&ctx)),
    }
}
