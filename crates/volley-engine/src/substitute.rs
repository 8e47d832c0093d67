//! Stored-value references in requests, interactions and expectations.
//!
//! `$S{token}` stands for the stored value `token`; `$S{user.id}` and
//! `$S{items[0]}` address into it with [`query`](crate::query::query) syntax.
//! A string that is exactly one reference takes the stored value with its
//! JSON type. References inside longer text are spliced in as text.
//! References to unknown names are left untouched.

use std::collections::HashMap;

use serde_json::Value;

use volley_types::{HttpRequest, Interaction, RequestBody};

use crate::expect::{Expectations, HeaderExpectation, PathExpectation, TextMatch};
use crate::query::query;

const OPEN: &str = "$S{";

/// Resolve one reference (the text between `$S{` and `}`).
pub fn lookup(reference: &str, values: &HashMap<String, Value>) -> Option<Value> {
    let split = reference.find(['.', '[']).unwrap_or(reference.len());
    let (name, rest) = reference.split_at(split);
    let value = values.get(name)?;
    let rest = rest.strip_prefix('.').unwrap_or(rest);
    if rest.is_empty() {
        return Some(value.clone());
    }
    query(value, rest).ok().flatten()
}

fn whole_reference(text: &str) -> Option<&str> {
    text.strip_prefix(OPEN)?
        .strip_suffix('}')
        .filter(|inner| !inner.is_empty() && !inner.contains('}'))
}

/// Splice every resolvable reference in `text`.
pub fn substitute_str(text: &str, values: &HashMap<String, Value>) -> String {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(start) = rest.find(OPEN) {
        let after = &rest[start + OPEN.len()..];
        let Some(end) = after.find('}') else {
            break;
        };
        out.push_str(&rest[..start]);
        match lookup(&after[..end], values) {
            Some(Value::String(s)) => out.push_str(&s),
            Some(other) => out.push_str(&other.to_string()),
            None => out.push_str(&rest[start..start + OPEN.len() + end + 1]),
        }
        rest = &after[end + 1..];
    }
    out.push_str(rest);
    out
}

/// Replace references anywhere inside a JSON value.
pub fn substitute_value(value: &mut Value, values: &HashMap<String, Value>) {
    if let Value::String(s) = value {
        let replacement = match whole_reference(s).and_then(|r| lookup(r, values)) {
            Some(found) => found,
            None if s.contains(OPEN) => Value::String(substitute_str(s, values)),
            None => return,
        };
        *value = replacement;
        return;
    }
    match value {
        Value::Array(items) => items.iter_mut().for_each(|v| substitute_value(v, values)),
        Value::Object(map) => map.values_mut().for_each(|v| substitute_value(v, values)),
        _ => {}
    }
}

fn substitute_opt(value: &mut Option<Value>, values: &HashMap<String, Value>) {
    if let Some(v) = value {
        substitute_value(v, values);
    }
}

fn substitute_headers(headers: &mut volley_types::Headers, values: &HashMap<String, Value>) {
    let replaced: Vec<(String, String)> = headers
        .iter()
        .filter(|(_, v)| v.contains(OPEN))
        .map(|(k, v)| (k.to_string(), substitute_str(v, values)))
        .collect();
    for (name, value) in replaced {
        headers.insert(name, value);
    }
}

pub fn apply_to_request(request: &mut HttpRequest, values: &HashMap<String, Value>) {
    if values.is_empty() {
        return;
    }
    request.url = substitute_str(&request.url, values);
    substitute_headers(&mut request.headers, values);
    match &mut request.body {
        Some(RequestBody::Json(body)) => substitute_value(body, values),
        Some(RequestBody::Text(text)) => *text = substitute_str(text, values),
        Some(RequestBody::Form(fields)) => {
            for field in fields.values_mut() {
                *field = substitute_str(field, values);
            }
        }
        Some(RequestBody::Bytes(_)) | None => {}
    }
}

pub fn apply_to_interaction(interaction: &mut Interaction, values: &HashMap<String, Value>) {
    if values.is_empty() {
        return;
    }
    let request = &mut interaction.request;
    request.path = substitute_str(&request.path, values);
    substitute_headers(&mut request.headers, values);
    substitute_opt(&mut request.body, values);
    substitute_headers(&mut interaction.response.headers, values);
    substitute_opt(&mut interaction.response.body, values);
}

fn substitute_text_match(text: &mut TextMatch, values: &HashMap<String, Value>) {
    if let TextMatch::Exact(s) = text {
        *s = substitute_str(s, values);
    }
}

fn substitute_header_expectations(list: &mut [HeaderExpectation], values: &HashMap<String, Value>) {
    for header in list {
        if let Some(value) = &mut header.value {
            substitute_text_match(value, values);
        }
    }
}

fn substitute_paths(list: &mut [PathExpectation], values: &HashMap<String, Value>) {
    for entry in list {
        entry.path = substitute_str(&entry.path, values);
        substitute_value(&mut entry.value, values);
    }
}

pub fn apply_to_expectations(exp: &mut Expectations, values: &HashMap<String, Value>) {
    if values.is_empty() {
        return;
    }
    substitute_header_expectations(&mut exp.headers, values);
    substitute_header_expectations(&mut exp.header_contains, values);
    if let Some(body) = &mut exp.body {
        *body = substitute_str(body, values);
    }
    exp.body_contains
        .iter_mut()
        .for_each(|t| substitute_text_match(t, values));
    for list in [
        &mut exp.json,
        &mut exp.json_like,
        &mut exp.json_schema,
        &mut exp.json_match,
        &mut exp.json_match_strict,
    ] {
        list.iter_mut().for_each(|v| substitute_value(v, values));
    }
    for list in [
        &mut exp.json_at,
        &mut exp.json_like_at,
        &mut exp.json_schema_at,
        &mut exp.json_match_at,
        &mut exp.json_match_strict_at,
    ] {
        substitute_paths(list, values);
    }
    exp.json_snapshot
        .iter_mut()
        .for_each(|m| substitute_opt(m, values));
    exp.custom
        .iter_mut()
        .for_each(|c| substitute_opt(&mut c.data, values));
}
