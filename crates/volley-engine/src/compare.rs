//! JSON comparison: partial ("like") matching, matcher-driven matching
//! rules, and deep equality with a readable first difference.
//!
//! Matchers are plain JSON objects carrying a `$match` key, so they can be
//! written inline in expectations and toss files:
//!
//! ```json
//! { "id": { "$match": "type", "value": 1 },
//!   "email": { "$match": "regex", "pattern": "^.+@.+$", "value": "a@b.c" },
//!   "tags": { "$match": "each", "value": "x", "min": 1 } }
//! ```

use std::collections::{BTreeMap, HashSet};

use regex::Regex;
use serde_json::{json, Map, Value};

/// Key identifying a matcher object.
pub const MATCHER_KEY: &str = "$match";

// ---------------------------------------------------------------------------
// Matcher constructors
// ---------------------------------------------------------------------------

/// Matches any value of the same JSON type as `example`.
pub fn like(example: Value) -> Value {
    json!({ MATCHER_KEY: "type", "value": example })
}

pub fn any_string() -> Value {
    like(json!("string"))
}

pub fn any_number() -> Value {
    like(json!(0))
}

pub fn any_bool() -> Value {
    like(json!(true))
}

/// Matches strings against `pattern`; `example` is used where a concrete
/// value is needed.
pub fn regex(pattern: &str, example: impl Into<Value>) -> Value {
    json!({ MATCHER_KEY: "regex", "pattern": pattern, "value": example.into() })
}

/// Matches an array of at least `min` elements, each shaped like `example`.
pub fn each_like(example: Value, min: usize) -> Value {
    json!({ MATCHER_KEY: "each", "value": example, "min": min })
}

enum Matcher<'a> {
    Type(&'a Value),
    Regex { pattern: &'a str, example: &'a Value },
    Each { example: &'a Value, min: usize },
}

static NULL: Value = Value::Null;

fn as_matcher(value: &Value) -> Option<Matcher<'_>> {
    let obj = value.as_object()?;
    let kind = obj.get(MATCHER_KEY)?.as_str()?;
    let example = obj.get("value").unwrap_or(&NULL);
    match kind {
        "type" => Some(Matcher::Type(example)),
        "regex" => Some(Matcher::Regex {
            pattern: obj.get("pattern")?.as_str()?,
            example,
        }),
        "each" => Some(Matcher::Each {
            example,
            min: obj.get("min").and_then(Value::as_u64).unwrap_or(1) as usize,
        }),
        _ => None,
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Equality where `1` and `1.0` are the same number.
fn scalars_equal(actual: &Value, expected: &Value) -> bool {
    match (actual, expected) {
        (Value::Number(a), Value::Number(e)) => a == e || a.as_f64() == e.as_f64(),
        _ => actual == expected,
    }
}

fn regex_check(actual: &Value, pattern: &str, path: &str) -> Result<(), String> {
    let re = Regex::new(pattern).map_err(|e| format!("Invalid regex '{pattern}' at '{path}': {e}"))?;
    match actual.as_str() {
        Some(s) if re.is_match(s) => Ok(()),
        _ => Err(format!(
            "Json doesn't match with \"{pattern}\" at \"{path}\" but found \"{}\"",
            display(actual)
        )),
    }
}

fn display(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn type_error(expected: &str, actual: &Value, path: &str) -> String {
    format!(
        "Json doesn't have type '{expected}' at '{path}' but found '{}'",
        type_name(actual)
    )
}

// ---------------------------------------------------------------------------
// Like: partial matching
// ---------------------------------------------------------------------------

/// Result of a partial comparison.
#[derive(Debug, Clone, PartialEq)]
pub struct LikeOutcome {
    pub equal: bool,
    /// Empty when `equal`.
    pub message: String,
}

/// Check that `actual` contains everything in `expected`.
///
/// Objects may carry extra properties. Arrays match order-insensitively:
/// every expected element needs a distinct matching actual element.
pub fn json_like(actual: &Value, expected: &Value) -> LikeOutcome {
    match like_at(actual, expected, "$") {
        Ok(()) => LikeOutcome {
            equal: true,
            message: String::new(),
        },
        Err(message) => LikeOutcome {
            equal: false,
            message,
        },
    }
}

fn like_at(actual: &Value, expected: &Value, path: &str) -> Result<(), String> {
    if let Some(matcher) = as_matcher(expected) {
        return match matcher {
            Matcher::Regex { pattern, .. } => regex_check(actual, pattern, path),
            Matcher::Type(_) | Matcher::Each { .. } => {
                let rules = matching_rules(expected, path);
                match_at(actual, &raw_value(expected), &rules, path, false, false)
            }
        };
    }

    match expected {
        Value::Object(fields) => {
            let actual_fields = actual.as_object().ok_or_else(|| type_error("object", actual, path))?;
            for (key, value) in fields {
                let child = actual_fields.get(key).ok_or_else(|| {
                    format!("Json doesn't have property '{key}' at '{path}'")
                })?;
                like_at(child, value, &format!("{path}.{key}"))?;
            }
            Ok(())
        }
        Value::Array(items) => {
            let actual_items = actual.as_array().ok_or_else(|| type_error("array", actual, path))?;
            if items.len() > actual_items.len() {
                return Err(format!(
                    "Json doesn't have 'array' with length '{}' at '{path}' but found 'array' with length '{}'",
                    items.len(),
                    actual_items.len()
                ));
            }
            let mut used = HashSet::new();
            for (i, item) in items.iter().enumerate() {
                let found = actual_items
                    .iter()
                    .enumerate()
                    .find(|(j, candidate)| {
                        !used.contains(j) && like_at(candidate, item, path).is_ok()
                    })
                    .map(|(j, _)| j);
                match found {
                    Some(j) => {
                        used.insert(j);
                    }
                    None => {
                        let positional = like_at(&actual_items[i], item, &format!("{path}[{i}]"));
                        return Err(positional.err().unwrap_or_else(|| {
                            format!("Json doesn't have expected value at '{path}[{i}]'")
                        }));
                    }
                }
            }
            Ok(())
        }
        _ => {
            if scalars_equal(actual, expected) {
                Ok(())
            } else {
                Err(format!(
                    "Json doesn't have value '{}' at '{path}' but found '{}'",
                    display(expected),
                    display(actual)
                ))
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Matching rules
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub enum MatchRule {
    /// Same JSON type; descendants are compared by type as well.
    Type,
    Regex(String),
    /// Array of at least this many elements, each compared by type.
    MinType(usize),
}

/// Rules keyed by path (`$.body.items[*].id`).
pub type MatchingRules = BTreeMap<String, MatchRule>;

/// Collect the matching rules that the matchers inside `example` declare,
/// with paths rooted at `root`.
pub fn matching_rules(example: &Value, root: &str) -> MatchingRules {
    let mut rules = MatchingRules::new();
    collect_rules(example, root, &mut rules);
    rules
}

fn collect_rules(value: &Value, path: &str, rules: &mut MatchingRules) {
    if let Some(matcher) = as_matcher(value) {
        match matcher {
            Matcher::Type(example) => {
                rules.insert(path.to_string(), MatchRule::Type);
                collect_rules(example, path, rules);
            }
            Matcher::Regex { pattern, .. } => {
                rules.insert(path.to_string(), MatchRule::Regex(pattern.to_string()));
            }
            Matcher::Each { example, min } => {
                rules.insert(path.to_string(), MatchRule::MinType(min));
                collect_rules(example, &format!("{path}[*]"), rules);
            }
        }
        return;
    }
    match value {
        Value::Object(fields) => {
            for (key, child) in fields {
                collect_rules(child, &format!("{path}.{key}"), rules);
            }
        }
        Value::Array(items) => {
            for (i, child) in items.iter().enumerate() {
                collect_rules(child, &format!("{path}[{i}]"), rules);
            }
        }
        _ => {}
    }
}

/// `example` with every matcher replaced by its example value.
pub fn raw_value(example: &Value) -> Value {
    if let Some(matcher) = as_matcher(example) {
        return match matcher {
            Matcher::Type(v) | Matcher::Regex { example: v, .. } => raw_value(v),
            Matcher::Each { example, min } => {
                Value::Array(vec![raw_value(example); min.max(1)])
            }
        };
    }
    match example {
        Value::Object(fields) => Value::Object(
            fields
                .iter()
                .map(|(k, v)| (k.clone(), raw_value(v)))
                .collect::<Map<String, Value>>(),
        ),
        Value::Array(items) => Value::Array(items.iter().map(raw_value).collect()),
        other => other.clone(),
    }
}

/// Replace concrete indices with `[*]`: `$.a[2].b[0]` becomes `$.a[*].b[*]`.
fn generalize_indices(path: &str) -> String {
    let mut out = String::with_capacity(path.len());
    let mut chars = path.chars().peekable();
    while let Some(c) = chars.next() {
        out.push(c);
        if c == '[' && chars.peek().is_some_and(|d| d.is_ascii_digit()) {
            while chars.peek().is_some_and(|d| d.is_ascii_digit()) {
                chars.next();
            }
            out.push('*');
        }
    }
    out
}

/// Compare `actual` to `expected` under `rules`. `None` means they match.
///
/// Paths without a rule compare by value, except below a type rule where
/// they compare by type. In `strict` mode objects must not carry extra
/// properties and arrays must have the expected length.
pub fn match_value(
    actual: &Value,
    expected: &Value,
    rules: &MatchingRules,
    root: &str,
    strict: bool,
) -> Option<String> {
    match_at(actual, expected, rules, root, false, strict).err()
}

fn match_at(
    actual: &Value,
    expected: &Value,
    rules: &MatchingRules,
    path: &str,
    by_type: bool,
    strict: bool,
) -> Result<(), String> {
    let rule = rules
        .get(path)
        .or_else(|| rules.get(&generalize_indices(path)));

    let by_type = match rule {
        Some(MatchRule::Regex(pattern)) => return regex_check(actual, pattern, path),
        Some(MatchRule::MinType(min)) => {
            let items = actual.as_array().ok_or_else(|| type_error("array", actual, path))?;
            if items.len() < *min {
                return Err(format!(
                    "Json doesn't have 'array' with min length '{min}' at '{path}' but found '{}'",
                    items.len()
                ));
            }
            let Some(example) = expected.as_array().and_then(|e| e.first()) else {
                return Ok(());
            };
            for (i, item) in items.iter().enumerate() {
                match_at(item, example, rules, &format!("{path}[{i}]"), true, strict)?;
            }
            return Ok(());
        }
        Some(MatchRule::Type) => true,
        None => by_type,
    };

    match expected {
        Value::Object(fields) => {
            let actual_fields = actual.as_object().ok_or_else(|| type_error("object", actual, path))?;
            for (key, value) in fields {
                let child = actual_fields.get(key).ok_or_else(|| {
                    format!("Json doesn't have property '{key}' at '{path}'")
                })?;
                match_at(child, value, rules, &format!("{path}.{key}"), by_type, strict)?;
            }
            if strict {
                if let Some(extra) = actual_fields.keys().find(|k| !fields.contains_key(*k)) {
                    return Err(format!("Json has an extra property '{extra}' at '{path}'"));
                }
            }
            Ok(())
        }
        Value::Array(items) => {
            let actual_items = actual.as_array().ok_or_else(|| type_error("array", actual, path))?;
            if (!by_type || strict) && items.len() != actual_items.len() {
                return Err(format!(
                    "Json doesn't have 'array' with length '{}' at '{path}' but found 'array' with length '{}'",
                    items.len(),
                    actual_items.len()
                ));
            }
            for (i, (a, e)) in actual_items.iter().zip(items).enumerate() {
                match_at(a, e, rules, &format!("{path}[{i}]"), by_type, strict)?;
            }
            Ok(())
        }
        _ if by_type => {
            if type_name(actual) == type_name(expected) {
                Ok(())
            } else {
                Err(type_error(type_name(expected), actual, path))
            }
        }
        _ => {
            if scalars_equal(actual, expected) {
                Ok(())
            } else {
                Err(format!(
                    "Json doesn't have value '{}' at '{path}' but found '{}'",
                    display(expected),
                    display(actual)
                ))
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Deep equality
// ---------------------------------------------------------------------------

/// First point at which `actual` and `expected` differ, or `None` when they
/// are deeply equal.
pub fn first_difference(actual: &Value, expected: &Value, root: &str) -> Option<String> {
    diff_at(actual, expected, root)
}

fn diff_at(actual: &Value, expected: &Value, path: &str) -> Option<String> {
    match (actual, expected) {
        (Value::Object(a), Value::Object(e)) => {
            for (key, ev) in e {
                match a.get(key) {
                    Some(av) => {
                        if let Some(d) = diff_at(av, ev, &format!("{path}.{key}")) {
                            return Some(d);
                        }
                    }
                    None => return Some(format!("Json doesn't have property '{key}' at '{path}'")),
                }
            }
            a.keys()
                .find(|k| !e.contains_key(*k))
                .map(|extra| format!("Json has an extra property '{extra}' at '{path}'"))
        }
        (Value::Array(a), Value::Array(e)) => {
            if a.len() != e.len() {
                return Some(format!(
                    "Json doesn't have 'array' with length '{}' at '{path}' but found 'array' with length '{}'",
                    e.len(),
                    a.len()
                ));
            }
            a.iter()
                .zip(e)
                .enumerate()
                .find_map(|(i, (av, ev))| diff_at(av, ev, &format!("{path}[{i}]")))
        }
        _ if scalars_equal(actual, expected) => None,
        _ if type_name(actual) != type_name(expected) => {
            Some(type_error(type_name(expected), actual, path))
        }
        _ => Some(format!(
            "Json doesn't have value '{}' at '{path}' but found '{}'",
            display(expected),
            display(actual)
        )),
    }
}
