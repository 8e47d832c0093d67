//! Synchronous expectation categories.
//!
//! Each check returns the first violation as [`VolleyError::Assertion`].

use serde_json::Value;

use volley_types::{HttpResponse, Interaction, Result, VolleyError};

use super::{Expectations, HeaderExpectation, PathExpectation, TextMatch};
use crate::compare::{first_difference, json_like, match_value, matching_rules, raw_value};
use crate::query::query;
use crate::schema::SchemaValidator;

fn fail<T>(message: impl Into<String>) -> Result<T> {
    Err(VolleyError::assertion(message))
}

/// Value at `path` in the body. A path that matches nothing fails, so a
/// missing value never compares equal to an expected `null`.
fn at_path(response: &HttpResponse, path: &str) -> Result<Value> {
    match query(&response.json_or_null(), path)? {
        Some(value) => Ok(value),
        None => fail(format!("No value at path '{path}'")),
    }
}

pub fn status(exp: &Expectations, response: &HttpResponse) -> Result<()> {
    match exp.status {
        Some(expected) if expected != response.status => {
            fail(format!("HTTP status {} != {}", response.status, expected))
        }
        _ => Ok(()),
    }
}

fn header_values(
    expectations: &[HeaderExpectation],
    response: &HttpResponse,
    contains: bool,
) -> Result<()> {
    for expected in expectations {
        let Some(actual) = response.headers.get(&expected.name) else {
            return fail(format!(
                "Header '{}' not present in HTTP response",
                expected.name
            ));
        };
        match &expected.value {
            None => {}
            Some(TextMatch::Pattern(re)) => {
                if !re.is_match(actual) {
                    return fail(format!(
                        "Header regex ({}) did not match for header '{}': '{}'",
                        re.as_str(),
                        expected.name,
                        actual
                    ));
                }
            }
            Some(TextMatch::Exact(value)) => {
                let matched = if contains {
                    actual.to_lowercase().contains(&value.to_lowercase())
                } else {
                    actual.eq_ignore_ascii_case(value)
                };
                if !matched {
                    return fail(format!(
                        "Header value '{}' did not match for header '{}': '{}'",
                        value, expected.name, actual
                    ));
                }
            }
        }
    }
    Ok(())
}

pub fn headers(exp: &Expectations, response: &HttpResponse) -> Result<()> {
    header_values(&exp.headers, response, false)
}

pub fn header_contains(exp: &Expectations, response: &HttpResponse) -> Result<()> {
    header_values(&exp.header_contains, response, true)
}

pub fn body(exp: &Expectations, response: &HttpResponse) -> Result<()> {
    let Some(expected) = &exp.body else {
        return Ok(());
    };
    let actual = response.text();
    if actual == expected.as_str() {
        Ok(())
    } else {
        fail(format!(
            "Response body mismatch: expected '{expected}' but found '{actual}'"
        ))
    }
}

pub fn body_contains(exp: &Expectations, response: &HttpResponse) -> Result<()> {
    let text = response.text();
    for expected in &exp.body_contains {
        let found = match expected {
            TextMatch::Exact(value) => text.contains(value.as_str()),
            TextMatch::Pattern(re) => re.is_match(&text),
        };
        if !found {
            let shown = match expected {
                TextMatch::Exact(value) => value.clone(),
                TextMatch::Pattern(re) => re.as_str().to_string(),
            };
            return fail(format!("Value '{shown}' not found in response body"));
        }
    }
    Ok(())
}

pub fn json(exp: &Expectations, response: &HttpResponse) -> Result<()> {
    let actual = response.json_or_null();
    for expected in &exp.json {
        if let Some(diff) = first_difference(&actual, expected, "$") {
            return fail(diff);
        }
    }
    Ok(())
}

pub fn json_like_all(exp: &Expectations, response: &HttpResponse) -> Result<()> {
    let actual = response.json_or_null();
    for expected in &exp.json_like {
        let outcome = json_like(&actual, expected);
        if !outcome.equal {
            return fail(outcome.message);
        }
    }
    Ok(())
}

pub fn json_at(exp: &Expectations, response: &HttpResponse) -> Result<()> {
    for PathExpectation { path, value } in &exp.json_at {
        let actual = at_path(response, path)?;
        if let Some(diff) = first_difference(&actual, value, "$") {
            return fail(format!("Value at path '{path}' mismatch: {diff}"));
        }
    }
    Ok(())
}

pub fn json_like_at(exp: &Expectations, response: &HttpResponse) -> Result<()> {
    for PathExpectation { path, value } in &exp.json_like_at {
        let actual = at_path(response, path)?;
        let outcome = json_like(&actual, value);
        if !outcome.equal {
            return fail(outcome.message);
        }
    }
    Ok(())
}

fn schema_failure(path: Option<&str>, errors: &[String]) -> VolleyError {
    let joined = errors.join("\n ");
    match path {
        None => VolleyError::assertion(format!(
            "Response doesn't match with JSON schema: \n {joined}"
        )),
        Some(path) => VolleyError::assertion(format!(
            "Response doesn't match with JSON schema at {path}: \n {joined}"
        )),
    }
}

pub fn json_schema(
    exp: &Expectations,
    response: &HttpResponse,
    validator: &dyn SchemaValidator,
) -> Result<()> {
    let actual = response.json_or_null();
    for schema in &exp.json_schema {
        if let Some(errors) = validator.validate(schema, &actual)? {
            return Err(schema_failure(None, &errors));
        }
    }
    Ok(())
}

pub fn json_schema_at(
    exp: &Expectations,
    response: &HttpResponse,
    validator: &dyn SchemaValidator,
) -> Result<()> {
    for PathExpectation { path, value } in &exp.json_schema_at {
        let actual = at_path(response, path)?;
        if let Some(errors) = validator.validate(value, &actual)? {
            return Err(schema_failure(Some(path), &errors));
        }
    }
    Ok(())
}

fn match_body(actual: &Value, example: &Value, strict: bool) -> Result<()> {
    let rules = matching_rules(example, "$.body");
    match match_value(actual, &raw_value(example), &rules, "$.body", strict) {
        Some(message) => fail(message.replace("$.body", "$")),
        None => Ok(()),
    }
}

fn match_path(actual: &Value, path: &str, example: &Value, strict: bool) -> Result<()> {
    let rules = matching_rules(example, path);
    match match_value(actual, &raw_value(example), &rules, path, strict) {
        Some(message) => fail(message),
        None => Ok(()),
    }
}

pub fn json_match(exp: &Expectations, response: &HttpResponse) -> Result<()> {
    let actual = response.json_or_null();
    for example in &exp.json_match {
        match_body(&actual, example, false)?;
    }
    Ok(())
}

pub fn json_match_at(exp: &Expectations, response: &HttpResponse) -> Result<()> {
    for PathExpectation { path, value } in &exp.json_match_at {
        match_path(&at_path(response, path)?, path, value, false)?;
    }
    Ok(())
}

pub fn json_match_strict(exp: &Expectations, response: &HttpResponse) -> Result<()> {
    let actual = response.json_or_null();
    for example in &exp.json_match_strict {
        match_body(&actual, example, true)?;
    }
    Ok(())
}

pub fn json_match_strict_at(exp: &Expectations, response: &HttpResponse) -> Result<()> {
    for PathExpectation { path, value } in &exp.json_match_strict_at {
        match_path(&at_path(response, path)?, path, value, true)?;
    }
    Ok(())
}

pub fn response_time(exp: &Expectations, response: &HttpResponse) -> Result<()> {
    match exp.response_time_ms {
        Some(limit) if response.response_time_ms > limit => fail(format!(
            "Request took longer than {limit}ms: ({}ms).",
            response.response_time_ms
        )),
        _ => Ok(()),
    }
}

/// Check registry-observed interaction state against each interaction's
/// expectations, in declaration order.
pub fn interactions(interactions: &[Interaction]) -> Result<()> {
    for interaction in interactions {
        let expects = &interaction.expects;
        if expects.exercised && !interaction.exercised {
            tracing::warn!(interaction = %interaction.describe(), "Interaction not exercised");
            return fail(format!(
                "Interaction not exercised: {}",
                interaction.describe()
            ));
        }
        if !expects.exercised && interaction.exercised {
            tracing::warn!(interaction = %interaction.describe(), "Interaction got exercised");
            return fail(format!("Interaction exercised: {}", interaction.describe()));
        }
        if let Some(expected) = expects.call_count {
            if interaction.call_count != expected {
                return fail(format!(
                    "Interaction call count {} !== {} for {}",
                    interaction.call_count,
                    expected,
                    interaction.describe()
                ));
            }
        }
    }
    Ok(())
}
