//! Path queries over JSON values.
//!
//! Grammar: dotted keys (`data.user.name`), array indices (`items[0]`),
//! wildcards that collect every element (`items[*].id`), the first element
//! whose field matches (`items[id=3]`), and every such element
//! (`items[*status=open]`). An empty path or `.` selects the whole value.

use serde_json::Value;

use volley_types::{Result, VolleyError};

#[derive(Debug, Clone, PartialEq)]
enum Step {
    Key(String),
    Index(usize),
    All,
    FindFirst { key: String, value: String },
    FindAll { key: String, value: String },
}

fn invalid(path: &str, message: impl Into<String>) -> VolleyError {
    VolleyError::InvalidPath {
        path: path.to_string(),
        message: message.into(),
    }
}

fn parse(path: &str) -> Result<Vec<Step>> {
    let mut steps = Vec::new();
    let mut key = String::new();
    let mut chars = path.chars();

    while let Some(c) = chars.next() {
        match c {
            '.' => {
                if !key.is_empty() {
                    steps.push(Step::Key(std::mem::take(&mut key)));
                }
            }
            '[' => {
                if !key.is_empty() {
                    steps.push(Step::Key(std::mem::take(&mut key)));
                }
                let mut inner = String::new();
                let mut closed = false;
                for c in chars.by_ref() {
                    if c == ']' {
                        closed = true;
                        break;
                    }
                    inner.push(c);
                }
                if !closed {
                    return Err(invalid(path, "unclosed '['"));
                }
                steps.push(parse_bracket(path, inner.trim())?);
            }
            ']' => return Err(invalid(path, "unexpected ']'")),
            _ => key.push(c),
        }
    }
    if !key.is_empty() {
        steps.push(Step::Key(key));
    }
    Ok(steps)
}

fn parse_bracket(path: &str, inner: &str) -> Result<Step> {
    if inner == "*" {
        return Ok(Step::All);
    }
    if let Ok(index) = inner.parse::<usize>() {
        return Ok(Step::Index(index));
    }
    if let Some((key, value)) = inner.split_once('=') {
        let value = value.trim().trim_matches(|c| c == '"' || c == '\'').to_string();
        return match key.trim().strip_prefix('*') {
            Some(key) if !key.is_empty() => Ok(Step::FindAll {
                key: key.to_string(),
                value,
            }),
            None if !key.trim().is_empty() => Ok(Step::FindFirst {
                key: key.trim().to_string(),
                value,
            }),
            _ => Err(invalid(path, format!("missing key in '[{inner}]'"))),
        };
    }
    let quoted = inner
        .strip_prefix('"')
        .and_then(|s| s.strip_suffix('"'))
        .or_else(|| inner.strip_prefix('\'').and_then(|s| s.strip_suffix('\'')));
    match quoted {
        Some(key) => Ok(Step::Key(key.to_string())),
        None => Err(invalid(path, format!("unsupported selector '[{inner}]'"))),
    }
}

fn field_matches(element: &Value, key: &str, expected: &str) -> bool {
    match element.get(key) {
        Some(Value::String(s)) => s == expected,
        Some(other) => other.to_string() == expected,
        None => false,
    }
}

enum Cursor<'a> {
    One(&'a Value),
    Many(Vec<&'a Value>),
}

fn apply<'a>(cursor: Cursor<'a>, step: &Step) -> Option<Cursor<'a>> {
    let one = |v: &'a Value| -> Option<Cursor<'a>> {
        match step {
            Step::Key(k) => v.get(k).map(Cursor::One),
            Step::Index(i) => v.get(*i).map(Cursor::One),
            Step::All => v.as_array().map(|a| Cursor::Many(a.iter().collect())),
            Step::FindFirst { key, value } => v
                .as_array()?
                .iter()
                .find(|e| field_matches(e, key, value))
                .map(Cursor::One),
            Step::FindAll { key, value } => v.as_array().map(|a| {
                Cursor::Many(a.iter().filter(|e| field_matches(e, key, value)).collect())
            }),
        }
    };

    match cursor {
        Cursor::One(v) => one(v),
        Cursor::Many(values) => {
            let mut collected = Vec::new();
            for v in values {
                match one(v) {
                    Some(Cursor::One(x)) => collected.push(x),
                    Some(Cursor::Many(xs)) => collected.extend(xs),
                    None => {}
                }
            }
            Some(Cursor::Many(collected))
        }
    }
}

/// Evaluate `path` against `root`. `Ok(None)` when nothing matches.
pub fn query(root: &Value, path: &str) -> Result<Option<Value>> {
    let steps = parse(path.trim())?;
    let mut cursor = Cursor::One(root);
    for step in &steps {
        match apply(cursor, step) {
            Some(next) => cursor = next,
            None => return Ok(None),
        }
    }
    Ok(Some(match cursor {
        Cursor::One(v) => v.clone(),
        Cursor::Many(vs) => Value::Array(vs.into_iter().cloned().collect()),
    }))
}
