//! Serde helpers for optional durations written as milliseconds.
//!
//! Accepts a bare integer (`250`) or a suffixed string (`"250ms"`, `"2s"`,
//! `"1m"`) and always writes back an integer millisecond count.

use serde::{self, Deserialize, Deserializer, Serializer};
use std::time::Duration;

#[derive(Deserialize)]
#[serde(untagged)]
enum RawDuration {
    Millis(u64),
    Text(String),
}

pub fn serialize<S>(duration: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    match duration {
        Some(d) => serializer.serialize_u64(d.as_millis() as u64),
        None => serializer.serialize_none(),
    }
}

pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
where
    D: Deserializer<'de>,
{
    match Option::<RawDuration>::deserialize(deserializer)? {
        None => Ok(None),
        Some(RawDuration::Millis(ms)) => Ok(Some(Duration::from_millis(ms))),
        Some(RawDuration::Text(s)) => parse_duration_str(&s)
            .map(Some)
            .map_err(serde::de::Error::custom),
    }
}

pub fn parse_duration_str(s: &str) -> Result<Duration, String> {
    let s = s.trim();
    if let Some(val) = s.strip_suffix("ms") {
        let n: u64 = val.parse().map_err(|e| format!("invalid duration: {}", e))?;
        Ok(Duration::from_millis(n))
    } else if let Some(val) = s.strip_suffix('s') {
        let n: u64 = val.parse().map_err(|e| format!("invalid duration: {}", e))?;
        Ok(Duration::from_secs(n))
    } else if let Some(val) = s.strip_suffix('m') {
        let n: u64 = val.parse().map_err(|e| format!("invalid duration: {}", e))?;
        Ok(Duration::from_secs(n * 60))
    } else {
        s.parse::<u64>()
            .map(Duration::from_millis)
            .map_err(|_| format!("unknown duration format: {}", s))
    }
}
