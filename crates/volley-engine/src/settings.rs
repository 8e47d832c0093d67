//! Engine-wide settings, with overrides from `VOLLEY_*` environment variables.

use std::path::PathBuf;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use volley_types::{Result, VolleyError};

use crate::capture::Capture;

pub const ENV_REQUEST_TIMEOUT_MS: &str = "VOLLEY_REQUEST_TIMEOUT_MS";
pub const ENV_SNAPSHOT_DIR: &str = "VOLLEY_SNAPSHOT_DIR";
pub const ENV_AUTO_REPORT: &str = "VOLLEY_AUTO_REPORT";
pub const ENV_UPDATE_SNAPSHOTS: &str = "VOLLEY_UPDATE_SNAPSHOTS";
pub const ENV_REGISTRY_URL: &str = "VOLLEY_REGISTRY_URL";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineSettings {
    /// Applied to requests that do not set their own timeout.
    pub request_timeout_ms: u64,
    pub snapshot_dir: PathBuf,
    /// Emit a `TossCompleted` report event for every toss.
    pub auto_report: bool,
    /// Overwrite stored snapshots with actual bodies.
    pub update_snapshots: bool,
    /// Fail when a custom expect handler returns `false`.
    pub strict_expect_handlers: bool,
    /// Remote interaction registry; `None` keeps interactions in memory.
    pub registry_url: Option<String>,
    /// Recorders run for every toss, before the toss's own recorders.
    #[serde(skip)]
    pub default_recorders: Vec<Capture>,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            request_timeout_ms: 3000,
            snapshot_dir: PathBuf::from(".volley/snapshots"),
            auto_report: true,
            update_snapshots: false,
            strict_expect_handlers: false,
            registry_url: None,
            default_recorders: Vec::new(),
        }
    }
}

fn parse_var<T: FromStr>(name: &str, raw: &str) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    raw.trim()
        .parse()
        .map_err(|e| VolleyError::Config(format!("{name}='{raw}': {e}")))
}

impl EngineSettings {
    /// Defaults overridden by the process environment.
    pub fn from_env() -> Result<Self> {
        Self::from_vars(|name| std::env::var(name).ok())
    }

    /// Defaults overridden by whatever `lookup` returns for each variable.
    pub fn from_vars(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut settings = Self::default();
        if let Some(raw) = lookup(ENV_REQUEST_TIMEOUT_MS) {
            settings.request_timeout_ms = parse_var(ENV_REQUEST_TIMEOUT_MS, &raw)?;
        }
        if let Some(raw) = lookup(ENV_SNAPSHOT_DIR) {
            settings.snapshot_dir = PathBuf::from(raw);
        }
        if let Some(raw) = lookup(ENV_AUTO_REPORT) {
            settings.auto_report = parse_var(ENV_AUTO_REPORT, &raw)?;
        }
        if let Some(raw) = lookup(ENV_UPDATE_SNAPSHOTS) {
            settings.update_snapshots = parse_var(ENV_UPDATE_SNAPSHOTS, &raw)?;
        }
        if let Some(raw) = lookup(ENV_REGISTRY_URL) {
            settings.registry_url = Some(raw).filter(|url| !url.is_empty());
        }
        Ok(settings)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn vars(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn defaults() {
        let settings = EngineSettings::default();
        assert_eq!(settings.request_timeout_ms, 3000);
        assert_eq!(settings.snapshot_dir, PathBuf::from(".volley/snapshots"));
        assert!(settings.auto_report);
        assert!(!settings.update_snapshots);
        assert!(settings.registry_url.is_none());
    }

    #[test]
    fn variables_override_defaults() {
        let settings = EngineSettings::from_vars(vars(&[
            (ENV_REQUEST_TIMEOUT_MS, "750"),
            (ENV_SNAPSHOT_DIR, "/tmp/snaps"),
            (ENV_AUTO_REPORT, "false"),
            (ENV_UPDATE_SNAPSHOTS, "true"),
            (ENV_REGISTRY_URL, "http://localhost:9393"),
        ]))
        .unwrap();
        assert_eq!(settings.request_timeout_ms, 750);
        assert_eq!(settings.snapshot_dir, PathBuf::from("/tmp/snaps"));
        assert!(!settings.auto_report);
        assert!(settings.update_snapshots);
        assert_eq!(settings.registry_url.as_deref(), Some("http://localhost:9393"));
    }

    #[test]
    fn malformed_values_are_config_errors() {
        let err = EngineSettings::from_vars(vars(&[(ENV_REQUEST_TIMEOUT_MS, "soon")])).unwrap_err();
        assert!(matches!(err, VolleyError::Config(_)));
        assert!(err.to_string().contains(ENV_REQUEST_TIMEOUT_MS));

        assert!(EngineSettings::from_vars(vars(&[(ENV_AUTO_REPORT, "yes")])).is_err());
    }

    #[test]
    fn settings_deserialize_with_defaults() {
        let settings: EngineSettings =
            serde_json::from_str(r#"{"strict_expect_handlers": true}"#).unwrap();
        assert!(settings.strict_expect_handlers);
        assert_eq!(settings.request_timeout_ms, 3000);
    }
}
