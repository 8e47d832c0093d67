//! Snapshot persistence for snapshot expectations.
//!
//! A snapshot is the JSON body recorded for a named case. Loading a snapshot
//! that does not exist yet records the supplied value and returns it, so the
//! first run of a case always passes.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::RwLock;

use volley_types::{Result, VolleyError};

#[async_trait]
pub trait SnapshotStore: Send + Sync {
    async fn save(&self, name: &str, value: &Value) -> Result<()>;

    /// The stored snapshot for `name`, or `fallback` (which is then stored)
    /// when there is none.
    async fn load(&self, name: &str, fallback: &Value) -> Result<Value>;
}

// ---------------------------------------------------------------------------
// FileSnapshotStore
// ---------------------------------------------------------------------------

/// Stores each snapshot as pretty JSON in `<dir>/<name>.json`.
#[derive(Debug, Clone)]
pub struct FileSnapshotStore {
    dir: PathBuf,
}

impl FileSnapshotStore {
    pub fn new(dir: impl AsRef<Path>) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
        }
    }

    pub fn path_for(&self, name: &str) -> PathBuf {
        let file: String = name
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                    c
                } else {
                    '_'
                }
            })
            .collect();
        self.dir.join(format!("{file}.json"))
    }
}

#[async_trait]
impl SnapshotStore for FileSnapshotStore {
    async fn save(&self, name: &str, value: &Value) -> Result<()> {
        tokio::fs::create_dir_all(&self.dir).await?;
        let path = self.path_for(name);
        let json = serde_json::to_string_pretty(value)?;
        tokio::fs::write(&path, json).await?;
        tracing::debug!(path = %path.display(), "Snapshot saved");
        Ok(())
    }

    async fn load(&self, name: &str, fallback: &Value) -> Result<Value> {
        let path = self.path_for(name);
        if !tokio::fs::try_exists(&path).await? {
            self.save(name, fallback).await?;
            return Ok(fallback.clone());
        }
        let json = tokio::fs::read_to_string(&path).await?;
        serde_json::from_str(&json).map_err(|e| VolleyError::Snapshot {
            name: name.to_string(),
            message: format!("{}: {e}", path.display()),
        })
    }
}

// ---------------------------------------------------------------------------
// MemorySnapshotStore
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
pub struct MemorySnapshotStore {
    entries: RwLock<HashMap<String, Value>>,
}

impl MemorySnapshotStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get(&self, name: &str) -> Option<Value> {
        self.entries.read().await.get(name).cloned()
    }
}

#[async_trait]
impl SnapshotStore for MemorySnapshotStore {
    async fn save(&self, name: &str, value: &Value) -> Result<()> {
        self.entries
            .write()
            .await
            .insert(name.to_string(), value.clone());
        Ok(())
    }

    async fn load(&self, name: &str, fallback: &Value) -> Result<Value> {
        let mut entries = self.entries.write().await;
        Ok(entries
            .entry(name.to_string())
            .or_insert_with(|| fallback.clone())
            .clone())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
