//! Interaction registry seam and the per-toss interaction lifecycle.
//!
//! Interactions are registered before dispatch, their observed state is
//! fetched afterwards, and they are removed exactly once no matter how the
//! toss ends.

use std::sync::Arc;

use async_trait::async_trait;
use futures::future::join_all;
use tokio::sync::RwLock;

use volley_types::{Interaction, InteractionResponse, Result, VolleyError};

// ---------------------------------------------------------------------------
// InteractionRegistry trait
// ---------------------------------------------------------------------------

#[async_trait]
pub trait InteractionRegistry: Send + Sync {
    /// Register one interaction, returning its registry-issued id.
    async fn register(&self, interaction: &Interaction) -> Result<String>;

    /// Observed state of the interactions with the given ids, in id order.
    async fn fetch(&self, ids: &[String]) -> Result<Vec<Interaction>>;

    async fn remove(&self, ids: &[String]) -> Result<()>;
}

// ---------------------------------------------------------------------------
// InteractionLifecycle
// ---------------------------------------------------------------------------

/// Tracks the interactions one toss registered.
pub struct InteractionLifecycle {
    registry: Arc<dyn InteractionRegistry>,
    ids: Vec<String>,
}

impl InteractionLifecycle {
    pub fn new(registry: Arc<dyn InteractionRegistry>) -> Self {
        Self {
            registry,
            ids: Vec::new(),
        }
    }

    pub fn ids(&self) -> &[String] {
        &self.ids
    }

    /// Register every interaction concurrently and stamp the issued ids.
    ///
    /// When some registrations fail, the ones that succeeded are removed
    /// again before the first error is returned.
    pub async fn register_all(&mut self, interactions: &mut [Interaction]) -> Result<()> {
        if interactions.is_empty() {
            return Ok(());
        }

        let results = join_all(interactions.iter().map(|i| self.registry.register(i))).await;

        let mut first_error = None;
        for (interaction, result) in interactions.iter_mut().zip(results) {
            match result {
                Ok(id) => {
                    interaction.id = Some(id.clone());
                    self.ids.push(id);
                }
                Err(e) => {
                    first_error.get_or_insert(e);
                }
            }
        }

        if let Some(err) = first_error {
            if let Err(cleanup) = self.remove_all().await {
                tracing::warn!(error = %cleanup, "Failed to remove partially registered interactions");
            }
            return Err(err);
        }

        tracing::debug!(ids = ?self.ids, "Interactions registered");
        Ok(())
    }

    /// Replace the local interactions' observed state with the registry's.
    pub async fn fetch_observed(&self, interactions: &mut [Interaction]) -> Result<()> {
        if self.ids.is_empty() {
            return Ok(());
        }

        let observed = self.registry.fetch(&self.ids).await?;
        for interaction in interactions.iter_mut() {
            let Some(id) = interaction.id.as_deref() else {
                continue;
            };
            match observed.iter().find(|o| o.id.as_deref() == Some(id)) {
                Some(o) => {
                    interaction.exercised = o.exercised;
                    interaction.call_count = o.call_count;
                }
                None => {
                    tracing::warn!(id, "Registry returned no state for interaction");
                }
            }
        }
        Ok(())
    }

    /// Remove everything this lifecycle registered. Subsequent calls are no-ops.
    pub async fn remove_all(&mut self) -> Result<()> {
        if self.ids.is_empty() {
            return Ok(());
        }
        let ids = std::mem::take(&mut self.ids);
        self.registry.remove(&ids).await?;
        tracing::debug!(ids = ?ids, "Interactions removed");
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// InMemoryRegistry
// ---------------------------------------------------------------------------

/// Registry backed by process memory, shared by a stub transport and the engine.
#[derive(Default)]
pub struct InMemoryRegistry {
    entries: RwLock<Vec<Interaction>>,
}

impl InMemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark the first interaction matching `method` and `path` as exercised
    /// and return its canned response.
    pub async fn record_call(&self, method: &str, path: &str) -> Option<InteractionResponse> {
        let mut entries = self.entries.write().await;
        let entry = entries.iter_mut().find(|i| {
            i.request.method.eq_ignore_ascii_case(method) && i.request.path == path
        })?;
        entry.exercised = true;
        entry.call_count += 1;
        Some(entry.response.clone())
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}

#[async_trait]
impl InteractionRegistry for InMemoryRegistry {
    async fn register(&self, interaction: &Interaction) -> Result<String> {
        let id = uuid::Uuid::new_v4().to_string();
        let mut stored = interaction.clone();
        stored.id = Some(id.clone());
        stored.exercised = false;
        stored.call_count = 0;
        self.entries.write().await.push(stored);
        Ok(id)
    }

    async fn fetch(&self, ids: &[String]) -> Result<Vec<Interaction>> {
        let entries = self.entries.read().await;
        ids.iter()
            .map(|id| {
                entries
                    .iter()
                    .find(|i| i.id.as_deref() == Some(id.as_str()))
                    .cloned()
                    .ok_or_else(|| VolleyError::Registry {
                        operation: "fetch".into(),
                        message: format!("interaction '{id}' not found"),
                    })
            })
            .collect()
    }

    async fn remove(&self, ids: &[String]) -> Result<()> {
        self.entries
            .write()
            .await
            .retain(|i| !i.id.as_ref().is_some_and(|id| ids.contains(id)));
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// HttpRegistry
// ---------------------------------------------------------------------------

/// Registry reached over HTTP at `{base_url}/api/volley/interactions`.
#[derive(Debug, Clone)]
pub struct HttpRegistry {
    client: reqwest::Client,
    base_url: String,
}

impl HttpRegistry {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    fn endpoint(&self) -> String {
        format!("{}/api/volley/interactions", self.base_url)
    }

    async fn checked(
        operation: &str,
        sent: std::result::Result<reqwest::Response, reqwest::Error>,
    ) -> Result<reqwest::Response> {
        let response = sent.map_err(|e| registry_error(operation, e))?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(VolleyError::Registry {
            operation: operation.into(),
            message: format!("HTTP {}: {}", status.as_u16(), body),
        })
    }
}

fn registry_error(operation: &str, error: reqwest::Error) -> VolleyError {
    VolleyError::Registry {
        operation: operation.into(),
        message: error.to_string(),
    }
}

#[async_trait]
impl InteractionRegistry for HttpRegistry {
    async fn register(&self, interaction: &Interaction) -> Result<String> {
        let sent = self
            .client
            .post(self.endpoint())
            .json(&[interaction])
            .send()
            .await;
        let response = Self::checked("register", sent).await?;
        let ids: Vec<String> = response
            .json()
            .await
            .map_err(|e| registry_error("register", e))?;
        ids.into_iter().next().ok_or_else(|| VolleyError::Registry {
            operation: "register".into(),
            message: "registry returned no id".into(),
        })
    }

    async fn fetch(&self, ids: &[String]) -> Result<Vec<Interaction>> {
        let sent = self
            .client
            .get(self.endpoint())
            .query(&[("ids", ids.join(","))])
            .send()
            .await;
        let response = Self::checked("fetch", sent).await?;
        response.json().await.map_err(|e| registry_error("fetch", e))
    }

    async fn remove(&self, ids: &[String]) -> Result<()> {
        let sent = self
            .client
            .delete(self.endpoint())
            .query(&[("ids", ids.join(","))])
            .send()
            .await;
        Self::checked("remove", sent).await.map(|_| ())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
