//! Toss event system and the per-toss report.
//!
//! Emits [`TossEvent`]s via a [`tokio::sync::broadcast`] channel. Reporters
//! subscribe and look for [`TossEvent::TossCompleted`], which carries the
//! final [`TossReport`] of every toss regardless of its verdict.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use volley_types::{Interaction, Verdict};

/// Summary of one finished toss.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TossReport {
    pub name: String,
    pub verdict: Verdict,
    /// Message of the first failure, if any.
    pub failure: Option<String>,
    pub method: String,
    pub url: String,
    pub status: Option<u16>,
    pub response_time_ms: Option<u64>,
    /// Number of dispatches performed, retries included.
    pub attempts: usize,
    pub interactions: Vec<Interaction>,
    /// Values produced by recorders.
    pub recorded: BTreeMap<String, Value>,
    /// RFC 3339 timestamp of when the toss started.
    pub started_at: String,
    pub duration_ms: u64,
}

/// Events emitted while a toss runs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum TossEvent {
    TossStarted {
        name: String,
        method: String,
        url: String,
    },
    StateApplied {
        name: String,
        handler: String,
    },
    InteractionsRegistered {
        name: String,
        ids: Vec<String>,
    },
    RequestDispatched {
        url: String,
        attempt: usize,
        status: Option<u16>,
        response_time_ms: u64,
    },
    RetryScheduled {
        url: String,
        attempt: usize,
        delay_ms: u64,
    },
    InteractionsRemoved {
        name: String,
        ids: Vec<String>,
    },
    TossCompleted {
        report: TossReport,
    },
}

/// Event emitter wrapping a broadcast sender.
#[derive(Clone)]
pub struct EventEmitter {
    sender: tokio::sync::broadcast::Sender<TossEvent>,
}

impl EventEmitter {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = tokio::sync::broadcast::channel(capacity);
        Self { sender }
    }

    /// Events with no active receivers are dropped.
    pub fn emit(&self, event: TossEvent) {
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<TossEvent> {
        self.sender.subscribe()
    }
}

impl Default for EventEmitter {
    fn default() -> Self {
        Self::new(256)
    }
}
