//! In-process event bus for run lifecycle telemetry.
//!
//! Every published event is appended to its run's history and fanned out to
//! live subscribers. Subscribers that fall behind lose events (broadcast
//! semantics); the history is always complete.

use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, Mutex};

/// Default broadcast buffer per subscriber.
pub const DEFAULT_EVENT_CAPACITY: usize = 256;

/// Lifecycle event kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventKind {
    #[serde(rename = "run.started")]
    RunStarted,
    #[serde(rename = "task.started")]
    TaskStarted,
    #[serde(rename = "task.completed")]
    TaskCompleted,
    #[serde(rename = "task.failed")]
    TaskFailed,
    #[serde(rename = "review.requested")]
    ReviewRequested,
    #[serde(rename = "run.completed")]
    RunCompleted,
    #[serde(rename = "run.failed")]
    RunFailed,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::RunStarted => "run.started",
            EventKind::TaskStarted => "task.started",
            EventKind::TaskCompleted => "task.completed",
            EventKind::TaskFailed => "task.failed",
            EventKind::ReviewRequested => "review.requested",
            EventKind::RunCompleted => "run.completed",
            EventKind::RunFailed => "run.failed",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One recorded event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunEvent {
    pub run_id: String,
    /// Per-run sequence number, starting at 0.
    pub seq: u64,
    pub kind: EventKind,
    /// Step name for `task.*` events.
    pub step: Option<String>,
    pub payload: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}

/// Publish/subscribe sink with per-run history.
pub struct EventBus {
    sender: broadcast::Sender<RunEvent>,
    history: Mutex<HashMap<String, Vec<RunEvent>>>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_CAPACITY)
    }
}

impl fmt::Debug for EventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventBus")
            .field("subscribers", &self.sender.receiver_count())
            .finish_non_exhaustive()
    }
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender,
            history: Mutex::new(HashMap::new()),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RunEvent> {
        self.sender.subscribe()
    }

    /// Record and broadcast an event. Returns the recorded event.
    pub async fn publish(
        &self,
        run_id: &str,
        kind: EventKind,
        step: Option<&str>,
        payload: serde_json::Value,
    ) -> RunEvent {
        let mut history = self.history.lock().await;
        let events = history.entry(run_id.to_string()).or_default();
        let event = RunEvent {
            run_id: run_id.to_string(),
            seq: events.len() as u64,
            kind,
            step: step.map(str::to_string),
            payload,
            timestamp: Utc::now(),
        };
        events.push(event.clone());
        // Sent under the history lock so subscribers observe history order.
        let _ = self.sender.send(event.clone());
        event
    }

    /// All events recorded for a run, in publication order.
    pub async fn history(&self, run_id: &str) -> Vec<RunEvent> {
        self.history
            .lock()
            .await
            .get(run_id)
            .cloned()
            .unwrap_or_default()
    }

    /// Drop a run's history.
    pub async fn forget(&self, run_id: &str) {
        self.history.lock().await.remove(run_id);
    }
}
