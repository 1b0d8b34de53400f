use crate::types::{Role, RunId, RunStatus, Satisfaction, StepId};
use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Mutex;

/// An entry in a run's audit trail
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub id: String,
    pub run_id: RunId,
    pub timestamp: DateTime<Utc>,
    pub event_type: EventType,
}

impl Event {
    pub fn new(run_id: RunId, event_type: EventType) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            run_id,
            timestamp: Utc::now(),
            event_type,
        }
    }
}

/// Lifecycle events emitted while a run executes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventType {
    RunStarted {
        role: Role,
        resumed: bool,
    },
    RunFinished {
        status: RunStatus,
        duration_secs: u64,
    },

    StepStarted {
        step_id: StepId,
        attempt: u32,
    },
    StepSucceeded {
        step_id: StepId,
        satisfied_by: Satisfaction,
        attempts: u32,
        duration_ms: u64,
    },
    StepFailed {
        step_id: StepId,
        attempt: u32,
        error: String,
        will_retry: bool,
    },
    StepSkipped {
        step_id: StepId,
        reason: String,
    },
}

/// Append-only sink for run events
#[async_trait::async_trait]
pub trait EventLog: Send + Sync {
    async fn append(&self, event: Event) -> Result<()>;

    /// All events of a run in append order
    async fn get_run_events(&self, run_id: &RunId) -> Result<Vec<Event>>;
}

/// Keeps events in memory; used when no log directory is configured
#[derive(Default)]
pub struct MemoryEventLog {
    events: Mutex<Vec<Event>>,
}

impl MemoryEventLog {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl EventLog for MemoryEventLog {
    async fn append(&self, event: Event) -> Result<()> {
        self.events
            .lock()
            .map_err(|_| anyhow::anyhow!("event log mutex poisoned"))?
            .push(event);
        Ok(())
    }

    async fn get_run_events(&self, run_id: &RunId) -> Result<Vec<Event>> {
        let events = self
            .events
            .lock()
            .map_err(|_| anyhow::anyhow!("event log mutex poisoned"))?;
        Ok(events
            .iter()
            .filter(|e| &e.run_id == run_id)
            .cloned()
            .collect())
    }
}
