use crate::events::{Event, EventLog};
use crate::types::RunId;
use anyhow::{Context, Result};
use std::path::PathBuf;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

/// Event log implementation using JSONL (JSON Lines), one file per run
///
/// Format: <base>/<run_id>.jsonl, one serialized [`Event`] per line
pub struct JsonlEventLog {
    base_path: PathBuf,
    // Serializes appends so lines never interleave
    write_lock: Mutex<()>,
}

impl JsonlEventLog {
    pub fn new(base_path: PathBuf) -> Result<Self> {
        std::fs::create_dir_all(&base_path).context("Failed to create event log directory")?;
        Ok(Self {
            base_path,
            write_lock: Mutex::new(()),
        })
    }

    fn event_log_path(&self, run_id: &RunId) -> PathBuf {
        self.base_path.join(format!("{}.jsonl", run_id))
    }
}

#[async_trait::async_trait]
impl EventLog for JsonlEventLog {
    async fn append(&self, event: Event) -> Result<()> {
        let mut line = serde_json::to_string(&event).context("Failed to serialize event")?;
        line.push('\n');

        let _guard = self.write_lock.lock().await;
        let path = self.event_log_path(&event.run_id);
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .with_context(|| format!("Failed to open event log {}", path.display()))?;
        file.write_all(line.as_bytes())
            .await
            .context("Failed to write event")?;
        file.flush().await.context("Failed to flush event log")?;
        Ok(())
    }

    async fn get_run_events(&self, run_id: &RunId) -> Result<Vec<Event>> {
        let path = self.event_log_path(run_id);
        let content = match tokio::fs::read_to_string(&path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e).context("Failed to read event log"),
        };

        let mut events = Vec::new();
        for line in content.lines() {
            if line.trim().is_empty() {
                continue;
            }
            // A crash mid-append can leave a torn final line
            match serde_json::from_str::<Event>(line) {
                Ok(event) => events.push(event),
                Err(e) => tracing::warn!("Skipping unreadable event in {}: {}", path.display(), e),
            }
        }

        Ok(events)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventType;
    use crate::types::{Role, StepId};
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_jsonl_event_log() {
        let temp_dir = TempDir::new().unwrap();
        let log = JsonlEventLog::new(temp_dir.path().to_path_buf()).unwrap();

        let run_id = RunId::new("cp");
        let started = Event::new(
            run_id.clone(),
            EventType::RunStarted {
                role: Role::ControlPlane,
                resumed: false,
            },
        );
        let step = Event::new(
            run_id.clone(),
            EventType::StepStarted {
                step_id: StepId::new("disable-swap"),
                attempt: 1,
            },
        );

        log.append(started.clone()).await.unwrap();
        log.append(step.clone()).await.unwrap();

        let events = log.get_run_events(&run_id).await.unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].id, started.id);
        assert_eq!(events[1].event_type, step.event_type);

        assert!(log
            .get_run_events(&RunId::new("other"))
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn torn_last_line_is_skipped() {
        let temp_dir = TempDir::new().unwrap();
        let log = JsonlEventLog::new(temp_dir.path().to_path_buf()).unwrap();
        let run_id = RunId::new("w1");

        log.append(Event::new(
            run_id.clone(),
            EventType::RunStarted {
                role: Role::Worker,
                resumed: true,
            },
        ))
        .await
        .unwrap();

        let path = temp_dir.path().join("w1.jsonl");
        let mut content = std::fs::read_to_string(&path).unwrap();
        content.push_str("{\"id\":\"trunc");
        std::fs::write(&path, content).unwrap();

        assert_eq!(log.get_run_events(&run_id).await.unwrap().len(), 1);
    }
}
